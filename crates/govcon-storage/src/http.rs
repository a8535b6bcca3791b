//! Bounded HTTP fetching with retry classification, backoff, and rate limiting.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use reqwest::{StatusCode, Url};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

/// Whether a failed listing page or description fetch may succeed if the same
/// request is sent again later in the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Upstream throttling (429) and server-side failures are transient; any other
/// status (bad key, missing notice, gone) repeats on every attempt.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    match status.as_u16() {
        429 | 500..=599 => RetryDisposition::Retryable,
        _ => RetryDisposition::NonRetryable,
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if let Some(status) = err.status() {
        return classify_status(status);
    }
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Walks an error chain for a typed cause, falling back to transport
/// signatures in the rendered message.
pub fn classify_error(err: &anyhow::Error) -> RetryDisposition {
    for cause in err.chain() {
        if let Some(fetch) = cause.downcast_ref::<FetchError>() {
            return fetch.disposition();
        }
        if let Some(request) = cause.downcast_ref::<reqwest::Error>() {
            return classify_reqwest_error(request);
        }
        if let Some(db) = cause.downcast_ref::<sqlx::Error>() {
            return match db {
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => RetryDisposition::Retryable,
                _ => RetryDisposition::NonRetryable,
            };
        }
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            use std::io::ErrorKind::*;
            if matches!(
                io.kind(),
                TimedOut | ConnectionReset | ConnectionRefused | ConnectionAborted | BrokenPipe | UnexpectedEof
            ) {
                return RetryDisposition::Retryable;
            }
        }
    }
    classify_message(&format!("{err:#}"))
}

pub fn classify_message(message: &str) -> RetryDisposition {
    const SIGNATURES: &[&str] = &[
        "timeout",
        "timed out",
        "connection",
        "network",
        "temporarily unavailable",
        "status 429",
        "status 500",
        "status 502",
        "status 503",
        "status 504",
    ];
    let lower = message.to_lowercase();
    if SIGNATURES.iter().any(|s| lower.contains(s)) {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// In-request retry schedule of [`HttpFetcher::fetch_bytes`]: the wait before
/// retry `n` (0-based) is `base_delay * 2^n`, never more than `max_delay`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, retry: usize) -> Duration {
        let doublings = u32::try_from(retry).unwrap_or(u32::MAX).min(31);
        self.base_delay.saturating_mul(1 << doublings).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    /// Bodies at or above this size are rejected rather than truncated.
    pub max_body_bytes: usize,
    pub backoff: BackoffPolicy,
    pub rate_limit: Option<RateLimit>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
            global_concurrency: 16,
            max_body_bytes: 5 * 1024 * 1024,
            backoff: BackoffPolicy::default(),
            rate_limit: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimit {
    pub per_second: f64,
    pub burst: u32,
}

/// Token bucket with fractional refill, shared by concurrent callers.
#[derive(Debug)]
pub struct TokenBucket {
    per_second: f64,
    capacity: f64,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(limit: RateLimit) -> Self {
        let per_second = if limit.per_second > 0.0 { limit.per_second } else { 1.0 };
        let capacity = f64::from(limit.burst.max(1));
        Self {
            per_second,
            capacity,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            let elapsed = now.duration_since(state.last_refill).as_secs_f64();
            state.tokens = (state.tokens + elapsed * self.per_second).min(self.capacity);
            state.last_refill = now;

            if state.tokens >= 1.0 {
                state.tokens -= 1.0;
                return;
            }

            let sleep_for = Duration::from_secs_f64((1.0 - state.tokens) / self.per_second);
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("response body from {url} reached the {limit} byte limit")]
    BodyTooLarge { limit: usize, url: String },
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("no api key configured for {0}")]
    MissingApiKey(String),
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Request(err) => classify_reqwest_error(err),
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            FetchError::BodyTooLarge { .. } => RetryDisposition::Retryable,
            FetchError::InvalidUrl { .. } | FetchError::MissingApiKey(_) => RetryDisposition::NonRetryable,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.disposition() == RetryDisposition::Retryable
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    token_bucket: Option<Arc<TokenBucket>>,
    backoff: BackoffPolicy,
    max_body_bytes: usize,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let token_bucket = config.rate_limit.map(|limit| Arc::new(TokenBucket::new(limit)));

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            token_bucket,
            backoff: config.backoff,
            max_body_bytes: config.max_body_bytes.max(1),
        })
    }

    /// Single attempt. Any status is returned with its (capped) body.
    pub async fn fetch_once(&self, url: Url, accept: Option<&str>) -> Result<FetchedResponse, FetchError> {
        let _permit = self.global_limit.acquire().await.expect("semaphore not closed");
        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }
        self.send(url, accept).await
    }

    /// Fetches a success response, retrying retryable failures with backoff.
    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: Url,
        accept: Option<&str>,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, source_id, url = %redacted(&url));
        async {
            let _permit = self.global_limit.acquire().await.expect("semaphore not closed");

            let mut attempt = 0;
            loop {
                if let Some(bucket) = &self.token_bucket {
                    bucket.take().await;
                }

                let err = match self.send(url.clone(), accept).await {
                    Ok(resp) if resp.status.is_success() => return Ok(resp),
                    Ok(resp) => FetchError::HttpStatus {
                        status: resp.status.as_u16(),
                        url: resp.final_url,
                    },
                    Err(err) => err,
                };

                if err.is_retryable() && attempt < self.backoff.max_retries {
                    let delay = self.backoff.delay_for_attempt(attempt);
                    warn!(attempt, ?delay, error = %err, "retrying fetch");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }
                return Err(err);
            }
        }
        .instrument(span)
        .await
    }

    async fn send(&self, url: Url, accept: Option<&str>) -> Result<FetchedResponse, FetchError> {
        let mut request = self.client.get(url);
        if let Some(accept) = accept {
            request = request.header(reqwest::header::ACCEPT, accept);
        }
        let resp = request.send().await?;

        let status = resp.status();
        let final_url = redacted(resp.url()).to_string();
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = read_capped(resp, self.max_body_bytes, &final_url).await?;

        Ok(FetchedResponse {
            status,
            final_url,
            content_type,
            body,
        })
    }
}

async fn read_capped(mut resp: reqwest::Response, limit: usize, url: &str) -> Result<Vec<u8>, FetchError> {
    let too_large = || FetchError::BodyTooLarge {
        limit,
        url: url.to_string(),
    };
    if resp.content_length().is_some_and(|len| len >= limit as u64) {
        return Err(too_large());
    }

    let mut body = Vec::new();
    while let Some(chunk) = resp.chunk().await? {
        body.extend_from_slice(&chunk);
        if body.len() >= limit {
            return Err(too_large());
        }
    }
    Ok(body)
}

/// Strips the `api_key` query parameter so URLs are safe to log or persist.
pub fn redacted(url: &Url) -> Url {
    let mut clean = url.clone();
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != "api_key")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if pairs.is_empty() {
        clean.set_query(None);
    } else {
        clean.query_pairs_mut().clear().extend_pairs(pairs);
    }
    clean
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode as AxumStatus, routing::get, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn fetcher(max_body_bytes: usize) -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            max_body_bytes,
            backoff: BackoffPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(20),
            },
            ..HttpClientConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn listing_retries_wait_longer_until_the_cap() {
        let policy = BackoffPolicy {
            max_retries: 4,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(1),
        };

        let waits: Vec<_> = (0..4).map(|retry| policy.delay_for_attempt(retry)).collect();
        assert_eq!(waits, [250, 500, 1000, 1000].map(Duration::from_millis).to_vec());
        assert_eq!(policy.delay_for_attempt(usize::MAX), Duration::from_secs(1));
    }

    #[test]
    fn throttled_and_unavailable_upstream_is_retryable() {
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
        assert_eq!(classify_status(StatusCode::FORBIDDEN), RetryDisposition::NonRetryable);

        assert_eq!(classify_message("dial tcp: connection refused"), RetryDisposition::Retryable);
        assert_eq!(classify_message("upstream returned status 503"), RetryDisposition::Retryable);
        assert_eq!(classify_message("invalid character in payload"), RetryDisposition::NonRetryable);
    }

    #[test]
    fn typed_causes_win_over_message_text() {
        let err = anyhow::Error::new(FetchError::HttpStatus {
            status: 404,
            url: "connection-heavy.example".into(),
        })
        .context("fetching description");
        assert_eq!(classify_error(&err), RetryDisposition::NonRetryable);

        let err = anyhow::Error::new(FetchError::HttpStatus {
            status: 429,
            url: "x".into(),
        });
        assert_eq!(classify_error(&err), RetryDisposition::Retryable);

        let err = anyhow::anyhow!("network unreachable");
        assert_eq!(classify_error(&err), RetryDisposition::Retryable);
    }

    #[test]
    fn api_key_is_redacted() {
        let url = Url::parse("https://api.sam.gov/desc?noticeid=1&api_key=secret").unwrap();
        assert_eq!(redacted(&url).as_str(), "https://api.sam.gov/desc?noticeid=1");
        let url = Url::parse("https://api.sam.gov/desc?api_key=secret").unwrap();
        assert_eq!(redacted(&url).as_str(), "https://api.sam.gov/desc");
    }

    #[tokio::test]
    async fn token_bucket_spaces_out_takes() {
        let bucket = TokenBucket::new(RateLimit {
            per_second: 20.0,
            burst: 1,
        });
        let started = Instant::now();
        for _ in 0..3 {
            bucket.take().await;
        }
        assert!(started.elapsed() >= Duration::from_millis(90));
    }

    #[tokio::test]
    async fn oversized_bodies_are_rejected_not_truncated() {
        let base = serve(Router::new().route("/big", get(|| async { "x".repeat(4096) }))).await;
        let err = fetcher(1024)
            .fetch_once(Url::parse(&format!("{base}/big")).unwrap(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::BodyTooLarge { limit: 1024, .. }));

        let ok = fetcher(8192)
            .fetch_once(Url::parse(&format!("{base}/big")).unwrap(), None)
            .await
            .unwrap();
        assert_eq!(ok.body.len(), 4096);
    }

    #[tokio::test]
    async fn fetch_once_returns_non_success_bodies() {
        let base = serve(Router::new().route(
            "/missing",
            get(|| async { (AxumStatus::NOT_FOUND, "Description Not Found") }),
        ))
        .await;
        let resp = fetcher(1024)
            .fetch_once(Url::parse(&format!("{base}/missing")).unwrap(), Some("application/json"))
            .await
            .unwrap();
        assert_eq!(resp.status, StatusCode::NOT_FOUND);
        assert_eq!(resp.text(), "Description Not Found");
    }

    #[tokio::test]
    async fn fetch_bytes_retries_server_errors_then_succeeds() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let base = serve(Router::new().route(
            "/flaky",
            get(move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        (AxumStatus::SERVICE_UNAVAILABLE, "busy")
                    } else {
                        (AxumStatus::OK, "ok")
                    }
                }
            }),
        ))
        .await;

        let resp = fetcher(1024)
            .fetch_bytes(Uuid::new_v4(), "test", Url::parse(&format!("{base}/flaky")).unwrap(), None)
            .await
            .unwrap();
        assert_eq!(resp.text(), "ok");
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fetch_bytes_does_not_retry_client_errors() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let base = serve(Router::new().route(
            "/gone",
            get(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { (AxumStatus::GONE, "gone") }
            }),
        ))
        .await;

        let err = fetcher(1024)
            .fetch_bytes(Uuid::new_v4(), "test", Url::parse(&format!("{base}/gone")).unwrap(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { status: 410, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
