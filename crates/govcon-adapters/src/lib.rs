//! Upstream contracts: the opportunity listing API and the per-notice
//! description endpoint.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use govcon_core::{preview, OpportunitiesPage};
use govcon_storage::{redacted, FetchError, HttpFetcher};
use govcon_text::{extract_description_lenient, unwrap_description};
use reqwest::Url;
use serde_json::{Map, Value};
use tracing::{debug, warn};
use uuid::Uuid;

pub const SAM_SEARCH_URL: &str = "https://api.sam.gov/opportunities/v2/search";
pub const PAGE_SIZE: u32 = 100;

const NOT_FOUND_MARKER: &str = "description not found";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingQuery {
    /// `MM/DD/YYYY`
    pub posted_from: String,
    /// `MM/DD/YYYY`
    pub posted_to: String,
    pub limit: u32,
    pub offset: u64,
    pub ptype: String,
}

impl ListingQuery {
    pub fn first_page(posted_from: impl Into<String>, posted_to: impl Into<String>) -> Self {
        Self {
            posted_from: posted_from.into(),
            posted_to: posted_to.into(),
            limit: PAGE_SIZE,
            offset: 0,
            ptype: "o".to_string(),
        }
    }

    pub fn next_page(&self) -> Self {
        Self {
            offset: self.offset + u64::from(self.limit),
            ..self.clone()
        }
    }
}

#[async_trait]
pub trait ListingSource: Send + Sync {
    async fn fetch_page(&self, run_id: Uuid, query: &ListingQuery) -> anyhow::Result<OpportunitiesPage>;
}

#[derive(Debug, Clone)]
pub struct SamListingClient {
    http: Arc<HttpFetcher>,
    base_url: Url,
    api_key: String,
}

impl SamListingClient {
    pub fn new(http: Arc<HttpFetcher>, base_url: &str, api_key: impl Into<String>) -> anyhow::Result<Self> {
        let base_url = Url::parse(base_url).with_context(|| format!("parsing listing url {base_url}"))?;
        Ok(Self {
            http,
            base_url,
            api_key: api_key.into(),
        })
    }

    fn page_url(&self, query: &ListingQuery) -> Url {
        let mut url = self.base_url.clone();
        url.query_pairs_mut()
            .append_pair("api_key", &self.api_key)
            .append_pair("postedFrom", &query.posted_from)
            .append_pair("postedTo", &query.posted_to)
            .append_pair("limit", &query.limit.to_string())
            .append_pair("offset", &query.offset.to_string())
            .append_pair("ptype", &query.ptype);
        url
    }
}

#[async_trait]
impl ListingSource for SamListingClient {
    async fn fetch_page(&self, run_id: Uuid, query: &ListingQuery) -> anyhow::Result<OpportunitiesPage> {
        let url = self.page_url(query);
        let resp = self
            .http
            .fetch_bytes(run_id, "sam-listing", url, Some("application/json"))
            .await
            .with_context(|| format!("fetching listing page at offset {}", query.offset))?;

        let page: OpportunitiesPage = serde_json::from_slice(&resp.body).with_context(|| {
            format!("decoding listing page (preview: {})", preview(&resp.text(), 120))
        })?;
        debug!(
            offset = query.offset,
            returned = page.opportunities_data.len(),
            total = page.total_records,
            "listing page fetched"
        );
        Ok(page)
    }
}

/// How a description endpoint answered.
#[derive(Debug)]
pub enum FetchOutcome {
    Found,
    NotFound,
    Failed(FetchError),
}

/// Everything learned from one description fetch. Never an `Err`: failures
/// are carried in `outcome` alongside whatever body was read.
#[derive(Debug)]
pub struct DescriptionFetch {
    pub outcome: FetchOutcome,
    pub text: String,
    pub raw_body: Option<String>,
    pub http_status: Option<u16>,
    pub content_type: Option<String>,
}

impl DescriptionFetch {
    pub fn failed(error: FetchError) -> Self {
        Self {
            outcome: FetchOutcome::Failed(error),
            text: String::new(),
            raw_body: None,
            http_status: None,
            content_type: None,
        }
    }

    pub fn error(&self) -> Option<&FetchError> {
        match &self.outcome {
            FetchOutcome::Failed(err) => Some(err),
            _ => None,
        }
    }
}

#[async_trait]
pub trait DescriptionSource: Send + Sync {
    async fn fetch(&self, url: &str) -> DescriptionFetch;
}

#[derive(Debug, Clone)]
pub struct HttpDescriptionSource {
    http: Arc<HttpFetcher>,
    api_key: Option<String>,
}

impl HttpDescriptionSource {
    pub fn new(http: Arc<HttpFetcher>, api_key: Option<String>) -> Self {
        Self {
            http,
            api_key: api_key.filter(|k| !k.trim().is_empty()),
        }
    }

    fn authorized_url(&self, raw: &str) -> Result<Url, FetchError> {
        let mut url = Url::parse(raw).map_err(|err| FetchError::InvalidUrl {
            url: raw.to_string(),
            reason: err.to_string(),
        })?;
        let Some(api_key) = &self.api_key else {
            return Err(FetchError::MissingApiKey(redacted(&url).to_string()));
        };
        let kept: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(k, _)| k != "api_key")
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        url.query_pairs_mut()
            .clear()
            .extend_pairs(kept)
            .append_pair("api_key", api_key);
        Ok(url)
    }
}

#[async_trait]
impl DescriptionSource for HttpDescriptionSource {
    async fn fetch(&self, url: &str) -> DescriptionFetch {
        let url = match self.authorized_url(url) {
            Ok(url) => url,
            Err(err) => return DescriptionFetch::failed(err),
        };
        let safe_url = redacted(&url).to_string();

        let resp = match self.http.fetch_once(url, Some("application/json")).await {
            Ok(resp) => resp,
            Err(err) => {
                warn!(url = %safe_url, error = %err, "description fetch failed");
                return DescriptionFetch::failed(err);
            }
        };

        let raw_body = resp.text();
        let classified = classify_description_response(resp.status.as_u16(), &raw_body);
        let outcome = match classified.class {
            ResponseClass::Found => FetchOutcome::Found,
            ResponseClass::NotFound => FetchOutcome::NotFound,
            ResponseClass::Failed => FetchOutcome::Failed(FetchError::HttpStatus {
                status: classified.http_status,
                url: safe_url,
            }),
        };
        DescriptionFetch {
            outcome,
            text: classified.text,
            raw_body: Some(raw_body),
            http_status: Some(classified.http_status),
            content_type: resp.content_type,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    Found,
    NotFound,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedResponse {
    pub class: ResponseClass,
    pub text: String,
    /// Upstream status, forced to 404 for not-found results.
    pub http_status: u16,
}

fn finalize(text: &str) -> String {
    unwrap_description(text).trim().to_string()
}

/// Decides what a description endpoint body means. Pure; never fails.
///
/// A successful response that yields no readable text is `NotFound` with empty
/// text, never `Found`.
pub fn classify_description_response(status: u16, body: &str) -> ClassifiedResponse {
    let success = (200..300).contains(&status);
    let classified = |class: ResponseClass, text: String| {
        let class = if class == ResponseClass::Found && text.is_empty() {
            ResponseClass::NotFound
        } else {
            class
        };
        ClassifiedResponse {
            class,
            text,
            http_status: if class == ResponseClass::NotFound { 404 } else { status },
        }
    };

    match serde_json::from_str::<Map<String, Value>>(body) {
        Ok(object) => {
            let mut blank_description = false;
            match object.get("description") {
                Some(Value::String(desc)) if !desc.trim().is_empty() => {
                    return classified(ResponseClass::Found, finalize(desc));
                }
                Some(nested @ (Value::Object(_) | Value::Array(_))) => {
                    let text = finalize(&nested.to_string());
                    match text.as_str() {
                        "" | "{}" | "[]" => blank_description = true,
                        _ => return classified(ResponseClass::Found, text),
                    }
                }
                Some(Value::String(_) | Value::Null) => blank_description = true,
                _ => {}
            }
            if let Some(Value::String(error)) = object.get("error") {
                if error.to_lowercase().contains(NOT_FOUND_MARKER) {
                    return classified(ResponseClass::NotFound, String::new());
                }
            }
            if blank_description && success {
                return classified(ResponseClass::NotFound, String::new());
            }
            let text = finalize(body);
            let class = if success { ResponseClass::Found } else { ResponseClass::Failed };
            classified(class, text)
        }
        Err(_) => {
            if let Some(desc) = extract_description_lenient(body) {
                if !desc.trim().is_empty() {
                    return classified(ResponseClass::Found, finalize(&desc));
                }
            }
            let text = finalize(body);
            let class = if text.to_lowercase().contains(NOT_FOUND_MARKER) {
                ResponseClass::NotFound
            } else if success {
                ResponseClass::Found
            } else {
                ResponseClass::Failed
            };
            classified(class, text)
        }
    }
}
