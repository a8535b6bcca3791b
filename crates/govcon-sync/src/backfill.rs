//! Batch reprocessing of stored descriptions.
//!
//! One run at a time holds [`LockKey::BACKFILL`]. Candidates are streamed
//! through a bounded queue to a fixed worker pool; every attempt waits on a
//! shared token bucket and retryable failures back off exponentially.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use govcon_adapters::DescriptionSource;
use govcon_core::{DescriptionOrigin, DescriptionRecord, FetchStatus};
use govcon_storage::{
    classify_error, with_lock, BackfillFilter, DescriptionStore, DistributedMutex, LockKey, RateLimit,
    RetryDisposition, TokenBucket,
};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::BackfillConfig;
use crate::description::fetch_record;
use crate::pipeline::{stored_source_text, DescriptionPipeline};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BackfillReport {
    pub total: usize,
    pub processed: usize,
    pub updated: usize,
    pub skipped: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackfillOutcome {
    /// Another process holds the backfill lock.
    AlreadyRunning,
    Completed(BackfillReport),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordChange {
    Updated,
    Unchanged,
}

#[derive(Default)]
struct Counters {
    processed: AtomicUsize,
    updated: AtomicUsize,
    skipped: AtomicUsize,
    errors: AtomicUsize,
}

impl Counters {
    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn report(&self, total: usize) -> BackfillReport {
        BackfillReport {
            total,
            processed: self.processed.load(Ordering::Relaxed),
            updated: self.updated.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

pub struct BackfillOrchestrator {
    descriptions: Arc<dyn DescriptionStore>,
    source: Arc<dyn DescriptionSource>,
    mutex: Arc<dyn DistributedMutex>,
    pipeline: DescriptionPipeline,
    config: BackfillConfig,
}

impl BackfillOrchestrator {
    pub fn new(
        descriptions: Arc<dyn DescriptionStore>,
        source: Arc<dyn DescriptionSource>,
        mutex: Arc<dyn DistributedMutex>,
        pipeline: DescriptionPipeline,
        config: BackfillConfig,
    ) -> Self {
        Self {
            descriptions,
            source,
            mutex,
            pipeline,
            config,
        }
    }

    pub async fn run(&self) -> anyhow::Result<BackfillOutcome> {
        let run_id = Uuid::new_v4();
        let span = info_span!(
            "backfill",
            %run_id,
            filter = %self.config.filter,
            dry_run = self.config.dry_run
        );
        async {
            match with_lock(self.mutex.as_ref(), LockKey::BACKFILL, || self.run_locked()).await? {
                Some(report) => Ok(BackfillOutcome::Completed(report)),
                None => {
                    info!("backfill already running elsewhere");
                    Ok(BackfillOutcome::AlreadyRunning)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run_locked(&self) -> anyhow::Result<BackfillReport> {
        let candidates = self
            .descriptions
            .backfill_candidates(self.config.filter, self.config.limit)
            .await
            .context("selecting backfill candidates")?;
        let total = candidates.len();
        let workers = self.config.effective_workers();
        info!(candidates = total, workers, "backfill starting");

        let shared = Arc::new(Worker {
            descriptions: self.descriptions.clone(),
            source: self.source.clone(),
            mutex: self.mutex.clone(),
            pipeline: self.pipeline.clone(),
            config: self.config.clone(),
            bucket: TokenBucket::new(RateLimit {
                per_second: self.config.rate_limit_per_sec,
                burst: 1,
            }),
            counters: Counters::default(),
        });

        let (tx, rx) = mpsc::channel::<String>(workers * 2);
        let rx = Arc::new(Mutex::new(rx));
        let producer = tokio::spawn(async move {
            for notice_id in candidates {
                if tx.send(notice_id).await.is_err() {
                    break;
                }
            }
        });

        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let shared = shared.clone();
            let rx = rx.clone();
            handles.push(tokio::spawn(
                async move {
                    loop {
                        let next = rx.lock().await.recv().await;
                        let Some(notice_id) = next else { break };
                        shared.process(&notice_id).await;
                    }
                }
                .instrument(info_span!("backfill_worker", worker_id)),
            ));
        }

        producer.await.context("backfill producer panicked")?;
        for handle in handles {
            handle.await.context("backfill worker panicked")?;
        }

        let report = shared.counters.report(total);
        info!(
            total = report.total,
            processed = report.processed,
            updated = report.updated,
            skipped = report.skipped,
            errors = report.errors,
            "backfill complete"
        );
        Ok(report)
    }
}

struct Worker {
    descriptions: Arc<dyn DescriptionStore>,
    source: Arc<dyn DescriptionSource>,
    mutex: Arc<dyn DistributedMutex>,
    pipeline: DescriptionPipeline,
    config: BackfillConfig,
    bucket: TokenBucket,
    counters: Counters,
}

impl Worker {
    async fn process(&self, notice_id: &str) {
        Counters::bump(&self.counters.processed);

        let record = match self.descriptions.get_description(notice_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                debug!(notice_id, "record disappeared before processing");
                Counters::bump(&self.counters.skipped);
                return;
            }
            Err(err) => {
                warn!(notice_id, error = %format!("{err:#}"), "loading record failed");
                Counters::bump(&self.counters.errors);
                return;
            }
        };
        if !self.config.filter.matches(&record) {
            debug!(notice_id, "no longer eligible");
            Counters::bump(&self.counters.skipped);
            return;
        }

        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            self.bucket.take().await;
            match self.attempt(&record).await {
                Ok(RecordChange::Updated) => {
                    Counters::bump(&self.counters.updated);
                    return;
                }
                Ok(RecordChange::Unchanged) => {
                    Counters::bump(&self.counters.skipped);
                    return;
                }
                Err(err) => {
                    let retryable = classify_error(&err) == RetryDisposition::Retryable;
                    if retryable && attempt < max_attempts {
                        let delay = self.config.backoff_for(attempt);
                        warn!(notice_id, attempt, ?delay, error = %format!("{err:#}"), "retrying record");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    warn!(notice_id, attempt, retryable, error = %format!("{err:#}"), "record failed");
                    Counters::bump(&self.counters.errors);
                    return;
                }
            }
        }
    }

    async fn attempt(&self, stored: &DescriptionRecord) -> anyhow::Result<RecordChange> {
        let now = Utc::now();
        let notice_id = stored.notice_id.as_str();
        let mut record = stored.clone();

        match self.config.filter {
            BackfillFilter::MissingAiInput | BackfillFilter::All => {
                if !self.pipeline.recompute_ai(&mut record, now) {
                    return Ok(RecordChange::Unchanged);
                }
                if self.config.dry_run {
                    info!(
                        notice_id,
                        ai_chars = record.ai_input_text.as_deref().unwrap_or_default().chars().count(),
                        "dry run: would update AI fields"
                    );
                    return Ok(RecordChange::Updated);
                }
                self.save(&record).await
            }
            BackfillFilter::StaleNormalization => {
                let Some(source) = stored_source_text(&record) else {
                    return Ok(RecordChange::Unchanged);
                };
                if self.config.dry_run {
                    info!(notice_id, from = ?record.normalization_version, "dry run: would renormalize");
                    return Ok(RecordChange::Updated);
                }
                if self.pipeline.apply_source(&mut record, &source, now) != FetchStatus::Fetched {
                    warn!(notice_id, "stored source has no readable text; marking not_found");
                }
                self.save(&record).await
            }
            BackfillFilter::Unfetched => self.fetch(&record).await,
        }
    }

    async fn fetch(&self, record: &DescriptionRecord) -> anyhow::Result<RecordChange> {
        let notice_id = record.notice_id.as_str();
        let Some(url) = record.source_url.as_deref().filter(|u| !u.is_empty()) else {
            return Ok(RecordChange::Unchanged);
        };
        if self.config.dry_run {
            info!(notice_id, url, "dry run: would fetch");
            return Ok(RecordChange::Updated);
        }

        let origin = DescriptionOrigin::Url(url.to_string());
        let locked = with_lock(self.mutex.as_ref(), LockKey::for_notice(notice_id), || async move {
            let (fresh, error) =
                fetch_record(self.source.as_ref(), &self.pipeline, notice_id, &origin, url).await;
            self.descriptions
                .upsert_description(&fresh)
                .await
                .context("saving fetched description")?;
            match error {
                Some(err) => Err(anyhow::Error::new(err).context("fetching description")),
                None => Ok(RecordChange::Updated),
            }
        })
        .await?;

        Ok(locked.unwrap_or_else(|| {
            debug!(notice_id, "fetch already in progress");
            RecordChange::Unchanged
        }))
    }

    async fn save(&self, record: &DescriptionRecord) -> anyhow::Result<RecordChange> {
        self.descriptions
            .upsert_description(record)
            .await
            .with_context(|| format!("saving description {}", record.notice_id))?;
        Ok(RecordChange::Updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use govcon_adapters::{DescriptionFetch, FetchOutcome};
    use govcon_core::{FetchStatus, NORMALIZATION_VERSION};
    use govcon_storage::{FetchError, MemoryMutex, MemoryStore};
    use govcon_text::{ExtractionConfig, Extractor};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    /// Replies with the scripted statuses in order, repeating the last one.
    struct FlakySource {
        statuses: Vec<u16>,
        calls: StdMutex<Vec<String>>,
    }

    impl FlakySource {
        fn new(statuses: Vec<u16>) -> Self {
            Self {
                statuses,
                calls: StdMutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl DescriptionSource for FlakySource {
        async fn fetch(&self, url: &str) -> DescriptionFetch {
            let index = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(url.to_string());
                calls.len() - 1
            };
            let status = self.statuses.get(index).or(self.statuses.last()).copied().unwrap_or(200);
            if status != 200 {
                return DescriptionFetch::failed(FetchError::HttpStatus {
                    status,
                    url: url.to_string(),
                });
            }
            DescriptionFetch {
                outcome: FetchOutcome::Found,
                text: "Deliver 12 pumps.\nWAWF invoicing applies.".into(),
                raw_body: Some(r#"{"description":"Deliver 12 pumps.\nWAWF invoicing applies."}"#.into()),
                http_status: Some(200),
                content_type: Some("application/json".into()),
            }
        }
    }

    fn config(filter: BackfillFilter) -> BackfillConfig {
        BackfillConfig {
            workers: 2,
            rate_limit_per_sec: 1000.0,
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            filter,
            ..BackfillConfig::default()
        }
    }

    fn orchestrator(
        store: &Arc<MemoryStore>,
        source: &Arc<FlakySource>,
        mutex: &MemoryMutex,
        config: BackfillConfig,
    ) -> BackfillOrchestrator {
        BackfillOrchestrator::new(
            store.clone(),
            source.clone(),
            Arc::new(mutex.clone()),
            DescriptionPipeline::new(Extractor::builtin(ExtractionConfig::default())),
            config,
        )
    }

    fn url_record(id: &str) -> DescriptionRecord {
        DescriptionRecord::placeholder(id, &DescriptionOrigin::Url(format!("https://example/{id}")), Utc::now())
    }

    fn fetched_without_ai(id: &str) -> DescriptionRecord {
        let mut record = url_record(id);
        record.fetch_status = FetchStatus::Fetched;
        record.raw_text = Some("Scope: deliver pumps.\n\nWAWF invoicing applies.".into());
        record.raw_text_normalized = record.raw_text.clone();
        record.text_normalized = record.raw_text.clone();
        record.normalization_version = Some(NORMALIZATION_VERSION);
        record
    }

    async fn seed(store: &MemoryStore, records: &[DescriptionRecord]) {
        for record in records {
            store.upsert_description(record).await.unwrap();
        }
    }

    fn completed(outcome: BackfillOutcome) -> BackfillReport {
        match outcome {
            BackfillOutcome::Completed(report) => report,
            BackfillOutcome::AlreadyRunning => panic!("backfill unexpectedly locked out"),
        }
    }

    #[tokio::test]
    async fn missing_ai_input_is_filled() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, &[fetched_without_ai("a"), fetched_without_ai("b"), url_record("c")]).await;
        let source = Arc::new(FlakySource::new(vec![200]));
        let mutex = MemoryMutex::new();

        let report = completed(
            orchestrator(&store, &source, &mutex, config(BackfillFilter::MissingAiInput))
                .run()
                .await
                .unwrap(),
        );
        assert_eq!(report.total, 2);
        assert_eq!((report.processed, report.updated, report.errors), (2, 2, 0));

        let a = store.get_description("a").await.unwrap().unwrap();
        assert!(a.ai_input_text.as_deref().unwrap_or_default().starts_with("KEY FACTS"));
        assert_eq!(a.ai_meta.and_then(|m| m.wawf_required), Some(true));
        assert_eq!(source.calls(), 0);
        assert!(!mutex.is_held(LockKey::BACKFILL));
    }

    #[tokio::test]
    async fn retryable_failures_stop_at_max_attempts() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, &[url_record("a")]).await;
        let source = Arc::new(FlakySource::new(vec![503]));
        let mutex = MemoryMutex::new();

        let report = completed(
            orchestrator(&store, &source, &mutex, config(BackfillFilter::Unfetched))
                .run()
                .await
                .unwrap(),
        );
        assert_eq!(source.calls(), 3);
        assert_eq!((report.updated, report.errors), (0, 1));

        let stored = store.get_description("a").await.unwrap().unwrap();
        assert_eq!(stored.fetch_status, FetchStatus::Error);
        assert!(stored.last_error.is_some());
        assert!(!mutex.is_held(LockKey::for_notice("a")));
    }

    #[tokio::test]
    async fn non_retryable_failures_are_not_retried() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, &[url_record("a")]).await;
        let source = Arc::new(FlakySource::new(vec![401]));
        let mutex = MemoryMutex::new();

        let report = completed(
            orchestrator(&store, &source, &mutex, config(BackfillFilter::Unfetched))
                .run()
                .await
                .unwrap(),
        );
        assert_eq!(source.calls(), 1);
        assert_eq!(report.errors, 1);
    }

    #[tokio::test]
    async fn transient_failure_recovers_on_retry() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, &[url_record("a")]).await;
        let source = Arc::new(FlakySource::new(vec![503, 429, 200]));
        let mutex = MemoryMutex::new();

        let report = completed(
            orchestrator(&store, &source, &mutex, config(BackfillFilter::Unfetched))
                .run()
                .await
                .unwrap(),
        );
        assert_eq!(source.calls(), 3);
        assert_eq!((report.updated, report.errors), (1, 0));

        let stored = store.get_description("a").await.unwrap().unwrap();
        assert_eq!(stored.fetch_status, FetchStatus::Fetched);
        assert!(stored.last_error.is_none());
        assert_eq!(stored.text_normalized.as_deref(), Some("Deliver 12 pumps.\nWAWF invoicing applies."));
    }

    #[tokio::test]
    async fn second_run_is_locked_out() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, &[fetched_without_ai("a")]).await;
        let source = Arc::new(FlakySource::new(vec![200]));
        let mutex = MemoryMutex::new();

        let held = mutex.try_acquire(LockKey::BACKFILL).await.unwrap().unwrap();
        let outcome = orchestrator(&store, &source, &mutex, config(BackfillFilter::MissingAiInput))
            .run()
            .await
            .unwrap();
        assert_eq!(outcome, BackfillOutcome::AlreadyRunning);
        held.release().await.unwrap();

        let store_record = store.get_description("a").await.unwrap().unwrap();
        assert!(store_record.ai_input_text.is_none());
    }

    #[tokio::test]
    async fn dry_run_writes_nothing() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, &[fetched_without_ai("a"), url_record("b")]).await;
        let source = Arc::new(FlakySource::new(vec![200]));
        let mutex = MemoryMutex::new();
        let writes = store.write_count();

        for filter in [BackfillFilter::MissingAiInput, BackfillFilter::Unfetched] {
            let report = completed(
                orchestrator(
                    &store,
                    &source,
                    &mutex,
                    BackfillConfig {
                        dry_run: true,
                        ..config(filter)
                    },
                )
                .run()
                .await
                .unwrap(),
            );
            assert_eq!(report.updated, 1);
        }
        assert_eq!(store.write_count(), writes);
        assert_eq!(source.calls(), 0);
    }

    #[tokio::test]
    async fn stale_normalization_is_reprocessed_within_limit() {
        let store = Arc::new(MemoryStore::new());
        let stale: Vec<_> = ["a", "b", "c"]
            .iter()
            .map(|id| {
                let mut record = fetched_without_ai(id);
                record.normalization_version = Some(NORMALIZATION_VERSION - 1);
                record.raw_json_response = Some(r#"{"description":"<div>Ship by Friday.</div>"}"#.into());
                record
            })
            .collect();
        seed(&store, &stale).await;
        let source = Arc::new(FlakySource::new(vec![200]));
        let mutex = MemoryMutex::new();

        let report = completed(
            orchestrator(
                &store,
                &source,
                &mutex,
                BackfillConfig {
                    limit: Some(2),
                    ..config(BackfillFilter::StaleNormalization)
                },
            )
            .run()
            .await
            .unwrap(),
        );
        assert_eq!((report.total, report.updated), (2, 2));

        let a = store.get_description("a").await.unwrap().unwrap();
        assert_eq!(a.normalization_version, Some(NORMALIZATION_VERSION));
        assert_eq!(a.text_normalized.as_deref(), Some("Ship by Friday."));
        let c = store.get_description("c").await.unwrap().unwrap();
        assert_eq!(c.normalization_version, Some(NORMALIZATION_VERSION - 1));
    }

    #[tokio::test]
    async fn stale_row_without_readable_text_becomes_not_found() {
        let store = Arc::new(MemoryStore::new());
        let mut record = fetched_without_ai("a");
        record.normalization_version = Some(NORMALIZATION_VERSION - 1);
        record.raw_json_response = Some(r#"{"description":"<div> </div>"}"#.into());
        seed(&store, &[record]).await;
        let source = Arc::new(FlakySource::new(vec![200]));
        let mutex = MemoryMutex::new();

        let report = completed(
            orchestrator(&store, &source, &mutex, config(BackfillFilter::StaleNormalization))
                .run()
                .await
                .unwrap(),
        );
        assert_eq!((report.total, report.errors), (1, 0));

        let a = store.get_description("a").await.unwrap().unwrap();
        assert_eq!(a.fetch_status, FetchStatus::NotFound);
        assert_eq!(a.last_error.as_deref(), Some(crate::pipeline::EMPTY_DESCRIPTION));
        assert!(a.text_normalized.is_none());
        assert_eq!(source.calls(), 0);
    }
}
