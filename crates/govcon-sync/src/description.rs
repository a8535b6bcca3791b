//! On-demand description retrieval with caching, self-healing, and
//! single-flight upstream fetches.

use std::sync::Arc;

use chrono::Utc;
use govcon_adapters::{DescriptionSource, FetchOutcome};
use govcon_core::{preview, DescriptionOrigin, DescriptionRecord, DescriptionView, FetchStatus};
use govcon_storage::{DescriptionStore, DistributedMutex, FetchError, LockKey, OpportunityStore};
use govcon_text::{classify_source, has_stripped_markup, unwrap_description};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::DescriptionServiceConfig;
use crate::pipeline::{stored_source_text, DescriptionPipeline, EMPTY_DESCRIPTION};

#[derive(Debug, Error)]
pub enum DescriptionError {
    #[error("opportunity {0} not found")]
    OpportunityNotFound(String),
    #[error("storage failure: {0:#}")]
    Storage(anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HealReason {
    StaleVersion,
    Unwrapped,
    Markup,
}

impl HealReason {
    fn as_str(self) -> &'static str {
        match self {
            HealReason::StaleVersion => "stale_version",
            HealReason::Unwrapped => "unwrapped",
            HealReason::Markup => "markup",
        }
    }
}

/// Source text and reason when a cached fetched row needs reprocessing.
fn heal_source(record: &DescriptionRecord) -> Option<(String, HealReason)> {
    if !record.has_current_normalization() {
        return stored_source_text(record).map(|text| (text, HealReason::StaleVersion));
    }
    let raw = record.raw_text.as_deref()?;
    let unwrapped = unwrap_description(raw);
    if unwrapped != raw {
        return Some((unwrapped, HealReason::Unwrapped));
    }
    if record.text_normalized.as_deref().is_some_and(has_stripped_markup) {
        return Some((unwrapped, HealReason::Markup));
    }
    None
}

/// Fetches `url` and builds the full row to persist. Fetch failures become an
/// `error` row and are also returned for retry decisions.
pub(crate) async fn fetch_record(
    source: &dyn DescriptionSource,
    pipeline: &DescriptionPipeline,
    notice_id: &str,
    origin: &DescriptionOrigin,
    url: &str,
) -> (DescriptionRecord, Option<FetchError>) {
    let fetch = source.fetch(url).await;
    let now = Utc::now();
    let mut record = DescriptionRecord::placeholder(notice_id, origin, now);
    record.fetched_at = Some(now);
    record.http_status = fetch.http_status.map(i32::from);
    record.content_type = fetch.content_type;
    record.raw_json_response = fetch.raw_body;

    match fetch.outcome {
        FetchOutcome::Failed(err) => {
            warn!(notice_id, error = %err, "description fetch failed");
            record.fetch_status = FetchStatus::Error;
            record.last_error = Some(err.to_string());
            return (record, Some(err));
        }
        FetchOutcome::NotFound => {
            info!(notice_id, "description not found upstream");
            record.fetch_status = FetchStatus::NotFound;
            if fetch.text.trim().is_empty() {
                record.last_error = Some(EMPTY_DESCRIPTION.to_string());
            }
            record.raw_text = Some(fetch.text);
        }
        FetchOutcome::Found => match pipeline.apply_source(&mut record, &fetch.text, now) {
            FetchStatus::Fetched => debug!(
                notice_id,
                preview = %preview(record.text_normalized.as_deref().unwrap_or_default(), 120),
                "description fetched"
            ),
            _ => info!(notice_id, "upstream description is empty"),
        },
    }
    (record, None)
}

pub struct DescriptionService {
    opportunities: Arc<dyn OpportunityStore>,
    descriptions: Arc<dyn DescriptionStore>,
    source: Arc<dyn DescriptionSource>,
    mutex: Arc<dyn DistributedMutex>,
    pipeline: DescriptionPipeline,
    config: DescriptionServiceConfig,
}

impl DescriptionService {
    pub fn new(
        opportunities: Arc<dyn OpportunityStore>,
        descriptions: Arc<dyn DescriptionStore>,
        source: Arc<dyn DescriptionSource>,
        mutex: Arc<dyn DistributedMutex>,
        pipeline: DescriptionPipeline,
        config: DescriptionServiceConfig,
    ) -> Self {
        Self {
            opportunities,
            descriptions,
            source,
            mutex,
            pipeline,
            config,
        }
    }

    pub async fn get_description(&self, notice_id: &str, refresh: bool) -> Result<DescriptionView, DescriptionError> {
        let span = info_span!("describe", notice_id, refresh);
        async {
            let opportunity = self
                .opportunities
                .get_opportunity(notice_id)
                .await
                .map_err(DescriptionError::Storage)?
                .ok_or_else(|| DescriptionError::OpportunityNotFound(notice_id.to_string()))?;
            let origin = classify_source(&opportunity.description);

            let existing = self
                .descriptions
                .get_description(notice_id)
                .await
                .map_err(DescriptionError::Storage)?;
            if let Some(record) = existing.filter(|r| r.is_fetched() && !refresh) {
                return Ok(self.serve_cached(record).await);
            }

            match &origin {
                DescriptionOrigin::None => {
                    let record = DescriptionRecord::placeholder(notice_id, &origin, Utc::now());
                    self.descriptions
                        .upsert_description(&record)
                        .await
                        .map_err(DescriptionError::Storage)?;
                    Ok(DescriptionView::from_record(&record))
                }
                DescriptionOrigin::Inline(text) => {
                    let now = Utc::now();
                    let mut record = DescriptionRecord::placeholder(notice_id, &origin, now);
                    record.fetched_at = Some(now);
                    let status = self.pipeline.apply_source(&mut record, text, now);
                    self.descriptions
                        .upsert_description(&record)
                        .await
                        .map_err(DescriptionError::Storage)?;
                    debug!(
                        status = status.as_str(),
                        preview = %preview(record.text_normalized.as_deref().unwrap_or_default(), 120),
                        "inline description processed"
                    );
                    Ok(DescriptionView::from_record(&record))
                }
                DescriptionOrigin::Url(url) => self.fetch_single_flight(notice_id, &origin, url, refresh).await,
            }
        }
        .instrument(span)
        .await
    }

    async fn serve_cached(&self, mut record: DescriptionRecord) -> DescriptionView {
        let Some((source, reason)) = heal_source(&record) else {
            return DescriptionView::from_record(&record);
        };

        let now = Utc::now();
        let before_content = record.content_hash.clone();
        let before_ai = record.ai_input_hash.clone();
        let processed = self.pipeline.process(&source);
        if !processed.is_readable() {
            warn!(reason = reason.as_str(), "stored source has no readable text; serving cached row");
            return DescriptionView::from_record(&record);
        }
        let changed = reason == HealReason::StaleVersion
            || before_content.as_deref() != Some(processed.content_hash.as_str())
            || before_ai.as_deref() != Some(processed.ai_input_hash.as_str());
        self.pipeline.apply(&mut record, processed, now);

        if changed {
            info!(reason = reason.as_str(), "self-healing cached description");
            if let Err(err) = self.descriptions.upsert_description(&record).await {
                warn!(error = %format!("{err:#}"), "persisting healed description failed");
            }
        }
        DescriptionView::from_record(&record)
    }

    async fn fetch_single_flight(
        &self,
        notice_id: &str,
        origin: &DescriptionOrigin,
        url: &str,
        refresh: bool,
    ) -> Result<DescriptionView, DescriptionError> {
        let placeholder = DescriptionRecord::placeholder(notice_id, origin, Utc::now());
        self.descriptions
            .insert_description_if_absent(&placeholder)
            .await
            .map_err(DescriptionError::Storage)?;

        let key = LockKey::for_notice(notice_id);
        let Some(guard) = self.mutex.try_acquire(key).await.map_err(DescriptionError::Storage)? else {
            debug!(%key, "fetch in progress elsewhere");
            tokio::time::sleep(self.config.lock_wait).await;
            let current = self
                .descriptions
                .get_description(notice_id)
                .await
                .map_err(DescriptionError::Storage)?;
            return Ok(match current.filter(DescriptionRecord::is_fetched) {
                Some(record) => DescriptionView::from_record(&record),
                None => DescriptionView::fetching(notice_id, origin),
            });
        };

        let result = self.fetch_locked(notice_id, origin, url, refresh).await;
        if let Err(err) = guard.release().await {
            warn!(%key, error = %format!("{err:#}"), "releasing fetch lock failed");
        }
        result
    }

    async fn fetch_locked(
        &self,
        notice_id: &str,
        origin: &DescriptionOrigin,
        url: &str,
        refresh: bool,
    ) -> Result<DescriptionView, DescriptionError> {
        if !refresh {
            let current = self
                .descriptions
                .get_description(notice_id)
                .await
                .map_err(DescriptionError::Storage)?;
            if let Some(record) = current.filter(DescriptionRecord::is_fetched) {
                return Ok(DescriptionView::from_record(&record));
            }
        }

        let (record, _) = fetch_record(self.source.as_ref(), &self.pipeline, notice_id, origin, url).await;
        self.descriptions
            .upsert_description(&record)
            .await
            .map_err(DescriptionError::Storage)?;
        Ok(DescriptionView::from_record(&record))
    }
}
