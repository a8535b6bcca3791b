//! Listing ingestion with content-hash change detection.

use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use govcon_adapters::{ListingQuery, ListingSource};
use govcon_core::Opportunity;
use govcon_storage::{sha256_hex, OpportunityStore};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestionStats {
    pub total: usize,
    pub new: usize,
    pub updated: usize,
    pub skipped: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    New,
    Updated,
    Skipped,
}

/// A page could not be fetched; `stats` covers the pages processed before it.
#[derive(Debug, Error)]
#[error("ingestion aborted after {} records: {cause:#}", stats.total)]
pub struct IngestionAborted {
    pub stats: IngestionStats,
    pub cause: anyhow::Error,
}

/// `(posted_from, posted_to)` as `MM/DD/YYYY`, covering the last `days` days.
pub fn posted_window(today: NaiveDate, days: i64) -> (String, String) {
    let from = today - Duration::days(days.max(0));
    (from.format("%m/%d/%Y").to_string(), today.format("%m/%d/%Y").to_string())
}

pub fn opportunity_hash(opportunity: &Opportunity) -> anyhow::Result<String> {
    let bytes = opportunity
        .canonical_bytes()
        .context("serializing canonical opportunity")?;
    Ok(sha256_hex(&bytes))
}

#[derive(Clone)]
pub struct IngestionService {
    listing: Arc<dyn ListingSource>,
    store: Arc<dyn OpportunityStore>,
}

impl IngestionService {
    pub fn new(listing: Arc<dyn ListingSource>, store: Arc<dyn OpportunityStore>) -> Self {
        Self { listing, store }
    }

    pub async fn ingest(&self, posted_from: &str, posted_to: &str) -> Result<IngestionStats, IngestionAborted> {
        let run_id = Uuid::new_v4();
        let span = info_span!("ingest", %run_id, posted_from, posted_to);
        async {
            let mut stats = IngestionStats::default();
            let mut query = ListingQuery::first_page(posted_from, posted_to);

            loop {
                let page = match self.listing.fetch_page(run_id, &query).await {
                    Ok(page) => page,
                    Err(cause) => {
                        warn!(offset = query.offset, error = %format!("{cause:#}"), "page fetch failed");
                        return Err(IngestionAborted { stats, cause });
                    }
                };
                if page.opportunities_data.is_empty() {
                    break;
                }

                for opportunity in &page.opportunities_data {
                    stats.total += 1;
                    match self.process_opportunity(opportunity, Utc::now()).await {
                        Ok(IngestOutcome::New) => stats.new += 1,
                        Ok(IngestOutcome::Updated) => stats.updated += 1,
                        Ok(IngestOutcome::Skipped) => stats.skipped += 1,
                        Err(err) => {
                            stats.errors += 1;
                            warn!(notice_id = %opportunity.notice_id, error = %format!("{err:#}"), "record failed");
                        }
                    }
                }

                if query.offset + u64::from(query.limit) >= page.total_records {
                    break;
                }
                query = query.next_page();
            }

            info!(
                total = stats.total,
                new = stats.new,
                updated = stats.updated,
                skipped = stats.skipped,
                errors = stats.errors,
                "ingestion complete"
            );
            Ok(stats)
        }
        .instrument(span)
        .await
    }

    pub async fn process_opportunity(
        &self,
        opportunity: &Opportunity,
        now: DateTime<Utc>,
    ) -> anyhow::Result<IngestOutcome> {
        if opportunity.notice_id.trim().is_empty() {
            anyhow::bail!("listing record without noticeId");
        }
        let hash = opportunity_hash(opportunity)?;
        let raw = serde_json::to_value(opportunity).context("serializing raw snapshot")?;

        match self.store.opportunity_hash(&opportunity.notice_id).await? {
            None => {
                self.store.insert_opportunity(opportunity, &hash, &raw, now).await?;
                Ok(IngestOutcome::New)
            }
            Some(existing) if existing != hash => {
                self.store.update_opportunity(opportunity, &hash, &raw, now).await?;
                Ok(IngestOutcome::Updated)
            }
            Some(_) => Ok(IngestOutcome::Skipped),
        }
    }
}
