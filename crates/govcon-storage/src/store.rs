//! Store traits and the in-memory implementation.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use govcon_core::{
    DescriptionRecord, FetchStatus, Opportunity, OpportunityVersion, SourceType, UnknownVariant, AI_INPUT_VERSION,
};
use serde_json::Value;
use tokio::sync::Mutex;

#[async_trait]
pub trait OpportunityStore: Send + Sync {
    async fn opportunity_hash(&self, notice_id: &str) -> anyhow::Result<Option<String>>;

    /// First sighting: writes the raw snapshot and the opportunity row.
    async fn insert_opportunity(
        &self,
        opportunity: &Opportunity,
        content_hash: &str,
        raw: &Value,
        fetched_at: DateTime<Utc>,
    ) -> anyhow::Result<()>;

    /// Content change: replaces the raw snapshot, appends a version, and
    /// updates the opportunity row as one unit.
    async fn update_opportunity(
        &self,
        opportunity: &Opportunity,
        content_hash: &str,
        raw: &Value,
        fetched_at: DateTime<Utc>,
    ) -> anyhow::Result<()>;

    async fn get_opportunity(&self, notice_id: &str) -> anyhow::Result<Option<Opportunity>>;

    async fn versions(&self, notice_id: &str) -> anyhow::Result<Vec<OpportunityVersion>>;
}

#[async_trait]
pub trait DescriptionStore: Send + Sync {
    async fn get_description(&self, notice_id: &str) -> anyhow::Result<Option<DescriptionRecord>>;

    /// Returns `false` when a row already exists; the existing row is left untouched.
    async fn insert_description_if_absent(&self, record: &DescriptionRecord) -> anyhow::Result<bool>;

    async fn upsert_description(&self, record: &DescriptionRecord) -> anyhow::Result<()>;

    /// Notice ids matching `filter`, ordered by notice id.
    async fn backfill_candidates(&self, filter: BackfillFilter, limit: Option<usize>) -> anyhow::Result<Vec<String>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackfillFilter {
    /// Has Tier 1 text but no AI input.
    #[default]
    MissingAiInput,
    /// Fetched with an old or missing normalization version.
    StaleNormalization,
    /// URL source not yet fetched, or last fetch errored.
    Unfetched,
    /// Every fetched row with Tier 1 text.
    All,
}

impl BackfillFilter {
    pub fn as_str(self) -> &'static str {
        match self {
            BackfillFilter::MissingAiInput => "missing-ai-input",
            BackfillFilter::StaleNormalization => "stale-normalization",
            BackfillFilter::Unfetched => "unfetched",
            BackfillFilter::All => "all",
        }
    }

    pub fn matches(self, record: &DescriptionRecord) -> bool {
        let has_tier1 = record.raw_text_normalized.as_deref().is_some_and(|t| !t.is_empty());
        match self {
            BackfillFilter::MissingAiInput => {
                has_tier1 && record.ai_input_text.as_deref().unwrap_or_default().is_empty()
            }
            BackfillFilter::StaleNormalization => {
                record.fetch_status == FetchStatus::Fetched && !record.has_current_normalization()
            }
            BackfillFilter::Unfetched => {
                record.source_type == SourceType::Url
                    && matches!(record.fetch_status, FetchStatus::NotRequested | FetchStatus::Error)
            }
            BackfillFilter::All => has_tier1 && record.fetch_status == FetchStatus::Fetched,
        }
    }
}

impl fmt::Display for BackfillFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackfillFilter {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "missing-ai-input" => Ok(BackfillFilter::MissingAiInput),
            "stale-normalization" => Ok(BackfillFilter::StaleNormalization),
            "unfetched" => Ok(BackfillFilter::Unfetched),
            "all" => Ok(BackfillFilter::All),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Version the store writes when a record leaves it unset.
pub(crate) fn effective_ai_input_version(record: &DescriptionRecord) -> i32 {
    record.ai_input_version.unwrap_or(AI_INPUT_VERSION)
}

#[derive(Debug, Default)]
struct MemoryState {
    opportunities: BTreeMap<String, (Opportunity, String)>,
    raw: HashMap<String, Value>,
    versions: Vec<OpportunityVersion>,
    descriptions: BTreeMap<String, DescriptionRecord>,
}

/// In-process store. Every mutating call bumps `write_count`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub async fn raw_snapshot(&self, notice_id: &str) -> Option<Value> {
        self.state.lock().await.raw.get(notice_id).cloned()
    }

    fn bump(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl OpportunityStore for MemoryStore {
    async fn opportunity_hash(&self, notice_id: &str) -> anyhow::Result<Option<String>> {
        Ok(self
            .state
            .lock()
            .await
            .opportunities
            .get(notice_id)
            .map(|(_, hash)| hash.clone()))
    }

    async fn insert_opportunity(
        &self,
        opportunity: &Opportunity,
        content_hash: &str,
        raw: &Value,
        _fetched_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        if state.opportunities.contains_key(&opportunity.notice_id) {
            anyhow::bail!("opportunity {} already exists", opportunity.notice_id);
        }
        state.raw.insert(opportunity.notice_id.clone(), raw.clone());
        state
            .opportunities
            .insert(opportunity.notice_id.clone(), (opportunity.clone(), content_hash.to_string()));
        self.bump();
        Ok(())
    }

    async fn update_opportunity(
        &self,
        opportunity: &Opportunity,
        content_hash: &str,
        raw: &Value,
        fetched_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        if !state.opportunities.contains_key(&opportunity.notice_id) {
            anyhow::bail!("opportunity {} not found for update", opportunity.notice_id);
        }
        state.raw.insert(opportunity.notice_id.clone(), raw.clone());
        state.versions.push(OpportunityVersion {
            notice_id: opportunity.notice_id.clone(),
            content_hash: content_hash.to_string(),
            raw_snapshot: raw.clone(),
            fetched_at,
        });
        state
            .opportunities
            .insert(opportunity.notice_id.clone(), (opportunity.clone(), content_hash.to_string()));
        self.bump();
        Ok(())
    }

    async fn get_opportunity(&self, notice_id: &str) -> anyhow::Result<Option<Opportunity>> {
        Ok(self
            .state
            .lock()
            .await
            .opportunities
            .get(notice_id)
            .map(|(opp, _)| opp.clone()))
    }

    async fn versions(&self, notice_id: &str) -> anyhow::Result<Vec<OpportunityVersion>> {
        Ok(self
            .state
            .lock()
            .await
            .versions
            .iter()
            .filter(|v| v.notice_id == notice_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl DescriptionStore for MemoryStore {
    async fn get_description(&self, notice_id: &str) -> anyhow::Result<Option<DescriptionRecord>> {
        Ok(self.state.lock().await.descriptions.get(notice_id).cloned())
    }

    async fn insert_description_if_absent(&self, record: &DescriptionRecord) -> anyhow::Result<bool> {
        let mut state = self.state.lock().await;
        if state.descriptions.contains_key(&record.notice_id) {
            return Ok(false);
        }
        let mut stored = record.clone();
        stored.ai_input_version = Some(effective_ai_input_version(record));
        state.descriptions.insert(record.notice_id.clone(), stored);
        self.bump();
        Ok(true)
    }

    async fn upsert_description(&self, record: &DescriptionRecord) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        let mut stored = record.clone();
        stored.ai_input_version = Some(effective_ai_input_version(record));
        if let Some(existing) = state.descriptions.get(&record.notice_id) {
            stored.created_at = existing.created_at;
        }
        state.descriptions.insert(record.notice_id.clone(), stored);
        self.bump();
        Ok(())
    }

    async fn backfill_candidates(&self, filter: BackfillFilter, limit: Option<usize>) -> anyhow::Result<Vec<String>> {
        let state = self.state.lock().await;
        Ok(state
            .descriptions
            .values()
            .filter(|record| filter.matches(record))
            .map(|record| record.notice_id.clone())
            .take(limit.unwrap_or(usize::MAX))
            .collect())
    }
}
