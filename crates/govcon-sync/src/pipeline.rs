//! Source text to persisted description fields.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use govcon_core::{DescriptionRecord, FetchStatus, AI_INPUT_VERSION, NORMALIZATION_VERSION};
use govcon_storage::sha256_hex;
use govcon_text::{normalize_display, normalize_raw, unwrap_description, AiDocument, Extractor};
use serde_json::{Map, Value};

/// `last_error` for a source that leaves no readable text.
pub const EMPTY_DESCRIPTION: &str = "empty description";

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedDescription {
    pub raw_text: String,
    pub raw_text_normalized: String,
    pub text_normalized: String,
    pub content_hash: String,
    pub ai: AiDocument,
    pub ai_input_hash: String,
}

impl ProcessedDescription {
    pub fn is_readable(&self) -> bool {
        !self.raw_text_normalized.trim().is_empty() && !self.text_normalized.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct DescriptionPipeline {
    extractor: Arc<Extractor>,
}

impl DescriptionPipeline {
    pub fn new(extractor: Extractor) -> Self {
        Self {
            extractor: Arc::new(extractor),
        }
    }

    /// unwrap, Tier 1, Tier 2, content hash, then extraction over Tier 1.
    pub fn process(&self, source_text: &str) -> ProcessedDescription {
        let raw_text = unwrap_description(source_text);
        let raw_text_normalized = normalize_raw(&raw_text);
        let text_normalized = normalize_display(&raw_text_normalized);
        let content_hash = sha256_hex(text_normalized.as_bytes());
        let ai = self.extractor.extract(&raw_text_normalized);
        let ai_input_hash = sha256_hex(ai.ai_input_text.as_bytes());

        ProcessedDescription {
            raw_text,
            raw_text_normalized,
            text_normalized,
            content_hash,
            ai,
            ai_input_hash,
        }
    }

    /// Writes every text tier and AI field onto `record`.
    pub fn apply(&self, record: &mut DescriptionRecord, processed: ProcessedDescription, now: DateTime<Utc>) {
        record.raw_text = Some(processed.raw_text);
        record.raw_text_normalized = Some(processed.raw_text_normalized);
        record.text_normalized = Some(processed.text_normalized);
        record.content_hash = Some(processed.content_hash);
        record.normalization_version = Some(NORMALIZATION_VERSION);
        apply_ai(record, processed.ai, processed.ai_input_hash, now);
        record.updated_at = now;
    }

    /// Full pipeline over retrieved source text. The record ends `fetched`
    /// only when both text tiers are non-empty; otherwise it is marked
    /// `not_found` with [`EMPTY_DESCRIPTION`] and its derived fields cleared.
    pub fn apply_source(
        &self,
        record: &mut DescriptionRecord,
        source_text: &str,
        now: DateTime<Utc>,
    ) -> FetchStatus {
        let processed = self.process(source_text);
        if processed.is_readable() {
            record.fetch_status = FetchStatus::Fetched;
            record.last_error = None;
            self.apply(record, processed, now);
        } else {
            record.fetch_status = FetchStatus::NotFound;
            record.last_error = Some(EMPTY_DESCRIPTION.to_string());
            record.raw_text = Some(processed.raw_text);
            record.raw_text_normalized = None;
            record.text_normalized = None;
            record.content_hash = None;
            record.normalization_version = None;
            record.updated_at = now;
        }
        record.fetch_status
    }

    /// Rebuilds AI fields from the stored Tier 1 text. Returns whether the
    /// AI input changed. Records without Tier 1 text are left alone.
    pub fn recompute_ai(&self, record: &mut DescriptionRecord, now: DateTime<Utc>) -> bool {
        let Some(tier1) = record.raw_text_normalized.as_deref().filter(|t| !t.is_empty()) else {
            return false;
        };
        let ai = self.extractor.extract(tier1);
        let ai_input_hash = sha256_hex(ai.ai_input_text.as_bytes());
        let changed = record.ai_input_hash.as_deref() != Some(ai_input_hash.as_str())
            || record.ai_input_text.as_deref().unwrap_or_default().is_empty();
        apply_ai(record, ai, ai_input_hash, now);
        record.updated_at = now;
        changed
    }
}

fn apply_ai(record: &mut DescriptionRecord, ai: AiDocument, ai_input_hash: String, now: DateTime<Utc>) {
    record.ai_input_text = Some(ai.ai_input_text);
    record.ai_input_hash = Some(ai_input_hash);
    record.ai_input_version = Some(AI_INPUT_VERSION);
    record.ai_generated_at = Some(now);
    record.ai_meta = Some(ai.meta);
    record.excerpt_text = Some(ai.excerpt_text);
    record.poc_email_primary = ai.poc_email_primary;
}

/// Best stored source for reprocessing: the `description` field of the raw
/// response when it parses, else the raw response, else the inline source,
/// else the raw text.
pub fn stored_source_text(record: &DescriptionRecord) -> Option<String> {
    if let Some(raw) = record.raw_json_response.as_deref().filter(|r| !r.is_empty()) {
        if let Ok(object) = serde_json::from_str::<Map<String, Value>>(raw) {
            if let Some(Value::String(desc)) = object.get("description") {
                if !desc.is_empty() {
                    return Some(desc.clone());
                }
            }
        }
        return Some(raw.to_string());
    }
    record
        .source_inline
        .as_deref()
        .or(record.raw_text.as_deref())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use govcon_core::DescriptionOrigin;
    use govcon_text::ExtractionConfig;

    fn pipeline() -> DescriptionPipeline {
        DescriptionPipeline::new(Extractor::builtin(ExtractionConfig::default()))
    }

    fn record() -> DescriptionRecord {
        DescriptionRecord::placeholder("n1", &DescriptionOrigin::Url("https://example/desc".into()), Utc::now())
    }

    #[test]
    fn process_produces_all_tiers_and_hashes() {
        let out =
            pipeline().process("{\"description\":\"<div>REQUIRES IRPOD review.</div>\r\nQuote valid for 45 days.\"}");
        assert_eq!(out.raw_text, "<div>REQUIRES IRPOD review.</div>\r\nQuote valid for 45 days.");
        assert_eq!(out.raw_text_normalized, "<div>REQUIRES IRPOD review.</div>\nQuote valid for 45 days.");
        assert_eq!(out.text_normalized, "REQUIRES IRPOD review.\nQuote valid for 45 days.");
        assert_eq!(out.content_hash, sha256_hex(out.text_normalized.as_bytes()));
        assert_eq!(out.ai_input_hash, sha256_hex(out.ai.ai_input_text.as_bytes()));
        assert!(out.ai.ai_input_text.starts_with("KEY FACTS"));
    }

    #[test]
    fn apply_stamps_versions() {
        let mut record = record();
        let now = Utc::now();
        let pipeline = pipeline();
        let processed = pipeline.process("Provide 40 widgets.");
        pipeline.apply(&mut record, processed, now);
        assert_eq!(record.normalization_version, Some(NORMALIZATION_VERSION));
        assert_eq!(record.ai_input_version, Some(AI_INPUT_VERSION));
        assert_eq!(record.ai_generated_at, Some(now));
        assert_eq!(record.text_normalized.as_deref(), Some("Provide 40 widgets."));
    }

    #[test]
    fn apply_source_never_marks_empty_text_fetched() {
        let pipeline = pipeline();
        let now = Utc::now();
        for source in ["", "   ", "<div> </div>", "\"  \"", "| | |"] {
            let mut record = record();
            let status = pipeline.apply_source(&mut record, source, now);
            assert_eq!(status, FetchStatus::NotFound, "source: {source:?}");
            assert_eq!(record.last_error.as_deref(), Some(EMPTY_DESCRIPTION));
            assert!(record.text_normalized.is_none());
            assert!(record.normalization_version.is_none());
        }

        let mut record = record();
        record.last_error = Some("earlier failure".into());
        assert_eq!(pipeline.apply_source(&mut record, "Deliver pumps.", now), FetchStatus::Fetched);
        assert!(record.last_error.is_none());
        assert_eq!(record.text_normalized.as_deref(), Some("Deliver pumps."));
    }

    #[test]
    fn recompute_ai_reports_changes_once() {
        let pipeline = pipeline();
        let mut record = record();
        record.fetch_status = FetchStatus::Fetched;
        record.raw_text_normalized = Some("Scope: deliver pumps.\n\nWAWF invoicing applies.".into());

        assert!(pipeline.recompute_ai(&mut record, Utc::now()));
        assert_eq!(record.ai_meta.as_ref().and_then(|m| m.wawf_required), Some(true));
        assert!(!pipeline.recompute_ai(&mut record, Utc::now()));

        let mut empty = self::record();
        assert!(!pipeline.recompute_ai(&mut empty, Utc::now()));
        assert!(empty.ai_input_text.is_none());
    }

    #[test]
    fn stored_source_prefers_description_field() {
        let mut record = record();
        record.raw_text = Some("fallback".into());
        assert_eq!(stored_source_text(&record).as_deref(), Some("fallback"));

        record.raw_json_response = Some("not json at all".into());
        assert_eq!(stored_source_text(&record).as_deref(), Some("not json at all"));

        record.raw_json_response = Some(r#"{"description":"from json"}"#.into());
        assert_eq!(stored_source_text(&record).as_deref(), Some("from json"));
    }
}
