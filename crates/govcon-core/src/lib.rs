//! Core domain model for the procurement description pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Bumped whenever the unwrap/normalize algorithms change output for the same input.
pub const NORMALIZATION_VERSION: i32 = 5;

pub const AI_INPUT_VERSION: i32 = 1;

/// Upstream listing record. Decoding is lenient: `null` becomes the empty value,
/// booleans accept strings and numbers, and location parts accept objects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Opportunity {
    #[serde(default, deserialize_with = "flexible_string")]
    pub notice_id: String,
    #[serde(default, deserialize_with = "flexible_string")]
    pub title: String,
    #[serde(default, deserialize_with = "flexible_string")]
    pub organization_type: String,
    #[serde(default, deserialize_with = "flexible_string")]
    pub posted_date: String,
    #[serde(rename = "type", default, deserialize_with = "flexible_string")]
    pub notice_type: String,
    #[serde(default, deserialize_with = "flexible_string")]
    pub base_type: String,
    #[serde(default, deserialize_with = "flexible_string")]
    pub archive_type: String,
    #[serde(default, deserialize_with = "flexible_string")]
    pub archive_date: String,
    #[serde(default, deserialize_with = "flexible_string")]
    pub type_of_set_aside: String,
    #[serde(default, deserialize_with = "flexible_string")]
    pub type_of_set_aside_desc: String,
    #[serde(default, deserialize_with = "flexible_string")]
    pub response_deadline: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub naics: Vec<NaicsCode>,
    #[serde(default, deserialize_with = "flexible_string")]
    pub classification_code: String,
    #[serde(default, deserialize_with = "flexible_bool")]
    pub active: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub point_of_contact: Vec<PointOfContact>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub place_of_performance: PlaceOfPerformance,
    #[serde(default, deserialize_with = "flexible_string")]
    pub description: String,
    #[serde(default, deserialize_with = "flexible_string")]
    pub department: String,
    #[serde(default, deserialize_with = "flexible_string")]
    pub sub_tier: String,
    #[serde(default, deserialize_with = "flexible_string")]
    pub office: String,
    #[serde(default, deserialize_with = "flexible_string")]
    pub solicitation_number: String,
    #[serde(default, deserialize_with = "flexible_string")]
    pub agency_path_name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub links: Vec<ResourceLink>,
    /// Volatile listing annotation; never part of the content hash.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description_status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct NaicsCode {
    #[serde(default, deserialize_with = "flexible_string")]
    pub code: String,
    #[serde(default, deserialize_with = "flexible_string")]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PointOfContact {
    #[serde(default, deserialize_with = "flexible_string")]
    pub fax: String,
    #[serde(rename = "type", default, deserialize_with = "flexible_string")]
    pub contact_type: String,
    #[serde(default, deserialize_with = "flexible_string")]
    pub email: String,
    #[serde(default, deserialize_with = "flexible_string")]
    pub phone: String,
    #[serde(default, deserialize_with = "flexible_string")]
    pub title: String,
    #[serde(default, deserialize_with = "flexible_string")]
    pub full_name: String,
    #[serde(default, deserialize_with = "flexible_string")]
    pub additional_info_link: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PlaceOfPerformance {
    #[serde(default, deserialize_with = "flexible_string")]
    pub street_address: String,
    #[serde(default, deserialize_with = "flexible_string")]
    pub city: String,
    #[serde(default, deserialize_with = "flexible_string")]
    pub state: String,
    #[serde(default, deserialize_with = "flexible_string")]
    pub zip: String,
    #[serde(default, deserialize_with = "flexible_string")]
    pub country: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ResourceLink {
    #[serde(default, deserialize_with = "flexible_string")]
    pub rel: String,
    #[serde(default, deserialize_with = "flexible_string")]
    pub href: String,
    #[serde(rename = "type", default, deserialize_with = "flexible_string")]
    pub link_type: String,
}

/// One page of the upstream search API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct OpportunitiesPage {
    #[serde(default)]
    pub total_records: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub opportunities_data: Vec<Opportunity>,
}

/// Borrowed view over the fields that define an opportunity's content.
#[derive(Serialize)]
struct CanonicalOpportunity<'a> {
    notice_id: &'a str,
    title: &'a str,
    organization_type: &'a str,
    posted_date: &'a str,
    notice_type: &'a str,
    base_type: &'a str,
    archive_type: &'a str,
    archive_date: &'a str,
    type_of_set_aside: &'a str,
    type_of_set_aside_desc: &'a str,
    response_deadline: &'a str,
    naics: &'a [NaicsCode],
    classification_code: &'a str,
    active: bool,
    point_of_contact: &'a [PointOfContact],
    place_of_performance: &'a PlaceOfPerformance,
    description: &'a str,
    department: &'a str,
    sub_tier: &'a str,
    office: &'a str,
    links: &'a [ResourceLink],
}

impl Opportunity {
    /// Deterministic serialization of the hashed fields. Bookkeeping fields
    /// (solicitation number, agency path, description status) are excluded.
    pub fn canonical_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(&CanonicalOpportunity {
            notice_id: &self.notice_id,
            title: &self.title,
            organization_type: &self.organization_type,
            posted_date: &self.posted_date,
            notice_type: &self.notice_type,
            base_type: &self.base_type,
            archive_type: &self.archive_type,
            archive_date: &self.archive_date,
            type_of_set_aside: &self.type_of_set_aside,
            type_of_set_aside_desc: &self.type_of_set_aside_desc,
            response_deadline: &self.response_deadline,
            naics: &self.naics,
            classification_code: &self.classification_code,
            active: self.active,
            point_of_contact: &self.point_of_contact,
            place_of_performance: &self.place_of_performance,
            description: &self.description,
            department: &self.department,
            sub_tier: &self.sub_tier,
            office: &self.office,
            links: &self.links,
        })
    }
}

/// Append-only snapshot written when an opportunity's content hash changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpportunityVersion {
    pub notice_id: String,
    pub content_hash: String,
    pub raw_snapshot: Value,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    #[default]
    None,
    Inline,
    Url,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FetchStatus {
    #[default]
    NotRequested,
    Fetched,
    NotFound,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant(pub String);

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown variant `{}`", self.0)
    }
}

impl std::error::Error for UnknownVariant {}

impl SourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceType::None => "none",
            SourceType::Inline => "inline",
            SourceType::Url => "url",
        }
    }
}

impl FromStr for SourceType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(SourceType::None),
            "inline" => Ok(SourceType::Inline),
            "url" => Ok(SourceType::Url),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

impl FetchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FetchStatus::NotRequested => "not_requested",
            FetchStatus::Fetched => "fetched",
            FetchStatus::NotFound => "not_found",
            FetchStatus::Error => "error",
        }
    }
}

impl FromStr for FetchStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_requested" => Ok(FetchStatus::NotRequested),
            "fetched" => Ok(FetchStatus::Fetched),
            "not_found" => Ok(FetchStatus::NotFound),
            "error" => Ok(FetchStatus::Error),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Where an opportunity's description text lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DescriptionOrigin {
    None,
    Inline(String),
    Url(String),
}

impl DescriptionOrigin {
    pub fn source_type(&self) -> SourceType {
        match self {
            DescriptionOrigin::None => SourceType::None,
            DescriptionOrigin::Inline(_) => SourceType::Inline,
            DescriptionOrigin::Url(_) => SourceType::Url,
        }
    }
}

/// Structured facts mined from a description for downstream AI consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AiMeta {
    #[serde(default)]
    pub poc_emails: Vec<String>,
    #[serde(default)]
    pub poc_phones: Vec<String>,
    #[serde(default)]
    pub important_urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set_aside_detected: Option<String>,
    #[serde(default)]
    pub clauses_kept: Vec<String>,
    #[serde(default)]
    pub certs_required: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wawf_required: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote_validity_days: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub do_rated: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_irpod_review: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmmc_required: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roti_lead_days: Option<u32>,
    #[serde(default)]
    pub key_requirements: Vec<String>,
}

/// Cached description row, one per notice id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescriptionRecord {
    pub notice_id: String,
    pub source_type: SourceType,
    pub source_url: Option<String>,
    pub source_inline: Option<String>,
    pub fetch_status: FetchStatus,
    pub http_status: Option<i32>,
    pub fetched_at: Option<DateTime<Utc>>,
    pub content_type: Option<String>,
    pub last_error: Option<String>,
    pub raw_json_response: Option<String>,
    pub raw_text: Option<String>,
    pub raw_text_normalized: Option<String>,
    pub text_normalized: Option<String>,
    pub content_hash: Option<String>,
    pub normalization_version: Option<i32>,
    pub ai_input_text: Option<String>,
    pub ai_input_hash: Option<String>,
    pub ai_input_version: Option<i32>,
    pub ai_generated_at: Option<DateTime<Utc>>,
    pub ai_meta: Option<AiMeta>,
    pub excerpt_text: Option<String>,
    pub poc_email_primary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DescriptionRecord {
    /// Fresh `not_requested` row for an origin.
    pub fn placeholder(notice_id: impl Into<String>, origin: &DescriptionOrigin, now: DateTime<Utc>) -> Self {
        let (source_url, source_inline) = match origin {
            DescriptionOrigin::None => (None, None),
            DescriptionOrigin::Inline(text) => (None, Some(text.clone())),
            DescriptionOrigin::Url(url) => (Some(url.clone()), None),
        };
        Self {
            notice_id: notice_id.into(),
            source_type: origin.source_type(),
            source_url,
            source_inline,
            fetch_status: FetchStatus::NotRequested,
            http_status: None,
            fetched_at: None,
            content_type: None,
            last_error: None,
            raw_json_response: None,
            raw_text: None,
            raw_text_normalized: None,
            text_normalized: None,
            content_hash: None,
            normalization_version: None,
            ai_input_text: None,
            ai_input_hash: None,
            ai_input_version: None,
            ai_generated_at: None,
            ai_meta: None,
            excerpt_text: None,
            poc_email_primary: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_fetched(&self) -> bool {
        self.fetch_status == FetchStatus::Fetched
    }

    pub fn has_current_normalization(&self) -> bool {
        self.normalization_version == Some(NORMALIZATION_VERSION)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DescriptionStatus {
    None,
    Fetched,
    NotFound,
    Error,
    AvailableUnfetched,
    /// Another caller holds the fetch lock; retry shortly.
    Fetching,
}

impl DescriptionStatus {
    pub fn for_record(record: &DescriptionRecord) -> Self {
        match record.fetch_status {
            FetchStatus::Fetched => DescriptionStatus::Fetched,
            FetchStatus::NotFound => DescriptionStatus::NotFound,
            FetchStatus::Error => DescriptionStatus::Error,
            FetchStatus::NotRequested if record.source_type == SourceType::None => {
                DescriptionStatus::None
            }
            FetchStatus::NotRequested => DescriptionStatus::AvailableUnfetched,
        }
    }
}

/// Description summary label used when listing opportunities.
pub fn listing_status(source_type: SourceType, record: Option<&DescriptionRecord>) -> &'static str {
    let Some(record) = record else {
        return match source_type {
            SourceType::None => "none",
            _ => "available_unfetched",
        };
    };
    if record.source_type == SourceType::None {
        return "none";
    }
    match record.fetch_status {
        FetchStatus::Fetched => "ready",
        FetchStatus::NotFound => "not_found",
        FetchStatus::Error => "error",
        FetchStatus::NotRequested => "available_unfetched",
    }
}

/// Response shape of `getDescription`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescriptionView {
    pub notice_id: String,
    pub status: DescriptionStatus,
    pub source_type: SourceType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_post_parse_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub normalized_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_json_response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub normalization_version: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub excerpt_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poc_email_primary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fetched_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl DescriptionView {
    pub fn from_record(record: &DescriptionRecord) -> Self {
        Self {
            notice_id: record.notice_id.clone(),
            status: DescriptionStatus::for_record(record),
            source_type: record.source_type,
            source_url: record.source_url.clone(),
            raw_text: record.raw_text.clone(),
            raw_post_parse_text: record.raw_text_normalized.clone(),
            normalized_text: record.text_normalized.clone(),
            raw_json_response: record.raw_json_response.clone(),
            normalization_version: record.normalization_version,
            excerpt_text: record.excerpt_text.clone(),
            poc_email_primary: record.poc_email_primary.clone(),
            fetched_at: record.fetched_at,
            last_error: record.last_error.clone(),
        }
    }

    pub fn fetching(notice_id: impl Into<String>, origin: &DescriptionOrigin) -> Self {
        let source_url = match origin {
            DescriptionOrigin::Url(url) => Some(url.clone()),
            _ => None,
        };
        Self {
            notice_id: notice_id.into(),
            status: DescriptionStatus::Fetching,
            source_type: origin.source_type(),
            source_url,
            raw_text: None,
            raw_post_parse_text: None,
            normalized_text: None,
            raw_json_response: None,
            normalization_version: None,
            excerpt_text: None,
            poc_email_primary: None,
            fetched_at: None,
            last_error: None,
        }
    }
}

/// Caps a string for log output without splitting a character.
pub fn preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn flexible_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.map(|v| flatten_value(&v)).unwrap_or_default())
}

fn flatten_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Object(map) => ["value", "code", "name", "description", "text", "label"]
            .iter()
            .find_map(|key| match map.get(*key) {
                Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
                _ => None,
            })
            .unwrap_or_else(|| value.to_string()),
        Value::Array(_) => value.to_string(),
    }
}

fn flexible_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Bool(b)) => b,
        Some(Value::String(s)) => {
            matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes")
        }
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lenient_decoding_handles_null_objects_and_string_booleans() {
        let json = r#"{
            "noticeId": "abc123",
            "title": null,
            "active": "Yes",
            "naics": null,
            "placeOfPerformance": {
                "city": {"code": "12345", "name": "Norfolk"},
                "state": {"name": "", "code": "VA"},
                "country": {"unexpected": 1}
            },
            "pointOfContact": [{"email": "kim@example.gov", "type": "primary", "phone": null}]
        }"#;
        let opp: Opportunity = serde_json::from_str(json).unwrap();
        assert_eq!(opp.notice_id, "abc123");
        assert_eq!(opp.title, "");
        assert!(opp.active);
        assert!(opp.naics.is_empty());
        assert_eq!(opp.place_of_performance.city, "12345");
        assert_eq!(opp.place_of_performance.state, "VA");
        assert_eq!(opp.place_of_performance.country, r#"{"unexpected":1}"#);
        assert_eq!(opp.point_of_contact[0].contact_type, "primary");
        assert_eq!(opp.point_of_contact[0].phone, "");
    }

    #[test]
    fn numeric_active_flag_is_truthy() {
        let opp: Opportunity = serde_json::from_str(r#"{"noticeId":"x","active":0}"#).unwrap();
        assert!(!opp.active);
        let opp: Opportunity = serde_json::from_str(r#"{"noticeId":"x","active":2}"#).unwrap();
        assert!(opp.active);
    }

    #[test]
    fn canonical_bytes_ignore_bookkeeping_fields() {
        let base = Opportunity {
            notice_id: "n1".into(),
            title: "Widgets".into(),
            ..Default::default()
        };
        let mut bookkeeping = base.clone();
        bookkeeping.description_status = Some("ready".into());
        bookkeeping.solicitation_number = "SPE-1".into();
        assert_eq!(base.canonical_bytes().unwrap(), bookkeeping.canonical_bytes().unwrap());

        let mut retitled = base.clone();
        retitled.title = "Gadgets".into();
        assert_ne!(base.canonical_bytes().unwrap(), retitled.canonical_bytes().unwrap());
    }

    #[test]
    fn status_mapping_distinguishes_none_and_unfetched() {
        let now = Utc::now();
        let none = DescriptionRecord::placeholder("a", &DescriptionOrigin::None, now);
        assert_eq!(DescriptionStatus::for_record(&none), DescriptionStatus::None);

        let mut url = DescriptionRecord::placeholder(
            "b",
            &DescriptionOrigin::Url("https://example/desc".into()),
            now,
        );
        assert_eq!(DescriptionStatus::for_record(&url), DescriptionStatus::AvailableUnfetched);
        assert_eq!(listing_status(SourceType::Url, Some(&url)), "available_unfetched");

        url.fetch_status = FetchStatus::Fetched;
        assert_eq!(DescriptionStatus::for_record(&url), DescriptionStatus::Fetched);
        assert_eq!(listing_status(SourceType::Url, Some(&url)), "ready");
        assert_eq!(listing_status(SourceType::Inline, None), "available_unfetched");
    }

    #[test]
    fn enum_strings_round_trip_through_from_str() {
        for status in [
            FetchStatus::NotRequested,
            FetchStatus::Fetched,
            FetchStatus::NotFound,
            FetchStatus::Error,
        ] {
            assert_eq!(status.as_str().parse::<FetchStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<SourceType>().is_err());
    }

    #[test]
    fn preview_respects_char_boundaries() {
        assert_eq!(preview("héllo wörld", 4), "héll...");
        assert_eq!(preview("short", 10), "short");
    }
}
