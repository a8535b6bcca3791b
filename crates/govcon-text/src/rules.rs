//! Declarative extraction rules.
//!
//! The built-in table covers the usual federal solicitation vocabulary. A YAML
//! file can override any section; omitted sections keep the built-in values.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// AiMeta field a fact rule populates when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetaField {
    WawfRequired,
    DoRated,
    RequiresIrpodReview,
    CmmcRequired,
    QuoteValidityDays,
    RotiLeadDays,
}

/// Emits `fact` when any keyword is present (or no keywords are listed) and
/// the pattern matches (or no pattern is given). `{1}` in `fact` is replaced by
/// the pattern's first capture group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactRule {
    pub fact: String,
    #[serde(default)]
    pub any_of: Vec<String>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub sets: Option<MetaField>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightedKeyword {
    pub keyword: String,
    pub weight: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoilerplateRules {
    /// Line pattern that opens a boilerplate region; the line itself is dropped.
    pub start: String,
    /// Line patterns that close the region; the closing line is kept.
    pub end: Vec<String>,
    /// Facts mined from region lines before they are dropped.
    pub signals: Vec<FactRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleSet {
    pub version: u32,
    pub clause_keywords: Vec<String>,
    pub clause_title_min_chars: usize,
    pub clause_title_max_chars: usize,
    pub paragraph_keywords: Vec<WeightedKeyword>,
    pub junk_phrases: Vec<String>,
    pub junk_penalty: i32,
    /// Paragraphs longer than this that are mostly uppercase count as junk.
    pub shouting_min_chars: usize,
    pub uppercase_ratio: f64,
    pub heading_max_chars: usize,
    pub facts: Vec<FactRule>,
    pub certificate_pattern: String,
    pub set_aside_pattern: String,
    pub boilerplate: BoilerplateRules,
}

const CLAUSE_KEYWORDS: &[&str] = &[
    "small business",
    "set-aside",
    "set aside",
    "cybersecurity",
    "cmmc",
    "wawf",
    "wide area workflow",
    "priority rating",
    "payment",
    "certificate",
    "compliance",
    "delivery",
    "submission",
    "quote",
    "validity",
    "irpod",
    "do rated",
    "rated order",
    "certification",
    "certificate of compliance",
];

const PARAGRAPH_KEYWORDS: &[&str] = &[
    "scope",
    "requirements",
    "delivery",
    "submission",
    "certificate",
    "quote",
    "valid",
    "due",
    "close",
    "amendment",
    "irpod",
    "wawf",
    "cmmc",
    "easa",
    "faa",
    "rotis",
    "specification",
    "deliverable",
    "contract",
    "order",
    "purchase",
    "acquisition",
];

const JUNK_PHRASES: &[&str] = &[
    "block 1:",
    "dd form 1423",
    "inspection acceptance",
    "information regarding abbreviations",
];

const ROTI_KEYWORDS: &[&str] = &["rotis", "reports of test and inspection"];

const QUOTE_VALIDITY: &str = concat!(
    r"(?i)(?:pricing\s+for\s+this\s+)?(?:quote|quotation|offer)\s+",
    r"(?:is\s+)?(?:valid|validity|good)\s+(?:for\s+)?(\d+)\s*days?",
);
const ROTI_LEAD_TIME: &str =
    r"(?i)(?:rotis?|reports\s+of\s+test\s+and\s+inspection).*?(?:due|required)\s+(\d+)\s+days?\s+prior";
const CERTIFICATE_FACT: &str =
    r"(?i)(?:certificate|certification|cert)\s+(?:of\s+)?(?:compliance|conformance|origin|insurance)";
const CERTIFICATE_LIST: &str =
    r"(?i)(?:certificate|certification|cert)\s+(?:of\s+)?(?:compliance|conformance|origin|insurance|quality)";
const SET_ASIDE: &str = r"(?i)(?:set[-\s]?aside|small\s+business)\s*:?\s*([^\n]+)";

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn keyword_fact(fact: &str, any_of: &[&str], sets: Option<MetaField>) -> FactRule {
    FactRule {
        fact: fact.to_string(),
        any_of: strings(any_of),
        pattern: None,
        sets,
    }
}

fn builtin_facts() -> Vec<FactRule> {
    vec![
        keyword_fact("Requires IRPOD review", &["irpod"], Some(MetaField::RequiresIrpodReview)),
        FactRule {
            fact: "Quote validity: {1} days".to_string(),
            any_of: Vec::new(),
            pattern: Some(QUOTE_VALIDITY.to_string()),
            sets: Some(MetaField::QuoteValidityDays),
        },
        keyword_fact("ROTIs (Reports of Test and Inspection) required", ROTI_KEYWORDS, None),
        FactRule {
            fact: "ROTIs due {1} days prior to delivery".to_string(),
            any_of: strings(ROTI_KEYWORDS),
            pattern: Some(ROTI_LEAD_TIME.to_string()),
            sets: Some(MetaField::RotiLeadDays),
        },
        keyword_fact("MIL-P-24503 specification", &["mil-p-24503", "mil p 24503"], None),
        FactRule {
            fact: "Certificate required".to_string(),
            any_of: Vec::new(),
            pattern: Some(CERTIFICATE_FACT.to_string()),
            sets: None,
        },
        keyword_fact("DO-rated order", &["do rated", "rated order"], Some(MetaField::DoRated)),
        keyword_fact(
            "WAWF (Wide Area Workflow) required",
            &["wawf", "wide area workflow"],
            Some(MetaField::WawfRequired),
        ),
        keyword_fact("CMMC certification required", &["cmmc"], Some(MetaField::CmmcRequired)),
    ]
}

impl Default for BoilerplateRules {
    fn default() -> Self {
        Self {
            start: r"(?i)information regarding abbreviations.*dd form 1423".to_string(),
            end: strings(&[
                r"(?i)date of first submission",
                r"(?i)submit at the time of material delivery",
                r"(?i)certificate of compliance",
            ]),
            signals: vec![
                keyword_fact("NOFORN restrictions apply", &["noforn"], None),
                keyword_fact(
                    "Need-to-know restrictions apply",
                    &["need-to-know", "need to know"],
                    None,
                ),
                keyword_fact("Foreign nationals restrictions may apply", &["foreign national"], None),
            ],
        }
    }
}

impl Default for RuleSet {
    fn default() -> Self {
        Self {
            version: 1,
            clause_keywords: strings(CLAUSE_KEYWORDS),
            clause_title_min_chars: 8,
            clause_title_max_chars: 100,
            paragraph_keywords: PARAGRAPH_KEYWORDS
                .iter()
                .map(|k| WeightedKeyword {
                    keyword: k.to_string(),
                    weight: 2,
                })
                .collect(),
            junk_phrases: strings(JUNK_PHRASES),
            junk_penalty: 10,
            shouting_min_chars: 100,
            uppercase_ratio: 0.8,
            heading_max_chars: 80,
            facts: builtin_facts(),
            certificate_pattern: CERTIFICATE_LIST.to_string(),
            set_aside_pattern: SET_ASIDE.to_string(),
            boilerplate: BoilerplateRules::default(),
        }
    }
}

impl RuleSet {
    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(yaml).context("parsing extraction rules yaml")
    }

    pub fn from_yaml_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("reading extraction rules {}", path.display()))?;
        Self::from_yaml_str(&yaml)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_override_keeps_unlisted_sections() {
        let rules = RuleSet::from_yaml_str(
            r#"
version: 2
junk_penalty: 25
paragraph_keywords:
  - keyword: hazmat
    weight: 5
"#,
        )
        .unwrap();

        assert_eq!(rules.version, 2);
        assert_eq!(rules.junk_penalty, 25);
        assert_eq!(rules.paragraph_keywords.len(), 1);
        assert_eq!(rules.clause_keywords, RuleSet::default().clause_keywords);
        assert_eq!(rules.facts.len(), RuleSet::default().facts.len());
    }

    #[test]
    fn yaml_fact_rules_parse_meta_targets() {
        let rules = RuleSet::from_yaml_str(
            r#"
facts:
  - fact: "Hazmat handling"
    any_of: ["hazmat"]
  - fact: "Warranty {1} months"
    pattern: "(?i)warranty\\s+(\\d+)\\s+months"
    sets: quote_validity_days
"#,
        )
        .unwrap();
        assert_eq!(rules.facts.len(), 2);
        assert_eq!(rules.facts[1].sets, Some(MetaField::QuoteValidityDays));
        assert!(rules.facts[0].pattern.is_none());
    }

    #[test]
    fn malformed_yaml_is_an_error() {
        assert!(RuleSet::from_yaml_str("junk_penalty: [not a number").is_err());
    }
}
