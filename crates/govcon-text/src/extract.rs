//! Deterministic AI-input extraction.
//!
//! Turns Tier-1 text into a compact "key facts + relevant excerpt" document and
//! structured metadata. Everything is driven by the compiled [`RuleSet`].

use anyhow::Context;
use govcon_core::AiMeta;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::rules::{FactRule, MetaField, RuleSet};

static EMAIL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}").expect("email regex"));
static PHONE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\(?\d{3}\)?[-.\s]?\d{3}[-.\s]?\d{4}|\d{3}-\d{3}-\d{4}|\d{10})").expect("phone regex")
});
static URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"https?://[^\s<>"{}|\\^`\[\]]+"#).expect("url regex"));
static NUMBERED_HEADING: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+\.\s+").expect("heading regex"));

const HEADER_PREFIX: &str = "KEY FACTS:\n";
const HEADER_SUFFIX: &str = "\n\nRELEVANT EXCERPT:\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractionConfig {
    /// Character budget for the whole AI document, header included.
    pub max_ai_chars: usize,
    pub max_ai_paragraphs: usize,
    pub excerpt_chars: usize,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            max_ai_chars: 8000,
            max_ai_paragraphs: 40,
            excerpt_chars: 1000,
        }
    }
}

impl ExtractionConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_ai_chars: std::env::var("AI_DESC_MAX_CHARS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|v| *v > 0)
                .unwrap_or(defaults.max_ai_chars),
            max_ai_paragraphs: std::env::var("AI_DESC_MAX_PARAS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|v| *v > 0)
                .unwrap_or(defaults.max_ai_paragraphs),
            excerpt_chars: defaults.excerpt_chars,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AiDocument {
    pub ai_input_text: String,
    pub excerpt_text: String,
    pub meta: AiMeta,
    pub poc_email_primary: Option<String>,
}

#[derive(Debug)]
struct CompiledFact {
    fact: String,
    any_of: Vec<String>,
    pattern: Option<Regex>,
    sets: Option<MetaField>,
}

struct FactHit {
    fact: String,
    capture: Option<String>,
    sets: Option<MetaField>,
}

impl CompiledFact {
    fn compile(rule: &FactRule) -> anyhow::Result<Self> {
        let pattern = rule
            .pattern
            .as_deref()
            .map(Regex::new)
            .transpose()
            .with_context(|| format!("compiling pattern for fact `{}`", rule.fact))?;
        Ok(Self {
            fact: rule.fact.clone(),
            any_of: lowercase_all(&rule.any_of),
            pattern,
            sets: rule.sets,
        })
    }

    fn evaluate(&self, text: &str, lower: &str) -> Option<FactHit> {
        if self.any_of.is_empty() && self.pattern.is_none() {
            return None;
        }
        if !self.any_of.is_empty() && !self.any_of.iter().any(|k| lower.contains(k.as_str())) {
            return None;
        }
        let capture = match &self.pattern {
            Some(pattern) => {
                let caps = pattern.captures(text)?;
                caps.get(1).map(|m| m.as_str().to_string())
            }
            None => None,
        };
        let fact = match &capture {
            Some(value) => self.fact.replace("{1}", value),
            None => self.fact.clone(),
        };
        Some(FactHit {
            fact,
            capture,
            sets: self.sets,
        })
    }
}

#[derive(Debug)]
pub struct Extractor {
    config: ExtractionConfig,
    rules: RuleSet,
    clause_keywords: Vec<String>,
    paragraph_keywords: Vec<(String, i32)>,
    junk_phrases: Vec<String>,
    facts: Vec<CompiledFact>,
    signals: Vec<CompiledFact>,
    boilerplate_start: Regex,
    boilerplate_end: Vec<Regex>,
    certificate: Regex,
    set_aside: Regex,
}

impl Extractor {
    pub fn new(rules: RuleSet, config: ExtractionConfig) -> anyhow::Result<Self> {
        let facts = rules
            .facts
            .iter()
            .map(CompiledFact::compile)
            .collect::<anyhow::Result<Vec<_>>>()?;
        let signals = rules
            .boilerplate
            .signals
            .iter()
            .map(CompiledFact::compile)
            .collect::<anyhow::Result<Vec<_>>>()?;
        let boilerplate_start =
            Regex::new(&rules.boilerplate.start).context("compiling boilerplate start pattern")?;
        let boilerplate_end = rules
            .boilerplate
            .end
            .iter()
            .map(|p| Regex::new(p).with_context(|| format!("compiling boilerplate end pattern `{p}`")))
            .collect::<anyhow::Result<Vec<_>>>()?;
        let certificate = Regex::new(&rules.certificate_pattern).context("compiling certificate pattern")?;
        let set_aside = Regex::new(&rules.set_aside_pattern).context("compiling set-aside pattern")?;

        Ok(Self {
            config,
            clause_keywords: lowercase_all(&rules.clause_keywords),
            paragraph_keywords: rules
                .paragraph_keywords
                .iter()
                .map(|k| (k.keyword.to_lowercase(), k.weight))
                .collect(),
            junk_phrases: lowercase_all(&rules.junk_phrases),
            facts,
            signals,
            boilerplate_start,
            boilerplate_end,
            certificate,
            set_aside,
            rules,
        })
    }

    /// Extractor over the built-in rule table.
    pub fn builtin(config: ExtractionConfig) -> Self {
        Self::new(RuleSet::default(), config).expect("built-in extraction rules compile")
    }

    pub fn extract(&self, raw: &str) -> AiDocument {
        if raw.trim().is_empty() {
            return AiDocument::default();
        }

        let lower = raw.to_lowercase();
        let lines: Vec<&str> = raw.split('\n').collect();
        let mut meta = AiMeta {
            clauses_kept: self.clause_titles(&lines),
            ..AiMeta::default()
        };

        meta.poc_emails = dedup(EMAIL.find_iter(raw).map(|m| m.as_str().to_string()));
        meta.poc_phones = dedup(PHONE.find_iter(raw).map(|m| m.as_str().to_string()));
        meta.important_urls = dedup(URL.find_iter(raw).map(|m| m.as_str().to_string()));
        let poc_email_primary = meta.poc_emails.first().cloned();

        let mut facts = Vec::new();
        for rule in &self.facts {
            if let Some(hit) = rule.evaluate(raw, &lower) {
                apply_meta(&mut meta, &hit);
                facts.push(hit.fact);
            }
        }

        let (kept_lines, signal_facts) = self.strip_boilerplate(&lines);
        facts.extend(signal_facts);
        let facts = dedup(facts);

        let mut scored: Vec<(i32, String)> = self
            .paragraphs(&kept_lines)
            .into_iter()
            .map(|p| (self.score_paragraph(&p), p))
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0));

        let header = format!("{HEADER_PREFIX}{}{HEADER_SUFFIX}", facts.join("\n"));
        let available = self.config.max_ai_chars.saturating_sub(char_len(&header));
        let mut selected: Vec<&str> = Vec::new();
        let mut used = 0usize;
        for (index, (score, paragraph)) in scored.iter().enumerate() {
            if index >= self.config.max_ai_paragraphs || *score <= 0 {
                break;
            }
            let len = char_len(paragraph);
            if used + len > available {
                break;
            }
            selected.push(paragraph);
            used += len + 2;
        }

        let ai_input_text = format!("{header}{}", selected.join("\n\n"));
        let excerpt_text = build_excerpt(&selected, self.config.excerpt_chars);

        meta.certs_required = dedup_case_insensitive(
            self.certificate
                .find_iter(raw)
                .map(|m| m.as_str().trim().to_string()),
        );
        meta.set_aside_detected = self
            .set_aside
            .captures(raw)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().trim().to_string());
        meta.key_requirements = facts;

        AiDocument {
            ai_input_text,
            excerpt_text,
            meta,
            poc_email_primary,
        }
    }

    fn clause_titles(&self, lines: &[&str]) -> Vec<String> {
        lines
            .iter()
            .filter(|line| line.contains('|'))
            .filter_map(|line| {
                let title = line.split('|').next().unwrap_or_default().trim();
                let len = char_len(title);
                if len < self.rules.clause_title_min_chars || len > self.rules.clause_title_max_chars {
                    return None;
                }
                let lower = title.to_lowercase();
                self.clause_keywords
                    .iter()
                    .any(|k| lower.contains(k.as_str()))
                    .then(|| title.to_string())
            })
            .collect()
    }

    /// Drops boilerplate regions, returning kept lines and facts mined from the
    /// dropped ones.
    fn strip_boilerplate<'a>(&self, lines: &[&'a str]) -> (Vec<&'a str>, Vec<String>) {
        let mut kept = Vec::new();
        let mut facts = Vec::new();
        let mut region: Option<Vec<&str>> = None;

        for &line in lines {
            if self.boilerplate_start.is_match(line) {
                region = Some(Vec::new());
                continue;
            }
            match region.as_mut() {
                Some(collected) => {
                    if self.boilerplate_end.iter().any(|p| p.is_match(line)) {
                        facts.extend(self.mine_signals(collected));
                        region = None;
                        kept.push(line);
                    } else {
                        collected.push(line);
                    }
                }
                None => kept.push(line),
            }
        }

        if let Some(collected) = region {
            facts.extend(self.mine_signals(&collected));
        }
        (kept, facts)
    }

    fn mine_signals(&self, region: &[&str]) -> Vec<String> {
        let text = region.join("\n");
        let lower = text.to_lowercase();
        self.signals
            .iter()
            .filter_map(|rule| rule.evaluate(&text, &lower))
            .map(|hit| hit.fact)
            .collect()
    }

    fn is_heading(&self, line: &str) -> bool {
        if NUMBERED_HEADING.is_match(line) {
            return true;
        }
        !line.is_empty()
            && char_len(line) < self.rules.heading_max_chars
            && mostly_uppercase(line, self.rules.uppercase_ratio)
    }

    fn paragraphs(&self, lines: &[&str]) -> Vec<String> {
        let mut paragraphs = Vec::new();
        let mut current: Vec<&str> = Vec::new();

        for line in lines {
            let line = line.trim();
            let heading = self.is_heading(line);
            if line.is_empty() || heading {
                if !current.is_empty() {
                    paragraphs.push(current.join("\n"));
                    current.clear();
                }
                if heading {
                    current.push(line);
                }
            } else {
                current.push(line);
            }
        }
        if !current.is_empty() {
            paragraphs.push(current.join("\n"));
        }

        paragraphs
            .into_iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect()
    }

    fn score_paragraph(&self, paragraph: &str) -> i32 {
        let lower = paragraph.to_lowercase();
        let mut score: i32 = self
            .paragraph_keywords
            .iter()
            .filter(|(keyword, _)| lower.contains(keyword.as_str()))
            .map(|(_, weight)| *weight)
            .sum();
        if self.is_junk(paragraph) {
            score -= self.rules.junk_penalty;
        }
        score
    }

    fn is_junk(&self, paragraph: &str) -> bool {
        let trimmed = paragraph.trim();
        if trimmed.is_empty() {
            return true;
        }
        let lower = trimmed.to_lowercase();
        if self.junk_phrases.iter().any(|p| lower.contains(p.as_str())) {
            return true;
        }
        char_len(trimmed) > self.rules.shouting_min_chars && mostly_uppercase(trimmed, self.rules.uppercase_ratio)
    }
}

fn apply_meta(meta: &mut AiMeta, hit: &FactHit) {
    let Some(field) = hit.sets else {
        return;
    };
    let days = || hit.capture.as_deref().and_then(|c| c.parse::<u32>().ok());
    match field {
        MetaField::WawfRequired => meta.wawf_required = Some(true),
        MetaField::DoRated => meta.do_rated = Some(true),
        MetaField::RequiresIrpodReview => meta.requires_irpod_review = Some(true),
        MetaField::CmmcRequired => meta.cmmc_required = Some(true),
        MetaField::QuoteValidityDays => {
            if meta.quote_validity_days.is_none() {
                meta.quote_validity_days = days();
            }
        }
        MetaField::RotiLeadDays => {
            if meta.roti_lead_days.is_none() {
                meta.roti_lead_days = days();
            }
        }
    }
}

/// ASCII letters only; non-letters are ignored.
fn mostly_uppercase(text: &str, ratio: f64) -> bool {
    let (letters, upper) = text
        .chars()
        .filter(char::is_ascii_alphabetic)
        .fold((0usize, 0usize), |(l, u), c| (l + 1, u + usize::from(c.is_ascii_uppercase())));
    let percent = (ratio * 100.0).round() as usize;
    letters > 0 && upper * 100 >= letters * percent
}

fn build_excerpt(paragraphs: &[&str], target: usize) -> String {
    const ELLIPSIS: &str = "...";
    let mut out = String::new();
    let mut len = 0usize;
    for paragraph in paragraphs {
        let separator = if out.is_empty() { "" } else { "\n\n" };
        let remaining = target.saturating_sub(len + separator.len());
        let para_len = char_len(paragraph);
        if para_len <= remaining {
            out.push_str(separator);
            out.push_str(paragraph);
            len += separator.len() + para_len;
            continue;
        }
        // Truncate only when some text still fits ahead of the ellipsis.
        if remaining > ELLIPSIS.len() {
            out.push_str(separator);
            out.extend(paragraph.chars().take(remaining - ELLIPSIS.len()));
            out.push_str(ELLIPSIS);
        }
        break;
    }
    out
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn lowercase_all(items: &[String]) -> Vec<String> {
    items.iter().map(|s| s.to_lowercase()).collect()
}

fn dedup(items: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for item in items {
        if !out.contains(&item) {
            out.push(item);
        }
    }
    out
}

fn dedup_case_insensitive(items: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for item in items {
        if !out.iter().any(|existing| existing.eq_ignore_ascii_case(&item)) {
            out.push(item);
        }
    }
    out
}
