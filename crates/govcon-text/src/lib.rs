//! Description text handling: source classification, unwrapping of wrapped
//! payloads, two-tier normalization, and AI-oriented extraction.

pub mod extract;
pub mod normalize;
pub mod rules;
pub mod unwrap;

use govcon_core::DescriptionOrigin;

pub use extract::{AiDocument, ExtractionConfig, Extractor};
pub use normalize::{has_stripped_markup, normalize_display, normalize_raw};
pub use rules::{FactRule, MetaField, RuleSet};
pub use unwrap::{extract_description_lenient, parse_lenient_string, unwrap_description};

/// Decides where an opportunity's description lives.
pub fn classify_source(description: &str) -> DescriptionOrigin {
    let trimmed = description.trim();
    if trimmed.is_empty() {
        DescriptionOrigin::None
    } else if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        DescriptionOrigin::Url(trimmed.to_string())
    } else {
        DescriptionOrigin::Inline(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_empty_url_and_inline_sources() {
        assert_eq!(classify_source(""), DescriptionOrigin::None);
        assert_eq!(classify_source(" \n\t "), DescriptionOrigin::None);
        let url = "https://api.sam.gov/prod/opps/v3/opportunities/resources/files/x/description";
        assert_eq!(classify_source(&format!("  {url} ")), DescriptionOrigin::Url(url.into()));
        assert_eq!(
            classify_source("http://example/desc"),
            DescriptionOrigin::Url("http://example/desc".into())
        );
        assert_eq!(
            classify_source("Provide 40 widgets."),
            DescriptionOrigin::Inline("Provide 40 widgets.".into())
        );
        assert_eq!(
            classify_source("ftp://example/desc"),
            DescriptionOrigin::Inline("ftp://example/desc".into())
        );
    }

    #[test]
    fn tiers_compose_over_unwrapped_text() {
        let raw = unwrap_description("{\"description\":\"<div>Line one</div>\r\n\r\n\r\n\r\nLine two &amp; more\"}");
        let tier1 = normalize_raw(&raw);
        assert_eq!(tier1, "<div>Line one</div>\n\n\n\nLine two &amp; more");
        assert_eq!(normalize_display(&tier1), "Line one\n\n\nLine two & more");
    }
}
