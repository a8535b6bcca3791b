//! Two-tier text normalization.
//!
//! Tier 1 (`normalize_raw`) only fixes line endings and trailing whitespace so
//! the text stays faithful to the source. Tier 2 (`normalize_display`) builds on
//! it for display and search: non-formatting markup is stripped, entities are
//! decoded, and clause-table pipe debris is cleaned up.

use once_cell::sync::Lazy;
use regex::Regex;

static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").expect("tag regex"));
static FORMATTING_TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^</?(strong|b|em|i|u|br|p)(\s[^>]*)?/?>$").expect("formatting tag regex")
});
static PUNCTUATION_ENTITY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"([.,;:!?])(&nbsp;|&ensp;|&emsp;|&thinsp;)").expect("punctuation entity regex")
});
static PIPE_ONLY_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[\s|]+$").expect("pipe-only regex"));
static PIPE_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\|[0-9]+\|").expect("pipe-number regex"));
static PIPE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\|\|+").expect("pipe-run regex"));
static LEADING_PIPES: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\|+\s*").expect("leading pipe regex"));
static TRAILING_PIPES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*\|+$").expect("trailing pipe regex"));
static WHITESPACE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s{2,}").expect("whitespace regex"));

/// Tier 1: `\r\n` and lone `\r` become `\n`; trailing spaces and tabs are
/// trimmed from every line. Markup is left alone.
pub fn normalize_raw(text: &str) -> String {
    text.replace("\r\n", "\n")
        .replace('\r', "\n")
        .split('\n')
        .map(|line| line.trim_end_matches([' ', '\t']))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Tier 2 display normalization. Idempotent: the single pass is repeated until
/// its output no longer changes.
///
/// A pass never adds characters, and one that changes its input either drops
/// characters or turns a `\r` into `\n`, so the loop always reaches a fixed
/// point.
pub fn normalize_display(text: &str) -> String {
    let mut current = display_pass(text);
    loop {
        let next = display_pass(&current);
        if next == current {
            return current;
        }
        current = next;
    }
}

/// True when `text` still carries a tag that Tier 2 would strip.
pub fn has_stripped_markup(text: &str) -> bool {
    TAG.find_iter(text).any(|tag| !FORMATTING_TAG.is_match(tag.as_str()))
}

fn display_pass(text: &str) -> String {
    let stripped = TAG.replace_all(text, |caps: &regex::Captures<'_>| {
        let tag = &caps[0];
        if FORMATTING_TAG.is_match(tag) {
            tag.to_string()
        } else {
            " ".to_string()
        }
    });
    let collapsed = PUNCTUATION_ENTITY.replace_all(&stripped, "$1");
    let decoded = html_escape::decode_html_entities(&collapsed);
    let raw = normalize_raw(&decoded);

    let mut lines: Vec<String> = Vec::new();
    let mut blank_run = 0;
    for line in raw.split('\n') {
        if PIPE_ONLY_LINE.is_match(line) {
            continue;
        }

        let cleaned = PIPE_NUMBER.replace_all(line, " ");
        let cleaned = PIPE_RUN.replace_all(&cleaned, " ");
        let cleaned = LEADING_PIPES.replace(&cleaned, "");
        let cleaned = TRAILING_PIPES.replace(&cleaned, "");
        let cleaned = WHITESPACE_RUN.replace_all(&cleaned, " ");
        let cleaned = cleaned.trim();

        if cleaned.is_empty() {
            blank_run += 1;
            if blank_run <= 2 {
                lines.push(String::new());
            }
        } else {
            blank_run = 0;
            lines.push(cleaned.to_string());
        }
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_tier_fixes_line_endings_only() {
        assert_eq!(normalize_raw("a\r\nb\rc  \t\n<b>d</b>  "), "a\nb\nc\n<b>d</b>");
        assert_eq!(normalize_raw(""), "");
    }

    #[test]
    fn display_tier_keeps_formatting_tags_and_strips_the_rest() {
        let input = "<div class=\"x\"><p>Scope</p><span>of <strong>work</strong></span></div>";
        assert_eq!(normalize_display(input), "<p>Scope</p> of <strong>work</strong>");
    }

    #[test]
    fn display_tier_collapses_punctuation_entities_and_decodes() {
        assert_eq!(normalize_display("End.&nbsp;Next &amp; more&#8217;s"), "End.Next & more\u{2019}s");
    }

    #[test]
    fn display_tier_cleans_clause_table_debris() {
        let input = "| | |\n|1| Payment Terms || Net 30 |\n||| \nBody";
        assert_eq!(normalize_display(input), "Payment Terms Net 30\nBody");
    }

    #[test]
    fn display_tier_limits_blank_runs_to_two() {
        assert_eq!(normalize_display("a\n\n\n\n\nb"), "a\n\n\nb");
    }

    #[test]
    fn display_tier_is_idempotent() {
        let inputs = [
            "Plain text",
            "x &lt;span&gt; y &lt;/span&gt; z",
            "&amp;amp;lt;b&amp;amp;gt;",
            "<p>Para</p>\r\n\r\n\r\n\r\n<br/>Tail |  | ",
            "|| A || B ||\n|2|\n\t\n\t\n\t\n\tC",
            "Mixed\u{a0}\u{a0}spaces&nbsp;&nbsp;here.&thinsp;",
            "",
        ];
        for input in inputs {
            let once = normalize_display(input);
            assert_eq!(normalize_display(&once), once, "input: {input:?}");
        }
    }

    #[test]
    fn display_tier_settles_deeply_escaped_entities() {
        let input = format!("x &amp;{}lt;b&gt; y", "amp;".repeat(20));
        let once = normalize_display(&input);
        assert_eq!(once, "x <b> y");
        assert_eq!(normalize_display(&once), once);

        let nested_tag = format!("a &{}lt;div&gt;b", "amp;".repeat(32));
        let once = normalize_display(&nested_tag);
        assert_eq!(once, "a b");
        assert!(!has_stripped_markup(&once));
    }

    #[test]
    fn stripped_markup_detection_ignores_formatting_tags() {
        assert!(!has_stripped_markup("<p>ok</p> <B>bold</B> <br/>"));
        assert!(has_stripped_markup("<div>nope</div>"));
        assert!(!has_stripped_markup("no tags"));
    }
}
