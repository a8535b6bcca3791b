//! Recovery of description text from wrapped, double-encoded, or malformed JSON.

use serde::Deserialize;
use serde_json::Value;

/// Inputs longer than this are not scanned by the tolerant extractor.
pub const MAX_SCAN_BYTES: usize = 10 * 1024 * 1024;
/// Extracted values longer than this are rejected.
pub const MAX_EXTRACTED_BYTES: usize = 5 * 1024 * 1024;
/// Number of unwrap steps applied before the current value is returned as is.
pub const MAX_UNWRAP_DEPTH: usize = 2;

const DESCRIPTION_KEY: &[u8] = b"\"description\"";

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    description: Option<Value>,
}

/// Returns the innermost human-readable text of `input`.
///
/// Accepts plain text, `{"description": ...}` objects, and JSON-encoded strings
/// wrapping either. Never fails: when nothing can be unwrapped the input comes
/// back unchanged.
pub fn unwrap_description(input: &str) -> String {
    let mut current = input.to_string();
    let mut depth = 0;
    while depth < MAX_UNWRAP_DEPTH {
        match unwrap_step(&current) {
            Some(next) => {
                current = next;
                depth += 1;
            }
            None => break,
        }
    }
    current
}

fn unwrap_step(input: &str) -> Option<String> {
    let s = input.trim();
    if s.is_empty() {
        return None;
    }

    if s.starts_with('{') && s.contains("\"description\"") {
        return match serde_json::from_str::<Envelope>(s) {
            Ok(envelope) => match envelope.description {
                Some(Value::String(text)) if !text.trim().is_empty() => Some(text),
                Some(value @ (Value::Object(_) | Value::Array(_))) => serde_json::to_string(&value).ok(),
                _ => None,
            },
            Err(_) => non_blank(extract_description_lenient(s)),
        };
    }

    if s.starts_with('"') {
        return match serde_json::from_str::<String>(s) {
            Ok(inner) => Some(inner),
            Err(_) => non_blank(extract_description_lenient(s)),
        };
    }

    None
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Pulls the string value of the top-level `"description"` key out of a
/// JSON-like payload, tolerating raw control characters inside strings.
///
/// Keys nested in inner objects or appearing inside string values never match.
/// Returns `None` instead of partial data.
pub fn extract_description_lenient(s: &str) -> Option<String> {
    if s.len() > MAX_SCAN_BYTES {
        return None;
    }

    let bytes = s.as_bytes();
    let mut i = bytes.iter().position(|&b| b == b'{')? + 1;
    let mut depth: i64 = 1;
    let mut in_string = false;
    let mut escape_next = false;

    while i < bytes.len() {
        let ch = bytes[i];

        if escape_next {
            escape_next = false;
            i += 1;
            continue;
        }
        if ch == b'\\' && in_string {
            escape_next = true;
            i += 1;
            continue;
        }

        if ch == b'"' {
            if depth == 1 && !in_string && bytes[i..].starts_with(DESCRIPTION_KEY) {
                return description_value(s, i + DESCRIPTION_KEY.len());
            }
            in_string = !in_string;
            i += 1;
            continue;
        }

        if !in_string {
            match ch {
                b'{' | b'[' => depth += 1,
                b'}' | b']' => {
                    depth -= 1;
                    if depth < 0 {
                        return None;
                    }
                }
                _ => {}
            }
        }
        i += 1;
    }

    None
}

/// Parses `: "<value>"` starting right after the matched key.
fn description_value(s: &str, mut i: usize) -> Option<String> {
    let bytes = s.as_bytes();
    i = skip_json_whitespace(bytes, i);
    if bytes.get(i) != Some(&b':') {
        return None;
    }
    i = skip_json_whitespace(bytes, i + 1);
    if bytes.get(i) != Some(&b'"') {
        return None;
    }

    let (value, _) = parse_lenient_string(s, i)?;
    if value.len() > MAX_EXTRACTED_BYTES {
        return None;
    }
    Some(value)
}

fn skip_json_whitespace(bytes: &[u8], mut i: usize) -> usize {
    while i < bytes.len() && matches!(bytes[i], b' ' | b'\t' | b'\n' | b'\r') {
        i += 1;
    }
    i
}

/// Decodes a JSON string literal starting at the quote at `start`.
///
/// Raw newlines and carriage returns inside the quotes are kept verbatim and
/// unknown escapes keep the escaped character. Returns the decoded value and
/// the index just past the closing quote, or `None` when unterminated.
pub fn parse_lenient_string(s: &str, start: usize) -> Option<(String, usize)> {
    let bytes = s.as_bytes();
    if bytes.get(start) != Some(&b'"') {
        return None;
    }

    let mut out: Vec<u8> = Vec::new();
    let mut i = start + 1;

    while i < bytes.len() {
        match bytes[i] {
            b'"' => return Some((into_string(out), i + 1)),
            b'\\' => {
                i += 1;
                let esc = *bytes.get(i)?;
                match esc {
                    b'"' => out.push(b'"'),
                    b'\\' => out.push(b'\\'),
                    b'/' => out.push(b'/'),
                    b'b' => out.push(0x08),
                    b'f' => out.push(0x0C),
                    b'n' => out.push(b'\n'),
                    b'r' => out.push(b'\r'),
                    b't' => out.push(b'\t'),
                    b'u' => {
                        let (ch, consumed) = decode_unicode_escape(bytes, i)?;
                        let mut buf = [0u8; 4];
                        out.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
                        i += consumed;
                        continue;
                    }
                    other => out.push(other),
                }
                i += 1;
            }
            other => {
                out.push(other);
                i += 1;
            }
        }
    }

    None
}

/// `u_index` points at the `u` of `\uXXXX`. Returns the character and how many
/// bytes to advance past it, combining a following low surrogate when present.
fn decode_unicode_escape(bytes: &[u8], u_index: usize) -> Option<(char, usize)> {
    let high = parse_hex4(bytes, u_index + 1)?;

    if (0xD800..=0xDBFF).contains(&high)
        && bytes.get(u_index + 5) == Some(&b'\\')
        && bytes.get(u_index + 6) == Some(&b'u')
    {
        if let Some(low) = parse_hex4(bytes, u_index + 7) {
            if (0xDC00..=0xDFFF).contains(&low) {
                let combined = 0x10000 + (high - 0xD800) * 0x400 + (low - 0xDC00);
                let ch = char::from_u32(combined).unwrap_or(char::REPLACEMENT_CHARACTER);
                return Some((ch, 11));
            }
        }
    }

    Some((char::from_u32(high).unwrap_or(char::REPLACEMENT_CHARACTER), 5))
}

fn parse_hex4(bytes: &[u8], at: usize) -> Option<u32> {
    let digits = bytes.get(at..at + 4)?;
    if !digits.iter().all(u8::is_ascii_hexdigit) {
        return None;
    }
    let text = std::str::from_utf8(digits).ok()?;
    u32::from_str_radix(text, 16).ok()
}

fn into_string(bytes: Vec<u8>) -> String {
    String::from_utf8(bytes).unwrap_or_else(|err| String::from_utf8_lossy(err.as_bytes()).into_owned())
}
