//! Post-processing: deterministic cleanup of the model's final response.
//!
//! The finalize turn asks for a bare JSON object `{"html": "..."}`. Models
//! follow that most of the time, but regularly:
//!
//! - wrap the object in ` ```json ... ``` ` fences,
//! - prefix it with a sentence such as "Here is the converted book:",
//! - wrap the markup *inside* the field in ` ```html ` fences,
//! - emit CRLF line endings, a BOM or zero-width characters.
//!
//! The rules here repair those quirks without touching content. Each one is
//! a pure `&str -> String` function and independently testable.

use crate::error::Pdf2EpubError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

/// Name of the JSON field carrying the generated markup.
pub const HTML_FIELD: &str = "html";

/// Normalise a raw response before JSON parsing.
///
/// Rules (applied in order):
/// 1. Normalise line endings (CRLF → LF)
/// 2. Strip invisible Unicode (BOM, zero-width spaces, ...)
/// 3. Strip outer code fences
pub fn clean_response(input: &str) -> String {
    let s = normalise_line_endings(input);
    let s = remove_invisible_chars(&s);
    strip_outer_fences(&s)
}

/// Extract the markup from a finalize response.
///
/// Fails with [`Pdf2EpubError::MalformedResponse`] when no JSON object can be
/// found, or when it has no non-empty string field [`HTML_FIELD`].
pub fn parse_html_payload(raw: &str) -> Result<String, Pdf2EpubError> {
    let cleaned = clean_response(raw);
    let value = parse_json_object(&cleaned).ok_or_else(|| Pdf2EpubError::MalformedResponse {
        detail: format!("response is not a JSON object: {}", preview(&cleaned)),
    })?;

    let html = value
        .get(HTML_FIELD)
        .and_then(Value::as_str)
        .ok_or_else(|| Pdf2EpubError::MalformedResponse {
            detail: format!("JSON object has no string field '{}'", HTML_FIELD),
        })?;

    let markup = clean_markup(html);
    if markup.is_empty() {
        return Err(Pdf2EpubError::MalformedResponse {
            detail: format!("field '{}' is empty", HTML_FIELD),
        });
    }
    Ok(markup)
}

/// Cleanup applied to the markup carried by the JSON field.
///
/// 1. Normalise line endings
/// 2. Strip invisible Unicode
/// 3. Strip ` ```html ` fences around the document
/// 4. Drop any prose before the first tag
pub fn clean_markup(input: &str) -> String {
    let s = normalise_line_endings(input);
    let s = remove_invisible_chars(&s);
    let s = strip_outer_fences(&s);
    match s.find('<') {
        Some(pos) => s[pos..].trim_end().to_string(),
        None => s.trim().to_string(),
    }
}

// ── Rule: normalise line endings ──────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

// ── Rule: strip invisible Unicode ─────────────────────────────────────────

static RE_INVISIBLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\x{FEFF}\x{200B}\x{200C}\x{200D}\x{2060}\x{00AD}]").unwrap());

fn remove_invisible_chars(input: &str) -> String {
    RE_INVISIBLE.replace_all(input, "").to_string()
}

// ── Rule: strip outer fences ──────────────────────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)^```[A-Za-z]*[ \t]*\n(.*?)\n?```\s*$").unwrap()
});

fn strip_outer_fences(input: &str) -> String {
    let trimmed = input.trim();
    if let Some(caps) = RE_OUTER_FENCES.captures(trimmed) {
        caps[1].trim().to_string()
    } else {
        trimmed.to_string()
    }
}

// ── JSON recovery ─────────────────────────────────────────────────────────

/// Parse `input` as a JSON object, falling back to the outermost `{...}`
/// span when the model wrapped the object in prose.
fn parse_json_object(input: &str) -> Option<Value> {
    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(input) {
        return Some(value);
    }
    let start = input.find('{')?;
    let end = input.rfind('}')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str::<Value>(&input[start..=end]) {
        Ok(value @ Value::Object(_)) => Some(value),
        _ => None,
    }
}

fn preview(s: &str) -> String {
    let head: String = s.chars().take(80).collect();
    if head.len() < s.len() {
        format!("{head}...")
    } else {
        head
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_object_parses() {
        let html = parse_html_payload(r#"{"html": "<html><body><p>Hi</p></body></html>"}"#).unwrap();
        assert_eq!(html, "<html><body><p>Hi</p></body></html>");
    }

    #[test]
    fn fenced_object_parses() {
        let raw = "```json\r\n{\"html\": \"<p>x</p>\"}\r\n```\r\n";
        assert_eq!(parse_html_payload(raw).unwrap(), "<p>x</p>");
    }

    #[test]
    fn object_inside_prose_is_recovered() {
        let raw = "Here is the book:\n{\"html\": \"<p>y</p>\"}\nEnjoy!";
        assert_eq!(parse_html_payload(raw).unwrap(), "<p>y</p>");
    }

    #[test]
    fn fenced_markup_inside_the_field_is_unwrapped() {
        let raw = r#"{"html": "```html\n<!DOCTYPE html><html></html>\n```"}"#;
        assert_eq!(parse_html_payload(raw).unwrap(), "<!DOCTYPE html><html></html>");
    }

    #[test]
    fn bom_and_zero_width_are_removed() {
        let raw = "\u{FEFF}{\"html\": \"<p>a\u{200B}b</p>\"}";
        assert_eq!(parse_html_payload(raw).unwrap(), "<p>ab</p>");
    }

    #[test]
    fn missing_field_is_malformed() {
        let err = parse_html_payload(r#"{"markup": "<p/>"}"#).unwrap_err();
        assert!(matches!(err, Pdf2EpubError::MalformedResponse { .. }));
    }

    #[test]
    fn non_string_field_is_malformed() {
        let err = parse_html_payload(r#"{"html": 42}"#).unwrap_err();
        assert!(matches!(err, Pdf2EpubError::MalformedResponse { .. }));
    }

    #[test]
    fn empty_field_is_malformed() {
        let err = parse_html_payload(r#"{"html": "   "}"#).unwrap_err();
        assert!(matches!(err, Pdf2EpubError::MalformedResponse { .. }));
    }

    #[test]
    fn plain_text_is_malformed() {
        let err = parse_html_payload("OK").unwrap_err();
        assert!(matches!(err, Pdf2EpubError::MalformedResponse { .. }));
    }

    #[test]
    fn clean_markup_drops_leading_prose() {
        assert_eq!(clean_markup("Sure!\n<html></html>\n"), "<html></html>");
    }

    #[test]
    fn clean_response_keeps_unfenced_text() {
        assert_eq!(clean_response("  {\"a\":1}\r\n"), "{\"a\":1}");
    }
}
