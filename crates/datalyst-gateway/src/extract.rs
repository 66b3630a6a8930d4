//! Tolerant extraction of JSON from model replies.
//!
//! Models wrap structured output in markdown fences more often than not, and
//! sometimes pad it with prose. Extraction order: fenced block first, then
//! the outermost bracketed span, then the trimmed text as-is.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;

static FENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)```(?:json|python)?[ \t]*\r?\n?(.*?)```").expect("fence pattern")
});

/// Pull the most plausible JSON region out of a reply
#[must_use]
pub fn extract_json(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(captures) = FENCE.captures(trimmed) {
        if let Some(inner) = captures.get(1) {
            return inner.as_str().trim();
        }
    }
    if let Some(span) = bracketed_span(trimmed) {
        return span;
    }
    trimmed
}

/// Outermost `{...}` or `[...]` span, when the reply pads JSON with prose
fn bracketed_span(text: &str) -> Option<&str> {
    let open = text.find(['{', '['])?;
    let close_char = match text.as_bytes()[open] {
        b'{' => '}',
        _ => ']',
    };
    let close = text.rfind(close_char)?;
    if close > open {
        Some(text[open..=close].trim())
    } else {
        None
    }
}

/// Extract and deserialize in one step; the error string feeds retry logs
pub fn parse_json<T: DeserializeOwned>(text: &str) -> Result<T, String> {
    serde_json::from_str(extract_json(text)).map_err(|e| e.to_string())
}
