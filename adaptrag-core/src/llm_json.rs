//! Tolerant parsing of structured model output.
//!
//! Judge, rewrite and routing prompts ask for JSON, but models wrap it in
//! markdown fences or prose. Every parser here returns `None` on failure so
//! the caller can fall back deterministically.

use regex::Regex;
use serde::de::DeserializeOwned;
use std::sync::LazyLock;

static NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-?\d+(?:\.\d+)?").expect("valid number regex"));

/// Extract the outermost `{ ... }` span from a response.
///
/// Slicing at `find('{')`/`rfind('}')` is safe because both are single-byte
/// ASCII characters.
pub fn extract_json_object(response: &str) -> Option<&str> {
    let start = response.find('{')?;
    let end = response.rfind('}')?;
    (end > start).then(|| &response[start..=end])
}

/// Deserialize the first JSON object in a model response.
pub fn parse_json<T: DeserializeOwned>(response: &str) -> Option<T> {
    serde_json::from_str(extract_json_object(response)?).ok()
}

/// Read a `[0, 1]` score from a model response.
///
/// Accepts `{"score": 0.7}`, `{"relevance": 0.7}` or a bare number. Values
/// on a 0-10 or 0-100 scale are normalised. Anything else is `None`.
pub fn parse_score(response: &str) -> Option<f32> {
    if let Some(value) = parse_json::<serde_json::Value>(response) {
        for key in ["score", "relevance", "relevance_score"] {
            if let Some(v) = value.get(key).and_then(|v| v.as_f64()) {
                return normalise_score(v);
            }
        }
        return None;
    }
    let trimmed = response.trim();
    let m = NUMBER_RE.find(trimmed)?;
    // A bare answer only; a number buried in prose is too ambiguous.
    if trimmed.len() > m.as_str().len() + 16 {
        return None;
    }
    normalise_score(m.as_str().parse::<f64>().ok()?)
}

fn normalise_score(v: f64) -> Option<f32> {
    if !v.is_finite() || v < 0.0 {
        return None;
    }
    let scaled = if v <= 1.0 {
        v
    } else if v <= 10.0 {
        v / 10.0
    } else if v <= 100.0 {
        v / 100.0
    } else {
        return None;
    };
    Some(scaled as f32)
}

/// Truncate to at most `max_chars` characters, on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Strip quotes and markdown a model may wrap around a one-line answer.
pub fn clean_line(response: &str) -> String {
    let line = response
        .trim()
        .trim_start_matches("```")
        .trim_end_matches("```")
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("");
    line.trim_matches(|c| c == '"' || c == '\'' || c == '`')
        .trim()
        .to_string()
}
