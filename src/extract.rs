//! Pulls the JSON payload out of a model's free-text reply.
//!
//! The model is asked for JSON only but routinely wraps it in prose or code
//! fences, so parsing runs in two stages: locate the first balanced `{...}`
//! object, then decode it against the expected schema.

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MalformedResponse {
    #[error("reply carried no text")]
    MissingText,
    #[error("no JSON object found in reply")]
    NoJsonObject,
    #[error("reply JSON does not parse: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("reply JSON does not match the expected shape: {0}")]
    SchemaMismatch(String),
}

/// Returns the first balanced top-level `{...}` substring. Braces inside
/// string literals are ignored.
///
/// An opening brace that never closes is skipped and the earliest brace
/// after it that does close wins. The text is walked once, so garbage made
/// of unclosed braces costs linear time.
pub fn first_json_object(text: &str) -> Option<&str> {
    let mut open: Vec<usize> = Vec::new();
    // Earliest-starting object closed so far while an outer brace is open.
    let mut earliest: Option<(usize, usize)> = None;
    let mut in_string = false;
    let mut escaped = false;

    for (index, ch) in text.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' if !open.is_empty() => in_string = true,
            '{' => open.push(index),
            '}' => {
                let Some(start) = open.pop() else {
                    continue;
                };
                let end = index + ch.len_utf8();
                if open.is_empty() {
                    return Some(&text[start..end]);
                }
                if earliest.is_none_or(|(best, _)| start < best) {
                    earliest = Some((start, end));
                }
            }
            _ => {}
        }
    }
    earliest.map(|(start, end)| &text[start..end])
}

/// Stage one and two together: find the object, check it is JSON, then
/// decode it into `T`.
pub fn parse_reply<T: DeserializeOwned>(text: &str) -> Result<T, MalformedResponse> {
    let candidate = first_json_object(text).ok_or(MalformedResponse::NoJsonObject)?;
    let value: Value = serde_json::from_str(candidate).map_err(MalformedResponse::InvalidJson)?;
    serde_json::from_value(value).map_err(|err| MalformedResponse::SchemaMismatch(err.to_string()))
}
