//! # Response Parsing
//!
//! Helpers that turn raw response bodies into cacheable JSON payloads and
//! classify parse failures for the error list.

use serde_json::{Map as JsonMap, Value, error::Category};
use sluice_types::FailureKind;
use thiserror::Error;

/// Key used to wrap top-level array payloads.
pub const ARRAY_CONTAINER_KEY: &str = "values";

/// Parse a response body into JSON, providing detailed errors on failure.
///
/// The error carries the originating status and a truncated body preview so
/// logs are useful when an upstream returns HTML or a truncated document.
///
/// # Example
/// ```rust
/// use sluice_util::http::parse_response_json_strict;
///
/// assert!(parse_response_json_strict(r#"{"id": 1}"#, Some(200)).is_ok());
/// let error = parse_response_json_strict("<html>", Some(200)).unwrap_err();
/// assert!(error.body_preview().contains("<html>"));
/// ```
pub fn parse_response_json_strict(text: &str, status: Option<u16>) -> Result<Value, JsonParseError> {
    serde_json::from_str::<Value>(text).map_err(|error| {
        let status_note = status
            .map(|code| format!("status {code}"))
            .unwrap_or_else(|| "unknown status".to_string());
        let preview = truncate_response_preview(text, 200);

        JsonParseError::new(status_note, error, preview)
    })
}

/// Wrap array payloads in an object so the cache can treat every payload as
/// a keyed container.
///
/// ```rust
/// use serde_json::json;
/// use sluice_util::http::container_payload;
///
/// assert_eq!(container_payload(json!([1, 2])), json!({"values": [1, 2]}));
/// assert_eq!(container_payload(json!({"id": 3})), json!({"id": 3}));
/// ```
pub fn container_payload(payload: Value) -> Value {
    match payload {
        Value::Array(items) => {
            let mut container = JsonMap::new();
            container.insert(ARRAY_CONTAINER_KEY.to_string(), Value::Array(items));
            Value::Object(container)
        }
        other => other,
    }
}

fn truncate_response_preview(text: &str, limit: usize) -> String {
    if text.trim().is_empty() {
        return "<empty>".to_string();
    }

    let mut preview = String::new();
    for ch in text.chars() {
        if preview.len() >= limit {
            preview.push_str("...");
            break;
        }
        match ch {
            '\n' | '\r' | '\t' => {
                if !preview.ends_with(' ') {
                    preview.push(' ');
                }
            }
            _ => preview.push(ch),
        }
    }

    preview.trim().to_string()
}

/// Error returned when strict JSON parsing of a response fails.
#[derive(Debug, Error)]
#[error("failed to parse JSON response ({status_note}): {source}. body preview: {body_preview}")]
pub struct JsonParseError {
    status_note: String,
    #[source]
    source: serde_json::Error,
    body_preview: String,
}

impl JsonParseError {
    /// Create a new [`JsonParseError`] with contextual information.
    pub fn new(status_note: String, source: serde_json::Error, body_preview: String) -> Self {
        Self {
            status_note,
            source,
            body_preview,
        }
    }

    /// Access the truncated response preview captured during parsing.
    pub fn body_preview(&self) -> &str {
        &self.body_preview
    }

    /// Classify the failure for the error list.
    ///
    /// Syntax errors and truncated input are malformed payloads; anything the
    /// parser reports differently is left as unknown.
    pub fn failure_kind(&self) -> FailureKind {
        match self.source.classify() {
            Category::Syntax | Category::Eof => FailureKind::JsonMalformed,
            Category::Io | Category::Data => FailureKind::Unknown,
        }
    }
}
