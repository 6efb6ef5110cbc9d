//! Capture ingestion.
//!
//! Reads the recorded network exchanges produced by the browser capture step
//! into [`CapturedMessage`] values. Bodies are recorded either as JSON text or
//! inline JSON; both forms are accepted.

use crate::error::{ClooneyError, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;

/// Prefix the capture scripts use for bodies they could not decode as text.
const BINARY_BODY_PREFIX: &str = "[BINARY_CONTENT_BASE64]:";

/// One observed network exchange.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapturedMessage {
    pub method: String,
    pub url: String,
    pub request_body: Option<Value>,
    /// Header names are lower-cased.
    pub request_headers: BTreeMap<String, String>,
    pub status: Option<u16>,
    pub response_body: Option<Value>,
    pub response_headers: BTreeMap<String, String>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl CapturedMessage {
    pub fn request_header(&self, name: &str) -> Option<&str> {
        self.request_headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn response_header(&self, name: &str) -> Option<&str> {
        self.response_headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

#[derive(Deserialize)]
struct RawRecord {
    request: RawRequest,
    #[serde(default)]
    response: Option<RawResponse>,
    #[serde(default)]
    timestamp: Option<Value>,
}

#[derive(Deserialize)]
struct RawRequest {
    #[serde(default)]
    method: Option<String>,
    url: String,
    #[serde(default, alias = "postData", alias = "body")]
    post_data: Option<Value>,
    #[serde(default)]
    headers: Option<Value>,
}

#[derive(Deserialize)]
struct RawResponse {
    #[serde(default)]
    status: Option<Value>,
    #[serde(default)]
    body: Option<Value>,
    #[serde(default)]
    headers: Option<Value>,
}

/// Parse a capture document: a JSON array of `{request, response?, timestamp?}`.
pub fn parse_capture(text: &str) -> Result<Vec<CapturedMessage>> {
    let doc: Value = serde_json::from_str(text)
        .map_err(|e| ClooneyError::Parse(format!("capture is not valid JSON: {e}")))?;
    let Value::Array(items) = doc else {
        return Err(ClooneyError::Parse(
            "capture must be a JSON array of records".into(),
        ));
    };

    items
        .into_iter()
        .enumerate()
        .map(|(idx, item)| {
            let raw: RawRecord = serde_json::from_value(item)
                .map_err(|e| ClooneyError::Parse(format!("record {idx}: {e}")))?;
            Ok(convert(raw))
        })
        .collect()
}

/// Read and parse a capture file.
pub fn load_capture(path: &Path) -> Result<Vec<CapturedMessage>> {
    let text = std::fs::read_to_string(path)?;
    parse_capture(&text)
}

fn convert(raw: RawRecord) -> CapturedMessage {
    let (status, response_body, response_headers) = match raw.response {
        Some(resp) => (
            resp.status.as_ref().and_then(parse_status),
            resp.body.and_then(body_value),
            resp.headers.map(header_map).unwrap_or_default(),
        ),
        None => (None, None, BTreeMap::new()),
    };

    CapturedMessage {
        method: raw
            .request
            .method
            .unwrap_or_else(|| "GET".to_string())
            .to_ascii_uppercase(),
        url: raw.request.url,
        request_body: raw.request.post_data.and_then(body_value),
        request_headers: raw.request.headers.map(header_map).unwrap_or_default(),
        status,
        response_body,
        response_headers,
        timestamp: raw.timestamp.as_ref().and_then(parse_timestamp),
    }
}

fn parse_status(value: &Value) -> Option<u16> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Accepts RFC 3339 strings and Unix timestamps in seconds or milliseconds.
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => {
            let raw = n.as_f64()?;
            let millis = if raw > 1e11 { raw } else { raw * 1000.0 };
            DateTime::from_timestamp_millis(millis as i64)
        }
        _ => None,
    }
}

/// Headers arrive as an object map or as a HAR-style `[{name, value}]` list.
fn header_map(value: Value) -> BTreeMap<String, String> {
    let scalar = |v: &Value| match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    match value {
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), scalar(v)))
            .collect(),
        Value::Array(list) => list
            .iter()
            .filter_map(|entry| {
                let name = entry.get("name")?.as_str()?;
                let value = entry.get("value").map(scalar).unwrap_or_default();
                Some((name.to_ascii_lowercase(), value))
            })
            .collect(),
        _ => BTreeMap::new(),
    }
}

fn body_value(value: Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::String(text) => parse_body(&text),
        other => Some(other),
    }
}

/// Decode a textual body into JSON.
///
/// Empty, `null`, and binary placeholder bodies yield `None`. Bodies that do not
/// parse directly are searched for an embedded JSON object (at most two levels
/// of nesting), which covers JSON wrapped in HTML or JSONP padding.
pub fn parse_body(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed == "null" || trimmed.starts_with(BINARY_BODY_PREFIX) {
        return None;
    }
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }
    embedded_object_regex()
        .find(trimmed)
        .and_then(|m| serde_json::from_str(m.as_str()).ok())
}

fn embedded_object_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)\{[^{}]*(?:\{[^{}]*\}[^{}]*)*\}").expect("embedded object regex is valid")
    })
}

/// True for bodies carrying no structure: null, `{}`, `[]`, or `""`.
pub fn is_empty_body(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(list) => list.is_empty(),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}
