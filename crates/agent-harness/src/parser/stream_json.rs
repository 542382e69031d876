//! Normalization for backends that emit structured JSON output
//!
//! Accepts three wire shapes on stdout: one JSON document, a JSON array of
//! objects, and NDJSON (one JSON value per line). All three are folded into a
//! single payload object, then content and metadata are extracted from it the
//! same way regardless of the original shape.

use serde_json::{Map, Value};
use tracing::debug;

use harness_core::NormalizedResponse;

use super::{stderr_excerpt, ParserError};

/// Event type marking the start of a streamed response
const EVENT_STREAM_START: &str = "stream-start";

/// Event type carrying one incremental text fragment
const EVENT_TEXT_DELTA: &str = "text-delta";

/// Event type marking the end of a streamed response
const EVENT_STREAM_STOP: &str = "stream-stop";

pub(super) fn parse(stdout: &str, stderr: &str) -> Result<NormalizedResponse, ParserError> {
    if stdout.trim().is_empty() {
        return Err(ParserError::EmptyStdout);
    }

    let (payload, events) = match serde_json::from_str::<Value>(stdout) {
        Ok(Value::Array(items)) => (select_from_array(items)?, None),
        Ok(value) => (value, None),
        Err(first_err) => {
            debug!(error = %first_err, "stdout is not a single JSON value, trying NDJSON");
            let events = parse_ndjson(stdout)?;
            let payload = aggregate_events(&events);
            (payload, Some(events))
        }
    };

    let content = extract_content(&payload, stderr)?;
    let metadata = build_metadata(&payload, events, stderr);

    Ok(NormalizedResponse { content, metadata })
}

/// Parse stdout as newline-delimited JSON, one value per non-blank line
fn parse_ndjson(stdout: &str) -> Result<Vec<Value>, ParserError> {
    let mut events = Vec::new();
    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let value = serde_json::from_str::<Value>(line)
            .map_err(|e| ParserError::MalformedOutput(e.to_string()))?;
        events.push(value);
    }
    if events.is_empty() {
        return Err(ParserError::NoEvents);
    }
    Ok(events)
}

/// Fold an NDJSON event stream into one payload object
///
/// The terminal event is the last `stream-stop` if one exists, else the last
/// event. Text is gathered from `text-delta` fragments in arrival order, or,
/// when there are none, from the text blocks of an initial `stream-start`
/// event. The gathered text is injected as a synthetic `message` field on a
/// copy of the terminal event so downstream extraction treats every shape
/// uniformly. Unrecognized event types contribute nothing.
fn aggregate_events(events: &[Value]) -> Value {
    let terminal = events
        .iter()
        .filter(|e| event_type(e) == Some(EVENT_STREAM_STOP))
        .next_back()
        .or_else(|| events.last())
        .cloned()
        .unwrap_or(Value::Null);

    let mut text = String::new();
    for event in events {
        if event_type(event) == Some(EVENT_TEXT_DELTA) {
            if let Some(fragment) = event.get("text").and_then(Value::as_str) {
                text.push_str(fragment);
            }
        }
    }

    if text.is_empty() {
        if let Some(start) = events
            .iter()
            .find(|e| event_type(e) == Some(EVENT_STREAM_START))
        {
            text = start_event_text(start);
        }
    }

    let mut payload = match terminal {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    };
    if !text.is_empty() {
        payload.insert("message".to_string(), Value::String(text));
    }
    Value::Object(payload)
}

/// Join the text blocks nested under a stream-start event's message content
fn start_event_text(event: &Value) -> String {
    let blocks = match event
        .pointer("/message/content")
        .and_then(Value::as_array)
    {
        Some(blocks) => blocks,
        None => return String::new(),
    };
    let texts: Vec<&str> = blocks
        .iter()
        .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|b| b.get("text").and_then(Value::as_str))
        .filter(|t| !t.trim().is_empty())
        .collect();
    texts.join("\n")
}

/// Pick the payload object out of a JSON-array response
///
/// A terminal `result` object beats an `assistant` turn beats the plain last
/// element: an explicit summary outranks incidental conversational turns.
fn select_from_array(items: Vec<Value>) -> Result<Value, ParserError> {
    if items.is_empty() {
        return Err(ParserError::NoEvents);
    }
    let chosen = items
        .iter()
        .filter(|v| event_type(v) == Some("result"))
        .next_back()
        .or_else(|| {
            items
                .iter()
                .filter(|v| event_type(v) == Some("assistant"))
                .next_back()
        })
        .or_else(|| items.last());
    Ok(chosen.cloned().unwrap_or(Value::Null))
}

fn event_type(value: &Value) -> Option<&str> {
    value.get("type").and_then(Value::as_str)
}

/// Extract the primary textual content from the chosen payload
fn extract_content(payload: &Value, stderr: &str) -> Result<String, ParserError> {
    match payload.get("result") {
        Some(Value::String(s)) if !s.trim().is_empty() => {
            return Ok(s.trim().to_string());
        }
        Some(Value::Array(parts)) => {
            let lines: Vec<&str> = parts
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .collect();
            if !lines.is_empty() {
                return Ok(lines.join("\n"));
            }
        }
        _ => {}
    }

    if let Some(message) = payload.get("message").and_then(Value::as_str) {
        let trimmed = message.trim();
        if !trimmed.is_empty() {
            return Ok(trimmed.to_string());
        }
    }

    if let Some(error_message) = payload.pointer("/error/message").and_then(Value::as_str) {
        let trimmed = error_message.trim();
        if !trimmed.is_empty() {
            return Ok(trimmed.to_string());
        }
    }

    if let Some(excerpt) = stderr_excerpt(stderr) {
        debug!("no content in payload, falling back to stderr diagnostic");
        return Ok(format!("Agent reported an error: {}", excerpt));
    }

    Err(ParserError::NoUsableContent)
}

/// Populate the ordered metadata map from the payload and stderr
fn build_metadata(payload: &Value, events: Option<Vec<Value>>, stderr: &str) -> Map<String, Value> {
    let mut metadata = Map::new();

    metadata.insert("raw".to_string(), payload.clone());
    let is_error = payload
        .get("is_error")
        .and_then(Value::as_bool)
        .unwrap_or_else(|| payload.get("error").map_or(false, |e| !e.is_null()));
    metadata.insert("is_error".to_string(), Value::Bool(is_error));

    for key in ["type", "subtype"] {
        if let Some(tag) = payload.get(key).and_then(Value::as_str) {
            metadata.insert(key.to_string(), Value::String(tag.to_string()));
        }
    }

    for key in ["duration_ms", "duration_api_ms"] {
        if let Some(figure) = payload.get(key).filter(|v| v.is_number()) {
            metadata.insert(key.to_string(), figure.clone());
        }
    }

    if let Some(usage) = payload.get("usage").filter(|v| !v.is_null()) {
        metadata.insert("usage".to_string(), usage.clone());
    }
    if let Some(cost) = payload.get("total_cost_usd").filter(|v| v.is_number()) {
        metadata.insert("total_cost_usd".to_string(), cost.clone());
    }

    // The per-model usage map is keyed by model name; its first key names the
    // model that served the run.
    if let Some(model_usage) = payload.get("modelUsage").and_then(Value::as_object) {
        if let Some(model) = model_usage.keys().next() {
            metadata.insert("model".to_string(), Value::String(model.clone()));
        }
    }

    if let Some(denials) = payload.get("permission_denials").and_then(Value::as_array) {
        if !denials.is_empty() {
            metadata.insert(
                "permission_denials".to_string(),
                Value::Array(denials.clone()),
            );
        }
    }

    for key in ["session_id", "uuid"] {
        if let Some(id) = payload.get(key).and_then(Value::as_str) {
            metadata.insert(key.to_string(), Value::String(id.to_string()));
        }
    }

    if let Some(excerpt) = stderr_excerpt(stderr) {
        metadata.insert("stderr".to_string(), Value::String(excerpt));
    }

    if let Some(events) = events {
        metadata.insert("num_events".to_string(), Value::from(events.len()));
        metadata.insert("events".to_string(), Value::Array(events));
    }

    metadata
}
