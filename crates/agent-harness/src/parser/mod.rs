//! Output parsers for agent backend families

use thiserror::Error;

use harness_core::{BackendFamily, NormalizedResponse};

mod stream_json;

/// Longest stderr excerpt carried into response metadata
pub(crate) const STDERR_EXCERPT_MAX: usize = 2000;

/// Failure to turn raw agent output into a normalized response
#[derive(Debug, Error)]
pub enum ParserError {
    /// Stdout was empty or whitespace only
    #[error("Agent produced no output on stdout")]
    EmptyStdout,

    /// Stdout was not valid JSON in any accepted shape
    #[error("Agent output is not valid JSON: {0}")]
    MalformedOutput(String),

    /// The output decoded to an empty event list
    #[error("Agent output contained no events")]
    NoEvents,

    /// Events decoded but none carried usable content
    #[error("Agent output contained no usable content")]
    NoUsableContent,
}

/// Parse raw agent output for the given backend family
///
/// `stderr` is never parsed; it only feeds diagnostic metadata and the
/// fallback content used when stdout carries an error with no message.
pub fn parse(
    family: BackendFamily,
    stdout: &str,
    stderr: &str,
) -> Result<NormalizedResponse, ParserError> {
    match family {
        BackendFamily::StreamJson => stream_json::parse(stdout, stderr),
        BackendFamily::Plain => parse_plain(stdout, stderr),
    }
}

/// Parse output from backends that print a plain-text answer
fn parse_plain(stdout: &str, stderr: &str) -> Result<NormalizedResponse, ParserError> {
    let content = stdout.trim();
    if content.is_empty() {
        return Err(ParserError::EmptyStdout);
    }

    let mut response = NormalizedResponse::new(content);
    response
        .metadata
        .insert("raw".to_string(), serde_json::Value::String(stdout.to_string()));
    response
        .metadata
        .insert("is_error".to_string(), serde_json::Value::Bool(false));
    if let Some(excerpt) = stderr_excerpt(stderr) {
        response
            .metadata
            .insert("stderr".to_string(), serde_json::Value::String(excerpt));
    }
    Ok(response)
}

/// Trimmed, length-capped stderr for metadata; None when stderr is blank
pub(crate) fn stderr_excerpt(stderr: &str) -> Option<String> {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(truncate(trimmed, STDERR_EXCERPT_MAX))
    }
}

/// Truncate to at most `max` bytes on a char boundary, marking the cut
pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}
