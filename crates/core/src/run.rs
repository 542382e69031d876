//! Run requests and results

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::{BackendFamily, RoleSpec};

/// One agent invocation
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Role whose argv fragment is appended to the command
    pub role: RoleSpec,
    /// Prompt text fed to the agent on stdin
    pub prompt: String,
    /// Instruction text spliced into argv by families that support injection
    pub system_prompt: Option<String>,
    /// Accepted for interface parity; already embedded into `prompt` upstream
    pub files: Vec<PathBuf>,
    /// Accepted for interface parity; already embedded into `prompt` upstream
    pub images: Vec<PathBuf>,
}

impl RunRequest {
    /// Create a request for the given role and prompt
    pub fn new(role: RoleSpec, prompt: impl Into<String>) -> Self {
        Self {
            role,
            prompt: prompt.into(),
            system_prompt: None,
            files: Vec::new(),
            images: Vec::new(),
        }
    }

    /// Set the system prompt
    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    /// Set the file references
    pub fn with_files(mut self, files: Vec<PathBuf>) -> Self {
        self.files = files;
        self
    }

    /// Set the image references
    pub fn with_images(mut self, images: Vec<PathBuf>) -> Self {
        self.images = images;
        self
    }
}

/// Normalized agent response: primary content plus ordered metadata
///
/// `content` is never empty; a parse that cannot produce content fails
/// instead. `metadata` preserves insertion order and carries the raw payload,
/// error flag, usage/cost figures, identifiers and the stderr excerpt under
/// stable keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedResponse {
    pub content: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl NormalizedResponse {
    /// Create a response with empty metadata
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            metadata: Map::new(),
        }
    }

    /// Whether the backend flagged this response as an error
    pub fn is_error(&self) -> bool {
        self.metadata
            .get("is_error")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Session identifier reported by the backend, if any
    pub fn session_id(&self) -> Option<&str> {
        self.metadata.get("session_id").and_then(Value::as_str)
    }
}

/// Result of one successful run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOutput {
    /// Parsed response
    pub response: NormalizedResponse,
    /// Argv as executed, with the system-prompt value masked
    pub argv: Vec<String>,
    /// Exit code of the agent process
    pub exit_code: i32,
    /// Raw stdout after output-file substitution
    pub stdout: String,
    /// Raw stderr
    pub stderr: String,
    /// Wall-clock duration of the run
    pub duration_ms: u64,
    /// Family that parsed the output
    pub family: BackendFamily,
    /// Content of the output file when one was configured and produced
    pub file_content: Option<String>,
    /// When the run finished
    pub completed_at: DateTime<Utc>,
}

impl AgentOutput {
    /// Assemble a result record, stamping the completion time
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        response: NormalizedResponse,
        argv: Vec<String>,
        exit_code: i32,
        stdout: String,
        stderr: String,
        duration: Duration,
        family: BackendFamily,
        file_content: Option<String>,
    ) -> Self {
        Self {
            response,
            argv,
            exit_code,
            stdout,
            stderr,
            duration_ms: duration.as_millis() as u64,
            family,
            file_content,
            completed_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builders() {
        let request = RunRequest::new(RoleSpec::bare("reviewer"), "look at this diff")
            .with_system_prompt("be brief")
            .with_files(vec![PathBuf::from("a.rs")]);

        assert_eq!(request.role.name, "reviewer");
        assert_eq!(request.prompt, "look at this diff");
        assert_eq!(request.system_prompt.as_deref(), Some("be brief"));
        assert_eq!(request.files.len(), 1);
        assert!(request.images.is_empty());
    }

    #[test]
    fn test_response_error_flag() {
        let mut response = NormalizedResponse::new("fine");
        assert!(!response.is_error());

        response
            .metadata
            .insert("is_error".to_string(), Value::Bool(true));
        assert!(response.is_error());
    }

    #[test]
    fn test_response_session_id() {
        let mut response = NormalizedResponse::new("fine");
        assert!(response.session_id().is_none());

        response.metadata.insert(
            "session_id".to_string(),
            Value::String("abc-123".to_string()),
        );
        assert_eq!(response.session_id(), Some("abc-123"));
    }

    #[test]
    fn test_output_duration_ms() {
        let output = AgentOutput::new(
            NormalizedResponse::new("done"),
            vec!["agent".to_string()],
            0,
            "done".to_string(),
            String::new(),
            Duration::from_millis(1234),
            BackendFamily::Plain,
            None,
        );

        assert_eq!(output.duration_ms, 1234);
        assert_eq!(output.exit_code, 0);
        assert!(output.file_content.is_none());
    }
}
