//! Backend and role configuration
//!
//! These types are resolved by the embedding application, which knows how to
//! map a backend or role name onto concrete values. The engine itself only
//! reads them; nothing here is mutated after construction.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default wall-clock budget for one run, in seconds
pub const DEFAULT_TOTAL_TIMEOUT_SECS: u64 = 1800;

/// Default allowed gap without output on either stream, in seconds
pub const DEFAULT_SILENCE_TIMEOUT_SECS: u64 = 300;

/// Placeholder an output-file flag template must contain
pub const OUTPUT_PATH_PLACEHOLDER: &str = "{path}";

/// Command-building and output-parsing strategy shared by a class of agents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendFamily {
    /// Agents emitting one JSON document, a JSON array, or NDJSON events
    StreamJson,
    /// Agents emitting unstructured text on stdout
    Plain,
}

impl BackendFamily {
    /// Parse a backend family from its configuration name
    pub fn from_str(s: &str) -> Result<Self, ConfigError> {
        match s.to_lowercase().as_str() {
            "stream-json" => Ok(Self::StreamJson),
            "plain" | "text" => Ok(Self::Plain),
            _ => Err(ConfigError::UnknownFamily(s.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StreamJson => "stream-json",
            Self::Plain => "plain",
        }
    }
}

/// Directive to collect the agent's primary output through a file
///
/// Some agents truncate or pollute stdout; configuring this makes the engine
/// reserve a unique temp path, hand it to the agent through a rendered flag,
/// and substitute the file content for an empty stdout after the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputFileSpec {
    /// Flag template appended to argv, e.g. `--output-file={path}`
    pub flag_template: String,
    /// Delete the temp file once the run has been finalized
    #[serde(default = "default_cleanup")]
    pub cleanup: bool,
}

impl OutputFileSpec {
    /// Render the flag for a concrete temp file path
    pub fn render(&self, path: &Path) -> Result<String, ConfigError> {
        if !self.flag_template.contains(OUTPUT_PATH_PLACEHOLDER) {
            return Err(ConfigError::BadOutputTemplate {
                template: self.flag_template.clone(),
                placeholder: OUTPUT_PATH_PLACEHOLDER,
            });
        }
        Ok(self
            .flag_template
            .replace(OUTPUT_PATH_PLACEHOLDER, &path.to_string_lossy()))
    }
}

/// A named role selecting persona/system behavior via extra argv elements
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleSpec {
    pub name: String,
    /// Argv fragment appended after the backend's configured args
    #[serde(default)]
    pub args: Vec<String>,
}

impl RoleSpec {
    /// Create a role with its argv fragment
    pub fn new(name: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }

    /// Create a role that adds no arguments
    pub fn bare(name: impl Into<String>) -> Self {
        Self::new(name, Vec::new())
    }
}

/// Resolved configuration for one CLI agent backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Human-readable name used in logs and errors
    pub display_name: String,
    /// Resolved executable path
    pub executable: String,
    /// Args that always directly follow the executable
    #[serde(default)]
    pub fixed_args: Vec<String>,
    /// Deployment-specific args appended after the fixed args
    #[serde(default)]
    pub config_args: Vec<String>,
    /// Environment overrides applied on top of the parent environment
    #[serde(default)]
    pub env: Vec<(String, String)>,
    /// Working directory for the agent process
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Wall-clock budget for the whole run
    #[serde(default = "default_total_timeout")]
    pub total_timeout_secs: u64,
    /// Allowed gap without output on either stream
    #[serde(default = "default_silence_timeout")]
    pub silence_timeout_secs: u64,
    /// Optional output-file directive
    #[serde(default)]
    pub output_file: Option<OutputFileSpec>,
    /// Parsing/command strategy for this backend
    pub family: BackendFamily,
}

impl BackendConfig {
    /// Create a configuration with default timeouts and no extra args
    pub fn new(
        display_name: impl Into<String>,
        executable: impl Into<String>,
        family: BackendFamily,
    ) -> Self {
        Self {
            display_name: display_name.into(),
            executable: executable.into(),
            fixed_args: Vec::new(),
            config_args: Vec::new(),
            env: Vec::new(),
            working_dir: None,
            total_timeout_secs: DEFAULT_TOTAL_TIMEOUT_SECS,
            silence_timeout_secs: DEFAULT_SILENCE_TIMEOUT_SECS,
            output_file: None,
            family,
        }
    }

    /// Set the fixed args
    pub fn with_fixed_args(mut self, args: Vec<String>) -> Self {
        self.fixed_args = args;
        self
    }

    /// Set the deployment args
    pub fn with_config_args(mut self, args: Vec<String>) -> Self {
        self.config_args = args;
        self
    }

    /// Add one environment override
    pub fn with_env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Set the working directory
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Set both timeouts, in seconds
    pub fn with_timeouts(mut self, total_secs: u64, silence_secs: u64) -> Self {
        self.total_timeout_secs = total_secs;
        self.silence_timeout_secs = silence_secs;
        self
    }

    /// Set the output-file directive
    pub fn with_output_file(mut self, spec: OutputFileSpec) -> Self {
        self.output_file = Some(spec);
        self
    }

    /// Load a configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let file = File::open(path.as_ref())?;
        let reader = BufReader::new(file);
        let config: Self = serde_json::from_reader(reader)?;
        Ok(config)
    }

    /// Check the configuration for errors that would make every run fail
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.executable.trim().is_empty() {
            return Err(ConfigError::MissingExecutable(self.display_name.clone()));
        }
        if self.total_timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout {
                backend: self.display_name.clone(),
                which: "total",
            });
        }
        if self.silence_timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout {
                backend: self.display_name.clone(),
                which: "silence",
            });
        }
        if let Some(spec) = &self.output_file {
            if !spec.flag_template.contains(OUTPUT_PATH_PLACEHOLDER) {
                return Err(ConfigError::BadOutputTemplate {
                    template: spec.flag_template.clone(),
                    placeholder: OUTPUT_PATH_PLACEHOLDER,
                });
            }
        }
        Ok(())
    }

    /// Wall-clock budget as a [`Duration`]
    pub fn total_timeout(&self) -> Duration {
        Duration::from_secs(self.total_timeout_secs)
    }

    /// Silence budget as a [`Duration`]
    pub fn silence_timeout(&self) -> Duration {
        Duration::from_secs(self.silence_timeout_secs)
    }
}

fn default_cleanup() -> bool {
    true
}

fn default_total_timeout() -> u64 {
    DEFAULT_TOTAL_TIMEOUT_SECS
}

fn default_silence_timeout() -> u64 {
    DEFAULT_SILENCE_TIMEOUT_SECS
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_family_from_str() {
        assert_eq!(
            BackendFamily::from_str("stream-json").unwrap(),
            BackendFamily::StreamJson
        );
        assert_eq!(
            BackendFamily::from_str("Plain").unwrap(),
            BackendFamily::Plain
        );
        assert_eq!(
            BackendFamily::from_str("text").unwrap(),
            BackendFamily::Plain
        );
    }

    #[test]
    fn test_family_from_str_unknown() {
        let err = BackendFamily::from_str("xml-rpc").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownFamily(name) if name == "xml-rpc"));
    }

    #[test]
    fn test_family_as_str_round_trip() {
        for family in [BackendFamily::StreamJson, BackendFamily::Plain] {
            assert_eq!(BackendFamily::from_str(family.as_str()).unwrap(), family);
        }
    }

    #[test]
    fn test_render_output_flag() {
        let spec = OutputFileSpec {
            flag_template: "--output-file={path}".to_string(),
            cleanup: true,
        };
        let flag = spec.render(Path::new("/tmp/out.json")).unwrap();
        assert_eq!(flag, "--output-file=/tmp/out.json");
    }

    #[test]
    fn test_render_missing_placeholder() {
        let spec = OutputFileSpec {
            flag_template: "--output-file=fixed.json".to_string(),
            cleanup: true,
        };
        let err = spec.render(Path::new("/tmp/out.json")).unwrap_err();
        assert!(matches!(err, ConfigError::BadOutputTemplate { .. }));
    }

    #[test]
    fn test_validate_ok() {
        let config = BackendConfig::new("agent", "/usr/bin/agent", BackendFamily::StreamJson);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_missing_executable() {
        let config = BackendConfig::new("agent", "  ", BackendFamily::Plain);
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::MissingExecutable(name) if name == "agent"));
    }

    #[test]
    fn test_validate_zero_timeout() {
        let config =
            BackendConfig::new("agent", "agent", BackendFamily::Plain).with_timeouts(0, 30);
        assert!(matches!(
            config.validate().unwrap_err(),
            ConfigError::ZeroTimeout { which: "total", .. }
        ));

        let config =
            BackendConfig::new("agent", "agent", BackendFamily::Plain).with_timeouts(30, 0);
        assert!(matches!(
            config.validate().unwrap_err(),
            ConfigError::ZeroTimeout {
                which: "silence",
                ..
            }
        ));
    }

    #[test]
    fn test_validate_bad_output_template() {
        let config = BackendConfig::new("agent", "agent", BackendFamily::StreamJson)
            .with_output_file(OutputFileSpec {
                flag_template: "--out".to_string(),
                cleanup: false,
            });
        assert!(matches!(
            config.validate().unwrap_err(),
            ConfigError::BadOutputTemplate { .. }
        ));
    }

    #[test]
    fn test_from_file_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "display_name": "demo",
                "executable": "/usr/local/bin/demo",
                "fixed_args": ["--print", "--format", "json"],
                "family": "stream-json"
            }}"#
        )
        .unwrap();

        let config = BackendConfig::from_file(file.path()).unwrap();
        assert_eq!(config.display_name, "demo");
        assert_eq!(config.fixed_args.len(), 3);
        assert!(config.config_args.is_empty());
        assert!(config.env.is_empty());
        assert!(config.working_dir.is_none());
        assert!(config.output_file.is_none());
        assert_eq!(config.total_timeout_secs, DEFAULT_TOTAL_TIMEOUT_SECS);
        assert_eq!(config.silence_timeout_secs, DEFAULT_SILENCE_TIMEOUT_SECS);
        assert_eq!(config.family, BackendFamily::StreamJson);
    }

    #[test]
    fn test_from_file_missing() {
        let err = BackendConfig::from_file("/nonexistent/backend.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn test_timeout_durations() {
        let config =
            BackendConfig::new("agent", "agent", BackendFamily::Plain).with_timeouts(90, 15);
        assert_eq!(config.total_timeout(), Duration::from_secs(90));
        assert_eq!(config.silence_timeout(), Duration::from_secs(15));
    }
}
