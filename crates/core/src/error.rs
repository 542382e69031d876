//! Error types for the configuration model

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Unknown backend family: {0}")]
    UnknownFamily(String),

    #[error("Backend '{0}' has no executable configured")]
    MissingExecutable(String),

    #[error("Output-file template '{template}' does not contain the '{placeholder}' placeholder")]
    BadOutputTemplate {
        template: String,
        placeholder: &'static str,
    },

    #[error("Backend '{backend}' has a zero {which} timeout")]
    ZeroTimeout {
        backend: String,
        which: &'static str,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
