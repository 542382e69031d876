//! Core library for the agent harness
//!
//! This crate contains the shared data model, including:
//! - Backend and role configuration
//! - Run requests and results
//! - Configuration errors

pub mod config;
pub mod error;
pub mod run;

pub use config::{BackendConfig, BackendFamily, OutputFileSpec, RoleSpec};
pub use error::ConfigError;
pub use run::{AgentOutput, NormalizedResponse, RunRequest};

pub type Result<T> = std::result::Result<T, ConfigError>;
