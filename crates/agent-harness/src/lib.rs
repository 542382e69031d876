//! Agent Harness - execution engine for CLI AI agents
//!
//! This crate drives third-party command-line agents as interchangeable
//! backends: it builds the argv for a configured backend and role, launches
//! the process in its own process group, feeds the prompt over stdin, races
//! the output against independent total and silence timeouts, tears the whole
//! process tree down on failure, and normalizes stdout/stderr into one
//! response shape.

mod backend;
mod command;
mod error;
mod parser;
mod process;
mod runner;
mod watchdog;

pub use backend::{backend_for, AgentBackend, RecoveryContext};
pub use command::BuiltCommand;
pub use error::{HarnessError, Result, TimeoutKind};
pub use parser::{parse, ParserError};
pub use runner::{AgentRunner, CancelToken};
