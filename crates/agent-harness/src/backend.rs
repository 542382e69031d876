//! Per-family command building and error recovery

use std::time::Duration;

use tracing::{debug, info};

use harness_core::{AgentOutput, BackendConfig, BackendFamily, RoleSpec};

use crate::command::{self, BuiltCommand};
use crate::parser;

/// Flag used to inject an instruction text into the agent's system prompt
const SYSTEM_PROMPT_FLAG: &str = "--append-system-prompt";

/// Everything a recovery hook gets to see about a non-zero exit
#[derive(Debug, Clone, Copy)]
pub struct RecoveryContext<'a> {
    pub exit_code: i32,
    pub stdout: &'a str,
    pub stderr: &'a str,
    pub sanitized_argv: &'a [String],
    pub duration: Duration,
    pub file_content: Option<&'a str>,
}

/// Capability set of one backend family
///
/// The default method bodies are the fallback behavior: plain argv
/// concatenation and no recovery. Families override only what they do
/// differently.
pub trait AgentBackend: Send + Sync {
    /// Assemble the argv for a run
    fn build_command(
        &self,
        config: &BackendConfig,
        role: &RoleSpec,
        system_prompt: Option<&str>,
    ) -> BuiltCommand {
        let _ = system_prompt;
        command::build(config, role)
    }

    /// Offered the run when the process exits non-zero; `Some` reclassifies
    /// the exit as success
    fn recover_from_error(
        &self,
        config: &BackendConfig,
        ctx: &RecoveryContext<'_>,
    ) -> Option<AgentOutput> {
        let _ = (config, ctx);
        None
    }
}

/// Family for agents emitting structured JSON/NDJSON output
///
/// Splices the system prompt into argv and can salvage runs where the agent
/// exits non-zero over a partial or permission-level failure while still
/// printing a fully usable payload.
pub struct StreamJsonBackend;

impl AgentBackend for StreamJsonBackend {
    fn build_command(
        &self,
        config: &BackendConfig,
        role: &RoleSpec,
        system_prompt: Option<&str>,
    ) -> BuiltCommand {
        command::build_with_system_prompt(config, role, SYSTEM_PROMPT_FLAG, system_prompt)
    }

    fn recover_from_error(
        &self,
        config: &BackendConfig,
        ctx: &RecoveryContext<'_>,
    ) -> Option<AgentOutput> {
        match parser::parse(BackendFamily::StreamJson, ctx.stdout, ctx.stderr) {
            Ok(response) => {
                info!(
                    backend = %config.display_name,
                    exit_code = ctx.exit_code,
                    "non-zero exit but output parsed, recovering run"
                );
                Some(AgentOutput::new(
                    response,
                    ctx.sanitized_argv.to_vec(),
                    ctx.exit_code,
                    ctx.stdout.to_string(),
                    ctx.stderr.to_string(),
                    ctx.duration,
                    BackendFamily::StreamJson,
                    ctx.file_content.map(str::to_string),
                ))
            }
            Err(e) => {
                debug!(
                    backend = %config.display_name,
                    exit_code = ctx.exit_code,
                    error = %e,
                    "no recovery, output unusable"
                );
                None
            }
        }
    }
}

/// Family for agents that print an unstructured text answer
pub struct PlainBackend;

impl AgentBackend for PlainBackend {}

/// Select the backend implementation for a family
pub fn backend_for(family: BackendFamily) -> Box<dyn AgentBackend> {
    match family {
        BackendFamily::StreamJson => Box::new(StreamJsonBackend),
        BackendFamily::Plain => Box::new(PlainBackend),
    }
}
