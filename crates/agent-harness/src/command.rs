//! Command-line construction for agent backends

use harness_core::{BackendConfig, RoleSpec};

/// Placeholder shown instead of the system prompt in sanitized argv
const SYSTEM_PROMPT_MASK: &str = "[system-prompt]";

/// A fully assembled agent invocation
///
/// `argv` is what gets executed; `sanitized` is the same vector with secret
/// values masked, safe for logs and error reports.
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltCommand {
    /// Complete argument vector, executable first
    pub argv: Vec<String>,
    /// Log-safe copy of `argv` with sensitive values masked
    pub sanitized: Vec<String>,
}

/// Assemble the base argument vector for a backend and role
///
/// Order is fixed: executable, then the backend's fixed arguments, then its
/// configured extra arguments, then the role's arguments. Inputs are copied,
/// so repeated calls with the same configuration produce the same vector.
pub fn build(config: &BackendConfig, role: &RoleSpec) -> BuiltCommand {
    let mut argv = Vec::with_capacity(
        1 + config.fixed_args.len() + config.config_args.len() + role.args.len(),
    );
    argv.push(config.executable.clone());
    argv.extend(config.fixed_args.iter().cloned());
    argv.extend(config.config_args.iter().cloned());
    argv.extend(role.args.iter().cloned());

    let sanitized = argv.clone();
    BuiltCommand { argv, sanitized }
}

/// Assemble the argument vector, splicing in a system prompt flag
///
/// When `system_prompt` is present and `flag` is not already specified by the
/// backend's own arguments, `flag` and its value are inserted immediately
/// before the role arguments. If the backend already passes the flag (either
/// as a bare element or in `flag=value` form), the prompt is dropped rather
/// than duplicated.
pub fn build_with_system_prompt(
    config: &BackendConfig,
    role: &RoleSpec,
    flag: &str,
    system_prompt: Option<&str>,
) -> BuiltCommand {
    let prompt = match system_prompt {
        Some(p) => p,
        None => return build(config, role),
    };
    if has_flag(&config.fixed_args, flag) || has_flag(&config.config_args, flag) {
        return build(config, role);
    }

    let mut argv = Vec::with_capacity(
        3 + config.fixed_args.len() + config.config_args.len() + role.args.len(),
    );
    argv.push(config.executable.clone());
    argv.extend(config.fixed_args.iter().cloned());
    argv.extend(config.config_args.iter().cloned());

    let mut sanitized = argv.clone();
    argv.push(flag.to_string());
    argv.push(prompt.to_string());
    sanitized.push(flag.to_string());
    sanitized.push(SYSTEM_PROMPT_MASK.to_string());

    argv.extend(role.args.iter().cloned());
    sanitized.extend(role.args.iter().cloned());

    BuiltCommand { argv, sanitized }
}

fn has_flag(args: &[String], flag: &str) -> bool {
    let prefixed = format!("{}=", flag);
    args.iter().any(|a| a == flag || a.starts_with(&prefixed))
}
