//! Agent process spawning and teardown

use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use harness_core::BackendConfig;

use crate::error::{HarnessError, Result};

/// How long to wait for the process to be reaped after a kill
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// A spawned agent process plus what teardown needs to know about it
#[derive(Debug)]
pub(crate) struct AgentProcess {
    pub child: Child,
    pub pid: Option<u32>,
    /// Whether the child was placed in its own process group
    pub group_mode: bool,
}

/// Spawn the agent with piped stdio, merged environment and working directory
///
/// On Unix the child is put in a new process group so the whole descendant
/// tree can be signaled together; elsewhere only the direct child can be
/// signaled.
pub(crate) fn spawn(config: &BackendConfig, argv: &[String]) -> Result<AgentProcess> {
    let (executable, args) = argv
        .split_first()
        .ok_or_else(|| HarnessError::spawn_failed("Empty argument vector"))?;

    let mut cmd = Command::new(executable);
    cmd.args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let Some(dir) = &config.working_dir {
        cmd.current_dir(dir);
    }
    for (key, value) in &config.env {
        cmd.env(key, value);
    }

    // Isolate the child in its own process group so a later kill reaches
    // grandchildren the agent spawned, not just the agent itself.
    #[cfg(unix)]
    cmd.process_group(0);

    let child = cmd.spawn().map_err(|e| {
        HarnessError::spawn_failed_with_source(format!("Failed to spawn {}: {}", executable, e), e)
    })?;

    let pid = child.id();
    info!(
        backend = %config.display_name,
        executable = %executable,
        pid = ?pid,
        "agent process spawned"
    );

    Ok(AgentProcess {
        child,
        pid,
        group_mode: cfg!(unix),
    })
}

/// Terminate the process and all its descendants, then wait for the reap
///
/// Best-effort: signaling failures fall back to killing the direct child, an
/// already-exited process is fine, and a process that refuses to die within
/// the reap bound is logged as a possible zombie rather than blocking.
pub(crate) async fn kill_tree(process: &mut AgentProcess) {
    if process.group_mode {
        match process.pid {
            Some(pid) if kill_process_group(pid) => {
                debug!(pid, "sent SIGKILL to process group");
            }
            _ => {
                debug!(pid = ?process.pid, "group kill unavailable, killing direct child");
                if let Err(e) = process.child.start_kill() {
                    debug!(error = %e, "direct kill failed (process likely exited)");
                }
            }
        }
    } else if let Err(e) = process.child.start_kill() {
        debug!(error = %e, "direct kill failed (process likely exited)");
    }

    // Drop our ends of the pipes so a grandchild that inherited them cannot
    // keep a read on the other side hanging.
    drop(process.child.stdin.take());
    drop(process.child.stdout.take());
    drop(process.child.stderr.take());

    match tokio::time::timeout(REAP_TIMEOUT, process.child.wait()).await {
        Ok(Ok(status)) => debug!(pid = ?process.pid, ?status, "killed process reaped"),
        Ok(Err(e)) => debug!(pid = ?process.pid, error = %e, "wait after kill failed"),
        Err(_) => warn!(
            pid = ?process.pid,
            timeout_secs = REAP_TIMEOUT.as_secs(),
            "process did not exit after kill, possible zombie"
        ),
    }
}

/// Send SIGKILL to the whole process group; false when the signal fails
#[cfg(unix)]
fn kill_process_group(pid: u32) -> bool {
    // Children are spawned with process_group(0), so their PGID equals their
    // PID and -pid addresses the whole tree.
    unsafe { libc::kill(-(pid as i32), libc::SIGKILL) == 0 }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) -> bool {
    false
}
