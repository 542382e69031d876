//! Run orchestration: build, launch, communicate, finalize

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};
use uuid::Uuid;

use harness_core::{AgentOutput, BackendConfig, RunRequest};

use crate::backend::{backend_for, AgentBackend, RecoveryContext};
use crate::error::{HarnessError, Result};
use crate::parser;
use crate::process::{self, AgentProcess};
use crate::watchdog::{self, CommVerdict};

/// Prefix of the temp files reserved for output-to-file runs
const OUTPUT_FILE_PREFIX: &str = "agent-harness";

/// Cloneable flag a caller sets from another task to abort a run
///
/// Observed by the watchdog on its poll interval; the aborted run tears the
/// process tree down before surfacing [`HarnessError::Cancelled`].
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation of every run observing this token
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Phases of one run, logged at each transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunPhase {
    Building,
    Launching,
    Communicating,
    Finalizing,
}

impl RunPhase {
    fn as_str(self) -> &'static str {
        match self {
            Self::Building => "building",
            Self::Launching => "launching",
            Self::Communicating => "communicating",
            Self::Finalizing => "finalizing",
        }
    }
}

/// Drives one CLI agent backend through complete runs
///
/// Holds only read-only configuration; a single runner can serve many
/// concurrent runs, each owning its own process, pipes and temp file.
pub struct AgentRunner {
    config: BackendConfig,
    backend: Box<dyn AgentBackend>,
}

impl AgentRunner {
    /// Create a runner after validating the configuration
    pub fn new(config: BackendConfig) -> Result<Self> {
        config.validate()?;
        let backend = backend_for(config.family);
        Ok(Self { config, backend })
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Execute one run to completion
    pub async fn run(&self, request: &RunRequest) -> Result<AgentOutput> {
        self.run_with_cancel(request, &CancelToken::new()).await
    }

    /// Execute one run, aborting early if `cancel` is set
    pub async fn run_with_cancel(
        &self,
        request: &RunRequest,
        cancel: &CancelToken,
    ) -> Result<AgentOutput> {
        let run_id = Uuid::new_v4();
        let start = Instant::now();

        self.log_phase(run_id, RunPhase::Building, &start);
        let mut built = self.backend.build_command(
            &self.config,
            &request.role,
            request.system_prompt.as_deref(),
        );
        let output_path = match &self.config.output_file {
            Some(spec) => {
                let path = temp_output_path(run_id);
                let flag = spec.render(&path)?;
                built.argv.push(flag.clone());
                built.sanitized.push(flag);
                Some(path)
            }
            None => None,
        };

        self.log_phase(run_id, RunPhase::Launching, &start);
        let mut agent = match process::spawn(&self.config, &built.argv) {
            Ok(agent) => agent,
            Err(e) => {
                self.cleanup_output_file(output_path.as_deref()).await;
                return Err(e);
            }
        };

        self.log_phase(run_id, RunPhase::Communicating, &start);
        let comm = match watchdog::communicate(
            &mut agent.child,
            request.prompt.as_bytes(),
            self.config.total_timeout(),
            self.config.silence_timeout(),
            cancel,
        )
        .await
        {
            Ok(comm) => comm,
            Err(e) => {
                self.teardown(run_id, &mut agent, output_path.as_deref()).await;
                return Err(e);
            }
        };

        let exit_code = match comm.verdict {
            CommVerdict::Exited { exit_code } => exit_code,
            CommVerdict::TimedOut { kind } => {
                warn!(
                    run_id = %run_id,
                    backend = %self.config.display_name,
                    kind = %kind,
                    elapsed_ms = comm.elapsed.as_millis() as u64,
                    "run aborted by timeout"
                );
                self.teardown(run_id, &mut agent, output_path.as_deref()).await;
                return Err(HarnessError::Timeout {
                    kind,
                    elapsed_ms: comm.elapsed.as_millis() as u64,
                    stdout: comm.stdout,
                    stderr: comm.stderr,
                });
            }
            CommVerdict::Cancelled => {
                info!(
                    run_id = %run_id,
                    backend = %self.config.display_name,
                    elapsed_ms = comm.elapsed.as_millis() as u64,
                    "run cancelled by caller"
                );
                self.teardown(run_id, &mut agent, output_path.as_deref()).await;
                return Err(HarnessError::Cancelled {
                    elapsed_ms: comm.elapsed.as_millis() as u64,
                    stdout: comm.stdout,
                    stderr: comm.stderr,
                });
            }
        };

        self.log_phase(run_id, RunPhase::Finalizing, &start);
        let mut stdout = comm.stdout;
        let stderr = comm.stderr;

        let mut file_content = None;
        if let Some(path) = &output_path {
            match tokio::fs::read_to_string(path).await {
                Ok(content) => file_content = Some(content),
                Err(e) => debug!(run_id = %run_id, error = %e, "no readable output file"),
            }
            self.cleanup_output_file(Some(path)).await;
        }
        // Some agents put their payload only in the file; use it as the
        // effective stdout when the pipe stayed empty.
        if stdout.trim().is_empty() {
            if let Some(content) = &file_content {
                stdout = content.clone();
            }
        }

        let duration = start.elapsed();

        if exit_code != 0 {
            let ctx = RecoveryContext {
                exit_code,
                stdout: &stdout,
                stderr: &stderr,
                sanitized_argv: &built.sanitized,
                duration,
                file_content: file_content.as_deref(),
            };
            if let Some(output) = self.backend.recover_from_error(&self.config, &ctx) {
                return Ok(output);
            }
            warn!(
                run_id = %run_id,
                backend = %self.config.display_name,
                exit_code,
                "agent exited non-zero"
            );
            return Err(HarnessError::ExitFailure {
                exit_code,
                stdout,
                stderr,
            });
        }

        match parser::parse(self.config.family, &stdout, &stderr) {
            Ok(response) => {
                info!(
                    run_id = %run_id,
                    backend = %self.config.display_name,
                    duration_ms = duration.as_millis() as u64,
                    "run completed"
                );
                Ok(AgentOutput::new(
                    response,
                    built.sanitized,
                    exit_code,
                    stdout,
                    stderr,
                    duration,
                    self.config.family,
                    file_content,
                ))
            }
            Err(source) => Err(HarnessError::UnusableOutput {
                exit_code,
                source,
                stdout,
                stderr,
            }),
        }
    }

    /// Process-tree kill plus temp file removal on a failed run
    async fn teardown(&self, run_id: Uuid, agent: &mut AgentProcess, output_path: Option<&Path>) {
        debug!(run_id = %run_id, pid = ?agent.pid, "tearing down process tree");
        process::kill_tree(agent).await;
        self.cleanup_output_file(output_path).await;
    }

    /// Best-effort removal of the reserved temp file
    async fn cleanup_output_file(&self, path: Option<&Path>) {
        let cleanup = self
            .config
            .output_file
            .as_ref()
            .map(|spec| spec.cleanup)
            .unwrap_or(false);
        if !cleanup {
            return;
        }
        if let Some(path) = path {
            if let Err(e) = tokio::fs::remove_file(path).await {
                debug!(path = %path.display(), error = %e, "could not remove output file");
            }
        }
    }

    fn log_phase(&self, run_id: Uuid, phase: RunPhase, start: &Instant) {
        debug!(
            run_id = %run_id,
            backend = %self.config.display_name,
            phase = phase.as_str(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "run phase"
        );
    }
}

/// Unique temp path for one run's output file
fn temp_output_path(run_id: Uuid) -> PathBuf {
    std::env::temp_dir().join(format!("{}-{}.json", OUTPUT_FILE_PREFIX, run_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TimeoutKind;
    use harness_core::{BackendFamily, OutputFileSpec, RoleSpec};
    use std::time::Duration;

    fn sh_config(script: &str, family: BackendFamily) -> BackendConfig {
        BackendConfig::new("test-agent", "sh", family)
            .with_fixed_args(vec!["-c".to_string(), script.to_string()])
            .with_timeouts(30, 30)
    }

    fn request() -> RunRequest {
        RunRequest::new(RoleSpec::bare("worker"), "do the thing")
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = BackendConfig::new("bad", "  ", BackendFamily::Plain);
        assert!(matches!(
            AgentRunner::new(config),
            Err(HarnessError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_spawn_failure_surfaces() {
        let config = BackendConfig::new("ghost", "/nonexistent/agent-binary", BackendFamily::Plain);
        let runner = AgentRunner::new(config).unwrap();
        let err = runner.run(&request()).await.unwrap_err();
        assert!(matches!(err, HarnessError::SpawnFailed { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_plain_run_returns_stdout() {
        let runner = AgentRunner::new(sh_config("echo hello world", BackendFamily::Plain)).unwrap();
        let output = runner.run(&request()).await.unwrap();
        assert_eq!(output.response.content, "hello world");
        assert_eq!(output.exit_code, 0);
        assert_eq!(output.family, BackendFamily::Plain);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stream_json_run_parses_result() {
        let runner = AgentRunner::new(sh_config(
            r#"echo '{"result": "hello", "is_error": false}'"#,
            BackendFamily::StreamJson,
        ))
        .unwrap();
        let output = runner.run(&request()).await.unwrap();
        assert_eq!(output.response.content, "hello");
        assert!(!output.response.is_error());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_env_and_working_dir_applied() {
        let dir = tempfile::TempDir::new().unwrap();
        let canonical = dir.path().canonicalize().unwrap();
        let config = sh_config("echo \"$HARNESS_PROBE\"; pwd", BackendFamily::Plain)
            .with_env_var("HARNESS_PROBE", "present")
            .with_working_dir(&canonical);
        let runner = AgentRunner::new(config).unwrap();

        let output = runner.run(&request()).await.unwrap();
        assert!(output.response.content.contains("present"));
        assert!(output
            .response
            .content
            .contains(canonical.to_str().unwrap()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_prompt_fed_over_stdin() {
        let runner = AgentRunner::new(sh_config("cat", BackendFamily::Plain)).unwrap();
        let output = runner
            .run(&RunRequest::new(RoleSpec::bare("worker"), "echo me back"))
            .await
            .unwrap();
        assert_eq!(output.response.content, "echo me back");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_failure_carries_streams() {
        let runner =
            AgentRunner::new(sh_config("echo oops >&2; exit 3", BackendFamily::Plain)).unwrap();
        let err = runner.run(&request()).await.unwrap_err();
        assert_eq!(err.exit_code(), Some(3));
        assert!(err.stderr().unwrap().contains("oops"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_parse_failure_on_zero_exit_is_run_failure() {
        let runner = AgentRunner::new(sh_config(
            "echo 'permission denied' >&2",
            BackendFamily::StreamJson,
        ))
        .unwrap();
        let err = runner.run(&request()).await.unwrap_err();
        match err {
            HarnessError::UnusableOutput {
                exit_code, stderr, ..
            } => {
                assert_eq!(exit_code, 0);
                assert!(stderr.contains("permission denied"));
            }
            other => panic!("expected UnusableOutput, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_recovery_hook_salvages_nonzero_exit() {
        let script = r#"echo '{"result": "salvaged"}'; exit 1"#;
        let runner = AgentRunner::new(sh_config(script, BackendFamily::StreamJson)).unwrap();
        let output = runner.run(&request()).await.unwrap();
        assert_eq!(output.response.content, "salvaged");
        assert_eq!(output.exit_code, 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_plain_family_has_no_recovery() {
        let script = r#"echo '{"result": "salvaged"}'; exit 1"#;
        let runner = AgentRunner::new(sh_config(script, BackendFamily::Plain)).unwrap();
        let err = runner.run(&request()).await.unwrap_err();
        assert_eq!(err.exit_code(), Some(1));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_silence_timeout_kills_process_tree() {
        // The backgrounded sleep prints its pid, then everything goes quiet.
        let script = "sleep 30 & echo $!; wait";
        let config = sh_config(script, BackendFamily::Plain).with_timeouts(60, 1);
        let runner = AgentRunner::new(config).unwrap();

        let err = runner.run(&request()).await.unwrap_err();
        assert_eq!(err.timeout_kind(), Some(TimeoutKind::Silence));

        let pid: i32 = err.stdout().unwrap().trim().parse().unwrap();
        assert_process_gone(pid).await;
    }

    /// Gone means ESRCH or an unreaped zombie still waiting on init
    #[cfg(unix)]
    async fn assert_process_gone(pid: i32) {
        for _ in 0..50 {
            if unsafe { libc::kill(pid, 0) } == -1 {
                return;
            }
            let stat =
                std::fs::read_to_string(format!("/proc/{}/stat", pid)).unwrap_or_default();
            let state = stat
                .rsplit(')')
                .next()
                .and_then(|rest| rest.split_whitespace().next());
            if state == Some("Z") {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("process {} still running after kill", pid);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_total_timeout_with_continuous_output() {
        let script = "while true; do echo tick; sleep 0.2; done";
        let config = sh_config(script, BackendFamily::Plain).with_timeouts(1, 60);
        let runner = AgentRunner::new(config).unwrap();

        let err = runner.run(&request()).await.unwrap_err();
        assert_eq!(err.timeout_kind(), Some(TimeoutKind::Total));
        assert!(err.stdout().unwrap().contains("tick"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancellation_surfaced_distinctly() {
        let config = sh_config("sleep 30", BackendFamily::Plain);
        let runner = AgentRunner::new(config).unwrap();
        let cancel = CancelToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let err = runner
            .run_with_cancel(&request(), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(err.timeout_kind().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_output_file_substitutes_empty_stdout() {
        // The rendered bare-path flag lands in $0; the agent writes its
        // payload there and prints nothing.
        let script = r#"cat > /dev/null; echo '{"result": "from file"}' > "$0""#;
        let config = sh_config(script, BackendFamily::StreamJson).with_output_file(OutputFileSpec {
            flag_template: "{path}".to_string(),
            cleanup: true,
        });
        let runner = AgentRunner::new(config).unwrap();

        let output = runner.run(&request()).await.unwrap();
        assert_eq!(output.response.content, "from file");
        assert!(output.file_content.is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_output_file_not_substituted_when_stdout_present() {
        let script = r#"echo '{"result": "from stdout"}'; echo '{"result": "from file"}' > "$0""#;
        let config = sh_config(script, BackendFamily::StreamJson).with_output_file(OutputFileSpec {
            flag_template: "{path}".to_string(),
            cleanup: true,
        });
        let runner = AgentRunner::new(config).unwrap();

        let output = runner.run(&request()).await.unwrap();
        assert_eq!(output.response.content, "from stdout");
        assert_eq!(
            output.file_content.as_deref(),
            Some("{\"result\": \"from file\"}\n")
        );
    }

    #[test]
    fn test_cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_temp_output_path_is_unique() {
        let a = temp_output_path(Uuid::new_v4());
        let b = temp_output_path(Uuid::new_v4());
        assert_ne!(a, b);
        assert!(a.to_string_lossy().ends_with(".json"));
    }
}
