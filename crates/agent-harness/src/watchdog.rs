//! Dual-timeout communication with a running agent process
//!
//! Feeds the prompt over stdin, drains stdout/stderr line by line on their
//! own tasks, and races natural process exit against the total budget, the
//! silence budget and external cancellation. Silence resets whenever a line
//! arrives on either stream; the total budget never resets.

use std::io;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, warn};

use crate::error::{HarnessError, Result, TimeoutKind};
use crate::runner::CancelToken;

/// Interval between timeout and cancellation checks
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Bound on draining buffered output after the process exits
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// How a communication session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CommVerdict {
    /// Process exited on its own
    Exited { exit_code: i32 },
    /// One of the two watchdog timeouts fired; the process is still running
    TimedOut { kind: TimeoutKind },
    /// The caller's cancellation token was set; the process is still running
    Cancelled,
}

/// Outcome of one communication session with the captured streams
pub(crate) struct Communicated {
    pub verdict: CommVerdict,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

/// Feed `input` to the child and drain its output until exit, timeout or
/// cancellation
///
/// The stdin feed runs as its own task alongside the readers: a prompt larger
/// than the pipe buffer must not be able to wedge the watchdog when the child
/// fills its stdout before reading stdin. Never kills the process; on a
/// timeout or cancellation verdict the caller owns the teardown. All tasks
/// are cancelled and awaited before returning.
pub(crate) async fn communicate(
    child: &mut Child,
    input: &[u8],
    total_timeout: Duration,
    silence_timeout: Duration,
    cancel: &CancelToken,
) -> Result<Communicated> {
    let start = Instant::now();

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| HarnessError::spawn_failed("Failed to capture stdout"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| HarnessError::spawn_failed("Failed to capture stderr"))?;

    let last_activity = Arc::new(Mutex::new(Instant::now()));
    let stdout_buf = Arc::new(Mutex::new(String::new()));
    let stderr_buf = Arc::new(Mutex::new(String::new()));

    let mut stdout_task = spawn_line_reader(
        stdout,
        Arc::clone(&stdout_buf),
        Arc::clone(&last_activity),
        "stdout",
    );
    let mut stderr_task = spawn_line_reader(
        stderr,
        Arc::clone(&stderr_buf),
        Arc::clone(&last_activity),
        "stderr",
    );

    let stdin = child.stdin.take();
    let prompt = input.to_vec();
    let mut stdin_task = tokio::spawn(async move {
        if let Some(mut stdin) = stdin {
            if let Err(e) = stdin.write_all(&prompt).await {
                // The child may exit before reading its prompt; that is its
                // prerogative and the exit code will tell the story.
                match e.kind() {
                    io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset => {
                        debug!(error = %e, "agent closed stdin before reading the prompt");
                    }
                    _ => warn!(error = %e, "failed to write prompt to agent stdin"),
                }
            }
            let _ = stdin.shutdown().await;
        }
    });

    let verdict = loop {
        tokio::select! {
            status = child.wait() => {
                match status {
                    Ok(status) => break CommVerdict::Exited {
                        exit_code: status.code().unwrap_or(-1),
                    },
                    Err(e) => {
                        stdin_task.abort();
                        stdout_task.abort();
                        stderr_task.abort();
                        let _ = (&mut stdin_task).await;
                        let _ = (&mut stdout_task).await;
                        let _ = (&mut stderr_task).await;
                        return Err(e.into());
                    }
                }
            }
            _ = time::sleep(POLL_INTERVAL) => {
                if cancel.is_cancelled() {
                    break CommVerdict::Cancelled;
                }
                if start.elapsed() > total_timeout {
                    break CommVerdict::TimedOut { kind: TimeoutKind::Total };
                }
                let idle = last_activity
                    .lock()
                    .map(|at| at.elapsed())
                    .unwrap_or_default();
                if idle > silence_timeout {
                    break CommVerdict::TimedOut { kind: TimeoutKind::Silence };
                }
            }
        }
    };

    // The feed either finished or is blocked on a pipe nobody will read
    // again; either way it must not outlive the session.
    stdin_task.abort();
    let _ = stdin_task.await;

    match verdict {
        CommVerdict::Exited { .. } => {
            // The pipes close with the process; give the readers a bounded
            // window to drain what is still buffered. A grandchild holding
            // the write end could otherwise keep them alive forever.
            for (task, label) in [(&mut stdout_task, "stdout"), (&mut stderr_task, "stderr")] {
                if time::timeout(DRAIN_TIMEOUT, &mut *task).await.is_err() {
                    warn!(stream = label, "reader did not drain after exit, aborting");
                    task.abort();
                    let _ = task.await;
                }
            }
        }
        CommVerdict::TimedOut { .. } | CommVerdict::Cancelled => {
            stdout_task.abort();
            stderr_task.abort();
            let _ = stdout_task.await;
            let _ = stderr_task.await;
        }
    }

    let stdout = stdout_buf.lock().map(|b| b.clone()).unwrap_or_default();
    let stderr = stderr_buf.lock().map(|b| b.clone()).unwrap_or_default();

    Ok(Communicated {
        verdict,
        stdout,
        stderr,
        elapsed: start.elapsed(),
    })
}

/// Append whole lines from `stream` to `buffer`, bumping `last_activity`
///
/// Invalid UTF-8 is replaced, never fatal. Stops at EOF or on a read error.
fn spawn_line_reader<R>(
    stream: R,
    buffer: Arc<Mutex<String>>,
    last_activity: Arc<Mutex<Instant>>,
    label: &'static str,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut raw = Vec::new();
        loop {
            raw.clear();
            match reader.read_until(b'\n', &mut raw).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&raw);
                    if let Ok(mut buf) = buffer.lock() {
                        buf.push_str(&line);
                    }
                    if let Ok(mut at) = last_activity.lock() {
                        *at = Instant::now();
                    }
                }
                Err(e) => {
                    debug!(stream = label, error = %e, "read error, stopping reader");
                    break;
                }
            }
        }
    })
}
