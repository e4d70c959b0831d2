use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::context::ProgressSink;
use crate::error::EngineError;

/// Grace period between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// One subprocess invocation. The program is always executed directly
/// (`shell = false`); user strings only ever appear as argv elements.
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub timeout: Duration,
}

/// What came back from a finished (or terminated) subprocess.
#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub cancelled: bool,
}

impl RunOutcome {
    pub fn success(&self) -> bool {
        !self.timed_out && !self.cancelled && self.exit_code == Some(0)
    }
}

/// Seam between the dispatcher and the operating system. The production
/// impl spawns real CLIs; tests substitute a scripted fake.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(
        &self,
        spec: RunSpec,
        progress: Arc<dyn ProgressSink>,
        cancel: watch::Receiver<bool>,
    ) -> Result<RunOutcome, EngineError>;
}

/// Production runner: tokio subprocess with line streaming, deadline
/// enforcement, and SIGTERM → grace → SIGKILL termination.
pub struct TokioRunner;

/// Resolves when the watch signals cancellation. If the sender is gone the
/// call can never be cancelled, so the future parks forever.
async fn wait_cancelled(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            futures::future::pending::<()>().await;
        }
    }
}

#[cfg(unix)]
fn signal_group(child: &Child, signal: i32) {
    if let Some(pid) = child.id() {
        // Negative PID addresses the whole process group.
        // Safety: libc::kill is safe to call with any pid value.
        let ret = unsafe { libc::kill(-(pid as i32), signal) };
        if ret != 0 {
            warn!(pid, signal, "failed to signal process group");
        }
    }
}

/// SIGTERM the group, wait out the grace period, then SIGKILL.
async fn terminate(child: &mut Child, program: &str) {
    #[cfg(unix)]
    signal_group(child, libc::SIGTERM);

    match tokio::time::timeout(KILL_GRACE, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(program = %program, code = ?status.code(), "child exited after SIGTERM");
        }
        _ => {
            warn!(program = %program, "child survived SIGTERM grace period, killing");
            let _ = child.kill().await;
            let _ = child.wait().await;
        }
    }
}

#[async_trait]
impl ProcessRunner for TokioRunner {
    async fn run(
        &self,
        spec: RunSpec,
        progress: Arc<dyn ProgressSink>,
        cancel: watch::Receiver<bool>,
    ) -> Result<RunOutcome, EngineError> {
        let subprocess_err = |detail: String| EngineError::Subprocess {
            backend: spec.program.clone(),
            detail,
        };

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        // Each child in its own process group for clean kill-group cleanup.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| subprocess_err(format!("spawn failed: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| subprocess_err("failed to capture stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| subprocess_err("failed to capture stderr".into()))?;

        // Drain stderr concurrently so the child never blocks on a full pipe.
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let mut reader = BufReader::new(stderr);
            let _ = reader.read_to_string(&mut buf).await;
            buf
        });

        let deadline = tokio::time::Instant::now() + spec.timeout;
        let cancel_fut = wait_cancelled(cancel);
        tokio::pin!(cancel_fut);

        let mut lines = BufReader::new(stdout).lines();
        let mut stdout_buf = String::new();
        let mut timed_out = false;
        let mut cancelled = false;

        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        progress.emit(&line);
                        stdout_buf.push_str(&line);
                        stdout_buf.push('\n');
                    }
                    Ok(None) => break,
                    Err(e) => {
                        terminate(&mut child, &spec.program).await;
                        return Err(subprocess_err(format!("stdout read failed: {e}")));
                    }
                },
                _ = tokio::time::sleep_until(deadline) => {
                    timed_out = true;
                    break;
                }
                _ = &mut cancel_fut => {
                    cancelled = true;
                    break;
                }
            }
        }

        let exit_code = if timed_out || cancelled {
            terminate(&mut child, &spec.program).await;
            None
        } else {
            // stdout hit EOF; the exit itself still honours the deadline.
            match tokio::time::timeout_at(deadline, child.wait()).await {
                Ok(Ok(status)) => status.code(),
                Ok(Err(e)) => {
                    return Err(subprocess_err(format!("wait failed: {e}")));
                }
                Err(_) => {
                    timed_out = true;
                    terminate(&mut child, &spec.program).await;
                    None
                }
            }
        };

        let stderr_buf = stderr_task.await.unwrap_or_default();

        Ok(RunOutcome {
            exit_code,
            stdout: stdout_buf,
            stderr: stderr_buf,
            timed_out,
            cancelled,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::NullSink;

    fn never_cancel() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        // Keep the sender alive for the duration of the test process.
        std::mem::forget(tx);
        rx
    }

    fn spec(program: &str, args: &[&str], timeout: Duration) -> RunSpec {
        RunSpec {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            cwd: None,
            timeout,
        }
    }

    #[tokio::test]
    async fn test_captures_stdout_and_exit_zero() {
        let runner = TokioRunner;
        let outcome = runner
            .run(
                spec("echo", &["hello", "world"], Duration::from_secs(10)),
                Arc::new(NullSink),
                never_cancel(),
            )
            .await
            .unwrap();
        assert!(outcome.success());
        assert_eq!(outcome.stdout.trim(), "hello world");
        assert!(!outcome.timed_out);
    }

    #[tokio::test]
    async fn test_nonzero_exit_captures_stderr() {
        let runner = TokioRunner;
        let outcome = runner
            .run(
                spec("sh", &["-c", "echo oops >&2; exit 3"], Duration::from_secs(10)),
                Arc::new(NullSink),
                never_cancel(),
            )
            .await
            .unwrap();
        assert!(!outcome.success());
        assert_eq!(outcome.exit_code, Some(3));
        assert_eq!(outcome.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn test_timeout_terminates_child() {
        let runner = TokioRunner;
        let start = std::time::Instant::now();
        let outcome = runner
            .run(
                spec("sleep", &["30"], Duration::from_millis(200)),
                Arc::new(NullSink),
                never_cancel(),
            )
            .await
            .unwrap();
        assert!(outcome.timed_out);
        assert!(!outcome.success());
        // Well under the sleep duration: the child was killed, not awaited.
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_cancellation_terminates_child() {
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            TokioRunner
                .run(
                    spec("sleep", &["30"], Duration::from_secs(60)),
                    Arc::new(NullSink),
                    rx,
                )
                .await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        let outcome = handle.await.unwrap().unwrap();
        assert!(outcome.cancelled);
        assert!(!outcome.success());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_subprocess_error() {
        let runner = TokioRunner;
        let err = runner
            .run(
                spec("definitely-not-a-real-binary", &[], Duration::from_secs(1)),
                Arc::new(NullSink),
                never_cancel(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Subprocess { .. }));
    }

    #[tokio::test]
    async fn test_progress_sink_sees_lines() {
        struct Collect(std::sync::Mutex<Vec<String>>);
        impl ProgressSink for Collect {
            fn emit(&self, chunk: &str) {
                self.0.lock().unwrap().push(chunk.to_string());
            }
        }

        let sink = Arc::new(Collect(std::sync::Mutex::new(Vec::new())));
        let runner = TokioRunner;
        runner
            .run(
                spec(
                    "sh",
                    &["-c", "echo one; echo two"],
                    Duration::from_secs(10),
                ),
                Arc::clone(&sink) as Arc<dyn ProgressSink>,
                never_cancel(),
            )
            .await
            .unwrap();
        let lines = sink.0.lock().unwrap().clone();
        assert_eq!(lines, vec!["one", "two"]);
    }
}
