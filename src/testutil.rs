//! Test utilities for unitai — a scripted fake process runner and engine
//! fixtures.
//!
//! Only compiled under `#[cfg(test)]`. `FakeRunner` implements the
//! `ProcessRunner` seam directly, so dispatcher and workflow tests run the
//! full pipeline without spawning real CLIs.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::watch;

use crate::backend::process::{ProcessRunner, RunOutcome, RunSpec};
use crate::config::{Config, EnvGates};
use crate::context::{EngineContext, ProgressSink};
use crate::error::EngineError;

/// Scripted result for one fake invocation.
#[derive(Debug, Clone)]
pub enum FakeOutcome {
    /// Exit 0 with this stdout.
    Ok(String),
    /// Non-zero exit with this stderr.
    Fail { code: i32, stderr: String },
    /// Pretend the deadline elapsed and the child was terminated.
    TimedOut,
    /// Block until the call is cancelled or its deadline passes.
    Hang,
}

/// A controllable fake subprocess runner.
///
/// Outcomes are scripted per program name and consumed FIFO; a program with
/// no script returns a generic success. Every call is recorded for
/// assertion.
pub struct FakeRunner {
    scripts: DashMap<String, VecDeque<FakeOutcome>>,
    calls: Mutex<Vec<RunSpec>>,
}

impl FakeRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            scripts: DashMap::new(),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Queue the next outcome for a program (e.g. "gemini", "git").
    pub fn script(&self, program: &str, outcome: FakeOutcome) {
        self.scripts
            .entry(program.to_string())
            .or_default()
            .push_back(outcome);
    }

    /// Queue the same outcome `n` times.
    pub fn script_n(&self, program: &str, outcome: FakeOutcome, n: usize) {
        for _ in 0..n {
            self.script(program, outcome.clone());
        }
    }

    /// Snapshot of every RunSpec received so far.
    pub fn calls(&self) -> Vec<RunSpec> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls filtered to one program.
    pub fn calls_for(&self, program: &str) -> Vec<RunSpec> {
        self.calls()
            .into_iter()
            .filter(|c| c.program == program)
            .collect()
    }

    fn next_outcome(&self, program: &str) -> FakeOutcome {
        self.scripts
            .get_mut(program)
            .and_then(|mut q| q.pop_front())
            .unwrap_or_else(|| FakeOutcome::Ok(format!("fake output from {program}")))
    }
}

#[async_trait]
impl ProcessRunner for FakeRunner {
    async fn run(
        &self,
        spec: RunSpec,
        progress: Arc<dyn ProgressSink>,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<RunOutcome, EngineError> {
        let outcome = self.next_outcome(&spec.program);
        self.calls.lock().unwrap().push(spec.clone());

        match outcome {
            FakeOutcome::Ok(stdout) => {
                for line in stdout.lines() {
                    progress.emit(line);
                }
                Ok(RunOutcome {
                    exit_code: Some(0),
                    stdout,
                    ..Default::default()
                })
            }
            FakeOutcome::Fail { code, stderr } => Ok(RunOutcome {
                exit_code: Some(code),
                stderr,
                ..Default::default()
            }),
            FakeOutcome::TimedOut => Ok(RunOutcome {
                timed_out: true,
                ..Default::default()
            }),
            FakeOutcome::Hang => {
                let deadline = tokio::time::sleep(spec.timeout.min(Duration::from_secs(30)));
                tokio::pin!(deadline);
                loop {
                    tokio::select! {
                        _ = &mut deadline => {
                            return Ok(RunOutcome { timed_out: true, ..Default::default() });
                        }
                        changed = cancel.changed() => {
                            if changed.is_err() || *cancel.borrow() {
                                return Ok(RunOutcome { cancelled: true, ..Default::default() });
                            }
                        }
                    }
                }
            }
        }
    }
}

/// An isolated engine wired to a fake runner: temp config path, temp data
/// dir, permissive-by-default env gates.
pub struct TestEngine {
    pub engine: Arc<EngineContext>,
    pub runner: Arc<FakeRunner>,
    // Held so the temp dirs outlive the engine.
    _data_dir: tempfile::TempDir,
    _config_dir: tempfile::TempDir,
}

impl TestEngine {
    pub fn new() -> Self {
        Self::with_gates(EnvGates::default())
    }

    pub fn with_gates(gates: EnvGates) -> Self {
        let runner = FakeRunner::new();
        let data_dir = tempfile::tempdir().expect("temp data dir");
        let config_dir = tempfile::tempdir().expect("temp config dir");
        let engine = EngineContext::with_runner(
            config_dir.path().join("config.json"),
            data_dir.path().to_path_buf(),
            gates,
            Arc::clone(&runner) as Arc<dyn ProcessRunner>,
        )
        .expect("test engine");
        Self {
            engine,
            runner,
            _data_dir: data_dir,
            _config_dir: config_dir,
        }
    }

    /// Persist a config and invalidate the cache.
    pub fn set_config(&self, config: &Config) {
        self.engine.config.save(config).expect("save test config");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::NullSink;

    fn never_cancel() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        std::mem::forget(tx);
        rx
    }

    #[tokio::test]
    async fn test_fake_runner_scripts_fifo() {
        let runner = FakeRunner::new();
        runner.script("gemini", FakeOutcome::Ok("first".into()));
        runner.script(
            "gemini",
            FakeOutcome::Fail {
                code: 1,
                stderr: "second".into(),
            },
        );

        let spec = RunSpec {
            program: "gemini".into(),
            args: vec![],
            cwd: None,
            timeout: Duration::from_secs(1),
        };

        let first = runner
            .run(spec.clone(), Arc::new(NullSink), never_cancel())
            .await
            .unwrap();
        assert!(first.success());
        assert_eq!(first.stdout, "first");

        let second = runner
            .run(spec.clone(), Arc::new(NullSink), never_cancel())
            .await
            .unwrap();
        assert_eq!(second.exit_code, Some(1));

        // Script exhausted: generic success.
        let third = runner
            .run(spec, Arc::new(NullSink), never_cancel())
            .await
            .unwrap();
        assert!(third.success());
        assert_eq!(runner.calls_for("gemini").len(), 3);
    }

    #[tokio::test]
    async fn test_fake_runner_hang_observes_cancel() {
        let runner = FakeRunner::new();
        runner.script("droid", FakeOutcome::Hang);
        let (tx, rx) = watch::channel(false);

        let spec = RunSpec {
            program: "droid".into(),
            args: vec![],
            cwd: None,
            timeout: Duration::from_secs(30),
        };
        let r = Arc::clone(&runner);
        let handle =
            tokio::spawn(async move { r.run(spec, Arc::new(NullSink), rx).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();
        let outcome = handle.await.unwrap().unwrap();
        assert!(outcome.cancelled);
    }

    #[test]
    fn test_test_engine_builds() {
        let fixture = TestEngine::new();
        assert_eq!(fixture.engine.executors.names().len(), 5);
    }
}
