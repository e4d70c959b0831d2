use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::backend::process::{ProcessRunner, RunSpec};
use crate::context::{NullSink, ProgressSink};
use crate::error::{EngineError, truncate_stderr};

/// Deadline for git plumbing; these are local reads, not AI calls.
const GIT_TIMEOUT: Duration = Duration::from_secs(30);

/// The read-only git queries workflow steps use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitQuery {
    /// `git log --oneline -n <limit>`
    RecentHistory { limit: usize },
    /// `git diff --cached`
    StagedDiff,
    /// `git show HEAD --stat --patch`
    HeadCommit,
}

impl GitQuery {
    fn args(&self) -> Vec<String> {
        match self {
            GitQuery::RecentHistory { limit } => vec![
                "log".into(),
                "--oneline".into(),
                "-n".into(),
                limit.to_string(),
            ],
            GitQuery::StagedDiff => vec!["diff".into(), "--cached".into()],
            GitQuery::HeadCommit => {
                vec!["show".into(), "HEAD".into(), "--stat".into(), "--patch".into()]
            }
        }
    }
}

/// Run one git query through the same process runner the dispatcher uses,
/// so tests can script git output alongside backend output.
pub async fn read(
    runner: &Arc<dyn ProcessRunner>,
    query: GitQuery,
    cancel: watch::Receiver<bool>,
) -> Result<String, EngineError> {
    let spec = RunSpec {
        program: "git".into(),
        args: query.args(),
        cwd: None,
        timeout: GIT_TIMEOUT,
    };
    let sink: Arc<dyn ProgressSink> = Arc::new(NullSink);
    let outcome = runner.run(spec, sink, cancel).await?;

    if outcome.timed_out {
        return Err(EngineError::Timeout {
            backend: "git".into(),
            seconds: GIT_TIMEOUT.as_secs(),
        });
    }
    if outcome.exit_code != Some(0) {
        return Err(EngineError::Subprocess {
            backend: "git".into(),
            detail: truncate_stderr(&outcome.stderr),
        });
    }
    Ok(outcome.stdout)
}
