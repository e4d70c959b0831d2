use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

use crate::backend::dispatch::Dispatcher;
use crate::backend::ExecutorRegistry;
use crate::backend::process::{ProcessRunner, TokioRunner};
use crate::breaker::CircuitBreakerRegistry;
use crate::config::{ConfigStore, EnvGates};
use crate::observe::activity::ActivityLog;
use crate::observe::audit::AuditTrail;
use crate::observe::red::RedMetrics;
use crate::observe::tokens::TokenSavings;
use crate::permissions::{AutonomyLevel, PermissionManager};
use crate::selector::BackendSelector;

/// Sink for streamed subprocess output. The engine never embeds the
/// transport; callers decide whether chunks go to MCP progress
/// notifications, a log, or nowhere.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, chunk: &str);
}

/// Discards progress chunks.
pub struct NullSink;

impl ProgressSink for NullSink {
    fn emit(&self, _chunk: &str) {}
}

/// Logs each chunk at DEBUG under the request id.
pub struct TracingSink {
    request_id: String,
}

impl TracingSink {
    pub fn new(request_id: &str) -> Arc<Self> {
        Arc::new(Self {
            request_id: request_id.to_string(),
        })
    }
}

impl ProgressSink for TracingSink {
    fn emit(&self, chunk: &str) {
        debug!(request_id = %self.request_id, chunk = %chunk, "backend output");
    }
}

/// Per tool-call context. Lifetime equals the tool call; the request id is
/// the correlation key stamped on every subprocess, audit entry, RED
/// sample, and log line the call produces.
#[derive(Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub autonomy: AutonomyLevel,
    pub trusted_source: bool,
    pub workflow: Option<String>,
    pub tool_name: String,
    pub progress: Arc<dyn ProgressSink>,
    cancel_tx: Arc<watch::Sender<bool>>,
    cancel_rx: watch::Receiver<bool>,
}

impl RequestContext {
    pub fn new(tool_name: &str, autonomy: AutonomyLevel) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Self {
            request_id: Uuid::new_v4().to_string(),
            autonomy,
            trusted_source: false,
            workflow: None,
            tool_name: tool_name.to_string(),
            progress: Arc::new(NullSink),
            cancel_tx: Arc::new(cancel_tx),
            cancel_rx,
        }
    }

    pub fn for_workflow(workflow: &str, autonomy: AutonomyLevel) -> Self {
        let mut ctx = Self::new("smart-workflows", autonomy);
        ctx.workflow = Some(workflow.to_string());
        ctx
    }

    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = sink;
        self
    }

    /// Internal composition steps run trusted: their prompts embed prior
    /// step output that must not trip the blocking patterns.
    pub fn trusted(mut self) -> Self {
        self.trusted_source = true;
        self
    }

    /// A receiver observing cancellation of this call.
    pub fn cancel_token(&self) -> watch::Receiver<bool> {
        self.cancel_rx.clone()
    }

    /// Cancel every subprocess spawned under this context.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }
}

/// Everything a tool handler needs, built once at startup and passed
/// explicitly (no globals) so tests can construct an isolated engine per
/// case.
pub struct EngineContext {
    pub config: Arc<ConfigStore>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub executors: Arc<ExecutorRegistry>,
    pub permissions: Arc<PermissionManager>,
    pub runner: Arc<dyn ProcessRunner>,
    pub audit: Arc<AuditTrail>,
    pub red: Arc<RedMetrics>,
    pub tokens: Arc<TokenSavings>,
    pub activity: Arc<ActivityLog>,
    pub selector: Arc<BackendSelector>,
    pub dispatcher: Arc<Dispatcher>,
    pub allowed_roots: Vec<PathBuf>,
}

impl EngineContext {
    /// Wire the production engine: real subprocess runner, stores under
    /// `data_dir`, config at `config_path`, env gates from the process
    /// environment.
    pub fn initialize(
        config_path: PathBuf,
        data_dir: PathBuf,
        gates: EnvGates,
    ) -> anyhow::Result<Arc<Self>> {
        let runner: Arc<dyn ProcessRunner> = Arc::new(TokioRunner);
        Self::with_runner(config_path, data_dir, gates, runner)
    }

    /// Same wiring with an injected runner (tests use a scripted fake).
    pub fn with_runner(
        config_path: PathBuf,
        data_dir: PathBuf,
        gates: EnvGates,
        runner: Arc<dyn ProcessRunner>,
    ) -> anyhow::Result<Arc<Self>> {
        let config = ConfigStore::new(config_path);
        let breakers = Arc::new(CircuitBreakerRegistry::new());
        let executors = Arc::new(ExecutorRegistry::builtin());
        let permissions = Arc::new(PermissionManager::new(gates));

        let audit = Arc::new(AuditTrail::open(&data_dir)?);
        let red = Arc::new(RedMetrics::open(&data_dir)?);
        let tokens = Arc::new(TokenSavings::open(&data_dir)?);
        let activity = Arc::new(ActivityLog::open(&data_dir)?);

        let detected = executors.names();
        let selector = Arc::new(BackendSelector::new(
            Arc::clone(&config),
            Arc::clone(&breakers),
            detected,
        ));

        let allowed_roots = vec![std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))];

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&executors),
            Arc::clone(&breakers),
            Arc::clone(&permissions),
            Arc::clone(&runner),
            Arc::clone(&audit),
            Arc::clone(&red),
            Arc::clone(&tokens),
            allowed_roots.clone(),
        ));

        Ok(Arc::new(Self {
            config,
            breakers,
            executors,
            permissions,
            runner,
            audit,
            red,
            tokens,
            activity,
            selector,
            dispatcher,
            allowed_roots,
        }))
    }
}
