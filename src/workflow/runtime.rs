use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::task::JoinSet;
use tracing::{info, warn};

use super::defs::{self, Execution, IterativePlan, WorkflowDef};
use super::step::{
    Plan, Step, StepKind, StepOutputs, SkipNote, compute_layers, default_compose,
};
use crate::backend::{ExecRequest, auto_level_for};
use crate::context::{EngineContext, ProgressSink, RequestContext};
use crate::error::EngineError;
use crate::gitops;
use crate::observe::activity::ActivityRecord;
use crate::observe::audit::AuditEntry;
use crate::observe::red::{MetricType, RedSample};
use crate::permissions::AutonomyLevel;
use crate::selector::TaskCharacteristics;

/// Retry backoff for retryable step failures: up to two retries.
const RETRY_BACKOFF: [Duration; 2] = [Duration::from_secs(1), Duration::from_secs(3)];

/// How long to wait for in-flight steps to observe a cancel before the
/// runtime stops draining them.
const DRAIN_GRACE: Duration = Duration::from_secs(10);

/// The rendered result of one workflow run.
#[derive(Debug, Clone)]
pub struct WorkflowRun {
    pub text: String,
    pub truncated: bool,
    pub request_id: String,
}

/// Executes the named workflows as compositions of backend calls.
#[derive(Clone)]
pub struct WorkflowRuntime {
    engine: Arc<EngineContext>,
    backoff: Arc<Vec<Duration>>,
    deadline_override: Option<Duration>,
}

impl WorkflowRuntime {
    pub fn new(engine: Arc<EngineContext>) -> Self {
        Self {
            engine,
            backoff: Arc::new(RETRY_BACKOFF.to_vec()),
            deadline_override: None,
        }
    }

    /// Replace the retry backoff ramp (tests use zero delays).
    pub fn with_backoff(mut self, backoff: Vec<Duration>) -> Self {
        self.backoff = Arc::new(backoff);
        self
    }

    /// Override every workflow deadline, for callers on a tighter budget.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline_override = Some(deadline);
        self
    }

    /// Run a workflow by name. Parameter validation happens before any side
    /// effect; the autonomy literal `auto` (or absence) resolves through
    /// the per-workflow default table.
    pub async fn run(
        &self,
        name: &str,
        params: &Value,
        autonomy: Option<&str>,
        progress: Option<Arc<dyn ProgressSink>>,
    ) -> Result<WorkflowRun, EngineError> {
        let def = defs::find(name).ok_or_else(|| {
            EngineError::InvalidArguments(format!(
                "unknown workflow '{name}'; use list-workflows to see what exists"
            ))
        })?;
        let autonomy = resolve_autonomy(autonomy, def)?;

        let mut ctx = RequestContext::for_workflow(name, autonomy);
        if let Some(sink) = progress {
            ctx = ctx.with_progress(sink);
        }

        info!(
            request_id = %ctx.request_id,
            workflow = %name,
            autonomy = %autonomy.as_str(),
            "workflow starting"
        );

        let started = Instant::now();
        let result = match &def.execution {
            Execution::Graph(plan_fn) => {
                let mut plan = plan_fn(params)?;
                if let Some(deadline) = self.deadline_override {
                    plan.deadline = deadline;
                }
                self.run_graph(&ctx, plan).await
            }
            Execution::Iterative(plan_fn) => {
                let mut plan = plan_fn(params)?;
                if let Some(deadline) = self.deadline_override {
                    plan.deadline = deadline;
                }
                self.run_iterative(&ctx, plan).await
            }
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        self.record_workflow(&ctx, name, duration_ms, result).await
    }

    /// Workflow-level observability: one RED sample, one activity row, and
    /// one audit entry per run. The audit write is fail-closed — a result
    /// that cannot be audited is withheld.
    async fn record_workflow(
        &self,
        ctx: &RequestContext,
        name: &str,
        duration_ms: u64,
        result: Result<WorkflowRun, EngineError>,
    ) -> Result<WorkflowRun, EngineError> {
        let success = result.is_ok();
        self.engine
            .red
            .record_async(RedSample {
                metric_type: MetricType::Workflow,
                component: "workflow".into(),
                backend: None,
                duration_ms,
                success,
                error_type: result.as_ref().err().map(|e| e.class().as_str().to_string()),
                request_id: Some(ctx.request_id.clone()),
                metadata: serde_json::json!({"workflow": name}),
            })
            .await;
        self.engine
            .activity
            .record_async(ActivityRecord {
                request_id: ctx.request_id.clone(),
                tool_name: ctx.tool_name.clone(),
                workflow: Some(name.to_string()),
                backend: None,
                duration_ms,
                success,
            })
            .await;

        let entry = AuditEntry {
            request_id: ctx.request_id.clone(),
            workflow: Some(name.to_string()),
            backend: None,
            tool_name: ctx.tool_name.clone(),
            autonomy: ctx.autonomy,
            action: "workflow".into(),
            outcome: match &result {
                Ok(run) if run.truncated => "truncated".into(),
                Ok(_) => "success".into(),
                Err(e) => format!("failure:{}", e.class().as_str()),
            },
            duration_ms,
            error_class: result.as_ref().err().map(|e| e.class()),
            prompt_sha256: None,
            metadata: serde_json::json!({}),
        };

        match result {
            Ok(run) => {
                self.engine.audit.record_async(entry).await?;
                Ok(run)
            }
            Err(e) => {
                if let Err(audit_err) = self.engine.audit.record_async(entry).await {
                    warn!(
                        request_id = %ctx.request_id,
                        error = %audit_err,
                        "failed to audit a failed workflow"
                    );
                }
                Err(e)
            }
        }
    }

    /// Execute a static step graph layer by layer. Steps inside a layer run
    /// concurrently; the layer barrier holds until every step completed or
    /// degraded. A fatal step cancels its siblings and aborts the run.
    async fn run_graph(
        &self,
        ctx: &RequestContext,
        plan: Plan,
    ) -> Result<WorkflowRun, EngineError> {
        let layers = compute_layers(&plan.steps)?;
        let deadline = tokio::time::Instant::now() + plan.deadline;

        let mut outputs = StepOutputs::new();
        let mut skips: Vec<SkipNote> = Vec::new();
        let mut truncated = false;

        'layers: for layer in &layers {
            let mut join: JoinSet<(usize, Result<String, EngineError>)> = JoinSet::new();

            // One select_parallel call covers the layer's fan-out: distinct
            // steps receive its picks in declaration order, so the role
            // diversity of the assignment comes from the selector, not from
            // the workflow definition.
            let fan_out: Vec<usize> = layer
                .iter()
                .copied()
                .filter(|&i| {
                    matches!(plan.steps[i].kind, StepKind::AiCall) && plan.steps[i].distinct
                })
                .collect();
            let picks: Vec<String> = if fan_out.is_empty() {
                Vec::new()
            } else {
                self.engine
                    .selector
                    .select_parallel(fan_out.len(), &plan.steps[fan_out[0]].task)
            };
            let mut assigned = picks.into_iter();

            for &idx in layer {
                let step = plan.steps[idx].clone();
                let prompt = (step.prompt)(&outputs);
                let backend = match step.kind {
                    StepKind::AiCall => Some(if step.distinct {
                        assigned
                            .next()
                            .unwrap_or_else(|| self.engine.selector.select(&step.task))
                    } else {
                        self.engine.selector.select(&step.task)
                    }),
                    StepKind::GitRead(_) => None,
                };

                let runtime = self.clone();
                let step_ctx = ctx.clone();
                join.spawn(async move {
                    let result = runtime.run_step(&step_ctx, &step, prompt, backend).await;
                    (idx, result)
                });
            }

            let mut fatal: Option<EngineError> = None;
            loop {
                let joined = match tokio::time::timeout_at(deadline, join.join_next()).await {
                    Ok(Some(j)) => j,
                    Ok(None) => break,
                    Err(_) => {
                        // Workflow deadline: terminate in-flight children and
                        // return whatever finished.
                        warn!(request_id = %ctx.request_id, "workflow deadline exceeded");
                        truncated = true;
                        ctx.cancel();
                        let _ = tokio::time::timeout(DRAIN_GRACE, async {
                            while join.join_next().await.is_some() {}
                        })
                        .await;
                        break 'layers;
                    }
                };

                match joined {
                    Ok((idx, Ok(output))) => {
                        let step = &plan.steps[idx];
                        if fatal.is_none() {
                            outputs.insert(&step.name, &step.section, output);
                        }
                    }
                    Ok((idx, Err(err))) => {
                        let step = &plan.steps[idx];
                        if fatal.is_some() {
                            // Sibling failed after the fatal cancel; drop it.
                            continue;
                        }
                        if err.is_fatal() || step.fatal {
                            warn!(
                                request_id = %ctx.request_id,
                                step = %step.name,
                                error = %err,
                                "fatal step failure, aborting workflow"
                            );
                            ctx.cancel();
                            fatal = Some(err);
                        } else {
                            skips.push(SkipNote {
                                step: step.name.clone(),
                                reason: err.to_string(),
                            });
                        }
                    }
                    Err(join_err) => {
                        if fatal.is_none() {
                            skips.push(SkipNote {
                                step: "internal".into(),
                                reason: join_err.to_string(),
                            });
                        }
                    }
                }
            }
            if let Some(err) = fatal {
                return Err(err);
            }
        }

        let body = match &plan.compose {
            Some(compose) => compose(&outputs, &skips),
            None => default_compose(&plan, &outputs, &skips),
        };
        Ok(WorkflowRun {
            text: render(&plan.title, ctx, &body, truncated),
            truncated,
            request_id: ctx.request_id.clone(),
        })
    }

    /// The overthinker loop: alternate architect and implementer, feeding
    /// each round's plan into the next, until a round contributes no new
    /// sections (after the round floor) or the cap is reached.
    async fn run_iterative(
        &self,
        ctx: &RequestContext,
        plan: IterativePlan,
    ) -> Result<WorkflowRun, EngineError> {
        let deadline = tokio::time::Instant::now() + plan.deadline;
        let mut outputs = StepOutputs::new();
        let mut skips: Vec<SkipNote> = Vec::new();
        let mut seen_sections: HashSet<String> = HashSet::new();
        let mut truncated = false;
        let mut previous = String::new();

        for round in 1..=plan.max_rounds {
            let (role_name, task) = if round % 2 == 1 {
                ("architect", TaskCharacteristics::architect())
            } else {
                ("implementer", TaskCharacteristics::implementer())
            };
            let prompt = if round == 1 {
                format!(
                    "Draft an initial plan for: {}\n\
                     Structure the plan with markdown '##' sections.",
                    plan.problem
                )
            } else {
                format!(
                    "Refine the plan below for: {}\n\
                     Keep '##' sections that still apply; add a section only \
                     when something is genuinely missing.\nCurrent plan:\n{}",
                    plan.problem, previous
                )
            };

            let step_name = format!("round-{round}");
            let mut step = Step::ai(
                &step_name,
                &format!("Round {round} ({role_name})"),
                task,
                Arc::new(move |_| String::new()),
            );
            if round > 1 {
                // Embedded prior output makes later rounds trusted input.
                let prev_name = format!("round-{}", round - 1);
                step = step.after(&[prev_name.as_str()]);
            }

            let result =
                tokio::time::timeout_at(deadline, self.run_step(ctx, &step, prompt, None)).await;
            match result {
                Err(_) => {
                    warn!(request_id = %ctx.request_id, round, "overthinker deadline exceeded");
                    truncated = true;
                    ctx.cancel();
                    break;
                }
                Ok(Ok(output)) => {
                    let new_sections: Vec<String> = markdown_sections(&output)
                        .into_iter()
                        .filter(|s| !seen_sections.contains(s))
                        .collect();
                    outputs.insert(&step.name, &step.section, output.clone());
                    previous = output;
                    if round >= plan.min_rounds && new_sections.is_empty() {
                        info!(request_id = %ctx.request_id, round, "plan stabilized");
                        break;
                    }
                    seen_sections.extend(new_sections);
                }
                Ok(Err(err)) if err.is_fatal() => return Err(err),
                Ok(Err(err)) => {
                    skips.push(SkipNote {
                        step: step_name,
                        reason: err.to_string(),
                    });
                    break;
                }
            }
        }

        let mut body = String::new();
        for (_, section, output) in outputs.iter() {
            body.push_str(&format!("## {}\n\n{}\n\n", section, output.trim_end()));
        }
        for skip in &skips {
            body.push_str(&format!("{}\n", skip.render()));
        }

        Ok(WorkflowRun {
            text: render(&plan.title, ctx, &body, truncated),
            truncated,
            request_id: ctx.request_id.clone(),
        })
    }

    /// Execute one step, retrying retryable failures with backoff. A step
    /// whose candidate circuit is open re-selects on retry.
    async fn run_step(
        &self,
        ctx: &RequestContext,
        step: &Step,
        prompt: String,
        backend: Option<String>,
    ) -> Result<String, EngineError> {
        match &step.kind {
            StepKind::GitRead(query) => {
                gitops::read(&self.engine.runner, *query, ctx.cancel_token()).await
            }
            StepKind::AiCall => {
                // Steps that embed prior step output run trusted so the
                // blocking patterns don't reject our own composition.
                let step_ctx = if step.deps.is_empty() {
                    ctx.clone()
                } else {
                    ctx.clone().trusted()
                };

                let mut backend =
                    backend.unwrap_or_else(|| self.engine.selector.select(&step.task));
                let mut attempt = 0usize;
                loop {
                    let req = ExecRequest {
                        prompt: prompt.clone(),
                        output_format: step.output_format.clone(),
                        attachments: step.attachments.clone(),
                        auto: Some(auto_level_for(ctx.autonomy)),
                        ..Default::default()
                    };
                    match self.engine.dispatcher.execute(&step_ctx, &backend, req).await {
                        Ok(output) => return Ok(output),
                        Err(err) if err.is_retryable() && attempt < self.backoff.len() => {
                            warn!(
                                request_id = %ctx.request_id,
                                step = %step.name,
                                backend = %backend,
                                attempt,
                                error = %err,
                                "retryable step failure"
                            );
                            tokio::time::sleep(self.backoff[attempt]).await;
                            if matches!(err, EngineError::BackendUnavailable { .. }) {
                                backend = self.engine.selector.select(&step.task);
                            }
                            attempt += 1;
                        }
                        Err(err) => return Err(err),
                    }
                }
            }
        }
    }
}

fn resolve_autonomy(
    requested: Option<&str>,
    def: &WorkflowDef,
) -> Result<AutonomyLevel, EngineError> {
    match requested {
        None => Ok(def.default_autonomy),
        Some(s) if s.trim().eq_ignore_ascii_case("auto") => Ok(def.default_autonomy),
        Some(s) => AutonomyLevel::parse(s),
    }
}

/// The `##` section titles of a markdown document.
fn markdown_sections(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| line.trim().strip_prefix("## "))
        .map(|s| s.trim().to_string())
        .collect()
}

fn render(title: &str, ctx: &RequestContext, body: &str, truncated: bool) -> String {
    let mut text = format!("# {title}\n\n");
    if truncated {
        text.push_str("**TRUNCATED**: workflow deadline exceeded; partial results below.\n\n");
    }
    text.push_str(body.trim_end());
    text.push_str(&format!(
        "\n\n---\nrequest: {} · autonomy: {}\n",
        ctx.request_id,
        ctx.autonomy.as_str()
    ));
    text
}
