use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use rmcp::{
    ErrorData as McpError, ServerHandler,
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::*,
    schemars, tool, tool_handler, tool_router,
};
use serde::Deserialize;
use serde_json::Value;

use crate::backend::{AutoLevel, ExecRequest};
use crate::context::{EngineContext, RequestContext, TracingSink};
use crate::error::EngineError;
use crate::observe::activity::ActivityRecord;
use crate::observe::red::RedFilter;
use crate::permissions::AutonomyLevel;
use crate::workflow::WorkflowRuntime;

/// Parameters shared by every ask-* tool.
#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct AskParams {
    /// The prompt to send to the backend CLI.
    pub prompt: String,
    /// Model override, where the CLI supports one.
    #[serde(default)]
    pub model: Option<String>,
    /// Run the CLI in its sandbox mode, where supported.
    #[serde(default)]
    pub sandbox: bool,
    /// Output format hint (e.g. "json"), where supported.
    #[serde(default)]
    pub output_format: Option<String>,
    /// File attachments; every path must resolve under the allowed roots.
    #[serde(default)]
    pub attachments: Vec<String>,
    /// Pass the CLI's auto-approve flag. Requires high autonomy plus the
    /// UNITAI_ALLOW_AUTO_APPROVE opt-in outside production.
    #[serde(default)]
    pub auto_approve: bool,
    /// Droid escalation level: low, medium, or high.
    #[serde(default)]
    pub auto: Option<String>,
    /// Droid session to resume.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Pass droid's --skip-permissions-unsafe. Requires high autonomy plus
    /// the UNITAI_ALLOW_PERMISSION_BYPASS opt-in outside production.
    #[serde(default)]
    pub skip_permissions_unsafe: bool,
    /// Working directory for the CLI.
    #[serde(default)]
    pub cwd: Option<String>,
    /// Autonomy level for this call: read-only (default), low, medium, high.
    #[serde(default)]
    pub autonomy: Option<String>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct SmartWorkflowsParams {
    /// Workflow name; see list-workflows.
    pub workflow: String,
    /// Workflow parameters, validated against the workflow's schema.
    #[serde(default)]
    pub params: Option<Value>,
    /// Autonomy level, or "auto" to use the workflow's default.
    #[serde(default)]
    pub autonomy: Option<String>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct DescribeWorkflowParams {
    /// Workflow name to describe.
    pub workflow: String,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct RedStatsParams {
    /// Narrow to one component (dispatcher, workflow).
    #[serde(default)]
    pub component: Option<String>,
    /// Narrow to one backend name.
    #[serde(default)]
    pub backend: Option<String>,
    /// Trailing window in hours. Default: 24.
    #[serde(default = "default_hours")]
    pub hours: i64,
}

fn default_hours() -> i64 {
    24
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct ActivitySummaryParams {
    /// Trailing window in days. Default: 7.
    #[serde(default = "default_days")]
    pub days: i64,
}

fn default_days() -> i64 {
    7
}

/// The MCP server exposed over stdio.
#[derive(Clone)]
pub struct UnitaiServer {
    engine: Arc<EngineContext>,
    workflows: WorkflowRuntime,
    tool_router: ToolRouter<Self>,
}

impl UnitaiServer {
    pub fn new(engine: Arc<EngineContext>) -> Self {
        let workflows = WorkflowRuntime::new(Arc::clone(&engine));
        Self {
            engine,
            workflows,
            tool_router: Self::tool_router(),
        }
    }

    /// Shared implementation behind every ask-* tool.
    async fn ask(&self, backend: &str, params: AskParams) -> Result<CallToolResult, McpError> {
        let tool_name = format!("ask-{backend}");
        let autonomy = match params.autonomy.as_deref() {
            None => AutonomyLevel::ReadOnly,
            Some(s) => match AutonomyLevel::parse(s) {
                Ok(level) => level,
                Err(e) => return Ok(error_result(&e, None)),
            },
        };
        let auto = match params.auto.as_deref() {
            None => None,
            Some("low") => Some(AutoLevel::Low),
            Some("medium") => Some(AutoLevel::Medium),
            Some("high") => Some(AutoLevel::High),
            Some(other) => {
                let err = EngineError::InvalidArguments(format!(
                    "unknown auto level '{other}' (expected low, medium, or high)"
                ));
                return Ok(error_result(&err, None));
            }
        };

        let mut ctx = RequestContext::new(&tool_name, autonomy);
        let sink = TracingSink::new(&ctx.request_id);
        ctx = ctx.with_progress(sink);
        let req = ExecRequest {
            prompt: params.prompt,
            model: params.model,
            sandbox: params.sandbox,
            output_format: params.output_format,
            attachments: params.attachments.iter().map(PathBuf::from).collect(),
            auto_approve: params.auto_approve,
            auto,
            session_id: params.session_id,
            skip_permissions_unsafe: params.skip_permissions_unsafe,
            cwd: params.cwd.map(PathBuf::from),
        };

        let started = Instant::now();
        let result = self.engine.dispatcher.execute(&ctx, backend, req).await;
        self.engine
            .activity
            .record_async(ActivityRecord {
                request_id: ctx.request_id.clone(),
                tool_name,
                workflow: None,
                backend: Some(backend.to_string()),
                duration_ms: started.elapsed().as_millis() as u64,
                success: result.is_ok(),
            })
            .await;

        match result {
            Ok(output) => Ok(CallToolResult::success(vec![Content::text(format!(
                "{}\n\n[request: {}]",
                output.trim_end(),
                ctx.request_id
            ))])),
            Err(e) => Ok(error_result(&e, Some(&ctx.request_id))),
        }
    }
}

fn error_result(err: &EngineError, request_id: Option<&str>) -> CallToolResult {
    let text = match request_id {
        Some(id) => format!("{err} (request {id})"),
        None => err.to_string(),
    };
    CallToolResult::error(vec![Content::text(text)])
}

fn json_result(value: &impl serde::Serialize) -> Result<CallToolResult, McpError> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| McpError::internal_error(e.to_string(), None))?;
    Ok(CallToolResult::success(vec![Content::text(json)]))
}

#[tool_router]
impl UnitaiServer {
    #[tool(description = "Ask the Gemini CLI: long-context architectural reasoning.")]
    async fn ask_gemini(
        &self,
        Parameters(params): Parameters<AskParams>,
    ) -> Result<CallToolResult, McpError> {
        self.ask("gemini", params).await
    }

    #[tool(description = "Ask the Cursor agent CLI: editor-grade review and edits.")]
    async fn ask_cursor(
        &self,
        Parameters(params): Parameters<AskParams>,
    ) -> Result<CallToolResult, McpError> {
        self.ask("cursor", params).await
    }

    #[tool(description = "Ask the Factory droid CLI: autonomous implementation sessions.")]
    async fn ask_droid(
        &self,
        Parameters(params): Parameters<AskParams>,
    ) -> Result<CallToolResult, McpError> {
        self.ask("droid", params).await
    }

    #[tool(description = "Ask the Qwen coder CLI: fast checks and test-tier tasks.")]
    async fn ask_qwen(
        &self,
        Parameters(params): Parameters<AskParams>,
    ) -> Result<CallToolResult, McpError> {
        self.ask("qwen", params).await
    }

    #[tool(description = "Ask the Atlassian rovodev CLI.")]
    async fn ask_rovodev(
        &self,
        Parameters(params): Parameters<AskParams>,
    ) -> Result<CallToolResult, McpError> {
        self.ask("rovodev", params).await
    }

    #[tool(
        description = "Run a smart workflow: a named composition of backend calls with fan-out, fallback, and autonomy gating. See list-workflows for names."
    )]
    async fn smart_workflows(
        &self,
        Parameters(params): Parameters<SmartWorkflowsParams>,
    ) -> Result<CallToolResult, McpError> {
        let workflow_params = params.params.unwrap_or(Value::Null);
        let result = self
            .workflows
            .run(
                &params.workflow,
                &workflow_params,
                params.autonomy.as_deref(),
                None,
            )
            .await;

        match result {
            Ok(run) => Ok(CallToolResult::success(vec![Content::text(run.text)])),
            Err(e) => Ok(error_result(&e, None)),
        }
    }

    #[tool(description = "List the available smart workflows with their default autonomy levels.")]
    async fn list_workflows(&self) -> Result<CallToolResult, McpError> {
        let list: Vec<Value> = crate::workflow::defs::all()
            .iter()
            .map(|def| {
                serde_json::json!({
                    "name": def.name,
                    "description": def.description,
                    "default_autonomy": def.default_autonomy.as_str(),
                })
            })
            .collect();
        json_result(&list)
    }

    #[tool(description = "Describe one workflow: its parameter schema and defaults.")]
    async fn describe_workflow(
        &self,
        Parameters(params): Parameters<DescribeWorkflowParams>,
    ) -> Result<CallToolResult, McpError> {
        match crate::workflow::defs::find(&params.workflow) {
            Some(def) => json_result(&serde_json::json!({
                "name": def.name,
                "description": def.description,
                "default_autonomy": def.default_autonomy.as_str(),
                "parameters": (def.schema)(),
            })),
            None => Ok(CallToolResult::error(vec![Content::text(format!(
                "Workflow '{}' not found. Use list-workflows to see what exists.",
                params.workflow
            ))])),
        }
    }

    #[tool(
        description = "RED metrics (rate, errors, duration percentiles) over a trailing window, with an error breakdown."
    )]
    async fn red_stats(
        &self,
        Parameters(params): Parameters<RedStatsParams>,
    ) -> Result<CallToolResult, McpError> {
        let mut filter = RedFilter::last_hours(params.hours.clamp(1, 24 * 90));
        filter.component = params.component;
        filter.backend = params.backend;

        let red = Arc::clone(&self.engine.red);
        let report = tokio::task::spawn_blocking(move || {
            let stats = red.red_stats(&filter)?;
            let breakdown = red.error_breakdown(&filter)?;
            anyhow::Ok(serde_json::json!({
                "stats": stats,
                "error_breakdown": breakdown
                    .into_iter()
                    .map(|(error_type, count)| serde_json::json!({"errorType": error_type, "count": count}))
                    .collect::<Vec<_>>(),
            }))
        })
        .await
        .map_err(|e| McpError::internal_error(e.to_string(), None))?
        .map_err(|e| McpError::internal_error(e.to_string(), None))?;

        json_result(&report)
    }

    #[tool(
        description = "Activity summary over a trailing window: top tools and workflows, temporal distribution, token savings, and circuit-breaker status."
    )]
    async fn activity_summary(
        &self,
        Parameters(params): Parameters<ActivitySummaryParams>,
    ) -> Result<CallToolResult, McpError> {
        let days = params.days.clamp(1, 365);
        let activity = Arc::clone(&self.engine.activity);
        let tokens = Arc::clone(&self.engine.tokens);
        let summary = tokio::task::spawn_blocking(move || {
            let activity_summary = activity.summary(days)?;
            let token_summary = tokens.summary(days)?;
            anyhow::Ok(serde_json::json!({
                "activity": activity_summary,
                "token_savings": token_summary,
            }))
        })
        .await
        .map_err(|e| McpError::internal_error(e.to_string(), None))?
        .map_err(|e| McpError::internal_error(e.to_string(), None))?;

        let mut report = summary;
        report["breakers"] = serde_json::to_value(self.engine.breakers.all_stats())
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;
        json_result(&report)
    }

    #[tool(description = "Status of every registered backend: capabilities and breaker state.")]
    async fn backend_status(&self) -> Result<CallToolResult, McpError> {
        let report = serde_json::json!({
            "backends": self.engine.executors.descriptors(),
            "breakers": self.engine.breakers.all_stats(),
        });
        json_result(&report)
    }
}

#[tool_handler]
impl ServerHandler for UnitaiServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2025_06_18,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "unitai orchestrates multiple AI CLI backends (gemini, cursor, droid, qwen, rovodev).\n\n\
                 ## Tools\n\
                 - ask-gemini / ask-cursor / ask-droid / ask-qwen / ask-rovodev: one backend, one prompt\n\
                 - smart-workflows: named multi-backend compositions (reviews, design, bug hunts)\n\
                 - list-workflows / describe-workflow: discover workflows and their parameters\n\
                 - red-stats / activity-summary / backend-status: service health and usage\n\n\
                 ## Autonomy\n\
                 Every call runs under an autonomy level (read-only, low, medium, high) that gates \
                 side effects. Workflows default via their own table; pass autonomy=\"auto\" to accept it. \
                 Dangerous flags (auto_approve, skip_permissions_unsafe) additionally require environment \
                 opt-ins and are always refused in production."
                    .into(),
            ),
        }
    }
}
