use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};

use super::step::{ComposeFn, Plan, Step, StepOutputs};
use crate::error::EngineError;
use crate::gitops::GitQuery;
use crate::permissions::AutonomyLevel;
use crate::selector::TaskCharacteristics;

/// Workflow deadline defaults. The two design-heavy workflows get longer.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(5 * 60);
pub const LONG_DEADLINE: Duration = Duration::from_secs(15 * 60);

/// How a workflow executes: a static step graph, or the iterated planning
/// loop (overthinker).
pub enum Execution {
    Graph(fn(&Value) -> Result<Plan, EngineError>),
    Iterative(fn(&Value) -> Result<IterativePlan, EngineError>),
}

/// Parameters of the iterated planning loop.
pub struct IterativePlan {
    pub title: String,
    pub problem: String,
    pub min_rounds: usize,
    pub max_rounds: usize,
    pub deadline: Duration,
}

/// One named workflow.
pub struct WorkflowDef {
    pub name: &'static str,
    pub description: &'static str,
    pub default_autonomy: AutonomyLevel,
    pub execution: Execution,
    pub schema: fn() -> Value,
}

/// Look up a workflow by name.
pub fn find(name: &str) -> Option<&'static WorkflowDef> {
    all().iter().find(|d| d.name == name)
}

/// Every registered workflow, in a stable order.
pub fn all() -> &'static [WorkflowDef] {
    static DEFS: std::sync::LazyLock<Vec<WorkflowDef>> = std::sync::LazyLock::new(|| {
        vec![
            WorkflowDef {
                name: "init-session",
                description:
                    "Read-only context gathering: recent git history plus an AI briefing of the repository state.",
                default_autonomy: AutonomyLevel::ReadOnly,
                execution: Execution::Graph(plan_init_session),
                schema: || {
                    json!({
                        "type": "object",
                        "properties": {
                            "focus": {"type": "string", "description": "Optional area to focus the briefing on."},
                            "history_limit": {"type": "integer", "default": 15, "description": "Number of recent commits to gather."}
                        }
                    })
                },
            },
            WorkflowDef {
                name: "parallel-review",
                description: "Fan-out code review: 2-3 role-diverse backends review the same files in parallel.",
                default_autonomy: AutonomyLevel::ReadOnly,
                execution: Execution::Graph(plan_parallel_review),
                schema: || {
                    json!({
                        "type": "object",
                        "required": ["files"],
                        "properties": {
                            "files": {"type": "array", "items": {"type": "string"}, "description": "Files to review."},
                            "focus": {"type": "string", "description": "Review focus, e.g. security."},
                            "reviewers": {"type": "integer", "minimum": 2, "maximum": 3, "default": 3}
                        }
                    })
                },
            },
            WorkflowDef {
                name: "pre-commit-validate",
                description:
                    "Validates the staged diff: secret scan, quality review, and breaking-change check in parallel.",
                default_autonomy: AutonomyLevel::ReadOnly,
                execution: Execution::Graph(plan_pre_commit_validate),
                schema: || {
                    json!({
                        "type": "object",
                        "properties": {
                            "depth": {"type": "string", "enum": ["quick", "standard", "paranoid"], "default": "standard"}
                        }
                    })
                },
            },
            WorkflowDef {
                name: "validate-last-commit",
                description: "Parallel review of HEAD: what the last commit actually changed.",
                default_autonomy: AutonomyLevel::ReadOnly,
                execution: Execution::Graph(plan_validate_last_commit),
                schema: || {
                    json!({
                        "type": "object",
                        "properties": {
                            "focus": {"type": "string"},
                            "reviewers": {"type": "integer", "minimum": 2, "maximum": 3, "default": 2}
                        }
                    })
                },
            },
            WorkflowDef {
                name: "triangulated-review",
                description:
                    "Three role backends review the same input in parallel; the composition highlights agreement and divergence.",
                default_autonomy: AutonomyLevel::ReadOnly,
                execution: Execution::Graph(plan_triangulated_review),
                schema: || {
                    json!({
                        "type": "object",
                        "required": ["target"],
                        "properties": {
                            "target": {"type": "string", "description": "What to review: file list or a description."},
                            "focus": {"type": "string"}
                        }
                    })
                },
            },
            WorkflowDef {
                name: "feature-design",
                description:
                    "Sequential design pipeline: architect design, implementer plan, tester test plan.",
                default_autonomy: AutonomyLevel::Low,
                execution: Execution::Graph(plan_feature_design),
                schema: || {
                    json!({
                        "type": "object",
                        "required": ["feature"],
                        "properties": {
                            "feature": {"type": "string", "description": "The feature to design."},
                            "target_files": {"type": "array", "items": {"type": "string"}},
                            "context": {"type": "string"}
                        }
                    })
                },
            },
            WorkflowDef {
                name: "bug-hunt",
                description:
                    "Locate suspects, form a hypothesis, run root-cause analysis, draft a remediation.",
                default_autonomy: AutonomyLevel::Low,
                execution: Execution::Graph(plan_bug_hunt),
                schema: || {
                    json!({
                        "type": "object",
                        "required": ["symptoms"],
                        "properties": {
                            "symptoms": {"type": "string", "description": "Observed failure behavior."},
                            "suspected_files": {"type": "array", "items": {"type": "string"}, "default": []}
                        }
                    })
                },
            },
            WorkflowDef {
                name: "auto-remediation",
                description: "Single implementer call drafting a bounded remediation plan for the given symptoms.",
                default_autonomy: AutonomyLevel::Medium,
                execution: Execution::Graph(plan_auto_remediation),
                schema: || {
                    json!({
                        "type": "object",
                        "required": ["symptoms"],
                        "properties": {
                            "symptoms": {"type": "string"},
                            "max_actions": {"type": "integer", "default": 3, "minimum": 1}
                        }
                    })
                },
            },
            WorkflowDef {
                name: "refactor-sprint",
                description:
                    "Three parallel perspectives on a refactoring: plan, architecture review, operational checklist.",
                default_autonomy: AutonomyLevel::Medium,
                execution: Execution::Graph(plan_refactor_sprint),
                schema: || {
                    json!({
                        "type": "object",
                        "required": ["scope"],
                        "properties": {
                            "scope": {"type": "string", "description": "What to refactor."},
                            "focus": {"type": "string"}
                        }
                    })
                },
            },
            WorkflowDef {
                name: "overthinker",
                description:
                    "Iterated planning loop alternating architect and implementer until the plan stops growing.",
                default_autonomy: AutonomyLevel::Low,
                execution: Execution::Iterative(plan_overthinker),
                schema: || {
                    json!({
                        "type": "object",
                        "required": ["problem"],
                        "properties": {
                            "problem": {"type": "string", "description": "The problem to plan for."},
                            "rounds": {"type": "integer", "minimum": 3, "maximum": 5, "default": 5}
                        }
                    })
                },
            },
        ]
    });
    &DEFS
}

/// Deserialize workflow parameters; `null` means "all defaults".
fn parse<T: for<'de> Deserialize<'de>>(value: &Value) -> Result<T, EngineError> {
    let value = if value.is_null() {
        json!({})
    } else {
        value.clone()
    };
    serde_json::from_value(value).map_err(|e| EngineError::InvalidArguments(e.to_string()))
}

fn require_non_empty(field: &str, value: &str) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        return Err(EngineError::InvalidArguments(format!(
            "'{field}' must not be empty"
        )));
    }
    Ok(())
}

// --- init-session ---

#[derive(Deserialize)]
struct InitSessionParams {
    #[serde(default)]
    focus: Option<String>,
    #[serde(default = "default_history_limit")]
    history_limit: usize,
}

fn default_history_limit() -> usize {
    15
}

fn plan_init_session(value: &Value) -> Result<Plan, EngineError> {
    let params: InitSessionParams = parse(value)?;
    if params.history_limit == 0 || params.history_limit > 200 {
        return Err(EngineError::InvalidArguments(
            "'history_limit' must be between 1 and 200".into(),
        ));
    }
    let focus = params.focus.unwrap_or_default();

    let summarize_prompt = Arc::new(move |outputs: &StepOutputs| {
        let history = outputs.get_or_unavailable("gather-git");
        let focus_line = if focus.is_empty() {
            String::new()
        } else {
            format!("Focus on: {focus}\n")
        };
        format!(
            "Summarize the current state of this repository for a developer \
             starting a session. {focus_line}Recent commits:\n{history}"
        )
    });

    Ok(Plan {
        title: "Session Briefing".into(),
        steps: vec![
            Step::git(
                "gather-git",
                "Recent History",
                GitQuery::RecentHistory {
                    limit: params.history_limit,
                },
            ),
            Step::ai(
                "summarize",
                "Repository Briefing",
                TaskCharacteristics::architect(),
                summarize_prompt,
            )
            .after(&["gather-git"]),
        ],
        deadline: DEFAULT_DEADLINE,
        compose: None,
    })
}

// --- parallel-review ---

#[derive(Deserialize)]
struct ParallelReviewParams {
    files: Vec<String>,
    #[serde(default)]
    focus: Option<String>,
    #[serde(default = "default_reviewers")]
    reviewers: usize,
}

fn default_reviewers() -> usize {
    3
}

fn review_prompt(files: &[String], focus: &Option<String>) -> String {
    let focus = focus.as_deref().unwrap_or("correctness and maintainability");
    format!(
        "Review the following files with a focus on {focus}. \
         Report concrete findings with file and line references.\nFiles: {}",
        files.join(", ")
    )
}

fn plan_parallel_review(value: &Value) -> Result<Plan, EngineError> {
    let params: ParallelReviewParams = parse(value)?;
    if params.files.is_empty() {
        return Err(EngineError::InvalidArguments(
            "'files' must contain at least one path".into(),
        ));
    }
    let n = params.reviewers.clamp(2, 3);
    let prompt_text = review_prompt(&params.files, &params.focus);

    // Every reviewer carries the same task; the selector's parallel rule
    // spreads the steps across the role tiers.
    let steps = (0..n)
        .map(|i| {
            let text = prompt_text.clone();
            Step::ai(
                &format!("reviewer-{}", i + 1),
                &format!("Review {}", i + 1),
                TaskCharacteristics::architect(),
                Arc::new(move |_| text.clone()),
            )
            .distinct_backend()
            .with_attachments(&params.files)
        })
        .collect();

    Ok(Plan {
        title: "Parallel Code Review".into(),
        steps,
        deadline: DEFAULT_DEADLINE,
        compose: None,
    })
}

// --- pre-commit-validate ---

#[derive(Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
enum Depth {
    Quick,
    Standard,
    Paranoid,
}

#[derive(Deserialize)]
struct PreCommitParams {
    #[serde(default = "default_depth")]
    depth: Depth,
}

fn default_depth() -> Depth {
    Depth::Standard
}

fn diff_prompt(intro: &str) -> super::step::PromptFn {
    let intro = intro.to_string();
    Arc::new(move |outputs: &StepOutputs| {
        format!(
            "{intro}\nStaged diff:\n{}",
            outputs.get_or_unavailable("staged-diff")
        )
    })
}

fn compose_pre_commit() -> ComposeFn {
    Arc::new(|outputs: &StepOutputs, skips| {
        let mut body = String::new();

        let verdict = match outputs
            .get("secrets")
            .and_then(|raw| serde_json::from_str::<Value>(raw.trim()).ok())
        {
            Some(v) if v.get("hasSecrets").and_then(Value::as_bool) == Some(false) => {
                "No secrets detected.".to_string()
            }
            Some(v) if v.get("hasSecrets").and_then(Value::as_bool) == Some(true) => {
                "Secrets detected in the staged diff. Do not commit.".to_string()
            }
            _ => "Secret scan inconclusive.".to_string(),
        };
        body.push_str(&format!("## Verdict\n\n{verdict}\n"));

        if let Some(quality) = outputs
            .get("quality")
            .and_then(|raw| serde_json::from_str::<Value>(raw.trim()).ok())
            && let Some(score) = quality.get("qualityScore").and_then(Value::as_i64)
        {
            body.push_str(&format!("Quality score: {score}/100\n"));
        }
        body.push('\n');

        for (name, section, output) in outputs.iter() {
            if name == "staged-diff" {
                continue;
            }
            body.push_str(&format!("## {}\n\n{}\n\n", section, output.trim_end()));
        }
        for skip in skips {
            body.push_str(&format!("{}\n", skip.render()));
        }
        body
    })
}

fn plan_pre_commit_validate(value: &Value) -> Result<Plan, EngineError> {
    let params: PreCommitParams = parse(value)?;

    let mut steps = vec![
        Step::git("staged-diff", "Staged Diff", GitQuery::StagedDiff),
        Step::ai(
            "secrets",
            "Secret Scan",
            TaskCharacteristics::tester(),
            diff_prompt(
                "Scan this staged diff for leaked credentials, tokens, or private keys. \
                 Respond with JSON: {\"hasSecrets\": bool, \"findings\": [..]}.",
            ),
        )
        .after(&["staged-diff"])
        .json_output(),
    ];

    if params.depth != Depth::Quick {
        steps.push(
            Step::ai(
                "quality",
                "Quality Review",
                TaskCharacteristics::architect(),
                diff_prompt(
                    "Assess the quality of this staged diff. \
                     Respond with JSON: {\"qualityScore\": 0-100, \"issues\": [..], \"positives\": [..]}.",
                ),
            )
            .after(&["staged-diff"])
            .json_output(),
        );
        steps.push(
            Step::ai(
                "breaking-changes",
                "Breaking Changes",
                TaskCharacteristics::implementer(),
                diff_prompt(
                    "Identify breaking API or behavior changes in this staged diff \
                     and the remediation each would need.",
                ),
            )
            .after(&["staged-diff"]),
        );
    }

    if params.depth == Depth::Paranoid {
        for (name, section, task) in [
            (
                "second-pass-secrets",
                "Second Pass: Secrets",
                TaskCharacteristics::architect(),
            ),
            (
                "second-pass-quality",
                "Second Pass: Quality",
                TaskCharacteristics::implementer(),
            ),
            (
                "second-pass-breaking",
                "Second Pass: Breaking Changes",
                TaskCharacteristics::tester(),
            ),
        ] {
            steps.push(
                Step::ai(
                    name,
                    section,
                    task,
                    Arc::new(move |outputs: &StepOutputs| {
                        format!(
                            "Cross-check the first-pass verdicts below against the diff. \
                             Flag anything the first pass missed.\n\
                             Secrets: {}\nQuality: {}\nBreaking: {}\nDiff:\n{}",
                            outputs.get_or_unavailable("secrets"),
                            outputs.get_or_unavailable("quality"),
                            outputs.get_or_unavailable("breaking-changes"),
                            outputs.get_or_unavailable("staged-diff"),
                        )
                    }),
                )
                .after(&["secrets", "quality", "breaking-changes"])
                .distinct_backend(),
            );
        }
    }

    Ok(Plan {
        title: "Pre-Commit Validation".into(),
        steps,
        deadline: DEFAULT_DEADLINE,
        compose: Some(compose_pre_commit()),
    })
}

// --- validate-last-commit ---

#[derive(Deserialize)]
struct ValidateLastCommitParams {
    #[serde(default)]
    focus: Option<String>,
    #[serde(default = "default_last_commit_reviewers")]
    reviewers: usize,
}

fn default_last_commit_reviewers() -> usize {
    2
}

fn plan_validate_last_commit(value: &Value) -> Result<Plan, EngineError> {
    let params: ValidateLastCommitParams = parse(value)?;
    let n = params.reviewers.clamp(2, 3);
    let focus = params
        .focus
        .unwrap_or_else(|| "regressions and unintended changes".into());

    let mut steps = vec![Step::git(
        "head-commit",
        "HEAD Commit",
        GitQuery::HeadCommit,
    )];
    for i in 0..n {
        let focus = focus.clone();
        steps.push(
            Step::ai(
                &format!("reviewer-{}", i + 1),
                &format!("Review {}", i + 1),
                TaskCharacteristics::architect(),
                Arc::new(move |outputs: &StepOutputs| {
                    format!(
                        "Review the last commit with a focus on {focus}.\nCommit:\n{}",
                        outputs.get_or_unavailable("head-commit")
                    )
                }),
            )
            .after(&["head-commit"])
            .distinct_backend(),
        );
    }

    Ok(Plan {
        title: "Last Commit Validation".into(),
        steps,
        deadline: DEFAULT_DEADLINE,
        compose: None,
    })
}

// --- triangulated-review ---

#[derive(Deserialize)]
struct TriangulatedParams {
    target: String,
    #[serde(default)]
    focus: Option<String>,
}

fn compose_triangulated() -> ComposeFn {
    Arc::new(|outputs: &StepOutputs, skips| {
        let mut body = String::new();
        for name in ["architect-view", "implementer-view", "tester-view"] {
            if let Some(out) = outputs.get(name) {
                let section = outputs
                    .iter()
                    .find(|(n, _, _)| *n == name)
                    .map(|(_, s, _)| s)
                    .unwrap_or(name);
                body.push_str(&format!("## {}\n\n{}\n\n", section, out.trim_end()));
            }
        }

        // Literal consensus: lines repeated by at least two reviewers.
        let mut line_counts: HashMap<&str, usize> = HashMap::new();
        for (_, _, output) in outputs.iter() {
            let mut seen: Vec<&str> = Vec::new();
            for line in output.lines() {
                let line = line.trim();
                if line.len() > 8 && !seen.contains(&line) {
                    seen.push(line);
                    *line_counts.entry(line).or_insert(0) += 1;
                }
            }
        }
        let mut agreements: Vec<&str> = line_counts
            .iter()
            .filter(|(_, count)| **count >= 2)
            .map(|(line, _)| *line)
            .collect();
        agreements.sort_unstable();

        body.push_str("## Agreements and Disagreements\n\n");
        if agreements.is_empty() {
            body.push_str(
                "No literal agreement across reviewers; treat each section above as an independent view.\n",
            );
        } else {
            for line in agreements.iter().take(10) {
                body.push_str(&format!("- agreed: {line}\n"));
            }
        }
        body.push('\n');

        for skip in skips {
            body.push_str(&format!("{}\n", skip.render()));
        }
        body
    })
}

fn plan_triangulated_review(value: &Value) -> Result<Plan, EngineError> {
    let params: TriangulatedParams = parse(value)?;
    require_non_empty("target", &params.target)?;
    let focus = params.focus.unwrap_or_else(|| "correctness".into());
    let prompt = format!(
        "Independently review the following with a focus on {focus}. \
         Be specific and cite evidence.\n{}",
        params.target
    );

    let views = [
        ("architect-view", "Architect View", TaskCharacteristics::architect()),
        (
            "implementer-view",
            "Implementer View",
            TaskCharacteristics::implementer(),
        ),
        ("tester-view", "Tester View", TaskCharacteristics::tester()),
    ];
    let steps = views
        .into_iter()
        .map(|(name, section, task)| {
            let text = prompt.clone();
            Step::ai(name, section, task, Arc::new(move |_| text.clone())).distinct_backend()
        })
        .collect();

    Ok(Plan {
        title: "Triangulated Review".into(),
        steps,
        deadline: DEFAULT_DEADLINE,
        compose: Some(compose_triangulated()),
    })
}

// --- feature-design ---

#[derive(Deserialize)]
struct FeatureDesignParams {
    feature: String,
    #[serde(default)]
    target_files: Vec<String>,
    #[serde(default)]
    context: Option<String>,
}

fn plan_feature_design(value: &Value) -> Result<Plan, EngineError> {
    let params: FeatureDesignParams = parse(value)?;
    require_non_empty("feature", &params.feature)?;
    let feature = params.feature.clone();
    let files = params.target_files.join(", ");
    let context = params.context.unwrap_or_default();

    let design_prompt = {
        let feature = feature.clone();
        let files = files.clone();
        let context = context.clone();
        Arc::new(move |_: &StepOutputs| {
            format!(
                "Produce a feature design for: {feature}\n\
                 Target files: {files}\nContext: {context}\n\
                 Cover data model, interfaces, and tradeoffs."
            )
        })
    };
    let plan_prompt = {
        let feature = feature.clone();
        Arc::new(move |outputs: &StepOutputs| {
            format!(
                "Turn this design into a concrete implementation plan for '{feature}' \
                 with ordered steps and file-level changes.\nDesign:\n{}",
                outputs.get_or_unavailable("design")
            )
        })
    };
    let test_prompt = Arc::new(move |outputs: &StepOutputs| {
        format!(
            "Write a test plan covering the design and implementation plan below. \
             Name concrete cases, edge cases first.\nDesign:\n{}\nPlan:\n{}",
            outputs.get_or_unavailable("design"),
            outputs.get_or_unavailable("plan"),
        )
    });

    Ok(Plan {
        title: "Feature Design".into(),
        steps: vec![
            Step::ai(
                "design",
                "Feature Design",
                TaskCharacteristics::architect(),
                design_prompt,
            )
            .fatal(),
            Step::ai(
                "plan",
                "Implementation Plan",
                TaskCharacteristics::implementer(),
                plan_prompt,
            )
            .after(&["design"]),
            Step::ai(
                "tests",
                "Test Plan",
                TaskCharacteristics::tester(),
                test_prompt,
            )
            .after(&["design", "plan"]),
        ],
        deadline: LONG_DEADLINE,
        compose: None,
    })
}

// --- bug-hunt ---

#[derive(Deserialize)]
struct BugHuntParams {
    symptoms: String,
    #[serde(default)]
    suspected_files: Vec<String>,
}

fn plan_bug_hunt(value: &Value) -> Result<Plan, EngineError> {
    let params: BugHuntParams = parse(value)?;
    require_non_empty("symptoms", &params.symptoms)?;
    let symptoms = params.symptoms.clone();
    let have_suspects = !params.suspected_files.is_empty();
    let suspects = params.suspected_files.join(", ");

    let mut steps = Vec::new();
    if !have_suspects {
        let symptoms = symptoms.clone();
        steps.push(Step::ai(
            "locate",
            "Suspect Files",
            TaskCharacteristics::tester().with_domain("debugging"),
            Arc::new(move |_| {
                format!(
                    "Given these symptoms, list the most likely files involved, \
                     one per line with a short reason.\nSymptoms: {symptoms}"
                )
            }),
        ));
    }

    let hypothesis_prompt = {
        let symptoms = symptoms.clone();
        let suspects = suspects.clone();
        Arc::new(move |outputs: &StepOutputs| {
            let candidates = if suspects.is_empty() {
                outputs.get_or_unavailable("locate").to_string()
            } else {
                suspects.clone()
            };
            format!(
                "Form a testable failure hypothesis.\nSymptoms: {symptoms}\n\
                 Candidate files: {candidates}"
            )
        })
    };
    let mut hypothesis = Step::ai(
        "hypothesis",
        "Hypothesis",
        TaskCharacteristics::tester().with_domain("debugging"),
        hypothesis_prompt,
    );
    if !have_suspects {
        hypothesis = hypothesis.after(&["locate"]);
    }
    steps.push(hypothesis);

    let root_cause_prompt = {
        let symptoms = symptoms.clone();
        Arc::new(move |outputs: &StepOutputs| {
            format!(
                "Perform a root cause analysis for these symptoms, \
                 reasoning from the hypothesis.\nSymptoms: {symptoms}\n\
                 Hypothesis:\n{}",
                outputs.get_or_unavailable("hypothesis")
            )
        })
    };
    steps.push(
        Step::ai(
            "root-cause",
            "Root Cause Analysis",
            TaskCharacteristics::architect().with_domain("debugging"),
            root_cause_prompt,
        )
        .after(&["hypothesis"]),
    );

    steps.push(
        Step::ai(
            "remediation",
            "Remediation",
            TaskCharacteristics::implementer().with_domain("debugging"),
            Arc::new(move |outputs: &StepOutputs| {
                format!(
                    "Draft a minimal remediation for the root cause below. \
                     List the exact edits.\n{}",
                    outputs.get_or_unavailable("root-cause")
                )
            }),
        )
        .after(&["root-cause"]),
    );

    Ok(Plan {
        title: "Bug Hunt".into(),
        steps,
        deadline: DEFAULT_DEADLINE,
        compose: None,
    })
}

// --- auto-remediation ---

#[derive(Deserialize)]
struct AutoRemediationParams {
    symptoms: String,
    #[serde(default = "default_max_actions")]
    max_actions: u32,
}

fn default_max_actions() -> u32 {
    3
}

fn plan_auto_remediation(value: &Value) -> Result<Plan, EngineError> {
    let params: AutoRemediationParams = parse(value)?;
    require_non_empty("symptoms", &params.symptoms)?;
    if params.max_actions == 0 {
        return Err(EngineError::InvalidArguments(
            "'max_actions' must be at least 1".into(),
        ));
    }
    let symptoms = params.symptoms.clone();
    let max_actions = params.max_actions;

    Ok(Plan {
        title: "Auto Remediation".into(),
        steps: vec![Step::ai(
            "remediate",
            "Auto Remediation Plan",
            TaskCharacteristics::implementer(),
            Arc::new(move |_| {
                format!(
                    "Draft an automated remediation plan with at most {max_actions} \
                     actions for these symptoms. Order actions by risk, lowest first.\n\
                     Symptoms: {symptoms}"
                )
            }),
        )
        .fatal()],
        deadline: DEFAULT_DEADLINE,
        compose: None,
    })
}

// --- refactor-sprint ---

#[derive(Deserialize)]
struct RefactorSprintParams {
    scope: String,
    #[serde(default)]
    focus: Option<String>,
}

fn plan_refactor_sprint(value: &Value) -> Result<Plan, EngineError> {
    let params: RefactorSprintParams = parse(value)?;
    require_non_empty("scope", &params.scope)?;
    let scope = params.scope.clone();
    let focus = params.focus.unwrap_or_else(|| "maintainability".into());

    let mk_prompt = |instruction: &str| {
        let scope = scope.clone();
        let focus = focus.clone();
        let instruction = instruction.to_string();
        Arc::new(move |_: &StepOutputs| {
            format!("{instruction}\nScope: {scope}\nFocus: {focus}")
        })
    };

    Ok(Plan {
        title: "Refactor Sprint".into(),
        steps: vec![
            Step::ai(
                "refactoring-plan",
                "Refactoring Plan",
                TaskCharacteristics::implementer(),
                mk_prompt("Produce a step-by-step refactoring plan with file-level moves."),
            )
            .distinct_backend(),
            Step::ai(
                "architecture-review",
                "Architecture Review",
                TaskCharacteristics::architect(),
                mk_prompt("Review the architecture implications of this refactoring."),
            )
            .distinct_backend(),
            Step::ai(
                "operational-checklist",
                "Operational Checklist",
                TaskCharacteristics::tester(),
                mk_prompt("Write the operational checklist to land this refactoring safely."),
            )
            .distinct_backend(),
        ],
        deadline: LONG_DEADLINE,
        compose: None,
    })
}

// --- overthinker ---

#[derive(Deserialize)]
struct OverthinkerParams {
    problem: String,
    #[serde(default = "default_rounds")]
    rounds: usize,
}

fn default_rounds() -> usize {
    5
}

fn plan_overthinker(value: &Value) -> Result<IterativePlan, EngineError> {
    let params: OverthinkerParams = parse(value)?;
    require_non_empty("problem", &params.problem)?;
    if !(3..=5).contains(&params.rounds) {
        return Err(EngineError::InvalidArguments(
            "'rounds' must be between 3 and 5".into(),
        ));
    }
    Ok(IterativePlan {
        title: "Overthinker".into(),
        problem: params.problem,
        min_rounds: 3,
        max_rounds: params.rounds,
        deadline: DEFAULT_DEADLINE,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_workflows_registered() {
        let names: Vec<&str> = all().iter().map(|d| d.name).collect();
        assert_eq!(
            names,
            vec![
                "init-session",
                "parallel-review",
                "pre-commit-validate",
                "validate-last-commit",
                "triangulated-review",
                "feature-design",
                "bug-hunt",
                "auto-remediation",
                "refactor-sprint",
                "overthinker",
            ]
        );
        assert!(find("bug-hunt").is_some());
        assert!(find("nonexistent").is_none());
    }

    #[test]
    fn test_schemas_are_objects() {
        for def in all() {
            let schema = (def.schema)();
            assert_eq!(
                schema.get("type").and_then(Value::as_str),
                Some("object"),
                "schema of {} should be an object",
                def.name
            );
        }
    }

    #[test]
    fn test_parallel_review_requires_files() {
        let err = plan_parallel_review(&json!({"files": []})).unwrap_err();
        assert!(matches!(err, EngineError::InvalidArguments(_)));
        assert!(plan_parallel_review(&json!({})).is_err());

        let plan = plan_parallel_review(&json!({"files": ["a.rs"], "reviewers": 2})).unwrap();
        assert_eq!(plan.steps.len(), 2);
        assert!(plan.steps.iter().all(|s| s.distinct));
    }

    #[test]
    fn test_reviewers_clamped_to_two_or_three() {
        let plan = plan_parallel_review(&json!({"files": ["a"], "reviewers": 9})).unwrap();
        assert_eq!(plan.steps.len(), 3);
        let plan = plan_parallel_review(&json!({"files": ["a"], "reviewers": 1})).unwrap();
        assert_eq!(plan.steps.len(), 2);
    }

    #[test]
    fn test_pre_commit_depths() {
        let quick = plan_pre_commit_validate(&json!({"depth": "quick"})).unwrap();
        assert_eq!(quick.steps.len(), 2); // diff + secrets only

        let standard = plan_pre_commit_validate(&json!({})).unwrap();
        assert_eq!(standard.steps.len(), 4);

        let paranoid = plan_pre_commit_validate(&json!({"depth": "paranoid"})).unwrap();
        assert_eq!(paranoid.steps.len(), 7);

        assert!(plan_pre_commit_validate(&json!({"depth": "extreme"})).is_err());
    }

    #[test]
    fn test_feature_design_sequential_deps() {
        let plan = plan_feature_design(&json!({"feature": "dark mode"})).unwrap();
        assert_eq!(plan.steps.len(), 3);
        assert_eq!(plan.steps[0].section, "Feature Design");
        assert_eq!(plan.steps[1].section, "Implementation Plan");
        assert_eq!(plan.steps[1].deps, vec!["design"]);
        assert_eq!(plan.deadline, LONG_DEADLINE);

        assert!(plan_feature_design(&json!({"feature": "  "})).is_err());
    }

    #[test]
    fn test_bug_hunt_skips_locate_with_suspects() {
        let with_suspects =
            plan_bug_hunt(&json!({"symptoms": "panic", "suspected_files": ["package.json"]}))
                .unwrap();
        assert!(!with_suspects.steps.iter().any(|s| s.name == "locate"));
        // hypothesis has no deps when suspects are given.
        let hypothesis = with_suspects
            .steps
            .iter()
            .find(|s| s.name == "hypothesis")
            .unwrap();
        assert!(hypothesis.deps.is_empty());

        let without = plan_bug_hunt(&json!({"symptoms": "panic"})).unwrap();
        assert!(without.steps.iter().any(|s| s.name == "locate"));
        assert!(without.steps.iter().any(|s| s.section == "Root Cause Analysis"));
    }

    #[test]
    fn test_auto_remediation_validation() {
        assert!(plan_auto_remediation(&json!({"symptoms": ""})).is_err());
        assert!(plan_auto_remediation(&json!({"symptoms": "leak", "max_actions": 0})).is_err());
        let plan = plan_auto_remediation(&json!({"symptoms": "leak"})).unwrap();
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].section, "Auto Remediation Plan");
    }

    #[test]
    fn test_overthinker_round_bounds() {
        assert!(plan_overthinker(&json!({"problem": "scale", "rounds": 2})).is_err());
        assert!(plan_overthinker(&json!({"problem": "scale", "rounds": 6})).is_err());
        let plan = plan_overthinker(&json!({"problem": "scale"})).unwrap();
        assert_eq!(plan.min_rounds, 3);
        assert_eq!(plan.max_rounds, 5);
    }

    #[test]
    fn test_prompts_thread_prior_outputs() {
        let plan = plan_feature_design(&json!({"feature": "search"})).unwrap();
        let mut outputs = StepOutputs::new();
        outputs.insert("design", "Feature Design", "THE-DESIGN".into());

        let prompt = (plan.steps[1].prompt)(&outputs);
        assert!(prompt.contains("THE-DESIGN"));
    }

    #[test]
    fn test_pre_commit_compose_verdict() {
        let compose = compose_pre_commit();
        let mut outputs = StepOutputs::new();
        outputs.insert("staged-diff", "Staged Diff", "diff".into());
        outputs.insert(
            "secrets",
            "Secret Scan",
            r#"{"hasSecrets": false, "findings": []}"#.into(),
        );
        outputs.insert(
            "quality",
            "Quality Review",
            r#"{"qualityScore": 80, "issues": [], "positives": ["Good"]}"#.into(),
        );

        let body = compose(&outputs, &[]);
        assert!(body.contains("No secrets detected"));
        assert!(body.contains("Quality score: 80/100"));
        // The raw diff is not re-rendered as a section.
        assert!(!body.contains("## Staged Diff"));
    }

    #[test]
    fn test_triangulated_compose_finds_agreement() {
        let compose = compose_triangulated();
        let mut outputs = StepOutputs::new();
        outputs.insert(
            "architect-view",
            "Architect View",
            "the error handling is missing\nunique arch note".into(),
        );
        outputs.insert(
            "tester-view",
            "Tester View",
            "the error handling is missing\nunique test note".into(),
        );

        let body = compose(&outputs, &[]);
        assert!(body.contains("Agreements and Disagreements"));
        assert!(body.contains("agreed: the error handling is missing"));
    }
}
