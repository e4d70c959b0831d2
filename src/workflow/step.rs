use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::error::EngineError;
use crate::gitops::GitQuery;
use crate::selector::TaskCharacteristics;

/// Builds a step's prompt from the outputs of completed steps.
pub type PromptFn = Arc<dyn Fn(&StepOutputs) -> String + Send + Sync>;

/// Builds the composed body from step outputs and skip notes. Workflows
/// without a custom composer get the default section renderer.
pub type ComposeFn = Arc<dyn Fn(&StepOutputs, &[SkipNote]) -> String + Send + Sync>;

/// What a step does.
#[derive(Clone)]
pub enum StepKind {
    /// One backend invocation, role-selected from the step's task.
    AiCall,
    /// A read-only git query through the process runner.
    GitRead(GitQuery),
}

/// A declared workflow step. The graph is static per workflow; only the
/// prompts depend on parameters and prior outputs.
#[derive(Clone)]
pub struct Step {
    pub name: String,
    pub kind: StepKind,
    pub deps: Vec<String>,
    /// Drives role-based backend selection for AiCall steps.
    pub task: TaskCharacteristics,
    /// Section title this step's output composes under.
    pub section: String,
    /// A failing step aborts the whole workflow instead of degrading.
    pub fatal: bool,
    /// Steps in the same layer marked distinct never share a backend.
    pub distinct: bool,
    pub output_format: Option<String>,
    pub attachments: Vec<PathBuf>,
    pub prompt: PromptFn,
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("deps", &self.deps)
            .field("section", &self.section)
            .field("fatal", &self.fatal)
            .field("distinct", &self.distinct)
            .field("output_format", &self.output_format)
            .field("attachments", &self.attachments)
            .finish()
    }
}

impl Step {
    pub fn ai(name: &str, section: &str, task: TaskCharacteristics, prompt: PromptFn) -> Self {
        Self {
            name: name.to_string(),
            kind: StepKind::AiCall,
            deps: Vec::new(),
            task,
            section: section.to_string(),
            fatal: false,
            distinct: false,
            output_format: None,
            attachments: Vec::new(),
            prompt,
        }
    }

    pub fn git(name: &str, section: &str, query: GitQuery) -> Self {
        Self {
            name: name.to_string(),
            kind: StepKind::GitRead(query),
            deps: Vec::new(),
            task: TaskCharacteristics::default(),
            section: section.to_string(),
            fatal: false,
            distinct: false,
            output_format: None,
            attachments: Vec::new(),
            prompt: Arc::new(|_| String::new()),
        }
    }

    pub fn after(mut self, deps: &[&str]) -> Self {
        self.deps = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn distinct_backend(mut self) -> Self {
        self.distinct = true;
        self
    }

    pub fn json_output(mut self) -> Self {
        self.output_format = Some("json".into());
        self
    }

    pub fn with_attachments(mut self, files: &[String]) -> Self {
        self.attachments = files.iter().map(PathBuf::from).collect();
        self
    }

    pub fn fatal(mut self) -> Self {
        self.fatal = true;
        self
    }
}

/// A planned workflow: validated steps plus composition.
#[derive(Clone)]
pub struct Plan {
    pub title: String,
    pub steps: Vec<Step>,
    pub deadline: Duration,
    pub compose: Option<ComposeFn>,
}

impl std::fmt::Debug for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plan")
            .field("title", &self.title)
            .field("steps", &self.steps)
            .field("deadline", &self.deadline)
            .finish()
    }
}

/// A degraded step, noted in the composed output.
#[derive(Debug, Clone)]
pub struct SkipNote {
    pub step: String,
    pub reason: String,
}

impl SkipNote {
    pub fn render(&self) -> String {
        format!("STEP {} SKIPPED: {}", self.step, self.reason)
    }
}

/// Captured step outputs in completion order, indexed by step name.
#[derive(Default, Clone)]
pub struct StepOutputs {
    ordered: Vec<(String, String, String)>,
    by_name: HashMap<String, usize>,
}

impl StepOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, section: &str, output: String) {
        self.by_name.insert(name.to_string(), self.ordered.len());
        self.ordered
            .push((name.to_string(), section.to_string(), output));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.by_name
            .get(name)
            .map(|i| self.ordered[*i].2.as_str())
    }

    /// The output of `name`, or a placeholder when the step was skipped.
    pub fn get_or_unavailable(&self, name: &str) -> &str {
        self.get(name).unwrap_or("(unavailable)")
    }

    /// `(step, section, output)` triples in completion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, &str)> {
        self.ordered
            .iter()
            .map(|(n, s, o)| (n.as_str(), s.as_str(), o.as_str()))
    }

}

/// Group steps into dependency layers: every step in layer k depends only
/// on steps in layers < k. Unknown dependencies and cycles are rejected.
pub fn compute_layers(steps: &[Step]) -> Result<Vec<Vec<usize>>, EngineError> {
    let index: HashMap<&str, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.name.as_str(), i))
        .collect();
    if index.len() != steps.len() {
        return Err(EngineError::InvalidArguments(
            "duplicate step names in workflow graph".into(),
        ));
    }

    for step in steps {
        for dep in &step.deps {
            if !index.contains_key(dep.as_str()) {
                return Err(EngineError::InvalidArguments(format!(
                    "step '{}' depends on unknown step '{}'",
                    step.name, dep
                )));
            }
        }
    }

    let mut placed: HashSet<usize> = HashSet::new();
    let mut layers: Vec<Vec<usize>> = Vec::new();

    while placed.len() < steps.len() {
        let mut layer: Vec<usize> = Vec::new();
        for (i, step) in steps.iter().enumerate() {
            if placed.contains(&i) {
                continue;
            }
            let ready = step
                .deps
                .iter()
                .all(|d| placed.contains(&index[d.as_str()]));
            if ready {
                layer.push(i);
            }
        }
        if layer.is_empty() {
            return Err(EngineError::InvalidArguments(
                "workflow graph contains a dependency cycle".into(),
            ));
        }
        placed.extend(layer.iter().copied());
        layers.push(layer);
    }

    Ok(layers)
}

/// Default composition: one `##` section per completed step, in plan
/// order, followed by skip notes.
pub fn default_compose(plan: &Plan, outputs: &StepOutputs, skips: &[SkipNote]) -> String {
    let mut body = String::new();
    for step in &plan.steps {
        if let Some(out) = outputs.get(&step.name) {
            body.push_str(&format!("## {}\n\n{}\n\n", step.section, out.trim_end()));
        }
    }
    for skip in skips {
        body.push_str(&format!("{}\n", skip.render()));
    }
    body
}
