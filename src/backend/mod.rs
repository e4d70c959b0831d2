pub mod dispatch;
pub mod process;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::permissions::AutonomyLevel;

/// Default subprocess deadline; droid gets a longer one because its exec
/// mode routinely runs multi-minute edit sessions.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);
pub const DROID_TIMEOUT: Duration = Duration::from_secs(900);

/// Per-backend prompt length cap in bytes.
pub const DEFAULT_PROMPT_CAP: usize = 100 * 1024;

/// How a backend accepts file attachments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FileMode {
    /// Each attachment becomes a `--file PATH` argv pair.
    CliFlag,
    /// Paths are prepended to the prompt as a bracketed list. Used where
    /// the CLI's own `--file` flag means "read the prompt *from* a file".
    EmbedInPrompt,
    /// Attachments are silently dropped.
    None,
}

/// Capability record for one backend.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Capabilities {
    pub supports_files: bool,
    pub supports_streaming: bool,
    pub supports_sandbox: bool,
    pub supports_json: bool,
    pub file_mode: FileMode,
}

/// Immutable descriptor for a registered backend.
#[derive(Debug, Clone, Serialize)]
pub struct BackendDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    /// Program name the CLI is invoked as.
    pub program: &'static str,
    pub capabilities: Capabilities,
    #[serde(skip)]
    pub timeout: Duration,
    #[serde(skip)]
    pub prompt_cap: usize,
}

/// Droid's `--auto` escalation levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoLevel {
    Low,
    Medium,
    High,
}

impl AutoLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AutoLevel::Low => "low",
            AutoLevel::Medium => "medium",
            AutoLevel::High => "high",
        }
    }
}

/// Common input every executor builds its command line from.
#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    pub prompt: String,
    pub model: Option<String>,
    pub sandbox: bool,
    pub output_format: Option<String>,
    pub attachments: Vec<PathBuf>,
    pub auto_approve: bool,
    pub auto: Option<AutoLevel>,
    pub session_id: Option<String>,
    pub skip_permissions_unsafe: bool,
    pub cwd: Option<PathBuf>,
}

impl ExecRequest {
    #[allow(dead_code)]
    pub fn with_prompt(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    /// Whether this request carries a flag that grants the CLI write scope.
    pub fn wants_force(&self) -> bool {
        self.auto_approve || self.auto == Some(AutoLevel::High)
    }
}

/// One variant per external CLI: builds argv from a sanitized `ExecRequest`.
/// The prompt passed in is the post-redaction prompt; the attachments have
/// already passed path validation.
pub trait BackendExecutor: Send + Sync {
    fn descriptor(&self) -> &BackendDescriptor;

    /// Build the argv (excluding the program itself) and the final prompt
    /// position for this CLI.
    fn argv(&self, req: &ExecRequest) -> Vec<String>;
}

/// Prepend an attachment list to the prompt for embed-in-prompt backends.
fn embed_attachments(prompt: &str, attachments: &[PathBuf]) -> String {
    if attachments.is_empty() {
        return prompt.to_string();
    }
    let listed: Vec<String> = attachments
        .iter()
        .map(|p| p.display().to_string())
        .collect();
    format!("[files: {}]\n{}", listed.join(", "), prompt)
}

// --- gemini ---

struct GeminiExecutor {
    descriptor: BackendDescriptor,
}

impl BackendExecutor for GeminiExecutor {
    fn descriptor(&self) -> &BackendDescriptor {
        &self.descriptor
    }

    fn argv(&self, req: &ExecRequest) -> Vec<String> {
        let mut argv = Vec::new();
        if let Some(model) = &req.model {
            argv.push("--model".into());
            argv.push(model.clone());
        }
        if req.sandbox {
            argv.push("-s".into());
        }
        argv.push(embed_attachments(&req.prompt, &req.attachments));
        argv
    }
}

// --- cursor-agent ---

struct CursorExecutor {
    descriptor: BackendDescriptor,
}

impl BackendExecutor for CursorExecutor {
    fn descriptor(&self) -> &BackendDescriptor {
        &self.descriptor
    }

    fn argv(&self, req: &ExecRequest) -> Vec<String> {
        let mut argv = vec!["--print".to_string()];
        if req.auto_approve {
            argv.push("--force".into());
        }
        argv.push("--output-format".into());
        argv.push(req.output_format.clone().unwrap_or_else(|| "text".into()));
        for path in &req.attachments {
            argv.push("--file".into());
            argv.push(path.display().to_string());
        }
        argv.push(req.prompt.clone());
        argv
    }
}

// --- droid ---

struct DroidExecutor {
    descriptor: BackendDescriptor,
}

impl BackendExecutor for DroidExecutor {
    fn descriptor(&self) -> &BackendDescriptor {
        &self.descriptor
    }

    fn argv(&self, req: &ExecRequest) -> Vec<String> {
        let mut argv = vec!["exec".to_string()];
        argv.push("--output-format".into());
        argv.push(req.output_format.clone().unwrap_or_else(|| "text".into()));
        argv.push("--auto".into());
        argv.push(req.auto.unwrap_or(AutoLevel::Low).as_str().into());
        if let Some(session) = &req.session_id {
            argv.push("--session-id".into());
            argv.push(session.clone());
        }
        if req.skip_permissions_unsafe {
            argv.push("--skip-permissions-unsafe".into());
        }
        if let Some(cwd) = &req.cwd {
            argv.push("--cwd".into());
            argv.push(cwd.display().to_string());
        }
        argv.push(embed_attachments(&req.prompt, &req.attachments));
        argv
    }
}

// --- qwen ---

struct QwenExecutor {
    descriptor: BackendDescriptor,
}

impl BackendExecutor for QwenExecutor {
    fn descriptor(&self) -> &BackendDescriptor {
        &self.descriptor
    }

    fn argv(&self, req: &ExecRequest) -> Vec<String> {
        let mut argv = Vec::new();
        if req.sandbox {
            argv.push("-s".into());
        }
        if req.auto_approve {
            argv.push("-y".into());
        }
        if let Some(format) = &req.output_format {
            argv.push("-o".into());
            argv.push(format.clone());
        }
        argv.push(embed_attachments(&req.prompt, &req.attachments));
        argv
    }
}

// --- rovodev ---

struct RovodevExecutor {
    descriptor: BackendDescriptor,
}

impl BackendExecutor for RovodevExecutor {
    fn descriptor(&self) -> &BackendDescriptor {
        &self.descriptor
    }

    fn argv(&self, req: &ExecRequest) -> Vec<String> {
        let mut argv = vec!["rovodev".to_string(), "run".to_string()];
        if req.auto_approve {
            argv.push("--yolo".into());
        }
        argv.push(req.prompt.clone());
        argv
    }
}

/// Registry of backend executors, keyed by stable name. Descriptors are
/// immutable after registration.
pub struct ExecutorRegistry {
    executors: BTreeMap<&'static str, Arc<dyn BackendExecutor>>,
}

impl ExecutorRegistry {
    /// The five built-in CLI executors.
    pub fn builtin() -> Self {
        let mut executors: BTreeMap<&'static str, Arc<dyn BackendExecutor>> = BTreeMap::new();

        executors.insert(
            "gemini",
            Arc::new(GeminiExecutor {
                descriptor: BackendDescriptor {
                    name: "gemini",
                    description: "Google Gemini CLI: long-context architectural reasoning",
                    program: "gemini",
                    capabilities: Capabilities {
                        supports_files: true,
                        supports_streaming: true,
                        supports_sandbox: true,
                        supports_json: false,
                        file_mode: FileMode::EmbedInPrompt,
                    },
                    timeout: DEFAULT_TIMEOUT,
                    prompt_cap: DEFAULT_PROMPT_CAP,
                },
            }),
        );

        executors.insert(
            "cursor",
            Arc::new(CursorExecutor {
                descriptor: BackendDescriptor {
                    name: "cursor",
                    description: "Cursor agent CLI: editor-grade code review and edits",
                    program: "cursor-agent",
                    capabilities: Capabilities {
                        supports_files: true,
                        supports_streaming: true,
                        supports_sandbox: false,
                        supports_json: true,
                        file_mode: FileMode::CliFlag,
                    },
                    timeout: DEFAULT_TIMEOUT,
                    prompt_cap: DEFAULT_PROMPT_CAP,
                },
            }),
        );

        executors.insert(
            "droid",
            Arc::new(DroidExecutor {
                descriptor: BackendDescriptor {
                    name: "droid",
                    description: "Factory droid CLI: autonomous implementation sessions",
                    program: "droid",
                    capabilities: Capabilities {
                        supports_files: true,
                        supports_streaming: true,
                        supports_sandbox: false,
                        supports_json: true,
                        // droid's --file reads the prompt from a file, so
                        // attachments are embedded instead.
                        file_mode: FileMode::EmbedInPrompt,
                    },
                    timeout: DROID_TIMEOUT,
                    prompt_cap: DEFAULT_PROMPT_CAP,
                },
            }),
        );

        executors.insert(
            "qwen",
            Arc::new(QwenExecutor {
                descriptor: BackendDescriptor {
                    name: "qwen",
                    description: "Qwen coder CLI: fast checks and test-tier tasks",
                    program: "qwen",
                    capabilities: Capabilities {
                        supports_files: true,
                        supports_streaming: true,
                        supports_sandbox: true,
                        supports_json: true,
                        file_mode: FileMode::EmbedInPrompt,
                    },
                    timeout: DEFAULT_TIMEOUT,
                    prompt_cap: DEFAULT_PROMPT_CAP,
                },
            }),
        );

        executors.insert(
            "rovodev",
            Arc::new(RovodevExecutor {
                descriptor: BackendDescriptor {
                    name: "rovodev",
                    description: "Atlassian rovodev CLI via acli",
                    program: "acli",
                    capabilities: Capabilities {
                        supports_files: false,
                        supports_streaming: true,
                        supports_sandbox: false,
                        supports_json: false,
                        file_mode: FileMode::None,
                    },
                    timeout: DEFAULT_TIMEOUT,
                    prompt_cap: DEFAULT_PROMPT_CAP,
                },
            }),
        );

        Self { executors }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn BackendExecutor>> {
        self.executors.get(name).cloned()
    }

    /// All registered backend names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.executors.keys().map(|k| k.to_string()).collect()
    }

    pub fn descriptors(&self) -> Vec<BackendDescriptor> {
        self.executors
            .values()
            .map(|e| e.descriptor().clone())
            .collect()
    }
}

/// Map the tool-facing autonomy level onto droid's `--auto` scale.
pub fn auto_level_for(autonomy: AutonomyLevel) -> AutoLevel {
    match autonomy {
        AutonomyLevel::ReadOnly | AutonomyLevel::Low => AutoLevel::Low,
        AutonomyLevel::Medium => AutoLevel::Medium,
        AutonomyLevel::High => AutoLevel::High,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ExecutorRegistry {
        ExecutorRegistry::builtin()
    }

    #[test]
    fn test_builtin_names() {
        assert_eq!(
            registry().names(),
            vec!["cursor", "droid", "gemini", "qwen", "rovodev"]
        );
    }

    #[test]
    fn test_gemini_argv_shape() {
        let exec = registry().get("gemini").unwrap();
        let req = ExecRequest {
            prompt: "summarize".into(),
            model: Some("gemini-2.5-pro".into()),
            sandbox: true,
            ..Default::default()
        };
        assert_eq!(
            exec.argv(&req),
            vec!["--model", "gemini-2.5-pro", "-s", "summarize"]
        );
    }

    #[test]
    fn test_cursor_argv_files_as_flags() {
        let exec = registry().get("cursor").unwrap();
        let req = ExecRequest {
            prompt: "review".into(),
            output_format: Some("json".into()),
            attachments: vec![PathBuf::from("a.rs"), PathBuf::from("b.rs")],
            ..Default::default()
        };
        assert_eq!(
            exec.argv(&req),
            vec![
                "--print",
                "--output-format",
                "json",
                "--file",
                "a.rs",
                "--file",
                "b.rs",
                "review"
            ]
        );
    }

    #[test]
    fn test_cursor_force_only_with_auto_approve() {
        let exec = registry().get("cursor").unwrap();
        let mut req = ExecRequest::with_prompt("x");
        assert!(!exec.argv(&req).contains(&"--force".to_string()));
        req.auto_approve = true;
        assert!(exec.argv(&req).contains(&"--force".to_string()));
    }

    #[test]
    fn test_droid_argv_embeds_attachments() {
        let exec = registry().get("droid").unwrap();
        let req = ExecRequest {
            prompt: "fix the bug".into(),
            attachments: vec![PathBuf::from("src/lib.rs")],
            auto: Some(AutoLevel::Medium),
            session_id: Some("s-1".into()),
            cwd: Some(PathBuf::from("/work")),
            ..Default::default()
        };
        let argv = exec.argv(&req);
        assert_eq!(argv[0], "exec");
        assert!(argv.contains(&"--auto".to_string()));
        assert!(argv.contains(&"medium".to_string()));
        assert!(argv.contains(&"--session-id".to_string()));
        assert!(argv.contains(&"--cwd".to_string()));
        // No --file pairs; the path rides in the prompt.
        assert!(!argv.contains(&"--file".to_string()));
        assert!(argv.last().unwrap().starts_with("[files: src/lib.rs]"));
    }

    #[test]
    fn test_droid_skip_permissions_flag() {
        let exec = registry().get("droid").unwrap();
        let mut req = ExecRequest::with_prompt("x");
        assert!(
            !exec
                .argv(&req)
                .contains(&"--skip-permissions-unsafe".to_string())
        );
        req.skip_permissions_unsafe = true;
        assert!(
            exec.argv(&req)
                .contains(&"--skip-permissions-unsafe".to_string())
        );
    }

    #[test]
    fn test_qwen_argv_shape() {
        let exec = registry().get("qwen").unwrap();
        let req = ExecRequest {
            prompt: "scan".into(),
            sandbox: true,
            auto_approve: true,
            output_format: Some("json".into()),
            ..Default::default()
        };
        assert_eq!(exec.argv(&req), vec!["-s", "-y", "-o", "json", "scan"]);
    }

    #[test]
    fn test_rovodev_drops_attachments() {
        let exec = registry().get("rovodev").unwrap();
        let req = ExecRequest {
            prompt: "plan".into(),
            attachments: vec![PathBuf::from("ignored.rs")],
            ..Default::default()
        };
        assert_eq!(exec.argv(&req), vec!["rovodev", "run", "plan"]);
    }

    #[test]
    fn test_droid_timeout_longer() {
        let reg = registry();
        assert_eq!(reg.get("droid").unwrap().descriptor().timeout, DROID_TIMEOUT);
        assert_eq!(
            reg.get("gemini").unwrap().descriptor().timeout,
            DEFAULT_TIMEOUT
        );
    }

    #[test]
    fn test_auto_level_mapping() {
        assert_eq!(auto_level_for(AutonomyLevel::ReadOnly), AutoLevel::Low);
        assert_eq!(auto_level_for(AutonomyLevel::Medium), AutoLevel::Medium);
        assert_eq!(auto_level_for(AutonomyLevel::High), AutoLevel::High);
    }
}
