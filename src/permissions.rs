use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::EnvGates;
use crate::error::EngineError;

/// Coarse capability grant gating every side-effecting operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AutonomyLevel {
    ReadOnly,
    Low,
    Medium,
    High,
}

impl AutonomyLevel {
    /// Parse a user-supplied level. `"auto"` and absence resolve through the
    /// per-workflow default table, so they are not accepted here.
    pub fn parse(s: &str) -> Result<Self, EngineError> {
        match s.trim().to_ascii_lowercase().as_str() {
            "read-only" | "readonly" => Ok(AutonomyLevel::ReadOnly),
            "low" => Ok(AutonomyLevel::Low),
            "medium" => Ok(AutonomyLevel::Medium),
            "high" => Ok(AutonomyLevel::High),
            other => Err(EngineError::InvalidArguments(format!(
                "unknown autonomy level '{other}' (expected read-only, low, medium, or high)"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AutonomyLevel::ReadOnly => "read-only",
            AutonomyLevel::Low => "low",
            AutonomyLevel::Medium => "medium",
            AutonomyLevel::High => "high",
        }
    }
}

/// The effect classes the permission matrix ranges over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    ReadFile,
    /// Plain AI subprocess with no write-granting flags.
    RunAi,
    /// Subprocess carrying `--force` / `--yolo` / `--auto high`.
    ForceSubprocess,
    WriteFile,
    MutateGit,
    /// `--skip-permissions-unsafe` and equivalents.
    SkipPermissions,
}

impl Effect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Effect::ReadFile => "read-file",
            Effect::RunAi => "run-ai",
            Effect::ForceSubprocess => "force-subprocess",
            Effect::WriteFile => "write-file",
            Effect::MutateGit => "mutate-git",
            Effect::SkipPermissions => "skip-permissions",
        }
    }

    /// Whether this effect is side-effect free.
    pub fn read_only(&self) -> bool {
        matches!(self, Effect::ReadFile | Effect::RunAi)
    }
}

/// Static allow matrix. High-tier rows additionally require the environment
/// opt-in and non-production mode, enforced by `PermissionManager::check`.
fn matrix_allows(effect: Effect, level: AutonomyLevel) -> bool {
    use AutonomyLevel::*;
    use Effect::*;
    match effect {
        ReadFile | RunAi => true,
        WriteFile => level >= Low,
        MutateGit => level >= Medium,
        ForceSubprocess | SkipPermissions => level >= High,
    }
}

/// Enforces the autonomy matrix plus the environment safeguards for
/// dangerous flags.
pub struct PermissionManager {
    gates: EnvGates,
}

impl PermissionManager {
    pub fn new(gates: EnvGates) -> Self {
        Self { gates }
    }

    pub fn gates(&self) -> EnvGates {
        self.gates
    }

    /// Check one effect against the granted level. `ForceSubprocess` and
    /// `SkipPermissions` also require the matching env opt-in and
    /// non-production mode; any missing condition refuses.
    pub fn check(&self, level: AutonomyLevel, effect: Effect) -> Result<(), EngineError> {
        if !matrix_allows(effect, level) {
            return Err(EngineError::PermissionDenied(format!(
                "effect '{}' requires a higher autonomy level than '{}'",
                effect.as_str(),
                level.as_str()
            )));
        }

        match effect {
            Effect::SkipPermissions => {
                if self.gates.production {
                    return Err(EngineError::PermissionDenied(
                        "permission bypass is disabled in production".into(),
                    ));
                }
                if !self.gates.allow_permission_bypass {
                    return Err(EngineError::PermissionDenied(
                        "permission bypass requires UNITAI_ALLOW_PERMISSION_BYPASS".into(),
                    ));
                }
            }
            Effect::ForceSubprocess => {
                if self.gates.production {
                    return Err(EngineError::PermissionDenied(
                        "auto-approve flags are disabled in production".into(),
                    ));
                }
                if !self.gates.allow_auto_approve {
                    return Err(EngineError::PermissionDenied(
                        "auto-approve flags require UNITAI_ALLOW_AUTO_APPROVE".into(),
                    ));
                }
            }
            _ => {}
        }

        Ok(())
    }

    /// Low-autonomy file writes are confined to declared target files.
    #[allow(dead_code)]
    pub fn check_write_targets(
        &self,
        level: AutonomyLevel,
        path: &str,
        declared_targets: &[String],
    ) -> Result<(), EngineError> {
        self.check(level, Effect::WriteFile)?;
        if level == AutonomyLevel::Low && !declared_targets.iter().any(|t| t == path) {
            warn!(path = %path, "write outside declared targets refused at low autonomy");
            return Err(EngineError::PermissionDenied(format!(
                "low autonomy may only write declared target files, not '{path}'"
            )));
        }
        Ok(())
    }
}
