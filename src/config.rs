use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::selector::Role;

/// Built-in role defaults, applied when config is absent or references an
/// unknown backend.
pub const DEFAULT_ARCHITECT: &str = "gemini";
pub const DEFAULT_IMPLEMENTER: &str = "droid";
pub const DEFAULT_TESTER: &str = "qwen";

/// Built-in fallback ordering when the config does not provide one.
pub const DEFAULT_FALLBACK: [&str; 5] = ["gemini", "droid", "qwen", "cursor", "rovodev"];

/// Persisted user configuration (`$HOME/.unitai/config.json`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub backends: BackendsSection,

    #[serde(default)]
    pub roles: RolesSection,

    #[serde(default, rename = "fallbackPriority")]
    pub fallback_priority: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendsSection {
    /// Backend names available to this process. Empty means "all detected".
    #[serde(default)]
    pub enabled: Vec<String>,
}

/// Role → backend-name mapping. Missing entries fall back to the defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RolesSection {
    #[serde(default)]
    pub architect: Option<String>,
    #[serde(default)]
    pub implementer: Option<String>,
    #[serde(default)]
    pub tester: Option<String>,
}

impl Config {
    /// Backends usable by this process: `enabled` if set, else everything
    /// detected.
    pub fn enabled_or(&self, detected: &[String]) -> Vec<String> {
        if self.backends.enabled.is_empty() {
            detected.to_vec()
        } else {
            self.backends.enabled.clone()
        }
    }
}

/// Default path: `$HOME/.unitai/config.json`.
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".unitai")
        .join("config.json")
}

/// Cached, copy-on-write access to the persisted user config.
///
/// Readers get an `Arc<Config>` snapshot without blocking; `invalidate()`
/// drops the cache so the next read hits disk (the setup wizard writes the
/// file out-of-process and then invalidates).
pub struct ConfigStore {
    path: PathBuf,
    cache: ArcSwapOption<Loaded>,
}

/// Cached result of one disk read. `config = None` records that the file
/// was missing or corrupt, so defaults apply without re-reading.
struct Loaded {
    config: Option<Arc<Config>>,
}

impl ConfigStore {
    pub fn new(path: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            path,
            cache: ArcSwapOption::const_empty(),
        })
    }

    /// Read the config, serving from cache when possible. Corrupt or
    /// missing files yield `None`; this never errors.
    pub fn load(&self) -> Option<Arc<Config>> {
        if let Some(loaded) = self.cache.load_full() {
            return loaded.config.clone();
        }

        let config = match std::fs::read_to_string(&self.path) {
            Ok(raw) => match serde_json::from_str::<Config>(&raw) {
                Ok(c) => Some(Arc::new(c)),
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "config file corrupt, using defaults");
                    None
                }
            },
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "config file not readable, using defaults");
                None
            }
        };

        self.cache.store(Some(Arc::new(Loaded {
            config: config.clone(),
        })));
        config
    }

    /// Drop the cache. The next `load()` re-reads the file.
    pub fn invalidate(&self) {
        self.cache.store(None);
    }

    /// Atomic write (temp file + rename), then invalidate. The setup
    /// wizard owns the write path; the engine itself only reads.
    #[allow(dead_code)]
    pub fn save(&self, config: &Config) -> anyhow::Result<()> {
        use anyhow::Context;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating config directory {}", parent.display()))?;
        }
        let raw = serde_json::to_string_pretty(config)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, &raw)
            .with_context(|| format!("writing config temp file {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("renaming config into place at {}", self.path.display()))?;
        self.invalidate();
        Ok(())
    }

    /// Resolve a role to a backend name. Falls back to the built-in
    /// defaults when the config is absent or maps the role to a name
    /// outside `detected ∪ enabled`.
    pub fn role_backend(&self, role: Role, detected: &[String]) -> String {
        let default = match role {
            Role::Architect => DEFAULT_ARCHITECT,
            Role::Implementer => DEFAULT_IMPLEMENTER,
            Role::Tester => DEFAULT_TESTER,
        };

        let Some(config) = self.load() else {
            return default.to_string();
        };

        let configured = match role {
            Role::Architect => config.roles.architect.as_deref(),
            Role::Implementer => config.roles.implementer.as_deref(),
            Role::Tester => config.roles.tester.as_deref(),
        };

        match configured {
            Some(name)
                if detected.iter().any(|d| d == name)
                    || config.backends.enabled.iter().any(|e| e == name) =>
            {
                name.to_string()
            }
            Some(name) => {
                warn!(role = ?role, backend = %name, "configured role backend is unknown, using default");
                default.to_string()
            }
            None => default.to_string(),
        }
    }

    /// The fallback chain, configured or built-in.
    pub fn fallback_priority(&self) -> Vec<String> {
        match self.load() {
            Some(config) if !config.fallback_priority.is_empty() => {
                config.fallback_priority.clone()
            }
            _ => DEFAULT_FALLBACK.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Environment gates, read once at startup.
///
/// `production` disables the permission-bypass and auto-approve opt-ins
/// unconditionally.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvGates {
    pub allow_permission_bypass: bool,
    pub allow_auto_approve: bool,
    pub production: bool,
}

impl EnvGates {
    pub fn from_env() -> Self {
        let truthy = |key: &str| {
            std::env::var(key)
                .map(|v| {
                    let v = v.trim().to_ascii_lowercase();
                    v == "1" || v == "true" || v == "yes"
                })
                .unwrap_or(false)
        };
        let production = ["NODE_ENV", "ENVIRONMENT"].iter().any(|key| {
            std::env::var(key)
                .map(|v| v.trim().eq_ignore_ascii_case("production"))
                .unwrap_or(false)
        });
        Self {
            allow_permission_bypass: truthy("UNITAI_ALLOW_PERMISSION_BYPASS"),
            allow_auto_approve: truthy("UNITAI_ALLOW_AUTO_APPROVE"),
            production,
        }
    }
}

/// Resolve the data directory for the persistent stores.
/// `UNITAI_DATA_DIR` overrides the process-relative `data/` default.
pub fn data_dir_from_env() -> PathBuf {
    std::env::var("UNITAI_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("data"))
}
