use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::breaker::CircuitBreakerRegistry;
use crate::config::ConfigStore;

/// The three backend roles the config maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Architect,
    Implementer,
    Tester,
}

impl Role {
    /// Tier order used when parallel selection wants role diversity.
    pub const TIER: [Role; 3] = [Role::Architect, Role::Implementer, Role::Tester];
}

/// What a workflow step needs from a backend. Derived from the workflow
/// identifier, never persisted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskCharacteristics {
    pub requires_architectural_thinking: bool,
    pub requires_code_generation: bool,
    pub requires_speed: bool,
    pub domain: Option<String>,
}

impl TaskCharacteristics {
    pub fn architect() -> Self {
        Self {
            requires_architectural_thinking: true,
            ..Default::default()
        }
    }

    pub fn implementer() -> Self {
        Self {
            requires_code_generation: true,
            ..Default::default()
        }
    }

    pub fn tester() -> Self {
        Self {
            requires_speed: true,
            ..Default::default()
        }
    }

    pub fn with_domain(mut self, domain: &str) -> Self {
        self.domain = Some(domain.to_string());
        self
    }

    /// Role derivation: architectural thinking wins, then unhurried code
    /// generation, otherwise the fast tester tier.
    pub fn role(&self) -> Role {
        if self.requires_architectural_thinking {
            Role::Architect
        } else if self.requires_code_generation && !self.requires_speed {
            Role::Implementer
        } else {
            Role::Tester
        }
    }
}

/// Availability-aware role-based backend selection.
///
/// Deterministic given config + breaker state: the same inputs always pick
/// the same backend (§ the fallback chain is an ordered list, not a set).
pub struct BackendSelector {
    config: Arc<ConfigStore>,
    breakers: Arc<CircuitBreakerRegistry>,
    detected: Vec<String>,
}

impl BackendSelector {
    pub fn new(
        config: Arc<ConfigStore>,
        breakers: Arc<CircuitBreakerRegistry>,
        detected: Vec<String>,
    ) -> Self {
        Self {
            config,
            breakers,
            detected,
        }
    }

    fn enabled(&self) -> Vec<String> {
        match self.config.load() {
            Some(config) => config.enabled_or(&self.detected),
            None => self.detected.clone(),
        }
    }

    fn usable(&self, name: &str, enabled: &[String]) -> bool {
        enabled.iter().any(|e| e == name) && self.breakers.is_available(name)
    }

    /// Pick a backend for a task. If neither the role's candidate nor any
    /// fallback is usable, the candidate is returned anyway so the
    /// dispatcher can surface a clean unavailability error.
    pub fn select(&self, task: &TaskCharacteristics) -> String {
        self.select_distinct(task, &[])
    }

    /// Same rule with an exclusion set; `select_parallel` builds on this so
    /// a fan-out never hands two steps the same backend.
    fn select_distinct(&self, task: &TaskCharacteristics, exclude: &[String]) -> String {
        let role = task.role();
        let candidate = self.config.role_backend(role, &self.detected);
        let enabled = self.enabled();

        if !exclude.contains(&candidate) && self.usable(&candidate, &enabled) {
            return candidate;
        }

        for name in self.config.fallback_priority() {
            if !exclude.contains(&name) && self.usable(&name, &enabled) {
                debug!(role = ?role, candidate = %candidate, fallback = %name, "role backend unavailable, using fallback");
                return name;
            }
        }

        // Nothing usable: hand back the configured candidate and let the
        // dispatcher fail with BackendUnavailable.
        candidate
    }

    /// Pick up to `n` distinct backends, preferring role diversity: the
    /// task's own role first, then the remaining tiers in order. The
    /// workflow runtime assigns these to a layer's fan-out steps in
    /// declaration order.
    pub fn select_parallel(&self, n: usize, task: &TaskCharacteristics) -> Vec<String> {
        let mut chosen: Vec<String> = Vec::with_capacity(n);
        let first_role = task.role();

        let mut roles: Vec<Role> = vec![first_role];
        roles.extend(Role::TIER.iter().copied().filter(|r| *r != first_role));

        for role in roles.iter().cycle().take(n * Role::TIER.len()) {
            if chosen.len() == n {
                break;
            }
            let task_for_role = match role {
                Role::Architect => TaskCharacteristics::architect(),
                Role::Implementer => TaskCharacteristics::implementer(),
                Role::Tester => TaskCharacteristics::tester(),
            };
            let pick = self.select_distinct(&task_for_role, &chosen);
            if !chosen.contains(&pick) {
                chosen.push(pick);
            }
        }
        chosen
    }
}
