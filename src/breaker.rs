use std::sync::Mutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tracing::{info, warn};

/// Consecutive failures before a breaker opens.
pub const FAILURE_THRESHOLD: u32 = 3;

/// How long an open breaker waits before allowing a probe.
pub const RESET_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Breaker state for one backend.
///
/// Transitions: Closed → (threshold failures) → Open → (reset timeout
/// elapsed, next probe) → HalfOpen → success → Closed / failure → Open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Entry {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl Entry {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
        }
    }
}

/// Snapshot of one breaker for observability.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    pub backend: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    /// Seconds since the breaker opened, if open.
    pub open_for_secs: Option<u64>,
}

/// Per-backend circuit breakers, lazily created, shared across tasks.
///
/// Each entry transitions under its own mutex so concurrent callers observe
/// linearizable transitions. State is in-memory only: a restart resets every
/// breaker to Closed, which is treated as a fresh probe opportunity.
pub struct CircuitBreakerRegistry {
    entries: DashMap<String, Mutex<Entry>>,
    failure_threshold: u32,
    reset_timeout: Duration,
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::with_params(FAILURE_THRESHOLD, RESET_TIMEOUT)
    }

    pub fn with_params(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            failure_threshold,
            reset_timeout,
        }
    }

    /// Probe availability. An open breaker whose reset timeout has elapsed
    /// transitions to HalfOpen and reports available.
    pub fn is_available(&self, backend: &str) -> bool {
        self.is_available_at(backend, Instant::now())
    }

    pub(crate) fn is_available_at(&self, backend: &str, now: Instant) -> bool {
        let entry = self.entry(backend);
        let mut e = entry.lock().unwrap_or_else(|p| p.into_inner());
        match e.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let opened_at = match e.opened_at {
                    Some(t) => t,
                    // Open without a timestamp cannot happen via the public
                    // API; treat as immediately probeable.
                    None => return true,
                };
                if now.duration_since(opened_at) >= self.reset_timeout {
                    info!(backend = %backend, "circuit half-open, allowing probe");
                    e.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful call: HalfOpen closes, Closed resets the counter.
    pub fn on_success(&self, backend: &str) {
        let entry = self.entry(backend);
        let mut e = entry.lock().unwrap_or_else(|p| p.into_inner());
        match e.state {
            BreakerState::HalfOpen | BreakerState::Open => {
                info!(backend = %backend, "circuit closed after successful probe");
                e.state = BreakerState::Closed;
            }
            BreakerState::Closed => {}
        }
        e.consecutive_failures = 0;
        e.opened_at = None;
    }

    /// Record a failed call: counts toward the threshold in Closed,
    /// re-opens immediately from HalfOpen.
    pub fn on_failure(&self, backend: &str) {
        self.on_failure_at(backend, Instant::now());
    }

    pub(crate) fn on_failure_at(&self, backend: &str, now: Instant) {
        let entry = self.entry(backend);
        let mut e = entry.lock().unwrap_or_else(|p| p.into_inner());
        match e.state {
            BreakerState::Closed => {
                e.consecutive_failures += 1;
                if e.consecutive_failures >= self.failure_threshold {
                    warn!(
                        backend = %backend,
                        failures = e.consecutive_failures,
                        "circuit opened"
                    );
                    e.state = BreakerState::Open;
                    e.opened_at = Some(now);
                }
            }
            BreakerState::HalfOpen => {
                warn!(backend = %backend, "probe failed, circuit re-opened");
                e.state = BreakerState::Open;
                e.consecutive_failures += 1;
                e.opened_at = Some(now);
            }
            BreakerState::Open => {
                e.consecutive_failures += 1;
                e.opened_at = Some(now);
            }
        }
    }

    /// Snapshot every tracked breaker.
    pub fn all_stats(&self) -> Vec<BreakerStats> {
        let now = Instant::now();
        let mut stats: Vec<BreakerStats> = self
            .entries
            .iter()
            .map(|r| {
                let e = r.value().lock().unwrap_or_else(|p| p.into_inner());
                BreakerStats {
                    backend: r.key().clone(),
                    state: e.state,
                    consecutive_failures: e.consecutive_failures,
                    open_for_secs: e.opened_at.map(|t| now.duration_since(t).as_secs()),
                }
            })
            .collect();
        stats.sort_by(|a, b| a.backend.cmp(&b.backend));
        stats
    }

    /// Reset one breaker, or all of them, back to Closed.
    #[allow(dead_code)]
    pub fn reset(&self, backend: Option<&str>) {
        match backend {
            Some(name) => {
                if let Some(entry) = self.entries.get(name) {
                    let mut e = entry.lock().unwrap_or_else(|p| p.into_inner());
                    *e = Entry::new();
                }
            }
            None => {
                for entry in self.entries.iter() {
                    let mut e = entry.value().lock().unwrap_or_else(|p| p.into_inner());
                    *e = Entry::new();
                }
            }
        }
    }

    fn entry(&self, backend: &str) -> dashmap::mapref::one::Ref<'_, String, Mutex<Entry>> {
        if let Some(existing) = self.entries.get(backend) {
            return existing;
        }
        self.entries
            .entry(backend.to_string())
            .or_insert_with(|| Mutex::new(Entry::new()));
        self.entries
            .get(backend)
            .unwrap_or_else(|| unreachable!("entry inserted above"))
    }

    #[cfg(test)]
    fn state_of(&self, backend: &str) -> (BreakerState, u32, Option<Instant>) {
        let entry = self.entry(backend);
        let e = entry.lock().unwrap();
        (e.state, e.consecutive_failures, e.opened_at)
    }
}
