use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum stderr carried inside an error (larger output is truncated).
pub const MAX_STDERR_BYTES: usize = 4096;

/// Typed error taxonomy for the engine. Workflow failure handling and the
/// MCP surface both branch on these variants, so string matching is never
/// needed downstream.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Parameter schema violation. Never retried.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// Empty prompt, split out of InvalidArguments for convenience.
    #[error("prompt must not be empty")]
    EmptyPrompt,

    /// The blocking sanitization pass rejected the prompt.
    #[error("prompt rejected by injection filter: matched pattern '{pattern}'")]
    PromptBlocked { pattern: String },

    /// An attachment resolved outside the allow-listed roots.
    #[error("attachment '{path}' escapes the allowed roots")]
    PathEscape { path: String },

    /// Autonomy-gate refusal or missing environment opt-in.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Breaker open or backend not enabled/registered.
    #[error("backend '{backend}' is unavailable: {reason}")]
    BackendUnavailable { backend: String, reason: String },

    /// Subprocess exceeded its deadline and was terminated.
    #[error("backend '{backend}' timed out after {seconds}s")]
    Timeout { backend: String, seconds: u64 },

    /// Rate-limit pattern matched in stderr.
    #[error("backend '{backend}' rate limited: {detail}")]
    RateLimited { backend: String, detail: String },

    /// Quota-exhaustion pattern matched in stderr.
    #[error("backend '{backend}' quota exhausted: {detail}")]
    QuotaExhausted { backend: String, detail: String },

    /// Authentication pattern matched in stderr.
    #[error("backend '{backend}' authentication failed: {detail}")]
    AuthFailed { backend: String, detail: String },

    /// Non-zero exit without a recognized class.
    #[error("backend '{backend}' exited with {code:?}: {stderr}")]
    ProcessCrashed {
        backend: String,
        code: Option<i32>,
        stderr: String,
    },

    /// The audit store refused a write. Fail-closed: the audited operation
    /// must not proceed (or its result is withheld).
    #[error("audit write failed: {0}")]
    AuditWriteFailed(String),

    /// I/O around the subprocess itself (spawn failure, pipe loss).
    #[error("subprocess error for backend '{backend}': {detail}")]
    Subprocess { backend: String, detail: String },
}

impl EngineError {
    /// Errors the workflow runtime retries with backoff: timeouts,
    /// rate limits, and an open circuit.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Timeout { .. }
                | EngineError::RateLimited { .. }
                | EngineError::BackendUnavailable { .. }
        )
    }

    /// Errors that abort a workflow outright: bad input, refused
    /// permissions, path escapes, and a failed audit write.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::InvalidArguments(_)
                | EngineError::EmptyPrompt
                | EngineError::PromptBlocked { .. }
                | EngineError::PathEscape { .. }
                | EngineError::PermissionDenied(_)
                | EngineError::AuditWriteFailed(_)
        )
    }

    /// Short machine-readable class recorded in audit rows and RED samples.
    pub fn class(&self) -> ErrorClass {
        match self {
            EngineError::InvalidArguments(_)
            | EngineError::EmptyPrompt
            | EngineError::PromptBlocked { .. } => ErrorClass::InvalidInput,
            EngineError::PathEscape { .. } => ErrorClass::PathDenied,
            EngineError::PermissionDenied(_) => ErrorClass::PermissionDenied,
            EngineError::BackendUnavailable { .. } => ErrorClass::Unavailable,
            EngineError::Timeout { .. } => ErrorClass::Timeout,
            EngineError::RateLimited { .. } => ErrorClass::RateLimit,
            EngineError::QuotaExhausted { .. } => ErrorClass::Quota,
            EngineError::AuthFailed { .. } => ErrorClass::Auth,
            EngineError::ProcessCrashed { .. } | EngineError::Subprocess { .. } => {
                ErrorClass::Crashed
            }
            EngineError::AuditWriteFailed(_) => ErrorClass::AuditFailed,
        }
    }
}

/// Error classes as persisted. Derived either from the typed error or by
/// pattern-matching CLI stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorClass {
    Quota,
    RateLimit,
    Auth,
    PathDenied,
    Timeout,
    Crashed,
    Unavailable,
    InvalidInput,
    PermissionDenied,
    AuditFailed,
    Generic,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Quota => "quota",
            ErrorClass::RateLimit => "rate-limit",
            ErrorClass::Auth => "auth",
            ErrorClass::PathDenied => "path-denied",
            ErrorClass::Timeout => "timeout",
            ErrorClass::Crashed => "crashed",
            ErrorClass::Unavailable => "unavailable",
            ErrorClass::InvalidInput => "invalid-input",
            ErrorClass::PermissionDenied => "permission-denied",
            ErrorClass::AuditFailed => "audit-failed",
            ErrorClass::Generic => "generic",
        }
    }
}

static QUOTA_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)quota( has been)? exhausted|out of (free )?quota|usage limit").unwrap()
});
static RATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)rate.?limit|too many requests|429|slow down").unwrap()
});
static AUTH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)unauthorized|not logged in|invalid (api )?key|authentication|401|403").unwrap()
});
static PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)permission denied.*path|path.*not allowed|EACCES").unwrap());

/// Classify CLI stderr into an error class. Order matters: quota before
/// rate-limit because providers phrase quota errors with "limit" too.
pub fn classify_stderr(stderr: &str) -> ErrorClass {
    if QUOTA_RE.is_match(stderr) {
        ErrorClass::Quota
    } else if RATE_RE.is_match(stderr) {
        ErrorClass::RateLimit
    } else if AUTH_RE.is_match(stderr) {
        ErrorClass::Auth
    } else if PATH_RE.is_match(stderr) {
        ErrorClass::PathDenied
    } else {
        ErrorClass::Generic
    }
}

/// Build the typed error for a failed CLI run from its stderr.
pub fn error_from_exit(backend: &str, code: Option<i32>, stderr: &str) -> EngineError {
    let detail = truncate_stderr(stderr);
    match classify_stderr(stderr) {
        ErrorClass::Quota => EngineError::QuotaExhausted {
            backend: backend.to_string(),
            detail,
        },
        ErrorClass::RateLimit => EngineError::RateLimited {
            backend: backend.to_string(),
            detail,
        },
        ErrorClass::Auth => EngineError::AuthFailed {
            backend: backend.to_string(),
            detail,
        },
        _ => EngineError::ProcessCrashed {
            backend: backend.to_string(),
            code,
            stderr: detail,
        },
    }
}

/// Truncate stderr to the bounded size carried in errors.
pub fn truncate_stderr(stderr: &str) -> String {
    if stderr.len() <= MAX_STDERR_BYTES {
        return stderr.to_string();
    }
    let mut end = MAX_STDERR_BYTES;
    while !stderr.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}… [truncated]", &stderr[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_quota_before_rate_limit() {
        assert_eq!(
            classify_stderr("Your quota has been exhausted for today"),
            ErrorClass::Quota
        );
        assert_eq!(
            classify_stderr("HTTP 429: too many requests"),
            ErrorClass::RateLimit
        );
    }

    #[test]
    fn test_classify_auth_and_generic() {
        assert_eq!(
            classify_stderr("error: not logged in, run `gemini auth`"),
            ErrorClass::Auth
        );
        assert_eq!(classify_stderr("segfault at 0x0"), ErrorClass::Generic);
    }

    #[test]
    fn test_error_from_exit_maps_classes() {
        let err = error_from_exit("qwen", Some(1), "rate limit exceeded, retry later");
        assert!(matches!(err, EngineError::RateLimited { .. }));
        assert!(err.is_retryable());

        let err = error_from_exit("droid", Some(2), "something unexpected");
        assert!(matches!(err, EngineError::ProcessCrashed { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(EngineError::EmptyPrompt.is_fatal());
        assert!(EngineError::PermissionDenied("no".into()).is_fatal());
        assert!(
            !EngineError::Timeout {
                backend: "gemini".into(),
                seconds: 600
            }
            .is_fatal()
        );
    }

    #[test]
    fn test_truncate_stderr_bounded() {
        let big = "x".repeat(10_000);
        let out = truncate_stderr(&big);
        assert!(out.len() < 10_000);
        assert!(out.ends_with("[truncated]"));

        let small = "short error";
        assert_eq!(truncate_stderr(small), small);
    }
}
