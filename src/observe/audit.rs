use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use rusqlite::{Connection, params};
use serde::Serialize;

use super::{now_ms, open_store};
use crate::error::{EngineError, ErrorClass};
use crate::permissions::AutonomyLevel;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS audit_entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ts_ms INTEGER NOT NULL,
    request_id TEXT NOT NULL,
    workflow TEXT,
    backend TEXT,
    tool_name TEXT NOT NULL,
    autonomy TEXT NOT NULL,
    action TEXT NOT NULL,
    outcome TEXT NOT NULL,
    duration_ms INTEGER NOT NULL,
    error_class TEXT,
    prompt_sha256 TEXT,
    metadata TEXT NOT NULL DEFAULT '{}'
);
CREATE INDEX IF NOT EXISTS idx_audit_ts ON audit_entries(ts_ms);
CREATE INDEX IF NOT EXISTS idx_audit_request ON audit_entries(request_id);
";

/// One autonomous operation, as audited. The raw prompt is never stored;
/// only its sha256 is.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub request_id: String,
    pub workflow: Option<String>,
    pub backend: Option<String>,
    pub tool_name: String,
    pub autonomy: AutonomyLevel,
    pub action: String,
    pub outcome: String,
    pub duration_ms: u64,
    pub error_class: Option<ErrorClass>,
    pub prompt_sha256: Option<String>,
    pub metadata: serde_json::Value,
}

/// A persisted audit row, immutable once written.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRow {
    pub id: i64,
    pub ts_ms: i64,
    pub request_id: String,
    pub workflow: Option<String>,
    pub backend: Option<String>,
    pub tool_name: String,
    pub autonomy: String,
    pub action: String,
    pub outcome: String,
    pub duration_ms: u64,
    pub error_class: Option<String>,
    pub prompt_sha256: Option<String>,
    pub metadata: String,
}

/// Append-only audit trail (`audit.sqlite`, WAL).
///
/// Fail-closed: the dispatcher probes `ensure_writable` before privileged
/// operations and refuses them if the probe fails, and a failed
/// post-completion write withholds the operation's result.
pub struct AuditTrail {
    conn: Mutex<Connection>,
    // Test hook: force writes to fail to exercise the fail-closed path.
    fail_writes: AtomicBool,
}

impl AuditTrail {
    pub fn open(data_dir: &Path) -> anyhow::Result<Self> {
        Ok(Self {
            conn: Mutex::new(open_store(data_dir, "audit.sqlite", SCHEMA)?),
            fail_writes: AtomicBool::new(false),
        })
    }

    /// Append one entry. Returns the row id.
    pub fn record(&self, entry: &AuditEntry) -> Result<i64, EngineError> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(EngineError::AuditWriteFailed(
                "audit store unavailable".into(),
            ));
        }
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        conn.execute(
            "INSERT INTO audit_entries
             (ts_ms, request_id, workflow, backend, tool_name, autonomy, action,
              outcome, duration_ms, error_class, prompt_sha256, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                now_ms(),
                entry.request_id,
                entry.workflow,
                entry.backend,
                entry.tool_name,
                entry.autonomy.as_str(),
                entry.action,
                entry.outcome,
                entry.duration_ms as i64,
                entry.error_class.map(|c| c.as_str()),
                entry.prompt_sha256,
                entry.metadata.to_string(),
            ],
        )
        .map_err(|e| EngineError::AuditWriteFailed(e.to_string()))?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn record_async(self: &Arc<Self>, entry: AuditEntry) -> Result<i64, EngineError> {
        let repo = Arc::clone(self);
        tokio::task::spawn_blocking(move || repo.record(&entry))
            .await
            .map_err(|e| EngineError::AuditWriteFailed(e.to_string()))?
    }

    /// Probe that the store can accept a write right now.
    pub fn ensure_writable(&self) -> Result<(), EngineError> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(EngineError::AuditWriteFailed(
                "audit store unavailable".into(),
            ));
        }
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        conn.execute_batch("BEGIN IMMEDIATE; ROLLBACK;")
            .map_err(|e| EngineError::AuditWriteFailed(e.to_string()))
    }

    pub async fn ensure_writable_async(self: &Arc<Self>) -> Result<(), EngineError> {
        let repo = Arc::clone(self);
        tokio::task::spawn_blocking(move || repo.ensure_writable())
            .await
            .map_err(|e| EngineError::AuditWriteFailed(e.to_string()))?
    }

    /// All rows in `[start_ms, end_ms]`, oldest first.
    #[allow(dead_code)]
    pub fn query_range(&self, start_ms: i64, end_ms: i64) -> anyhow::Result<Vec<AuditRow>> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        let mut stmt = conn.prepare(
            "SELECT id, ts_ms, request_id, workflow, backend, tool_name, autonomy,
                    action, outcome, duration_ms, error_class, prompt_sha256, metadata
             FROM audit_entries WHERE ts_ms >= ?1 AND ts_ms <= ?2 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![start_ms, end_ms], |row| {
                Ok(AuditRow {
                    id: row.get(0)?,
                    ts_ms: row.get(1)?,
                    request_id: row.get(2)?,
                    workflow: row.get(3)?,
                    backend: row.get(4)?,
                    tool_name: row.get(5)?,
                    autonomy: row.get(6)?,
                    action: row.get(7)?,
                    outcome: row.get(8)?,
                    duration_ms: row.get::<_, i64>(9)? as u64,
                    error_class: row.get(10)?,
                    prompt_sha256: row.get(11)?,
                    metadata: row.get(12)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Delete rows older than the cutoff. Retention policy is the caller's;
    /// nothing schedules this.
    #[allow(dead_code)]
    pub fn cleanup(&self, older_than_ms: i64) -> anyhow::Result<usize> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        let deleted = conn.execute(
            "DELETE FROM audit_entries WHERE ts_ms < ?1",
            params![older_than_ms],
        )?;
        Ok(deleted)
    }

    /// Force every subsequent write (and probe) to fail. Test-only control
    /// for the fail-closed invariant.
    #[cfg(test)]
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(request_id: &str, outcome: &str) -> AuditEntry {
        AuditEntry {
            request_id: request_id.to_string(),
            workflow: Some("bug-hunt".into()),
            backend: Some("qwen".into()),
            tool_name: "smart-workflows".into(),
            autonomy: AutonomyLevel::Low,
            action: "ai-call".into(),
            outcome: outcome.to_string(),
            duration_ms: 1234,
            error_class: None,
            prompt_sha256: Some("ab".repeat(32)),
            metadata: serde_json::json!({"step": "hypothesis"}),
        }
    }

    #[test]
    fn test_record_and_query_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let trail = AuditTrail::open(dir.path()).unwrap();

        let id = trail.record(&entry("req-1", "success")).unwrap();
        assert!(id > 0);

        let rows = trail.query_range(0, i64::MAX).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].request_id, "req-1");
        assert_eq!(rows[0].outcome, "success");
        assert_eq!(rows[0].autonomy, "low");
        assert_eq!(rows[0].duration_ms, 1234);
    }

    #[test]
    fn test_query_is_stable_without_writes() {
        let dir = tempfile::tempdir().unwrap();
        let trail = AuditTrail::open(dir.path()).unwrap();
        trail.record(&entry("req-1", "success")).unwrap();
        trail.record(&entry("req-2", "failure")).unwrap();

        let first = trail.query_range(0, i64::MAX).unwrap();
        let second = trail.query_range(0, i64::MAX).unwrap();
        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.id, b.id);
            assert_eq!(a.request_id, b.request_id);
        }
    }

    #[test]
    fn test_fail_writes_refuses_record_and_probe() {
        let dir = tempfile::tempdir().unwrap();
        let trail = AuditTrail::open(dir.path()).unwrap();
        trail.set_fail_writes(true);

        assert!(matches!(
            trail.record(&entry("r", "success")),
            Err(EngineError::AuditWriteFailed(_))
        ));
        assert!(trail.ensure_writable().is_err());

        trail.set_fail_writes(false);
        assert!(trail.ensure_writable().is_ok());
    }

    #[test]
    fn test_cleanup_deletes_old_rows_only() {
        let dir = tempfile::tempdir().unwrap();
        let trail = AuditTrail::open(dir.path()).unwrap();
        trail.record(&entry("old", "success")).unwrap();

        // Everything recorded just now is newer than a cutoff in the past.
        assert_eq!(trail.cleanup(now_ms() - 60_000).unwrap(), 0);
        // A cutoff in the future removes them.
        assert_eq!(trail.cleanup(now_ms() + 60_000).unwrap(), 1);
        assert!(trail.query_range(0, i64::MAX).unwrap().is_empty());
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let trail = AuditTrail::open(dir.path()).unwrap();
            trail.record(&entry("persisted", "success")).unwrap();
        }
        let trail = AuditTrail::open(dir.path()).unwrap();
        let rows = trail.query_range(0, i64::MAX).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].request_id, "persisted");
    }
}
