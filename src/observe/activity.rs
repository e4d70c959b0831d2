use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Datelike, Timelike, Utc};
use rusqlite::{Connection, params};
use serde::Serialize;
use tracing::warn;

use super::{now_ms, open_store};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS activity (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ts_ms INTEGER NOT NULL,
    request_id TEXT NOT NULL,
    tool_name TEXT NOT NULL,
    workflow TEXT,
    backend TEXT,
    duration_ms INTEGER NOT NULL,
    success INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_activity_ts ON activity(ts_ms);
";

/// One MCP tool invocation as seen by the activity dashboard.
#[derive(Debug, Clone)]
pub struct ActivityRecord {
    pub request_id: String,
    pub tool_name: String,
    pub workflow: Option<String>,
    pub backend: Option<String>,
    pub duration_ms: u64,
    pub success: bool,
}

/// What the dashboard renders: top tools/workflows plus temporal shape.
#[derive(Debug, Clone, Serialize)]
pub struct ActivitySummary {
    pub days: i64,
    pub total_calls: u64,
    pub top_tools: Vec<(String, u64)>,
    pub top_workflows: Vec<(String, u64)>,
    /// Calls per UTC hour-of-day, index 0..24.
    pub per_hour: Vec<u64>,
    /// Calls per weekday, Monday first.
    pub per_weekday: Vec<u64>,
}

/// MCP-activity store (`activity.sqlite`, WAL). Fail-open.
pub struct ActivityLog {
    conn: Mutex<Connection>,
}

impl ActivityLog {
    pub fn open(data_dir: &Path) -> anyhow::Result<Self> {
        Ok(Self {
            conn: Mutex::new(open_store(data_dir, "activity.sqlite", SCHEMA)?),
        })
    }

    pub fn record(&self, record: &ActivityRecord) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        conn.execute(
            "INSERT INTO activity
             (ts_ms, request_id, tool_name, workflow, backend, duration_ms, success)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                now_ms(),
                record.request_id,
                record.tool_name,
                record.workflow,
                record.backend,
                record.duration_ms as i64,
                record.success as i64,
            ],
        )?;
        Ok(())
    }

    pub async fn record_async(self: &Arc<Self>, record: ActivityRecord) {
        let repo = Arc::clone(self);
        let result = tokio::task::spawn_blocking(move || repo.record(&record)).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "activity write failed"),
            Err(e) => warn!(error = %e, "activity write task failed"),
        }
    }

    pub fn summary(&self, days: i64) -> anyhow::Result<ActivitySummary> {
        let cutoff = now_ms() - days * 86_400_000;
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());

        let top = |sql: &str| -> anyhow::Result<Vec<(String, u64)>> {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt
                .query_map(params![cutoff], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        };

        let top_tools = top(
            "SELECT tool_name, COUNT(*) FROM activity WHERE ts_ms >= ?1
             GROUP BY tool_name ORDER BY COUNT(*) DESC LIMIT 10",
        )?;
        let top_workflows = top(
            "SELECT workflow, COUNT(*) FROM activity
             WHERE ts_ms >= ?1 AND workflow IS NOT NULL
             GROUP BY workflow ORDER BY COUNT(*) DESC LIMIT 10",
        )?;

        let mut per_hour = vec![0u64; 24];
        let mut per_weekday = vec![0u64; 7];
        let mut total_calls = 0u64;
        {
            let mut stmt =
                conn.prepare("SELECT ts_ms FROM activity WHERE ts_ms >= ?1")?;
            let timestamps = stmt
                .query_map(params![cutoff], |row| row.get::<_, i64>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            for ts in timestamps {
                total_calls += 1;
                if let Some(dt) = DateTime::<Utc>::from_timestamp_millis(ts) {
                    per_hour[dt.hour() as usize] += 1;
                    per_weekday[dt.weekday().num_days_from_monday() as usize] += 1;
                }
            }
        }

        Ok(ActivitySummary {
            days,
            total_calls,
            top_tools,
            top_workflows,
            per_hour,
            per_weekday,
        })
    }

    #[allow(dead_code)]
    pub fn cleanup(&self, older_than_ms: i64) -> anyhow::Result<usize> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        Ok(conn.execute(
            "DELETE FROM activity WHERE ts_ms < ?1",
            params![older_than_ms],
        )?)
    }
}
