use std::path::Path;
use std::sync::{Arc, Mutex};

use hdrhistogram::Histogram;
use rusqlite::{Connection, params};
use serde::Serialize;
use tracing::warn;

use super::{now_ms, open_store};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS red_samples (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ts_ms INTEGER NOT NULL,
    metric_type TEXT NOT NULL,
    component TEXT NOT NULL,
    backend TEXT,
    duration_ms INTEGER NOT NULL,
    success INTEGER NOT NULL,
    error_type TEXT,
    request_id TEXT,
    metadata TEXT NOT NULL DEFAULT '{}'
);
CREATE INDEX IF NOT EXISTS idx_red_ts ON red_samples(ts_ms);
CREATE INDEX IF NOT EXISTS idx_red_component ON red_samples(component, ts_ms);
";

/// Whether a sample measures one backend request or one whole workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    Request,
    Workflow,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Request => "request",
            MetricType::Workflow => "workflow",
        }
    }
}

/// One Rate/Error/Duration sample.
#[derive(Debug, Clone)]
pub struct RedSample {
    pub metric_type: MetricType,
    pub component: String,
    pub backend: Option<String>,
    pub duration_ms: u64,
    pub success: bool,
    pub error_type: Option<String>,
    pub request_id: Option<String>,
    pub metadata: serde_json::Value,
}

/// Query window with optional component/backend narrowing.
#[derive(Debug, Clone, Default)]
pub struct RedFilter {
    pub component: Option<String>,
    pub backend: Option<String>,
    pub start_ms: i64,
    pub end_ms: i64,
}

impl RedFilter {
    pub fn last_hours(hours: i64) -> Self {
        let end = now_ms();
        Self {
            start_ms: end - hours * 3_600_000,
            end_ms: end,
            ..Default::default()
        }
    }
}

/// Aggregate over one filter window.
#[derive(Debug, Clone, Serialize)]
pub struct RedStats {
    pub total_requests: u64,
    /// Requests per second over the window.
    pub rate: f64,
    pub error_rate: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

/// RED metrics store (`red-metrics.sqlite`, WAL). Unlike the audit trail,
/// writes here are fail-open: the caller logs and proceeds.
pub struct RedMetrics {
    conn: Mutex<Connection>,
}

impl RedMetrics {
    pub fn open(data_dir: &Path) -> anyhow::Result<Self> {
        Ok(Self {
            conn: Mutex::new(open_store(data_dir, "red-metrics.sqlite", SCHEMA)?),
        })
    }

    pub fn record(&self, sample: &RedSample) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        conn.execute(
            "INSERT INTO red_samples
             (ts_ms, metric_type, component, backend, duration_ms, success,
              error_type, request_id, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                now_ms(),
                sample.metric_type.as_str(),
                sample.component,
                sample.backend,
                sample.duration_ms as i64,
                sample.success as i64,
                sample.error_type,
                sample.request_id,
                sample.metadata.to_string(),
            ],
        )?;
        Ok(())
    }

    /// Fail-open async record: failures become a WARN line, never an error.
    pub async fn record_async(self: &Arc<Self>, sample: RedSample) {
        let repo = Arc::clone(self);
        let result = tokio::task::spawn_blocking(move || repo.record(&sample)).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "RED metric write failed"),
            Err(e) => warn!(error = %e, "RED metric write task failed"),
        }
    }

    /// Aggregate stats over a window: rate, error rate, and latency
    /// percentiles via an HDR histogram (1ms..10min, 3 significant digits).
    pub fn red_stats(&self, filter: &RedFilter) -> anyhow::Result<RedStats> {
        let samples = self.durations(filter)?;
        let total = samples.len() as u64;
        let failures = samples.iter().filter(|(_, ok)| !*ok).count() as u64;

        let mut hist =
            Histogram::<u64>::new_with_bounds(1, 600_000, 3).expect("valid histogram bounds");
        for (duration_ms, _) in &samples {
            // Clamp to histogram range; out-of-range is recorded as the max.
            let _ = hist.record((*duration_ms).clamp(1, 600_000));
        }

        let window_secs = ((filter.end_ms - filter.start_ms).max(1) as f64) / 1000.0;
        Ok(RedStats {
            total_requests: total,
            rate: total as f64 / window_secs,
            error_rate: if total == 0 {
                0.0
            } else {
                failures as f64 / total as f64
            },
            p50_ms: if total == 0 { 0.0 } else { hist.value_at_quantile(0.50) as f64 },
            p95_ms: if total == 0 { 0.0 } else { hist.value_at_quantile(0.95) as f64 },
            p99_ms: if total == 0 { 0.0 } else { hist.value_at_quantile(0.99) as f64 },
        })
    }

    /// Count of failures per error type over a window, most frequent first.
    pub fn error_breakdown(&self, filter: &RedFilter) -> anyhow::Result<Vec<(String, u64)>> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        let mut stmt = conn.prepare(
            "SELECT COALESCE(error_type, 'unknown'), COUNT(*) FROM red_samples
             WHERE ts_ms >= ?1 AND ts_ms <= ?2 AND success = 0
               AND (?3 IS NULL OR component = ?3)
               AND (?4 IS NULL OR backend = ?4)
             GROUP BY error_type ORDER BY COUNT(*) DESC",
        )?;
        let rows = stmt
            .query_map(
                params![
                    filter.start_ms,
                    filter.end_ms,
                    filter.component,
                    filter.backend
                ],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64)),
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    #[allow(dead_code)]
    pub fn cleanup(&self, older_than_ms: i64) -> anyhow::Result<usize> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        Ok(conn.execute(
            "DELETE FROM red_samples WHERE ts_ms < ?1",
            params![older_than_ms],
        )?)
    }

    fn durations(&self, filter: &RedFilter) -> anyhow::Result<Vec<(u64, bool)>> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        let mut stmt = conn.prepare(
            "SELECT duration_ms, success FROM red_samples
             WHERE ts_ms >= ?1 AND ts_ms <= ?2
               AND (?3 IS NULL OR component = ?3)
               AND (?4 IS NULL OR backend = ?4)",
        )?;
        let rows = stmt
            .query_map(
                params![
                    filter.start_ms,
                    filter.end_ms,
                    filter.component,
                    filter.backend
                ],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)? as u64,
                        row.get::<_, i64>(1)? != 0,
                    ))
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
