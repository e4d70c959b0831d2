use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{Connection, params};
use serde::Serialize;
use tracing::warn;

use super::{now_ms, open_store};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS token_savings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ts_ms INTEGER NOT NULL,
    source TEXT NOT NULL,
    blocked_tool TEXT NOT NULL,
    recommended_tool TEXT NOT NULL,
    target TEXT NOT NULL,
    estimated_savings INTEGER NOT NULL,
    actual_tokens_avoided INTEGER,
    suggestion_followed INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tokens_ts ON token_savings(ts_ms);
";

/// One token-savings observation: a costly call was blocked or redirected
/// toward a cheaper tool.
#[derive(Debug, Clone)]
pub struct TokenSample {
    pub source: String,
    pub blocked_tool: String,
    pub recommended_tool: String,
    pub target: String,
    pub estimated_savings: u64,
    pub actual_tokens_avoided: Option<u64>,
    pub suggestion_followed: bool,
}

/// Aggregate over a trailing window.
#[derive(Debug, Clone, Serialize)]
pub struct TokenSummary {
    pub samples: u64,
    pub total_estimated_savings: u64,
    pub total_actual_avoided: u64,
    pub followed: u64,
}

/// Token-savings accounting (`token-metrics.sqlite`, WAL). Fail-open like
/// the RED store.
pub struct TokenSavings {
    conn: Mutex<Connection>,
}

impl TokenSavings {
    pub fn open(data_dir: &Path) -> anyhow::Result<Self> {
        Ok(Self {
            conn: Mutex::new(open_store(data_dir, "token-metrics.sqlite", SCHEMA)?),
        })
    }

    pub fn record(&self, sample: &TokenSample) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        conn.execute(
            "INSERT INTO token_savings
             (ts_ms, source, blocked_tool, recommended_tool, target,
              estimated_savings, actual_tokens_avoided, suggestion_followed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                now_ms(),
                sample.source,
                sample.blocked_tool,
                sample.recommended_tool,
                sample.target,
                sample.estimated_savings as i64,
                sample.actual_tokens_avoided.map(|v| v as i64),
                sample.suggestion_followed as i64,
            ],
        )?;
        Ok(())
    }

    pub async fn record_async(self: &Arc<Self>, sample: TokenSample) {
        let repo = Arc::clone(self);
        let result = tokio::task::spawn_blocking(move || repo.record(&sample)).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "token-savings write failed"),
            Err(e) => warn!(error = %e, "token-savings write task failed"),
        }
    }

    pub fn summary(&self, days: i64) -> anyhow::Result<TokenSummary> {
        let cutoff = now_ms() - days * 86_400_000;
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(estimated_savings), 0),
                    COALESCE(SUM(actual_tokens_avoided), 0),
                    COALESCE(SUM(suggestion_followed), 0)
             FROM token_savings WHERE ts_ms >= ?1",
            params![cutoff],
            |row| {
                Ok(TokenSummary {
                    samples: row.get::<_, i64>(0)? as u64,
                    total_estimated_savings: row.get::<_, i64>(1)? as u64,
                    total_actual_avoided: row.get::<_, i64>(2)? as u64,
                    followed: row.get::<_, i64>(3)? as u64,
                })
            },
        )
        .map_err(Into::into)
    }

    #[allow(dead_code)]
    pub fn cleanup(&self, older_than_ms: i64) -> anyhow::Result<usize> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        Ok(conn.execute(
            "DELETE FROM token_savings WHERE ts_ms < ?1",
            params![older_than_ms],
        )?)
    }
}
