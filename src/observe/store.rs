use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::Connection;

/// Current wall-clock time in milliseconds since the epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Open one persistent store under the data directory: WAL journaling plus
/// idempotent schema initialization, owned by the calling repository.
pub(crate) fn open_store(data_dir: &Path, file: &str, schema: &str) -> Result<Connection> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("creating data directory {}", data_dir.display()))?;
    let path = data_dir.join(file);
    let conn = Connection::open(&path)
        .with_context(|| format!("opening store {}", path.display()))?;
    conn.pragma_update(None, "journal_mode", "WAL")
        .with_context(|| format!("enabling WAL on {}", path.display()))?;
    conn.execute_batch(schema)
        .with_context(|| format!("initializing schema of {}", path.display()))?;
    Ok(conn)
}
