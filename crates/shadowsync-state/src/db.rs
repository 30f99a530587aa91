//! Connection setup for the state database.

use rusqlite::Connection;
use shadowsync_core::config::StorageConfig;
use shadowsync_core::error::StateError;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Per-connection tuning taken from `[storage]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbOptions {
    pub busy_timeout_ms: u32,
    /// Negative values are KiB, positive values pages.
    pub cache_size: i32,
}

impl Default for DbOptions {
    fn default() -> Self {
        Self::from(&StorageConfig::default())
    }
}

impl From<&StorageConfig> for DbOptions {
    fn from(storage: &StorageConfig) -> Self {
        Self {
            busy_timeout_ms: storage.busy_timeout_ms,
            cache_size: storage.cache_size,
        }
    }
}

pub fn open_connection(db_path: &Path) -> Result<Connection, StateError> {
    open_with_options(db_path, DbOptions::default())
}

/// Open (creating parent directories) in WAL mode with foreign keys enforced.
pub fn open_with_options(db_path: &Path, options: DbOptions) -> Result<Connection, StateError> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).map_err(StateError::Io)?;
    }
    let conn = Connection::open(db_path).map_err(StateError::sqlite)?;

    conn.busy_timeout(Duration::from_millis(u64::from(options.busy_timeout_ms)))
        .map_err(StateError::sqlite)?;
    let mode: String = conn
        .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
        .map_err(StateError::sqlite)?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .map_err(StateError::sqlite)?;
    conn.pragma_update(None, "foreign_keys", true)
        .map_err(StateError::sqlite)?;
    conn.pragma_update(None, "cache_size", options.cache_size)
        .map_err(StateError::sqlite)?;

    debug!(path = %db_path.display(), journal_mode = %mode, "State database opened");
    Ok(conn)
}

/// `None` when `PRAGMA quick_check` passes, else its first complaint.
pub fn integrity_problem(conn: &Connection) -> Result<Option<String>, StateError> {
    let result: String = conn
        .query_row("PRAGMA quick_check", [], |row| row.get(0))
        .map_err(StateError::sqlite)?;
    Ok((result != "ok").then_some(result))
}
