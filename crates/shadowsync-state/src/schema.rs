use rusqlite::{Connection, params};
use shadowsync_core::error::StateError;
use shadowsync_core::types::MigrationState;
use tracing::info;

/// Table names tracked by the `migrations` registry.
pub const USER_TABLE: &str = "user";
pub const REPO_TABLE: &str = "repo";

/// Create the `migrations` bookkeeping table. Always safe to call.
pub fn create_migrations_table(conn: &Connection) -> Result<(), StateError> {
    conn.execute_batch(MIGRATIONS_SQL)
        .map_err(StateError::sqlite)?;
    Ok(())
}

/// Create the `user` table.
pub fn create_user_table(conn: &Connection) -> Result<(), StateError> {
    conn.execute_batch(USER_SQL).map_err(StateError::sqlite)?;
    info!("SQLite user table ready");
    Ok(())
}

/// Create the `repo`, `repo_branch` and `repo_file` tables.
///
/// `repo.user_id` references `user`, so the user table is created as well.
pub fn create_repo_tables(conn: &Connection) -> Result<(), StateError> {
    conn.execute_batch(USER_SQL).map_err(StateError::sqlite)?;
    conn.execute_batch(REPO_SQL).map_err(StateError::sqlite)?;
    info!("SQLite repo tables ready");
    Ok(())
}

/// Current migration state for a (table, identifier) pair: the most recently
/// inserted row wins. Absent rows read as `NotStarted`.
pub fn migration_state(
    conn: &Connection,
    table: &str,
    identifier: &str,
) -> Result<MigrationState, StateError> {
    let result = conn.query_row(
        "SELECT state FROM migrations
         WHERE table_name = ?1 AND identifier = ?2
         ORDER BY id DESC LIMIT 1",
        params![table, identifier],
        |row| row.get::<_, String>(0),
    );

    match result {
        Ok(raw) => MigrationState::parse(&raw)
            .ok_or_else(|| StateError::invalid_value("migrations.state", raw)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(MigrationState::NotStarted),
        Err(e) => Err(StateError::sqlite(e)),
    }
}

/// Append a migration state transition. Rows are never updated or deleted.
pub fn record_migration_state(
    conn: &Connection,
    table: &str,
    identifier: &str,
    state: MigrationState,
) -> Result<(), StateError> {
    conn.execute(
        "INSERT INTO migrations (table_name, state, identifier) VALUES (?1, ?2, ?3)",
        params![table, state.as_str(), identifier],
    )
    .map_err(StateError::sqlite)?;
    Ok(())
}

/// Full transition history for a (table, identifier) pair, oldest first.
pub fn migration_history(
    conn: &Connection,
    table: &str,
    identifier: &str,
) -> Result<Vec<MigrationState>, StateError> {
    let mut stmt = conn
        .prepare(
            "SELECT state FROM migrations
             WHERE table_name = ?1 AND identifier = ?2
             ORDER BY id ASC",
        )
        .map_err(StateError::sqlite)?;
    let rows = stmt
        .query_map(params![table, identifier], |row| row.get::<_, String>(0))
        .map_err(StateError::sqlite)?;

    let mut states = Vec::new();
    for row in rows {
        let raw = row.map_err(StateError::sqlite)?;
        let state = MigrationState::parse(&raw)
            .ok_or_else(|| StateError::invalid_value("migrations.state", raw))?;
        states.push(state);
    }
    Ok(states)
}

const MIGRATIONS_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS migrations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    table_name TEXT NOT NULL,
    state TEXT NOT NULL,
    identifier TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_migrations_lookup
    ON migrations(table_name, identifier, id);
"#;

const USER_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS user (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    email TEXT NOT NULL UNIQUE,
    access_token TEXT,
    access_key TEXT,
    secret_key TEXT,
    is_active INTEGER NOT NULL DEFAULT 0
);
"#;

const REPO_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS repo (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    path TEXT NOT NULL UNIQUE,
    user_id INTEGER REFERENCES user(id),
    server_repo_id INTEGER,
    state TEXT NOT NULL DEFAULT 'NOT_SYNCED'
);

CREATE TABLE IF NOT EXISTS repo_branch (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    repo_id INTEGER NOT NULL REFERENCES repo(id) ON DELETE CASCADE,
    UNIQUE(repo_id, name)
);

CREATE TABLE IF NOT EXISTS repo_file (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    path TEXT NOT NULL,
    repo_branch_id INTEGER NOT NULL REFERENCES repo_branch(id) ON DELETE CASCADE,
    server_file_id INTEGER,
    UNIQUE(repo_branch_id, path)
);

CREATE INDEX IF NOT EXISTS idx_repo_file_pending
    ON repo_file(repo_branch_id) WHERE server_file_id IS NULL;
"#;
