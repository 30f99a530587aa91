use rusqlite::{Connection, Row, params};
use shadowsync_core::error::StateError;
use shadowsync_core::types::UserCredentials;

fn row_to_user(row: &Row<'_>) -> rusqlite::Result<UserCredentials> {
    Ok(UserCredentials {
        email: row.get(0)?,
        access_token: row.get(1)?,
        access_key: row.get(2)?,
        secret_key: row.get(3)?,
        is_active: row.get::<_, i64>(4)? != 0,
    })
}

/// Insert or update a user keyed by email. Returns the row id.
///
/// Activating a user deactivates every other user in the same statement batch.
pub fn upsert_user(conn: &Connection, user: &UserCredentials) -> Result<i64, StateError> {
    if user.is_active {
        conn.execute(
            "UPDATE user SET is_active = 0 WHERE email != ?1",
            params![user.email],
        )
        .map_err(StateError::sqlite)?;
    }
    conn.execute(
        "INSERT INTO user (email, access_token, access_key, secret_key, is_active)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(email) DO UPDATE SET
           access_token = excluded.access_token,
           access_key = excluded.access_key,
           secret_key = excluded.secret_key,
           is_active = excluded.is_active",
        params![
            user.email,
            user.access_token,
            user.access_key,
            user.secret_key,
            if user.is_active { 1 } else { 0 },
        ],
    )
    .map_err(StateError::sqlite)?;
    user_id_by_email(conn, &user.email)?
        .ok_or_else(|| StateError::invalid_value("user.email", user.email.clone()))
}

/// Get-or-create a user row with only an email set.
pub fn ensure_user(conn: &Connection, email: &str) -> Result<i64, StateError> {
    conn.execute(
        "INSERT INTO user (email) VALUES (?1) ON CONFLICT(email) DO NOTHING",
        params![email],
    )
    .map_err(StateError::sqlite)?;
    user_id_by_email(conn, email)?.ok_or_else(|| StateError::invalid_value("user.email", email))
}

pub fn user_id_by_email(conn: &Connection, email: &str) -> Result<Option<i64>, StateError> {
    let result = conn.query_row(
        "SELECT id FROM user WHERE email = ?1",
        params![email],
        |row| row.get(0),
    );
    match result {
        Ok(id) => Ok(Some(id)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(StateError::sqlite(e)),
    }
}

pub fn get_user_by_email(
    conn: &Connection,
    email: &str,
) -> Result<Option<UserCredentials>, StateError> {
    let result = conn.query_row(
        "SELECT email, access_token, access_key, secret_key, is_active
         FROM user WHERE email = ?1",
        params![email],
        row_to_user,
    );
    match result {
        Ok(user) => Ok(Some(user)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(StateError::sqlite(e)),
    }
}

pub fn get_user_by_id(conn: &Connection, id: i64) -> Result<Option<UserCredentials>, StateError> {
    let result = conn.query_row(
        "SELECT email, access_token, access_key, secret_key, is_active
         FROM user WHERE id = ?1",
        params![id],
        row_to_user,
    );
    match result {
        Ok(user) => Ok(Some(user)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(StateError::sqlite(e)),
    }
}

/// The single active user, if any.
pub fn get_active_user(conn: &Connection) -> Result<Option<UserCredentials>, StateError> {
    let result = conn.query_row(
        "SELECT email, access_token, access_key, secret_key, is_active
         FROM user WHERE is_active = 1 ORDER BY id DESC LIMIT 1",
        [],
        row_to_user,
    );
    match result {
        Ok(user) => Ok(Some(user)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(StateError::sqlite(e)),
    }
}

pub fn count_users(conn: &Connection) -> Result<i64, StateError> {
    conn.query_row("SELECT COUNT(*) FROM user", [], |row| row.get(0))
        .map_err(StateError::sqlite)
}
