use crate::users;
use rusqlite::{Connection, Row, params};
use shadowsync_core::error::StateError;
use shadowsync_core::types::{RepoInfo, RepoStatus};

/// A `repo` row with its surrogate id.
#[derive(Debug, Clone, PartialEq)]
pub struct RepoRow {
    pub id: i64,
    pub info: RepoInfo,
}

const REPO_COLUMNS: &str = "r.id, r.name, r.path, u.email, r.server_repo_id, r.state";

type RawRepo = (i64, String, String, Option<String>, Option<i64>, String);

fn row_to_repo(row: &Row<'_>) -> rusqlite::Result<RawRepo> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn build_repo(
    (id, name, path, email, server_repo_id, state): RawRepo,
) -> Result<RepoRow, StateError> {
    let status =
        RepoStatus::parse(&state).ok_or_else(|| StateError::invalid_value("repo.state", state))?;
    Ok(RepoRow {
        id,
        info: RepoInfo {
            path,
            name,
            email,
            server_repo_id,
            status,
        },
    })
}

/// Insert or update a repo keyed by path. The owning user is get-or-created by email.
pub fn upsert_repo(conn: &Connection, repo: &RepoInfo) -> Result<i64, StateError> {
    let user_id = match &repo.email {
        Some(email) => Some(users::ensure_user(conn, email)?),
        None => None,
    };
    conn.execute(
        "INSERT INTO repo (name, path, user_id, server_repo_id, state)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(path) DO UPDATE SET
           name = excluded.name,
           user_id = COALESCE(excluded.user_id, repo.user_id),
           server_repo_id = COALESCE(excluded.server_repo_id, repo.server_repo_id),
           state = excluded.state",
        params![
            repo.name,
            repo.path,
            user_id,
            repo.server_repo_id,
            repo.status.as_str(),
        ],
    )
    .map_err(StateError::sqlite)?;
    repo_id(conn, &repo.path)?.ok_or_else(|| StateError::repo_not_found(repo.path.clone()))
}

pub fn repo_id(conn: &Connection, path: &str) -> Result<Option<i64>, StateError> {
    let result = conn.query_row(
        "SELECT id FROM repo WHERE path = ?1",
        params![path],
        |row| row.get(0),
    );
    match result {
        Ok(id) => Ok(Some(id)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(StateError::sqlite(e)),
    }
}

pub fn get_repo(conn: &Connection, path: &str) -> Result<Option<RepoRow>, StateError> {
    let result = conn.query_row(
        &format!(
            "SELECT {REPO_COLUMNS} FROM repo r LEFT JOIN user u ON u.id = r.user_id
             WHERE r.path = ?1"
        ),
        params![path],
        row_to_repo,
    );
    match result {
        Ok(raw) => build_repo(raw).map(Some),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(StateError::sqlite(e)),
    }
}

pub fn list_repos(conn: &Connection) -> Result<Vec<RepoRow>, StateError> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {REPO_COLUMNS} FROM repo r LEFT JOIN user u ON u.id = r.user_id
             ORDER BY r.path"
        ))
        .map_err(StateError::sqlite)?;
    let rows = stmt.query_map([], row_to_repo).map_err(StateError::sqlite)?;

    let mut repos = Vec::new();
    for row in rows {
        repos.push(build_repo(row.map_err(StateError::sqlite)?)?);
    }
    Ok(repos)
}

/// Returns false when no repo with that path exists.
pub fn set_repo_status(
    conn: &Connection,
    path: &str,
    status: RepoStatus,
) -> Result<bool, StateError> {
    let changed = conn
        .execute(
            "UPDATE repo SET state = ?1 WHERE path = ?2",
            params![status.as_str(), path],
        )
        .map_err(StateError::sqlite)?;
    Ok(changed > 0)
}

/// Get-or-create a branch row.
pub fn ensure_branch(conn: &Connection, repo_id: i64, name: &str) -> Result<i64, StateError> {
    conn.execute(
        "INSERT INTO repo_branch (name, repo_id) VALUES (?1, ?2)
         ON CONFLICT(repo_id, name) DO NOTHING",
        params![name, repo_id],
    )
    .map_err(StateError::sqlite)?;
    branch_id(conn, repo_id, name)?
        .ok_or_else(|| StateError::invalid_value("repo_branch.name", name))
}

pub fn branch_id(conn: &Connection, repo_id: i64, name: &str) -> Result<Option<i64>, StateError> {
    let result = conn.query_row(
        "SELECT id FROM repo_branch WHERE repo_id = ?1 AND name = ?2",
        params![repo_id, name],
        |row| row.get(0),
    );
    match result {
        Ok(id) => Ok(Some(id)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(StateError::sqlite(e)),
    }
}

/// Branch id for a (repo path, branch name) pair.
pub fn branch_id_by_path(
    conn: &Connection,
    repo_path: &str,
    name: &str,
) -> Result<Option<i64>, StateError> {
    let result = conn.query_row(
        "SELECT b.id FROM repo_branch b JOIN repo r ON r.id = b.repo_id
         WHERE r.path = ?1 AND b.name = ?2",
        params![repo_path, name],
        |row| row.get(0),
    );
    match result {
        Ok(id) => Ok(Some(id)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(StateError::sqlite(e)),
    }
}

pub fn list_branches(conn: &Connection, repo_id: i64) -> Result<Vec<String>, StateError> {
    let mut stmt = conn
        .prepare("SELECT name FROM repo_branch WHERE repo_id = ?1 ORDER BY name")
        .map_err(StateError::sqlite)?;
    let names = stmt
        .query_map(params![repo_id], |row| row.get(0))
        .map_err(StateError::sqlite)?
        .collect::<Result<Vec<String>, _>>()
        .map_err(StateError::sqlite)?;
    Ok(names)
}

/// Delete a branch and, via cascade, its file rows.
pub fn delete_branch(conn: &Connection, repo_id: i64, name: &str) -> Result<bool, StateError> {
    let changed = conn
        .execute(
            "DELETE FROM repo_branch WHERE repo_id = ?1 AND name = ?2",
            params![repo_id, name],
        )
        .map_err(StateError::sqlite)?;
    Ok(changed > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, schema};
    use tempfile::tempdir;

    fn setup_db() -> (tempfile::TempDir, Connection) {
        let dir = tempdir().unwrap();
        let conn = db::open_connection(&dir.path().join("state.db")).unwrap();
        schema::create_repo_tables(&conn).unwrap();
        (dir, conn)
    }

    #[test]
    fn upsert_repo_creates_owner_and_is_idempotent() {
        let (_dir, conn) = setup_db();
        let repo = RepoInfo::new("/work/app", Some("a@x.io"), RepoStatus::Synced);
        let first = upsert_repo(&conn, &repo).unwrap();
        let second = upsert_repo(&conn, &repo).unwrap();
        assert_eq!(first, second);

        let stored = get_repo(&conn, "/work/app").unwrap().unwrap();
        assert_eq!(stored.info.name, "app");
        assert_eq!(stored.info.email.as_deref(), Some("a@x.io"));
        assert_eq!(stored.info.status, RepoStatus::Synced);
        assert!(users::user_id_by_email(&conn, "a@x.io").unwrap().is_some());
    }

    #[test]
    fn upsert_keeps_server_repo_id_when_not_given() {
        let (_dir, conn) = setup_db();
        let mut repo = RepoInfo::new("/work/app", None, RepoStatus::Synced);
        repo.server_repo_id = Some(77);
        upsert_repo(&conn, &repo).unwrap();
        repo.server_repo_id = None;
        repo.status = RepoStatus::Disconnected;
        upsert_repo(&conn, &repo).unwrap();

        let stored = get_repo(&conn, "/work/app").unwrap().unwrap();
        assert_eq!(stored.info.server_repo_id, Some(77));
        assert_eq!(stored.info.status, RepoStatus::Disconnected);
    }

    #[test]
    fn ensure_branch_is_get_or_create() {
        let (_dir, conn) = setup_db();
        let repo_id = upsert_repo(
            &conn,
            &RepoInfo::new("/work/app", None, RepoStatus::Synced),
        )
        .unwrap();
        let a = ensure_branch(&conn, repo_id, "main").unwrap();
        let b = ensure_branch(&conn, repo_id, "main").unwrap();
        assert_eq!(a, b);
        assert_eq!(branch_id_by_path(&conn, "/work/app", "main").unwrap(), Some(a));
        assert_eq!(list_branches(&conn, repo_id).unwrap(), vec!["main".to_string()]);
    }

    #[test]
    fn set_status_on_unknown_repo_reports_false() {
        let (_dir, conn) = setup_db();
        assert!(!set_repo_status(&conn, "/nope", RepoStatus::Deleted).unwrap());
    }

    #[test]
    fn delete_branch_removes_only_that_branch() {
        let (_dir, conn) = setup_db();
        let repo_id = upsert_repo(
            &conn,
            &RepoInfo::new("/work/app", None, RepoStatus::Synced),
        )
        .unwrap();
        ensure_branch(&conn, repo_id, "main").unwrap();
        ensure_branch(&conn, repo_id, "dev").unwrap();
        assert!(delete_branch(&conn, repo_id, "dev").unwrap());
        assert_eq!(list_branches(&conn, repo_id).unwrap(), vec!["main".to_string()]);
    }
}
