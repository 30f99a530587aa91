use rusqlite::{Connection, params};
use shadowsync_core::error::StateError;
use shadowsync_core::types::FileRecord;

/// Get-or-create a file row, then set its server id when one is given.
///
/// Passing `None` never clears an existing id: a known file stays known.
pub fn upsert_file(
    conn: &Connection,
    branch_id: i64,
    path: &str,
    server_file_id: Option<i64>,
) -> Result<(), StateError> {
    conn.execute(
        "INSERT INTO repo_file (path, repo_branch_id, server_file_id) VALUES (?1, ?2, ?3)
         ON CONFLICT(repo_branch_id, path) DO UPDATE SET
           server_file_id = COALESCE(excluded.server_file_id, repo_file.server_file_id)",
        params![path, branch_id, server_file_id],
    )
    .map_err(StateError::sqlite)?;
    Ok(())
}

pub fn get_file(
    conn: &Connection,
    branch_id: i64,
    path: &str,
) -> Result<Option<FileRecord>, StateError> {
    let result = conn.query_row(
        "SELECT path, server_file_id FROM repo_file WHERE repo_branch_id = ?1 AND path = ?2",
        params![branch_id, path],
        |row| {
            Ok(FileRecord {
                path: row.get(0)?,
                server_file_id: row.get(1)?,
            })
        },
    );
    match result {
        Ok(record) => Ok(Some(record)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(StateError::sqlite(e)),
    }
}

pub fn list_files(conn: &Connection, branch_id: i64) -> Result<Vec<FileRecord>, StateError> {
    let mut stmt = conn
        .prepare(
            "SELECT path, server_file_id FROM repo_file WHERE repo_branch_id = ?1 ORDER BY path",
        )
        .map_err(StateError::sqlite)?;
    let records = stmt
        .query_map(params![branch_id], |row| {
            Ok(FileRecord {
                path: row.get(0)?,
                server_file_id: row.get(1)?,
            })
        })
        .map_err(StateError::sqlite)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(StateError::sqlite)?;
    Ok(records)
}

/// Paths known locally but not yet confirmed by the server.
pub fn pending_files(conn: &Connection, branch_id: i64) -> Result<Vec<String>, StateError> {
    let mut stmt = conn
        .prepare(
            "SELECT path FROM repo_file
             WHERE repo_branch_id = ?1 AND server_file_id IS NULL ORDER BY path",
        )
        .map_err(StateError::sqlite)?;
    let paths = stmt
        .query_map(params![branch_id], |row| row.get(0))
        .map_err(StateError::sqlite)?
        .collect::<Result<Vec<String>, _>>()
        .map_err(StateError::sqlite)?;
    Ok(paths)
}

/// Move a file row to a new path, keeping its server id. A row already at
/// `new_path` is replaced. Returns false when `old_path` is unknown.
pub fn rename_file(
    conn: &Connection,
    branch_id: i64,
    old_path: &str,
    new_path: &str,
) -> Result<bool, StateError> {
    let tx = conn.unchecked_transaction().map_err(StateError::sqlite)?;
    tx.execute(
        "DELETE FROM repo_file WHERE repo_branch_id = ?1 AND path = ?2 AND path != ?3",
        params![branch_id, new_path, old_path],
    )
    .map_err(StateError::sqlite)?;
    let changed = tx
        .execute(
            "UPDATE repo_file SET path = ?3 WHERE repo_branch_id = ?1 AND path = ?2",
            params![branch_id, old_path, new_path],
        )
        .map_err(StateError::sqlite)?;
    tx.commit().map_err(StateError::sqlite)?;
    Ok(changed > 0)
}

/// Re-key every file under `old_dir/` to `new_dir/`. Rows already at a
/// target path are replaced. Returns the number moved.
pub fn rename_dir(
    conn: &Connection,
    branch_id: i64,
    old_dir: &str,
    new_dir: &str,
) -> Result<usize, StateError> {
    let old_prefix = format!("{}/", old_dir.trim_end_matches('/'));
    let new_prefix = format!("{}/", new_dir.trim_end_matches('/'));
    let tx = conn.unchecked_transaction().map_err(StateError::sqlite)?;
    tx.execute(
        "DELETE FROM repo_file
         WHERE repo_branch_id = ?1
           AND substr(path, 1, length(?2)) != ?2
           AND path IN (
               SELECT ?3 || substr(path, length(?2) + 1) FROM repo_file
               WHERE repo_branch_id = ?1 AND substr(path, 1, length(?2)) = ?2
           )",
        params![branch_id, old_prefix, new_prefix],
    )
    .map_err(StateError::sqlite)?;
    let changed = tx
        .execute(
            "UPDATE repo_file
             SET path = ?3 || substr(path, length(?2) + 1)
             WHERE repo_branch_id = ?1 AND substr(path, 1, length(?2)) = ?2",
            params![branch_id, old_prefix, new_prefix],
        )
        .map_err(StateError::sqlite)?;
    tx.commit().map_err(StateError::sqlite)?;
    Ok(changed)
}

/// Tracked paths at or under `dir`.
pub fn files_under(
    conn: &Connection,
    branch_id: i64,
    dir: &str,
) -> Result<Vec<FileRecord>, StateError> {
    let prefix = format!("{}/", dir.trim_end_matches('/'));
    let mut stmt = conn
        .prepare(
            "SELECT path, server_file_id FROM repo_file
             WHERE repo_branch_id = ?1 AND substr(path, 1, length(?2)) = ?2 ORDER BY path",
        )
        .map_err(StateError::sqlite)?;
    let records = stmt
        .query_map(params![branch_id, prefix], |row| {
            Ok(FileRecord {
                path: row.get(0)?,
                server_file_id: row.get(1)?,
            })
        })
        .map_err(StateError::sqlite)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(StateError::sqlite)?;
    Ok(records)
}

pub fn delete_file(conn: &Connection, branch_id: i64, path: &str) -> Result<bool, StateError> {
    let changed = conn
        .execute(
            "DELETE FROM repo_file WHERE repo_branch_id = ?1 AND path = ?2",
            params![branch_id, path],
        )
        .map_err(StateError::sqlite)?;
    Ok(changed > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, repos, schema};
    use shadowsync_core::types::{RepoInfo, RepoStatus};
    use tempfile::tempdir;

    fn setup_db() -> (tempfile::TempDir, Connection, i64) {
        let dir = tempdir().unwrap();
        let conn = db::open_connection(&dir.path().join("state.db")).unwrap();
        schema::create_repo_tables(&conn).unwrap();
        let repo_id = repos::upsert_repo(
            &conn,
            &RepoInfo::new("/work/app", None, RepoStatus::Synced),
        )
        .unwrap();
        let branch_id = repos::ensure_branch(&conn, repo_id, "main").unwrap();
        (dir, conn, branch_id)
    }

    #[test]
    fn pending_file_gets_id_later() {
        let (_dir, conn, branch) = setup_db();
        upsert_file(&conn, branch, "a.txt", None).unwrap();
        assert_eq!(pending_files(&conn, branch).unwrap(), vec!["a.txt".to_string()]);

        upsert_file(&conn, branch, "a.txt", Some(9)).unwrap();
        assert!(pending_files(&conn, branch).unwrap().is_empty());
        assert_eq!(
            get_file(&conn, branch, "a.txt").unwrap().unwrap().server_file_id,
            Some(9)
        );
    }

    #[test]
    fn upsert_without_id_keeps_existing_id() {
        let (_dir, conn, branch) = setup_db();
        upsert_file(&conn, branch, "a.txt", Some(3)).unwrap();
        upsert_file(&conn, branch, "a.txt", None).unwrap();
        assert_eq!(
            get_file(&conn, branch, "a.txt").unwrap().unwrap().server_file_id,
            Some(3)
        );
    }

    #[test]
    fn rename_moves_id_and_replaces_target() {
        let (_dir, conn, branch) = setup_db();
        upsert_file(&conn, branch, "a.txt", Some(1)).unwrap();
        upsert_file(&conn, branch, "b.txt", None).unwrap();
        assert!(rename_file(&conn, branch, "a.txt", "b.txt").unwrap());

        assert!(get_file(&conn, branch, "a.txt").unwrap().is_none());
        assert_eq!(
            get_file(&conn, branch, "b.txt").unwrap().unwrap().server_file_id,
            Some(1)
        );
        assert!(!rename_file(&conn, branch, "missing", "c.txt").unwrap());
    }

    #[test]
    fn rename_dir_only_touches_prefix_matches() {
        let (_dir, conn, branch) = setup_db();
        upsert_file(&conn, branch, "src/a.rs", Some(1)).unwrap();
        upsert_file(&conn, branch, "src/sub/b.rs", Some(2)).unwrap();
        upsert_file(&conn, branch, "src2/c.rs", Some(3)).unwrap();

        assert_eq!(rename_dir(&conn, branch, "src", "lib").unwrap(), 2);
        let paths: Vec<String> = list_files(&conn, branch)
            .unwrap()
            .into_iter()
            .map(|f| f.path)
            .collect();
        assert_eq!(paths, vec!["lib/a.rs", "lib/sub/b.rs", "src2/c.rs"]);
    }

    #[test]
    fn rename_dir_replaces_rows_at_target_paths() {
        let (_dir, conn, branch) = setup_db();
        upsert_file(&conn, branch, "src/a.txt", Some(1)).unwrap();
        upsert_file(&conn, branch, "lib/a.txt", Some(2)).unwrap();
        upsert_file(&conn, branch, "lib/b.txt", Some(3)).unwrap();

        assert_eq!(rename_dir(&conn, branch, "src", "lib").unwrap(), 1);
        let files: Vec<(String, Option<i64>)> = list_files(&conn, branch)
            .unwrap()
            .into_iter()
            .map(|f| (f.path, f.server_file_id))
            .collect();
        assert_eq!(
            files,
            vec![("lib/a.txt".to_string(), Some(1)), ("lib/b.txt".to_string(), Some(3))]
        );
    }

    #[test]
    fn files_under_matches_directory_children() {
        let (_dir, conn, branch) = setup_db();
        upsert_file(&conn, branch, "docs/a.md", Some(1)).unwrap();
        upsert_file(&conn, branch, "docs/b.md", None).unwrap();
        upsert_file(&conn, branch, "docs.md", Some(2)).unwrap();
        assert_eq!(files_under(&conn, branch, "docs").unwrap().len(), 2);
    }

    #[test]
    fn delete_file_is_idempotent() {
        let (_dir, conn, branch) = setup_db();
        upsert_file(&conn, branch, "a.txt", Some(1)).unwrap();
        assert!(delete_file(&conn, branch, "a.txt").unwrap());
        assert!(!delete_file(&conn, branch, "a.txt").unwrap());
    }
}
