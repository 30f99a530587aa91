use crate::backend::RepoStateBackend;
use crate::db::{self, DbOptions};
use crate::{files, repos, schema, users};
use rusqlite::Connection;
use shadowsync_core::config::Config;
use shadowsync_core::error::StateError;
use shadowsync_core::types::{FileRecord, RepoInfo, RepoStatus, UserCredentials};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// SQLite-backed repo state. One connection, serialized behind a mutex so the
/// classifier, dispatcher and migration thread can share it.
pub struct StateStore {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl StateStore {
    pub fn open(config: &Config) -> Result<Self, StateError> {
        Self::open_with(&config.state_db_path(), DbOptions::from(&config.storage))
    }

    pub fn open_with(db_path: &Path, options: DbOptions) -> Result<Self, StateError> {
        let conn = db::open_with_options(db_path, options)?;
        schema::create_migrations_table(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: db_path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` with exclusive access to the connection.
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StateError>,
    ) -> Result<T, StateError> {
        let guard = self.conn.lock().map_err(|_| StateError::Poisoned)?;
        f(&guard)
    }

    fn with_branch<T>(
        &self,
        repo: &str,
        branch: &str,
        f: impl FnOnce(&Connection, i64) -> Result<T, StateError>,
    ) -> Result<T, StateError> {
        self.with_conn(|conn| {
            let branch_id = repos::branch_id_by_path(conn, repo, branch)?
                .ok_or_else(|| StateError::branch_not_found(repo, branch))?;
            f(conn, branch_id)
        })
    }
}

impl RepoStateBackend for StateStore {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn list_repos(&self) -> Result<Vec<RepoInfo>, StateError> {
        self.with_conn(|conn| {
            Ok(repos::list_repos(conn)?
                .into_iter()
                .map(|row| row.info)
                .collect())
        })
    }

    fn find_repo(&self, path: &str) -> Result<Option<RepoInfo>, StateError> {
        self.with_conn(|conn| Ok(repos::get_repo(conn, path)?.map(|row| row.info)))
    }

    fn upsert_repo(&self, repo: &RepoInfo) -> Result<(), StateError> {
        self.with_conn(|conn| repos::upsert_repo(conn, repo).map(|_| ()))
    }

    fn set_repo_status(&self, path: &str, status: RepoStatus) -> Result<bool, StateError> {
        self.with_conn(|conn| repos::set_repo_status(conn, path, status))
    }

    fn list_branches(&self, repo: &str) -> Result<Vec<String>, StateError> {
        self.with_conn(|conn| match repos::repo_id(conn, repo)? {
            Some(repo_id) => repos::list_branches(conn, repo_id),
            None => Ok(Vec::new()),
        })
    }

    fn has_branch(&self, repo: &str, branch: &str) -> Result<bool, StateError> {
        self.with_conn(|conn| Ok(repos::branch_id_by_path(conn, repo, branch)?.is_some()))
    }

    fn ensure_branch(&self, repo: &str, branch: &str) -> Result<(), StateError> {
        self.with_conn(|conn| {
            let repo_id =
                repos::repo_id(conn, repo)?.ok_or_else(|| StateError::repo_not_found(repo))?;
            repos::ensure_branch(conn, repo_id, branch).map(|_| ())
        })
    }

    fn remove_branch(&self, repo: &str, branch: &str) -> Result<bool, StateError> {
        self.with_conn(|conn| match repos::repo_id(conn, repo)? {
            Some(repo_id) => repos::delete_branch(conn, repo_id, branch),
            None => Ok(false),
        })
    }

    fn branch_files(&self, repo: &str, branch: &str) -> Result<Vec<FileRecord>, StateError> {
        self.with_branch(repo, branch, files::list_files)
    }

    fn file_record(
        &self,
        repo: &str,
        branch: &str,
        path: &str,
    ) -> Result<Option<FileRecord>, StateError> {
        self.with_branch(repo, branch, |conn, id| files::get_file(conn, id, path))
    }

    fn upsert_file(
        &self,
        repo: &str,
        branch: &str,
        path: &str,
        server_file_id: Option<i64>,
    ) -> Result<(), StateError> {
        self.with_branch(repo, branch, |conn, id| {
            files::upsert_file(conn, id, path, server_file_id)
        })
    }

    fn rename_file(
        &self,
        repo: &str,
        branch: &str,
        old_path: &str,
        new_path: &str,
    ) -> Result<bool, StateError> {
        self.with_branch(repo, branch, |conn, id| {
            files::rename_file(conn, id, old_path, new_path)
        })
    }

    fn rename_dir(
        &self,
        repo: &str,
        branch: &str,
        old_dir: &str,
        new_dir: &str,
    ) -> Result<usize, StateError> {
        self.with_branch(repo, branch, |conn, id| {
            files::rename_dir(conn, id, old_dir, new_dir)
        })
    }

    fn remove_file(&self, repo: &str, branch: &str, path: &str) -> Result<bool, StateError> {
        self.with_branch(repo, branch, |conn, id| files::delete_file(conn, id, path))
    }

    fn files_under(
        &self,
        repo: &str,
        branch: &str,
        dir: &str,
    ) -> Result<Vec<FileRecord>, StateError> {
        self.with_branch(repo, branch, |conn, id| files::files_under(conn, id, dir))
    }

    fn pending_files(&self, repo: &str, branch: &str) -> Result<Vec<String>, StateError> {
        self.with_branch(repo, branch, files::pending_files)
    }

    fn upsert_user(&self, user: &UserCredentials) -> Result<(), StateError> {
        self.with_conn(|conn| users::upsert_user(conn, user).map(|_| ()))
    }

    fn find_user(&self, email: &str) -> Result<Option<UserCredentials>, StateError> {
        self.with_conn(|conn| users::get_user_by_email(conn, email))
    }

    fn active_user(&self) -> Result<Option<UserCredentials>, StateError> {
        self.with_conn(users::get_active_user)
    }
}
