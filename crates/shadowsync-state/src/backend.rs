use shadowsync_core::error::StateError;
use shadowsync_core::types::{FileRecord, RepoInfo, RepoStatus, UserCredentials};

/// The repo→branch→file→server-id mapping plus account credentials.
///
/// Implemented by the SQLite store, the legacy flat-file store, and the
/// router that picks between them per table. Every key is natural: repos by
/// absolute path, branches by name, files by `/`-separated relative path.
pub trait RepoStateBackend: Send + Sync {
    /// Short label for logs.
    fn name(&self) -> &'static str;

    fn list_repos(&self) -> Result<Vec<RepoInfo>, StateError>;
    fn find_repo(&self, path: &str) -> Result<Option<RepoInfo>, StateError>;
    fn upsert_repo(&self, repo: &RepoInfo) -> Result<(), StateError>;
    fn set_repo_status(&self, path: &str, status: RepoStatus) -> Result<bool, StateError>;

    fn list_branches(&self, repo: &str) -> Result<Vec<String>, StateError>;
    fn has_branch(&self, repo: &str, branch: &str) -> Result<bool, StateError>;
    /// Get-or-create. Fails with `RepoNotFound` for an unregistered repo.
    fn ensure_branch(&self, repo: &str, branch: &str) -> Result<(), StateError>;
    fn remove_branch(&self, repo: &str, branch: &str) -> Result<bool, StateError>;

    fn branch_files(&self, repo: &str, branch: &str) -> Result<Vec<FileRecord>, StateError>;
    fn file_record(
        &self,
        repo: &str,
        branch: &str,
        path: &str,
    ) -> Result<Option<FileRecord>, StateError>;
    /// Get-or-create a file record; `Some(id)` confirms it, `None` never clears an id.
    fn upsert_file(
        &self,
        repo: &str,
        branch: &str,
        path: &str,
        server_file_id: Option<i64>,
    ) -> Result<(), StateError>;
    fn rename_file(
        &self,
        repo: &str,
        branch: &str,
        old_path: &str,
        new_path: &str,
    ) -> Result<bool, StateError>;
    fn rename_dir(
        &self,
        repo: &str,
        branch: &str,
        old_dir: &str,
        new_dir: &str,
    ) -> Result<usize, StateError>;
    fn remove_file(&self, repo: &str, branch: &str, path: &str) -> Result<bool, StateError>;
    fn files_under(
        &self,
        repo: &str,
        branch: &str,
        dir: &str,
    ) -> Result<Vec<FileRecord>, StateError>;
    fn pending_files(&self, repo: &str, branch: &str) -> Result<Vec<String>, StateError>;

    fn upsert_user(&self, user: &UserCredentials) -> Result<(), StateError>;
    fn find_user(&self, email: &str) -> Result<Option<UserCredentials>, StateError>;
    fn active_user(&self) -> Result<Option<UserCredentials>, StateError>;
}

/// `true` when `path` is `dir` itself or lies beneath it.
pub fn is_under_dir(path: &str, dir: &str) -> bool {
    let dir = dir.trim_end_matches('/');
    path == dir
        || path
            .strip_prefix(dir)
            .is_some_and(|rest| rest.starts_with('/'))
}
