use crate::backend::RepoStateBackend;
use crate::legacy::LegacyStore;
use crate::schema::{self, REPO_TABLE, USER_TABLE};
use crate::store::StateStore;
use shadowsync_core::error::StateError;
use shadowsync_core::types::{FileRecord, MigrationState, RepoInfo, RepoStatus, UserCredentials};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tracing::debug;

/// Which store answers for a table right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Authority {
    /// Migration never completed; the flat files are the source of truth.
    /// Also covers an `IN_PROGRESS` row left behind by an earlier process.
    Legacy = 0,
    /// This process is importing the table right now. Reads and writes still
    /// go to the flat files, and sync work for the table's repos is held back.
    Migrating = 1,
    Sqlite = 2,
}

impl Authority {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Migrating,
            2 => Self::Sqlite,
            _ => Self::Legacy,
        }
    }

    fn from_state(state: MigrationState) -> Self {
        match state {
            MigrationState::Done => Self::Sqlite,
            MigrationState::NotStarted | MigrationState::InProgress | MigrationState::Error => {
                Self::Legacy
            }
        }
    }
}

/// Routes every backend call to SQLite or the legacy store, per table,
/// according to the migration registry.
pub struct StateRouter {
    sqlite: Arc<StateStore>,
    legacy: Arc<LegacyStore>,
    user_authority: AtomicU8,
    repo_authority: AtomicU8,
}

impl StateRouter {
    /// Build a router whose initial authorities reflect the `migrations` table.
    pub fn new(
        sqlite: Arc<StateStore>,
        legacy: Arc<LegacyStore>,
        identifier: &str,
    ) -> Result<Self, StateError> {
        let (user_state, repo_state) = sqlite.with_conn(|conn| {
            Ok((
                schema::migration_state(conn, USER_TABLE, identifier)?,
                schema::migration_state(conn, REPO_TABLE, identifier)?,
            ))
        })?;
        let router = Self {
            sqlite,
            legacy,
            user_authority: AtomicU8::new(Authority::from_state(user_state) as u8),
            repo_authority: AtomicU8::new(Authority::from_state(repo_state) as u8),
        };
        debug!(
            user = ?router.authority(USER_TABLE),
            repo = ?router.authority(REPO_TABLE),
            "State router initialized"
        );
        Ok(router)
    }

    pub fn sqlite(&self) -> &Arc<StateStore> {
        &self.sqlite
    }

    pub fn legacy(&self) -> &Arc<LegacyStore> {
        &self.legacy
    }

    fn slot(&self, table: &str) -> Option<&AtomicU8> {
        match table {
            USER_TABLE => Some(&self.user_authority),
            REPO_TABLE => Some(&self.repo_authority),
            _ => None,
        }
    }

    pub fn authority(&self, table: &str) -> Authority {
        self.slot(table)
            .map(|slot| Authority::from_u8(slot.load(Ordering::Acquire)))
            .unwrap_or(Authority::Legacy)
    }

    pub fn set_authority(&self, table: &str, authority: Authority) {
        if let Some(slot) = self.slot(table) {
            slot.store(authority as u8, Ordering::Release);
            debug!(table, ?authority, "State authority changed");
        }
    }

    /// Track a migration state transition for `table`.
    pub fn observe_migration(&self, table: &str, state: MigrationState) {
        self.set_authority(table, Authority::from_state(state));
    }

    /// `true` while this process imports the table; sync phases skip the cycle.
    pub fn is_migrating(&self, table: &str) -> bool {
        self.authority(table) == Authority::Migrating
    }

    fn users(&self) -> &dyn RepoStateBackend {
        match self.authority(USER_TABLE) {
            Authority::Sqlite => self.sqlite.as_ref(),
            Authority::Legacy | Authority::Migrating => self.legacy.as_ref(),
        }
    }

    fn repos(&self) -> &dyn RepoStateBackend {
        match self.authority(REPO_TABLE) {
            Authority::Sqlite => self.sqlite.as_ref(),
            Authority::Legacy | Authority::Migrating => self.legacy.as_ref(),
        }
    }
}

impl RepoStateBackend for StateRouter {
    fn name(&self) -> &'static str {
        self.repos().name()
    }

    fn list_repos(&self) -> Result<Vec<RepoInfo>, StateError> {
        self.repos().list_repos()
    }

    fn find_repo(&self, path: &str) -> Result<Option<RepoInfo>, StateError> {
        self.repos().find_repo(path)
    }

    fn upsert_repo(&self, repo: &RepoInfo) -> Result<(), StateError> {
        self.repos().upsert_repo(repo)
    }

    fn set_repo_status(&self, path: &str, status: RepoStatus) -> Result<bool, StateError> {
        self.repos().set_repo_status(path, status)
    }

    fn list_branches(&self, repo: &str) -> Result<Vec<String>, StateError> {
        self.repos().list_branches(repo)
    }

    fn has_branch(&self, repo: &str, branch: &str) -> Result<bool, StateError> {
        self.repos().has_branch(repo, branch)
    }

    fn ensure_branch(&self, repo: &str, branch: &str) -> Result<(), StateError> {
        self.repos().ensure_branch(repo, branch)
    }

    fn remove_branch(&self, repo: &str, branch: &str) -> Result<bool, StateError> {
        self.repos().remove_branch(repo, branch)
    }

    fn branch_files(&self, repo: &str, branch: &str) -> Result<Vec<FileRecord>, StateError> {
        self.repos().branch_files(repo, branch)
    }

    fn file_record(
        &self,
        repo: &str,
        branch: &str,
        path: &str,
    ) -> Result<Option<FileRecord>, StateError> {
        self.repos().file_record(repo, branch, path)
    }

    fn upsert_file(
        &self,
        repo: &str,
        branch: &str,
        path: &str,
        server_file_id: Option<i64>,
    ) -> Result<(), StateError> {
        self.repos().upsert_file(repo, branch, path, server_file_id)
    }

    fn rename_file(
        &self,
        repo: &str,
        branch: &str,
        old_path: &str,
        new_path: &str,
    ) -> Result<bool, StateError> {
        self.repos().rename_file(repo, branch, old_path, new_path)
    }

    fn rename_dir(
        &self,
        repo: &str,
        branch: &str,
        old_dir: &str,
        new_dir: &str,
    ) -> Result<usize, StateError> {
        self.repos().rename_dir(repo, branch, old_dir, new_dir)
    }

    fn remove_file(&self, repo: &str, branch: &str, path: &str) -> Result<bool, StateError> {
        self.repos().remove_file(repo, branch, path)
    }

    fn files_under(
        &self,
        repo: &str,
        branch: &str,
        dir: &str,
    ) -> Result<Vec<FileRecord>, StateError> {
        self.repos().files_under(repo, branch, dir)
    }

    fn pending_files(&self, repo: &str, branch: &str) -> Result<Vec<String>, StateError> {
        self.repos().pending_files(repo, branch)
    }

    fn upsert_user(&self, user: &UserCredentials) -> Result<(), StateError> {
        self.users().upsert_user(user)
    }

    fn find_user(&self, email: &str) -> Result<Option<UserCredentials>, StateError> {
        self.users().find_user(email)
    }

    fn active_user(&self) -> Result<Option<UserCredentials>, StateError> {
        self.users().active_user()
    }
}
