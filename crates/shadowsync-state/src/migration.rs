//! Versioned migration of the legacy flat files into SQLite.
//!
//! Each step owns one table and a schema identifier. A step runs when its
//! latest `migrations` row is absent, `NOT_STARTED` or `ERROR`; it is skipped
//! when `IN_PROGRESS` (a crashed import is never resumed automatically) or
//! `DONE`. Imports are upserts, so re-running a step after an error is safe.
//!
//! Sync work is held back only while [`MigrationManager`] is importing a
//! table. A stale `IN_PROGRESS` row leaves the legacy store authoritative and
//! sync running against it.

use crate::backend::RepoStateBackend;
use crate::legacy::LegacyStore;
use crate::router::{Authority, StateRouter};
use crate::schema::{self, REPO_TABLE, USER_TABLE};
use crate::store::StateStore;
use rusqlite::Connection;
use shadowsync_core::error::StateError;
use shadowsync_core::types::{MigrationState, RepoInfo};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{error, info, warn};

/// Identifier shared by the current table layouts.
pub const SCHEMA_IDENTIFIER: &str = "v1";

/// Entries copied and entries skipped as malformed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportCount {
    pub imported: usize,
    pub skipped: usize,
}

type CreateFn = fn(&Connection) -> Result<(), StateError>;
type ImportFn = fn(&LegacyStore, &StateStore) -> Result<ImportCount, StateError>;

struct MigrationStep {
    table: &'static str,
    identifier: &'static str,
    create: CreateFn,
    import: ImportFn,
}

/// Users first: repo import links repos to users by email.
static STEPS: &[MigrationStep] = &[
    MigrationStep {
        table: USER_TABLE,
        identifier: SCHEMA_IDENTIFIER,
        create: schema::create_user_table,
        import: import_users,
    },
    MigrationStep {
        table: REPO_TABLE,
        identifier: SCHEMA_IDENTIFIER,
        create: schema::create_repo_tables,
        import: import_repos,
    },
];

/// Outcome of one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub table: &'static str,
    pub identifier: &'static str,
    pub before: MigrationState,
    pub after: MigrationState,
    pub count: ImportCount,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub steps: Vec<StepOutcome>,
}

impl MigrationReport {
    pub fn is_complete(&self) -> bool {
        self.steps.iter().all(|s| s.after == MigrationState::Done)
    }
}

pub struct MigrationManager {
    router: Arc<StateRouter>,
}

impl MigrationManager {
    pub fn new(router: Arc<StateRouter>) -> Self {
        Self { router }
    }

    /// Run every registered step in order. Failures are recorded as `ERROR`
    /// rows and never propagate; the legacy store stays authoritative.
    pub fn run(&self) -> MigrationReport {
        let mut report = MigrationReport::default();
        for step in STEPS {
            report.steps.push(self.run_step(step));
        }
        report
    }

    /// Run the registry on a background thread.
    pub fn spawn(self) -> std::io::Result<JoinHandle<MigrationReport>> {
        std::thread::Builder::new()
            .name("shadowsync-migration".into())
            .spawn(move || self.run())
    }

    fn run_step(&self, step: &MigrationStep) -> StepOutcome {
        let sqlite = self.router.sqlite();
        let mut outcome = StepOutcome {
            table: step.table,
            identifier: step.identifier,
            before: MigrationState::NotStarted,
            after: MigrationState::NotStarted,
            count: ImportCount::default(),
        };

        let before = match sqlite
            .with_conn(|conn| schema::migration_state(conn, step.table, step.identifier))
        {
            Ok(state) => state,
            Err(e) => {
                error!(table = step.table, error = %e, "Failed to read migration state");
                outcome.after = MigrationState::Error;
                return outcome;
            }
        };
        outcome.before = before;
        outcome.after = before;
        if !before.should_run() {
            self.router.observe_migration(step.table, before);
            return outcome;
        }

        info!(table = step.table, identifier = step.identifier, from = before.as_str(), "Migrating table");
        match self.execute(step) {
            Ok(count) => {
                outcome.count = count;
                outcome.after = MigrationState::Done;
                info!(
                    table = step.table,
                    imported = count.imported,
                    skipped = count.skipped,
                    "Migration complete"
                );
            }
            Err(e) => {
                error!(table = step.table, error = %e, "Migration failed");
                if let Err(mark) = self.transition(step, MigrationState::Error) {
                    error!(table = step.table, error = %mark, "Failed to record migration error");
                    self.router.observe_migration(step.table, MigrationState::Error);
                }
                outcome.after = MigrationState::Error;
            }
        }
        outcome
    }

    fn execute(&self, step: &MigrationStep) -> Result<ImportCount, StateError> {
        let sqlite = self.router.sqlite();
        self.transition(step, MigrationState::InProgress)?;
        self.router.set_authority(step.table, Authority::Migrating);
        sqlite.with_conn(step.create)?;
        let count = (step.import)(self.router.legacy(), sqlite).map_err(|e| {
            StateError::migration_failed(step.table, step.identifier, e.to_string())
        })?;
        self.transition(step, MigrationState::Done)?;
        Ok(count)
    }

    fn transition(&self, step: &MigrationStep, state: MigrationState) -> Result<(), StateError> {
        self.router.sqlite().with_conn(|conn| {
            schema::record_migration_state(conn, step.table, step.identifier, state)
        })?;
        self.router.observe_migration(step.table, state);
        Ok(())
    }
}

fn import_users(legacy: &LegacyStore, sqlite: &StateStore) -> Result<ImportCount, StateError> {
    let mut count = ImportCount::default();
    for (email, entry) in legacy.user_entries()? {
        match entry {
            Ok(user) => {
                sqlite.upsert_user(&user.to_credentials(&email))?;
                count.imported += 1;
            }
            Err(reason) => {
                warn!(%email, %reason, "Skipping malformed legacy user entry");
                count.skipped += 1;
            }
        }
    }
    Ok(count)
}

fn import_repos(legacy: &LegacyStore, sqlite: &StateStore) -> Result<ImportCount, StateError> {
    let mut count = ImportCount::default();
    for (path, entry) in legacy.repo_entries()? {
        let repo = match entry {
            Ok(repo) => repo,
            Err(reason) => {
                warn!(repo = %path, %reason, "Skipping malformed legacy repo entry");
                count.skipped += 1;
                continue;
            }
        };
        let info: RepoInfo = repo.to_info(&path);
        sqlite.upsert_repo(&info)?;
        for (branch, files) in &repo.branches {
            sqlite.ensure_branch(&path, branch)?;
            for (file, server_file_id) in files {
                sqlite.upsert_file(&path, branch, file, *server_file_id)?;
            }
        }
        count.imported += 1;
    }
    Ok(count)
}
