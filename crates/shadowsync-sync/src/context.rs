use crate::scanner::{SyncIgnore, scan_repo};
use crate::transport::Transport;
use shadowsync_core::config::Config;
use shadowsync_core::constants::{LOCK_BUFFER_FLUSH, LOCK_CLASSIFY_PREFIX};
use shadowsync_core::error::SyncError;
use shadowsync_core::ids::new_owner_id;
use shadowsync_core::types::{RepoInfo, RepoStatus};
use shadowsync_state::advisory_lock::AdvisoryLock;
use shadowsync_state::backend::RepoStateBackend;
use shadowsync_state::buffer::DiffBuffer;
use shadowsync_state::legacy::LegacyStore;
use shadowsync_state::migration::{MigrationManager, SCHEMA_IDENTIFIER};
use shadowsync_state::mirror::{MirrorKind, MirrorStore};
use shadowsync_state::router::StateRouter;
use shadowsync_state::schema::REPO_TABLE;
use shadowsync_state::store::StateStore;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Everything a sync phase needs, built once per process (or per test).
pub struct SyncContext {
    config: Config,
    data_dir: PathBuf,
    state: Arc<StateRouter>,
    buffer: DiffBuffer,
    locks: AdvisoryLock,
    transport: Arc<dyn Transport>,
    owner: String,
}

impl SyncContext {
    /// Open the state stores under `config.storage.data_dir`. The router
    /// starts from whatever the migration registry says; run
    /// [`SyncContext::migration_manager`] to move tables over.
    pub fn open(config: Config, transport: Arc<dyn Transport>) -> Result<Self, SyncError> {
        let data_dir = config.data_dir();
        std::fs::create_dir_all(&data_dir)?;

        let sqlite = Arc::new(StateStore::open(&config)?);
        let legacy = Arc::new(LegacyStore::new(
            &config.legacy_config_path(),
            &config.legacy_user_path(),
        ));
        let state = Arc::new(StateRouter::new(sqlite, legacy, SCHEMA_IDENTIFIER)?);

        Ok(Self {
            buffer: DiffBuffer::new(&data_dir),
            locks: AdvisoryLock::new(&data_dir),
            owner: new_owner_id(),
            config,
            data_dir,
            state,
            transport,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn state(&self) -> &Arc<StateRouter> {
        &self.state
    }

    pub fn buffer(&self) -> &DiffBuffer {
        &self.buffer
    }

    pub fn locks(&self) -> &AdvisoryLock {
        &self.locks
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Advisory lock owner id for this context.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn migration_manager(&self) -> MigrationManager {
        MigrationManager::new(Arc::clone(&self.state))
    }

    /// Repo data is being imported; sync phases stand down.
    pub fn repos_migrating(&self) -> bool {
        self.state.is_migrating(REPO_TABLE)
    }

    pub fn mirror(&self, kind: MirrorKind, repo_path: &str, branch: &str) -> MirrorStore {
        MirrorStore::new(&self.data_dir, kind, repo_path, branch)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.config.sync.lock_ttl_secs)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.config.sync.send_timeout_ms.max(1))
    }

    pub fn flush_lock_category(&self) -> &'static str {
        LOCK_BUFFER_FLUSH
    }

    pub fn classify_lock_category(&self, repo_path: &str, branch: &str) -> String {
        format!("{LOCK_CLASSIFY_PREFIX}:{repo_path}:{branch}")
    }

    /// Register a repo/branch as synced, snapshot every live file into the
    /// shadow mirror and record each unknown file as pending. Returns the
    /// number of newly tracked files.
    pub fn register(
        &self,
        repo_path: &str,
        branch: &str,
        email: Option<&str>,
    ) -> Result<usize, SyncError> {
        let mut info = self
            .state
            .find_repo(repo_path)?
            .unwrap_or_else(|| RepoInfo::new(repo_path, email, RepoStatus::Synced));
        if email.is_some() {
            info.email = email.map(str::to_string);
        }
        info.status = RepoStatus::Synced;
        self.state.upsert_repo(&info)?;
        self.state.ensure_branch(repo_path, branch)?;

        let known: HashSet<String> = self
            .state
            .branch_files(repo_path, branch)?
            .into_iter()
            .map(|f| f.path)
            .collect();
        let root = Path::new(repo_path);
        let live = scan_repo(root, &SyncIgnore::load(root));
        let shadow = self.mirror(MirrorKind::Shadow, repo_path, branch);
        shadow.copy(live.iter().map(|f| f.relative_path.as_str()))?;

        let mut added = 0;
        for file in &live {
            if known.contains(&file.relative_path) {
                continue;
            }
            self.state
                .upsert_file(repo_path, branch, &file.relative_path, None)?;
            added += 1;
        }
        info!(repo = repo_path, branch, files = live.len(), added, "Repository registered");
        Ok(added)
    }

    pub fn disconnect(&self, repo_path: &str) -> Result<bool, SyncError> {
        let changed = self
            .state
            .set_repo_status(repo_path, RepoStatus::Disconnected)?;
        if changed {
            info!(repo = repo_path, "Repository disconnected");
        }
        Ok(changed)
    }

    /// Forget a branch: its file records and all of its mirrors.
    pub fn remove_branch(&self, repo_path: &str, branch: &str) -> Result<bool, SyncError> {
        let removed = self.state.remove_branch(repo_path, branch)?;
        for kind in [MirrorKind::Shadow, MirrorKind::Originals, MirrorKind::Deleted] {
            self.mirror(kind, repo_path, branch).delete_all()?;
        }
        info!(repo = repo_path, branch, removed, "Branch removed");
        Ok(removed)
    }
}
