//! Bulk re-upload of files that are tracked but were never registered
//! remotely, e.g. everything snapshotted by `register` or a new file whose
//! created-record was lost.

use crate::context::SyncContext;
use crate::scanner::is_binary;
use crate::transport::{FileUpload, upload_with_timeout};
use shadowsync_core::error::SyncError;
use shadowsync_core::time::now_iso8601;
use shadowsync_core::types::{RepoInfo, RepoStatus};
use shadowsync_state::backend::RepoStateBackend;
use shadowsync_state::mirror::MirrorKind;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReuploadOutcome {
    /// Nothing pending.
    Idle,
    /// Another process holds the flush lock; its dispatcher may be
    /// uploading the same files.
    Busy,
    Uploaded { uploaded: usize },
    /// Some uploads failed; `failures` consecutive failed passes so far.
    Failed { uploaded: usize, failed: usize, failures: u32 },
    /// Too many consecutive failures; skipped until the process restarts.
    GaveUp,
}

/// Consecutive failed passes per repo/branch, kept for the life of the
/// process.
#[derive(Debug, Default)]
pub struct ReuploadTracker {
    failures: Mutex<HashMap<(String, String), u32>>,
}

impl ReuploadTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failures(&self, repo_path: &str, branch: &str) -> u32 {
        self.failures
            .lock()
            .map(|map| {
                map.get(&(repo_path.to_string(), branch.to_string()))
                    .copied()
                    .unwrap_or(0)
            })
            .unwrap_or(0)
    }

    fn record(&self, repo_path: &str, branch: &str, failed: bool) -> u32 {
        let Ok(mut map) = self.failures.lock() else {
            return 0;
        };
        let key = (repo_path.to_string(), branch.to_string());
        if failed {
            let count = map.entry(key).or_insert(0);
            *count += 1;
            *count
        } else {
            map.remove(&key);
            0
        }
    }
}

/// Upload every pending file of one repo/branch that has no queued
/// created-record. Runs under the flush lock, which also covers the
/// dispatcher's forced uploads.
pub fn reupload_branch(
    ctx: &SyncContext,
    tracker: &ReuploadTracker,
    repo: &RepoInfo,
    branch: &str,
) -> Result<ReuploadOutcome, SyncError> {
    let limit = ctx.config().sync.max_reupload_failures;
    if tracker.failures(&repo.path, branch) >= limit {
        return Ok(ReuploadOutcome::GaveUp);
    }
    let Some(_guard) = ctx
        .locks()
        .try_guard(ctx.flush_lock_category(), ctx.owner(), ctx.lock_ttl())?
    else {
        debug!(repo = %repo.path, branch, "Flush lock busy, re-upload postponed");
        return Ok(ReuploadOutcome::Busy);
    };

    let queued = ctx.buffer().queued_new_files(&repo.path, branch)?;
    let pending: Vec<String> = ctx
        .state()
        .pending_files(&repo.path, branch)?
        .into_iter()
        .filter(|path| !queued.contains(path))
        .collect();
    if pending.is_empty() {
        return Ok(ReuploadOutcome::Idle);
    }
    if !ctx.transport().is_reachable() {
        debug!(repo = %repo.path, branch, "Transport unreachable, re-upload postponed");
        return Ok(ReuploadOutcome::Idle);
    }

    let originals = ctx.mirror(MirrorKind::Originals, &repo.path, branch);
    let mut uploaded = 0;
    let mut failed = 0;
    for path in &pending {
        let content = match originals.read(path)? {
            Some(content) => content,
            None => match std::fs::read(Path::new(&repo.path).join(path)) {
                Ok(content) => content,
                Err(e) => {
                    warn!(repo = %repo.path, branch, path = %path, error = %e, "Pending file unreadable");
                    failed += 1;
                    continue;
                }
            },
        };

        let binary = is_binary(&content);
        let upload = FileUpload {
            repo_path: repo.path.clone(),
            server_repo_id: repo.server_repo_id,
            branch: branch.to_string(),
            file_relative_path: path.clone(),
            is_binary: binary,
            size: content.len() as u64,
            content: if binary {
                String::new()
            } else {
                String::from_utf8_lossy(&content).into_owned()
            },
            created_at: now_iso8601(),
        };
        match upload_with_timeout(ctx.transport(), upload, ctx.send_timeout()) {
            Ok(id) => {
                ctx.state().upsert_file(&repo.path, branch, path, Some(id))?;
                originals.delete(path)?;
                uploaded += 1;
            }
            Err(e) => {
                debug!(repo = %repo.path, branch, path = %path, error = %e, "Re-upload failed");
                failed += 1;
            }
        }
    }

    let failures = tracker.record(&repo.path, branch, failed > 0);
    if failed == 0 {
        info!(repo = %repo.path, branch, uploaded, "Pending files uploaded");
        return Ok(ReuploadOutcome::Uploaded { uploaded });
    }
    if failures >= limit {
        error!(
            repo = %repo.path,
            branch,
            failures,
            remaining = failed,
            "Giving up on uploading pending files until restart"
        );
        return Ok(ReuploadOutcome::GaveUp);
    }
    warn!(repo = %repo.path, branch, uploaded, failed, failures, "Some pending files failed to upload");
    Ok(ReuploadOutcome::Failed {
        uploaded,
        failed,
        failures,
    })
}

/// Re-upload pass over the current branch of every synced repo.
pub fn reupload_all(
    ctx: &SyncContext,
    tracker: &ReuploadTracker,
) -> Result<Vec<(String, ReuploadOutcome)>, SyncError> {
    if ctx.repos_migrating() {
        return Ok(Vec::new());
    }
    let mut outcomes = Vec::new();
    for repo in ctx.state().list_repos()? {
        if repo.status != RepoStatus::Synced {
            continue;
        }
        let branch = shadowsync_core::vcs::current_branch(Path::new(&repo.path));
        if !ctx.state().has_branch(&repo.path, &branch)? {
            continue;
        }
        match reupload_branch(ctx, tracker, &repo, &branch) {
            Ok(outcome) => outcomes.push((repo.path, outcome)),
            Err(e) => warn!(repo = %repo.path, branch, error = %e, "Re-upload failed"),
        }
    }
    Ok(outcomes)
}
