//! Drains the diff buffer: resolves each record against the state store and
//! the mirrors, transmits what needs transmitting and removes what is done.
//!
//! A record is removed from the buffer unless its outcome is
//! [`Outcome::Deferred`]. Records referencing an unregistered repo or branch,
//! records waiting on an upload and records whose send failed are deferred
//! and retried on the next flush. A record that fails for reasons of its
//! own (a constraint it violates, a path outside the repository) is
//! discarded; any other failure defers the rest of that repository's records.

use crate::context::SyncContext;
use crate::patch::unified_patch;
use crate::scanner::{SyncIgnore, is_binary};
use crate::transport::{FileUpload, OutgoingDiff, send_with_timeout, upload_with_timeout};
use shadowsync_core::error::SyncError;
use shadowsync_core::time::now_iso8601;
use shadowsync_core::types::{ChangeKind, DiffRecord, RepoInfo, RepoStatus};
use shadowsync_state::backend::{RepoStateBackend, is_under_dir};
use shadowsync_state::buffer::BufferEntry;
use shadowsync_state::mirror::{MirrorKind, MirrorStore};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use tracing::{debug, info, warn};

/// Why a flush did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushSkip {
    LockBusy,
    Unreachable,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Records looked at this flush.
    pub drained: usize,
    /// Diffs confirmed by the server.
    pub sent: usize,
    /// Files registered remotely.
    pub uploaded: usize,
    /// Created records whose file already had a remote id.
    pub already_synced: usize,
    pub renames: usize,
    pub deferred: usize,
    pub discarded: usize,
    pub skipped: Option<FlushSkip>,
}

impl FlushReport {
    fn skipped(reason: FlushSkip) -> Self {
        Self {
            skipped: Some(reason),
            ..Self::default()
        }
    }
}

/// What happened to one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Sent,
    Uploaded,
    AlreadySynced,
    RenameResolved,
    Deferred,
    Discarded,
}

/// Per-flush bookkeeping shared by every record in the batch.
struct Batch<'a> {
    ctx: &'a SyncContext,
    /// (repo, branch, path) of every created-record seen in this batch.
    created: HashSet<(String, String, String)>,
    ignores: HashMap<String, SyncIgnore>,
    queued_new: HashMap<(String, String), BTreeSet<String>>,
    /// Repos whose state store failed; their remaining records wait.
    failed_repos: HashSet<String>,
    report: FlushReport,
}

/// One dispatcher pass over at most `sync.batch_size` records.
pub fn flush(ctx: &SyncContext) -> Result<FlushReport, SyncError> {
    let Some(_guard) = ctx
        .locks()
        .try_guard(ctx.flush_lock_category(), ctx.owner(), ctx.lock_ttl())?
    else {
        debug!("Flush lock busy, skipping");
        return Ok(FlushReport::skipped(FlushSkip::LockBusy));
    };
    if !ctx.transport().is_reachable() {
        debug!("Transport unreachable, skipping flush");
        return Ok(FlushReport::skipped(FlushSkip::Unreachable));
    }

    let entries = ctx.buffer().drain(ctx.config().sync.batch_size)?;
    let mut batch = Batch {
        ctx,
        created: HashSet::new(),
        ignores: HashMap::new(),
        queued_new: HashMap::new(),
        failed_repos: HashSet::new(),
        report: FlushReport {
            drained: entries.len(),
            ..FlushReport::default()
        },
    };

    for entry in &entries {
        let outcome = batch.dispatch(entry);
        batch.tally(outcome);
        if outcome != Outcome::Deferred {
            ctx.buffer().remove(entry)?;
        }
    }

    let report = batch.report;
    if report.drained > 0 {
        info!(
            drained = report.drained,
            sent = report.sent,
            uploaded = report.uploaded,
            renames = report.renames,
            deferred = report.deferred,
            discarded = report.discarded,
            "Diff buffer flushed"
        );
    }
    Ok(report)
}

impl Batch<'_> {
    fn tally(&mut self, outcome: Outcome) {
        let counter = match outcome {
            Outcome::Sent => &mut self.report.sent,
            Outcome::Uploaded => &mut self.report.uploaded,
            Outcome::AlreadySynced => &mut self.report.already_synced,
            Outcome::RenameResolved => &mut self.report.renames,
            Outcome::Deferred => &mut self.report.deferred,
            Outcome::Discarded => &mut self.report.discarded,
        };
        *counter += 1;
    }

    fn dispatch(&mut self, entry: &BufferEntry) -> Outcome {
        let record = match &entry.parsed {
            Ok(file) => match file.validate(self.ctx.config().sync.max_diff_bytes) {
                Ok(record) => record,
                Err(e) => {
                    warn!(record = %entry.file_name(), error = %e, "Invalid diff record discarded");
                    return Outcome::Discarded;
                }
            },
            Err(e) => {
                warn!(record = %entry.file_name(), error = %e, "Unreadable diff record discarded");
                return Outcome::Discarded;
            }
        };

        if self.failed_repos.contains(&record.repo_path) {
            return Outcome::Deferred;
        }
        match self.resolve(&record) {
            Ok(outcome) => outcome,
            Err(e) if e.is_permanent() => {
                warn!(
                    record = %entry.file_name(),
                    repo = %record.repo_path,
                    path = %record.path,
                    error = %e,
                    "Record can never apply, discarded"
                );
                Outcome::Discarded
            }
            Err(e) => {
                warn!(
                    record = %entry.file_name(),
                    repo = %record.repo_path,
                    error = %e,
                    "Record dispatch failed, repository deferred until next flush"
                );
                self.failed_repos.insert(record.repo_path.clone());
                Outcome::Deferred
            }
        }
    }

    fn resolve(&mut self, record: &DiffRecord) -> Result<Outcome, SyncError> {
        if self.ctx.repos_migrating() {
            return Ok(Outcome::Deferred);
        }
        let state = self.ctx.state();
        let Some(repo) = state.find_repo(&record.repo_path)? else {
            debug!(repo = %record.repo_path, "Record for unregistered repo kept");
            return Ok(Outcome::Deferred);
        };
        if repo.status != RepoStatus::Synced {
            info!(repo = %repo.path, status = %repo.status, path = %record.path, "Record for inactive repo discarded");
            return Ok(Outcome::Discarded);
        }
        if !state.has_branch(&record.repo_path, &record.branch)? {
            debug!(repo = %repo.path, branch = %record.branch, "Record for unregistered branch kept");
            return Ok(Outcome::Deferred);
        }

        let is_dir = matches!(record.kind, ChangeKind::DirectoryRenamed { .. });
        if self.ignore_for(&repo.path).should_ignore(&record.path, is_dir) {
            debug!(repo = %repo.path, path = %record.path, "Record for ignored path discarded");
            return Ok(Outcome::Discarded);
        }

        let target = Target::new(self.ctx, &repo, &record.branch);
        match &record.kind {
            ChangeKind::Created => self.handle_created(&target, record),
            ChangeKind::Renamed { old_path } => self.handle_renamed(&target, record, old_path),
            ChangeKind::DirectoryRenamed { old_path, new_path } => {
                self.handle_dir_renamed(&target, old_path, new_path)
            }
            ChangeKind::Deleted => self.handle_deleted(&target, record),
            ChangeKind::Modified => self.handle_modified(&target, record),
        }
    }

    fn ignore_for(&mut self, repo_path: &str) -> &SyncIgnore {
        self.ignores
            .entry(repo_path.to_string())
            .or_insert_with(|| SyncIgnore::load(Path::new(repo_path)))
    }

    fn created_in_batch(&self, target: &Target<'_>, path: &str) -> bool {
        self.created.contains(&(
            target.repo.path.clone(),
            target.branch.to_string(),
            path.to_string(),
        ))
    }

    fn handle_created(&mut self, target: &Target<'_>, record: &DiffRecord) -> Result<Outcome, SyncError> {
        self.created.insert((
            target.repo.path.clone(),
            target.branch.to_string(),
            record.path.clone(),
        ));

        let existing = target.file_id(&record.path)?;
        if existing.is_some() {
            target.originals.delete(&record.path)?;
            return Ok(Outcome::AlreadySynced);
        }

        let Some(content) = target.originals.read(&record.path)? else {
            warn!(repo = %target.repo.path, path = %record.path, "Originals snapshot missing, new-file record discarded");
            return Ok(Outcome::Discarded);
        };
        Ok(match target.upload(&record.path, &content)? {
            Some(_) => Outcome::Uploaded,
            None => Outcome::Deferred,
        })
    }

    fn handle_renamed(
        &mut self,
        target: &Target<'_>,
        record: &DiffRecord,
        old_path: &str,
    ) -> Result<Outcome, SyncError> {
        if self.created_in_batch(target, old_path) {
            debug!(repo = %target.repo.path, old = old_path, new = %record.path, "Rename source created in this batch, deferred");
            return Ok(Outcome::Deferred);
        }

        let state = self.ctx.state();
        let new_path = record.path.as_str();
        match state.file_record(&target.repo.path, target.branch, old_path)? {
            Some(file) if file.server_file_id.is_some() => {
                state.rename_file(&target.repo.path, target.branch, old_path, new_path)?;
                if target.shadow.exists(new_path) {
                    target.shadow.delete(old_path)?;
                } else {
                    target.shadow.rename(old_path, new_path)?;
                }
                debug!(repo = %target.repo.path, old = old_path, new = new_path, "Rename resolved");
                Ok(Outcome::RenameResolved)
            }
            pending => {
                warn!(repo = %target.repo.path, old = old_path, new = new_path, "Rename source has no remote id, tracking target as a new file");
                if pending.is_some() {
                    state.remove_file(&target.repo.path, target.branch, old_path)?;
                    target.originals.delete(old_path)?;
                }
                self.track_as_new(target, new_path)?;
                Ok(Outcome::Discarded)
            }
        }
    }

    /// Queue a created-record for a live file the state store lost track of.
    fn track_as_new(&self, target: &Target<'_>, path: &str) -> Result<(), SyncError> {
        let live = Path::new(&target.repo.path).join(path);
        let Ok(bytes) = std::fs::read(&live) else {
            return Ok(());
        };
        target.originals.copy([path])?;
        self.ctx
            .state()
            .upsert_file(&target.repo.path, target.branch, path, None)?;
        self.ctx.buffer().enqueue(
            &DiffRecord::created(&target.repo.path, target.branch, path).with_binary(is_binary(&bytes)),
        )?;
        Ok(())
    }

    fn handle_dir_renamed(
        &mut self,
        target: &Target<'_>,
        old_dir: &str,
        new_dir: &str,
    ) -> Result<Outcome, SyncError> {
        let pending_inside = self.created.iter().any(|(repo, branch, path)| {
            repo == &target.repo.path && branch == target.branch && is_under_dir(path, old_dir)
        });
        if pending_inside {
            debug!(repo = %target.repo.path, old = old_dir, new = new_dir, "Directory rename waits on new files inside it");
            return Ok(Outcome::Deferred);
        }

        let moved = self
            .ctx
            .state()
            .rename_dir(&target.repo.path, target.branch, old_dir, new_dir)?;
        target.shadow.rename_dir(old_dir, new_dir)?;
        target.originals.rename_dir(old_dir, new_dir)?;
        debug!(repo = %target.repo.path, old = old_dir, new = new_dir, files = moved, "Directory rename resolved");
        Ok(Outcome::RenameResolved)
    }

    fn handle_deleted(&mut self, target: &Target<'_>, record: &DiffRecord) -> Result<Outcome, SyncError> {
        let state = self.ctx.state();
        let own = state.file_record(&target.repo.path, target.branch, &record.path)?;
        let children: Vec<String> = state
            .files_under(&target.repo.path, target.branch, &record.path)?
            .into_iter()
            .map(|f| f.path)
            .filter(|p| p != &record.path)
            .collect();

        if own.is_some() || children.is_empty() {
            return self.delete_file(target, record, &record.path);
        }

        let mut all_sent = true;
        for child in &children {
            if self.delete_file(target, record, child)? == Outcome::Deferred {
                all_sent = false;
            }
        }
        if all_sent {
            debug!(repo = %target.repo.path, dir = %record.path, files = children.len(), "Directory delete sent");
            Ok(Outcome::Sent)
        } else {
            Ok(Outcome::Deferred)
        }
    }

    fn delete_file(
        &self,
        target: &Target<'_>,
        record: &DiffRecord,
        path: &str,
    ) -> Result<Outcome, SyncError> {
        let Some(file_id) = target.file_id(path)? else {
            warn!(repo = %target.repo.path, path, "Delete for a file without a remote id discarded");
            target.forget(path)?;
            return Ok(Outcome::Discarded);
        };

        let shadow = target.shadow.read(path)?.unwrap_or_default();
        let binary = record.is_binary || is_binary(&shadow);
        let patch = if binary {
            String::new()
        } else {
            unified_patch(&String::from_utf8_lossy(&shadow), "")
        };
        let mut child = DiffRecord::deleted(&target.repo.path, target.branch, path)
            .with_binary(binary)
            .with_created_at(record.created_at.clone());
        child.patch = patch;

        if !self.transmit(&child, file_id) {
            return Ok(Outcome::Deferred);
        }
        target.forget(path)?;
        Ok(Outcome::Sent)
    }

    fn handle_modified(&mut self, target: &Target<'_>, record: &DiffRecord) -> Result<Outcome, SyncError> {
        if self.created_in_batch(target, &record.path) {
            return Ok(Outcome::Deferred);
        }
        if record.patch.is_empty() && !record.is_binary {
            return Ok(Outcome::Discarded);
        }

        let state = self.ctx.state();
        let file = state.file_record(&target.repo.path, target.branch, &record.path)?;
        match file {
            Some(file) => match file.server_file_id {
                Some(id) => Ok(if self.transmit(record, id) {
                    Outcome::Sent
                } else {
                    Outcome::Deferred
                }),
                None => {
                    if self.queued_new_files(target)?.contains(&record.path) {
                        return Ok(Outcome::Deferred);
                    }
                    self.force_upload(target, &record.path)?;
                    Ok(Outcome::Deferred)
                }
            },
            None => {
                let live = Path::new(&target.repo.path).join(&record.path);
                if !live.is_file() {
                    debug!(repo = %target.repo.path, path = %record.path, "Change for an untracked vanished file discarded");
                    return Ok(Outcome::Discarded);
                }
                self.force_upload(target, &record.path)?;
                Ok(Outcome::Deferred)
            }
        }
    }

    fn queued_new_files(&mut self, target: &Target<'_>) -> Result<&BTreeSet<String>, SyncError> {
        let key = (target.repo.path.clone(), target.branch.to_string());
        if !self.queued_new.contains_key(&key) {
            let paths = self
                .ctx
                .buffer()
                .queued_new_files(&target.repo.path, target.branch)?;
            self.queued_new.insert(key.clone(), paths);
        }
        Ok(&self.queued_new[&key])
    }

    /// Register a file that has changes queued but no remote id yet. The
    /// content comes from the originals snapshot, else the live file.
    fn force_upload(&mut self, target: &Target<'_>, path: &str) -> Result<(), SyncError> {
        let content = match target.originals.read(path)? {
            Some(content) => content,
            None => match std::fs::read(Path::new(&target.repo.path).join(path)) {
                Ok(content) => content,
                Err(e) => {
                    debug!(repo = %target.repo.path, path, error = %e, "Nothing to upload");
                    return Ok(());
                }
            },
        };
        if target.upload(path, &content)?.is_some() {
            self.report.uploaded += 1;
        }
        Ok(())
    }

    fn transmit(&self, record: &DiffRecord, file_id: i64) -> bool {
        let diff = OutgoingDiff::new(record, file_id);
        match send_with_timeout(self.ctx.transport(), diff, self.ctx.send_timeout()) {
            Ok(()) => true,
            Err(e) => {
                debug!(repo = %record.repo_path, path = %record.path, kind = %record.kind, error = %e, "Send failed, record kept");
                false
            }
        }
    }
}

/// One repo/branch's mirrors, as seen by a single record.
struct Target<'a> {
    ctx: &'a SyncContext,
    repo: &'a RepoInfo,
    branch: &'a str,
    shadow: MirrorStore,
    originals: MirrorStore,
    deleted: MirrorStore,
}

impl<'a> Target<'a> {
    fn new(ctx: &'a SyncContext, repo: &'a RepoInfo, branch: &'a str) -> Self {
        Self {
            ctx,
            repo,
            branch,
            shadow: ctx.mirror(MirrorKind::Shadow, &repo.path, branch),
            originals: ctx.mirror(MirrorKind::Originals, &repo.path, branch),
            deleted: ctx.mirror(MirrorKind::Deleted, &repo.path, branch),
        }
    }

    fn file_id(&self, path: &str) -> Result<Option<i64>, SyncError> {
        Ok(self
            .ctx
            .state()
            .file_record(&self.repo.path, self.branch, path)?
            .and_then(|f| f.server_file_id))
    }

    /// Create the remote file and record its id. `Ok(None)` when the
    /// transport failed; the caller keeps its record.
    fn upload(&self, path: &str, content: &[u8]) -> Result<Option<i64>, SyncError> {
        let binary = is_binary(content);
        let upload = FileUpload {
            repo_path: self.repo.path.clone(),
            server_repo_id: self.repo.server_repo_id,
            branch: self.branch.to_string(),
            file_relative_path: path.to_string(),
            is_binary: binary,
            size: content.len() as u64,
            content: if binary {
                String::new()
            } else {
                String::from_utf8_lossy(content).into_owned()
            },
            created_at: now_iso8601(),
        };
        let id = match upload_with_timeout(self.ctx.transport(), upload, self.ctx.send_timeout()) {
            Ok(id) => id,
            Err(e) => {
                debug!(repo = %self.repo.path, path, error = %e, "Upload failed, will retry");
                return Ok(None);
            }
        };
        self.ctx
            .state()
            .upsert_file(&self.repo.path, self.branch, path, Some(id))?;
        self.originals.delete(path)?;
        debug!(repo = %self.repo.path, path, id, "File uploaded");
        Ok(Some(id))
    }

    /// Drop every trace of a file that is gone for good.
    fn forget(&self, path: &str) -> Result<(), SyncError> {
        self.shadow.delete(path)?;
        self.originals.delete(path)?;
        self.deleted.delete(path)?;
        self.ctx
            .state()
            .remove_file(&self.repo.path, self.branch, path)?;
        Ok(())
    }
}
