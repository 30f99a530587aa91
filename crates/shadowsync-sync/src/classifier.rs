//! Turns the difference between a live working tree and its shadow mirror
//! into queued diff records.
//!
//! One pass, per repo/branch, under the `classify:{repo}:{branch}` advisory
//! lock:
//!
//! 1. A tracked text file is diffed against its shadow snapshot. Without a
//!    snapshot, a file above `copy_threshold_bytes` is diffed against itself
//!    (nothing to send) and a smaller one against the empty string.
//! 2. An untracked file with no snapshot is compared with every orphaned
//!    shadow entry. Exactly one candidate above `rename_similarity` makes it
//!    a rename; the orphan snapshot is dropped.
//! 3. Otherwise it is new: copied to the originals mirror and recorded as a
//!    pending file.
//! 4. The shadow snapshot is refreshed for every file handled above.
//! 5. Tracked files gone from the tree become deletes. A vanished directory
//!    whose tracked files are all gone yields one delete for the topmost such
//!    directory instead of one per file.

use crate::context::SyncContext;
use crate::patch::{similarity, unified_patch};
use crate::scanner::{ScannedFile, SyncIgnore, is_binary, scan_repo};
use shadowsync_core::error::SyncError;
use shadowsync_core::types::{DiffRecord, FileRecord, RepoStatus};
use shadowsync_state::backend::RepoStateBackend;
use shadowsync_state::mirror::{MirrorKind, MirrorStore};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use tracing::{debug, info, warn};

/// Why a pass did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassifySkip {
    Migrating,
    RepoNotSynced,
    BranchNotRegistered,
    LockBusy,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassifyReport {
    pub modified: usize,
    pub created: usize,
    pub renamed: usize,
    pub deleted: usize,
    /// Untracked files whose snapshot exists: a rename or upload is in flight.
    pub awaiting_flush: usize,
    pub skipped: Option<ClassifySkip>,
}

impl ClassifyReport {
    fn skipped(reason: ClassifySkip) -> Self {
        Self {
            skipped: Some(reason),
            ..Self::default()
        }
    }

    pub fn records(&self) -> usize {
        self.modified + self.created + self.renamed + self.deleted
    }
}

struct Orphan {
    path: String,
    content: String,
}

struct Pass<'a> {
    ctx: &'a SyncContext,
    repo_path: &'a str,
    branch: &'a str,
    shadow: MirrorStore,
    originals: MirrorStore,
    deleted: MirrorStore,
    known: HashMap<String, FileRecord>,
    report: ClassifyReport,
}

/// Classify one repo/branch.
pub fn classify(
    ctx: &SyncContext,
    repo_path: &str,
    branch: &str,
) -> Result<ClassifyReport, SyncError> {
    if ctx.repos_migrating() {
        return Ok(ClassifyReport::skipped(ClassifySkip::Migrating));
    }
    let state = ctx.state();
    match state.find_repo(repo_path)? {
        Some(repo) if repo.status == RepoStatus::Synced => {}
        _ => return Ok(ClassifyReport::skipped(ClassifySkip::RepoNotSynced)),
    }
    if !state.has_branch(repo_path, branch)? {
        return Ok(ClassifyReport::skipped(ClassifySkip::BranchNotRegistered));
    }

    let category = ctx.classify_lock_category(repo_path, branch);
    let Some(_guard) = ctx
        .locks()
        .try_guard(&category, ctx.owner(), ctx.lock_ttl())?
    else {
        debug!(repo = repo_path, branch, "Classify lock busy, skipping");
        return Ok(ClassifyReport::skipped(ClassifySkip::LockBusy));
    };

    let known = state
        .branch_files(repo_path, branch)?
        .into_iter()
        .map(|f| (f.path.clone(), f))
        .collect();
    let mut pass = Pass {
        ctx,
        repo_path,
        branch,
        shadow: ctx.mirror(MirrorKind::Shadow, repo_path, branch),
        originals: ctx.mirror(MirrorKind::Originals, repo_path, branch),
        deleted: ctx.mirror(MirrorKind::Deleted, repo_path, branch),
        known,
        report: ClassifyReport::default(),
    };
    pass.run()?;

    let report = pass.report;
    if report.records() > 0 {
        info!(
            repo = repo_path,
            branch,
            modified = report.modified,
            created = report.created,
            renamed = report.renamed,
            deleted = report.deleted,
            "Changes classified"
        );
    }
    Ok(report)
}

impl Pass<'_> {
    fn run(&mut self) -> Result<(), SyncError> {
        let root = Path::new(self.repo_path);
        let ignore = SyncIgnore::load(root);
        let live = scan_repo(root, &ignore);
        let live_paths: HashSet<String> = live.iter().map(|f| f.relative_path.clone()).collect();

        let mut orphans = self.orphans(&live_paths)?;
        let mut renamed_from = HashSet::new();

        for file in &live {
            self.classify_file(file, &mut orphans, &mut renamed_from)?;
        }
        self.classify_deletes(root, &ignore, &live_paths, &renamed_from)?;
        Ok(())
    }

    /// Shadow entries of tracked files that have no live counterpart and
    /// whose delete is not already queued. Binary and empty entries are never
    /// rename candidates.
    fn orphans(&self, live_paths: &HashSet<String>) -> Result<Vec<Orphan>, SyncError> {
        let mut orphans = Vec::new();
        for path in self.shadow.list()? {
            if live_paths.contains(&path)
                || !self.known.contains_key(&path)
                || self.deleted.exists(&path)
            {
                continue;
            }
            let Some(bytes) = self.shadow.read(&path)? else {
                continue;
            };
            if bytes.is_empty() || is_binary(&bytes) {
                continue;
            }
            orphans.push(Orphan {
                path,
                content: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }
        Ok(orphans)
    }

    fn classify_file(
        &mut self,
        file: &ScannedFile,
        orphans: &mut Vec<Orphan>,
        renamed_from: &mut HashSet<String>,
    ) -> Result<(), SyncError> {
        let rel = file.relative_path.as_str();
        let bytes = match std::fs::read(&file.path) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(repo = self.repo_path, path = rel, error = %e, "Unreadable file skipped");
                return Ok(());
            }
        };
        let binary = is_binary(&bytes);

        if self.known.contains_key(rel) {
            if !binary {
                let new_text = String::from_utf8_lossy(&bytes);
                let old_text = match self.shadow.read_text(rel)? {
                    Some(text) => text,
                    None if file.size > self.ctx.config().sync.copy_threshold_bytes => {
                        new_text.to_string()
                    }
                    None => String::new(),
                };
                let patch = unified_patch(&old_text, &new_text);
                if !patch.is_empty() {
                    self.emit(DiffRecord::modified(self.repo_path, self.branch, rel, patch))?;
                    self.report.modified += 1;
                }
            }
            self.shadow.copy([rel])?;
            return Ok(());
        }

        if self.shadow.exists(rel) {
            // The snapshot belongs to a queued rename. Refreshing it now
            // would hide edits made before that rename is resolved.
            self.report.awaiting_flush += 1;
            return Ok(());
        }

        if !binary && let Some(old_path) = self.match_orphan(&bytes, orphans) {
            self.shadow.delete(&old_path)?;
            self.emit(DiffRecord::renamed(self.repo_path, self.branch, &old_path, rel))?;
            renamed_from.insert(old_path);
            self.report.renamed += 1;
            self.shadow.copy([rel])?;
            return Ok(());
        }

        self.originals.copy([rel])?;
        self.ctx
            .state()
            .upsert_file(self.repo_path, self.branch, rel, None)?;
        self.emit(DiffRecord::created(self.repo_path, self.branch, rel).with_binary(binary))?;
        self.known.insert(
            rel.to_string(),
            FileRecord {
                path: rel.to_string(),
                server_file_id: None,
            },
        );
        self.report.created += 1;
        self.shadow.copy([rel])?;
        Ok(())
    }

    /// The single orphan similar enough to `bytes`, removed from the pool.
    fn match_orphan(&self, bytes: &[u8], orphans: &mut Vec<Orphan>) -> Option<String> {
        if bytes.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(bytes);
        let threshold = self.ctx.config().sync.rename_similarity;
        let mut matches = orphans
            .iter()
            .enumerate()
            .filter(|(_, orphan)| similarity(&orphan.content, &text) > threshold)
            .map(|(idx, _)| idx);
        let first = matches.next()?;
        if matches.next().is_some() {
            debug!(repo = self.repo_path, "Ambiguous rename candidates, treating as new file");
            return None;
        }
        Some(orphans.swap_remove(first).path)
    }

    fn classify_deletes(
        &mut self,
        root: &Path,
        ignore: &SyncIgnore,
        live_paths: &HashSet<String>,
        renamed_from: &HashSet<String>,
    ) -> Result<(), SyncError> {
        let gone: BTreeSet<String> = self
            .known
            .keys()
            .filter(|path| {
                !live_paths.contains(*path)
                    && !renamed_from.contains(*path)
                    && !ignore.should_ignore(path, false)
                    && !self.deleted.exists(path)
                    && self.shadow.exists(path)
            })
            .cloned()
            .collect();
        if gone.is_empty() {
            return Ok(());
        }

        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for path in &gone {
            let target = Self::vanished_ancestor(root, path).unwrap_or_else(|| path.clone());
            groups.entry(target).or_default().push(path.clone());
        }

        for (target, files) in groups {
            self.deleted.copy_from(&self.shadow, &files)?;
            self.emit(DiffRecord::deleted(self.repo_path, self.branch, &target))?;
            self.report.deleted += 1;
            if files.len() > 1 || target != files[0] {
                debug!(repo = self.repo_path, dir = %target, files = files.len(), "Directory delete");
            }
        }
        Ok(())
    }

    /// Topmost ancestor directory of `path` that no longer exists.
    fn vanished_ancestor(root: &Path, path: &str) -> Option<String> {
        let parts: Vec<&str> = path.split('/').collect();
        (1..parts.len())
            .map(|depth| parts[..depth].join("/"))
            .find(|dir| !root.join(dir).exists())
    }

    fn emit(&self, record: DiffRecord) -> Result<(), SyncError> {
        self.ctx.buffer().enqueue(&record)?;
        Ok(())
    }
}

/// Classify the current branch of every synced repo.
pub fn classify_all(ctx: &SyncContext) -> Result<Vec<(String, ClassifyReport)>, SyncError> {
    let mut reports = Vec::new();
    for repo in ctx.state().list_repos()? {
        if repo.status != RepoStatus::Synced {
            continue;
        }
        let branch = shadowsync_core::vcs::current_branch(Path::new(&repo.path));
        match classify(ctx, &repo.path, &branch) {
            Ok(report) => reports.push((repo.path, report)),
            Err(e) => warn!(repo = %repo.path, branch, error = %e, "Classification failed"),
        }
    }
    Ok(reports)
}
