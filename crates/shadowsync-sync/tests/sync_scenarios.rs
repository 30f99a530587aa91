//! End-to-end sync scenarios: a real working tree in a temp dir, the real
//! state store and buffer, and an in-memory transport that records every
//! call.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::time::Duration;
use tempfile::{TempDir, tempdir};

use shadowsync_core::config::Config;
use shadowsync_core::constants::LOCK_BUFFER_FLUSH;
use shadowsync_core::error::{StateError, TransportError};
use shadowsync_core::types::{DiffFile, DiffRecord, MigrationState, RepoStatus};
use shadowsync_core::vcs::current_branch;
use shadowsync_state::backend::RepoStateBackend;
use shadowsync_state::migration::SCHEMA_IDENTIFIER;
use shadowsync_state::schema::{self, REPO_TABLE};
use shadowsync_sync::classifier::{ClassifyReport, ClassifySkip, classify};
use shadowsync_sync::context::SyncContext;
use shadowsync_sync::dispatcher::{FlushReport, FlushSkip, flush};
use shadowsync_sync::reupload::{ReuploadOutcome, ReuploadTracker, reupload_all};
use shadowsync_sync::transport::{FileUpload, OutgoingDiff, Transport};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct RecordingTransport {
    reachable: AtomicBool,
    fail_uploads: AtomicBool,
    send_delay_ms: AtomicU64,
    next_id: AtomicI64,
    sent: Mutex<Vec<OutgoingDiff>>,
    uploads: Mutex<Vec<FileUpload>>,
}

impl RecordingTransport {
    fn new() -> Self {
        Self {
            reachable: AtomicBool::new(true),
            fail_uploads: AtomicBool::new(false),
            send_delay_ms: AtomicU64::new(0),
            next_id: AtomicI64::new(100),
            sent: Mutex::new(Vec::new()),
            uploads: Mutex::new(Vec::new()),
        }
    }

    fn sent(&self) -> Vec<OutgoingDiff> {
        self.sent.lock().unwrap().clone()
    }

    fn uploads(&self) -> Vec<FileUpload> {
        self.uploads.lock().unwrap().clone()
    }
}

impl Transport for RecordingTransport {
    fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    fn send(&self, diff: &OutgoingDiff) -> Result<(), TransportError> {
        let delay = self.send_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        self.sent.lock().unwrap().push(diff.clone());
        Ok(())
    }

    fn create_remote_file(&self, upload: &FileUpload) -> Result<i64, TransportError> {
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(TransportError::Rejected {
                status: 503,
                body: "unavailable".into(),
            });
        }
        self.uploads.lock().unwrap().push(upload.clone());
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

struct Harness {
    repo: TempDir,
    data: TempDir,
    transport: Arc<RecordingTransport>,
    ctx: SyncContext,
    branch: String,
}

impl Harness {
    /// A migrated, empty state store and an empty working tree.
    fn new() -> Self {
        let h = Self::unmigrated();
        assert!(h.ctx.migration_manager().run().is_complete());
        h
    }

    /// No migration has run yet, so the legacy files are authoritative.
    fn unmigrated() -> Self {
        let repo = tempdir().unwrap();
        let data = tempdir().unwrap();
        let transport = Arc::new(RecordingTransport::new());
        let ctx = SyncContext::open(Config::with_data_dir(data.path()), transport.clone()).unwrap();
        let branch = current_branch(repo.path());
        Self {
            repo,
            data,
            transport,
            ctx,
            branch,
        }
    }

    /// A second context on the same data dir, as another process would see it.
    fn reopen(&self) -> SyncContext {
        SyncContext::open(Config::with_data_dir(self.data.path()), self.transport.clone()).unwrap()
    }

    fn repo_path(&self) -> String {
        self.repo.path().to_string_lossy().into_owned()
    }

    fn write(&self, rel: &str, content: &str) {
        let path = self.repo.path().join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn write_bytes(&self, rel: &str, content: &[u8]) {
        std::fs::write(self.repo.path().join(rel), content).unwrap();
    }

    fn remove(&self, rel: &str) {
        std::fs::remove_file(self.repo.path().join(rel)).unwrap();
    }

    fn rename(&self, from: &str, to: &str) {
        std::fs::rename(self.repo.path().join(from), self.repo.path().join(to)).unwrap();
    }

    /// Register the repo and upload everything currently in it.
    fn register_synced(&self) {
        self.ctx.register(&self.repo_path(), &self.branch, None).unwrap();
        reupload_all(&self.ctx, &ReuploadTracker::new()).unwrap();
    }

    fn classify(&self) -> ClassifyReport {
        classify(&self.ctx, &self.repo_path(), &self.branch).unwrap()
    }

    fn flush(&self) -> FlushReport {
        flush(&self.ctx).unwrap()
    }

    fn queued(&self) -> Vec<DiffRecord> {
        self.ctx
            .buffer()
            .drain(usize::MAX)
            .unwrap()
            .into_iter()
            .map(|e| e.parsed.unwrap().validate(usize::MAX).unwrap())
            .collect()
    }

    fn file_id(&self, rel: &str) -> Option<i64> {
        self.ctx
            .state()
            .file_record(&self.repo_path(), &self.branch, rel)
            .unwrap()
            .and_then(|f| f.server_file_id)
    }
}

const TEXT: &str = "alpha line\nbeta line\ngamma line\ndelta line\n";

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

#[test]
fn unchanged_tree_classifies_to_nothing() {
    let h = Harness::new();
    h.write("a.txt", TEXT);
    h.write("src/lib.rs", "pub fn f() {}\n");
    h.register_synced();

    assert_eq!(h.classify().records(), 0);
    assert_eq!(h.classify().records(), 0);
    assert!(h.ctx.buffer().is_empty().unwrap());
}

#[test]
fn edit_is_classified_once() {
    let h = Harness::new();
    h.write("a.txt", TEXT);
    h.register_synced();

    h.write("a.txt", "alpha line\nBETA line\ngamma line\ndelta line\n");
    let report = h.classify();
    assert_eq!(report.modified, 1);
    assert_eq!(h.classify().records(), 0);

    let queued = h.queued();
    assert_eq!(queued.len(), 1);
    assert!(queued[0].patch.contains("-beta line"));
    assert!(queued[0].patch.contains("+BETA line"));
}

#[test]
fn single_similar_orphan_is_a_rename() {
    let h = Harness::new();
    h.write("a.txt", TEXT);
    h.register_synced();

    h.rename("a.txt", "b.txt");
    let report = h.classify();
    assert_eq!(report.renamed, 1);
    assert_eq!(report.created, 0);
    assert_eq!(report.deleted, 0);
}

#[test]
fn two_similar_orphans_make_a_new_file() {
    let h = Harness::new();
    h.write("a.txt", TEXT);
    h.write("c.txt", "alpha line\nbeta line\ngamma line\ndelta line!\n");
    h.register_synced();

    h.remove("a.txt");
    h.remove("c.txt");
    h.write("b.txt", TEXT);
    let report = h.classify();
    assert_eq!(report.renamed, 0);
    assert_eq!(report.created, 1);
    assert_eq!(report.deleted, 2);
}

#[test]
fn identical_new_files_are_both_new() {
    let h = Harness::new();
    h.write("README.md", "# project\n");
    h.register_synced();

    h.write("one.txt", TEXT);
    h.write("two.txt", TEXT);
    let report = h.classify();
    assert_eq!(report.created, 2);
    assert_eq!(report.renamed, 0);

    let flushed = h.flush();
    assert_eq!(flushed.uploaded, 2);
    assert!(h.file_id("one.txt").is_some());
    assert!(h.file_id("two.txt").is_some());
    assert_ne!(h.file_id("one.txt"), h.file_id("two.txt"));
}

#[test]
fn ignored_paths_never_produce_records() {
    let h = Harness::new();
    h.write(".gitignore", "*.log\n");
    h.register_synced();

    h.write("debug.log", "noise\n");
    h.write(".git/HEAD", "ref: refs/heads/main\n");
    assert_eq!(h.classify().records(), 0);
}

#[test]
fn unregistered_repo_is_skipped() {
    let h = Harness::new();
    h.write("a.txt", TEXT);
    let report = h.classify();
    assert_eq!(report.skipped, Some(ClassifySkip::RepoNotSynced));
}

#[test]
fn disconnected_repo_is_skipped() {
    let h = Harness::new();
    h.write("a.txt", TEXT);
    h.register_synced();
    assert!(h.ctx.disconnect(&h.repo_path()).unwrap());

    h.write("a.txt", "changed\n");
    assert_eq!(h.classify().skipped, Some(ClassifySkip::RepoNotSynced));
}

#[test]
fn busy_classify_lock_skips_the_pass() {
    let h = Harness::new();
    h.write("a.txt", TEXT);
    h.register_synced();

    let category = h.ctx.classify_lock_category(&h.repo_path(), &h.branch);
    assert!(
        h.ctx
            .locks()
            .acquire(&category, "other-process", Duration::from_secs(60))
            .unwrap()
    );
    h.write("a.txt", "changed\n");
    assert_eq!(h.classify().skipped, Some(ClassifySkip::LockBusy));
}

#[test]
fn non_utf8_text_is_carried_as_binary() {
    let h = Harness::new();
    h.write("README.md", "# project\n");
    h.register_synced();

    h.write_bytes("latin1.txt", b"caf\xe9\n");
    assert_eq!(h.classify().created, 1);
    assert!(h.queued()[0].is_binary);

    assert_eq!(h.flush().uploaded, 1);
    let upload = h.transport.uploads().pop().unwrap();
    assert_eq!(upload.file_relative_path, "latin1.txt");
    assert!(upload.is_binary);
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

#[test]
fn rename_then_edit_sends_diff_from_old_content() {
    let h = Harness::new();
    h.write("a.txt", TEXT);
    h.register_synced();
    let id = h.file_id("a.txt").unwrap();

    h.rename("a.txt", "b.txt");
    assert_eq!(h.classify().renamed, 1);

    h.write("b.txt", "alpha line\nBETA line\ngamma line\ndelta line\n");
    let waiting = h.classify();
    assert_eq!(waiting.records(), 0);
    assert_eq!(waiting.awaiting_flush, 1);

    let first = h.flush();
    assert_eq!(first.renames, 1);
    assert_eq!(h.file_id("b.txt"), Some(id));
    assert_eq!(h.file_id("a.txt"), None);

    assert_eq!(h.classify().modified, 1);
    let second = h.flush();
    assert_eq!(second.sent, 1);

    let sent = h.transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].file_relative_path, "b.txt");
    assert_eq!(sent[0].file_id, id);
    assert!(sent[0].diff.contains("-beta line"));
    assert!(sent[0].diff.contains("+BETA line"));
    assert!(sent[0].diff.contains(" alpha line"));
}

#[test]
fn created_record_with_remote_id_is_not_uploaded_again() {
    let h = Harness::new();
    h.write("README.md", "# project\n");
    h.register_synced();
    let baseline = h.transport.uploads().len();

    h.write("new.txt", TEXT);
    assert_eq!(h.classify().created, 1);
    assert_eq!(h.flush().uploaded, 1);
    let id = h.file_id("new.txt").unwrap();

    // A record that survived a restart after its upload succeeded.
    h.ctx
        .buffer()
        .enqueue(&DiffRecord::created(&h.repo_path(), &h.branch, "new.txt"))
        .unwrap();
    let report = h.flush();
    assert_eq!(report.already_synced, 1);
    assert_eq!(report.uploaded, 0);
    assert_eq!(h.transport.uploads().len(), baseline + 1);
    assert_eq!(h.file_id("new.txt"), Some(id));
    assert!(h.ctx.buffer().is_empty().unwrap());
}

#[test]
fn held_flush_lock_leaves_the_buffer_alone() {
    let h = Harness::new();
    h.write("a.txt", TEXT);
    h.register_synced();
    h.write("a.txt", "changed\n");
    assert_eq!(h.classify().modified, 1);

    assert!(
        h.ctx
            .locks()
            .acquire(LOCK_BUFFER_FLUSH, "other-process", Duration::from_secs(60))
            .unwrap()
    );
    assert_eq!(h.flush().skipped, Some(FlushSkip::LockBusy));
    assert_eq!(h.ctx.buffer().len().unwrap(), 1);
    assert!(h.transport.sent().is_empty());

    assert!(h.ctx.locks().release(LOCK_BUFFER_FLUSH, "*").unwrap());
    assert_eq!(h.flush().sent, 1);
    assert!(h.ctx.buffer().is_empty().unwrap());
}

#[test]
fn unreachable_transport_is_a_no_op() {
    let h = Harness::new();
    h.write("a.txt", TEXT);
    h.register_synced();
    h.write("a.txt", "changed\n");
    h.classify();

    h.transport.reachable.store(false, Ordering::SeqCst);
    assert_eq!(h.flush().skipped, Some(FlushSkip::Unreachable));
    assert_eq!(h.ctx.buffer().len().unwrap(), 1);
}

#[test]
fn vanished_directory_is_one_record_and_one_delete_per_file() {
    let h = Harness::new();
    h.write("keep.txt", "kept\n");
    h.write("docs/one.md", "first\n");
    h.write("docs/nested/two.md", "second\n");
    h.register_synced();

    std::fs::remove_dir_all(h.repo.path().join("docs")).unwrap();
    let report = h.classify();
    assert_eq!(report.deleted, 1);
    let queued = h.queued();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].path, "docs");

    assert_eq!(h.flush().sent, 1);
    let mut deleted: Vec<String> = h
        .transport
        .sent()
        .into_iter()
        .inspect(|d| assert!(d.is_deleted))
        .map(|d| d.file_relative_path)
        .collect();
    deleted.sort();
    assert_eq!(deleted, vec!["docs/nested/two.md", "docs/one.md"]);

    let remaining = h
        .ctx
        .state()
        .branch_files(&h.repo_path(), &h.branch)
        .unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(h.classify().records(), 0);
}

#[test]
fn deleted_file_carries_reverse_patch() {
    let h = Harness::new();
    h.write("a.txt", TEXT);
    h.register_synced();

    h.remove("a.txt");
    assert_eq!(h.classify().deleted, 1);
    // Already queued: a second pass must not queue it again.
    assert_eq!(h.classify().deleted, 0);

    assert_eq!(h.flush().sent, 1);
    let sent = h.transport.sent();
    assert!(sent[0].is_deleted);
    assert!(sent[0].diff.contains("-alpha line"));
    assert_eq!(h.file_id("a.txt"), None);
}

#[test]
fn change_to_pending_file_forces_upload_then_sends() {
    let h = Harness::new();
    h.write("a.txt", TEXT);
    h.ctx.register(&h.repo_path(), &h.branch, None).unwrap();
    assert_eq!(h.file_id("a.txt"), None);

    h.write("a.txt", "changed\n");
    assert_eq!(h.classify().modified, 1);

    let first = h.flush();
    assert_eq!(first.uploaded, 1);
    assert_eq!(first.deferred, 1);
    assert!(h.file_id("a.txt").is_some());

    let second = h.flush();
    assert_eq!(second.sent, 1);
    assert!(h.ctx.buffer().is_empty().unwrap());
}

#[test]
fn invalid_and_orphan_records_are_handled() {
    let h = Harness::new();
    h.ctx.buffer().enqueue_file(&DiffFile::default()).unwrap();
    h.ctx
        .buffer()
        .enqueue(&DiffRecord::modified("/not/registered", "main", "a.txt", "@@".into()))
        .unwrap();

    let report = h.flush();
    assert_eq!(report.discarded, 1);
    assert_eq!(report.deferred, 1);
    assert_eq!(h.ctx.buffer().len().unwrap(), 1);
}

#[test]
fn records_for_disconnected_repo_are_discarded() {
    let h = Harness::new();
    h.write("a.txt", TEXT);
    h.register_synced();
    h.write("a.txt", "changed\n");
    h.classify();

    h.ctx.disconnect(&h.repo_path()).unwrap();
    let repo = h.ctx.state().find_repo(&h.repo_path()).unwrap().unwrap();
    assert_eq!(repo.status, RepoStatus::Disconnected);

    assert_eq!(h.flush().discarded, 1);
    assert!(h.transport.sent().is_empty());
}

#[test]
fn rename_of_file_created_in_same_batch_is_deferred() {
    let h = Harness::new();
    h.write("README.md", "# project\n");
    h.register_synced();

    h.write("draft.txt", TEXT);
    assert_eq!(h.classify().created, 1);
    h.rename("draft.txt", "final.txt");
    assert_eq!(h.classify().renamed, 1);

    let first = h.flush();
    assert_eq!(first.uploaded, 1);
    assert_eq!(first.deferred, 1);

    let second = h.flush();
    assert_eq!(second.renames, 1);
    assert!(h.file_id("final.txt").is_some());
    assert_eq!(h.file_id("draft.txt"), None);
}

#[test]
fn directory_rename_onto_tracked_paths_resolves() {
    let h = Harness::new();
    h.write("src/a.txt", "from src\n");
    h.write("lib/a.txt", "from lib\n");
    h.write("z.txt", TEXT);
    h.register_synced();
    let src_id = h.file_id("src/a.txt").unwrap();

    h.ctx
        .buffer()
        .enqueue(&DiffRecord::directory_renamed(&h.repo_path(), &h.branch, "src", "lib"))
        .unwrap();
    h.write("z.txt", "alpha line\nBETA line\ngamma line\ndelta line\n");
    assert_eq!(h.classify().modified, 1);

    let report = h.flush();
    assert_eq!(report.renames, 1);
    assert_eq!(report.sent, 1);
    assert_eq!(report.deferred, 0);
    assert_eq!(h.file_id("lib/a.txt"), Some(src_id));
    assert_eq!(h.file_id("src/a.txt"), None);
    assert!(h.ctx.buffer().is_empty().unwrap());
}

#[test]
fn record_that_cannot_apply_is_discarded_and_the_repo_keeps_flushing() {
    let h = Harness::new();
    h.write("a.txt", TEXT);
    h.register_synced();

    h.ctx
        .buffer()
        .enqueue(&DiffRecord::deleted(&h.repo_path(), &h.branch, "../escape.txt"))
        .unwrap();
    h.write("a.txt", "alpha line\nBETA line\ngamma line\ndelta line\n");
    assert_eq!(h.classify().modified, 1);

    let report = h.flush();
    assert_eq!(report.discarded, 1);
    assert_eq!(report.sent, 1);
    assert_eq!(report.deferred, 0);
    assert!(h.ctx.buffer().is_empty().unwrap());
}

#[test]
fn racing_flushes_from_two_processes_drain_once() {
    let h = Harness::new();
    for rel in ["a.txt", "b.txt", "c.txt"] {
        h.write(rel, TEXT);
    }
    h.register_synced();
    for rel in ["a.txt", "b.txt", "c.txt"] {
        h.write(rel, "changed\n");
    }
    assert_eq!(h.classify().modified, 3);
    h.transport.send_delay_ms.store(20, Ordering::SeqCst);

    let other = h.reopen();
    assert_ne!(other.owner(), h.ctx.owner());
    let barrier = Barrier::new(2);
    let reports: Vec<FlushReport> = std::thread::scope(|scope| {
        let handles: Vec<_> = [&h.ctx, &other]
            .into_iter()
            .map(|ctx| {
                let barrier = &barrier;
                scope.spawn(move || {
                    barrier.wait();
                    flush(ctx).unwrap()
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect()
    });

    let draining: Vec<&FlushReport> = reports.iter().filter(|r| r.drained > 0).collect();
    assert_eq!(draining.len(), 1);
    assert_eq!(draining[0].sent, 3);
    assert_eq!(h.transport.sent().len(), 3);
    assert!(h.ctx.buffer().is_empty().unwrap());
}

// ---------------------------------------------------------------------------
// Bulk re-upload
// ---------------------------------------------------------------------------

#[test]
fn reupload_gives_up_after_repeated_failures() {
    let h = Harness::new();
    h.write("a.txt", TEXT);
    h.ctx.register(&h.repo_path(), &h.branch, None).unwrap();
    h.transport.fail_uploads.store(true, Ordering::SeqCst);

    let tracker = ReuploadTracker::new();
    let outcome = |t: &ReuploadTracker| reupload_all(&h.ctx, t).unwrap().remove(0).1;
    assert!(matches!(outcome(&tracker), ReuploadOutcome::Failed { failures: 1, .. }));
    assert!(matches!(outcome(&tracker), ReuploadOutcome::Failed { failures: 2, .. }));
    assert_eq!(outcome(&tracker), ReuploadOutcome::GaveUp);

    h.transport.fail_uploads.store(false, Ordering::SeqCst);
    assert_eq!(outcome(&tracker), ReuploadOutcome::GaveUp);
    assert_eq!(h.file_id("a.txt"), None);

    // A fresh process starts over.
    assert_eq!(
        outcome(&ReuploadTracker::new()),
        ReuploadOutcome::Uploaded { uploaded: 1 }
    );
}

#[test]
fn reupload_leaves_files_with_queued_created_records() {
    let h = Harness::new();
    h.write("README.md", "# project\n");
    h.register_synced();
    h.write("new.txt", TEXT);
    h.classify();

    let outcomes = reupload_all(&h.ctx, &ReuploadTracker::new()).unwrap();
    assert_eq!(outcomes[0].1, ReuploadOutcome::Idle);
    assert_eq!(h.file_id("new.txt"), None);
}

#[test]
fn reupload_waits_for_the_flush_lock() {
    let h = Harness::new();
    h.write("a.txt", TEXT);
    h.ctx.register(&h.repo_path(), &h.branch, None).unwrap();
    assert!(
        h.ctx
            .locks()
            .acquire(LOCK_BUFFER_FLUSH, "other-process", Duration::from_secs(60))
            .unwrap()
    );

    let tracker = ReuploadTracker::new();
    assert_eq!(reupload_all(&h.ctx, &tracker).unwrap()[0].1, ReuploadOutcome::Busy);
    assert!(h.transport.uploads().is_empty());
    assert_eq!(tracker.failures(&h.repo_path(), &h.branch), 0);

    assert!(h.ctx.locks().release(LOCK_BUFFER_FLUSH, "*").unwrap());
    assert_eq!(
        reupload_all(&h.ctx, &tracker).unwrap()[0].1,
        ReuploadOutcome::Uploaded { uploaded: 1 }
    );
}

// ---------------------------------------------------------------------------
// Migration
// ---------------------------------------------------------------------------

#[test]
fn interrupted_repo_migration_keeps_syncing_after_restart() {
    let h = Harness::unmigrated();
    h.write("a.txt", TEXT);
    h.register_synced();
    let id = h.file_id("a.txt").unwrap();
    h.ctx
        .state()
        .sqlite()
        .with_conn(|conn| {
            schema::record_migration_state(conn, REPO_TABLE, SCHEMA_IDENTIFIER, MigrationState::InProgress)
        })
        .unwrap();

    let restarted = h.reopen();
    let report = restarted.migration_manager().run();
    let repo_step = report.steps.iter().find(|s| s.table == REPO_TABLE).unwrap();
    assert_eq!(repo_step.after, MigrationState::InProgress);
    assert!(!restarted.repos_migrating());
    assert_eq!(restarted.state().name(), "legacy");

    h.write("a.txt", "alpha line\nBETA line\ngamma line\ndelta line\n");
    let classified = classify(&restarted, &h.repo_path(), &h.branch).unwrap();
    assert_eq!(classified.skipped, None);
    assert_eq!(classified.modified, 1);

    let flushed = flush(&restarted).unwrap();
    assert_eq!(flushed.sent, 1);
    assert_eq!(flushed.deferred, 0);
    assert_eq!(h.transport.sent()[0].file_id, id);
}

#[test]
fn failed_repo_migration_leaves_sync_on_the_legacy_store() {
    let h = Harness::unmigrated();
    h.write("a.txt", TEXT);
    h.register_synced();
    let id = h.file_id("a.txt").unwrap();
    // A table of the same name with the wrong shape makes the import fail.
    h.ctx
        .state()
        .sqlite()
        .with_conn(|conn| {
            conn.execute_batch("CREATE TABLE repo (bogus TEXT)")
                .map_err(StateError::sqlite)
        })
        .unwrap();

    let report = h.ctx.migration_manager().run();
    let repo_step = report.steps.iter().find(|s| s.table == REPO_TABLE).unwrap();
    assert_eq!(repo_step.after, MigrationState::Error);
    assert!(!h.ctx.repos_migrating());
    assert_eq!(h.ctx.state().name(), "legacy");

    h.write("a.txt", "alpha line\nBETA line\ngamma line\ndelta line\n");
    assert_eq!(h.classify().modified, 1);
    let flushed = h.flush();
    assert_eq!(flushed.sent, 1);
    assert_eq!(h.transport.sent()[0].file_id, id);
}
