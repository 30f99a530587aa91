use ignore::WalkBuilder;
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use shadowsync_core::constants::{BINARY_SNIFF_BYTES, GIT_IGNORE_FILE, SYNC_IGNORE_FILE};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

const VCS_DIR: &str = ".git";

/// A live file found in a repository.
#[derive(Debug, Clone)]
pub struct ScannedFile {
    pub path: PathBuf,
    pub relative_path: String,
    pub size: u64,
}

/// Ignore rules for one repository: `.syncignore` when present, otherwise
/// `.gitignore`. The `.git/` directory is always ignored.
#[derive(Debug, Clone)]
pub struct SyncIgnore {
    matcher: Arc<Gitignore>,
    source: Option<PathBuf>,
}

impl SyncIgnore {
    pub fn load(repo_root: &Path) -> Self {
        let source = [SYNC_IGNORE_FILE, GIT_IGNORE_FILE]
            .iter()
            .map(|name| repo_root.join(name))
            .find(|path| path.is_file());

        let mut builder = GitignoreBuilder::new(repo_root);
        if let Some(path) = &source
            && let Some(err) = builder.add(path)
        {
            warn!(path = %path.display(), error = %err, "Ignore file partially parsed");
        }
        let matcher = builder.build().unwrap_or_else(|err| {
            warn!(repo = %repo_root.display(), error = %err, "Ignore rules unusable, syncing everything");
            Gitignore::empty()
        });

        Self {
            matcher: Arc::new(matcher),
            source,
        }
    }

    /// Rule file in effect, if any.
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// `rel_path` is repo-relative and `/`-separated.
    pub fn should_ignore(&self, rel_path: &str, is_dir: bool) -> bool {
        if is_vcs_internal(rel_path) {
            return true;
        }
        self.matcher
            .matched_path_or_any_parents(rel_path, is_dir)
            .is_ignore()
    }
}

fn is_vcs_internal(rel_path: &str) -> bool {
    rel_path.split('/').next() == Some(VCS_DIR)
}

/// Every non-ignored regular file under `repo_root`, sorted by relative path.
pub fn scan_repo(repo_root: &Path, ignore: &SyncIgnore) -> Vec<ScannedFile> {
    let root = repo_root.to_path_buf();
    let filter_root = root.clone();
    let filter_ignore = ignore.clone();

    let mut walker = WalkBuilder::new(&root);
    walker
        .standard_filters(false)
        .hidden(false)
        .follow_links(false)
        .filter_entry(move |entry| {
            let Some(rel) = relative_path(&filter_root, entry.path()) else {
                return true;
            };
            let is_dir = entry.file_type().is_some_and(|ft| ft.is_dir());
            !filter_ignore.should_ignore(&rel, is_dir)
        });

    let mut files = Vec::new();
    for entry in walker.build() {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("Walk error: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_some_and(|ft| ft.is_file()) {
            continue;
        }
        let Some(relative_path) = relative_path(&root, entry.path()) else {
            continue;
        };
        let size = entry.metadata().map(|m| m.len()).unwrap_or_default();
        files.push(ScannedFile {
            path: entry.path().to_path_buf(),
            relative_path,
            size,
        });
    }

    files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    debug!(repo = %repo_root.display(), files = files.len(), "Repository scanned");
    files
}

/// Repo-relative, `/`-separated path; `None` for the root itself.
pub fn relative_path(repo_root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(repo_root).ok()?;
    let joined = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    (!joined.is_empty()).then_some(joined)
}

/// Content is binary when a NUL byte appears near the start or it is not
/// valid UTF-8. Text patches are built from `str`, so anything else could
/// not be reproduced byte for byte.
pub fn is_binary(bytes: &[u8]) -> bool {
    bytes.iter().take(BINARY_SNIFF_BYTES).any(|b| *b == 0)
        || std::str::from_utf8(bytes).is_err()
}
