use ignore::WalkBuilder;
use shadowsync_core::constants::{DELETED_DIR, ORIGINALS_DIR, SHADOW_DIR};
use shadowsync_core::error::MirrorError;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Which snapshot tree a [`MirrorStore`] manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorKind {
    /// Last content the classifier diffed against.
    Shadow,
    /// Content of newly created files awaiting upload.
    Originals,
    /// Shadow copies of files whose delete has been queued.
    Deleted,
}

impl MirrorKind {
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Shadow => SHADOW_DIR,
            Self::Originals => ORIGINALS_DIR,
            Self::Deleted => DELETED_DIR,
        }
    }
}

/// Snapshot tree rooted at `{data_dir}/{kind}/{repo}/{branch}`.
///
/// No internal locking: callers serialize access with the advisory lock.
#[derive(Debug, Clone)]
pub struct MirrorStore {
    kind: MirrorKind,
    repo_path: PathBuf,
    root: PathBuf,
}

impl MirrorStore {
    pub fn new(data_dir: &Path, kind: MirrorKind, repo_path: &str, branch: &str) -> Self {
        let root = data_dir
            .join(kind.dir_name())
            .join(strip_drive_prefix(repo_path))
            .join(branch);
        Self {
            kind,
            repo_path: PathBuf::from(repo_path),
            root,
        }
    }

    pub fn kind(&self) -> MirrorKind {
        self.kind
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Mirror location of a repo-relative path. Rejects paths that would
    /// escape the mirror root.
    pub fn file_path(&self, rel_path: &str) -> Result<PathBuf, MirrorError> {
        Ok(self.root.join(checked_relative(rel_path)?))
    }

    /// Copy live files from the repository into the mirror, overwriting.
    pub fn copy<I, S>(&self, rel_paths: I) -> Result<(), MirrorError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for rel_path in rel_paths {
            let rel_path = rel_path.as_ref();
            let source = self.repo_path.join(checked_relative(rel_path)?);
            self.copy_one(&source, rel_path)?;
        }
        Ok(())
    }

    /// Copy entries of another mirror into this one, overwriting. Missing
    /// source entries are skipped.
    pub fn copy_from<I, S>(&self, source: &MirrorStore, rel_paths: I) -> Result<(), MirrorError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for rel_path in rel_paths {
            let rel_path = rel_path.as_ref();
            let from = source.file_path(rel_path)?;
            if from.is_file() {
                self.copy_one(&from, rel_path)?;
            }
        }
        Ok(())
    }

    fn copy_one(&self, source: &Path, rel_path: &str) -> Result<(), MirrorError> {
        let target = self.file_path(rel_path)?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| MirrorError::io(parent, e))?;
        }
        std::fs::copy(source, &target).map_err(|e| MirrorError::io(source, e))?;
        Ok(())
    }

    pub fn exists(&self, rel_path: &str) -> bool {
        self.file_path(rel_path).is_ok_and(|p| p.is_file())
    }

    /// Raw bytes of a mirror entry, `None` if absent.
    pub fn read(&self, rel_path: &str) -> Result<Option<Vec<u8>>, MirrorError> {
        let path = self.file_path(rel_path)?;
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(MirrorError::io(&path, e)),
        }
    }

    /// Entry content decoded as UTF-8 (lossy), `None` if absent.
    pub fn read_text(&self, rel_path: &str) -> Result<Option<String>, MirrorError> {
        Ok(self
            .read(rel_path)?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    /// Remove one entry and any directories it leaves empty. Idempotent.
    pub fn delete(&self, rel_path: &str) -> Result<bool, MirrorError> {
        let path = self.file_path(rel_path)?;
        match std::fs::remove_file(&path) {
            Ok(()) => {
                self.prune_empty_parents(&path);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(MirrorError::io(&path, e)),
        }
    }

    /// Move one entry. Returns `false` when the source is absent.
    pub fn rename(&self, old_rel: &str, new_rel: &str) -> Result<bool, MirrorError> {
        let from = self.file_path(old_rel)?;
        if !from.is_file() {
            return Ok(false);
        }
        let to = self.file_path(new_rel)?;
        if let Some(parent) = to.parent() {
            std::fs::create_dir_all(parent).map_err(|e| MirrorError::io(parent, e))?;
        }
        std::fs::rename(&from, &to).map_err(|e| MirrorError::io(&from, e))?;
        self.prune_empty_parents(&from);
        debug!(kind = ?self.kind, old_rel, new_rel, "Mirror entry renamed");
        Ok(true)
    }

    /// Move a whole directory. Entries already at the target are replaced.
    pub fn rename_dir(&self, old_rel: &str, new_rel: &str) -> Result<usize, MirrorError> {
        let old_prefix = old_rel.trim_end_matches('/');
        let new_prefix = new_rel.trim_end_matches('/');
        let mut moved = 0;
        for rel in self.list()? {
            let Some(rest) = rel.strip_prefix(old_prefix) else {
                continue;
            };
            if !rest.starts_with('/') {
                continue;
            }
            if self.rename(&rel, &format!("{new_prefix}{rest}"))? {
                moved += 1;
            }
        }
        Ok(moved)
    }

    /// Repo-relative, `/`-separated form of a path inside this mirror.
    pub fn relative_path(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<String> = rel
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect();
        (!parts.is_empty()).then(|| parts.join("/"))
    }

    /// Every entry in the mirror, sorted.
    pub fn list(&self) -> Result<Vec<String>, MirrorError> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        let walker = WalkBuilder::new(&self.root)
            .standard_filters(false)
            .hidden(false)
            .follow_links(false)
            .build();
        for entry in walker {
            let entry = entry.map_err(|e| {
                MirrorError::io(&self.root, std::io::Error::other(e.to_string()))
            })?;
            if !entry.file_type().is_some_and(|ft| ft.is_file()) {
                continue;
            }
            if let Some(rel) = self.relative_path(entry.path()) {
                entries.push(rel);
            }
        }
        entries.sort();
        Ok(entries)
    }

    /// Drop the whole mirror for this repo/branch.
    pub fn delete_all(&self) -> Result<(), MirrorError> {
        match std::fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(MirrorError::io(&self.root, e)),
        }
    }

    fn prune_empty_parents(&self, path: &Path) {
        let mut current = path.parent();
        while let Some(dir) = current {
            if dir == self.root || !dir.starts_with(&self.root) {
                break;
            }
            if std::fs::remove_dir(dir).is_err() {
                break;
            }
            current = dir.parent();
        }
    }
}

/// Strip a Windows drive prefix (`C:`) and leading separators so the repo
/// path can be nested under a mirror root.
pub fn strip_drive_prefix(repo_path: &str) -> String {
    let bytes = repo_path.as_bytes();
    let without_drive = if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic()
    {
        &repo_path[2..]
    } else {
        repo_path
    };
    without_drive
        .trim_start_matches(['/', '\\'])
        .replace('\\', "/")
}

fn checked_relative(rel_path: &str) -> Result<PathBuf, MirrorError> {
    let candidate = Path::new(rel_path);
    let mut clean = PathBuf::new();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(MirrorError::OutsideRepo {
                    path: rel_path.to_string(),
                });
            }
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(MirrorError::OutsideRepo {
            path: rel_path.to_string(),
        });
    }
    Ok(clean)
}
