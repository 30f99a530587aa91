use shadowsync_core::constants::DIFFS_DIR;
use shadowsync_core::error::BufferError;
use shadowsync_core::ids::next_record_seq;
use shadowsync_core::time::now_millis;
use shadowsync_core::types::{DiffFile, DiffRecord};
use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

const RECORD_EXTENSION: &str = "yml";

/// One queued record file. `parsed` holds the decode error for files that
/// could not be read back, so the dispatcher can discard them.
#[derive(Debug)]
pub struct BufferEntry {
    pub path: PathBuf,
    pub parsed: Result<DiffFile, String>,
}

impl BufferEntry {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Durable FIFO of diff records, one YAML file per record.
///
/// File names start with a zero-padded millisecond timestamp, so sorting by
/// name gives approximate enqueue order.
#[derive(Debug, Clone)]
pub struct DiffBuffer {
    dir: PathBuf,
}

impl DiffBuffer {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            dir: data_dir.join(DIFFS_DIR),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write a record. The file appears under its final name only once fully
    /// written.
    pub fn enqueue(&self, record: &DiffRecord) -> Result<PathBuf, BufferError> {
        self.enqueue_file(&record.to_file())
    }

    pub fn enqueue_file(&self, file: &DiffFile) -> Result<PathBuf, BufferError> {
        let yaml = serde_yaml::to_string(file).map_err(BufferError::encode)?;
        std::fs::create_dir_all(&self.dir).map_err(BufferError::Io)?;

        let name = format!(
            "{:013}-{}-{:06}.{RECORD_EXTENSION}",
            now_millis(),
            std::process::id(),
            next_record_seq()
        );
        let target = self.dir.join(name);

        let mut tmp = tempfile::Builder::new()
            .prefix(".pending-")
            .suffix(".tmp")
            .tempfile_in(&self.dir)
            .map_err(BufferError::Io)?;
        tmp.write_all(yaml.as_bytes()).map_err(BufferError::Io)?;
        tmp.as_file().sync_data().map_err(BufferError::Io)?;
        tmp.persist(&target).map_err(|e| BufferError::Persist {
            path: target.display().to_string(),
            reason: e.to_string(),
        })?;

        debug!(path = %target.display(), "Diff record queued");
        Ok(target)
    }

    fn record_paths(&self) -> Result<Vec<PathBuf>, BufferError> {
        let read_dir = match std::fs::read_dir(&self.dir) {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(BufferError::Io(e)),
        };
        let mut paths = Vec::new();
        for entry in read_dir {
            let path = entry.map_err(BufferError::Io)?.path();
            if path.is_file()
                && path.extension().is_some_and(|ext| ext == RECORD_EXTENSION)
            {
                paths.push(path);
            }
        }
        paths.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
        Ok(paths)
    }

    /// Up to `max` oldest records, left in place.
    pub fn drain(&self, max: usize) -> Result<Vec<BufferEntry>, BufferError> {
        Ok(self
            .record_paths()?
            .into_iter()
            .take(max)
            .map(read_entry)
            .collect())
    }

    /// Delete a processed record. Removing an already-removed record is fine.
    pub fn remove(&self, entry: &BufferEntry) -> Result<(), BufferError> {
        match std::fs::remove_file(&entry.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BufferError::Io(e)),
        }
    }

    pub fn len(&self) -> Result<usize, BufferError> {
        Ok(self.record_paths()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, BufferError> {
        Ok(self.len()? == 0)
    }

    /// Paths with a queued created-record for this repo/branch.
    pub fn queued_new_files(
        &self,
        repo_path: &str,
        branch: &str,
    ) -> Result<BTreeSet<String>, BufferError> {
        let mut paths = BTreeSet::new();
        for path in self.record_paths()? {
            let Ok(file) = read_entry(path).parsed else {
                continue;
            };
            if !file.is_new_file
                || file.repo_path.as_deref() != Some(repo_path)
                || file.branch.as_deref() != Some(branch)
            {
                continue;
            }
            if let Some(rel) = file.file_relative_path {
                paths.insert(rel);
            }
        }
        Ok(paths)
    }
}

fn read_entry(path: PathBuf) -> BufferEntry {
    let parsed = std::fs::read_to_string(&path)
        .map_err(|e| e.to_string())
        .and_then(|raw| serde_yaml::from_str::<DiffFile>(&raw).map_err(|e| e.to_string()));
    BufferEntry { path, parsed }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shadowsync_core::types::DiffRecord;
    use tempfile::tempdir;

    #[test]
    fn enqueue_then_drain_in_order() {
        let dir = tempdir().unwrap();
        let buffer = DiffBuffer::new(dir.path());
        buffer
            .enqueue(&DiffRecord::created("/w/app", "main", "a.txt"))
            .unwrap();
        buffer
            .enqueue(&DiffRecord::modified("/w/app", "main", "b.txt", "@@".into()))
            .unwrap();

        let entries = buffer.drain(10).unwrap();
        assert_eq!(entries.len(), 2);
        let first = entries[0].parsed.as_ref().unwrap();
        assert_eq!(first.file_relative_path.as_deref(), Some("a.txt"));
        assert!(first.is_new_file);
        assert!(entries[0].file_name() < entries[1].file_name());
    }

    #[test]
    fn drain_is_bounded_and_non_destructive() {
        let dir = tempdir().unwrap();
        let buffer = DiffBuffer::new(dir.path());
        for i in 0..5 {
            buffer
                .enqueue(&DiffRecord::created("/w/app", "main", &format!("f{i}.txt")))
                .unwrap();
        }
        assert_eq!(buffer.drain(3).unwrap().len(), 3);
        assert_eq!(buffer.len().unwrap(), 5);
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = tempdir().unwrap();
        let buffer = DiffBuffer::new(dir.path());
        buffer
            .enqueue(&DiffRecord::deleted("/w/app", "main", "a.txt"))
            .unwrap();
        let entry = buffer.drain(1).unwrap().remove(0);
        buffer.remove(&entry).unwrap();
        buffer.remove(&entry).unwrap();
        assert!(buffer.is_empty().unwrap());
    }

    #[test]
    fn unparseable_file_drains_as_error() {
        let dir = tempdir().unwrap();
        let buffer = DiffBuffer::new(dir.path());
        std::fs::create_dir_all(buffer.dir()).unwrap();
        std::fs::write(buffer.dir().join("0000000000001-1-000000.yml"), "[not: a record").unwrap();
        std::fs::write(buffer.dir().join("ignored.tmp"), "x").unwrap();
        let entries = buffer.drain(10).unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].parsed.is_err());
    }

    #[test]
    fn queued_new_files_filters_by_repo_and_branch() {
        let dir = tempdir().unwrap();
        let buffer = DiffBuffer::new(dir.path());
        buffer
            .enqueue(&DiffRecord::created("/w/app", "main", "a.txt"))
            .unwrap();
        buffer
            .enqueue(&DiffRecord::created("/w/app", "dev", "b.txt"))
            .unwrap();
        buffer
            .enqueue(&DiffRecord::modified("/w/app", "main", "c.txt", String::new()))
            .unwrap();
        let queued = buffer.queued_new_files("/w/app", "main").unwrap();
        assert_eq!(queued.into_iter().collect::<Vec<_>>(), vec!["a.txt".to_string()]);
    }

    #[test]
    fn missing_directory_drains_empty() {
        let dir = tempdir().unwrap();
        let buffer = DiffBuffer::new(&dir.path().join("nope"));
        assert!(buffer.drain(10).unwrap().is_empty());
        assert_eq!(buffer.len().unwrap(), 0);
    }
}
