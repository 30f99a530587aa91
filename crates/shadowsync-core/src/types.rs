use crate::constants;
use crate::error::RecordError;
use crate::time;
use serde::{Deserialize, Serialize};
use std::fmt;

/// On-disk shape of one buffered diff record.
///
/// Every field is optional so that a damaged or foreign record still parses;
/// [`DiffFile::validate`] is the only way to turn it into a [`DiffRecord`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiffFile {
    #[serde(default)]
    pub repo_path: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub file_relative_path: Option<String>,
    #[serde(default)]
    pub diff: Option<String>,
    #[serde(default)]
    pub is_new_file: bool,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default)]
    pub is_rename: bool,
    #[serde(default)]
    pub is_dir_rename: bool,
    #[serde(default)]
    pub is_binary: bool,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub added_at: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RenamePayload {
    old_rel_path: Option<String>,
    new_rel_path: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DirRenamePayload {
    old_path: Option<String>,
    new_path: Option<String>,
}

/// What a diff record says happened to its path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeKind {
    Modified,
    Created,
    Deleted,
    Renamed { old_path: String },
    DirectoryRenamed { old_path: String, new_path: String },
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Modified => "modified",
            Self::Created => "created",
            Self::Deleted => "deleted",
            Self::Renamed { .. } => "renamed",
            Self::DirectoryRenamed { .. } => "directory_renamed",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated diff record.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffRecord {
    pub repo_path: String,
    pub branch: String,
    /// Path relative to the repo root, `/`-separated. For renames this is the new path.
    pub path: String,
    pub kind: ChangeKind,
    /// Unified patch for modifications and deletes; empty for other kinds.
    pub patch: String,
    pub is_binary: bool,
    pub created_at: String,
    pub source: String,
}

impl DiffRecord {
    fn new(repo_path: &str, branch: &str, path: &str, kind: ChangeKind, patch: String) -> Self {
        Self {
            repo_path: repo_path.to_string(),
            branch: branch.to_string(),
            path: path.to_string(),
            kind,
            patch,
            is_binary: false,
            created_at: time::now_iso8601(),
            source: constants::DIFF_SOURCE.to_string(),
        }
    }

    pub fn modified(repo_path: &str, branch: &str, path: &str, patch: String) -> Self {
        Self::new(repo_path, branch, path, ChangeKind::Modified, patch)
    }

    pub fn created(repo_path: &str, branch: &str, path: &str) -> Self {
        Self::new(repo_path, branch, path, ChangeKind::Created, String::new())
    }

    /// Delete patches are computed at dispatch time from the shadow snapshot.
    pub fn deleted(repo_path: &str, branch: &str, path: &str) -> Self {
        Self::new(repo_path, branch, path, ChangeKind::Deleted, String::new())
    }

    pub fn renamed(repo_path: &str, branch: &str, old_path: &str, new_path: &str) -> Self {
        Self::new(
            repo_path,
            branch,
            new_path,
            ChangeKind::Renamed {
                old_path: old_path.to_string(),
            },
            String::new(),
        )
    }

    pub fn directory_renamed(repo_path: &str, branch: &str, old_path: &str, new_path: &str) -> Self {
        Self::new(
            repo_path,
            branch,
            new_path,
            ChangeKind::DirectoryRenamed {
                old_path: old_path.to_string(),
                new_path: new_path.to_string(),
            },
            String::new(),
        )
    }

    pub fn with_binary(mut self, is_binary: bool) -> Self {
        self.is_binary = is_binary;
        self
    }

    pub fn with_created_at(mut self, created_at: impl Into<String>) -> Self {
        self.created_at = created_at.into();
        self
    }

    /// Payload as written to the `diff` field on disk.
    pub fn payload(&self) -> String {
        match &self.kind {
            ChangeKind::Renamed { old_path } => serde_json::to_string(&RenamePayload {
                old_rel_path: Some(old_path.clone()),
                new_rel_path: Some(self.path.clone()),
            })
            .unwrap_or_default(),
            ChangeKind::DirectoryRenamed { old_path, new_path } => {
                serde_json::to_string(&DirRenamePayload {
                    old_path: Some(old_path.clone()),
                    new_path: Some(new_path.clone()),
                })
                .unwrap_or_default()
            }
            _ => self.patch.clone(),
        }
    }

    pub fn to_file(&self) -> DiffFile {
        DiffFile {
            repo_path: Some(self.repo_path.clone()),
            branch: Some(self.branch.clone()),
            file_relative_path: Some(self.path.clone()),
            diff: Some(self.payload()),
            is_new_file: self.kind == ChangeKind::Created,
            is_deleted: self.kind == ChangeKind::Deleted,
            is_rename: matches!(self.kind, ChangeKind::Renamed { .. }),
            is_dir_rename: matches!(self.kind, ChangeKind::DirectoryRenamed { .. }),
            is_binary: self.is_binary,
            created_at: Some(self.created_at.clone()),
            source: Some(self.source.clone()),
            added_at: Some(time::now_iso8601()),
        }
    }
}

impl DiffFile {
    /// Check the record invariants and build the typed record.
    pub fn validate(&self, max_diff_bytes: usize) -> Result<DiffRecord, RecordError> {
        let repo_path = required(&self.repo_path, "repo_path")?;
        let branch = required(&self.branch, "branch")?;
        let path = required(&self.file_relative_path, "file_relative_path")?;
        let created_at = required(&self.created_at, "created_at")?;
        if time::parse_utc(created_at).is_none() {
            return Err(RecordError::BadTimestamp(created_at.to_string()));
        }

        let diff = self.diff.clone().unwrap_or_default();
        if diff.len() > max_diff_bytes {
            return Err(RecordError::PayloadTooLarge {
                size: diff.len(),
                limit: max_diff_bytes,
            });
        }
        if self.is_rename && self.is_dir_rename {
            return Err(RecordError::ConflictingRenameFlags);
        }

        let (kind, patch) = if self.is_dir_rename {
            let payload: DirRenamePayload = serde_json::from_str(&diff)
                .map_err(|e| RecordError::BadRenamePayload(e.to_string()))?;
            match (payload.old_path, payload.new_path) {
                (Some(old_path), Some(new_path)) => (
                    ChangeKind::DirectoryRenamed {
                        old_path: strip_repo_prefix(repo_path, &old_path),
                        new_path: strip_repo_prefix(repo_path, &new_path),
                    },
                    String::new(),
                ),
                _ => {
                    return Err(RecordError::BadRenamePayload(
                        "directory rename needs old_path and new_path".into(),
                    ));
                }
            }
        } else if self.is_rename {
            let payload: RenamePayload = serde_json::from_str(&diff)
                .map_err(|e| RecordError::BadRenamePayload(e.to_string()))?;
            match (payload.old_rel_path, payload.new_rel_path) {
                (Some(old_path), Some(_)) => (ChangeKind::Renamed { old_path }, String::new()),
                _ => {
                    return Err(RecordError::BadRenamePayload(
                        "rename needs old_rel_path and new_rel_path".into(),
                    ));
                }
            }
        } else if self.is_new_file {
            (ChangeKind::Created, diff)
        } else if self.is_deleted {
            (ChangeKind::Deleted, diff)
        } else {
            (ChangeKind::Modified, diff)
        };

        Ok(DiffRecord {
            repo_path: repo_path.to_string(),
            branch: branch.to_string(),
            path: path.to_string(),
            kind,
            patch,
            is_binary: self.is_binary,
            created_at: created_at.to_string(),
            source: self
                .source
                .clone()
                .unwrap_or_else(|| constants::DIFF_SOURCE.to_string()),
        })
    }
}

fn required<'a>(value: &'a Option<String>, field: &'static str) -> Result<&'a str, RecordError> {
    match value.as_deref() {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(RecordError::MissingField(field)),
    }
}

/// Directory rename payloads may carry absolute paths; store keys are relative.
fn strip_repo_prefix(repo_path: &str, path: &str) -> String {
    path.strip_prefix(repo_path)
        .filter(|rest| rest.is_empty() || rest.starts_with(['/', '\\']))
        .map(|rest| rest.trim_start_matches(['/', '\\']))
        .unwrap_or(path)
        .replace('\\', "/")
}

/// Sync status of a registered repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RepoStatus {
    Synced,
    NotSynced,
    Deleted,
    Disconnected,
}

impl RepoStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Synced => "SYNCED",
            Self::NotSynced => "NOT_SYNCED",
            Self::Deleted => "DELETED",
            Self::Disconnected => "DISCONNECTED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "SYNCED" => Some(Self::Synced),
            "NOT_SYNCED" => Some(Self::NotSynced),
            "DELETED" => Some(Self::Deleted),
            "DISCONNECTED" => Some(Self::Disconnected),
            _ => None,
        }
    }

    /// Status implied by the legacy store's boolean flags.
    pub fn from_legacy_flags(is_in_sync: bool, is_disconnected: bool, is_deleted: bool) -> Self {
        if is_deleted {
            Self::Deleted
        } else if is_disconnected {
            Self::Disconnected
        } else if is_in_sync {
            Self::Synced
        } else {
            Self::NotSynced
        }
    }

    pub fn is_active(self) -> bool {
        self == Self::Synced
    }
}

impl fmt::Display for RepoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress of one migration step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MigrationState {
    NotStarted,
    InProgress,
    Done,
    Error,
}

impl MigrationState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "NOT_STARTED",
            Self::InProgress => "IN_PROGRESS",
            Self::Done => "DONE",
            Self::Error => "ERROR",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "NOT_STARTED" => Some(Self::NotStarted),
            "IN_PROGRESS" => Some(Self::InProgress),
            "DONE" => Some(Self::Done),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }

    /// Whether a step in this state should be (re)run.
    pub fn should_run(self) -> bool {
        matches!(self, Self::NotStarted | Self::Error)
    }
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered repository, keyed by its absolute path.
#[derive(Debug, Clone, PartialEq)]
pub struct RepoInfo {
    pub path: String,
    pub name: String,
    pub email: Option<String>,
    pub server_repo_id: Option<i64>,
    pub status: RepoStatus,
}

impl RepoInfo {
    pub fn new(path: &str, email: Option<&str>, status: RepoStatus) -> Self {
        Self {
            path: path.to_string(),
            name: repo_name(path),
            email: email.map(str::to_string),
            server_repo_id: None,
            status,
        }
    }
}

/// Last path component of a repo path, used as its display name.
pub fn repo_name(path: &str) -> String {
    path.trim_end_matches(['/', '\\'])
        .rsplit(['/', '\\'])
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or(path)
        .to_string()
}

/// One tracked file on a branch. `server_file_id == None` means the file is
/// known locally but not yet confirmed by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub path: String,
    pub server_file_id: Option<i64>,
}

impl FileRecord {
    pub fn is_pending(&self) -> bool {
        self.server_file_id.is_none()
    }
}

/// Credential bundle for one account.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCredentials {
    pub email: String,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub access_key: Option<String>,
    #[serde(default)]
    pub secret_key: Option<String>,
    #[serde(default)]
    pub is_active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_file() -> DiffFile {
        DiffFile {
            repo_path: Some("/work/repo".into()),
            branch: Some("main".into()),
            file_relative_path: Some("src/lib.rs".into()),
            diff: Some("@@ -1 +1 @@\n-a\n+b\n".into()),
            created_at: Some("2024-05-01T10:00:00.250Z".into()),
            source: Some("shadowsync".into()),
            ..DiffFile::default()
        }
    }

    #[test]
    fn plain_record_validates_as_modified() {
        let record = base_file().validate(1024).unwrap();
        assert_eq!(record.kind, ChangeKind::Modified);
        assert_eq!(record.path, "src/lib.rs");
        assert!(record.patch.contains("+b"));
    }

    #[test]
    fn missing_created_at_is_invalid() {
        let mut file = base_file();
        file.created_at = None;
        assert!(matches!(
            file.validate(1024),
            Err(RecordError::MissingField("created_at"))
        ));
    }

    #[test]
    fn oversized_payload_is_invalid() {
        let file = base_file();
        assert!(matches!(
            file.validate(4),
            Err(RecordError::PayloadTooLarge { limit: 4, .. })
        ));
    }

    #[test]
    fn both_rename_flags_are_invalid() {
        let mut file = base_file();
        file.is_rename = true;
        file.is_dir_rename = true;
        assert!(matches!(
            file.validate(1024),
            Err(RecordError::ConflictingRenameFlags)
        ));
    }

    #[test]
    fn rename_without_old_path_is_invalid() {
        let mut file = base_file();
        file.is_rename = true;
        file.diff = Some(r#"{"new_rel_path": "b.txt"}"#.into());
        assert!(matches!(
            file.validate(1024),
            Err(RecordError::BadRenamePayload(_))
        ));
    }

    #[test]
    fn rename_record_survives_disk_form() {
        let record = DiffRecord::renamed("/work/repo", "main", "a.txt", "b.txt");
        let parsed = record.to_file().validate(1024).unwrap();
        assert_eq!(
            parsed.kind,
            ChangeKind::Renamed {
                old_path: "a.txt".into()
            }
        );
        assert_eq!(parsed.path, "b.txt");
    }

    #[test]
    fn directory_rename_strips_absolute_repo_prefix() {
        let mut file = base_file();
        file.is_dir_rename = true;
        file.diff = Some(r#"{"old_path": "/work/repo/old", "new_path": "/work/repo/new"}"#.into());
        let record = file.validate(1024).unwrap();
        assert_eq!(
            record.kind,
            ChangeKind::DirectoryRenamed {
                old_path: "old".into(),
                new_path: "new".into()
            }
        );
    }

    #[test]
    fn legacy_flags_map_to_status() {
        assert_eq!(
            RepoStatus::from_legacy_flags(true, false, false),
            RepoStatus::Synced
        );
        assert_eq!(
            RepoStatus::from_legacy_flags(true, true, false),
            RepoStatus::Disconnected
        );
        assert_eq!(
            RepoStatus::from_legacy_flags(true, true, true),
            RepoStatus::Deleted
        );
        assert_eq!(
            RepoStatus::from_legacy_flags(false, false, false),
            RepoStatus::NotSynced
        );
    }

    #[test]
    fn repo_name_is_last_component() {
        assert_eq!(repo_name("/home/me/project/"), "project");
        assert_eq!(repo_name("C:\\work\\app"), "app");
    }

    #[test]
    fn only_not_started_and_error_migrations_run() {
        assert!(MigrationState::NotStarted.should_run());
        assert!(MigrationState::Error.should_run());
        assert!(!MigrationState::InProgress.should_run());
        assert!(!MigrationState::Done.should_run());
    }
}
