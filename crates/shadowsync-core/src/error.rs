use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("buffer error: {0}")]
    Buffer(#[from] BufferError),

    #[error("mirror error: {0}")]
    Mirror(#[from] MirrorError),

    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("vcs error: {0}")]
    Vcs(#[from] VcsError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config file not found: {path}")]
    NotFound { path: String },

    #[error("failed to parse config: {0}")]
    ParseError(String),

    #[error("invalid config value: {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum StateError {
    #[error("sqlite error: {0}")]
    Sqlite(String),

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("legacy store error: {path}: {reason}")]
    Legacy { path: String, reason: String },

    #[error("repo not registered: {path}")]
    RepoNotFound { path: String },

    #[error("branch not registered: repo={repo}, branch={branch}")]
    BranchNotFound { repo: String, branch: String },

    #[error("invalid stored value: {field}: {value}")]
    InvalidValue { field: String, value: String },

    #[error("state store connection poisoned")]
    Poisoned,

    #[error("migration failed: table={table}, identifier={identifier}, reason={reason}")]
    MigrationFailed {
        table: String,
        identifier: String,
        reason: String,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StateError {
    /// For `.map_err(StateError::sqlite)`. SQLite reports every violated
    /// UNIQUE, NOT NULL, CHECK or FOREIGN KEY rule as "... constraint failed".
    pub fn sqlite<E: std::fmt::Display>(e: E) -> Self {
        let message = e.to_string();
        if message.contains("constraint failed") {
            Self::Constraint(message)
        } else {
            Self::Sqlite(message)
        }
    }

    /// Retrying cannot succeed without something else changing first.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::Constraint(_)
                | Self::RepoNotFound { .. }
                | Self::BranchNotFound { .. }
                | Self::InvalidValue { .. }
        )
    }

    pub fn legacy(path: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Legacy {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn repo_not_found(path: impl Into<String>) -> Self {
        Self::RepoNotFound { path: path.into() }
    }

    pub fn branch_not_found(repo: impl Into<String>, branch: impl Into<String>) -> Self {
        Self::BranchNotFound {
            repo: repo.into(),
            branch: branch.into(),
        }
    }

    pub fn invalid_value(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn migration_failed(
        table: impl Into<String>,
        identifier: impl Into<String>,
        reason: impl std::fmt::Display,
    ) -> Self {
        Self::MigrationFailed {
            table: table.into(),
            identifier: identifier.into(),
            reason: reason.to_string(),
        }
    }
}

/// Why a buffered diff record was rejected.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RecordError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("diff payload too large: {size} bytes (limit {limit})")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("record is flagged as both a file rename and a directory rename")]
    ConflictingRenameFlags,

    #[error("invalid rename payload: {0}")]
    BadRenamePayload(String),

    #[error("invalid created_at timestamp: {0}")]
    BadTimestamp(String),
}

#[derive(Error, Debug)]
pub enum BufferError {
    #[error("failed to encode diff record: {0}")]
    Encode(String),

    #[error("failed to persist diff record to {path}: {reason}")]
    Persist { path: String, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl BufferError {
    pub fn encode<E: std::fmt::Display>(e: E) -> Self {
        Self::Encode(e.to_string())
    }
}

#[derive(Error, Debug)]
pub enum MirrorError {
    #[error("path escapes repository root: {path}")]
    OutsideRepo { path: String },

    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl MirrorError {
    pub fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

#[derive(Error, Debug)]
pub enum LockError {
    #[error("corrupt lock file {path}: {reason}")]
    Corrupt { path: String, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("transport unreachable: {0}")]
    Unreachable(String),

    #[error("transport timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("transport rejected request: status={status}, body={body}")]
    Rejected { status: u16, body: String },

    #[error("invalid transport response: {0}")]
    InvalidResponse(String),
}

impl TransportError {
    pub fn unreachable<E: std::fmt::Display>(e: E) -> Self {
        Self::Unreachable(e.to_string())
    }
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("buffer error: {0}")]
    Buffer(#[from] BufferError),

    #[error("mirror error: {0}")]
    Mirror(#[from] MirrorError),

    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Errors caused by the record itself rather than by an unavailable
    /// store or filesystem.
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::State(e) => e.is_permanent(),
            Self::Mirror(MirrorError::OutsideRepo { .. }) => true,
            _ => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum VcsError {
    #[error("not a git repository: {path}")]
    NotGitRepo { path: String },

    #[error("git error: {0}")]
    GitError(String),
}

pub type Result<T> = std::result::Result<T, Error>;
