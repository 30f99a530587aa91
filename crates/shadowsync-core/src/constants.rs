/// Default data directory name under home.
pub const DEFAULT_DATA_DIR: &str = ".shadowsync";

/// Global config file name inside the data directory.
pub const CONFIG_FILE: &str = "config.toml";

/// SQLite database file name.
pub const STATE_DB_FILE: &str = "state.db";

/// Mirror of the last-synced content of every tracked file.
pub const SHADOW_DIR: &str = ".shadow";

/// Pre-upload snapshots of newly created files.
pub const ORIGINALS_DIR: &str = ".originals";

/// Last shadow copy of files whose delete has already been queued.
pub const DELETED_DIR: &str = ".deleted";

/// Diff buffer directory.
pub const DIFFS_DIR: &str = ".diffs";

/// Advisory lock directory.
pub const LOCKS_DIR: &str = "locks";

/// Legacy flat-file repo mapping.
pub const LEGACY_CONFIG_FILE: &str = "config.yml";

/// Legacy flat-file credential store.
pub const LEGACY_USER_FILE: &str = "user.yml";

/// Sync-specific ignore file, preferred over `.gitignore`.
pub const SYNC_IGNORE_FILE: &str = ".syncignore";

/// VCS ignore file used when no sync ignore file exists.
pub const GIT_IGNORE_FILE: &str = ".gitignore";

/// Value written to the `source` field of every diff record.
pub const DIFF_SOURCE: &str = "shadowsync";

/// Branch name used when the workspace is not a git repository.
pub const DEFAULT_BRANCH: &str = "default";

/// Maximum records handled per flush.
pub const DIFFS_PER_ITERATION: usize = 50;

/// Largest accepted diff payload, in bytes.
pub const MAX_DIFF_BYTES: usize = 15_000_000;

/// Files above this size are diffed against themselves when no shadow exists.
pub const COPY_THRESHOLD_BYTES: u64 = 100;

/// Similarity a new file must exceed to count as a rename of an orphan.
pub const RENAME_SIMILARITY: f64 = 0.8;

/// Advisory lock lifetime (5 minutes).
pub const LOCK_TTL_SECS: u64 = 300;

/// Delay between periodic sync ticks.
pub const TICK_INTERVAL_MS: u64 = 5_000;

/// Transport send timeout.
pub const SEND_TIMEOUT_MS: u64 = 30_000;

/// Consecutive failed re-upload passes before giving up on a branch.
pub const MAX_REUPLOAD_FAILURES: u32 = 3;

/// Bytes inspected when sniffing for binary content.
pub const BINARY_SNIFF_BYTES: usize = 8_000;

/// Lock category held while flushing the diff buffer.
pub const LOCK_BUFFER_FLUSH: &str = "buffer-flush";

/// Lock category prefix held while classifying a repo/branch.
pub const LOCK_CLASSIFY_PREFIX: &str = "classify";

/// Owner value that matches any holder on release.
pub const LOCK_OWNER_WILDCARD: &str = "*";
