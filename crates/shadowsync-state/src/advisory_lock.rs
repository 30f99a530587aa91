//! Expiring, owner-tagged locks shared between processes through small JSON
//! files under `{data_dir}/locks/`.
//!
//! These are advisory: failing to acquire means "skip this cycle", and a
//! crashed holder's lock lapses once `expires_at_ms` passes. The
//! read-modify-write of a lock file is guarded by a non-blocking `fs2`
//! exclusive lock, so a contending acquirer fails rather than waits.

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use shadowsync_core::constants::{LOCK_OWNER_WILDCARD, LOCKS_DIR};
use shadowsync_core::error::LockError;
use shadowsync_core::time::now_millis;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

const LOCK_FILE_PREFIX: &str = "advisory-";
const LOCK_FILE_SUFFIX: &str = ".lock";
const RELEASE_ATTEMPTS: u32 = 5;
const RELEASE_BACKOFF: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockState {
    Unheld,
    HeldBy { owner: String, expires_at_ms: u64 },
}

impl LockState {
    /// Collapse an expired holder to `Unheld`.
    pub fn at(self, now_ms: u64) -> Self {
        match self {
            Self::HeldBy { expires_at_ms, .. } if expires_at_ms <= now_ms => Self::Unheld,
            other => other,
        }
    }
}

/// A lock can be taken when nobody holds it, the holder's lease has run out,
/// or the caller already is the holder (re-entry extends the lease).
pub fn can_acquire(state: &LockState, owner: &str, now_ms: u64) -> bool {
    match state {
        LockState::Unheld => true,
        LockState::HeldBy {
            owner: holder,
            expires_at_ms,
        } => *expires_at_ms <= now_ms || holder == owner,
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LockRecord {
    category: String,
    owner: String,
    expires_at_ms: u64,
}

/// What to do with the lock file after a decision.
enum LockWrite {
    Keep,
    Set(LockRecord),
    Clear,
}

#[derive(Debug, Clone)]
pub struct AdvisoryLock {
    dir: PathBuf,
}

impl AdvisoryLock {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            dir: data_dir.join(LOCKS_DIR),
        }
    }

    pub fn path_for(&self, category: &str) -> PathBuf {
        let hash = blake3::hash(category.as_bytes());
        self.dir.join(format!(
            "{LOCK_FILE_PREFIX}{}{LOCK_FILE_SUFFIX}",
            &hash.to_hex()[..16]
        ))
    }

    /// Take or extend the lock for `category`. Returns `false` when another
    /// owner holds an unexpired lease or the file is being updated right now.
    pub fn acquire(&self, category: &str, owner: &str, ttl: Duration) -> Result<bool, LockError> {
        let path = self.path_for(category);
        let outcome = self.update(&path, |state| {
            let now = now_millis();
            if !can_acquire(&state, owner, now) {
                return (false, LockWrite::Keep);
            }
            let record = LockRecord {
                category: category.to_string(),
                owner: owner.to_string(),
                expires_at_ms: now.saturating_add(ttl.as_millis() as u64),
            };
            (true, LockWrite::Set(record))
        })?;
        let acquired = outcome.unwrap_or(false);
        debug!(category, owner, acquired, "Advisory lock acquire");
        Ok(acquired)
    }

    /// `true` while some owner holds an unexpired lease.
    pub fn is_active(&self, category: &str) -> Result<bool, LockError> {
        Ok(matches!(self.holder(category)?, LockState::HeldBy { .. }))
    }

    pub fn holder(&self, category: &str) -> Result<LockState, LockError> {
        let path = self.path_for(category);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(LockState::Unheld),
            Err(e) => return Err(LockError::Io(e)),
        };
        Ok(parse_state(&path, &content)?.at(now_millis()))
    }

    /// Drop the lease if `owner` holds it, or unconditionally for `"*"`.
    /// A lock file busy with another update is retried a few times before the
    /// lease is left to expire on its own.
    pub fn release(&self, category: &str, owner: &str) -> Result<bool, LockError> {
        let path = self.path_for(category);
        if !path.exists() {
            return Ok(false);
        }
        for attempt in 1..=RELEASE_ATTEMPTS {
            let outcome = self.update(&path, |state| match state {
                LockState::HeldBy { owner: holder, .. }
                    if holder == owner || owner == LOCK_OWNER_WILDCARD =>
                {
                    (true, LockWrite::Clear)
                }
                _ => (false, LockWrite::Keep),
            })?;
            if let Some(released) = outcome {
                if released {
                    debug!(category, owner, "Advisory lock released");
                }
                return Ok(released);
            }
            if attempt < RELEASE_ATTEMPTS {
                std::thread::sleep(RELEASE_BACKOFF);
            }
        }
        warn!(category, owner, "Advisory lock file busy, lease left to expire");
        Ok(false)
    }

    /// Acquire and return a guard that releases on drop.
    pub fn try_guard(
        &self,
        category: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<Option<LockGuard>, LockError> {
        if !self.acquire(category, owner, ttl)? {
            return Ok(None);
        }
        Ok(Some(LockGuard {
            lock: self.clone(),
            category: category.to_string(),
            owner: owner.to_string(),
        }))
    }

    /// Open the lock file under a non-blocking exclusive file lock, hand the
    /// current state to `decide`, and write back the record it returns.
    /// `Ok(None)` means another process is mid-update.
    fn update<T>(
        &self,
        path: &Path,
        decide: impl FnOnce(LockState) -> (T, LockWrite),
    ) -> Result<Option<T>, LockError> {
        std::fs::create_dir_all(&self.dir).map_err(LockError::Io)?;
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(LockError::Io)?;

        if let Err(err) = file.try_lock_exclusive() {
            if err.kind() == std::io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(LockError::Io(err));
        }

        let result = read_and_decide(&mut file, path, decide);
        let _ = file.unlock();
        result.map(Some)
    }
}

fn read_and_decide<T>(
    file: &mut File,
    path: &Path,
    decide: impl FnOnce(LockState) -> (T, LockWrite),
) -> Result<T, LockError> {
    let mut content = String::new();
    file.read_to_string(&mut content).map_err(LockError::Io)?;
    let state = match parse_state(path, &content) {
        Ok(state) => state,
        Err(e) => {
            warn!(error = %e, "Treating corrupt advisory lock as unheld");
            LockState::Unheld
        }
    };

    let (result, write) = decide(state);
    match write {
        LockWrite::Keep => {}
        LockWrite::Clear => {
            file.set_len(0).map_err(LockError::Io)?;
            file.sync_data().map_err(LockError::Io)?;
        }
        LockWrite::Set(record) => {
            let json = serde_json::to_vec(&record).map_err(|e| LockError::Corrupt {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
            file.set_len(0).map_err(LockError::Io)?;
            file.seek(SeekFrom::Start(0)).map_err(LockError::Io)?;
            file.write_all(&json).map_err(LockError::Io)?;
            file.sync_data().map_err(LockError::Io)?;
        }
    }
    Ok(result)
}

fn parse_state(path: &Path, content: &str) -> Result<LockState, LockError> {
    if content.trim().is_empty() {
        return Ok(LockState::Unheld);
    }
    let record: LockRecord = serde_json::from_str(content).map_err(|e| LockError::Corrupt {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    Ok(LockState::HeldBy {
        owner: record.owner,
        expires_at_ms: record.expires_at_ms,
    })
}

/// Holds an advisory lease until dropped.
pub struct LockGuard {
    lock: AdvisoryLock,
    category: String,
    owner: String,
}

impl LockGuard {
    pub fn category(&self) -> &str {
        &self.category
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.lock.release(&self.category, &self.owner) {
            warn!(category = %self.category, error = %e, "Failed to release advisory lock");
        }
    }
}
