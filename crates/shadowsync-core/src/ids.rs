use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static OWNER_COUNTER: AtomicU64 = AtomicU64::new(0);
static RECORD_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate an advisory-lock owner id for this process instance.
///
/// Mixes wall-clock time, process id and an atomic counter so two contexts in
/// the same process never share an owner.
pub fn new_owner_id() -> String {
    let now_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let pid = std::process::id();
    let counter = OWNER_COUNTER.fetch_add(1, Ordering::Relaxed);
    let digest = blake3::hash(format!("{now_nanos}:{pid}:{counter}").as_bytes());
    format!("{pid}-{}", &digest.to_hex()[..16])
}

/// Next value of the process-local diff record sequence.
pub fn next_record_seq() -> u64 {
    RECORD_COUNTER.fetch_add(1, Ordering::Relaxed)
}
