//! Periodic driver: migration once at start, then re-upload, classify and
//! flush on every tick.

use crate::classifier::{ClassifyReport, classify_all};
use crate::context::SyncContext;
use crate::dispatcher::{FlushReport, flush};
use crate::reupload::{ReuploadOutcome, ReuploadTracker, reupload_all};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Result of one tick. A phase that failed outright is `None`.
#[derive(Debug, Default)]
pub struct TickReport {
    pub reupload: Option<Vec<(String, ReuploadOutcome)>>,
    pub classified: Option<Vec<(String, ClassifyReport)>>,
    pub flush: Option<FlushReport>,
}

/// Run every phase once, synchronously. Errors are logged, never returned.
pub fn tick(ctx: &SyncContext, tracker: &ReuploadTracker) -> TickReport {
    let reupload = reupload_all(ctx, tracker)
        .inspect_err(|e| warn!(error = %e, "Re-upload phase failed"))
        .ok();
    let classified = classify_all(ctx)
        .inspect_err(|e| warn!(error = %e, "Classification phase failed"))
        .ok();
    let flush = flush(ctx)
        .inspect_err(|e| warn!(error = %e, "Flush phase failed"))
        .ok();
    TickReport {
        reupload,
        classified,
        flush,
    }
}

/// Run until Ctrl-C.
pub async fn run(ctx: Arc<SyncContext>) {
    run_until(ctx, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Ctrl-C handler failed");
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl-C, stopping");
    })
    .await
}

/// Run until `shutdown` completes. A tick in progress finishes first.
pub async fn run_until(ctx: Arc<SyncContext>, shutdown: impl Future<Output = ()>) {
    match ctx.migration_manager().spawn() {
        Ok(_handle) => debug!("Migration started in the background"),
        Err(e) => error!(error = %e, "Could not start migration thread"),
    }

    let period = Duration::from_millis(ctx.config().sync.tick_interval_ms.max(1));
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let tracker = Arc::new(ReuploadTracker::new());
    info!(interval_ms = period.as_millis() as u64, "Sync daemon started");

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = interval.tick() => {
                let result = tokio::task::spawn_blocking({
                    let ctx = Arc::clone(&ctx);
                    let tracker = Arc::clone(&tracker);
                    move || tick(&ctx, &tracker)
                })
                .await;
                if let Err(e) = result {
                    error!(error = %e, "Sync tick panicked");
                }
            }
        }
    }
    info!("Sync daemon stopped");
}
