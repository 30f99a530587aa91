use anyhow::Result;
use shadowsync_core::config::Config;
use shadowsync_sync::dispatcher::flush;

pub fn run(config: Config) -> Result<()> {
    let ctx = super::open_context(config)?;
    let report = flush(&ctx)?;
    if let Some(reason) = report.skipped {
        println!("Flush skipped: {reason:?}");
        return Ok(());
    }
    println!(
        "Flushed {} record(s): {} sent, {} uploaded, {} already synced, {} renames, {} deferred, {} discarded",
        report.drained,
        report.sent,
        report.uploaded,
        report.already_synced,
        report.renames,
        report.deferred,
        report.discarded
    );
    Ok(())
}
