use anyhow::{Result, bail};
use shadowsync_core::config::Config;

pub fn run(config: Config) -> Result<()> {
    let ctx = super::open_context(config)?;
    let report = ctx.migration_manager().run();

    for step in &report.steps {
        println!(
            "{}/{}: {} -> {} (imported {}, skipped {})",
            step.table,
            step.identifier,
            step.before,
            step.after,
            step.count.imported,
            step.count.skipped
        );
    }
    if !report.is_complete() {
        bail!("Migration incomplete; the legacy store stays authoritative for unfinished tables");
    }
    Ok(())
}
