use anyhow::{Context, Result};
use shadowsync_core::config::Config;
use std::sync::Arc;

pub fn run(config: Config) -> Result<()> {
    let ctx = Arc::new(super::open_context(config)?);
    let rt = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;
    rt.block_on(shadowsync_sync::daemon::run(ctx));
    Ok(())
}
