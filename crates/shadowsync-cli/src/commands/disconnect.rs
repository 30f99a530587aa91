use anyhow::Result;
use shadowsync_core::config::Config;
use std::path::Path;

pub fn run(config: Config, path: &Path) -> Result<()> {
    let repo = super::repo_key(path)?;
    let ctx = super::open_context(config)?;
    if ctx.disconnect(&repo)? {
        println!("Disconnected {repo}");
    } else {
        println!("{repo} is not registered");
    }
    Ok(())
}
