use anyhow::Result;
use shadowsync_core::config::Config;
use std::path::Path;

pub fn run(config: Config, path: &Path, branch: &str) -> Result<()> {
    let repo = super::repo_key(path)?;
    let ctx = super::open_context(config)?;
    if ctx.remove_branch(&repo, branch)? {
        println!("Removed branch {branch} of {repo}");
    } else {
        println!("Branch {branch} of {repo} was not registered; mirrors cleared");
    }
    Ok(())
}
