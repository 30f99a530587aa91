use anyhow::Result;
use shadowsync_core::config::Config;
use shadowsync_core::vcs;
use std::path::Path;

pub fn run(config: Config, path: &Path, branch: Option<&str>, email: Option<&str>) -> Result<()> {
    let repo = super::repo_key(path)?;
    let branch = branch
        .map(str::to_string)
        .unwrap_or_else(|| vcs::current_branch(Path::new(&repo)));

    let ctx = super::open_context(config)?;
    let added = ctx.register(&repo, &branch, email)?;
    println!("Registered {repo} on branch {branch}: {added} new file(s) pending upload");
    Ok(())
}
