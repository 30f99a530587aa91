use anyhow::Result;
use shadowsync_core::config::Config;
use shadowsync_core::vcs;
use shadowsync_sync::classifier::classify;
use std::path::Path;

pub fn run(config: Config, path: &Path) -> Result<()> {
    let repo = super::repo_key(path)?;
    let branch = vcs::current_branch(Path::new(&repo));
    let ctx = super::open_context(config)?;

    let report = classify(&ctx, &repo, &branch)?;
    if let Some(reason) = report.skipped {
        println!("Skipped {repo} ({branch}): {reason:?}");
        return Ok(());
    }
    println!(
        "{repo} ({branch}): {} modified, {} created, {} renamed, {} deleted, {} awaiting flush",
        report.modified, report.created, report.renamed, report.deleted, report.awaiting_flush
    );
    Ok(())
}
