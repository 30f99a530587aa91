use anyhow::Result;
use shadowsync_core::config::Config;
use shadowsync_core::vcs;
use shadowsync_state::advisory_lock::LockState;
use shadowsync_state::backend::RepoStateBackend;
use shadowsync_state::db;
use shadowsync_state::migration::SCHEMA_IDENTIFIER;
use shadowsync_state::schema::{self, REPO_TABLE, USER_TABLE};
use shadowsync_sync::context::SyncContext;
use std::path::Path;

pub fn run(config: Config, path: Option<&Path>) -> Result<()> {
    let only = path.map(super::repo_key).transpose()?;
    let ctx = super::open_context(config)?;

    println!("ShadowSync Status");
    println!("=================");
    println!();

    match ctx.state().sqlite().with_conn(db::integrity_problem)? {
        None => println!("State database: OK ({})", ctx.state().sqlite().path().display()),
        Some(problem) => println!("State database: WARN {problem}"),
    }
    print_migrations(&ctx)?;
    println!();

    let repos = ctx.state().list_repos()?;
    let mut shown = 0;
    for repo in repos {
        if only.as_deref().is_some_and(|p| p != repo.path) {
            continue;
        }
        shown += 1;
        let current = vcs::current_branch(Path::new(&repo.path));
        println!("{} [{}] ({})", repo.name, repo.status, repo.path);
        for branch in ctx.state().list_branches(&repo.path)? {
            let tracked = ctx.state().branch_files(&repo.path, &branch)?.len();
            let pending = ctx.state().pending_files(&repo.path, &branch)?.len();
            let marker = if branch == current { "*" } else { " " };
            println!("  {marker} {branch}: {tracked} tracked, {pending} pending upload");
            print_lock(
                &ctx,
                "    classify lock",
                &ctx.classify_lock_category(&repo.path, &branch),
            )?;
        }
    }
    if shown == 0 {
        println!("No registered repositories");
    }

    println!();
    println!("Queued diff records: {}", ctx.buffer().len()?);
    print_lock(&ctx, "Flush lock", ctx.flush_lock_category())?;
    Ok(())
}

fn print_migrations(ctx: &SyncContext) -> Result<()> {
    let states = ctx.state().sqlite().with_conn(|conn| {
        [USER_TABLE, REPO_TABLE]
            .into_iter()
            .map(|table| {
                schema::migration_state(conn, table, SCHEMA_IDENTIFIER).map(|state| (table, state))
            })
            .collect::<Result<Vec<_>, _>>()
    })?;
    for (table, state) in states {
        println!(
            "Migration {table}/{SCHEMA_IDENTIFIER}: {state} (authority: {:?})",
            ctx.state().authority(table)
        );
    }
    Ok(())
}

fn print_lock(ctx: &SyncContext, label: &str, category: &str) -> Result<()> {
    match ctx.locks().holder(category)? {
        LockState::Unheld => {}
        LockState::HeldBy {
            owner,
            expires_at_ms,
        } => println!(
            "{label}: held by {owner} until {}",
            shadowsync_core::time::format_utc_millis(expires_at_ms)
        ),
    }
    Ok(())
}
