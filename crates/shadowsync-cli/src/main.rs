mod commands;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "shadowsync",
    version,
    about = "Background sync of local working-tree changes",
    long_about = "ShadowSync mirrors every tracked file of a repository, turns working-tree\n\
        changes into queued diff records and ships them to a remote sync service.\n\n\
        Quick start:\n  \
        shadowsync migrate\n  \
        shadowsync register --path /path/to/repo\n  \
        shadowsync run"
)]
struct Cli {
    /// Enable verbose logging (set log level to debug)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to config file (default: ~/.shadowsync/config.toml)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import the legacy flat-file store into SQLite
    ///
    /// Runs every pending migration step in the foreground and prints its
    /// outcome. Steps already DONE or stuck IN_PROGRESS are left alone.
    Migrate,
    /// Register a repository branch for syncing
    ///
    /// Snapshots every live file into the shadow mirror and records each
    /// unknown file as pending; the next re-upload pass registers them remotely.
    ///
    /// Example: shadowsync register --path /path/to/repo --email dev@example.com
    Register {
        /// Path to the repository root (default: current directory)
        #[arg(short, long)]
        path: Option<String>,

        /// Branch to register (default: current HEAD branch)
        #[arg(short, long)]
        branch: Option<String>,

        /// Account the repository belongs to
        #[arg(long)]
        email: Option<String>,
    },
    /// Run one classification pass
    ///
    /// Compares the working tree with its shadow mirror and queues diff records.
    Classify {
        /// Path to the repository root (default: current directory)
        #[arg(short, long)]
        path: Option<String>,
    },
    /// Run one dispatcher pass over the diff buffer
    Flush,
    /// Run the periodic sync daemon until Ctrl-C
    Run,
    /// Show repositories, branches, queued records, locks and migrations
    Status {
        /// Limit output to one repository
        #[arg(short, long)]
        path: Option<String>,
    },
    /// Stop syncing a repository
    Disconnect {
        /// Path to the repository root (default: current directory)
        #[arg(short, long)]
        path: Option<String>,
    },
    /// Forget a branch: its file records and mirrors
    RemoveBranch {
        /// Path to the repository root (default: current directory)
        #[arg(short, long)]
        path: Option<String>,

        /// Branch to remove
        #[arg(short, long)]
        branch: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_file = cli.config.as_deref().map(std::path::Path::new);
    let config = shadowsync_core::config::Config::load_with_file(config_file)?;

    let filter = if cli.verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    match cli.command {
        Commands::Migrate => commands::migrate::run(config)?,
        Commands::Register {
            path,
            branch,
            email,
        } => {
            let path = resolve_path(path)?;
            commands::register::run(config, &path, branch.as_deref(), email.as_deref())?;
        }
        Commands::Classify { path } => {
            let path = resolve_path(path)?;
            commands::classify::run(config, &path)?;
        }
        Commands::Flush => commands::flush::run(config)?,
        Commands::Run => commands::run::run(config)?,
        Commands::Status { path } => {
            commands::status::run(config, path.as_deref().map(std::path::Path::new))?;
        }
        Commands::Disconnect { path } => {
            let path = resolve_path(path)?;
            commands::disconnect::run(config, &path)?;
        }
        Commands::RemoveBranch { path, branch } => {
            let path = resolve_path(path)?;
            commands::remove_branch::run(config, &path, &branch)?;
        }
    }

    Ok(())
}

fn resolve_path(path: Option<String>) -> anyhow::Result<std::path::PathBuf> {
    match path {
        Some(p) => Ok(std::path::PathBuf::from(p)),
        None => Ok(std::env::current_dir()?),
    }
}
