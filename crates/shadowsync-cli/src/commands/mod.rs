pub mod classify;
pub mod disconnect;
pub mod flush;
pub mod migrate;
pub mod register;
pub mod remove_branch;
pub mod run;
pub mod status;

use anyhow::{Context, Result};
use shadowsync_core::config::Config;
use shadowsync_state::backend::RepoStateBackend;
use shadowsync_state::legacy::LegacyStore;
use shadowsync_state::migration::SCHEMA_IDENTIFIER;
use shadowsync_state::router::StateRouter;
use shadowsync_state::store::StateStore;
use shadowsync_sync::context::SyncContext;
use shadowsync_sync::transport::HttpTransport;
use std::path::Path;
use std::sync::Arc;

/// Build the sync context with an HTTP transport. Without a configured token
/// the active user's access token is used.
pub fn open_context(mut config: Config) -> shadowsync_core::error::Result<SyncContext> {
    std::fs::create_dir_all(config.data_dir())?;
    if config.transport.access_token.is_none() {
        config.transport.access_token = active_access_token(&config)?;
    }
    let transport = HttpTransport::new(&config.transport)?;
    Ok(SyncContext::open(config, Arc::new(transport))?)
}

fn active_access_token(config: &Config) -> shadowsync_core::error::Result<Option<String>> {
    let router = StateRouter::new(
        Arc::new(StateStore::open(config)?),
        Arc::new(LegacyStore::new(
            &config.legacy_config_path(),
            &config.legacy_user_path(),
        )),
        SCHEMA_IDENTIFIER,
    )?;
    Ok(router.active_user()?.and_then(|user| user.access_token))
}

/// Absolute repository path as stored in the state store.
pub fn repo_key(path: &Path) -> Result<String> {
    let path = std::fs::canonicalize(path).context("Failed to resolve repository path")?;
    Ok(path.to_string_lossy().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn repo_key_is_absolute_and_canonical() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("app")).unwrap();
        let key = repo_key(&dir.path().join("app").join("..").join("app")).unwrap();
        assert!(Path::new(&key).is_absolute());
        assert!(key.ends_with("app"));
        assert!(!key.contains(".."));
    }

    #[test]
    fn repo_key_rejects_missing_path() {
        let dir = tempdir().unwrap();
        assert!(repo_key(&dir.path().join("missing")).is_err());
    }
}
