//! Which branch a working tree is on.

use crate::constants;
use crate::error::VcsError;
use std::path::Path;
use tracing::debug;

/// Branch HEAD points at, read from the symbolic ref so that a branch with no
/// commits yet still has a name. `Ok(None)` for a detached HEAD.
pub fn head_branch(repo_root: &Path) -> Result<Option<String>, VcsError> {
    let repo = git2::Repository::open(repo_root).map_err(|_| VcsError::NotGitRepo {
        path: repo_root.display().to_string(),
    })?;
    let head = repo
        .find_reference("HEAD")
        .map_err(|e| VcsError::GitError(format!("HEAD unreadable: {e}")))?;

    Ok(head.symbolic_target().map(|target| {
        target
            .strip_prefix("refs/heads/")
            .unwrap_or(target)
            .to_string()
    }))
}

/// Branch used to key mirrors and state. Non-git workspaces and detached
/// heads share [`constants::DEFAULT_BRANCH`].
pub fn current_branch(repo_root: &Path) -> String {
    match head_branch(repo_root) {
        Ok(Some(branch)) => branch,
        Ok(None) => {
            debug!(repo = %repo_root.display(), "Detached HEAD, using default branch");
            constants::DEFAULT_BRANCH.to_string()
        }
        Err(e) => {
            debug!(repo = %repo_root.display(), error = %e, "Using default branch");
            constants::DEFAULT_BRANCH.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_repo_is_an_error_and_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            head_branch(dir.path()),
            Err(VcsError::NotGitRepo { .. })
        ));
        assert_eq!(current_branch(dir.path()), constants::DEFAULT_BRANCH);
    }

    #[test]
    fn unborn_branch_is_named() {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = git2::RepositoryInitOptions::new();
        opts.initial_head("trunk");
        git2::Repository::init_opts(dir.path(), &opts).unwrap();
        assert_eq!(head_branch(dir.path()).unwrap().as_deref(), Some("trunk"));
        assert_eq!(current_branch(dir.path()), "trunk");
    }
}
