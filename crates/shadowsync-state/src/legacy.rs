//! Flat-file repo state used before the SQLite schema existed.
//!
//! `config.yml` maps repo paths to `{id, email, branches, is_in_sync,
//! is_disconnected, is_deleted}`, where `branches` maps branch names to
//! `{relative path: server id | null}`. `user.yml` maps emails to credential
//! bundles. Both files are read fresh on every call and rewritten atomically,
//! so the store stays usable as the authoritative backend until migration
//! completes.

use crate::backend::{RepoStateBackend, is_under_dir};
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use shadowsync_core::error::StateError;
use shadowsync_core::types::{FileRecord, RepoInfo, RepoStatus, UserCredentials, repo_name};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

const REPOS_KEY: &str = "repos";

/// One repo entry of `config.yml`. Unknown keys are carried through rewrites.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LegacyRepo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default)]
    pub branches: BTreeMap<String, BTreeMap<String, Option<i64>>>,
    #[serde(default)]
    pub is_in_sync: bool,
    #[serde(default)]
    pub is_disconnected: bool,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl LegacyRepo {
    pub fn status(&self) -> RepoStatus {
        RepoStatus::from_legacy_flags(self.is_in_sync, self.is_disconnected, self.is_deleted)
    }

    fn set_status(&mut self, status: RepoStatus) {
        self.is_in_sync = status != RepoStatus::NotSynced;
        self.is_disconnected = status == RepoStatus::Disconnected;
        self.is_deleted = status == RepoStatus::Deleted;
    }

    pub fn to_info(&self, path: &str) -> RepoInfo {
        RepoInfo {
            path: path.to_string(),
            name: repo_name(path),
            email: self.email.clone(),
            server_repo_id: self.id,
            status: self.status(),
        }
    }
}

/// One entry of `user.yml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LegacyUser {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub access_key: Option<String>,
    #[serde(default)]
    pub secret_key: Option<String>,
    #[serde(default)]
    pub is_active: bool,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl LegacyUser {
    pub fn to_credentials(&self, email: &str) -> UserCredentials {
        UserCredentials {
            email: email.to_string(),
            access_token: self.access_token.clone(),
            access_key: self.access_key.clone(),
            secret_key: self.secret_key.clone(),
            is_active: self.is_active,
        }
    }
}

/// A legacy entry that parsed, or the reason it did not.
pub type LegacyEntry<T> = (String, Result<T, String>);

pub struct LegacyStore {
    config_path: PathBuf,
    user_path: PathBuf,
    write_lock: Mutex<()>,
}

impl LegacyStore {
    pub fn new(config_path: &Path, user_path: &Path) -> Self {
        Self {
            config_path: config_path.to_path_buf(),
            user_path: user_path.to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn user_path(&self) -> &Path {
        &self.user_path
    }

    /// Every repo entry in `config.yml`, malformed ones included as errors.
    pub fn repo_entries(&self) -> Result<Vec<LegacyEntry<LegacyRepo>>, StateError> {
        let root = read_yaml(&self.config_path)?;
        let repos = root
            .get(REPOS_KEY)
            .and_then(Value::as_mapping)
            .cloned()
            .unwrap_or_default();
        Ok(parse_entries(&repos))
    }

    /// Every user entry in `user.yml`, malformed ones included as errors.
    pub fn user_entries(&self) -> Result<Vec<LegacyEntry<LegacyUser>>, StateError> {
        let root = read_yaml(&self.user_path)?;
        let users = root.as_mapping().cloned().unwrap_or_default();
        Ok(parse_entries(&users))
    }

    fn valid_repos(&self) -> Result<BTreeMap<String, LegacyRepo>, StateError> {
        let mut repos = BTreeMap::new();
        for (path, entry) in self.repo_entries()? {
            match entry {
                Ok(repo) => {
                    repos.insert(path, repo);
                }
                Err(reason) => {
                    warn!(path = %self.config_path.display(), repo = %path, %reason, "Skipping malformed legacy repo entry");
                }
            }
        }
        Ok(repos)
    }

    fn repo(&self, path: &str) -> Result<Option<LegacyRepo>, StateError> {
        Ok(self.valid_repos()?.remove(path))
    }

    fn branch(
        &self,
        repo: &str,
        branch: &str,
    ) -> Result<BTreeMap<String, Option<i64>>, StateError> {
        let entry = self
            .repo(repo)?
            .ok_or_else(|| StateError::branch_not_found(repo, branch))?;
        entry
            .branches
            .get(branch)
            .cloned()
            .ok_or_else(|| StateError::branch_not_found(repo, branch))
    }

    /// Load `config.yml`, apply `f` to one repo entry (created when `create`
    /// is set), and write the file back atomically.
    fn update_repo<T>(
        &self,
        path: &str,
        create: bool,
        f: impl FnOnce(&mut LegacyRepo) -> Result<T, StateError>,
    ) -> Result<Option<T>, StateError> {
        let _guard = self.write_lock.lock().map_err(|_| StateError::Poisoned)?;
        let mut root = read_yaml(&self.config_path)?;
        if !root.is_mapping() {
            root = Value::Mapping(Mapping::new());
        }
        let Some(root_map) = root.as_mapping_mut() else {
            return Ok(None);
        };
        let repos_value = root_map
            .entry(Value::String(REPOS_KEY.into()))
            .or_insert_with(|| Value::Mapping(Mapping::new()));
        if !repos_value.is_mapping() {
            *repos_value = Value::Mapping(Mapping::new());
        }
        let Some(repos) = repos_value.as_mapping_mut() else {
            return Ok(None);
        };

        let key = Value::String(path.to_string());
        let mut entry = match repos.get(&key) {
            Some(value) => serde_yaml::from_value::<LegacyRepo>(value.clone())
                .map_err(|e| StateError::legacy(self.config_path.display().to_string(), e))?,
            None if create => LegacyRepo::default(),
            None => return Ok(None),
        };
        let result = f(&mut entry)?;
        let value = serde_yaml::to_value(&entry)
            .map_err(|e| StateError::legacy(self.config_path.display().to_string(), e))?;
        repos.insert(key, value);
        write_yaml_atomic(&self.config_path, &root)?;
        Ok(Some(result))
    }

    fn update_branch<T>(
        &self,
        repo: &str,
        branch: &str,
        f: impl FnOnce(&mut BTreeMap<String, Option<i64>>) -> T,
    ) -> Result<T, StateError> {
        self.update_repo(repo, false, |entry| {
            let files = entry
                .branches
                .get_mut(branch)
                .ok_or_else(|| StateError::branch_not_found(repo, branch))?;
            Ok(f(files))
        })?
        .ok_or_else(|| StateError::branch_not_found(repo, branch))
    }

    fn update_users<T>(
        &self,
        f: impl FnOnce(&mut Mapping) -> Result<T, StateError>,
    ) -> Result<T, StateError> {
        let _guard = self.write_lock.lock().map_err(|_| StateError::Poisoned)?;
        let mut root = read_yaml(&self.user_path)?;
        if !root.is_mapping() {
            root = Value::Mapping(Mapping::new());
        }
        let Some(users) = root.as_mapping_mut() else {
            return Err(StateError::legacy(
                self.user_path.display().to_string(),
                "not a mapping",
            ));
        };
        let result = f(users)?;
        write_yaml_atomic(&self.user_path, &root)?;
        Ok(result)
    }
}

fn parse_entries<T: serde::de::DeserializeOwned>(map: &Mapping) -> Vec<LegacyEntry<T>> {
    map.iter()
        .filter_map(|(key, value)| {
            let key = key.as_str()?.to_string();
            let parsed = serde_yaml::from_value::<T>(value.clone()).map_err(|e| e.to_string());
            Some((key, parsed))
        })
        .collect()
}

fn read_yaml(path: &Path) -> Result<Value, StateError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(Value::Mapping(Mapping::new()));
        }
        Err(e) => return Err(StateError::Io(e)),
    };
    if content.trim().is_empty() {
        return Ok(Value::Mapping(Mapping::new()));
    }
    serde_yaml::from_str(&content).map_err(|e| StateError::legacy(path.display().to_string(), e))
}

fn write_yaml_atomic(path: &Path, value: &Value) -> Result<(), StateError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).map_err(StateError::Io)?;
    let content = serde_yaml::to_string(value)
        .map_err(|e| StateError::legacy(path.display().to_string(), e))?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(StateError::Io)?;
    tmp.write_all(content.as_bytes()).map_err(StateError::Io)?;
    tmp.as_file().sync_data().map_err(StateError::Io)?;
    tmp.persist(path)
        .map_err(|e| StateError::legacy(path.display().to_string(), e))?;
    Ok(())
}

impl RepoStateBackend for LegacyStore {
    fn name(&self) -> &'static str {
        "legacy"
    }

    fn list_repos(&self) -> Result<Vec<RepoInfo>, StateError> {
        Ok(self
            .valid_repos()?
            .iter()
            .map(|(path, repo)| repo.to_info(path))
            .collect())
    }

    fn find_repo(&self, path: &str) -> Result<Option<RepoInfo>, StateError> {
        Ok(self.repo(path)?.map(|repo| repo.to_info(path)))
    }

    fn upsert_repo(&self, repo: &RepoInfo) -> Result<(), StateError> {
        self.update_repo(&repo.path, true, |entry| {
            if repo.email.is_some() {
                entry.email = repo.email.clone();
            }
            if repo.server_repo_id.is_some() {
                entry.id = repo.server_repo_id;
            }
            entry.set_status(repo.status);
            Ok(())
        })?;
        Ok(())
    }

    fn set_repo_status(&self, path: &str, status: RepoStatus) -> Result<bool, StateError> {
        Ok(self
            .update_repo(path, false, |entry| {
                entry.set_status(status);
                Ok(())
            })?
            .is_some())
    }

    fn list_branches(&self, repo: &str) -> Result<Vec<String>, StateError> {
        Ok(self
            .repo(repo)?
            .map(|entry| entry.branches.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn has_branch(&self, repo: &str, branch: &str) -> Result<bool, StateError> {
        Ok(self
            .repo(repo)?
            .is_some_and(|entry| entry.branches.contains_key(branch)))
    }

    fn ensure_branch(&self, repo: &str, branch: &str) -> Result<(), StateError> {
        self.update_repo(repo, false, |entry| {
            entry.branches.entry(branch.to_string()).or_default();
            Ok(())
        })?
        .ok_or_else(|| StateError::repo_not_found(repo))
    }

    fn remove_branch(&self, repo: &str, branch: &str) -> Result<bool, StateError> {
        Ok(self
            .update_repo(repo, false, |entry| Ok(entry.branches.remove(branch).is_some()))?
            .unwrap_or(false))
    }

    fn branch_files(&self, repo: &str, branch: &str) -> Result<Vec<FileRecord>, StateError> {
        Ok(self
            .branch(repo, branch)?
            .into_iter()
            .map(|(path, server_file_id)| FileRecord {
                path,
                server_file_id,
            })
            .collect())
    }

    fn file_record(
        &self,
        repo: &str,
        branch: &str,
        path: &str,
    ) -> Result<Option<FileRecord>, StateError> {
        Ok(self
            .branch(repo, branch)?
            .get(path)
            .map(|server_file_id| FileRecord {
                path: path.to_string(),
                server_file_id: *server_file_id,
            }))
    }

    fn upsert_file(
        &self,
        repo: &str,
        branch: &str,
        path: &str,
        server_file_id: Option<i64>,
    ) -> Result<(), StateError> {
        self.update_branch(repo, branch, |files| {
            let slot = files.entry(path.to_string()).or_insert(None);
            if server_file_id.is_some() {
                *slot = server_file_id;
            }
        })
    }

    fn rename_file(
        &self,
        repo: &str,
        branch: &str,
        old_path: &str,
        new_path: &str,
    ) -> Result<bool, StateError> {
        self.update_branch(repo, branch, |files| match files.remove(old_path) {
            Some(id) => {
                files.insert(new_path.to_string(), id);
                true
            }
            None => false,
        })
    }

    fn rename_dir(
        &self,
        repo: &str,
        branch: &str,
        old_dir: &str,
        new_dir: &str,
    ) -> Result<usize, StateError> {
        let old_dir = old_dir.trim_end_matches('/');
        let new_dir = new_dir.trim_end_matches('/');
        self.update_branch(repo, branch, |files| {
            let moved: Vec<String> = files
                .keys()
                .filter(|path| path.as_str() != old_dir && is_under_dir(path, old_dir))
                .cloned()
                .collect();
            for old in &moved {
                if let Some(id) = files.remove(old) {
                    let new = format!("{new_dir}{}", &old[old_dir.len()..]);
                    files.insert(new, id);
                }
            }
            moved.len()
        })
    }

    fn remove_file(&self, repo: &str, branch: &str, path: &str) -> Result<bool, StateError> {
        self.update_branch(repo, branch, |files| files.remove(path).is_some())
    }

    fn files_under(
        &self,
        repo: &str,
        branch: &str,
        dir: &str,
    ) -> Result<Vec<FileRecord>, StateError> {
        let dir = dir.trim_end_matches('/');
        Ok(self
            .branch(repo, branch)?
            .into_iter()
            .filter(|(path, _)| path.as_str() != dir && is_under_dir(path, dir))
            .map(|(path, server_file_id)| FileRecord {
                path,
                server_file_id,
            })
            .collect())
    }

    fn pending_files(&self, repo: &str, branch: &str) -> Result<Vec<String>, StateError> {
        Ok(self
            .branch(repo, branch)?
            .into_iter()
            .filter(|(_, id)| id.is_none())
            .map(|(path, _)| path)
            .collect())
    }

    fn upsert_user(&self, user: &UserCredentials) -> Result<(), StateError> {
        let user_path = self.user_path.display().to_string();
        self.update_users(|users| {
            if user.is_active {
                for (_, value) in users.iter_mut() {
                    if let Some(map) = value.as_mapping_mut() {
                        map.insert(Value::String("is_active".into()), Value::Bool(false));
                    }
                }
            }
            let key = Value::String(user.email.clone());
            let mut entry = users
                .get(&key)
                .and_then(|v| serde_yaml::from_value::<LegacyUser>(v.clone()).ok())
                .unwrap_or_default();
            entry.access_token = user.access_token.clone();
            entry.access_key = user.access_key.clone();
            entry.secret_key = user.secret_key.clone();
            entry.is_active = user.is_active;
            let value =
                serde_yaml::to_value(&entry).map_err(|e| StateError::legacy(user_path, e))?;
            users.insert(key, value);
            Ok(())
        })
    }

    fn find_user(&self, email: &str) -> Result<Option<UserCredentials>, StateError> {
        Ok(self
            .user_entries()?
            .into_iter()
            .find(|(key, _)| key == email)
            .and_then(|(key, entry)| entry.ok().map(|user| user.to_credentials(&key))))
    }

    fn active_user(&self) -> Result<Option<UserCredentials>, StateError> {
        Ok(self
            .user_entries()?
            .into_iter()
            .filter_map(|(key, entry)| entry.ok().map(|user| user.to_credentials(&key)))
            .find(|user| user.is_active))
    }
}
