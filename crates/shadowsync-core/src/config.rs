use crate::constants;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub legacy: LegacyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u32,
    #[serde(default = "default_cache_size")]
    pub cache_size: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_diff_bytes")]
    pub max_diff_bytes: usize,
    #[serde(default = "default_copy_threshold")]
    pub copy_threshold_bytes: u64,
    #[serde(default = "default_rename_similarity")]
    pub rename_similarity: f64,
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_secs: u64,
    #[serde(default = "default_send_timeout")]
    pub send_timeout_ms: u64,
    #[serde(default = "default_max_reupload_failures")]
    pub max_reupload_failures: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_transport_timeout")]
    pub timeout_ms: u64,
    /// Bearer token; falls back to the active user's access token when unset.
    #[serde(default)]
    pub access_token: Option<String>,
}

/// Locations of the flat-file store that predates the SQLite schema.
/// Empty strings resolve to files inside the data directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LegacyConfig {
    #[serde(default)]
    pub config_file: String,
    #[serde(default)]
    pub user_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_data_dir() -> String {
    format!("~/{}", constants::DEFAULT_DATA_DIR)
}
fn default_busy_timeout() -> u32 {
    5000
}
fn default_cache_size() -> i32 {
    -64000
}
fn default_tick_interval() -> u64 {
    constants::TICK_INTERVAL_MS
}
fn default_batch_size() -> usize {
    constants::DIFFS_PER_ITERATION
}
fn default_max_diff_bytes() -> usize {
    constants::MAX_DIFF_BYTES
}
fn default_copy_threshold() -> u64 {
    constants::COPY_THRESHOLD_BYTES
}
fn default_rename_similarity() -> f64 {
    constants::RENAME_SIMILARITY
}
fn default_lock_ttl() -> u64 {
    constants::LOCK_TTL_SECS
}
fn default_send_timeout() -> u64 {
    constants::SEND_TIMEOUT_MS
}
fn default_max_reupload_failures() -> u32 {
    constants::MAX_REUPLOAD_FAILURES
}
fn default_endpoint() -> String {
    "http://127.0.0.1:8000/v1".into()
}
fn default_transport_timeout() -> u64 {
    10_000
}
fn default_log_level() -> String {
    "info".into()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            busy_timeout_ms: default_busy_timeout(),
            cache_size: default_cache_size(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval(),
            batch_size: default_batch_size(),
            max_diff_bytes: default_max_diff_bytes(),
            copy_threshold_bytes: default_copy_threshold(),
            rename_similarity: default_rename_similarity(),
            lock_ttl_secs: default_lock_ttl(),
            send_timeout_ms: default_send_timeout(),
            max_reupload_failures: default_max_reupload_failures(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            timeout_ms: default_transport_timeout(),
            access_token: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Layered load: built-in defaults, then `~/.shadowsync/config.toml`,
    /// then `config_file`, then `SHADOWSYNC_<SECTION>_<KEY>` variables.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with_file(None)
    }

    /// Same as [`Config::load`] with an explicit file on top. A named file
    /// that does not exist is an error; a missing global file is not.
    pub fn load_with_file(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        let global = dirs::home_dir().map(|home| {
            home.join(constants::DEFAULT_DATA_DIR)
                .join(constants::CONFIG_FILE)
        });
        if let Some(cf) = config_file
            && !cf.exists()
        {
            return Err(ConfigError::NotFound {
                path: cf.display().to_string(),
            });
        }

        let mut merged = toml::Value::Table(toml::map::Map::new());
        let layers = global
            .iter()
            .filter(|path| path.exists())
            .map(PathBuf::as_path)
            .chain(config_file);
        for layer in layers {
            let raw = load_toml_value(layer)?;
            merge_toml_values(&mut merged, raw);
        }

        let config_str =
            toml::to_string(&merged).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        let mut config: Config =
            toml::from_str(&config_str).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        apply_env_overrides(&mut config);
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Parse a config from a TOML string on top of the built-in defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let mut config: Config =
            toml::from_str(raw).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// A config rooted at `data_dir`, used by tests and embedders.
    pub fn with_data_dir(data_dir: &Path) -> Self {
        let mut config = Self::default();
        config.storage.data_dir = data_dir.to_string_lossy().to_string();
        config
    }

    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.storage.data_dir)
    }

    pub fn state_db_path(&self) -> PathBuf {
        self.data_dir().join(constants::STATE_DB_FILE)
    }

    pub fn legacy_config_path(&self) -> PathBuf {
        if self.legacy.config_file.is_empty() {
            self.data_dir().join(constants::LEGACY_CONFIG_FILE)
        } else {
            PathBuf::from(&self.legacy.config_file)
        }
    }

    pub fn legacy_user_path(&self) -> PathBuf {
        if self.legacy.user_file.is_empty() {
            self.data_dir().join(constants::LEGACY_USER_FILE)
        } else {
            PathBuf::from(&self.legacy.user_file)
        }
    }

    fn normalize(&mut self) {
        self.storage.data_dir = expand_tilde(&self.storage.data_dir);
        self.legacy.config_file = expand_tilde(&self.legacy.config_file);
        self.legacy.user_file = expand_tilde(&self.legacy.user_file);
        if self.sync.batch_size == 0 {
            self.sync.batch_size = default_batch_size();
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.sync.rename_similarity) {
            return Err(ConfigError::InvalidValue {
                field: "sync.rename_similarity".into(),
                reason: format!("{} is outside 0.0..=1.0", self.sync.rename_similarity),
            });
        }
        if self.sync.lock_ttl_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "sync.lock_ttl_secs".into(),
                reason: "must be greater than zero".into(),
            });
        }
        Ok(())
    }
}

/// Parse a layer as a raw table so unset keys stay unset.
fn load_toml_value(path: &Path) -> Result<toml::Value, ConfigError> {
    std::fs::read_to_string(path)?
        .parse::<toml::Value>()
        .map_err(|e| ConfigError::ParseError(format!("{}: {e}", path.display())))
}

/// Recursively overlay tables; any non-table value replaces what was there.
fn merge_toml_values(base: &mut toml::Value, overlay: toml::Value) {
    let (toml::Value::Table(base_map), toml::Value::Table(overlay_map)) = (base, overlay) else {
        return;
    };
    for (key, value) in overlay_map {
        match base_map.get_mut(&key) {
            Some(existing) if existing.is_table() && value.is_table() => {
                merge_toml_values(existing, value);
            }
            _ => {
                base_map.insert(key, value);
            }
        }
    }
}

/// Apply environment variable overrides to config fields.
/// Convention: `SHADOWSYNC_<SECTION>_<KEY>` in UPPER_SNAKE_CASE.
fn apply_env_overrides(config: &mut Config) {
    if let Ok(v) = std::env::var("SHADOWSYNC_STORAGE_DATA_DIR") {
        config.storage.data_dir = v;
    }
    if let Ok(v) = std::env::var("SHADOWSYNC_STORAGE_BUSY_TIMEOUT_MS")
        && let Ok(n) = v.parse()
    {
        config.storage.busy_timeout_ms = n;
    }
    if let Ok(v) = std::env::var("SHADOWSYNC_STORAGE_CACHE_SIZE")
        && let Ok(n) = v.parse()
    {
        config.storage.cache_size = n;
    }
    if let Ok(v) = std::env::var("SHADOWSYNC_SYNC_TICK_INTERVAL_MS")
        && let Ok(n) = v.parse()
    {
        config.sync.tick_interval_ms = n;
    }
    if let Ok(v) = std::env::var("SHADOWSYNC_SYNC_BATCH_SIZE")
        && let Ok(n) = v.parse()
    {
        config.sync.batch_size = n;
    }
    if let Ok(v) = std::env::var("SHADOWSYNC_SYNC_RENAME_SIMILARITY")
        && let Ok(n) = v.parse()
    {
        config.sync.rename_similarity = n;
    }
    if let Ok(v) = std::env::var("SHADOWSYNC_SYNC_LOCK_TTL_SECS")
        && let Ok(n) = v.parse()
    {
        config.sync.lock_ttl_secs = n;
    }
    if let Ok(v) = std::env::var("SHADOWSYNC_SYNC_SEND_TIMEOUT_MS")
        && let Ok(n) = v.parse()
    {
        config.sync.send_timeout_ms = n;
    }
    if let Ok(v) = std::env::var("SHADOWSYNC_TRANSPORT_ENDPOINT") {
        config.transport.endpoint = v;
    }
    if let Ok(v) = std::env::var("SHADOWSYNC_TRANSPORT_ACCESS_TOKEN") {
        config.transport.access_token = Some(v);
    }
    if let Ok(v) = std::env::var("SHADOWSYNC_LEGACY_CONFIG_FILE") {
        config.legacy.config_file = v;
    }
    if let Ok(v) = std::env::var("SHADOWSYNC_LEGACY_USER_FILE") {
        config.legacy.user_file = v;
    }
    if let Ok(v) = std::env::var("SHADOWSYNC_LOGGING_LEVEL") {
        config.logging.level = v;
    }
}

fn expand_tilde(path: &str) -> String {
    if path.starts_with('~')
        && let Some(home) = dirs::home_dir()
    {
        return path.replacen('~', &home.to_string_lossy(), 1);
    }
    path.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_sync_constants() {
        let config = Config::default();
        assert_eq!(config.sync.batch_size, 50);
        assert_eq!(config.sync.max_diff_bytes, 15_000_000);
        assert_eq!(config.sync.copy_threshold_bytes, 100);
        assert_eq!(config.sync.lock_ttl_secs, 300);
        assert!((config.sync.rename_similarity - 0.8).abs() < f64::EPSILON);
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let config = Config::from_toml_str(
            r#"
            [sync]
            batch_size = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.sync.batch_size, 10);
        assert_eq!(config.sync.send_timeout_ms, 30_000);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn rename_similarity_out_of_range_is_rejected() {
        let err = Config::from_toml_str(
            r#"
            [sync]
            rename_similarity = 1.5
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("sync.rename_similarity"));
    }

    #[test]
    fn merge_only_overrides_present_keys() {
        let mut base: toml::Value = toml::from_str(
            r#"
            [sync]
            batch_size = 10
            lock_ttl_secs = 60
            "#,
        )
        .unwrap();
        let overlay: toml::Value = toml::from_str(
            r#"
            [sync]
            batch_size = 20
            "#,
        )
        .unwrap();
        merge_toml_values(&mut base, overlay);
        let sync = base.get("sync").and_then(|v| v.as_table()).unwrap();
        assert_eq!(sync.get("batch_size").and_then(|v| v.as_integer()), Some(20));
        assert_eq!(
            sync.get("lock_ttl_secs").and_then(|v| v.as_integer()),
            Some(60)
        );
    }

    #[test]
    fn legacy_paths_default_into_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::with_data_dir(dir.path());
        assert_eq!(config.legacy_config_path(), dir.path().join("config.yml"));
        assert_eq!(config.legacy_user_path(), dir.path().join("user.yml"));
    }

    #[test]
    fn explicit_missing_config_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load_with_file(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound { .. }));
    }
}
