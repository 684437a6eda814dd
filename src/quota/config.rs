//! Configuration and data directory discovery

use std::env;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::quota::models::{CounterSpec, QuotaKey};

/// Overrides the data directory
pub const DATA_DIR_ENV: &str = "QUOTA_TRACKER_DIR";
/// Overrides the config file location
pub const CONFIG_PATH_ENV: &str = "QUOTA_TRACKER_CONFIG";

const APP_DIR_NAME: &str = "quota-cycle-tracker";
const DB_FILE_NAME: &str = "quota.db";
const CONFIG_FILE_NAME: &str = "config.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config file {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("quota {0} is declared more than once")]
    DuplicateQuota(String),
}

/// Get the data directory path
/// Priority: 1. Custom path, 2. QUOTA_TRACKER_DIR env var, 3. local data dir
pub fn get_data_dir(custom_path: Option<&str>) -> PathBuf {
    if let Some(path) = custom_path {
        return PathBuf::from(path);
    }

    if let Ok(env_path) = env::var(DATA_DIR_ENV) {
        if !env_path.trim().is_empty() {
            return PathBuf::from(env_path);
        }
    }

    if let Some(dir) = dirs::data_local_dir() {
        return dir.join(APP_DIR_NAME);
    }

    // Fallback for edge cases
    PathBuf::from(".")
}

/// Database file inside the data directory
pub fn get_db_path(data_dir: &Path) -> PathBuf {
    data_dir.join(DB_FILE_NAME)
}

/// Config file location: explicit path, then QUOTA_TRACKER_CONFIG, then `<data dir>/config.json`
pub fn get_config_path(custom_path: Option<&str>, data_dir: &Path) -> PathBuf {
    if let Some(path) = custom_path {
        return PathBuf::from(path);
    }

    match env::var(CONFIG_PATH_ENV) {
        Ok(path) if !path.trim().is_empty() => PathBuf::from(path),
        _ => data_dir.join(CONFIG_FILE_NAME),
    }
}

/// One tracked quota and how to read it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaDefinition {
    pub key: QuotaKey,
    #[serde(flatten)]
    pub spec: CounterSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackerConfig {
    #[serde(default)]
    pub data_dir: Option<String>,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_seconds: u64,
    #[serde(default = "default_lookback_days")]
    pub lookback_days: u32,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default)]
    pub quotas: Vec<QuotaDefinition>,
}

fn default_retention_days() -> u32 {
    90
}

fn default_maintenance_interval() -> u64 {
    3600 // 1 hour
}

fn default_lookback_days() -> u32 {
    30
}

fn default_history_limit() -> usize {
    50
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            retention_days: default_retention_days(),
            maintenance_interval_seconds: default_maintenance_interval(),
            lookback_days: default_lookback_days(),
            history_limit: default_history_limit(),
            quotas: Vec::new(),
        }
    }
}

impl TrackerConfig {
    /// Reject configs that declare the same quota key twice
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for quota in &self.quotas {
            if !seen.insert(&quota.key) {
                return Err(ConfigError::DuplicateQuota(quota.key.to_string()));
            }
        }
        Ok(())
    }
}

/// Load the config file. A missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<TrackerConfig, ConfigError> {
    if !path.exists() {
        log::debug!("No config file at {}, using defaults", path.display());
        return Ok(TrackerConfig::default());
    }

    let content = std::fs::read_to_string(path)?;
    let config: TrackerConfig =
        serde_json::from_str(&content).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })?;
    config.validate()?;

    log::info!(
        "Loaded config from {} ({} quotas)",
        path.display(),
        config.quotas.len()
    );
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::models::CounterKind;

    #[test]
    fn test_custom_data_dir_wins() {
        let dir = get_data_dir(Some("/tmp/quota-data"));
        assert_eq!(dir, PathBuf::from("/tmp/quota-data"));
        assert_eq!(get_db_path(&dir), PathBuf::from("/tmp/quota-data/quota.db"));
    }

    #[test]
    fn test_custom_config_path_wins() {
        let path = get_config_path(Some("/etc/quota.json"), Path::new("/data"));
        assert_eq!(path, PathBuf::from("/etc/quota.json"));
    }

    #[test]
    fn test_config_defaults() {
        let config: TrackerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, TrackerConfig::default());
        assert_eq!(config.retention_days, 90);
        assert_eq!(config.maintenance_interval_seconds, 3600);
        assert_eq!(config.lookback_days, 30);
        assert_eq!(config.history_limit, 50);
    }

    #[test]
    fn test_quota_definitions() {
        let json = r#"{
            "retentionDays": 14,
            "quotas": [
                {"key": "anthropic/five_hour", "kind": "percent", "valueField": "utilization"},
                {"key": "zai/tokens", "kind": "remaining", "valueField": "remaining",
                 "limitField": "usage", "resetHints": false}
            ]
        }"#;

        let config: TrackerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.retention_days, 14);
        assert_eq!(config.quotas.len(), 2);

        let first = &config.quotas[0];
        assert_eq!(first.key, QuotaKey::new("anthropic", "five_hour"));
        assert_eq!(first.spec.kind, CounterKind::Percent);
        assert!(first.spec.reset_hints);

        let second = &config.quotas[1];
        assert_eq!(second.spec.limit_field.as_deref(), Some("usage"));
        assert!(!second.spec.reset_hints);
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("config.json")).unwrap();
        assert_eq!(config, TrackerConfig::default());
    }

    #[test]
    fn test_load_rejects_bad_files() {
        let dir = tempfile::tempdir().unwrap();

        let broken = dir.path().join("broken.json");
        std::fs::write(&broken, "{ not json").unwrap();
        assert!(matches!(load_config(&broken), Err(ConfigError::Json { .. })));

        let duplicate = dir.path().join("duplicate.json");
        std::fs::write(
            &duplicate,
            r#"{"quotas": [
                {"key": "a/b", "kind": "increasing", "valueField": "x"},
                {"key": "a/b", "kind": "percent", "valueField": "y"}
            ]}"#,
        )
        .unwrap();
        assert!(matches!(
            load_config(&duplicate),
            Err(ConfigError::DuplicateQuota(_))
        ));
    }
}
