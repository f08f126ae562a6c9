use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::StoreError;
use crate::sync::json_store::atomic_write;

pub const CONFIG_FILE: &str = "sync.json";

/// Platform data dir, or `.lodestar` under the working directory when the
/// platform has none.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("lodestar"))
        .unwrap_or_else(|| PathBuf::from(".lodestar"))
}

/// Tunables for the sync core. Every field has a default, so a partial
/// (or empty) JSON object is a valid config.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Quiet period before a per-record write is pushed.
    pub debounce_ms: u64,
    /// Window for aggregate records (preferences, analytics, streaks).
    pub throttle_ms: u64,
    /// Minimum age of the last successful save before a throttled flush
    /// pushes the record again.
    pub min_save_interval_ms: u64,
    /// Timestamps closer than this are treated as simultaneous.
    pub clock_skew_tolerance_ms: u64,
    pub conflict_history_capacity: usize,
    pub data_directory: PathBuf,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 1500,
            throttle_ms: 5000,
            min_save_interval_ms: 5000,
            clock_skew_tolerance_ms: 1000,
            conflict_history_capacity: 50,
            data_directory: default_data_dir(),
        }
    }
}

impl SyncConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn throttle(&self) -> Duration {
        Duration::from_millis(self.throttle_ms)
    }

    pub fn min_save_interval(&self) -> Duration {
        Duration::from_millis(self.min_save_interval_ms)
    }

    pub fn clock_skew_tolerance(&self) -> chrono::TimeDelta {
        chrono::TimeDelta::milliseconds(self.clock_skew_tolerance_ms as i64)
    }

    pub fn config_path(&self) -> PathBuf {
        self.data_directory.join(CONFIG_FILE)
    }

    /// Read a config file, falling back to defaults when it is missing or
    /// unreadable.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    log::error!("Invalid sync config {}: {}", path.display(), e);
                    Self::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                log::error!("Failed to read sync config {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(self)?;
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|source| StoreError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        atomic_write(path, json.as_bytes()).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_match_documented_tunables() {
        let config = SyncConfig::default();
        assert_eq!(config.clock_skew_tolerance(), chrono::TimeDelta::milliseconds(1000));
        assert_eq!(config.conflict_history_capacity, 50);
        assert_eq!(config.throttle(), Duration::from_secs(5));
        assert!(config.debounce() >= Duration::from_secs(1));
        assert!(config.debounce() <= Duration::from_secs(2));
    }

    #[test]
    fn default_data_dir_is_never_a_literal_tilde() {
        let dir = SyncConfig::default().data_directory;
        assert!(dir.ends_with("lodestar") || dir == Path::new(".lodestar"));
        assert!(dir.components().all(|c| c.as_os_str() != "~"));
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: SyncConfig = serde_json::from_str(r#"{"debounce_ms": 250}"#).unwrap();
        assert_eq!(config.debounce_ms, 250);
        assert_eq!(config.throttle_ms, 5000);
    }

    #[test]
    fn missing_file_loads_defaults() {
        let dir = TempDir::new().unwrap();
        let config = SyncConfig::load(&dir.path().join("nope.json"));
        assert_eq!(config, SyncConfig::default());
    }

    #[test]
    fn save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE);
        let config = SyncConfig {
            throttle_ms: 9000,
            data_directory: dir.path().to_path_buf(),
            ..SyncConfig::default()
        };
        config.save(&path).unwrap();
        assert_eq!(SyncConfig::load(&path), config);
    }
}
