//! Node configuration: where data lives, which network, and how much memory
//! and how many threads the chainstate may use.
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::chainstate::ManagerOptions;
use crate::core::params::Network;

pub const CONFIG_FILE_NAME: &str = "forgekernel.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    pub network: Network,
    /// Script verification threads, 0 = one per CPU
    pub script_threads: usize,
    /// Coin cache entries held before a flush
    pub coins_cache_entries: usize,
    /// `tracing` filter directives, e.g. `forgekernel=debug`
    pub log_filter: Option<String>,
    /// Maximum pooled transactions
    pub mempool_size: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("forgekernel_data"),
            network: Network::Main,
            script_threads: 0,
            coins_cache_entries: ManagerOptions::default().coins_cache_entries,
            log_filter: None,
            mempool_size: 50_000,
        }
    }
}

impl NodeConfig {
    /// Load configuration from JSON file
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// `path` if given, else `forgekernel.json` in the working directory if
    /// present, else defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_json_file(path),
            None => {
                let default_path = Path::new(CONFIG_FILE_NAME);
                if default_path.exists() {
                    Self::from_json_file(default_path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.coins_cache_entries == 0 {
            return Err(ConfigError::Invalid("coins_cache_entries must be > 0".into()));
        }
        if self.mempool_size == 0 {
            return Err(ConfigError::Invalid("mempool_size must be > 0".into()));
        }
        Ok(())
    }

    pub fn resolved_script_threads(&self) -> usize {
        match self.script_threads {
            0 => num_cpus::get(),
            n => n,
        }
    }

    pub fn manager_options(&self) -> ManagerOptions {
        ManagerOptions {
            script_threads: self.resolved_script_threads(),
            coins_cache_entries: self.coins_cache_entries,
        }
    }

    /// Per-network subdirectory so chains never share a database.
    pub fn chain_dir(&self) -> PathBuf {
        self.data_dir.join(self.network.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: NodeConfig = serde_json::from_str(r#"{"network": "regtest", "script_threads": 3}"#).unwrap();
        assert_eq!(config.network, Network::Regtest);
        assert_eq!(config.manager_options().script_threads, 3);
        assert_eq!(config.mempool_size, NodeConfig::default().mempool_size);
        assert!(config.chain_dir().ends_with("regtest"));
    }

    #[test]
    fn test_zero_threads_means_all_cpus() {
        let config = NodeConfig::default();
        assert_eq!(config.resolved_script_threads(), num_cpus::get());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let config = NodeConfig {
            coins_cache_entries: 0,
            ..NodeConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        assert!(matches!(
            serde_json::from_str::<NodeConfig>(r#"{"network": "moon"}"#).map_err(ConfigError::from),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = NodeConfig::from_json_file(Path::new("/nonexistent/forgekernel.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
