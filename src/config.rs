//! Configuration for the deployment indexer.
//!
//! Values resolve in order: JSON config file (optional), environment
//! variables, hardcoded defaults. The attribution API key additionally
//! falls back to an `API-Key` file in the working directory.

use clap::Parser;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

use crate::networks::Network;

/// CLI arguments for the indexer.
#[derive(Parser, Debug, Default)]
#[command(name = "deployscan")]
#[command(about = "Multi-chain smart-contract deployment indexer")]
pub struct CliArgs {
    /// Networks to monitor (default: the built-in EVM list)
    #[arg(long, num_args = 1..)]
    pub networks: Vec<String>,
    /// Monitor every configured EVM chain with endpoints
    #[arg(long)]
    pub all: bool,
    /// Path to an optional JSON configuration file
    #[arg(long, short, env = "CONFIG")]
    pub config: Option<PathBuf>,
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {0}: {1}")]
    FileRead(PathBuf, std::io::Error),
    #[error("Failed to parse config file: {0}")]
    JsonParse(#[from] serde_json::Error),
    #[error("ARKHAM_API_KEY is not configured (env var or API-Key file)")]
    MissingApiKey,
}

/// Indexer configuration.
///
/// Fields use serde defaults that fall back to environment variables, then
/// to hardcoded defaults, so an empty config file (or none at all) still
/// produces a runnable configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "config_defaults::api_key")]
    arkham_api_key: String,
    #[serde(default = "config_defaults::api_url")]
    arkham_api_url: String,
    #[serde(default = "config_defaults::db_path")]
    db_path: String,
    #[serde(default = "config_defaults::log_file")]
    log_file: Option<String>,
    #[serde(default = "config_defaults::log_level")]
    log_level: String,
    /// Seconds between head checks per chain.
    #[serde(default = "config_defaults::block_check_interval")]
    block_check_interval: u64,
    /// Base number of blocks per batch before catch-up multipliers.
    #[serde(default = "config_defaults::batch_size")]
    batch_size: u64,
    /// Per-chain endpoint overrides; chains not listed keep the built-in
    /// public endpoints.
    #[serde(default)]
    rpc_endpoints: HashMap<Network, Vec<Url>>,
}

pub mod config_defaults {
    use std::env;
    use std::fs;

    pub const DEFAULT_API_URL: &str = "https://api.arkm.com";
    pub const DEFAULT_DB_PATH: &str = "contract_monitor.db";
    pub const DEFAULT_LOG_LEVEL: &str = "info";
    pub const DEFAULT_BLOCK_CHECK_INTERVAL: u64 = 12;
    pub const DEFAULT_BATCH_SIZE: u64 = 10;

    /// `ARKHAM_API_KEY` env var, then the `API-Key` file, then empty (which
    /// fails validation later).
    pub fn api_key() -> String {
        if let Ok(key) = env::var("ARKHAM_API_KEY") {
            if !key.trim().is_empty() {
                return key.trim().to_owned();
            }
        }
        fs::read_to_string("API-Key")
            .map(|contents| contents.trim().to_owned())
            .unwrap_or_default()
    }

    pub fn api_url() -> String {
        env::var("ARKHAM_API_URL").unwrap_or_else(|_| DEFAULT_API_URL.to_owned())
    }

    pub fn db_path() -> String {
        env::var("DB_PATH").unwrap_or_else(|_| DEFAULT_DB_PATH.to_owned())
    }

    pub fn log_file() -> Option<String> {
        env::var("LOG_FILE").ok().filter(|path| !path.is_empty())
    }

    pub fn log_level() -> String {
        env::var("LOG_LEVEL").unwrap_or_else(|_| DEFAULT_LOG_LEVEL.to_owned())
    }

    pub fn block_check_interval() -> u64 {
        env::var("BLOCK_CHECK_INTERVAL")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_BLOCK_CHECK_INTERVAL)
    }

    pub fn batch_size() -> u64 {
        env::var("BATCH_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_BATCH_SIZE)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            arkham_api_key: config_defaults::api_key(),
            arkham_api_url: config_defaults::api_url(),
            db_path: config_defaults::db_path(),
            log_file: config_defaults::log_file(),
            log_level: config_defaults::log_level(),
            block_check_interval: config_defaults::block_check_interval(),
            batch_size: config_defaults::batch_size(),
            rpc_endpoints: HashMap::new(),
        }
    }
}

impl Config {
    /// Load configuration from the optional config file, then validate.
    pub fn load(args: &CliArgs) -> Result<Self, ConfigError> {
        let config = match &args.config {
            Some(path) => {
                let contents = fs::read_to_string(path)
                    .map_err(|e| ConfigError::FileRead(path.clone(), e))?;
                serde_json::from_str(&contents)?
            }
            None => Config::default(),
        };
        config.validate()
    }

    fn validate(self) -> Result<Self, ConfigError> {
        if self.arkham_api_key.is_empty() {
            return Err(ConfigError::MissingApiKey);
        }
        Ok(self)
    }

    pub fn api_key(&self) -> &str {
        &self.arkham_api_key
    }

    pub fn api_url(&self) -> &str {
        &self.arkham_api_url
    }

    pub fn db_path(&self) -> &str {
        &self.db_path
    }

    pub fn log_file(&self) -> Option<&str> {
        self.log_file.as_deref()
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.block_check_interval)
    }

    pub fn batch_size(&self) -> u64 {
        self.batch_size
    }

    /// Endpoint list for a chain: the configured override, or the built-in
    /// public endpoints. Empty means the chain is unsupported.
    pub fn endpoints(&self, network: Network) -> Vec<Url> {
        if let Some(configured) = self.rpc_endpoints.get(&network) {
            return configured.clone();
        }
        network
            .default_endpoints()
            .iter()
            .filter_map(|raw| raw.parse().ok())
            .collect()
    }

    /// Resolve the chain selection from the CLI: `--all` takes every EVM
    /// chain with endpoints, `--networks` overrides the default list, and
    /// unknown names are skipped with a warning.
    pub fn selected_networks(&self, args: &CliArgs) -> Vec<Network> {
        if args.all {
            return Network::variants()
                .iter()
                .filter(|network| network.is_evm() && !self.endpoints(**network).is_empty())
                .copied()
                .collect();
        }
        if args.networks.is_empty() {
            return Network::defaults().to_vec();
        }
        args.networks
            .iter()
            .filter_map(|name| match name.parse::<Network>() {
                Ok(network) => Some(network),
                Err(error) => {
                    tracing::warn!("skipping {error}");
                    None
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_resolves_to_defaults() {
        let config: Config = serde_json::from_str("{}").expect("parses");
        assert_eq!(config.api_url(), config_defaults::DEFAULT_API_URL);
        assert_eq!(config.batch_size(), config_defaults::DEFAULT_BATCH_SIZE);
        assert_eq!(
            config.check_interval(),
            Duration::from_secs(config_defaults::DEFAULT_BLOCK_CHECK_INTERVAL)
        );
        assert_eq!(config.endpoints(Network::Ethereum).len(), 5);
        assert!(config.endpoints(Network::Bitcoin).is_empty());
    }

    #[test]
    fn endpoint_overrides_replace_the_builtin_list() {
        let config: Config = serde_json::from_str(
            r#"{
                "arkham_api_key": "k",
                "rpc_endpoints": { "ethereum": ["https://rpc.example.com/eth"] }
            }"#,
        )
        .expect("parses");
        let endpoints = config.endpoints(Network::Ethereum);
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].as_str(), "https://rpc.example.com/eth");
        // Other chains keep their defaults.
        assert_eq!(config.endpoints(Network::Base).len(), 5);
    }

    #[test]
    fn network_selection_honors_all_and_overrides() {
        let config: Config = serde_json::from_str("{}").expect("parses");

        let defaults = config.selected_networks(&CliArgs::default());
        assert_eq!(defaults, Network::defaults());

        let all = config.selected_networks(&CliArgs {
            all: true,
            ..CliArgs::default()
        });
        assert!(all.iter().all(|n| n.is_evm()));
        assert!(all.contains(&Network::Sonic));
        assert!(!all.contains(&Network::Tron));

        let picked = config.selected_networks(&CliArgs {
            networks: vec!["base".to_owned(), "dogecoin".to_owned()],
            ..CliArgs::default()
        });
        assert_eq!(picked, [Network::Base]);
    }

    #[test]
    fn missing_api_key_fails_validation() {
        let config = Config {
            arkham_api_key: String::new(),
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingApiKey)
        ));
    }
}
