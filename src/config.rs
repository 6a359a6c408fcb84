//! Configuration module for the reconciliation engine
//!
//! This module handles configuration loading from TOML files and environment
//! variables, and provides structured configuration types.

use crate::abi::InterfaceDescription;
#[cfg(feature = "rpc-ledger")]
use crate::ledger::rpc::RpcSettings;
use crate::ledger::Contracts;
use crate::types::SubjectKey;
use anyhow::{ensure, Context};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_RPC_URL: &str = "RECONCILER_RPC_URL";
pub const ENV_TOKEN_ADDRESS: &str = "RECONCILER_TOKEN_ADDRESS";
pub const ENV_MANAGER_ADDRESS: &str = "RECONCILER_MANAGER_ADDRESS";

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Ledger connection and contracts
    #[serde(default)]
    pub ledger: LedgerConfig,

    /// Confirmation and retention windows
    #[serde(default)]
    pub reconciler: ReconcilerConfig,

    /// Token display settings used in decoded messages
    #[serde(default)]
    pub display: DisplayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// JSON-RPC endpoint
    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,

    /// Token sale contract
    pub token_address: SubjectKey,

    /// Compliance manager contract
    pub manager_address: SubjectKey,

    /// Interface description of the token contract
    #[serde(default = "default_token_interface")]
    pub token_interface: PathBuf,

    /// Interface description of the compliance manager
    #[serde(default = "default_manager_interface")]
    pub manager_interface: PathBuf,

    /// Request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Receipt and log poll interval in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Blocks on top of inclusion before a receipt is final
    #[serde(default = "default_confirmations")]
    pub confirmations: u64,

    /// Blocks behind the head a log subscription starts from
    #[serde(default = "default_log_lookback")]
    pub log_lookback_blocks: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Time an operation may stay unconfirmed before it times out
    #[serde(default = "default_confirmation_timeout")]
    pub confirmation_timeout_secs: u64,

    /// Time a terminal operation is kept if never acknowledged
    #[serde(default = "default_retention")]
    pub retention_secs: u64,

    /// How often terminal operations are pruned
    #[serde(default = "default_prune_interval")]
    pub prune_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplayConfig {
    #[serde(default = "default_token_symbol")]
    pub token_symbol: String,

    #[serde(default = "default_token_decimals")]
    pub token_decimals: u8,
}

// Default value functions
fn default_rpc_url() -> String { "http://127.0.0.1:8545".to_string() }
fn default_token_interface() -> PathBuf { PathBuf::from("abis/RealEstateToken.json") }
fn default_manager_interface() -> PathBuf { PathBuf::from("abis/ComplianceManager.json") }
fn default_request_timeout() -> u64 { 10 }
fn default_poll_interval() -> u64 { 1_000 }
fn default_confirmations() -> u64 { 1 }
fn default_log_lookback() -> u64 { 20 }
fn default_confirmation_timeout() -> u64 { 30 }
fn default_retention() -> u64 { 300 }
fn default_prune_interval() -> u64 { 30 }
fn default_token_symbol() -> String { "MBST".to_string() }
fn default_token_decimals() -> u8 { 18 }

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            rpc_url: default_rpc_url(),
            // Default local-node deployment addresses
            token_address: SubjectKey::from_bytes([
                0x5f, 0xbd, 0xb2, 0x31, 0x56, 0x78, 0xaf, 0xec, 0xb3, 0x67, 0xf0, 0x32, 0xd9,
                0x3f, 0x64, 0x2f, 0x64, 0x18, 0x0a, 0xa3,
            ]),
            manager_address: SubjectKey::from_bytes([
                0xe7, 0xf1, 0x72, 0x5e, 0x77, 0x34, 0xce, 0x28, 0x8f, 0x83, 0x67, 0xe1, 0xbb,
                0x14, 0x3e, 0x90, 0xbb, 0x3f, 0x05, 0x12,
            ]),
            token_interface: default_token_interface(),
            manager_interface: default_manager_interface(),
            request_timeout_secs: default_request_timeout(),
            poll_interval_ms: default_poll_interval(),
            confirmations: default_confirmations(),
            log_lookback_blocks: default_log_lookback(),
        }
    }
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            confirmation_timeout_secs: default_confirmation_timeout(),
            retention_secs: default_retention(),
            prune_interval_secs: default_prune_interval(),
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            token_symbol: default_token_symbol(),
            token_decimals: default_token_decimals(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ledger: LedgerConfig::default(),
            reconciler: ReconcilerConfig::default(),
            display: DisplayConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Load configuration with `.env` support and environment variable overrides
    pub fn from_file_with_env(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields from `lookup`, which maps variable names to values
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_RPC_URL) {
            self.ledger.rpc_url = url;
        }
        if let Some(address) = lookup(ENV_TOKEN_ADDRESS) {
            self.ledger.token_address = SubjectKey::parse(&address)
                .with_context(|| format!("{} is not an address", ENV_TOKEN_ADDRESS))?;
        }
        if let Some(address) = lookup(ENV_MANAGER_ADDRESS) {
            self.ledger.manager_address = SubjectKey::parse(&address)
                .with_context(|| format!("{} is not an address", ENV_MANAGER_ADDRESS))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(!self.ledger.rpc_url.trim().is_empty(), "ledger.rpc_url must not be empty");
        ensure!(
            self.ledger.token_address != self.ledger.manager_address,
            "token and manager contracts must differ"
        );
        ensure!(self.ledger.poll_interval_ms > 0, "ledger.poll_interval_ms must be positive");
        ensure!(self.ledger.confirmations > 0, "ledger.confirmations must be at least 1");
        ensure!(
            self.reconciler.confirmation_timeout_secs > 0,
            "reconciler.confirmation_timeout_secs must be positive"
        );
        ensure!(
            self.reconciler.prune_interval_secs > 0,
            "reconciler.prune_interval_secs must be positive"
        );
        ensure!(
            self.display.token_decimals <= 77,
            "display.token_decimals does not fit a 256-bit amount"
        );
        Ok(())
    }

    pub fn contracts(&self) -> Contracts {
        Contracts {
            token: self.ledger.token_address,
            manager: self.ledger.manager_address,
        }
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.reconciler.confirmation_timeout_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.reconciler.retention_secs)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.reconciler.prune_interval_secs)
    }

    #[cfg(feature = "rpc-ledger")]
    pub fn rpc_settings(&self) -> RpcSettings {
        RpcSettings {
            url: self.ledger.rpc_url.clone(),
            request_timeout: Duration::from_secs(self.ledger.request_timeout_secs),
            poll_interval: Duration::from_millis(self.ledger.poll_interval_ms),
            confirmations: self.ledger.confirmations,
            log_lookback: self.ledger.log_lookback_blocks,
        }
    }

    /// Load and merge both contracts' interface descriptions
    pub fn load_interface(&self) -> anyhow::Result<InterfaceDescription> {
        let token = InterfaceDescription::from_file(&self.ledger.token_interface)
            .context("Failed to load token interface description")?;
        let manager = InterfaceDescription::from_file(&self.ledger.manager_interface)
            .context("Failed to load manager interface description")?;
        Ok(token.merge(manager))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = Config::default();
        assert_eq!(config.confirmation_timeout(), Duration::from_secs(30));
        assert_eq!(config.retention(), Duration::from_secs(300));
        assert_eq!(config.display.token_symbol, "MBST");
        assert_eq!(
            config.ledger.token_address.to_string(),
            "0x5fbdb2315678afecb367f032d93f642f64180aa3"
        );
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [ledger]
            token_address = "0x1111111111111111111111111111111111111111"
            manager_address = "0x2222222222222222222222222222222222222222"
            confirmations = 3

            [reconciler]
            confirmation_timeout_secs = 45
            "#,
        )
        .unwrap();
        assert_eq!(config.ledger.confirmations, 3);
        assert_eq!(config.ledger.poll_interval_ms, 1_000);
        assert_eq!(config.confirmation_timeout(), Duration::from_secs(45));
        assert_eq!(config.reconciler.retention_secs, 300);
        assert_eq!(config.display.token_decimals, 18);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_env_overrides(|key| match key {
                ENV_RPC_URL => Some("http://node:8545".to_string()),
                ENV_MANAGER_ADDRESS => Some("0x3333333333333333333333333333333333333333".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.ledger.rpc_url, "http://node:8545");
        assert_eq!(config.contracts().manager, SubjectKey::from_bytes([0x33; 20]));

        let err = config
            .apply_env_overrides(|key| (key == ENV_TOKEN_ADDRESS).then(|| "nope".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_TOKEN_ADDRESS));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::default();
        config.reconciler.confirmation_timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.ledger.manager_address = config.ledger.token_address;
        assert!(config.validate().is_err());
    }
}
