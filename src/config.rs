//! Configuration file parsing for the coordinator.
//!
//! This module handles loading and parsing the `config.toml` file: logging, cycle timing,
//! RPC transport tuning, the API adapter and the list of chains to serve. Secrets (the provider
//! mnemonic) never live here; see [`crate::from_env`].
//!
//! Every section is optional and falls back to defaults, except that a useful deployment needs
//! at least one `[[chains]]` entry.

use alloy::primitives::{Address, B256};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

use crate::chain::CoordinatorError;

/// Complete coordinator configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub logging: LoggingConfig,
    pub coordinator: CycleConfig,
    pub transaction: TransactionConfig,
    pub adapter: AdapterConfig,
    pub chains: Vec<ChainConfig>,
}

impl CoordinatorConfig {
    /// Load configuration from a TOML file.
    ///
    /// If the file doesn't exist, returns the default configuration.
    /// If the file exists but is malformed, returns an error.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, config::ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let config: Self = config::Config::builder()
            .add_source(config::File::from(path))
            .build()?
            .try_deserialize()?;
        config
            .validate()
            .map_err(|e| config::ConfigError::Message(e.to_string()))?;
        Ok(config)
    }

    /// Rejects values that deserialize fine but cannot price gas.
    pub fn validate(&self) -> Result<(), CoordinatorError> {
        for chain in &self.chains {
            chain
                .options
                .validate()
                .map_err(|e| CoordinatorError::Config(format!("chain {}: {e}", chain.name)))?;
        }
        Ok(())
    }

    /// Load configuration from environment variable CONFIG_FILE or default path.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        let config_path = std::env::var(crate::from_env::ENV_CONFIG_FILE)
            .unwrap_or_else(|_| "config.toml".to_string());
        Self::from_file(config_path)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

/// Logging configuration. `RUST_LOG` takes precedence over `level` when set.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Plain,
            level: "info".to_string(),
        }
    }
}

/// Timing of coordination cycles.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CycleConfig {
    /// Seconds between the starts of two cycles.
    /// Default: 60 seconds.
    pub cycle_interval_seconds: u64,
    /// Run a single cycle and exit.
    pub run_once: bool,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            cycle_interval_seconds: 60,
            run_once: false,
        }
    }
}

impl CycleConfig {
    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_seconds.max(1))
    }
}

/// RPC transport configuration shared by all chains.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransactionConfig {
    /// Timeout for individual RPC requests in seconds.
    /// Default: 30 seconds.
    pub default_rpc_timeout_seconds: u64,

    /// HTTP connection establishment timeout in seconds.
    /// Default: 10 seconds.
    pub connection_timeout_seconds: u64,

    /// Maximum idle connections per host in the connection pool.
    /// Default: 100 connections.
    pub pool_max_idle_per_host: usize,

    /// How long to keep idle connections alive in seconds.
    /// Default: 90 seconds.
    pub pool_idle_timeout_seconds: u64,

    /// Retries of rate-limited RPC requests. 0 disables the retry layer.
    pub rpc_max_retries: u32,
    pub rpc_initial_backoff_ms: u64,
    pub rpc_compute_units_per_second: u64,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            default_rpc_timeout_seconds: 30,
            connection_timeout_seconds: 10,
            pool_max_idle_per_host: 100,
            pool_idle_timeout_seconds: 90,
            rpc_max_retries: 3,
            rpc_initial_backoff_ms: 500,
            rpc_compute_units_per_second: 300,
        }
    }
}

impl TransactionConfig {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.default_rpc_timeout_seconds)
    }
}

/// External API adapter the coordinator forwards resolved calls to.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdapterConfig {
    /// Required: the binary refuses to start without it.
    pub url: Option<Url>,
    pub timeout_seconds: u64,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_seconds: 10,
        }
    }
}

impl AdapterConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainType {
    #[default]
    Evm,
}

/// Fee-market protocol of a chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TxType {
    Legacy,
    #[default]
    Eip1559,
}

/// One legacy gas price source. Strategies are tried in order; the first that succeeds wins.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum GasPriceStrategy {
    /// The node's `eth_gasPrice`, scaled.
    ProviderRecommended {
        #[serde(default = "default_multiplier")]
        multiplier: f64,
    },
    /// A fixed price in wei.
    Constant { gas_price_wei: u64 },
}

fn default_multiplier() -> f64 {
    1.0
}

/// Per-chain transaction options.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ChainOptions {
    pub tx_type: TxType,
    /// Empty means the node's `eth_gasPrice` unscaled.
    pub gas_price_oracle: Vec<GasPriceStrategy>,
    /// Gas limit of fulfill and fail transactions.
    /// Default: 500000.
    pub fulfillment_gas_limit: Option<u64>,
    /// `maxFeePerGas = baseFee * base_fee_multiplier + priority_fee_wei`.
    pub base_fee_multiplier: u64,
    /// Default: 3.12 gwei.
    pub priority_fee_wei: u64,
}

pub const DEFAULT_FULFILLMENT_GAS_LIMIT: u64 = 500_000;

impl Default for ChainOptions {
    fn default() -> Self {
        Self {
            tx_type: TxType::Eip1559,
            gas_price_oracle: Vec::new(),
            fulfillment_gas_limit: None,
            base_fee_multiplier: 2,
            priority_fee_wei: 3_120_000_000,
        }
    }
}

impl ChainOptions {
    /// `base_fee_multiplier` must leave headroom above the base fee on EIP-1559 chains, and every
    /// oracle multiplier must be a positive finite number.
    pub fn validate(&self) -> Result<(), CoordinatorError> {
        if self.tx_type == TxType::Eip1559 && self.base_fee_multiplier <= 1 {
            return Err(CoordinatorError::Config(format!(
                "base_fee_multiplier must be greater than 1, got {}",
                self.base_fee_multiplier
            )));
        }
        for strategy in &self.gas_price_oracle {
            if let GasPriceStrategy::ProviderRecommended { multiplier } = strategy {
                if !multiplier.is_finite() || *multiplier <= 0.0 {
                    return Err(CoordinatorError::Config(format!(
                        "provider_recommended multiplier must be positive, got {multiplier}"
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn gas_limit(&self) -> u64 {
        self.fulfillment_gas_limit
            .unwrap_or(DEFAULT_FULFILLMENT_GAS_LIMIT)
    }
}

/// A chain the provider serves.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChainConfig {
    /// Human readable name used in logs.
    pub name: String,
    pub id: u64,
    #[serde(rename = "type", default)]
    pub chain_type: ChainType,
    /// RRP contract address.
    pub contract: Address,
    pub provider_id: B256,
    /// Overridden by `RPC_URL_<ID>` when set.
    #[serde(default)]
    pub rpc_url: Option<Url>,
    /// How far back to scan for request events.
    #[serde(default = "default_block_history_limit")]
    pub block_history_limit: u64,
    /// Blocks a request event must be buried under before it is served.
    #[serde(default)]
    pub min_confirmations: u64,
    #[serde(default)]
    pub options: ChainOptions,
}

fn default_block_history_limit() -> u64 {
    300
}
