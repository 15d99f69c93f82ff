//! Per-chain provider state for one coordination cycle.
//!
//! A [`ProviderState`] is a value: stages read it and produce the next one through
//! [`ProviderState::update`]. Nothing mutates a state another stage may still hold.

use alloy::primitives::{Address, B256, U256};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::chain::{CoordinatorError, RrpProvider};
use crate::config::{ChainConfig, ChainOptions, ChainType, LoggingConfig};
use crate::types::{GasTarget, Request};

/// Immutable settings of the provider on one chain.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub name: String,
    pub chain_id: u64,
    pub chain_type: ChainType,
    pub contract: Address,
    pub provider_id: B256,
    pub options: ChainOptions,
    pub block_history_limit: u64,
    pub min_confirmations: u64,
    pub logging: LoggingConfig,
}

impl ProviderSettings {
    pub fn from_chain(chain: &ChainConfig, logging: &LoggingConfig) -> Self {
        Self {
            name: chain.name.clone(),
            chain_id: chain.id,
            chain_type: chain.chain_type,
            contract: chain.contract,
            provider_id: chain.provider_id,
            options: chain.options.clone(),
            block_history_limit: chain.block_history_limit,
            min_confirmations: chain.min_confirmations,
            logging: logging.clone(),
        }
    }
}

/// On-chain facts about a designated wallet, read once per cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalletSnapshot {
    pub transaction_count: u64,
    /// Only fetched for wallets with a withdrawal to serve.
    pub balance: Option<U256>,
}

pub struct ProviderState<P> {
    pub settings: Arc<ProviderSettings>,
    /// Groups all log records of one cycle.
    pub coordinator_id: Uuid,
    pub current_block: Option<u64>,
    pub requests: Vec<Request>,
    pub gas_target: Option<GasTarget>,
    pub wallets: BTreeMap<Address, WalletSnapshot>,
    pub provider: Arc<P>,
}

impl<P> Clone for ProviderState<P> {
    fn clone(&self) -> Self {
        Self {
            settings: Arc::clone(&self.settings),
            coordinator_id: self.coordinator_id,
            current_block: self.current_block,
            requests: self.requests.clone(),
            gas_target: self.gas_target,
            wallets: self.wallets.clone(),
            provider: Arc::clone(&self.provider),
        }
    }
}

impl<P> std::fmt::Debug for ProviderState<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderState")
            .field("provider", &self.settings.name)
            .field("chain_id", &self.settings.chain_id)
            .field("coordinator_id", &self.coordinator_id)
            .field("current_block", &self.current_block)
            .field("requests", &self.requests.len())
            .field("gas_target", &self.gas_target)
            .field("wallets", &self.wallets.len())
            .finish()
    }
}

/// Fields to replace in [`ProviderState::update`]. Unset fields are kept.
#[derive(Debug, Clone, Default)]
pub struct StateUpdate {
    requests: Option<Vec<Request>>,
    gas_target: Option<GasTarget>,
    wallets: Option<BTreeMap<Address, WalletSnapshot>>,
    current_block: Option<u64>,
}

impl StateUpdate {
    pub fn requests(mut self, requests: Vec<Request>) -> Self {
        self.requests = Some(requests);
        self
    }

    pub fn gas_target(mut self, gas_target: GasTarget) -> Self {
        self.gas_target = Some(gas_target);
        self
    }

    pub fn wallets(mut self, wallets: BTreeMap<Address, WalletSnapshot>) -> Self {
        self.wallets = Some(wallets);
        self
    }

    pub fn current_block(mut self, block: u64) -> Self {
        self.current_block = Some(block);
        self
    }
}

impl<P: RrpProvider> ProviderState<P> {
    /// Fresh state for a new cycle.
    pub fn new(settings: Arc<ProviderSettings>, provider: Arc<P>) -> Self {
        Self {
            settings,
            coordinator_id: Uuid::new_v4(),
            current_block: None,
            requests: Vec::new(),
            gas_target: None,
            wallets: BTreeMap::new(),
            provider,
        }
    }

    /// Rebuilds the chain handle so no connection state leaks into the transaction stage.
    /// All logical fields are carried over unchanged.
    pub fn refresh(&self) -> Result<Self, CoordinatorError> {
        let provider = self.provider.reconnect()?;
        Ok(Self {
            provider: Arc::new(provider),
            ..self.clone()
        })
    }
}

impl<P> ProviderState<P> {
    /// Returns a copy with the fields set in `update` replaced.
    pub fn update(&self, update: StateUpdate) -> Self {
        let current = self.clone();
        Self {
            requests: update.requests.unwrap_or(current.requests),
            gas_target: update.gas_target.or(current.gas_target),
            wallets: update.wallets.unwrap_or(current.wallets),
            current_block: update.current_block.or(current.current_block),
            ..current
        }
    }

    /// Short label for log records.
    pub fn label(&self) -> String {
        format!("{}:{}", self.settings.name, self.settings.chain_id)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn settings() -> ProviderSettings {
        ProviderSettings {
            name: "localhost".into(),
            chain_id: 31337,
            chain_type: ChainType::Evm,
            contract: Address::repeat_byte(0x5f),
            provider_id: B256::repeat_byte(0xaa),
            options: ChainOptions::default(),
            block_history_limit: 300,
            min_confirmations: 0,
            logging: LoggingConfig::default(),
        }
    }
}
