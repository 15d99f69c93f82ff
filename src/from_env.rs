//! Environment variables read at startup.
//!
//! Secrets stay out of `config.toml`:
//! - `PROVIDER_MNEMONIC`: BIP-39 phrase the sponsor wallets derive from.
//! - `RPC_URL_<CHAIN_ID>`: per-chain RPC endpoint, overrides `rpc_url` in the chain section.
//! - `CONFIG_FILE`: path of the TOML configuration, `config.toml` by default.

use url::Url;

use crate::chain::CoordinatorError;
use crate::config::ChainConfig;

pub const ENV_PROVIDER_MNEMONIC: &str = "PROVIDER_MNEMONIC";
pub const ENV_CONFIG_FILE: &str = "CONFIG_FILE";
pub const ENV_RPC_URL_PREFIX: &str = "RPC_URL_";

pub fn provider_mnemonic() -> Result<String, CoordinatorError> {
    std::env::var(ENV_PROVIDER_MNEMONIC)
        .map_err(|_| CoordinatorError::Config(format!("env {ENV_PROVIDER_MNEMONIC} not set")))
}

pub fn rpc_url_env_var(chain_id: u64) -> String {
    format!("{ENV_RPC_URL_PREFIX}{chain_id}")
}

/// RPC endpoint of `chain`: the environment override if present, else the configured URL.
pub fn rpc_url(chain: &ChainConfig) -> Result<Url, CoordinatorError> {
    let env_var = rpc_url_env_var(chain.id);
    match std::env::var(&env_var) {
        Ok(value) => Url::parse(&value)
            .map_err(|e| CoordinatorError::Config(format!("env {env_var}: invalid URL: {e}"))),
        Err(_) => chain.rpc_url.clone().ok_or_else(|| {
            CoordinatorError::Config(format!(
                "chain {} has no rpc_url and env {env_var} is not set",
                chain.name
            ))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(id: u64, rpc_url: Option<&str>) -> ChainConfig {
        ChainConfig {
            name: "test".into(),
            id,
            chain_type: Default::default(),
            contract: Default::default(),
            provider_id: Default::default(),
            rpc_url: rpc_url.map(|u| Url::parse(u).unwrap()),
            block_history_limit: 300,
            min_confirmations: 0,
            options: Default::default(),
        }
    }

    #[test]
    fn test_rpc_url_env_var_name() {
        assert_eq!(rpc_url_env_var(11155111), "RPC_URL_11155111");
    }

    #[test]
    fn test_rpc_url_falls_back_to_config() {
        // Chain id chosen so no real environment defines it.
        let url = rpc_url(&chain(987_654_321_001, Some("https://rpc.example.org"))).unwrap();
        assert_eq!(url.as_str(), "https://rpc.example.org/");
    }

    #[test]
    fn test_rpc_url_missing_everywhere() {
        let err = rpc_url(&chain(987_654_321_002, None)).unwrap_err();
        assert!(matches!(err, CoordinatorError::Config(_)));
    }
}
