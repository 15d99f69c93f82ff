//! Sponsor wallet derivation from the provider mnemonic.
//!
//! The designated wallet of sponsor `i` is the child `m/0/{i}` of the provider's master node,
//! the same path the contract side derives from the provider xpub. Derivation is pure; the cache
//! only avoids repeating the key stretching.

use alloy::primitives::{Address, U256};
use alloy::signers::local::{MnemonicBuilder, PrivateKeySigner, coins_bip39::English};
use dashmap::DashMap;
use std::fmt;

use crate::chain::CoordinatorError;

/// Non-hardened BIP-32 children stop at 2^31.
const MAX_SPONSOR_INDEX: u32 = (1 << 31) - 1;

/// Derivation path of the designated wallet for a sponsor index.
pub fn designated_wallet_path(index: u32) -> String {
    format!("m/0/{index}")
}

pub struct WalletDeriver {
    phrase: String,
    cache: DashMap<u32, PrivateKeySigner>,
}

impl fmt::Debug for WalletDeriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalletDeriver")
            .field("cached", &self.cache.len())
            .finish_non_exhaustive()
    }
}

impl WalletDeriver {
    /// Validates the mnemonic by deriving the first wallet.
    pub fn from_mnemonic(phrase: &str) -> Result<Self, CoordinatorError> {
        let deriver = Self {
            phrase: phrase.trim().to_string(),
            cache: DashMap::new(),
        };
        let first = deriver.derive(0)?;
        tracing::debug!(address = %first.address(), "provider mnemonic validated");
        deriver.cache.insert(0, first);
        Ok(deriver)
    }

    fn derive(&self, index: u32) -> Result<PrivateKeySigner, CoordinatorError> {
        MnemonicBuilder::<English>::default()
            .phrase(self.phrase.as_str())
            .derivation_path(designated_wallet_path(index))
            .and_then(|builder| builder.build())
            .map_err(|e| CoordinatorError::KeyMaterial(format!("derivation of index {index}: {e}")))
    }

    /// Signer of the wallet at `index`.
    pub fn wallet(&self, index: u32) -> Result<PrivateKeySigner, CoordinatorError> {
        if index > MAX_SPONSOR_INDEX {
            return Err(CoordinatorError::KeyMaterial(format!(
                "sponsor index {index} is out of the non-hardened range"
            )));
        }
        if let Some(signer) = self.cache.get(&index) {
            return Ok(signer.value().clone());
        }
        let signer = self.derive(index)?;
        self.cache.insert(index, signer.clone());
        Ok(signer)
    }

    pub fn address(&self, index: u32) -> Result<Address, CoordinatorError> {
        self.wallet(index).map(|signer| signer.address())
    }

    /// Wallet for an on-chain sponsor index.
    pub fn sponsor_wallet(&self, sponsor_index: U256) -> Result<PrivateKeySigner, CoordinatorError> {
        let index = u32::try_from(sponsor_index).map_err(|_| {
            CoordinatorError::KeyMaterial(format!("sponsor index {sponsor_index} does not fit u32"))
        })?;
        self.wallet(index)
    }

    pub fn sponsor_address(&self, sponsor_index: U256) -> Result<Address, CoordinatorError> {
        self.sponsor_wallet(sponsor_index).map(|signer| signer.address())
    }
}

#[cfg(test)]
pub(crate) const TEST_MNEMONIC: &str =
    "test test test test test test test test test test test junk";
