//! Gas target selection.
//!
//! Legacy chains get a single gas price from the configured oracle strategies. EIP-1559 chains
//! get `maxFeePerGas = baseFee * multiplier + priorityFee` with the priority fee as tip. Both
//! carry the configured fulfillment gas limit.

use alloy::primitives::Address;
use tracing::Instrument;

use crate::chain::{CoordinatorError, RrpCall, RrpProvider};
use crate::config::{ChainOptions, GasPriceStrategy, TxType};
use crate::types::{GasPricing, GasTarget};

/// Builds the gas target of this cycle. Any failure means no submissions for the chain.
pub async fn gas_target<P: RrpProvider>(
    options: &ChainOptions,
    provider: &P,
) -> Result<GasTarget, CoordinatorError> {
    options.validate()?;
    let pricing = match options.tx_type {
        TxType::Legacy => legacy_pricing(options, provider)
            .instrument(tracing::debug_span!("legacy_gas_price"))
            .await?,
        TxType::Eip1559 => {
            let base_fee = provider
                .base_fee_per_gas()
                .instrument(tracing::debug_span!("base_fee_per_gas"))
                .await
                .map_err(|e| CoordinatorError::GasPricing(format!("base fee: {e}")))?;
            dynamic_pricing(base_fee, options)?
        }
    };
    let target = GasTarget {
        pricing,
        gas_limit: options.gas_limit(),
    };
    tracing::info!(?target, "gas target chosen");
    Ok(target)
}

/// Fee caps for an EIP-1559 chain with the given base fee.
pub fn dynamic_pricing(base_fee: u128, options: &ChainOptions) -> Result<GasPricing, CoordinatorError> {
    let priority_fee = u128::from(options.priority_fee_wei);
    let max_fee = base_fee
        .checked_mul(u128::from(options.base_fee_multiplier))
        .and_then(|fee| fee.checked_add(priority_fee))
        .ok_or_else(|| CoordinatorError::GasPricing(format!("max fee overflows for base fee {base_fee}")))?;
    Ok(GasPricing::Eip1559 {
        max_fee_per_gas: max_fee,
        max_priority_fee_per_gas: priority_fee,
    })
}

async fn legacy_pricing<P: RrpProvider>(
    options: &ChainOptions,
    provider: &P,
) -> Result<GasPricing, CoordinatorError> {
    if options.gas_price_oracle.is_empty() {
        let gas_price = provider
            .gas_price()
            .await
            .map_err(|e| CoordinatorError::GasPricing(format!("gas price: {e}")))?;
        return Ok(GasPricing::Legacy { gas_price });
    }

    let mut last_error = None;
    for strategy in &options.gas_price_oracle {
        match strategy {
            GasPriceStrategy::Constant { gas_price_wei } => {
                return Ok(GasPricing::Legacy {
                    gas_price: u128::from(*gas_price_wei),
                });
            }
            GasPriceStrategy::ProviderRecommended { multiplier } => match provider.gas_price().await {
                Ok(gas_price) => {
                    let scaled = (gas_price as f64 * multiplier) as u128;
                    tracing::debug!(gas_price, multiplier, scaled, "provider recommended gas price");
                    return Ok(GasPricing::Legacy { gas_price: scaled });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "provider recommended gas price unavailable, trying next strategy");
                    last_error = Some(e);
                }
            },
        }
    }
    Err(CoordinatorError::GasPricing(match last_error {
        Some(e) => format!("all gas price strategies failed, last: {e}"),
        None => "no gas price strategy succeeded".to_string(),
    }))
}

/// Gas limit of a withdrawal, estimated with a dry run sending 1 wei.
pub async fn withdrawal_gas_limit<P: RrpProvider>(
    provider: &P,
    from: Address,
    call: &RrpCall,
) -> Result<u64, CoordinatorError> {
    provider
        .estimate_gas(from, call)
        .instrument(tracing::debug_span!("estimate_withdrawal_gas"))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::memory::{MemoryProvider, calls};

    fn legacy(oracle: Vec<GasPriceStrategy>) -> ChainOptions {
        ChainOptions {
            tx_type: TxType::Legacy,
            gas_price_oracle: oracle,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_legacy_uses_node_gas_price() {
        let chain = MemoryProvider::new(1);
        chain.set_gas_price(1000).await;

        let target = gas_target(&legacy(vec![]), &chain).await.unwrap();
        assert_eq!(target.pricing, GasPricing::Legacy { gas_price: 1000 });
        assert_eq!(target.gas_limit, 500_000);
        assert_eq!(calls(&chain.counters().base_fee_per_gas), 0);
    }

    #[tokio::test]
    async fn test_eip1559_max_fee_formula() {
        let chain = MemoryProvider::new(1);
        chain.set_base_fee(1000).await;

        let target = gas_target(&ChainOptions::default(), &chain).await.unwrap();
        assert_eq!(
            target.pricing,
            GasPricing::Eip1559 {
                max_fee_per_gas: 1000 * 2 + 3_120_000_000,
                max_priority_fee_per_gas: 3_120_000_000,
            }
        );
        assert_eq!(calls(&chain.counters().gas_price), 0);
    }

    #[test]
    fn test_dynamic_pricing_custom_multiplier() {
        let options = ChainOptions {
            base_fee_multiplier: 3,
            priority_fee_wei: 7,
            ..Default::default()
        };
        assert_eq!(
            dynamic_pricing(100, &options).unwrap(),
            GasPricing::Eip1559 {
                max_fee_per_gas: 307,
                max_priority_fee_per_gas: 7,
            }
        );
        assert!(dynamic_pricing(u128::MAX, &options).is_err());
    }

    #[tokio::test]
    async fn test_oracle_falls_through_to_constant() {
        let chain = MemoryProvider::new(1);
        chain.fail_gas_price().await;
        let options = legacy(vec![
            GasPriceStrategy::ProviderRecommended { multiplier: 1.5 },
            GasPriceStrategy::Constant { gas_price_wei: 42 },
        ]);

        let target = gas_target(&options, &chain).await.unwrap();
        assert_eq!(target.pricing, GasPricing::Legacy { gas_price: 42 });
    }

    #[tokio::test]
    async fn test_oracle_scales_provider_price() {
        let chain = MemoryProvider::new(1);
        chain.set_gas_price(1000).await;
        let options = legacy(vec![GasPriceStrategy::ProviderRecommended { multiplier: 1.5 }]);

        let target = gas_target(&options, &chain).await.unwrap();
        assert_eq!(target.pricing, GasPricing::Legacy { gas_price: 1500 });
    }

    #[tokio::test]
    async fn test_gas_price_failure_is_gas_pricing_error() {
        let chain = MemoryProvider::new(1);
        chain.fail_gas_price().await;
        let err = gas_target(&legacy(vec![]), &chain).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::GasPricing(_)));

        chain.fail_base_fee().await;
        let err = gas_target(&ChainOptions::default(), &chain).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::GasPricing(_)));
    }

    #[tokio::test]
    async fn test_invalid_multipliers_never_price_gas() {
        let chain = MemoryProvider::new(1);
        chain.set_gas_price(1000).await;
        chain.set_base_fee(1000).await;

        let negative = legacy(vec![GasPriceStrategy::ProviderRecommended { multiplier: -2.0 }]);
        let err = gas_target(&negative, &chain).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::Config(_)));

        let flat = ChainOptions {
            base_fee_multiplier: 1,
            ..Default::default()
        };
        let err = gas_target(&flat, &chain).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::Config(_)));

        assert_eq!(calls(&chain.counters().gas_price), 0);
        assert_eq!(calls(&chain.counters().base_fee_per_gas), 0);
    }

    #[tokio::test]
    async fn test_configured_gas_limit() {
        let chain = MemoryProvider::new(1);
        let options = ChainOptions {
            fulfillment_gas_limit: Some(123_456),
            ..legacy(vec![])
        };
        let target = gas_target(&options, &chain).await.unwrap();
        assert_eq!(target.gas_limit, 123_456);
    }
}
