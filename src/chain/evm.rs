//! JSON-RPC implementation of [`RrpProvider`].
//!
//! - **Reads** (logs, templates, authorization, counts, prices) go through a plain alloy
//!   [`RootProvider`]; no filler stack, since the coordinator picks nonce, gas and fees itself.
//! - **Writes** are signed locally with the sponsor wallet and broadcast as raw envelopes. The
//!   provider does not wait for receipts; the next cycle sees the outcome in the logs.
//!
//! Every RPC error is mapped through [`categorize_transport_error`] so that reverts carry their
//! decoded reason and connection problems are reported as transient.

use alloy::network::{Ethereum, EthereumWallet, TransactionBuilder};
use alloy::primitives::{Address, B256, Bytes, TxHash, U256};
use alloy::providers::{Provider, RootProvider};
use alloy::rpc::client::RpcClient;
use alloy::rpc::types::{BlockNumberOrTag, Filter, Log, TransactionRequest};
use alloy::signers::local::PrivateKeySigner;
use alloy::sol_types::{SolCall, SolEvent};
use alloy::transports::http::Http;
use alloy::transports::http::reqwest;
use alloy::transports::layers::RetryBackoffLayer;
use async_trait::async_trait;
use std::time::Duration;
use tracing::Instrument;
use url::Url;

use crate::chain::{
    AirnodeRrp, AuthorizationQuery, CoordinatorError, RrpCall, RrpEvent, RrpLog, RrpProvider,
    Template, TxParams, categorize_transport_error,
};
use crate::config::TransactionConfig;
use crate::state::ProviderSettings;
use crate::types::{GasPricing, LogMetadata};

/// [`RrpProvider`] over an HTTP JSON-RPC endpoint.
#[derive(Debug, Clone)]
pub struct EvmProvider {
    inner: RootProvider<Ethereum>,
    /// RRP contract all calls and log queries target.
    contract: Address,
    chain_id: u64,
    rpc_url: Url,
    transaction: TransactionConfig,
}

impl EvmProvider {
    /// Builds the provider for one configured chain. No request is made.
    pub fn try_new(
        settings: &ProviderSettings,
        rpc_url: Url,
        transaction: &TransactionConfig,
    ) -> Result<Self, CoordinatorError> {
        let inner = connect(&rpc_url, transaction)?;
        tracing::debug!(
            chain = %settings.name,
            chain_id = settings.chain_id,
            contract = %settings.contract,
            rpc = %rpc_url,
            "initialized provider"
        );
        Ok(Self {
            inner,
            contract: settings.contract,
            chain_id: settings.chain_id,
            rpc_url,
            transaction: transaction.clone(),
        })
    }

    pub fn inner(&self) -> &RootProvider<Ethereum> {
        &self.inner
    }

    async fn eth_call(
        &self,
        from: Option<Address>,
        input: Bytes,
        value: U256,
        context: &str,
    ) -> Result<Bytes, CoordinatorError> {
        let mut tx = TransactionRequest::default()
            .with_to(self.contract)
            .with_input(input)
            .with_value(value);
        if let Some(from) = from {
            tx = tx.with_from(from);
        }
        self.inner
            .call(tx)
            .await
            .map_err(|e| categorize_transport_error(e, context))
    }
}

/// HTTP client with the configured timeouts and pool limits, wrapped in the retry layer.
fn connect(
    rpc_url: &Url,
    transaction: &TransactionConfig,
) -> Result<RootProvider<Ethereum>, CoordinatorError> {
    let http_client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(transaction.connection_timeout_seconds))
        .timeout(transaction.rpc_timeout())
        .pool_idle_timeout(Duration::from_secs(transaction.pool_idle_timeout_seconds))
        .pool_max_idle_per_host(transaction.pool_max_idle_per_host)
        .build()
        .map_err(|e| {
            CoordinatorError::Config(format!("failed to build HTTP client for {rpc_url}: {e}"))
        })?;
    let transport = Http::with_client(http_client, rpc_url.clone());

    let client = if transaction.rpc_max_retries > 0 {
        RpcClient::builder()
            .layer(RetryBackoffLayer::new(
                transaction.rpc_max_retries,
                transaction.rpc_initial_backoff_ms,
                transaction.rpc_compute_units_per_second,
            ))
            .transport(transport, false)
    } else {
        RpcClient::new(transport, false)
    };
    Ok(RootProvider::<Ethereum>::new(client))
}

/// Log filter selecting every RRP event of `provider_id` in the block range.
pub(crate) fn request_filter(
    contract: Address,
    provider_id: B256,
    from_block: u64,
    to_block: u64,
) -> Filter {
    Filter::new()
        .address(contract)
        .from_block(from_block)
        .to_block(to_block)
        .event_signature(vec![
            AirnodeRrp::ClientRequestCreated::SIGNATURE_HASH,
            AirnodeRrp::ClientFullRequestCreated::SIGNATURE_HASH,
            AirnodeRrp::ClientRequestFulfilled::SIGNATURE_HASH,
            AirnodeRrp::ClientRequestFailed::SIGNATURE_HASH,
            AirnodeRrp::WithdrawalRequested::SIGNATURE_HASH,
            AirnodeRrp::WithdrawalFulfilled::SIGNATURE_HASH,
        ])
        .topic1(provider_id)
}

fn decode_event<E: SolEvent>(log: &Log) -> Result<E, CoordinatorError> {
    log.log_decode::<E>()
        .map(|decoded| decoded.inner.data)
        .map_err(|e| CoordinatorError::Decoding(format!("{}: {e}", E::SIGNATURE)))
}

/// Decodes an RRP log. Logs of other events yield `None`.
pub(crate) fn decode_log(log: &Log) -> Result<Option<RrpLog>, CoordinatorError> {
    let metadata = LogMetadata {
        block_number: log
            .block_number
            .ok_or_else(|| CoordinatorError::Decoding("log without block number".to_string()))?,
        log_index: log
            .log_index
            .ok_or_else(|| CoordinatorError::Decoding("log without log index".to_string()))?,
        transaction_hash: log.transaction_hash.unwrap_or_default(),
    };
    let Some(topic0) = log.topics().first().copied() else {
        return Ok(None);
    };
    let event = if topic0 == AirnodeRrp::ClientRequestCreated::SIGNATURE_HASH {
        RrpEvent::RequestCreated(decode_event(log)?)
    } else if topic0 == AirnodeRrp::ClientFullRequestCreated::SIGNATURE_HASH {
        RrpEvent::FullRequestCreated(decode_event(log)?)
    } else if topic0 == AirnodeRrp::ClientRequestFulfilled::SIGNATURE_HASH {
        RrpEvent::RequestFulfilled(decode_event(log)?)
    } else if topic0 == AirnodeRrp::ClientRequestFailed::SIGNATURE_HASH {
        RrpEvent::RequestFailed(decode_event(log)?)
    } else if topic0 == AirnodeRrp::WithdrawalRequested::SIGNATURE_HASH {
        RrpEvent::WithdrawalRequested(decode_event(log)?)
    } else if topic0 == AirnodeRrp::WithdrawalFulfilled::SIGNATURE_HASH {
        RrpEvent::WithdrawalFulfilled(decode_event(log)?)
    } else {
        return Ok(None);
    };
    Ok(Some(RrpLog { metadata, event }))
}

/// Unsigned transaction for `call` with the coordinator-chosen parameters.
pub(crate) fn transaction_request(
    contract: Address,
    chain_id: u64,
    from: Address,
    call: &RrpCall,
    params: TxParams,
) -> TransactionRequest {
    let tx = TransactionRequest::default()
        .with_from(from)
        .with_to(contract)
        .with_input(call.calldata())
        .with_value(call.value())
        .with_nonce(params.nonce)
        .with_gas_limit(params.gas_limit)
        .with_chain_id(chain_id);
    match params.pricing {
        GasPricing::Legacy { gas_price } => tx.with_gas_price(gas_price),
        GasPricing::Eip1559 {
            max_fee_per_gas,
            max_priority_fee_per_gas,
        } => tx
            .with_max_fee_per_gas(max_fee_per_gas)
            .with_max_priority_fee_per_gas(max_priority_fee_per_gas),
    }
}

#[async_trait]
impl RrpProvider for EvmProvider {
    fn reconnect(&self) -> Result<Self, CoordinatorError> {
        Ok(Self {
            inner: connect(&self.rpc_url, &self.transaction)?,
            ..self.clone()
        })
    }

    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn block_number(&self) -> Result<u64, CoordinatorError> {
        self.inner
            .get_block_number()
            .await
            .map_err(|e| categorize_transport_error(e, "get_block_number"))
    }

    async fn request_logs(
        &self,
        provider_id: B256,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RrpLog>, CoordinatorError> {
        let filter = request_filter(self.contract, provider_id, from_block, to_block);
        let logs = self
            .inner
            .get_logs(&filter)
            .instrument(tracing::info_span!("get_logs", from_block, to_block))
            .await
            .map_err(|e| categorize_transport_error(e, "get_logs"))?;

        let mut decoded = Vec::with_capacity(logs.len());
        for log in &logs {
            match decode_log(log) {
                Ok(Some(rrp_log)) => decoded.push(rrp_log),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(tx = ?log.transaction_hash, error = %e, "skipping undecodable log");
                }
            }
        }
        decoded.sort_by_key(|l| l.metadata.ordering_key());
        Ok(decoded)
    }

    async fn template(&self, template_id: B256) -> Result<Option<Template>, CoordinatorError> {
        let input = AirnodeRrp::getTemplateCall {
            templateId: template_id,
        }
        .abi_encode();
        let data = self.eth_call(None, input.into(), U256::ZERO, "getTemplate").await?;
        let t = AirnodeRrp::getTemplateCall::abi_decode_returns(&data)
            .map_err(|e| CoordinatorError::Decoding(format!("getTemplate: {e}")))?;
        // Unset storage reads back as zeros.
        if t.providerId == B256::ZERO {
            return Ok(None);
        }
        Ok(Some(Template {
            provider_id: t.providerId,
            endpoint_id: t.endpointId,
            requester_index: t.requesterIndex,
            designated_wallet: t.designatedWallet,
            fulfill_address: t.fulfillAddress,
            fulfill_function_id: t.fulfillFunctionId,
            parameters: t.parameters,
        }))
    }

    async fn check_authorization(
        &self,
        query: &AuthorizationQuery,
    ) -> Result<bool, CoordinatorError> {
        let input = AirnodeRrp::checkAuthorizationStatusCall {
            providerId: query.provider_id,
            requestId: query.request_id,
            endpointId: query.endpoint_id,
            requesterIndex: query.requester_index,
            designatedWallet: query.designated_wallet,
            clientAddress: query.client_address,
        }
        .abi_encode();
        let data = self
            .eth_call(None, input.into(), U256::ZERO, "checkAuthorizationStatus")
            .await?;
        AirnodeRrp::checkAuthorizationStatusCall::abi_decode_returns(&data)
            .map_err(|e| CoordinatorError::Decoding(format!("checkAuthorizationStatus: {e}")))
    }

    async fn transaction_count(&self, address: Address) -> Result<u64, CoordinatorError> {
        self.inner
            .get_transaction_count(address)
            .latest()
            .await
            .map_err(|e| categorize_transport_error(e, "get_transaction_count"))
    }

    async fn balance(&self, address: Address) -> Result<U256, CoordinatorError> {
        self.inner
            .get_balance(address)
            .await
            .map_err(|e| categorize_transport_error(e, "get_balance"))
    }

    async fn gas_price(&self) -> Result<u128, CoordinatorError> {
        self.inner
            .get_gas_price()
            .await
            .map_err(|e| categorize_transport_error(e, "get_gas_price"))
    }

    async fn base_fee_per_gas(&self) -> Result<u128, CoordinatorError> {
        let block = self
            .inner
            .get_block_by_number(BlockNumberOrTag::Latest)
            .await
            .map_err(|e| categorize_transport_error(e, "get_block_by_number"))?
            .ok_or_else(|| CoordinatorError::RpcProviderError("latest block not found".to_string()))?;
        block
            .header
            .base_fee_per_gas
            .map(u128::from)
            .ok_or_else(|| CoordinatorError::GasPricing("latest block carries no base fee".to_string()))
    }

    async fn simulate(&self, from: Address, call: &RrpCall) -> Result<Bytes, CoordinatorError> {
        let context = format!("simulate {}", call.method());
        self.eth_call(Some(from), call.calldata(), call.value(), &context)
            .await
    }

    async fn estimate_gas(&self, from: Address, call: &RrpCall) -> Result<u64, CoordinatorError> {
        let tx = TransactionRequest::default()
            .with_from(from)
            .with_to(self.contract)
            .with_input(call.calldata())
            .with_value(call.value());
        self.inner
            .estimate_gas(tx)
            .await
            .map_err(|e| categorize_transport_error(e, "estimate_gas"))
    }

    async fn send(
        &self,
        signer: &PrivateKeySigner,
        call: &RrpCall,
        params: TxParams,
    ) -> Result<TxHash, CoordinatorError> {
        let tx = transaction_request(self.contract, self.chain_id, signer.address(), call, params);
        let wallet = EthereumWallet::from(signer.clone());
        let envelope = tx
            .build(&wallet)
            .await
            .map_err(|e| CoordinatorError::KeyMaterial(format!("failed to sign transaction: {e}")))?;
        let pending = self
            .inner
            .send_tx_envelope(envelope)
            .instrument(tracing::info_span!("send_raw_transaction", nonce = params.nonce))
            .await
            .map_err(|e| categorize_transport_error(e, "send_raw_transaction"))?;
        Ok(*pending.tx_hash())
    }
}
