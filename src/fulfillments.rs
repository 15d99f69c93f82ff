//! Fulfillment submission.
//!
//! Every request holding a nonce gets exactly one transaction attempt per cycle:
//! - API call with a response: `fulfill`, after a dry run from the designated wallet. A dry run
//!   that reverts leaves the request errored; one where the client callback fails sends `fail`.
//! - API call that failed off chain: `fail`.
//! - Withdrawal: `fulfillWithdrawal` carrying the wallet balance minus the gas cost.
//!
//! Wallets are handled concurrently. Within a wallet, sends go out one after another in
//! discovery order. The assigned nonces only fix that order and the starting nonce: a nonce is
//! taken when a transaction is actually broadcast, so a request dropped before or at broadcast
//! hands its slot to the next one and the wallet's transactions stay gapless. A failure only
//! ever affects the request it happened on.

use alloy::primitives::{Address, B256, U256};
use alloy::signers::local::PrivateKeySigner;
use alloy::sol_types::SolCall;
use futures::future::join_all;
use std::collections::BTreeMap;
use tracing::Instrument;

use crate::chain::{
    AirnodeRrp, CoordinatorError, RrpCall, RrpProvider, TxParams, parse_expected_nonce_from_error,
};
use crate::gas;
use crate::state::ProviderState;
use crate::types::{
    ApiCall, Fulfillment, GasTarget, Request, RequestError, RequestKind, RequestStatus,
};
use crate::wallet::WalletDeriver;

/// Submits transactions for all requests with a nonce and returns the updated requests, in
/// input order. Without a gas target nothing is sent.
pub async fn submit<P: RrpProvider>(
    state: &ProviderState<P>,
    wallets: &WalletDeriver,
) -> Vec<Request> {
    let Some(gas_target) = state.gas_target else {
        tracing::warn!("no gas target, skipping submissions");
        return state.requests.clone();
    };

    let mut groups: BTreeMap<Address, Vec<usize>> = BTreeMap::new();
    for (i, request) in state.requests.iter().enumerate() {
        if request.nonce.is_some() && request.status == RequestStatus::Authorized {
            groups.entry(request.designated_wallet).or_default().push(i);
        }
    }

    let submissions = groups.into_iter().map(|(wallet, mut indices)| {
        indices.sort_by_key(|&i| state.requests[i].nonce);
        async move {
            let mut results = Vec::with_capacity(indices.len());
            let Some(mut next_nonce) = indices.first().and_then(|&i| state.requests[i].nonce) else {
                return results;
            };
            for i in indices {
                let request = &state.requests[i];
                let span = tracing::info_span!("submit", request_id = %request.id, nonce = next_nonce);
                let updated = submit_request(state, wallets, request, next_nonce, gas_target)
                    .instrument(span)
                    .await;
                let updated = if updated.status == RequestStatus::Submitted {
                    next_nonce += 1;
                    updated
                } else {
                    // Not broadcast: the nonce stays free for the next request.
                    Request { nonce: None, ..updated }
                };
                results.push((i, updated));
            }
            results
        }
        .instrument(tracing::info_span!("wallet", wallet = %wallet))
    });

    let mut requests = state.requests.clone();
    for (i, updated) in join_all(submissions).await.into_iter().flatten() {
        requests[i] = updated;
    }
    requests
}

async fn submit_request<P: RrpProvider>(
    state: &ProviderState<P>,
    wallets: &WalletDeriver,
    request: &Request,
    nonce: u64,
    gas_target: GasTarget,
) -> Request {
    let request = &request.with_nonce(nonce);
    let signer = match wallets.sponsor_wallet(request.sponsor_index) {
        Ok(signer) => signer,
        Err(e) => {
            tracing::error!(error = %e, "cannot derive designated wallet");
            return request.with_error(RequestStatus::Errored, RequestError::KeyDerivation(e.to_string()));
        }
    };

    let prepared = match &request.kind {
        RequestKind::Regular { call, .. } | RequestKind::Full { call, .. } => {
            prepare_api_call(state, request, call).await.map(|call| {
                (
                    call,
                    TxParams {
                        nonce,
                        gas_limit: gas_target.gas_limit,
                        pricing: gas_target.pricing,
                    },
                )
            })
        }
        RequestKind::Withdrawal { destination } => {
            prepare_withdrawal(state, request, *destination, nonce, gas_target).await
        }
    };
    let (call, params) = match prepared {
        Ok(prepared) => prepared,
        Err(error) => {
            tracing::warn!(%error, "request not submitted");
            return request.with_error(RequestStatus::Errored, error);
        }
    };

    send(state.provider.as_ref(), &signer, request, &call, params).await
}

fn fail_call(provider_id: B256, request: &Request, call: &ApiCall) -> RrpCall {
    RrpCall::Fail(AirnodeRrp::failCall {
        requestId: request.id,
        providerId: provider_id,
        fulfillAddress: call.fulfill_address,
        fulfillFunctionId: call.fulfill_function_id,
    })
}

/// Chooses between `fulfill` and `fail` for an API call.
async fn prepare_api_call<P: RrpProvider>(
    state: &ProviderState<P>,
    request: &Request,
    call: &ApiCall,
) -> Result<RrpCall, RequestError> {
    let provider_id = state.settings.provider_id;
    let response = match (&call.response, request.has_api_error()) {
        (Some(response), false) => response,
        _ => return Ok(fail_call(provider_id, request, call)),
    };

    let fulfill = RrpCall::Fulfill(AirnodeRrp::fulfillCall {
        requestId: request.id,
        providerId: provider_id,
        statusCode: response.status_code,
        data: response.data.clone(),
        fulfillAddress: call.fulfill_address,
        fulfillFunctionId: call.fulfill_function_id,
    });

    let data = match state.provider.simulate(request.designated_wallet, &fulfill).await {
        Ok(data) => data,
        Err(CoordinatorError::ContractCall(reason)) => {
            return Err(RequestError::SimulationReverted(reason));
        }
        Err(e) => return Err(RequestError::SubmissionFailed(e.to_string())),
    };
    let returns = AirnodeRrp::fulfillCall::abi_decode_returns(&data)
        .map_err(|e| RequestError::SimulationReverted(format!("undecodable fulfill result: {e}")))?;
    if returns.callSuccess {
        Ok(fulfill)
    } else {
        tracing::info!("client callback would fail, reporting failure instead");
        Ok(fail_call(provider_id, request, call))
    }
}

/// Builds `fulfillWithdrawal` sending everything the gas does not consume.
async fn prepare_withdrawal<P: RrpProvider>(
    state: &ProviderState<P>,
    request: &Request,
    destination: Address,
    nonce: u64,
    gas_target: GasTarget,
) -> Result<(RrpCall, TxParams), RequestError> {
    let balance = state
        .wallets
        .get(&request.designated_wallet)
        .and_then(|w| w.balance)
        .ok_or_else(|| RequestError::SubmissionFailed("wallet balance unknown".to_string()))?;

    let withdrawal = AirnodeRrp::fulfillWithdrawalCall {
        withdrawalRequestId: request.id,
        providerId: state.settings.provider_id,
        requesterIndex: request.sponsor_index,
        destination,
    };
    let probe = RrpCall::FulfillWithdrawal {
        call: withdrawal.clone(),
        value: U256::from(1),
    };
    let gas_limit = gas::withdrawal_gas_limit(state.provider.as_ref(), request.designated_wallet, &probe)
        .await
        .map_err(|e| RequestError::GasEstimationFailed(e.to_string()))?;

    let cost = U256::from(gas_limit) * U256::from(gas_target.pricing.max_price_per_gas());
    if balance <= cost {
        tracing::warn!(%balance, %cost, "balance does not cover withdrawal gas");
        return Err(RequestError::InsufficientFunds);
    }
    Ok((
        RrpCall::FulfillWithdrawal {
            call: withdrawal,
            value: balance - cost,
        },
        TxParams {
            nonce,
            gas_limit,
            pricing: gas_target.pricing,
        },
    ))
}

async fn send<P: RrpProvider>(
    provider: &P,
    signer: &PrivateKeySigner,
    request: &Request,
    call: &RrpCall,
    params: TxParams,
) -> Request {
    match provider.send(signer, call, params).await {
        Ok(transaction_hash) => {
            tracing::info!(
                method = %call.method(),
                tx_hash = %transaction_hash,
                gas_limit = params.gas_limit,
                "transaction submitted"
            );
            request.with_fulfillment(Fulfillment {
                transaction_hash,
                method: call.method(),
            })
        }
        Err(e) => {
            let message = e.to_string();
            match parse_expected_nonce_from_error(&message) {
                Some(expected_nonce) => tracing::error!(
                    method = %call.method(),
                    nonce = params.nonce,
                    expected_nonce,
                    error = %message,
                    "nonce mismatch, request retried next cycle"
                ),
                None => tracing::error!(method = %call.method(), error = %message, "submission failed"),
            }
            request.with_error(RequestStatus::Errored, RequestError::SubmissionFailed(message))
        }
    }
}
