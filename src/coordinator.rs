//! The coordination cycle.
//!
//! One cycle per configured chain: read the head block, discover and verify requests, resolve
//! templates, check authorization, call the APIs, and finally run the transaction pipeline. The
//! chains of a cycle run concurrently and never share state, so one chain failing leaves the
//! others untouched.

use futures::future::join_all;
use std::sync::Arc;
use tracing::Instrument;

use crate::adapter::{self, ApiCaller};
use crate::authorization;
use crate::chain::evm::EvmProvider;
use crate::chain::{CoordinatorError, RrpProvider};
use crate::config::{ChainType, CoordinatorConfig};
use crate::discovery;
use crate::from_env;
use crate::fulfillments;
use crate::gas;
use crate::nonces;
use crate::state::{ProviderSettings, ProviderState, StateUpdate};
use crate::types::{Request, RequestStatus};
use crate::verification;
use crate::wallet::WalletDeriver;

/// Request counts per status at the end of a chain cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub chain_id: u64,
    pub pending: usize,
    pub authorized: usize,
    pub blocked: usize,
    pub submitted: usize,
    pub errored: usize,
    pub fulfilled: usize,
    pub failed: usize,
    pub ignored: usize,
}

impl CycleSummary {
    pub fn from_requests(chain_id: u64, requests: &[Request]) -> Self {
        let mut summary = Self {
            chain_id,
            ..Self::default()
        };
        for request in requests {
            let counter = match request.status {
                RequestStatus::Pending => &mut summary.pending,
                RequestStatus::Authorized => &mut summary.authorized,
                RequestStatus::Blocked => &mut summary.blocked,
                RequestStatus::Submitted => &mut summary.submitted,
                RequestStatus::Errored => &mut summary.errored,
                RequestStatus::Fulfilled => &mut summary.fulfilled,
                RequestStatus::Failed => &mut summary.failed,
                RequestStatus::Ignored => &mut summary.ignored,
            };
            *counter += 1;
        }
        summary
    }

    fn log(&self) {
        tracing::info!(
            pending = self.pending,
            authorized = self.authorized,
            blocked = self.blocked,
            submitted = self.submitted,
            errored = self.errored,
            fulfilled = self.fulfilled,
            failed = self.failed,
            ignored = self.ignored,
            "cycle finished"
        );
    }
}

/// Turns the processable requests of `state` into broadcast transactions.
///
/// Refreshes the chain handle, assigns nonces, picks the gas target and submits. When no
/// request received a nonce the gas lookups are skipped entirely. A gas pricing failure is
/// logged and leaves every request unsubmitted.
pub async fn process_transactions<P: RrpProvider>(
    state: &ProviderState<P>,
    wallets: &WalletDeriver,
) -> Result<ProviderState<P>, CoordinatorError> {
    let state = state.refresh()?;
    let state = nonces::assign_nonces(&state).await;

    if !state.requests.iter().any(|r| r.nonce.is_some()) {
        tracing::info!("no processable requests");
        return Ok(state);
    }

    let gas_target = match gas::gas_target(&state.settings.options, state.provider.as_ref()).await {
        Ok(target) => target,
        Err(e) => {
            tracing::error!(error = %e, "unable to price gas, skipping submissions");
            return Ok(state);
        }
    };
    let state = state.update(StateUpdate::default().gas_target(gas_target));

    let requests = fulfillments::submit(&state, wallets).await;
    Ok(state.update(StateUpdate::default().requests(requests)))
}

/// Runs a full cycle on one chain and returns its final state.
pub async fn run_chain_cycle<P: RrpProvider>(
    state: ProviderState<P>,
    wallets: &WalletDeriver,
    api: &dyn ApiCaller,
) -> Result<ProviderState<P>, CoordinatorError> {
    let span = tracing::info_span!(
        "chain_cycle",
        coordinator_id = %state.coordinator_id,
        provider = %state.settings.name,
        chain_id = state.settings.chain_id,
    );
    async move {
        let current_block = state.provider.block_number().await?;
        let state = state.update(StateUpdate::default().current_block(current_block));

        let requests = discovery::discover(&state).await?;
        let requests = verification::verify(requests, wallets, state.settings.provider_id);
        let requests = discovery::apply_templates(&state, requests).await;
        let state = state.update(StateUpdate::default().requests(requests));

        let requests = authorization::authorize(&state).await;
        let state = state.update(StateUpdate::default().requests(requests));

        let requests = adapter::call_apis(&state, api).await;
        let state = state.update(StateUpdate::default().requests(requests));

        let state = process_transactions(&state, wallets).await?;
        CycleSummary::from_requests(state.settings.chain_id, &state.requests).log();
        Ok(state)
    }
    .instrument(span)
    .await
}

/// Runs one cycle per chain concurrently. Results follow the input order.
pub async fn run_chains<P: RrpProvider>(
    states: Vec<ProviderState<P>>,
    wallets: &WalletDeriver,
    api: &dyn ApiCaller,
) -> Vec<Result<ProviderState<P>, CoordinatorError>> {
    let cycles = states.into_iter().map(|state| {
        let label = state.label();
        async move {
            let result = run_chain_cycle(state, wallets, api).await;
            if let Err(e) = &result {
                tracing::error!(chain = %label, error = %e, transient = e.is_transient(), "chain cycle aborted");
            }
            result
        }
    });
    join_all(cycles).await
}

/// Runs one coordination cycle across every configured chain.
///
/// A chain whose provider cannot be built is reported and skipped.
pub async fn start_coordinator(
    config: &CoordinatorConfig,
    wallets: &WalletDeriver,
    api: &dyn ApiCaller,
) -> Vec<Result<CycleSummary, CoordinatorError>> {
    let mut states = Vec::with_capacity(config.chains.len());
    let mut results = Vec::new();
    for chain in &config.chains {
        let settings = Arc::new(ProviderSettings::from_chain(chain, &config.logging));
        let provider = match chain.chain_type {
            ChainType::Evm => from_env::rpc_url(chain)
                .and_then(|url| EvmProvider::try_new(&settings, url, &config.transaction)),
        };
        match provider {
            Ok(provider) => states.push(ProviderState::new(settings, Arc::new(provider))),
            Err(e) => {
                tracing::error!(chain = %chain.name, chain_id = chain.id, error = %e, "unable to initialize chain");
                results.push(Err(e));
            }
        }
    }

    tracing::info!(chains = states.len(), "coordinator cycle started");
    results.extend(run_chains(states, wallets, api).await.into_iter().map(|result| {
        result.map(|state| CycleSummary::from_requests(state.settings.chain_id, &state.requests))
    }));
    results
}
