//! Per-wallet nonce assignment.
//!
//! Each designated wallet's transaction count is read once per cycle. Its processable requests
//! are then ordered by discovery position and receive `count, count + 1, ...`, so that a later
//! request never gets a lower nonce than an earlier one from the same wallet.

use alloy::primitives::Address;
use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet};
use tracing::Instrument;

use crate::chain::RrpProvider;
use crate::state::{ProviderState, StateUpdate, WalletSnapshot};
use crate::types::Request;

/// Reads the snapshot of every wallet that has a processable request.
///
/// Lookups run concurrently. A wallet whose lookup fails is left out and its requests get no
/// nonce this cycle; other wallets are unaffected.
pub async fn fetch_wallet_snapshots<P: RrpProvider>(
    state: &ProviderState<P>,
) -> BTreeMap<Address, WalletSnapshot> {
    let mut wallets: BTreeMap<Address, bool> = BTreeMap::new();
    for request in state.requests.iter().filter(|r| r.is_processable()) {
        let needs_balance = wallets.entry(request.designated_wallet).or_default();
        *needs_balance |= request.is_withdrawal();
    }

    let provider = &state.provider;
    let lookups = wallets.into_iter().map(|(address, needs_balance)| {
        async move {
            let transaction_count = match provider.transaction_count(address).await {
                Ok(count) => count,
                Err(e) => {
                    tracing::warn!(wallet = %address, error = %e, "transaction count unavailable, skipping wallet");
                    return None;
                }
            };
            let balance = if needs_balance {
                match provider.balance(address).await {
                    Ok(balance) => Some(balance),
                    Err(e) => {
                        tracing::warn!(wallet = %address, error = %e, "balance unavailable, skipping wallet");
                        return None;
                    }
                }
            } else {
                None
            };
            Some((
                address,
                WalletSnapshot {
                    transaction_count,
                    balance,
                },
            ))
        }
        .instrument(tracing::debug_span!("wallet_snapshot", wallet = %address))
    });

    join_all(lookups).await.into_iter().flatten().collect()
}

/// Assigns nonces to processable requests of wallets present in `wallets`.
///
/// Pure: the same inputs always give the same output. Requests that are not processable, or
/// whose wallet has no snapshot, are returned unchanged and without nonce. Output order follows
/// input order.
pub fn assign(requests: &[Request], wallets: &BTreeMap<Address, WalletSnapshot>) -> Vec<Request> {
    let mut by_wallet: BTreeMap<Address, Vec<usize>> = BTreeMap::new();
    for (i, request) in requests.iter().enumerate() {
        if request.is_processable() && wallets.contains_key(&request.designated_wallet) {
            by_wallet.entry(request.designated_wallet).or_default().push(i);
        }
    }

    let mut nonces: BTreeMap<usize, u64> = BTreeMap::new();
    for (wallet, mut indices) in by_wallet {
        let base = wallets[&wallet].transaction_count;
        indices.sort_by_key(|&i| requests[i].metadata.ordering_key());
        for (offset, i) in indices.into_iter().enumerate() {
            nonces.insert(i, base + offset as u64);
        }
    }

    requests
        .iter()
        .enumerate()
        .map(|(i, request)| match nonces.get(&i) {
            Some(&nonce) => request.with_nonce(nonce),
            None => Request {
                nonce: None,
                ..request.clone()
            },
        })
        .collect()
}

/// Fetches wallet snapshots and returns the state with nonces assigned.
pub async fn assign_nonces<P: RrpProvider>(state: &ProviderState<P>) -> ProviderState<P> {
    let wallets = fetch_wallet_snapshots(state).await;
    let requests = assign(&state.requests, &wallets);

    let assigned: BTreeSet<Address> = requests
        .iter()
        .filter(|r| r.nonce.is_some())
        .map(|r| r.designated_wallet)
        .collect();
    for wallet in &assigned {
        let nonces: Vec<u64> = requests
            .iter()
            .filter(|r| r.designated_wallet == *wallet)
            .filter_map(|r| r.nonce)
            .collect();
        tracing::info!(wallet = %wallet, ?nonces, "nonces assigned");
    }

    state.update(StateUpdate::default().wallets(wallets).requests(requests))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::memory::{MemoryProvider, calls};
    use crate::state::fixtures::settings;
    use crate::types::fixtures::{full_request, response};
    use crate::types::{RequestKind, RequestStatus};
    use alloy::primitives::{B256, U256};
    use std::sync::Arc;

    fn ready(id: u8, wallet: Address, block: u64, log_index: u64) -> Request {
        full_request(id, wallet, block, log_index)
            .with_status(RequestStatus::Authorized)
            .with_response(response())
    }

    fn snapshot(count: u64) -> WalletSnapshot {
        WalletSnapshot {
            transaction_count: count,
            balance: None,
        }
    }

    #[test]
    fn test_contiguous_nonces_in_discovery_order() {
        let wallet = Address::repeat_byte(1);
        // Input order deliberately differs from discovery order.
        let requests = vec![
            ready(3, wallet, 12, 0),
            ready(1, wallet, 10, 4),
            ready(2, wallet, 10, 9),
        ];
        let wallets = BTreeMap::from([(wallet, snapshot(212))]);

        let assigned = assign(&requests, &wallets);
        let nonces: Vec<_> = assigned.iter().map(|r| r.nonce).collect();
        assert_eq!(nonces, vec![Some(214), Some(212), Some(213)]);
    }

    #[test]
    fn test_wallets_are_numbered_independently() {
        let a = Address::repeat_byte(1);
        let b = Address::repeat_byte(2);
        let requests = vec![ready(1, a, 1, 0), ready(2, b, 1, 1), ready(3, a, 2, 0)];
        let wallets = BTreeMap::from([(a, snapshot(5)), (b, snapshot(0))]);

        let assigned = assign(&requests, &wallets);
        assert_eq!(assigned[0].nonce, Some(5));
        assert_eq!(assigned[1].nonce, Some(0));
        assert_eq!(assigned[2].nonce, Some(6));
    }

    #[test]
    fn test_unprocessable_requests_get_no_nonce() {
        let wallet = Address::repeat_byte(1);
        let requests = vec![
            ready(1, wallet, 1, 0).with_status(RequestStatus::Blocked),
            full_request(2, wallet, 1, 1).with_status(RequestStatus::Authorized),
            ready(3, wallet, 1, 2).with_status(RequestStatus::Fulfilled),
            ready(4, wallet, 1, 3),
        ];
        let wallets = BTreeMap::from([(wallet, snapshot(9))]);

        let assigned = assign(&requests, &wallets);
        assert_eq!(
            assigned.iter().map(|r| r.nonce).collect::<Vec<_>>(),
            vec![None, None, None, Some(9)]
        );
    }

    #[test]
    fn test_wallet_without_snapshot_is_skipped() {
        let requests = vec![ready(1, Address::repeat_byte(1), 1, 0)];
        let assigned = assign(&requests, &BTreeMap::new());
        assert_eq!(assigned[0].nonce, None);
    }

    #[test]
    fn test_assign_is_deterministic() {
        let wallet = Address::repeat_byte(1);
        let requests = vec![ready(1, wallet, 3, 0), ready(2, wallet, 1, 0)];
        let wallets = BTreeMap::from([(wallet, snapshot(1))]);
        assert_eq!(assign(&requests, &wallets), assign(&requests, &wallets));
    }

    #[tokio::test]
    async fn test_failed_lookup_skips_only_that_wallet() {
        let chain = Arc::new(MemoryProvider::new(31337));
        let healthy = Address::repeat_byte(1);
        let broken = Address::repeat_byte(2);
        chain.set_transaction_count(healthy, 3).await;
        chain.fail_transaction_count(broken).await;

        let state = ProviderState::new(Arc::new(settings()), chain.clone()).update(
            StateUpdate::default().requests(vec![ready(1, healthy, 1, 0), ready(2, broken, 1, 1)]),
        );
        let next = assign_nonces(&state).await;

        assert_eq!(next.requests[0].nonce, Some(3));
        assert_eq!(next.requests[1].nonce, None);
        assert_eq!(next.wallets.len(), 1);
        assert_eq!(calls(&chain.counters().balance), 0);
    }

    #[tokio::test]
    async fn test_balance_fetched_only_for_withdrawals() {
        let chain = Arc::new(MemoryProvider::new(31337));
        let api_wallet = Address::repeat_byte(1);
        let withdrawal_wallet = Address::repeat_byte(2);
        chain.set_balance(withdrawal_wallet, U256::from(10u64.pow(18))).await;

        let withdrawal = Request::new(
            B256::repeat_byte(9),
            U256::from(2),
            withdrawal_wallet,
            crate::types::fixtures::metadata(1, 5),
            RequestKind::Withdrawal {
                destination: Address::repeat_byte(0xde),
            },
        )
        .with_status(RequestStatus::Authorized);

        let state = ProviderState::new(Arc::new(settings()), chain.clone()).update(
            StateUpdate::default().requests(vec![ready(1, api_wallet, 1, 0), withdrawal]),
        );
        let next = assign_nonces(&state).await;

        assert_eq!(calls(&chain.counters().transaction_count), 2);
        assert_eq!(calls(&chain.counters().balance), 1);
        assert_eq!(next.wallets[&api_wallet].balance, None);
        assert_eq!(
            next.wallets[&withdrawal_wallet].balance,
            Some(U256::from(10u64.pow(18)))
        );
    }

    #[tokio::test]
    async fn test_no_processable_requests_means_no_lookups() {
        let chain = Arc::new(MemoryProvider::new(31337));
        let state = ProviderState::new(Arc::new(settings()), chain.clone()).update(
            StateUpdate::default().requests(vec![full_request(1, Address::repeat_byte(1), 1, 0)]),
        );
        let next = assign_nonces(&state).await;

        assert!(next.wallets.is_empty());
        assert_eq!(calls(&chain.counters().transaction_count), 0);
        assert_eq!(calls(&chain.counters().balance), 0);
    }
}
