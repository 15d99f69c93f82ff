//! Checks on discovered requests before anything is spent on them.

use alloy::primitives::{Address, B256};
use std::collections::HashSet;

use crate::chain::{full_request_id, regular_request_id};
use crate::types::{Request, RequestError, RequestKind, RequestStatus};
use crate::wallet::WalletDeriver;

/// Verifies pending requests against their contents and the provider's wallets.
///
/// - the request id must be the hash of the request's contents (API calls only),
/// - the designated wallet must be the one derived for the sponsor index,
/// - API calls of a wallet with a pending withdrawal are blocked, since the withdrawal empties
///   the wallet.
///
/// Requests failing the first two checks are ignored for good. Non-pending requests pass
/// through unchanged.
pub fn verify(requests: Vec<Request>, wallets: &WalletDeriver, provider_id: B256) -> Vec<Request> {
    let verified: Vec<Request> = requests
        .into_iter()
        .map(|request| {
            if request.status != RequestStatus::Pending {
                return Ok(request);
            }
            verify_request_id(request, provider_id).and_then(|r| verify_designated_wallet(r, wallets))
        })
        .map(|result| result.unwrap_or_else(|ignored| ignored))
        .collect();

    let withdrawing: HashSet<Address> = verified
        .iter()
        .filter(|r| r.is_withdrawal() && r.status == RequestStatus::Pending)
        .map(|r| r.designated_wallet)
        .collect();

    let requests: Vec<Request> = verified
        .into_iter()
        .map(|request| {
            if request.status == RequestStatus::Pending
                && !request.is_withdrawal()
                && withdrawing.contains(&request.designated_wallet)
            {
                tracing::info!(
                    request_id = %request.id,
                    wallet = %request.designated_wallet,
                    "wallet has a pending withdrawal, blocking request"
                );
                request.with_error(RequestStatus::Blocked, RequestError::PendingWithdrawal)
            } else {
                request
            }
        })
        .collect();

    let ignored = requests.iter().filter(|r| r.status == RequestStatus::Ignored).count();
    let pending = requests.iter().filter(|r| r.status == RequestStatus::Pending).count();
    tracing::info!(pending, ignored, "requests verified");
    requests
}

fn verify_request_id(request: Request, provider_id: B256) -> Result<Request, Request> {
    let expected = match &request.kind {
        RequestKind::Regular {
            template_id, call, ..
        } => regular_request_id(
            call.request_count,
            call.client_address,
            *template_id,
            &call.parameters,
        ),
        RequestKind::Full { endpoint_id, call } => full_request_id(
            call.request_count,
            call.client_address,
            provider_id,
            *endpoint_id,
            &call.parameters,
        ),
        RequestKind::Withdrawal { .. } => return Ok(request),
    };
    if expected == request.id {
        return Ok(request);
    }
    tracing::warn!(request_id = %request.id, %expected, "request id does not match its contents, ignoring");
    Err(request.with_error(RequestStatus::Ignored, RequestError::RequestIdMismatch))
}

fn verify_designated_wallet(request: Request, wallets: &WalletDeriver) -> Result<Request, Request> {
    match wallets.sponsor_address(request.sponsor_index) {
        Ok(expected) if expected == request.designated_wallet => Ok(request),
        Ok(expected) => {
            tracing::warn!(
                request_id = %request.id,
                %expected,
                actual = %request.designated_wallet,
                "designated wallet mismatch, ignoring"
            );
            let err = RequestError::WalletMismatch {
                expected,
                actual: request.designated_wallet,
            };
            Err(request.with_error(RequestStatus::Ignored, err))
        }
        Err(e) => {
            tracing::warn!(request_id = %request.id, sponsor_index = %request.sponsor_index, error = %e, "cannot derive sponsor wallet, ignoring");
            Err(request.with_error(RequestStatus::Ignored, RequestError::KeyDerivation(e.to_string())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::fixtures::{api_call, metadata};
    use crate::wallet::TEST_MNEMONIC;
    use alloy::primitives::U256;

    const PROVIDER_ID: B256 = B256::repeat_byte(0xaa);

    fn deriver() -> WalletDeriver {
        WalletDeriver::from_mnemonic(TEST_MNEMONIC).unwrap()
    }

    fn full(wallets: &WalletDeriver, sponsor_index: u64, block: u64) -> Request {
        let call = api_call();
        let endpoint_id = B256::repeat_byte(0xee);
        let id = full_request_id(
            call.request_count,
            call.client_address,
            PROVIDER_ID,
            endpoint_id,
            &call.parameters,
        );
        Request::new(
            id,
            U256::from(sponsor_index),
            wallets.sponsor_address(U256::from(sponsor_index)).unwrap(),
            metadata(block, 0),
            RequestKind::Full { endpoint_id, call },
        )
    }

    fn withdrawal(wallets: &WalletDeriver, sponsor_index: u64) -> Request {
        Request::new(
            B256::repeat_byte(0x77),
            U256::from(sponsor_index),
            wallets.sponsor_address(U256::from(sponsor_index)).unwrap(),
            metadata(9, 0),
            RequestKind::Withdrawal {
                destination: Address::repeat_byte(0xde),
            },
        )
    }

    #[test]
    fn test_valid_requests_stay_pending() {
        let wallets = deriver();
        let call = api_call();
        let template_id = B256::repeat_byte(0x10);
        let regular = Request::new(
            regular_request_id(call.request_count, call.client_address, template_id, &call.parameters),
            U256::from(2),
            wallets.sponsor_address(U256::from(2)).unwrap(),
            metadata(1, 1),
            RequestKind::Regular {
                template_id,
                endpoint_id: None,
                call,
            },
        );
        let requests = vec![full(&wallets, 1, 1), regular];

        let verified = verify(requests.clone(), &wallets, PROVIDER_ID);
        assert_eq!(verified, requests);
    }

    #[test]
    fn test_tampered_request_id_is_ignored() {
        let wallets = deriver();
        let mut request = full(&wallets, 1, 1);
        request.id = B256::repeat_byte(0x01);

        let verified = verify(vec![request], &wallets, PROVIDER_ID);
        assert_eq!(verified[0].status, RequestStatus::Ignored);
        assert_eq!(verified[0].error, Some(RequestError::RequestIdMismatch));
    }

    #[test]
    fn test_foreign_designated_wallet_is_ignored() {
        let wallets = deriver();
        let mut request = full(&wallets, 1, 1);
        request.designated_wallet = Address::repeat_byte(0x99);

        let verified = verify(vec![request], &wallets, PROVIDER_ID);
        assert_eq!(verified[0].status, RequestStatus::Ignored);
        assert!(matches!(
            verified[0].error,
            Some(RequestError::WalletMismatch { actual, .. }) if actual == Address::repeat_byte(0x99)
        ));
    }

    #[test]
    fn test_pending_withdrawal_blocks_api_calls_of_the_wallet() {
        let wallets = deriver();
        let requests = vec![full(&wallets, 1, 1), full(&wallets, 2, 2), withdrawal(&wallets, 1)];

        let verified = verify(requests, &wallets, PROVIDER_ID);
        assert_eq!(verified[0].status, RequestStatus::Blocked);
        assert_eq!(verified[0].error, Some(RequestError::PendingWithdrawal));
        assert_eq!(verified[1].status, RequestStatus::Pending);
        assert_eq!(verified[2].status, RequestStatus::Pending);
    }

    #[test]
    fn test_settled_requests_pass_through() {
        let wallets = deriver();
        let mut request = full(&wallets, 1, 1).with_status(RequestStatus::Fulfilled);
        request.id = B256::repeat_byte(0x01);

        let verified = verify(vec![request.clone()], &wallets, PROVIDER_ID);
        assert_eq!(verified, vec![request]);
    }
}
