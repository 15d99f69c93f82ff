//! Authorization status of pending requests, read from the contract.

use futures::future::join_all;
use tracing::Instrument;

use crate::chain::{AuthorizationQuery, RrpProvider};
use crate::state::ProviderState;
use crate::types::{Request, RequestStatus};

fn query<P>(state: &ProviderState<P>, request: &Request) -> Option<AuthorizationQuery> {
    let call = request.api_call()?;
    Some(AuthorizationQuery {
        provider_id: state.settings.provider_id,
        request_id: request.id,
        endpoint_id: request.endpoint_id()?,
        requester_index: request.sponsor_index,
        designated_wallet: request.designated_wallet,
        client_address: call.client_address,
    })
}

/// Resolves every pending request to `Authorized` or `Blocked`.
///
/// Withdrawals need no authorization. API calls without a resolved endpoint, or whose check
/// fails, stay pending and are not processed this cycle.
pub async fn authorize<P: RrpProvider>(state: &ProviderState<P>) -> Vec<Request> {
    let provider = &state.provider;
    let checks = state.requests.iter().map(|request| async move {
        if request.status != RequestStatus::Pending {
            return request.clone();
        }
        if request.is_withdrawal() {
            return request.with_status(RequestStatus::Authorized);
        }
        let Some(query) = query(state, request) else {
            tracing::debug!(request_id = %request.id, "endpoint unresolved, skipping authorization");
            return request.clone();
        };
        match provider
            .check_authorization(&query)
            .instrument(tracing::debug_span!("check_authorization", request_id = %request.id))
            .await
        {
            Ok(true) => request.with_status(RequestStatus::Authorized),
            Ok(false) => {
                tracing::info!(request_id = %request.id, client = %query.client_address, "request not authorized");
                request.with_status(RequestStatus::Blocked)
            }
            Err(e) => {
                tracing::warn!(request_id = %request.id, error = %e, "authorization check failed");
                request.clone()
            }
        }
    });
    let requests = join_all(checks).await;

    let authorized = requests.iter().filter(|r| r.status == RequestStatus::Authorized).count();
    let blocked = requests.iter().filter(|r| r.status == RequestStatus::Blocked).count();
    tracing::info!(authorized, blocked, "requests authorized");
    requests
}
