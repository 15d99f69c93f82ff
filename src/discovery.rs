//! Request discovery from contract logs.
//!
//! The scanned window ends `min_confirmations` blocks below the head and reaches back
//! `block_history_limit` blocks. Requests whose fulfillment or failure event falls inside the
//! same window are reported as settled so they are never processed twice.

use alloy::primitives::B256;
use futures::future::join_all;
use std::collections::{BTreeSet, HashMap};

use crate::chain::{CoordinatorError, RrpEvent, RrpLog, RrpProvider, Template};
use crate::state::ProviderState;
use crate::types::{ApiCall, Request, RequestError, RequestKind, RequestStatus};

/// Inclusive block range scanned at `current_block`.
pub fn block_window(current_block: u64, history_limit: u64, min_confirmations: u64) -> Option<(u64, u64)> {
    let to_block = current_block.checked_sub(min_confirmations)?;
    let from_block = current_block.saturating_sub(history_limit);
    (from_block <= to_block).then_some((from_block, to_block))
}

/// Turns a window of logs into request records, in log order.
pub fn requests_from_logs(logs: &[RrpLog]) -> Vec<Request> {
    let mut requests = Vec::new();
    let mut settled: HashMap<B256, RequestStatus> = HashMap::new();

    for log in logs {
        match &log.event {
            RrpEvent::RequestCreated(e) => requests.push(Request::new(
                e.requestId,
                e.requesterIndex,
                e.designatedWallet,
                log.metadata,
                RequestKind::Regular {
                    template_id: e.templateId,
                    endpoint_id: None,
                    call: ApiCall {
                        client_address: e.clientAddress,
                        request_count: e.noRequests,
                        fulfill_address: e.fulfillAddress,
                        fulfill_function_id: e.fulfillFunctionId,
                        parameters: e.parameters.clone(),
                        template_parameters: None,
                        response: None,
                    },
                },
            )),
            RrpEvent::FullRequestCreated(e) => requests.push(Request::new(
                e.requestId,
                e.requesterIndex,
                e.designatedWallet,
                log.metadata,
                RequestKind::Full {
                    endpoint_id: e.endpointId,
                    call: ApiCall {
                        client_address: e.clientAddress,
                        request_count: e.noRequests,
                        fulfill_address: e.fulfillAddress,
                        fulfill_function_id: e.fulfillFunctionId,
                        parameters: e.parameters.clone(),
                        template_parameters: None,
                        response: None,
                    },
                },
            )),
            RrpEvent::WithdrawalRequested(e) => requests.push(Request::new(
                e.withdrawalRequestId,
                e.requesterIndex,
                e.designatedWallet,
                log.metadata,
                RequestKind::Withdrawal {
                    destination: e.destination,
                },
            )),
            RrpEvent::RequestFulfilled(e) => {
                settled.insert(e.requestId, RequestStatus::Fulfilled);
            }
            RrpEvent::RequestFailed(e) => {
                settled.insert(e.requestId, RequestStatus::Failed);
            }
            RrpEvent::WithdrawalFulfilled(e) => {
                settled.insert(e.withdrawalRequestId, RequestStatus::Fulfilled);
            }
        }
    }

    requests
        .into_iter()
        .map(|request| match settled.get(&request.id) {
            Some(status) => request.with_status(*status),
            None => request,
        })
        .collect()
}

/// Reads the request window ending at `state.current_block`.
pub async fn discover<P: RrpProvider>(state: &ProviderState<P>) -> Result<Vec<Request>, CoordinatorError> {
    let settings = &state.settings;
    let current_block = state
        .current_block
        .ok_or_else(|| CoordinatorError::Config("current block not initialized".to_string()))?;
    let Some((from_block, to_block)) =
        block_window(current_block, settings.block_history_limit, settings.min_confirmations)
    else {
        tracing::info!(current_block, "chain shorter than confirmation depth, nothing to scan");
        return Ok(Vec::new());
    };

    let logs = state
        .provider
        .request_logs(settings.provider_id, from_block, to_block)
        .await?;
    let requests = requests_from_logs(&logs);

    let pending = requests.iter().filter(|r| r.status == RequestStatus::Pending).count();
    tracing::info!(
        from_block,
        to_block,
        logs = logs.len(),
        requests = requests.len(),
        pending,
        "requests discovered"
    );
    Ok(requests)
}

/// Resolves the templates of pending regular requests.
///
/// Missing templates make the request ignored. A template that cannot be fetched leaves the
/// request pending without endpoint, which keeps it out of this cycle.
pub async fn apply_templates<P: RrpProvider>(
    state: &ProviderState<P>,
    requests: Vec<Request>,
) -> Vec<Request> {
    let template_ids: BTreeSet<B256> = requests
        .iter()
        .filter(|r| r.status == RequestStatus::Pending)
        .filter_map(|r| match &r.kind {
            RequestKind::Regular { template_id, .. } => Some(*template_id),
            _ => None,
        })
        .collect();
    if template_ids.is_empty() {
        return requests;
    }

    let provider = &state.provider;
    let fetched = join_all(template_ids.into_iter().map(|id| async move {
        (id, provider.template(id).await)
    }))
    .await;
    let templates: HashMap<B256, Result<Option<Template>, CoordinatorError>> =
        fetched.into_iter().collect();

    requests
        .into_iter()
        .map(|request| {
            let RequestKind::Regular { template_id, .. } = &request.kind else {
                return request;
            };
            if request.status != RequestStatus::Pending {
                return request;
            }
            match templates.get(template_id) {
                Some(Ok(Some(template))) => {
                    request.with_template(template.endpoint_id, template.parameters.clone())
                }
                Some(Ok(None)) => {
                    tracing::warn!(request_id = %request.id, %template_id, "template not found, ignoring request");
                    request.with_error(
                        RequestStatus::Ignored,
                        RequestError::TemplateNotFound(*template_id),
                    )
                }
                Some(Err(e)) => {
                    tracing::warn!(request_id = %request.id, %template_id, error = %e, "template fetch failed");
                    request
                }
                None => request,
            }
        })
        .collect()
}
