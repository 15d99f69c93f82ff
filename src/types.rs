//! Request records and gas targets shared across the coordination pipeline.
//!
//! Every request carries a common header (id, sponsor index, designated wallet, log position,
//! status, nonce, error, fulfillment) plus a [`RequestKind`] payload. Pipeline stages never
//! mutate a request in place: the `with_*` helpers return a modified copy.

use alloy::primitives::{Address, B256, Bytes, FixedBytes, TxHash, U256};
use serde::Serialize;
use std::fmt;

/// Position of the event that created a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LogMetadata {
    pub block_number: u64,
    pub log_index: u64,
    pub transaction_hash: TxHash,
}

impl LogMetadata {
    /// Discovery order. Nonces are handed out following this key.
    pub fn ordering_key(&self) -> (u64, u64) {
        (self.block_number, self.log_index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RequestStatus {
    /// Discovered, not yet authorized.
    Pending,
    Authorized,
    /// Not authorized, or held back for this cycle.
    Blocked,
    /// A transaction for this request was broadcast in this cycle.
    Submitted,
    /// Building or broadcasting the transaction failed.
    Errored,
    /// Already fulfilled on chain.
    Fulfilled,
    /// Already failed on chain.
    Failed,
    /// Rejected by verification; never processed.
    Ignored,
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Authorized => "authorized",
            RequestStatus::Blocked => "blocked",
            RequestStatus::Submitted => "submitted",
            RequestStatus::Errored => "errored",
            RequestStatus::Fulfilled => "fulfilled",
            RequestStatus::Failed => "failed",
            RequestStatus::Ignored => "ignored",
        };
        f.write_str(s)
    }
}

/// Per-request failure marker. Stored on the request, never propagated.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("template {0} not found")]
    TemplateNotFound(B256),
    #[error("designated wallet mismatch: expected {expected}, got {actual}")]
    WalletMismatch { expected: Address, actual: Address },
    #[error("request id does not match request contents")]
    RequestIdMismatch,
    #[error("designated wallet has a pending withdrawal")]
    PendingWithdrawal,
    #[error("API call failed: {0}")]
    ApiCallFailed(String),
    #[error("fulfillment simulation reverted: {0}")]
    SimulationReverted(String),
    #[error("gas estimation failed: {0}")]
    GasEstimationFailed(String),
    #[error("insufficient funds to cover withdrawal gas")]
    InsufficientFunds,
    #[error("transaction submission failed: {0}")]
    SubmissionFailed(String),
    #[error("wallet derivation failed: {0}")]
    KeyDerivation(String),
}

/// Data returned by the external API for one call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiResponse {
    pub status_code: U256,
    pub data: Bytes,
}

/// Fields shared by regular and full API call requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiCall {
    pub client_address: Address,
    /// Client's request counter at request time; part of the content-addressed id.
    pub request_count: U256,
    pub fulfill_address: Address,
    pub fulfill_function_id: FixedBytes<4>,
    pub parameters: Bytes,
    /// Parameters stored on the template, for regular requests.
    pub template_parameters: Option<Bytes>,
    pub response: Option<ApiResponse>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RequestKind {
    /// References an on-chain template. `endpoint_id` is filled in from the template.
    Regular {
        template_id: B256,
        endpoint_id: Option<B256>,
        call: ApiCall,
    },
    Full {
        endpoint_id: B256,
        call: ApiCall,
    },
    Withdrawal {
        destination: Address,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FulfillmentMethod {
    Fulfill,
    Fail,
    FulfillWithdrawal,
}

impl fmt::Display for FulfillmentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FulfillmentMethod::Fulfill => "fulfill",
            FulfillmentMethod::Fail => "fail",
            FulfillmentMethod::FulfillWithdrawal => "fulfillWithdrawal",
        };
        f.write_str(s)
    }
}

/// Transaction broadcast for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Fulfillment {
    pub transaction_hash: TxHash,
    pub method: FulfillmentMethod,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Request {
    pub id: B256,
    pub sponsor_index: U256,
    pub designated_wallet: Address,
    pub metadata: LogMetadata,
    pub status: RequestStatus,
    pub nonce: Option<u64>,
    #[serde(skip)]
    pub error: Option<RequestError>,
    pub fulfillment: Option<Fulfillment>,
    pub kind: RequestKind,
}

impl Request {
    pub fn new(
        id: B256,
        sponsor_index: U256,
        designated_wallet: Address,
        metadata: LogMetadata,
        kind: RequestKind,
    ) -> Self {
        Self {
            id,
            sponsor_index,
            designated_wallet,
            metadata,
            status: RequestStatus::Pending,
            nonce: None,
            error: None,
            fulfillment: None,
            kind,
        }
    }

    pub fn api_call(&self) -> Option<&ApiCall> {
        match &self.kind {
            RequestKind::Regular { call, .. } | RequestKind::Full { call, .. } => Some(call),
            RequestKind::Withdrawal { .. } => None,
        }
    }

    pub fn is_withdrawal(&self) -> bool {
        matches!(self.kind, RequestKind::Withdrawal { .. })
    }

    /// Endpoint the API call targets, once known.
    pub fn endpoint_id(&self) -> Option<B256> {
        match &self.kind {
            RequestKind::Regular { endpoint_id, .. } => *endpoint_id,
            RequestKind::Full { endpoint_id, .. } => Some(*endpoint_id),
            RequestKind::Withdrawal { .. } => None,
        }
    }

    pub fn has_api_error(&self) -> bool {
        matches!(self.error, Some(RequestError::ApiCallFailed(_)))
    }

    /// Whether the request is ready for a transaction in this cycle.
    ///
    /// Authorized withdrawals always are. Authorized API calls are once the API call has
    /// either produced a response or failed.
    pub fn is_processable(&self) -> bool {
        if self.status != RequestStatus::Authorized {
            return false;
        }
        match self.api_call() {
            Some(call) => call.response.is_some() || self.has_api_error(),
            None => true,
        }
    }

    pub fn with_status(&self, status: RequestStatus) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }

    pub fn with_nonce(&self, nonce: u64) -> Self {
        Self {
            nonce: Some(nonce),
            ..self.clone()
        }
    }

    /// Sets both the status and the error marker.
    pub fn with_error(&self, status: RequestStatus, error: RequestError) -> Self {
        Self {
            status,
            error: Some(error),
            ..self.clone()
        }
    }

    /// Records a broadcast transaction and marks the request submitted.
    pub fn with_fulfillment(&self, fulfillment: Fulfillment) -> Self {
        Self {
            status: RequestStatus::Submitted,
            fulfillment: Some(fulfillment),
            ..self.clone()
        }
    }

    /// Attaches the API response. Withdrawals are returned unchanged.
    pub fn with_response(&self, response: ApiResponse) -> Self {
        let mut next = self.clone();
        match &mut next.kind {
            RequestKind::Regular { call, .. } | RequestKind::Full { call, .. } => {
                call.response = Some(response);
            }
            RequestKind::Withdrawal { .. } => {}
        }
        next
    }

    /// Resolves a regular request's template. Other kinds are returned unchanged.
    pub fn with_template(&self, endpoint: B256, template_parameters: Bytes) -> Self {
        let mut next = self.clone();
        if let RequestKind::Regular {
            endpoint_id, call, ..
        } = &mut next.kind
        {
            *endpoint_id = Some(endpoint);
            call.template_parameters = Some(template_parameters);
        }
        next
    }
}

/// Fee fields of a gas target. Exactly one fee-market protocol applies per chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GasPricing {
    Legacy {
        gas_price: u128,
    },
    Eip1559 {
        max_fee_per_gas: u128,
        max_priority_fee_per_gas: u128,
    },
}

impl GasPricing {
    /// Upper bound of the per-gas price a transaction can pay.
    pub fn max_price_per_gas(&self) -> u128 {
        match self {
            GasPricing::Legacy { gas_price } => *gas_price,
            GasPricing::Eip1559 {
                max_fee_per_gas, ..
            } => *max_fee_per_gas,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GasTarget {
    pub pricing: GasPricing,
    pub gas_limit: u64,
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_with_helpers_leave_original_untouched() {
        let request = full_request(1, Address::repeat_byte(1), 10, 0);
        let authorized = request.with_status(RequestStatus::Authorized).with_nonce(7);

        assert_eq!(request.status, RequestStatus::Pending);
        assert_eq!(request.nonce, None);
        assert_eq!(authorized.status, RequestStatus::Authorized);
        assert_eq!(authorized.nonce, Some(7));
    }

    #[test]
    fn test_processable_requires_resolved_api_call() {
        let request = full_request(1, Address::repeat_byte(1), 10, 0)
            .with_status(RequestStatus::Authorized);
        assert!(!request.is_processable());

        assert!(request.with_response(response()).is_processable());
        assert!(
            request
                .with_error(
                    RequestStatus::Authorized,
                    RequestError::ApiCallFailed("timeout".into())
                )
                .is_processable()
        );
        assert!(
            !request
                .with_response(response())
                .with_status(RequestStatus::Blocked)
                .is_processable()
        );
    }

    #[test]
    fn test_withdrawal_processable_once_authorized() {
        let withdrawal = Request::new(
            B256::repeat_byte(9),
            U256::from(3),
            Address::repeat_byte(2),
            metadata(5, 1),
            RequestKind::Withdrawal {
                destination: Address::repeat_byte(0xde),
            },
        );
        assert!(!withdrawal.is_processable());
        assert!(withdrawal.with_status(RequestStatus::Authorized).is_processable());
        // Responses only apply to API calls.
        assert_eq!(withdrawal.with_response(response()), withdrawal);
    }

    #[test]
    fn test_with_template_fills_regular_request() {
        let regular = Request::new(
            B256::repeat_byte(4),
            U256::from(1),
            Address::repeat_byte(1),
            metadata(1, 0),
            RequestKind::Regular {
                template_id: B256::repeat_byte(0x77),
                endpoint_id: None,
                call: api_call(),
            },
        );
        assert_eq!(regular.endpoint_id(), None);

        let resolved = regular.with_template(B256::repeat_byte(0xee), Bytes::from_static(b"t"));
        assert_eq!(resolved.endpoint_id(), Some(B256::repeat_byte(0xee)));
        assert_eq!(
            resolved.api_call().and_then(|c| c.template_parameters.clone()),
            Some(Bytes::from_static(b"t"))
        );
    }

    #[test]
    fn test_max_price_per_gas() {
        assert_eq!(GasPricing::Legacy { gas_price: 1000 }.max_price_per_gas(), 1000);
        assert_eq!(
            GasPricing::Eip1559 {
                max_fee_per_gas: 5000,
                max_priority_fee_per_gas: 10
            }
            .max_price_per_gas(),
            5000
        );
    }
}
