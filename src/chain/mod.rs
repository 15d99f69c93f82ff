//! Contract interface and the provider seam the coordinator talks to a chain through.
//!
//! [`RrpProvider`] lists every network round-trip the pipeline performs. [`evm::EvmProvider`]
//! implements it over JSON-RPC; the in-memory `memory::MemoryProvider` implements it for tests.

use alloy::hex;
use alloy::primitives::{Address, B256, Bytes, FixedBytes, TxHash, U256, keccak256};
use alloy::signers::local::PrivateKeySigner;
use alloy::sol;
use alloy::sol_types::{SolCall, SolValue};
use async_trait::async_trait;

use crate::types::{FulfillmentMethod, GasPricing, LogMetadata};

pub mod evm;
#[cfg(any(test, feature = "test-utils"))]
pub mod memory;

sol! {
    #[derive(Debug, PartialEq, Eq)]
    interface AirnodeRrp {
        event ClientRequestCreated(
            bytes32 indexed providerId,
            bytes32 indexed requestId,
            uint256 noRequests,
            address clientAddress,
            bytes32 templateId,
            uint256 requesterIndex,
            address designatedWallet,
            address fulfillAddress,
            bytes4 fulfillFunctionId,
            bytes parameters
        );
        event ClientFullRequestCreated(
            bytes32 indexed providerId,
            bytes32 indexed requestId,
            uint256 noRequests,
            address clientAddress,
            bytes32 endpointId,
            uint256 requesterIndex,
            address designatedWallet,
            address fulfillAddress,
            bytes4 fulfillFunctionId,
            bytes parameters
        );
        event ClientRequestFulfilled(
            bytes32 indexed providerId,
            bytes32 indexed requestId,
            uint256 statusCode,
            bytes data
        );
        event ClientRequestFailed(bytes32 indexed providerId, bytes32 indexed requestId);
        event WithdrawalRequested(
            bytes32 indexed providerId,
            uint256 indexed requesterIndex,
            bytes32 indexed withdrawalRequestId,
            address designatedWallet,
            address destination
        );
        event WithdrawalFulfilled(
            bytes32 indexed providerId,
            uint256 indexed requesterIndex,
            bytes32 indexed withdrawalRequestId,
            address designatedWallet,
            address destination,
            uint256 amount
        );

        function fulfill(
            bytes32 requestId,
            bytes32 providerId,
            uint256 statusCode,
            bytes calldata data,
            address fulfillAddress,
            bytes4 fulfillFunctionId
        ) external returns (bool callSuccess, bytes memory callData);
        function fail(
            bytes32 requestId,
            bytes32 providerId,
            address fulfillAddress,
            bytes4 fulfillFunctionId
        ) external;
        function fulfillWithdrawal(
            bytes32 withdrawalRequestId,
            bytes32 providerId,
            uint256 requesterIndex,
            address destination
        ) external payable;
        function getTemplate(bytes32 templateId) external view returns (
            bytes32 providerId,
            bytes32 endpointId,
            uint256 requesterIndex,
            address designatedWallet,
            address fulfillAddress,
            bytes4 fulfillFunctionId,
            bytes memory parameters
        );
        function checkAuthorizationStatus(
            bytes32 providerId,
            bytes32 requestId,
            bytes32 endpointId,
            uint256 requesterIndex,
            address designatedWallet,
            address clientAddress
        ) external view returns (bool status);
    }
}

/// Revert reason of `fulfill` and `fail` when any committed parameter does not match.
pub const INCORRECT_FULFILLMENT_PARAMETERS: &str = "Incorrect fulfillment parameters";

/// Id of a template-based request: `keccak256(requestCount ++ client ++ templateId ++ parameters)`.
pub fn regular_request_id(
    request_count: U256,
    client_address: Address,
    template_id: B256,
    parameters: &Bytes,
) -> B256 {
    keccak256((request_count, client_address, template_id, parameters.clone()).abi_encode_packed())
}

/// Id of a full request: `keccak256(requestCount ++ client ++ providerId ++ endpointId ++ parameters)`.
pub fn full_request_id(
    request_count: U256,
    client_address: Address,
    provider_id: B256,
    endpoint_id: B256,
    parameters: &Bytes,
) -> B256 {
    keccak256(
        (
            request_count,
            client_address,
            provider_id,
            endpoint_id,
            parameters.clone(),
        )
            .abi_encode_packed(),
    )
}

/// Decoded RRP contract event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RrpEvent {
    RequestCreated(AirnodeRrp::ClientRequestCreated),
    FullRequestCreated(AirnodeRrp::ClientFullRequestCreated),
    RequestFulfilled(AirnodeRrp::ClientRequestFulfilled),
    RequestFailed(AirnodeRrp::ClientRequestFailed),
    WithdrawalRequested(AirnodeRrp::WithdrawalRequested),
    WithdrawalFulfilled(AirnodeRrp::WithdrawalFulfilled),
}

impl RrpEvent {
    pub fn provider_id(&self) -> B256 {
        match self {
            RrpEvent::RequestCreated(e) => e.providerId,
            RrpEvent::FullRequestCreated(e) => e.providerId,
            RrpEvent::RequestFulfilled(e) => e.providerId,
            RrpEvent::RequestFailed(e) => e.providerId,
            RrpEvent::WithdrawalRequested(e) => e.providerId,
            RrpEvent::WithdrawalFulfilled(e) => e.providerId,
        }
    }
}

/// An RRP event together with the position of the log that carried it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RrpLog {
    pub metadata: LogMetadata,
    pub event: RrpEvent,
}

/// Template record as stored on chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    pub provider_id: B256,
    pub endpoint_id: B256,
    pub requester_index: U256,
    pub designated_wallet: Address,
    pub fulfill_address: Address,
    pub fulfill_function_id: FixedBytes<4>,
    pub parameters: Bytes,
}

/// Arguments of the read-only authorization check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationQuery {
    pub provider_id: B256,
    pub request_id: B256,
    pub endpoint_id: B256,
    pub requester_index: U256,
    pub designated_wallet: Address,
    pub client_address: Address,
}

/// A state-changing contract call the coordinator may broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RrpCall {
    Fulfill(AirnodeRrp::fulfillCall),
    Fail(AirnodeRrp::failCall),
    FulfillWithdrawal {
        call: AirnodeRrp::fulfillWithdrawalCall,
        value: U256,
    },
}

impl RrpCall {
    pub fn calldata(&self) -> Bytes {
        match self {
            RrpCall::Fulfill(call) => call.abi_encode().into(),
            RrpCall::Fail(call) => call.abi_encode().into(),
            RrpCall::FulfillWithdrawal { call, .. } => call.abi_encode().into(),
        }
    }

    pub fn value(&self) -> U256 {
        match self {
            RrpCall::FulfillWithdrawal { value, .. } => *value,
            _ => U256::ZERO,
        }
    }

    pub fn method(&self) -> FulfillmentMethod {
        match self {
            RrpCall::Fulfill(_) => FulfillmentMethod::Fulfill,
            RrpCall::Fail(_) => FulfillmentMethod::Fail,
            RrpCall::FulfillWithdrawal { .. } => FulfillmentMethod::FulfillWithdrawal,
        }
    }

    /// Request id the call settles.
    pub fn request_id(&self) -> B256 {
        match self {
            RrpCall::Fulfill(call) => call.requestId,
            RrpCall::Fail(call) => call.requestId,
            RrpCall::FulfillWithdrawal { call, .. } => call.withdrawalRequestId,
        }
    }
}

/// Per-transaction parameters chosen by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxParams {
    pub nonce: u64,
    pub gas_limit: u64,
    pub pricing: GasPricing,
}

/// Every chain interaction of a coordination cycle.
///
/// Implementations must be cheap to share behind an `Arc`; a cycle may issue calls for
/// different wallets concurrently.
#[async_trait]
pub trait RrpProvider: Send + Sync + 'static {
    /// Builds a fresh handle to the same chain, discarding any connection state.
    fn reconnect(&self) -> Result<Self, CoordinatorError>
    where
        Self: Sized;

    fn chain_id(&self) -> u64;

    async fn block_number(&self) -> Result<u64, CoordinatorError>;

    /// RRP events of `provider_id` in the inclusive block range.
    async fn request_logs(
        &self,
        provider_id: B256,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RrpLog>, CoordinatorError>;

    /// `None` when no template is stored under the id.
    async fn template(&self, template_id: B256) -> Result<Option<Template>, CoordinatorError>;

    async fn check_authorization(
        &self,
        query: &AuthorizationQuery,
    ) -> Result<bool, CoordinatorError>;

    /// Transaction count of `address` at the latest block.
    async fn transaction_count(&self, address: Address) -> Result<u64, CoordinatorError>;

    async fn balance(&self, address: Address) -> Result<U256, CoordinatorError>;

    async fn gas_price(&self) -> Result<u128, CoordinatorError>;

    /// Base fee of the latest block.
    async fn base_fee_per_gas(&self) -> Result<u128, CoordinatorError>;

    /// Executes `call` from `from` without broadcasting and returns its return data.
    /// A revert surfaces as [`CoordinatorError::ContractCall`] with the decoded reason.
    async fn simulate(&self, from: Address, call: &RrpCall) -> Result<Bytes, CoordinatorError>;

    async fn estimate_gas(&self, from: Address, call: &RrpCall) -> Result<u64, CoordinatorError>;

    /// Signs and broadcasts `call`. Does not wait for inclusion.
    async fn send(
        &self,
        signer: &PrivateKeySigner,
        call: &RrpCall,
        params: TxParams,
    ) -> Result<TxHash, CoordinatorError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoordinatorError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("key material error: {0}")]
    KeyMaterial(String),
    #[error("RPC provider error: {0}")]
    RpcProviderError(String),
    #[error("contract call failed: {0}")]
    ContractCall(String),
    #[error("resource exhaustion: {0}")]
    ResourceExhaustion(String),
    #[error("gas pricing unavailable: {0}")]
    GasPricing(String),
    #[error("API call failed: {0}")]
    ApiCall(String),
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),
    #[error("decoding error: {0}")]
    Decoding(String),
}

impl CoordinatorError {
    /// Errors worth retrying on the next cycle without operator action.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CoordinatorError::RpcProviderError(_)
                | CoordinatorError::ResourceExhaustion(_)
                | CoordinatorError::GasPricing(_)
                | CoordinatorError::ApiCall(_)
        )
    }
}

/// Parse the expected nonce from RPC error messages.
///
/// Handles error message formats like:
/// - "nonce too low: next nonce 1210, tx nonce 1209"
/// - "nonce too high: next nonce 1208, tx nonce 1210"
pub(crate) fn parse_expected_nonce_from_error(msg: &str) -> Option<u64> {
    msg.find("next nonce ")
        .map(|i| &msg[i + 11..])
        .and_then(|s| s.split(|c: char| !c.is_ascii_digit()).next())
        .and_then(|n| n.parse().ok())
}

/// Decode revert data into a human-readable reason.
///
/// Supports `Error(string)` and `Panic(uint256)`; other selectors are returned as hex.
pub(crate) fn decode_revert_reason(data: &str) -> Option<String> {
    let hex_data = data.strip_prefix("0x").unwrap_or(data);
    let bytes = hex::decode(hex_data).ok()?;

    if bytes.len() < 4 {
        return None;
    }

    // Error(string) selector: 0x08c379a0
    if bytes[0..4] == [0x08, 0xc3, 0x79, 0xa0] && bytes.len() >= 68 {
        let len = bytes[36..68]
            .iter()
            .fold(0usize, |acc, &b| acc.saturating_mul(256).saturating_add(b as usize));
        if len <= 1024 && bytes.len() >= 68 + len {
            return String::from_utf8(bytes[68..68 + len].to_vec()).ok();
        }
    }

    // Panic(uint256) selector: 0x4e487b71
    if bytes[0..4] == [0x4e, 0x48, 0x7b, 0x71] && bytes.len() >= 36 {
        return Some(format!("Panic(0x{:02x})", bytes[35]));
    }

    Some(format!("UnknownError(0x{})", hex::encode(&bytes[0..4])))
}

/// Pulls revert data out of a debug-formatted RPC error, e.g.
/// `data: Some(RawValue("0x08c379a0..."))`, and decodes it.
pub(crate) fn extract_revert_reason(err_str: &str) -> Option<String> {
    for (marker, terminator) in [
        ("data: Some(RawValue(\"", "\""),
        (r#"data: Some(RawValue(\""#, r#"\""#),
    ] {
        if let Some(idx) = err_str.find(marker) {
            let start = idx + marker.len();
            if let Some(end) = err_str[start..].find(terminator) {
                if let Some(decoded) = decode_revert_reason(&err_str[start..start + end]) {
                    return Some(decoded);
                }
            }
        }
    }
    if let Some(idx) = err_str.find("execution reverted: ") {
        let reason = &err_str[idx + 20..];
        let end = reason.find(['"', ',', ')']).unwrap_or(reason.len());
        return Some(reason[..end].to_string());
    }
    None
}

/// Categorize transport/RPC errors.
///
/// - Network/connection errors (DNS, TCP, timeouts) -> `RpcProviderError`
/// - Resource exhaustion (file descriptors, pool) -> `ResourceExhaustion`
/// - Everything else -> `ContractCall`, with the decoded revert reason when present
pub(crate) fn categorize_transport_error(e: impl std::fmt::Debug, context: &str) -> CoordinatorError {
    let err_str = format!("{:?}", e);

    if let Some(revert_reason) = extract_revert_reason(&err_str) {
        tracing::debug!("{context}: contract reverted: {revert_reason}");
        return CoordinatorError::ContractCall(revert_reason);
    }

    if err_str.contains("Connection refused")
        || err_str.contains("Connection reset")
        || err_str.contains("No route to host")
        || err_str.contains("timeout")
        || err_str.contains("Timeout")
        || err_str.contains("dns error")
    {
        tracing::warn!("{context}: RPC connection error: {err_str}");
        CoordinatorError::RpcProviderError(format!("{context}: connection error"))
    } else if err_str.contains("Too many open files") || err_str.contains("EMFILE") {
        tracing::error!("{context}: file descriptor exhaustion: {err_str}");
        CoordinatorError::ResourceExhaustion("connection pool exhausted".to_string())
    } else {
        tracing::warn!("{context}: call failed: {err_str}");
        CoordinatorError::ContractCall(format!("{context}: {err_str}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_nonce_too_low_error() {
        let msg = "nonce too low: next nonce 1210, tx nonce 1209";
        assert_eq!(parse_expected_nonce_from_error(msg), Some(1210));
    }

    #[test]
    fn test_parse_nonce_wrapped_in_error_payload() {
        let msg = r#"ErrorResp(ErrorPayload { code: -32000, message: "nonce too high: next nonce 212, tx nonce 214", data: None })"#;
        assert_eq!(parse_expected_nonce_from_error(msg), Some(212));
    }

    #[test]
    fn test_parse_nonce_no_match() {
        assert_eq!(parse_expected_nonce_from_error("insufficient funds"), None);
        assert_eq!(parse_expected_nonce_from_error(""), None);
    }

    #[test]
    fn test_decode_incorrect_fulfillment_parameters() {
        let encoded = format!(
            "0x08c379a0{}",
            hex::encode(INCORRECT_FULFILLMENT_PARAMETERS.to_string().abi_encode())
        );
        assert_eq!(
            decode_revert_reason(&encoded),
            Some(INCORRECT_FULFILLMENT_PARAMETERS.to_string())
        );
    }

    #[test]
    fn test_decode_panic_code() {
        let data = "0x4e487b710000000000000000000000000000000000000000000000000000000000000011";
        assert_eq!(decode_revert_reason(data), Some("Panic(0x11)".to_string()));
    }

    #[test]
    fn test_decode_short_and_invalid_data() {
        assert_eq!(decode_revert_reason("0x"), None);
        assert_eq!(decode_revert_reason("0xab"), None);
        assert_eq!(decode_revert_reason("0xzzzz"), None);
    }

    #[test]
    fn test_extract_revert_from_rawvalue_pattern() {
        let encoded = hex::encode(INCORRECT_FULFILLMENT_PARAMETERS.to_string().abi_encode());
        let err = format!(
            r#"ErrorResp(ErrorPayload {{ code: 3, message: "execution reverted", data: Some(RawValue("0x08c379a0{encoded}")) }})"#
        );
        assert_eq!(
            extract_revert_reason(&err),
            Some(INCORRECT_FULFILLMENT_PARAMETERS.to_string())
        );
    }

    #[test]
    fn test_extract_revert_from_message() {
        let err = r#"ErrorResp(ErrorPayload { code: 3, message: "execution reverted: Incorrect fulfillment parameters", data: None })"#;
        assert_eq!(
            extract_revert_reason(err),
            Some(INCORRECT_FULFILLMENT_PARAMETERS.to_string())
        );
    }

    #[test]
    fn test_categorize_connection_error() {
        let err = categorize_transport_error("Connection refused (os error 111)", "get_gas_price");
        assert!(matches!(err, CoordinatorError::RpcProviderError(_)));
        assert!(err.is_transient());
    }

    #[test]
    fn test_categorize_fd_exhaustion() {
        let err = categorize_transport_error("Too many open files", "send");
        assert!(matches!(err, CoordinatorError::ResourceExhaustion(_)));
    }

    #[test]
    fn test_request_ids_commit_to_contents() {
        let client = Address::repeat_byte(0xc1);
        let params = Bytes::from_static(b"abc");
        let a = regular_request_id(U256::ZERO, client, B256::repeat_byte(1), &params);
        let b = regular_request_id(U256::from(1), client, B256::repeat_byte(1), &params);
        assert_ne!(a, b);

        let full = full_request_id(
            U256::ZERO,
            client,
            B256::repeat_byte(2),
            B256::repeat_byte(1),
            &params,
        );
        assert_ne!(a, full);
    }

    #[test]
    fn test_call_calldata_uses_selector() {
        let call = RrpCall::Fail(AirnodeRrp::failCall {
            requestId: B256::repeat_byte(1),
            providerId: B256::repeat_byte(2),
            fulfillAddress: Address::repeat_byte(3),
            fulfillFunctionId: FixedBytes([1, 2, 3, 4]),
        });
        assert_eq!(&call.calldata()[..4], AirnodeRrp::failCall::SELECTOR.as_slice());
        assert_eq!(call.value(), U256::ZERO);
        assert_eq!(call.method(), FulfillmentMethod::Fail);
        assert_eq!(call.request_id(), B256::repeat_byte(1));
    }
}
