//! In-memory RRP chain for tests.
//!
//! Reproduces the contract's request/fulfill/fail/withdraw protocol, per-sender nonce
//! sequencing (a transaction whose nonce is ahead of the sender's count waits until the gap is
//! filled) and the node calls the coordinator makes. Failures can be injected per call kind, and
//! every call is counted so tests can assert which lookups happened.

use alloy::primitives::{Address, B256, Bytes, FixedBytes, TxHash, U256, keccak256};
use alloy::signers::local::PrivateKeySigner;
use alloy::sol_types::SolValue;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;

use crate::chain::{
    AirnodeRrp, AuthorizationQuery, CoordinatorError, INCORRECT_FULFILLMENT_PARAMETERS, RrpCall,
    RrpEvent, RrpLog, RrpProvider, Template, TxParams, full_request_id, regular_request_id,
};
use crate::types::{GasPricing, LogMetadata};

/// What a request committed to at creation time.
#[derive(Debug, Clone)]
struct Commitment {
    provider_id: B256,
    designated_wallet: Address,
    fulfill_address: Address,
    fulfill_function_id: FixedBytes<4>,
}

#[derive(Debug, Clone)]
struct WithdrawalRecord {
    provider_id: B256,
    requester_index: U256,
    designated_wallet: Address,
    destination: Address,
}

/// A transaction accepted by [`MemoryProvider::send`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentTransaction {
    pub hash: TxHash,
    pub from: Address,
    pub nonce: u64,
    pub gas_limit: u64,
    pub pricing: GasPricing,
    pub call: RrpCall,
}

/// Outcome of a transaction once its nonce came up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub hash: TxHash,
    /// `None` on success, the revert reason otherwise.
    pub revert_reason: Option<String>,
}

/// Number of calls per provider method.
#[derive(Debug, Default)]
pub struct CallCounters {
    pub block_number: AtomicUsize,
    pub request_logs: AtomicUsize,
    pub template: AtomicUsize,
    pub check_authorization: AtomicUsize,
    pub transaction_count: AtomicUsize,
    pub balance: AtomicUsize,
    pub gas_price: AtomicUsize,
    pub base_fee_per_gas: AtomicUsize,
    pub simulate: AtomicUsize,
    pub estimate_gas: AtomicUsize,
    pub send: AtomicUsize,
    pub reconnect: AtomicUsize,
}

/// Reads a counter of [`CallCounters`].
pub fn calls(counter: &AtomicUsize) -> usize {
    counter.load(Ordering::SeqCst)
}

/// Calls that should fail with a transport error.
#[derive(Debug, Default, Clone)]
struct Failures {
    block_number: bool,
    gas_price: bool,
    base_fee: bool,
    templates: bool,
    transaction_count: HashSet<Address>,
    balance: HashSet<Address>,
    authorization: HashSet<B256>,
    send: HashSet<B256>,
    estimate_gas: HashSet<B256>,
}

#[derive(Debug)]
struct ChainState {
    block_number: u64,
    logs: Vec<RrpLog>,
    templates: HashMap<B256, Template>,
    commitments: HashMap<B256, Commitment>,
    withdrawals: HashMap<B256, WithdrawalRecord>,
    client_request_counts: HashMap<Address, U256>,
    withdrawal_count: U256,
    denied: HashSet<B256>,
    reverting_clients: HashSet<Address>,
    transaction_counts: HashMap<Address, u64>,
    balances: HashMap<Address, U256>,
    queued: HashMap<Address, BTreeMap<u64, SentTransaction>>,
    sent: Vec<SentTransaction>,
    receipts: Vec<Receipt>,
    gas_price: u128,
    base_fee: u128,
    gas_estimate: u64,
    failures: Failures,
}

/// Simulated RRP contract plus the node calls around it.
///
/// Clones share the same chain, which is what [`RrpProvider::reconnect`] returns.
#[derive(Debug, Clone)]
pub struct MemoryProvider {
    chain_id: u64,
    state: Arc<Mutex<ChainState>>,
    counters: Arc<CallCounters>,
}

impl MemoryProvider {
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            state: Arc::new(Mutex::new(ChainState {
                block_number: 1,
                logs: Vec::new(),
                templates: HashMap::new(),
                commitments: HashMap::new(),
                withdrawals: HashMap::new(),
                client_request_counts: HashMap::new(),
                withdrawal_count: U256::ZERO,
                denied: HashSet::new(),
                reverting_clients: HashSet::new(),
                transaction_counts: HashMap::new(),
                balances: HashMap::new(),
                queued: HashMap::new(),
                sent: Vec::new(),
                receipts: Vec::new(),
                gas_price: 1000,
                base_fee: 1000,
                gas_estimate: 80_000,
                failures: Failures::default(),
            })),
            counters: Arc::new(CallCounters::default()),
        }
    }

    pub fn counters(&self) -> &CallCounters {
        &self.counters
    }

    /// Advances the chain; subsequent events land in the new block.
    pub async fn mine(&self, blocks: u64) {
        self.state.lock().await.block_number += blocks;
    }

    pub async fn set_transaction_count(&self, address: Address, count: u64) {
        self.state.lock().await.transaction_counts.insert(address, count);
    }

    pub async fn set_balance(&self, address: Address, balance: U256) {
        self.state.lock().await.balances.insert(address, balance);
    }

    pub async fn balance_of(&self, address: Address) -> U256 {
        self.state
            .lock()
            .await
            .balances
            .get(&address)
            .copied()
            .unwrap_or_default()
    }

    pub async fn set_gas_price(&self, gas_price: u128) {
        self.state.lock().await.gas_price = gas_price;
    }

    pub async fn set_base_fee(&self, base_fee: u128) {
        self.state.lock().await.base_fee = base_fee;
    }

    pub async fn set_gas_estimate(&self, gas: u64) {
        self.state.lock().await.gas_estimate = gas;
    }

    /// Authorization checks for `request_id` return `false`.
    pub async fn deny_authorization(&self, request_id: B256) {
        self.state.lock().await.denied.insert(request_id);
    }

    /// The client at `fulfill_address` reverts inside its callback.
    pub async fn revert_client_callback(&self, fulfill_address: Address) {
        self.state.lock().await.reverting_clients.insert(fulfill_address);
    }

    pub async fn fail_block_number(&self) {
        self.state.lock().await.failures.block_number = true;
    }

    pub async fn fail_gas_price(&self) {
        self.state.lock().await.failures.gas_price = true;
    }

    pub async fn fail_base_fee(&self) {
        self.state.lock().await.failures.base_fee = true;
    }

    pub async fn fail_templates(&self) {
        self.state.lock().await.failures.templates = true;
    }

    pub async fn fail_transaction_count(&self, address: Address) {
        self.state.lock().await.failures.transaction_count.insert(address);
    }

    pub async fn fail_balance(&self, address: Address) {
        self.state.lock().await.failures.balance.insert(address);
    }

    pub async fn fail_authorization(&self, request_id: B256) {
        self.state.lock().await.failures.authorization.insert(request_id);
    }

    /// Broadcasts settling `request_id` are rejected by the node.
    pub async fn fail_send(&self, request_id: B256) {
        self.state.lock().await.failures.send.insert(request_id);
    }

    pub async fn fail_estimate_gas(&self, request_id: B256) {
        self.state.lock().await.failures.estimate_gas.insert(request_id);
    }

    pub async fn sent(&self) -> Vec<SentTransaction> {
        self.state.lock().await.sent.clone()
    }

    pub async fn receipts(&self) -> Vec<Receipt> {
        self.state.lock().await.receipts.clone()
    }

    pub async fn logs(&self) -> Vec<RrpLog> {
        self.state.lock().await.logs.clone()
    }

    pub async fn create_template(&self, template: Template) -> B256 {
        let mut state = self.state.lock().await;
        let template_id = keccak256(
            (
                template.provider_id,
                template.endpoint_id,
                template.requester_index,
                template.designated_wallet,
                template.fulfill_address,
                template.fulfill_function_id,
                template.parameters.clone(),
            )
                .abi_encode_packed(),
        );
        state.templates.insert(template_id, template);
        template_id
    }

    /// `makeRequest` issued by `client_address`. Returns the request id.
    #[allow(clippy::too_many_arguments)]
    pub async fn make_request(
        &self,
        client_address: Address,
        template_id: B256,
        requester_index: U256,
        designated_wallet: Address,
        fulfill_address: Address,
        fulfill_function_id: FixedBytes<4>,
        parameters: Bytes,
    ) -> B256 {
        let mut state = self.state.lock().await;
        let provider_id = state
            .templates
            .get(&template_id)
            .map(|t| t.provider_id)
            .unwrap_or_default();
        let request_count = state.next_request_count(client_address);
        let request_id = regular_request_id(request_count, client_address, template_id, &parameters);
        state.commitments.insert(
            request_id,
            Commitment {
                provider_id,
                designated_wallet,
                fulfill_address,
                fulfill_function_id,
            },
        );
        state.emit(RrpEvent::RequestCreated(AirnodeRrp::ClientRequestCreated {
            providerId: provider_id,
            requestId: request_id,
            noRequests: request_count,
            clientAddress: client_address,
            templateId: template_id,
            requesterIndex: requester_index,
            designatedWallet: designated_wallet,
            fulfillAddress: fulfill_address,
            fulfillFunctionId: fulfill_function_id,
            parameters,
        }));
        request_id
    }

    /// `makeFullRequest` issued by `client_address`. Returns the request id.
    #[allow(clippy::too_many_arguments)]
    pub async fn make_full_request(
        &self,
        client_address: Address,
        provider_id: B256,
        endpoint_id: B256,
        requester_index: U256,
        designated_wallet: Address,
        fulfill_address: Address,
        fulfill_function_id: FixedBytes<4>,
        parameters: Bytes,
    ) -> B256 {
        let mut state = self.state.lock().await;
        let request_count = state.next_request_count(client_address);
        let request_id = full_request_id(
            request_count,
            client_address,
            provider_id,
            endpoint_id,
            &parameters,
        );
        state.commitments.insert(
            request_id,
            Commitment {
                provider_id,
                designated_wallet,
                fulfill_address,
                fulfill_function_id,
            },
        );
        state.emit(RrpEvent::FullRequestCreated(AirnodeRrp::ClientFullRequestCreated {
            providerId: provider_id,
            requestId: request_id,
            noRequests: request_count,
            clientAddress: client_address,
            endpointId: endpoint_id,
            requesterIndex: requester_index,
            designatedWallet: designated_wallet,
            fulfillAddress: fulfill_address,
            fulfillFunctionId: fulfill_function_id,
            parameters,
        }));
        request_id
    }

    /// Requester asks for the designated wallet's funds to be sent to `destination`.
    pub async fn request_withdrawal(
        &self,
        provider_id: B256,
        requester_index: U256,
        designated_wallet: Address,
        destination: Address,
    ) -> B256 {
        let mut state = self.state.lock().await;
        state.withdrawal_count += U256::from(1);
        let withdrawal_id =
            keccak256((state.withdrawal_count, provider_id, requester_index).abi_encode_packed());
        state.withdrawals.insert(
            withdrawal_id,
            WithdrawalRecord {
                provider_id,
                requester_index,
                designated_wallet,
                destination,
            },
        );
        state.emit(RrpEvent::WithdrawalRequested(AirnodeRrp::WithdrawalRequested {
            providerId: provider_id,
            requesterIndex: requester_index,
            withdrawalRequestId: withdrawal_id,
            designatedWallet: designated_wallet,
            destination,
        }));
        withdrawal_id
    }

    /// Broadcasts `call` from `from` with the next nonce, bypassing the signer.
    pub async fn execute_as(&self, from: Address, call: &RrpCall) -> Receipt {
        let mut state = self.state.lock().await;
        let nonce = state.transaction_counts.get(&from).copied().unwrap_or_default();
        let tx = SentTransaction {
            hash: transaction_hash(from, nonce),
            from,
            nonce,
            gas_limit: 500_000,
            pricing: GasPricing::Legacy {
                gas_price: state.gas_price,
            },
            call: call.clone(),
        };
        state.sent.push(tx.clone());
        state.execute(tx)
    }
}

fn transaction_hash(from: Address, nonce: u64) -> TxHash {
    keccak256((from, U256::from(nonce)).abi_encode_packed())
}

impl ChainState {
    fn next_request_count(&mut self, client: Address) -> U256 {
        let count = self.client_request_counts.entry(client).or_default();
        let current = *count;
        *count += U256::from(1);
        current
    }

    fn emit(&mut self, event: RrpEvent) {
        let log_index = self
            .logs
            .iter()
            .filter(|l| l.metadata.block_number == self.block_number)
            .count() as u64;
        let metadata = LogMetadata {
            block_number: self.block_number,
            log_index,
            transaction_hash: keccak256((U256::from(self.block_number), U256::from(log_index)).abi_encode_packed()),
        };
        self.logs.push(RrpLog { metadata, event });
    }

    fn check_commitment(
        &self,
        from: Address,
        request_id: B256,
        provider_id: B256,
        fulfill_address: Address,
        fulfill_function_id: FixedBytes<4>,
    ) -> Result<(), String> {
        match self.commitments.get(&request_id) {
            Some(c)
                if c.provider_id == provider_id
                    && c.fulfill_address == fulfill_address
                    && c.fulfill_function_id == fulfill_function_id
                    && c.designated_wallet == from =>
            {
                Ok(())
            }
            _ => Err(INCORRECT_FULFILLMENT_PARAMETERS.to_string()),
        }
    }

    /// Validates `call` against the contract state and returns its return data.
    fn check(&self, from: Address, call: &RrpCall) -> Result<Bytes, String> {
        match call {
            RrpCall::Fulfill(c) => {
                self.check_commitment(
                    from,
                    c.requestId,
                    c.providerId,
                    c.fulfillAddress,
                    c.fulfillFunctionId,
                )?;
                let call_success = !self.reverting_clients.contains(&c.fulfillAddress);
                Ok((call_success, Bytes::new()).abi_encode_params().into())
            }
            RrpCall::Fail(c) => {
                self.check_commitment(
                    from,
                    c.requestId,
                    c.providerId,
                    c.fulfillAddress,
                    c.fulfillFunctionId,
                )?;
                Ok(Bytes::new())
            }
            RrpCall::FulfillWithdrawal { call: c, value } => {
                match self.withdrawals.get(&c.withdrawalRequestId) {
                    Some(w)
                        if w.provider_id == c.providerId
                            && w.requester_index == c.requesterIndex
                            && w.destination == c.destination
                            && w.designated_wallet == from => {}
                    _ => return Err("Incorrect withdrawal fulfillment parameters".to_string()),
                }
                let balance = self.balances.get(&from).copied().unwrap_or_default();
                if *value > balance {
                    return Err("Insufficient funds".to_string());
                }
                Ok(Bytes::new())
            }
        }
    }

    /// Applies a validated call.
    fn apply(&mut self, from: Address, call: &RrpCall) {
        match call {
            RrpCall::Fulfill(c) => {
                self.commitments.remove(&c.requestId);
                self.emit(RrpEvent::RequestFulfilled(AirnodeRrp::ClientRequestFulfilled {
                    providerId: c.providerId,
                    requestId: c.requestId,
                    statusCode: c.statusCode,
                    data: c.data.clone(),
                }));
            }
            RrpCall::Fail(c) => {
                self.commitments.remove(&c.requestId);
                self.emit(RrpEvent::RequestFailed(AirnodeRrp::ClientRequestFailed {
                    providerId: c.providerId,
                    requestId: c.requestId,
                }));
            }
            RrpCall::FulfillWithdrawal { call: c, value } => {
                self.withdrawals.remove(&c.withdrawalRequestId);
                let balance = self.balances.entry(from).or_default();
                *balance -= *value;
                *self.balances.entry(c.destination).or_default() += *value;
                self.emit(RrpEvent::WithdrawalFulfilled(AirnodeRrp::WithdrawalFulfilled {
                    providerId: c.providerId,
                    requesterIndex: c.requesterIndex,
                    withdrawalRequestId: c.withdrawalRequestId,
                    designatedWallet: from,
                    destination: c.destination,
                    amount: *value,
                }));
            }
        }
    }

    /// Mines `tx`, whose nonce must equal the sender's count. Reverts still consume the nonce.
    fn execute(&mut self, tx: SentTransaction) -> Receipt {
        let revert_reason = match self.check(tx.from, &tx.call) {
            Ok(_) => {
                self.apply(tx.from, &tx.call);
                None
            }
            Err(reason) => Some(reason),
        };
        *self.transaction_counts.entry(tx.from).or_default() += 1;
        let receipt = Receipt {
            hash: tx.hash,
            revert_reason,
        };
        self.receipts.push(receipt.clone());
        receipt
    }

    /// Mines queued transactions of `from` while their nonces are contiguous.
    fn drain_queue(&mut self, from: Address) {
        loop {
            let next = self.transaction_counts.get(&from).copied().unwrap_or_default();
            let Some(tx) = self.queued.get_mut(&from).and_then(|q| q.remove(&next)) else {
                break;
            };
            self.execute(tx);
        }
    }
}

#[async_trait]
impl RrpProvider for MemoryProvider {
    fn reconnect(&self) -> Result<Self, CoordinatorError> {
        self.counters.reconnect.fetch_add(1, Ordering::SeqCst);
        Ok(self.clone())
    }

    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn block_number(&self) -> Result<u64, CoordinatorError> {
        self.counters.block_number.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().await;
        if state.failures.block_number {
            return Err(CoordinatorError::RpcProviderError("block_number: connection error".into()));
        }
        Ok(state.block_number)
    }

    async fn request_logs(
        &self,
        provider_id: B256,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RrpLog>, CoordinatorError> {
        self.counters.request_logs.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().await;
        Ok(state
            .logs
            .iter()
            .filter(|l| {
                l.event.provider_id() == provider_id
                    && (from_block..=to_block).contains(&l.metadata.block_number)
            })
            .cloned()
            .collect())
    }

    async fn template(&self, template_id: B256) -> Result<Option<Template>, CoordinatorError> {
        self.counters.template.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().await;
        if state.failures.templates {
            return Err(CoordinatorError::RpcProviderError("getTemplate: connection error".into()));
        }
        Ok(state.templates.get(&template_id).cloned())
    }

    async fn check_authorization(
        &self,
        query: &AuthorizationQuery,
    ) -> Result<bool, CoordinatorError> {
        self.counters.check_authorization.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().await;
        if state.failures.authorization.contains(&query.request_id) {
            return Err(CoordinatorError::RpcProviderError(
                "checkAuthorizationStatus: connection error".into(),
            ));
        }
        Ok(!state.denied.contains(&query.request_id))
    }

    async fn transaction_count(&self, address: Address) -> Result<u64, CoordinatorError> {
        self.counters.transaction_count.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().await;
        if state.failures.transaction_count.contains(&address) {
            return Err(CoordinatorError::RpcProviderError(
                "get_transaction_count: connection error".into(),
            ));
        }
        Ok(state.transaction_counts.get(&address).copied().unwrap_or_default())
    }

    async fn balance(&self, address: Address) -> Result<U256, CoordinatorError> {
        self.counters.balance.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().await;
        if state.failures.balance.contains(&address) {
            return Err(CoordinatorError::RpcProviderError("get_balance: connection error".into()));
        }
        Ok(state.balances.get(&address).copied().unwrap_or_default())
    }

    async fn gas_price(&self) -> Result<u128, CoordinatorError> {
        self.counters.gas_price.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().await;
        if state.failures.gas_price {
            return Err(CoordinatorError::RpcProviderError("get_gas_price: connection error".into()));
        }
        Ok(state.gas_price)
    }

    async fn base_fee_per_gas(&self) -> Result<u128, CoordinatorError> {
        self.counters.base_fee_per_gas.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().await;
        if state.failures.base_fee {
            return Err(CoordinatorError::RpcProviderError("get_block: connection error".into()));
        }
        Ok(state.base_fee)
    }

    async fn simulate(&self, from: Address, call: &RrpCall) -> Result<Bytes, CoordinatorError> {
        self.counters.simulate.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().await;
        state.check(from, call).map_err(CoordinatorError::ContractCall)
    }

    async fn estimate_gas(&self, from: Address, call: &RrpCall) -> Result<u64, CoordinatorError> {
        self.counters.estimate_gas.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().await;
        if state.failures.estimate_gas.contains(&call.request_id()) {
            return Err(CoordinatorError::RpcProviderError("estimate_gas: connection error".into()));
        }
        state.check(from, call).map_err(CoordinatorError::ContractCall)?;
        Ok(state.gas_estimate)
    }

    async fn send(
        &self,
        signer: &PrivateKeySigner,
        call: &RrpCall,
        params: TxParams,
    ) -> Result<TxHash, CoordinatorError> {
        self.counters.send.fetch_add(1, Ordering::SeqCst);
        let from = signer.address();
        let mut state = self.state.lock().await;
        if state.failures.send.contains(&call.request_id()) {
            return Err(CoordinatorError::RpcProviderError("send: connection error".into()));
        }
        let next = state.transaction_counts.get(&from).copied().unwrap_or_default();
        if params.nonce < next {
            return Err(CoordinatorError::ContractCall(format!(
                "nonce too low: next nonce {next}, tx nonce {}",
                params.nonce
            )));
        }
        let tx = SentTransaction {
            hash: transaction_hash(from, params.nonce),
            from,
            nonce: params.nonce,
            gas_limit: params.gas_limit,
            pricing: params.pricing,
            call: call.clone(),
        };
        state.sent.push(tx.clone());
        let hash = tx.hash;
        state.queued.entry(from).or_default().insert(params.nonce, tx);
        state.drain_queue(from);
        Ok(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::sol_types::SolCall;
    use crate::wallet::{TEST_MNEMONIC, WalletDeriver};

    const FULFILL_FUNCTION_ID: FixedBytes<4> = FixedBytes([0x48, 0xa4, 0x15, 0x7c]);

    struct Fixture {
        chain: MemoryProvider,
        provider_id: B256,
        wallet: PrivateKeySigner,
        client: Address,
        request_id: B256,
    }

    async fn fixture() -> Fixture {
        let chain = MemoryProvider::new(31337);
        let deriver = WalletDeriver::from_mnemonic(TEST_MNEMONIC).unwrap();
        let wallet = deriver.wallet(1).unwrap();
        let provider_id = B256::repeat_byte(0xaa);
        let client = Address::repeat_byte(0xc1);
        let request_id = chain
            .make_full_request(
                client,
                provider_id,
                B256::repeat_byte(0xee),
                U256::from(1),
                wallet.address(),
                client,
                FULFILL_FUNCTION_ID,
                Bytes::from_static(b"params"),
            )
            .await;
        Fixture {
            chain,
            provider_id,
            wallet,
            client,
            request_id,
        }
    }

    fn fulfill(f: &Fixture, request_id: B256) -> RrpCall {
        RrpCall::Fulfill(AirnodeRrp::fulfillCall {
            requestId: request_id,
            providerId: f.provider_id,
            statusCode: U256::from(5),
            data: Bytes::from_static(&[7; 32]),
            fulfillAddress: f.client,
            fulfillFunctionId: FULFILL_FUNCTION_ID,
        })
    }

    fn fail(f: &Fixture, request_id: B256) -> RrpCall {
        RrpCall::Fail(AirnodeRrp::failCall {
            requestId: request_id,
            providerId: f.provider_id,
            fulfillAddress: f.client,
            fulfillFunctionId: FULFILL_FUNCTION_ID,
        })
    }

    fn fulfilled_events(logs: &[RrpLog]) -> usize {
        logs.iter()
            .filter(|l| matches!(l.event, RrpEvent::RequestFulfilled(_) | RrpEvent::RequestFailed(_)))
            .count()
    }

    #[tokio::test]
    async fn test_fulfill_with_correct_parameters_emits_event() {
        let f = fixture().await;
        let receipt = f.chain.execute_as(f.wallet.address(), &fulfill(&f, f.request_id)).await;
        assert_eq!(receipt.revert_reason, None);

        let logs = f.chain.logs().await;
        match &logs.last().unwrap().event {
            RrpEvent::RequestFulfilled(e) => {
                assert_eq!(e.requestId, f.request_id);
                assert_eq!(e.providerId, f.provider_id);
                assert_eq!(e.statusCode, U256::from(5));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fulfill_with_incorrect_request_id_reverts() {
        let f = fixture().await;
        let receipt = f
            .chain
            .execute_as(f.wallet.address(), &fulfill(&f, B256::repeat_byte(0x01)))
            .await;
        assert_eq!(
            receipt.revert_reason.as_deref(),
            Some(INCORRECT_FULFILLMENT_PARAMETERS)
        );
        assert_eq!(fulfilled_events(&f.chain.logs().await), 0);
    }

    #[tokio::test]
    async fn test_fulfill_with_incorrect_provider_id_reverts() {
        let f = fixture().await;
        let call = match fulfill(&f, f.request_id) {
            RrpCall::Fulfill(mut c) => {
                c.providerId = B256::repeat_byte(0xbb);
                RrpCall::Fulfill(c)
            }
            other => other,
        };
        let receipt = f.chain.execute_as(f.wallet.address(), &call).await;
        assert_eq!(
            receipt.revert_reason.as_deref(),
            Some(INCORRECT_FULFILLMENT_PARAMETERS)
        );
    }

    #[tokio::test]
    async fn test_fulfill_from_wrong_wallet_reverts() {
        let f = fixture().await;
        let receipt = f
            .chain
            .execute_as(Address::repeat_byte(0x99), &fulfill(&f, f.request_id))
            .await;
        assert_eq!(
            receipt.revert_reason.as_deref(),
            Some(INCORRECT_FULFILLMENT_PARAMETERS)
        );
        assert_eq!(fulfilled_events(&f.chain.logs().await), 0);
    }

    #[tokio::test]
    async fn test_fail_emits_failed_event_and_settles_request() {
        let f = fixture().await;
        let receipt = f.chain.execute_as(f.wallet.address(), &fail(&f, f.request_id)).await;
        assert_eq!(receipt.revert_reason, None);
        assert!(matches!(
            f.chain.logs().await.last().unwrap().event,
            RrpEvent::RequestFailed(_)
        ));

        // A settled request cannot be settled again.
        let again = f.chain.execute_as(f.wallet.address(), &fulfill(&f, f.request_id)).await;
        assert_eq!(
            again.revert_reason.as_deref(),
            Some(INCORRECT_FULFILLMENT_PARAMETERS)
        );
    }

    #[tokio::test]
    async fn test_fail_with_incorrect_fulfill_function_id_reverts() {
        let f = fixture().await;
        let call = match fail(&f, f.request_id) {
            RrpCall::Fail(mut c) => {
                c.fulfillFunctionId = FixedBytes([0, 0, 0, 1]);
                RrpCall::Fail(c)
            }
            other => other,
        };
        let receipt = f.chain.execute_as(f.wallet.address(), &call).await;
        assert_eq!(
            receipt.revert_reason.as_deref(),
            Some(INCORRECT_FULFILLMENT_PARAMETERS)
        );
    }

    #[tokio::test]
    async fn test_fail_from_wrong_wallet_reverts() {
        let f = fixture().await;
        let receipt = f
            .chain
            .execute_as(Address::repeat_byte(0x99), &fail(&f, f.request_id))
            .await;
        assert_eq!(
            receipt.revert_reason.as_deref(),
            Some(INCORRECT_FULFILLMENT_PARAMETERS)
        );
        assert_eq!(fulfilled_events(&f.chain.logs().await), 0);

        // The request is still open for its designated wallet.
        let receipt = f.chain.execute_as(f.wallet.address(), &fail(&f, f.request_id)).await;
        assert_eq!(receipt.revert_reason, None);
    }

    #[tokio::test]
    async fn test_send_queues_until_nonce_gap_is_filled() {
        let f = fixture().await;
        let second = f
            .chain
            .make_full_request(
                f.client,
                f.provider_id,
                B256::repeat_byte(0xee),
                U256::from(1),
                f.wallet.address(),
                f.client,
                FULFILL_FUNCTION_ID,
                Bytes::from_static(b"other"),
            )
            .await;
        let params = |nonce| TxParams {
            nonce,
            gas_limit: 500_000,
            pricing: GasPricing::Legacy { gas_price: 1000 },
        };

        f.chain.send(&f.wallet, &fulfill(&f, second), params(1)).await.unwrap();
        assert!(f.chain.receipts().await.is_empty());

        f.chain.send(&f.wallet, &fulfill(&f, f.request_id), params(0)).await.unwrap();
        let receipts = f.chain.receipts().await;
        assert_eq!(receipts.len(), 2);
        assert!(receipts.iter().all(|r| r.revert_reason.is_none()));
        assert_eq!(f.chain.transaction_count(f.wallet.address()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_send_rejects_stale_nonce() {
        let f = fixture().await;
        f.chain.set_transaction_count(f.wallet.address(), 5).await;
        let err = f
            .chain
            .send(
                &f.wallet,
                &fulfill(&f, f.request_id),
                TxParams {
                    nonce: 4,
                    gas_limit: 500_000,
                    pricing: GasPricing::Legacy { gas_price: 1 },
                },
            )
            .await
            .unwrap_err();
        assert_eq!(
            err,
            CoordinatorError::ContractCall("nonce too low: next nonce 5, tx nonce 4".into())
        );
    }

    #[tokio::test]
    async fn test_simulate_reports_client_callback_failure() {
        let f = fixture().await;
        f.chain.revert_client_callback(f.client).await;
        let data = f
            .chain
            .simulate(f.wallet.address(), &fulfill(&f, f.request_id))
            .await
            .unwrap();
        let decoded = AirnodeRrp::fulfillCall::abi_decode_returns(&data).unwrap();
        assert!(!decoded.callSuccess);
    }
}
