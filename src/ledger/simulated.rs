//! In-memory ledger
//!
//! Enforces the token sale and compliance rules (whitelist, holding limit, sale
//! cap, zero-balance blacklist, service-provider role) and rejects with the same
//! encoded custom-error payloads the deployed contracts produce. Submitted
//! writes stay pending until mined, either by hand through [`SimulatedLedger::mine`]
//! (tests choose which confirmation channel reports first) or automatically
//! after a delay. Finished receipts stay available to late watchers for
//! [`RECEIPT_HISTORY_BLOCKS`] blocks.

use super::{
    receiver_stream, AccountRole, ContractRole, Contracts, EventSource, LedgerCall,
    LedgerReader, LedgerWriter, LogRecord, PreparedRequest, PropertyInfo, ReceiptSource,
    ReceiptUpdate, SaleStatus,
};
use crate::abi::{keccak256, AbiError, AbiValue, InterfaceDescription};
use crate::errors::LedgerRejection;
use crate::types::{Handle, OperationKind, RejectPayload, SubjectKey};
use async_trait::async_trait;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use primitive_types::U256;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Wei per whole token
pub const TOKEN_PRICE_WEI: u64 = 1_000_000_000_000_000;

const TOKEN_DECIMALS: usize = 18;
const DEFAULT_MAX_HOLDING_TOKENS: u64 = 5_000;
const DEFAULT_SALE_CAP_ETH: u64 = 1_000;
const SIMULATED_GAS_LIMIT: u64 = 120_000;

/// Blocks a finished receipt can still be replayed for
pub const RECEIPT_HISTORY_BLOCKS: u64 = 64;

/// Interface description of both contracts, as bundled with the crate
pub fn bundled_interface() -> Result<InterfaceDescription, AbiError> {
    let token = InterfaceDescription::from_json_str(include_str!("../../abis/RealEstateToken.json"))?;
    let manager =
        InterfaceDescription::from_json_str(include_str!("../../abis/ComplianceManager.json"))?;
    Ok(token.merge(manager))
}

/// Which confirmation channels report a mined write, and in what order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOrder {
    EventFirst,
    ReceiptFirst,
    EventOnly,
    ReceiptOnly,
    /// Mined, but neither channel reports
    Silent,
}

impl DeliveryOrder {
    fn sends_event(self) -> bool {
        matches!(self, Self::EventFirst | Self::ReceiptFirst | Self::EventOnly)
    }

    fn sends_receipt(self) -> bool {
        matches!(self, Self::EventFirst | Self::ReceiptFirst | Self::ReceiptOnly)
    }
}

/// Result of executing a pending write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MineOutcome {
    Success(LogRecord),
    Reverted(RejectPayload),
}

#[derive(Default)]
struct ReceiptHistory {
    updates: Vec<ReceiptUpdate>,
    /// Block at which the terminal update arrived
    finished_at: Option<u64>,
}

struct State {
    property: PropertyInfo,
    service_providers: HashSet<SubjectKey>,
    whitelist: HashSet<SubjectKey>,
    balances: HashMap<SubjectKey, U256>,
    recovery_pool: U256,
    total_raised: U256,
    max_holding: U256,
    sale_cap: U256,
    block: u64,
    nonce: u64,
    pending: HashMap<Handle, PreparedRequest>,
    receipts: HashMap<Handle, ReceiptHistory>,
    event_subscribers: Vec<(String, mpsc::UnboundedSender<Vec<LogRecord>>)>,
    receipt_watchers: HashMap<Handle, Vec<mpsc::UnboundedSender<ReceiptUpdate>>>,
    reject_next_signature: bool,
    fail_next_transport: Option<String>,
    auto_mine: Option<Duration>,
}

struct Inner {
    contracts: Contracts,
    interface: InterfaceDescription,
    state: Mutex<State>,
}

/// Rule-enforcing in-memory ledger; cheap to clone
#[derive(Clone)]
pub struct SimulatedLedger {
    inner: Arc<Inner>,
}

impl SimulatedLedger {
    /// A fresh ledger where `service_provider` holds the service-provider role
    pub fn new(contracts: Contracts, service_provider: SubjectKey) -> Result<Self, AbiError> {
        let scale = U256::exp10(TOKEN_DECIMALS);
        let sale_cap = U256::from(DEFAULT_SALE_CAP_ETH) * scale;
        let state = State {
            property: PropertyInfo {
                name: "Marina Bay Sands".to_string(),
                location: "Singapore".to_string(),
                total_value: sale_cap,
                token_price_wei: U256::from(TOKEN_PRICE_WEI),
            },
            service_providers: HashSet::from([service_provider]),
            whitelist: HashSet::new(),
            balances: HashMap::new(),
            recovery_pool: U256::zero(),
            total_raised: U256::zero(),
            max_holding: U256::from(DEFAULT_MAX_HOLDING_TOKENS) * scale,
            sale_cap,
            block: 1,
            nonce: 0,
            pending: HashMap::new(),
            receipts: HashMap::new(),
            event_subscribers: Vec::new(),
            receipt_watchers: HashMap::new(),
            reject_next_signature: false,
            fail_next_transport: None,
            auto_mine: None,
        };
        Ok(Self {
            inner: Arc::new(Inner {
                contracts,
                interface: bundled_interface()?,
                state: Mutex::new(state),
            }),
        })
    }

    pub fn contracts(&self) -> Contracts {
        self.inner.contracts
    }

    pub fn interface(&self) -> &InterfaceDescription {
        &self.inner.interface
    }

    /// Mine every submission automatically after `delay`, receipt first
    pub fn set_auto_mine(&self, delay: Option<Duration>) {
        self.inner.state.lock().auto_mine = delay;
    }

    pub fn grant_service_provider(&self, account: SubjectKey) {
        self.inner.state.lock().service_providers.insert(account);
    }

    /// Seed the whitelist directly, without a write
    pub fn seed_whitelist(&self, subject: SubjectKey) {
        self.inner.state.lock().whitelist.insert(subject);
    }

    /// Seed a token balance directly, without a write
    pub fn seed_balance(&self, subject: SubjectKey, balance: U256) {
        self.inner.state.lock().balances.insert(subject, balance);
    }

    pub fn set_max_holding(&self, max_holding: U256) {
        self.inner.state.lock().max_holding = max_holding;
    }

    pub fn set_sale_cap(&self, cap: U256) {
        self.inner.state.lock().sale_cap = cap;
    }

    /// The next `submit` is declined by the signer
    pub fn reject_next_signature(&self) {
        self.inner.state.lock().reject_next_signature = true;
    }

    /// The next `simulate` or `submit` fails at the transport layer
    pub fn fail_next_transport(&self, reason: impl Into<String>) {
        self.inner.state.lock().fail_next_transport = Some(reason.into());
    }

    pub fn pending_handles(&self) -> Vec<Handle> {
        self.inner.state.lock().pending.keys().copied().collect()
    }

    pub fn current_block(&self) -> u64 {
        self.inner.state.lock().block
    }

    /// Execute a pending write and report it through the chosen channels.
    ///
    /// Returns `None` if `handle` is not pending.
    pub fn mine(&self, handle: &Handle, order: DeliveryOrder) -> Option<MineOutcome> {
        let mut state = self.inner.state.lock();
        let request = state.pending.remove(handle)?;
        state.block += 1;
        let block = state.block;
        Self::release_expired(&mut state);

        let outcome = match self.execute(&mut state, &request.call, true) {
            Ok(Some(mut record)) => {
                record.transaction_hash = Some(*handle);
                record.block = block;
                MineOutcome::Success(record)
            }
            Ok(None) => return None,
            Err(payload) => MineOutcome::Reverted(payload),
        };
        debug!(handle = %handle, block, outcome = ?outcome, "Mined simulated write");

        let receipts = match &outcome {
            MineOutcome::Success(_) => vec![ReceiptUpdate::Mined { block }, ReceiptUpdate::Success { block }],
            MineOutcome::Reverted(payload) => vec![ReceiptUpdate::Reverted(payload.clone())],
        };
        let event = match &outcome {
            MineOutcome::Success(record) => Some(record.clone()),
            MineOutcome::Reverted(_) => None,
        };

        if order == DeliveryOrder::EventFirst {
            if let Some(record) = &event {
                Self::broadcast_event(&mut state, record.clone());
            }
        }
        if order.sends_receipt() {
            for update in receipts {
                Self::deliver_receipt(&mut state, *handle, update);
            }
        }
        if order.sends_event() && order != DeliveryOrder::EventFirst {
            if let Some(record) = event {
                Self::broadcast_event(&mut state, record);
            }
        }
        Some(outcome)
    }

    /// Inject a notification into the event feed
    pub fn emit_event(&self, record: LogRecord) {
        let mut state = self.inner.state.lock();
        Self::broadcast_event(&mut state, record);
    }

    /// Inject a receipt update for `handle`
    pub fn publish_receipt(&self, handle: &Handle, update: ReceiptUpdate) {
        let mut state = self.inner.state.lock();
        Self::deliver_receipt(&mut state, *handle, update);
    }

    fn broadcast_event(state: &mut State, record: LogRecord) {
        state.event_subscribers.retain(|(notification, tx)| {
            if *notification != record.notification {
                return !tx.is_closed();
            }
            tx.send(vec![record.clone()]).is_ok()
        });
    }

    fn deliver_receipt(state: &mut State, handle: Handle, update: ReceiptUpdate) {
        let terminal = !matches!(update, ReceiptUpdate::Mined { .. });
        let block = state.block;
        let history = state.receipts.entry(handle).or_default();
        history.updates.push(update.clone());
        if terminal && history.finished_at.is_none() {
            history.finished_at = Some(block);
        }
        if let Some(watchers) = state.receipt_watchers.get_mut(&handle) {
            watchers.retain(|tx| tx.send(update.clone()).is_ok());
        }
        if terminal {
            // Ends the watchers' streams
            state.receipt_watchers.remove(&handle);
        }
    }

    /// Drop receipts finished more than [`RECEIPT_HISTORY_BLOCKS`] ago and
    /// every subscriber whose stream was dropped
    fn release_expired(state: &mut State) {
        let block = state.block;
        state.receipts.retain(|_, history| {
            history
                .finished_at
                .map_or(true, |at| block.saturating_sub(at) <= RECEIPT_HISTORY_BLOCKS)
        });
        state.event_subscribers.retain(|(_, tx)| !tx.is_closed());
        state.receipt_watchers.retain(|_, watchers| {
            watchers.retain(|tx| !tx.is_closed());
            !watchers.is_empty()
        });
    }

    fn revert(&self, error: &str, args: &[AbiValue]) -> RejectPayload {
        match self.inner.interface.encode_error(error, args) {
            Ok(data) => RejectPayload::new(Some(data), format!("execution reverted: {}", error)),
            Err(e) => RejectPayload::from_message(format!("execution reverted: {} ({})", error, e)),
        }
    }

    fn access_denied(&self, account: SubjectKey) -> RejectPayload {
        let role = keccak256(b"SERVICE_PROVIDER_ROLE").to_vec();
        self.revert(
            "AccessControlUnauthorizedAccount",
            &[AbiValue::Address(account), AbiValue::FixedBytes(role)],
        )
    }

    /// Check `call` against `state` and, when `commit`, apply it.
    ///
    /// `Ok(None)` means the call targets nothing this ledger implements.
    fn execute(
        &self,
        state: &mut State,
        call: &LedgerCall,
        commit: bool,
    ) -> Result<Option<LogRecord>, RejectPayload> {
        let address_arg = |i: usize| match call.args.get(i) {
            Some(AbiValue::Address(a)) => Some(*a),
            _ => None,
        };
        let uint_arg = |i: usize| call.args.get(i).and_then(AbiValue::as_uint);
        let mut fields = BTreeMap::new();

        let kind = match (call.role, call.function) {
            (ContractRole::Manager, "whitelistInvestor") => {
                let investor = address_arg(0).ok_or_else(|| RejectPayload::from_message("bad arguments"))?;
                if !state.service_providers.contains(&call.from) {
                    return Err(self.access_denied(call.from));
                }
                if commit {
                    state.whitelist.insert(investor);
                }
                fields.insert("investor".to_string(), investor.to_string());
                OperationKind::Authorize
            }
            (ContractRole::Manager, "blacklistInvestor") => {
                let investor = address_arg(0).ok_or_else(|| RejectPayload::from_message("bad arguments"))?;
                if !state.service_providers.contains(&call.from) {
                    return Err(self.access_denied(call.from));
                }
                let balance = state.balances.get(&investor).copied().unwrap_or_default();
                if !balance.is_zero() {
                    return Err(self.revert(
                        "BlacklistRequiresZeroBalance",
                        &[AbiValue::Address(investor), AbiValue::Uint(balance)],
                    ));
                }
                if commit {
                    state.whitelist.remove(&investor);
                }
                fields.insert("investor".to_string(), investor.to_string());
                OperationKind::Revoke
            }
            (ContractRole::Token, "purchaseTokens") => {
                let buyer = call.from;
                let value = call.value.unwrap_or_default();
                if !state.whitelist.contains(&buyer) {
                    return Err(self.revert("NotWhitelisted", &[AbiValue::Address(buyer)]));
                }
                if value < U256::from(TOKEN_PRICE_WEI) {
                    return Err(self.revert("InvalidAmount", &[]));
                }
                if state.total_raised.saturating_add(value) > state.sale_cap {
                    return Err(self.revert("CapExceeded", &[]));
                }
                let tokens = value * U256::exp10(TOKEN_DECIMALS) / U256::from(TOKEN_PRICE_WEI);
                let held = state.balances.get(&buyer).copied().unwrap_or_default();
                let attempted = held.saturating_add(tokens);
                if attempted > state.max_holding {
                    return Err(self.revert(
                        "ExceedsMaxHolding",
                        &[AbiValue::Uint(attempted), AbiValue::Uint(state.max_holding)],
                    ));
                }
                if commit {
                    state.balances.insert(buyer, attempted);
                    state.total_raised = state.total_raised.saturating_add(value);
                }
                fields.insert("buyer".to_string(), buyer.to_string());
                fields.insert("amount".to_string(), tokens.to_string());
                fields.insert("cost".to_string(), value.to_string());
                OperationKind::Purchase
            }
            (ContractRole::Token, "clawbackTokens") => {
                let (investor, amount) = match (address_arg(0), uint_arg(1)) {
                    (Some(investor), Some(amount)) => (investor, amount),
                    _ => return Err(RejectPayload::from_message("bad arguments")),
                };
                if !state.service_providers.contains(&call.from) {
                    return Err(self.access_denied(call.from));
                }
                let balance = state.balances.get(&investor).copied().unwrap_or_default();
                if balance < amount {
                    return Err(self.revert(
                        "ERC20InsufficientBalance",
                        &[
                            AbiValue::Address(investor),
                            AbiValue::Uint(balance),
                            AbiValue::Uint(amount),
                        ],
                    ));
                }
                if commit {
                    state.balances.insert(investor, balance - amount);
                    state.recovery_pool = state.recovery_pool.saturating_add(amount);
                }
                fields.insert("from".to_string(), investor.to_string());
                fields.insert("amount".to_string(), amount.to_string());
                OperationKind::Reclaim
            }
            _ => return Ok(None),
        };

        Ok(Some(LogRecord {
            notification: kind.notification().to_string(),
            fields,
            transaction_hash: None,
            block: state.block,
        }))
    }

    fn next_handle(state: &mut State, from: &SubjectKey) -> Handle {
        state.nonce += 1;
        let mut preimage = from.as_bytes().to_vec();
        preimage.extend_from_slice(&state.nonce.to_be_bytes());
        Handle::from_bytes(keccak256(&preimage))
    }
}

#[async_trait]
impl LedgerWriter for SimulatedLedger {
    async fn simulate(&self, call: &LedgerCall) -> Result<PreparedRequest, LedgerRejection> {
        let mut state = self.inner.state.lock();
        if let Some(reason) = state.fail_next_transport.take() {
            return Err(LedgerRejection::Transport(reason));
        }
        match self.execute(&mut state, call, false) {
            Ok(Some(_)) => Ok(PreparedRequest {
                call: call.clone(),
                gas_limit: Some(SIMULATED_GAS_LIMIT),
            }),
            Ok(None) => Err(LedgerRejection::Reverted(RejectPayload::from_message(format!(
                "function {} does not exist",
                call.function
            )))),
            Err(payload) => Err(LedgerRejection::Reverted(payload)),
        }
    }

    async fn submit(&self, request: PreparedRequest) -> Result<Handle, LedgerRejection> {
        let (handle, auto_mine) = {
            let mut state = self.inner.state.lock();
            if let Some(reason) = state.fail_next_transport.take() {
                return Err(LedgerRejection::Transport(reason));
            }
            if std::mem::take(&mut state.reject_next_signature) {
                return Err(LedgerRejection::UserRejected);
            }
            let handle = Self::next_handle(&mut state, &request.call.from);
            state.pending.insert(handle, request);
            (handle, state.auto_mine)
        };

        if let Some(delay) = auto_mine {
            let ledger = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(outcome) = ledger.mine(&handle, DeliveryOrder::ReceiptFirst) {
                    info!(handle = %handle, success = matches!(outcome, MineOutcome::Success(_)), "Auto-mined write");
                }
            });
        }
        Ok(handle)
    }
}

impl EventSource for SimulatedLedger {
    fn subscribe(&self, notification: &str) -> BoxStream<'static, Vec<LogRecord>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.inner.state.lock();
        Self::release_expired(&mut state);
        state.event_subscribers.push((notification.to_string(), tx));
        receiver_stream(rx)
    }
}

impl ReceiptSource for SimulatedLedger {
    fn watch_receipt(&self, handle: &Handle) -> BoxStream<'static, ReceiptUpdate> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.inner.state.lock();
        Self::release_expired(&mut state);
        let (history, finished) = state
            .receipts
            .get(handle)
            .map(|h| (h.updates.clone(), h.finished_at.is_some()))
            .unwrap_or_default();
        for update in history {
            let _ = tx.send(update);
        }
        if !finished {
            state.receipt_watchers.entry(*handle).or_default().push(tx);
        }
        receiver_stream(rx)
    }
}

#[async_trait]
impl LedgerReader for SimulatedLedger {
    async fn is_authorized(&self, subject: &SubjectKey) -> Result<bool, LedgerRejection> {
        Ok(self.inner.state.lock().whitelist.contains(subject))
    }

    async fn balance_of(&self, subject: &SubjectKey) -> Result<U256, LedgerRejection> {
        Ok(self
            .inner
            .state
            .lock()
            .balances
            .get(subject)
            .copied()
            .unwrap_or_default())
    }

    async fn max_holding(&self) -> Result<U256, LedgerRejection> {
        Ok(self.inner.state.lock().max_holding)
    }

    async fn recovery_pool_balance(&self) -> Result<U256, LedgerRejection> {
        Ok(self.inner.state.lock().recovery_pool)
    }

    async fn role_of(&self, subject: &SubjectKey) -> Result<AccountRole, LedgerRejection> {
        let state = self.inner.state.lock();
        Ok(AccountRole::from_flags(
            state.service_providers.contains(subject),
            state.whitelist.contains(subject),
        ))
    }

    async fn sale_status(&self) -> Result<SaleStatus, LedgerRejection> {
        let state = self.inner.state.lock();
        let total_supply = state
            .balances
            .values()
            .fold(state.recovery_pool, |sum, balance| sum.saturating_add(*balance));
        Ok(SaleStatus {
            property: Some(state.property.clone()),
            total_supply,
            total_raised: state.total_raised,
            oversubscribed: state.total_raised >= state.sale_cap,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error_decoder::ErrorDecoder;
    use crate::types::Amount;
    use futures::StreamExt;

    const PROVIDER: SubjectKey = SubjectKey::from_bytes([0x01; 20]);
    const INVESTOR: SubjectKey = SubjectKey::from_bytes([0x02; 20]);

    fn contracts() -> Contracts {
        Contracts {
            token: SubjectKey::from_bytes([0xaa; 20]),
            manager: SubjectKey::from_bytes([0xbb; 20]),
        }
    }

    fn ledger() -> SimulatedLedger {
        SimulatedLedger::new(contracts(), PROVIDER).unwrap()
    }

    fn eth(n: u64) -> Option<Amount> {
        Amount::from_base_units(U256::from(n) * U256::exp10(18))
    }

    fn call(kind: OperationKind, subject: SubjectKey, amount: Option<Amount>, from: SubjectKey) -> LedgerCall {
        LedgerCall::for_operation(kind, subject, amount, from, &contracts())
    }

    fn reason(ledger: &SimulatedLedger, rejection: LedgerRejection) -> String {
        match rejection {
            LedgerRejection::Reverted(payload) => {
                ErrorDecoder::default().describe(&payload, Some(ledger.interface()))
            }
            other => panic!("expected a revert, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_whitelist_requires_service_provider() {
        let ledger = ledger();
        let err = ledger
            .simulate(&call(OperationKind::Authorize, INVESTOR, None, INVESTOR))
            .await
            .unwrap_err();
        assert_eq!(reason(&ledger, err), "Only service provider can execute this operation");

        let request = ledger
            .simulate(&call(OperationKind::Authorize, INVESTOR, None, PROVIDER))
            .await
            .unwrap();
        let handle = ledger.submit(request).await.unwrap();
        assert!(!ledger.is_authorized(&INVESTOR).await.unwrap());
        assert!(matches!(
            ledger.mine(&handle, DeliveryOrder::ReceiptFirst),
            Some(MineOutcome::Success(_))
        ));
        assert!(ledger.is_authorized(&INVESTOR).await.unwrap());
        assert!(ledger.mine(&handle, DeliveryOrder::ReceiptFirst).is_none());
    }

    #[tokio::test]
    async fn test_purchase_rules() {
        let ledger = ledger();
        let err = ledger
            .simulate(&call(OperationKind::Purchase, INVESTOR, eth(1), INVESTOR))
            .await
            .unwrap_err();
        assert_eq!(reason(&ledger, err), "Wallet is not whitelisted");

        ledger.seed_whitelist(INVESTOR);
        let err = ledger
            .simulate(&call(OperationKind::Purchase, INVESTOR, Amount::from_base_units(1000u64), INVESTOR))
            .await
            .unwrap_err();
        assert_eq!(reason(&ledger, err), "Invalid amount sent");

        let err = ledger
            .simulate(&call(OperationKind::Purchase, INVESTOR, eth(6), INVESTOR))
            .await
            .unwrap_err();
        assert_eq!(
            reason(&ledger, err),
            "Exceeds maximum holding limit (max 5,000 MBST)"
        );

        ledger.set_sale_cap(U256::exp10(18));
        let err = ledger
            .simulate(&call(OperationKind::Purchase, INVESTOR, eth(2), INVESTOR))
            .await
            .unwrap_err();
        assert_eq!(reason(&ledger, err), "Sale hard cap reached");
    }

    #[tokio::test]
    async fn test_blacklist_requires_zero_balance_and_clawback_fills_pool() {
        let ledger = ledger();
        let tokens = U256::from(10u64) * U256::exp10(18);
        ledger.seed_balance(INVESTOR, tokens);

        let err = ledger
            .simulate(&call(OperationKind::Revoke, INVESTOR, None, PROVIDER))
            .await
            .unwrap_err();
        assert_eq!(reason(&ledger, err), "Cannot blacklist investor with non-zero balance");

        let reclaim = call(
            OperationKind::Reclaim,
            INVESTOR,
            Amount::from_base_units(tokens),
            PROVIDER,
        );
        let handle = ledger.submit(ledger.simulate(&reclaim).await.unwrap()).await.unwrap();
        ledger.mine(&handle, DeliveryOrder::Silent);
        assert_eq!(ledger.balance_of(&INVESTOR).await.unwrap(), U256::zero());
        assert_eq!(ledger.recovery_pool_balance().await.unwrap(), tokens);
    }

    #[tokio::test]
    async fn test_channels_report_in_requested_order() {
        let ledger = ledger();
        ledger.seed_whitelist(INVESTOR);
        let request = ledger
            .simulate(&call(OperationKind::Purchase, INVESTOR, eth(1), INVESTOR))
            .await
            .unwrap();
        let handle = ledger.submit(request).await.unwrap();

        let mut events = ledger.subscribe("TokensPurchased");
        let mut other = ledger.subscribe("TokensClawedBack");
        let mut receipts = ledger.watch_receipt(&handle);
        ledger.mine(&handle, DeliveryOrder::EventOnly);

        let batch = events.next().await.unwrap();
        assert_eq!(batch[0].transaction_hash, Some(handle));
        assert!(batch[0].confirms(OperationKind::Purchase, &INVESTOR, &handle));
        // The receipt watcher stays open with nothing to report
        assert!(futures::poll!(receipts.next()).is_pending());
        drop(ledger);
        assert!(other.next().await.is_none());
    }

    #[tokio::test]
    async fn test_receipt_history_is_replayed() {
        let ledger = ledger();
        let request = ledger
            .simulate(&call(OperationKind::Authorize, INVESTOR, None, PROVIDER))
            .await
            .unwrap();
        let handle = ledger.submit(request).await.unwrap();
        ledger.mine(&handle, DeliveryOrder::ReceiptOnly);

        let updates: Vec<ReceiptUpdate> = ledger.watch_receipt(&handle).collect().await;
        assert!(matches!(updates.as_slice(), [ReceiptUpdate::Mined { .. }, ReceiptUpdate::Success { .. }]));
    }

    #[tokio::test]
    async fn test_finished_receipts_expire_after_history_window() {
        let ledger = ledger();
        let authorize = call(OperationKind::Authorize, INVESTOR, None, PROVIDER);
        let first = ledger.submit(ledger.simulate(&authorize).await.unwrap()).await.unwrap();
        ledger.mine(&first, DeliveryOrder::ReceiptOnly);
        assert_eq!(ledger.inner.state.lock().receipts.len(), 1);

        ledger.inner.state.lock().block += RECEIPT_HISTORY_BLOCKS;
        let second = ledger.submit(ledger.simulate(&authorize).await.unwrap()).await.unwrap();
        ledger.mine(&second, DeliveryOrder::ReceiptOnly);
        {
            let state = ledger.inner.state.lock();
            assert_eq!(state.receipts.len(), 1);
            assert!(state.receipts.contains_key(&second));
        }

        // Nothing left to replay for the expired handle
        let mut expired = ledger.watch_receipt(&first);
        assert!(futures::poll!(expired.next()).is_pending());
        let updates: Vec<ReceiptUpdate> = ledger.watch_receipt(&second).collect().await;
        assert_eq!(updates.len(), 2);
    }

    #[tokio::test]
    async fn test_dropped_subscriptions_are_released() {
        let ledger = ledger();
        let stale = ledger.subscribe("TokensPurchased");
        let _kept = ledger.subscribe("InvestorWhitelisted");
        let request = ledger
            .simulate(&call(OperationKind::Authorize, INVESTOR, None, PROVIDER))
            .await
            .unwrap();
        let handle = ledger.submit(request).await.unwrap();
        let receipts = ledger.watch_receipt(&handle);
        drop(stale);
        drop(receipts);

        let _live = ledger.subscribe("TokensClawedBack");
        let state = ledger.inner.state.lock();
        assert_eq!(state.event_subscribers.len(), 2);
        assert!(state.receipt_watchers.is_empty());
    }

    #[tokio::test]
    async fn test_role_and_sale_status_follow_writes() {
        let ledger = ledger();
        assert_eq!(ledger.role_of(&PROVIDER).await.unwrap(), AccountRole::ServiceProvider);
        assert_eq!(ledger.role_of(&INVESTOR).await.unwrap(), AccountRole::NonWhitelisted);
        assert_eq!(ledger.role_of_account(None).await.unwrap(), AccountRole::Disconnected);

        ledger.seed_whitelist(INVESTOR);
        assert_eq!(
            ledger.role_of_account(Some(&INVESTOR)).await.unwrap(),
            AccountRole::Whitelisted
        );

        let status = ledger.sale_status().await.unwrap();
        assert!(status.total_supply.is_zero());
        assert!(!status.oversubscribed);

        ledger.set_sale_cap(U256::from(2u64) * U256::exp10(18));
        let purchase = call(OperationKind::Purchase, INVESTOR, eth(2), INVESTOR);
        let handle = ledger.submit(ledger.simulate(&purchase).await.unwrap()).await.unwrap();
        ledger.mine(&handle, DeliveryOrder::Silent);

        let status = ledger.sale_status().await.unwrap();
        assert_eq!(status.total_raised, U256::from(2u64) * U256::exp10(18));
        assert_eq!(status.total_supply, U256::from(2_000u64) * U256::exp10(18));
        assert!(status.oversubscribed);
        assert_eq!(
            status.property.map(|p| p.token_price_wei),
            Some(U256::from(TOKEN_PRICE_WEI))
        );
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let ledger = ledger();
        ledger.fail_next_transport("connection reset");
        let authorize = call(OperationKind::Authorize, INVESTOR, None, PROVIDER);
        assert!(matches!(
            ledger.simulate(&authorize).await,
            Err(LedgerRejection::Transport(_))
        ));

        let request = ledger.simulate(&authorize).await.unwrap();
        ledger.reject_next_signature();
        assert_eq!(
            ledger.submit(request.clone()).await,
            Err(LedgerRejection::UserRejected)
        );
        assert!(ledger.submit(request).await.is_ok());
    }
}
