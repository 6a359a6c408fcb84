//! Ledger collaborators
//!
//! The engine never talks to a ledger directly. It goes through four seams:
//! [`LedgerWriter`] to dry-run and submit, [`EventSource`] and [`ReceiptSource`]
//! for the two confirmation channels, and [`LedgerReader`] for the scoped
//! read-state the invalidator points at, the acting account's role and the
//! sale status.
//!
//! Adapters:
//! - [`rpc::RpcLedger`]: JSON-RPC over HTTP
//! - [`simulated::SimulatedLedger`]: in-memory, rule-enforcing ledger for tests and dry runs

#[cfg(feature = "rpc-ledger")]
pub mod rpc;
pub mod simulated;

use crate::abi::AbiValue;
use crate::errors::LedgerRejection;
use crate::types::{Amount, Handle, OperationKind, RejectPayload, SubjectKey};
use async_trait::async_trait;
use futures::stream::BoxStream;
use primitive_types::U256;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Which deployed contract a call goes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContractRole {
    /// The token sale contract
    Token,
    /// The compliance manager holding the whitelist and the recovery pool
    Manager,
}

/// Deployed contract addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contracts {
    pub token: SubjectKey,
    pub manager: SubjectKey,
}

impl Contracts {
    pub fn address(&self, role: ContractRole) -> SubjectKey {
        match role {
            ContractRole::Token => self.token,
            ContractRole::Manager => self.manager,
        }
    }

    /// Contract that emits the completion notification of `kind`
    pub(crate) fn emitter(kind: OperationKind) -> ContractRole {
        match kind {
            OperationKind::Authorize | OperationKind::Revoke => ContractRole::Manager,
            OperationKind::Purchase | OperationKind::Reclaim => ContractRole::Token,
        }
    }
}

/// A write, fully described, before simulation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerCall {
    /// Acting account
    pub from: SubjectKey,
    pub role: ContractRole,
    pub to: SubjectKey,
    pub function: &'static str,
    pub args: Vec<AbiValue>,
    /// Native value attached to a payable call
    pub value: Option<U256>,
}

impl LedgerCall {
    /// The contract call that performs `kind` on `subject`
    pub fn for_operation(
        kind: OperationKind,
        subject: SubjectKey,
        amount: Option<Amount>,
        from: SubjectKey,
        contracts: &Contracts,
    ) -> Self {
        let (role, function, args, value) = match kind {
            OperationKind::Authorize => (
                ContractRole::Manager,
                "whitelistInvestor",
                vec![AbiValue::Address(subject)],
                None,
            ),
            OperationKind::Revoke => (
                ContractRole::Manager,
                "blacklistInvestor",
                vec![AbiValue::Address(subject)],
                None,
            ),
            OperationKind::Purchase => (
                ContractRole::Token,
                "purchaseTokens",
                Vec::new(),
                amount.map(|a| a.value()),
            ),
            OperationKind::Reclaim => (
                ContractRole::Token,
                "clawbackTokens",
                vec![
                    AbiValue::Address(subject),
                    AbiValue::Uint(amount.map(|a| a.value()).unwrap_or_default()),
                ],
                None,
            ),
        };
        Self {
            from,
            role,
            to: contracts.address(role),
            function,
            args,
            value,
        }
    }
}

/// A call that passed simulation and is ready to submit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedRequest {
    pub call: LedgerCall,
    pub gas_limit: Option<u64>,
}

/// Progress reported by the receipt channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiptUpdate {
    /// Included in a block, still awaiting the confirmation depth
    Mined { block: u64 },
    Success { block: u64 },
    Reverted(RejectPayload),
}

/// A decoded ledger notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub notification: String,
    /// Field name to rendered value; addresses are lowercase `0x` hex
    pub fields: BTreeMap<String, String>,
    pub transaction_hash: Option<Handle>,
    pub block: u64,
}

impl LogRecord {
    /// Whether this record confirms the operation `kind` on `subject` under `handle`
    pub fn confirms(&self, kind: OperationKind, subject: &SubjectKey, handle: &Handle) -> bool {
        if self.notification != kind.notification() {
            return false;
        }
        let subject_matches = self
            .fields
            .get(kind.subject_field())
            .map_or(false, |value| subject.matches_str(value));
        let hash_matches = self.transaction_hash.map_or(true, |h| h == *handle);
        subject_matches && hash_matches
    }
}

/// Standing of an account with the compliance manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountRole {
    ServiceProvider,
    Whitelisted,
    NonWhitelisted,
    /// No acting account
    Disconnected,
}

impl AccountRole {
    /// The service-provider grant takes precedence over whitelist membership
    pub fn from_flags(service_provider: bool, whitelisted: bool) -> Self {
        if service_provider {
            Self::ServiceProvider
        } else if whitelisted {
            Self::Whitelisted
        } else {
            Self::NonWhitelisted
        }
    }

    /// Whether an account in this role may attempt `kind`.
    ///
    /// Purchase eligibility is left to simulation, which reports the reason.
    pub fn permits(self, kind: OperationKind) -> bool {
        match kind {
            OperationKind::Purchase => self != Self::Disconnected,
            OperationKind::Authorize | OperationKind::Revoke | OperationKind::Reclaim => {
                self == Self::ServiceProvider
            }
        }
    }
}

impl fmt::Display for AccountRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::ServiceProvider => "service provider",
            Self::Whitelisted => "whitelisted",
            Self::NonWhitelisted => "not whitelisted",
            Self::Disconnected => "disconnected",
        };
        f.write_str(label)
    }
}

/// Descriptive data of the tokenized asset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyInfo {
    pub name: String,
    pub location: String,
    /// In wei
    pub total_value: U256,
    pub token_price_wei: U256,
}

impl PropertyInfo {
    /// From the `(name, location, totalValue, tokenPriceWei)` return tuple
    pub fn from_values(values: &[AbiValue]) -> Option<Self> {
        match values {
            [AbiValue::String(name), AbiValue::String(location), AbiValue::Uint(total_value), AbiValue::Uint(token_price_wei)] => {
                Some(Self {
                    name: name.clone(),
                    location: location.clone(),
                    total_value: *total_value,
                    token_price_wei: *token_price_wei,
                })
            }
            _ => None,
        }
    }
}

/// Progress of the token sale
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaleStatus {
    /// `None` when the token contract does not describe its asset
    pub property: Option<PropertyInfo>,
    pub total_supply: U256,
    /// In wei
    pub total_raised: U256,
    pub oversubscribed: bool,
}

/// Scoped reads the invalidator's keys map to, plus role and sale status
#[async_trait]
pub trait LedgerReader: Send + Sync {
    async fn is_authorized(&self, subject: &SubjectKey) -> Result<bool, LedgerRejection>;

    async fn balance_of(&self, subject: &SubjectKey) -> Result<U256, LedgerRejection>;

    async fn max_holding(&self) -> Result<U256, LedgerRejection>;

    /// Tokens reclaimed into the compliance manager
    async fn recovery_pool_balance(&self) -> Result<U256, LedgerRejection>;

    async fn role_of(&self, subject: &SubjectKey) -> Result<AccountRole, LedgerRejection>;

    /// Role of the acting account; `Disconnected` without one
    async fn role_of_account(&self, account: Option<&SubjectKey>) -> Result<AccountRole, LedgerRejection> {
        match account {
            Some(subject) => self.role_of(subject).await,
            None => Ok(AccountRole::Disconnected),
        }
    }

    async fn sale_status(&self) -> Result<SaleStatus, LedgerRejection>;
}

#[async_trait]
pub trait LedgerWriter: Send + Sync {
    /// Dry-run `call` against current ledger state
    async fn simulate(&self, call: &LedgerCall) -> Result<PreparedRequest, LedgerRejection>;

    /// Sign and broadcast a prepared request; returns the ledger-assigned handle
    async fn submit(&self, request: PreparedRequest) -> Result<Handle, LedgerRejection>;
}

/// Notification feed
///
/// The subscription is live as soon as `subscribe` returns; dropping the
/// stream unsubscribes.
pub trait EventSource: Send + Sync {
    fn subscribe(&self, notification: &str) -> BoxStream<'static, Vec<LogRecord>>;
}

/// Receipt channel for one handle; the stream ends after a terminal update
pub trait ReceiptSource: Send + Sync {
    fn watch_receipt(&self, handle: &Handle) -> BoxStream<'static, ReceiptUpdate>;
}

/// Adapt an mpsc receiver fed by a producer task into a stream
pub(crate) fn receiver_stream<T: Send + 'static>(
    rx: tokio::sync::mpsc::UnboundedReceiver<T>,
) -> BoxStream<'static, T> {
    use futures::StreamExt;

    futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) })
        .boxed()
}
