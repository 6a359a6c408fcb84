//! Common types used throughout the reconciliation engine

use crate::errors::{SubmissionError, TransitionError};
use primitive_types::U256;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Address of the entity an operation concerns (an investor, a buyer, ...)
///
/// Stored as raw bytes so comparisons are case-insensitive with respect to the
/// hex text the ledger and callers hand us.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SubjectKey([u8; 20]);

impl SubjectKey {
    pub const fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Parse a `0x`-prefixed, 40 hex digit address. Mixed case is accepted.
    pub fn parse(input: &str) -> Result<Self, SubmissionError> {
        let digits = strip_hex_prefix(input.trim()).ok_or_else(|| {
            SubmissionError::invalid_input(format!("subject '{}' is missing the 0x prefix", input))
        })?;
        if digits.len() != 40 {
            return Err(SubmissionError::invalid_input(format!(
                "subject '{}' must be 20 bytes of hex",
                input
            )));
        }
        let mut bytes = [0u8; 20];
        hex::decode_to_slice(digits, &mut bytes).map_err(|e| {
            SubmissionError::invalid_input(format!("subject '{}' is not valid hex: {}", input, e))
        })?;
        Ok(Self(bytes))
    }

    /// Case-insensitive comparison against a textual address from the event feed
    pub fn matches_str(&self, other: &str) -> bool {
        Self::parse(other).map(|key| key == *self).unwrap_or(false)
    }

    pub(crate) fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for SubjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for SubjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubjectKey({})", self)
    }
}

impl TryFrom<String> for SubjectKey {
    type Error = SubmissionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SubjectKey> for String {
    fn from(key: SubjectKey) -> Self {
        key.to_string()
    }
}

/// Opaque identifier the ledger assigns to a submitted write (a transaction hash)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle([u8; 32]);

impl Handle {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn parse(input: &str) -> Option<Self> {
        let digits = strip_hex_prefix(input.trim())?;
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(digits, &mut bytes).ok()?;
        Some(Self(bytes))
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form keeps log lines readable
        let text = hex::encode(self.0);
        write!(f, "Handle(0x{}..{})", &text[..8], &text[56..])
    }
}

/// Positive integral amount in the ledger's base unit (wei)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Amount(U256);

impl Amount {
    /// Parse a decimal base-unit string. Signs, fractions, exponents and zero are rejected.
    pub fn parse(input: &str) -> Result<Self, SubmissionError> {
        let trimmed = input.trim();
        if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(SubmissionError::invalid_input(format!(
                "amount '{}' must be a positive integer in base units",
                input
            )));
        }
        let value = U256::from_dec_str(trimmed).map_err(|_| {
            SubmissionError::invalid_input(format!("amount '{}' does not fit in 256 bits", input))
        })?;
        if value.is_zero() {
            return Err(SubmissionError::invalid_input("amount must be greater than zero"));
        }
        Ok(Self(value))
    }

    pub fn from_base_units(value: impl Into<U256>) -> Option<Self> {
        let value = value.into();
        (!value.is_zero()).then_some(Self(value))
    }

    pub fn value(&self) -> U256 {
        self.0
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The four write operations the engine knows how to reconcile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OperationKind {
    Authorize,
    Revoke,
    Purchase,
    Reclaim,
}

impl OperationKind {
    pub const ALL: [OperationKind; 4] = [
        OperationKind::Authorize,
        OperationKind::Revoke,
        OperationKind::Purchase,
        OperationKind::Reclaim,
    ];

    /// Ledger notification that announces completion of this kind
    pub fn notification(&self) -> &'static str {
        match self {
            Self::Authorize => "InvestorWhitelisted",
            Self::Revoke => "InvestorBlacklisted",
            Self::Purchase => "TokensPurchased",
            Self::Reclaim => "TokensClawedBack",
        }
    }

    /// Field of the notification that carries the subject address
    pub fn subject_field(&self) -> &'static str {
        match self {
            Self::Authorize | Self::Revoke => "investor",
            Self::Purchase => "buyer",
            Self::Reclaim => "from",
        }
    }

    pub fn requires_amount(&self) -> bool {
        matches!(self, Self::Purchase | Self::Reclaim)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Authorize => "authorize",
            Self::Revoke => "revoke",
            Self::Purchase => "purchase",
            Self::Reclaim => "reclaim",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Lifecycle of one operation
///
/// Transitions only move forward; the three terminal states absorb everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationState {
    Idle,
    Submitted,
    Pending,
    Confirmed,
    Failed,
    TimedOut,
}

impl OperationState {
    fn rank(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Submitted => 1,
            Self::Pending => 2,
            Self::Confirmed | Self::Failed | Self::TimedOut => 3,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 3
    }

    pub fn can_transition_to(self, next: OperationState) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }

    pub fn transition(self, next: OperationState) -> Result<OperationState, TransitionError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(TransitionError::Illegal {
                from: self,
                to: next,
            })
        }
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::Submitted => "submitted",
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Failed => "failed",
            Self::TimedOut => "timed-out",
        };
        f.write_str(label)
    }
}

/// Raw rejection returned by the ledger: optional structured revert data plus text
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RejectPayload {
    pub data: Option<Vec<u8>>,
    pub message: String,
}

impl RejectPayload {
    pub fn new(data: Option<Vec<u8>>, message: impl Into<String>) -> Self {
        Self {
            data,
            message: message.into(),
        }
    }

    pub fn from_message(message: impl Into<String>) -> Self {
        Self::new(None, message)
    }

    pub fn mentions_user_rejection(&self) -> bool {
        let lower = self.message.to_lowercase();
        lower.contains("user rejected") || lower.contains("user denied")
    }
}

/// Terminal outcome handed to a completion callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub handle: Handle,
    pub kind: OperationKind,
    pub subject: SubjectKey,
    pub state: OperationState,
    pub error_reason: Option<String>,
}

impl Completion {
    pub fn is_success(&self) -> bool {
        self.state == OperationState::Confirmed
    }
}

/// Completion callback, bound to at most one handle and invoked at most once
pub type CompletionCallback = Box<dyn FnOnce(&Completion) + Send + 'static>;

/// Render a base-unit amount in human units with thousands grouping and up to
/// three fractional digits, e.g. `5000 * 10^18` with 18 decimals -> `5,000`.
pub fn format_units(value: U256, decimals: u8) -> String {
    let scale = U256::exp10(decimals as usize);
    let whole = value / scale;
    let fraction = value % scale;

    let digits = whole.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }

    if fraction.is_zero() || decimals == 0 {
        return grouped;
    }
    let padded = format!("{:0>width$}", fraction.to_string(), width = decimals as usize);
    let shown: String = padded.chars().take(3).collect();
    let shown = shown.trim_end_matches('0');
    if shown.is_empty() {
        grouped
    } else {
        format!("{}.{}", grouped, shown)
    }
}

pub(crate) fn strip_hex_prefix(input: &str) -> Option<&str> {
    input
        .strip_prefix("0x")
        .or_else(|| input.strip_prefix("0X"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDR: &str = "0x70997970C51812dc3A010C7d01b50e0d17dc79C8";

    #[test]
    fn test_subject_parse_is_case_insensitive() {
        let mixed = SubjectKey::parse(ADDR).unwrap();
        let lower = SubjectKey::parse(&ADDR.to_lowercase()).unwrap();
        assert_eq!(mixed, lower);
        assert!(mixed.matches_str(&ADDR.to_uppercase().replacen("0X", "0x", 1)));
        assert_eq!(mixed.to_string(), ADDR.to_lowercase());
    }

    #[test]
    fn test_subject_parse_rejects_malformed() {
        assert!(SubjectKey::parse("70997970C51812dc3A010C7d01b50e0d17dc79C8").is_err());
        assert!(SubjectKey::parse("0x1234").is_err());
        assert!(SubjectKey::parse("0xZZ997970C51812dc3A010C7d01b50e0d17dc79C8").is_err());
    }

    #[test]
    fn test_amount_validation() {
        assert_eq!(Amount::parse("1000").unwrap().value(), U256::from(1000u64));
        assert!(Amount::parse("0").is_err());
        assert!(Amount::parse("-5").is_err());
        assert!(Amount::parse("1.5").is_err());
        assert!(Amount::parse("1e18").is_err());
        assert!(Amount::parse("").is_err());
    }

    #[test]
    fn test_state_transitions_are_monotonic() {
        use OperationState::*;
        assert!(Idle.can_transition_to(Submitted));
        assert!(Submitted.can_transition_to(Confirmed));
        assert!(Pending.can_transition_to(TimedOut));
        assert!(!Pending.can_transition_to(Submitted));
        assert!(!Pending.can_transition_to(Pending));
        assert!(!Confirmed.can_transition_to(Failed));
        assert!(TimedOut.transition(Confirmed).is_err());
    }

    #[test]
    fn test_format_units() {
        let wei = U256::exp10(18);
        assert_eq!(format_units(wei * U256::from(5000u64), 18), "5,000");
        assert_eq!(format_units(wei * U256::from(1_234_567u64), 18), "1,234,567");
        assert_eq!(format_units(wei / U256::from(2u64), 18), "0.5");
        assert_eq!(format_units(U256::from(999u64), 0), "999");
    }

    #[test]
    fn test_handle_roundtrip_display() {
        let handle = Handle::from_bytes([0xab; 32]);
        assert_eq!(Handle::parse(&handle.to_string()), Some(handle));
        assert!(Handle::parse("0x1234").is_none());
    }
}
