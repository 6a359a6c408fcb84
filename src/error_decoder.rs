//! Turns raw ledger rejections into human-readable reasons
//!
//! Three stages, each a fallback for the previous one:
//! 1. structured decode of the revert data against the interface description,
//! 2. substring matching of known reason tokens against the raw rejection text,
//! 3. a generic message prefixed with [`FALLBACK_LABEL`].
//!
//! Nothing in here returns an error or panics on hostile input; a payload that
//! cannot be understood simply has no decoded reason.

use crate::abi::{AbiValue, InterfaceDescription};
use crate::types::{format_units, RejectPayload};
use tracing::debug;

/// Prefix of the generic message used when no reason could be decoded
pub const FALLBACK_LABEL: &str = "Transaction failed: ";

/// Reasons with a dedicated human message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReasonName {
    ExceedsMaxHolding,
    NotWhitelisted,
    CapExceeded,
    InvalidAmount,
    BlacklistRequiresZeroBalance,
    AccessControl,
    NonceTooLow,
    /// Plain `Error(string)` revert
    Revert(String),
    /// Any other custom error, by name
    Custom(String),
}

impl ReasonName {
    fn from_error_name(name: &str) -> Self {
        match name {
            "ExceedsMaxHolding" => Self::ExceedsMaxHolding,
            "NotWhitelisted" => Self::NotWhitelisted,
            "CapExceeded" => Self::CapExceeded,
            "InvalidAmount" => Self::InvalidAmount,
            "BlacklistRequiresZeroBalance" => Self::BlacklistRequiresZeroBalance,
            "AccessControlUnauthorizedAccount" => Self::AccessControl,
            other => Self::Custom(other.to_string()),
        }
    }

    /// Match known tokens in free text, e.g. a node's error message
    fn from_text(text: &str) -> Option<Self> {
        let lower = text.to_lowercase();
        let reason = if lower.contains("exceedsmaxholding") || lower.contains("exceeds max holding") {
            Self::ExceedsMaxHolding
        } else if lower.contains("notwhitelisted") {
            Self::NotWhitelisted
        } else if lower.contains("capexceeded") || lower.contains("cap exceeded") {
            Self::CapExceeded
        } else if lower.contains("invalidamount") {
            Self::InvalidAmount
        } else if lower.contains("blacklistrequireszerobalance") {
            Self::BlacklistRequiresZeroBalance
        } else if lower.contains("accesscontrol") {
            Self::AccessControl
        } else if lower.contains("nonce too low") {
            Self::NonceTooLow
        } else {
            return None;
        };
        Some(reason)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedReason {
    pub name: ReasonName,
    pub args: Vec<AbiValue>,
}

impl DecodedReason {
    fn bare(name: ReasonName) -> Self {
        Self {
            name,
            args: Vec::new(),
        }
    }
}

/// Decoder bound to the display settings of the ledger's token
#[derive(Debug, Clone)]
pub struct ErrorDecoder {
    token_symbol: String,
    decimals: u8,
}

impl ErrorDecoder {
    pub fn new(token_symbol: impl Into<String>, decimals: u8) -> Self {
        Self {
            token_symbol: token_symbol.into(),
            decimals,
        }
    }

    /// Decode a rejection into a known reason, structured first, text second
    pub fn decode(
        &self,
        payload: &RejectPayload,
        interface: Option<&InterfaceDescription>,
    ) -> Option<DecodedReason> {
        let structured = match (payload.data.as_deref(), interface) {
            (Some(data), Some(interface)) => interface.decode_error(data),
            (Some(data), None) => InterfaceDescription::default().decode_error(data),
            _ => None,
        };

        match structured {
            Some((name, mut args)) if name == "Error" => {
                // A revert string may itself name a known reason
                let text = match args.pop() {
                    Some(AbiValue::String(s)) => s,
                    _ => String::new(),
                };
                Some(
                    ReasonName::from_text(&text)
                        .map(DecodedReason::bare)
                        .unwrap_or_else(|| DecodedReason::bare(ReasonName::Revert(text))),
                )
            }
            Some((name, args)) => Some(DecodedReason {
                name: ReasonName::from_error_name(&name),
                args,
            }),
            None => {
                if payload.data.is_some() {
                    debug!(message = %payload.message, "Revert data did not match the interface description");
                }
                ReasonName::from_text(&payload.message).map(DecodedReason::bare)
            }
        }
    }

    /// Human message for a decoded reason
    pub fn friendly_message(&self, name: &ReasonName, args: &[AbiValue]) -> String {
        match name {
            ReasonName::ExceedsMaxHolding => match args.get(1).and_then(AbiValue::as_uint) {
                Some(max) => format!(
                    "Exceeds maximum holding limit (max {} {})",
                    format_units(max, self.decimals),
                    self.token_symbol
                ),
                None => "Exceeds maximum holding limit".to_string(),
            },
            ReasonName::NotWhitelisted => "Wallet is not whitelisted".to_string(),
            ReasonName::CapExceeded => "Sale hard cap reached".to_string(),
            ReasonName::InvalidAmount => "Invalid amount sent".to_string(),
            ReasonName::BlacklistRequiresZeroBalance => {
                "Cannot blacklist investor with non-zero balance".to_string()
            }
            ReasonName::AccessControl => {
                "Only service provider can execute this operation".to_string()
            }
            ReasonName::NonceTooLow => {
                "Transaction nonce is out of sync. Please refresh and try again.".to_string()
            }
            ReasonName::Revert(text) if text.is_empty() => format!("{}Unknown error", FALLBACK_LABEL),
            ReasonName::Revert(text) => text.clone(),
            ReasonName::Custom(name) => name.clone(),
        }
    }

    /// Full pipeline: decoded reason if any, otherwise the generic fallback
    pub fn describe(
        &self,
        payload: &RejectPayload,
        interface: Option<&InterfaceDescription>,
    ) -> String {
        match self.decode(payload, interface) {
            Some(reason) => self.friendly_message(&reason.name, &reason.args),
            None => self.fallback(&payload.message),
        }
    }

    pub fn fallback(&self, raw: &str) -> String {
        let raw = raw.trim();
        if raw.is_empty() {
            format!("{}Unknown error", FALLBACK_LABEL)
        } else {
            format!("{}{}", FALLBACK_LABEL, raw)
        }
    }
}

impl Default for ErrorDecoder {
    fn default() -> Self {
        Self::new("MBST", 18)
    }
}
