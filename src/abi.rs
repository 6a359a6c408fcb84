//! Ledger interface descriptions
//!
//! Parses the JSON interface description of a contract (either a bare entry
//! array or an artifact object with an `abi` field) and provides the encoding
//! primitives the engine needs: function calldata, custom-error payloads, event
//! topics and log decoding. Only static parameter types plus `string`/`bytes`
//! are supported, which covers every entry point the engine uses.

use crate::types::SubjectKey;
use primitive_types::U256;
use serde::Deserialize;
use sha3::{Digest, Keccak256};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use thiserror::Error;

/// Selector of the built-in `Error(string)` revert
pub const ERROR_STRING_SELECTOR: [u8; 4] = [0x08, 0xc3, 0x79, 0xa0];

const WORD: usize = 32;

#[derive(Error, Debug)]
pub enum AbiError {
    #[error("Failed to read interface description {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed interface description: {0}")]
    Malformed(String),

    #[error("Unknown {kind} '{name}' with {arity} argument(s)")]
    UnknownEntry {
        kind: &'static str,
        name: String,
        arity: usize,
    },

    #[error("Argument {index} of '{name}' does not match parameter type {expected}")]
    ArgumentMismatch {
        name: String,
        index: usize,
        expected: String,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct AbiParam {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub indexed: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AbiEntry {
    #[serde(rename = "type")]
    pub entry_type: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub inputs: Vec<AbiParam>,
    #[serde(default)]
    pub outputs: Vec<AbiParam>,
}

impl AbiEntry {
    /// Canonical signature, e.g. `ExceedsMaxHolding(uint256,uint256)`
    pub fn signature(&self) -> String {
        let types: Vec<&str> = self.inputs.iter().map(|p| p.kind.as_str()).collect();
        format!("{}({})", self.name, types.join(","))
    }
}

/// A decoded argument value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbiValue {
    Address(SubjectKey),
    Uint(U256),
    Bool(bool),
    FixedBytes(Vec<u8>),
    String(String),
}

impl AbiValue {
    pub fn as_uint(&self) -> Option<U256> {
        match self {
            Self::Uint(v) => Some(*v),
            _ => None,
        }
    }

    /// Textual form used for log-record fields: lowercase hex addresses, decimal integers
    pub fn render(&self) -> String {
        match self {
            Self::Address(a) => a.to_string(),
            Self::Uint(v) => v.to_string(),
            Self::Bool(b) => b.to_string(),
            Self::FixedBytes(b) => format!("0x{}", hex::encode(b)),
            Self::String(s) => s.clone(),
        }
    }
}

/// Parsed interface description of one or more contracts
#[derive(Debug, Clone, Default)]
pub struct InterfaceDescription {
    entries: Vec<AbiEntry>,
    errors: HashMap<[u8; 4], usize>,
}

impl InterfaceDescription {
    pub fn from_json_str(json: &str) -> Result<Self, AbiError> {
        let value: serde_json::Value =
            serde_json::from_str(json).map_err(|e| AbiError::Malformed(e.to_string()))?;
        let list = match value {
            serde_json::Value::Array(_) => value,
            serde_json::Value::Object(mut map) => map
                .remove("abi")
                .ok_or_else(|| AbiError::Malformed("object without an 'abi' field".to_string()))?,
            _ => return Err(AbiError::Malformed("expected an array or object".to_string())),
        };
        let entries: Vec<AbiEntry> =
            serde_json::from_value(list).map_err(|e| AbiError::Malformed(e.to_string()))?;
        Ok(Self::from_entries(entries))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, AbiError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| AbiError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    pub fn from_entries(entries: Vec<AbiEntry>) -> Self {
        let mut description = Self::default();
        description.extend(entries);
        description
    }

    /// Merge another contract's entries into this description
    pub fn merge(mut self, other: InterfaceDescription) -> Self {
        self.extend(other.entries);
        self
    }

    fn extend(&mut self, entries: Vec<AbiEntry>) {
        for entry in entries {
            if entry.entry_type == "error" {
                self.errors
                    .insert(selector(&entry.signature()), self.entries.len());
            }
            self.entries.push(entry);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn find(&self, entry_type: &str, name: &str, arity: Option<usize>) -> Option<&AbiEntry> {
        self.entries.iter().find(|e| {
            e.entry_type == entry_type
                && e.name == name
                && arity.map_or(true, |n| e.inputs.len() == n)
        })
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.find("function", name, None).is_some()
    }

    /// topic0 of a named event
    pub fn event_topic(&self, name: &str) -> Option<[u8; 32]> {
        self.find("event", name, None)
            .map(|e| keccak256(e.signature().as_bytes()))
    }

    /// Selector followed by the encoded arguments
    pub fn encode_call(&self, function: &str, args: &[AbiValue]) -> Result<Vec<u8>, AbiError> {
        let entry = self
            .find("function", function, Some(args.len()))
            .ok_or_else(|| AbiError::UnknownEntry {
                kind: "function",
                name: function.to_string(),
                arity: args.len(),
            })?;
        encode_entry(entry, args)
    }

    /// Decode the return data of a call to `function`
    pub fn decode_output(&self, function: &str, data: &[u8]) -> Option<Vec<AbiValue>> {
        let entry = self.find("function", function, None)?;
        let kinds: Vec<&str> = entry.outputs.iter().map(|p| p.kind.as_str()).collect();
        decode_params(&kinds, data)
    }

    /// Revert payload for a custom error, as the ledger would produce it
    pub fn encode_error(&self, error: &str, args: &[AbiValue]) -> Result<Vec<u8>, AbiError> {
        let entry = self
            .find("error", error, Some(args.len()))
            .ok_or_else(|| AbiError::UnknownEntry {
                kind: "error",
                name: error.to_string(),
                arity: args.len(),
            })?;
        encode_entry(entry, args)
    }

    /// Decode a revert payload into `(error name, arguments)`.
    ///
    /// The built-in `Error(string)` revert decodes as `("Error", [String])`.
    pub fn decode_error(&self, data: &[u8]) -> Option<(String, Vec<AbiValue>)> {
        if data.len() < 4 {
            return None;
        }
        let mut sel = [0u8; 4];
        sel.copy_from_slice(&data[..4]);
        let body = &data[4..];
        if sel == ERROR_STRING_SELECTOR {
            let reason = decode_value("string", body, 0)?;
            return Some(("Error".to_string(), vec![reason]));
        }
        let entry = &self.entries[*self.errors.get(&sel)?];
        let kinds: Vec<&str> = entry.inputs.iter().map(|p| p.kind.as_str()).collect();
        let args = decode_params(&kinds, body)?;
        Some((entry.name.clone(), args))
    }

    /// Decode a log of the named event into `field name -> rendered value`
    pub fn decode_log(
        &self,
        event: &str,
        topics: &[[u8; 32]],
        data: &[u8],
    ) -> Option<BTreeMap<String, String>> {
        let entry = self.find("event", event, None)?;
        if topics.first() != Some(&keccak256(entry.signature().as_bytes())) {
            return None;
        }
        let indexed: Vec<&AbiParam> = entry.inputs.iter().filter(|p| p.indexed).collect();
        let plain: Vec<&AbiParam> = entry.inputs.iter().filter(|p| !p.indexed).collect();

        let mut fields = BTreeMap::new();
        for (param, topic) in indexed.iter().zip(topics.iter().skip(1)) {
            // Indexed dynamic values are hashed; keep them as raw topics
            let value = if is_dynamic(&param.kind) {
                AbiValue::FixedBytes(topic.to_vec())
            } else {
                decode_value(&param.kind, topic, 0)?
            };
            fields.insert(param.name.clone(), value.render());
        }
        let kinds: Vec<&str> = plain.iter().map(|p| p.kind.as_str()).collect();
        let values = decode_params(&kinds, data)?;
        for (param, value) in plain.iter().zip(values) {
            fields.insert(param.name.clone(), value.render());
        }
        Some(fields)
    }
}

pub fn keccak256(bytes: &[u8]) -> [u8; 32] {
    let digest = Keccak256::digest(bytes);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// Read a single return word as an unsigned integer
pub fn decode_uint_word(data: &[u8]) -> Option<U256> {
    data.get(..WORD).map(U256::from_big_endian)
}

/// Read a single return word as a boolean
pub fn decode_bool_word(data: &[u8]) -> Option<bool> {
    decode_uint_word(data).map(|v| !v.is_zero())
}

fn is_dynamic(kind: &str) -> bool {
    kind == "string" || kind == "bytes" || kind.ends_with("[]")
}

fn encode_entry(entry: &AbiEntry, args: &[AbiValue]) -> Result<Vec<u8>, AbiError> {
    let mut out = selector(&entry.signature()).to_vec();
    let mut head = Vec::with_capacity(args.len() * WORD);
    let mut tail = Vec::new();
    for (index, (param, arg)) in entry.inputs.iter().zip(args).enumerate() {
        let mismatch = || AbiError::ArgumentMismatch {
            name: entry.name.clone(),
            index,
            expected: param.kind.clone(),
        };
        match (param.kind.as_str(), arg) {
            ("address", AbiValue::Address(a)) => {
                let mut word = [0u8; WORD];
                word[12..].copy_from_slice(a.as_bytes());
                head.extend_from_slice(&word);
            }
            (k, AbiValue::Uint(v)) if k.starts_with("uint") => head.extend_from_slice(&uint_word(*v)),
            ("bool", AbiValue::Bool(b)) => head.extend_from_slice(&uint_word(U256::from(*b as u8))),
            (k, AbiValue::FixedBytes(b)) if k.starts_with("bytes") && k != "bytes" && b.len() <= WORD => {
                let mut word = [0u8; WORD];
                word[..b.len()].copy_from_slice(b);
                head.extend_from_slice(&word);
            }
            ("string", AbiValue::String(s)) => {
                let offset = args.len() * WORD + tail.len();
                head.extend_from_slice(&uint_word(U256::from(offset)));
                tail.extend_from_slice(&uint_word(U256::from(s.len())));
                tail.extend_from_slice(s.as_bytes());
                let padding = (WORD - s.len() % WORD) % WORD;
                tail.extend(std::iter::repeat(0u8).take(padding));
            }
            _ => return Err(mismatch()),
        }
    }
    out.extend_from_slice(&head);
    out.extend_from_slice(&tail);
    Ok(out)
}

fn uint_word(value: U256) -> [u8; WORD] {
    let mut word = [0u8; WORD];
    value.to_big_endian(&mut word);
    word
}

fn decode_params(kinds: &[&str], data: &[u8]) -> Option<Vec<AbiValue>> {
    kinds
        .iter()
        .enumerate()
        .map(|(i, kind)| decode_value(kind, data, i * WORD))
        .collect()
}

fn word_at(data: &[u8], at: usize) -> Option<&[u8]> {
    data.get(at..at.checked_add(WORD)?)
}

fn small_uint(word: &[u8]) -> Option<usize> {
    let value = U256::from_big_endian(word);
    (value <= U256::from(u32::MAX)).then(|| value.low_u64() as usize)
}

/// Decode the parameter whose head word starts at `at`
fn decode_value(kind: &str, data: &[u8], at: usize) -> Option<AbiValue> {
    let word = word_at(data, at)?;
    match kind {
        "address" => {
            let mut bytes = [0u8; 20];
            bytes.copy_from_slice(&word[12..]);
            Some(AbiValue::Address(SubjectKey::from_bytes(bytes)))
        }
        "bool" => Some(AbiValue::Bool(word[31] != 0)),
        "string" | "bytes" => {
            let offset = small_uint(word)?;
            let len = small_uint(word_at(data, offset)?)?;
            let start = offset.checked_add(WORD)?;
            let raw = data.get(start..start.checked_add(len)?)?;
            if kind == "string" {
                Some(AbiValue::String(String::from_utf8_lossy(raw).into_owned()))
            } else {
                Some(AbiValue::FixedBytes(raw.to_vec()))
            }
        }
        k if k.starts_with("uint") => Some(AbiValue::Uint(U256::from_big_endian(word))),
        k if k.starts_with("bytes") => {
            let n: usize = k["bytes".len()..].parse().ok()?;
            Some(AbiValue::FixedBytes(word.get(..n)?.to_vec()))
        }
        // Signed integers and anything else stay as raw words
        _ => Some(AbiValue::FixedBytes(word.to_vec())),
    }
}
