//! JSON-RPC ledger adapter
//!
//! Talks to an Ethereum-style node over HTTP. Writes are signed by the node
//! (`eth_sendTransaction`), so the acting account must be unlocked there.
//! Both confirmation channels are polled: receipts per handle with a
//! confirmation depth, and logs per notification with a lookback window.

use super::{
    receiver_stream, AccountRole, Contracts, EventSource, LedgerCall, LedgerReader, LedgerWriter,
    LogRecord, PreparedRequest, PropertyInfo, ReceiptSource, ReceiptUpdate, SaleStatus,
};
use crate::abi::{decode_bool_word, decode_uint_word, AbiValue, InterfaceDescription};
use crate::errors::LedgerRejection;
use crate::types::{strip_hex_prefix, Handle, OperationKind, RejectPayload, SubjectKey};
use async_trait::async_trait;
use futures::stream::BoxStream;
use primitive_types::U256;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// JSON-RPC error code wallets use for a declined request
const USER_REJECTED_CODE: i64 = 4001;

/// Connection and polling settings
#[derive(Debug, Clone)]
pub struct RpcSettings {
    pub url: String,
    pub request_timeout: Duration,
    pub poll_interval: Duration,
    /// Blocks on top of the inclusion block before a receipt counts as final
    pub confirmations: u64,
    /// Blocks behind the head a new log subscription starts from
    pub log_lookback: u64,
}

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    params: Value,
    id: u64,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Clone, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

impl JsonRpcError {
    /// Revert data may be a bare hex string or nested one level deep
    fn revert_data(&self) -> Option<Vec<u8>> {
        let text = match &self.data {
            Some(Value::String(s)) => s.as_str(),
            Some(Value::Object(map)) => map.get("data")?.as_str()?,
            _ => return None,
        };
        hex::decode(strip_hex_prefix(text)?).ok()
    }

    fn into_rejection(self) -> LedgerRejection {
        let lower = self.message.to_lowercase();
        if self.code == USER_REJECTED_CODE
            || lower.contains("user rejected")
            || lower.contains("user denied")
        {
            return LedgerRejection::UserRejected;
        }
        LedgerRejection::Reverted(RejectPayload::new(self.revert_data(), self.message))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcReceipt {
    status: Option<String>,
    block_number: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcTransaction {
    from: String,
    to: Option<String>,
    input: String,
    #[serde(default)]
    value: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcLog {
    topics: Vec<String>,
    data: String,
    block_number: Option<String>,
    transaction_hash: Option<String>,
}

struct Inner {
    http: reqwest::Client,
    settings: RpcSettings,
    request_id: AtomicU64,
    contracts: Contracts,
    interface: InterfaceDescription,
}

/// Node-backed ledger; cheap to clone
#[derive(Clone)]
pub struct RpcLedger {
    inner: Arc<Inner>,
}

impl RpcLedger {
    pub fn new(
        settings: RpcSettings,
        contracts: Contracts,
        interface: InterfaceDescription,
    ) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .build()?;
        Ok(Self {
            inner: Arc::new(Inner {
                http,
                settings,
                request_id: AtomicU64::new(1),
                contracts,
                interface,
            }),
        })
    }

    pub fn interface(&self) -> &InterfaceDescription {
        &self.inner.interface
    }

    async fn call<R: DeserializeOwned>(&self, method: &str, params: Value) -> Result<R, LedgerRejection> {
        self.call_optional(method, params)
            .await?
            .ok_or_else(|| LedgerRejection::transport(format!("{} response missing result", method)))
    }

    async fn call_optional<R: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<Option<R>, LedgerRejection> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            method,
            params,
            id: self.inner.request_id.fetch_add(1, Ordering::SeqCst),
        };

        let response = self
            .inner
            .http
            .post(&self.inner.settings.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| LedgerRejection::transport(format!("Failed to send {}: {}", method, e)))?;
        let rpc_response: JsonRpcResponse<R> = response
            .json()
            .await
            .map_err(|e| LedgerRejection::transport(format!("Failed to parse {} response: {}", method, e)))?;

        if let Some(error) = rpc_response.error {
            debug!(method, code = error.code, message = %error.message, "RPC error");
            return Err(error.into_rejection());
        }
        Ok(rpc_response.result)
    }

    fn call_object(&self, call: &LedgerCall) -> Result<Value, LedgerRejection> {
        let data = self
            .inner
            .interface
            .encode_call(call.function, &call.args)
            .map_err(|e| LedgerRejection::Reverted(RejectPayload::from_message(e.to_string())))?;
        let mut object = json!({
            "from": call.from.to_string(),
            "to": call.to.to_string(),
            "data": format!("0x{}", hex::encode(data)),
        });
        if let Some(value) = call.value {
            object["value"] = Value::String(quantity(value));
        }
        Ok(object)
    }

    async fn eth_call(&self, to: SubjectKey, function: &str, args: &[AbiValue]) -> Result<Vec<u8>, LedgerRejection> {
        if !self.inner.interface.has_function(function) {
            return Err(LedgerRejection::transport(format!(
                "interface description does not provide {}",
                function
            )));
        }
        let data = self
            .inner
            .interface
            .encode_call(function, args)
            .map_err(|e| LedgerRejection::transport(e.to_string()))?;
        let result: String = self
            .call(
                "eth_call",
                json!([{ "to": to.to_string(), "data": format!("0x{}", hex::encode(data)) }, "latest"]),
            )
            .await?;
        decode_hex(&result).ok_or_else(|| LedgerRejection::transport("eth_call returned malformed data"))
    }

    async fn view_uint(&self, to: SubjectKey, function: &str) -> Result<U256, LedgerRejection> {
        let data = self.eth_call(to, function, &[]).await?;
        decode_uint_word(&data).ok_or_else(|| LedgerRejection::transport(format!("{} returned no data", function)))
    }

    async fn view_bool(&self, to: SubjectKey, function: &str, args: &[AbiValue]) -> Result<bool, LedgerRejection> {
        let data = self.eth_call(to, function, args).await?;
        decode_bool_word(&data).ok_or_else(|| LedgerRejection::transport(format!("{} returned no data", function)))
    }

    async fn block_number(&self) -> Result<u64, LedgerRejection> {
        let result: String = self.call("eth_blockNumber", json!([])).await?;
        parse_quantity(&result).ok_or_else(|| LedgerRejection::transport("malformed block number"))
    }

    /// Replay a reverted transaction at its block to recover the revert data
    async fn revert_payload(&self, handle: &Handle, block: u64) -> RejectPayload {
        let generic = RejectPayload::from_message("transaction reverted on-chain");
        let tx: Option<RpcTransaction> = match self
            .call_optional("eth_getTransactionByHash", json!([handle.to_string()]))
            .await
        {
            Ok(tx) => tx,
            Err(_) => return generic,
        };
        let Some(tx) = tx else { return generic };

        let mut object = json!({ "from": tx.from, "to": tx.to, "data": tx.input });
        if let Some(value) = tx.value {
            object["value"] = Value::String(value);
        }
        match self
            .call::<String>("eth_call", json!([object, format!("0x{:x}", block)]))
            .await
        {
            Err(LedgerRejection::Reverted(payload)) => payload,
            _ => generic,
        }
    }

    async fn poll_receipt(self, handle: Handle, tx: mpsc::UnboundedSender<ReceiptUpdate>) {
        let settings = &self.inner.settings;
        let mut interval = tokio::time::interval(settings.poll_interval);
        let mut reported_mined = false;

        while !tx.is_closed() {
            interval.tick().await;
            let receipt: Option<RpcReceipt> = match self
                .call_optional("eth_getTransactionReceipt", json!([handle.to_string()]))
                .await
            {
                Ok(receipt) => receipt,
                Err(e) => {
                    debug!(handle = %handle, error = %e, "Receipt poll failed, retrying");
                    continue;
                }
            };
            let Some(receipt) = receipt else { continue };
            let block = receipt.block_number.as_deref().and_then(parse_quantity).unwrap_or(0);

            if receipt.status.as_deref().and_then(parse_quantity) == Some(0) {
                let payload = self.revert_payload(&handle, block).await;
                let _ = tx.send(ReceiptUpdate::Reverted(payload));
                return;
            }

            let head = match self.block_number().await {
                Ok(head) => head,
                Err(_) => continue,
            };
            if head.saturating_sub(block) + 1 >= settings.confirmations {
                let _ = tx.send(ReceiptUpdate::Success { block });
                return;
            }
            if !reported_mined {
                reported_mined = true;
                if tx.send(ReceiptUpdate::Mined { block }).is_err() {
                    return;
                }
            }
        }
    }

    async fn poll_logs(
        self,
        notification: String,
        address: SubjectKey,
        topic: [u8; 32],
        tx: mpsc::UnboundedSender<Vec<LogRecord>>,
    ) {
        let settings = &self.inner.settings;
        let mut interval = tokio::time::interval(settings.poll_interval);
        let mut next_block: Option<u64> = None;

        while !tx.is_closed() {
            interval.tick().await;
            let head = match self.block_number().await {
                Ok(head) => head,
                Err(e) => {
                    debug!(notification = %notification, error = %e, "Log poll failed, retrying");
                    continue;
                }
            };
            let from = next_block.unwrap_or_else(|| head.saturating_sub(settings.log_lookback));
            if from > head {
                continue;
            }

            let filter = json!([{
                "address": address.to_string(),
                "topics": [format!("0x{}", hex::encode(topic))],
                "fromBlock": format!("0x{:x}", from),
                "toBlock": format!("0x{:x}", head),
            }]);
            let logs: Vec<RpcLog> = match self.call("eth_getLogs", filter).await {
                Ok(logs) => logs,
                Err(e) => {
                    debug!(notification = %notification, error = %e, "eth_getLogs failed, retrying");
                    continue;
                }
            };
            next_block = Some(head + 1);

            let records: Vec<LogRecord> = logs
                .iter()
                .filter_map(|log| decode_log(&self.inner.interface, &notification, log))
                .collect();
            if !records.is_empty() && tx.send(records).is_err() {
                return;
            }
        }
    }
}

#[async_trait]
impl LedgerWriter for RpcLedger {
    async fn simulate(&self, call: &LedgerCall) -> Result<PreparedRequest, LedgerRejection> {
        let object = self.call_object(call)?;
        let _: String = self.call("eth_call", json!([object.clone(), "latest"])).await?;
        let gas: String = self.call("eth_estimateGas", json!([object])).await?;
        Ok(PreparedRequest {
            call: call.clone(),
            gas_limit: parse_quantity(&gas),
        })
    }

    async fn submit(&self, request: PreparedRequest) -> Result<Handle, LedgerRejection> {
        let mut object = self.call_object(&request.call)?;
        if let Some(gas) = request.gas_limit {
            object["gas"] = Value::String(format!("0x{:x}", gas));
        }
        let hash: String = self.call("eth_sendTransaction", json!([object])).await?;
        Handle::parse(&hash)
            .ok_or_else(|| LedgerRejection::transport(format!("node returned malformed handle {}", hash)))
    }
}

impl EventSource for RpcLedger {
    fn subscribe(&self, notification: &str) -> BoxStream<'static, Vec<LogRecord>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let emitter = OperationKind::ALL
            .iter()
            .find(|kind| kind.notification() == notification)
            .map(|kind| self.inner.contracts.address(Contracts::emitter(*kind)));

        match (emitter, self.inner.interface.event_topic(notification)) {
            (Some(address), Some(topic)) => {
                tokio::spawn(self.clone().poll_logs(notification.to_string(), address, topic, tx));
            }
            _ => warn!(notification, "No emitter or event description; subscription stays silent"),
        }
        receiver_stream(rx)
    }
}

impl ReceiptSource for RpcLedger {
    fn watch_receipt(&self, handle: &Handle) -> BoxStream<'static, ReceiptUpdate> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(self.clone().poll_receipt(*handle, tx));
        receiver_stream(rx)
    }
}

#[async_trait]
impl LedgerReader for RpcLedger {
    async fn is_authorized(&self, subject: &SubjectKey) -> Result<bool, LedgerRejection> {
        self.view_bool(self.inner.contracts.manager, "isWhitelisted", &[AbiValue::Address(*subject)])
            .await
    }

    async fn balance_of(&self, subject: &SubjectKey) -> Result<U256, LedgerRejection> {
        let data = self
            .eth_call(self.inner.contracts.token, "balanceOf", &[AbiValue::Address(*subject)])
            .await?;
        decode_uint_word(&data).ok_or_else(|| LedgerRejection::transport("balanceOf returned no data"))
    }

    async fn max_holding(&self) -> Result<U256, LedgerRejection> {
        self.view_uint(self.inner.contracts.manager, "getMaxHolding").await
    }

    async fn recovery_pool_balance(&self) -> Result<U256, LedgerRejection> {
        let manager = self.inner.contracts.manager;
        self.balance_of(&manager).await
    }

    async fn role_of(&self, subject: &SubjectKey) -> Result<AccountRole, LedgerRejection> {
        let manager = self.inner.contracts.manager;
        let role_id = self.eth_call(manager, "SERVICE_PROVIDER_ROLE", &[]).await?;
        let role_id = role_id
            .get(..32)
            .ok_or_else(|| LedgerRejection::transport("SERVICE_PROVIDER_ROLE returned no data"))?;
        let service_provider = self
            .view_bool(
                manager,
                "hasRole",
                &[AbiValue::FixedBytes(role_id.to_vec()), AbiValue::Address(*subject)],
            )
            .await?;
        let whitelisted = !service_provider && self.is_authorized(subject).await?;
        Ok(AccountRole::from_flags(service_provider, whitelisted))
    }

    async fn sale_status(&self) -> Result<SaleStatus, LedgerRejection> {
        let token = self.inner.contracts.token;
        let property = if self.inner.interface.has_function("getPropertyInfo") {
            let data = self.eth_call(token, "getPropertyInfo", &[]).await?;
            self.inner
                .interface
                .decode_output("getPropertyInfo", &data)
                .and_then(|values| PropertyInfo::from_values(&values))
        } else {
            None
        };
        Ok(SaleStatus {
            property,
            total_supply: self.view_uint(token, "totalSupply").await?,
            total_raised: self.view_uint(token, "getTotalRaised").await?,
            oversubscribed: self.view_bool(token, "isOversubscribed", &[]).await?,
        })
    }
}

fn quantity(value: U256) -> String {
    format!("0x{:x}", value)
}

fn parse_quantity(text: &str) -> Option<u64> {
    u64::from_str_radix(strip_hex_prefix(text)?, 16).ok()
}

fn decode_hex(text: &str) -> Option<Vec<u8>> {
    hex::decode(strip_hex_prefix(text)?).ok()
}

fn decode_log(interface: &InterfaceDescription, notification: &str, log: &RpcLog) -> Option<LogRecord> {
    let topics: Vec<[u8; 32]> = log
        .topics
        .iter()
        .map(|t| {
            let mut word = [0u8; 32];
            hex::decode_to_slice(strip_hex_prefix(t)?, &mut word).ok()?;
            Some(word)
        })
        .collect::<Option<_>>()?;
    let data = decode_hex(&log.data)?;
    let fields = interface.decode_log(notification, &topics, &data)?;
    Some(LogRecord {
        notification: notification.to_string(),
        fields,
        transaction_hash: log.transaction_hash.as_deref().and_then(Handle::parse),
        block: log.block_number.as_deref().and_then(parse_quantity).unwrap_or(0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::simulated::bundled_interface;

    fn rpc_error(value: Value) -> JsonRpcError {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_user_rejection_mapping() {
        let err = rpc_error(json!({"code": 4001, "message": "User rejected the request."}));
        assert_eq!(err.into_rejection(), LedgerRejection::UserRejected);

        let err = rpc_error(json!({"code": -32000, "message": "MetaMask Tx Signature: User denied transaction signature."}));
        assert_eq!(err.into_rejection(), LedgerRejection::UserRejected);
    }

    #[test]
    fn test_revert_data_is_extracted() {
        let err = rpc_error(json!({
            "code": 3,
            "message": "execution reverted",
            "data": "0xdeadbeef"
        }));
        assert_eq!(
            err.into_rejection(),
            LedgerRejection::Reverted(RejectPayload::new(
                Some(vec![0xde, 0xad, 0xbe, 0xef]),
                "execution reverted"
            ))
        );

        let nested = rpc_error(json!({
            "code": -32603,
            "message": "Internal error",
            "data": {"data": "0x01", "message": "reverted"}
        }));
        assert_eq!(nested.revert_data(), Some(vec![1]));

        let bare = rpc_error(json!({"code": -32000, "message": "nonce too low"}));
        match bare.into_rejection() {
            LedgerRejection::Reverted(payload) => {
                assert!(payload.data.is_none());
                assert_eq!(payload.message, "nonce too low");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_quantities() {
        assert_eq!(parse_quantity("0x1b4"), Some(436));
        assert_eq!(parse_quantity("1b4"), None);
        assert_eq!(quantity(U256::exp10(18)), "0xde0b6b3a7640000");
    }

    #[test]
    fn test_log_decoding() {
        let interface = bundled_interface().unwrap();
        let topic0 = interface.event_topic("InvestorWhitelisted").unwrap();
        let log: RpcLog = serde_json::from_value(json!({
            "topics": [
                format!("0x{}", hex::encode(topic0)),
                "0x00000000000000000000000070997970c51812dc3a010c7d01b50e0d17dc79c8"
            ],
            "data": "0x",
            "blockNumber": "0x10",
            "transactionHash": format!("0x{}", "ab".repeat(32)),
        }))
        .unwrap();

        let record = decode_log(&interface, "InvestorWhitelisted", &log).unwrap();
        assert_eq!(record.block, 16);
        assert_eq!(record.transaction_hash, Some(Handle::from_bytes([0xab; 32])));
        assert_eq!(
            record.fields["investor"],
            "0x70997970c51812dc3a010c7d01b50e0d17dc79c8"
        );
        assert!(decode_log(&interface, "InvestorBlacklisted", &log).is_none());
    }

    #[test]
    fn test_call_object_carries_value() {
        let contracts = Contracts {
            token: SubjectKey::from_bytes([0xaa; 20]),
            manager: SubjectKey::from_bytes([0xbb; 20]),
        };
        let ledger = RpcLedger::new(
            RpcSettings {
                url: "http://127.0.0.1:8545".to_string(),
                request_timeout: Duration::from_secs(1),
                poll_interval: Duration::from_millis(100),
                confirmations: 1,
                log_lookback: 10,
            },
            contracts,
            bundled_interface().unwrap(),
        )
        .unwrap();
        let call = LedgerCall::for_operation(
            OperationKind::Purchase,
            SubjectKey::from_bytes([1; 20]),
            crate::types::Amount::parse("1000").ok(),
            SubjectKey::from_bytes([1; 20]),
            &contracts,
        );
        let object = ledger.call_object(&call).unwrap();
        assert_eq!(object["value"], "0x3e8");
        assert_eq!(object["to"], contracts.token.to_string());
    }

    #[test]
    fn test_role_query_encoding() {
        let interface = bundled_interface().unwrap();
        let role_id = crate::abi::keccak256(b"SERVICE_PROVIDER_ROLE").to_vec();
        let data = interface
            .encode_call(
                "hasRole",
                &[
                    AbiValue::FixedBytes(role_id.clone()),
                    AbiValue::Address(SubjectKey::from_bytes([0x11; 20])),
                ],
            )
            .unwrap();
        // hasRole(bytes32,address)
        assert_eq!(&data[..4], &[0x91, 0xd1, 0x48, 0x54]);
        assert_eq!(&data[4..36], role_id.as_slice());
        assert_eq!(&data[48..68], &[0x11; 20]);

        for view in ["SERVICE_PROVIDER_ROLE", "totalSupply", "getTotalRaised", "isOversubscribed", "getPropertyInfo"] {
            assert!(interface.has_function(view), "{} missing", view);
        }
    }
}
