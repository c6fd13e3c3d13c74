//! Terra (Cosmos) extractor.
//!
//! Block heights come from the LCD, block transactions from the FCD, which
//! pages them by offset. A redemption is a `MsgExecuteContract` to the token
//! bridge carrying `submit_vaa`; the method is the `action` attribute the
//! contract emitted.

use async_trait::async_trait;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use watcher_common::{ChainId, Vaa};

use super::{BlockExtractor, FetchError, RedemptionCandidate, RpcClient};
use crate::store::TxStatus;

const FCD_PAGE_LIMIT: u64 = 100;
/// Method recorded for failed transactions, which carry no logs.
const FAILED_SUBMIT_METHOD: &str = "submit_vaa";

#[derive(Debug, Clone, Deserialize)]
pub struct TerraTxPage {
    #[serde(default)]
    pub next: Option<u64>,
    #[serde(default)]
    pub txs: Vec<TerraTx>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TerraTx {
    pub txhash: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub code: Option<u64>,
    pub tx: Value,
    #[serde(default)]
    pub logs: Vec<TxLog>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TxLog {
    #[serde(default)]
    pub events: Vec<TxEvent>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TxEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub attributes: Vec<EventAttribute>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventAttribute {
    pub key: String,
    #[serde(default)]
    pub value: Option<String>,
}

/// All transactions of one height.
#[derive(Debug, Clone)]
pub struct TerraBlock {
    pub height: u64,
    pub txs: Vec<TerraTx>,
}

/// `code == 0` is success.
pub fn status_from_code(code: Option<u64>) -> TxStatus {
    match code {
        None | Some(0) => TxStatus::Confirmed,
        Some(_) => TxStatus::FailedToProcess,
    }
}

fn execute_messages(tx: &Value) -> impl Iterator<Item = &Value> {
    tx.pointer("/value/msg")
        .or_else(|| tx.pointer("/body/messages"))
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .map(|msg| msg.get("value").unwrap_or(msg))
}

/// `execute_msg` may be inline JSON or base64-encoded JSON.
fn execute_body(msg: &Value) -> Option<Value> {
    match msg.get("execute_msg").or_else(|| msg.get("msg"))? {
        Value::String(encoded) => {
            let bytes = base64::engine::general_purpose::STANDARD.decode(encoded).ok()?;
            serde_json::from_slice(&bytes).ok()
        }
        other => Some(other.clone()),
    }
}

/// The `submit_vaa` payload sent to `contract`, if any.
pub fn find_submit_vaa(tx: &TerraTx, contract: &str) -> Option<Result<Vaa, String>> {
    execute_messages(&tx.tx)
        .filter(|msg| msg.get("contract").and_then(Value::as_str) == Some(contract))
        .find_map(|msg| {
            let body = execute_body(msg)?;
            let data = body.pointer("/submit_vaa/data")?.as_str()?.to_string();
            Some(
                base64::engine::general_purpose::STANDARD
                    .decode(data)
                    .map_err(|e| format!("vaa base64: {e}"))
                    .and_then(|bytes| Vaa::parse(&bytes).map_err(|e| e.to_string())),
            )
        })
}

/// First `action` attribute whose value is a tracked method.
pub fn find_action<'a>(tx: &TerraTx, methods: &'a [String]) -> Option<&'a str> {
    tx.logs
        .iter()
        .flat_map(|log| log.events.iter())
        .flat_map(|event| event.attributes.iter())
        .filter(|attr| attr.key == "action")
        .find_map(|attr| {
            let value = attr.value.as_deref()?;
            methods.iter().find(|m| *m == value).map(String::as_str)
        })
}

fn sender(tx: &TerraTx) -> String {
    execute_messages(&tx.tx)
        .find_map(|msg| msg.get("sender").and_then(Value::as_str))
        .unwrap_or_default()
        .to_string()
}

/// Terra LCD/FCD extractor.
#[derive(Debug, Clone)]
pub struct TerraExtractor {
    chain_id: ChainId,
    lcd: RpcClient,
    fcd: RpcClient,
    contract: String,
    methods: Vec<String>,
}

impl TerraExtractor {
    pub fn new(chain_id: ChainId, lcd: RpcClient, fcd: RpcClient, contract: String, methods: Vec<String>) -> Self {
        Self {
            chain_id,
            lcd,
            fcd,
            contract,
            methods,
        }
    }

    /// Candidate for one transaction, if it is a redemption.
    pub fn candidate(&self, height: u64, tx: &TerraTx) -> Option<RedemptionCandidate> {
        let vaa = match find_submit_vaa(tx, &self.contract)? {
            Ok(vaa) => vaa,
            Err(e) => {
                tracing::warn!(
                    target: "watcher::terra",
                    height,
                    tx = %tx.txhash,
                    error = %e,
                    "Skipping undecodable redemption"
                );
                return None;
            }
        };

        let status = status_from_code(tx.code);
        let method = match find_action(tx, &self.methods) {
            Some(method) => method.to_string(),
            None if status == TxStatus::FailedToProcess => FAILED_SUBMIT_METHOD.to_string(),
            None => return None,
        };

        let timestamp = tx
            .timestamp
            .as_deref()
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_default();

        Some(RedemptionCandidate {
            message_id: vaa.message_id(),
            chain_id: self.chain_id,
            method,
            tx_hash: tx.txhash.clone(),
            from: sender(tx),
            to: self.contract.clone(),
            block_number: height,
            timestamp,
            status,
        })
    }
}

#[async_trait]
impl BlockExtractor for TerraExtractor {
    type Block = TerraBlock;

    fn family(&self) -> &'static str {
        "terra"
    }

    async fn latest_block(&self) -> Result<u64, FetchError> {
        let value = self.lcd.get_json("blocks/latest", &[]).await?;
        value
            .pointer("/block/header/height")
            .and_then(Value::as_str)
            .and_then(|h| h.parse().ok())
            .ok_or_else(|| FetchError::Decode("blocks/latest: missing height".to_string()))
    }

    async fn get_block(&self, height: u64) -> Result<Option<TerraBlock>, FetchError> {
        let mut txs = Vec::new();
        let mut offset: Option<u64> = None;

        loop {
            let mut query = vec![
                ("block", height.to_string()),
                ("limit", FCD_PAGE_LIMIT.to_string()),
            ];
            if let Some(offset) = offset {
                query.push(("offset", offset.to_string()));
            }

            let value = self.fcd.get_json("v1/txs", &query).await?;
            let page: TerraTxPage = serde_json::from_value(value)
                .map_err(|e| FetchError::Decode(format!("txs of block {height}: {e}")))?;
            txs.extend(page.txs);

            match page.next {
                Some(next) if Some(next) != offset => offset = Some(next),
                _ => break,
            }
        }

        Ok(Some(TerraBlock { height, txs }))
    }

    async fn extract_candidates(&self, block: &TerraBlock) -> Result<Vec<RedemptionCandidate>, FetchError> {
        Ok(block
            .txs
            .iter()
            .filter_map(|tx| self.candidate(block.height, tx))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use watcher_common::vaa::fixtures::signed_vaa;

    const CONTRACT: &str = "terra10nmmwe8r3g99a9newtqa7a75xfgs2e8z87r2sf";

    fn extractor() -> TerraExtractor {
        let client = RpcClient::new(
            url::Url::parse("https://lcd.terra.dev/").unwrap(),
            Arc::new(crate::watcher::RateLimiter::unlimited()),
        );
        TerraExtractor::new(
            ChainId::TERRA,
            client.clone(),
            client,
            CONTRACT.to_string(),
            vec![
                "complete_transfer_wrapped".to_string(),
                "complete_transfer_terra_native".to_string(),
            ],
        )
    }

    fn tx(code: u64, execute_msg: Value, logs: Value) -> TerraTx {
        serde_json::from_value(json!({
            "txhash": "ABCDEF",
            "height": "5000",
            "timestamp": "2021-11-01T10:00:00Z",
            "code": code,
            "tx": {
                "type": "core/StdTx",
                "value": {
                    "msg": [{
                        "type": "wasm/MsgExecuteContract",
                        "value": {
                            "sender": "terra1sender",
                            "contract": CONTRACT,
                            "execute_msg": execute_msg,
                            "coins": []
                        }
                    }]
                }
            },
            "logs": logs
        }))
        .unwrap()
    }

    fn submit(vaa: &[u8]) -> Value {
        json!({"submit_vaa": {"data": base64::engine::general_purpose::STANDARD.encode(vaa)}})
    }

    fn action_logs(action: &str) -> Value {
        json!([{"events": [{"type": "from_contract", "attributes": [
            {"key": "contract_address", "value": CONTRACT},
            {"key": "action", "value": action}
        ]}]}])
    }

    #[test]
    fn test_successful_redemption() {
        let vaa = signed_vaa(ChainId::ETHEREUM, [2u8; 32], 10, 1, b"");
        let tx = tx(0, submit(&vaa), action_logs("complete_transfer_wrapped"));

        let candidate = extractor().candidate(5000, &tx).unwrap();
        assert_eq!(candidate.method, "complete_transfer_wrapped");
        assert_eq!(candidate.status, TxStatus::Confirmed);
        assert_eq!(candidate.from, "terra1sender");
        assert_eq!(candidate.block_number, 5000);
        assert_eq!(candidate.timestamp.timestamp(), 1_635_760_800);
        assert_eq!(candidate.message_id, Vaa::parse(&vaa).unwrap().message_id());
    }

    #[test]
    fn test_base64_execute_msg() {
        let vaa = signed_vaa(ChainId::SOLANA, [4u8; 32], 11, 0, b"");
        let inner = serde_json::to_vec(&submit(&vaa)).unwrap();
        let encoded = base64::engine::general_purpose::STANDARD.encode(inner);
        let tx = tx(0, json!(encoded), action_logs("complete_transfer_terra_native"));

        let candidate = extractor().candidate(5000, &tx).unwrap();
        assert_eq!(candidate.method, "complete_transfer_terra_native");
    }

    #[test]
    fn test_failed_redemption_without_logs() {
        let vaa = signed_vaa(ChainId::ETHEREUM, [2u8; 32], 12, 1, b"");
        let tx = tx(5, submit(&vaa), json!([]));

        let candidate = extractor().candidate(5000, &tx).unwrap();
        assert_eq!(candidate.status, TxStatus::FailedToProcess);
        assert_eq!(candidate.method, FAILED_SUBMIT_METHOD);
    }

    #[test]
    fn test_ignored_transactions() {
        let vaa = signed_vaa(ChainId::ETHEREUM, [2u8; 32], 13, 1, b"");

        // Untracked action.
        let tx_other = tx(0, submit(&vaa), action_logs("register_asset_hook"));
        assert!(extractor().candidate(5000, &tx_other).is_none());

        // Not a submit_vaa.
        let tx_transfer = tx(0, json!({"initiate_transfer": {}}), action_logs("complete_transfer_wrapped"));
        assert!(extractor().candidate(5000, &tx_transfer).is_none());

        // Corrupt VAA.
        let tx_bad = tx(0, json!({"submit_vaa": {"data": "AAEC"}}), action_logs("complete_transfer_wrapped"));
        assert!(extractor().candidate(5000, &tx_bad).is_none());
    }

    #[test]
    fn test_status_from_code() {
        assert_eq!(status_from_code(Some(0)), TxStatus::Confirmed);
        assert_eq!(status_from_code(None), TxStatus::Confirmed);
        assert_eq!(status_from_code(Some(11)), TxStatus::FailedToProcess);
    }
}
