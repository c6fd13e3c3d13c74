//! Aptos REST extractor.
//!
//! Scans user transactions whose entry function belongs to the tracked token
//! bridge module. The VAA is the entry function's only argument, hex encoded.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use watcher_common::{normalize_move_address, ChainId, Vaa};

use super::{BlockExtractor, FetchError, RedemptionCandidate, RpcClient};
use crate::store::TxStatus;

/// Aptos serialises u64 fields as JSON strings.
fn de_u64_string<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match &value {
        Value::String(s) => s.parse().map_err(serde::de::Error::custom),
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| serde::de::Error::custom("negative or fractional u64")),
        other => Err(serde::de::Error::custom(format!("expected u64, got {other}"))),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerInfo {
    #[serde(deserialize_with = "de_u64_string")]
    pub block_height: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AptosBlock {
    #[serde(deserialize_with = "de_u64_string")]
    pub block_height: u64,
    /// Microseconds.
    #[serde(deserialize_with = "de_u64_string")]
    pub block_timestamp: u64,
    #[serde(default)]
    pub transactions: Vec<AptosTransaction>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AptosTransaction {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub payload: Option<EntryFunctionPayload>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EntryFunctionPayload {
    #[serde(default)]
    pub function: Option<String>,
    #[serde(default)]
    pub arguments: Vec<Value>,
}

/// Tracked token bridge module.
#[derive(Debug, Clone)]
pub struct AptosModule {
    /// Normalised module address.
    pub address: String,
    /// `module::function` -> method name.
    pub functions: HashMap<String, String>,
}

impl AptosModule {
    /// Method name for a fully qualified `address::module::function`.
    pub fn match_function(&self, function: &str) -> Option<&str> {
        let (address, rest) = function.split_once("::")?;
        if normalize_move_address(address)? != self.address {
            return None;
        }
        self.functions.get(rest).map(String::as_str)
    }
}

/// Status from the transaction's success flag.
pub fn status_from_success(success: Option<bool>) -> TxStatus {
    match success {
        Some(true) => TxStatus::Confirmed,
        Some(false) => TxStatus::FailedToProcess,
        None => TxStatus::Unknown,
    }
}

/// The VAA in the first entry-function argument.
pub fn vaa_from_arguments(arguments: &[Value]) -> Result<Vaa, String> {
    let hex = arguments
        .first()
        .and_then(Value::as_str)
        .ok_or_else(|| "missing hex vaa argument".to_string())?;
    Vaa::parse_hex(hex).map_err(|e| e.to_string())
}

/// Aptos fullnode REST extractor.
#[derive(Debug, Clone)]
pub struct AptosExtractor {
    chain_id: ChainId,
    client: RpcClient,
    module: AptosModule,
}

impl AptosExtractor {
    pub fn new(chain_id: ChainId, client: RpcClient, module: AptosModule) -> Self {
        Self {
            chain_id,
            client,
            module,
        }
    }

    async fn transaction_status(&self, tx: &AptosTransaction) -> TxStatus {
        let path = format!("transactions/by_hash/{}", tx.hash);
        match self.client.get_json(&path, &[]).await {
            Ok(value) => status_from_success(value.get("success").and_then(Value::as_bool)),
            Err(e) => {
                tracing::warn!(
                    target: "watcher::aptos",
                    tx = %tx.hash,
                    error = %e,
                    "Transaction lookup failed, using block copy"
                );
                status_from_success(tx.success)
            }
        }
    }
}

#[async_trait]
impl BlockExtractor for AptosExtractor {
    type Block = AptosBlock;

    fn family(&self) -> &'static str {
        "aptos"
    }

    async fn latest_block(&self) -> Result<u64, FetchError> {
        let value = self.client.get_json("", &[]).await?;
        let info: LedgerInfo =
            serde_json::from_value(value).map_err(|e| FetchError::Decode(format!("ledger info: {e}")))?;
        Ok(info.block_height)
    }

    async fn get_block(&self, height: u64) -> Result<Option<AptosBlock>, FetchError> {
        let value = self
            .client
            .get_json(
                &format!("blocks/by_height/{height}"),
                &[("with_transactions", "true".to_string())],
            )
            .await?;
        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| FetchError::Decode(format!("block {height}: {e}")))
    }

    async fn extract_candidates(&self, block: &AptosBlock) -> Result<Vec<RedemptionCandidate>, FetchError> {
        let timestamp = DateTime::<Utc>::from_timestamp_micros(block.block_timestamp as i64).unwrap_or_default();

        let mut candidates = Vec::new();
        for tx in &block.transactions {
            if tx.kind != "user_transaction" {
                continue;
            }
            let Some(payload) = &tx.payload else { continue };
            let Some(method) = payload
                .function
                .as_deref()
                .and_then(|function| self.module.match_function(function))
            else {
                continue;
            };

            let vaa = match vaa_from_arguments(&payload.arguments) {
                Ok(vaa) => vaa,
                Err(e) => {
                    tracing::warn!(
                        target: "watcher::aptos",
                        height = block.block_height,
                        tx = %tx.hash,
                        error = %e,
                        "Skipping undecodable redemption"
                    );
                    continue;
                }
            };

            let status = self.transaction_status(tx).await;

            candidates.push(RedemptionCandidate {
                message_id: vaa.message_id(),
                chain_id: self.chain_id,
                method: method.to_string(),
                tx_hash: tx.hash.clone(),
                from: tx.sender.clone().unwrap_or_default(),
                to: self.module.address.clone(),
                block_number: block.block_height,
                timestamp,
                status,
            });
        }

        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use watcher_common::vaa::fixtures::signed_vaa;

    const MODULE: &str = "0x576410486a2da45eee6c949c995670112ddf2fbeedab20350d506328eefc9d4f";

    fn module() -> AptosModule {
        AptosModule {
            address: normalize_move_address(MODULE).unwrap(),
            functions: HashMap::from([(
                "complete_transfer::submit_vaa_and_register_entry".to_string(),
                "submit_vaa_and_register_entry".to_string(),
            )]),
        }
    }

    #[test]
    fn test_match_function() {
        let module = module();
        assert_eq!(
            module.match_function(&format!("{MODULE}::complete_transfer::submit_vaa_and_register_entry")),
            Some("submit_vaa_and_register_entry")
        );
        // Leading zeros do not matter.
        let short = AptosModule {
            address: normalize_move_address("0x5").unwrap(),
            functions: module.functions.clone(),
        };
        assert!(short
            .match_function("0x0000005::complete_transfer::submit_vaa_and_register_entry")
            .is_some());

        assert!(module.match_function(&format!("{MODULE}::transfer_tokens::transfer_tokens_entry")).is_none());
        assert!(module.match_function("0x1::complete_transfer::submit_vaa_and_register_entry").is_none());
        assert!(module.match_function("garbage").is_none());
    }

    #[test]
    fn test_vaa_from_arguments() {
        let vaa = signed_vaa(ChainId::ETHEREUM, [8u8; 32], 99, 1, b"x");
        let args = vec![json!(format!("0x{}", hex::encode(&vaa)))];
        assert_eq!(vaa_from_arguments(&args).unwrap().sequence, 99);

        assert!(vaa_from_arguments(&[]).is_err());
        assert!(vaa_from_arguments(&[json!(5)]).is_err());
        assert!(vaa_from_arguments(&[json!("0x0102")]).is_err());
    }

    #[test]
    fn test_status_from_success() {
        assert_eq!(status_from_success(Some(true)), TxStatus::Confirmed);
        assert_eq!(status_from_success(Some(false)), TxStatus::FailedToProcess);
        assert_eq!(status_from_success(None), TxStatus::Unknown);
    }

    #[test]
    fn test_block_fixture_deserializes() {
        let block: AptosBlock = serde_json::from_value(json!({
            "block_height": "123456",
            "block_hash": "0xabc",
            "block_timestamp": "1700000000123456",
            "first_version": "1",
            "last_version": "2",
            "transactions": [
                {"type": "block_metadata_transaction", "hash": "0x1"},
                {
                    "type": "user_transaction",
                    "hash": "0x2",
                    "sender": "0xabc",
                    "success": true,
                    "payload": {
                        "type": "entry_function_payload",
                        "function": format!("{MODULE}::complete_transfer::submit_vaa_and_register_entry"),
                        "type_arguments": [],
                        "arguments": ["0x01"]
                    }
                }
            ]
        }))
        .unwrap();

        assert_eq!(block.block_height, 123_456);
        assert_eq!(block.transactions.len(), 2);
        assert_eq!(
            DateTime::<Utc>::from_timestamp_micros(block.block_timestamp as i64)
                .unwrap()
                .timestamp(),
            1_700_000_000
        );

        let info: LedgerInfo = serde_json::from_value(json!({"chain_id": 1, "block_height": "77"})).unwrap();
        assert_eq!(info.block_height, 77);
    }
}
