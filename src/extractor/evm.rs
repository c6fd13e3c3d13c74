//! EVM JSON-RPC extractor.
//!
//! Keeps transactions sent to a tracked contract whose 4-byte selector is in
//! that contract's method table, decodes the VAA passed as the single `bytes`
//! argument and resolves the status from the receipt.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use watcher_common::{normalize_evm_address, parse_hex_u64, ChainId, Vaa, VaaError};

use super::{BlockExtractor, FetchError, RedemptionCandidate, RpcClient};
use crate::store::TxStatus;

/// Contract address -> selector -> method name. Keys are normalised
/// (lowercase, `0x` prefixed).
pub type MethodTable = HashMap<String, HashMap<String, String>>;

#[derive(Debug, Clone, Deserialize)]
pub struct EvmBlock {
    pub number: String,
    pub timestamp: String,
    #[serde(default)]
    pub transactions: Vec<EvmTransaction>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EvmTransaction {
    pub hash: String,
    pub from: String,
    /// `None` for contract creations.
    #[serde(default)]
    pub to: Option<String>,
    pub input: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CalldataError {
    #[error("invalid hex calldata")]
    InvalidHex,
    #[error("calldata too short ({0} bytes)")]
    TooShort(usize),
    #[error("bytes argument out of bounds")]
    OutOfBounds,
    #[error(transparent)]
    Vaa(#[from] VaaError),
}

/// A call that matched the method table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedCall<'a> {
    pub method: &'a str,
    pub contract: String,
}

/// Match `tx` against the method table.
pub fn match_call<'a>(methods: &'a MethodTable, to: Option<&str>, input: &str) -> Option<MatchedCall<'a>> {
    let contract = normalize_evm_address(to?)?;
    let table = methods.get(&contract)?;
    let digits = watcher_common::strip_hex_prefix(input);
    let selector = digits.get(..8)?.to_ascii_lowercase();
    let method = table.get(&format!("0x{selector}"))?;
    Some(MatchedCall {
        method: method.as_str(),
        contract,
    })
}

fn word_as_usize(word: &[u8]) -> Result<usize, CalldataError> {
    // ABI words are 32 bytes; anything above 64 bits is out of range for us.
    if word[..24].iter().any(|b| *b != 0) {
        return Err(CalldataError::OutOfBounds);
    }
    let mut low = [0u8; 8];
    low.copy_from_slice(&word[24..32]);
    usize::try_from(u64::from_be_bytes(low)).map_err(|_| CalldataError::OutOfBounds)
}

/// Extract the VAA from `selector | offset | length | bytes` calldata.
pub fn vaa_from_calldata(input: &str) -> Result<Vaa, CalldataError> {
    let data = watcher_common::decode_hex(input).map_err(|_| CalldataError::InvalidHex)?;
    if data.len() < 4 + 32 + 32 {
        return Err(CalldataError::TooShort(data.len()));
    }
    let args = &data[4..];
    let offset = word_as_usize(&args[..32])?;
    let length_word = args
        .get(offset..offset.checked_add(32).ok_or(CalldataError::OutOfBounds)?)
        .ok_or(CalldataError::OutOfBounds)?;
    let length = word_as_usize(length_word)?;
    let start = offset + 32;
    let bytes = args
        .get(start..start.checked_add(length).ok_or(CalldataError::OutOfBounds)?)
        .ok_or(CalldataError::OutOfBounds)?;
    Ok(Vaa::parse(bytes)?)
}

/// Receipt `status` to [`TxStatus`].
pub fn status_from_receipt(receipt: &Value) -> TxStatus {
    match receipt.get("status").and_then(Value::as_str) {
        Some("0x1") => TxStatus::Confirmed,
        Some("0x0") => TxStatus::FailedToProcess,
        _ => TxStatus::Unknown,
    }
}

pub(crate) fn timestamp_from_secs(secs: u64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs as i64, 0).unwrap_or_default()
}

/// EVM extractor over standard JSON-RPC.
#[derive(Debug, Clone)]
pub struct EvmExtractor {
    chain_id: ChainId,
    client: RpcClient,
    methods: MethodTable,
}

impl EvmExtractor {
    pub fn new(chain_id: ChainId, client: RpcClient, methods: MethodTable) -> Self {
        Self {
            chain_id,
            client,
            methods,
        }
    }

    /// Receipt status of `tx_hash`. A receipt that is missing or cannot be
    /// read gives `Unknown`; transient failures are returned so the block is
    /// retried.
    async fn receipt_status(&self, tx_hash: &str) -> Result<TxStatus, FetchError> {
        match self
            .client
            .call("eth_getTransactionReceipt", json!([tx_hash]))
            .await
        {
            Ok(receipt) => Ok(status_from_receipt(&receipt)),
            Err(FetchError::Decode(e)) => {
                tracing::warn!(
                    target: "watcher::evm",
                    chain = %self.chain_id,
                    tx = tx_hash,
                    error = %e,
                    "Unreadable receipt"
                );
                Ok(TxStatus::Unknown)
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl BlockExtractor for EvmExtractor {
    type Block = EvmBlock;

    fn family(&self) -> &'static str {
        "evm"
    }

    async fn latest_block(&self) -> Result<u64, FetchError> {
        let value = self.client.call("eth_blockNumber", json!([])).await?;
        value
            .as_str()
            .and_then(parse_hex_u64)
            .ok_or_else(|| FetchError::Decode(format!("eth_blockNumber: unexpected {value}")))
    }

    async fn get_block(&self, number: u64) -> Result<Option<EvmBlock>, FetchError> {
        let value = self
            .client
            .call("eth_getBlockByNumber", json!([format!("{number:#x}"), true]))
            .await?;
        if value.is_null() {
            return Err(FetchError::Remote(format!("block {number} not available yet")));
        }
        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| FetchError::Decode(format!("block {number}: {e}")))
    }

    async fn extract_candidates(&self, block: &EvmBlock) -> Result<Vec<RedemptionCandidate>, FetchError> {
        let block_number = parse_hex_u64(&block.number)
            .ok_or_else(|| FetchError::Decode(format!("block number {}", block.number)))?;
        let timestamp = timestamp_from_secs(parse_hex_u64(&block.timestamp).unwrap_or_default());

        let mut candidates = Vec::new();
        for tx in &block.transactions {
            let Some(matched) = match_call(&self.methods, tx.to.as_deref(), &tx.input) else {
                continue;
            };

            let vaa = match vaa_from_calldata(&tx.input) {
                Ok(vaa) => vaa,
                Err(e) => {
                    tracing::warn!(
                        target: "watcher::evm",
                        chain = %self.chain_id,
                        tx = %tx.hash,
                        method = matched.method,
                        error = %e,
                        "Skipping undecodable redemption"
                    );
                    continue;
                }
            };

            let status = self.receipt_status(&tx.hash).await?;

            candidates.push(RedemptionCandidate {
                message_id: vaa.message_id(),
                chain_id: self.chain_id,
                method: matched.method.to_string(),
                tx_hash: tx.hash.to_ascii_lowercase(),
                from: normalize_evm_address(&tx.from).unwrap_or_else(|| tx.from.clone()),
                to: matched.contract,
                block_number,
                timestamp,
                status,
            });
        }

        Ok(candidates)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::extractor::mock_rpc::{result, rpc_client, rpc_error, too_many_requests};
    use watcher_common::vaa::fixtures::signed_vaa;

    pub const TOKEN_BRIDGE: &str = "0x3ee18b2214aff97000d974cf647e7c347e8fa585";

    pub fn method_table() -> MethodTable {
        let methods = HashMap::from([
            ("0xc6878519".to_string(), "completeTransfer".to_string()),
            ("0xff200cde".to_string(), "completeTransferAndUnwrapETH".to_string()),
        ]);
        HashMap::from([(TOKEN_BRIDGE.to_string(), methods)])
    }

    /// ABI-encode `selector(bytes)`.
    pub fn calldata(selector: &str, vaa: &[u8]) -> String {
        let mut data = watcher_common::decode_hex(selector).unwrap();
        let mut offset = [0u8; 32];
        offset[31] = 0x20;
        data.extend_from_slice(&offset);
        let mut length = [0u8; 32];
        length[24..].copy_from_slice(&(vaa.len() as u64).to_be_bytes());
        data.extend_from_slice(&length);
        data.extend_from_slice(vaa);
        data.resize(data.len() + (32 - vaa.len() % 32) % 32, 0);
        format!("0x{}", hex::encode(data))
    }

    #[test]
    fn test_match_call() {
        let table = method_table();
        let input = "0xC6878519deadbeef";

        let matched = match_call(&table, Some("0x3EE18B2214AFF97000D974CF647E7C347E8FA585"), input).unwrap();
        assert_eq!(matched.method, "completeTransfer");
        assert_eq!(matched.contract, TOKEN_BRIDGE);

        assert!(match_call(&table, Some(TOKEN_BRIDGE), "0xa9059cbb00").is_none());
        assert!(match_call(&table, Some("0x0000000000000000000000000000000000000001"), input).is_none());
        assert!(match_call(&table, None, input).is_none());
        assert!(match_call(&table, Some(TOKEN_BRIDGE), "0xc687").is_none());
    }

    #[test]
    fn test_vaa_from_calldata() {
        let vaa = signed_vaa(ChainId::SOLANA, [3u8; 32], 812, 13, b"transfer payload");
        let input = calldata("0xc6878519", &vaa);

        let parsed = vaa_from_calldata(&input).unwrap();
        assert_eq!(parsed.emitter_chain, ChainId::SOLANA);
        assert_eq!(parsed.sequence, 812);
        assert_eq!(parsed.payload, b"transfer payload");
    }

    #[test]
    fn test_vaa_from_bad_calldata() {
        assert_eq!(vaa_from_calldata("0xzz"), Err(CalldataError::InvalidHex));
        assert_eq!(vaa_from_calldata("0xc6878519"), Err(CalldataError::TooShort(4)));

        // Length word claims more bytes than present.
        let vaa = signed_vaa(ChainId::SOLANA, [3u8; 32], 1, 0, b"");
        let mut input = calldata("0xc6878519", &vaa);
        input.truncate(2 + (4 + 64 + 10) * 2);
        assert_eq!(vaa_from_calldata(&input), Err(CalldataError::OutOfBounds));

        // Well-formed ABI, not a VAA.
        let input = calldata("0xc6878519", &[9u8; 40]);
        assert!(matches!(vaa_from_calldata(&input), Err(CalldataError::Vaa(_))));
    }

    #[test]
    fn test_status_from_receipt() {
        assert_eq!(status_from_receipt(&json!({"status": "0x1"})), TxStatus::Confirmed);
        assert_eq!(status_from_receipt(&json!({"status": "0x0"})), TxStatus::FailedToProcess);
        assert_eq!(status_from_receipt(&json!({"status": "0x2"})), TxStatus::Unknown);
        assert_eq!(status_from_receipt(&json!({})), TxStatus::Unknown);
        assert_eq!(status_from_receipt(&Value::Null), TxStatus::Unknown);
    }

    fn redemption_block(vaa: &[u8]) -> EvmBlock {
        serde_json::from_value(json!({
            "number": "0x10",
            "timestamp": "0x6553f100",
            "transactions": [
                {"hash": "0xAB", "from": "0xbb", "to": TOKEN_BRIDGE, "input": calldata("0xc6878519", vaa)}
            ]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_throttled_receipt_fails_the_block() {
        let client = rpc_client(|method, _| match method {
            "eth_getTransactionReceipt" => too_many_requests(),
            _ => rpc_error(-32601, "method not found"),
        })
        .await;
        let extractor = EvmExtractor::new(ChainId::ETHEREUM, client, method_table());
        let block = redemption_block(&signed_vaa(ChainId::SOLANA, [3u8; 32], 5, 0, b""));

        let result = extractor.extract_candidates(&block).await;
        assert!(matches!(result, Err(FetchError::Throttled(_))));
    }

    #[tokio::test]
    async fn test_receipt_status_resolution() {
        let client = rpc_client(|method, params| match (method, params[0].as_str()) {
            ("eth_getTransactionReceipt", Some("0xAB")) => result(json!({"status": "0x0"})),
            _ => rpc_error(-32601, "method not found"),
        })
        .await;
        let extractor = EvmExtractor::new(ChainId::ETHEREUM, client, method_table());
        let block = redemption_block(&signed_vaa(ChainId::SOLANA, [3u8; 32], 5, 0, b""));

        let candidates = extractor.extract_candidates(&block).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].status, TxStatus::FailedToProcess);
        assert_eq!(candidates[0].block_number, 16);
        assert_eq!(candidates[0].tx_hash, "0xab");

        // Receipt not indexed yet.
        let client = rpc_client(|_, _| result(Value::Null)).await;
        let extractor = EvmExtractor::new(ChainId::ETHEREUM, client, method_table());
        let candidates = extractor.extract_candidates(&block).await.unwrap();
        assert_eq!(candidates[0].status, TxStatus::Unknown);
    }

    #[test]
    fn test_block_fixture_deserializes() {
        let block: EvmBlock = serde_json::from_value(json!({
            "number": "0x112a880",
            "timestamp": "0x6553f100",
            "hash": "0xblock",
            "transactions": [
                {"hash": "0x01", "from": "0xaa", "to": null, "input": "0x", "value": "0x0"},
                {"hash": "0x02", "from": "0xbb", "to": TOKEN_BRIDGE, "input": "0xc6878519"}
            ]
        }))
        .unwrap();

        assert_eq!(parse_hex_u64(&block.number), Some(18_000_000));
        assert_eq!(block.transactions.len(), 2);
        assert!(block.transactions[0].to.is_none());
    }
}
