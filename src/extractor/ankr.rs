//! Ankr address-activity extractor.
//!
//! Instead of walking blocks, asks the aggregator for every transaction that
//! touched the tracked contracts in `[from, to]`, following `nextPageToken`.
//! Transactions arrive with their receipt status already attached.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use watcher_common::{normalize_evm_address, parse_hex_u64, ChainId};

use super::evm::{match_call, status_from_receipt, timestamp_from_secs, vaa_from_calldata, MethodTable};
use super::{ActivityExtractor, ActivityPage, FetchError, RedemptionCandidate, RpcClient};

pub const DEFAULT_PAGE_SIZE: u64 = 1000;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnkrTransactionsResult {
    #[serde(default)]
    pub transactions: Vec<AnkrTransaction>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnkrTransaction {
    pub hash: String,
    pub block_number: String,
    pub from: String,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub input: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// Turn one aggregator page into candidates.
pub fn page_from_result(chain_id: ChainId, methods: &MethodTable, result: AnkrTransactionsResult) -> ActivityPage {
    let mut page = ActivityPage {
        next_page_token: result.next_page_token.filter(|token| !token.is_empty()),
        ..ActivityPage::default()
    };

    for tx in result.transactions {
        let Some(block_number) = parse_hex_u64(&tx.block_number) else {
            tracing::warn!(
                target: "watcher::ankr",
                chain = %chain_id,
                tx = %tx.hash,
                "Skipping transaction with bad block number {}",
                tx.block_number
            );
            continue;
        };
        page.highest_block = page.highest_block.max(Some(block_number));

        let Some(matched) = match_call(methods, tx.to.as_deref(), &tx.input) else {
            continue;
        };

        let vaa = match vaa_from_calldata(&tx.input) {
            Ok(vaa) => vaa,
            Err(e) => {
                tracing::warn!(
                    target: "watcher::ankr",
                    chain = %chain_id,
                    tx = %tx.hash,
                    error = %e,
                    "Skipping undecodable redemption"
                );
                continue;
            }
        };

        let status = status_from_receipt(&json!({ "status": tx.status }));
        let timestamp = timestamp_from_secs(
            tx.timestamp
                .as_deref()
                .and_then(parse_hex_u64)
                .unwrap_or_default(),
        );

        page.candidates.push(RedemptionCandidate {
            message_id: vaa.message_id(),
            chain_id,
            method: matched.method.to_string(),
            tx_hash: tx.hash.to_ascii_lowercase(),
            from: normalize_evm_address(&tx.from).unwrap_or(tx.from),
            to: matched.contract,
            block_number,
            timestamp,
            status,
        });
    }

    page
}

/// Ankr multichain API extractor.
#[derive(Debug, Clone)]
pub struct AnkrExtractor {
    chain_id: ChainId,
    /// Ankr's blockchain name (`eth`, `bsc`, `polygon`, ...).
    blockchain: String,
    client: RpcClient,
    methods: MethodTable,
    page_size: u64,
}

impl AnkrExtractor {
    pub fn new(chain_id: ChainId, blockchain: String, client: RpcClient, methods: MethodTable) -> Self {
        Self {
            chain_id,
            blockchain,
            client,
            methods,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: u64) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn request_params(&self, from_block: u64, to_block: u64, page_token: Option<&str>) -> Value {
        let mut addresses: Vec<&String> = self.methods.keys().collect();
        addresses.sort();
        let mut params = json!({
            "blockchain": self.blockchain,
            "fromBlock": from_block,
            "toBlock": to_block,
            "address": addresses,
            "pageSize": self.page_size,
            "descOrder": false,
            "includeLogs": false,
        });
        if let Some(token) = page_token {
            params["pageToken"] = Value::String(token.to_string());
        }
        params
    }
}

#[async_trait]
impl ActivityExtractor for AnkrExtractor {
    fn family(&self) -> &'static str {
        "ankr"
    }

    async fn latest_block(&self) -> Result<u64, FetchError> {
        let value = self.client.call("eth_blockNumber", json!([])).await?;
        value
            .as_str()
            .and_then(parse_hex_u64)
            .ok_or_else(|| FetchError::Decode(format!("eth_blockNumber: unexpected {value}")))
    }

    async fn activity_page(
        &self,
        from_block: u64,
        to_block: u64,
        page_token: Option<&str>,
    ) -> Result<ActivityPage, FetchError> {
        let value = self
            .client
            .call(
                "ankr_getTransactionsByAddress",
                self.request_params(from_block, to_block, page_token),
            )
            .await?;
        let result: AnkrTransactionsResult = serde_json::from_value(value)
            .map_err(|e| FetchError::Decode(format!("ankr_getTransactionsByAddress: {e}")))?;
        Ok(page_from_result(self.chain_id, &self.methods, result))
    }
}
