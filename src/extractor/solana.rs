//! Solana extractor.
//!
//! Token-bridge redemptions (`CompleteNative`, `CompleteWrapped`) do not carry
//! the VAA themselves; they reference the account the core bridge posted it
//! to. The VAA identity is recovered from the `PostVAA` instruction of an
//! earlier transaction that touched that account.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use watcher_common::{ChainId, PostedVaa};

use super::{BlockExtractor, FetchError, RedemptionCandidate, RpcClient};
use crate::store::TxStatus;

pub const TOKEN_BRIDGE_PROGRAM: &str = "wormDTUJ6AWPNvk59vGQbDvGJmqbDTdgWgAqcLBCgUb";
pub const CORE_BRIDGE_PROGRAM: &str = "worm2ZoG2kUd4vFXhvjh93UUH596ayRfgQ2MgjNMTth";

const COMPLETE_NATIVE_TAG: u8 = 2;
const COMPLETE_WRAPPED_TAG: u8 = 3;
/// Position of the posted-VAA account in complete-transfer instructions.
const POSTED_VAA_ACCOUNT_INDEX: usize = 2;

/// Slot skipped, or skipped and missing from long-term storage. "Block not
/// available" (-32004) is not in the list: recent slots answer it until the
/// node catches up, so it is a remote error and the slot is retried.
const EMPTY_SLOT_CODES: [i64; 2] = [-32007, -32009];

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SolanaBlock {
    #[serde(skip)]
    pub slot: u64,
    #[serde(default)]
    pub block_time: Option<i64>,
    #[serde(default)]
    pub transactions: Vec<SolanaTransaction>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SolanaTransaction {
    pub transaction: TransactionBody,
    #[serde(default)]
    pub meta: Option<TransactionMeta>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransactionBody {
    pub signatures: Vec<String>,
    pub message: Message,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub account_keys: Vec<String>,
    #[serde(default)]
    pub instructions: Vec<CompiledInstruction>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompiledInstruction {
    pub program_id_index: usize,
    #[serde(default)]
    pub accounts: Vec<usize>,
    /// Base58 instruction data.
    pub data: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionMeta {
    #[serde(default)]
    pub err: Option<serde_json::Value>,
    #[serde(default)]
    pub loaded_addresses: Option<LoadedAddresses>,
    #[serde(default)]
    pub inner_instructions: Option<Vec<InnerInstructions>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoadedAddresses {
    #[serde(default)]
    pub writable: Vec<String>,
    #[serde(default)]
    pub readonly: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InnerInstructions {
    #[serde(default)]
    pub instructions: Vec<CompiledInstruction>,
}

#[derive(Debug, Clone, Deserialize)]
struct SignatureInfo {
    signature: String,
    #[serde(default)]
    err: Option<serde_json::Value>,
}

impl SolanaTransaction {
    fn failed(&self) -> bool {
        self.meta
            .as_ref()
            .and_then(|meta| meta.err.as_ref())
            .is_some_and(|err| !err.is_null())
    }

    /// Static keys followed by keys loaded from lookup tables (v0 messages).
    pub fn account_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self
            .transaction
            .message
            .account_keys
            .iter()
            .map(String::as_str)
            .collect();
        if let Some(loaded) = self.meta.as_ref().and_then(|m| m.loaded_addresses.as_ref()) {
            keys.extend(loaded.writable.iter().map(String::as_str));
            keys.extend(loaded.readonly.iter().map(String::as_str));
        }
        keys
    }

    fn all_instructions(&self) -> impl Iterator<Item = &CompiledInstruction> {
        let inner = self
            .meta
            .as_ref()
            .and_then(|m| m.inner_instructions.as_ref())
            .into_iter()
            .flatten()
            .flat_map(|group| group.instructions.iter());
        self.transaction.message.instructions.iter().chain(inner)
    }
}

/// A complete-transfer instruction and the posted VAA account it consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedemptionInstruction {
    pub method: &'static str,
    pub posted_vaa_account: String,
}

fn instruction_data(instruction: &CompiledInstruction) -> Option<Vec<u8>> {
    bs58::decode(&instruction.data).into_vec().ok()
}

/// Top-level token-bridge complete-transfer instructions of `tx`.
pub fn find_redemptions(tx: &SolanaTransaction, token_bridge: &str) -> Vec<RedemptionInstruction> {
    let keys = tx.account_keys();
    tx.transaction
        .message
        .instructions
        .iter()
        .filter(|ix| keys.get(ix.program_id_index) == Some(&token_bridge))
        .filter_map(|ix| {
            let method = match *instruction_data(ix)?.first()? {
                COMPLETE_NATIVE_TAG => "completeNative",
                COMPLETE_WRAPPED_TAG => "completeWrapped",
                _ => return None,
            };
            let account = keys.get(*ix.accounts.get(POSTED_VAA_ACCOUNT_INDEX)?)?;
            Some(RedemptionInstruction {
                method,
                posted_vaa_account: (*account).to_string(),
            })
        })
        .collect()
}

/// First core-bridge `PostVAA` instruction of `tx` that decodes.
pub fn find_posted_vaa(tx: &SolanaTransaction, core_bridge: &str) -> Option<PostedVaa> {
    let keys = tx.account_keys();
    tx.all_instructions()
        .filter(|ix| keys.get(ix.program_id_index) == Some(&core_bridge))
        .find_map(|ix| PostedVaa::parse_instruction(&instruction_data(ix)?).ok())
}

/// Solana JSON-RPC extractor.
#[derive(Debug, Clone)]
pub struct SolanaExtractor {
    chain_id: ChainId,
    client: RpcClient,
    token_bridge: String,
    core_bridge: String,
}

impl SolanaExtractor {
    pub fn new(chain_id: ChainId, client: RpcClient, token_bridge: String, core_bridge: String) -> Self {
        Self {
            chain_id,
            client,
            token_bridge,
            core_bridge,
        }
    }

    /// Walk the posted-VAA account's history, oldest first, until a
    /// transaction carrying the `PostVAA` instruction is found.
    async fn lookup_posted_vaa(&self, account: &str) -> Result<Option<PostedVaa>, FetchError> {
        let value = self
            .client
            .call(
                "getSignaturesForAddress",
                json!([account, {"commitment": "confirmed"}]),
            )
            .await?;
        let signatures: Vec<SignatureInfo> = serde_json::from_value(value)
            .map_err(|e| FetchError::Decode(format!("getSignaturesForAddress: {e}")))?;

        let succeeded = signatures
            .iter()
            .rev()
            .filter(|info| !info.err.as_ref().is_some_and(|err| !err.is_null()));
        for info in succeeded {
            let value = self
                .client
                .call(
                    "getTransaction",
                    json!([info.signature, {
                        "encoding": "json",
                        "commitment": "confirmed",
                        "maxSupportedTransactionVersion": 0
                    }]),
                )
                .await?;
            if value.is_null() {
                continue;
            }
            let tx: SolanaTransaction = match serde_json::from_value(value) {
                Ok(tx) => tx,
                Err(e) => {
                    tracing::debug!(
                        target: "watcher::solana",
                        signature = %info.signature,
                        error = %e,
                        "Undecodable sibling transaction"
                    );
                    continue;
                }
            };
            if let Some(posted) = find_posted_vaa(&tx, &self.core_bridge) {
                return Ok(Some(posted));
            }
        }

        Ok(None)
    }
}

#[async_trait]
impl BlockExtractor for SolanaExtractor {
    type Block = SolanaBlock;

    fn family(&self) -> &'static str {
        "solana"
    }

    async fn latest_block(&self) -> Result<u64, FetchError> {
        let value = self
            .client
            .call("getSlot", json!([{"commitment": "confirmed"}]))
            .await?;
        value
            .as_u64()
            .ok_or_else(|| FetchError::Decode(format!("getSlot: unexpected {value}")))
    }

    async fn get_block(&self, slot: u64) -> Result<Option<SolanaBlock>, FetchError> {
        let params = json!([slot, {
            "encoding": "json",
            "transactionDetails": "full",
            "maxSupportedTransactionVersion": 0,
            "commitment": "confirmed",
            "rewards": false
        }]);
        let Some(value) = self
            .client
            .call_allowing("getBlock", params, &EMPTY_SLOT_CODES)
            .await?
        else {
            return Ok(None);
        };
        if value.is_null() {
            return Ok(None);
        }

        let mut block: SolanaBlock = serde_json::from_value(value)
            .map_err(|e| FetchError::Decode(format!("slot {slot}: {e}")))?;
        block.slot = slot;
        Ok(Some(block))
    }

    async fn extract_candidates(&self, block: &SolanaBlock) -> Result<Vec<RedemptionCandidate>, FetchError> {
        let timestamp = block
            .block_time
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
            .unwrap_or_default();

        let mut candidates = Vec::new();
        for tx in &block.transactions {
            if tx.failed() {
                continue;
            }
            let redemptions = find_redemptions(tx, &self.token_bridge);
            if redemptions.is_empty() {
                continue;
            }
            let signature = tx.transaction.signatures.first().cloned().unwrap_or_default();
            let signer = tx.account_keys().first().map(ToString::to_string).unwrap_or_default();

            for redemption in redemptions {
                let posted = match self.lookup_posted_vaa(&redemption.posted_vaa_account).await {
                    Ok(Some(posted)) => posted,
                    Ok(None) => {
                        tracing::warn!(
                            target: "watcher::solana",
                            slot = block.slot,
                            tx = %signature,
                            account = %redemption.posted_vaa_account,
                            "No PostVAA instruction found for posted VAA account"
                        );
                        continue;
                    }
                    Err(e @ (FetchError::Throttled(_) | FetchError::Cancelled)) => return Err(e),
                    Err(e) => {
                        tracing::warn!(
                            target: "watcher::solana",
                            slot = block.slot,
                            tx = %signature,
                            error = %e,
                            "Posted VAA lookup failed"
                        );
                        continue;
                    }
                };

                candidates.push(RedemptionCandidate {
                    message_id: posted.message_id(),
                    chain_id: self.chain_id,
                    method: redemption.method.to_string(),
                    tx_hash: signature.clone(),
                    from: signer.clone(),
                    to: self.token_bridge.clone(),
                    block_number: block.slot,
                    timestamp,
                    status: TxStatus::Confirmed,
                });
            }
        }

        Ok(candidates)
    }
}
