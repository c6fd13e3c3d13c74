//! Chain transaction extractors.
//!
//! One extractor per chain family turns remote blocks into canonical
//! [`RedemptionCandidate`]s. Block-oriented chains implement
//! [`BlockExtractor`]; address-indexed aggregators that page by token instead
//! of by block implement [`ActivityExtractor`].

pub mod ankr;
pub mod aptos;
pub mod evm;
#[cfg(test)]
pub(crate) mod mock_rpc;
pub mod rpc;
pub mod solana;
pub mod terra;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use watcher_common::{ChainId, MessageId};

use crate::store::{RedemptionRecord, TxStatus};

pub use ankr::AnkrExtractor;
pub use aptos::AptosExtractor;
pub use evm::EvmExtractor;
pub use rpc::RpcClient;
pub use solana::SolanaExtractor;
pub use terra::TerraExtractor;

/// Remote fetch failure, classified for the retry policy.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    /// The endpoint rate-limited us. Worth retrying.
    #[error("throttled: {0}")]
    Throttled(String),
    /// Network failure or an error answer.
    #[error("remote error: {0}")]
    Remote(String),
    /// The answer could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),
    #[error("cancelled")]
    Cancelled,
}

impl FetchError {
    /// Whether the same request may succeed later. A decode failure repeats
    /// on every attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Throttled(_) | FetchError::Remote(_))
    }
}

/// A redemption observed on a destination chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RedemptionCandidate {
    pub message_id: MessageId,
    /// Chain the redemption executed on.
    pub chain_id: ChainId,
    pub method: String,
    pub tx_hash: String,
    pub from: String,
    pub to: String,
    pub block_number: u64,
    pub timestamp: DateTime<Utc>,
    pub status: TxStatus,
}

impl RedemptionCandidate {
    pub fn into_record(self, updated_at: DateTime<Utc>) -> RedemptionRecord {
        RedemptionRecord {
            message_id: self.message_id,
            chain_id: self.chain_id,
            status: self.status,
            method: self.method,
            tx_hash: self.tx_hash,
            from: self.from,
            to: self.to,
            block_number: self.block_number,
            timestamp: self.timestamp,
            updated_at,
        }
    }
}

/// Block-by-block source of redemptions.
#[async_trait]
pub trait BlockExtractor: Send + Sync {
    /// Block as returned by the remote endpoint.
    type Block: Send + Sync;

    /// Chain family, used in logs.
    fn family(&self) -> &'static str;

    async fn latest_block(&self) -> Result<u64, FetchError>;

    /// Fetch one block. `Ok(None)` means the height holds no block (a skipped
    /// Solana slot, for instance) and is not an error.
    async fn get_block(&self, number: u64) -> Result<Option<Self::Block>, FetchError>;

    /// Candidates carried by `block`.
    ///
    /// Undecodable transactions are logged and dropped here. An `Err` means
    /// the block could not be inspected at all (a secondary lookup was
    /// throttled, for instance) and the whole block is retried or skipped.
    async fn extract_candidates(&self, block: &Self::Block) -> Result<Vec<RedemptionCandidate>, FetchError>;
}

/// One page of an address-activity listing.
#[derive(Debug, Clone, Default)]
pub struct ActivityPage {
    pub candidates: Vec<RedemptionCandidate>,
    /// Highest block number among the transactions in the page.
    pub highest_block: Option<u64>,
    pub next_page_token: Option<String>,
}

/// Source of redemptions listed per tracked address, paginated by token.
#[async_trait]
pub trait ActivityExtractor: Send + Sync {
    fn family(&self) -> &'static str;

    async fn latest_block(&self) -> Result<u64, FetchError>;

    async fn activity_page(
        &self,
        from_block: u64,
        to_block: u64,
        page_token: Option<&str>,
    ) -> Result<ActivityPage, FetchError>;
}
