//! Cursor and redemption record stores.
//!
//! The watcher only talks to the [`CursorStore`] and [`RecordStore`] traits.
//! [`WatcherDb`] persists both in SQLite or Postgres; [`MemoryStore`] keeps
//! them in process for tests and dry runs.

pub mod memory;
pub mod reconcile;
pub mod watcher_db;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use watcher_common::{ChainId, MessageId};

pub use memory::MemoryStore;
pub use reconcile::{reconcile, ReconcileError, TxStatus};
pub use watcher_db::{WatcherDb, WatcherDbConfig};

/// One redemption, keyed by the message id of the VAA it consumed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RedemptionRecord {
    pub message_id: MessageId,
    /// Chain on which the redemption executed.
    pub chain_id: ChainId,
    pub status: TxStatus,
    pub method: String,
    pub tx_hash: String,
    pub from: String,
    pub to: String,
    pub block_number: u64,
    pub timestamp: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result of a record write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    Written,
    /// The reconciler refused the write; the stored record is unchanged.
    Rejected(ReconcileError),
}

/// Durable last-processed block per watcher.
#[async_trait]
pub trait CursorStore: Send + Sync {
    /// Last processed block for `chain`, or `fallback` when none was persisted.
    async fn current_block(&self, chain: &str, fallback: u64) -> Result<u64>;

    /// Idempotent upsert of the cursor.
    async fn update_cursor(&self, chain: &str, block: u64, updated_at: DateTime<Utc>) -> Result<()>;
}

/// Durable redemption records with reconciliation applied on every write.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn existing_status(&self, message_id: &MessageId) -> Result<Option<TxStatus>>;

    /// Write `record` unless it would downgrade the stored status.
    ///
    /// A rejected write is reported as [`UpsertOutcome::Rejected`], not as an error.
    async fn upsert(&self, record: &RedemptionRecord) -> Result<UpsertOutcome>;
}
