//! In-process store.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use watcher_common::MessageId;

use super::{reconcile, CursorStore, RecordStore, RedemptionRecord, TxStatus, UpsertOutcome};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorEntry {
    pub block: u64,
    pub updated_at: DateTime<Utc>,
}

/// [`CursorStore`] and [`RecordStore`] backed by hash maps.
///
/// Each upsert holds the record lock while it reconciles, so concurrent
/// writers for the same message id are serialised.
#[derive(Debug, Default)]
pub struct MemoryStore {
    cursors: Mutex<HashMap<String, CursorEntry>>,
    records: Mutex<HashMap<MessageId, RedemptionRecord>>,
    cursor_writes: Mutex<Vec<(String, u64)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn cursor(&self, chain: &str) -> Option<CursorEntry> {
        self.cursors.lock().await.get(chain).cloned()
    }

    /// Every cursor write, in order.
    pub async fn cursor_writes(&self) -> Vec<(String, u64)> {
        self.cursor_writes.lock().await.clone()
    }

    pub async fn record(&self, message_id: &MessageId) -> Option<RedemptionRecord> {
        self.records.lock().await.get(message_id).cloned()
    }

    pub async fn records(&self) -> Vec<RedemptionRecord> {
        let mut records: Vec<_> = self.records.lock().await.values().cloned().collect();
        records.sort_by(|a, b| a.message_id.cmp(&b.message_id));
        records
    }
}

#[async_trait]
impl CursorStore for MemoryStore {
    async fn current_block(&self, chain: &str, fallback: u64) -> Result<u64> {
        Ok(self
            .cursors
            .lock()
            .await
            .get(chain)
            .map_or(fallback, |entry| entry.block))
    }

    async fn update_cursor(&self, chain: &str, block: u64, updated_at: DateTime<Utc>) -> Result<()> {
        self.cursors
            .lock()
            .await
            .insert(chain.to_string(), CursorEntry { block, updated_at });
        self.cursor_writes.lock().await.push((chain.to_string(), block));
        Ok(())
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn existing_status(&self, message_id: &MessageId) -> Result<Option<TxStatus>> {
        Ok(self.records.lock().await.get(message_id).map(|r| r.status))
    }

    async fn upsert(&self, record: &RedemptionRecord) -> Result<UpsertOutcome> {
        let mut records = self.records.lock().await;
        let stored = records.get(&record.message_id).map(|r| r.status);
        if let Err(rejection) = reconcile(stored, record.status) {
            return Ok(UpsertOutcome::Rejected(rejection));
        }
        records.insert(record.message_id.clone(), record.clone());
        Ok(UpsertOutcome::Written)
    }
}
