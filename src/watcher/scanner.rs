//! Range scanners.
//!
//! A scanner processes one explicit block range for one chain: it fetches,
//! extracts, reconciles and writes records, and advances the cursor. The
//! continuous loop and backfill share it; only [`ScanOptions`] differ.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use watcher_common::ChainId;

use super::pagination::pages;
use super::retry::RetryPolicy;
use super::WatcherError;
use crate::extractor::{ActivityExtractor, BlockExtractor, FetchError, RedemptionCandidate};
use crate::store::{CursorStore, RecordStore, UpsertOutcome};

/// Everything a scan needs besides the extractor.
#[derive(Clone)]
pub struct ScanContext {
    pub chain: String,
    pub chain_id: ChainId,
    pub cursors: Arc<dyn CursorStore>,
    pub records: Arc<dyn RecordStore>,
    pub retry: RetryPolicy,
    pub cancel: CancellationToken,
}

impl std::fmt::Debug for ScanContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanContext")
            .field("chain", &self.chain)
            .field("chain_id", &self.chain_id)
            .field("retry", &self.retry)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanOptions {
    pub page_size: u64,
    /// Write the cursor after each page.
    pub persist: bool,
    /// Stop at the first block that failed with a transient error, leaving
    /// the cursor before it, instead of skipping it.
    pub stop_at_failure: bool,
}

/// Outcome of one range scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub from_block: u64,
    pub to_block: u64,
    pub blocks_processed: u64,
    pub blocks_skipped: u64,
    pub candidates: u64,
    pub records_written: u64,
    pub records_rejected: u64,
    /// Last block known to be fully processed.
    pub last_block: Option<u64>,
    /// Whether the whole range was processed.
    pub complete: bool,
}

impl ScanReport {
    fn new(from_block: u64, to_block: u64) -> Self {
        Self {
            from_block,
            to_block,
            ..Self::default()
        }
    }
}

impl ScanContext {
    /// Write candidates through the reconciler. Store failures are logged and
    /// counted as rejections; they never abort the scan.
    pub async fn write_candidates(&self, candidates: Vec<RedemptionCandidate>, report: &mut ScanReport) {
        report.candidates += candidates.len() as u64;
        let now = Utc::now();

        for candidate in candidates {
            let record = candidate.into_record(now);
            match self.records.upsert(&record).await {
                Ok(UpsertOutcome::Written) => {
                    report.records_written += 1;
                    metrics::counter!("watcher_records_written_total", "chain" => self.chain.clone()).increment(1);
                    tracing::info!(
                        target: "watcher::scan",
                        chain = %self.chain,
                        message_id = %record.message_id,
                        tx = %record.tx_hash,
                        status = %record.status,
                        method = %record.method,
                        "Redemption recorded"
                    );
                }
                Ok(UpsertOutcome::Rejected(reason)) => {
                    report.records_rejected += 1;
                    metrics::counter!("watcher_records_rejected_total", "chain" => self.chain.clone()).increment(1);
                    tracing::debug!(
                        target: "watcher::scan",
                        chain = %self.chain,
                        message_id = %record.message_id,
                        tx = %record.tx_hash,
                        status = %record.status,
                        %reason,
                        "Redemption not updated"
                    );
                }
                Err(e) => {
                    report.records_rejected += 1;
                    tracing::error!(
                        target: "watcher::scan",
                        chain = %self.chain,
                        message_id = %record.message_id,
                        error = %e,
                        "Failed to write redemption"
                    );
                }
            }
        }
    }

    /// Persist the cursor. Failures are logged; the next page retries.
    pub async fn commit_cursor(&self, block: u64) {
        match self.cursors.update_cursor(&self.chain, block, Utc::now()).await {
            Ok(()) => {
                metrics::gauge!("watcher_cursor_block", "chain" => self.chain.clone()).set(block as f64);
                tracing::debug!(target: "watcher::scan", chain = %self.chain, block, "Cursor updated");
            }
            Err(e) => {
                tracing::error!(
                    target: "watcher::scan",
                    chain = %self.chain,
                    block,
                    error = %e,
                    "Failed to update cursor"
                );
            }
        }
    }

    fn block_processed(&self, report: &mut ScanReport) {
        report.blocks_processed += 1;
        metrics::counter!("watcher_blocks_processed_total", "chain" => self.chain.clone()).increment(1);
    }

    fn block_skipped(&self, block: u64, error: &FetchError, report: &mut ScanReport) {
        report.blocks_skipped += 1;
        metrics::counter!("watcher_blocks_skipped_total", "chain" => self.chain.clone()).increment(1);
        tracing::warn!(
            target: "watcher::scan",
            chain = %self.chain,
            block,
            error = %error,
            "Skipping block"
        );
    }
}

/// Chain-specific half of a watcher.
#[async_trait]
pub trait Scanner: Send + Sync + 'static {
    fn family(&self) -> &'static str;

    async fn latest_block(&self) -> Result<u64, FetchError>;

    /// Process `[from, to]`. Only cancellation is reported as an error.
    async fn scan_range(
        &self,
        ctx: &ScanContext,
        from: u64,
        to: u64,
        options: ScanOptions,
    ) -> Result<ScanReport, WatcherError>;
}

/// Block-by-block scanner.
#[derive(Debug)]
pub struct BlockScanner<E> {
    extractor: E,
}

impl<E: BlockExtractor> BlockScanner<E> {
    pub fn new(extractor: E) -> Self {
        Self { extractor }
    }

    pub fn extractor(&self) -> &E {
        &self.extractor
    }

    async fn fetch_candidates(&self, number: u64) -> Result<Option<Vec<RedemptionCandidate>>, FetchError> {
        match self.extractor.get_block(number).await? {
            Some(block) => self.extractor.extract_candidates(&block).await.map(Some),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl<E: BlockExtractor + 'static> Scanner for BlockScanner<E> {
    fn family(&self) -> &'static str {
        self.extractor.family()
    }

    async fn latest_block(&self) -> Result<u64, FetchError> {
        self.extractor.latest_block().await
    }

    async fn scan_range(
        &self,
        ctx: &ScanContext,
        from: u64,
        to: u64,
        options: ScanOptions,
    ) -> Result<ScanReport, WatcherError> {
        let mut report = ScanReport::new(from, to);

        for page in pages(from, to, options.page_size) {
            tracing::debug!(
                target: "watcher::scan",
                chain = %ctx.chain,
                from = page.from,
                to = page.to,
                "Processing page"
            );

            for number in page.blocks() {
                if ctx.cancel.is_cancelled() {
                    return Err(WatcherError::Cancelled);
                }

                match ctx.retry.execute(&ctx.cancel, || self.fetch_candidates(number)).await {
                    Ok(Some(candidates)) => {
                        ctx.write_candidates(candidates, &mut report).await;
                        ctx.block_processed(&mut report);
                    }
                    Ok(None) => ctx.block_processed(&mut report),
                    Err(FetchError::Cancelled) => return Err(WatcherError::Cancelled),
                    Err(e) => {
                        ctx.block_skipped(number, &e, &mut report);
                        // An undecodable block fails the same way on every poll, so it is skipped.
                        if options.stop_at_failure && e.is_transient() {
                            // Leave the cursor before the failed block so the next cycle retries it.
                            if let Some(last) = number.checked_sub(1).filter(|last| *last >= from) {
                                if options.persist && last >= page.from {
                                    ctx.commit_cursor(last).await;
                                }
                                report.last_block = Some(last);
                            }
                            return Ok(report);
                        }
                    }
                }
            }

            if options.persist {
                ctx.commit_cursor(page.to).await;
            }
            report.last_block = Some(page.to);
        }

        report.complete = true;
        Ok(report)
    }
}

/// Page-token scanner over an address-activity API.
///
/// The cursor becomes the highest block seen in the listing, or `to` when the
/// listing was empty.
#[derive(Debug)]
pub struct ActivityScanner<A> {
    extractor: A,
}

impl<A: ActivityExtractor> ActivityScanner<A> {
    pub fn new(extractor: A) -> Self {
        Self { extractor }
    }
}

#[async_trait]
impl<A: ActivityExtractor + 'static> Scanner for ActivityScanner<A> {
    fn family(&self) -> &'static str {
        self.extractor.family()
    }

    async fn latest_block(&self) -> Result<u64, FetchError> {
        self.extractor.latest_block().await
    }

    async fn scan_range(
        &self,
        ctx: &ScanContext,
        from: u64,
        to: u64,
        options: ScanOptions,
    ) -> Result<ScanReport, WatcherError> {
        let mut report = ScanReport::new(from, to);
        let mut highest: Option<u64> = None;
        let mut page_token: Option<String> = None;
        let mut seen_tokens: HashSet<String> = HashSet::new();

        loop {
            if ctx.cancel.is_cancelled() {
                return Err(WatcherError::Cancelled);
            }

            let token = page_token.as_deref();
            let page = match ctx
                .retry
                .execute(&ctx.cancel, || self.extractor.activity_page(from, to, token))
                .await
            {
                Ok(page) => page,
                Err(FetchError::Cancelled) => return Err(WatcherError::Cancelled),
                Err(e) => {
                    // A listing cannot resume mid-way; the range is retried as a whole.
                    ctx.block_skipped(from, &e, &mut report);
                    return Ok(report);
                }
            };

            highest = highest.max(page.highest_block);
            ctx.write_candidates(page.candidates, &mut report).await;

            match page.next_page_token {
                Some(next) if seen_tokens.insert(next.clone()) => page_token = Some(next),
                Some(next) => {
                    tracing::warn!(
                        target: "watcher::scan",
                        chain = %ctx.chain,
                        token = %next,
                        "Activity listing repeated a page token, ending the listing"
                    );
                    break;
                }
                None => break,
            }
        }

        let cursor = match highest {
            Some(block) => block,
            None => {
                tracing::debug!(
                    target: "watcher::scan",
                    chain = %ctx.chain,
                    from,
                    to,
                    "Empty activity listing, advancing to range end"
                );
                to
            }
        };

        if options.persist {
            ctx.commit_cursor(cursor).await;
        }
        report.blocks_processed = cursor.saturating_sub(from) + 1;
        report.last_block = Some(cursor);
        report.complete = cursor >= to;
        Ok(report)
    }
}
