//! Per-chain watchers.
//!
//! A [`Watcher`] owns one chain: it loads the cursor, polls the remote head,
//! scans `[cursor, head]` page by page and sleeps when caught up. The same
//! scan logic serves one-shot backfills over an explicit range.
//!
//! ```text
//! Idle -> Polling <-> Waiting -> Closed
//! ```

pub mod pagination;
pub mod rate_limit;
pub mod retry;
pub mod scanner;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use watcher_common::ChainId;

use crate::config::ConfigError;
use crate::extractor::FetchError;
use crate::store::{CursorStore, RecordStore};

pub use pagination::{page, pages, total_pages, BlockRange};
pub use rate_limit::RateLimiter;
pub use retry::{RetryAction, RetryPolicy};
pub use scanner::{ActivityScanner, BlockScanner, ScanContext, ScanOptions, ScanReport, Scanner};

/// Lifecycle of a watcher loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatcherState {
    Idle,
    Polling,
    Waiting,
    Closed,
}

impl std::fmt::Display for WatcherState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WatcherState::Idle => "idle",
            WatcherState::Polling => "polling",
            WatcherState::Waiting => "waiting",
            WatcherState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum WatcherError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to read cursor: {0:#}")]
    Cursor(anyhow::Error),
    #[error("store error: {0:#}")]
    Store(anyhow::Error),
    #[error("cancelled")]
    Cancelled,
    #[error("unknown chain: {0}")]
    UnknownChain(String),
    #[error("invalid range: {0}")]
    InvalidRange(String),
    #[error("watcher task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Static settings of one watcher.
#[derive(Debug, Clone)]
pub struct WatcherSettings {
    pub chain: String,
    pub chain_id: ChainId,
    /// Page size of the live loop.
    pub size_blocks: u64,
    pub wait: Duration,
    /// Starting block when no cursor was persisted.
    pub initial_block: u64,
    pub retry: RetryPolicy,
}

/// One-shot scan over an explicit range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackfillRequest {
    pub from: u64,
    pub to: u64,
    /// Defaults to the watcher's `size_blocks`.
    pub page_size: Option<u64>,
    /// Write the cursor after each page.
    pub persist: bool,
}

impl BackfillRequest {
    pub fn new(from: u64, to: u64) -> Self {
        Self {
            from,
            to,
            page_size: None,
            persist: false,
        }
    }

    pub fn validate(&self) -> Result<(), WatcherError> {
        if self.from > self.to {
            return Err(WatcherError::InvalidRange(format!(
                "fromBlock {} is after toBlock {}",
                self.from, self.to
            )));
        }
        if self.page_size == Some(0) {
            return Err(WatcherError::InvalidRange("pageSize must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Object-safe view of a watcher, used by the processor and the admin router.
#[async_trait]
pub trait ChainWatcher: Send + Sync {
    fn chain(&self) -> &str;

    fn chain_id(&self) -> ChainId;

    fn family(&self) -> &'static str;

    fn state(&self) -> WatcherState;

    fn subscribe(&self) -> watch::Receiver<WatcherState>;

    /// Run the live loop until `cancel` fires.
    async fn run(&self, cancel: CancellationToken) -> Result<(), WatcherError>;

    async fn backfill(&self, request: BackfillRequest, cancel: CancellationToken) -> Result<ScanReport, WatcherError>;
}

/// Polling loop for one chain, generic over its [`Scanner`].
pub struct Watcher<S> {
    settings: WatcherSettings,
    scanner: S,
    cursors: Arc<dyn CursorStore>,
    records: Arc<dyn RecordStore>,
    state: watch::Sender<WatcherState>,
}

impl<S: Scanner> Watcher<S> {
    pub fn new(
        settings: WatcherSettings,
        scanner: S,
        cursors: Arc<dyn CursorStore>,
        records: Arc<dyn RecordStore>,
    ) -> Self {
        let (state, _) = watch::channel(WatcherState::Idle);
        Self {
            settings,
            scanner,
            cursors,
            records,
            state,
        }
    }

    pub fn settings(&self) -> &WatcherSettings {
        &self.settings
    }

    fn context(&self, cancel: CancellationToken) -> ScanContext {
        ScanContext {
            chain: self.settings.chain.clone(),
            chain_id: self.settings.chain_id,
            cursors: self.cursors.clone(),
            records: self.records.clone(),
            retry: self.settings.retry.clone(),
            cancel,
        }
    }

    fn set_state(&self, state: WatcherState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            tracing::debug!(
                target: "watcher::loop",
                chain = %self.settings.chain,
                from = %current,
                to = %state,
                "State change"
            );
            *current = state;
            true
        });
    }

    async fn remote_head(&self, cancel: &CancellationToken) -> Result<Option<u64>, WatcherError> {
        match self.settings.retry.execute(cancel, || self.scanner.latest_block()).await {
            Ok(head) => Ok(Some(head)),
            Err(FetchError::Cancelled) => Err(WatcherError::Cancelled),
            Err(e) => {
                tracing::warn!(
                    target: "watcher::loop",
                    chain = %self.settings.chain,
                    error = %e,
                    "Failed to fetch latest block"
                );
                Ok(None)
            }
        }
    }

    /// Sleep for the poll interval. Returns `false` when cancelled.
    async fn wait(&self, cancel: &CancellationToken) -> bool {
        self.set_state(WatcherState::Waiting);
        tokio::select! {
            () = cancel.cancelled() => false,
            () = tokio::time::sleep(self.settings.wait) => true,
        }
    }

    async fn poll(&self, cancel: &CancellationToken) -> Result<(), WatcherError> {
        let chain = &self.settings.chain;
        let mut local = self
            .cursors
            .current_block(chain, self.settings.initial_block)
            .await
            .map_err(WatcherError::Cursor)?;

        tracing::info!(
            target: "watcher::loop",
            chain = %chain,
            family = self.scanner.family(),
            block = local,
            "Starting watcher"
        );

        let ctx = self.context(cancel.clone());
        let options = ScanOptions {
            page_size: self.settings.size_blocks,
            persist: true,
            stop_at_failure: true,
        };

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            self.set_state(WatcherState::Polling);

            let caught_up = match self.remote_head(cancel).await? {
                Some(remote) if local < remote => {
                    tracing::debug!(target: "watcher::loop", chain = %chain, local, remote, "Scanning");
                    let report = self.scanner.scan_range(&ctx, local, remote, options).await?;
                    if let Some(last) = report.last_block {
                        local = local.max(last);
                    }
                    tracing::info!(
                        target: "watcher::loop",
                        chain = %chain,
                        cursor = local,
                        processed = report.blocks_processed,
                        skipped = report.blocks_skipped,
                        written = report.records_written,
                        rejected = report.records_rejected,
                        "Scan complete"
                    );
                    // An incomplete scan is retried after the poll interval.
                    !report.complete
                }
                _ => true,
            };

            if caught_up && !self.wait(cancel).await {
                return Ok(());
            }
        }
    }
}

#[async_trait]
impl<S: Scanner> ChainWatcher for Watcher<S> {
    fn chain(&self) -> &str {
        &self.settings.chain
    }

    fn chain_id(&self) -> ChainId {
        self.settings.chain_id
    }

    fn family(&self) -> &'static str {
        self.scanner.family()
    }

    fn state(&self) -> WatcherState {
        *self.state.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<WatcherState> {
        self.state.subscribe()
    }

    async fn run(&self, cancel: CancellationToken) -> Result<(), WatcherError> {
        let result = match self.poll(&cancel).await {
            Err(WatcherError::Cancelled) => Ok(()),
            other => other,
        };
        self.set_state(WatcherState::Closed);
        match &result {
            Ok(()) => tracing::info!(target: "watcher::loop", chain = %self.settings.chain, "Watcher stopped"),
            Err(e) => tracing::error!(
                target: "watcher::loop",
                chain = %self.settings.chain,
                error = %e,
                "Watcher failed"
            ),
        }
        result
    }

    async fn backfill(&self, request: BackfillRequest, cancel: CancellationToken) -> Result<ScanReport, WatcherError> {
        request.validate()?;
        let options = ScanOptions {
            page_size: request.page_size.unwrap_or(self.settings.size_blocks),
            persist: request.persist,
            stop_at_failure: false,
        };

        tracing::info!(
            target: "watcher::backfill",
            chain = %self.settings.chain,
            from = request.from,
            to = request.to,
            page_size = options.page_size,
            persist = options.persist,
            "Starting backfill"
        );

        let report = self
            .scanner
            .scan_range(&self.context(cancel), request.from, request.to, options)
            .await?;

        tracing::info!(
            target: "watcher::backfill",
            chain = %self.settings.chain,
            processed = report.blocks_processed,
            skipped = report.blocks_skipped,
            written = report.records_written,
            rejected = report.records_rejected,
            "Backfill complete"
        );
        Ok(report)
    }
}

/// A running watcher task.
pub struct WatcherHandle {
    watcher: Arc<dyn ChainWatcher>,
    cancel: CancellationToken,
    task: JoinHandle<Result<(), WatcherError>>,
}

impl WatcherHandle {
    /// Spawn the live loop of `watcher`, stopped by `cancel` or [`Self::close`].
    pub fn spawn(watcher: Arc<dyn ChainWatcher>, cancel: CancellationToken) -> Self {
        let task = tokio::spawn({
            let watcher = watcher.clone();
            let cancel = cancel.clone();
            async move { watcher.run(cancel).await }
        });
        Self { watcher, cancel, task }
    }

    pub fn watcher(&self) -> &Arc<dyn ChainWatcher> {
        &self.watcher
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signal the loop to stop and wait for it to exit. In-flight block
    /// processing finishes first.
    pub async fn close(self) -> Result<(), WatcherError> {
        self.cancel.cancel();
        self.task.await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::{BlockExtractor, RedemptionCandidate};
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Empty blocks up to a moving head.
    struct EmptyChain {
        head: AtomicU64,
    }

    /// Cursor store whose reads fail.
    struct UnreadableCursors;

    #[async_trait]
    impl CursorStore for UnreadableCursors {
        async fn current_block(&self, _chain: &str, _fallback: u64) -> anyhow::Result<u64> {
            Err(anyhow::anyhow!("database is locked"))
        }

        async fn update_cursor(
            &self,
            _chain: &str,
            _block: u64,
            _updated_at: chrono::DateTime<chrono::Utc>,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    /// Captured fmt output.
    #[derive(Clone, Default)]
    struct LogBuffer(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogBuffer {
        type Writer = Self;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[async_trait]
    impl BlockExtractor for EmptyChain {
        type Block = ();

        fn family(&self) -> &'static str {
            "empty"
        }

        async fn latest_block(&self) -> Result<u64, FetchError> {
            Ok(self.head.load(Ordering::SeqCst))
        }

        async fn get_block(&self, _number: u64) -> Result<Option<()>, FetchError> {
            Ok(Some(()))
        }

        async fn extract_candidates(&self, _block: &()) -> Result<Vec<RedemptionCandidate>, FetchError> {
            Ok(Vec::new())
        }
    }

    fn watcher(store: &Arc<MemoryStore>, head: u64) -> Watcher<BlockScanner<EmptyChain>> {
        Watcher::new(
            WatcherSettings {
                chain: "ethereum".to_string(),
                chain_id: ChainId::ETHEREUM,
                size_blocks: 10,
                wait: Duration::from_secs(30),
                initial_block: 100,
                retry: RetryPolicy::no_retry(),
            },
            BlockScanner::new(EmptyChain {
                head: AtomicU64::new(head),
            }),
            store.clone(),
            store.clone(),
        )
    }

    #[test]
    fn test_backfill_request_validation() {
        assert!(BackfillRequest::new(10, 10).validate().is_ok());
        assert!(matches!(
            BackfillRequest::new(11, 10).validate(),
            Err(WatcherError::InvalidRange(_))
        ));
        let request = BackfillRequest {
            page_size: Some(0),
            ..BackfillRequest::new(1, 2)
        };
        assert!(matches!(request.validate(), Err(WatcherError::InvalidRange(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_catches_up_then_waits() {
        let store = Arc::new(MemoryStore::new());
        let watcher: Arc<dyn ChainWatcher> = Arc::new(watcher(&store, 125));
        let mut states = watcher.subscribe();
        assert_eq!(watcher.state(), WatcherState::Idle);

        let handle = WatcherHandle::spawn(watcher.clone(), CancellationToken::new());
        states.wait_for(|s| *s == WatcherState::Waiting).await.unwrap();

        assert_eq!(store.cursor("ethereum").await.unwrap().block, 125);
        let writes: Vec<u64> = store.cursor_writes().await.into_iter().map(|(_, b)| b).collect();
        assert_eq!(writes, vec![109, 119, 125]);

        handle.close().await.unwrap();
        assert_eq!(watcher.state(), WatcherState::Closed);
    }

    #[tokio::test]
    async fn test_failed_start_is_logged_when_it_happens() {
        let logs = LogBuffer::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let store = Arc::new(MemoryStore::new());
        let watcher = Watcher::new(
            watcher(&store, 0).settings().clone(),
            BlockScanner::new(EmptyChain { head: AtomicU64::new(0) }),
            Arc::new(UnreadableCursors),
            store,
        );

        let result = watcher.run(CancellationToken::new()).await;
        assert!(matches!(result, Err(WatcherError::Cursor(_))));
        assert_eq!(watcher.state(), WatcherState::Closed);

        let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("Watcher failed"), "{output}");
        assert!(output.contains("database is locked"), "{output}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_interrupts_wait() {
        let store = Arc::new(MemoryStore::new());
        // Already caught up: head equals the initial block.
        let watcher: Arc<dyn ChainWatcher> = Arc::new(watcher(&store, 100));
        let mut states = watcher.subscribe();

        let handle = WatcherHandle::spawn(watcher.clone(), CancellationToken::new());
        states.wait_for(|s| *s == WatcherState::Waiting).await.unwrap();

        let start = tokio::time::Instant::now();
        handle.close().await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(30));
        assert!(store.cursor_writes().await.is_empty());
    }

    #[tokio::test]
    async fn test_backfill_does_not_touch_cursor() {
        let store = Arc::new(MemoryStore::new());
        let watcher = watcher(&store, 1_000);

        let report = watcher
            .backfill(BackfillRequest::new(10, 10), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.blocks_processed, 1);
        assert!(report.complete);
        assert!(store.cursor_writes().await.is_empty());
        assert_eq!(watcher.state(), WatcherState::Idle);
    }
}
