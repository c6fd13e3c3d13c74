//! Processor: builds, starts and stops the configured watchers.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::{SourceParams, WatcherParams};
use crate::extractor::{AnkrExtractor, AptosExtractor, EvmExtractor, RpcClient, SolanaExtractor, TerraExtractor};
use crate::store::{CursorStore, RecordStore};
use crate::watcher::{
    ActivityScanner, BackfillRequest, BlockScanner, ChainWatcher, RateLimiter, ScanReport, Watcher, WatcherError,
    WatcherHandle,
};

/// Build the watcher for `params`. This is the only place that dispatches on
/// the chain family.
pub fn build_watcher(
    params: &WatcherParams,
    cursors: Arc<dyn CursorStore>,
    records: Arc<dyn RecordStore>,
) -> Arc<dyn ChainWatcher> {
    let limiter = Arc::new(RateLimiter::new(params.rate_limit));
    let client = RpcClient::new(params.url.clone(), limiter.clone());
    let settings = params.settings();
    let chain_id = params.chain_id;

    tracing::debug!(
        target: "watcher::processor",
        chain = %params.chain,
        family = params.source.family(),
        url = %params.url,
        rate_limit = params.rate_limit,
        "Building watcher"
    );

    match &params.source {
        SourceParams::Evm { methods } => Arc::new(Watcher::new(
            settings,
            BlockScanner::new(EvmExtractor::new(chain_id, client, methods.clone())),
            cursors,
            records,
        )),
        SourceParams::Ankr { blockchain, methods } => Arc::new(Watcher::new(
            settings,
            ActivityScanner::new(
                AnkrExtractor::new(chain_id, blockchain.clone(), client, methods.clone())
                    .with_page_size(params.size_blocks),
            ),
            cursors,
            records,
        )),
        SourceParams::Solana {
            token_bridge,
            core_bridge,
        } => Arc::new(Watcher::new(
            settings,
            BlockScanner::new(SolanaExtractor::new(
                chain_id,
                client,
                token_bridge.clone(),
                core_bridge.clone(),
            )),
            cursors,
            records,
        )),
        SourceParams::Aptos { module } => Arc::new(Watcher::new(
            settings,
            BlockScanner::new(AptosExtractor::new(chain_id, client, module.clone())),
            cursors,
            records,
        )),
        SourceParams::Terra {
            fcd_url,
            contract,
            methods,
        } => {
            // LCD and FCD share the chain's request budget.
            let fcd = RpcClient::new(fcd_url.clone(), limiter);
            Arc::new(Watcher::new(
                settings,
                BlockScanner::new(TerraExtractor::new(
                    chain_id,
                    client,
                    fcd,
                    contract.clone(),
                    methods.clone(),
                )),
                cursors,
                records,
            ))
        }
    }
}

/// Owns one watcher per configured chain.
pub struct Processor {
    watchers: Vec<Arc<dyn ChainWatcher>>,
    handles: Mutex<Vec<WatcherHandle>>,
    cancel: CancellationToken,
}

impl Processor {
    pub fn new(watchers: Vec<Arc<dyn ChainWatcher>>) -> Self {
        Self {
            watchers,
            handles: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Build a processor for `params`, all watchers sharing the given stores.
    pub fn from_params(
        params: &[WatcherParams],
        cursors: Arc<dyn CursorStore>,
        records: Arc<dyn RecordStore>,
    ) -> Self {
        Self::new(
            params
                .iter()
                .map(|p| build_watcher(p, cursors.clone(), records.clone()))
                .collect(),
        )
    }

    pub fn watchers(&self) -> &[Arc<dyn ChainWatcher>] {
        &self.watchers
    }

    pub fn watcher(&self, chain: &str) -> Option<&Arc<dyn ChainWatcher>> {
        self.watchers.iter().find(|w| w.chain() == chain)
    }

    /// Token cancelled by [`Self::close`]; backfills started through the
    /// processor stop with it.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Spawn every watcher's live loop. Calling it twice is a no-op.
    pub async fn start(&self) {
        let mut handles = self.handles.lock().await;
        if !handles.is_empty() {
            return;
        }
        for watcher in &self.watchers {
            tracing::info!(
                target: "watcher::processor",
                chain = %watcher.chain(),
                family = watcher.family(),
                "Starting watcher"
            );
            handles.push(WatcherHandle::spawn(watcher.clone(), self.cancel.child_token()));
        }
    }

    /// Stop every watcher and wait for them to exit.
    pub async fn close(&self) {
        self.cancel.cancel();
        let handles = std::mem::take(&mut *self.handles.lock().await);
        let results = futures::future::join_all(handles.into_iter().map(|handle| async move {
            let chain = handle.watcher().chain().to_string();
            (chain, handle.close().await)
        }))
        .await;
        for (chain, result) in results {
            if let Err(e) = result {
                // Already logged by the watcher when it exited.
                tracing::debug!(target: "watcher::processor", chain = %chain, error = %e, "Watcher exited with error");
            }
        }
        tracing::info!(target: "watcher::processor", "All watchers stopped");
    }

    /// Backfill one chain by name.
    pub async fn backfill(&self, chain: &str, request: BackfillRequest) -> Result<ScanReport, WatcherError> {
        let watcher = self
            .watcher(chain)
            .ok_or_else(|| WatcherError::UnknownChain(chain.to_string()))?;
        watcher.backfill(request, self.cancel.child_token()).await
    }
}
