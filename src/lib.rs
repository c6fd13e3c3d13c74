//! Blockchain watcher.
//!
//! Watches many chains for redemptions of cross-chain messages (VAAs) and keeps
//! one reconciled record per message. Each configured chain gets its own
//! [`watcher::Watcher`]: a resumable polling loop over a chain-specific
//! [`extractor`], writing through the [`store`] reconciler.

pub mod config;
pub mod extractor;
pub mod http;
pub mod processor;
pub mod store;
pub mod watcher;

pub use async_trait::async_trait;
pub use watcher_common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any as CorsAny, CorsLayer};
use tower_http::trace::TraceLayer;

use config::WatcherParams;
use http::create_http_router;
use processor::Processor;
use store::{CursorStore, RecordStore};

/// Process configuration for [`run`].
pub struct WatcherConfig {
    /// Port for the admin HTTP server.
    pub port: u16,

    /// Host to bind the admin HTTP server to.
    pub host: String,

    /// One entry per watched chain.
    pub watchers: Vec<WatcherParams>,

    pub cursors: Arc<dyn CursorStore>,

    pub records: Arc<dyn RecordStore>,

    /// Graceful shutdown timeout in seconds (default: 30).
    ///
    /// When a shutdown signal is received, watchers get up to this long to
    /// finish the block they are on.
    pub shutdown_timeout: u64,
}

impl WatcherConfig {
    pub fn builder() -> WatcherConfigBuilder {
        WatcherConfigBuilder::default()
    }
}

/// Builder for WatcherConfig.
#[derive(Default)]
pub struct WatcherConfigBuilder {
    port: Option<u16>,
    host: Option<String>,
    watchers: Vec<WatcherParams>,
    store: Option<(Arc<dyn CursorStore>, Arc<dyn RecordStore>)>,
    shutdown_timeout: Option<u64>,
}

impl WatcherConfigBuilder {
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn host(mut self, host: String) -> Self {
        self.host = Some(host);
        self
    }

    pub fn add_watcher(mut self, params: WatcherParams) -> Self {
        self.watchers.push(params);
        self
    }

    pub fn with_watchers(mut self, watchers: Vec<WatcherParams>) -> Self {
        self.watchers.extend(watchers);
        self
    }

    /// Cursor and record stores. Defaults to an in-memory store.
    pub fn with_stores(mut self, cursors: Arc<dyn CursorStore>, records: Arc<dyn RecordStore>) -> Self {
        self.store = Some((cursors, records));
        self
    }

    /// Sets the graceful shutdown timeout in seconds.
    pub fn shutdown_timeout(mut self, seconds: u64) -> Self {
        self.shutdown_timeout = Some(seconds);
        self
    }

    pub fn build(self) -> WatcherConfig {
        let (cursors, records) = self.store.unwrap_or_else(|| {
            let memory = Arc::new(store::MemoryStore::new());
            (memory.clone() as Arc<dyn CursorStore>, memory as Arc<dyn RecordStore>)
        });
        WatcherConfig {
            port: self.port.unwrap_or(8080),
            host: self.host.unwrap_or_else(|| "0.0.0.0".to_string()),
            watchers: self.watchers,
            cursors,
            records,
            shutdown_timeout: self.shutdown_timeout.unwrap_or(30),
        }
    }
}

/// Runs every configured watcher and the admin HTTP server until SIGINT or
/// SIGTERM.
///
/// NOTE: The caller is responsible for initializing the tracing subscriber before calling this function.
pub async fn run(config: WatcherConfig) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(target: "watcher::main", "Starting blockchain watcher with {} chain(s)", config.watchers.len());

    let processor = Arc::new(Processor::from_params(&config.watchers, config.cursors, config.records));
    processor.start().await;

    let cors = CorsLayer::new()
        .allow_origin(CorsAny)
        .allow_methods(CorsAny)
        .allow_headers(CorsAny);

    let app = create_http_router(processor.clone())
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    tracing::info!(target: "watcher::main", "Admin server listening on {}", addr);

    // Setup signal handlers for graceful shutdown
    let shutdown_token = CancellationToken::new();
    let server_shutdown_token = shutdown_token.clone();
    let shutdown_timeout = config.shutdown_timeout;

    let shutdown_signal = async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(target: "watcher::main", "Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::error!(target: "watcher::main", "Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            () = ctrl_c => {
                tracing::info!(target: "watcher::main", "Received SIGINT (Ctrl+C), initiating graceful shutdown...");
            }
            () = terminate => {
                tracing::info!(target: "watcher::main", "Received SIGTERM, initiating graceful shutdown...");
            }
        }

        server_shutdown_token.cancel();
    };

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal);

    // Give active connections 15 seconds to close gracefully, then force shutdown.
    const SERVER_SHUTDOWN_TIMEOUT_SECS: u64 = 15;
    tokio::select! {
        result = server => {
            if let Err(e) = result {
                tracing::error!(target: "watcher::main", "Server error: {}", e);
            }
        }
        () = async {
            shutdown_token.cancelled().await;
            tokio::time::sleep(Duration::from_secs(SERVER_SHUTDOWN_TIMEOUT_SECS)).await;
        } => {
            tracing::warn!(
                target: "watcher::main",
                "Server connections did not close within {}s, forcing shutdown",
                SERVER_SHUTDOWN_TIMEOUT_SECS
            );
        }
    }

    tracing::info!(target: "watcher::main", "Admin server stopped, waiting for watchers to finish...");

    if tokio::time::timeout(Duration::from_secs(shutdown_timeout), processor.close())
        .await
        .is_err()
    {
        tracing::warn!(
            target: "watcher::main",
            "Watchers did not stop within {}s timeout, forcing shutdown",
            shutdown_timeout
        );
    }

    tracing::info!(target: "watcher::main", "Blockchain watcher shutdown complete");

    Ok(())
}
