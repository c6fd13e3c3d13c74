//! Admin HTTP endpoints.
//!
//! - `GET /health`
//! - `GET /watchers`: chain, id, family and loop state of every watcher
//! - `POST /backfill`: one-shot replay of a block range for a named chain

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use watcher_common::ChainId;

use crate::processor::Processor;
use crate::watcher::{BackfillRequest, ScanReport, WatcherError, WatcherState};

/// HTTP server state.
#[derive(Clone)]
pub struct HttpState {
    pub version: String,
    pub startup_time: i64,
    pub processor: Arc<Processor>,
}

impl HttpState {
    pub fn new(processor: Arc<Processor>) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            startup_time: chrono::Utc::now().timestamp(),
            processor,
        }
    }
}

/// Health check response.
#[derive(Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WatcherStatus {
    pub chain: String,
    pub chain_id: ChainId,
    pub family: String,
    pub state: WatcherState,
}

/// `POST /backfill` body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillBody {
    pub blockchain: String,
    pub from_block: u64,
    pub to_block: u64,
    #[serde(default)]
    pub page_size: Option<u64>,
    #[serde(default)]
    pub persist: bool,
}

#[derive(Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

struct ApiError(WatcherError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            WatcherError::UnknownChain(_) => StatusCode::NOT_FOUND,
            WatcherError::InvalidRange(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorResponse {
            error: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Health check endpoint.
async fn health_handler(State(state): State<Arc<HttpState>>) -> Json<HealthResponse> {
    let now = chrono::Utc::now().timestamp();
    let uptime = now - state.startup_time;

    Json(HealthResponse {
        status: "healthy".to_string(),
        version: state.version.clone(),
        uptime_seconds: uptime,
    })
}

async fn watchers_handler(State(state): State<Arc<HttpState>>) -> Json<Vec<WatcherStatus>> {
    let watchers = state
        .processor
        .watchers()
        .iter()
        .map(|w| WatcherStatus {
            chain: w.chain().to_string(),
            chain_id: w.chain_id(),
            family: w.family().to_string(),
            state: w.state(),
        })
        .collect();
    Json(watchers)
}

async fn backfill_handler(
    State(state): State<Arc<HttpState>>,
    Json(body): Json<BackfillBody>,
) -> Result<Json<ScanReport>, ApiError> {
    let request = BackfillRequest {
        from: body.from_block,
        to: body.to_block,
        page_size: body.page_size,
        persist: body.persist,
    };
    tracing::info!(
        target: "watcher::http",
        chain = %body.blockchain,
        from = request.from,
        to = request.to,
        "Backfill requested"
    );

    state
        .processor
        .backfill(&body.blockchain, request)
        .await
        .map(Json)
        .map_err(|e| {
            tracing::warn!(target: "watcher::http", chain = %body.blockchain, error = %e, "Backfill failed");
            ApiError(e)
        })
}

/// Create the admin router.
pub fn create_http_router(processor: Arc<Processor>) -> Router {
    let state = Arc::new(HttpState::new(processor));

    Router::new()
        .route("/health", get(health_handler))
        .route("/watchers", get(watchers_handler))
        .route("/backfill", post(backfill_handler))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::{BlockExtractor, FetchError, RedemptionCandidate};
    use crate::store::MemoryStore;
    use crate::watcher::{BlockScanner, ChainWatcher, RetryPolicy, Watcher, WatcherSettings};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    struct EmptyChain;

    #[async_trait]
    impl BlockExtractor for EmptyChain {
        type Block = ();

        fn family(&self) -> &'static str {
            "evm"
        }

        async fn latest_block(&self) -> Result<u64, FetchError> {
            Ok(0)
        }

        async fn get_block(&self, _number: u64) -> Result<Option<()>, FetchError> {
            Ok(Some(()))
        }

        async fn extract_candidates(&self, _block: &()) -> Result<Vec<RedemptionCandidate>, FetchError> {
            Ok(Vec::new())
        }
    }

    fn router() -> (Router, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let watcher: Arc<dyn ChainWatcher> = Arc::new(Watcher::new(
            WatcherSettings {
                chain: "ethereum".to_string(),
                chain_id: ChainId::ETHEREUM,
                size_blocks: 10,
                wait: Duration::from_secs(5),
                initial_block: 0,
                retry: RetryPolicy::no_retry(),
            },
            BlockScanner::new(EmptyChain),
            store.clone(),
            store.clone(),
        ));
        (create_http_router(Arc::new(Processor::new(vec![watcher]))), store)
    }

    fn backfill(body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/backfill")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body<T: serde::de::DeserializeOwned>(response: Response) -> T {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (app, _) = router();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);

        let health_response: HealthResponse = json_body(response).await;

        assert_eq!(health_response.status, "healthy");
        assert!(health_response.uptime_seconds >= 0);
    }

    #[tokio::test]
    async fn test_watchers_endpoint() {
        let (app, _) = router();

        let response = app
            .oneshot(Request::builder().uri("/watchers").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let watchers: Vec<WatcherStatus> = json_body(response).await;
        assert_eq!(watchers.len(), 1);
        assert_eq!(watchers[0].chain, "ethereum");
        assert_eq!(watchers[0].chain_id, ChainId::ETHEREUM);
        assert_eq!(watchers[0].state, WatcherState::Idle);
    }

    #[tokio::test]
    async fn test_backfill_endpoint() {
        let (app, store) = router();

        let response = app
            .oneshot(backfill(serde_json::json!({
                "blockchain": "ethereum",
                "fromBlock": 10,
                "toBlock": 12,
                "persist": true
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let report: serde_json::Value = json_body(response).await;
        assert_eq!(report["blocks_processed"], 3);
        assert_eq!(report["complete"], true);
        assert_eq!(store.cursor("ethereum").await.unwrap().block, 12);
    }

    #[tokio::test]
    async fn test_backfill_errors() {
        let (app, _) = router();

        let response = app
            .clone()
            .oneshot(backfill(serde_json::json!({"blockchain": "near", "fromBlock": 1, "toBlock": 2})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let error: ErrorResponse = json_body(response).await;
        assert!(error.error.contains("near"));

        let response = app
            .oneshot(backfill(serde_json::json!({"blockchain": "ethereum", "fromBlock": 5, "toBlock": 2})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
