//! Local JSON-RPC endpoint for extractor tests.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use url::Url;

use super::RpcClient;
use crate::watcher::RateLimiter;

type Responder = Arc<dyn Fn(&str, &Value) -> (StatusCode, Value) + Send + Sync>;

/// Client for an endpoint on an ephemeral port that answers each request with
/// `respond(method, params)`.
pub async fn rpc_client<F>(respond: F) -> RpcClient
where
    F: Fn(&str, &Value) -> (StatusCode, Value) + Send + Sync + 'static,
{
    let responder: Responder = Arc::new(respond);
    let app = Router::new().route("/", post(handle)).with_state(responder);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let url = Url::parse(&format!("http://{addr}/")).unwrap();
    RpcClient::new(url, Arc::new(RateLimiter::unlimited()))
}

async fn handle(State(respond): State<Responder>, Json(request): Json<Value>) -> (StatusCode, Json<Value>) {
    let method = request["method"].as_str().unwrap_or_default().to_string();
    let (status, body) = respond(&method, &request["params"]);
    (status, Json(body))
}

pub fn result(value: Value) -> (StatusCode, Value) {
    (StatusCode::OK, json!({"jsonrpc": "2.0", "id": 1, "result": value}))
}

pub fn rpc_error(code: i64, message: &str) -> (StatusCode, Value) {
    (
        StatusCode::OK,
        json!({"jsonrpc": "2.0", "id": 1, "error": {"code": code, "message": message}}),
    )
}

pub fn too_many_requests() -> (StatusCode, Value) {
    (StatusCode::TOO_MANY_REQUESTS, json!("Too Many Requests"))
}
