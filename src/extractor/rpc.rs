//! Rate-limited HTTP client for chain endpoints.
//!
//! Speaks JSON-RPC 2.0 (EVM, Ankr, Solana) and plain REST (Aptos, Terra).
//! Every request waits on the endpoint's [`RateLimiter`] first, and every
//! failure is classified into a [`FetchError`].

use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use url::Url;

use super::FetchError;
use crate::watcher::RateLimiter;

/// JSON-RPC code some providers use for "limit exceeded".
const RPC_LIMIT_EXCEEDED: i64 = -32005;

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    params: Value,
    id: u64,
}

/// JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
}

fn shared_http_client() -> reqwest::Client {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
    CLIENT
        .get_or_init(|| {
            reqwest::Client::builder()
                .pool_max_idle_per_host(16)
                .tcp_keepalive(Some(Duration::from_secs(30)))
                .connect_timeout(Duration::from_secs(5))
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new())
        })
        .clone()
}

/// Message texts that mean "slow down" even without a 429.
pub fn is_rate_limit_message(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("rate limit")
        || message.contains("rate-limit")
        || message.contains("too many requests")
}

/// Classify a JSON-RPC error object.
pub fn classify_rpc_error(error: &RpcErrorObject) -> FetchError {
    if error.code == RPC_LIMIT_EXCEEDED || is_rate_limit_message(&error.message) {
        FetchError::Throttled(format!("{}: {}", error.code, error.message))
    } else {
        FetchError::Remote(format!("rpc error {}: {}", error.code, error.message))
    }
}

/// Classify an HTTP status with its body.
pub fn classify_http_status(status: reqwest::StatusCode, body: &str) -> FetchError {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS || is_rate_limit_message(body) {
        FetchError::Throttled(format!("HTTP {status}"))
    } else {
        let snippet: String = body.chars().take(200).collect();
        FetchError::Remote(format!("HTTP {status}: {snippet}"))
    }
}

fn parse_rpc_error(value: &Value) -> Option<RpcErrorObject> {
    let error = value.get("error").filter(|e| !e.is_null())?;
    Some(RpcErrorObject {
        code: error.get("code").and_then(Value::as_i64).unwrap_or_default(),
        message: error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    })
}

/// HTTP client bound to one endpoint and its rate limiter.
#[derive(Debug, Clone)]
pub struct RpcClient {
    http_client: reqwest::Client,
    base_url: Url,
    limiter: Arc<RateLimiter>,
    request_id: Arc<AtomicU64>,
}

impl RpcClient {
    pub fn new(base_url: Url, limiter: Arc<RateLimiter>) -> Self {
        Self {
            http_client: shared_http_client(),
            base_url,
            limiter,
            request_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// JSON-RPC call returning `result`.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, FetchError> {
        match self.call_inner(method, params).await? {
            Ok(result) => Ok(result),
            Err(error) => Err(classify_rpc_error(&error)),
        }
    }

    /// JSON-RPC call where some error codes mean "nothing here" (`Ok(None)`).
    pub async fn call_allowing(
        &self,
        method: &str,
        params: Value,
        empty_codes: &[i64],
    ) -> Result<Option<Value>, FetchError> {
        match self.call_inner(method, params).await? {
            Ok(result) => Ok(Some(result)),
            Err(error) if empty_codes.contains(&error.code) => {
                tracing::debug!(
                    target: "watcher::rpc",
                    method,
                    code = error.code,
                    "Empty answer: {}",
                    error.message
                );
                Ok(None)
            }
            Err(error) => Err(classify_rpc_error(&error)),
        }
    }

    async fn call_inner(
        &self,
        method: &str,
        params: Value,
    ) -> Result<Result<Value, RpcErrorObject>, FetchError> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            method,
            params,
            id: self.request_id.fetch_add(1, Ordering::Relaxed),
        };

        self.limiter.take().await;

        let response = self
            .http_client
            .post(self.base_url.clone())
            .json(&request)
            .send()
            .await
            .map_err(|e| FetchError::Remote(format!("{method}: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| FetchError::Remote(format!("{method}: {e}")))?;

        // Some providers return a JSON-RPC error body with a 4xx/5xx status.
        let value: Value = match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(_) if !status.is_success() => return Err(classify_http_status(status, &body)),
            Err(e) => return Err(FetchError::Decode(format!("{method}: {e}"))),
        };

        if let Some(error) = parse_rpc_error(&value) {
            return Ok(Err(error));
        }
        if !status.is_success() {
            return Err(classify_http_status(status, &body));
        }

        Ok(Ok(value.get("result").cloned().unwrap_or(Value::Null)))
    }

    /// REST `GET` relative to the base URL.
    pub async fn get_json(&self, path: &str, query: &[(&str, String)]) -> Result<Value, FetchError> {
        let mut url = with_trailing_slash(self.base_url.clone())
            .join(path)
            .map_err(|e| FetchError::Decode(format!("bad path {path}: {e}")))?;
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }

        self.limiter.take().await;

        let response = self
            .http_client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| FetchError::Remote(format!("GET {url}: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| FetchError::Remote(format!("GET {url}: {e}")))?;

        if !status.is_success() {
            return Err(classify_http_status(status, &body));
        }

        serde_json::from_str(&body).map_err(|e| FetchError::Decode(format!("GET {url}: {e}")))
    }
}

/// Join-friendly base URL: `Url::join` drops the last segment unless the
/// path ends with `/`.
pub fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}
