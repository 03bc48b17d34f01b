/// Daemon JSON-RPC client
///
/// Thin hyper-based transport against the daemon's restricted HTTP endpoint.
/// Retry policy belongs to the callers: the bootstrap state machine retries
/// every second, steady-state paths drop and log, submits never retry.

use anyhow::anyhow;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

use crate::metrics;

#[derive(Debug, Clone, Serialize)]
pub struct RpcRequest {
    pub jsonrpc: &'static str,
    pub id: &'static str,
    pub method: String,
    pub params: Value,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RpcResponse {
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
}

/// Transport failures and unparseable replies carry different log severities
/// on the submit path, so the client keeps them apart.
#[derive(Debug)]
pub enum RpcFailure {
    Transport(String),
    Parse(String),
}

impl fmt::Display for RpcFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcFailure::Transport(e) => write!(f, "RPC transport error: {}", e),
            RpcFailure::Parse(e) => write!(f, "invalid JSON response from daemon: {}", e),
        }
    }
}

impl std::error::Error for RpcFailure {}

#[derive(Clone)]
pub struct DaemonRpc {
    base_url: String,
    timeout: Duration,
    client: Client<HttpConnector, Full<Bytes>>,
}

impl DaemonRpc {
    pub fn new(host: &str, port: u16, timeout: Duration) -> Self {
        // bracket bare IPv6 addresses for the URL
        let base_url = if host.contains(':') && !host.starts_with('[') {
            format!("http://[{}]:{}/json_rpc", host, port)
        } else {
            format!("http://{}:{}/json_rpc", host, port)
        };

        let client = Client::builder(hyper_util::rt::TokioExecutor::new()).build_http();

        tracing::info!("daemon RPC endpoint: {}", base_url);

        Self {
            base_url,
            timeout,
            client,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// One JSON-RPC round trip, returning the whole response envelope.
    pub async fn call_response(
        &self,
        method: &str,
        params: Value,
    ) -> Result<RpcResponse, RpcFailure> {
        metrics::inc_rpc_requests();

        let payload = RpcRequest {
            jsonrpc: "2.0",
            id: "0",
            method: method.to_string(),
            params,
        };

        let res = self.round_trip(&payload).await;
        if res.is_err() {
            metrics::inc_rpc_errors();
        }
        res
    }

    /// One JSON-RPC round trip, unwrapping `result`. A JSON-RPC level error
    /// object becomes a transport-class failure, which suits the bootstrap
    /// and backfill callers that treat every failure the same way.
    pub async fn call(&self, method: &str, params: Value) -> anyhow::Result<Value> {
        let resp = self.call_response(method, params).await?;
        if let Some(error) = resp.error {
            return Err(anyhow!("daemon returned error: {}", error));
        }
        resp.result
            .ok_or_else(|| anyhow!("daemon response has no \"result\" field"))
    }

    async fn round_trip(&self, payload: &RpcRequest) -> Result<RpcResponse, RpcFailure> {
        let body = serde_json::to_vec(payload)
            .map_err(|e| RpcFailure::Parse(e.to_string()))?;

        let req = Request::builder()
            .method(Method::POST)
            .uri(&self.base_url)
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| RpcFailure::Transport(e.to_string()))?;

        let response = tokio::time::timeout(self.timeout, self.client.request(req))
            .await
            .map_err(|_| RpcFailure::Transport("request timed out".to_string()))?
            .map_err(|e| RpcFailure::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RpcFailure::Transport(format!("HTTP status {}", status)));
        }

        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| RpcFailure::Transport(e.to_string()))?
            .to_bytes();

        serde_json::from_slice(&bytes).map_err(|e| RpcFailure::Parse(e.to_string()))
    }
}
