//! HTTP JSON-RPC 2.0 client for the upstream node.
//!
//! The proxy only ever invokes the five getwork-era methods; everything
//! else the node exposes is none of our business.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{body::Buf, Method, Request, StatusCode};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::metrics::prometheus as metrics;

/// Client-side cap on every upstream request.
const RPC_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: u64,
    pub result: Option<Value>,
    pub error: Option<Value>,
}

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("request timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("http status {0}")]
    Status(StatusCode),
    #[error("malformed response: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("node error: {0}")]
    Node(Value),
    #[error("unexpected result: {0}")]
    Unexpected(Value),
}

pub struct NodeRpc {
    url: String,
    timeout: Duration,
    next_id: AtomicU64,
    client: Client<HttpConnector, Full<Bytes>>,
}

impl NodeRpc {
    pub fn new(url: String) -> Self {
        let client = Client::builder(hyper_util::rt::TokioExecutor::new()).build_http();

        tracing::info!("node RPC client initialized: {}", url);

        Self {
            url,
            timeout: RPC_TIMEOUT,
            next_id: AtomicU64::new(0),
            client,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Make one RPC call to the node.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        metrics::inc_rpc_requests();

        let res = self.call_inner(method, params).await;
        if res.is_err() {
            metrics::inc_rpc_errors();
        }
        res
    }

    async fn call_inner(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let payload = RpcRequest {
            jsonrpc: "2.0".to_string(),
            id: self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
            method: method.to_string(),
            params,
        };

        let body_bytes = serde_json::to_vec(&payload)?;
        let req = Request::builder()
            .method(Method::POST)
            .uri(&self.url)
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(body_bytes)))
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        let response = tokio::time::timeout(self.timeout, self.client.request(req))
            .await
            .map_err(|_| RpcError::Timeout)?
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RpcError::Status(status));
        }

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?
            .to_bytes();
        let rpc_response: RpcResponse = serde_json::from_reader(body.reader())?;

        // An error member must never be misread as a null result.
        if let Some(error) = rpc_response.error {
            if !error.is_null() {
                return Err(RpcError::Node(error));
            }
        }

        Ok(rpc_response.result.unwrap_or(Value::Null))
    }

    /// Current `[headerHash, seedHash, boundary]`, or `None` when the node
    /// reports no work. Transport and RPC failures propagate; the poll
    /// loop owns the (dampened) logging for those.
    pub async fn get_work(&self) -> Result<Option<[String; 3]>, RpcError> {
        let result = self.call("eth_getWork", json!([])).await?;
        let Some(parts) = result.as_array() else {
            return Ok(None);
        };
        if parts.len() < 3 {
            return Ok(None);
        }

        let mut triple: [String; 3] = Default::default();
        for (slot, part) in triple.iter_mut().zip(parts) {
            *slot = part.as_str().unwrap_or_default().to_string();
        }
        Ok(Some(triple))
    }

    /// Forward a solution. Absent fields are sent as JSON null; the node
    /// is the authority on rejecting those.
    pub async fn submit_work(
        &self,
        nonce: &str,
        header_hash: Option<&str>,
        mix_digest: Option<&str>,
    ) -> Result<bool, RpcError> {
        let result = self
            .call("eth_submitWork", json!([nonce, header_hash, mix_digest]))
            .await?;
        Ok(result.as_bool().unwrap_or(false))
    }

    pub async fn submit_hashrate(
        &self,
        rate_hex: &str,
        client_id: &str,
    ) -> Result<bool, RpcError> {
        let result = self
            .call("eth_submitHashrate", json!([rate_hex, client_id]))
            .await?;
        Ok(result.as_bool().unwrap_or(false))
    }

    pub async fn block_number(&self) -> Result<u64, RpcError> {
        let result = self.call("eth_blockNumber", json!([])).await?;
        parse_quantity(&result).ok_or_else(|| RpcError::Unexpected(result.clone()))
    }

    pub async fn mining_active(&self) -> Result<bool, RpcError> {
        let result = self.call("eth_mining", json!([])).await?;
        Ok(result.as_bool().unwrap_or(false))
    }
}

/// Decode a JSON-RPC quantity: a `0x`-prefixed hex string or a bare number.
pub(crate) fn parse_quantity(value: &Value) -> Option<u64> {
    if let Some(n) = value.as_u64() {
        return Some(n);
    }
    let digits = value.as_str()?.trim().trim_start_matches("0x");
    u64::from_str_radix(digits, 16).ok()
}
