use super::ChainError;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    params: Value,
    id: u64,
}

#[derive(Deserialize)]
struct RpcResponse {
    id: Option<u64>,
    #[serde(default)]
    result: Value,
    error: Option<RpcErrorObject>,
}

#[derive(Deserialize, Debug)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

// Plain JSON-RPC 2.0 client over HTTP POST, with batch support.
// Request ids are process-local and only used to reorder batch replies.
pub struct JsonRpcClient {
    http: Client,
    url: String,
    next_id: AtomicU64,
}

impl JsonRpcClient {
    pub fn new(url: String, timeout: Duration) -> Result<Self, ChainError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            url,
            next_id: AtomicU64::new(1),
        })
    }

    fn request<'a>(&self, method: &'a str, params: Value) -> RpcRequest<'a> {
        RpcRequest {
            jsonrpc: "2.0",
            method,
            params,
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
        }
    }

    fn unwrap_response(response: RpcResponse) -> Result<Value, ChainError> {
        if let Some(error) = response.error {
            return Err(ChainError::Rpc {
                code: error.code,
                message: error.message,
            });
        }

        Ok(response.result)
    }

    // Perform a single call and return its raw result value.
    // A null result is returned as-is, absence of a block is decided
    // by the caller.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, ChainError> {
        if log::log_enabled!(log::Level::Trace) {
            trace!("rpc call: {}", method);
        }

        let request = self.request(method, params);
        let response = self
            .http
            .post(&self.url)
            .json(&request)
            .send()
            .await?
            .error_for_status()?;

        let response: RpcResponse = response
            .json()
            .await
            .map_err(|e| ChainError::Payload(e.to_string()))?;

        Self::unwrap_response(response)
    }

    // Perform one batched call of the same method with several parameter
    // sets, returning results in parameter order. The server is free to
    // reply out of order, replies are matched back by request id.
    pub async fn batch(&self, method: &str, params: Vec<Value>) -> Result<Vec<Value>, ChainError> {
        if params.is_empty() {
            return Ok(Vec::new());
        }

        if log::log_enabled!(log::Level::Trace) {
            trace!("rpc batch call: {} x{}", method, params.len());
        }

        let requests: Vec<RpcRequest> = params
            .into_iter()
            .map(|params| self.request(method, params))
            .collect();

        let response = self
            .http
            .post(&self.url)
            .json(&requests)
            .send()
            .await?
            .error_for_status()?;

        let mut responses: Vec<RpcResponse> = response
            .json()
            .await
            .map_err(|e| ChainError::Payload(e.to_string()))?;

        if responses.len() != requests.len() {
            return Err(ChainError::Payload(format!(
                "batch reply has {} entries, expected {}",
                responses.len(),
                requests.len()
            )));
        }

        responses.sort_by_key(|response| response.id);
        responses
            .into_iter()
            .map(Self::unwrap_response)
            .collect()
    }
}

// Parse a 0x-prefixed hexadecimal quantity as returned by the chain RPC
pub fn parse_hex_u64(value: &str, what: &'static str) -> Result<u64, ChainError> {
    let raw = value.strip_prefix("0x").unwrap_or(value);
    u64::from_str_radix(raw, 16).map_err(|_| ChainError::OutOfRange(what))
}
