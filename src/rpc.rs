use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::constants::{RPC_FETCH_TIMEOUT, RPC_MAX_ATTEMPTS, RPC_STATUS_TIMEOUT};

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("rpc request timed out")]
    Timeout,
    #[error("rpc transport error: {0}")]
    Transport(String),
    #[error("rpc error response: {0}")]
    ErrorResponse(String),
    #[error("transaction not found")]
    NotFound,
}

impl RpcError {
    /// Every RPC failure except NotFound is worth a queue-level retry
    pub fn retryable(&self) -> bool {
        !matches!(self, RpcError::NotFound)
    }
}

/// Seam for fetching a parsed transaction when the queued payload is
/// missing. Production uses the chain RPC; tests substitute a stub.
#[async_trait]
pub trait TxFetcher: Send + Sync {
    async fn fetch_parsed_transaction(&self, signature: &str) -> Result<Value, RpcError>;
}

/// JSON-RPC getSignatureStatuses request body
pub fn status_request(signature: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "getSignatureStatuses",
        "params": [[signature], {"searchTransactionHistory": true}]
    })
}

/// JSON-RPC getTransaction request body (jsonParsed, version 0)
pub fn transaction_request(signature: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "getTransaction",
        "params": [signature, {
            "encoding": "jsonParsed",
            "commitment": "finalized",
            "maxSupportedTransactionVersion": 0
        }]
    })
}

/// Chain RPC fallback used when a job arrives without its cached payload.
pub struct ChainRpcClient {
    client: Client,
    endpoint: String,
}

impl ChainRpcClient {
    pub fn new(endpoint: String) -> Self {
        let client = Client::builder()
            .timeout(RPC_FETCH_TIMEOUT)
            .build()
            .expect("Failed to create HTTP client");
        Self { client, endpoint }
    }

    async fn call(&self, body: &Value, timeout: Duration) -> Result<Value, RpcError> {
        let response = self
            .client
            .post(&self.endpoint)
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RpcError::Timeout
                } else {
                    RpcError::Transport(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(RpcError::ErrorResponse(format!("http {}", response.status())));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        if let Some(error) = payload.get("error") {
            if !error.is_null() {
                return Err(RpcError::ErrorResponse(error.to_string()));
            }
        }
        Ok(payload.get("result").cloned().unwrap_or(Value::Null))
    }

    /// True when the signature is finalized without an on-chain error
    pub async fn signature_confirmed(&self, signature: &str) -> Result<bool, RpcError> {
        let result = self
            .call(&status_request(signature), RPC_STATUS_TIMEOUT)
            .await?;
        let status = result
            .pointer("/value/0")
            .filter(|status| !status.is_null());
        let Some(status) = status else {
            return Ok(false);
        };
        let errored = status.get("err").is_some_and(|err| !err.is_null());
        Ok(!errored)
    }

    pub async fn get_parsed_transaction(&self, signature: &str) -> Result<Value, RpcError> {
        let result = self
            .call(&transaction_request(signature), RPC_FETCH_TIMEOUT)
            .await?;
        if result.is_null() {
            return Err(RpcError::NotFound);
        }
        Ok(result)
    }
}

#[async_trait]
impl TxFetcher for ChainRpcClient {
    /// Status-check then fetch, retried with exponential backoff. The final
    /// attempt's error propagates so the queue can reschedule the job.
    async fn fetch_parsed_transaction(&self, signature: &str) -> Result<Value, RpcError> {
        let mut last_error = RpcError::NotFound;
        for attempt in 1..=RPC_MAX_ATTEMPTS {
            match self.signature_confirmed(signature).await {
                Ok(false) => {
                    debug!("Signature {} not yet confirmed (attempt {})", signature, attempt);
                }
                Ok(true) => match self.get_parsed_transaction(signature).await {
                    Ok(tx) => return Ok(tx),
                    Err(e) => last_error = e,
                },
                Err(e) => last_error = e,
            }

            if attempt < RPC_MAX_ATTEMPTS {
                let backoff_ms = 500 * 2u64.pow(attempt - 1) + fastrand::u64(0..200);
                warn!(
                    "RPC fetch for {} failed (attempt {}/{}), retrying in {}ms",
                    signature, attempt, RPC_MAX_ATTEMPTS, backoff_ms
                );
                sleep(Duration::from_millis(backoff_ms)).await;
            }
        }
        Err(last_error)
    }
}
