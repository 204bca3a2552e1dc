//! Chain RPC adapter: a small typed surface over a JSON-RPC node with
//! endpoint failover.
//!
//! The adapter owns an ordered list of HTTP endpoints and a rotation cursor.
//! Connection-class failures rotate to the next endpoint; every call gets an
//! exponential-backoff retry budget on top. Endpoints that reject the
//! `trace_*` or `debug_*` namespaces are flagged once and never asked for
//! traces again, which lets the extractor degrade to cheaper discovery
//! methods per endpoint rather than per chain.

use alloy_primitives::{Address, B256, Bytes, U64};
use alloy_rpc_client::{ClientBuilder, RpcClient};
use alloy_transport::{TransportError, TransportErrorKind};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;
use url::Url;

use crate::networks::Network;
use crate::types::{Block, CallFrame, FlatTrace, Receipt};

/// Per-call deadline for any single request to a node.
const CALL_TIMEOUT: Duration = Duration::from_secs(10);
/// First retry delay; doubles per attempt.
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
/// Retry delays never exceed this.
const MAX_BACKOFF: Duration = Duration::from_secs(60);
/// Retry attempts per call, on top of endpoint rotation.
const MAX_ATTEMPTS: u32 = 3;

/// Errors surfaced by the adapter, already collapsed into the classes the
/// rest of the pipeline cares about.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// Every endpoint was tried and none answered.
    #[error("[{network}] all RPC endpoints unreachable: {message}")]
    Unavailable { network: Network, message: String },
    /// The call failed but is worth retrying later.
    #[error("transient RPC failure: {0}")]
    Transient(String),
    /// The requested object does not exist (null response, unknown block,
    /// reverted call).
    #[error("not found: {0}")]
    NotFound(String),
    /// The endpoint does not implement the trace or debug namespace.
    #[error("trace API unsupported: {0}")]
    TraceUnsupported(String),
    /// The node answered with a payload we could not decode.
    #[error("unexpected RPC payload: {0}")]
    Parse(String),
}

/// Broad classes a raw transport error falls into before being mapped to
/// [`RpcError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorClass {
    /// Socket-level trouble or HTTP-level throttling: rotate endpoints.
    Connection,
    /// The node answered with a retryable JSON-RPC error.
    Transient,
    /// Final absence: null result, unknown block, reverted call.
    NotFound,
    /// Method not found / namespace disabled.
    Unsupported,
    /// Undecodable payload.
    Parse,
}

/// Whether a JSON-RPC error message means the method itself is missing.
fn is_unsupported_message(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("method not found")
        || message.contains("not supported")
        || message.contains("does not exist")
        || message.contains("is not available")
}

/// Whether a JSON-RPC error message is a definitive execution revert.
fn is_revert_message(message: &str) -> bool {
    message.to_ascii_lowercase().contains("revert")
}

fn classify(error: &TransportError) -> ErrorClass {
    match error {
        TransportError::Transport(_) => ErrorClass::Connection,
        TransportError::NullResp => ErrorClass::NotFound,
        TransportError::UnsupportedFeature(_) => ErrorClass::Unsupported,
        TransportError::SerError(_) => ErrorClass::Parse,
        TransportError::DeserError { .. } => ErrorClass::Parse,
        TransportError::ErrorResp(payload) => {
            // -32601 is the JSON-RPC "method not found" code; 3 is the geth
            // execution-revert code.
            if payload.code == -32601 || is_unsupported_message(&payload.message) {
                ErrorClass::Unsupported
            } else if payload.code == 3 || is_revert_message(&payload.message) {
                ErrorClass::NotFound
            } else if payload.message.to_ascii_lowercase().contains("not found") {
                ErrorClass::NotFound
            } else {
                ErrorClass::Transient
            }
        }
        _ => ErrorClass::Transient,
    }
}

/// One configured endpoint plus its health and capability marks.
struct Endpoint {
    url: Url,
    client: RpcClient,
    /// Consecutive connection-class failures; reset on any success so an
    /// endpoint can recover.
    failures: AtomicU32,
    /// Set once the endpoint rejects `trace_block`/`trace_transaction`.
    flat_trace_unsupported: AtomicBool,
    /// Set once the endpoint rejects `debug_traceTransaction`.
    debug_trace_unsupported: AtomicBool,
}

impl Endpoint {
    fn new(url: Url) -> Self {
        let client = ClientBuilder::default().http(url.clone());
        Self {
            url,
            client,
            failures: AtomicU32::new(0),
            flat_trace_unsupported: AtomicBool::new(false),
            debug_trace_unsupported: AtomicBool::new(false),
        }
    }
}

/// Typed JSON-RPC surface for one chain, with failover baked in.
pub struct RpcAdapter {
    network: Network,
    endpoints: Vec<Endpoint>,
    cursor: AtomicUsize,
}

impl RpcAdapter {
    /// Probe the endpoint list in order and settle on the first one that
    /// answers `eth_blockNumber`.
    pub async fn connect(network: Network, urls: &[Url]) -> Result<Self, RpcError> {
        if urls.is_empty() {
            return Err(RpcError::Unavailable {
                network,
                message: "no endpoints configured".into(),
            });
        }
        let adapter = Self {
            network,
            endpoints: urls.iter().cloned().map(Endpoint::new).collect(),
            cursor: AtomicUsize::new(0),
        };
        for (index, endpoint) in adapter.endpoints.iter().enumerate() {
            let probe: Result<U64, _> = adapter
                .request_endpoint(endpoint, "eth_blockNumber", json!([]))
                .await;
            match probe {
                Ok(head) => {
                    adapter.cursor.store(index, Ordering::Relaxed);
                    if network.is_poa() {
                        tracing::debug!(
                            "[{network}] proof-of-authority chain, extraData decoded permissively"
                        );
                    }
                    tracing::info!(
                        "[{network}] connected to {} at block {}",
                        endpoint.url,
                        head.to::<u64>()
                    );
                    return Ok(adapter);
                }
                Err(error) => {
                    tracing::warn!("[{network}] endpoint {} failed probe: {error}", endpoint.url);
                }
            }
        }
        Err(RpcError::Unavailable {
            network,
            message: "no endpoint answered eth_blockNumber".into(),
        })
    }

    pub fn network(&self) -> Network {
        self.network
    }

    fn current_index(&self) -> usize {
        self.cursor.load(Ordering::Relaxed) % self.endpoints.len()
    }

    fn rotate(&self, from_index: usize) {
        let next = (from_index + 1) % self.endpoints.len();
        // CAS so concurrent callers observing the same failure rotate once.
        let _ = self.cursor.compare_exchange(
            from_index,
            next,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
        tracing::warn!(
            "[{}] rotating RPC endpoint to {}",
            self.network,
            self.endpoints[next].url
        );
    }

    /// Issue one request against one endpoint with the per-call deadline.
    async fn request_endpoint<R>(
        &self,
        endpoint: &Endpoint,
        method: &str,
        params: Value,
    ) -> Result<R, TransportError>
    where
        R: DeserializeOwned + Send + Sync + Unpin + 'static + std::fmt::Debug,
    {
        let call = endpoint.client.request(method.to_owned(), params);
        match tokio::time::timeout(CALL_TIMEOUT, call).await {
            Ok(result) => {
                if result.is_ok() {
                    endpoint.failures.store(0, Ordering::Relaxed);
                } else {
                    endpoint.failures.fetch_add(1, Ordering::Relaxed);
                }
                result
            }
            Err(_) => {
                endpoint.failures.fetch_add(1, Ordering::Relaxed);
                Err(TransportErrorKind::custom_str(&format!(
                    "request timed out after {}s",
                    CALL_TIMEOUT.as_secs()
                )))
            }
        }
    }

    /// The main call path: rotation across endpoints on connection failures,
    /// exponential backoff across attempts, early return on final errors.
    async fn call<R>(&self, method: &str, params: Value) -> Result<R, RpcError>
    where
        R: DeserializeOwned + Send + Sync + Unpin + 'static + std::fmt::Debug,
    {
        let mut backoff = INITIAL_BACKOFF;
        let mut last_error = RpcError::Unavailable {
            network: self.network,
            message: format!("{method} exhausted retries"),
        };
        for attempt in 1..=MAX_ATTEMPTS {
            for _ in 0..self.endpoints.len() {
                let index = self.current_index();
                let endpoint = &self.endpoints[index];
                match self
                    .request_endpoint::<R>(endpoint, method, params.clone())
                    .await
                {
                    Ok(value) => return Ok(value),
                    Err(error) => match classify(&error) {
                        ErrorClass::Connection => {
                            tracing::debug!(
                                "[{}] {method} connection failure #{} on {}: {error}",
                                self.network,
                                endpoint.failures.load(Ordering::Relaxed),
                                endpoint.url
                            );
                            self.rotate(index);
                            last_error = RpcError::Unavailable {
                                network: self.network,
                                message: error.to_string(),
                            };
                        }
                        ErrorClass::Transient => {
                            last_error = RpcError::Transient(error.to_string());
                            break;
                        }
                        ErrorClass::NotFound => {
                            return Err(RpcError::NotFound(error.to_string()));
                        }
                        ErrorClass::Unsupported => {
                            return Err(RpcError::TraceUnsupported(error.to_string()));
                        }
                        ErrorClass::Parse => {
                            return Err(RpcError::Parse(error.to_string()));
                        }
                    },
                }
            }
            if attempt < MAX_ATTEMPTS {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
        Err(last_error)
    }

    /// Latest block number the current endpoint has seen.
    pub async fn latest_head(&self) -> Result<u64, RpcError> {
        let head: U64 = self.call("eth_blockNumber", json!([])).await?;
        Ok(head.to::<u64>())
    }

    /// Fetch a block including full transaction objects.
    pub async fn get_block_with_txs(&self, number: u64) -> Result<Block, RpcError> {
        self.call(
            "eth_getBlockByNumber",
            json!([format!("0x{number:x}"), true]),
        )
        .await
    }

    /// Fetch a transaction receipt; `NotFound` when the node returns null.
    pub async fn get_receipt(&self, tx_hash: B256) -> Result<Receipt, RpcError> {
        self.call("eth_getTransactionReceipt", json!([tx_hash])).await
    }

    /// Runtime bytecode at an address, optionally at a historical block.
    pub async fn get_code(&self, address: Address, block: Option<u64>) -> Result<Bytes, RpcError> {
        let tag = match block {
            Some(number) => format!("0x{number:x}"),
            None => "latest".to_owned(),
        };
        self.call("eth_getCode", json!([address, tag])).await
    }

    /// Read one 32-byte storage word.
    pub async fn get_storage(&self, address: Address, slot: B256) -> Result<B256, RpcError> {
        self.call("eth_getStorageAt", json!([address, slot, "latest"]))
            .await
    }

    /// Read-only contract call at the latest block.
    pub async fn eth_call(&self, to: Address, data: Bytes) -> Result<Bytes, RpcError> {
        self.call("eth_call", json!([{ "to": to, "data": data }, "latest"]))
            .await
    }

    /// Parity-style flat traces for a whole block.
    pub async fn trace_block(&self, number: u64) -> Result<Vec<FlatTrace>, RpcError> {
        self.trace_call("trace_block", json!([format!("0x{number:x}")]), false)
            .await
    }

    /// Parity-style flat traces for one transaction.
    pub async fn trace_transaction(&self, tx_hash: B256) -> Result<Vec<FlatTrace>, RpcError> {
        self.trace_call("trace_transaction", json!([tx_hash]), false)
            .await
    }

    /// Geth call-tracer tree for one transaction.
    pub async fn call_trace(&self, tx_hash: B256) -> Result<CallFrame, RpcError> {
        self.trace_call(
            "debug_traceTransaction",
            json!([tx_hash, { "tracer": "callTracer" }]),
            true,
        )
        .await
    }

    /// Trace calls honor the per-endpoint capability flags: an endpoint that
    /// rejected the namespace once is never asked again.
    async fn trace_call<R>(&self, method: &str, params: Value, debug: bool) -> Result<R, RpcError>
    where
        R: DeserializeOwned + Send + Sync + Unpin + 'static + std::fmt::Debug,
    {
        let mut last_error = RpcError::TraceUnsupported(format!(
            "{method} unsupported on every endpoint of {}",
            self.network
        ));
        for offset in 0..self.endpoints.len() {
            let index = (self.current_index() + offset) % self.endpoints.len();
            let endpoint = &self.endpoints[index];
            let flag = if debug {
                &endpoint.debug_trace_unsupported
            } else {
                &endpoint.flat_trace_unsupported
            };
            if flag.load(Ordering::Relaxed) {
                continue;
            }
            match self
                .request_endpoint::<R>(endpoint, method, params.clone())
                .await
            {
                Ok(value) => return Ok(value),
                Err(error) => match classify(&error) {
                    ErrorClass::Unsupported => {
                        if !flag.swap(true, Ordering::Relaxed) {
                            tracing::info!(
                                "[{}] {} does not support {method}, not asking again",
                                self.network,
                                endpoint.url
                            );
                        }
                        last_error = RpcError::TraceUnsupported(error.to_string());
                    }
                    ErrorClass::Connection => {
                        self.rotate(index);
                        last_error = RpcError::Unavailable {
                            network: self.network,
                            message: error.to_string(),
                        };
                    }
                    ErrorClass::NotFound => return Err(RpcError::NotFound(error.to_string())),
                    ErrorClass::Parse => return Err(RpcError::Parse(error.to_string())),
                    ErrorClass::Transient => {
                        last_error = RpcError::Transient(error.to_string());
                    }
                },
            }
        }
        Err(last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_messages_are_recognized() {
        assert!(is_unsupported_message("Method not found"));
        assert!(is_unsupported_message(
            "the method trace_block does not exist/is not available"
        ));
        assert!(is_unsupported_message("trace_block is not supported"));
        assert!(!is_unsupported_message("header not found"));
    }

    #[test]
    fn revert_messages_are_final() {
        assert!(is_revert_message("execution reverted: ERC20: no balance"));
        assert!(!is_revert_message("connection reset by peer"));
    }

    #[test]
    fn transport_failures_rotate_and_null_results_do_not() {
        let timeout = TransportErrorKind::custom_str("request timed out after 10s");
        assert_eq!(classify(&timeout), ErrorClass::Connection);
        assert_eq!(classify(&TransportError::NullResp), ErrorClass::NotFound);
    }
}
