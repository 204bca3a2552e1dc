//! Attribution client: maps an address to a known entity via the Arkham
//! intelligence API, with a global rate limit and an in-memory TTL cache.
//!
//! Both positive and negative (404) answers are cached so that a burst of
//! deployments from one unknown deployer costs a single outbound request.
//! Transport errors and unexpected statuses are never cached.

use dashmap::DashMap;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use alloy_primitives::Address;

use crate::networks::Network;
use crate::types::hex_address;

/// Cached answers go stale after this.
const CACHE_TTL: Duration = Duration::from_secs(3600);
/// Global outbound budget: 20 requests per second.
const MIN_REQUEST_INTERVAL: Duration = Duration::from_millis(50);
/// Outbound HTTP deadline.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Failures constructing the client. Lookups themselves never fail, they
/// degrade to `None`.
#[derive(Debug, thiserror::Error)]
pub enum AttributionError {
    #[error("invalid API key: {0}")]
    InvalidKey(String),
    #[error("failed to build HTTP client: {0}")]
    Http(#[from] reqwest::Error),
}

/// Serializes callers onto the request path at the configured rate.
///
/// The mutex only guards the timestamp math; the sleep happens after the
/// lock is released so waiting callers queue up without convoying.
struct RateLimiter {
    last_request: Mutex<Instant>,
    min_interval: Duration,
}

impl RateLimiter {
    fn new(min_interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            last_request: Mutex::new(now.checked_sub(min_interval).unwrap_or(now)),
            min_interval,
        }
    }

    async fn acquire(&self) {
        let wake_at = {
            let mut last = self.last_request.lock().await;
            let now = Instant::now();
            let earliest = *last + self.min_interval;
            let wake_at = if earliest > now { earliest } else { now };
            *last = wake_at;
            wake_at
        };
        tokio::time::sleep_until(wake_at).await;
    }
}

struct CacheEntry {
    /// `None` is a cached 404: the API knows nothing about this address.
    payload: Option<Value>,
    inserted_at: Instant,
}

/// Per-chain cache statistics, surfaced in the shutdown summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
}

/// Rate-limited, cached client for the attribution API.
pub struct AttributionClient {
    http: reqwest::Client,
    api_url: String,
    cache: DashMap<String, CacheEntry>,
    limiter: RateLimiter,
}

impl AttributionClient {
    pub fn new(api_key: &str, api_url: &str) -> Result<Self, AttributionError> {
        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(api_key)
            .map_err(|e| AttributionError::InvalidKey(e.to_string()))?;
        headers.insert("API-Key", key);
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            api_url: api_url.trim_end_matches('/').to_owned(),
            cache: DashMap::new(),
            limiter: RateLimiter::new(MIN_REQUEST_INTERVAL),
        })
    }

    fn cache_key(address: &Address, network: Network) -> String {
        format!("{}:{}", hex_address(address), network.name())
    }

    /// Fresh cached value for a key: `Some(Some(..))` is a positive hit,
    /// `Some(None)` a cached miss, `None` means ask the API. Expired
    /// entries are evicted here.
    fn cache_get(&self, key: &str) -> Option<Option<Value>> {
        if let Some(entry) = self.cache.get(key) {
            if entry.inserted_at.elapsed() < CACHE_TTL {
                return Some(entry.payload.clone());
            }
        } else {
            return None;
        }
        self.cache.remove(key);
        None
    }

    fn cache_put(&self, key: String, payload: Option<Value>) {
        self.cache.insert(
            key,
            CacheEntry {
                payload,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Look up attribution for an address on a chain.
    ///
    /// Returns the raw JSON payload, or `None` when the API has nothing (or
    /// could not be reached). Suspends on the rate limiter before the
    /// outbound call; never while touching the cache.
    pub async fn lookup(&self, address: &Address, network: Network) -> Option<Value> {
        let key = Self::cache_key(address, network);
        if let Some(cached) = self.cache_get(&key) {
            tracing::debug!("[{network}] attribution cache hit for {}", hex_address(address));
            return cached;
        }

        self.limiter.acquire().await;

        let url = format!(
            "{}/intelligence/address/{}",
            self.api_url,
            hex_address(address)
        );
        let response = self
            .http
            .get(&url)
            .query(&[("chain", network.name())])
            .send()
            .await;
        match response {
            Ok(response) => match response.status() {
                StatusCode::OK => match response.json::<Value>().await {
                    Ok(payload) => {
                        tracing::info!(
                            "[{network}] attribution found for {}",
                            hex_address(address)
                        );
                        self.cache_put(key, Some(payload.clone()));
                        Some(payload)
                    }
                    Err(error) => {
                        tracing::debug!("[{network}] undecodable attribution payload: {error}");
                        None
                    }
                },
                StatusCode::NOT_FOUND => {
                    tracing::debug!(
                        "[{network}] no attribution for {}",
                        hex_address(address)
                    );
                    self.cache_put(key, None);
                    None
                }
                status => {
                    // Treated as transient: not cached, next deployment retries.
                    tracing::warn!(
                        "[{network}] attribution API returned {status} for {}",
                        hex_address(address)
                    );
                    None
                }
            },
            Err(error) => {
                tracing::error!(
                    "[{network}] attribution request failed for {}: {error}",
                    hex_address(address)
                );
                None
            }
        }
    }

    /// Number of live cache entries.
    pub fn cache_stats(&self) -> CacheStats {
        CacheStats {
            entries: self.cache.len(),
        }
    }
}

/// Pull `(entity_name, entity_id)` out of an attribution payload.
///
/// Recognized containers, in priority order: `arkhamEntity`, `entity`,
/// `arkhamLabel`. The first container present wins, even when its `name`
/// and `id` are both missing. Deterministic for a fixed payload.
pub fn extract_entity(payload: Option<&Value>) -> (Option<String>, Option<String>) {
    let Some(payload) = payload else {
        return (None, None);
    };
    for container in ["arkhamEntity", "entity", "arkhamLabel"] {
        if let Some(entity) = payload.get(container) {
            return (
                field_as_string(entity, "name"),
                field_as_string(entity, "id"),
            );
        }
    }
    (None, None)
}

fn field_as_string(value: &Value, field: &str) -> Option<String> {
    match value.get(field)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_address() -> Address {
        "0x00000000000000000000000000000000000000aa"
            .parse()
            .expect("address")
    }

    #[test]
    fn extract_prefers_arkham_entity_over_label() {
        let payload = json!({
            "arkhamLabel": { "name": "Some Label", "id": "label-1" },
            "arkhamEntity": { "name": "Binance", "id": "binance" }
        });
        let (name, id) = extract_entity(Some(&payload));
        assert_eq!(name.as_deref(), Some("Binance"));
        assert_eq!(id.as_deref(), Some("binance"));
    }

    #[test]
    fn extract_falls_through_to_label() {
        let payload = json!({ "arkhamLabel": { "name": "Deployer #4" } });
        let (name, id) = extract_entity(Some(&payload));
        assert_eq!(name.as_deref(), Some("Deployer #4"));
        assert_eq!(id, None);
    }

    #[test]
    fn extract_stops_at_the_first_present_container() {
        // An empty arkhamEntity wins over a populated entity: the first
        // container present is the answer, not the first non-empty one.
        let payload = json!({
            "arkhamEntity": {},
            "entity": { "name": "Shadowed", "id": "shadowed" }
        });
        assert_eq!(extract_entity(Some(&payload)), (None, None));
    }

    #[test]
    fn extract_of_nothing_is_nothing() {
        assert_eq!(extract_entity(None), (None, None));
        let payload = json!({ "somethingElse": true });
        assert_eq!(extract_entity(Some(&payload)), (None, None));
    }

    #[tokio::test(start_paused = true)]
    async fn limiter_spaces_callers_at_the_configured_interval() {
        let limiter = RateLimiter::new(MIN_REQUEST_INTERVAL);
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        limiter.acquire().await;
        // First entry is free, the next two wait 50ms each.
        assert_eq!(start.elapsed(), MIN_REQUEST_INTERVAL * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_cache_entries_are_treated_as_absent() {
        let client =
            AttributionClient::new("test-key", "https://example.invalid").expect("client");
        let key = AttributionClient::cache_key(&test_address(), Network::Ethereum);
        client.cache_put(key.clone(), Some(json!({"entity": {"name": "Fresh"}})));
        assert!(client.cache_get(&key).is_some());

        tokio::time::advance(CACHE_TTL + Duration::from_secs(1)).await;
        assert_eq!(client.cache_get(&key), None);
        // Lazy eviction removed the entry.
        assert_eq!(client.cache_stats().entries, 0);
    }

    #[tokio::test]
    async fn second_lookup_within_ttl_hits_the_cache() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock(
                "GET",
                "/intelligence/address/0x00000000000000000000000000000000000000aa",
            )
            .match_query(mockito::Matcher::UrlEncoded(
                "chain".into(),
                "ethereum".into(),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"arkhamEntity":{"name":"Coinbase","id":"coinbase"}}"#)
            .expect(1)
            .create_async()
            .await;

        let client = AttributionClient::new("test-key", &server.url()).expect("client");
        let first = client.lookup(&test_address(), Network::Ethereum).await;
        let second = client.lookup(&test_address(), Network::Ethereum).await;
        mock.assert_async().await;

        let (name, _) = extract_entity(first.as_ref());
        assert_eq!(name.as_deref(), Some("Coinbase"));
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn not_found_is_cached_negatively() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock(
                "GET",
                "/intelligence/address/0x00000000000000000000000000000000000000aa",
            )
            .match_query(mockito::Matcher::Any)
            .with_status(404)
            .expect(1)
            .create_async()
            .await;

        let client = AttributionClient::new("test-key", &server.url()).expect("client");
        assert_eq!(client.lookup(&test_address(), Network::Ethereum).await, None);
        assert_eq!(client.lookup(&test_address(), Network::Ethereum).await, None);
        mock.assert_async().await;
        assert_eq!(client.cache_stats().entries, 1);
    }

    #[tokio::test]
    async fn server_errors_are_not_cached() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock(
                "GET",
                "/intelligence/address/0x00000000000000000000000000000000000000aa",
            )
            .match_query(mockito::Matcher::Any)
            .with_status(502)
            .expect(2)
            .create_async()
            .await;

        let client = AttributionClient::new("test-key", &server.url()).expect("client");
        assert_eq!(client.lookup(&test_address(), Network::Ethereum).await, None);
        assert_eq!(client.lookup(&test_address(), Network::Ethereum).await, None);
        mock.assert_async().await;
        assert_eq!(client.cache_stats().entries, 0);
    }
}
