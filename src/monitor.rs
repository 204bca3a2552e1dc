//! Per-chain monitor loop: advances the cursor through new blocks, feeds
//! discoveries to the enrichment stage, and commits progress.
//!
//! A batch `[cursor..=end]` is committed only after every deployment found
//! in it has been enriched and enqueued for persistence; a block that cannot
//! be read fails the whole batch so the cursor never skips past unscanned
//! blocks. Catch-up speed scales with how far behind the chain head the
//! cursor is.

use futures_util::StreamExt;
use futures_util::stream;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::attribution::{AttributionClient, extract_entity};
use crate::classifier::Classifier;
use crate::extractor::DeploymentExtractor;
use crate::networks::Network;
use crate::rpc::{RpcAdapter, RpcError};
use crate::store::{ContractRecord, Store, StoreError};
use crate::types::{Deployment, hex_address};

/// Concurrent enrichment workers per chain.
const ENRICH_CONCURRENCY: usize = 10;
/// Error sleeps never exceed this.
const MAX_ERROR_SLEEP: Duration = Duration::from_secs(300);
/// After this many consecutive failures the adapter is rebuilt.
const MAX_CONSECUTIVE_ERRORS: u32 = 5;

/// Why a monitor cycle failed.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Some blocks of the batch could not be read; the cursor stays put and
    /// the whole range is retried.
    #[error("batch incomplete, {0} block(s) unreadable")]
    IncompleteBatch(usize),
}

/// Read-only per-chain counters, updated by the monitor and read by the
/// supervisor (and any external status renderer).
pub struct ChainStats {
    current_block: AtomicU64,
    head: AtomicU64,
    batch_size: AtomicU64,
    found: AtomicU64,
    saved: AtomicU64,
    with_entity: AtomicU64,
    errors: AtomicU64,
    /// Unix seconds of the most recent discovery; zero means never.
    last_deployment_time: AtomicU64,
    status: std::sync::Mutex<String>,
}

/// A point-in-time copy of [`ChainStats`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainStatsSnapshot {
    pub current_block: u64,
    pub head: u64,
    pub behind: u64,
    pub current_batch_size: u64,
    pub found: u64,
    pub saved: u64,
    pub with_entity: u64,
    pub errors: u64,
    pub last_deployment_time: Option<u64>,
    pub status: String,
}

impl ChainStats {
    pub fn new(batch_size: u64) -> Self {
        Self {
            current_block: AtomicU64::new(0),
            head: AtomicU64::new(0),
            batch_size: AtomicU64::new(batch_size),
            found: AtomicU64::new(0),
            saved: AtomicU64::new(0),
            with_entity: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            last_deployment_time: AtomicU64::new(0),
            status: std::sync::Mutex::new("Initializing".to_owned()),
        }
    }

    fn set_status(&self, status: impl Into<String>) {
        if let Ok(mut guard) = self.status.lock() {
            *guard = status.into();
        }
    }

    fn record_discovery(&self, with_entity: bool) {
        self.found.fetch_add(1, Ordering::Relaxed);
        self.saved.fetch_add(1, Ordering::Relaxed);
        if with_entity {
            self.with_entity.fetch_add(1, Ordering::Relaxed);
        }
        self.last_deployment_time
            .store(chrono::Utc::now().timestamp() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ChainStatsSnapshot {
        let current_block = self.current_block.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Relaxed);
        let last = self.last_deployment_time.load(Ordering::Relaxed);
        ChainStatsSnapshot {
            current_block,
            head,
            behind: head.saturating_sub(current_block),
            current_batch_size: self.batch_size.load(Ordering::Relaxed),
            found: self.found.load(Ordering::Relaxed),
            saved: self.saved.load(Ordering::Relaxed),
            with_entity: self.with_entity.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            last_deployment_time: (last > 0).then_some(last),
            status: self
                .status
                .lock()
                .map(|guard| guard.clone())
                .unwrap_or_default(),
        }
    }
}

/// Batch size as a function of how far behind the head the cursor is.
///
/// Near real time the base size applies; the further behind, the larger the
/// multiplier, up to 50x in full catch-up mode.
pub fn adaptive_batch(behind: u64, base: u64) -> u64 {
    let multiplier = match behind {
        0..100 => 1,
        100..1_000 => 2,
        1_000..5_000 => 5,
        5_000..10_000 => 10,
        10_000..50_000 => 20,
        _ => 50,
    };
    base * multiplier
}

/// Sleep before the next attempt after `consecutive_errors` failures.
fn error_sleep(check_interval: Duration, consecutive_errors: u32) -> Duration {
    let exponent = consecutive_errors.saturating_sub(1).min(5);
    (check_interval * 2u32.pow(exponent)).min(MAX_ERROR_SLEEP)
}

/// One chain's monitor: owns the adapter and the cursor, shares the
/// attribution client and the store with every other chain.
pub struct ChainMonitor {
    network: Network,
    endpoints: Vec<Url>,
    rpc: Arc<RpcAdapter>,
    attribution: Arc<AttributionClient>,
    store: Arc<Store>,
    stats: Arc<ChainStats>,
    cancel: CancellationToken,
    check_interval: Duration,
    base_batch_size: u64,
    /// Next unprocessed block.
    cursor: u64,
}

impl ChainMonitor {
    /// Connect to the chain and resume from the durable cursor, or start at
    /// the current head on a fresh chain.
    #[allow(clippy::too_many_arguments)]
    pub async fn connect(
        network: Network,
        endpoints: Vec<Url>,
        attribution: Arc<AttributionClient>,
        store: Arc<Store>,
        stats: Arc<ChainStats>,
        cancel: CancellationToken,
        check_interval: Duration,
        base_batch_size: u64,
    ) -> Result<Self, MonitorError> {
        let rpc = Arc::new(RpcAdapter::connect(network, &endpoints).await?);
        let cursor = match store.last_cursor(network).await? {
            Some(last_processed) => {
                tracing::info!("[{network}] resuming from block {}", last_processed + 1);
                last_processed + 1
            }
            None => {
                let head = rpc.latest_head().await?;
                tracing::info!("[{network}] starting fresh from current block {head}");
                head
            }
        };
        stats.current_block.store(cursor, Ordering::Relaxed);
        Ok(Self {
            network,
            endpoints,
            rpc,
            attribution,
            store,
            stats,
            cancel,
            check_interval,
            base_batch_size,
            cursor,
        })
    }

    /// Drive the chain until cancellation. Never returns early on chain
    /// trouble; every failure feeds the backoff/reinitialize policy.
    pub async fn run(mut self) {
        tracing::info!("[{}] monitoring started", self.network);
        self.stats.set_status("Running");
        let mut consecutive_errors: u32 = 0;

        while !self.cancel.is_cancelled() {
            match self.cycle().await {
                Ok(()) => {
                    consecutive_errors = 0;
                    self.stats.set_status("Running");
                    self.idle(self.check_interval).await;
                }
                Err(error) => {
                    consecutive_errors += 1;
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .set_status(format!("Error (#{consecutive_errors})"));
                    tracing::error!(
                        "[{}] cycle failed (#{consecutive_errors}): {error}",
                        self.network
                    );
                    if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                        self.reinitialize(&mut consecutive_errors).await;
                    } else {
                        self.idle(error_sleep(self.check_interval, consecutive_errors))
                            .await;
                    }
                }
            }
        }
        self.stats.set_status("Stopped");
        tracing::info!("[{}] monitoring stopped", self.network);
    }

    /// Too many consecutive failures: throw the adapter away and establish
    /// endpoints from scratch.
    async fn reinitialize(&mut self, consecutive_errors: &mut u32) {
        tracing::warn!(
            "[{}] {consecutive_errors} consecutive errors, reinitializing RPC adapter",
            self.network
        );
        match RpcAdapter::connect(self.network, &self.endpoints).await {
            Ok(adapter) => {
                self.rpc = Arc::new(adapter);
                *consecutive_errors = 0;
                self.stats.set_status("Running");
                tracing::info!("[{}] adapter reinitialized", self.network);
            }
            Err(error) => {
                tracing::error!("[{}] reinitialization failed: {error}", self.network);
                let exponent = (*consecutive_errors).min(8);
                self.idle((self.check_interval * 2u32.pow(exponent)).min(MAX_ERROR_SLEEP))
                    .await;
            }
        }
    }

    /// One pass: look at the head, process at most one adaptive batch,
    /// commit the cursor.
    async fn cycle(&mut self) -> Result<(), MonitorError> {
        let head = self.rpc.latest_head().await?;
        self.stats.head.store(head, Ordering::Relaxed);

        // head == cursor: nothing new. head < cursor: endpoint skew after a
        // failover; wait it out, never rewind.
        if head <= self.cursor {
            return Ok(());
        }

        let behind = head - self.cursor;
        let batch = adaptive_batch(behind, self.base_batch_size);
        let end = (self.cursor + batch - 1).min(head);
        self.stats.batch_size.store(batch, Ordering::Relaxed);
        if batch > self.base_batch_size {
            tracing::info!(
                "[{}] catch-up: processing blocks {}..={end} (behind {behind})",
                self.network,
                self.cursor
            );
        } else {
            tracing::info!(
                "[{}] processing blocks {}..={end}",
                self.network,
                self.cursor
            );
        }

        let extractor = DeploymentExtractor::new(Arc::clone(&self.rpc));
        let scan = extractor.deployments_in_range(self.cursor, end).await;
        if !scan.failed_blocks.is_empty() {
            return Err(MonitorError::IncompleteBatch(scan.failed_blocks.len()));
        }

        if self.cancel.is_cancelled() {
            // Shutting down: nothing was enqueued, so the batch is not
            // committed and will be rediscovered on restart.
            return Ok(());
        }

        if !scan.deployments.is_empty() {
            tracing::info!(
                "[{}] found {} deployment(s) in blocks {}..={end}",
                self.network,
                scan.deployments.len(),
                self.cursor
            );
            self.enrich_and_queue(scan.deployments).await;
        }

        self.store.set_cursor(self.network, end).await?;
        self.cursor = end + 1;
        self.stats.current_block.store(self.cursor, Ordering::Relaxed);
        Ok(())
    }

    /// Fan discovered deployments out to the enrichment pool: classify the
    /// contract and attribute the deployer in parallel, then hand the
    /// enriched record to the store. Completes only when every record of
    /// the batch has been enqueued.
    async fn enrich_and_queue(&self, deployments: Vec<Deployment>) {
        let classifier = Classifier::new(Arc::clone(&self.rpc));
        stream::iter(deployments)
            .for_each_concurrent(ENRICH_CONCURRENCY, |deployment| {
                let classifier = classifier.clone();
                async move {
                    let (profile, payload) = tokio::join!(
                        classifier.profile(deployment.contract_address),
                        self.attribution
                            .lookup(&deployment.deployer_address, self.network)
                    );
                    let (entity_name, entity_id) = extract_entity(payload.as_ref());
                    if let Some(name) = &entity_name {
                        tracing::info!(
                            "[{}] contract {} belongs to entity {name}",
                            self.network,
                            hex_address(&deployment.contract_address)
                        );
                    }
                    let record = ContractRecord {
                        contract_type: Some(profile.primary.clone()),
                        contract_info: serde_json::to_string(&profile).ok(),
                        entity_name: entity_name.clone(),
                        entity_id,
                        deployment,
                    };
                    self.store.queue_deployment(record);
                    self.stats.record_discovery(entity_name.is_some());
                }
            })
            .await;
    }

    /// Cancellation-aware sleep.
    async fn idle(&self, duration: Duration) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: u64 = 10;

    #[test]
    fn batch_multipliers_follow_the_catch_up_ladder() {
        assert_eq!(adaptive_batch(0, BASE), 10);
        assert_eq!(adaptive_batch(99, BASE), 10);
        assert_eq!(adaptive_batch(100, BASE), 20);
        assert_eq!(adaptive_batch(999, BASE), 20);
        assert_eq!(adaptive_batch(1_000, BASE), 50);
        assert_eq!(adaptive_batch(4_999, BASE), 50);
        assert_eq!(adaptive_batch(5_000, BASE), 100);
        assert_eq!(adaptive_batch(9_999, BASE), 100);
        assert_eq!(adaptive_batch(10_000, BASE), 200);
        assert_eq!(adaptive_batch(49_999, BASE), 200);
        assert_eq!(adaptive_batch(50_000, BASE), 500);
        // A cursor at 1000 with the head at 60000 is 59000 behind: one
        // iteration covers 500 blocks at the default base size.
        assert_eq!(adaptive_batch(59_000, BASE), 500);
    }

    #[test]
    fn error_sleep_doubles_and_caps() {
        let interval = Duration::from_secs(12);
        assert_eq!(error_sleep(interval, 1), Duration::from_secs(12));
        assert_eq!(error_sleep(interval, 2), Duration::from_secs(24));
        assert_eq!(error_sleep(interval, 3), Duration::from_secs(48));
        assert_eq!(error_sleep(interval, 6), Duration::from_secs(300));
        assert_eq!(error_sleep(interval, 60), Duration::from_secs(300));
    }

    #[test]
    fn snapshot_reports_behind_and_status() {
        let stats = ChainStats::new(BASE);
        stats.current_block.store(1_000, Ordering::Relaxed);
        stats.head.store(1_250, Ordering::Relaxed);
        stats.record_discovery(true);
        stats.record_discovery(false);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.behind, 250);
        assert_eq!(snapshot.found, 2);
        assert_eq!(snapshot.saved, 2);
        assert_eq!(snapshot.with_entity, 1);
        assert_eq!(snapshot.status, "Initializing");
        assert!(snapshot.last_deployment_time.is_some());
    }

    #[test]
    fn behind_never_underflows_on_fresh_stats() {
        let stats = ChainStats::new(BASE);
        stats.current_block.store(100, Ordering::Relaxed);
        // Head not yet observed.
        assert_eq!(stats.snapshot().behind, 0);
    }
}
