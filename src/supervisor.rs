//! Supervisor: owns the shared components, spawns one monitor per chain,
//! restarts the ones that die, and coordinates graceful shutdown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use url::Url;

use crate::attribution::{AttributionClient, AttributionError};
use crate::config::{CliArgs, Config};
use crate::monitor::{ChainMonitor, ChainStats, ChainStatsSnapshot};
use crate::networks::Network;
use crate::store::{Store, StoreError};

/// How often dead monitors are detected and restarted.
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);
/// Per-monitor join grace during shutdown.
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Attribution(#[from] AttributionError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("no chain monitors could be started")]
    NoMonitors,
}

/// Chains that survive eligibility filtering: EVM-compatible and with at
/// least one endpoint. Everything else is skipped with a warning.
fn eligible_chains(config: &Config, selected: &[Network]) -> Vec<(Network, Vec<Url>)> {
    let mut chains = Vec::new();
    for network in selected {
        if !network.is_evm() {
            tracing::warn!("skipping {network}: non-EVM chains are not supported");
            continue;
        }
        let endpoints = config.endpoints(*network);
        if endpoints.is_empty() {
            tracing::warn!("skipping {network}: no RPC endpoints configured");
            continue;
        }
        chains.push((*network, endpoints));
    }
    chains
}

/// The orchestrator for every per-chain monitor.
pub struct Supervisor {
    chains: Vec<(Network, Vec<Url>)>,
    attribution: Arc<AttributionClient>,
    store: Arc<Store>,
    stats: HashMap<Network, Arc<ChainStats>>,
    tasks: Mutex<HashMap<Network, JoinHandle<()>>>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    check_interval: Duration,
    batch_size: u64,
}

impl Supervisor {
    /// Build the shared components and start one monitor per eligible
    /// chain. Fails only when not a single monitor could start.
    pub async fn start(
        config: &Config,
        args: &CliArgs,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>, SupervisorError> {
        let selected = config.selected_networks(args);
        tracing::info!(
            "selected networks: {}",
            selected
                .iter()
                .map(Network::name)
                .collect::<Vec<_>>()
                .join(", ")
        );

        let chains = eligible_chains(config, &selected);
        let attribution = Arc::new(AttributionClient::new(config.api_key(), config.api_url())?);
        let store = Arc::new(Store::open(config.db_path()).await?);

        let stats: HashMap<Network, Arc<ChainStats>> = chains
            .iter()
            .map(|(network, _)| (*network, Arc::new(ChainStats::new(config.batch_size()))))
            .collect();

        let supervisor = Arc::new(Self {
            chains,
            attribution,
            store,
            stats,
            tasks: Mutex::new(HashMap::new()),
            tracker: TaskTracker::new(),
            cancel,
            check_interval: config.check_interval(),
            batch_size: config.batch_size(),
        });

        let mut started = 0usize;
        for (network, endpoints) in supervisor.chains.clone() {
            match supervisor.launch_monitor(network, endpoints).await {
                Ok(()) => started += 1,
                Err(error) => {
                    tracing::error!("[{network}] failed to start monitor: {error}");
                }
            }
        }
        if started == 0 {
            return Err(SupervisorError::NoMonitors);
        }

        tracing::info!(
            "monitoring {started} chain(s), check interval {}s, enrichment pool 10 per chain",
            supervisor.check_interval.as_secs()
        );
        Ok(supervisor)
    }

    /// Connect a monitor for one chain and spawn its loop.
    async fn launch_monitor(
        &self,
        network: Network,
        endpoints: Vec<Url>,
    ) -> Result<(), crate::monitor::MonitorError> {
        let stats = self
            .stats
            .get(&network)
            .cloned()
            .unwrap_or_else(|| Arc::new(ChainStats::new(self.batch_size)));
        let monitor = ChainMonitor::connect(
            network,
            endpoints,
            Arc::clone(&self.attribution),
            Arc::clone(&self.store),
            stats,
            self.cancel.clone(),
            self.check_interval,
            self.batch_size,
        )
        .await?;
        let handle = self.tracker.spawn(monitor.run());
        self.tasks.lock().await.insert(network, handle);
        tracing::info!("[{network}] monitor started");
        Ok(())
    }

    /// Run until cancellation, keeping monitors alive, then shut down.
    pub async fn run(self: Arc<Self>) {
        let health = tokio::spawn(Arc::clone(&self).health_loop());
        self.cancel.cancelled().await;
        let _ = health.await;
        self.shutdown().await;
    }

    /// Every 30 seconds, restart any monitor whose task has finished.
    async fn health_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(HEALTH_CHECK_INTERVAL) => {}
            }
            for (network, endpoints) in self.chains.clone() {
                let finished = {
                    let tasks = self.tasks.lock().await;
                    tasks.get(&network).map(|h| h.is_finished()).unwrap_or(true)
                };
                if !finished || self.cancel.is_cancelled() {
                    continue;
                }
                tracing::warn!("[{network}] monitor died unexpectedly, restarting");
                if let Err(error) = self.launch_monitor(network, endpoints).await {
                    tracing::error!("[{network}] restart failed: {error}");
                }
            }
            for (network, snapshot) in self.stats_snapshot() {
                tracing::debug!(
                    "[{network}] status={} block={} head={} behind={} found={} entity={} errors={}",
                    snapshot.status,
                    snapshot.current_block,
                    snapshot.head,
                    snapshot.behind,
                    snapshot.found,
                    snapshot.with_entity,
                    snapshot.errors
                );
            }
        }
    }

    /// Join monitors with a grace period, then flush and close the shared
    /// components. In-flight work past the grace period is abandoned; the
    /// idempotent store absorbs whatever it half-finished.
    async fn shutdown(&self) {
        tracing::info!("stopping all monitors");
        self.tracker.close();
        let tasks: Vec<(Network, JoinHandle<()>)> =
            self.tasks.lock().await.drain().collect();
        for (network, handle) in tasks {
            if tokio::time::timeout(JOIN_TIMEOUT, handle).await.is_err() {
                tracing::warn!("[{network}] monitor did not stop within {JOIN_TIMEOUT:?}");
            }
        }
        self.store.close().await;
        let cache = self.attribution.cache_stats();
        tracing::info!("attribution cache held {} entr(y/ies)", cache.entries);
        tracing::info!("multi-chain monitor stopped");
    }

    /// Per-chain counters for an external status renderer.
    pub fn stats_snapshot(&self) -> Vec<(Network, ChainStatsSnapshot)> {
        let mut snapshot: Vec<(Network, ChainStatsSnapshot)> = self
            .stats
            .iter()
            .map(|(network, stats)| (*network, stats.snapshot()))
            .collect();
        snapshot.sort_by_key(|(network, _)| network.name());
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eligibility_skips_non_evm_and_endpointless_chains() {
        let config: Config = serde_json::from_str("{}").expect("config");
        let selected = [
            Network::Ethereum,
            Network::Bitcoin,
            Network::Solana,
            Network::Base,
            Network::Ton,
        ];
        let chains = eligible_chains(&config, &selected);
        let names: Vec<_> = chains.iter().map(|(n, _)| n.name()).collect();
        assert_eq!(names, ["ethereum", "base"]);
        assert!(chains.iter().all(|(_, endpoints)| !endpoints.is_empty()));
    }

    #[test]
    fn eligibility_honors_configured_empty_endpoint_list() {
        let config: Config = serde_json::from_str(
            r#"{ "arkham_api_key": "k", "rpc_endpoints": { "ethereum": [] } }"#,
        )
        .expect("config");
        let chains = eligible_chains(&config, &[Network::Ethereum, Network::Base]);
        let names: Vec<_> = chains.iter().map(|(n, _)| n.name()).collect();
        assert_eq!(names, ["base"]);
    }
}
