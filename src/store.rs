//! Persistence store: idempotent batched writes and the durable per-chain
//! cursor, on SQLite via sqlx.
//!
//! Discovered contracts are enqueued without blocking; a single background
//! writer drains the queue into multi-row `INSERT ... ON CONFLICT DO
//! NOTHING` statements, flushing on size or time. The unique index on
//! `(contract_address, network)` is the idempotency mechanism: replays,
//! restarts, and overlapping batches all collapse into the same rows.
//! Cursor writes are synchronous and guarded so they only ever advance.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{FromRow, QueryBuilder};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use crate::networks::Network;
use crate::types::{Deployment, hex_address, hex_hash};

/// Flush once this many records are pending.
const MAX_BATCH: usize = 10;
/// Or once this much time has passed with a non-empty batch.
const FLUSH_INTERVAL: Duration = Duration::from_millis(500);
/// How long `close` waits for the writer to drain.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS contracts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    contract_address TEXT NOT NULL,
    network TEXT NOT NULL,
    deployer_address TEXT NOT NULL,
    entity_name TEXT,
    entity_id TEXT,
    block_number INTEGER NOT NULL,
    transaction_hash TEXT NOT NULL,
    contract_type TEXT,
    contract_info TEXT,
    factory_address TEXT,
    deployment_type TEXT,
    timestamp DATETIME DEFAULT CURRENT_TIMESTAMP,
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
    UNIQUE(contract_address, network)
);
CREATE TABLE IF NOT EXISTS monitoring_state (
    network TEXT PRIMARY KEY,
    last_processed_block INTEGER NOT NULL,
    updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
);
CREATE INDEX IF NOT EXISTS idx_deployer ON contracts(deployer_address);
CREATE INDEX IF NOT EXISTS idx_entity ON contracts(entity_name);
CREATE INDEX IF NOT EXISTS idx_network ON contracts(network);
CREATE INDEX IF NOT EXISTS idx_contract_type ON contracts(contract_type);
"#;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// A fully enriched deployment, ready for the `contracts` table.
#[derive(Debug, Clone)]
pub struct ContractRecord {
    pub deployment: Deployment,
    pub entity_name: Option<String>,
    pub entity_id: Option<String>,
    pub contract_type: Option<String>,
    /// Classification profile as a JSON blob.
    pub contract_info: Option<String>,
}

/// A row read back from the `contracts` table.
#[derive(Debug, Clone, FromRow)]
pub struct StoredContract {
    pub id: i64,
    pub contract_address: String,
    pub network: String,
    pub deployer_address: String,
    pub entity_name: Option<String>,
    pub entity_id: Option<String>,
    pub block_number: i64,
    pub transaction_hash: String,
    pub contract_type: Option<String>,
    pub contract_info: Option<String>,
    pub factory_address: Option<String>,
    pub deployment_type: Option<String>,
}

/// Per-chain aggregate numbers for the status view.
#[derive(Debug, Clone, FromRow)]
pub struct NetworkSummary {
    pub network: String,
    pub total_contracts: i64,
    pub entity_contracts: i64,
    pub latest_block: Option<i64>,
}

/// Writer throughput counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    pub queued: u64,
    pub written: u64,
    pub failed: u64,
}

#[derive(Default)]
struct WriterCounters {
    queued: AtomicU64,
    written: AtomicU64,
    failed: AtomicU64,
}

enum WriteOp {
    Record(Box<ContractRecord>),
    Stop,
}

/// The persistence layer: one pool, one background batch writer.
pub struct Store {
    pool: SqlitePool,
    queue: mpsc::UnboundedSender<WriteOp>,
    writer: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<WriterCounters>,
}

impl Store {
    /// Open (creating if missing) the database at `path` and start the
    /// batch writer.
    pub async fn open(path: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(path)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    /// An in-memory store, used by tests. A single connection keeps every
    /// handle on the same memory database.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        let counters = Arc::new(WriterCounters::default());
        let (queue, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(writer_loop(pool.clone(), rx, Arc::clone(&counters)));
        tracing::info!("database ready, batch writer started");
        Ok(Self {
            pool,
            queue,
            writer: Mutex::new(Some(writer)),
            counters,
        })
    }

    /// Enqueue a record for the batch writer. Returns immediately; the write
    /// becomes durable at the next flush. Duplicates are dropped by the
    /// unique index, not here.
    pub fn queue_deployment(&self, record: ContractRecord) {
        let network = record.deployment.network;
        let address = hex_address(&record.deployment.contract_address);
        if self.queue.send(WriteOp::Record(Box::new(record))).is_ok() {
            self.counters.queued.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("[{network}] queued contract {address}");
        } else {
            tracing::error!("[{network}] writer gone, dropping contract {address}");
        }
    }

    /// Durably advance the per-chain cursor. Regressions are ignored at the
    /// SQL level so the cursor is monotonic even across racing writers.
    pub async fn set_cursor(&self, network: Network, block_number: u64) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO monitoring_state (network, last_processed_block, updated_at)
            VALUES (?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(network) DO UPDATE SET
                last_processed_block = excluded.last_processed_block,
                updated_at = CURRENT_TIMESTAMP
            WHERE excluded.last_processed_block > monitoring_state.last_processed_block
            "#,
        )
        .bind(network.name())
        .bind(block_number as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The last fully processed block for a chain, if any run got that far.
    pub async fn last_cursor(&self, network: Network) -> Result<Option<u64>, StoreError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT last_processed_block FROM monitoring_state WHERE network = ?")
                .bind(network.name())
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(block,)| block as u64))
    }

    /// Contracts deployed by a named entity, newest block first.
    pub async fn contracts_by_entity(
        &self,
        entity_name: &str,
        network: Option<Network>,
    ) -> Result<Vec<StoredContract>, StoreError> {
        self.filtered_contracts("entity_name = ?", entity_name, network)
            .await
    }

    /// Contracts created through a given factory contract.
    pub async fn contracts_by_factory(
        &self,
        factory_address: &str,
        network: Option<Network>,
    ) -> Result<Vec<StoredContract>, StoreError> {
        self.filtered_contracts("factory_address = ?", factory_address, network)
            .await
    }

    /// Contracts by deployment kind (`direct` or `factory`).
    pub async fn contracts_by_kind(
        &self,
        kind: &str,
        network: Option<Network>,
    ) -> Result<Vec<StoredContract>, StoreError> {
        self.filtered_contracts("deployment_type = ?", kind, network)
            .await
    }

    /// Every contract attributed to a known entity.
    pub async fn contracts_with_entity(
        &self,
        network: Option<Network>,
    ) -> Result<Vec<StoredContract>, StoreError> {
        let rows = match network {
            Some(network) => {
                sqlx::query_as(
                    "SELECT * FROM contracts WHERE entity_name IS NOT NULL AND network = ? \
                     ORDER BY block_number DESC",
                )
                .bind(network.name())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    "SELECT * FROM contracts WHERE entity_name IS NOT NULL \
                     ORDER BY block_number DESC",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows)
    }

    async fn filtered_contracts(
        &self,
        predicate: &str,
        value: &str,
        network: Option<Network>,
    ) -> Result<Vec<StoredContract>, StoreError> {
        let rows = match network {
            Some(network) => {
                let sql = format!(
                    "SELECT * FROM contracts WHERE {predicate} AND network = ? \
                     ORDER BY block_number DESC"
                );
                sqlx::query_as(&sql)
                    .bind(value)
                    .bind(network.name())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let sql =
                    format!("SELECT * FROM contracts WHERE {predicate} ORDER BY block_number DESC");
                sqlx::query_as(&sql).bind(value).fetch_all(&self.pool).await?
            }
        };
        Ok(rows)
    }

    /// Per-chain totals for the status view.
    pub async fn network_summaries(&self) -> Result<Vec<NetworkSummary>, StoreError> {
        let rows = sqlx::query_as(
            r#"
            SELECT
                network,
                COUNT(*) AS total_contracts,
                COUNT(CASE WHEN entity_name IS NOT NULL THEN 1 END) AS entity_contracts,
                MAX(block_number) AS latest_block
            FROM contracts
            GROUP BY network
            ORDER BY network
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub fn stats(&self) -> WriterStats {
        WriterStats {
            queued: self.counters.queued.load(Ordering::Relaxed),
            written: self.counters.written.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Drain the queue, flush, and stop the writer.
    pub async fn close(&self) {
        let _ = self.queue.send(WriteOp::Stop);
        let handle = self.writer.lock().await.take();
        if let Some(handle) = handle {
            if tokio::time::timeout(CLOSE_TIMEOUT, handle).await.is_err() {
                tracing::warn!("batch writer did not stop within {CLOSE_TIMEOUT:?}");
            }
        }
        let stats = self.stats();
        tracing::info!(
            "store closed: {} queued, {} written, {} failed",
            stats.queued,
            stats.written,
            stats.failed
        );
    }
}

/// The single consumer of the write queue. Batches up to [`MAX_BATCH`]
/// records or [`FLUSH_INTERVAL`], whichever comes first.
async fn writer_loop(
    pool: SqlitePool,
    mut queue: mpsc::UnboundedReceiver<WriteOp>,
    counters: Arc<WriterCounters>,
) {
    let mut batch: Vec<ContractRecord> = Vec::new();
    loop {
        match tokio::time::timeout(FLUSH_INTERVAL, queue.recv()).await {
            Ok(Some(WriteOp::Record(record))) => {
                batch.push(*record);
                if batch.len() >= MAX_BATCH {
                    flush_batch(&pool, std::mem::take(&mut batch), &counters).await;
                }
            }
            Ok(Some(WriteOp::Stop)) | Ok(None) => {
                // Drain whatever was enqueued before the stop signal.
                while let Ok(op) = queue.try_recv() {
                    if let WriteOp::Record(record) = op {
                        batch.push(*record);
                    }
                }
                flush_batch(&pool, std::mem::take(&mut batch), &counters).await;
                break;
            }
            Err(_) => {
                if !batch.is_empty() {
                    flush_batch(&pool, std::mem::take(&mut batch), &counters).await;
                }
            }
        }
    }
    tracing::info!("batch writer stopped");
}

/// One multi-row insert; conflicts on the unique key are silently dropped.
async fn flush_batch(pool: &SqlitePool, batch: Vec<ContractRecord>, counters: &WriterCounters) {
    if batch.is_empty() {
        return;
    }
    let size = batch.len();
    let mut builder = QueryBuilder::new(
        "INSERT INTO contracts (contract_address, network, deployer_address, entity_name, \
         entity_id, block_number, transaction_hash, contract_type, contract_info, \
         factory_address, deployment_type) ",
    );
    builder.push_values(batch.iter(), |mut row, record| {
        let deployment = &record.deployment;
        row.push_bind(hex_address(&deployment.contract_address))
            .push_bind(deployment.network.name())
            .push_bind(hex_address(&deployment.deployer_address))
            .push_bind(record.entity_name.as_deref())
            .push_bind(record.entity_id.as_deref())
            .push_bind(deployment.block_number as i64)
            .push_bind(hex_hash(&deployment.transaction_hash))
            .push_bind(record.contract_type.as_deref())
            .push_bind(record.contract_info.as_deref())
            .push_bind(deployment.factory_address.as_ref().map(hex_address))
            .push_bind(deployment.kind.as_str());
    });
    builder.push(" ON CONFLICT(contract_address, network) DO NOTHING");
    match builder.build().execute(pool).await {
        Ok(result) => {
            counters
                .written
                .fetch_add(result.rows_affected(), Ordering::Relaxed);
            tracing::debug!(
                "batch flush: {}/{size} record(s) written",
                result.rows_affected()
            );
        }
        Err(error) => {
            counters.failed.fetch_add(size as u64, Ordering::Relaxed);
            tracing::error!("batch flush of {size} record(s) failed: {error}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DeploymentKind;
    use alloy_primitives::{Address, B256};

    fn record(contract: u8, network: Network, entity: Option<&str>) -> ContractRecord {
        ContractRecord {
            deployment: Deployment {
                contract_address: Address::repeat_byte(contract),
                deployer_address: Address::repeat_byte(0xaa),
                transaction_hash: B256::repeat_byte(contract),
                block_number: 100 + contract as u64,
                network,
                kind: DeploymentKind::Direct,
                factory_address: None,
                gas_used: 21_000,
                status: 1,
            },
            entity_name: entity.map(str::to_owned),
            entity_id: entity.map(|e| format!("{e}-id")),
            contract_type: Some("Unknown".to_owned()),
            contract_info: None,
        }
    }

    #[tokio::test]
    async fn duplicate_records_collapse_into_one_row() {
        let store = Store::open_in_memory().await.expect("store");
        let counters = WriterCounters::default();
        let first = vec![record(0x01, Network::Ethereum, None)];
        let replay = first.clone();

        flush_batch(&store.pool, first, &counters).await;
        assert_eq!(counters.written.load(Ordering::Relaxed), 1);

        // Replaying the same block range writes nothing new.
        flush_batch(&store.pool, replay, &counters).await;
        assert_eq!(counters.written.load(Ordering::Relaxed), 1);

        let rows = store
            .contracts_by_kind("direct", None)
            .await
            .expect("query");
        assert_eq!(rows.len(), 1);
        store.close().await;
    }

    #[tokio::test]
    async fn same_address_on_two_chains_is_two_rows() {
        let store = Store::open_in_memory().await.expect("store");
        store.queue_deployment(record(0x02, Network::Ethereum, None));
        store.queue_deployment(record(0x02, Network::Base, None));
        store.close().await;

        let rows = store.contracts_by_kind("direct", None).await.expect("query");
        assert_eq!(rows.len(), 2);
        let eth_only = store
            .contracts_by_kind("direct", Some(Network::Ethereum))
            .await
            .expect("query");
        assert_eq!(eth_only.len(), 1);
        assert_eq!(eth_only[0].network, "ethereum");
    }

    #[tokio::test]
    async fn cursor_never_rewinds() {
        let store = Store::open_in_memory().await.expect("store");
        assert_eq!(store.last_cursor(Network::Ethereum).await.expect("read"), None);

        store.set_cursor(Network::Ethereum, 100).await.expect("set");
        store.set_cursor(Network::Ethereum, 200).await.expect("set");
        store.set_cursor(Network::Ethereum, 150).await.expect("set");
        assert_eq!(
            store.last_cursor(Network::Ethereum).await.expect("read"),
            Some(200)
        );

        // Cursors are per chain.
        store.set_cursor(Network::Base, 5).await.expect("set");
        assert_eq!(store.last_cursor(Network::Base).await.expect("read"), Some(5));
        store.close().await;
    }

    #[tokio::test]
    async fn entity_and_factory_queries_filter_rows() {
        let store = Store::open_in_memory().await.expect("store");
        let mut factory_made = record(0x03, Network::Ethereum, Some("Coinbase"));
        factory_made.deployment.kind = DeploymentKind::Factory;
        factory_made.deployment.factory_address = Some(Address::repeat_byte(0xf0));
        store.queue_deployment(factory_made);
        store.queue_deployment(record(0x04, Network::Ethereum, None));
        store.close().await;

        let by_entity = store
            .contracts_by_entity("Coinbase", None)
            .await
            .expect("query");
        assert_eq!(by_entity.len(), 1);
        assert_eq!(by_entity[0].entity_id.as_deref(), Some("Coinbase-id"));

        let by_factory = store
            .contracts_by_factory(&hex_address(&Address::repeat_byte(0xf0)), None)
            .await
            .expect("query");
        assert_eq!(by_factory.len(), 1);
        assert_eq!(by_factory[0].deployment_type.as_deref(), Some("factory"));

        let with_entity = store.contracts_with_entity(None).await.expect("query");
        assert_eq!(with_entity.len(), 1);

        let summaries = store.network_summaries().await.expect("query");
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].network, "ethereum");
        assert_eq!(summaries[0].total_contracts, 2);
        assert_eq!(summaries[0].entity_contracts, 1);
        assert_eq!(summaries[0].latest_block, Some(104));
    }

    #[tokio::test]
    async fn close_flushes_pending_records() {
        let store = Store::open_in_memory().await.expect("store");
        for i in 0..25u8 {
            store.queue_deployment(record(i, Network::Ethereum, None));
        }
        store.close().await;
        let stats = store.stats();
        assert_eq!(stats.queued, 25);
        assert_eq!(stats.written, 25);
        assert_eq!(stats.failed, 0);
    }

    #[tokio::test]
    async fn on_disk_store_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("contracts.db");
        let path = path.to_str().expect("utf-8 path");

        let store = Store::open(path).await.expect("store");
        store.queue_deployment(record(0x05, Network::Ethereum, None));
        store.set_cursor(Network::Ethereum, 105).await.expect("set");
        store.close().await;
        drop(store);

        // Restarting with the store preserved and no chain activity yields
        // zero new rows and the same cursor.
        let reopened = Store::open(path).await.expect("store");
        reopened.queue_deployment(record(0x05, Network::Ethereum, None));
        reopened.close().await;
        assert_eq!(
            reopened.last_cursor(Network::Ethereum).await.expect("read"),
            Some(105)
        );
        let rows = reopened
            .contracts_by_kind("direct", None)
            .await
            .expect("query");
        assert_eq!(rows.len(), 1);
    }
}
