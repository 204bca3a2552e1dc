//! Multi-chain smart-contract deployment indexer.
//!
//! For each configured EVM network the indexer continuously advances a
//! per-chain cursor through new blocks, discovers every contract created in
//! them (direct deployments and factory-style internal `CREATE`/`CREATE2`),
//! classifies the resulting bytecode, attributes the deployer through an
//! external intelligence API, and persists a de-duplicated record of each
//! discovery together with the monitoring cursor.
//!
//! # Pipeline
//!
//! ```text
//! supervisor ─ one monitor per chain
//!     monitor ─ head check → adaptive batch → extractor
//!         extractor ─ direct + trace-based discovery (with fallbacks)
//!         enrichment ─ classifier ∥ attribution, bounded fan-out
//!     store ─ batch writer, idempotent inserts, durable cursor
//! ```
//!
//! # Modules
//!
//! - [`config`] — CLI arguments, environment variables, optional JSON file.
//! - [`networks`] — the chain registry: names, POA/EVM flags, endpoints.
//! - [`types`] — tolerant JSON-RPC wire types and domain records.
//! - [`rpc`] — typed JSON-RPC surface with endpoint failover.
//! - [`attribution`] — rate-limited, cached entity attribution client.
//! - [`extractor`] — per-block deployment discovery.
//! - [`classifier`] — bytecode classification and metadata enrichment.
//! - [`store`] — SQLite persistence: batch writer, cursor, queries.
//! - [`monitor`] — the per-chain loop with adaptive catch-up batching.
//! - [`supervisor`] — lifecycle, health checks, stats, shutdown.
//! - [`telemetry`] — tracing subscriber setup (file sink, optional OTLP).
//! - [`sig_down`] — SIGTERM/SIGINT to cancellation token.

pub mod attribution;
pub mod classifier;
pub mod config;
pub mod extractor;
pub mod monitor;
pub mod networks;
pub mod rpc;
pub mod sig_down;
pub mod store;
pub mod supervisor;
pub mod telemetry;
pub mod types;
