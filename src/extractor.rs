//! Deployment extractor: given a block, find every contract created in it.
//!
//! Discovery methods in priority order:
//! 1. direct deployments (`to == null` plus a receipt `contractAddress`),
//! 2. factory deployments from a block-level flat trace,
//! 3. per-transaction flat trace,
//! 4. geth call-tracer tree,
//! 5. log-based heuristic (emitting address with fresh code).
//!
//! A later method is only consulted for a transaction when the earlier ones
//! produced no trace data for it. At most one record is emitted per
//! `(transaction, contract address)` pair; ordering across transactions is
//! not guaranteed.

use alloy_primitives::{Address, B256};
use futures_util::StreamExt;
use futures_util::stream;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::networks::Network;
use crate::rpc::{RpcAdapter, RpcError};
use crate::types::{
    Block, CallFrame, Deployment, DeploymentKind, FlatTrace, Receipt, Transaction, hex_address,
    hex_hash,
};

/// Concurrent receipt/trace fetches within one block.
const TX_CONCURRENCY: usize = 10;
/// Concurrent blocks within a range scan.
const BLOCK_CONCURRENCY: usize = 5;

/// Result of scanning a block range: discoveries plus the blocks that could
/// not be read at all.
#[derive(Debug, Default)]
pub struct RangeScan {
    pub deployments: Vec<Deployment>,
    pub failed_blocks: Vec<u64>,
}

/// Extracts deployments for one chain through a shared RPC adapter.
pub struct DeploymentExtractor {
    rpc: Arc<RpcAdapter>,
}

impl DeploymentExtractor {
    pub fn new(rpc: Arc<RpcAdapter>) -> Self {
        Self { rpc }
    }

    fn network(&self) -> Network {
        self.rpc.network()
    }

    /// Scan `[start..=end]`, processing blocks concurrently. Block-level
    /// failures do not abort the scan; they are reported in the result so
    /// the caller can refuse to commit the batch.
    pub async fn deployments_in_range(&self, start: u64, end: u64) -> RangeScan {
        let mut scan = RangeScan::default();
        let mut results = stream::iter(start..=end)
            .map(|number| Box::pin(async move { (number, self.deployments_in_block(number).await) }))
            .buffer_unordered(BLOCK_CONCURRENCY);
        while let Some((number, result)) = results.next().await {
            match result {
                Ok(mut deployments) => scan.deployments.append(&mut deployments),
                Err(error) => {
                    tracing::error!("[{}] block {number} failed: {error}", self.network());
                    scan.failed_blocks.push(number);
                }
            }
        }
        scan.deployments.sort_by_key(|d| d.block_number);
        scan.failed_blocks.sort_unstable();
        scan
    }

    /// Find every deployment in one block.
    ///
    /// Fails only when the block itself cannot be fetched; individual
    /// transaction trouble is logged and skipped.
    pub async fn deployments_in_block(&self, number: u64) -> Result<Vec<Deployment>, RpcError> {
        let block = self.rpc.get_block_with_txs(number).await?;
        if block.transactions.is_empty() {
            return Ok(Vec::new());
        }

        let block_traces = self.block_traces(number).await;
        let receipts = self.receipts_for(&block).await;

        let jobs = block.transactions.iter().filter_map(|tx| {
            let receipt = receipts.get(&tx.hash)?;
            let tx_traces = block_traces
                .as_ref()
                .map(|by_tx| by_tx.get(&tx.hash).cloned().unwrap_or_default());
            Some((tx, receipt, tx_traces))
        });

        let per_tx: Vec<Vec<Deployment>> = stream::iter(jobs)
            .map(|(tx, receipt, tx_traces)| {
                Box::pin(self.transaction_deployments(tx, receipt, number, tx_traces))
            })
            .buffer_unordered(TX_CONCURRENCY)
            .collect()
            .await;

        let mut seen: HashSet<(B256, Address)> = HashSet::new();
        let mut deployments = Vec::new();
        for deployment in per_tx.into_iter().flatten() {
            if seen.insert((deployment.transaction_hash, deployment.contract_address)) {
                deployments.push(deployment);
            }
        }
        Ok(deployments)
    }

    /// One `trace_block` call covering the whole block, grouped per
    /// transaction. `None` means block-level tracing was not usable.
    async fn block_traces(&self, number: u64) -> Option<HashMap<B256, Vec<FlatTrace>>> {
        match self.rpc.trace_block(number).await {
            Ok(traces) => {
                let mut by_tx: HashMap<B256, Vec<FlatTrace>> = HashMap::new();
                for trace in traces {
                    if let Some(tx_hash) = trace.transaction_hash {
                        by_tx.entry(tx_hash).or_default().push(trace);
                    }
                }
                tracing::debug!(
                    "[{}] trace_block({number}) covered {} transaction(s)",
                    self.network(),
                    by_tx.len()
                );
                Some(by_tx)
            }
            Err(error) => {
                tracing::debug!(
                    "[{}] trace_block unavailable for block {number}: {error}",
                    self.network()
                );
                None
            }
        }
    }

    /// Fetch receipts for every transaction in the block, concurrently.
    /// Transactions without a retrievable receipt are dropped.
    async fn receipts_for(&self, block: &Block) -> HashMap<B256, Receipt> {
        let fetched: Vec<Option<(B256, Receipt)>> = stream::iter(&block.transactions)
            .map(|tx| {
                let hash = tx.hash;
                Box::pin(async move {
                    match self.rpc.get_receipt(hash).await {
                        Ok(receipt) => Some((hash, receipt)),
                        Err(error) => {
                            tracing::debug!(
                                "[{}] no receipt for {}: {error}",
                                self.network(),
                                hex_hash(&hash)
                            );
                            None
                        }
                    }
                })
            })
            .buffer_unordered(TX_CONCURRENCY)
            .collect()
            .await;
        fetched.into_iter().flatten().collect()
    }

    /// All deployments caused by one transaction.
    async fn transaction_deployments(
        &self,
        tx: &Transaction,
        receipt: &Receipt,
        number: u64,
        tx_traces: Option<Vec<FlatTrace>>,
    ) -> Vec<Deployment> {
        if let Some(deployment) = direct_deployment(tx, receipt, number, self.network()) {
            tracing::info!(
                "[{}] direct deployment {} by {} in block {number}",
                self.network(),
                hex_address(&deployment.contract_address),
                hex_address(&deployment.deployer_address)
            );
            return vec![deployment];
        }
        if tx.to.is_none() {
            // Creation transaction without a contract address: failed deploy.
            return Vec::new();
        }

        // Block-level traces observed this transaction: they are the truth.
        if let Some(traces) = tx_traces {
            if !traces.is_empty() {
                return creates_from_flat_traces(&traces, tx, receipt, number, self.network());
            }
        }
        self.factory_deployments_fallback(tx, receipt, number).await
    }

    /// Per-transaction fallback chain: flat trace, then call tracer, then
    /// the log heuristic. Each failure downgrades to the next method.
    async fn factory_deployments_fallback(
        &self,
        tx: &Transaction,
        receipt: &Receipt,
        number: u64,
    ) -> Vec<Deployment> {
        match self.rpc.trace_transaction(tx.hash).await {
            Ok(traces) => {
                return creates_from_flat_traces(&traces, tx, receipt, number, self.network());
            }
            Err(error) => {
                tracing::debug!(
                    "[{}] trace_transaction failed for {}: {error}",
                    self.network(),
                    hex_hash(&tx.hash)
                );
            }
        }
        match self.rpc.call_trace(tx.hash).await {
            Ok(root) => {
                return creates_in_call_tree(&root, tx, receipt, number, self.network());
            }
            Err(error) => {
                tracing::debug!(
                    "[{}] call tracer failed for {}: {error}",
                    self.network(),
                    hex_hash(&tx.hash)
                );
            }
        }
        self.creates_from_logs(tx, receipt, number).await
    }

    /// Last-resort discovery: any log-emitting address that is not the
    /// recipient, not a system address, has code now, and had none in the
    /// previous block is taken as freshly created. When the historical code
    /// check cannot run the address is assumed new.
    async fn creates_from_logs(
        &self,
        tx: &Transaction,
        receipt: &Receipt,
        number: u64,
    ) -> Vec<Deployment> {
        let mut deployments = Vec::new();
        let mut seen: HashSet<Address> = HashSet::new();
        for log in &receipt.logs {
            let address = log.address;
            if !seen.insert(address) || Some(address) == tx.to || is_system_address(&address) {
                continue;
            }
            match self.rpc.get_code(address, None).await {
                Ok(code) if !code.is_empty() => {}
                Ok(_) => continue,
                Err(error) => {
                    tracing::debug!(
                        "[{}] code check failed for {}: {error}",
                        self.network(),
                        hex_address(&address)
                    );
                    continue;
                }
            }
            if number > 0 {
                match self.rpc.get_code(address, Some(number - 1)).await {
                    Ok(previous) if !previous.is_empty() => continue,
                    Ok(_) => {}
                    // Node without historical state: assume the code is new.
                    Err(error) => {
                        tracing::debug!(
                            "[{}] historical code check failed for {}: {error}",
                            self.network(),
                            hex_address(&address)
                        );
                    }
                }
            }
            tracing::info!(
                "[{}] factory deployment {} inferred from logs of {}",
                self.network(),
                hex_address(&address),
                hex_hash(&tx.hash)
            );
            deployments.push(Deployment {
                contract_address: address,
                deployer_address: tx.from,
                transaction_hash: tx.hash,
                block_number: number,
                network: self.network(),
                kind: DeploymentKind::Factory,
                factory_address: tx.to,
                gas_used: receipt.gas_used.to::<u64>(),
                status: receipt.status_code(),
            });
        }
        deployments
    }
}

/// Method 1: a transaction with no recipient whose receipt names the created
/// contract.
fn direct_deployment(
    tx: &Transaction,
    receipt: &Receipt,
    number: u64,
    network: Network,
) -> Option<Deployment> {
    if tx.to.is_some() {
        return None;
    }
    let contract_address = receipt.contract_address?;
    Some(Deployment {
        contract_address,
        deployer_address: tx.from,
        transaction_hash: tx.hash,
        block_number: number,
        network,
        kind: DeploymentKind::Direct,
        factory_address: None,
        gas_used: receipt.gas_used.to::<u64>(),
        status: receipt.status_code(),
    })
}

/// Methods 2 and 3: `create` entries of a Parity-style flat trace.
fn creates_from_flat_traces(
    traces: &[FlatTrace],
    tx: &Transaction,
    receipt: &Receipt,
    number: u64,
    network: Network,
) -> Vec<Deployment> {
    let mut deployments = Vec::new();
    for trace in traces {
        if !trace.is_create() {
            continue;
        }
        let Some(result) = &trace.result else { continue };
        let Some(contract_address) = result.address else { continue };
        let Some(deployer_address) = trace.action.from else { continue };
        tracing::info!(
            "[{network}] factory deployment {} created by {} via {}",
            hex_address(&contract_address),
            hex_address(&deployer_address),
            tx.to.map(|f| hex_address(&f)).unwrap_or_default()
        );
        deployments.push(Deployment {
            contract_address,
            deployer_address,
            transaction_hash: tx.hash,
            block_number: number,
            network,
            kind: DeploymentKind::Factory,
            factory_address: tx.to,
            gas_used: result.gas_used.map(|g| g.to::<u64>()).unwrap_or_default(),
            status: receipt.status_code(),
        });
    }
    deployments
}

/// Method 4: walk a call-tracer tree with an explicit stack and collect
/// every `CREATE`/`CREATE2` node. The factory of a nested create is the
/// enclosing call's `to`; at the root it falls back to the transaction
/// recipient.
fn creates_in_call_tree(
    root: &CallFrame,
    tx: &Transaction,
    receipt: &Receipt,
    number: u64,
    network: Network,
) -> Vec<Deployment> {
    let mut deployments = Vec::new();
    let mut stack: Vec<(&CallFrame, Option<Address>)> = vec![(root, None)];
    while let Some((frame, parent)) = stack.pop() {
        if frame.is_create() && frame.error.is_none() {
            if let (Some(contract_address), Some(deployer_address)) = (frame.to, frame.from) {
                deployments.push(Deployment {
                    contract_address,
                    deployer_address,
                    transaction_hash: tx.hash,
                    block_number: number,
                    network,
                    kind: DeploymentKind::Factory,
                    factory_address: parent.or(tx.to),
                    gas_used: frame.gas_used.map(|g| g.to::<u64>()).unwrap_or_default(),
                    status: receipt.status_code(),
                });
            }
        }
        for call in &frame.calls {
            stack.push((call, frame.to));
        }
    }
    deployments
}

/// The zero address and the precompile range `0x01..=0x13` never count as
/// deployments.
fn is_system_address(address: &Address) -> bool {
    let bytes = address.as_slice();
    bytes[..19].iter().all(|b| *b == 0) && bytes[19] <= 0x13
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{U64, U256};
    use serde_json::json;

    fn address(byte: u8) -> Address {
        Address::repeat_byte(byte)
    }

    fn tx_hash(byte: u8) -> B256 {
        B256::repeat_byte(byte)
    }

    fn receipt_with(contract: Option<Address>, gas: u64) -> Receipt {
        Receipt {
            transaction_hash: tx_hash(0xbb),
            contract_address: contract,
            gas_used: U256::from(gas),
            status: Some(U64::from(1)),
            logs: Vec::new(),
        }
    }

    #[test]
    fn direct_deployment_from_creation_receipt() {
        let tx = Transaction {
            hash: tx_hash(0xbb),
            from: address(0xaa),
            to: None,
        };
        let receipt = receipt_with(Some(address(0xcc)), 500_000);
        let deployment = direct_deployment(&tx, &receipt, 100, Network::Ethereum)
            .expect("direct deployment found");
        assert_eq!(deployment.kind, DeploymentKind::Direct);
        assert_eq!(deployment.contract_address, address(0xcc));
        assert_eq!(deployment.deployer_address, address(0xaa));
        assert_eq!(deployment.factory_address, None);
        assert_eq!(deployment.block_number, 100);
        assert_eq!(deployment.gas_used, 500_000);
    }

    #[test]
    fn call_with_recipient_is_never_direct() {
        let tx = Transaction {
            hash: tx_hash(0xbb),
            from: address(0xaa),
            to: Some(address(0xff)),
        };
        let receipt = receipt_with(Some(address(0xcc)), 21_000);
        assert!(direct_deployment(&tx, &receipt, 100, Network::Ethereum).is_none());
    }

    #[test]
    fn flat_trace_create_yields_factory_deployment() {
        let factory = address(0xf0);
        let tx = Transaction {
            hash: tx_hash(0x77),
            from: address(0xaa),
            to: Some(factory),
        };
        let receipt = receipt_with(None, 90_000);
        let traces: Vec<FlatTrace> = serde_json::from_value(json!([
            {
                "type": "call",
                "action": { "from": format!("{:#x}", address(0xaa)) }
            },
            {
                "type": "create",
                "action": { "from": format!("{:#x}", factory) },
                "result": {
                    "address": format!("{:#x}", address(0x99)),
                    "gasUsed": "0x5208"
                }
            }
        ]))
        .expect("traces decode");
        let deployments =
            creates_from_flat_traces(&traces, &tx, &receipt, 200, Network::Ethereum);
        assert_eq!(deployments.len(), 1);
        let deployment = &deployments[0];
        assert_eq!(deployment.kind, DeploymentKind::Factory);
        assert_eq!(deployment.contract_address, address(0x99));
        assert_eq!(deployment.deployer_address, factory);
        assert_eq!(deployment.factory_address, Some(factory));
        assert_eq!(deployment.gas_used, 21_000);
    }

    #[test]
    fn create_trace_without_result_is_skipped() {
        let tx = Transaction {
            hash: tx_hash(0x77),
            from: address(0xaa),
            to: Some(address(0xf0)),
        };
        let receipt = receipt_with(None, 90_000);
        let traces: Vec<FlatTrace> = serde_json::from_value(json!([
            {
                "type": "create",
                "action": { "from": format!("{:#x}", address(0xf0)) },
                "error": "out of gas"
            }
        ]))
        .expect("traces decode");
        assert!(
            creates_from_flat_traces(&traces, &tx, &receipt, 200, Network::Ethereum).is_empty()
        );
    }

    #[test]
    fn nested_create2_in_call_tree_attributes_the_enclosing_factory() {
        let factory = address(0xf0);
        let tx = Transaction {
            hash: tx_hash(0x33),
            from: address(0xaa),
            to: Some(factory),
        };
        let receipt = receipt_with(None, 150_000);
        let root: CallFrame = serde_json::from_value(json!({
            "type": "CALL",
            "from": format!("{:#x}", address(0xaa)),
            "to": format!("{:#x}", factory),
            "calls": [{
                "type": "CREATE2",
                "from": format!("{:#x}", factory),
                "to": format!("{:#x}", address(0x99)),
                "gasUsed": "0x3e8"
            }]
        }))
        .expect("frame decodes");
        let deployments = creates_in_call_tree(&root, &tx, &receipt, 300, Network::Ethereum);
        assert_eq!(deployments.len(), 1);
        let deployment = &deployments[0];
        assert_eq!(deployment.factory_address, Some(factory));
        assert_eq!(deployment.deployer_address, factory);
        assert_eq!(deployment.contract_address, address(0x99));
        assert_eq!(deployment.kind, DeploymentKind::Factory);
        assert_eq!(deployment.gas_used, 1000);
    }

    #[test]
    fn deeply_nested_creates_are_all_collected() {
        let mut frame = CallFrame {
            frame_type: "CREATE".to_owned(),
            from: Some(address(0x01)),
            to: Some(address(0x99)),
            ..CallFrame::default()
        };
        // 200 levels of nesting must not blow the stack.
        for level in 0..200u16 {
            frame = CallFrame {
                frame_type: "CALL".to_owned(),
                from: Some(address(0xaa)),
                to: Some(Address::repeat_byte((level % 200) as u8)),
                calls: vec![frame],
                ..CallFrame::default()
            };
        }
        let tx = Transaction {
            hash: tx_hash(0x33),
            from: address(0xaa),
            to: Some(address(0xf0)),
        };
        let receipt = receipt_with(None, 1);
        let deployments = creates_in_call_tree(&frame, &tx, &receipt, 1, Network::Ethereum);
        assert_eq!(deployments.len(), 1);
        assert_eq!(deployments[0].contract_address, address(0x99));
    }

    #[test]
    fn system_addresses_are_excluded() {
        assert!(is_system_address(&Address::ZERO));
        assert!(is_system_address(
            &"0x0000000000000000000000000000000000000001"
                .parse()
                .expect("address")
        ));
        assert!(is_system_address(
            &"0x0000000000000000000000000000000000000013"
                .parse()
                .expect("address")
        ));
        assert!(!is_system_address(
            &"0x0000000000000000000000000000000000000014"
                .parse()
                .expect("address")
        ));
        assert!(!is_system_address(&address(0xaa)));
    }
}
