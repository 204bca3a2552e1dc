//! Wire and domain types shared across the indexer.
//!
//! The JSON-RPC wire types here are deliberately hand-rolled and tolerant:
//! every field a node might omit is optional or defaulted, quantities decode
//! from hex strings, and `extraData` is an arbitrary-length byte string so
//! proof-of-authority headers (Polygon, BSC, ...) decode without a special
//! middleware layer.

use alloy_primitives::{Address, B256, Bytes, U64, U256};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

use crate::networks::Network;

/// A block with full transaction objects, as returned by
/// `eth_getBlockByNumber(n, true)`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub number: U64,
    #[serde(default)]
    pub hash: Option<B256>,
    #[serde(default)]
    pub timestamp: U64,
    /// Arbitrary length: POA chains stuff validator signatures in here.
    #[serde(default)]
    pub extra_data: Option<Bytes>,
    #[serde(default)]
    pub transactions: Vec<Transaction>,
}

/// A transaction embedded in a block.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub hash: B256,
    pub from: Address,
    /// `None` marks a contract-creation transaction.
    #[serde(default)]
    pub to: Option<Address>,
}

/// A transaction receipt, as returned by `eth_getTransactionReceipt`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub transaction_hash: B256,
    /// Set for direct deployments, `None` otherwise.
    #[serde(default)]
    pub contract_address: Option<Address>,
    #[serde(default)]
    pub gas_used: U256,
    /// Missing on pre-Byzantium blocks.
    #[serde(default)]
    pub status: Option<U64>,
    #[serde(default)]
    pub logs: Vec<Log>,
}

impl Receipt {
    /// Transaction status as a plain integer, defaulting to success when the
    /// node predates receipt statuses.
    pub fn status_code(&self) -> u64 {
        self.status.map(|s| s.to::<u64>()).unwrap_or(1)
    }
}

/// A log entry inside a receipt. Only the emitting address matters to the
/// log-based deployment fallback.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Log {
    pub address: Address,
}

/// One entry of a Parity/OpenEthereum-style `trace_block` /
/// `trace_transaction` response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlatTrace {
    #[serde(rename = "type", default)]
    pub trace_type: String,
    #[serde(default)]
    pub action: TraceAction,
    #[serde(default)]
    pub result: Option<TraceOutput>,
    #[serde(default)]
    pub transaction_hash: Option<B256>,
    #[serde(default)]
    pub error: Option<String>,
}

impl FlatTrace {
    /// Whether this trace records a contract creation that completed.
    pub fn is_create(&self) -> bool {
        self.trace_type == "create" && self.error.is_none()
    }
}

/// The `action` object of a flat trace. Fields differ between call and
/// create traces, so everything is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceAction {
    #[serde(default)]
    pub from: Option<Address>,
    #[serde(default)]
    pub to: Option<Address>,
    #[serde(default)]
    pub gas: Option<U256>,
    #[serde(default)]
    pub value: Option<U256>,
}

/// The `result` object of a flat trace; absent when the subcall reverted.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceOutput {
    #[serde(default)]
    pub address: Option<Address>,
    #[serde(default)]
    pub gas_used: Option<U256>,
}

/// A node of the recursive call tree produced by
/// `debug_traceTransaction` with the `callTracer`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallFrame {
    /// `CALL`, `DELEGATECALL`, `STATICCALL`, `CREATE`, `CREATE2`, ...
    #[serde(rename = "type", default)]
    pub frame_type: String,
    #[serde(default)]
    pub from: Option<Address>,
    /// For `CREATE`/`CREATE2` frames this is the created contract.
    #[serde(default)]
    pub to: Option<Address>,
    #[serde(default)]
    pub gas_used: Option<U256>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub calls: Vec<CallFrame>,
}

impl CallFrame {
    /// Whether this frame is a `CREATE` or `CREATE2` operation.
    pub fn is_create(&self) -> bool {
        matches!(self.frame_type.as_str(), "CREATE" | "CREATE2")
    }
}

/// How a contract came into existence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeploymentKind {
    /// A transaction with no recipient created the contract directly.
    #[serde(rename = "direct")]
    Direct,
    /// An internal `CREATE`/`CREATE2` executed by another contract.
    #[serde(rename = "factory")]
    Factory,
}

impl DeploymentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentKind::Direct => "direct",
            DeploymentKind::Factory => "factory",
        }
    }
}

impl Display for DeploymentKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A contract deployment discovered in a block, before enrichment.
///
/// Identity is `(contract_address, network)`; the store's unique index
/// silently absorbs re-discoveries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deployment {
    pub contract_address: Address,
    pub deployer_address: Address,
    pub transaction_hash: B256,
    pub block_number: u64,
    pub network: Network,
    pub kind: DeploymentKind,
    /// The contract whose code executed the `CREATE`, for factory deployments.
    pub factory_address: Option<Address>,
    pub gas_used: u64,
    pub status: u64,
}

/// Lowercase `0x`-prefixed rendering used for storage keys and API paths.
///
/// `Address: Display` produces EIP-55 mixed case, which would break the
/// case-sensitive unique index in the store.
pub fn hex_address(address: &Address) -> String {
    format!("{address:#x}")
}

/// Lowercase `0x`-prefixed rendering of a transaction hash.
pub fn hex_hash(hash: &B256) -> String {
    format!("{hash:#x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_decodes_with_oversized_extra_data() {
        // Polygon-style header: extraData well beyond the 32-byte convention.
        let extra = format!("0x{}", "ab".repeat(97));
        let raw = serde_json::json!({
            "number": "0x10",
            "hash": "0x00000000000000000000000000000000000000000000000000000000000000aa",
            "timestamp": "0x64",
            "extraData": extra,
            "transactions": [{
                "hash": "0x00000000000000000000000000000000000000000000000000000000000000bb",
                "from": "0x1111111111111111111111111111111111111111",
                "to": null
            }]
        });
        let block: Block = serde_json::from_value(raw).expect("tolerant decode");
        assert_eq!(block.number.to::<u64>(), 16);
        assert_eq!(block.extra_data.expect("extra data").len(), 97);
        assert_eq!(block.transactions.len(), 1);
        assert!(block.transactions[0].to.is_none());
    }

    #[test]
    fn receipt_without_status_counts_as_success() {
        let raw = serde_json::json!({
            "transactionHash": "0x00000000000000000000000000000000000000000000000000000000000000bb",
            "gasUsed": "0x7a120"
        });
        let receipt: Receipt = serde_json::from_value(raw).expect("decode");
        assert_eq!(receipt.status_code(), 1);
        assert_eq!(receipt.gas_used.to::<u64>(), 500_000);
        assert!(receipt.contract_address.is_none());
        assert!(receipt.logs.is_empty());
    }

    #[test]
    fn flat_trace_create_decodes_parity_shape() {
        let raw = serde_json::json!({
            "type": "create",
            "action": {
                "from": "0x2222222222222222222222222222222222222222",
                "gas": "0x30d40",
                "init": "0x6080",
                "value": "0x0"
            },
            "result": {
                "address": "0x3333333333333333333333333333333333333333",
                "gasUsed": "0x3e8",
                "code": "0x60806040"
            },
            "transactionHash": "0x00000000000000000000000000000000000000000000000000000000000000cc"
        });
        let trace: FlatTrace = serde_json::from_value(raw).expect("decode");
        assert!(trace.is_create());
        let result = trace.result.expect("result");
        assert_eq!(result.gas_used.expect("gas").to::<u64>(), 1000);
    }

    #[test]
    fn reverted_create_trace_is_not_a_create() {
        let raw = serde_json::json!({
            "type": "create",
            "action": { "from": "0x2222222222222222222222222222222222222222" },
            "error": "out of gas"
        });
        let trace: FlatTrace = serde_json::from_value(raw).expect("decode");
        assert!(!trace.is_create());
    }

    #[test]
    fn call_frame_tree_decodes_nested_creates() {
        let raw = serde_json::json!({
            "type": "CALL",
            "from": "0x1111111111111111111111111111111111111111",
            "to": "0x2222222222222222222222222222222222222222",
            "calls": [{
                "type": "CREATE2",
                "from": "0x2222222222222222222222222222222222222222",
                "to": "0x3333333333333333333333333333333333333333",
                "gasUsed": "0x3e8"
            }]
        });
        let frame: CallFrame = serde_json::from_value(raw).expect("decode");
        assert!(!frame.is_create());
        assert_eq!(frame.calls.len(), 1);
        assert!(frame.calls[0].is_create());
    }

    #[test]
    fn hex_address_is_lowercase() {
        let address: Address = "0xDAFEA492D9c6733ae3d56b7Ed1ADB60692c98Bc5"
            .parse()
            .expect("address");
        assert_eq!(
            hex_address(&address),
            "0xdafea492d9c6733ae3d56b7ed1adb60692c98bc5"
        );
    }
}
