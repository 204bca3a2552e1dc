//! Bytecode classifier: identifies what kind of contract landed on-chain and
//! pulls readable metadata out of it.
//!
//! Classification is a pure function over the hex-encoded runtime bytecode:
//! each category owns a set of 4-byte function selectors and a threshold of
//! distinct matches, plus two literal byte patterns (EIP-1167 minimal proxy,
//! clone factory) that match unconditionally. Metadata enrichment then makes
//! best-effort `eth_call`s depending on the primary type; every individual
//! call failure is tolerated and the corresponding field simply omitted.

use alloy_primitives::{Address, B256, U256, b256};
use alloy_sol_types::{SolCall, sol};
use serde::Serialize;
use std::sync::Arc;

use crate::rpc::{RpcAdapter, RpcError};
use crate::types::hex_address;

/// EIP-1167 minimal proxy preamble.
const MINIMAL_PROXY_PATTERN: &str = "363d3d373d3d3d363d73";
/// Clone-factory deployment stub.
const CLONE_FACTORY_PATTERN: &str = "3d602d80600a3d3981f3";

/// EIP-1967 implementation slot:
/// `keccak256("eip1967.proxy.implementation") - 1`.
const EIP1967_IMPLEMENTATION_SLOT: B256 =
    b256!("0x360894a13ba1a3210667c828492db98dca3e2076cc3735a920a3ca505d382bbc");

/// A selector-based category: present when at least `threshold` distinct
/// selectors from `selectors` occur in the bytecode.
struct Category {
    name: &'static str,
    selectors: &'static [&'static str],
    threshold: usize,
}

/// Categories in priority order; ties on score resolve to the earliest.
const CATEGORIES: &[Category] = &[
    Category {
        name: "ERC20",
        // totalSupply, balanceOf, transfer, transferFrom, approve, allowance
        selectors: &[
            "18160ddd", "70a08231", "a9059cbb", "23b872dd", "095ea7b3", "dd62ed3e",
        ],
        threshold: 4,
    },
    Category {
        name: "ERC721",
        // balanceOf, ownerOf, safeTransferFrom, transferFrom, approve,
        // getApproved, setApprovalForAll
        selectors: &[
            "70a08231", "6352211e", "42842e0e", "23b872dd", "095ea7b3", "081812fc", "a22cb465",
        ],
        threshold: 4,
    },
    Category {
        name: "ERC1155",
        // balanceOf, balanceOfBatch, safeTransferFrom, safeBatchTransferFrom,
        // setApprovalForAll
        selectors: &["00fdd58e", "4e1273f4", "f242432a", "2eb2c2d6", "a22cb465"],
        threshold: 2,
    },
    Category {
        name: "Router",
        // swapExactTokensForTokens, swapTokensForExactTokens,
        // swapExactETHForTokens, swapETHForExactTokens, swapExactTokensForETH,
        // swapTokensForExactETH, removeLiquidity, addLiquidity
        selectors: &[
            "38ed1739", "8803dbee", "7ff36ab5", "fb3bdb41", "18cbafe5", "4a25d94a", "02751cec",
            "e8e33700",
        ],
        threshold: 2,
    },
    Category {
        name: "Pool",
        // getReserves, mint, burn, swap, slot0, token0, token1
        selectors: &[
            "0902f1ac", "6a627842", "89afcb44", "022c0d9f", "128acb08", "d21220a7", "0dfe1681",
        ],
        threshold: 2,
    },
    Category {
        name: "Factory",
        // createPair, createPool, allPairsLength, allPairs, implementation,
        // deploy
        selectors: &[
            "c9c65396", "a1671295", "13af4035", "1e3dd18b", "5c60da1b", "4e1273f4",
        ],
        threshold: 2,
    },
    Category {
        name: "Proxy",
        // implementation, upgradeTo, upgradeToAndCall, changeAdmin, admin
        selectors: &["5c60da1b", "3659cfe6", "4f1ef286", "8f283970", "f851a440"],
        threshold: 1,
    },
    Category {
        name: "Staking",
        // stake, withdraw, getReward, exit, earned, rewardRate
        selectors: &[
            "a694fc3a", "2e1a7d4d", "3d18b912", "e9fad8ee", "8b876347", "70897b23",
        ],
        threshold: 2,
    },
    Category {
        name: "Multisig",
        // submitTransaction, confirmTransaction, revokeConfirmation,
        // executeTransaction, owners, required
        selectors: &[
            "c6427474", "c01a8c84", "20ea8d86", "ee22610b", "025e7c27", "54741525",
        ],
        threshold: 3,
    },
    Category {
        name: "Timelock",
        // queueTransaction, executeTransaction, cancelTransaction,
        // setPendingAdmin, acceptAdmin
        selectors: &["3a66f901", "591fcdfe", "c1a287e2", "7d645fab", "26782247"],
        threshold: 2,
    },
];

sol! {
    function name() external view returns (string);
    function symbol() external view returns (string);
    function decimals() external view returns (uint8);
    function totalSupply() external view returns (uint256);
    function token0() external view returns (address);
    function token1() external view returns (address);
    function getReserves() external view returns (uint112 reserve0, uint112 reserve1, uint32 blockTimestampLast);
    function implementation() external view returns (address);
}

/// The outcome of scanning bytecode for category selectors.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub primary: String,
    pub all_types: Vec<String>,
    /// Score of the primary category, in `[0, 1]`.
    pub confidence: f64,
}

/// Scan hex-encoded bytecode for category selectors and literal patterns.
///
/// Empty code classifies as `EOA` with full confidence; no match at all
/// yields `Unknown` with zero confidence.
pub fn analyze_bytecode(code: &[u8]) -> Classification {
    if code.is_empty() {
        return Classification {
            primary: "EOA".to_owned(),
            all_types: vec!["EOA".to_owned()],
            confidence: 1.0,
        };
    }

    let bytecode = hex::encode(code);
    let mut matched: Vec<(String, f64)> = Vec::new();

    if bytecode.contains(MINIMAL_PROXY_PATTERN) {
        matched.push(("MinimalProxy".to_owned(), 1.0));
    }
    if bytecode.contains(CLONE_FACTORY_PATTERN) {
        matched.push(("CloneFactory".to_owned(), 1.0));
    }

    for category in CATEGORIES {
        let hits = category
            .selectors
            .iter()
            .filter(|selector| bytecode.contains(*selector))
            .count();
        if hits >= category.threshold {
            matched.push((
                category.name.to_owned(),
                hits as f64 / category.selectors.len() as f64,
            ));
        }
    }

    if matched.is_empty() {
        return Classification {
            primary: "Unknown".to_owned(),
            all_types: vec!["Unknown".to_owned()],
            confidence: 0.0,
        };
    }

    let (primary, confidence) = matched
        .iter()
        .fold((String::new(), f64::MIN), |best, (name, score)| {
            if *score > best.1 {
                (name.clone(), *score)
            } else {
                best
            }
        });
    Classification {
        primary,
        all_types: matched.into_iter().map(|(name, _)| name).collect(),
        confidence,
    }
}

/// Full contract profile: classification plus whatever metadata the chain
/// would give up. Serialized into the `contract_info` column.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ContractProfile {
    #[serde(rename = "type")]
    pub primary: String,
    pub all_types: Vec<String>,
    pub confidence: f64,
    pub bytecode_size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_symbol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_decimals: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_supply: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nft_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nft_symbol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nft_total_supply: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool_token0: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool_token1: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool_reserve0: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool_reserve1: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub implementation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ContractProfile {
    fn from_classification(classification: Classification, bytecode_size: usize) -> Self {
        Self {
            primary: classification.primary,
            all_types: classification.all_types,
            confidence: classification.confidence,
            bytecode_size,
            ..Self::default()
        }
    }

    /// Profile for a contract whose code could not be read at all.
    fn read_failure(message: String) -> Self {
        Self {
            primary: "Error".to_owned(),
            all_types: vec!["Error".to_owned()],
            confidence: 0.0,
            error: Some(message),
            ..Self::default()
        }
    }
}

/// Classifies contracts on one chain. Cheap to clone via the shared adapter.
#[derive(Clone)]
pub struct Classifier {
    rpc: Arc<RpcAdapter>,
}

impl Classifier {
    pub fn new(rpc: Arc<RpcAdapter>) -> Self {
        Self { rpc }
    }

    /// Classify a contract and enrich the profile with on-chain metadata.
    ///
    /// Never fails: an unreadable contract yields an `Error` profile with the
    /// message attached.
    pub async fn profile(&self, address: Address) -> ContractProfile {
        let code = match self.rpc.get_code(address, None).await {
            Ok(code) => code,
            Err(error) => {
                tracing::error!(
                    "[{}] could not read code for {}: {error}",
                    self.rpc.network(),
                    hex_address(&address)
                );
                return ContractProfile::read_failure(error.to_string());
            }
        };
        let classification = analyze_bytecode(&code);
        let mut profile = ContractProfile::from_classification(classification, code.len());

        match profile.primary.as_str() {
            "ERC20" => self.enrich_token(address, &mut profile).await,
            "ERC721" => self.enrich_nft(address, &mut profile).await,
            "Pool" => self.enrich_pool(address, &mut profile).await,
            "Proxy" => {
                profile.implementation = self
                    .implementation_address(address)
                    .await
                    .map(|a| hex_address(&a));
            }
            _ => {}
        }
        profile
    }

    async fn call<C: SolCall>(&self, address: Address, call: C) -> Result<C::Return, RpcError> {
        let output = self.rpc.eth_call(address, call.abi_encode().into()).await?;
        C::abi_decode_returns(&output).map_err(|error| RpcError::Parse(error.to_string()))
    }

    async fn enrich_token(&self, address: Address, profile: &mut ContractProfile) {
        profile.token_name = self.call(address, nameCall {}).await.ok();
        profile.token_symbol = self.call(address, symbolCall {}).await.ok();
        profile.token_decimals = self.call(address, decimalsCall {}).await.ok();
        profile.total_supply = self
            .call(address, totalSupplyCall {})
            .await
            .ok()
            .map(|supply: U256| supply.to_string());
    }

    async fn enrich_nft(&self, address: Address, profile: &mut ContractProfile) {
        profile.nft_name = self.call(address, nameCall {}).await.ok();
        profile.nft_symbol = self.call(address, symbolCall {}).await.ok();
        profile.nft_total_supply = self
            .call(address, totalSupplyCall {})
            .await
            .ok()
            .map(|supply: U256| supply.to_string());
    }

    async fn enrich_pool(&self, address: Address, profile: &mut ContractProfile) {
        profile.pool_token0 = self
            .call(address, token0Call {})
            .await
            .ok()
            .map(|token: Address| hex_address(&token));
        profile.pool_token1 = self
            .call(address, token1Call {})
            .await
            .ok()
            .map(|token: Address| hex_address(&token));
        if let Ok(reserves) = self.call(address, getReservesCall {}).await {
            profile.pool_reserve0 = Some(reserves.reserve0.to_string());
            profile.pool_reserve1 = Some(reserves.reserve1.to_string());
        }
    }

    /// Best-effort proxy target: `implementation()` first, then the
    /// EIP-1967 storage slot. A zero address reads as absent.
    async fn implementation_address(&self, address: Address) -> Option<Address> {
        if let Ok(implementation) = self.call(address, implementationCall {}).await {
            if implementation != Address::ZERO {
                return Some(implementation);
            }
            return None;
        }
        match self
            .rpc
            .get_storage(address, EIP1967_IMPLEMENTATION_SLOT)
            .await
        {
            Ok(word) => {
                let implementation = Address::from_word(word);
                (implementation != Address::ZERO).then_some(implementation)
            }
            Err(error) => {
                tracing::debug!(
                    "[{}] EIP-1967 slot read failed for {}: {error}",
                    self.rpc.network(),
                    hex_address(&address)
                );
                None
            }
        }
    }
}
