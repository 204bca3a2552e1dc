//! Chain registry: every network the indexer knows about.
//!
//! This module defines the supported chain names, which of them are
//! EVM-compatible, which run proof-of-authority consensus (and therefore
//! carry a non-standard `extraData` header field), and the built-in public
//! RPC endpoint lists used when no endpoints are configured explicitly.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// A blockchain network tracked by the indexer.
///
/// Non-EVM variants exist so that configuration naming them can be parsed
/// and skipped with a warning instead of failing.
#[derive(Debug, Hash, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Network {
    #[serde(rename = "ethereum")]
    Ethereum,
    #[serde(rename = "arbitrum")]
    Arbitrum,
    #[serde(rename = "base")]
    Base,
    #[serde(rename = "optimism")]
    Optimism,
    #[serde(rename = "polygon")]
    Polygon,
    #[serde(rename = "bsc")]
    Bsc,
    #[serde(rename = "avalanche")]
    Avalanche,
    #[serde(rename = "blast")]
    Blast,
    #[serde(rename = "linea")]
    Linea,
    #[serde(rename = "sonic")]
    Sonic,
    #[serde(rename = "flare")]
    Flare,
    /// Bitcoin is not EVM-compatible and is never monitored.
    #[serde(rename = "bitcoin")]
    Bitcoin,
    /// Solana is not EVM-compatible and is never monitored.
    #[serde(rename = "solana")]
    Solana,
    /// TON is not EVM-compatible and is never monitored.
    #[serde(rename = "ton")]
    Ton,
    /// Tron is not EVM-compatible and is never monitored.
    #[serde(rename = "tron")]
    Tron,
}

impl Network {
    /// Return all known [`Network`] variants.
    pub fn variants() -> &'static [Network] {
        &[
            Network::Ethereum,
            Network::Arbitrum,
            Network::Base,
            Network::Optimism,
            Network::Polygon,
            Network::Bsc,
            Network::Avalanche,
            Network::Blast,
            Network::Linea,
            Network::Sonic,
            Network::Flare,
            Network::Bitcoin,
            Network::Solana,
            Network::Ton,
            Network::Tron,
        ]
    }

    /// The canonical lowercase name used in configuration, logs, and the
    /// `network` column of the store.
    pub fn name(&self) -> &'static str {
        match self {
            Network::Ethereum => "ethereum",
            Network::Arbitrum => "arbitrum",
            Network::Base => "base",
            Network::Optimism => "optimism",
            Network::Polygon => "polygon",
            Network::Bsc => "bsc",
            Network::Avalanche => "avalanche",
            Network::Blast => "blast",
            Network::Linea => "linea",
            Network::Sonic => "sonic",
            Network::Flare => "flare",
            Network::Bitcoin => "bitcoin",
            Network::Solana => "solana",
            Network::Ton => "ton",
            Network::Tron => "tron",
        }
    }

    /// Whether this chain speaks the Ethereum JSON-RPC protocol.
    pub fn is_evm(&self) -> bool {
        !matches!(
            self,
            Network::Bitcoin | Network::Solana | Network::Ton | Network::Tron
        )
    }

    /// Whether this chain runs proof-of-authority consensus.
    ///
    /// POA block headers carry an `extraData` field of arbitrary length; the
    /// wire types in [`crate::types`] decode it permissively, so this flag is
    /// informational and surfaces in connection logs.
    pub fn is_poa(&self) -> bool {
        matches!(
            self,
            Network::Polygon | Network::Bsc | Network::Linea | Network::Flare | Network::Avalanche
        )
    }

    /// Networks monitored when neither `--networks` nor `--all` is given.
    pub fn defaults() -> &'static [Network] {
        &[
            Network::Ethereum,
            Network::Arbitrum,
            Network::Base,
            Network::Optimism,
            Network::Polygon,
            Network::Bsc,
            Network::Avalanche,
            Network::Blast,
            Network::Linea,
        ]
    }

    /// Built-in public RPC endpoints, in failover order.
    ///
    /// An empty list marks the chain as unsupported unless endpoints are
    /// supplied via configuration.
    pub fn default_endpoints(&self) -> &'static [&'static str] {
        match self {
            Network::Ethereum => &[
                "https://eth.llamarpc.com",
                "https://rpc.ankr.com/eth",
                "https://ethereum.publicnode.com",
                "https://1rpc.io/eth",
                "https://eth.drpc.org",
            ],
            Network::Arbitrum => &[
                "https://arbitrum.llamarpc.com",
                "https://rpc.ankr.com/arbitrum",
                "https://arbitrum.publicnode.com",
                "https://1rpc.io/arb",
                "https://arb1.arbitrum.io/rpc",
            ],
            Network::Base => &[
                "https://base.llamarpc.com",
                "https://rpc.ankr.com/base",
                "https://base.publicnode.com",
                "https://1rpc.io/base",
                "https://mainnet.base.org",
            ],
            Network::Optimism => &[
                "https://optimism.llamarpc.com",
                "https://rpc.ankr.com/optimism",
                "https://optimism.publicnode.com",
                "https://1rpc.io/op",
                "https://mainnet.optimism.io",
            ],
            Network::Polygon => &[
                "https://polygon.llamarpc.com",
                "https://rpc.ankr.com/polygon",
                "https://polygon.publicnode.com",
                "https://1rpc.io/matic",
                "https://polygon-rpc.com",
            ],
            Network::Bsc => &[
                "https://bsc.llamarpc.com",
                "https://rpc.ankr.com/bsc",
                "https://bsc.publicnode.com",
                "https://1rpc.io/bnb",
                "https://bsc-dataseed.binance.org",
            ],
            Network::Avalanche => &[
                "https://avalanche.publicnode.com",
                "https://rpc.ankr.com/avalanche",
                "https://1rpc.io/avax/c",
                "https://api.avax.network/ext/bc/C/rpc",
            ],
            Network::Blast => &[
                "https://rpc.ankr.com/blast",
                "https://blast.publicnode.com",
                "https://rpc.blast.io",
                "https://blast.din.dev/rpc",
            ],
            Network::Linea => &[
                "https://rpc.linea.build",
                "https://linea.publicnode.com",
                "https://1rpc.io/linea",
                "https://rpc.ankr.com/linea",
            ],
            Network::Sonic => &["https://rpc.soniclabs.com", "https://rpc.ankr.com/sonic"],
            Network::Flare => &[
                "https://flare-api.flare.network/ext/C/rpc",
                "https://rpc.ankr.com/flare",
            ],
            Network::Bitcoin => &[],
            Network::Solana => &[
                "https://api.mainnet-beta.solana.com",
                "https://rpc.ankr.com/solana",
            ],
            Network::Ton => &[],
            Network::Tron => &["https://api.trongrid.io"],
        }
    }
}

impl Display for Network {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Network {
    type Err = UnknownNetwork;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Network::variants()
            .iter()
            .find(|n| n.name() == s)
            .copied()
            .ok_or_else(|| UnknownNetwork(s.to_owned()))
    }
}

/// Error returned when a configured chain name is not in the registry.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown network: {0}")]
pub struct UnknownNetwork(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_round_trips_through_from_str() {
        for network in Network::variants() {
            let parsed: Network = network.name().parse().expect("name parses back");
            assert_eq!(parsed, *network);
        }
        assert!("dogecoin".parse::<Network>().is_err());
    }

    #[test]
    fn non_evm_networks_are_flagged() {
        assert!(!Network::Bitcoin.is_evm());
        assert!(!Network::Solana.is_evm());
        assert!(!Network::Ton.is_evm());
        assert!(!Network::Tron.is_evm());
        assert!(Network::Ethereum.is_evm());
        assert!(Network::Sonic.is_evm());
    }

    #[test]
    fn poa_set_matches_chains_with_nonstandard_extra_data() {
        let poa: Vec<_> = Network::variants()
            .iter()
            .filter(|n| n.is_poa())
            .map(|n| n.name())
            .collect();
        assert_eq!(poa, ["polygon", "bsc", "avalanche", "linea", "flare"]);
    }

    #[test]
    fn defaults_are_evm_only_with_endpoints() {
        for network in Network::defaults() {
            assert!(network.is_evm());
            assert!(!network.default_endpoints().is_empty());
        }
    }
}
