//! Network parameters.
//!
//! The store and the checkpoint loader only need one thing from the
//! network definition: its genesis header, used to synthesize responses
//! for freshly created or cleared stores. Everything else about a network
//! (peer discovery, difficulty rules, address formats) belongs to other
//! layers.

use alloy_primitives::{b256, B256};

use crate::block::{BlockHeader, StoredBlock};

/// Supported networks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Mainnet,
    Testnet,
    /// A deterministic throwaway network with the easiest allowed
    /// difficulty, for tests.
    UnitTest,
}

/// Parameters of a network, reduced to what the header store consumes.
#[derive(Debug, Clone)]
pub struct Params {
    network: Network,
    genesis: BlockHeader,
}

const GENESIS_MERKLE_ROOT: B256 =
    b256!("97ddfbbae6be97fd6cdf3e7ca13232a3afff2353e29badfab7f73011edd4ced9");

impl Params {
    pub fn mainnet() -> Self {
        Self {
            network: Network::Mainnet,
            genesis: BlockHeader {
                version: 1,
                prev_hash: B256::ZERO,
                merkle_root: GENESIS_MERKLE_ROOT,
                time: 1_317_972_665,
                bits: 0x1e0f_fff0,
                nonce: 2_084_524_493,
            },
        }
    }

    pub fn testnet() -> Self {
        Self {
            network: Network::Testnet,
            genesis: BlockHeader {
                version: 1,
                prev_hash: B256::ZERO,
                merkle_root: GENESIS_MERKLE_ROOT,
                time: 1_486_949_366,
                bits: 0x1e0f_fff0,
                nonce: 293_345,
            },
        }
    }

    pub fn unit_test() -> Self {
        Self {
            network: Network::UnitTest,
            genesis: BlockHeader {
                version: 1,
                prev_hash: B256::ZERO,
                merkle_root: B256::ZERO,
                time: 1_296_688_602,
                bits: 0x207f_ffff,
                nonce: 2,
            },
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// The network's genesis header.
    pub fn genesis_block(&self) -> BlockHeader {
        self.genesis
    }

    /// The published hash of the genesis header.
    pub fn genesis_hash(&self) -> B256 {
        match self.network {
            Network::Mainnet => {
                b256!("12a765e31ffd4059bada1e25190f6e98c99d9714d334efa41a195a7e7e04bfe2")
            }
            Network::Testnet => {
                b256!("4966625a4b2851d9fdee139e56211a0d88575f59ed816ff5e6a63deb4e3e29a0")
            }
            Network::UnitTest => self.genesis.hash(),
        }
    }

    /// The genesis block as a stored block: height zero, the header's own
    /// work as cumulative work.
    pub fn genesis_stored(&self) -> StoredBlock {
        StoredBlock::new(self.genesis, self.genesis.work(), 0)
    }
}
