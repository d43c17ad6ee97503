// SPDX-License-Identifier: CC0-1.0

//! Chain parameters for Litecoin mainnet and testnet.
//!
//! Everything that used to hide behind a compile-time network flag is a
//! value here, supplied at wallet and peer-manager construction.

use core::fmt;

use bitcoin_hashes::sha256d;

/// Which Litecoin network a parameter set describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    /// Litecoin mainnet.
    Mainnet,
    /// Litecoin testnet4.
    Testnet,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Network::Mainnet => f.write_str("mainnet"),
            Network::Testnet => f.write_str("testnet"),
        }
    }
}

/// A known-good block pinned into the chain.
///
/// Checkpoints sit on retarget boundaries so difficulty validation can
/// shortcut historical stretches a light client never re-verifies.
#[derive(Debug, Clone, Copy)]
pub struct Checkpoint {
    /// Block height, always a multiple of the retarget interval.
    pub height: u32,
    /// Block hash in display (big-endian) hex.
    pub hash: &'static str,
    /// Header timestamp.
    pub timestamp: u32,
    /// Compact difficulty target.
    pub target: u32,
}

impl Checkpoint {
    /// The pinned hash as a wire hash.
    pub fn block_hash(&self) -> sha256d::Hash {
        self.hash.parse().expect("checkpoint table holds valid hex")
    }
}

/// Consensus and network constants for one chain.
#[derive(Debug, Clone)]
pub struct ChainParams {
    /// Which network this is.
    pub network: Network,
    /// Wire magic, little-endian on the wire.
    pub magic: u32,
    /// Default peer-to-peer port.
    pub port: u16,
    /// Base58 version byte for P2PKH addresses.
    pub pubkey_prefix: u8,
    /// Base58 version byte for P2SH addresses.
    pub script_prefix: u8,
    /// WIF version byte.
    pub wif_prefix: u8,
    /// Bech32 human-readable part.
    pub bech32_hrp: &'static str,
    /// Hosts resolved for bootstrap peer discovery.
    pub dns_seeds: &'static [&'static str],
    /// Pinned historical blocks, ascending by height.
    pub checkpoints: &'static [Checkpoint],
    /// Services this engine advertises (none, we are a light client).
    pub services: u64,
    /// Protocol version spoken in the `version` message.
    pub protocol_version: u32,
    /// Oldest protocol version worth talking to.
    pub min_protocol_version: u32,
    /// Seconds between blocks the difficulty aims for.
    pub target_spacing: u32,
    /// Seconds per retarget window.
    pub target_timespan: u32,
}

/// Blocks per difficulty adjustment: `target_timespan / target_spacing`.
pub const DIFFICULTY_INTERVAL: u32 = 2016;

/// Service bit for full nodes.
pub const SERVICES_NODE_NETWORK: u64 = 1;
/// Service bit for BIP-37 bloom filtering, required of the download peer.
pub const SERVICES_NODE_BLOOM: u64 = 1 << 2;

const MAINNET_SEEDS: &[&str] = &[
    "seed-a.litecoin.loshan.co.uk",
    "dnsseed.thrasher.io",
    "dnsseed.litecointools.com",
    "dnsseed.litecoinpool.org",
];

const TESTNET_SEEDS: &[&str] = &[
    "testnet-seed.litecointools.com",
    "seed-b.litecoin.loshan.co.uk",
    "dnsseed-testnet.thrasher.io",
];

const MAINNET_CHECKPOINTS: &[Checkpoint] = &[Checkpoint {
    height: 0,
    hash: "12a765e31ffd4059bada1e25190f6e98c99d9714d334efa41a195a7e7e04bfe2",
    timestamp: 1317972665,
    target: 0x1e0ffff0,
}];

const TESTNET_CHECKPOINTS: &[Checkpoint] = &[Checkpoint {
    height: 0,
    hash: "4966625a4b2851d9fdee139e56211a0d88575f59ed816ff5e6a63deb4e3e29a0",
    timestamp: 1486949366,
    target: 0x1e0ffff0,
}];

impl ChainParams {
    /// Litecoin mainnet parameters.
    pub fn mainnet() -> Self {
        ChainParams {
            network: Network::Mainnet,
            magic: 0xdbb6_c0fb,
            port: 9333,
            pubkey_prefix: 48,
            script_prefix: 50,
            wif_prefix: 0xb0,
            bech32_hrp: "ltc",
            dns_seeds: MAINNET_SEEDS,
            checkpoints: MAINNET_CHECKPOINTS,
            services: 0,
            protocol_version: 70015,
            min_protocol_version: 70002,
            target_spacing: 150,
            target_timespan: 150 * DIFFICULTY_INTERVAL,
        }
    }

    /// Litecoin testnet4 parameters.
    pub fn testnet() -> Self {
        ChainParams {
            network: Network::Testnet,
            magic: 0xf1c8_d2fd,
            port: 19335,
            pubkey_prefix: 111,
            script_prefix: 58,
            wif_prefix: 0xef,
            bech32_hrp: "tltc",
            dns_seeds: TESTNET_SEEDS,
            checkpoints: TESTNET_CHECKPOINTS,
            services: 0,
            protocol_version: 70015,
            min_protocol_version: 70002,
            target_spacing: 150,
            target_timespan: 150 * DIFFICULTY_INTERVAL,
        }
    }

    /// The genesis block hash.
    pub fn genesis_hash(&self) -> sha256d::Hash { self.checkpoints[0].block_hash() }

    /// The highest checkpoint at or below `height`.
    pub fn last_checkpoint_before(&self, height: u32) -> &Checkpoint {
        self.checkpoints
            .iter()
            .rev()
            .find(|c| c.height <= height)
            .unwrap_or(&self.checkpoints[0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retarget_interval_consistent() {
        let params = ChainParams::mainnet();
        assert_eq!(params.target_timespan / params.target_spacing, DIFFICULTY_INTERVAL);
    }

    #[test]
    fn genesis_hashes_parse() {
        assert_ne!(
            ChainParams::mainnet().genesis_hash(),
            ChainParams::testnet().genesis_hash()
        );
    }

    #[test]
    fn wire_magic() {
        assert_eq!(ChainParams::mainnet().magic.to_le_bytes(), [0xfb, 0xc0, 0xb6, 0xdb]);
        assert_eq!(ChainParams::testnet().magic.to_le_bytes(), [0xfd, 0xd2, 0xc8, 0xf1]);
    }
}
