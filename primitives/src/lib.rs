// SPDX-License-Identifier: CC0-1.0

//! Primitive types for a Litecoin SPV wallet engine.
//!
//! Everything in this crate is pure data plumbing: consensus serialization,
//! script and address codecs, secp256k1 key handling, BIP-32 derivation,
//! transactions with legacy and BIP-143 signature digests, and SPV merkle
//! blocks with difficulty-retarget validation. Networking and wallet state
//! live in the `litespv-p2p` and `litespv-wallet` crates.

/// Re-export the hash crate, peers of this crate name hash types from it.
pub extern crate bitcoin_hashes as hashes;

/// Re-export so callers can name secp256k1 error types.
pub extern crate secp256k1;

#[macro_use]
mod error;

pub mod address;
pub mod bip32;
pub mod chain;
pub mod encode;
pub mod key;
pub mod merkle_block;
pub mod script;
pub mod transaction;
pub mod uint256;

use bitcoin_hashes::sha256d;

pub use self::address::Address;
pub use self::bip32::MasterPubKey;
pub use self::chain::{ChainParams, Network};
pub use self::error::{CodecError, CryptoError, DerivationError};
pub use self::key::Key;
pub use self::merkle_block::MerkleBlock;
pub use self::transaction::{Transaction, TxInput, TxOutput};
pub use self::uint256::U256;

/// Double SHA-256 of a transaction's canonical serialization.
///
/// Little-endian on the wire, reversed (big-endian) in display, the usual
/// Bitcoin convention carried by `sha256d::Hash`.
pub type TxHash = sha256d::Hash;

/// Double SHA-256 of an 80-byte block header.
pub type BlockHash = sha256d::Hash;
