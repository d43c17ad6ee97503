// SPDX-License-Identifier: CC0-1.0

//! Wallet state for a Litecoin SPV engine.
//!
//! The [`Wallet`] owns every transaction that pays or spends its keys,
//! tracks unspent outputs across confirmations and reorgs, selects coins
//! and builds new transactions, and produces the BIP-37 bloom filter the
//! peer layer loads into its download peer. Host integration happens
//! through the [`WalletDelegate`] callbacks, always invoked outside the
//! wallet lock.

pub mod bloom;
mod delegate;
mod wallet;

pub use self::bloom::BloomFilter;
pub use self::delegate::{NullDelegate, WalletDelegate};
pub use self::wallet::{Utxo, Wallet, WalletError, DEFAULT_GAP_LIMIT};
