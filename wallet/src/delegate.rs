// SPDX-License-Identifier: CC0-1.0

use primitives::{Transaction, TxHash};

/// Host callbacks fired by the wallet.
///
/// Every method is invoked *after* the wallet lock is released, so
/// implementations may call back into the wallet, but they must stay cheap
/// or dispatch to another thread; they run on whatever thread ingested the
/// triggering transaction.
pub trait WalletDelegate: Send + Sync {
    /// The spendable balance changed.
    fn balance_changed(&self, _balance: u64) {}

    /// A transaction was added to the wallet.
    fn tx_added(&self, _tx: &Transaction) {}

    /// Transactions changed confirmation status.
    fn tx_updated(&self, _tx_hashes: &[TxHash], _block_height: u32, _timestamp: u32) {}

    /// A transaction was removed.
    ///
    /// `notify_user` is set when the removal changes funds the user saw;
    /// `recommend_rescan` when a previously confirmed transaction went away
    /// and the chain view may be stale.
    fn tx_deleted(&self, _tx_hash: TxHash, _notify_user: bool, _recommend_rescan: bool) {}
}

/// Delegate that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDelegate;

impl WalletDelegate for NullDelegate {}
