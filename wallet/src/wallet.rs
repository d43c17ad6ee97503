// SPDX-License-Identifier: CC0-1.0

//! Wallet state machine: registry, UTXO set, balance, coin selection.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use log::debug;
use primitives::bip32::{self, CHAIN_EXTERNAL, CHAIN_INTERNAL};
use primitives::transaction::{
    FnvTimeRng, Transaction, TxInput, TxOutput, SEQUENCE_FINAL, TX_FEE_PER_KB, TX_INPUT_SIZE,
    TX_MAX_LOCK_HEIGHT, TX_MAX_SIZE, TX_MIN_OUTPUT_AMOUNT, TX_OUTPUT_SIZE, TX_UNCONFIRMED,
};
use primitives::hashes::Hash as _;
use primitives::{Address, ChainParams, DerivationError, MasterPubKey, TxHash};

use crate::bloom::{BloomFilter, BLOOM_UPDATE_ALL};
use crate::delegate::WalletDelegate;

/// Unused addresses published past the highest used one, per chain.
pub const DEFAULT_GAP_LIMIT: u32 = 10;

/// Errors surfaced by the transaction-construction APIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalletError {
    /// The selectable balance cannot cover the requested amount plus fee.
    InsufficientFunds,
    /// A requested output is below the minimum output amount.
    OutputTooSmall,
    /// The assembled transaction would exceed the relay size limit.
    TxTooLarge,
    /// The destination does not decode as an address on this network.
    AddressUnknown,
}

impl fmt::Display for WalletError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use WalletError::*;

        match *self {
            InsufficientFunds => write!(f, "insufficient funds"),
            OutputTooSmall => write!(f, "output below the minimum output amount"),
            TxTooLarge => write!(f, "transaction exceeds the maximum size"),
            AddressUnknown => write!(f, "unknown or foreign-network address"),
        }
    }
}

impl std::error::Error for WalletError {}

/// An unspent transaction outpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Utxo {
    /// Hash of the funding transaction.
    pub tx_hash: TxHash,
    /// Output index within it.
    pub index: u32,
}

impl Utxo {
    /// The 36-byte form inserted into bloom filters and spent-outpoint sets.
    pub fn filter_element(&self) -> [u8; 36] {
        let mut out = [0u8; 36];
        out[..32].copy_from_slice(self.tx_hash.as_ref());
        out[32..].copy_from_slice(&self.index.to_le_bytes());
        out
    }
}

struct Inner {
    tx_map: HashMap<TxHash, Transaction>,
    /// Chain order: confirmed ascending by height, then unconfirmed in
    /// dependency order, ties by arrival.
    ordered: Vec<TxHash>,
    spent_by: HashMap<Utxo, TxHash>,
    invalid: HashSet<TxHash>,
    pending: HashSet<TxHash>,
    utxos: Vec<Utxo>,
    external: Vec<(u32, Address)>,
    internal: Vec<(u32, Address)>,
    all_addresses: HashSet<Address>,
    used_addresses: HashSet<Address>,
    balance: u64,
    total_received: u64,
    total_sent: u64,
    fee_per_kb: u64,
    gap_limit: u32,
    chain_height: u32,
    generation: u64,
}

enum Event {
    Balance(u64),
    Added(Transaction),
    Updated(Vec<TxHash>, u32, u32),
    Deleted(TxHash, bool, bool),
}

/// The wallet: every field lives behind one lock, and every delegate
/// callback fires after that lock is released.
pub struct Wallet {
    params: ChainParams,
    master_pub_key: MasterPubKey,
    delegate: Arc<dyn WalletDelegate>,
    inner: Mutex<Inner>,
}

impl fmt::Debug for Wallet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Wallet").field("network", &self.params.network).finish_non_exhaustive()
    }
}

impl Wallet {
    /// Builds a wallet from the master public key and previously persisted
    /// transactions. No callbacks fire during the reload.
    pub fn new(
        params: ChainParams,
        master_pub_key: MasterPubKey,
        transactions: Vec<Transaction>,
        delegate: Arc<dyn WalletDelegate>,
    ) -> Self {
        let wallet = Wallet {
            params,
            master_pub_key,
            delegate,
            inner: Mutex::new(Inner {
                tx_map: HashMap::new(),
                ordered: Vec::new(),
                spent_by: HashMap::new(),
                invalid: HashSet::new(),
                pending: HashSet::new(),
                utxos: Vec::new(),
                external: Vec::new(),
                internal: Vec::new(),
                all_addresses: HashSet::new(),
                used_addresses: HashSet::new(),
                balance: 0,
                total_received: 0,
                total_sent: 0,
                fee_per_kb: TX_FEE_PER_KB,
                gap_limit: DEFAULT_GAP_LIMIT,
                chain_height: 0,
                generation: 0,
            }),
        };

        {
            let mut inner = wallet.lock();
            // Persisted transactions are trusted to be ours; insert before
            // deriving addresses so usage marks land on the right indexes.
            for tx in transactions {
                if !tx.is_signed() {
                    continue;
                }
                let hash = tx.hash;
                if inner.tx_map.insert(hash, tx).is_none() {
                    wallet.insert_ordered(&mut inner, hash);
                }
            }
            // Newly derived addresses can reveal more usage in the loaded
            // transactions, so iterate to a fixpoint.
            loop {
                let before = inner.generation;
                let hashes: Vec<TxHash> = inner.ordered.clone();
                for hash in hashes {
                    let tx = inner.tx_map.get(&hash).cloned().expect("ordered tracks tx_map");
                    Self::mark_used_addresses(&mut inner, &tx);
                }
                wallet.ensure_addresses(&mut inner);
                if inner.generation == before {
                    break;
                }
            }
            wallet.update_state(&mut inner);
        }
        wallet
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("wallet lock poisoned")
    }

    fn fire(&self, events: Vec<Event>) {
        for event in events {
            match event {
                Event::Balance(balance) => self.delegate.balance_changed(balance),
                Event::Added(tx) => self.delegate.tx_added(&tx),
                Event::Updated(hashes, height, timestamp) =>
                    self.delegate.tx_updated(&hashes, height, timestamp),
                Event::Deleted(hash, notify, rescan) =>
                    self.delegate.tx_deleted(hash, notify, rescan),
            }
        }
    }

    /// The chain parameters this wallet was built with.
    pub fn chain_params(&self) -> &ChainParams { &self.params }

    /// The master public key the address streams derive from.
    pub fn master_pub_key(&self) -> &MasterPubKey { &self.master_pub_key }

    // ---- address streams -------------------------------------------------

    fn derive_address(&self, chain: u32, index: u32) -> Result<Address, DerivationError> {
        let pub_key = self.master_pub_key.derive_pub_key(chain, index)?;
        Ok(Address::from_pub_key(&pub_key, &self.params))
    }

    /// Extends both chains so `gap_limit` unused addresses trail the
    /// highest used one.
    fn ensure_addresses(&self, inner: &mut Inner) {
        for chain in [CHAIN_EXTERNAL, CHAIN_INTERNAL] {
            self.ensure_chain(inner, chain, 0);
        }
    }

    fn ensure_chain(&self, inner: &mut Inner, chain: u32, extra: u32) {
        let want = inner.gap_limit + extra;
        loop {
            let list = if chain == CHAIN_EXTERNAL { &inner.external } else { &inner.internal };
            let unused_tail = list
                .iter()
                .rev()
                .take_while(|(_, a)| !inner.used_addresses.contains(a))
                .count() as u32;
            if unused_tail >= want {
                return;
            }
            let next_index = list.last().map(|(i, _)| i + 1).unwrap_or(0);

            // On the vanishingly rare invalid child, skip to the next index.
            let mut index = next_index;
            let address = loop {
                match self.derive_address(chain, index) {
                    Ok(address) => break address,
                    Err(DerivationError::KeyInvalid) => index += 1,
                }
            };

            inner.all_addresses.insert(address.clone());
            if chain == CHAIN_EXTERNAL {
                inner.external.push((index, address));
            } else {
                inner.internal.push((index, address));
            }
            inner.generation += 1;
        }
    }

    fn first_unused(inner: &Inner, chain: u32) -> Address {
        let list = if chain == CHAIN_EXTERNAL { &inner.external } else { &inner.internal };
        list.iter()
            .find(|(_, a)| !inner.used_addresses.contains(a))
            .map(|(_, a)| a.clone())
            .expect("ensure_addresses keeps an unused tail")
    }

    /// The next unused receive address.
    pub fn receive_address(&self) -> Address {
        let mut inner = self.lock();
        self.ensure_addresses(&mut inner);
        Self::first_unused(&inner, CHAIN_EXTERNAL)
    }

    /// The next unused change address.
    pub fn change_address(&self) -> Address {
        let mut inner = self.lock();
        self.ensure_addresses(&mut inner);
        Self::first_unused(&inner, CHAIN_INTERNAL)
    }

    /// Up to `count` unused addresses from the requested chain, deriving
    /// past the gap limit as needed.
    pub fn unused_addresses(&self, count: u32, internal: bool) -> Vec<Address> {
        let chain = if internal { CHAIN_INTERNAL } else { CHAIN_EXTERNAL };
        let mut inner = self.lock();
        let extra = count.saturating_sub(inner.gap_limit);
        self.ensure_chain(&mut inner, chain, extra);
        let list = if internal { &inner.internal } else { &inner.external };
        list.iter()
            .filter(|(_, a)| !inner.used_addresses.contains(a))
            .take(count as usize)
            .map(|(_, a)| a.clone())
            .collect()
    }

    /// Every address the wallet has published, external then internal.
    pub fn all_addresses(&self) -> Vec<Address> {
        let inner = self.lock();
        inner
            .external
            .iter()
            .chain(inner.internal.iter())
            .map(|(_, a)| a.clone())
            .collect()
    }

    /// True when `address` belongs to this wallet.
    pub fn contains_address(&self, address: &Address) -> bool {
        self.lock().all_addresses.contains(address)
    }

    /// True when `address` has appeared in a known transaction.
    pub fn address_is_used(&self, address: &Address) -> bool {
        self.lock().used_addresses.contains(address)
    }

    /// Monotonic counter bumped whenever the published address window or
    /// UTXO set grows; peers rebuild their bloom filter when it moves.
    pub fn filter_generation(&self) -> u64 { self.lock().generation }

    /// Builds the bloom filter covering every published address and every
    /// unspent outpoint.
    pub fn bloom_filter(&self, fp_rate: f64, tweak: u32) -> BloomFilter {
        let inner = self.lock();
        let element_count = inner.all_addresses.len() + inner.utxos.len() + 100;
        let mut filter = BloomFilter::new(fp_rate, element_count, tweak, BLOOM_UPDATE_ALL);

        for address in &inner.all_addresses {
            if let Some(script) = address.script_pubkey(&self.params) {
                filter.insert(&script);
            }
            if let Some(hash) = address.hash160() {
                filter.insert(&hash);
            }
        }
        for utxo in &inner.utxos {
            filter.insert(&utxo.filter_element());
        }
        filter
    }

    // ---- ingestion -------------------------------------------------------

    fn mark_used_addresses(inner: &mut Inner, tx: &Transaction) {
        for output in &tx.outputs {
            if let Some(address) = &output.address {
                if inner.all_addresses.contains(address) {
                    inner.used_addresses.insert(address.clone());
                }
            }
        }
        for input in &tx.inputs {
            if let Some(address) = &input.address {
                if inner.all_addresses.contains(address) {
                    inner.used_addresses.insert(address.clone());
                }
            }
        }
    }

    fn is_relevant(inner: &Inner, tx: &Transaction) -> bool {
        if tx
            .outputs
            .iter()
            .any(|o| o.address.as_ref().is_some_and(|a| inner.all_addresses.contains(a)))
        {
            return true;
        }
        tx.inputs.iter().any(|input| {
            if input.address.as_ref().is_some_and(|a| inner.all_addresses.contains(a)) {
                return true;
            }
            inner
                .tx_map
                .get(&input.prev_hash)
                .and_then(|prev| prev.outputs.get(input.prev_index as usize))
                .and_then(|o| o.address.as_ref())
                .is_some_and(|a| inner.all_addresses.contains(a))
        })
    }

    fn tx_before(a: &Transaction, b: &Transaction) -> bool {
        if a.block_height != b.block_height {
            return a.block_height < b.block_height;
        }
        // Same height (or both unconfirmed): a funds b.
        b.inputs.iter().any(|i| i.prev_hash == a.hash)
    }

    fn insert_ordered(&self, inner: &mut Inner, hash: TxHash) {
        let tx = inner.tx_map.get(&hash).cloned().expect("caller inserted tx");
        let mut index = inner.ordered.len();
        while index > 0 {
            let prev = inner
                .tx_map
                .get(&inner.ordered[index - 1])
                .expect("ordered tracks tx_map");
            if Self::tx_before(&tx, prev) {
                index -= 1;
            } else {
                break;
            }
        }
        inner.ordered.insert(index, hash);
    }

    /// Registers a transaction that matched the wallet's filter.
    ///
    /// Returns true when the transaction was added (or already known).
    /// Transactions spending from the invalid set are rejected and join it
    /// transitively.
    pub fn register_transaction(&self, tx: &Transaction) -> bool {
        let mut events = Vec::new();
        let added = {
            let mut inner = self.lock();

            if !tx.is_signed() || tx.hash == TxHash::all_zeros() {
                return false;
            }
            if inner.tx_map.contains_key(&tx.hash) {
                // Already known; confirmation changes go through
                // `set_block_heights`.
                return true;
            }
            if inner.invalid.contains(&tx.hash) {
                return false;
            }
            if tx.inputs.iter().any(|i| inner.invalid.contains(&i.prev_hash)) {
                debug!(target: "wallet", "tx {} spends from an invalid ancestor", tx.hash);
                inner.invalid.insert(tx.hash);
                return false;
            }
            if !Self::is_relevant(&inner, tx) {
                return false;
            }

            inner.tx_map.insert(tx.hash, tx.clone());
            self.insert_ordered(&mut inner, tx.hash);
            Self::mark_used_addresses(&mut inner, tx);
            self.ensure_addresses(&mut inner);

            let old_balance = inner.balance;
            self.update_state(&mut inner);
            if inner.balance != old_balance {
                events.push(Event::Balance(inner.balance));
            }
            events.push(Event::Added(tx.clone()));
            true
        };

        self.fire(events);
        added
    }

    /// Removes a transaction and every descendant spending from it.
    pub fn remove_transaction(&self, tx_hash: TxHash) {
        let mut events = Vec::new();
        {
            let mut inner = self.lock();
            self.remove_recursive(&mut inner, tx_hash, &mut events);

            let old_balance = inner.balance;
            self.update_state(&mut inner);
            if inner.balance != old_balance {
                events.push(Event::Balance(inner.balance));
            }
        }
        self.fire(events);
    }

    fn remove_recursive(&self, inner: &mut Inner, tx_hash: TxHash, events: &mut Vec<Event>) {
        let dependents: Vec<TxHash> = inner
            .tx_map
            .values()
            .filter(|t| t.inputs.iter().any(|i| i.prev_hash == tx_hash))
            .map(|t| t.hash)
            .collect();
        for dependent in dependents {
            self.remove_recursive(inner, dependent, events);
        }

        if let Some(tx) = inner.tx_map.remove(&tx_hash) {
            inner.ordered.retain(|h| *h != tx_hash);
            let confirmed = tx.block_height != TX_UNCONFIRMED;
            let notify = !inner.invalid.contains(&tx_hash);
            events.push(Event::Deleted(tx_hash, notify, confirmed));
        }
    }

    /// Applies confirmation updates from the chain, reordering and
    /// re-deriving conflicts. Returns the hashes that actually changed.
    pub fn set_block_heights(
        &self,
        block_height: u32,
        timestamp: u32,
        tx_hashes: &[TxHash],
    ) -> Vec<TxHash> {
        let mut events = Vec::new();
        let updated = {
            let mut inner = self.lock();
            let mut updated = Vec::new();

            for hash in tx_hashes {
                let Some(tx) = inner.tx_map.get_mut(hash) else { continue };
                if tx.block_height == block_height && tx.timestamp == timestamp {
                    continue;
                }
                tx.block_height = block_height;
                tx.timestamp = timestamp;
                updated.push(*hash);
            }

            if !updated.is_empty() {
                for hash in &updated {
                    inner.ordered.retain(|h| h != hash);
                    self.insert_ordered(&mut inner, *hash);
                }
                let old_balance = inner.balance;
                self.update_state(&mut inner);
                events.push(Event::Updated(updated.clone(), block_height, timestamp));
                if inner.balance != old_balance {
                    events.push(Event::Balance(inner.balance));
                }
            }
            updated
        };
        self.fire(events);
        updated
    }

    /// Demotes every transaction above `height` to unconfirmed, the wallet
    /// half of a chain reorg. Returns the demoted hashes.
    pub fn set_tx_unconfirmed_after(&self, height: u32) -> Vec<TxHash> {
        let demoted: Vec<TxHash> = {
            let inner = self.lock();
            inner
                .tx_map
                .values()
                .filter(|t| t.block_height != TX_UNCONFIRMED && t.block_height > height)
                .map(|t| t.hash)
                .collect()
        };
        if !demoted.is_empty() {
            self.set_block_heights(TX_UNCONFIRMED, 0, &demoted);
        }
        demoted
    }

    /// Records the verified chain tip height, used by lock-time checks.
    pub fn set_chain_height(&self, height: u32) { self.lock().chain_height = height; }

    // ---- derived state ---------------------------------------------------

    fn unix_now() -> u32 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0)
    }

    /// Recomputes spent outpoints, invalid/pending sets, the UTXO list and
    /// the balance by walking the ordered transaction list.
    fn update_state(&self, inner: &mut Inner) {
        let now = Self::unix_now();
        // Rejected-but-never-added hashes stay invalid; registered ones are
        // re-derived below.
        let tx_map = std::mem::take(&mut inner.tx_map);
        inner.invalid.retain(|h| !tx_map.contains_key(h));
        inner.pending.clear();
        inner.spent_by.clear();
        let old_utxos = std::mem::take(&mut inner.utxos);

        let mut balance = 0u64;
        let mut total_received = 0u64;
        let mut total_sent = 0u64;

        for hash in inner.ordered.clone() {
            let tx = tx_map.get(&hash).expect("ordered tracks tx_map");

            // An unconfirmed tx that double-spends an earlier spend, or that
            // spends from an invalid tx, is invalid itself.
            if tx.block_height == TX_UNCONFIRMED {
                let conflicted = tx.inputs.iter().any(|input| {
                    let outpoint = Utxo { tx_hash: input.prev_hash, index: input.prev_index };
                    inner.spent_by.contains_key(&outpoint)
                        || inner.invalid.contains(&input.prev_hash)
                });
                if conflicted {
                    inner.invalid.insert(hash);
                    continue;
                }
            }

            for input in &tx.inputs {
                inner
                    .spent_by
                    .insert(Utxo { tx_hash: input.prev_hash, index: input.prev_index }, hash);
            }

            if tx.block_height == TX_UNCONFIRMED && Self::tx_is_pending(inner, tx, now) {
                inner.pending.insert(hash);
                continue;
            }

            for (index, output) in tx.outputs.iter().enumerate() {
                let ours = output
                    .address
                    .as_ref()
                    .is_some_and(|a| inner.all_addresses.contains(a));
                if ours {
                    inner.utxos.push(Utxo { tx_hash: hash, index: index as u32 });
                    balance += output.amount;
                    total_received += output.amount;
                }
            }

            for input in &tx.inputs {
                if let Some(prev) = tx_map.get(&input.prev_hash) {
                    if let Some(output) = prev.outputs.get(input.prev_index as usize) {
                        let ours = output
                            .address
                            .as_ref()
                            .is_some_and(|a| inner.all_addresses.contains(a));
                        if ours {
                            total_sent += output.amount;
                        }
                    }
                }
            }

            // Ordering is not guaranteed to be strictly topological, sweep
            // the whole UTXO list against the spent set each round.
            let spent_by = &inner.spent_by;
            inner.utxos.retain(|utxo| {
                if spent_by.contains_key(utxo) {
                    let amount = tx_map
                        .get(&utxo.tx_hash)
                        .and_then(|t| t.outputs.get(utxo.index as usize))
                        .map(|o| o.amount)
                        .unwrap_or(0);
                    balance -= amount;
                    false
                } else {
                    true
                }
            });
        }

        inner.tx_map = tx_map;
        if inner.utxos != old_utxos {
            inner.generation += 1;
        }
        inner.balance = balance;
        inner.total_received = total_received;
        inner.total_sent = total_sent;
    }

    fn tx_is_pending(inner: &Inner, tx: &Transaction, now: u32) -> bool {
        if tx.size() > TX_MAX_SIZE {
            return true;
        }
        if tx.outputs.iter().any(|o| o.amount < TX_MIN_OUTPUT_AMOUNT) {
            return true;
        }
        for input in &tx.inputs {
            if input.sequence < SEQUENCE_FINAL - 1 {
                return true; // replace-by-fee
            }
            if input.sequence < SEQUENCE_FINAL
                && tx.lock_time < TX_MAX_LOCK_HEIGHT
                && tx.lock_time > inner.chain_height + 1
            {
                return true; // future lockTime height
            }
            if input.sequence < SEQUENCE_FINAL
                && tx.lock_time >= TX_MAX_LOCK_HEIGHT
                && tx.lock_time > now
            {
                return true; // future lockTime timestamp
            }
            if inner.pending.contains(&input.prev_hash) {
                return true;
            }
        }
        false
    }

    // ---- queries ---------------------------------------------------------

    /// Spendable balance in smallest units.
    pub fn balance(&self) -> u64 { self.lock().balance }

    /// Lifetime amount received by wallet addresses.
    pub fn total_received(&self) -> u64 { self.lock().total_received }

    /// Lifetime amount spent from wallet addresses.
    pub fn total_sent(&self) -> u64 { self.lock().total_sent }

    /// Current unspent outpoints with their amounts.
    pub fn utxos(&self) -> Vec<(Utxo, u64)> {
        let inner = self.lock();
        inner
            .utxos
            .iter()
            .map(|utxo| {
                let amount = inner
                    .tx_map
                    .get(&utxo.tx_hash)
                    .and_then(|t| t.outputs.get(utxo.index as usize))
                    .map(|o| o.amount)
                    .unwrap_or(0);
                (*utxo, amount)
            })
            .collect()
    }

    /// All wallet transactions in chain order.
    pub fn transactions(&self) -> Vec<Transaction> {
        let inner = self.lock();
        inner
            .ordered
            .iter()
            .map(|h| inner.tx_map.get(h).cloned().expect("ordered tracks tx_map"))
            .collect()
    }

    /// Looks up one transaction.
    pub fn transaction_for_hash(&self, tx_hash: &TxHash) -> Option<Transaction> {
        self.lock().tx_map.get(tx_hash).cloned()
    }

    /// True when the wallet knows `tx_hash` (valid or not).
    pub fn contains_transaction(&self, tx_hash: &TxHash) -> bool {
        self.lock().tx_map.contains_key(tx_hash)
    }

    /// True when an unconfirmed transaction spends no invalid or
    /// already-spent inputs; confirmed transactions are always valid.
    pub fn transaction_is_valid(&self, tx: &Transaction) -> bool {
        let inner = self.lock();
        if tx.block_height != TX_UNCONFIRMED {
            return true;
        }
        if inner.invalid.contains(&tx.hash) {
            return false;
        }
        tx.inputs.iter().all(|input| {
            let outpoint = Utxo { tx_hash: input.prev_hash, index: input.prev_index };
            match inner.spent_by.get(&outpoint) {
                Some(spender) if *spender != tx.hash => false,
                _ => !inner.invalid.contains(&input.prev_hash),
            }
        })
    }

    /// Sum of outputs paying wallet addresses.
    pub fn amount_received_from(&self, tx: &Transaction) -> u64 {
        let inner = self.lock();
        tx.outputs
            .iter()
            .filter(|o| o.address.as_ref().is_some_and(|a| inner.all_addresses.contains(a)))
            .map(|o| o.amount)
            .sum()
    }

    /// Sum of wallet-owned outputs consumed by `tx`.
    pub fn amount_sent_by(&self, tx: &Transaction) -> u64 {
        let inner = self.lock();
        tx.inputs
            .iter()
            .filter_map(|input| {
                let prev = inner.tx_map.get(&input.prev_hash)?;
                let output = prev.outputs.get(input.prev_index as usize)?;
                let address = output.address.as_ref()?;
                inner.all_addresses.contains(address).then_some(output.amount)
            })
            .sum()
    }

    /// Fee paid by `tx`, when every input's funding output is known.
    pub fn fee_for_tx(&self, tx: &Transaction) -> Option<u64> {
        let inner = self.lock();
        let mut input_total = 0u64;
        for input in &tx.inputs {
            let prev = inner.tx_map.get(&input.prev_hash)?;
            let output = prev.outputs.get(input.prev_index as usize)?;
            input_total += output.amount;
        }
        let output_total: u64 = tx.outputs.iter().map(|o| o.amount).sum();
        input_total.checked_sub(output_total)
    }

    // ---- fee policy ------------------------------------------------------

    /// Current fee rate per 1000 bytes.
    pub fn fee_per_kb(&self) -> u64 { self.lock().fee_per_kb }

    /// Adjusts the fee rate used by transaction construction.
    pub fn set_fee_per_kb(&self, fee_per_kb: u64) { self.lock().fee_per_kb = fee_per_kb; }

    /// Fee for a transaction of `size` bytes at the current rate.
    pub fn fee_for_tx_size(&self, size: usize) -> u64 {
        let fee_per_kb = self.lock().fee_per_kb;
        Self::fee_for_size(fee_per_kb, size)
    }

    fn fee_for_size(fee_per_kb: u64, size: usize) -> u64 {
        (size as u64 + 999) / 1000 * fee_per_kb
    }

    /// Smallest output the wallet will create, scaled with the fee rate.
    pub fn min_output_amount(&self) -> u64 {
        let fee_per_kb = self.lock().fee_per_kb;
        let amount = fee_per_kb * 3 * (TX_OUTPUT_SIZE as u64 + TX_INPUT_SIZE as u64) / 1000;
        amount.max(TX_MIN_OUTPUT_AMOUNT)
    }

    /// Everything spendable after fees when emptying the wallet.
    pub fn max_output_amount(&self) -> u64 {
        let inner = self.lock();
        let mut amount = 0u64;
        let mut input_count = 0usize;
        for utxo in &inner.utxos {
            let Some(tx) = inner.tx_map.get(&utxo.tx_hash) else { continue };
            if inner.invalid.contains(&tx.hash) || inner.pending.contains(&tx.hash) {
                continue;
            }
            let Some(output) = tx.outputs.get(utxo.index as usize) else { continue };
            amount += output.amount;
            input_count += 1;
        }
        let size = 8 + 2 + input_count * TX_INPUT_SIZE + TX_OUTPUT_SIZE;
        amount.saturating_sub(Self::fee_for_size(inner.fee_per_kb, size))
    }

    // ---- transaction construction ---------------------------------------

    /// Builds an unsigned transaction paying `amount` to `address`.
    pub fn create_transaction(
        &self,
        amount: u64,
        address: &Address,
    ) -> Result<Transaction, WalletError> {
        let output =
            TxOutput::pay_to(address, amount, &self.params).ok_or(WalletError::AddressUnknown)?;
        self.create_tx_for_outputs(&[output])
    }

    /// Builds an unsigned transaction for an arbitrary output set, selecting
    /// inputs and adding change.
    pub fn create_tx_for_outputs(&self, outputs: &[TxOutput]) -> Result<Transaction, WalletError> {
        if outputs.is_empty() {
            return Err(WalletError::OutputTooSmall);
        }
        let min_output = self.min_output_amount();
        if outputs.iter().any(|o| o.amount < min_output || o.script.is_empty()) {
            return Err(WalletError::OutputTooSmall);
        }

        let mut inner = self.lock();
        let fee_per_kb = inner.fee_per_kb;
        let target: u64 = outputs.iter().map(|o| o.amount).sum();

        let mut tx = Transaction::new();
        for output in outputs {
            tx.add_output(output.clone());
        }

        // Selectable coins: confirmed, or our own signed and unblocked
        // spends.
        let mut candidates: Vec<(Utxo, u64, u32)> = Vec::new();
        for utxo in &inner.utxos {
            let Some(funding) = inner.tx_map.get(&utxo.tx_hash) else { continue };
            if inner.invalid.contains(&funding.hash) || inner.pending.contains(&funding.hash) {
                continue;
            }
            let confirmed = funding.block_height != TX_UNCONFIRMED;
            if !confirmed {
                let wallet_originated = funding.inputs.iter().any(|input| {
                    inner
                        .tx_map
                        .get(&input.prev_hash)
                        .and_then(|p| p.outputs.get(input.prev_index as usize))
                        .and_then(|o| o.address.as_ref())
                        .is_some_and(|a| inner.all_addresses.contains(a))
                });
                if !wallet_originated || !funding.is_signed() {
                    continue;
                }
            }
            let output = &funding.outputs[utxo.index as usize];
            candidates.push((*utxo, output.amount, funding.block_height));
        }

        // Oldest confirmations first, small coins first within a height.
        candidates.sort_by_key(|(_, amount, height)| (*height, *amount));

        let mut selected: Vec<(Utxo, u64)> = Vec::new();
        let mut total = 0u64;
        let mut covered = false;
        for (utxo, amount, _) in &candidates {
            let funding = inner.tx_map.get(&utxo.tx_hash).expect("candidate exists");
            let output = &funding.outputs[utxo.index as usize];

            let mut input = TxInput::new(utxo.tx_hash, utxo.index, output.amount);
            input.set_script(&output.script, &self.params);
            tx.add_input(input);
            selected.push((*utxo, *amount));
            total += amount;

            let fee = Self::fee_for_size(fee_per_kb, tx.size() + TX_OUTPUT_SIZE);
            if total >= target + fee {
                covered = true;
                break;
            }
        }

        if !covered {
            return Err(WalletError::InsufficientFunds);
        }

        // Drop the largest selected coins while the rest still cover the
        // target, to keep big outputs unbroken.
        loop {
            if selected.len() <= 1 {
                break;
            }
            let (drop_position, drop_amount) = selected
                .iter()
                .enumerate()
                .max_by_key(|(_, entry)| entry.1)
                .map(|(position, entry)| (position, entry.1))
                .expect("selection is non-empty");
            let fee =
                Self::fee_for_size(fee_per_kb, tx.size() - TX_INPUT_SIZE + TX_OUTPUT_SIZE);
            if total - drop_amount >= target + fee {
                total -= drop_amount;
                selected.remove(drop_position);
                tx.inputs.remove(drop_position);
            } else {
                break;
            }
        }

        if tx.size() + TX_OUTPUT_SIZE > TX_MAX_SIZE {
            return Err(WalletError::TxTooLarge);
        }

        let fee_with_change = Self::fee_for_size(fee_per_kb, tx.size() + TX_OUTPUT_SIZE);
        if total >= target + fee_with_change + min_output {
            // Change goes to the next unused internal address; the leftover
            // otherwise folds into the fee.
            self.ensure_addresses(&mut inner);
            let change = Self::first_unused(&inner, CHAIN_INTERNAL);
            let change_output = TxOutput::pay_to(&change, total - target - fee_with_change, &self.params)
                .ok_or(WalletError::AddressUnknown)?;
            tx.add_output(change_output);
            tx.shuffle_outputs(&mut FnvTimeRng::new());
        }

        Ok(tx)
    }

    /// Signs `tx` with keys derived from `seed` for every input paying a
    /// wallet address. Returns whether the transaction ended fully signed.
    pub fn sign_transaction(
        &self,
        tx: &mut Transaction,
        fork_id: u32,
        seed: &[u8],
    ) -> Result<bool, DerivationError> {
        let (external_indexes, internal_indexes) = {
            let inner = self.lock();
            let mut external = Vec::new();
            let mut internal = Vec::new();
            for input in &tx.inputs {
                let Some(address) = input
                    .address
                    .clone()
                    .or_else(|| Address::from_script_pubkey(&input.script, &self.params))
                else {
                    continue;
                };
                if let Some((index, _)) =
                    inner.external.iter().find(|(_, a)| *a == address)
                {
                    external.push(*index);
                } else if let Some((index, _)) =
                    inner.internal.iter().find(|(_, a)| *a == address)
                {
                    internal.push(*index);
                }
            }
            (external, internal)
        };

        let mut keys =
            bip32::priv_key_list(seed, CHAIN_EXTERNAL, &external_indexes)?;
        keys.extend(bip32::priv_key_list(seed, CHAIN_INTERNAL, &internal_indexes)?);
        Ok(tx.sign(fork_id, &keys, &self.params))
    }
}


#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use primitives::hashes::{sha256d, Hash};
    use primitives::{Key, MasterPubKey};

    use super::*;
    use crate::delegate::NullDelegate;

    const SEED: [u8; 16] =
        [0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f];

    #[derive(Default)]
    struct Recorder {
        balances: StdMutex<Vec<u64>>,
        updated: StdMutex<Vec<(Vec<TxHash>, u32, u32)>>,
        deleted: StdMutex<Vec<(TxHash, bool, bool)>>,
    }

    impl WalletDelegate for Recorder {
        fn balance_changed(&self, balance: u64) {
            self.balances.lock().unwrap().push(balance);
        }
        fn tx_updated(&self, tx_hashes: &[TxHash], block_height: u32, timestamp: u32) {
            self.updated.lock().unwrap().push((tx_hashes.to_vec(), block_height, timestamp));
        }
        fn tx_deleted(&self, tx_hash: TxHash, notify_user: bool, recommend_rescan: bool) {
            self.deleted.lock().unwrap().push((tx_hash, notify_user, recommend_rescan));
        }
    }

    fn new_wallet(delegate: Arc<dyn WalletDelegate>) -> Wallet {
        Wallet::new(
            ChainParams::mainnet(),
            MasterPubKey::from_seed(&SEED).unwrap(),
            Vec::new(),
            delegate,
        )
    }

    fn outpoint(byte: u8) -> TxHash { sha256d::Hash::hash(&[byte]) }

    /// A signed-looking transaction paying `amount` to `address` from a
    /// foreign outpoint.
    fn funding_tx(
        address: &Address,
        amount: u64,
        prev: TxHash,
        block_height: u32,
        params: &ChainParams,
    ) -> Transaction {
        let mut tx = Transaction::new();
        let mut input = TxInput::new(prev, 0, 0);
        input.set_signature(&[0x01, 0x55], params);
        tx.add_input(input);
        tx.add_output(TxOutput::pay_to(address, amount, params).unwrap());
        tx.block_height = block_height;
        tx.hash = sha256d::Hash::hash(&tx.serialize());
        tx
    }

    /// A signed-looking transaction spending `(prev, index)` to `address`.
    fn spending_tx(
        prev: TxHash,
        index: u32,
        address: &Address,
        amount: u64,
        block_height: u32,
        params: &ChainParams,
    ) -> Transaction {
        let mut tx = Transaction::new();
        let mut input = TxInput::new(prev, index, 0);
        input.set_signature(&[0x01, 0x66], params);
        tx.add_input(input);
        tx.add_output(TxOutput::pay_to(address, amount, params).unwrap());
        tx.block_height = block_height;
        tx.hash = sha256d::Hash::hash(&tx.serialize());
        tx
    }

    fn foreign_address(params: &ChainParams) -> Address {
        Key::from_secret(&[0x42; 32], true).unwrap().address(params)
    }

    #[test]
    fn publishes_gap_limit_addresses() {
        let wallet = new_wallet(Arc::new(NullDelegate));
        let all = wallet.all_addresses();
        assert_eq!(all.len(), 2 * DEFAULT_GAP_LIMIT as usize);

        let receive = wallet.receive_address();
        let change = wallet.change_address();
        assert_ne!(receive, change);
        assert!(wallet.contains_address(&receive));
        assert!(!wallet.address_is_used(&receive));
    }

    #[test]
    fn funding_updates_balance_and_watermark() {
        let params = ChainParams::mainnet();
        let wallet = new_wallet(Arc::new(NullDelegate));
        let receive = wallet.receive_address();

        let tx = funding_tx(&receive, 50_000, outpoint(1), 100, &params);
        assert!(wallet.register_transaction(&tx));

        assert_eq!(wallet.balance(), 50_000);
        assert_eq!(wallet.total_received(), 50_000);
        assert_eq!(wallet.utxos(), vec![(Utxo { tx_hash: tx.hash, index: 0 }, 50_000)]);
        assert!(wallet.address_is_used(&receive));
        // The watermark advanced: a fresh unused address is served.
        assert_ne!(wallet.receive_address(), receive);
        // Gap limit of unused addresses still published past the used one.
        assert_eq!(wallet.all_addresses().len(), 2 * DEFAULT_GAP_LIMIT as usize + 1);
        assert_eq!(wallet.amount_received_from(&tx), 50_000);
        assert_eq!(wallet.amount_sent_by(&tx), 0);
    }

    #[test]
    fn irrelevant_and_unsigned_rejected() {
        let params = ChainParams::mainnet();
        let wallet = new_wallet(Arc::new(NullDelegate));

        let elsewhere = funding_tx(&foreign_address(&params), 50_000, outpoint(2), 100, &params);
        assert!(!wallet.register_transaction(&elsewhere));

        let mut unsigned = funding_tx(&wallet.receive_address(), 50_000, outpoint(3), 100, &params);
        unsigned.inputs[0].signature = None;
        assert!(!wallet.register_transaction(&unsigned));
        assert_eq!(wallet.balance(), 0);
    }

    #[test]
    fn spend_tracking() {
        let params = ChainParams::mainnet();
        let wallet = new_wallet(Arc::new(NullDelegate));
        let receive = wallet.receive_address();

        let fund = funding_tx(&receive, 80_000, outpoint(4), 100, &params);
        wallet.register_transaction(&fund);

        let spend =
            spending_tx(fund.hash, 0, &foreign_address(&params), 79_000, 101, &params);
        assert!(wallet.register_transaction(&spend));

        assert_eq!(wallet.balance(), 0);
        assert_eq!(wallet.amount_sent_by(&spend), 80_000);
        assert_eq!(wallet.fee_for_tx(&spend), Some(1_000));
        assert!(wallet.utxos().is_empty());

        // Chain order: both confirmed, ascending height.
        let ordered: Vec<TxHash> = wallet.transactions().iter().map(|t| t.hash).collect();
        assert_eq!(ordered, vec![fund.hash, spend.hash]);
    }

    #[test]
    fn create_sign_and_register_round_trip() {
        let params = ChainParams::mainnet();
        let wallet = new_wallet(Arc::new(NullDelegate));
        let receive = wallet.receive_address();

        wallet.register_transaction(&funding_tx(&receive, 40_000, outpoint(5), 100, &params));
        let second = wallet.unused_addresses(1, false)[0].clone();
        wallet.register_transaction(&funding_tx(&second, 100_000, outpoint(6), 100, &params));
        assert_eq!(wallet.balance(), 140_000);

        let dest = foreign_address(&params);
        let mut tx = wallet.create_transaction(30_000, &dest).unwrap();

        // Smallest sufficient coin selected, change to an internal address.
        assert_eq!(tx.inputs.len(), 1);
        assert_eq!(tx.inputs[0].amount, 40_000);
        assert_eq!(tx.outputs.len(), 2);
        let paid: u64 = tx.outputs.iter().map(|o| o.amount).sum();
        let fee = 40_000 - paid;
        assert!(fee >= 1_000, "fee {} covers at least one kb", fee);
        let change = tx
            .outputs
            .iter()
            .find(|o| o.address.as_ref() != Some(&dest))
            .expect("change output present");
        assert!(wallet.contains_address(change.address.as_ref().unwrap()));
        let change_amount = change.amount;

        assert_eq!(wallet.sign_transaction(&mut tx, 0, &SEED), Ok(true));
        assert!(tx.is_signed());

        assert!(wallet.register_transaction(&tx));
        assert_eq!(wallet.balance(), 100_000 + change_amount);

        // The same outpoint is never offered twice.
        let again = wallet.create_transaction(90_000, &dest).unwrap();
        assert!(again.inputs.iter().all(|i| i.prev_hash != tx.inputs[0].prev_hash));
    }

    #[test]
    fn construction_errors() {
        let params = ChainParams::mainnet();
        let wallet = new_wallet(Arc::new(NullDelegate));
        let dest = foreign_address(&params);

        assert_eq!(wallet.create_transaction(50_000, &dest), Err(WalletError::InsufficientFunds));
        assert_eq!(wallet.create_transaction(100, &dest), Err(WalletError::OutputTooSmall));

        // An unconfirmed foreign receive is not selectable.
        let receive = wallet.receive_address();
        wallet.register_transaction(&funding_tx(
            &receive,
            50_000,
            outpoint(7),
            TX_UNCONFIRMED,
            &params,
        ));
        assert_eq!(wallet.balance(), 50_000);
        assert_eq!(wallet.create_transaction(20_000, &dest), Err(WalletError::InsufficientFunds));
    }

    #[test]
    fn double_spend_marks_later_arrival_invalid() {
        let params = ChainParams::mainnet();
        let wallet = new_wallet(Arc::new(NullDelegate));
        let receive = wallet.receive_address();
        let elsewhere = foreign_address(&params);

        let fund = funding_tx(&receive, 60_000, outpoint(8), 100, &params);
        wallet.register_transaction(&fund);

        // An unconfirmed spend arrives first.
        let ours = spending_tx(fund.hash, 0, &elsewhere, 59_000, TX_UNCONFIRMED, &params);
        wallet.register_transaction(&ours);
        assert!(wallet.transaction_is_valid(&ours));
        assert_eq!(wallet.balance(), 0);

        // A competing spend confirms: the unconfirmed one turns invalid.
        let competing = spending_tx(fund.hash, 0, &elsewhere, 58_000, 150, &params);
        wallet.register_transaction(&competing);
        assert!(!wallet.transaction_is_valid(&ours));
        assert_eq!(wallet.balance(), 0);

        // Spending from the invalid tx is rejected transitively.
        let child = spending_tx(ours.hash, 0, &receive, 10_000, TX_UNCONFIRMED, &params);
        assert!(!wallet.register_transaction(&child));
        assert!(!wallet.contains_transaction(&child.hash));
    }

    #[test]
    fn reorg_demotes_confirmation_and_keeps_balance() {
        let params = ChainParams::mainnet();
        let recorder = Arc::new(Recorder::default());
        let wallet = new_wallet(recorder.clone());
        let receive = wallet.receive_address();

        let fund = funding_tx(&receive, 70_000, outpoint(9), 120, &params);
        wallet.register_transaction(&fund);
        assert_eq!(wallet.balance(), 70_000);

        // The confirming branch lost: the tx drops back to unconfirmed.
        let updated = wallet.set_tx_unconfirmed_after(119);
        assert_eq!(updated, vec![fund.hash]);

        let events = recorder.updated.lock().unwrap();
        assert_eq!(events.last(), Some(&(vec![fund.hash], TX_UNCONFIRMED, 0)));
        drop(events);

        // Still valid, so the balance is untouched.
        assert_eq!(wallet.balance(), 70_000);
        assert_eq!(
            wallet.transaction_for_hash(&fund.hash).unwrap().block_height,
            TX_UNCONFIRMED
        );
    }

    #[test]
    fn remove_transaction_cascades() {
        let params = ChainParams::mainnet();
        let recorder = Arc::new(Recorder::default());
        let wallet = new_wallet(recorder.clone());
        let receive = wallet.receive_address();

        let fund = funding_tx(&receive, 90_000, outpoint(10), 100, &params);
        wallet.register_transaction(&fund);
        let spend = spending_tx(fund.hash, 0, &foreign_address(&params), 89_000, TX_UNCONFIRMED, &params);
        wallet.register_transaction(&spend);

        wallet.remove_transaction(fund.hash);
        assert!(!wallet.contains_transaction(&fund.hash));
        assert!(!wallet.contains_transaction(&spend.hash));
        assert_eq!(wallet.balance(), 0);

        let deleted = recorder.deleted.lock().unwrap();
        // Descendant first, then the removed tx; the confirmed one
        // recommends a rescan.
        assert_eq!(deleted.len(), 2);
        assert_eq!(deleted[0].0, spend.hash);
        assert_eq!(deleted[1], (fund.hash, true, true));
    }

    #[test]
    fn persisted_transactions_reload() {
        let params = ChainParams::mainnet();
        let bootstrap = new_wallet(Arc::new(NullDelegate));
        let receive = bootstrap.receive_address();
        let fund = funding_tx(&receive, 25_000, outpoint(11), 90, &params);

        let wallet = Wallet::new(
            params,
            MasterPubKey::from_seed(&SEED).unwrap(),
            vec![fund.clone()],
            Arc::new(NullDelegate),
        );
        assert_eq!(wallet.balance(), 25_000);
        assert!(wallet.address_is_used(&receive));
        assert_ne!(wallet.receive_address(), receive);
    }

    #[test]
    fn bloom_filter_covers_addresses_and_utxos() {
        let params = ChainParams::mainnet();
        let wallet = new_wallet(Arc::new(NullDelegate));
        let receive = wallet.receive_address();
        let fund = funding_tx(&receive, 30_000, outpoint(12), 100, &params);
        wallet.register_transaction(&fund);

        let generation = wallet.filter_generation();
        let filter = wallet.bloom_filter(0.0005, 0);
        for address in wallet.all_addresses() {
            assert!(filter.contains(&address.script_pubkey(&params).unwrap()));
        }
        let utxo = Utxo { tx_hash: fund.hash, index: 0 };
        assert!(filter.contains(&utxo.filter_element()));

        // Registering new activity advances the generation.
        let spend = spending_tx(fund.hash, 0, &foreign_address(&params), 29_000, 101, &params);
        wallet.register_transaction(&spend);
        assert!(wallet.filter_generation() > generation);
    }

    #[test]
    fn fee_policy_scales() {
        let wallet = new_wallet(Arc::new(NullDelegate));
        assert_eq!(wallet.fee_for_tx_size(200), 1_000);
        assert_eq!(wallet.fee_for_tx_size(1_001), 2_000);
        assert_eq!(wallet.min_output_amount(), TX_MIN_OUTPUT_AMOUNT);

        wallet.set_fee_per_kb(10_000);
        assert_eq!(wallet.fee_for_tx_size(200), 10_000);
        assert_eq!(wallet.min_output_amount(), 10_000 * 3 * 182 / 1000);
    }
}
