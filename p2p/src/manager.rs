// SPDX-License-Identifier: CC0-1.0

//! The peer pool and SPV chain assembly.
//!
//! The manager dials up to [`PEER_MAX_CONNECTIONS`] peers, elects one
//! download peer to carry the bloom filter and the header/merkle-block
//! pipeline, folds relayed blocks into a block index with orphan handling
//! and difficulty validation, cross-references matched transactions into
//! the wallet, and fans published transactions out to every peer.
//!
//! Lock order is `manager lock -> wallet lock -> peer write lock`, never
//! the reverse; wallet calls and host callbacks run after the manager lock
//! is released.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use primitives::chain::DIFFICULTY_INTERVAL;
use primitives::hashes::{sha256d, Hash};
use primitives::merkle_block::BLOCK_UNKNOWN_HEIGHT;
use primitives::{BlockHash, ChainParams, MerkleBlock, Transaction, TxHash, U256};
use rand::seq::SliceRandom;
use rand::Rng;
use wallet::Wallet;

use crate::message::{Message, PeerInfo, INV_FILTERED_BLOCK, INV_TX};
use crate::peer::{Peer, PeerListener, PeerStatus};
use crate::{ConsensusError, NetworkError, PublishError};

/// Connection pool size.
pub const PEER_MAX_CONNECTIONS: usize = 3;

/// How long a misbehaving peer's address stays banned.
pub const BAN_DURATION_SECS: u64 = 60 * 60;

/// Deadline for some peer to request a published transaction.
pub const PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);

/// Base per-address redial delay; doubles per consecutive failure.
const RETRY_BASE_SECS: u64 = 30;

/// Upper bound on the persisted candidate list.
const MAX_CANDIDATES: usize = 2_500;

/// Bloom filter false-positive rate loaded into the download peer.
const FILTER_FALSE_POSITIVE_RATE: f64 = 0.0005;

/// Headers instead of merkle blocks this far before the earliest key.
const HEADER_WINDOW_SECS: u32 = 7 * 24 * 60 * 60;

/// Host callbacks fired by the peer manager, outside its lock.
pub trait ManagerDelegate: Send + Sync {
    /// Blockchain syncing started.
    fn sync_started(&self) {}
    /// Blockchain syncing stopped; `error` is `None` on a local disconnect.
    fn sync_stopped(&self, _error: Option<NetworkError>) {}
    /// Transaction confirmation status may have changed.
    fn tx_status_update(&self) {}
    /// Persist blocks; `replace` asks to drop previously saved ones first.
    fn save_blocks(&self, _replace: bool, _blocks: &[MerkleBlock]) {}
    /// Persist peer addresses; `replace` drops previously saved ones first.
    fn save_peers(&self, _replace: bool, _peers: &[PeerInfo]) {}
    /// Whether the host currently has network connectivity.
    fn network_is_reachable(&self) -> bool { true }
    /// A manager-owned thread is about to exit.
    fn thread_cleanup(&self) {}
}

/// Delegate that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullManagerDelegate;

impl ManagerDelegate for NullManagerDelegate {}

type PublishCallback = Box<dyn FnOnce(Result<(), PublishError>) + Send>;

struct ManagerInner {
    blocks: HashMap<BlockHash, Arc<MerkleBlock>>,
    chain_work: HashMap<BlockHash, U256>,
    /// Blocks whose parent has not arrived yet, keyed by that parent.
    orphans: HashMap<BlockHash, Vec<MerkleBlock>>,
    tip: Arc<MerkleBlock>,
    candidates: Vec<PeerInfo>,
    connected: Vec<Arc<Peer>>,
    download_peer: Option<Arc<Peer>>,
    fixed_peer: Option<PeerInfo>,
    publish: HashMap<TxHash, PublishCallback>,
    tx_relays: HashMap<TxHash, HashSet<SocketAddr>>,
    /// Confirmation slots for matched txs the wallet has not seen yet.
    block_for_tx: HashMap<TxHash, (u32, u32)>,
    banned: HashMap<IpAddr, u64>,
    retry_at: HashMap<SocketAddr, (u32, u64)>,
    filter_generation: Option<u64>,
    filter_tweak: u32,
    estimated_height: u32,
    running: bool,
    syncing: bool,
}

/// The SPV peer manager.
pub struct PeerManager {
    params: ChainParams,
    wallet: Arc<Wallet>,
    earliest_key_time: u32,
    delegate: Arc<dyn ManagerDelegate>,
    inner: Mutex<ManagerInner>,
    self_ref: Mutex<Weak<PeerManager>>,
}

impl core::fmt::Debug for PeerManager {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("PeerManager")
            .field("network", &self.params.network)
            .finish_non_exhaustive()
    }
}

fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// A placeholder block for a checkpoint, enough to anchor the chain.
fn checkpoint_block(params: &ChainParams, height_limit_time: u32) -> MerkleBlock {
    let checkpoint = params
        .checkpoints
        .iter()
        .rev()
        .find(|c| c.timestamp <= height_limit_time)
        .unwrap_or(&params.checkpoints[0]);
    MerkleBlock {
        block_hash: checkpoint.block_hash(),
        pow_hash: [0u8; 32],
        version: 1,
        prev_block: BlockHash::all_zeros(),
        merkle_root: sha256d::Hash::all_zeros(),
        timestamp: checkpoint.timestamp,
        target: checkpoint.target,
        nonce: 0,
        total_tx: 0,
        hashes: Vec::new(),
        flags: Vec::new(),
        height: checkpoint.height,
    }
}

impl PeerManager {
    /// Builds a manager over `wallet` with persisted blocks and peers.
    pub fn new(
        params: ChainParams,
        wallet: Arc<Wallet>,
        earliest_key_time: u32,
        blocks: Vec<MerkleBlock>,
        peers: Vec<PeerInfo>,
        delegate: Arc<dyn ManagerDelegate>,
    ) -> Arc<Self> {
        let anchor = checkpoint_block(&params, earliest_key_time);
        let mut index: HashMap<BlockHash, Arc<MerkleBlock>> = HashMap::new();
        let mut chain_work: HashMap<BlockHash, U256> = HashMap::new();

        index.insert(anchor.block_hash, Arc::new(anchor.clone()));
        chain_work.insert(anchor.block_hash, U256::ZERO);

        let mut tip = Arc::new(anchor);
        let mut persisted: Vec<MerkleBlock> =
            blocks.into_iter().filter(|b| b.height != BLOCK_UNKNOWN_HEIGHT).collect();
        persisted.sort_by_key(|b| b.height);
        for block in persisted {
            let work = chain_work
                .get(&block.prev_block)
                .copied()
                .unwrap_or(U256::ZERO)
                .wrapping_add(block.work());
            let arc = Arc::new(block);
            chain_work.insert(arc.block_hash, work);
            if arc.height >= tip.height {
                tip = Arc::clone(&arc);
            }
            index.insert(arc.block_hash, arc);
        }

        let manager = Arc::new(PeerManager {
            params,
            wallet,
            earliest_key_time,
            delegate,
            inner: Mutex::new(ManagerInner {
                blocks: index,
                chain_work,
                orphans: HashMap::new(),
                tip,
                candidates: peers,
                connected: Vec::new(),
                download_peer: None,
                fixed_peer: None,
                publish: HashMap::new(),
                tx_relays: HashMap::new(),
                block_for_tx: HashMap::new(),
                banned: HashMap::new(),
                retry_at: HashMap::new(),
                filter_generation: None,
                filter_tweak: rand::thread_rng().gen(),
                estimated_height: 0,
                running: false,
                syncing: false,
            }),
            self_ref: Mutex::new(Weak::new()),
        });
        *manager.self_ref.lock().expect("manager self ref") = Arc::downgrade(&manager);
        manager
    }

    fn lock(&self) -> MutexGuard<'_, ManagerInner> {
        self.inner.lock().expect("manager lock poisoned")
    }

    fn arc(&self) -> Arc<Self> {
        self.self_ref
            .lock()
            .expect("manager self ref")
            .upgrade()
            .expect("manager alive while in use")
    }

    /// The standard port for this chain.
    pub fn standard_port(&self) -> u16 { self.params.port }

    /// Overrides peer discovery with a single fixed peer; `None` reverts to
    /// the default behavior.
    pub fn set_fixed_peer(&self, peer: Option<PeerInfo>) { self.lock().fixed_peer = peer; }

    /// Current verified chain height.
    pub fn last_block_height(&self) -> u32 { self.lock().tip.height }

    /// Current verified chain tip timestamp.
    pub fn last_block_timestamp(&self) -> u32 { self.lock().tip.timestamp }

    /// Best height reported by connected peers, unverified.
    pub fn estimated_block_height(&self) -> u32 {
        let inner = self.lock();
        inner.estimated_height.max(inner.tip.height)
    }

    /// Sync progress in `[0, 1]`, relative to `start_height`.
    pub fn sync_progress(&self, start_height: u32) -> f64 {
        let inner = self.lock();
        let last = inner.tip.height;
        let estimated = inner.estimated_height.max(last);
        if !inner.running {
            return 0.0;
        }
        if estimated <= last || estimated == start_height {
            return 1.0;
        }
        let done = last.saturating_sub(start_height) as f64;
        let goal = (estimated - start_height) as f64;
        0.1 + 0.9 * (done / goal).clamp(0.0, 1.0)
    }

    /// Number of fully connected peers.
    pub fn peer_count(&self) -> usize {
        self.lock()
            .connected
            .iter()
            .filter(|p| p.status() == PeerStatus::Connected)
            .count()
    }

    /// Pool status: connected if any peer finished its handshake.
    pub fn connect_status(&self) -> PeerStatus {
        let inner = self.lock();
        let mut status = PeerStatus::Disconnected;
        for peer in &inner.connected {
            match peer.status() {
                PeerStatus::Connected => return PeerStatus::Connected,
                PeerStatus::Handshaking | PeerStatus::Connecting =>
                    status = PeerStatus::Connecting,
                PeerStatus::Disconnected => {}
            }
        }
        status
    }

    /// True once any peer completed its handshake.
    pub fn is_connected(&self) -> bool { self.connect_status() == PeerStatus::Connected }

    /// `host:port` of the current download peer.
    pub fn download_peer_name(&self) -> Option<String> {
        self.lock().download_peer.as_ref().map(|p| p.host())
    }

    /// Peers that have relayed `tx_hash`.
    pub fn relay_count(&self, tx_hash: TxHash) -> usize {
        self.lock().tx_relays.get(&tx_hash).map(HashSet::len).unwrap_or(0)
    }

    // ---- connection management -------------------------------------------

    /// Opens connections toward the network.
    ///
    /// Call again whenever `network_is_reachable` flips back to true.
    pub fn connect(&self) {
        if !self.delegate.network_is_reachable() {
            debug!(target: "manager", "network unreachable, not connecting");
            return;
        }
        {
            let mut inner = self.lock();
            inner.running = true;
            if inner.candidates.len() < PEER_MAX_CONNECTIONS {
                let seeds = self.resolve_dns_seeds();
                Self::merge_candidates(&mut inner, seeds);
            }
        }
        self.fill_connections();
    }

    /// Closes every peer, joins their threads and cancels pending
    /// publishes.
    pub fn disconnect(&self) {
        let (peers, callbacks, candidates) = {
            let mut inner = self.lock();
            inner.running = false;
            inner.download_peer = None;
            let peers: Vec<Arc<Peer>> = inner.connected.drain(..).collect();
            let callbacks: Vec<PublishCallback> =
                inner.publish.drain().map(|(_, cb)| cb).collect();
            (peers, callbacks, inner.candidates.clone())
        };

        for peer in &peers {
            peer.disconnect();
        }
        for peer in &peers {
            peer.join();
        }
        for callback in callbacks {
            callback(Err(PublishError::Canceled));
        }
        self.delegate.save_peers(true, &candidates);
        self.delegate.sync_stopped(None);
    }

    /// Drops chain state back to before the earliest key and re-syncs from
    /// a fresh download peer.
    pub fn rescan(&self) {
        let download = {
            let mut inner = self.lock();
            let anchor = checkpoint_block(&self.params, self.earliest_key_time);
            inner.blocks.clear();
            inner.chain_work.clear();
            inner.orphans.clear();
            inner.block_for_tx.clear();
            inner.chain_work.insert(anchor.block_hash, U256::ZERO);
            let anchor = Arc::new(anchor);
            inner.blocks.insert(anchor.block_hash, Arc::clone(&anchor));
            inner.tip = anchor;
            inner.download_peer.take()
        };

        self.delegate.save_blocks(true, &[]);
        // A malicious download peer could have omitted filter matches, so
        // the rescan must use a different one.
        if let Some(peer) = download {
            peer.disconnect();
        } else {
            self.elect_download_peer();
        }
    }

    fn resolve_dns_seeds(&self) -> Vec<PeerInfo> {
        let mut found = Vec::new();
        let now = unix_now() as u32;
        for seed in self.params.dns_seeds {
            match (*seed, self.params.port).to_socket_addrs() {
                Ok(addrs) => {
                    for addr in addrs {
                        found.push(PeerInfo::from_socket_addr(addr, 0, now));
                    }
                }
                Err(e) => debug!(target: "manager", "dns seed {} failed: {}", seed, e),
            }
        }
        info!(target: "manager", "dns seeds yielded {} addresses", found.len());
        found
    }

    fn merge_candidates(inner: &mut ManagerInner, peers: Vec<PeerInfo>) -> Vec<PeerInfo> {
        let known: HashSet<SocketAddr> =
            inner.candidates.iter().map(PeerInfo::socket_addr).collect();
        let fresh: Vec<PeerInfo> =
            peers.into_iter().filter(|p| !known.contains(&p.socket_addr())).collect();
        inner.candidates.extend(fresh.iter().copied());
        inner.candidates.sort_by_key(|p| core::cmp::Reverse(p.timestamp));
        inner.candidates.truncate(MAX_CANDIDATES);
        fresh
    }

    fn fill_connections(&self) {
        let listener: Arc<dyn PeerListener> = self.arc();
        let mut dials = Vec::new();
        {
            let mut inner = self.lock();
            if !inner.running {
                return;
            }
            let now = unix_now();
            let live: HashSet<SocketAddr> = inner
                .connected
                .iter()
                .filter(|p| p.status() != PeerStatus::Disconnected)
                .map(|p| p.info().socket_addr())
                .collect();
            let needed = PEER_MAX_CONNECTIONS.saturating_sub(live.len());
            if needed == 0 {
                return;
            }

            let mut pool: Vec<PeerInfo> = match inner.fixed_peer {
                Some(fixed) => vec![fixed],
                None => inner
                    .candidates
                    .iter()
                    .filter(|p| !live.contains(&p.socket_addr()))
                    .filter(|p| {
                        inner.banned.get(&p.address).map(|until| *until <= now).unwrap_or(true)
                    })
                    .filter(|p| {
                        inner
                            .retry_at
                            .get(&p.socket_addr())
                            .map(|(_, at)| *at <= now)
                            .unwrap_or(true)
                    })
                    .copied()
                    .collect(),
            };
            // Prefer recently seen addresses, with jitter so the fleet does
            // not hammer the same node.
            pool.sort_by_key(|p| core::cmp::Reverse(p.timestamp));
            let head = pool.len().min(needed * 8);
            pool[..head].shuffle(&mut rand::thread_rng());

            let start_height = inner.tip.height;
            for info in pool.into_iter().take(needed) {
                dials.push((info, start_height));
            }
            for (info, start_height) in &dials {
                let peer =
                    Peer::connect(*info, self.params.clone(), *start_height, Arc::clone(&listener));
                inner.connected.push(peer);
            }
        }
        if dials.is_empty() {
            let inner = self.lock();
            if inner.running && inner.connected.is_empty() {
                drop(inner);
                self.delegate.sync_stopped(Some(NetworkError::Timeout));
            }
        }
    }

    // ---- download peer ---------------------------------------------------

    fn elect_download_peer(&self) {
        let elected = {
            let mut inner = self.lock();
            if inner.download_peer.is_some() || !inner.running {
                return;
            }
            let mut best: Option<Arc<Peer>> = None;
            for peer in &inner.connected {
                if peer.status() != PeerStatus::Connected {
                    continue;
                }
                best = match best {
                    None => Some(Arc::clone(peer)),
                    Some(current) => {
                        let better = match peer.last_block().cmp(&current.last_block()) {
                            core::cmp::Ordering::Greater => true,
                            core::cmp::Ordering::Less => false,
                            core::cmp::Ordering::Equal =>
                                match peer.latency().cmp(&current.latency()) {
                                    core::cmp::Ordering::Less => true,
                                    core::cmp::Ordering::Greater => false,
                                    core::cmp::Ordering::Equal => rand::thread_rng().gen(),
                                },
                        };
                        Some(if better { Arc::clone(peer) } else { current })
                    }
                };
            }
            let Some(peer) = best else { return };
            info!(target: "manager", "elected download peer {}", peer.host());
            inner.download_peer = Some(Arc::clone(&peer));
            inner.syncing = inner.estimated_height > inner.tip.height;
            Some((peer, inner.syncing))
        };

        if let Some((peer, syncing)) = elected {
            if syncing {
                self.delegate.sync_started();
            }
            self.load_filter_and_request(&peer);
        }
    }

    fn load_filter_and_request(&self, peer: &Arc<Peer>) {
        let (tweak, generation) = {
            let inner = self.lock();
            (inner.filter_tweak, self.wallet.filter_generation())
        };
        let filter = self.wallet.bloom_filter(FILTER_FALSE_POSITIVE_RATE, tweak);
        self.lock().filter_generation = Some(generation);

        if peer.send(&Message::FilterLoad(filter.serialize())).is_err() {
            return;
        }
        let (locators, use_headers) = {
            let inner = self.lock();
            let use_headers = inner.tip.timestamp
                < self.earliest_key_time.saturating_sub(HEADER_WINDOW_SECS);
            (Self::block_locators(&inner), use_headers)
        };
        let stop = BlockHash::all_zeros();
        let request = if use_headers {
            Message::GetHeaders { locators, stop }
        } else {
            Message::GetBlocks { locators, stop }
        };
        if peer.send(&request).is_ok() {
            peer.expect_reply();
        }
        let _ = peer.send(&Message::Mempool);
    }

    /// Rebuilds and reloads the bloom filter when the wallet's address
    /// window or UTXO set moved past the one the download peer holds.
    fn refresh_filter_if_stale(&self) {
        let (stale, peer) = {
            let inner = self.lock();
            let stale = inner
                .filter_generation
                .map(|g| g != self.wallet.filter_generation())
                .unwrap_or(false);
            (stale, inner.download_peer.clone())
        };
        if stale {
            if let Some(peer) = peer {
                debug!(target: "manager", "bloom filter stale, reloading");
                let tweak = self.lock().filter_tweak;
                let filter = self.wallet.bloom_filter(FILTER_FALSE_POSITIVE_RATE, tweak);
                self.lock().filter_generation = Some(self.wallet.filter_generation());
                let _ = peer.send(&Message::FilterLoad(filter.serialize()));
            }
        }
    }

    fn block_locators(inner: &ManagerInner) -> Vec<BlockHash> {
        // Dense for the last ten blocks, then exponentially sparse.
        let mut locators = Vec::new();
        let mut block = Arc::clone(&inner.tip);
        let mut step = 1u32;
        loop {
            locators.push(block.block_hash);
            if locators.len() >= 10 {
                step = step.saturating_mul(2);
            }
            let mut next = None;
            for _ in 0..step {
                match inner.blocks.get(&block.prev_block) {
                    Some(prev) => {
                        next = Some(Arc::clone(prev));
                        block = Arc::clone(prev);
                    }
                    None => {
                        next = None;
                        break;
                    }
                }
            }
            match next {
                Some(_) => {}
                None => break,
            }
        }
        locators
    }

    // ---- chain assembly --------------------------------------------------

    /// Folds a relayed header or merkle block into the chain.
    ///
    /// On a consensus failure the caller bans the sending peer; the block is
    /// discarded either way.
    pub fn accept_block(
        &self,
        block: MerkleBlock,
        from: Option<&Arc<Peer>>,
    ) -> Result<(), ConsensusError> {
        let mut queue = VecDeque::new();
        queue.push_back(block);

        while let Some(block) = queue.pop_front() {
            let outcome = self.accept_one(block, from)?;
            for (height, timestamp, matched) in outcome.confirmations {
                let mut unseen = Vec::new();
                for tx_hash in &matched {
                    if !self.wallet.contains_transaction(tx_hash) {
                        unseen.push(*tx_hash);
                    }
                }
                self.wallet.set_block_heights(height, timestamp, &matched);
                if !unseen.is_empty() {
                    let mut inner = self.lock();
                    for tx_hash in &unseen {
                        inner.block_for_tx.insert(*tx_hash, (height, timestamp));
                    }
                    drop(inner);
                    if let Some(peer) = from {
                        let items = unseen.iter().map(|h| (INV_TX, *h)).collect();
                        let _ = peer.send(&Message::GetData(items));
                        peer.expect_reply();
                    }
                }
            }
            if let Some(height) = outcome.new_tip_height {
                self.wallet.set_chain_height(height);
                self.delegate.tx_status_update();
            }
            if let Some((replace, blocks)) = outcome.save {
                self.delegate.save_blocks(replace, &blocks);
            }
            if outcome.request_parent {
                if let Some(peer) = from {
                    let locators = Self::block_locators(&self.lock());
                    let _ = peer
                        .send(&Message::GetBlocks { locators, stop: BlockHash::all_zeros() });
                    peer.expect_reply();
                }
            }
            if outcome.sync_done {
                self.delegate.sync_stopped(None);
            }
            queue.extend(outcome.adopt);
        }
        Ok(())
    }

    fn accept_one(
        &self,
        mut block: MerkleBlock,
        _from: Option<&Arc<Peer>>,
    ) -> Result<AcceptOutcome, ConsensusError> {
        let mut outcome = AcceptOutcome::default();
        let mut inner = self.lock();
        let hash = block.block_hash;

        if let Some(known) = inner.blocks.get(&hash).cloned() {
            // A duplicate can still carry fresh filter matches.
            if block.total_tx > 0 && known.height != BLOCK_UNKNOWN_HEIGHT {
                let matched = block.tx_hashes();
                if !matched.is_empty() {
                    outcome.confirmations.push((known.height, known.timestamp, matched));
                }
            }
            return Ok(outcome);
        }

        let now = unix_now() as u32;
        if !block.is_valid(now) {
            return Err(Self::classify_invalid(&block, now));
        }

        let Some(prev) = inner.blocks.get(&block.prev_block).cloned() else {
            debug!(target: "manager", "orphan block {}", hash);
            inner.orphans.entry(block.prev_block).or_default().push(block);
            outcome.request_parent = true;
            return Ok(outcome);
        };

        block.height = prev.height + 1;

        if let Some(checkpoint) =
            self.params.checkpoints.iter().find(|c| c.height == block.height)
        {
            if checkpoint.block_hash() != hash {
                warn!(target: "manager", "block {} contradicts checkpoint {}", hash, block.height);
                return Err(ConsensusError::BadDifficulty);
            }
        }

        let transition_time = if block.height % DIFFICULTY_INTERVAL == 0 {
            Self::transition_timestamp(&inner, &prev, block.height - DIFFICULTY_INTERVAL)
        } else {
            0
        };
        // History pruned below the boundary means the retarget cannot be
        // recomputed; checkpoints pin those stretches instead.
        let can_check = block.height % DIFFICULTY_INTERVAL != 0 || transition_time != 0;
        if can_check && !block.verify_difficulty(&prev, transition_time, &self.params) {
            return Err(ConsensusError::BadDifficulty);
        }

        let work = inner
            .chain_work
            .get(&prev.block_hash)
            .copied()
            .unwrap_or(U256::ZERO)
            .wrapping_add(block.work());

        let matched = block.tx_hashes();
        let arc = Arc::new(block);
        inner.chain_work.insert(hash, work);
        inner.blocks.insert(hash, Arc::clone(&arc));

        if arc.prev_block == inner.tip.block_hash {
            // Extends the verified chain.
            inner.tip = Arc::clone(&arc);
            if !matched.is_empty() {
                outcome.confirmations.push((arc.height, arc.timestamp, matched));
            }
            outcome.new_tip_height = Some(arc.height);
            outcome.save = Some((false, vec![(*arc).clone()]));
            if inner.syncing && arc.height >= inner.estimated_height {
                inner.syncing = false;
                outcome.sync_done = true;
            }
        } else {
            let tip_work =
                inner.chain_work.get(&inner.tip.block_hash).copied().unwrap_or(U256::ZERO);
            if work > tip_work {
                // The other branch accumulated more work: reorganize.
                let (ancestor_height, branch) = Self::branch_from_fork(&inner, &arc);
                info!(
                    target: "manager",
                    "reorg to {} at height {}, fork at {}", hash, arc.height, ancestor_height
                );
                inner.tip = Arc::clone(&arc);
                outcome.reorg_base = Some(ancestor_height);
                for b in &branch {
                    let matches = b.tx_hashes();
                    if !matches.is_empty() {
                        outcome.confirmations.push((b.height, b.timestamp, matches));
                    }
                }
                outcome.new_tip_height = Some(arc.height);
                outcome.save = Some((true, branch.iter().map(|b| (**b).clone()).collect()));
            } else {
                debug!(target: "manager", "side chain block {} at {}", hash, arc.height);
            }
        }

        if let Some(children) = inner.orphans.remove(&hash) {
            outcome.adopt.extend(children);
        }
        drop(inner);

        // The losing branch's transactions fall back to unconfirmed before
        // the winners re-confirm.
        if let Some(base) = outcome.reorg_base {
            self.wallet.set_tx_unconfirmed_after(base);
        }
        Ok(outcome)
    }

    fn classify_invalid(block: &MerkleBlock, now: u32) -> ConsensusError {
        if block.total_tx > 0 && block.computed_merkle_root() != Some(block.merkle_root) {
            ConsensusError::BadMerkle
        } else if block.timestamp
            > now.saturating_add(primitives::merkle_block::BLOCK_MAX_TIME_DRIFT)
        {
            ConsensusError::TimeTooNew
        } else {
            ConsensusError::BadPow
        }
    }

    fn transition_timestamp(
        inner: &ManagerInner,
        from: &Arc<MerkleBlock>,
        boundary_height: u32,
    ) -> u32 {
        let mut block = Arc::clone(from);
        while block.height > boundary_height {
            match inner.blocks.get(&block.prev_block) {
                Some(prev) => block = Arc::clone(prev),
                None => return 0,
            }
        }
        if block.height == boundary_height {
            block.timestamp
        } else {
            0
        }
    }

    /// Walks back from `new_tip` to the first block on the current chain,
    /// returning the fork height and the new branch oldest-first.
    fn branch_from_fork(
        inner: &ManagerInner,
        new_tip: &Arc<MerkleBlock>,
    ) -> (u32, Vec<Arc<MerkleBlock>>) {
        // Hashes on the current chain, tip back to anchor.
        let mut main: HashSet<BlockHash> = HashSet::new();
        let mut cursor = Arc::clone(&inner.tip);
        loop {
            main.insert(cursor.block_hash);
            match inner.blocks.get(&cursor.prev_block) {
                Some(prev) => cursor = Arc::clone(prev),
                None => break,
            }
        }

        let mut branch = Vec::new();
        let mut cursor = Arc::clone(new_tip);
        loop {
            if main.contains(&cursor.block_hash) {
                return (cursor.height, branch.into_iter().rev().collect());
            }
            branch.push(Arc::clone(&cursor));
            match inner.blocks.get(&cursor.prev_block) {
                Some(prev) => cursor = Arc::clone(prev),
                None => return (cursor.height.saturating_sub(1), branch.into_iter().rev().collect()),
            }
        }
    }

    // ---- publishing ------------------------------------------------------

    /// Publishes a signed transaction to the network.
    ///
    /// `callback` fires once any peer requests the transaction, or with an
    /// error on timeout, cancel, or when `tx` is unsigned.
    pub fn publish_tx(
        &self,
        tx: Transaction,
        callback: impl FnOnce(Result<(), PublishError>) + Send + 'static,
    ) {
        if !tx.is_signed() {
            callback(Err(PublishError::NotSigned));
            return;
        }
        let tx_hash = tx.hash;
        self.wallet.register_transaction(&tx);

        let peers: Vec<Arc<Peer>> = {
            let mut inner = self.lock();
            inner.publish.insert(tx_hash, Box::new(callback));
            inner.connected.iter().filter(|p| p.status() == PeerStatus::Connected).cloned().collect()
        };
        info!(target: "manager", "publishing {} to {} peers", tx_hash, peers.len());
        for peer in &peers {
            let _ = peer.send(&Message::Inv(vec![(INV_TX, tx_hash)]));
        }

        let manager = self.arc();
        std::thread::Builder::new()
            .name("publish-timeout".into())
            .spawn(move || {
                std::thread::sleep(PUBLISH_TIMEOUT);
                let callback = manager.lock().publish.remove(&tx_hash);
                if let Some(callback) = callback {
                    callback(Err(PublishError::Timeout));
                }
                manager.delegate.thread_cleanup();
            })
            .expect("spawning the publish timer");
    }

    fn resolve_publish(&self, tx_hash: TxHash) {
        let callback = self.lock().publish.remove(&tx_hash);
        if let Some(callback) = callback {
            callback(Ok(()));
        }
    }

    fn note_relay(&self, peer: &Arc<Peer>, tx_hash: TxHash) {
        self.lock()
            .tx_relays
            .entry(tx_hash)
            .or_default()
            .insert(peer.info().socket_addr());
    }

    fn ban(&self, peer: &Arc<Peer>) {
        let until = unix_now() + BAN_DURATION_SECS;
        self.lock().banned.insert(peer.info().address, until);
        peer.disconnect();
    }
}

#[derive(Default)]
struct AcceptOutcome {
    /// `(height, timestamp, matched tx hashes)` to fold into the wallet.
    confirmations: Vec<(u32, u32, Vec<TxHash>)>,
    new_tip_height: Option<u32>,
    save: Option<(bool, Vec<MerkleBlock>)>,
    request_parent: bool,
    adopt: Vec<MerkleBlock>,
    reorg_base: Option<u32>,
    sync_done: bool,
}

impl PeerListener for PeerManager {
    fn connected(&self, peer: &Arc<Peer>) {
        {
            let mut inner = self.lock();
            let last_block = peer.last_block();
            if last_block > inner.estimated_height {
                inner.estimated_height = last_block;
            }
        }
        self.elect_download_peer();
    }

    fn disconnected(&self, peer: &Arc<Peer>, error: Option<NetworkError>) {
        match &error {
            Some(e) => warn!(target: "peer", "{} disconnected: {}", peer.host(), e),
            None => info!(target: "peer", "{} disconnected", peer.host()),
        }
        let was_download = {
            let mut inner = self.lock();
            let addr = peer.info().socket_addr();
            inner.connected.retain(|p| !Arc::ptr_eq(p, peer));

            if matches!(error, Some(NetworkError::ConnectFailed(_))) {
                let (failures, _) = inner.retry_at.get(&addr).copied().unwrap_or((0, 0));
                let failures = failures.saturating_add(1);
                let delay = RETRY_BASE_SECS.saturating_mul(1 << failures.min(6));
                inner.retry_at.insert(addr, (failures, unix_now() + delay));
            } else {
                inner.retry_at.remove(&addr);
            }

            let was_download = inner
                .download_peer
                .as_ref()
                .map(|p| Arc::ptr_eq(p, peer))
                .unwrap_or(false);
            if was_download {
                inner.download_peer = None;
            }
            was_download
        };

        self.delegate.thread_cleanup();
        self.fill_connections();
        if was_download {
            self.elect_download_peer();
        }

        let all_gone = {
            let inner = self.lock();
            inner.running && inner.connected.is_empty()
        };
        if all_gone {
            self.delegate.sync_stopped(error);
        }
    }

    fn relayed_peers(&self, _peer: &Arc<Peer>, peers: Vec<PeerInfo>) {
        let fresh = {
            let mut inner = self.lock();
            Self::merge_candidates(&mut inner, peers)
        };
        if !fresh.is_empty() {
            self.delegate.save_peers(false, &fresh);
        }
    }

    fn relayed_inv(&self, peer: &Arc<Peer>, tx_hashes: Vec<TxHash>, block_hashes: Vec<BlockHash>) {
        let mut fetch_txs = Vec::new();
        for tx_hash in tx_hashes {
            self.note_relay(peer, tx_hash);
            let published = self.lock().publish.contains_key(&tx_hash);
            if published {
                // An inv back for a tx we announced counts as acceptance.
                self.resolve_publish(tx_hash);
            } else if !self.wallet.contains_transaction(&tx_hash) {
                fetch_txs.push((INV_TX, tx_hash));
            }
        }

        let is_download = {
            let inner = self.lock();
            inner.download_peer.as_ref().map(|p| Arc::ptr_eq(p, peer)).unwrap_or(false)
        };
        if is_download {
            let mut items = fetch_txs;
            items.extend(block_hashes.iter().map(|h| (INV_FILTERED_BLOCK, *h)));
            if !items.is_empty() {
                let _ = peer.send(&Message::GetData(items));
                peer.expect_reply();
            }
        }
    }

    fn relayed_tx(&self, peer: &Arc<Peer>, tx: Transaction) {
        self.note_relay(peer, tx.hash);
        let added = self.wallet.register_transaction(&tx);
        self.resolve_publish(tx.hash);

        if added {
            // A confirmation slot may be waiting from the merkle block that
            // matched this tx before we had its contents.
            let slot = self.lock().block_for_tx.remove(&tx.hash);
            if let Some((height, timestamp)) = slot {
                self.wallet.set_block_heights(height, timestamp, &[tx.hash]);
            }
            self.refresh_filter_if_stale();
            self.delegate.tx_status_update();
        }
    }

    fn relayed_block(&self, peer: &Arc<Peer>, block: MerkleBlock) {
        match self.accept_block(block, Some(peer)) {
            Ok(()) => self.refresh_filter_if_stale(),
            Err(e) => {
                warn!(target: "manager", "{} relayed bad block: {}", peer.host(), e);
                self.ban(peer);
            }
        }
    }

    fn requested_tx(&self, peer: &Arc<Peer>, tx_hash: TxHash) -> Option<Transaction> {
        let tx = self.wallet.transaction_for_hash(&tx_hash)?;
        // A getdata for a tx we announced is the acceptance signal.
        self.note_relay(peer, tx_hash);
        self.resolve_publish(tx_hash);
        Some(tx)
    }

    fn relayed_notfound(&self, peer: &Arc<Peer>, tx_hashes: Vec<TxHash>) {
        for tx_hash in tx_hashes {
            debug!(target: "manager", "{} notfound {}", peer.host(), tx_hash);
        }
    }

    fn rejected_tx(&self, peer: &Arc<Peer>, code: u8, reason: String) {
        // A rejection may mean a double spend; flag wallet state for
        // re-verification through the usual status callback.
        warn!(target: "manager", "{} rejected tx: {:#x} {}", peer.host(), code, reason);
        self.delegate.tx_status_update();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::Mutex as StdMutex;

    use primitives::transaction::{Transaction, TxInput, TxOutput, TX_UNCONFIRMED};
    use primitives::MasterPubKey;
    use wallet::NullDelegate;

    use super::*;

    /// Low enough difficulty that a few nonce attempts mine a block.
    const EASY_TARGET: u32 = 0x207fffff;

    #[derive(Default)]
    struct ManagerRecorder {
        status_updates: AtomicUsize,
        saves: StdMutex<Vec<(bool, usize)>>,
    }

    impl ManagerDelegate for ManagerRecorder {
        fn tx_status_update(&self) {
            self.status_updates.fetch_add(1, AtomicOrdering::SeqCst);
        }
        fn save_blocks(&self, replace: bool, blocks: &[MerkleBlock]) {
            self.saves.lock().unwrap().push((replace, blocks.len()));
        }
    }

    fn test_wallet() -> Arc<Wallet> {
        Arc::new(Wallet::new(
            ChainParams::mainnet(),
            MasterPubKey::from_seed(&[0x07; 16]).unwrap(),
            Vec::new(),
            Arc::new(NullDelegate),
        ))
    }

    /// A synthetic persisted chain tip with a very easy target.
    fn anchor_block(height: u32) -> MerkleBlock {
        let mut block = mine(MerkleBlock::from_header(
            1,
            sha256d::Hash::hash(b"before the anchor"),
            sha256d::Hash::all_zeros(),
            1_600_000_000,
            EASY_TARGET,
            0,
        ));
        block.height = height;
        block
    }

    fn mine(block: MerkleBlock) -> MerkleBlock {
        let target = U256::from_compact(block.target).unwrap();
        let mut candidate = block;
        while U256::from_le_bytes(candidate.pow_hash) > target {
            candidate = MerkleBlock::from_header(
                candidate.version,
                candidate.prev_block,
                candidate.merkle_root,
                candidate.timestamp,
                candidate.target,
                candidate.nonce + 1,
            );
        }
        candidate
    }

    fn mine_invalid(block: MerkleBlock) -> MerkleBlock {
        let target = U256::from_compact(block.target).unwrap();
        let mut candidate = block;
        while U256::from_le_bytes(candidate.pow_hash) <= target {
            candidate = MerkleBlock::from_header(
                candidate.version,
                candidate.prev_block,
                candidate.merkle_root,
                candidate.timestamp,
                candidate.target,
                candidate.nonce + 1,
            );
        }
        candidate
    }

    fn child_of(prev: &MerkleBlock, root: sha256d::Hash, time_offset: u32) -> MerkleBlock {
        mine(MerkleBlock::from_header(
            1,
            prev.block_hash,
            root,
            prev.timestamp + 150 + time_offset,
            prev.target,
            0,
        ))
    }

    fn funding_tx(wallet: &Wallet, amount: u64) -> Transaction {
        let params = ChainParams::mainnet();
        let address = wallet.receive_address();
        let mut tx = Transaction::new();
        let mut input = TxInput::new(sha256d::Hash::hash(b"external funds"), 0, 0);
        input.set_signature(&[0x01, 0x2a], &params);
        tx.add_input(input);
        tx.add_output(TxOutput::pay_to(&address, amount, &params).unwrap());
        tx.hash = sha256d::Hash::hash(&tx.serialize());
        tx
    }

    fn new_manager(
        wallet: Arc<Wallet>,
        anchor: &MerkleBlock,
        delegate: Arc<dyn ManagerDelegate>,
    ) -> Arc<PeerManager> {
        PeerManager::new(
            ChainParams::mainnet(),
            wallet,
            0,
            vec![anchor.clone()],
            Vec::new(),
            delegate,
        )
    }

    #[test]
    fn extending_block_confirms_matched_tx() {
        let wallet = test_wallet();
        let recorder = Arc::new(ManagerRecorder::default());
        let tx = funding_tx(&wallet, 50_000);
        assert!(wallet.register_transaction(&tx));
        assert_eq!(wallet.transaction_for_hash(&tx.hash).unwrap().block_height, TX_UNCONFIRMED);

        let anchor = anchor_block(1_000);
        let manager = new_manager(Arc::clone(&wallet), &anchor, recorder.clone());
        assert_eq!(manager.last_block_height(), 1_000);

        // One-transaction block: the merkle root is the matched txid.
        let mut block = child_of(&anchor, tx.hash, 0);
        block.set_tx_hashes(1, vec![tx.hash], vec![0x01]);
        manager.accept_block(block.clone(), None).unwrap();

        assert_eq!(manager.last_block_height(), 1_001);
        assert_eq!(manager.last_block_timestamp(), block.timestamp);
        assert_eq!(wallet.transaction_for_hash(&tx.hash).unwrap().block_height, 1_001);
        assert!(recorder.status_updates.load(AtomicOrdering::SeqCst) > 0);
        assert_eq!(recorder.saves.lock().unwrap().as_slice(), &[(false, 1)]);
    }

    #[test]
    fn orphan_connects_when_parent_arrives() {
        let wallet = test_wallet();
        let anchor = anchor_block(1_000);
        let manager = new_manager(wallet, &anchor, Arc::new(NullManagerDelegate));

        let b1 = child_of(&anchor, sha256d::Hash::all_zeros(), 0);
        let b2 = child_of(&b1, sha256d::Hash::all_zeros(), 0);

        manager.accept_block(b2.clone(), None).unwrap();
        assert_eq!(manager.last_block_height(), 1_000);

        manager.accept_block(b1, None).unwrap();
        assert_eq!(manager.last_block_height(), 1_002);
    }

    #[test]
    fn equal_height_fork_waits_longer_branch_wins() {
        let wallet = test_wallet();
        let tx = funding_tx(&wallet, 60_000);
        wallet.register_transaction(&tx);
        let balance_before = wallet.balance();

        let anchor = anchor_block(1_000);
        let manager = new_manager(Arc::clone(&wallet), &anchor, Arc::new(NullManagerDelegate));

        // Branch A confirms our transaction at height 1001.
        let mut a1 = child_of(&anchor, tx.hash, 0);
        a1.set_tx_hashes(1, vec![tx.hash], vec![0x01]);
        manager.accept_block(a1.clone(), None).unwrap();
        assert_eq!(wallet.transaction_for_hash(&tx.hash).unwrap().block_height, 1_001);

        // Branch B reaches the same height: no reorg on an equal-work tie.
        let b1 = child_of(&anchor, sha256d::Hash::all_zeros(), 7);
        manager.accept_block(b1.clone(), None).unwrap();
        assert_eq!(manager.last_block_height(), 1_001);
        assert_eq!(wallet.transaction_for_hash(&tx.hash).unwrap().block_height, 1_001);

        // Branch B pulls ahead on accumulated work: reorg, and the tx that
        // was only in the losing branch drops back to unconfirmed.
        let b2 = child_of(&b1, sha256d::Hash::all_zeros(), 0);
        manager.accept_block(b2, None).unwrap();
        assert_eq!(manager.last_block_height(), 1_002);
        assert_eq!(
            wallet.transaction_for_hash(&tx.hash).unwrap().block_height,
            TX_UNCONFIRMED
        );
        // Still a valid transaction, so the balance is unchanged.
        assert_eq!(wallet.balance(), balance_before);
    }

    #[test]
    fn consensus_failures_reject_block() {
        let wallet = test_wallet();
        let anchor = anchor_block(1_000);
        let manager = new_manager(wallet, &anchor, Arc::new(NullManagerDelegate));

        let unmined = mine_invalid(MerkleBlock::from_header(
            1,
            anchor.block_hash,
            sha256d::Hash::all_zeros(),
            anchor.timestamp + 150,
            anchor.target,
            0,
        ));
        assert_eq!(
            manager.accept_block(unmined, None),
            Err(ConsensusError::BadPow)
        );

        // Off-boundary blocks must reuse the previous target.
        let retargeted = mine(MerkleBlock::from_header(
            1,
            anchor.block_hash,
            sha256d::Hash::all_zeros(),
            anchor.timestamp + 150,
            0x203fffff,
            0,
        ));
        assert_eq!(
            manager.accept_block(retargeted, None),
            Err(ConsensusError::BadDifficulty)
        );

        let future = mine(MerkleBlock::from_header(
            1,
            anchor.block_hash,
            sha256d::Hash::all_zeros(),
            unix_now() as u32 + 3 * 60 * 60,
            anchor.target,
            0,
        ));
        assert_eq!(
            manager.accept_block(future, None),
            Err(ConsensusError::TimeTooNew)
        );

        assert_eq!(manager.last_block_height(), 1_000);
    }

    #[test]
    fn duplicate_block_still_delivers_matches() {
        let wallet = test_wallet();
        let tx = funding_tx(&wallet, 70_000);
        wallet.register_transaction(&tx);

        let anchor = anchor_block(1_000);
        let manager = new_manager(Arc::clone(&wallet), &anchor, Arc::new(NullManagerDelegate));

        // The bare header arrives first (headers-first sync).
        let header = child_of(&anchor, tx.hash, 0);
        manager.accept_block(header.clone(), None).unwrap();
        assert_eq!(wallet.transaction_for_hash(&tx.hash).unwrap().block_height, TX_UNCONFIRMED);

        // The same block as a merkle block with the filter match.
        let mut filtered = header.clone();
        filtered.set_tx_hashes(1, vec![tx.hash], vec![0x01]);
        manager.accept_block(filtered, None).unwrap();
        assert_eq!(wallet.transaction_for_hash(&tx.hash).unwrap().block_height, 1_001);
    }

    #[test]
    fn sync_progress_and_estimates() {
        let wallet = test_wallet();
        let anchor = anchor_block(1_000);
        let manager = new_manager(wallet, &anchor, Arc::new(NullManagerDelegate));

        // Nothing running yet.
        assert_eq!(manager.sync_progress(0), 0.0);
        assert_eq!(manager.estimated_block_height(), 1_000);
        assert_eq!(manager.peer_count(), 0);
        assert_eq!(manager.connect_status(), PeerStatus::Disconnected);
        assert!(manager.download_peer_name().is_none());
        assert_eq!(manager.relay_count(sha256d::Hash::hash(b"never seen")), 0);
        assert_eq!(manager.standard_port(), 9333);
    }

    #[test]
    fn rescan_resets_to_checkpoint() {
        let wallet = test_wallet();
        let anchor = anchor_block(1_000);
        let manager = new_manager(wallet, &anchor, Arc::new(NullManagerDelegate));

        let b1 = child_of(&anchor, sha256d::Hash::all_zeros(), 0);
        manager.accept_block(b1, None).unwrap();
        assert_eq!(manager.last_block_height(), 1_001);

        manager.rescan();
        // Earliest key time of zero pins the rescan to the genesis anchor.
        assert_eq!(manager.last_block_height(), 0);
    }
}
