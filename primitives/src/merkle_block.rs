// SPDX-License-Identifier: CC0-1.0

//! SPV merkle blocks: header validation and partial merkle trees.
//!
//! A merkle block is the 80-byte header plus the BIP-37 partial merkle tree
//! that proves which filtered transactions the block confirms. Proof of work
//! uses Litecoin's scrypt hash; the block identity hash stays double
//! SHA-256.

use bitcoin_hashes::{sha256d, Hash, HashEngine};

use crate::chain::{ChainParams, DIFFICULTY_INTERVAL};
use crate::encode::{self, Cursor};
use crate::uint256::U256;
use crate::{BlockHash, CodecError, TxHash};

/// Height of a block not yet positioned in the chain.
pub const BLOCK_UNKNOWN_HEIGHT: u32 = i32::MAX as u32;
/// The furthest in the future a block is allowed to be timestamped.
pub const BLOCK_MAX_TIME_DRIFT: u32 = 2 * 60 * 60;

/// Upper bound on hashes in a partial merkle tree; a block cannot carry
/// more transactions than fit in its serialized size.
const MAX_TREE_HASHES: usize = 0x0100_0000 / 32;

/// An SPV block: header plus partial merkle tree.
#[derive(Debug, Clone)]
pub struct MerkleBlock {
    /// Double SHA-256 of the 80-byte header.
    pub block_hash: BlockHash,
    /// scrypt hash of the 80-byte header, compared against the target.
    pub pow_hash: [u8; 32],
    /// Header version.
    pub version: u32,
    /// Hash of the preceding block.
    pub prev_block: BlockHash,
    /// Merkle root over all of the block's transactions.
    pub merkle_root: sha256d::Hash,
    /// Header timestamp, seconds since the unix epoch.
    pub timestamp: u32,
    /// Compact difficulty target.
    pub target: u32,
    /// Header nonce.
    pub nonce: u32,
    /// Transactions in the full block; zero for a bare header.
    pub total_tx: u32,
    /// Partial merkle tree node hashes.
    pub hashes: Vec<sha256d::Hash>,
    /// Partial merkle tree traversal bitmap.
    pub flags: Vec<u8>,
    /// Chain height, [`BLOCK_UNKNOWN_HEIGHT`] until positioned.
    pub height: u32,
}

fn tree_height(total_tx: u32) -> u32 {
    if total_tx <= 1 {
        0
    } else {
        32 - (total_tx - 1).leading_zeros()
    }
}

impl MerkleBlock {
    /// Builds a block from header fields, computing both header hashes.
    pub fn from_header(
        version: u32,
        prev_block: BlockHash,
        merkle_root: sha256d::Hash,
        timestamp: u32,
        target: u32,
        nonce: u32,
    ) -> Self {
        let mut block = MerkleBlock {
            block_hash: BlockHash::all_zeros(),
            pow_hash: [0u8; 32],
            version,
            prev_block,
            merkle_root,
            timestamp,
            target,
            nonce,
            total_tx: 0,
            hashes: Vec::new(),
            flags: Vec::new(),
            height: BLOCK_UNKNOWN_HEIGHT,
        };
        block.compute_hashes();
        block
    }

    /// Parses a serialized header or merkleblock message payload.
    pub fn parse(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut cursor = Cursor::new(bytes);

        let version = cursor.read_u32()?;
        let prev_block = cursor.read_hash()?;
        let merkle_root = cursor.read_hash()?;
        let timestamp = cursor.read_u32()?;
        let target = cursor.read_u32()?;
        let nonce = cursor.read_u32()?;

        let mut block =
            Self::from_header(version, prev_block, merkle_root, timestamp, target, nonce);

        if !cursor.is_empty() {
            block.total_tx = cursor.read_u32()?;
            let hash_count = cursor.read_varint()? as usize;
            if hash_count > MAX_TREE_HASHES || hash_count > cursor.remaining() / 32 + 1 {
                return Err(CodecError::Oversize { claimed: hash_count, max: MAX_TREE_HASHES });
            }
            block.hashes.reserve(hash_count);
            for _ in 0..hash_count {
                block.hashes.push(cursor.read_hash()?);
            }
            block.flags = cursor.read_var_bytes(cursor.remaining())?.to_vec();
        }

        Ok(block)
    }

    /// Serializes back to wire form; `height` is not serialized.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(81 + self.hashes.len() * 32 + self.flags.len() + 9);
        self.write_header(&mut buf);
        if self.total_tx > 0 {
            buf.extend_from_slice(&self.total_tx.to_le_bytes());
            encode::write_varint(&mut buf, self.hashes.len() as u64);
            for hash in &self.hashes {
                encode::write_hash(&mut buf, hash);
            }
            encode::write_var_bytes(&mut buf, &self.flags);
        }
        buf
    }

    fn write_header(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.version.to_le_bytes());
        encode::write_hash(buf, &self.prev_block);
        encode::write_hash(buf, &self.merkle_root);
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf.extend_from_slice(&self.target.to_le_bytes());
        buf.extend_from_slice(&self.nonce.to_le_bytes());
    }

    fn compute_hashes(&mut self) {
        let mut header = Vec::with_capacity(80);
        self.write_header(&mut header);
        self.block_hash = sha256d::Hash::hash(&header);

        // Litecoin mining hash: scrypt(header, salt = header, N=1024 r=1 p=1).
        let params = scrypt::Params::new(10, 1, 1, 32).expect("constant params are valid");
        scrypt::scrypt(&header, &header, &params, &mut self.pow_hash)
            .expect("output length is fixed at 32");
    }

    /// Replaces the partial merkle tree of a block built from header fields.
    pub fn set_tx_hashes(&mut self, total_tx: u32, hashes: Vec<sha256d::Hash>, flags: Vec<u8>) {
        self.total_tx = total_tx;
        self.hashes = hashes;
        self.flags = flags;
    }

    /// The transactions this block proves as matched by the bloom filter.
    pub fn tx_hashes(&self) -> Vec<TxHash> {
        let mut matched = Vec::new();
        let mut hash_idx = 0;
        let mut flag_idx = 0;
        self.walk_matches(
            &mut matched,
            &mut hash_idx,
            &mut flag_idx,
            0,
            tree_height(self.total_tx),
        );
        matched
    }

    /// True when `tx_hash` is proven to be in this block.
    pub fn contains_tx_hash(&self, tx_hash: TxHash) -> bool {
        self.tx_hashes().contains(&tx_hash)
    }

    fn walk_matches(
        &self,
        matched: &mut Vec<TxHash>,
        hash_idx: &mut usize,
        flag_idx: &mut usize,
        depth: u32,
        max_depth: u32,
    ) {
        if *flag_idx / 8 >= self.flags.len() {
            return;
        }
        let flag = self.flags[*flag_idx / 8] & (1 << (*flag_idx % 8)) != 0;
        *flag_idx += 1;

        if !flag || depth == max_depth {
            if flag && *hash_idx < self.hashes.len() {
                matched.push(self.hashes[*hash_idx]);
            }
            if *hash_idx < self.hashes.len() {
                *hash_idx += 1;
            }
        } else {
            self.walk_matches(matched, hash_idx, flag_idx, depth + 1, max_depth);
            self.walk_matches(matched, hash_idx, flag_idx, depth + 1, max_depth);
        }
    }

    /// Reconstructs the merkle root described by `(hashes, flags)`.
    ///
    /// `None` when the tree is malformed, runs out of nodes, or contains the
    /// duplicated-branch mutation of CVE-2012-2459.
    pub fn computed_merkle_root(&self) -> Option<sha256d::Hash> {
        let mut hash_idx = 0;
        let mut flag_idx = 0;
        self.walk_root(&mut hash_idx, &mut flag_idx, 0, tree_height(self.total_tx))
    }

    fn walk_root(
        &self,
        hash_idx: &mut usize,
        flag_idx: &mut usize,
        depth: u32,
        max_depth: u32,
    ) -> Option<sha256d::Hash> {
        if *flag_idx / 8 >= self.flags.len() || *hash_idx >= self.hashes.len() {
            return None;
        }
        let flag = self.flags[*flag_idx / 8] & (1 << (*flag_idx % 8)) != 0;
        *flag_idx += 1;

        if flag && depth != max_depth {
            let left = self.walk_root(hash_idx, flag_idx, depth + 1, max_depth)?;
            let right = match self.walk_root(hash_idx, flag_idx, depth + 1, max_depth) {
                // A right branch identical to the left is the CVE-2012-2459
                // mutation; reject the whole proof.
                Some(right) if right == left => return None,
                Some(right) => right,
                // Odd node count: the left branch pairs with itself.
                None => left,
            };

            let mut engine = sha256d::Hash::engine();
            engine.input(left.as_byte_array());
            engine.input(right.as_byte_array());
            Some(sha256d::Hash::from_engine(engine))
        } else {
            let hash = self.hashes[*hash_idx];
            *hash_idx += 1;
            Some(hash)
        }
    }

    /// Expected hash count to produce this block: `2^256 / (target + 1)`.
    pub fn work(&self) -> U256 {
        U256::from_compact(self.target).map(U256::work).unwrap_or(U256::ZERO)
    }

    /// True when the merkle tree reconstructs, the timestamp is not too far
    /// in the future, and the scrypt proof-of-work meets the stated target.
    ///
    /// This checks the header against its *own* target only; use
    /// [`MerkleBlock::verify_difficulty`] to check the target against the
    /// chain position.
    pub fn is_valid(&self, current_time: u32) -> bool {
        if self.total_tx > 0 && self.computed_merkle_root() != Some(self.merkle_root) {
            return false;
        }
        if self.timestamp > current_time.saturating_add(BLOCK_MAX_TIME_DRIFT) {
            return false;
        }
        let Some(target) = U256::from_compact(self.target) else {
            return false;
        };
        U256::from_le_bytes(self.pow_hash) <= target
    }

    /// Verifies the difficulty target is correct for this block's position.
    ///
    /// `transition_time` is the timestamp of the block at the previous
    /// retarget boundary; it may be zero when this block is off-boundary.
    pub fn verify_difficulty(
        &self,
        previous: &MerkleBlock,
        transition_time: u32,
        params: &ChainParams,
    ) -> bool {
        if self.prev_block != previous.block_hash || self.height != previous.height + 1 {
            return false;
        }

        if self.height % DIFFICULTY_INTERVAL != 0 {
            return self.target == previous.target;
        }
        if transition_time == 0 {
            return false;
        }

        let timespan = i64::from(previous.timestamp) - i64::from(transition_time);
        let target_timespan = i64::from(params.target_timespan);
        let clamped = timespan.clamp(target_timespan / 4, target_timespan * 4) as u32;

        let Some(previous_target) = U256::from_compact(previous.target) else {
            return false;
        };
        let mut new_target =
            previous_target.mul_u32(clamped).div_u32(params.target_timespan);

        // Never easier than the chain's proof-of-work limit.
        let limit = U256::from_compact(params.checkpoints[0].target)
            .expect("checkpoint table holds a valid limit");
        if new_target > limit {
            new_target = limit;
        }

        self.target == new_target.to_compact()
    }
}

impl PartialEq for MerkleBlock {
    fn eq(&self, other: &Self) -> bool { self.block_hash == other.block_hash }
}

impl Eq for MerkleBlock {}

impl std::hash::Hash for MerkleBlock {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.block_hash.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainParams;

    fn genesis() -> MerkleBlock {
        MerkleBlock::from_header(
            1,
            BlockHash::all_zeros(),
            "97ddfbbae6be97fd6cdf3e7ca13232a3afff2353e29badfab7f73011edd4ced9"
                .parse()
                .unwrap(),
            1317972665,
            0x1e0ffff0,
            2084524493,
        )
    }

    #[test]
    fn genesis_header_hashes_and_validates() {
        let params = ChainParams::mainnet();
        let block = genesis();
        assert_eq!(block.block_hash, params.genesis_hash());
        // Real scrypt proof-of-work, no merkle tree, sane timestamp.
        assert!(block.is_valid(1317972665 + 600));
        assert_eq!(block.height, BLOCK_UNKNOWN_HEIGHT);
    }

    #[test]
    fn future_timestamp_rejects() {
        let block = genesis();
        assert!(!block.is_valid(block.timestamp - BLOCK_MAX_TIME_DRIFT - 1));
    }

    #[test]
    fn header_roundtrip() {
        let block = genesis();
        let bytes = block.serialize();
        assert_eq!(bytes.len(), 80);
        let parsed = MerkleBlock::parse(&bytes).unwrap();
        assert_eq!(parsed, block);
        assert_eq!(parsed.serialize(), bytes);
    }

    fn pair(left: sha256d::Hash, right: sha256d::Hash) -> sha256d::Hash {
        let mut engine = sha256d::Hash::engine();
        engine.input(left.as_byte_array());
        engine.input(right.as_byte_array());
        sha256d::Hash::from_engine(engine)
    }

    /// Four transactions, the second one matched.
    fn partial_tree_block() -> (MerkleBlock, Vec<sha256d::Hash>) {
        let txids: Vec<sha256d::Hash> =
            (0u8..4).map(|i| sha256d::Hash::hash(&[i])).collect();
        let row: Vec<sha256d::Hash> =
            vec![pair(txids[0], txids[1]), pair(txids[2], txids[3])];
        let root = pair(row[0], row[1]);

        let mut block = MerkleBlock::from_header(
            1,
            BlockHash::all_zeros(),
            root,
            1317972665,
            0x1e0ffff0,
            0,
        );
        // Depth-first: root (1), left pair (1), tx0 (0), tx1 (1, matched),
        // right pair (0, pruned).
        block.set_tx_hashes(4, vec![txids[0], txids[1], row[1]], vec![0b0000_1011]);
        (block, txids)
    }

    #[test]
    fn partial_merkle_reconstructs_and_extracts_matches() {
        let (block, txids) = partial_tree_block();
        assert_eq!(block.computed_merkle_root(), Some(block.merkle_root));
        assert_eq!(block.tx_hashes(), vec![txids[1]]);
        assert!(block.contains_tx_hash(txids[1]));
        assert!(!block.contains_tx_hash(txids[0]));
    }

    #[test]
    fn merkleblock_roundtrip() {
        let (block, _) = partial_tree_block();
        let parsed = MerkleBlock::parse(&block.serialize()).unwrap();
        assert_eq!(parsed.total_tx, 4);
        assert_eq!(parsed.hashes, block.hashes);
        assert_eq!(parsed.flags, block.flags);
        assert_eq!(parsed.computed_merkle_root(), Some(block.merkle_root));
    }

    #[test]
    fn mutated_tree_rejects() {
        let (mut block, _) = partial_tree_block();
        // Duplicate the left branch into the right, CVE-2012-2459 style.
        block.hashes[2] = pair(block.hashes[0], block.hashes[1]);
        assert_eq!(block.computed_merkle_root(), None);
        assert!(!block.is_valid(block.timestamp + 600));
    }

    #[test]
    fn wrong_root_rejects() {
        let (mut block, _) = partial_tree_block();
        block.merkle_root = sha256d::Hash::hash(b"not the root");
        assert!(!block.is_valid(block.timestamp + 600));
    }

    fn block_at(height: u32, target: u32, timestamp: u32, prev: &MerkleBlock) -> MerkleBlock {
        let mut block = MerkleBlock::from_header(
            1,
            prev.block_hash,
            sha256d::Hash::all_zeros(),
            timestamp,
            target,
            0,
        );
        block.height = height;
        block
    }

    #[test]
    fn difficulty_retarget_halves() {
        let params = ChainParams::mainnet();
        let timespan = params.target_timespan;

        let mut prev = MerkleBlock::from_header(
            1,
            BlockHash::all_zeros(),
            sha256d::Hash::all_zeros(),
            2_000_000_000,
            0x1d00ffff,
            0,
        );
        prev.height = 2 * DIFFICULTY_INTERVAL - 1;

        // Blocks came in twice as fast as intended: the target halves.
        let transition_time = prev.timestamp - timespan / 2;
        let next = block_at(2 * DIFFICULTY_INTERVAL, 0x1c7fff80, prev.timestamp + 150, &prev);
        assert!(next.verify_difficulty(&prev, transition_time, &params));

        // Reusing the old target at the boundary is wrong.
        let lazy = block_at(2 * DIFFICULTY_INTERVAL, 0x1d00ffff, prev.timestamp + 150, &prev);
        assert!(!lazy.verify_difficulty(&prev, transition_time, &params));
    }

    #[test]
    fn difficulty_adjustment_clamps_at_four_times() {
        let params = ChainParams::mainnet();
        // Blocks eight times too fast, clamped to a quartered timespan.
        let mut prev = MerkleBlock::from_header(
            1,
            BlockHash::all_zeros(),
            sha256d::Hash::all_zeros(),
            2_000_000_000,
            0x1d00ffff,
            0,
        );
        prev.height = DIFFICULTY_INTERVAL - 1;

        let transition_time = prev.timestamp - params.target_timespan / 8;
        let next = block_at(DIFFICULTY_INTERVAL, 0x1c3fffc0, prev.timestamp + 150, &prev);
        assert!(next.verify_difficulty(&prev, transition_time, &params));
    }

    #[test]
    fn off_boundary_must_reuse_target() {
        let params = ChainParams::mainnet();
        let mut prev = genesis();
        prev.height = 10;

        let same = block_at(11, prev.target, prev.timestamp + 150, &prev);
        assert!(same.verify_difficulty(&prev, 0, &params));

        let changed = block_at(11, 0x1d00ffff, prev.timestamp + 150, &prev);
        assert!(!changed.verify_difficulty(&prev, 0, &params));

        let wrong_link = block_at(12, prev.target, prev.timestamp + 150, &prev);
        assert!(!wrong_link.verify_difficulty(&prev, 0, &params));
    }
}
