// SPDX-License-Identifier: CC0-1.0

//! BIP-37 bloom filter construction.
//!
//! The filter is sized from an expected element count and a false-positive
//! rate, hashed with murmur3 under per-function tweaks, and shipped to the
//! download peer as a `filterload` payload. A light client leaks privacy
//! through this filter, so the rate is a tunable rather than a constant.

use primitives::encode;

/// Largest filter the protocol allows, in bytes.
pub const MAX_FILTER_LENGTH: usize = 36_000;
/// Largest permitted number of hash functions.
pub const MAX_HASH_FUNCS: u32 = 50;

/// `filterload` flag: never update the filter on matches.
pub const BLOOM_UPDATE_NONE: u8 = 0;
/// `filterload` flag: update the filter with every matched outpoint.
pub const BLOOM_UPDATE_ALL: u8 = 1;
/// `filterload` flag: update only for pay-to-pubkey-ish matches.
pub const BLOOM_UPDATE_P2PUBKEY_ONLY: u8 = 2;

/// The murmur3 seed multiplier fixed by BIP-37.
const HASH_MULTIPLIER: u32 = 0xfba4_c795;

/// A BIP-37 probabilistic set.
#[derive(Debug, Clone)]
pub struct BloomFilter {
    filter: Vec<u8>,
    hash_funcs: u32,
    tweak: u32,
    flags: u8,
    elements: usize,
}

impl BloomFilter {
    /// Sizes a filter for `element_count` insertions at `fp_rate` false
    /// positives, capped at the protocol maximums.
    pub fn new(fp_rate: f64, element_count: usize, tweak: u32, flags: u8) -> Self {
        let n = element_count.max(1) as f64;
        let ln2 = core::f64::consts::LN_2;

        let ideal_bits = -1.0 / (ln2 * ln2) * n * fp_rate.ln();
        let length = ((ideal_bits / 8.0) as usize).clamp(1, MAX_FILTER_LENGTH);

        let ideal_funcs = (length as f64 * 8.0 / n * ln2) as u32;
        let hash_funcs = ideal_funcs.clamp(1, MAX_HASH_FUNCS);

        BloomFilter { filter: vec![0; length], hash_funcs, tweak, flags, elements: 0 }
    }

    fn bit_index(&self, data: &[u8], hash_num: u32) -> usize {
        let seed = hash_num.wrapping_mul(HASH_MULTIPLIER).wrapping_add(self.tweak);
        murmur3_32(data, seed) as usize % (self.filter.len() * 8)
    }

    /// Inserts `data` into the filter.
    pub fn insert(&mut self, data: &[u8]) {
        if self.contains(data) {
            return;
        }
        for hash_num in 0..self.hash_funcs {
            let index = self.bit_index(data, hash_num);
            self.filter[index / 8] |= 1 << (index % 8);
        }
        self.elements += 1;
    }

    /// True when `data` may have been inserted (or collides).
    pub fn contains(&self, data: &[u8]) -> bool {
        (0..self.hash_funcs).all(|hash_num| {
            let index = self.bit_index(data, hash_num);
            self.filter[index / 8] & (1 << (index % 8)) != 0
        })
    }

    /// Number of distinct elements inserted so far.
    pub fn element_count(&self) -> usize { self.elements }

    /// Expected false-positive rate at the current load.
    pub fn false_positive_rate(&self) -> f64 {
        let bits = (self.filter.len() * 8) as f64;
        (1.0 - (-(self.hash_funcs as f64) * self.elements as f64 / bits).exp())
            .powi(self.hash_funcs as i32)
    }

    /// The `filterload` message payload.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.filter.len() + 18);
        encode::write_var_bytes(&mut buf, &self.filter);
        buf.extend_from_slice(&self.hash_funcs.to_le_bytes());
        buf.extend_from_slice(&self.tweak.to_le_bytes());
        buf.push(self.flags);
        buf
    }
}

/// murmur3 (x86, 32-bit) as fixed by BIP-37.
pub fn murmur3_32(data: &[u8], seed: u32) -> u32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    let mut h = seed;
    let mut chunks = data.chunks_exact(4);

    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h = (h ^ k).rotate_left(13).wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut k = 0u32;
        for (i, byte) in tail.iter().enumerate() {
            k |= u32::from(*byte) << (8 * i);
        }
        k = k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h ^= k;
    }

    h ^= data.len() as u32;
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn murmur3_reference_vectors() {
        assert_eq!(murmur3_32(b"", 0), 0);
        assert_eq!(murmur3_32(b"", 1), 0x514e28b7);
        assert_eq!(murmur3_32(b"", 0xffffffff), 0x81f16f39);
        assert_eq!(murmur3_32(&[0x00; 4], 0), 0x2362f9de);
        assert_eq!(murmur3_32(&[0x21, 0x43, 0x65, 0x87], 0), 0xf55b516b);
        assert_eq!(murmur3_32(&[0x21], 0), 0x72661cf4);
    }

    // BIP-37 reference filter from the Bitcoin Core unit tests: three
    // elements, fp rate 0.01, tweak 0, BLOOM_UPDATE_ALL.
    #[test]
    fn bip37_reference_filter() {
        let mut filter = BloomFilter::new(0.01, 3, 0, BLOOM_UPDATE_ALL);

        let a = hex::decode("99108ad8ed9bb6274d3980bab5a85c048f0950c8").unwrap();
        let b = hex::decode("b5a2c786d9ef4658287ced5914b37a1b4aa32eee").unwrap();
        let c = hex::decode("b9300670b4c5366e95b2699e8b18bc75e5f729c5").unwrap();

        filter.insert(&a);
        assert!(filter.contains(&a));
        // One bit different should miss.
        let mut near = a.clone();
        near[0] ^= 1;
        assert!(!filter.contains(&near));

        filter.insert(&b);
        filter.insert(&c);
        assert_eq!(
            hex::encode(filter.serialize()),
            "03614e9b050000000000000001"
        );
    }

    #[test]
    fn tweak_changes_filter() {
        let mut filter = BloomFilter::new(0.01, 3, 2147483649, BLOOM_UPDATE_ALL);
        let a = hex::decode("99108ad8ed9bb6274d3980bab5a85c048f0950c8").unwrap();
        let b = hex::decode("b5a2c786d9ef4658287ced5914b37a1b4aa32eee").unwrap();
        let c = hex::decode("b9300670b4c5366e95b2699e8b18bc75e5f729c5").unwrap();
        filter.insert(&a);
        filter.insert(&b);
        filter.insert(&c);
        assert_eq!(
            hex::encode(filter.serialize()),
            "03ce4299050000000100008001"
        );
    }

    #[test]
    fn element_count_ignores_duplicates() {
        let mut filter = BloomFilter::new(0.001, 10, 0, BLOOM_UPDATE_NONE);
        filter.insert(b"once");
        filter.insert(b"once");
        assert_eq!(filter.element_count(), 1);
        assert!(filter.false_positive_rate() < 0.001);
    }

    #[test]
    fn filter_length_is_capped() {
        let filter = BloomFilter::new(0.000001, 10_000_000, 0, BLOOM_UPDATE_NONE);
        assert!(filter.serialize().len() <= MAX_FILTER_LENGTH + 18);
    }
}
