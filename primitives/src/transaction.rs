// SPDX-License-Identifier: CC0-1.0

//! Transactions: canonical serialization, signature digests, signing.
//!
//! Serialized form is `version || VarInt(inCount) || inputs ||
//! VarInt(outCount) || outputs || lockTime`. An input whose script bytes
//! decode as a scriptPubKey is *unsigned*; its serialized form carries the
//! scriptPubKey in the scriptSig slot followed by the previous output's
//! amount as an extra LE64, the engine's convention for shipping unsigned
//! transactions to an offline signer. That form never appears on the wire.

use std::time::{SystemTime, UNIX_EPOCH};

use bitcoin_hashes::{sha256d, Hash};

use crate::address::{recognize_script_pubkey, Address};
use crate::chain::ChainParams;
use crate::encode::{self, varint_size, write_varint, Cursor};
use crate::key::Key;
use crate::script::{self, Template};
use crate::{CodecError, TxHash};

/// Standard fee per 1000 bytes of transaction size.
pub const TX_FEE_PER_KB: u64 = 1000;
/// Estimated size of a typical transaction output.
pub const TX_OUTPUT_SIZE: usize = 34;
/// Estimated size of a typical compact-pubkey transaction input.
pub const TX_INPUT_SIZE: usize = 148;
/// No output may carry less than this amount.
pub const TX_MIN_OUTPUT_AMOUNT: u64 =
    TX_FEE_PER_KB * 3 * (TX_OUTPUT_SIZE as u64 + TX_INPUT_SIZE as u64) / 1000;
/// No transaction may exceed this size in bytes.
pub const TX_MAX_SIZE: usize = 100_000;
/// Block height marking an unconfirmed transaction.
pub const TX_UNCONFIRMED: u32 = i32::MAX as u32;
/// A lockTime below this is a block height, otherwise a timestamp.
pub const TX_MAX_LOCK_HEIGHT: u32 = 500_000_000;
/// Sequence number of a finalized input.
pub const SEQUENCE_FINAL: u32 = u32::MAX;

/// Smallest units per coin.
pub const COIN: u64 = 100_000_000;
/// Total Litecoin supply in smallest units.
pub const MAX_MONEY: u64 = 84_000_000 * COIN;

/// Sign all outputs (the default).
pub const SIGHASH_ALL: u32 = 0x01;
/// Sign no outputs.
pub const SIGHASH_NONE: u32 = 0x02;
/// Sign only the output paired with this input.
pub const SIGHASH_SINGLE: u32 = 0x03;
/// Use the BIP-143 digest algorithm.
pub const SIGHASH_FORKID: u32 = 0x40;
/// Sign only this input, let others be added freely.
pub const SIGHASH_ANYONECANPAY: u32 = 0x80;

/// Injected randomness for output shuffling.
///
/// Production uses [`FnvTimeRng`]; tests seed their own so shuffles are
/// reproducible.
pub trait ShuffleRng {
    /// Uniform value in `[0, upper_bound)`; `upper_bound` of zero means the
    /// full u32 range.
    fn next_bound(&mut self, upper_bound: u32) -> u32;
}

/// Linear-congruential generator seeded from FNV-mixed wall time and pid.
///
/// Strictly non-cryptographic; its only job is to keep the change output's
/// position unpredictable to a casual chain observer.
#[derive(Debug, Clone)]
pub struct FnvTimeRng {
    state: u64,
}

impl FnvTimeRng {
    const FNV_OFFSET: u32 = 0x811c_9dc5;
    const FNV_PRIME: u32 = 0x0100_0193;

    /// Seeds from the clock and process id.
    pub fn new() -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        let seed = (Self::FNV_OFFSET ^ now)
            .wrapping_mul(Self::FNV_PRIME)
            ^ std::process::id();
        Self::from_seed(u64::from(seed.wrapping_mul(Self::FNV_PRIME)))
    }

    /// Seeds explicitly, for deterministic tests.
    pub fn from_seed(seed: u64) -> Self { FnvTimeRng { state: seed } }

    fn next_u32(&mut self) -> u32 {
        // Knuth's MMIX constants.
        self.state = self
            .state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (self.state >> 32) as u32
    }
}

impl Default for FnvTimeRng {
    fn default() -> Self { Self::new() }
}

impl ShuffleRng for FnvTimeRng {
    fn next_bound(&mut self, upper_bound: u32) -> u32 {
        let bound = if upper_bound == 0 { u32::MAX } else { upper_bound };
        // Rejection sampling to avoid modulo bias.
        let threshold = bound.wrapping_neg() % bound;
        loop {
            let r = self.next_u32();
            if r >= threshold {
                return r % bound;
            }
        }
    }
}

/// One transaction input.
#[derive(Debug, Clone, PartialEq)]
pub struct TxInput {
    /// Hash of the transaction holding the spent output.
    pub prev_hash: TxHash,
    /// Index of the spent output.
    pub prev_index: u32,
    /// Address of the spent output, when recognizable.
    pub address: Option<Address>,
    /// Amount of the spent output; zero unless known. Needed for BIP-143
    /// signing, never part of the canonical signed serialization.
    pub amount: u64,
    /// scriptPubKey of the spent output, when known.
    pub script: Vec<u8>,
    /// scriptSig; `None` while unsigned.
    pub signature: Option<Vec<u8>>,
    /// Sequence number.
    pub sequence: u32,
}

impl TxInput {
    /// A fresh unsigned input with final sequence.
    pub fn new(prev_hash: TxHash, prev_index: u32, amount: u64) -> Self {
        TxInput {
            prev_hash,
            prev_index,
            address: None,
            amount,
            script: Vec::new(),
            signature: None,
            sequence: SEQUENCE_FINAL,
        }
    }

    /// Sets the spent output's scriptPubKey and derives its address.
    pub fn set_script(&mut self, script_bytes: &[u8], params: &ChainParams) {
        self.script = script_bytes.to_vec();
        self.address = Address::from_script_pubkey(script_bytes, params);
    }

    /// Sets the scriptSig; derives the spent address from it when the
    /// scriptPubKey never told us.
    pub fn set_signature(&mut self, signature: &[u8], params: &ChainParams) {
        self.signature = Some(signature.to_vec());
        if self.address.is_none() {
            self.address = Address::from_script_sig(signature, params);
        }
    }

    /// Points the input at `address`, rebuilding the scriptPubKey.
    pub fn set_address(&mut self, address: Address, params: &ChainParams) {
        self.script = address.script_pubkey(params).unwrap_or_default();
        self.address = Some(address);
    }
}

/// One transaction output.
#[derive(Debug, Clone, PartialEq)]
pub struct TxOutput {
    /// Address paid, when the script matches a standard template.
    pub address: Option<Address>,
    /// Amount in smallest units.
    pub amount: u64,
    /// scriptPubKey.
    pub script: Vec<u8>,
}

impl TxOutput {
    /// An output paying `amount` to `script_bytes`.
    pub fn new(amount: u64, script_bytes: &[u8], params: &ChainParams) -> Self {
        TxOutput {
            address: Address::from_script_pubkey(script_bytes, params),
            amount,
            script: script_bytes.to_vec(),
        }
    }

    /// An output paying `amount` to `address`, or `None` when the address
    /// does not decode on this network.
    pub fn pay_to(address: &Address, amount: u64, params: &ChainParams) -> Option<Self> {
        let script_bytes = address.script_pubkey(params)?;
        Some(TxOutput { address: Some(address.clone()), amount, script: script_bytes })
    }
}

/// An in-memory transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    /// Double SHA-256 of the canonical serialization; all zero until the
    /// transaction is fully signed or was parsed in signed form. Stable once
    /// [`Transaction::is_signed`] returns true.
    pub hash: TxHash,
    /// Version, 1 unless a caller says otherwise.
    pub version: u32,
    /// Inputs.
    pub inputs: Vec<TxInput>,
    /// Outputs.
    pub outputs: Vec<TxOutput>,
    /// Lock time; height below [`TX_MAX_LOCK_HEIGHT`], else a timestamp.
    pub lock_time: u32,
    /// Height of the confirming block, [`TX_UNCONFIRMED`] otherwise. Never
    /// serialized.
    pub block_height: u32,
    /// Timestamp of the confirming block, zero when unconfirmed. Never
    /// serialized.
    pub timestamp: u32,
}

impl Default for Transaction {
    fn default() -> Self { Self::new() }
}

impl Transaction {
    /// An empty version-1 transaction.
    pub fn new() -> Self {
        Transaction {
            hash: TxHash::all_zeros(),
            version: 1,
            inputs: Vec::new(),
            outputs: Vec::new(),
            lock_time: 0,
            block_height: TX_UNCONFIRMED,
            timestamp: 0,
        }
    }

    /// Appends an input.
    pub fn add_input(&mut self, input: TxInput) { self.inputs.push(input); }

    /// Appends an output.
    pub fn add_output(&mut self, output: TxOutput) { self.outputs.push(output); }

    /// True when every input carries a scriptSig.
    pub fn is_signed(&self) -> bool {
        !self.inputs.is_empty() && self.inputs.iter().all(|i| i.signature.is_some())
    }

    /// Parses a canonical or unsigned-convention serialization.
    pub fn parse(bytes: &[u8], params: &ChainParams) -> Result<Self, CodecError> {
        let mut cursor = Cursor::new(bytes);
        let mut tx = Transaction::new();
        let mut is_signed = true;

        tx.version = cursor.read_u32()?;

        let in_count = cursor.read_varint()? as usize;
        if in_count == 0 {
            return Err(CodecError::NoInputs);
        }
        // An input is at least 32 + 4 + 1 + 4 bytes; reject absurd counts
        // before allocating.
        if in_count > cursor.remaining() / 41 + 1 {
            return Err(CodecError::UnexpectedEof);
        }

        for _ in 0..in_count {
            let prev_hash = cursor.read_hash()?;
            let prev_index = cursor.read_u32()?;
            let mut input = TxInput::new(prev_hash, prev_index, 0);

            let script_bytes = cursor.read_var_bytes(TX_MAX_SIZE)?;
            if Address::from_script_pubkey(script_bytes, params).is_some() {
                // Unsigned input: scriptPubKey in the scriptSig slot, the
                // previous amount follows.
                input.set_script(script_bytes, params);
                input.amount = cursor.read_u64()?;
                is_signed = false;
            } else {
                input.set_signature(script_bytes, params);
            }
            input.sequence = cursor.read_u32()?;
            tx.inputs.push(input);
        }

        let out_count = cursor.read_varint()? as usize;
        if out_count > cursor.remaining() / 9 + 1 {
            return Err(CodecError::UnexpectedEof);
        }
        for _ in 0..out_count {
            let amount = cursor.read_u64()?;
            let script_bytes = cursor.read_var_bytes(TX_MAX_SIZE)?;
            tx.outputs.push(TxOutput::new(amount, script_bytes, params));
        }

        tx.lock_time = cursor.read_u32()?;

        if is_signed {
            tx.hash = sha256d::Hash::hash(&bytes[..cursor.position()]);
        }
        Ok(tx)
    }

    /// Canonical serialization; unsigned inputs use the offline-signing
    /// convention described in the module docs. `block_height` and
    /// `timestamp` are not serialized.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.size());
        buf.extend_from_slice(&self.version.to_le_bytes());

        write_varint(&mut buf, self.inputs.len() as u64);
        for input in &self.inputs {
            encode::write_hash(&mut buf, &input.prev_hash);
            buf.extend_from_slice(&input.prev_index.to_le_bytes());
            match &input.signature {
                Some(sig) => encode::write_var_bytes(&mut buf, sig),
                None => {
                    encode::write_var_bytes(&mut buf, &input.script);
                    buf.extend_from_slice(&input.amount.to_le_bytes());
                }
            }
            buf.extend_from_slice(&input.sequence.to_le_bytes());
        }

        write_varint(&mut buf, self.outputs.len() as u64);
        for output in &self.outputs {
            Self::write_output(&mut buf, output);
        }

        buf.extend_from_slice(&self.lock_time.to_le_bytes());
        buf
    }

    fn write_output(buf: &mut Vec<u8>, output: &TxOutput) {
        buf.extend_from_slice(&output.amount.to_le_bytes());
        encode::write_var_bytes(buf, &output.script);
    }

    /// The digest signed for input `index` under `hash_type`.
    ///
    /// Selects the BIP-143 algorithm when [`SIGHASH_FORKID`] is set or the
    /// spent output is a witness program, otherwise the legacy algorithm,
    /// including its pinned `SIGHASH_SINGLE` out-of-range digest of `0x01`
    /// padded to 32 bytes (a legacy-only quirk; BIP-143 hashes an empty
    /// output section instead).
    pub fn sighash(&self, index: usize, hash_type: u32) -> [u8; 32] {
        let spends_witness = recognize_script_pubkey(&self.inputs[index].script)
            .map(|t| matches!(t, Template::Witness { .. }))
            .unwrap_or(false);
        if hash_type & SIGHASH_FORKID != 0 || spends_witness {
            return self.witness_sighash(index, hash_type);
        }

        let sig_hash = hash_type & 0x1f;
        if sig_hash == SIGHASH_SINGLE && index >= self.outputs.len() {
            // Historic out-of-range behavior: the "digest" is the number 1.
            let mut digest = [0u8; 32];
            digest[0] = 0x01;
            return digest;
        }

        let anyone_can_pay = hash_type & SIGHASH_ANYONECANPAY != 0;
        let mut buf = Vec::with_capacity(self.size());
        buf.extend_from_slice(&self.version.to_le_bytes());

        if anyone_can_pay {
            write_varint(&mut buf, 1);
            let input = &self.inputs[index];
            encode::write_hash(&mut buf, &input.prev_hash);
            buf.extend_from_slice(&input.prev_index.to_le_bytes());
            encode::write_var_bytes(&mut buf, &input.script);
            buf.extend_from_slice(&input.sequence.to_le_bytes());
        } else {
            write_varint(&mut buf, self.inputs.len() as u64);
            for (n, input) in self.inputs.iter().enumerate() {
                encode::write_hash(&mut buf, &input.prev_hash);
                buf.extend_from_slice(&input.prev_index.to_le_bytes());
                if n == index {
                    // The signed input carries the previous scriptPubKey.
                    encode::write_var_bytes(&mut buf, &input.script);
                } else {
                    write_varint(&mut buf, 0);
                }
                let sequence = if n != index
                    && (sig_hash == SIGHASH_NONE || sig_hash == SIGHASH_SINGLE)
                {
                    0
                } else {
                    input.sequence
                };
                buf.extend_from_slice(&sequence.to_le_bytes());
            }
        }

        if sig_hash != SIGHASH_SINGLE && sig_hash != SIGHASH_NONE {
            write_varint(&mut buf, self.outputs.len() as u64);
            for output in &self.outputs {
                Self::write_output(&mut buf, output);
            }
        } else if sig_hash == SIGHASH_SINGLE {
            // index < outputs.len() was checked above.
            write_varint(&mut buf, index as u64 + 1);
            for _ in 0..index {
                buf.extend_from_slice(&u64::MAX.to_le_bytes()); // amount -1
                write_varint(&mut buf, 0);
            }
            Self::write_output(&mut buf, &self.outputs[index]);
        } else {
            write_varint(&mut buf, 0);
        }

        buf.extend_from_slice(&self.lock_time.to_le_bytes());
        buf.extend_from_slice(&hash_type.to_le_bytes());
        *sha256d::Hash::hash(&buf).as_byte_array()
    }

    /// BIP-143 digest for input `index`.
    fn witness_sighash(&self, index: usize, hash_type: u32) -> [u8; 32] {
        let sig_hash = hash_type & 0x1f;
        let anyone_can_pay = hash_type & SIGHASH_ANYONECANPAY != 0;
        let input = &self.inputs[index];

        let hash_prevouts = if anyone_can_pay {
            [0u8; 32]
        } else {
            let mut buf = Vec::with_capacity(self.inputs.len() * 36);
            for input in &self.inputs {
                encode::write_hash(&mut buf, &input.prev_hash);
                buf.extend_from_slice(&input.prev_index.to_le_bytes());
            }
            *sha256d::Hash::hash(&buf).as_byte_array()
        };

        let hash_sequence = if !anyone_can_pay
            && sig_hash != SIGHASH_SINGLE
            && sig_hash != SIGHASH_NONE
        {
            let mut buf = Vec::with_capacity(self.inputs.len() * 4);
            for input in &self.inputs {
                buf.extend_from_slice(&input.sequence.to_le_bytes());
            }
            *sha256d::Hash::hash(&buf).as_byte_array()
        } else {
            [0u8; 32]
        };

        let hash_outputs = if sig_hash != SIGHASH_SINGLE && sig_hash != SIGHASH_NONE {
            let mut buf = Vec::new();
            for output in &self.outputs {
                Self::write_output(&mut buf, output);
            }
            *sha256d::Hash::hash(&buf).as_byte_array()
        } else if sig_hash == SIGHASH_SINGLE && index < self.outputs.len() {
            let mut buf = Vec::new();
            Self::write_output(&mut buf, &self.outputs[index]);
            *sha256d::Hash::hash(&buf).as_byte_array()
        } else {
            [0u8; 32]
        };

        let mut buf = Vec::with_capacity(156 + input.script.len());
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(&hash_prevouts);
        buf.extend_from_slice(&hash_sequence);
        encode::write_hash(&mut buf, &input.prev_hash);
        buf.extend_from_slice(&input.prev_index.to_le_bytes());
        encode::write_var_bytes(&mut buf, &input.script);
        buf.extend_from_slice(&input.amount.to_le_bytes());
        buf.extend_from_slice(&input.sequence.to_le_bytes());
        buf.extend_from_slice(&hash_outputs);
        buf.extend_from_slice(&self.lock_time.to_le_bytes());
        buf.extend_from_slice(&hash_type.to_le_bytes());
        *sha256d::Hash::hash(&buf).as_byte_array()
    }

    /// Signs every unsigned input whose scriptPubKey pays one of `keys`.
    ///
    /// `fork_id` is zero for plain Litecoin signing; pass
    /// [`SIGHASH_FORKID`]-style bits for BIP-143 forks. Returns true once
    /// the whole transaction is signed; the hash is recomputed then and
    /// stays stable afterwards.
    pub fn sign(&mut self, fork_id: u32, keys: &[Key], params: &ChainParams) -> bool {
        let key_addresses: Vec<Address> = keys.iter().map(|k| k.address(params)).collect();
        let hash_type = fork_id | SIGHASH_ALL;

        for index in 0..self.inputs.len() {
            // Only P2PKH and P2PK spends assemble as a scriptSig; a witness
            // program needs a witness stack this model does not carry, so
            // such inputs stay unsigned and the whole tx stays incomplete.
            let is_p2pkh = match recognize_script_pubkey(&self.inputs[index].script) {
                Some(Template::P2pkh(_)) => true,
                Some(Template::P2pk(_)) => false,
                _ => continue,
            };
            let Some(address) =
                Address::from_script_pubkey(&self.inputs[index].script, params)
            else {
                continue;
            };
            let Some(position) = key_addresses.iter().position(|a| *a == address) else {
                continue;
            };
            let key = &keys[position];

            let digest = self.sighash(index, hash_type);
            let mut sig = key.sign(digest);
            sig.push(hash_type as u8);

            let mut script_sig = Vec::with_capacity(sig.len() + 35);
            script::push_data(&mut script_sig, &sig);
            if is_p2pkh {
                script::push_data(&mut script_sig, &key.pub_key());
            }
            self.inputs[index].set_signature(&script_sig, params);
        }

        if self.is_signed() {
            self.hash = sha256d::Hash::hash(&self.serialize());
            true
        } else {
            false
        }
    }

    /// Fisher-Yates shuffle of the outputs, hiding which one is change.
    pub fn shuffle_outputs<R: ShuffleRng + ?Sized>(&mut self, rng: &mut R) {
        let count = self.outputs.len();
        for i in 0..count.saturating_sub(1) {
            let j = i + rng.next_bound((count - i) as u32) as usize;
            self.outputs.swap(i, j);
        }
    }

    /// Serialized size if signed, estimated size otherwise, assuming
    /// compact-pubkey inputs.
    pub fn size(&self) -> usize {
        let mut size = 8
            + varint_size(self.inputs.len() as u64)
            + varint_size(self.outputs.len() as u64);
        for input in &self.inputs {
            size += match &input.signature {
                Some(sig) => 32 + 4 + varint_size(sig.len() as u64) + sig.len() + 4,
                None => TX_INPUT_SIZE,
            };
        }
        for output in &self.outputs {
            size += 8 + varint_size(output.script.len() as u64) + output.script.len();
        }
        size
    }

    /// Minimum fee for this transaction to relay, at the default rate.
    pub fn standard_fee(&self) -> u64 { (self.size() as u64 + 999) / 1000 * TX_FEE_PER_KB }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainParams;

    fn test_key(byte: u8) -> Key { Key::from_secret(&[byte; 32], true).unwrap() }

    fn funding_outpoint(byte: u8) -> TxHash { sha256d::Hash::hash(&[byte]) }

    fn unsigned_p2pkh_tx(params: &ChainParams, key: &Key, in_amount: u64, out_amount: u64) -> Transaction {
        let mut tx = Transaction::new();
        let mut input = TxInput::new(funding_outpoint(1), 0, in_amount);
        input.set_address(key.address(params), params);
        tx.add_input(input);
        let out_script = key.address(params).script_pubkey(params).unwrap();
        tx.add_output(TxOutput::new(out_amount, &out_script, params));
        tx
    }

    #[test]
    fn sign_p2pkh_and_roundtrip() {
        let params = ChainParams::mainnet();
        let key = test_key(0x55);
        let mut tx = unsigned_p2pkh_tx(&params, &key, 1000, 900);

        assert!(!tx.is_signed());
        assert!(tx.sign(0, std::slice::from_ref(&key), &params));
        assert!(tx.is_signed());
        let hash = tx.hash;

        // The scriptSig is PUSH(sig || 0x01) PUSH(pubkey).
        let script_sig = tx.inputs[0].signature.clone().unwrap();
        let elems = script::elements(&script_sig).unwrap();
        assert_eq!(elems.len(), 2);
        let sig = elems[0].data().unwrap();
        assert_eq!(*sig.last().unwrap(), SIGHASH_ALL as u8);
        assert_eq!(elems[1].data().unwrap(), &key.pub_key()[..]);

        // The signature verifies over the recomputed digest.
        let digest = tx.sighash(0, SIGHASH_ALL);
        key.verify(digest, &sig[..sig.len() - 1]).unwrap();

        // Signing is deterministic, so the hash is reproducible.
        let mut again = unsigned_p2pkh_tx(&params, &key, 1000, 900);
        again.sign(0, std::slice::from_ref(&key), &params);
        assert_eq!(again.hash, hash);

        // Round-trip through the wire form.
        let bytes = tx.serialize();
        let parsed = Transaction::parse(&bytes, &params).unwrap();
        assert!(parsed.is_signed());
        assert_eq!(parsed.hash, hash);
        assert_eq!(parsed.serialize(), bytes);
        assert_eq!(parsed.block_height, TX_UNCONFIRMED);
    }

    #[test]
    fn unsigned_serialization_keeps_amount() {
        let params = ChainParams::mainnet();
        let key = test_key(0x66);
        let tx = unsigned_p2pkh_tx(&params, &key, 123_456, 100_000);

        let bytes = tx.serialize();
        let parsed = Transaction::parse(&bytes, &params).unwrap();
        assert!(!parsed.is_signed());
        assert_eq!(parsed.inputs[0].amount, 123_456);
        assert_eq!(parsed.inputs[0].script, tx.inputs[0].script);
        assert_eq!(parsed.inputs[0].address, tx.inputs[0].address);
        assert_eq!(parsed.serialize(), bytes);
    }

    #[test]
    fn parse_rejects_empty_and_truncated() {
        let params = ChainParams::mainnet();
        // version + varint(0 inputs) + varint(0 outputs) + locktime
        let no_inputs = [1, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        assert!(matches!(Transaction::parse(&no_inputs, &params), Err(CodecError::NoInputs)));

        let key = test_key(0x11);
        let bytes = unsigned_p2pkh_tx(&params, &key, 1000, 900).serialize();
        assert!(Transaction::parse(&bytes[..bytes.len() - 3], &params).is_err());
    }

    #[test]
    fn copy_preserves_hash() {
        let params = ChainParams::mainnet();
        let key = test_key(0x77);
        let mut tx = unsigned_p2pkh_tx(&params, &key, 1000, 900);
        tx.sign(0, std::slice::from_ref(&key), &params);

        let copy = tx.clone();
        assert_eq!(copy.hash, tx.hash);
        assert_eq!(copy.serialize(), tx.serialize());
    }

    #[test]
    fn sighash_single_out_of_range_is_one() {
        let params = ChainParams::mainnet();
        let key = test_key(0x88);
        let mut tx = unsigned_p2pkh_tx(&params, &key, 1000, 900);
        // A second input with no paired output.
        let mut extra = TxInput::new(funding_outpoint(2), 0, 500);
        extra.set_address(key.address(&params), &params);
        tx.add_input(extra);

        let mut expected = [0u8; 32];
        expected[0] = 0x01;
        assert_eq!(tx.sighash(1, SIGHASH_SINGLE), expected);
        // In range produces a real digest.
        assert_ne!(tx.sighash(0, SIGHASH_SINGLE), expected);
    }

    #[test]
    fn witness_sighash_differs_from_legacy() {
        let params = ChainParams::mainnet();
        let key = test_key(0x99);
        let tx = unsigned_p2pkh_tx(&params, &key, 1000, 900);
        assert_ne!(tx.sighash(0, SIGHASH_ALL), tx.sighash(0, SIGHASH_FORKID | SIGHASH_ALL));
        // BIP-143 digests are deterministic too.
        assert_eq!(
            tx.sighash(0, SIGHASH_FORKID | SIGHASH_ALL),
            tx.sighash(0, SIGHASH_FORKID | SIGHASH_ALL)
        );
    }

    #[test]
    fn witness_input_digests_with_bip143() {
        let params = ChainParams::mainnet();
        let key = test_key(0xcc);

        let mut tx = Transaction::new();
        let mut input = TxInput::new(funding_outpoint(3), 0, 1000);
        let mut witness_script = vec![script::OP_0];
        script::push_data(&mut witness_script, &[0x44; 20]);
        input.set_script(&witness_script, &params);
        tx.add_input(input);
        let out_script = key.address(&params).script_pubkey(&params).unwrap();
        tx.add_output(TxOutput::new(900, &out_script, &params));

        // Only BIP-143 commits to the spent amount, so a digest that moves
        // with it proves the witness input took that path without the fork
        // id bit set.
        let digest = tx.sighash(0, SIGHASH_ALL);
        tx.inputs[0].amount = 5_000;
        assert_ne!(tx.sighash(0, SIGHASH_ALL), digest);

        // A P2PKH spend keeps the legacy digest, which ignores the amount.
        let mut legacy = unsigned_p2pkh_tx(&params, &key, 1000, 900);
        let digest = legacy.sighash(0, SIGHASH_ALL);
        legacy.inputs[0].amount = 5_000;
        assert_eq!(legacy.sighash(0, SIGHASH_ALL), digest);
    }

    #[test]
    fn witness_input_is_not_script_signable() {
        let params = ChainParams::mainnet();
        let key = test_key(0xdd);

        let mut tx = unsigned_p2pkh_tx(&params, &key, 1000, 900);
        let mut witness_input = TxInput::new(funding_outpoint(4), 0, 700);
        let mut witness_script = vec![script::OP_0];
        script::push_data(&mut witness_script, &[0x55; 20]);
        witness_input.set_script(&witness_script, &params);
        tx.add_input(witness_input);

        // The P2PKH input signs, the witness one stays unsigned, so the
        // transaction never reports fully signed.
        assert!(!tx.sign(0, std::slice::from_ref(&key), &params));
        assert!(tx.inputs[0].signature.is_some());
        assert!(tx.inputs[1].signature.is_none());
        assert!(!tx.is_signed());
    }

    #[test]
    fn shuffle_is_a_permutation() {
        let params = ChainParams::mainnet();
        let key = test_key(0xaa);
        let mut tx = Transaction::new();
        let script_bytes = key.address(&params).script_pubkey(&params).unwrap();
        for amount in 1..=8u64 {
            tx.add_output(TxOutput::new(amount, &script_bytes, &params));
        }

        let mut rng = FnvTimeRng::from_seed(42);
        tx.shuffle_outputs(&mut rng);
        let mut amounts: Vec<u64> = tx.outputs.iter().map(|o| o.amount).collect();
        amounts.sort_unstable();
        assert_eq!(amounts, (1..=8).collect::<Vec<u64>>());

        // Same seed, same permutation.
        let mut tx2 = Transaction::new();
        for amount in 1..=8u64 {
            tx2.add_output(TxOutput::new(amount, &script_bytes, &params));
        }
        let mut rng2 = FnvTimeRng::from_seed(42);
        tx2.shuffle_outputs(&mut rng2);
        let order: Vec<u64> = tx.outputs.iter().map(|o| o.amount).collect();
        let order2: Vec<u64> = tx2.outputs.iter().map(|o| o.amount).collect();
        assert_eq!(order, order2);
    }

    #[test]
    fn size_estimate_and_fee() {
        let params = ChainParams::mainnet();
        let key = test_key(0xbb);
        let mut tx = unsigned_p2pkh_tx(&params, &key, 10_000, 9_000);
        let unsigned_size = tx.size();
        assert_eq!(tx.standard_fee(), TX_FEE_PER_KB);

        tx.sign(0, std::slice::from_ref(&key), &params);
        let signed_size = tx.size();
        assert_eq!(signed_size, tx.serialize().len());
        // 148 bytes is an upper estimate for a compact-pubkey input.
        assert!(unsigned_size >= signed_size);
    }
}
