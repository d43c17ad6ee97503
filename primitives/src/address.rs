// SPDX-License-Identifier: CC0-1.0

//! Litecoin address codec.
//!
//! NOTE: It's important here to be permissive with scriptSig (spends) and
//! strict with scriptPubKey (receives). If we miss a receive transaction,
//! only that transaction's funds are missed, however if we accept a receive
//! transaction that we are unable to correctly sign later, then the entire
//! wallet balance after that point would become stuck with the current coin
//! selection code.

use core::fmt;

use bech32::{Fe32, Hrp};
use bitcoin_hashes::{hash160, Hash};

use crate::chain::ChainParams;
use crate::script::{self, Element, Template};

/// Scripts over this size are never parsed for an address.
const MAX_SCRIPT_LENGTH: usize = 0x100;

/// Longest address the engine will produce or accept.
pub const MAX_ADDRESS_LENGTH: usize = 74;

/// A textual Litecoin address.
///
/// Base58Check for P2PKH/P2SH, bech32 for witness programs. Two addresses
/// are equal iff their textual forms are byte-equal; the derived `Hash` makes
/// the type usable as a map key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(String);

impl Address {
    /// Wraps an already-encoded address string.
    ///
    /// Returns `None` when the string is longer than any valid address.
    pub fn from_string(s: String) -> Option<Self> {
        if s.is_empty() || s.len() > MAX_ADDRESS_LENGTH {
            None
        } else {
            Some(Address(s))
        }
    }

    /// The textual form.
    pub fn as_str(&self) -> &str { &self.0 }

    /// The pay-to-pubkey-hash address of a serialized public key.
    pub fn from_pub_key(pub_key: &[u8], params: &ChainParams) -> Self {
        Self::base58(params.pubkey_prefix, hash160::Hash::hash(pub_key).as_byte_array())
    }

    /// Derives the address paid by a scriptPubKey, if it matches one of the
    /// standard templates.
    pub fn from_script_pubkey(script_bytes: &[u8], params: &ChainParams) -> Option<Self> {
        if script_bytes.is_empty() || script_bytes.len() > MAX_SCRIPT_LENGTH {
            return None;
        }
        let elems = script::elements(script_bytes)?;

        match script::recognize(&elems)? {
            Template::P2pkh(hash) => Some(Self::base58(params.pubkey_prefix, hash)),
            Template::P2sh(hash) => Some(Self::base58(params.script_prefix, hash)),
            Template::P2pk(pubkey) =>
                Some(Self::base58(params.pubkey_prefix, hash160::Hash::hash(pubkey).as_byte_array())),
            Template::Witness { version, program } => {
                let hrp = Hrp::parse(params.bech32_hrp).expect("chain params carry a valid hrp");
                let fe = Fe32::try_from(version).expect("recognizer bounds the version at 16");
                let encoded = bech32::segwit::encode(hrp, fe, program).ok()?;
                Address::from_string(encoded)
            }
        }
    }

    /// Derives the address spent by a scriptSig.
    ///
    /// Permissive by design, see the module note. P2PK scriptSigs carry no
    /// pubkey so nothing is recovered for them; witness scriptSigs are empty.
    pub fn from_script_sig(script_bytes: &[u8], params: &ChainParams) -> Option<Self> {
        if script_bytes.is_empty() || script_bytes.len() > MAX_SCRIPT_LENGTH {
            return None;
        }
        let elems = script::elements(script_bytes)?;

        match elems.as_slice() {
            // <sig> <pubkey>: pay-to-pubkey-hash spend.
            [.., sig, pubkey]
                if sig.opcode() <= script::OP_PUSHDATA4
                    && matches!(pubkey.data().map(<[u8]>::len), Some(33) | Some(65)) =>
            {
                let pk = pubkey.data().expect("pubkey push");
                Some(Self::base58(params.pubkey_prefix, hash160::Hash::hash(pk).as_byte_array()))
            }
            // <...> <redeem script>: pay-to-script-hash spend.
            [.., prev, redeem]
                if prev.opcode() <= script::OP_PUSHDATA4
                    && redeem.opcode() <= script::OP_PUSHDATA4
                    && redeem.data().is_some() =>
            {
                let redeem = redeem.data().expect("non-empty push");
                Some(Self::base58(params.script_prefix, hash160::Hash::hash(redeem).as_byte_array()))
            }
            _ => None,
        }
    }

    /// Emits the scriptPubKey paying this address, or `None` if the string
    /// does not decode on `params`' network.
    pub fn script_pubkey(&self, params: &ChainParams) -> Option<Vec<u8>> {
        if let Ok(payload) = base58ck::decode_check(&self.0) {
            if payload.len() != 21 {
                return None;
            }
            let mut out = Vec::with_capacity(25);
            if payload[0] == params.pubkey_prefix {
                out.extend_from_slice(&[script::OP_DUP, script::OP_HASH160]);
                script::push_data(&mut out, &payload[1..]);
                out.extend_from_slice(&[script::OP_EQUALVERIFY, script::OP_CHECKSIG]);
                return Some(out);
            }
            if payload[0] == params.script_prefix {
                out.push(script::OP_HASH160);
                script::push_data(&mut out, &payload[1..]);
                out.push(script::OP_EQUAL);
                return Some(out);
            }
            return None;
        }

        let (hrp, version, program) = bech32::segwit::decode(&self.0).ok()?;
        if hrp != Hrp::parse(params.bech32_hrp).expect("chain params carry a valid hrp") {
            return None;
        }
        let mut out = Vec::with_capacity(2 + program.len());
        out.push(match version.to_u8() {
            0 => script::OP_0,
            v => script::OP_1 + v - 1,
        });
        script::push_data(&mut out, &program);
        Some(out)
    }

    /// True when the string decodes as an address on `params`' network.
    pub fn is_valid(&self, params: &ChainParams) -> bool { self.script_pubkey(params).is_some() }

    /// The 20-byte hash embedded in a Base58Check address.
    pub fn hash160(&self) -> Option<[u8; 20]> {
        let payload = base58ck::decode_check(&self.0).ok()?;
        if payload.len() != 21 {
            return None;
        }
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&payload[1..]);
        Some(hash)
    }

    fn base58(prefix: u8, hash: &[u8]) -> Self {
        let mut payload = [0u8; 21];
        payload[0] = prefix;
        payload[1..].copy_from_slice(hash);
        Address(base58ck::encode_check(&payload))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result { f.write_str(&self.0) }
}

/// Matches raw scriptPubKey bytes against the standard templates.
///
/// Convenience over [`script::recognize`] that owns the parse.
pub fn recognize_script_pubkey(script_bytes: &[u8]) -> Option<Template<'_>> {
    if script_bytes.is_empty() || script_bytes.len() > MAX_SCRIPT_LENGTH {
        return None;
    }
    let elems: Vec<Element<'_>> = script::elements(script_bytes)?;
    script::recognize(&elems)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainParams;

    fn p2pkh_script(hash: [u8; 20]) -> Vec<u8> {
        let mut s = vec![script::OP_DUP, script::OP_HASH160];
        script::push_data(&mut s, &hash);
        s.extend_from_slice(&[script::OP_EQUALVERIFY, script::OP_CHECKSIG]);
        s
    }

    #[test]
    fn p2pkh_roundtrip() {
        let params = ChainParams::mainnet();
        let script_bytes = p2pkh_script([0x42; 20]);

        let addr = Address::from_script_pubkey(&script_bytes, &params).unwrap();
        assert!(addr.as_str().starts_with('L'));
        assert!(addr.is_valid(&params));
        assert_eq!(addr.script_pubkey(&params).unwrap(), script_bytes);
        assert_eq!(addr.hash160(), Some([0x42; 20]));
    }

    #[test]
    fn p2sh_roundtrip() {
        let params = ChainParams::mainnet();
        let mut script_bytes = vec![script::OP_HASH160];
        script::push_data(&mut script_bytes, &[0x17; 20]);
        script_bytes.push(script::OP_EQUAL);

        let addr = Address::from_script_pubkey(&script_bytes, &params).unwrap();
        assert!(addr.as_str().starts_with('M'));
        assert_eq!(addr.script_pubkey(&params).unwrap(), script_bytes);
    }

    #[test]
    fn witness_v0_roundtrip() {
        let params = ChainParams::mainnet();
        let mut script_bytes = vec![script::OP_0];
        script::push_data(&mut script_bytes, &[0x33; 20]);

        let addr = Address::from_script_pubkey(&script_bytes, &params).unwrap();
        assert!(addr.as_str().starts_with("ltc1"));
        assert_eq!(addr.script_pubkey(&params).unwrap(), script_bytes);
        assert!(addr.hash160().is_none());
    }

    #[test]
    fn wrong_network_rejects() {
        let mainnet = ChainParams::mainnet();
        let testnet = ChainParams::testnet();
        let addr = Address::from_script_pubkey(&p2pkh_script([0x42; 20]), &mainnet).unwrap();
        assert!(!addr.is_valid(&testnet));
    }

    #[test]
    fn corrupt_base58_rejects() {
        let params = ChainParams::mainnet();
        let addr = Address::from_script_pubkey(&p2pkh_script([0x42; 20]), &params).unwrap();
        let mut corrupted = addr.as_str().to_owned();
        // Flip the final character to break the checksum.
        let last = corrupted.pop().unwrap();
        corrupted.push(if last == '1' { '2' } else { '1' });
        assert!(!Address::from_string(corrupted).unwrap().is_valid(&params));
    }

    #[test]
    fn script_sig_p2pkh_recovery() {
        let params = ChainParams::mainnet();
        let pubkey = [0x02; 33];
        let mut sig_script = Vec::new();
        script::push_data(&mut sig_script, &[0x30; 71]);
        script::push_data(&mut sig_script, &pubkey);

        let spent = Address::from_script_sig(&sig_script, &params).unwrap();
        let expected = Address::base58(
            params.pubkey_prefix,
            bitcoin_hashes::hash160::Hash::hash(&pubkey).as_byte_array(),
        );
        assert_eq!(spent, expected);
    }

    #[test]
    fn oversize_script_ignored() {
        let params = ChainParams::mainnet();
        let mut big = p2pkh_script([0x01; 20]);
        big.resize(MAX_SCRIPT_LENGTH + 1, script::OP_0);
        assert!(Address::from_script_pubkey(&big, &params).is_none());
    }
}
