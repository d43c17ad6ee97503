// SPDX-License-Identifier: CC0-1.0

//! secp256k1 keypairs: WIF import/export, ECDSA, compact recoverable
//! signatures.
//!
//! Secret material lives inside [`secp256k1::SecretKey`]; every scratch
//! buffer this module fills with scalar bytes is wiped before return, error
//! paths included.

use bitcoin_hashes::{hash160, sha256, Hash};
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId, Signature};
use secp256k1::{Message, PublicKey, SecretKey, SECP256K1};
use zeroize::Zeroize;

use crate::address::Address;
use crate::chain::ChainParams;
use crate::CryptoError;

/// A secp256k1 keypair with its pubkey-encoding preference.
pub struct Key {
    secret: SecretKey,
    compressed: bool,
}

impl core::fmt::Debug for Key {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        // Never print the secret.
        f.debug_struct("Key").field("compressed", &self.compressed).finish_non_exhaustive()
    }
}

impl Clone for Key {
    fn clone(&self) -> Self { Key { secret: self.secret, compressed: self.compressed } }
}

impl Drop for Key {
    fn drop(&mut self) { self.secret.non_secure_erase(); }
}

impl Key {
    /// Generates a fresh key from OS randomness.
    pub fn generate(compressed: bool) -> Self {
        Key { secret: SecretKey::new(&mut secp256k1::rand::thread_rng()), compressed }
    }

    /// Builds a key from a raw 32-byte secret.
    ///
    /// Fails with [`CryptoError::SecretOutOfRange`] unless `1 <= secret < n`.
    pub fn from_secret(secret: &[u8; 32], compressed: bool) -> Result<Self, CryptoError> {
        let secret =
            SecretKey::from_slice(secret).map_err(|_| CryptoError::SecretOutOfRange)?;
        Ok(Key { secret, compressed })
    }

    /// Imports a private key string.
    ///
    /// Accepts wallet import format, the 30-character mini key format, and a
    /// bare 64-character hex secret.
    pub fn from_priv_key(s: &str, params: &ChainParams) -> Result<Self, CryptoError> {
        // Mini key: 'S' + 29 base58 chars, valid when SHA256(key + "?")
        // starts with a zero byte; the secret is SHA256(key).
        if s.len() == 30 && s.starts_with('S') {
            let mut probe = Vec::with_capacity(31);
            probe.extend_from_slice(s.as_bytes());
            probe.push(b'?');
            let check = sha256::Hash::hash(&probe);
            probe.zeroize();
            if check.as_byte_array()[0] != 0 {
                return Err(CryptoError::BadWif);
            }
            let mut secret = *sha256::Hash::hash(s.as_bytes()).as_byte_array();
            let key = Self::from_secret(&secret, false);
            secret.zeroize();
            return key;
        }

        if s.len() == 64 {
            if let Ok(bytes) = hex::decode(s) {
                let mut secret = [0u8; 32];
                secret.copy_from_slice(&bytes);
                let key = Self::from_secret(&secret, true);
                secret.zeroize();
                return key;
            }
        }

        let mut payload = base58ck::decode_check(s).map_err(|_| CryptoError::BadWif)?;
        let result = match payload.as_slice() {
            [prefix, secret @ ..] if *prefix == params.wif_prefix && secret.len() == 32 => {
                let mut buf = [0u8; 32];
                buf.copy_from_slice(secret);
                let key = Self::from_secret(&buf, false);
                buf.zeroize();
                key
            }
            [prefix, secret @ .., 0x01] if *prefix == params.wif_prefix && secret.len() == 32 => {
                let mut buf = [0u8; 32];
                buf.copy_from_slice(secret);
                let key = Self::from_secret(&buf, true);
                buf.zeroize();
                key
            }
            _ => Err(CryptoError::BadWif),
        };
        payload.zeroize();
        result
    }

    /// True when `s` imports as a private key on `params`' network.
    pub fn is_valid_priv_key(s: &str, params: &ChainParams) -> bool {
        Self::from_priv_key(s, params).is_ok()
    }

    /// Exports in wallet import format.
    pub fn to_wif(&self, params: &ChainParams) -> String {
        let mut payload = Vec::with_capacity(34);
        payload.push(params.wif_prefix);
        payload.extend_from_slice(&self.secret.secret_bytes());
        if self.compressed {
            payload.push(0x01);
        }
        let wif = base58ck::encode_check(&payload);
        payload.zeroize();
        wif
    }

    /// Whether the pubkey serializes compressed.
    pub fn compressed(&self) -> bool { self.compressed }

    /// The serialized public key, 33 bytes compressed or 65 uncompressed.
    pub fn pub_key(&self) -> Vec<u8> {
        let pk = PublicKey::from_secret_key(SECP256K1, &self.secret);
        if self.compressed {
            pk.serialize().to_vec()
        } else {
            pk.serialize_uncompressed().to_vec()
        }
    }

    /// RIPEMD160(SHA256(pubkey)).
    pub fn hash160(&self) -> hash160::Hash { hash160::Hash::hash(&self.pub_key()) }

    /// The pay-to-pubkey-hash address for this key.
    pub fn address(&self, params: &ChainParams) -> Address {
        Address::from_pub_key(&self.pub_key(), params)
    }

    /// Signs a 32-byte digest, returning a DER signature with low-s form.
    pub fn sign(&self, digest: [u8; 32]) -> Vec<u8> {
        let msg = Message::from_digest(digest);
        SECP256K1.sign_ecdsa(&msg, &self.secret).serialize_der().to_vec()
    }

    /// Verifies a DER signature over `digest` against this key's pubkey.
    ///
    /// Parsing is lax about BER quirks found in the wild, matching relay
    /// behavior for historical signatures.
    pub fn verify(&self, digest: [u8; 32], sig: &[u8]) -> Result<(), CryptoError> {
        let sig = Signature::from_der_lax(sig).map_err(CryptoError::BadSignature)?;
        let mut normalized = sig;
        normalized.normalize_s();
        let msg = Message::from_digest(digest);
        let pk = PublicKey::from_secret_key(SECP256K1, &self.secret);
        SECP256K1.verify_ecdsa(&msg, &normalized, &pk).map_err(CryptoError::BadSignature)
    }

    /// Produces a 65-byte compact signature with embedded recovery id.
    ///
    /// Header byte is `27 + recid`, plus 4 when the pubkey is compressed.
    pub fn compact_sign(&self, digest: [u8; 32]) -> [u8; 65] {
        let msg = Message::from_digest(digest);
        let sig = SECP256K1.sign_ecdsa_recoverable(&msg, &self.secret);
        let (recid, data) = sig.serialize_compact();

        let mut out = [0u8; 65];
        out[0] = 27 + recid.to_i32() as u8 + if self.compressed { 4 } else { 0 };
        out[1..].copy_from_slice(&data);
        out
    }

    /// Raw secret bytes, for derivation internals only.
    pub(crate) fn secret_bytes_internal(&self) -> [u8; 32] { self.secret.secret_bytes() }
}

/// Recovers the serialized pubkey that produced a compact signature.
pub fn recover_compact(digest: [u8; 32], sig: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sig.len() != 65 || !(27..=34).contains(&sig[0]) {
        return Err(CryptoError::BadRecoveryId);
    }
    let compressed = (sig[0] - 27) & 4 != 0;
    let recid = RecoveryId::from_i32(i32::from((sig[0] - 27) & 3))
        .map_err(|_| CryptoError::BadRecoveryId)?;
    let sig = RecoverableSignature::from_compact(&sig[1..], recid)
        .map_err(CryptoError::BadSignature)?;

    let msg = Message::from_digest(digest);
    let pk = SECP256K1.recover_ecdsa(&msg, &sig).map_err(CryptoError::BadSignature)?;
    Ok(if compressed { pk.serialize().to_vec() } else { pk.serialize_uncompressed().to_vec() })
}

/// Verifies a compact signature by recovering and comparing pubkeys.
pub fn verify_compact(digest: [u8; 32], sig: &[u8], pub_key: &[u8]) -> bool {
    recover_compact(digest, sig).map(|recovered| recovered == pub_key).unwrap_or(false)
}
