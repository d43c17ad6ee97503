// SPDX-License-Identifier: CC0-1.0

//! BIP-32 hierarchical deterministic derivation.
//!
//! The wallet layout is fixed: receive keys at `m/0H/0/index`, change keys
//! at `m/0H/1/index`, and the authenticated-API key at `m/1H/0` (bitauth).
//! The exported [`MasterPubKey`] is the extended public key at `N(m/0H)`,
//! which is all the watch side of the wallet ever needs.
//!
//! Every intermediate buffer holding scalar material is zeroed before
//! return, on error paths too.

use bitcoin_hashes::{sha512, Hash, HashEngine, Hmac, HmacEngine};
use secp256k1::{PublicKey, Scalar, SecretKey, SECP256K1};
use zeroize::Zeroize;

use crate::key::Key;
use crate::DerivationError;

/// Bit marking a hardened derivation index.
pub const HARDENED: u32 = 0x8000_0000;

/// The receive (external) address chain of the default layout.
pub const CHAIN_EXTERNAL: u32 = 0;
/// The change (internal) address chain of the default layout.
pub const CHAIN_INTERNAL: u32 = 1;

const SEED_KEY: &[u8] = b"Bitcoin seed";

/// The BIP-32 extended public key at path `N(m/0H)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MasterPubKey {
    /// Low 32 bits of HASH160(parent pubkey), big-endian.
    pub fingerprint: u32,
    /// Child chain code.
    pub chain_code: [u8; 32],
    /// Compressed child public key.
    pub pub_key: [u8; 33],
}

fn hmac_sha512(key: &[u8], data: &[u8]) -> [u8; 64] {
    let mut engine = HmacEngine::<sha512::Hash>::new(key);
    engine.input(data);
    Hmac::<sha512::Hash>::from_engine(engine).to_byte_array()
}

/// Private parent key -> private child key, in place.
///
/// Hardened children commit to the serialized secret, normal children to the
/// compressed public point. Fails with [`DerivationError::KeyInvalid`] when
/// `I_L >= n` or the sum is zero; retry with the next index.
pub fn ckd_priv(
    secret: &mut [u8; 32],
    chain_code: &mut [u8; 32],
    index: u32,
) -> Result<(), DerivationError> {
    let mut data = [0u8; 37];
    if index & HARDENED != 0 {
        data[0] = 0;
        data[1..33].copy_from_slice(secret);
    } else {
        let key = SecretKey::from_slice(secret).map_err(|_| DerivationError::KeyInvalid)?;
        data[..33].copy_from_slice(&PublicKey::from_secret_key(SECP256K1, &key).serialize());
    }
    data[33..].copy_from_slice(&index.to_be_bytes());

    let mut i = hmac_sha512(chain_code, &data);
    data.zeroize();

    let result = (|| {
        let mut tweak_bytes = [0u8; 32];
        tweak_bytes.copy_from_slice(&i[..32]);
        let tweak = Scalar::from_be_bytes(tweak_bytes);
        tweak_bytes.zeroize();
        let tweak = tweak.map_err(|_| DerivationError::KeyInvalid)?;

        let parent = SecretKey::from_slice(secret).map_err(|_| DerivationError::KeyInvalid)?;
        let child = parent.add_tweak(&tweak).map_err(|_| DerivationError::KeyInvalid)?;

        secret.copy_from_slice(&child.secret_bytes());
        chain_code.copy_from_slice(&i[32..]);
        Ok(())
    })();

    i.zeroize();
    result
}

/// Public parent key -> public child key, in place.
///
/// Defined only for non-hardened indexes; a hardened index is a no-op that
/// preserves both inputs.
pub fn ckd_pub(
    pub_key: &mut [u8; 33],
    chain_code: &mut [u8; 32],
    index: u32,
) -> Result<(), DerivationError> {
    if index & HARDENED != 0 {
        return Ok(());
    }

    let mut data = [0u8; 37];
    data[..33].copy_from_slice(pub_key);
    data[33..].copy_from_slice(&index.to_be_bytes());

    let mut i = hmac_sha512(chain_code, &data);

    let result = (|| {
        let mut tweak_bytes = [0u8; 32];
        tweak_bytes.copy_from_slice(&i[..32]);
        let tweak = Scalar::from_be_bytes(tweak_bytes);
        tweak_bytes.zeroize();
        let tweak = tweak.map_err(|_| DerivationError::KeyInvalid)?;

        let parent = PublicKey::from_slice(pub_key).map_err(|_| DerivationError::KeyInvalid)?;
        let child = parent
            .add_exp_tweak(SECP256K1, &tweak)
            .map_err(|_| DerivationError::KeyInvalid)?;

        pub_key.copy_from_slice(&child.serialize());
        chain_code.copy_from_slice(&i[32..]);
        Ok(())
    })();

    i.zeroize();
    result
}

fn master_secret(seed: &[u8]) -> Result<([u8; 32], [u8; 32]), DerivationError> {
    let mut i = hmac_sha512(SEED_KEY, seed);
    let mut secret = [0u8; 32];
    let mut chain_code = [0u8; 32];
    secret.copy_from_slice(&i[..32]);
    chain_code.copy_from_slice(&i[32..]);
    i.zeroize();

    if SecretKey::from_slice(&secret).is_err() {
        secret.zeroize();
        chain_code.zeroize();
        return Err(DerivationError::KeyInvalid);
    }
    Ok((secret, chain_code))
}

impl MasterPubKey {
    /// Computes the master public key for the default wallet layout,
    /// derivation path `N(m/0H)`.
    pub fn from_seed(seed: &[u8]) -> Result<Self, DerivationError> {
        let (mut secret, mut chain_code) = master_secret(seed)?;

        let master = Key::from_secret(&secret, true).map_err(|_| DerivationError::KeyInvalid);
        let result = master.and_then(|master| {
            let mut fp = [0u8; 4];
            fp.copy_from_slice(&master.hash160().as_byte_array()[..4]);
            let fingerprint = u32::from_be_bytes(fp);

            ckd_priv(&mut secret, &mut chain_code, HARDENED)?; // path m/0H

            let child = Key::from_secret(&secret, true)
                .map_err(|_| DerivationError::KeyInvalid)?;
            let mut pub_key = [0u8; 33];
            pub_key.copy_from_slice(&child.pub_key());
            Ok(MasterPubKey { fingerprint, chain_code, pub_key })
        });

        secret.zeroize();
        chain_code.zeroize();
        result
    }

    /// Public key for path `N(m/0H/chain/index)`.
    pub fn derive_pub_key(&self, chain: u32, index: u32) -> Result<[u8; 33], DerivationError> {
        let mut pub_key = self.pub_key;
        let mut chain_code = self.chain_code;
        ckd_pub(&mut pub_key, &mut chain_code, chain)?;
        ckd_pub(&mut pub_key, &mut chain_code, index)?;
        chain_code.zeroize();
        Ok(pub_key)
    }
}

/// Private key for an arbitrary path below the master.
pub fn priv_key_path(seed: &[u8], path: &[u32]) -> Result<Key, DerivationError> {
    let (mut secret, mut chain_code) = master_secret(seed)?;

    let result = (|| {
        for &index in path {
            ckd_priv(&mut secret, &mut chain_code, index)?;
        }
        Key::from_secret(&secret, true).map_err(|_| DerivationError::KeyInvalid)
    })();

    secret.zeroize();
    chain_code.zeroize();
    result
}

/// Private key for path `m/0H/chain/index`.
pub fn priv_key(seed: &[u8], chain: u32, index: u32) -> Result<Key, DerivationError> {
    priv_key_path(seed, &[HARDENED, chain, index])
}

/// Private keys for `m/0H/chain/i` for each `i` in `indexes`.
///
/// The shared `m/0H/chain` prefix is derived once.
pub fn priv_key_list(
    seed: &[u8],
    chain: u32,
    indexes: &[u32],
) -> Result<Vec<Key>, DerivationError> {
    let (mut secret, mut chain_code) = master_secret(seed)?;

    let result = (|| {
        ckd_priv(&mut secret, &mut chain_code, HARDENED)?; // path m/0H
        ckd_priv(&mut secret, &mut chain_code, chain)?; // path m/0H/chain

        let mut keys = Vec::with_capacity(indexes.len());
        for &index in indexes {
            let mut s = secret;
            let mut c = chain_code;
            let derived = ckd_priv(&mut s, &mut c, index)
                .and_then(|()| Key::from_secret(&s, true).map_err(|_| DerivationError::KeyInvalid));
            s.zeroize();
            c.zeroize();
            keys.push(derived?);
        }
        Ok(keys)
    })();

    secret.zeroize();
    chain_code.zeroize();
    result
}

/// Key for authenticated API calls (bitauth), path `m/1H/0`.
pub fn api_auth_key(seed: &[u8]) -> Result<Key, DerivationError> {
    priv_key_path(seed, &[1 | HARDENED, 0])
}

#[cfg(test)]
mod tests {
    use super::*;

    // BIP-32 test vector 1.
    const SEED: [u8; 16] =
        [0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f];

    #[test]
    fn vector_1_m_0h() {
        let mpk = MasterPubKey::from_seed(&SEED).unwrap();
        assert_eq!(mpk.fingerprint, 0x3442193e);
        assert_eq!(
            hex::encode(mpk.chain_code),
            "47fdacbd0f1097043b78c63c20c34ef4ed9a111d980047ad16282c7ae6236141"
        );
        assert_eq!(
            hex::encode(mpk.pub_key),
            "035a784662a4a20a65bf6aab9ae98a6c068a81c52e4b032c0fb5400c706cfccc56"
        );
    }

    #[test]
    fn master_pub_key_matches_private_derivation() {
        let mpk = MasterPubKey::from_seed(&SEED).unwrap();
        let key = priv_key_path(&SEED, &[HARDENED]).unwrap();
        assert_eq!(&mpk.pub_key[..], &key.pub_key()[..]);
    }

    #[test]
    fn ckd_pub_matches_ckd_priv() {
        let mpk = MasterPubKey::from_seed(&SEED).unwrap();
        for chain in [CHAIN_EXTERNAL, CHAIN_INTERNAL] {
            for index in [0u32, 1, 7, 1000] {
                let watch = mpk.derive_pub_key(chain, index).unwrap();
                let spend = priv_key(&SEED, chain, index).unwrap();
                assert_eq!(&watch[..], &spend.pub_key()[..]);
            }
        }
    }

    #[test]
    fn ckd_pub_hardened_is_noop() {
        let mpk = MasterPubKey::from_seed(&SEED).unwrap();
        let mut pub_key = mpk.pub_key;
        let mut chain_code = mpk.chain_code;
        ckd_pub(&mut pub_key, &mut chain_code, HARDENED | 5).unwrap();
        assert_eq!(pub_key, mpk.pub_key);
        assert_eq!(chain_code, mpk.chain_code);
    }

    #[test]
    fn priv_key_list_matches_individual_derivation() {
        let keys = priv_key_list(&SEED, CHAIN_EXTERNAL, &[0, 3, 9]).unwrap();
        for (key, index) in keys.iter().zip([0u32, 3, 9]) {
            let individual = priv_key(&SEED, CHAIN_EXTERNAL, index).unwrap();
            assert_eq!(key.pub_key(), individual.pub_key());
        }
    }

    #[test]
    fn api_auth_key_differs_from_wallet_keys() {
        let auth = api_auth_key(&SEED).unwrap();
        let receive = priv_key(&SEED, CHAIN_EXTERNAL, 0).unwrap();
        assert_ne!(auth.pub_key(), receive.pub_key());
    }
}
