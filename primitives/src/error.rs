// SPDX-License-Identifier: CC0-1.0

//! Error types shared across the primitive codecs.

use core::fmt;

/// Formats an error with its source appended to the variant message.
#[macro_export]
macro_rules! write_err {
    ($writer:expr, $string:literal $(, $args:expr)*; $source:expr) => {
        {
            let _ = &$source;   // Prevents clippy warnings.
            write!($writer, $string $(, $args)*)
        }
    }
}

/// Malformed bytes encountered while decoding wire or script data.
///
/// Codec errors are always local: the offending input is rejected and no
/// state changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Ran out of bytes mid-field.
    UnexpectedEof,
    /// A serialized transaction contained no inputs.
    NoInputs,
    /// Script bytes did not parse as a well formed element sequence.
    BadScript,
    /// The string is not an address on this network.
    BadAddress,
    /// A length prefix exceeded the permitted maximum for its container.
    Oversize {
        /// Length claimed by the prefix.
        claimed: usize,
        /// Hard cap for this container.
        max: usize,
    },
    /// Base58Check decoding failed.
    Base58(base58ck::Error),
    /// Bech32 segwit decoding failed.
    Bech32(bech32::segwit::DecodeError),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use CodecError::*;

        match *self {
            UnexpectedEof => write!(f, "unexpected end of data"),
            NoInputs => write!(f, "serialized transaction has no inputs"),
            BadScript => write!(f, "malformed script"),
            BadAddress => write!(f, "not a valid address for this network"),
            Oversize { claimed, max } =>
                write!(f, "length prefix {} exceeds maximum {}", claimed, max),
            Base58(ref e) => write_err!(f, "base58check decode failed"; e),
            Bech32(ref e) => write_err!(f, "bech32 decode failed"; e),
        }
    }
}

impl std::error::Error for CodecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        use CodecError::*;

        match *self {
            UnexpectedEof | NoInputs | BadScript | BadAddress | Oversize { .. } => None,
            Base58(ref e) => Some(e),
            Bech32(ref e) => Some(e),
        }
    }
}

impl From<base58ck::Error> for CodecError {
    fn from(e: base58ck::Error) -> Self { Self::Base58(e) }
}

impl From<bech32::segwit::DecodeError> for CodecError {
    fn from(e: bech32::segwit::DecodeError) -> Self { Self::Bech32(e) }
}

/// Key material or signature bytes failed a secp256k1 domain check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// WIF string failed its Base58Check checksum or layout.
    BadWif,
    /// Secret scalar is zero or not less than the group order.
    SecretOutOfRange,
    /// Public key bytes are not a valid curve point encoding.
    BadPubKey(secp256k1::Error),
    /// DER signature parse failure.
    BadSignature(secp256k1::Error),
    /// Compact signature recovery id was not in `{0, 1, 2, 3}`.
    BadRecoveryId,
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use CryptoError::*;

        match *self {
            BadWif => write!(f, "invalid WIF private key"),
            SecretOutOfRange => write!(f, "secret key out of range [1, n)"),
            BadPubKey(ref e) => write_err!(f, "invalid public key encoding"; e),
            BadSignature(ref e) => write_err!(f, "invalid DER signature"; e),
            BadRecoveryId => write!(f, "compact signature recovery id out of range"),
        }
    }
}

impl std::error::Error for CryptoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        use CryptoError::*;

        match *self {
            BadWif | SecretOutOfRange | BadRecoveryId => None,
            BadPubKey(ref e) | BadSignature(ref e) => Some(e),
        }
    }
}

/// BIP-32 child derivation produced an invalid key.
///
/// Probability below 2^-127; callers retry with the next index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DerivationError {
    /// `I_L >= n` or the derived key was zero (point at infinity).
    KeyInvalid,
}

impl fmt::Display for DerivationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            DerivationError::KeyInvalid =>
                write!(f, "derived child key invalid, retry with the next index"),
        }
    }
}

impl std::error::Error for DerivationError {}
