// SPDX-License-Identifier: CC0-1.0

use core::fmt;

use primitives::{write_err, CodecError};

/// Failures on one peer connection.
///
/// These are quarantined at the peer boundary: the peer is dropped and the
/// pool dials a replacement; only when every peer has failed does the host
/// hear about it through `sync_stopped`.
#[derive(Debug)]
pub enum NetworkError {
    /// TCP connect or DNS resolution failed.
    ConnectFailed(std::io::Error),
    /// The version/verack exchange did not complete in time.
    HandshakeFailed,
    /// The peer went silent past a deadline.
    Timeout,
    /// The peer sent bytes that violate the protocol.
    PeerMisbehaved(&'static str),
    /// The connection broke mid-stream.
    Io(std::io::Error),
    /// A payload failed to decode.
    Codec(CodecError),
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use NetworkError::*;

        match *self {
            ConnectFailed(ref e) => write_err!(f, "connect failed"; e),
            HandshakeFailed => write!(f, "handshake did not complete in time"),
            Timeout => write!(f, "peer timed out"),
            PeerMisbehaved(what) => write!(f, "peer misbehaved: {}", what),
            Io(ref e) => write_err!(f, "connection error"; e),
            Codec(ref e) => write_err!(f, "payload decode failed"; e),
        }
    }
}

impl std::error::Error for NetworkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        use NetworkError::*;

        match *self {
            ConnectFailed(ref e) | Io(ref e) => Some(e),
            Codec(ref e) => Some(e),
            HandshakeFailed | Timeout | PeerMisbehaved(_) => None,
        }
    }
}

impl From<CodecError> for NetworkError {
    fn from(e: CodecError) -> Self { Self::Codec(e) }
}

/// A relayed block failed validation.
///
/// The sending peer is disconnected and banned for an hour; the block is
/// discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsensusError {
    /// Proof of work does not meet the stated target.
    BadPow,
    /// The partial merkle tree does not reconstruct the header root.
    BadMerkle,
    /// The target does not match the retarget schedule or a checkpoint.
    BadDifficulty,
    /// The timestamp is too far in the future.
    TimeTooNew,
}

impl fmt::Display for ConsensusError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use ConsensusError::*;

        match *self {
            BadPow => write!(f, "proof of work below target"),
            BadMerkle => write!(f, "merkle proof does not reconstruct the root"),
            BadDifficulty => write!(f, "difficulty target out of schedule"),
            TimeTooNew => write!(f, "block timestamp too far in the future"),
        }
    }
}

impl std::error::Error for ConsensusError {}

/// Outcome delivered to a `publish_tx` callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishError {
    /// The transaction is not fully signed.
    NotSigned,
    /// No peer requested the transaction within the publish deadline.
    Timeout,
    /// The manager disconnected before any peer accepted it.
    Canceled,
}

impl fmt::Display for PublishError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use PublishError::*;

        match *self {
            NotSigned => write!(f, "transaction is not signed"),
            Timeout => write!(f, "no peer accepted the transaction in time"),
            Canceled => write!(f, "publish canceled by disconnect"),
        }
    }
}

impl std::error::Error for PublishError {}
