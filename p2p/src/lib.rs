// SPDX-License-Identifier: CC0-1.0

//! Peer-to-peer layer of a Litecoin SPV wallet engine.
//!
//! A [`PeerManager`] keeps up to [`manager::PEER_MAX_CONNECTIONS`] live
//! [`Peer`] connections, elects one as the download peer, drives header and
//! merkle-block sync behind the wallet's bloom filter, feeds matched
//! transactions back into the wallet, and relays outgoing transactions to
//! the network. Each peer owns one reader thread; outbound writes serialize
//! behind the peer's write lock.

mod error;
pub mod manager;
pub mod message;
pub mod peer;

pub use self::error::{ConsensusError, NetworkError, PublishError};
pub use self::manager::{ManagerDelegate, PeerManager};
pub use self::message::{Message, PeerInfo, VersionMessage};
pub use self::peer::{Peer, PeerStatus};
