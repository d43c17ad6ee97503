// SPDX-License-Identifier: CC0-1.0

//! Wire message codec for the Litecoin peer-to-peer protocol.
//!
//! Every message travels under a 24-byte header: magic, a NUL-padded
//! 12-byte command, the payload length and the first four bytes of the
//! payload's double SHA-256. Integers are little-endian, vectors carry a
//! VarInt count, and addresses use the 16-byte IPv6-mapped form with a
//! big-endian port.

use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use primitives::encode::{self, Cursor};
use primitives::hashes::{sha256d, Hash};
use primitives::{BlockHash, ChainParams, CodecError, MerkleBlock, Transaction, TxHash};
use serde::{Deserialize, Serialize};

use crate::NetworkError;

/// Length of the fixed message header.
pub const HEADER_LENGTH: usize = 24;
/// Largest payload a peer may send.
pub const MAX_MSG_LENGTH: usize = 0x0200_0000;
/// Most entries allowed in an `inv`, `getdata` or `notfound` vector.
pub const MAX_INV_ENTRIES: usize = 50_000;
/// Most addresses allowed in one `addr` message.
pub const MAX_ADDR_ENTRIES: usize = 1_000;
/// Most headers sent in one `headers` message.
pub const MAX_HEADERS: usize = 2_000;
/// Most locator hashes in a `getheaders`/`getblocks` request.
pub const MAX_LOCATORS: usize = 101;

/// `inv` entry type for a transaction.
pub const INV_TX: u32 = 1;
/// `inv` entry type for a full block.
pub const INV_BLOCK: u32 = 2;
/// `inv` entry type for a bloom-filtered block.
pub const INV_FILTERED_BLOCK: u32 = 3;

/// User agent advertised in the `version` message.
pub const USER_AGENT: &str = concat!("/litespv:", env!("CARGO_PKG_VERSION"), "/");

/// A peer address as gossiped and persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerInfo {
    /// IP address.
    pub address: IpAddr,
    /// TCP port.
    pub port: u16,
    /// Service bits the peer advertised.
    pub services: u64,
    /// Last seen, seconds since the unix epoch.
    pub timestamp: u32,
}

impl PeerInfo {
    /// Builds an entry from a socket address.
    pub fn from_socket_addr(addr: SocketAddr, services: u64, timestamp: u32) -> Self {
        PeerInfo { address: addr.ip(), port: addr.port(), services, timestamp }
    }

    /// The dialable socket address.
    pub fn socket_addr(&self) -> SocketAddr { SocketAddr::new(self.address, self.port) }

    fn ip_bytes(&self) -> [u8; 16] {
        match self.address {
            IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
            IpAddr::V6(v6) => v6.octets(),
        }
    }

    fn ip_from_bytes(bytes: [u8; 16]) -> IpAddr {
        let v6 = Ipv6Addr::from(bytes);
        match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        }
    }
}

/// The `version` handshake payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMessage {
    /// Protocol version spoken.
    pub version: u32,
    /// Services offered.
    pub services: u64,
    /// Sender's clock.
    pub timestamp: u64,
    /// Address the message is sent to.
    pub recv_services: u64,
    /// Receiver IP as seen by the sender.
    pub recv_address: IpAddr,
    /// Receiver port.
    pub recv_port: u16,
    /// Connection nonce for self-connection detection.
    pub nonce: u64,
    /// Free-form client identifier.
    pub user_agent: String,
    /// Height of the sender's best chain.
    pub start_height: u32,
    /// Whether transactions should relay before a filter loads.
    pub relay: bool,
}

/// One decoded peer-to-peer message.
#[derive(Debug, Clone)]
pub enum Message {
    /// Handshake opener.
    Version(VersionMessage),
    /// Handshake acknowledgement.
    Verack,
    /// Gossiped peer addresses.
    Addr(Vec<PeerInfo>),
    /// Inventory announcement, `(type, hash)` pairs.
    Inv(Vec<(u32, sha256d::Hash)>),
    /// Request for inventory items.
    GetData(Vec<(u32, sha256d::Hash)>),
    /// Items a peer could not serve.
    NotFound(Vec<(u32, sha256d::Hash)>),
    /// A transaction.
    Tx(Transaction),
    /// Bare headers, 81-byte entries.
    Headers(Vec<MerkleBlock>),
    /// Header-chain request from locators up to a stop hash.
    GetHeaders {
        /// Known block hashes, newest first.
        locators: Vec<BlockHash>,
        /// Hash to stop at, or all-zero for as-many-as-fit.
        stop: BlockHash,
    },
    /// Block request in filtered form.
    GetBlocks {
        /// Known block hashes, newest first.
        locators: Vec<BlockHash>,
        /// Hash to stop at, or all-zero.
        stop: BlockHash,
    },
    /// A bloom-filtered block.
    MerkleBlock(MerkleBlock),
    /// A serialized bloom filter for the remote to apply.
    FilterLoad(Vec<u8>),
    /// One element appended to the remote's loaded filter.
    FilterAdd(Vec<u8>),
    /// Request for the remote's mempool through the loaded filter.
    Mempool,
    /// Keepalive probe.
    Ping(u64),
    /// Keepalive reply.
    Pong(u64),
    /// The remote rejected one of our messages.
    Reject {
        /// Command being rejected.
        message: String,
        /// Protocol reject code.
        code: u8,
        /// Human-readable reason.
        reason: String,
    },
    /// A command this engine does not handle; skipped by length.
    Unknown(String),
}

impl Message {
    /// The wire command for this message.
    pub fn command(&self) -> &str {
        use Message::*;

        match *self {
            Version(_) => "version",
            Verack => "verack",
            Addr(_) => "addr",
            Inv(_) => "inv",
            GetData(_) => "getdata",
            NotFound(_) => "notfound",
            Tx(_) => "tx",
            Headers(_) => "headers",
            GetHeaders { .. } => "getheaders",
            GetBlocks { .. } => "getblocks",
            MerkleBlock(_) => "merkleblock",
            FilterLoad(_) => "filterload",
            FilterAdd(_) => "filteradd",
            Mempool => "mempool",
            Ping(_) => "ping",
            Pong(_) => "pong",
            Reject { .. } => "reject",
            Unknown(ref command) => command,
        }
    }

    /// Serializes the payload (header excluded).
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Message::Version(version) => {
                buf.extend_from_slice(&version.version.to_le_bytes());
                buf.extend_from_slice(&version.services.to_le_bytes());
                buf.extend_from_slice(&version.timestamp.to_le_bytes());
                write_net_addr(&mut buf, version.recv_services, version.recv_address, version.recv_port);
                // addr_from is ignored by modern nodes; zero services, any ip.
                write_net_addr(&mut buf, version.services, IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
                buf.extend_from_slice(&version.nonce.to_le_bytes());
                encode::write_var_bytes(&mut buf, version.user_agent.as_bytes());
                buf.extend_from_slice(&version.start_height.to_le_bytes());
                buf.push(u8::from(version.relay));
            }
            Message::Verack | Message::Mempool => {}
            Message::Addr(peers) => {
                encode::write_varint(&mut buf, peers.len() as u64);
                for peer in peers {
                    buf.extend_from_slice(&peer.timestamp.to_le_bytes());
                    buf.extend_from_slice(&peer.services.to_le_bytes());
                    buf.extend_from_slice(&peer.ip_bytes());
                    buf.extend_from_slice(&peer.port.to_be_bytes());
                }
            }
            Message::Inv(items) | Message::GetData(items) | Message::NotFound(items) => {
                encode::write_varint(&mut buf, items.len() as u64);
                for (inv_type, hash) in items {
                    buf.extend_from_slice(&inv_type.to_le_bytes());
                    encode::write_hash(&mut buf, hash);
                }
            }
            Message::Tx(tx) => buf = tx.serialize(),
            Message::Headers(headers) => {
                encode::write_varint(&mut buf, headers.len() as u64);
                for header in headers {
                    let mut block = header.clone();
                    block.total_tx = 0;
                    buf.extend_from_slice(&block.serialize());
                    encode::write_varint(&mut buf, 0);
                }
            }
            Message::GetHeaders { locators, stop } | Message::GetBlocks { locators, stop } => {
                // Message version prefix, fixed at the protocol version.
                buf.extend_from_slice(&70015u32.to_le_bytes());
                encode::write_varint(&mut buf, locators.len() as u64);
                for locator in locators {
                    encode::write_hash(&mut buf, locator);
                }
                encode::write_hash(&mut buf, stop);
            }
            Message::MerkleBlock(block) => buf = block.serialize(),
            Message::FilterLoad(payload) => buf = payload.clone(),
            Message::FilterAdd(element) => encode::write_var_bytes(&mut buf, element),
            Message::Ping(nonce) | Message::Pong(nonce) => {
                buf.extend_from_slice(&nonce.to_le_bytes());
            }
            Message::Reject { message, code, reason } => {
                encode::write_var_bytes(&mut buf, message.as_bytes());
                buf.push(*code);
                encode::write_var_bytes(&mut buf, reason.as_bytes());
            }
            Message::Unknown(_) => {}
        }
        buf
    }

    /// Decodes a payload for `command`. Unknown commands decode to
    /// [`Message::Unknown`] and are ignored upstream.
    pub fn decode_payload(
        command: &str,
        payload: &[u8],
        params: &ChainParams,
    ) -> Result<Self, CodecError> {
        let mut cursor = Cursor::new(payload);
        let message = match command {
            "version" => {
                let version = cursor.read_u32()?;
                let services = cursor.read_u64()?;
                let timestamp = cursor.read_u64()?;
                let (recv_services, recv_address, recv_port) = read_net_addr(&mut cursor)?;
                let _from = read_net_addr(&mut cursor)?;
                let nonce = cursor.read_u64()?;
                let user_agent =
                    String::from_utf8_lossy(cursor.read_var_bytes(256)?).into_owned();
                let start_height = cursor.read_u32()?;
                // Absent relay flag means relay, per BIP-37.
                let relay = cursor.is_empty() || cursor.read_u8()? != 0;
                Message::Version(VersionMessage {
                    version,
                    services,
                    timestamp,
                    recv_services,
                    recv_address,
                    recv_port,
                    nonce,
                    user_agent,
                    start_height,
                    relay,
                })
            }
            "verack" => Message::Verack,
            "addr" => {
                let count = cursor.read_varint()? as usize;
                if count > MAX_ADDR_ENTRIES {
                    return Err(CodecError::Oversize { claimed: count, max: MAX_ADDR_ENTRIES });
                }
                let mut peers = Vec::with_capacity(count);
                for _ in 0..count {
                    let timestamp = cursor.read_u32()?;
                    let (services, address, port) = read_net_addr(&mut cursor)?;
                    peers.push(PeerInfo { address, port, services, timestamp });
                }
                Message::Addr(peers)
            }
            "inv" | "getdata" | "notfound" => {
                let count = cursor.read_varint()? as usize;
                if count > MAX_INV_ENTRIES {
                    return Err(CodecError::Oversize { claimed: count, max: MAX_INV_ENTRIES });
                }
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    let inv_type = cursor.read_u32()?;
                    let hash = cursor.read_hash()?;
                    items.push((inv_type, hash));
                }
                match command {
                    "inv" => Message::Inv(items),
                    "getdata" => Message::GetData(items),
                    _ => Message::NotFound(items),
                }
            }
            "tx" => Message::Tx(Transaction::parse(payload, params)?),
            "headers" => {
                let count = cursor.read_varint()? as usize;
                if count > MAX_HEADERS {
                    return Err(CodecError::Oversize { claimed: count, max: MAX_HEADERS });
                }
                let mut headers = Vec::with_capacity(count);
                for _ in 0..count {
                    let header_bytes = cursor.read_bytes(80)?;
                    headers.push(MerkleBlock::parse(header_bytes)?);
                    // Trailing tx count, always zero in a headers message.
                    cursor.read_varint()?;
                }
                Message::Headers(headers)
            }
            "getheaders" | "getblocks" => {
                let _version = cursor.read_u32()?;
                let count = cursor.read_varint()? as usize;
                if count > MAX_LOCATORS {
                    return Err(CodecError::Oversize { claimed: count, max: MAX_LOCATORS });
                }
                let mut locators = Vec::with_capacity(count);
                for _ in 0..count {
                    locators.push(cursor.read_hash()?);
                }
                let stop = cursor.read_hash()?;
                if command == "getheaders" {
                    Message::GetHeaders { locators, stop }
                } else {
                    Message::GetBlocks { locators, stop }
                }
            }
            "merkleblock" => Message::MerkleBlock(MerkleBlock::parse(payload)?),
            "filterload" => Message::FilterLoad(payload.to_vec()),
            "filteradd" => Message::FilterAdd(cursor.read_var_bytes(520)?.to_vec()),
            "mempool" => Message::Mempool,
            "ping" => Message::Ping(cursor.read_u64()?),
            "pong" => Message::Pong(cursor.read_u64()?),
            "reject" => {
                let message =
                    String::from_utf8_lossy(cursor.read_var_bytes(12)?).into_owned();
                let code = cursor.read_u8()?;
                let reason =
                    String::from_utf8_lossy(cursor.read_var_bytes(111)?).into_owned();
                Message::Reject { message, code, reason }
            }
            other => Message::Unknown(other.to_owned()),
        };
        Ok(message)
    }
}

fn write_net_addr(buf: &mut Vec<u8>, services: u64, address: IpAddr, port: u16) {
    buf.extend_from_slice(&services.to_le_bytes());
    let bytes = match address {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    };
    buf.extend_from_slice(&bytes);
    buf.extend_from_slice(&port.to_be_bytes());
}

fn read_net_addr(cursor: &mut Cursor<'_>) -> Result<(u64, IpAddr, u16), CodecError> {
    let services = cursor.read_u64()?;
    let mut ip = [0u8; 16];
    ip.copy_from_slice(cursor.read_bytes(16)?);
    let port_bytes = cursor.read_bytes(2)?;
    let port = u16::from_be_bytes([port_bytes[0], port_bytes[1]]);
    Ok((services, PeerInfo::ip_from_bytes(ip), port))
}

/// Frames and writes one message.
pub fn write_message(
    stream: &mut impl Write,
    magic: u32,
    message: &Message,
) -> io::Result<()> {
    let payload = message.encode_payload();
    let mut frame = Vec::with_capacity(HEADER_LENGTH + payload.len());

    frame.extend_from_slice(&magic.to_le_bytes());
    let mut command = [0u8; 12];
    let name = message.command().as_bytes();
    command[..name.len()].copy_from_slice(name);
    frame.extend_from_slice(&command);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&sha256d::Hash::hash(&payload).as_byte_array()[..4]);
    frame.extend_from_slice(&payload);

    stream.write_all(&frame)?;
    stream.flush()
}

/// A parsed frame header.
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    command: [u8; 12],
    payload_length: usize,
    checksum: [u8; 4],
}

impl FrameHeader {
    /// Parses the 24-byte header, validating magic and length bounds.
    pub fn parse(bytes: &[u8; HEADER_LENGTH], magic: u32) -> Result<Self, NetworkError> {
        let got_magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if got_magic != magic {
            return Err(NetworkError::PeerMisbehaved("wrong network magic"));
        }
        let mut command = [0u8; 12];
        command.copy_from_slice(&bytes[4..16]);
        let payload_length =
            u32::from_le_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]) as usize;
        if payload_length > MAX_MSG_LENGTH {
            return Err(NetworkError::PeerMisbehaved("oversize payload"));
        }
        let mut checksum = [0u8; 4];
        checksum.copy_from_slice(&bytes[20..24]);
        Ok(FrameHeader { command, payload_length, checksum })
    }

    /// Payload byte count announced by the header.
    pub fn payload_length(&self) -> usize { self.payload_length }

    /// The NUL-trimmed command string.
    pub fn command(&self) -> &str {
        let end = self.command.iter().position(|b| *b == 0).unwrap_or(12);
        core::str::from_utf8(&self.command[..end]).unwrap_or("")
    }

    /// Verifies the payload checksum and decodes the message.
    pub fn decode(
        &self,
        payload: &[u8],
        params: &ChainParams,
    ) -> Result<Message, NetworkError> {
        let digest = sha256d::Hash::hash(payload);
        if digest.as_byte_array()[..4] != self.checksum {
            return Err(NetworkError::PeerMisbehaved("bad payload checksum"));
        }
        Message::decode_payload(self.command(), payload, params).map_err(NetworkError::from)
    }
}

/// Reads one message from a blocking stream.
///
/// Only used in tests and simple tools; the peer loop reads incrementally
/// so socket timeouts cannot desynchronize the frame boundary.
pub fn read_message(
    stream: &mut impl Read,
    magic: u32,
    params: &ChainParams,
) -> Result<Message, NetworkError> {
    let mut header_bytes = [0u8; HEADER_LENGTH];
    stream.read_exact(&mut header_bytes).map_err(NetworkError::Io)?;
    let header = FrameHeader::parse(&header_bytes, magic)?;

    let mut payload = vec![0u8; header.payload_length()];
    stream.read_exact(&mut payload).map_err(NetworkError::Io)?;
    header.decode(&payload, params)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(message: Message) -> Message {
        let params = ChainParams::mainnet();
        let mut buf = Vec::new();
        write_message(&mut buf, params.magic, &message).unwrap();
        read_message(&mut &buf[..], params.magic, &params).unwrap()
    }

    #[test]
    fn version_roundtrip() {
        let version = VersionMessage {
            version: 70015,
            services: 0,
            timestamp: 1_700_000_000,
            recv_services: 1,
            recv_address: IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3)),
            recv_port: 9333,
            nonce: 0xdead_beef_0bad_f00d,
            user_agent: USER_AGENT.to_owned(),
            start_height: 2_500_000,
            relay: false,
        };
        match roundtrip(Message::Version(version.clone())) {
            Message::Version(got) => assert_eq!(got, version),
            other => panic!("wrong message: {:?}", other),
        }
    }

    #[test]
    fn inv_and_ping_roundtrip() {
        let hash = sha256d::Hash::hash(b"inv");
        match roundtrip(Message::Inv(vec![(INV_TX, hash)])) {
            Message::Inv(items) => assert_eq!(items, vec![(INV_TX, hash)]),
            other => panic!("wrong message: {:?}", other),
        }
        match roundtrip(Message::Ping(7)) {
            Message::Ping(nonce) => assert_eq!(nonce, 7),
            other => panic!("wrong message: {:?}", other),
        }
    }

    #[test]
    fn addr_roundtrip_mixed_families() {
        let peers = vec![
            PeerInfo {
                address: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)),
                port: 9333,
                services: 1,
                timestamp: 1_700_000_000,
            },
            PeerInfo {
                address: IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1)),
                port: 19335,
                services: 5,
                timestamp: 1_700_000_100,
            },
        ];
        match roundtrip(Message::Addr(peers.clone())) {
            Message::Addr(got) => assert_eq!(got, peers),
            other => panic!("wrong message: {:?}", other),
        }
    }

    #[test]
    fn getheaders_roundtrip() {
        let locators = vec![sha256d::Hash::hash(b"tip"), sha256d::Hash::hash(b"older")];
        let stop = BlockHash::all_zeros();
        match roundtrip(Message::GetHeaders { locators: locators.clone(), stop }) {
            Message::GetHeaders { locators: got, stop: got_stop } => {
                assert_eq!(got, locators);
                assert_eq!(got_stop, stop);
            }
            other => panic!("wrong message: {:?}", other),
        }
    }

    #[test]
    fn bad_checksum_rejects() {
        let params = ChainParams::mainnet();
        let mut buf = Vec::new();
        write_message(&mut buf, params.magic, &Message::Ping(1)).unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0xff;
        assert!(matches!(
            read_message(&mut &buf[..], params.magic, &params),
            Err(NetworkError::PeerMisbehaved("bad payload checksum"))
        ));
    }

    #[test]
    fn wrong_magic_rejects() {
        let mainnet = ChainParams::mainnet();
        let testnet = ChainParams::testnet();
        let mut buf = Vec::new();
        write_message(&mut buf, mainnet.magic, &Message::Verack).unwrap();
        assert!(matches!(
            read_message(&mut &buf[..], testnet.magic, &testnet),
            Err(NetworkError::PeerMisbehaved("wrong network magic"))
        ));
    }

    #[test]
    fn unknown_command_is_skipped() {
        let params = ChainParams::mainnet();
        let msg = Message::decode_payload("sendcmpct", &[0x00, 0x01], &params).unwrap();
        assert!(matches!(msg, Message::Unknown(ref c) if c == "sendcmpct"));
    }

    #[test]
    fn headers_roundtrip() {
        let genesis = MerkleBlock::from_header(
            1,
            BlockHash::all_zeros(),
            sha256d::Hash::hash(b"root"),
            1_317_972_665,
            0x1e0ffff0,
            7,
        );
        match roundtrip(Message::Headers(vec![genesis.clone()])) {
            Message::Headers(got) => {
                assert_eq!(got.len(), 1);
                assert_eq!(got[0].block_hash, genesis.block_hash);
            }
            other => panic!("wrong message: {:?}", other),
        }
    }

    #[test]
    fn filteradd_roundtrip() {
        match roundtrip(Message::FilterAdd(vec![0xab; 36])) {
            Message::FilterAdd(element) => assert_eq!(element, vec![0xab; 36]),
            other => panic!("wrong message: {:?}", other),
        }
    }

    #[test]
    fn peer_info_persists_as_json() {
        let peer = PeerInfo {
            address: IpAddr::V4(Ipv4Addr::new(198, 51, 100, 7)),
            port: 9333,
            services: 1,
            timestamp: 1_700_000_000,
        };
        let json = serde_json::to_string(&peer).unwrap();
        assert_eq!(serde_json::from_str::<PeerInfo>(&json).unwrap(), peer);
    }
}
