// SPDX-License-Identifier: CC0-1.0

//! A single peer connection.
//!
//! Each peer owns one TCP stream and one reader thread. The reader frames
//! inbound messages from an incremental buffer, so socket read timeouts
//! never desynchronize frame boundaries, and dispatches them to the
//! [`PeerListener`] (the peer manager). Outbound writes serialize behind
//! the peer's write lock.

use std::collections::VecDeque;
use std::io::{ErrorKind, Read};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::{debug, info, trace, warn};
use primitives::{BlockHash, ChainParams, MerkleBlock, Transaction, TxHash};
use rand::Rng;

use crate::message::{
    self, FrameHeader, Message, PeerInfo, VersionMessage, HEADER_LENGTH, INV_BLOCK,
    INV_FILTERED_BLOCK, INV_TX, USER_AGENT,
};
use crate::NetworkError;

/// TCP connect deadline.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
/// version/verack exchange deadline.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);
/// Deadline for a reply to an outstanding data request.
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(10);
/// Quiet time before a keepalive ping goes out.
pub const PING_INTERVAL: Duration = Duration::from_secs(120);
/// Quiet time before the connection is considered dead.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(600);

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    /// No connection.
    Disconnected,
    /// TCP dial in flight.
    Connecting,
    /// Socket open, version/verack exchange in flight.
    Handshaking,
    /// Fully connected.
    Connected,
}

/// Callbacks a peer fires from its reader thread.
///
/// The peer manager implements this; methods run on the peer's thread, so
/// they take the manager lock, never the other way around.
pub trait PeerListener: Send + Sync {
    /// Handshake completed.
    fn connected(&self, peer: &Arc<Peer>);
    /// Connection ended; `error` is `None` for a local disconnect.
    fn disconnected(&self, peer: &Arc<Peer>, error: Option<NetworkError>);
    /// The peer gossiped addresses.
    fn relayed_peers(&self, peer: &Arc<Peer>, peers: Vec<PeerInfo>);
    /// The peer announced inventory.
    fn relayed_inv(&self, peer: &Arc<Peer>, tx_hashes: Vec<TxHash>, block_hashes: Vec<BlockHash>);
    /// The peer sent a transaction.
    fn relayed_tx(&self, peer: &Arc<Peer>, tx: Transaction);
    /// The peer sent a header or filtered block.
    fn relayed_block(&self, peer: &Arc<Peer>, block: MerkleBlock);
    /// The peer asked for a transaction; returning it counts as acceptance.
    fn requested_tx(&self, peer: &Arc<Peer>, tx_hash: TxHash) -> Option<Transaction>;
    /// The peer could not serve requested items.
    fn relayed_notfound(&self, peer: &Arc<Peer>, tx_hashes: Vec<TxHash>);
    /// The peer rejected one of our transactions.
    fn rejected_tx(&self, peer: &Arc<Peer>, code: u8, reason: String);
}

struct PeerState {
    status: PeerStatus,
    remote: Option<VersionMessage>,
    latency: Option<Duration>,
    got_verack: bool,
}

/// One remote node.
pub struct Peer {
    info: PeerInfo,
    params: ChainParams,
    local_nonce: u64,
    start_height: u32,
    state: Mutex<PeerState>,
    /// The peer's write lock; all outbound frames serialize through it.
    writer: Mutex<Option<TcpStream>>,
    shutdown: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
    waiting_since: Mutex<Option<Instant>>,
}

impl core::fmt::Debug for Peer {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("Peer").field("host", &self.host()).finish_non_exhaustive()
    }
}

impl Peer {
    /// Dials `info` and runs the connection on its own thread.
    ///
    /// `start_height` is our verified chain height, advertised in the
    /// handshake. All further interaction happens through `listener`.
    pub fn connect(
        info: PeerInfo,
        params: ChainParams,
        start_height: u32,
        listener: Arc<dyn PeerListener>,
    ) -> Arc<Peer> {
        let peer = Arc::new(Peer {
            info,
            params,
            local_nonce: rand::thread_rng().gen(),
            start_height,
            state: Mutex::new(PeerState {
                status: PeerStatus::Connecting,
                remote: None,
                latency: None,
                got_verack: false,
            }),
            writer: Mutex::new(None),
            shutdown: AtomicBool::new(false),
            thread: Mutex::new(None),
            waiting_since: Mutex::new(None),
        });

        let thread_peer = Arc::clone(&peer);
        let handle = std::thread::Builder::new()
            .name(format!("peer-{}", peer.host()))
            .spawn(move || thread_peer.run(listener))
            .expect("spawning a peer thread");
        *peer.thread.lock().expect("peer thread lock") = Some(handle);
        peer
    }

    /// `host:port` form for logs and the download-peer name.
    pub fn host(&self) -> String { format!("{}:{}", self.info.address, self.info.port) }

    /// The address book entry this peer was dialed from.
    pub fn info(&self) -> PeerInfo { self.info }

    /// Current lifecycle state.
    pub fn status(&self) -> PeerStatus { self.state.lock().expect("peer state").status }

    /// Best block height the peer announced in its handshake.
    pub fn last_block(&self) -> u32 {
        self.state
            .lock()
            .expect("peer state")
            .remote
            .as_ref()
            .map(|v| v.start_height)
            .unwrap_or(0)
    }

    /// Services the peer advertised.
    pub fn services(&self) -> u64 {
        self.state
            .lock()
            .expect("peer state")
            .remote
            .as_ref()
            .map(|v| v.services)
            .unwrap_or(self.info.services)
    }

    /// Smoothed request latency, measured on pings.
    pub fn latency(&self) -> Duration {
        self.state
            .lock()
            .expect("peer state")
            .latency
            .unwrap_or(Duration::from_secs(u64::from(u16::MAX)))
    }

    /// Sends one message behind the write lock.
    pub fn send(&self, message: &Message) -> Result<(), NetworkError> {
        let guard = self.writer.lock().expect("peer write lock");
        let Some(stream) = guard.as_ref() else {
            return Err(NetworkError::Io(ErrorKind::NotConnected.into()));
        };
        trace!(target: "peer", "{} <- {}", self.host(), message.command());
        message::write_message(&mut (&*stream), self.params.magic, message)
            .map_err(NetworkError::Io)
    }

    /// Arms the 10-second reply deadline after a data request.
    pub fn expect_reply(&self) {
        *self.waiting_since.lock().expect("peer waiting lock") = Some(Instant::now());
    }

    /// Asks the connection to close; the reader thread exits promptly.
    pub fn disconnect(&self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(stream) = self.writer.lock().expect("peer write lock").as_ref() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    /// Waits for the reader thread to finish. Never called from the reader
    /// thread itself.
    pub fn join(&self) {
        let handle = self.thread.lock().expect("peer thread lock").take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    fn unix_now() -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
    }

    fn run(self: Arc<Peer>, listener: Arc<dyn PeerListener>) {
        let error = self.run_inner(&listener);
        self.state.lock().expect("peer state").status = PeerStatus::Disconnected;
        *self.writer.lock().expect("peer write lock") = None;
        listener.disconnected(&self, error);
    }

    fn run_inner(self: &Arc<Peer>, listener: &Arc<dyn PeerListener>) -> Option<NetworkError> {
        info!(target: "peer", "connecting to {}", self.host());
        let mut stream =
            match TcpStream::connect_timeout(&self.info.socket_addr(), CONNECT_TIMEOUT) {
                Ok(stream) => stream,
                Err(e) => return Some(NetworkError::ConnectFailed(e)),
            };
        let _ = stream.set_nodelay(true);
        // Short poll interval; idle bookkeeping runs between reads.
        let _ = stream.set_read_timeout(Some(Duration::from_secs(1)));

        match stream.try_clone() {
            Ok(write_half) =>
                *self.writer.lock().expect("peer write lock") = Some(write_half),
            Err(e) => return Some(NetworkError::ConnectFailed(e)),
        }

        self.state.lock().expect("peer state").status = PeerStatus::Handshaking;
        let handshake_started = Instant::now();
        if let Err(e) = self.send(&Message::Version(self.local_version())) {
            return Some(e);
        }

        let mut buffer: Vec<u8> = Vec::with_capacity(0x1000);
        let mut chunk = [0u8; 0x2000];
        let mut last_received = Instant::now();
        let mut last_ping_sent = Instant::now();
        let mut ping_nonce: Option<(u64, Instant)> = None;

        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return None;
            }

            match stream.read(&mut chunk) {
                Ok(0) => return Some(NetworkError::Io(ErrorKind::UnexpectedEof.into())),
                Ok(n) => {
                    last_received = Instant::now();
                    buffer.extend_from_slice(&chunk[..n]);
                    let mut inbound = VecDeque::new();
                    if let Err(e) = self.drain_frames(&mut buffer, &mut inbound) {
                        return Some(e);
                    }
                    for msg in inbound {
                        if let Err(e) = self.handle(msg, listener, &mut ping_nonce) {
                            return Some(e);
                        }
                    }
                }
                Err(e)
                    if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut =>
                {
                    // We're a blocking socket, so this is the poll tick.
                    let now = Instant::now();
                    let status = self.status();
                    if status == PeerStatus::Handshaking
                        && now.duration_since(handshake_started) > HANDSHAKE_TIMEOUT
                    {
                        return Some(NetworkError::HandshakeFailed);
                    }
                    if now.duration_since(last_received) > IDLE_TIMEOUT {
                        return Some(NetworkError::Timeout);
                    }
                    let waiting = *self.waiting_since.lock().expect("peer waiting lock");
                    if let Some(since) = waiting {
                        if now.duration_since(since) > REPLY_TIMEOUT {
                            return Some(NetworkError::Timeout);
                        }
                    }
                    if status == PeerStatus::Connected
                        && now.duration_since(last_received.max(last_ping_sent)) > PING_INTERVAL
                    {
                        let nonce = rand::thread_rng().gen();
                        ping_nonce = Some((nonce, now));
                        last_ping_sent = now;
                        if let Err(e) = self.send(&Message::Ping(nonce)) {
                            return Some(e);
                        }
                    }
                }
                Err(e) => return Some(NetworkError::Io(e)),
            }
        }
    }

    fn drain_frames(
        &self,
        buffer: &mut Vec<u8>,
        out: &mut VecDeque<Message>,
    ) -> Result<(), NetworkError> {
        loop {
            if buffer.len() < HEADER_LENGTH {
                return Ok(());
            }
            let mut header_bytes = [0u8; HEADER_LENGTH];
            header_bytes.copy_from_slice(&buffer[..HEADER_LENGTH]);
            let header = FrameHeader::parse(&header_bytes, self.params.magic)?;

            let frame_length = HEADER_LENGTH + header.payload_length();
            if buffer.len() < frame_length {
                return Ok(());
            }
            let message = header.decode(&buffer[HEADER_LENGTH..frame_length], &self.params)?;
            buffer.drain(..frame_length);
            trace!(target: "peer", "{} -> {}", self.host(), message.command());
            out.push_back(message);
        }
    }

    fn local_version(&self) -> VersionMessage {
        VersionMessage {
            version: self.params.protocol_version,
            services: self.params.services,
            timestamp: Self::unix_now(),
            recv_services: self.info.services,
            recv_address: self.info.address,
            recv_port: self.info.port,
            nonce: self.local_nonce,
            user_agent: USER_AGENT.to_owned(),
            start_height: self.start_height,
            relay: false, // nothing relays until our filter is loaded
        }
    }

    fn handle(
        self: &Arc<Peer>,
        message: Message,
        listener: &Arc<dyn PeerListener>,
        ping_nonce: &mut Option<(u64, Instant)>,
    ) -> Result<(), NetworkError> {
        match message {
            Message::Version(remote) => {
                if remote.nonce == self.local_nonce {
                    return Err(NetworkError::PeerMisbehaved("connected to self"));
                }
                if remote.version < self.params.min_protocol_version {
                    return Err(NetworkError::PeerMisbehaved("protocol too old"));
                }
                debug!(
                    target: "peer",
                    "{} is {} height {}", self.host(), remote.user_agent, remote.start_height
                );
                self.state.lock().expect("peer state").remote = Some(remote);
                self.send(&Message::Verack)?;
                self.maybe_finish_handshake(listener);
            }
            Message::Verack => {
                self.state.lock().expect("peer state").got_verack = true;
                self.maybe_finish_handshake(listener);
            }
            Message::Addr(peers) => listener.relayed_peers(self, peers),
            Message::Inv(items) => {
                self.clear_reply_deadline();
                let mut tx_hashes = Vec::new();
                let mut block_hashes = Vec::new();
                for (inv_type, hash) in items {
                    match inv_type {
                        INV_TX => tx_hashes.push(hash),
                        INV_BLOCK | INV_FILTERED_BLOCK => block_hashes.push(hash),
                        _ => {}
                    }
                }
                listener.relayed_inv(self, tx_hashes, block_hashes);
            }
            Message::Tx(tx) => {
                self.clear_reply_deadline();
                listener.relayed_tx(self, tx);
            }
            Message::Headers(headers) => {
                self.clear_reply_deadline();
                for header in headers {
                    listener.relayed_block(self, header);
                }
            }
            Message::MerkleBlock(block) => {
                self.clear_reply_deadline();
                listener.relayed_block(self, block);
            }
            Message::GetData(items) => {
                let mut not_found = Vec::new();
                for (inv_type, hash) in items {
                    if inv_type == INV_TX {
                        if let Some(tx) = listener.requested_tx(self, hash) {
                            self.send(&Message::Tx(tx))?;
                            continue;
                        }
                    }
                    not_found.push((inv_type, hash));
                }
                if !not_found.is_empty() {
                    self.send(&Message::NotFound(not_found))?;
                }
            }
            Message::NotFound(items) => {
                self.clear_reply_deadline();
                let tx_hashes =
                    items.into_iter().filter(|(t, _)| *t == INV_TX).map(|(_, h)| h).collect();
                listener.relayed_notfound(self, tx_hashes);
            }
            Message::Ping(nonce) => self.send(&Message::Pong(nonce))?,
            Message::Pong(nonce) => {
                if let Some((expected, sent_at)) = ping_nonce.take() {
                    if expected == nonce {
                        let rtt = sent_at.elapsed();
                        let mut state = self.state.lock().expect("peer state");
                        // Exponential smoothing over ping round trips.
                        state.latency = Some(match state.latency {
                            Some(old) => (old * 3 + rtt) / 4,
                            None => rtt,
                        });
                    }
                }
            }
            Message::Reject { message, code, reason } => {
                warn!(target: "peer", "{} rejected {}: {:#x} {}", self.host(), message, code, reason);
                if message == "tx" {
                    listener.rejected_tx(self, code, reason);
                }
            }
            // We are a light client; nothing to serve for these.
            Message::GetHeaders { .. }
            | Message::GetBlocks { .. }
            | Message::FilterLoad(_)
            | Message::FilterAdd(_)
            | Message::Mempool => {}
            Message::Unknown(command) => {
                trace!(target: "peer", "{} sent unhandled {}", self.host(), command);
            }
        }
        Ok(())
    }

    fn clear_reply_deadline(&self) {
        *self.waiting_since.lock().expect("peer waiting lock") = None;
    }

    fn maybe_finish_handshake(self: &Arc<Peer>, listener: &Arc<dyn PeerListener>) {
        let ready = {
            let mut state = self.state.lock().expect("peer state");
            if state.status == PeerStatus::Handshaking
                && state.got_verack
                && state.remote.is_some()
            {
                state.status = PeerStatus::Connected;
                true
            } else {
                false
            }
        };
        if ready {
            info!(target: "peer", "connected to {}", self.host());
            listener.connected(self);
        }
    }
}
