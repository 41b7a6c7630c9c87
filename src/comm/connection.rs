use std::io;
use std::marker::PhantomData;

use anyhow::bail;
use bytes::BytesMut;
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::comm::address::MeshAddr;
use crate::comm::frame::{Frame, FrameHeader, PacketData, RouteEntry, FRAME_HEADER_LEN};
use crate::comm::limiter::{DownloadBucket, UploadBucket};
use crate::comm::secure::{HandshakePhase, SecureStream};
use crate::comm::send_queue::SendQueues;
use crate::comm::stats::TrafficStats;
use crate::comm::entropy::{MeshEntropy, ThreadRngEntropy};
use crate::config::MeshConfig;


#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConnectionState {
    Inactive,
    RetryTimeout,
    Connecting,
    SslConnecting,
    Accepting,
    Active,
    Closing,
}

impl ConnectionState {
    pub fn is_active(self) -> bool {
        self == ConnectionState::Active
    }
}

/// A peer's advertisement for one address; the next hop is implicitly the
///  peer itself.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct RemoteRoute {
    pub ping: u32,
    pub dist: u32,
}

/// What a periodic tick asks the owner to do on the connection's behalf.
#[derive(Debug, Default)]
pub struct PeriodicOutcome {
    pub needs_dial: bool,
}


/// One transport connection to a peer: owns the secure stream, drives it
///  through the connect/handshake/active/close lifecycle, frames messages on
///  the byte stream, and maintains the two bounded send queues.
///
/// The connection id is stable across reconnects; routes reference it, never
///  the connection itself.
pub struct Connection<E: MeshEntropy = ThreadRngEntropy> {
    id: i32,
    state: ConnectionState,
    stream: Option<Box<dyn SecureStream>>,

    recv_q: BytesMut,
    cached_header: Option<FrameHeader>,
    queues: SendQueues,

    /// everything the peer reported reachable, keyed by address
    remote_routes: FxHashMap<MeshAddr, RemoteRoute>,
    route_overflow: bool,

    /// measured round trip in microseconds; starts pessimistic
    ping: u32,
    sent_ping_id: u8,
    sent_ping_time: Option<Instant>,
    last_ping: Instant,

    last_retry: Instant,
    /// address to redial; empty for inbound connections
    peer_addr: String,

    pub stats: TrafficStats,
    pub upload: UploadBucket,
    pub download: DownloadBucket,
    last_stats_roll: Instant,

    _pd: PhantomData<E>,
}

impl<E: MeshEntropy> Connection<E> {
    pub fn new_outbound(id: i32, peer_addr: String, config: &MeshConfig, now: Instant) -> Connection<E> {
        Connection {
            id,
            state: ConnectionState::Inactive,
            stream: None,
            recv_q: BytesMut::new(),
            cached_header: None,
            queues: SendQueues::new(config.max_waiting_proto_size, config.max_waiting_data_size),
            remote_routes: Default::default(),
            route_overflow: false,
            ping: initial_ping(config),
            sent_ping_id: 0,
            sent_ping_time: None,
            last_ping: now,
            last_retry: now,
            peer_addr,
            stats: TrafficStats::default(),
            upload: UploadBucket::default(),
            download: DownloadBucket::default(),
            last_stats_roll: now,
            _pd: PhantomData,
        }
    }

    pub fn new_inbound(id: i32, stream: Box<dyn SecureStream>, config: &MeshConfig, now: Instant) -> Connection<E> {
        let mut conn = Self::new_outbound(id, String::new(), config, now);
        conn.stream = Some(stream);
        conn.state = ConnectionState::Accepting;
        conn
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    pub fn ping(&self) -> u32 {
        self.ping
    }

    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    pub fn remote_routes(&self) -> &FxHashMap<MeshAddr, RemoteRoute> {
        &self.remote_routes
    }

    pub fn route_overflow(&self) -> bool {
        self.route_overflow
    }

    pub fn proto_q_size(&self) -> usize {
        self.queues.proto_size()
    }

    pub fn data_q_size(&self) -> usize {
        self.queues.data_size()
    }

    /*
     * lifecycle
     */

    /// The owner has started dialing `peer_addr` for this connection.
    pub fn begin_connect(&mut self, now: Instant) {
        debug_assert!(matches!(self.state, ConnectionState::Inactive | ConnectionState::RetryTimeout));
        self.state = ConnectionState::Connecting;
        self.last_retry = now;
    }

    pub fn connect_failed(&mut self, now: Instant) {
        debug!(id = self.id, peer = self.peer_addr, "connect failed, backing off");
        self.state = ConnectionState::RetryTimeout;
        self.last_retry = now;
    }

    /// The dial completed; the handshake is pumped from here on.
    pub fn stream_connected(&mut self, stream: Box<dyn SecureStream>) {
        self.stream = Some(stream);
        self.state = ConnectionState::SslConnecting;
    }

    /// Advances the handshake in `ssl_connecting` / `accepting`. Returns true
    ///  once the connection just became active.
    pub fn pump_handshake(&mut self, now: Instant) -> anyhow::Result<bool> {
        if !matches!(self.state, ConnectionState::SslConnecting | ConnectionState::Accepting) {
            return Ok(false);
        }
        let Some(stream) = &mut self.stream else {
            bail!("no stream in handshake state");
        };
        match stream.try_handshake() {
            Ok(HandshakePhase::Ready) => {
                self.activate(now);
                Ok(true)
            }
            Ok(HandshakePhase::Securing) => Ok(false),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => bail!("handshake failed: {}", e),
        }
    }

    fn activate(&mut self, now: Instant) {
        let peer = self.stream.as_ref()
            .map(|s| s.peer_description())
            .unwrap_or_default();
        info!(id = self.id, peer, "connection active");
        self.state = ConnectionState::Active;

        // learn the peer's routes, and get an RTT sample going
        self.write_frame(&Frame::RouteRequest);
        self.send_ping(now);
    }

    /// Local graceful shutdown: pending frames are discarded, the socket is
    ///  released on the next tick.
    pub fn disconnect(&mut self) {
        if self.state == ConnectionState::Active {
            self.state = ConnectionState::Closing;
            self.queues.clear();
        }
    }

    /// Hard reset: closes the socket and forgets all peer state. Outbound
    ///  connections back off and redial, inbound ones become dead weight for
    ///  the owner to collect.
    pub fn reset(&mut self, now: Instant) {
        self.stream = None;
        self.recv_q.clear();
        self.cached_header = None;
        self.queues.clear();
        self.remote_routes.clear();
        self.sent_ping_time = None;
        self.state = if self.peer_addr.is_empty() {
            ConnectionState::Inactive
        } else {
            self.last_retry = now;
            ConnectionState::RetryTimeout
        };
    }

    /*
     * periodic upkeep: keepalive, ping timeout, retry backoff, stats windows
     */

    pub fn periodic_update(&mut self, config: &MeshConfig, now: Instant) -> PeriodicOutcome {
        let mut outcome = PeriodicOutcome::default();

        match self.state {
            ConnectionState::Active => {
                if let Some(sent) = self.sent_ping_time {
                    if now.saturating_duration_since(sent) > config.timeout {
                        warn!(id = self.id, "ping timed out, resetting connection");
                        self.reset(now);
                    }
                } else if now.saturating_duration_since(self.last_ping) > config.keepalive {
                    self.send_ping(now);
                }
            }
            ConnectionState::RetryTimeout => {
                if !self.peer_addr.is_empty()
                    && now.saturating_duration_since(self.last_retry) >= config.retry
                {
                    outcome.needs_dial = true;
                }
            }
            ConnectionState::Closing => {
                self.reset(now);
            }
            _ => {}
        }

        if now.saturating_duration_since(self.last_stats_roll) >= config.stats_interval {
            self.stats.roll(now.saturating_duration_since(self.last_stats_roll));
            self.last_stats_roll = now;
        }

        outcome
    }

    fn send_ping(&mut self, now: Instant) {
        self.sent_ping_id = E::ping_nonce();
        self.sent_ping_time = Some(now);
        self.last_ping = now;
        let nonce = self.sent_ping_id;
        self.write_frame(&Frame::Ping { nonce });
    }

    pub fn handle_ping(&mut self, nonce: u8) {
        self.write_frame(&Frame::Pong { nonce });
    }

    /// Returns true if the ping moved by more than `report_diff`, i.e. the
    ///  route table should be recomputed.
    pub fn handle_pong(&mut self, nonce: u8, now: Instant, report_diff: u32) -> bool {
        match self.sent_ping_time {
            Some(sent) if nonce == self.sent_ping_id => {
                // every hop contributes at least one microsecond
                let new_ping = (now.saturating_duration_since(sent).as_micros() as u32).max(1);
                let old_ping = self.ping;
                self.ping = new_ping;
                self.sent_ping_time = None;
                trace!(id = self.id, ping = new_ping, "pong");
                old_ping.abs_diff(new_ping) > report_diff
            }
            _ => {
                debug!(id = self.id, nonce, "stale pong, ignoring");
                false
            }
        }
    }

    /*
     * remote route bookkeeping
     */

    /// Full replacement of the peer's advertisements.
    pub fn apply_route_set(&mut self, entries: Vec<RouteEntry>, max_remote_routes: usize) -> anyhow::Result<()> {
        self.remote_routes.clear();
        self.apply_route_diff(entries, max_remote_routes)
    }

    /// Patch: withdrawals remove, the rest upsert. Exceeding the route cap
    ///  is a hard error that the owner answers with a reset.
    pub fn apply_route_diff(&mut self, entries: Vec<RouteEntry>, max_remote_routes: usize) -> anyhow::Result<()> {
        for e in entries {
            if e.is_withdrawal() {
                self.remote_routes.remove(&e.addr);
            } else {
                self.remote_routes.insert(e.addr, RemoteRoute { ping: e.ping, dist: e.dist });
            }
        }
        if self.remote_routes.len() > max_remote_routes {
            self.route_overflow = true;
            bail!("peer advertised more than {} routes", max_remote_routes);
        }
        Ok(())
    }

    /*
     * read pump
     */

    /// Reads whatever the stream has and decodes complete frames. A decode
    ///  failure or peer close is an error; the owner resets the connection.
    pub fn poll_read(&mut self, config: &MeshConfig) -> anyhow::Result<Vec<Frame>> {
        let mut frames = Vec::new();
        if self.state != ConnectionState::Active {
            return Ok(frames);
        }
        let Some(stream) = &mut self.stream else {
            return Ok(frames);
        };

        while !self.download.is_paused() {
            match stream.try_read_buf(&mut self.recv_q) {
                Ok(0) => bail!("peer closed the stream"),
                Ok(n) => {
                    self.download.on_received(&config.download_limit, n);
                    Self::parse_input(&mut self.recv_q, &mut self.cached_header, &mut self.stats, &mut frames)?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => bail!("read error: {}", e),
            }
        }
        Ok(frames)
    }

    /// Two-phase framing: 4 header bytes, then `size` payload bytes, either
    ///  of which may span any number of reads.
    fn parse_input(
        recv_q: &mut BytesMut,
        cached_header: &mut Option<FrameHeader>,
        stats: &mut TrafficStats,
        frames: &mut Vec<Frame>,
    ) -> anyhow::Result<()> {
        loop {
            match cached_header {
                None => {
                    if recv_q.len() < FRAME_HEADER_LEN {
                        return Ok(());
                    }
                    let mut header_bytes = recv_q.split_to(FRAME_HEADER_LEN).freeze();
                    *cached_header = Some(FrameHeader::try_deser(&mut header_bytes)?);
                }
                Some(header) => {
                    if recv_q.len() < header.size as usize {
                        return Ok(());
                    }
                    let mut payload = recv_q.split_to(header.size as usize).freeze();
                    let frame = Frame::try_deser_payload(header, &mut payload)?;
                    stats.record_in(FRAME_HEADER_LEN + header.size as usize);
                    *cached_header = None;
                    frames.push(frame);
                }
            }
        }
    }

    /*
     * write pump
     */

    pub fn needs_write(&self) -> bool {
        !self.queues.is_empty()
    }

    /// Drains the send queues as far as the socket and the upload limiter
    ///  allow. Write errors surface to the owner.
    pub fn poll_write(&mut self, config: &MeshConfig) -> anyhow::Result<()> {
        if self.state != ConnectionState::Active {
            return Ok(());
        }
        let Some(stream) = &mut self.stream else {
            return Ok(());
        };

        loop {
            let Some(chunk) = self.queues.next_chunk() else {
                break;
            };
            let budget = self.upload.writable(&config.upload_limit, chunk.len());
            if budget == 0 {
                break; // limiter exhausted, retry next tick
            }
            match stream.try_write(&chunk[..budget]) {
                Ok(n) => {
                    self.upload.consume(&config.upload_limit, n);
                    self.queues.advance(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => bail!("write error: {}", e),
            }
        }

        match stream.try_flush() {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => bail!("write error: {}", e),
        }
    }

    /*
     * enqueueing; all of these drop silently when the connection cannot
     * currently send
     */

    pub fn write_frame(&mut self, frame: &Frame) {
        if self.state != ConnectionState::Active {
            return;
        }
        let mut buf = BytesMut::new();
        if let Err(e) = frame.ser(&mut buf) {
            warn!(id = self.id, "cannot serialize {:?} frame: {}", frame.frame_type(), e);
            return;
        }
        let len = buf.len();
        if self.queues.push_proto(buf.freeze()) {
            self.stats.record_out(len);
        } else {
            self.stats.record_drop();
            warn!(id = self.id, "proto queue full, dropping {:?}", frame.frame_type());
        }
    }

    /// Sends a route report, chunked to the MTU. A full set goes out as one
    ///  `route_set` continued by `route_diff`s, so the replace-then-patch
    ///  semantics survive chunking.
    pub fn write_route_entries(&mut self, entries: &[RouteEntry], full: bool, mtu: usize) {
        if self.state != ConnectionState::Active {
            return;
        }

        let mut first = true;
        let mut chunk: Vec<RouteEntry> = Vec::new();
        let mut chunk_size = 0usize;

        let flush = |conn: &mut Self, chunk: &mut Vec<RouteEntry>, first: &mut bool| {
            let frame = if full && *first {
                Frame::RouteSet(std::mem::take(chunk))
            } else {
                Frame::RouteDiff(std::mem::take(chunk))
            };
            *first = false;
            conn.write_frame(&frame);
        };

        for e in entries {
            if !chunk.is_empty() && chunk_size + e.serialized_len() > mtu {
                flush(self, &mut chunk, &mut first);
                chunk_size = 0;
            }
            chunk_size += e.serialized_len();
            chunk.push(e.clone());
        }
        if !chunk.is_empty() || (full && first) {
            flush(self, &mut chunk, &mut first);
        }
    }

    /// Enqueues a user frame, subject to the queue cap and random early drop.
    pub fn write_packet(&mut self, packet: &PacketData, config: &MeshConfig) {
        if self.state != ConnectionState::Active {
            return;
        }
        if packet.buf.len() > config.mtu {
            self.stats.record_drop();
            warn!(id = self.id, size = packet.buf.len(), "frame exceeds mtu, dropping");
            return;
        }

        if config.red_enabled && self.queues.data_size() >= config.red_threshold {
            let span = config.max_waiting_data_size.saturating_sub(config.red_threshold);
            let over = self.queues.data_size() - config.red_threshold;
            let drop_probability = if span == 0 { 1.0 } else { over as f64 / span as f64 };
            if E::drop_draw() < drop_probability {
                self.stats.record_drop();
                trace!(id = self.id, "random early drop");
                return;
            }
        }

        let mut buf = BytesMut::new();
        if Frame::Packet(packet.clone()).ser(&mut buf).is_err() {
            self.stats.record_drop();
            return;
        }
        let len = buf.len();
        if self.queues.push_data(buf.freeze()) {
            self.stats.record_out(len);
        } else {
            self.stats.record_drop();
            trace!(id = self.id, "data queue full, dropping frame");
        }
    }
}

fn initial_ping(config: &MeshConfig) -> u32 {
    config.timeout.as_micros().min(u32::MAX as u128) as u32
}

#[cfg(test)]
impl<E: MeshEntropy> Connection<E> {
    /// An active connection without a socket, for routing-level tests.
    pub fn test_active(id: i32, ping: u32, routes: &[(MeshAddr, u32, u32)]) -> Connection<E> {
        let config = MeshConfig::new();
        let mut conn: Connection<E> = Connection::new_outbound(id, String::new(), &config, Instant::now());
        conn.state = ConnectionState::Active;
        conn.ping = ping;
        for (addr, r_ping, r_dist) in routes {
            conn.remote_routes.insert(addr.clone(), RemoteRoute { ping: *r_ping, dist: *r_dist });
        }
        conn
    }

    /// Attaches a stream without touching the lifecycle state.
    pub fn attach_stream_for_test(&mut self, stream: Box<dyn SecureStream>) {
        self.stream = Some(stream);
    }
}
