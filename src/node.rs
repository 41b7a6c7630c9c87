use std::sync::Arc;

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::comm::connection::{Connection, ConnectionState};
use crate::comm::entropy::{MeshEntropy, ThreadRngEntropy};
use crate::comm::frame::{Frame, PacketData};
use crate::comm::secure::{Dialer, SecureStream};
use crate::config::MeshConfig;
use crate::gate::{gate_to_hop, Gate, GateRegistry};
use crate::route::forwarder::RoutingFabric;


/// Externally produced I/O events merged into the node's driver loop.
pub enum NodeEvent {
    /// A listener accepted an inbound stream.
    Accepted { stream: Box<dyn SecureStream> },
    /// A dial task finished, successfully or not.
    DialDone {
        conn_id: i32,
        result: anyhow::Result<Box<dyn SecureStream>>,
    },
}


/// The process-wide mesh state: the connection arena, the gates, and the
///  routing fabric. All mutation happens from the driver loop, one call at a
///  time; dial and listener tasks only talk to it through [NodeEvent]s.
pub struct Node<E: MeshEntropy = ThreadRngEntropy> {
    config: Arc<MeshConfig>,
    connections: FxHashMap<i32, Connection<E>>,
    next_conn_id: i32,
    gates: GateRegistry,
    fabric: RoutingFabric<E>,
    dialer: Arc<dyn Dialer>,
    events_tx: mpsc::Sender<NodeEvent>,
}

impl<E: MeshEntropy> Node<E> {
    pub fn new(config: Arc<MeshConfig>, dialer: Arc<dyn Dialer>) -> (Node<E>, mpsc::Receiver<NodeEvent>) {
        let (events_tx, events_rx) = mpsc::channel(64);
        let node = Node {
            fabric: RoutingFabric::new(&config),
            config,
            connections: FxHashMap::default(),
            next_conn_id: 0,
            gates: GateRegistry::new(),
            dialer,
            events_tx,
        };
        (node, events_rx)
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn event_sender(&self) -> mpsc::Sender<NodeEvent> {
        self.events_tx.clone()
    }

    pub fn connection(&self, id: i32) -> Option<&Connection<E>> {
        self.connections.get(&id)
    }

    pub fn connections(&self) -> impl Iterator<Item = &Connection<E>> {
        self.connections.values()
    }

    pub fn fabric(&self) -> &RoutingFabric<E> {
        &self.fabric
    }

    /// Starts a persistent outbound connection; it redials forever.
    pub fn add_peer(&mut self, addr: &str, now: Instant) -> i32 {
        let id = self.next_conn_id;
        self.next_conn_id += 1;
        info!(id, peer = addr, "adding peer");

        let mut conn: Connection<E> = Connection::new_outbound(id, addr.to_string(), &self.config, now);
        conn.begin_connect(now);
        self.connections.insert(id, conn);
        self.spawn_dial(id, addr.to_string());
        id
    }

    pub fn add_gate(&mut self, id: i32, gate: Box<dyn Gate>) {
        self.gates.insert(id, gate);
        self.fabric.set_dirty();
    }

    pub fn remove_gate(&mut self, id: i32) {
        if self.gates.remove(id).is_some() {
            self.fabric.set_dirty();
        }
    }

    fn spawn_dial(&self, conn_id: i32, addr: String) {
        let dialer = self.dialer.clone();
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            let result = dialer.dial(&addr).await;
            let _ = events_tx.send(NodeEvent::DialDone { conn_id, result }).await;
        });
    }

    /// A frame injected by a local gate enters the mesh here: it gets a fresh
    ///  random id and the configured initial TTL, and is forwarded like any
    ///  other frame with the gate as its source.
    #[allow(clippy::too_many_arguments)]
    pub fn gate_frame(&mut self, gate_id: i32, instance: u32, dof: u16, ds: u16, sof: u16, ss: u16, buf: Bytes) {
        let packet = PacketData {
            id: self.fabric.new_packet_id(),
            ttl: self.config.route_broadcast_ttl,
            instance,
            dof,
            ds,
            sof,
            ss,
            buf,
        };
        let Node { fabric, connections, gates, config, .. } = self;
        fabric.route_frame(&packet, gate_to_hop(gate_id), connections, gates, config);
    }

    pub fn on_event(&mut self, event: NodeEvent, now: Instant) {
        match event {
            NodeEvent::Accepted { stream } => {
                let id = self.next_conn_id;
                self.next_conn_id += 1;
                debug!(id, peer = stream.peer_description(), "accepted connection");
                self.connections.insert(id, Connection::new_inbound(id, stream, &self.config, now));
            }
            NodeEvent::DialDone { conn_id, result } => {
                let Some(conn) = self.connections.get_mut(&conn_id) else {
                    return;
                };
                match result {
                    Ok(stream) if conn.state() == ConnectionState::Connecting => {
                        conn.stream_connected(stream);
                    }
                    Ok(_) => {
                        // the connection moved on while dialing; drop the stream
                    }
                    Err(e) => {
                        debug!(id = conn_id, "dial failed: {:#}", e);
                        conn.connect_failed(now);
                    }
                }
            }
        }
    }

    /// One scheduler tick: limiter budgets, per-connection upkeep, I/O pumps,
    ///  dead-connection collection, and the route-dirtiness flush.
    pub fn on_tick(&mut self, now: Instant) {
        let active_count = self.connections.values().filter(|c| c.is_active()).count();
        for conn in self.connections.values_mut() {
            if conn.is_active() {
                conn.upload.refill(&self.config.upload_limit, active_count);
                conn.download.drain(&self.config.download_limit, active_count);
            }
        }

        let mut dials = Vec::new();
        for conn in self.connections.values_mut() {
            let was_active = conn.is_active();
            let outcome = conn.periodic_update(&self.config, now);
            if was_active != conn.is_active() {
                self.fabric.set_dirty();
            }
            if outcome.needs_dial {
                conn.begin_connect(now);
                dials.push((conn.id(), conn.peer_addr().to_string()));
            }
        }
        for (id, addr) in dials {
            self.spawn_dial(id, addr);
        }

        let ids: Vec<i32> = self.connections.keys().copied().collect();
        for id in ids {
            self.pump_connection(id, now);
        }

        // inbound connections that died have nothing left to redial
        self.connections.retain(|_, c| {
            c.state() != ConnectionState::Inactive || !c.peer_addr().is_empty()
        });

        let Node { fabric, connections, gates, config, .. } = self;
        fabric.refresh(gates, connections, config);
    }

    fn pump_connection(&mut self, id: i32, now: Instant) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };

        match conn.pump_handshake(now) {
            Ok(true) => self.fabric.set_dirty(),
            Ok(false) => {}
            Err(e) => {
                warn!(id, "{:#}", e);
                conn.reset(now);
                return;
            }
        }

        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        let frames = match conn.poll_read(&self.config) {
            Ok(frames) => frames,
            Err(e) => {
                debug!(id, "connection broke: {:#}", e);
                self.reset_connection(id, now);
                return;
            }
        };
        for frame in frames {
            self.dispatch_frame(id, frame, now);
        }

        if let Some(conn) = self.connections.get_mut(&id) {
            if let Err(e) = conn.poll_write(&self.config) {
                debug!(id, "connection broke: {:#}", e);
                self.reset_connection(id, now);
            }
        }
    }

    fn reset_connection(&mut self, id: i32, now: Instant) {
        if let Some(conn) = self.connections.get_mut(&id) {
            if conn.is_active() {
                self.fabric.set_dirty();
            }
            conn.reset(now);
        }
    }

    fn dispatch_frame(&mut self, from: i32, frame: Frame, now: Instant) {
        match frame {
            Frame::Packet(packet) => {
                let Node { fabric, connections, gates, config, .. } = self;
                fabric.route_frame(&packet, from, connections, gates, config);
            }
            Frame::RouteSet(entries) => self.apply_routes(from, |conn, max| {
                conn.apply_route_set(entries, max)
            }, now),
            Frame::RouteDiff(entries) => self.apply_routes(from, |conn, max| {
                conn.apply_route_diff(entries, max)
            }, now),
            Frame::Ping { nonce } => {
                if let Some(conn) = self.connections.get_mut(&from) {
                    conn.handle_ping(nonce);
                }
            }
            Frame::Pong { nonce } => {
                if let Some(conn) = self.connections.get_mut(&from) {
                    if conn.handle_pong(nonce, now, self.config.report_ping_changes_above) {
                        self.fabric.set_dirty();
                    }
                }
            }
            Frame::RouteRequest => {
                let full = self.fabric.table.full_report();
                if let Some(conn) = self.connections.get_mut(&from) {
                    conn.write_route_entries(&full, true, self.config.mtu);
                }
            }
        }
    }

    fn apply_routes<F>(&mut self, from: i32, apply: F, now: Instant)
    where
        F: FnOnce(&mut Connection<E>, usize) -> anyhow::Result<()>,
    {
        let Some(conn) = self.connections.get_mut(&from) else {
            return;
        };
        match apply(conn, self.config.max_remote_routes) {
            Ok(()) => self.fabric.set_dirty(),
            Err(e) => {
                warn!(id = from, "resetting connection: {:#}", e);
                self.reset_connection(from, now);
            }
        }
    }
}
