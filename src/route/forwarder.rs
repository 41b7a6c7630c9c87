use std::collections::BTreeSet;
use std::marker::PhantomData;

use rustc_hash::FxHashMap;
use tracing::trace;

use crate::comm::address::MeshAddr;
use crate::comm::connection::Connection;
use crate::comm::entropy::{pick_one, MeshEntropy, ThreadRngEntropy};
use crate::comm::frame::PacketData;
use crate::config::MeshConfig;
use crate::gate::{hop_to_gate, GateRegistry};
use crate::route::id_cache::IdCache;
use crate::route::table::RouteTable;


/// `from` value for frames originated by the node itself.
pub const NO_SOURCE: i32 = i32::MIN;

/// The routing fabric: route table plus duplicate suppression, and the
///  forwarding algorithm tying them to the connection map and the gates.
pub struct RoutingFabric<E: MeshEntropy = ThreadRngEntropy> {
    pub table: RouteTable,
    id_cache: IdCache,
    _pd: PhantomData<E>,
}

impl<E: MeshEntropy> RoutingFabric<E> {
    pub fn new(config: &MeshConfig) -> RoutingFabric<E> {
        RoutingFabric {
            table: RouteTable::new(),
            id_cache: IdCache::new(config.packet_id_cache_size),
            _pd: PhantomData,
        }
    }

    pub fn set_dirty(&mut self) {
        self.table.set_dirty();
    }

    pub fn new_packet_id(&self) -> u32 {
        E::packet_id()
    }

    /// If anything changed routing since the last look, recompute the table
    ///  and broadcast the resulting report diff to every active peer.
    pub fn refresh(
        &mut self,
        gates: &GateRegistry,
        connections: &mut FxHashMap<i32, Connection<E>>,
        config: &MeshConfig,
    ) {
        if !self.table.is_dirty() {
            return;
        }
        self.table.rebuild(gates, connections, config);

        let report = self.table.compute_report(config.report_ping_changes_above);
        if report.is_empty() {
            return;
        }
        for conn in connections.values_mut() {
            if conn.is_active() {
                conn.write_route_entries(&report, false, config.mtu);
            }
        }
    }

    /// Dispatches one frame toward zero or more next hops. `from` is the
    ///  connection it arrived on, the gate it was injected by (encoded
    ///  negative), or [NO_SOURCE].
    pub fn route_frame(
        &mut self,
        packet: &PacketData,
        from: i32,
        connections: &mut FxHashMap<i32, Connection<E>>,
        gates: &mut GateRegistry,
        config: &MeshConfig,
    ) {
        if packet.ds == 0 || !packet.is_well_formed() {
            return;
        }
        if self.id_cache.already_seen(packet.id) {
            trace!(id = packet.id, "duplicate frame, dropping");
            return;
        }
        self.id_cache.record(packet.id);

        self.refresh(gates, connections, config);

        let dest = packet.dest_addr();
        if dest.is_broadcast() {
            return self.broadcast(packet, from, connections, gates, config);
        }

        let wildcard = dest.wildcard_of();
        let mut sendlist: BTreeSet<i32> = BTreeSet::new();

        // the probable destination, if we know it
        if config.multipath {
            if let Some(hop) = self.table.scatter::<E>(&dest, from, config.multipath_ratio) {
                sendlist.insert(hop);
            }
        } else if let Some(info) = self.table.lookup(&dest) {
            sendlist.insert(info.next_hop);
        }

        let listeners = self.table.promisc_listeners(&wildcard);

        // nobody known at all: flood instead
        if sendlist.is_empty() && listeners.is_empty() {
            return self.broadcast(packet, from, connections, gates, config);
        }

        if config.shared_uplink {
            // one listener carries the frame upstream, gates still all hear it
            if let Some(pick) = pick_one::<E, _>(listeners) {
                sendlist.insert(pick.next_hop);
            }
        }
        for listener in listeners {
            if !config.shared_uplink || listener.next_hop < 0 {
                sendlist.insert(listener.next_hop);
            }
        }

        sendlist.remove(&from);

        for &hop in &sendlist {
            if hop < 0 || packet.ttl > 0 {
                send_to_hop(hop, packet, connections, gates, config);
            }
        }
    }

    /// Flood: every interested ready gate, then - TTL permitting - either one
    ///  random active peer (shared uplink) or all of them except the source.
    fn broadcast(
        &mut self,
        packet: &PacketData,
        from: i32,
        connections: &mut FxHashMap<i32, Connection<E>>,
        gates: &mut GateRegistry,
        config: &MeshConfig,
    ) {
        let wildcard = MeshAddr::wildcard(packet.instance);
        let from_gate = hop_to_gate(from);

        for (gate_id, gate) in gates.iter_mut() {
            if gate_id == from_gate || !gate.is_ready() {
                continue;
            }
            if !gate.instances().contains(&wildcard) {
                continue;
            }
            gate.send_frame(packet.instance, packet.dof, packet.ds, packet.sof, packet.ss, &packet.buf);
        }

        if packet.ttl == 0 {
            return; // gates got it, but it spreads no further
        }
        let forwarded = PacketData {
            ttl: packet.ttl - 1,
            ..packet.clone()
        };

        if config.shared_uplink {
            let mut active: Vec<i32> = connections.values()
                .filter(|c| c.is_active() && c.id() != from)
                .map(|c| c.id())
                .collect();
            active.sort();
            if let Some(&pick) = pick_one::<E, _>(&active) {
                if let Some(conn) = connections.get_mut(&pick) {
                    conn.write_packet(&forwarded, config);
                }
            }
            return;
        }

        for conn in connections.values_mut() {
            if conn.id() == from || !conn.is_active() {
                continue;
            }
            conn.write_packet(&forwarded, config);
        }
    }
}

/// Delivery to one next hop: gates take the frame as-is (they have no TTL
///  notion), connections get it with the TTL decremented.
fn send_to_hop<E: MeshEntropy>(
    hop: i32,
    packet: &PacketData,
    connections: &mut FxHashMap<i32, Connection<E>>,
    gates: &mut GateRegistry,
    config: &MeshConfig,
) {
    if hop < 0 {
        if let Some(gate) = gates.get_mut(hop_to_gate(hop)) {
            gate.send_frame(packet.instance, packet.dof, packet.ds, packet.sof, packet.ss, &packet.buf);
        }
    } else if packet.ttl > 0 {
        if let Some(conn) = connections.get_mut(&hop) {
            conn.write_packet(&PacketData { ttl: packet.ttl - 1, ..packet.clone() }, config);
        }
    }
}
