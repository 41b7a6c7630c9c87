use std::collections::BTreeMap;

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::comm::address::MeshAddr;
use crate::comm::connection::Connection;
use crate::comm::entropy::MeshEntropy;
use crate::config::MeshConfig;
use crate::gate::{gate_to_hop, GateRegistry};


/// The best known route to one address. `next_hop >= 0` is a connection id,
///  `next_hop < 0` a gate encoded as `-(gate_id+1)`.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct RouteInfo {
    pub ping: u32,
    pub dist: u32,
    pub next_hop: i32,
}

/// The process-wide aggregation of reachability: the best-next-hop map
///  rebuilt from scratch whenever dirty, the promiscuous-listener multimap,
///  the multipath index, and the last state advertised to peers.
pub struct RouteTable {
    pub(crate) route: BTreeMap<MeshAddr, RouteInfo>,
    pub(crate) reported: BTreeMap<MeshAddr, RouteInfo>,
    pub(crate) promisc: BTreeMap<MeshAddr, Vec<RouteInfo>>,
    pub(crate) multi: BTreeMap<MeshAddr, BTreeMap<u32, i32>>,
    dirty: u32,
}

impl RouteTable {
    pub fn new() -> RouteTable {
        RouteTable {
            route: BTreeMap::new(),
            reported: BTreeMap::new(),
            promisc: BTreeMap::new(),
            multi: BTreeMap::new(),
            dirty: 1,
        }
    }

    /// Any mutation that could change routing outcomes bumps this; the next
    ///  forwarding decision recomputes first.
    pub fn set_dirty(&mut self) {
        self.dirty += 1;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty > 0
    }

    pub fn lookup(&self, addr: &MeshAddr) -> Option<RouteInfo> {
        self.route.get(addr).copied()
    }

    pub fn entries(&self) -> &BTreeMap<MeshAddr, RouteInfo> {
        &self.route
    }

    pub fn promisc_listeners(&self, wildcard: &MeshAddr) -> &[RouteInfo] {
        self.promisc.get(wildcard).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Rebuilds `route` (and the promisc and multipath side indexes) from
    ///  the gates' local addresses and the peers' advertisements.
    ///
    /// Local gate routes go in first with `ping=1, dist=0`, so a remote
    ///  candidate for the same address (minimum ping 2) can never displace
    ///  them. Remote candidates replace an incumbent only if the incumbent's
    ///  hop-penalized ping is no better, with shorter distance breaking ties.
    pub fn rebuild<E: MeshEntropy>(
        &mut self,
        gates: &GateRegistry,
        connections: &FxHashMap<i32, Connection<E>>,
        config: &MeshConfig,
    ) {
        self.dirty = 0;
        self.route.clear();
        self.promisc.clear();

        for (gate_id, gate) in gates.iter() {
            if !gate.is_ready() {
                continue;
            }
            for addr in gate.local_addrs() {
                let info = RouteInfo {
                    ping: 1,
                    dist: 0,
                    next_hop: gate_to_hop(gate_id),
                };
                self.route.insert(addr.clone(), info);
                if addr.is_wildcard() {
                    self.promisc.entry(addr.clone()).or_default().push(info);
                }
            }
        }

        // iterate connections in id order: penalized comparison is a fold,
        // so the outcome must not depend on hash order
        let mut active: Vec<&Connection<E>> = connections.values()
            .filter(|c| c.is_active())
            .collect();
        active.sort_by_key(|c| c.id());

        for conn in active {
            for (addr, remote) in conn.remote_routes() {
                if 1 + remote.dist > config.route_max_dist {
                    continue;
                }

                let candidate = RouteInfo {
                    ping: 2 + remote.ping + conn.ping(),
                    dist: 1 + remote.dist,
                    next_hop: conn.id(),
                };

                if addr.is_wildcard() {
                    self.promisc.entry(addr.clone()).or_default().push(candidate);
                }

                if let Some(incumbent) = self.route.get(addr) {
                    let penalized = incumbent.ping as u64
                        * (100 + config.route_hop_penalization as u64 * incumbent.dist as u64)
                        / 100;
                    if penalized < candidate.ping as u64 {
                        continue;
                    }
                    if penalized == candidate.ping as u64 && incumbent.dist < candidate.dist {
                        continue;
                    }
                }
                self.route.insert(addr.clone(), candidate);
            }
        }

        if config.multipath {
            self.rebuild_multi(connections);
        }
        debug!(routes = self.route.len(), "route table rebuilt");
    }

    fn rebuild_multi<E: MeshEntropy>(&mut self, connections: &FxHashMap<i32, Connection<E>>) {
        self.multi.clear();
        for conn in connections.values() {
            if !conn.is_active() {
                continue;
            }
            for (addr, remote) in conn.remote_routes() {
                self.multi.entry(addr.clone())
                    .or_default()
                    .insert(2 + remote.ping + conn.ping(), conn.id());
            }
        }
    }

    /// Multipath scattering: walks the per-address index in ascending
    ///  cumulative ping, in bands of comparable entries (everything below
    ///  `multi_ratio` times the band's first ping). Within a band of size n
    ///  a uniform draw from 0..=n either selects an entry or moves on to the
    ///  next band; the last band always selects. A selection that would send
    ///  the frame back where it came from skips to the next band.
    pub fn scatter<E: MeshEntropy>(&self, addr: &MeshAddr, from: i32, multi_ratio: u32) -> Option<i32> {
        let index = self.multi.get(addr)?;
        let entries: Vec<(u32, i32)> = index.iter().map(|(&ping, &id)| (ping, id)).collect();

        let mut i = 0;
        while i < entries.len() {
            let max_ping = multi_ratio as u64 * entries[i].0 as u64;
            let mut n = 0;
            while i + n < entries.len() && (entries[i + n].0 as u64) < max_ping {
                n += 1;
            }

            let is_last_band = i + n == entries.len();
            let r = if is_last_band {
                E::pick(n)
            } else {
                E::pick(n + 1)
            };

            if r != n {
                let (_, id) = entries[i + r];
                i += n;
                if id == from {
                    continue; // never send backwards, try the next band
                }
                return Some(id);
            }
            i += n;
        }
        None
    }
}

#[cfg(test)]
mod test {
    use rustc_hash::FxHashMap;
    use super::*;
    use crate::comm::entropy::{MockMeshEntropy, ThreadRngEntropy};
    use crate::test_util::{TestGate, ENTROPY_LOCK};

    fn addr(bytes: &[u8]) -> MeshAddr {
        MeshAddr::new(1, bytes.to_vec())
    }

    fn conns(list: Vec<Connection<ThreadRngEntropy>>) -> FxHashMap<i32, Connection<ThreadRngEntropy>> {
        list.into_iter().map(|c| (c.id(), c)).collect()
    }

    #[test]
    fn test_local_gate_routes() {
        let mut gates = GateRegistry::new();
        let (gate, _) = TestGate::new(vec![addr(&[1]), MeshAddr::wildcard(1)], vec![]);
        gates.insert(0, Box::new(gate));

        let mut table = RouteTable::new();
        table.rebuild(&gates, &conns(vec![]), &MeshConfig::new());

        assert_eq!(table.lookup(&addr(&[1])), Some(RouteInfo { ping: 1, dist: 0, next_hop: -1 }));
        assert_eq!(table.promisc_listeners(&MeshAddr::wildcard(1)),
                   &[RouteInfo { ping: 1, dist: 0, next_hop: -1 }]);
        assert!(!table.is_dirty());
    }

    #[test]
    fn test_unready_gate_is_ignored() {
        let mut gates = GateRegistry::new();
        let (mut gate, _) = TestGate::new(vec![addr(&[1])], vec![]);
        gate.ready = false;
        gates.insert(0, Box::new(gate));

        let mut table = RouteTable::new();
        table.rebuild(&gates, &conns(vec![]), &MeshConfig::new());
        assert_eq!(table.lookup(&addr(&[1])), None);
    }

    #[test]
    fn test_remote_candidate_ping_and_dist() {
        let connections = conns(vec![
            Connection::test_active(3, 1000, &[(addr(&[1]), 50, 2)]),
        ]);

        let mut table = RouteTable::new();
        table.rebuild(&GateRegistry::new(), &connections, &MeshConfig::new());

        assert_eq!(table.lookup(&addr(&[1])),
                   Some(RouteInfo { ping: 2 + 50 + 1000, dist: 3, next_hop: 3 }));
    }

    #[test]
    fn test_local_route_beats_remote() {
        let mut gates = GateRegistry::new();
        let (gate, _) = TestGate::new(vec![addr(&[1])], vec![]);
        gates.insert(0, Box::new(gate));

        let connections = conns(vec![
            Connection::test_active(0, 1, &[(addr(&[1]), 1, 0)]),
        ]);

        let mut table = RouteTable::new();
        table.rebuild(&gates, &connections, &MeshConfig::new());
        assert_eq!(table.lookup(&addr(&[1])).unwrap().next_hop, -1);
    }

    #[test]
    fn test_max_dist_caps_advertisements() {
        let mut config = MeshConfig::new();
        config.route_max_dist = 2;

        let connections = conns(vec![
            Connection::test_active(0, 10, &[(addr(&[1]), 5, 1), (addr(&[2]), 5, 2)]),
        ]);

        let mut table = RouteTable::new();
        table.rebuild(&GateRegistry::new(), &connections, &config);
        assert!(table.lookup(&addr(&[1])).is_some());
        assert!(table.lookup(&addr(&[2])).is_none());

        // distance zero admits only local gate routes
        config.route_max_dist = 0;
        table.set_dirty();
        table.rebuild(&GateRegistry::new(), &connections, &config);
        assert!(table.entries().is_empty());
    }

    #[test]
    fn test_equal_ping_prefers_shorter_path() {
        let connections = conns(vec![
            Connection::test_active(0, 10, &[(addr(&[1]), 50, 3)]),
            Connection::test_active(1, 10, &[(addr(&[1]), 50, 1)]),
        ]);

        let mut table = RouteTable::new();
        table.rebuild(&GateRegistry::new(), &connections, &MeshConfig::new());
        assert_eq!(table.lookup(&addr(&[1])), Some(RouteInfo { ping: 62, dist: 2, next_hop: 1 }));
    }

    #[test]
    fn test_hop_penalization_biases_toward_short_paths() {
        // candidate via 0: ping 100 over 5 hops; via 1: ping 104 over 1 hop
        let connections = conns(vec![
            Connection::test_active(0, 58, &[(addr(&[1]), 40, 4)]),
            Connection::test_active(1, 93, &[(addr(&[1]), 9, 0)]),
        ]);

        let mut config = MeshConfig::new();
        let mut table = RouteTable::new();

        // without penalization the lower absolute ping wins
        table.rebuild(&GateRegistry::new(), &connections, &config);
        assert_eq!(table.lookup(&addr(&[1])), Some(RouteInfo { ping: 100, dist: 5, next_hop: 0 }));

        // 10% per hop makes the long path look like 150 and the short one wins
        config.route_hop_penalization = 10;
        table.set_dirty();
        table.rebuild(&GateRegistry::new(), &connections, &config);
        assert_eq!(table.lookup(&addr(&[1])), Some(RouteInfo { ping: 104, dist: 1, next_hop: 1 }));
    }

    #[test]
    fn test_inactive_connections_contribute_nothing() {
        let config = MeshConfig::new();
        let mut conn: Connection<ThreadRngEntropy> = Connection::test_active(0, 10, &[(addr(&[1]), 5, 1)]);
        conn.reset(tokio::time::Instant::now());

        let mut table = RouteTable::new();
        table.rebuild(&GateRegistry::new(), &conns(vec![conn]), &config);
        assert!(table.entries().is_empty());
    }

    #[test]
    fn test_route_covers_all_advertisements_within_dist() {
        let mut gates = GateRegistry::new();
        let (gate, _) = TestGate::new(vec![addr(&[9])], vec![]);
        gates.insert(0, Box::new(gate));

        let connections = conns(vec![
            Connection::test_active(0, 10, &[(addr(&[1]), 5, 1), (addr(&[2]), 5, 1)]),
            Connection::test_active(1, 10, &[(addr(&[2]), 5, 1), (addr(&[3]), 5, 70)]),
        ]);

        let mut table = RouteTable::new();
        table.rebuild(&gates, &connections, &MeshConfig::new());

        let keys: Vec<&MeshAddr> = table.entries().keys().collect();
        assert_eq!(keys, vec![&addr(&[1]), &addr(&[2]), &addr(&[9])]);
    }

    #[test]
    fn test_remote_wildcards_collect_as_promisc_listeners() {
        let connections = conns(vec![
            Connection::test_active(0, 10, &[(MeshAddr::wildcard(1), 5, 1)]),
            Connection::test_active(1, 20, &[(MeshAddr::wildcard(1), 5, 1)]),
        ]);

        let mut table = RouteTable::new();
        table.rebuild(&GateRegistry::new(), &connections, &MeshConfig::new());

        let mut hops: Vec<i32> = table.promisc_listeners(&MeshAddr::wildcard(1))
            .iter()
            .map(|i| i.next_hop)
            .collect();
        hops.sort();
        assert_eq!(hops, vec![0, 1]);
    }

    #[test]
    fn test_scatter_bands() {
        let _lock = ENTROPY_LOCK.lock().unwrap();

        // cumulative pings: via conn 0 -> 10, via conn 1 -> 15, via conn 2 -> 40
        let connections: FxHashMap<i32, Connection<MockMeshEntropy>> = vec![
            Connection::test_active(0, 3, &[(addr(&[1]), 5, 1)]),
            Connection::test_active(1, 8, &[(addr(&[1]), 5, 1)]),
            Connection::test_active(2, 33, &[(addr(&[1]), 5, 1)]),
        ].into_iter().map(|c| (c.id(), c)).collect();

        let mut config = MeshConfig::new();
        config.multipath = true;

        let mut table = RouteTable::new();
        table.rebuild(&GateRegistry::new(), &connections, &config);

        // first band is {10, 15}: draws of 0 and 1 select, 2 moves on
        let ctx = MockMeshEntropy::pick_context();
        ctx.expect().times(1).returning(|_| 0);
        assert_eq!(table.scatter::<MockMeshEntropy>(&addr(&[1]), -99, 2), Some(0));
        ctx.checkpoint();

        ctx.expect().times(1).returning(|_| 1);
        assert_eq!(table.scatter::<MockMeshEntropy>(&addr(&[1]), -99, 2), Some(1));
        ctx.checkpoint();

        // skipping the first band lands in the last band {40}, which always selects
        ctx.expect().times(1).returning(|n| n - 1);
        ctx.expect().times(1).returning(|_| 0);
        assert_eq!(table.scatter::<MockMeshEntropy>(&addr(&[1]), -99, 2), Some(2));
        ctx.checkpoint();

        // a selection equal to `from` skips to the next band
        ctx.expect().times(1).returning(|_| 0);
        ctx.expect().times(1).returning(|_| 0);
        assert_eq!(table.scatter::<MockMeshEntropy>(&addr(&[1]), 0, 2), Some(2));
        ctx.checkpoint();

        // unknown address scatters nowhere
        assert_eq!(table.scatter::<MockMeshEntropy>(&addr(&[7]), -99, 2), None);
    }

    #[test]
    fn test_scatter_exhausted_when_only_source_remains() {
        let _lock = ENTROPY_LOCK.lock().unwrap();

        let connections: FxHashMap<i32, Connection<MockMeshEntropy>> = vec![
            Connection::test_active(0, 3, &[(addr(&[1]), 5, 1)]),
        ].into_iter().map(|c| (c.id(), c)).collect();

        let mut config = MeshConfig::new();
        config.multipath = true;

        let mut table = RouteTable::new();
        table.rebuild(&GateRegistry::new(), &connections, &config);

        let ctx = MockMeshEntropy::pick_context();
        ctx.expect().times(1).returning(|_| 0);
        assert_eq!(table.scatter::<MockMeshEntropy>(&addr(&[1]), 0, 2), None);
    }
}
