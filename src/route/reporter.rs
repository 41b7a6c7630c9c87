use crate::comm::frame::RouteEntry;
use crate::route::table::{RouteInfo, RouteTable};


impl RouteTable {
    /// Walks `route` against what was last advertised, in sorted address
    ///  order, and produces the diff to broadcast: upserts for new or
    ///  materially changed entries (ping moved by more than `ping_diff`, or
    ///  any distance change), withdrawals for entries that are gone.
    ///
    /// The advertised state is updated in lockstep with each emitted entry,
    ///  never beyond: peers always see exactly what we told them.
    pub fn compute_report(&mut self, ping_diff: u32) -> Vec<RouteEntry> {
        let mut report = Vec::new();

        let mut new_it = self.route.iter();
        let mut old_it = self.reported.iter();
        let mut new_cur = new_it.next();
        let mut old_cur = old_it.next();

        loop {
            match (new_cur, old_cur) {
                (Some((new_addr, new_info)), Some((old_addr, old_info))) => {
                    match new_addr.cmp(old_addr) {
                        std::cmp::Ordering::Equal => {
                            if new_info.ping.abs_diff(old_info.ping) > ping_diff
                                || new_info.dist != old_info.dist
                            {
                                report.push(entry(new_addr.clone(), new_info));
                            }
                            new_cur = new_it.next();
                            old_cur = old_it.next();
                        }
                        std::cmp::Ordering::Less => {
                            report.push(entry(new_addr.clone(), new_info));
                            new_cur = new_it.next();
                        }
                        std::cmp::Ordering::Greater => {
                            report.push(RouteEntry::withdrawal(old_addr.clone()));
                            old_cur = old_it.next();
                        }
                    }
                }
                (Some((new_addr, new_info)), None) => {
                    report.push(entry(new_addr.clone(), new_info));
                    new_cur = new_it.next();
                }
                (None, Some((old_addr, _))) => {
                    report.push(RouteEntry::withdrawal(old_addr.clone()));
                    old_cur = old_it.next();
                }
                (None, None) => break,
            }
        }

        for e in &report {
            if e.is_withdrawal() {
                self.reported.remove(&e.addr);
            } else {
                self.reported.insert(e.addr.clone(), RouteInfo {
                    ping: e.ping,
                    dist: e.dist,
                    next_hop: 0,
                });
            }
        }

        report
    }

    /// The full set for a freshly connected peer: what we have told peers,
    ///  never an un-advertised optimistic state.
    pub fn full_report(&self) -> Vec<RouteEntry> {
        self.reported.iter()
            .map(|(addr, info)| entry(addr.clone(), info))
            .collect()
    }
}

fn entry(addr: crate::comm::address::MeshAddr, info: &RouteInfo) -> RouteEntry {
    RouteEntry {
        ping: info.ping,
        dist: info.dist,
        addr,
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;
    use super::*;
    use crate::comm::address::MeshAddr;

    fn addr(byte: u8) -> MeshAddr {
        MeshAddr::new(1, vec![byte])
    }

    fn info(ping: u32, dist: u32) -> RouteInfo {
        RouteInfo { ping, dist, next_hop: 0 }
    }

    fn table_with(route: &[(u8, u32, u32)], reported: &[(u8, u32, u32)]) -> RouteTable {
        let mut table = RouteTable::new();
        table.route = route.iter().map(|&(a, p, d)| (addr(a), info(p, d))).collect();
        table.reported = reported.iter().map(|&(a, p, d)| (addr(a), info(p, d))).collect();
        table
    }

    /// applying a diff to the old advertised state must reproduce the route map
    fn apply(reported: &[(u8, u32, u32)], diff: &[RouteEntry]) -> BTreeMap<MeshAddr, (u32, u32)> {
        let mut result: BTreeMap<MeshAddr, (u32, u32)> = reported.iter()
            .map(|&(a, p, d)| (addr(a), (p, d)))
            .collect();
        for e in diff {
            if e.is_withdrawal() {
                result.remove(&e.addr);
            } else {
                result.insert(e.addr.clone(), (e.ping, e.dist));
            }
        }
        result
    }

    #[test]
    fn test_diff_upserts_and_withdraws() {
        let reported = [(1u8, 10u32, 1u32), (2, 20, 1), (3, 30, 1)];
        // addr 1 unchanged, addr 2 changed, addr 3 gone, addr 4 new
        let mut table = table_with(&[(1, 10, 1), (2, 25, 2), (4, 40, 1)], &reported);

        let diff = table.compute_report(0);
        assert_eq!(diff, vec![
            RouteEntry { ping: 25, dist: 2, addr: addr(2) },
            RouteEntry::withdrawal(addr(3)),
            RouteEntry { ping: 40, dist: 1, addr: addr(4) },
        ]);

        // the diff transforms the old advertised state into the new route map
        let applied = apply(&reported, &diff);
        let expected: BTreeMap<MeshAddr, (u32, u32)> =
            table.route.iter().map(|(a, i)| (a.clone(), (i.ping, i.dist))).collect();
        assert_eq!(applied, expected);

        // and reported now matches route exactly
        assert_eq!(table.reported, table.route.iter()
            .map(|(a, i)| (a.clone(), info(i.ping, i.dist)))
            .collect());
    }

    #[test]
    fn test_small_ping_changes_are_suppressed() {
        let mut table = table_with(&[(1, 1100, 1)], &[(1, 1000, 1)]);
        assert_eq!(table.compute_report(5000), vec![]);

        // the suppressed value stays advertised as-is
        assert_eq!(table.reported.get(&addr(1)), Some(&info(1000, 1)));
    }

    #[test]
    fn test_large_ping_change_is_reported() {
        let mut table = table_with(&[(1, 9000, 1)], &[(1, 1000, 1)]);
        assert_eq!(table.compute_report(5000), vec![
            RouteEntry { ping: 9000, dist: 1, addr: addr(1) },
        ]);
    }

    #[test]
    fn test_dist_change_is_always_reported() {
        let mut table = table_with(&[(1, 1000, 2)], &[(1, 1000, 1)]);
        assert_eq!(table.compute_report(5000), vec![
            RouteEntry { ping: 1000, dist: 2, addr: addr(1) },
        ]);
    }

    #[test]
    fn test_empty_diff_for_identical_state() {
        let mut table = table_with(&[(1, 10, 1), (2, 20, 2)], &[(1, 10, 1), (2, 20, 2)]);
        assert_eq!(table.compute_report(0), vec![]);
    }

    #[test]
    fn test_full_report_reflects_advertised_not_computed() {
        let table = table_with(&[(1, 10, 1), (2, 20, 1)], &[(3, 30, 1)]);
        let full = table.full_report();
        assert_eq!(full, vec![RouteEntry { ping: 30, dist: 1, addr: addr(3) }]);
    }
}
