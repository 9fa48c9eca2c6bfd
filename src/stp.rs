//! Spanning-tree engine (C7): maintains a per-switch broadcast-enabled port set over a live link
//! graph, recomputed on a timer and invalidated by link/switch events. Grounded on `SwitchSTP` /
//! `STP` in `examples/original_source/src/STP.cc`; the module-global `std::mutex compute` there
//! becomes a per-engine `parking_lot::Mutex` here (spec §9 open question, recorded in DESIGN.md),
//! and `SwitchSTP*` pointers become dpid keys into a `HashMap` (spec §9, "arena-allocated switch
//! records").

use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{debug, info, trace};

/// External collaborator: shortest-path lookup over the discovered topology (spec §1, §5).
pub trait Topology {
    /// Ordered list of dpids from `from` to `to`, inclusive of both endpoints, or `None` if
    /// unreachable.
    fn shortest_path(&self, from: u64, to: u64) -> Option<Vec<u64>>;
}

#[derive(Debug, Clone, Default)]
struct PortRecord {
    to_switch: Option<u64>,
    next_switch: bool,
    broadcast: bool,
}

struct SwitchRecord {
    ports: HashMap<u32, PortRecord>,
    root: bool,
    computed: bool,
    next_switch: Option<u64>,
}

impl SwitchRecord {
    fn new() -> Self {
        SwitchRecord { ports: HashMap::new(), root: false, computed: false, next_switch: None }
    }

    fn broadcast_ports(&self) -> Vec<u32> {
        let mut ports: Vec<u32> = self
            .ports
            .iter()
            .filter(|(_, p)| p.broadcast)
            .map(|(port, _)| *port)
            .collect();
        ports.sort_unstable();
        ports
    }
}

/// Poll interval for recomputation, a compile-time constant per spec §6.
pub const RECOMPUTE_INTERVAL_SECS: u64 = 5;

/// `Send + Sync` behind interior mutability so it can be shared between the timer thread and the
/// event-delivery thread (spec §5).
pub struct SpanningTree {
    switches: Mutex<HashMap<u64, SwitchRecord>>,
}

impl SpanningTree {
    pub fn new() -> Self {
        SpanningTree { switches: Mutex::new(HashMap::new()) }
    }

    /// Register a new switch; the first switch ever discovered becomes the root.
    pub fn switch_discovered(&self, dpid: u64) {
        let mut switches = self.switches.lock();
        let is_first = switches.is_empty();
        let mut record = SwitchRecord::new();
        record.root = is_first;
        record.computed = is_first;
        info!(dpid = format!("{dpid:016x}"), root = is_first, "switch discovered");
        switches.insert(dpid, record);
    }

    pub fn switch_down(&self, dpid: u64) {
        let mut switches = self.switches.lock();
        let was_root = switches.get(&dpid).map(|r| r.root).unwrap_or(false);
        switches.remove(&dpid);
        if was_root {
            if let Some((&new_root, record)) = switches.iter_mut().next() {
                record.root = true;
                record.computed = false;
                info!(dpid = format!("{new_root:016x}"), "promoted to root after root switch down");
            }
        }
        invalidate_non_root(&mut switches);
    }

    pub fn port_up(&self, dpid: u64, port: u32) {
        let mut switches = self.switches.lock();
        if let Some(record) = switches.get_mut(&dpid) {
            record.ports.entry(port).or_default();
        }
    }

    /// Mark both endpoints as inter-switch ports and invalidate every non-root switch's
    /// `computed` flag (spec §4.7).
    pub fn link_discovered(&self, a: (u64, u32), b: (u64, u32)) {
        let mut switches = self.switches.lock();
        if let Some(record) = switches.get_mut(&a.0) {
            let port = record.ports.entry(a.1).or_default();
            port.to_switch = Some(b.0);
        }
        if let Some(record) = switches.get_mut(&b.0) {
            let port = record.ports.entry(b.1).or_default();
            port.to_switch = Some(a.0);
        }
        debug!(a = format!("{:016x}", a.0), b = format!("{:016x}", b.0), "link discovered");
        invalidate_non_root(&mut switches);
    }

    pub fn link_broken(&self, a: u64, b: u64) {
        let mut switches = self.switches.lock();
        if let Some(record) = switches.get_mut(&a) {
            for port in record.ports.values_mut() {
                if port.to_switch == Some(b) {
                    port.to_switch = None;
                    port.broadcast = false;
                }
            }
        }
        if let Some(record) = switches.get_mut(&b) {
            for port in record.ports.values_mut() {
                if port.to_switch == Some(a) {
                    port.to_switch = None;
                    port.broadcast = false;
                }
            }
        }
        debug!(a = format!("{a:016x}"), b = format!("{b:016x}"), "link broken");
        invalidate_non_root(&mut switches);
    }

    /// Recompute `dpid`'s broadcast port set against `topology` if `computed` is currently false
    /// (spec §4.7). Serialised across all switches by the engine's single mutex, matching the
    /// original's module-global lock.
    pub fn compute_path_for_switch(&self, dpid: u64, topology: &dyn Topology) {
        let mut switches = self.switches.lock();

        let root = switches.iter().find(|(_, r)| r.root).map(|(&d, _)| d);
        let Some(root) = root.or_else(|| {
            // No root found: promote `dpid` itself.
            if let Some(record) = switches.get_mut(&dpid) {
                record.root = true;
                record.computed = true;
            }
            None
        }) else {
            return;
        };

        if switches.get(&dpid).map(|r| r.computed).unwrap_or(true) {
            return;
        }

        let Some(path) = topology.shortest_path(dpid, root) else {
            trace!(dpid = format!("{dpid:016x}"), "no path to root yet");
            return;
        };
        if path.len() < 2 {
            if let Some(record) = switches.get_mut(&dpid) {
                record.computed = true;
            }
            return;
        }

        let next_hop = path[1];
        let before = switches.get(&dpid).map(|r| r.broadcast_ports().len()).unwrap_or(0);

        if let Some(record) = switches.get_mut(&dpid) {
            let first_port = record
                .ports
                .iter()
                .find(|(_, p)| p.to_switch == Some(next_hop))
                .map(|(port, _)| *port);
            if let Some(port) = first_port {
                if let Some(p) = record.ports.get_mut(&port) {
                    p.broadcast = true;
                    p.next_switch = true;
                }
            }
            record.next_switch = Some(next_hop);
        }

        if let Some(neighbour) = switches.get_mut(&next_hop) {
            let reverse_port = neighbour
                .ports
                .iter()
                .find(|(_, p)| p.to_switch == Some(dpid))
                .map(|(port, _)| *port);
            if let Some(port) = reverse_port {
                if let Some(p) = neighbour.ports.get_mut(&port) {
                    p.broadcast = true;
                }
            }
        }

        // Pass-through: any inter-switch port whose neighbour's path to root runs back through us.
        let neighbours: Vec<(u32, u64)> = switches
            .get(&dpid)
            .map(|r| r.ports.iter().filter_map(|(p, rec)| rec.to_switch.map(|n| (*p, n))).collect())
            .unwrap_or_default();
        for (port, neighbour_dpid) in neighbours {
            if switches.get(&neighbour_dpid).and_then(|n| n.next_switch) == Some(dpid) {
                if let Some(record) = switches.get_mut(&dpid) {
                    if let Some(p) = record.ports.get_mut(&port) {
                        p.broadcast = true;
                    }
                }
            }
        }

        let after = switches.get(&dpid).map(|r| r.broadcast_ports().len()).unwrap_or(0);
        if after == before {
            if let Some(record) = switches.get_mut(&dpid) {
                record.computed = true;
            }
        }
    }

    /// The current broadcast-enabled port set, or empty if unknown/not yet computed.
    pub fn broadcast_ports(&self, dpid: u64) -> Vec<u32> {
        self.switches.lock().get(&dpid).map(|r| r.broadcast_ports()).unwrap_or_default()
    }
}

impl Default for SpanningTree {
    fn default() -> Self {
        Self::new()
    }
}

fn invalidate_non_root(switches: &mut HashMap<u64, SwitchRecord>) {
    for record in switches.values_mut() {
        if !record.root {
            record.computed = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct LinearTopology;
    impl Topology for LinearTopology {
        fn shortest_path(&self, from: u64, to: u64) -> Option<Vec<u64>> {
            if from == to {
                return Some(vec![from]);
            }
            // 1 - 2 - 3, root is 1
            match (from, to) {
                (2, 1) => Some(vec![2, 1]),
                (3, 1) => Some(vec![3, 2, 1]),
                _ => None,
            }
        }
    }

    #[test]
    fn first_discovered_switch_becomes_root() {
        let stp = SpanningTree::new();
        stp.switch_discovered(1);
        stp.switch_discovered(2);
        assert!(stp.switches.lock().get(&1).unwrap().root);
        assert!(!stp.switches.lock().get(&2).unwrap().root);
    }

    #[test]
    fn link_discovery_invalidates_non_root_switches() {
        let stp = SpanningTree::new();
        stp.switch_discovered(1);
        stp.switch_discovered(2);
        stp.compute_path_for_switch(2, &LinearTopology);
        stp.link_discovered((1, 10), (2, 20));
        assert!(!stp.switches.lock().get(&2).unwrap().computed);
    }

    #[test]
    fn broadcast_port_converges_to_first_hop_toward_root() {
        let stp = SpanningTree::new();
        stp.switch_discovered(1);
        stp.switch_discovered(2);
        stp.switch_discovered(3);
        stp.link_discovered((1, 1), (2, 1));
        stp.link_discovered((2, 2), (3, 1));

        let topo = LinearTopology;
        stp.compute_path_for_switch(2, &topo);
        stp.compute_path_for_switch(3, &topo);

        // Switch 2's own first hop to root is port 1; it also carries port 2 broadcast-enabled
        // as the reverse of switch 3's first hop toward it (spec P6: both directions of a tree
        // edge end up broadcast-enabled).
        assert_eq!(stp.broadcast_ports(2), vec![1, 2]);
        assert_eq!(stp.broadcast_ports(3), vec![1]);
    }

    #[test]
    fn unknown_switch_has_empty_broadcast_set() {
        let stp = SpanningTree::new();
        assert!(stp.broadcast_ports(42).is_empty());
    }
}
