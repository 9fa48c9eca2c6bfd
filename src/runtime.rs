//! Trace-tree runtime (C5): observes which header fields a policy handler reads, builds a
//! decision tree from those observations, and uses it both to locate the Flow for a packet
//! (`run`) and to extend itself with a new observed path (`augment`). Grounded on the trace-tree
//! description in spec §4.5 and on the `ModTrackingPacket`-driven augmentation flow in
//! `examples/original_source/src/Maple.cc`'s `MapleImpl::processPacketIn`; there is no literal
//! `TraceTree` type in the original (the tree there is folded into `Application`'s rule table),
//! so the node/priority-band layout below is this crate's own structuring of the same observed
//! behaviour.

use crate::backend::Backend;
use crate::error::{MapleError, Result};
use crate::flow::{Flow, FlowRef, Installer};
use crate::oxm::{Field, FieldId, FieldValue, FullFieldSet};
use crate::packet::{ModTrackingPacket, Packet, PacketView};
use std::cell::RefCell;
use std::rc::Rc;
use tracing::{debug, trace, warn};

/// One interior test (`field == value`) or catch-all ("default") edge out of a tree node.
enum Edge {
    Test { value: FieldValue, child: Box<Node> },
    Default(Box<Node>),
}

/// A tree node: either an interior decision point over a single field, or a leaf referencing a
/// Flow (spec §3, invariants T1–T3).
enum Node {
    Interior { field: FieldId, edges: Vec<Edge>, priority_floor: u16, priority_ceiling: u16 },
    Leaf { flow: FlowRef, priority: u16 },
}

impl Node {
    fn leaf(flow: FlowRef, priority: u16) -> Self {
        Node::Leaf { flow, priority }
    }
}

/// Span of priorities a subtree may assign to its own leaves (spec §3 T2, T3).
const ROOT_BAND: (u16, u16) = (1, u16::MAX - 1);
/// How much the band narrows per tree level, reserving room for ancestor default branches to
/// still outrank deeper, more specific leaves (T2).
const BAND_STEP: u16 = 64;

pub struct TraceTree {
    root: Option<Node>,
    next_priority: u16,
}

impl TraceTree {
    pub fn new() -> Self {
        TraceTree { root: None, next_priority: ROOT_BAND.0 }
    }

    /// Traverse the tree against `packet`'s real values, returning the leaf flow if one is
    /// reached (spec §4.5, property P1).
    pub fn run(&self, packet: &Packet) -> Option<FlowRef> {
        let mut node = self.root.as_ref()?;
        loop {
            match node {
                Node::Leaf { flow, .. } => return Some(flow.clone()),
                Node::Interior { field, edges, .. } => {
                    let actual = packet.value(*field);
                    let mut next = None;
                    let mut default = None;
                    for edge in edges {
                        match edge {
                            Edge::Test { value, child } => {
                                if Some(*value) == actual {
                                    next = Some(child.as_ref());
                                    break;
                                }
                            }
                            Edge::Default(child) => default = Some(child.as_ref()),
                        }
                    }
                    node = next.or(default)?;
                }
            }
        }
    }

    /// Execute `handler` against `packet` through a mod-tracking view, observing every test it
    /// performs, and extend the tree so that conjunction of tests now leads to `flow`. Returns
    /// the mods recorded, the resulting decision, and an installer closure that replays the new
    /// path's `(priority, match)` pairs against a [`Backend`] (spec §4.5).
    pub fn augment(
        &mut self,
        packet: Packet,
        flow: FlowRef,
        handler: impl FnOnce(&mut ModTrackingPacket) -> Result<crate::decision::Decision>,
    ) -> Result<(crate::decision::Decision, crate::oxm::FieldSet, Installer)> {
        let mut view = ModTrackingPacket::new(packet);
        let decision = handler(&mut view)?;
        let trace = view.trace();
        let mods = view.mods().clone();

        let priority = self.insert_path(&trace, flow.clone())?;
        trace!(path_len = trace.len(), priority, "trace tree augmented");

        let installer: Installer = Rc::new(move |flow: &FlowRef, backend: &mut dyn Backend| {
            let mut match_ = FullFieldSet::new();
            for (id, value) in &trace {
                match_.fields.insert(Field::new(*id, *value));
            }
            backend.install(priority, &match_, flow)
        });

        Ok((decision, mods, installer))
    }

    /// Recompute priorities across the whole tree (spec §4.5; used after a priority-exceeded
    /// condition). Reassigns dense, non-overlapping bands level by level.
    pub fn update(&mut self) {
        debug!("recomputing trace tree priorities");
        if let Some(root) = &mut self.root {
            let mut next = ROOT_BAND.0;
            renumber(root, ROOT_BAND.0, ROOT_BAND.1, &mut next);
            self.next_priority = next;
        }
    }

    fn insert_path(&mut self, trace: &[(FieldId, FieldValue)], flow: FlowRef) -> Result<u16> {
        if trace.is_empty() {
            let priority = self.allocate(ROOT_BAND.0, ROOT_BAND.1)?;
            self.root = Some(Node::leaf(flow, priority));
            return Ok(priority);
        }

        if self.root.is_none() {
            self.root = Some(Node::Interior {
                field: trace[0].0,
                edges: Vec::new(),
                priority_floor: ROOT_BAND.0,
                priority_ceiling: ROOT_BAND.1,
            });
        }

        let priority = {
            let floor = ROOT_BAND.0;
            let ceiling = ROOT_BAND.1;
            self.allocate(floor, ceiling)?
        };

        let mut node = self.root.as_mut().unwrap();
        for (depth, (field, value)) in trace.iter().enumerate() {
            match node {
                Node::Leaf { .. } => {
                    warn!("augment path collides with an existing leaf above its own depth");
                    break;
                }
                Node::Interior { field: node_field, edges, .. } => {
                    if node_field != field {
                        warn!(
                            expected = ?node_field,
                            found = ?field,
                            "trace path diverges from existing tree field at this depth (T1)"
                        );
                    }
                    let existing = edges.iter().position(|e| match e {
                        Edge::Test { value: v, .. } => v == value,
                        Edge::Default(_) => false,
                    });
                    let is_last = depth + 1 == trace.len();
                    let child_idx = match existing {
                        Some(i) => i,
                        None => {
                            let child = if is_last {
                                Node::leaf(flow.clone(), priority)
                            } else {
                                Node::Interior {
                                    field: trace[depth + 1].0,
                                    edges: Vec::new(),
                                    priority_floor: ROOT_BAND.0,
                                    priority_ceiling: ROOT_BAND.1,
                                }
                            };
                            edges.push(Edge::Test { value: *value, child: Box::new(child) });
                            edges.len() - 1
                        }
                    };
                    if is_last {
                        if let Edge::Test { child, .. } = &mut edges[child_idx] {
                            **child = Node::leaf(flow.clone(), priority);
                        }
                        return Ok(priority);
                    }
                    if let Edge::Test { child, .. } = &mut edges[child_idx] {
                        node = child.as_mut();
                    }
                }
            }
        }
        Ok(priority)
    }

    fn allocate(&mut self, floor: u16, ceiling: u16) -> Result<u16> {
        if self.next_priority >= ceiling {
            return Err(MapleError::PriorityExceeded);
        }
        let p = self.next_priority.max(floor);
        self.next_priority = p.saturating_add(1);
        Ok(p)
    }
}

impl Default for TraceTree {
    fn default() -> Self {
        Self::new()
    }
}

fn renumber(node: &mut Node, floor: u16, ceiling: u16, next: &mut u16) {
    match node {
        Node::Leaf { priority, .. } => {
            *priority = (*next).clamp(floor, ceiling.saturating_sub(1));
            *next = next.saturating_add(1);
        }
        Node::Interior { edges, priority_floor, priority_ceiling, .. } => {
            *priority_floor = floor;
            *priority_ceiling = ceiling;
            let band = ceiling.saturating_sub(floor).saturating_sub(BAND_STEP).max(1);
            for edge in edges {
                let child = match edge {
                    Edge::Test { child, .. } => child.as_mut(),
                    Edge::Default(child) => child.as_mut(),
                };
                renumber(child, floor, floor.saturating_add(band), next);
            }
        }
    }
}

/// Create a fresh, never-activated Flow with the next reserved cookie. Cookie allocation is the
/// runtime's responsibility because it alone knows every cookie ever handed to a tree leaf
/// (invariant I1: unique process-wide).
pub struct CookieAllocator {
    next: RefCell<u64>,
}

impl CookieAllocator {
    pub fn new(start: u64) -> Self {
        CookieAllocator { next: RefCell::new(start) }
    }

    pub fn allocate(&self) -> u64 {
        let mut next = self.next.borrow_mut();
        let cookie = *next;
        *next += 1;
        cookie
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::Decision;
    use crate::oxm::FieldSet;
    use std::time::Duration;

    fn sample_packet(dpid: u64, in_port: u32, ip_proto: u8) -> Packet {
        let mut fields = FieldSet::new();
        fields.insert(Field::new(FieldId::IpProto, FieldValue::U8(ip_proto)));
        Packet::new(fields, dpid, in_port)
    }

    fn mk_flow(cookie: u64) -> FlowRef {
        Rc::new(RefCell::new(Flow::new(cookie, 0)))
    }

    #[test]
    fn run_returns_none_on_empty_tree() {
        let tree = TraceTree::new();
        assert!(tree.run(&sample_packet(1, 1, 6)).is_none());
    }

    #[test]
    fn augment_then_run_finds_the_same_flow() {
        let mut tree = TraceTree::new();
        let flow = mk_flow(1);
        let packet = sample_packet(1, 1, 6);

        let (_, _, _installer) = tree
            .augment(packet.clone(), flow.clone(), |pkt| {
                Ok(if pkt.read(FieldId::IpProto) == FieldValue::U8(6) {
                    Decision::new().drop().idle_timeout(Duration::from_secs(30))
                } else {
                    Decision::new().drop()
                })
            })
            .unwrap();

        let found = tree.run(&packet).unwrap();
        assert_eq!(found.borrow().cookie(), flow.borrow().cookie());
    }

    #[test]
    fn priority_exceeded_when_band_exhausted() {
        let mut tree = TraceTree::new();
        tree.next_priority = ROOT_BAND.1;
        let flow = mk_flow(1);
        let result = tree.augment(sample_packet(1, 1, 6), flow, |pkt| {
            let _ = pkt.read(FieldId::IpProto) == FieldValue::U8(6);
            Ok(Decision::new().drop())
        });
        assert!(matches!(result, Err(MapleError::PriorityExceeded)));
    }

    #[test]
    fn update_recovers_room_after_exhaustion() {
        let mut tree = TraceTree::new();
        let flow = mk_flow(1);
        tree.augment(sample_packet(1, 1, 6), flow.clone(), |pkt| {
            let _ = pkt.read(FieldId::IpProto) == FieldValue::U8(6);
            Ok(Decision::new().drop())
        })
        .unwrap();

        tree.next_priority = ROOT_BAND.1;
        tree.update();
        assert!(tree.next_priority < ROOT_BAND.1);
    }
}
