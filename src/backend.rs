//! Backend (C4): compiles decisions and recorded modifications into switch actions, computes
//! multi-switch fan-out under switch-id predicates, and dispatches install/remove/barrier
//! messages. Grounded on `MapleBackend` in `examples/original_source/src/Maple.cc`
//! (`compute_switches`, `install`, the three `remove` overloads, `barrier_rule`, `barrier`).
//!
//! The OpenFlow wire codec is an external collaborator (spec §1): everything here is already a
//! decoded Rust value, matching the teacher crate's (`little-dude-ofpkt`) `Repr` boundary, just
//! one layer up from the bytes it parses.

use crate::decision::DecisionTag;
use crate::error::Result;
use crate::flow::FlowRef;
use crate::oxm::{FieldId, FieldSet, FieldValue, FullFieldSet, PortNumber};
use std::collections::HashMap;
use std::collections::HashSet;
use std::rc::Rc;
use tracing::{debug, info, warn};

/// One compiled OpenFlow action (spec §4.3).
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    SetField(crate::oxm::Field),
    Output { port: PortNumber, max_len: u16 },
}

/// `CHECK_OVERLAP | SEND_FLOW_REM`, the fixed flag pair every installed flow-mod carries
/// (spec §4.3). No other flags are modelled; a bitflags dependency would be overkill for two
/// bits the teacher's stack has no existing vocabulary for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlowModFlags {
    pub check_overlap: bool,
    pub send_flow_rem: bool,
}

impl FlowModFlags {
    pub fn standard() -> Self {
        FlowModFlags { check_overlap: true, send_flow_rem: true }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowModCommand {
    Add,
    Delete,
    DeleteStrict,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlowMod {
    pub command: FlowModCommand,
    pub table_id: u8,
    pub priority: u16,
    pub cookie: u64,
    pub cookie_mask: u64,
    pub match_: FieldSet,
    pub idle_timeout: u16,
    pub hard_timeout: u16,
    pub flags: FlowModFlags,
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PacketOut {
    pub buffer_id: Option<u32>,
    pub in_port: u32,
    pub actions: Vec<Action>,
}

/// A switch connection, as handed to this crate by the (external) connection manager. The wire
/// representation of every message is this crate's boundary, not this trait's concern.
pub trait SwitchConnection {
    fn dpid(&self) -> u64;
    fn send_flow_mod(&self, fm: FlowMod);
    fn send_packet_out(&self, po: PacketOut);
    fn send_barrier_request(&self);
}

/// Cookie range reserved for synthetic miss-flows installed by [`MapleBackend::barrier_rule`]
/// (spec §4.4), distinct from the per-flow cookies C3 allocates.
pub const MISS_FLOW_COOKIE: u64 = u64::MAX;

pub trait Backend {
    /// Compile and install `flow`'s current decision for every switch the match applies to
    /// (spec §4.4, step 1 and 2).
    fn install(&mut self, priority: u16, match_: &FullFieldSet, flow: &FlowRef) -> Result<()>;

    /// Delete every flow-mod in `table_id` matching `match_`'s switch scope (or all switches if
    /// unscoped), using `DELETE`.
    fn remove_by_match(&mut self, table_id: u8, match_: &FullFieldSet);

    /// As [`Backend::remove_by_match`] but `DELETE_STRICT`, scoped additionally by `priority`.
    fn remove_exact(&mut self, table_id: u8, priority: u16, match_: &FullFieldSet);

    /// Delete by exact cookie, across every connected switch.
    fn remove_flow(&mut self, cookie: u64);

    /// Install (or, if unchanged, skip) a synthetic miss-flow identified by `id` (spec §4.4,
    /// open question: conservative "replace only on priority change" policy, see DESIGN.md).
    fn barrier_rule(&mut self, id: u64, priority: u16, match_: &FullFieldSet, table_id: u8);

    /// Broadcast a barrier request to every connected switch.
    fn barrier(&mut self);

    fn switch_up(&mut self, connection: Rc<dyn SwitchConnection>);
    fn switch_down(&mut self, dpid: u64);
    fn connection(&self, dpid: u64) -> Option<Rc<dyn SwitchConnection>>;
}

/// Computes the target dpid set for an install (spec §4.4 step 1, property P5): declared-or-all,
/// intersected with included switch-id tests (if any), minus excluded switch-id tests.
pub fn compute_switches(
    declared: &[u64],
    connected: &HashSet<u64>,
    match_: &FullFieldSet,
) -> Vec<u64> {
    let base: HashSet<u64> = if declared.is_empty() {
        connected.clone()
    } else {
        declared.iter().copied().collect()
    };

    let included: HashSet<u64> = match_
        .included(FieldId::SwitchId)
        .filter_map(|v| match v {
            FieldValue::U64(dpid) => Some(*dpid),
            _ => None,
        })
        .collect();

    let mut target: HashSet<u64> = if included.is_empty() {
        base
    } else {
        base.intersection(&included).copied().collect()
    };

    for v in match_.excluded(FieldId::SwitchId) {
        if let FieldValue::U64(dpid) = v {
            target.remove(dpid);
        }
    }

    let mut result: Vec<u64> = target.into_iter().collect();
    result.sort_unstable();
    result
}

struct MissRule {
    priority: u16,
}

/// The concrete [`Backend`] (spec §9: "this crate operates directly on the single concrete `Flow`
/// type via `Rc<RefCell<Flow>>`, since it hosts exactly one flow representation").
pub struct MapleBackend {
    connections: HashMap<u64, Rc<dyn SwitchConnection>>,
    miss_rules: HashMap<u64, MissRule>,
}

impl MapleBackend {
    pub fn new() -> Self {
        MapleBackend { connections: HashMap::new(), miss_rules: HashMap::new() }
    }

    fn connected_set(&self) -> HashSet<u64> {
        self.connections.keys().copied().collect()
    }
}

impl Default for MapleBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for MapleBackend {
    fn install(&mut self, priority: u16, match_: &FullFieldSet, flow: &FlowRef) -> Result<()> {
        let declared = flow.borrow().switches();
        let targets = compute_switches(&declared, &self.connected_set(), match_);
        if targets.is_empty() {
            debug!(cookie = flow.borrow().cookie(), "install has no target switches");
            return Ok(());
        }

        let mut stripped = match_.clone();
        stripped.strip(FieldId::SwitchId);

        for dpid in targets {
            let Some(connection) = self.connections.get(&dpid).cloned() else {
                warn!(dpid = format!("{dpid:016x}"), "install skipped, switch disconnected");
                continue;
            };
            flow.borrow_mut().install(priority, &stripped.fields, dpid, &*connection)?;
        }
        Ok(())
    }

    fn remove_by_match(&mut self, table_id: u8, match_: &FullFieldSet) {
        let dpids = switch_scope_or_all(match_, &self.connected_set());
        let mut stripped = match_.clone();
        stripped.strip(FieldId::SwitchId);
        for dpid in dpids {
            if let Some(conn) = self.connections.get(&dpid) {
                conn.send_flow_mod(FlowMod {
                    command: FlowModCommand::Delete,
                    table_id,
                    priority: 0,
                    cookie: 0,
                    cookie_mask: 0,
                    match_: stripped.fields.clone(),
                    idle_timeout: 0,
                    hard_timeout: 0,
                    flags: FlowModFlags::default(),
                    actions: Vec::new(),
                });
            }
        }
    }

    fn remove_exact(&mut self, table_id: u8, priority: u16, match_: &FullFieldSet) {
        let dpids = switch_scope_or_all(match_, &self.connected_set());
        let mut stripped = match_.clone();
        stripped.strip(FieldId::SwitchId);
        for dpid in dpids {
            if let Some(conn) = self.connections.get(&dpid) {
                conn.send_flow_mod(FlowMod {
                    command: FlowModCommand::DeleteStrict,
                    table_id,
                    priority,
                    cookie: 0,
                    cookie_mask: 0,
                    match_: stripped.fields.clone(),
                    idle_timeout: 0,
                    hard_timeout: 0,
                    flags: FlowModFlags::default(),
                    actions: Vec::new(),
                });
            }
        }
    }

    fn remove_flow(&mut self, cookie: u64) {
        for conn in self.connections.values() {
            conn.send_flow_mod(FlowMod {
                command: FlowModCommand::Delete,
                table_id: 0,
                priority: 0,
                cookie,
                cookie_mask: u64::MAX,
                match_: FieldSet::new(),
                idle_timeout: 0,
                hard_timeout: 0,
                flags: FlowModFlags::default(),
                actions: Vec::new(),
            });
        }
    }

    fn barrier_rule(&mut self, id: u64, priority: u16, match_: &FullFieldSet, table_id: u8) {
        if let Some(existing) = self.miss_rules.get(&id) {
            if existing.priority == priority {
                debug!(id, priority, "barrier_rule unchanged, skipping");
                return;
            }
        }
        let dpids = switch_scope_or_all(match_, &self.connected_set());
        let mut stripped = match_.clone();
        stripped.strip(FieldId::SwitchId);
        for dpid in dpids {
            if let Some(conn) = self.connections.get(&dpid) {
                conn.send_flow_mod(FlowMod {
                    command: FlowModCommand::Add,
                    table_id,
                    priority,
                    cookie: MISS_FLOW_COOKIE,
                    cookie_mask: u64::MAX,
                    match_: stripped.fields.clone(),
                    idle_timeout: 0,
                    hard_timeout: 0,
                    flags: FlowModFlags::standard(),
                    actions: vec![Action::Output { port: PortNumber::Controller, max_len: 128 }],
                });
            }
        }
        self.miss_rules.insert(id, MissRule { priority });
        info!(id, priority, "installed miss-flow");
    }

    fn barrier(&mut self) {
        for conn in self.connections.values() {
            conn.send_barrier_request();
        }
    }

    fn switch_up(&mut self, connection: Rc<dyn SwitchConnection>) {
        let dpid = connection.dpid();
        info!(dpid = format!("{dpid:016x}"), "switch up");
        self.connections.insert(dpid, connection);
    }

    fn switch_down(&mut self, dpid: u64) {
        info!(dpid = format!("{dpid:016x}"), "switch down");
        self.connections.remove(&dpid);
    }

    fn connection(&self, dpid: u64) -> Option<Rc<dyn SwitchConnection>> {
        self.connections.get(&dpid).cloned()
    }
}

fn switch_scope_or_all(match_: &FullFieldSet, connected: &HashSet<u64>) -> Vec<u64> {
    if let Some(crate::oxm::Field { value: FieldValue::U64(dpid), .. }) =
        match_.fields.get(FieldId::SwitchId)
    {
        vec![*dpid]
    } else {
        connected.iter().copied().collect()
    }
}

/// Dispatch a Decision's terminal tag into the action list it contributes (spec §4.3). Kept free
/// so [`crate::flow::compile`] can reuse it without an extra indirection layer.
pub(crate) fn decision_actions(tag: &DecisionTag, dpid: u64) -> Vec<Action> {
    match tag {
        DecisionTag::Undefined => Vec::new(),
        DecisionTag::Drop => Vec::new(),
        DecisionTag::Unicast { port } => vec![Action::Output { port: *port, max_len: 0 }],
        DecisionTag::Multicast { ports } => ports
            .iter()
            .map(|port| Action::Output { port: *port, max_len: 0 })
            .collect(),
        DecisionTag::Broadcast => vec![Action::Output { port: PortNumber::Flood, max_len: 0 }],
        DecisionTag::Inspect { send_bytes_len, .. } => {
            vec![Action::Output { port: PortNumber::Controller, max_len: *send_bytes_len }]
        }
        DecisionTag::Custom { body } => {
            let mut actions = Vec::new();
            body.apply(&mut actions, dpid);
            actions
        }
    }
}
