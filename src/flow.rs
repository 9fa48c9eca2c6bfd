//! Flow object state machine (C3): the lifecycle of one installed equivalence class, plus the
//! per-switch context an installation needs (pending packet-in, connection handle). Grounded on
//! `FlowImpl` in `examples/original_source/src/Maple.cc` — the state dispatch in
//! `MapleImpl::processPacketIn` there maps directly onto the match in
//! [`crate::pipeline::PipelineDriver::on_packet_in`], and `FlowImpl::install`/`activate`/
//! `flow_removed` map onto the methods below.

use crate::backend::{self, Action, FlowMod, FlowModCommand, FlowModFlags, PacketOut, SwitchConnection};
use crate::decision::{Decision, DecisionTag};
use crate::error::{MapleError, Result};
use crate::oxm::FieldSet;
use crate::packet::PacketView;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use tracing::{debug, trace, warn};

/// Shared ownership of a [`Flow`] between the trace tree (as a leaf) and the pipeline driver's
/// cookie registry, with lifetime = longest holder (spec §5, §9).
pub type FlowRef = Rc<RefCell<Flow>>;

/// A closure produced by [`crate::runtime::TraceTree::augment`] that walks the tree and installs
/// every reachable `(priority, match)` pair for its flow (spec §4.5).
pub type Installer = Rc<dyn Fn(&FlowRef, &mut dyn backend::Backend) -> Result<()>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    /// Never activated.
    Egg,
    Active,
    /// Idle-timed-out; may be re-activated.
    Idle,
    /// Evicted by the controller or by an overlapping install; may be re-activated.
    Evicted,
    /// Hard-timed-out; terminal.
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowRemovedReason {
    IdleTimeout,
    HardTimeout,
    Delete,
    MeterDelete,
}

/// Per-switch installation context: the connection to send messages on, and the buffered
/// packet-in (if any) awaiting this flow's next install.
pub struct SwitchInfo {
    pub connection: Rc<dyn SwitchConnection>,
    pub buffer_id: Option<u32>,
    pub in_port: u32,
    pub xid: u32,
    pub packet_in_pending: bool,
}

pub struct Flow {
    cookie: u64,
    table_id: u8,
    decision: Decision,
    mods: FieldSet,
    installer: Option<Installer>,
    switches: HashMap<u64, SwitchInfo>,
    install_trigger: bool,
    state: FlowState,
}

impl Flow {
    pub fn new(cookie: u64, table_id: u8) -> Self {
        Flow {
            cookie,
            table_id,
            decision: Decision::new(),
            mods: FieldSet::new(),
            installer: None,
            switches: HashMap::new(),
            install_trigger: false,
            state: FlowState::Egg,
        }
    }

    pub fn cookie(&self) -> u64 {
        self.cookie
    }

    pub fn table_id(&self) -> u8 {
        self.table_id
    }

    pub fn state(&self) -> FlowState {
        self.state
    }

    pub fn decision(&self) -> &Decision {
        &self.decision
    }

    pub fn mods(&self) -> &FieldSet {
        &self.mods
    }

    pub fn installer(&self) -> Option<&Installer> {
        self.installer.as_ref()
    }

    /// The declared switch scope of this flow's decision (empty means "all connected"); used by
    /// [`crate::backend::compute_switches`] (spec §4.4 step 1).
    pub fn switches(&self) -> Vec<u64> {
        match self.decision.tag() {
            DecisionTag::Custom { body } => body.switches(),
            _ => Vec::new(),
        }
    }

    /// Assign the result of a trace-tree augmentation (spec §4.5). Disallowed while `Active`
    /// (invariant I2).
    pub fn set_installation(&mut self, decision: Decision, mods: FieldSet, installer: Installer) {
        debug_assert!(
            self.state != FlowState::Active,
            "mods/decision may only be assigned while not Active (I2)"
        );
        self.decision = decision;
        self.mods = mods;
        self.installer = Some(installer);
    }

    /// Refine the decision of an already-`Active` flow (spec §4.6 Inspect/refine arm). Unlike
    /// [`Flow::set_installation`], this is permitted while `Active`: only the decision changes,
    /// mods and the installer are left as they are.
    pub fn set_decision(&mut self, decision: Decision) {
        self.decision = decision;
    }

    /// Record a pending packet-in for `dpid`, creating the per-switch context if needed.
    pub fn record_packet_in(
        &mut self,
        connection: Rc<dyn SwitchConnection>,
        buffer_id: Option<u32>,
        in_port: u32,
        xid: u32,
    ) {
        let dpid = connection.dpid();
        self.switches.insert(
            dpid,
            SwitchInfo { connection, buffer_id, in_port, xid, packet_in_pending: true },
        );
    }

    /// Egg/Idle/Evicted → Active (or Evicted, if the current decision is disposable). Sets the
    /// install trigger so a subsequent [`Flow::install`] is permitted (spec §4.3, invariant I3:
    /// idempotent against repeated packet-ins).
    pub fn activate(&mut self) -> FlowState {
        debug_assert!(
            matches!(
                self.state,
                FlowState::Egg | FlowState::Idle | FlowState::Evicted | FlowState::Active
            ),
            "activate() called from a terminal (Expired) state"
        );
        self.install_trigger = true;
        self.state =
            if self.decision.disposable() { FlowState::Evicted } else { FlowState::Active };
        debug!(cookie = self.cookie, state = ?self.state, "flow activated");
        self.state
    }

    /// True while this flow's decision requests no installed rule (spec §3, §4.3).
    pub fn disposable(&self) -> bool {
        self.decision.disposable()
    }

    /// Dispatch to an `Inspect` decision's handler, if any; returns whether the packet was fully
    /// consumed (spec §4.6 step 3).
    pub fn preprocess(&self, pkt: &mut dyn PacketView) -> bool {
        if let DecisionTag::Inspect { handler, .. } = self.decision.tag() {
            handler(pkt)
        } else {
            false
        }
    }

    /// Write a flow-mod (or, if disposable, a packet-out against the buffered packet-in) for
    /// `dpid` (spec §4.3; requires `install_trigger`, set only by [`Flow::activate`]). Clears the
    /// per-switch pending packet-in afterwards either way (invariant I5).
    pub fn install(
        &mut self,
        priority: u16,
        match_: &FieldSet,
        dpid: u64,
        connection: &dyn SwitchConnection,
    ) -> Result<()> {
        debug_assert!(self.install_trigger, "install() called without a prior activate()");

        let actions = compile(&self.mods, &self.decision, dpid);

        if self.disposable() {
            if let Some(info) = self.switches.get(&dpid) {
                if info.packet_in_pending {
                    connection.send_packet_out(PacketOut {
                        buffer_id: info.buffer_id,
                        in_port: info.in_port,
                        actions,
                    });
                }
            }
        } else {
            connection.send_flow_mod(FlowMod {
                command: FlowModCommand::Add,
                table_id: self.table_id,
                priority,
                cookie: self.cookie,
                cookie_mask: u64::MAX,
                match_: match_.clone(),
                idle_timeout: self.decision.idle_timeout_seconds(),
                hard_timeout: self.decision.hard_timeout_seconds(),
                flags: FlowModFlags::standard(),
                actions,
            });
            trace!(cookie = self.cookie, dpid = format!("{dpid:016x}"), priority, "flow-mod sent");
        }

        if let Some(info) = self.switches.get_mut(&dpid) {
            info.packet_in_pending = false;
        }
        Ok(())
    }

    /// Apply a flow-removed notification (spec §4.3 transition table). Only meaningful while
    /// `Active`.
    pub fn flow_removed(&mut self, reason: FlowRemovedReason) -> FlowState {
        if self.state != FlowState::Active {
            warn!(cookie = self.cookie, state = ?self.state, "flow-removed while not Active, ignoring");
            return self.state;
        }
        self.state = match reason {
            FlowRemovedReason::IdleTimeout => FlowState::Idle,
            FlowRemovedReason::HardTimeout => FlowState::Expired,
            FlowRemovedReason::Delete | FlowRemovedReason::MeterDelete => FlowState::Evicted,
        };
        debug!(cookie = self.cookie, ?reason, state = ?self.state, "flow-removed applied");
        self.state
    }
}

/// Compile `mods` and `decision` into an action list for `dpid` (spec §4.3): one set-field action
/// per `mods` entry in insertion order, then the decision tag's terminal action(s).
pub fn compile(mods: &FieldSet, decision: &Decision, dpid: u64) -> Vec<Action> {
    let mut actions: Vec<Action> = mods.iter().cloned().map(Action::SetField).collect();
    if matches!(decision.tag(), DecisionTag::Undefined) {
        warn!("compiling an Undefined decision");
    }
    actions.extend(backend::decision_actions(decision.tag(), dpid));
    actions
}

/// `compile` against an `Undefined` decision is a fatal per-packet error at the point it would be
/// installed (spec §4.2); the pipeline driver checks this before calling `install`.
pub fn require_defined(decision: &Decision) -> Result<()> {
    if matches!(decision.tag(), DecisionTag::Undefined) {
        Err(MapleError::UnhandledPacket)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oxm::{Field, FieldId, FieldValue};
    use crate::port::PortNumber;
    use std::time::Duration;

    struct MockConnection {
        dpid: u64,
        flow_mods: RefCell<Vec<FlowMod>>,
        packet_outs: RefCell<Vec<PacketOut>>,
    }

    impl MockConnection {
        fn new(dpid: u64) -> Self {
            MockConnection { dpid, flow_mods: RefCell::new(Vec::new()), packet_outs: RefCell::new(Vec::new()) }
        }
    }

    impl SwitchConnection for MockConnection {
        fn dpid(&self) -> u64 {
            self.dpid
        }
        fn send_flow_mod(&self, fm: FlowMod) {
            self.flow_mods.borrow_mut().push(fm);
        }
        fn send_packet_out(&self, po: PacketOut) {
            self.packet_outs.borrow_mut().push(po);
        }
        fn send_barrier_request(&self) {}
    }

    #[test]
    fn activate_from_egg_goes_active_when_not_disposable() {
        let mut flow = Flow::new(1, 0);
        flow.set_installation(
            Decision::new().drop().idle_timeout(Duration::from_secs(30)),
            FieldSet::new(),
            Rc::new(|_: &FlowRef, _: &mut dyn backend::Backend| Ok(())),
        );
        assert_eq!(flow.activate(), FlowState::Active);
    }

    #[test]
    fn activate_from_egg_goes_evicted_when_disposable() {
        let mut flow = Flow::new(2, 0);
        flow.set_installation(
            Decision::new().drop().idle_timeout(Duration::ZERO),
            FieldSet::new(),
            Rc::new(|_: &FlowRef, _: &mut dyn backend::Backend| Ok(())),
        );
        assert_eq!(flow.activate(), FlowState::Evicted);
    }

    #[test]
    fn install_emits_flow_mod_with_clamped_timeouts_and_clears_pending() {
        let mut flow = Flow::new(42, 3);
        flow.set_installation(
            Decision::new()
                .unicast(PortNumber::Regular(5))
                .idle_timeout(Duration::from_secs(30))
                .hard_timeout(Duration::ZERO),
            FieldSet::new(),
            Rc::new(|_: &FlowRef, _: &mut dyn backend::Backend| Ok(())),
        );
        flow.activate();

        let conn = Rc::new(MockConnection::new(1));
        flow.record_packet_in(conn.clone(), Some(7), 3, 99);

        let mut match_ = FieldSet::new();
        match_.insert(Field::new(FieldId::EthDst, FieldValue::U64(1)));
        flow.install(100, &match_, 1, &*conn).unwrap();

        let mods = conn.flow_mods.borrow();
        assert_eq!(mods.len(), 1);
        assert_eq!(mods[0].cookie, 42);
        assert_eq!(mods[0].idle_timeout, 30);
        assert_eq!(mods[0].hard_timeout, 0);
        assert!(!flow.switches.get(&1).unwrap().packet_in_pending);
    }

    #[test]
    fn disposable_install_emits_packet_out_not_flow_mod() {
        let mut flow = Flow::new(7, 0);
        flow.set_installation(
            Decision::new().drop().idle_timeout(Duration::ZERO),
            FieldSet::new(),
            Rc::new(|_: &FlowRef, _: &mut dyn backend::Backend| Ok(())),
        );
        flow.activate();

        let conn = Rc::new(MockConnection::new(1));
        flow.record_packet_in(conn.clone(), Some(7), 3, 1);
        flow.install(0, &FieldSet::new(), 1, &*conn).unwrap();

        assert!(conn.flow_mods.borrow().is_empty());
        assert_eq!(conn.packet_outs.borrow().len(), 1);
        assert_eq!(conn.packet_outs.borrow()[0].buffer_id, Some(7));
    }

    #[test]
    fn flow_removed_idle_timeout_returns_to_idle() {
        let mut flow = Flow::new(1, 0);
        flow.set_installation(
            Decision::new().drop().idle_timeout(Duration::from_secs(10)),
            FieldSet::new(),
            Rc::new(|_: &FlowRef, _: &mut dyn backend::Backend| Ok(())),
        );
        flow.activate();
        assert_eq!(flow.flow_removed(FlowRemovedReason::IdleTimeout), FlowState::Idle);
    }

    #[test]
    fn flow_removed_hard_timeout_is_terminal() {
        let mut flow = Flow::new(1, 0);
        flow.set_installation(
            Decision::new().drop().idle_timeout(Duration::from_secs(10)),
            FieldSet::new(),
            Rc::new(|_: &FlowRef, _: &mut dyn backend::Backend| Ok(())),
        );
        flow.activate();
        assert_eq!(flow.flow_removed(FlowRemovedReason::HardTimeout), FlowState::Expired);
    }

    #[test]
    fn require_defined_rejects_undefined_decision() {
        assert!(require_defined(&Decision::new()).is_err());
        assert!(require_defined(&Decision::new().drop()).is_ok());
    }

    #[test]
    fn reactivating_from_active_does_not_panic() {
        let mut flow = Flow::new(1, 0);
        flow.set_installation(
            Decision::new().drop().idle_timeout(Duration::from_secs(10)),
            FieldSet::new(),
            Rc::new(|_: &FlowRef, _: &mut dyn backend::Backend| Ok(())),
        );
        assert_eq!(flow.activate(), FlowState::Active);
        assert_eq!(flow.activate(), FlowState::Active);
    }

    #[test]
    fn set_decision_refines_while_active_without_touching_mods_or_installer() {
        let mut flow = Flow::new(1, 0);
        flow.set_installation(
            Decision::new().drop().idle_timeout(Duration::from_secs(10)),
            FieldSet::new(),
            Rc::new(|_: &FlowRef, _: &mut dyn backend::Backend| Ok(())),
        );
        flow.activate();

        flow.set_decision(Decision::new().unicast(PortNumber::Regular(5)).idle_timeout(Duration::from_secs(10)));

        assert_eq!(flow.state(), FlowState::Active);
        assert!(matches!(flow.decision().tag(), DecisionTag::Unicast { .. }));
    }
}
