//! Pipeline driver (C6): runs the ordered chain of packet-miss handlers, owns the Flow registry,
//! and dispatches packet-in / flow-removed events. Grounded on `MapleImpl::process` /
//! `processPacketIn` / `processFlowRemoved` in `examples/original_source/src/Maple.cc`; the
//! state-based dispatch in [`PipelineDriver::on_packet_in`] mirrors that function's `switch` over
//! `Flow::State` almost one to one.

use crate::backend::Backend;
use crate::config::MapleConfig;
use crate::decision::Decision;
use crate::error::{HandlerError, MapleError, Result};
use crate::flow::{self, Flow, FlowRef, FlowRemovedReason, FlowState};
use crate::packet::{ModTrackingPacket, Packet, PacketView};
use crate::runtime::{CookieAllocator, TraceTree};
use std::collections::HashMap;
use std::rc::Rc;
use tracing::{debug, error, info, warn};

/// A named packet-miss handler: given the view, the flow under construction, and the decision
/// accumulated so far, return the (possibly refined) decision (spec §4.2, §4.6).
pub type Handler = Rc<dyn Fn(&mut dyn PacketView, &FlowRef, Decision) -> Result<Decision>>;

/// Distinguishes a genuine table-miss packet-in from one the controller caused itself (e.g. an
/// `Inspect` action), per spec §4.6 step 5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketInReason {
    NoMatch,
    Action,
}

/// A packet-in event, already parsed into a [`Packet`] by the (external) wire codec.
pub struct PacketIn {
    pub packet: Packet,
    pub reason: PacketInReason,
    pub cookie: Option<u64>,
    pub buffer_id: Option<u32>,
    pub xid: u32,
}

pub struct FlowRemoved {
    pub cookie: u64,
    pub reason: FlowRemovedReason,
}

/// Run an ordered slice of handlers against `view`, stopping early on `return_` (spec §4.6). Free
/// function so it can run both from [`PipelineDriver::process`] and from inside a trace-tree
/// augmentation closure, without either call site needing a second mutable borrow of `self`.
fn run_handlers(
    ordered: &[(String, Handler)],
    view: &mut dyn PacketView,
    flow: &FlowRef,
) -> Result<Decision> {
    let mut decision = Decision::new();
    for (name, handler) in ordered {
        decision = handler(view, flow, decision).map_err(|err| {
            error!(handler = %name, error = %err, "handler failed");
            MapleError::HandlerFailure { handler: name.clone(), source: HandlerError::new(err) }
        })?;
        if decision.is_return() {
            debug!(handler = %name, "handler returned, stopping pipeline");
            break;
        }
    }
    Ok(decision)
}

pub struct PipelineDriver {
    handlers: Vec<(String, Handler)>,
    pipeline: Vec<usize>,
    flows: HashMap<u64, FlowRef>,
    runtime: TraceTree,
    cookies: CookieAllocator,
    table_id: u8,
    started: bool,
}

impl PipelineDriver {
    pub fn new(table_id: u8) -> Self {
        PipelineDriver {
            handlers: Vec::new(),
            pipeline: Vec::new(),
            flows: HashMap::new(),
            runtime: TraceTree::new(),
            cookies: CookieAllocator::new(1),
            table_id,
            started: false,
        }
    }

    /// Append a handler before startup; rejected (logged, ignored) after (spec §4.6).
    pub fn register_handler(&mut self, name: impl Into<String>, handler: Handler) {
        let name = name.into();
        if self.started {
            warn!(handler = %name, "handler registered after startup, ignored");
            return;
        }
        self.handlers.push((name, handler));
    }

    /// Apply the configured pipeline order, warning (not failing) on unknown or duplicate
    /// handler names (spec §4.9), and mark the driver started.
    pub fn configure(&mut self, config: &MapleConfig) {
        let mut seen = std::collections::HashSet::new();
        let mut order = Vec::new();
        for name in &config.pipeline {
            if !seen.insert(name.clone()) {
                warn!(handler = %name, "duplicate handler in pipeline configuration");
                continue;
            }
            match self.handlers.iter().position(|(n, _)| n == name) {
                Some(idx) => order.push(idx),
                None => warn!(handler = %name, "unknown handler name in pipeline configuration"),
            }
        }
        self.pipeline = order;
        self.started = true;
        info!(handlers = self.pipeline.len(), "pipeline driver started");
    }

    fn ordered_handlers(&self) -> Vec<(String, Handler)> {
        self.pipeline.iter().map(|&idx| self.handlers[idx].clone()).collect()
    }

    /// Sequentially invoke each configured handler; stop early if one sets `return_` (spec
    /// §4.6).
    pub fn process(&self, pkt: &mut dyn PacketView, flow: &FlowRef) -> Result<Decision> {
        run_handlers(&self.ordered_handlers(), pkt, flow)
    }

    fn new_flow(&mut self) -> FlowRef {
        let cookie = self.cookies.allocate();
        Rc::new(std::cell::RefCell::new(Flow::new(cookie, self.table_id)))
    }

    /// Handle a packet-in: locate or create the Flow, dispatch by state, and install as needed
    /// (spec §4.6 step 2-5).
    pub fn on_packet_in(
        &mut self,
        pi: PacketIn,
        connection: Rc<dyn crate::backend::SwitchConnection>,
        backend: &mut dyn Backend,
    ) -> Result<()> {
        let packet = pi.packet;
        let existing = self.runtime.run(&packet);
        let flow = match existing {
            Some(flow) if flow.borrow().state() != FlowState::Expired => flow,
            _ => {
                let flow = self.new_flow();
                self.flows.insert(flow.borrow().cookie(), flow.clone());
                flow
            }
        };

        // Inspect handlers see every packet-in, even before a genuine augmentation. The mods this
        // probe view records are discarded; a real augmentation below builds its own trace.
        let mut probe = ModTrackingPacket::new(packet.clone());
        if flow.borrow().preprocess(&mut probe) {
            debug!(cookie = flow.borrow().cookie(), "packet fully consumed by inspect handler");
            return Ok(());
        }

        flow.borrow_mut().record_packet_in(connection, pi.buffer_id, packet.in_port(), pi.xid);

        let state = flow.borrow().state();
        match state {
            FlowState::Egg | FlowState::Idle | FlowState::Evicted => {
                self.augment_and_activate(packet, &flow, backend)?;
            }
            FlowState::Active => {
                let is_table_miss =
                    matches!(pi.reason, PacketInReason::NoMatch) || pi.cookie == Some(flow.borrow().cookie());
                if is_table_miss {
                    flow.borrow_mut().activate();
                    let installer = flow.borrow().installer().cloned();
                    if let Some(installer) = installer {
                        installer(&flow, backend)?;
                    }
                } else {
                    let mut view = ModTrackingPacket::new(packet);
                    let decision = self.process(&mut view, &flow)?;
                    flow::require_defined(&decision)?;
                    let installer = flow.borrow().installer().cloned();
                    if let Some(installer) = installer {
                        flow.borrow_mut().set_decision(decision);
                        installer(&flow, backend)?;
                    }
                }
            }
            FlowState::Expired => {
                unreachable!("Expired flows are never returned by run() or left in the registry")
            }
        }
        Ok(())
    }

    fn augment_and_activate(
        &mut self,
        packet: Packet,
        flow: &FlowRef,
        backend: &mut dyn Backend,
    ) -> Result<()> {
        let ordered = self.ordered_handlers();
        let flow_for_closure = flow.clone();
        let attempt = self.runtime.augment(packet.clone(), flow.clone(), move |view| {
            run_handlers(&ordered, view, &flow_for_closure)
        });

        let (decision, mods, installer) = match attempt {
            Ok(v) => v,
            Err(MapleError::PriorityExceeded) => {
                warn!("priority exceeded, recomputing trace tree and retrying once");
                self.runtime.update();
                let ordered = self.ordered_handlers();
                let flow_for_closure = flow.clone();
                self.runtime.augment(packet, flow.clone(), move |view| {
                    run_handlers(&ordered, view, &flow_for_closure)
                })?
            }
            Err(other) => return Err(other),
        };

        flow::require_defined(&decision)?;
        flow.borrow_mut().set_installation(decision, mods, installer.clone());
        flow.borrow_mut().activate();
        installer(flow, backend)
    }

    /// Apply a flow-removed notification to the registered flow, dropping it from the registry
    /// once `Expired` (spec §4.6 step, invariant I4).
    pub fn on_flow_removed(&mut self, fr: FlowRemoved) {
        let Some(flow) = self.flows.get(&fr.cookie).cloned() else {
            warn!(cookie = fr.cookie, "flow-removed for unknown cookie");
            return;
        };
        let state = flow.borrow_mut().flow_removed(fr.reason);
        if state == FlowState::Expired {
            self.flows.remove(&fr.cookie);
            debug!(cookie = fr.cookie, "flow expired, removed from registry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{FlowMod, PacketOut, SwitchConnection};
    use crate::oxm::{Field, FieldId, FieldSet, FieldValue};
    use crate::port::PortNumber;
    use std::cell::RefCell;
    use std::time::Duration;

    struct MockBackend {
        installs: RefCell<Vec<(u16, u64)>>,
    }

    impl Backend for MockBackend {
        fn install(&mut self, priority: u16, _m: &crate::oxm::FullFieldSet, flow: &FlowRef) -> Result<()> {
            self.installs.borrow_mut().push((priority, flow.borrow().cookie()));
            Ok(())
        }
        fn remove_by_match(&mut self, _t: u8, _m: &crate::oxm::FullFieldSet) {}
        fn remove_exact(&mut self, _t: u8, _p: u16, _m: &crate::oxm::FullFieldSet) {}
        fn remove_flow(&mut self, _cookie: u64) {}
        fn barrier_rule(&mut self, _id: u64, _p: u16, _m: &crate::oxm::FullFieldSet, _t: u8) {}
        fn barrier(&mut self) {}
        fn switch_up(&mut self, _c: Rc<dyn SwitchConnection>) {}
        fn switch_down(&mut self, _dpid: u64) {}
        fn connection(&self, _dpid: u64) -> Option<Rc<dyn SwitchConnection>> {
            None
        }
    }

    struct MockConnection(u64);
    impl SwitchConnection for MockConnection {
        fn dpid(&self) -> u64 {
            self.0
        }
        fn send_flow_mod(&self, _fm: FlowMod) {}
        fn send_packet_out(&self, _po: PacketOut) {}
        fn send_barrier_request(&self) {}
    }

    fn unicast_on_ip_proto_6(
        pkt: &mut dyn PacketView,
        _flow: &FlowRef,
        decision: Decision,
    ) -> Result<Decision> {
        if pkt.read(FieldId::IpProto) == FieldValue::U8(6) {
            Ok(decision.unicast(PortNumber::Regular(5)).idle_timeout(Duration::from_secs(30)))
        } else {
            Ok(decision.drop())
        }
    }

    fn sample_packet(dpid: u64, in_port: u32, ip_proto: u8) -> Packet {
        let mut fields = FieldSet::new();
        fields.insert(Field::new(FieldId::IpProto, FieldValue::U8(ip_proto)));
        Packet::new(fields, dpid, in_port)
    }

    #[test]
    fn egg_flow_augments_and_activates() {
        let mut driver = PipelineDriver::new(0);
        driver.register_handler("unicast", Rc::new(unicast_on_ip_proto_6));
        driver.configure(&MapleConfig { pipeline: vec!["unicast".into()] });

        let mut backend = MockBackend { installs: RefCell::new(Vec::new()) };
        let pi = PacketIn {
            packet: sample_packet(1, 3, 6),
            reason: PacketInReason::NoMatch,
            cookie: None,
            buffer_id: Some(7),
            xid: 1,
        };
        driver.on_packet_in(pi, Rc::new(MockConnection(1)), &mut backend).unwrap();

        assert_eq!(backend.installs.borrow().len(), 1);
        assert_eq!(driver.flows.len(), 1);
    }

    #[test]
    fn unknown_handler_name_in_config_is_warned_not_fatal() {
        let mut driver = PipelineDriver::new(0);
        driver.register_handler("known", Rc::new(unicast_on_ip_proto_6));
        driver.configure(&MapleConfig { pipeline: vec!["known".into(), "typo'd".into()] });
        assert_eq!(driver.pipeline.len(), 1);
    }

    #[test]
    fn registering_after_startup_is_ignored() {
        let mut driver = PipelineDriver::new(0);
        driver.configure(&MapleConfig { pipeline: vec![] });
        driver.register_handler("late", Rc::new(unicast_on_ip_proto_6));
        assert!(driver.handlers.is_empty());
    }

    #[test]
    fn flow_removed_for_unknown_cookie_is_ignored() {
        let mut driver = PipelineDriver::new(0);
        driver.on_flow_removed(FlowRemoved { cookie: 999, reason: FlowRemovedReason::IdleTimeout });
    }
}
