//! Decision value (C2): a builder-style, immutable-per-step value describing what to do with a
//! packet class. Grounded on the `Decision`/`DecisionImpl` split and the `boost::variant`-based
//! `DecisionCompiler` visitor in `examples/original_source/src/Maple.cc`; the variant dispatch is
//! expressed here as an ordinary Rust `enum` and `match` rather than a visitor object (spec §9,
//! "Visitor over decision variants").

use crate::oxm::PortNumber;
use crate::packet::PacketView;
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

/// Contract for a `Custom` decision's opaque policy body (spec §3, §9).
pub trait CustomDecision: fmt::Debug {
    /// Append whatever actions this decision contributes, for the given switch.
    fn apply(&self, actions: &mut Vec<crate::backend::Action>, dpid: u64);

    /// The switches this decision is scoped to; empty means "all connected switches".
    fn switches(&self) -> Vec<u64>;
}

/// A handler invoked per-packet for an `Inspect` decision. Returns whether it fully consumed the
/// packet (in which case the pipeline driver stops processing it further).
pub type InspectHandler = Rc<dyn Fn(&mut dyn PacketView) -> bool>;

#[derive(Clone)]
pub enum DecisionTag {
    /// No handler produced a terminal decision; fails the packet.
    Undefined,
    Drop,
    Unicast { port: PortNumber },
    Multicast { ports: Vec<PortNumber> },
    /// Send to the flood pseudo-port.
    Broadcast,
    Inspect { send_bytes_len: u16, handler: InspectHandler },
    Custom { body: Rc<dyn CustomDecision> },
}

impl fmt::Debug for DecisionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecisionTag::Undefined => write!(f, "Undefined"),
            DecisionTag::Drop => write!(f, "Drop"),
            DecisionTag::Unicast { port } => f.debug_struct("Unicast").field("port", port).finish(),
            DecisionTag::Multicast { ports } => {
                f.debug_struct("Multicast").field("ports", ports).finish()
            }
            DecisionTag::Broadcast => write!(f, "Broadcast"),
            DecisionTag::Inspect { send_bytes_len, .. } => f
                .debug_struct("Inspect")
                .field("send_bytes_len", send_bytes_len)
                .finish(),
            DecisionTag::Custom { body } => f.debug_struct("Custom").field("body", body).finish(),
        }
    }
}

/// A policy decision, built up incrementally across the handler pipeline (spec §4.2).
#[derive(Clone, Debug)]
pub struct Decision {
    tag: DecisionTag,
    idle_timeout: Duration,
    hard_timeout: Duration,
    return_: bool,
}

impl Default for Decision {
    fn default() -> Self {
        Decision {
            tag: DecisionTag::Undefined,
            idle_timeout: Duration::MAX,
            hard_timeout: Duration::MAX,
            return_: false,
        }
    }
}

impl Decision {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tag(&self) -> &DecisionTag {
        &self.tag
    }

    pub fn drop(mut self) -> Self {
        self.tag = DecisionTag::Drop;
        self
    }

    pub fn unicast(mut self, port: PortNumber) -> Self {
        self.tag = DecisionTag::Unicast { port };
        self
    }

    pub fn multicast(mut self, ports: Vec<PortNumber>) -> Self {
        self.tag = DecisionTag::Multicast { ports };
        self
    }

    pub fn broadcast(mut self) -> Self {
        self.tag = DecisionTag::Broadcast;
        self
    }

    pub fn inspect(mut self, send_bytes_len: u16, handler: InspectHandler) -> Self {
        self.tag = DecisionTag::Inspect { send_bytes_len, handler };
        self
    }

    pub fn custom(mut self, body: Rc<dyn CustomDecision>) -> Self {
        self.tag = DecisionTag::Custom { body };
        self
    }

    pub fn idle_timeout(mut self, d: Duration) -> Self {
        self.idle_timeout = d;
        self
    }

    pub fn hard_timeout(mut self, d: Duration) -> Self {
        self.hard_timeout = d;
        self
    }

    pub fn return_(mut self) -> Self {
        self.return_ = true;
        self
    }

    pub fn is_return(&self) -> bool {
        self.return_
    }

    /// A Decision whose idle timeout is zero is realised as a one-shot packet-out rather than an
    /// installed flow entry (spec §3).
    pub fn disposable(&self) -> bool {
        self.idle_timeout.is_zero()
    }

    /// Idle timeout clamped to the OpenFlow wire range, with `Duration::MAX` (infinite) mapping
    /// to 0 ("no timeout") as specified in §4.3.
    pub fn idle_timeout_seconds(&self) -> u16 {
        clamp_timeout(self.idle_timeout)
    }

    pub fn hard_timeout_seconds(&self) -> u16 {
        clamp_timeout(self.hard_timeout)
    }
}

fn clamp_timeout(d: Duration) -> u16 {
    if d == Duration::MAX {
        0
    } else {
        d.as_secs().min(65535) as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_idle_timeout_is_disposable() {
        let d = Decision::new().drop().idle_timeout(Duration::ZERO);
        assert!(d.disposable());
        assert_eq!(d.idle_timeout_seconds(), 0);
    }

    #[test]
    fn infinite_timeout_maps_to_wire_zero_but_is_not_disposable() {
        let d = Decision::new().drop().idle_timeout(Duration::MAX);
        assert!(!d.disposable());
        assert_eq!(d.idle_timeout_seconds(), 0);
    }

    #[test]
    fn finite_timeout_clamps_to_u16_range() {
        let d = Decision::new().drop().hard_timeout(Duration::from_secs(100_000));
        assert_eq!(d.hard_timeout_seconds(), 65535);
    }
}
