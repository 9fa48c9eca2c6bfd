//! OpenFlow port numbers.
//!
//! Grounded on the teacher crate's own `port.rs`: the reserved pseudo-ports below are carried
//! over almost verbatim, since the reactive engine needs to recognise `Flood`, `Controller`, and
//! `Any` when compiling actions and matches (see [`crate::flow`] and [`crate::backend`]).

/// OpenFlow port numbers: either a reserved pseudo-port or a regular, switch-assigned port.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, PartialOrd, Ord)]
pub enum PortNumber {
    /// Maximum number of physical and logical switch ports.
    Max,
    /// Output port not set in action-set.
    Unset,
    /// Send the packet out the input port.
    InPort,
    /// Submit the packet to the first flow table. Packet-out only.
    Table,
    /// Forward using non-OpenFlow pipeline.
    Normal,
    /// Flood using non-OpenFlow pipeline.
    Flood,
    /// Flood through all standard ports except the input port.
    All,
    /// Send to the controller.
    Controller,
    /// Local OpenFlow "port".
    Local,
    /// Wildcard used in requests when no port is specified.
    Any,
    /// A regular, numbered port.
    Regular(u32),
}

impl From<u32> for PortNumber {
    fn from(value: u32) -> Self {
        match value {
            0xffff_ff00 => PortNumber::Max,
            0xffff_fff7 => PortNumber::Unset,
            0xffff_fff8 => PortNumber::InPort,
            0xffff_fff9 => PortNumber::Table,
            0xffff_fffa => PortNumber::Normal,
            0xffff_fffb => PortNumber::Flood,
            0xffff_fffc => PortNumber::All,
            0xffff_fffd => PortNumber::Controller,
            0xffff_fffe => PortNumber::Local,
            0xffff_ffff => PortNumber::Any,
            other => PortNumber::Regular(other),
        }
    }
}

impl From<PortNumber> for u32 {
    fn from(value: PortNumber) -> Self {
        match value {
            PortNumber::Max => 0xffff_ff00,
            PortNumber::Unset => 0xffff_fff7,
            PortNumber::InPort => 0xffff_fff8,
            PortNumber::Table => 0xffff_fff9,
            PortNumber::Normal => 0xffff_fffa,
            PortNumber::Flood => 0xffff_fffb,
            PortNumber::All => 0xffff_fffc,
            PortNumber::Controller => 0xffff_fffd,
            PortNumber::Local => 0xffff_fffe,
            PortNumber::Any => 0xffff_ffff,
            PortNumber::Regular(other) => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_reserved_ports() {
        for port in [
            PortNumber::Max,
            PortNumber::Flood,
            PortNumber::Controller,
            PortNumber::Any,
            PortNumber::Regular(5),
        ] {
            assert_eq!(PortNumber::from(u32::from(port)), port);
        }
    }
}
