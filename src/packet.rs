//! Packet view (C1): a lazy, mutable view over a parsed packet, grounded on the `PacketProxy` /
//! `ModTrackingPacket` split in the original Maple source (`examples/original_source/src/Maple.cc`,
//! `struct ModTrackingPacket final : public PacketProxy`).
//!
//! Reads are traced so the trace-tree runtime (C5) can recover exactly the conjunction of tests a
//! policy handler performed: [`PacketView::read`] returns a [`Traced`] value whose `PartialEq`
//! impl records the compared-against value into the packet's trace log as a side effect of the
//! comparison itself — the Rust rendering of the operator-overload trick the original relies on
//! to observe predicate evaluation.

use crate::oxm::{Field, FieldId, FieldSet, FieldValue};
use std::cell::RefCell;

/// The underlying parsed packet: real header values plus the switch/port it arrived on.
#[derive(Debug, Clone)]
pub struct Packet {
    fields: FieldSet,
    dpid: u64,
    in_port: u32,
}

impl Packet {
    pub fn new(fields: FieldSet, dpid: u64, in_port: u32) -> Self {
        Packet { fields, dpid, in_port }
    }

    pub fn dpid(&self) -> u64 {
        self.dpid
    }

    pub fn in_port(&self) -> u32 {
        self.in_port
    }

    /// Plain, non-tracing accessor used by the runtime to replay an already-built trace tree.
    pub fn value(&self, id: FieldId) -> Option<FieldValue> {
        self.fields.get(id).map(|f| f.value)
    }

    fn apply(&mut self, field: Field) {
        self.fields.insert(field);
    }
}

/// A value borrowed from a [`PacketView::read`] call. Comparing it against a literal
/// [`FieldValue`] both yields the comparison result and records `(field, compared value)` into
/// the view's trace log.
pub struct Traced<'p> {
    id: FieldId,
    value: FieldValue,
    log: &'p RefCell<Vec<(FieldId, FieldValue)>>,
}

impl<'p> Traced<'p> {
    /// The field's actual current value, without recording a comparison.
    pub fn value(&self) -> FieldValue {
        self.value
    }
}

impl<'p> PartialEq<FieldValue> for Traced<'p> {
    fn eq(&self, other: &FieldValue) -> bool {
        self.log.borrow_mut().push((self.id, *other));
        self.value == *other
    }
}

/// Operations every packet-miss handler sees: read any field, apply a modification.
pub trait PacketView {
    fn read(&self, id: FieldId) -> Traced<'_>;
    fn modify(&mut self, field: Field);
}

/// The mod-tracking decorator applied while running policy handlers (spec §4.1): retains every
/// modification the policy wrote, in insertion order of distinct identifiers, so the backend can
/// emit set-field actions for exactly the fields the policy wrote — not the fields it merely
/// inspected — and logs every read for the trace-tree runtime.
pub struct ModTrackingPacket {
    packet: Packet,
    mods: FieldSet,
    log: RefCell<Vec<(FieldId, FieldValue)>>,
}

impl ModTrackingPacket {
    pub fn new(packet: Packet) -> Self {
        ModTrackingPacket { packet, mods: FieldSet::new(), log: RefCell::new(Vec::new()) }
    }

    pub fn dpid(&self) -> u64 {
        self.packet.dpid()
    }

    pub fn in_port(&self) -> u32 {
        self.packet.in_port()
    }

    /// Every modification applied during this execution, in insertion order (last write wins).
    pub fn mods(&self) -> &FieldSet {
        &self.mods
    }

    /// The sequence of (field, compared value) tests performed during this execution — the
    /// conjunction of tests that led to the resulting Decision.
    pub fn trace(&self) -> Vec<(FieldId, FieldValue)> {
        self.log.borrow().clone()
    }
}

impl PacketView for ModTrackingPacket {
    fn read(&self, id: FieldId) -> Traced<'_> {
        let value = self.packet.value(id).unwrap_or(FieldValue::U64(0));
        Traced { id, value, log: &self.log }
    }

    fn modify(&mut self, field: Field) {
        self.packet.apply(field.clone());
        self.mods.insert(field);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_packet() -> Packet {
        let mut fields = FieldSet::new();
        fields.insert(Field::new(FieldId::InPort, FieldValue::U32(3)));
        fields.insert(Field::new(FieldId::IpProto, FieldValue::U8(6)));
        Packet::new(fields, 1, 3)
    }

    #[test]
    fn comparison_records_tested_value_not_actual_value() {
        let pkt = ModTrackingPacket::new(sample_packet());
        assert!(pkt.read(FieldId::IpProto) == FieldValue::U8(6));
        assert!(!(pkt.read(FieldId::IpProto) == FieldValue::U8(17)));
        assert_eq!(
            pkt.trace(),
            vec![
                (FieldId::IpProto, FieldValue::U8(6)),
                (FieldId::IpProto, FieldValue::U8(17)),
            ]
        );
    }

    #[test]
    fn mods_accumulate_in_insertion_order_last_write_wins() {
        let mut pkt = ModTrackingPacket::new(sample_packet());
        pkt.modify(Field::new(FieldId::EthDst, FieldValue::U64(1)));
        pkt.modify(Field::new(FieldId::VlanId, FieldValue::U16(10)));
        pkt.modify(Field::new(FieldId::EthDst, FieldValue::U64(2)));

        let ids: Vec<_> = pkt.mods().iter().map(|f| f.id).collect();
        assert_eq!(ids, vec![FieldId::EthDst, FieldId::VlanId]);
        assert_eq!(pkt.mods().get(FieldId::EthDst).unwrap().value, FieldValue::U64(2));
    }
}
