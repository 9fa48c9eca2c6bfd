//! OpenFlow eXtensible Match (OXM) field model.
//!
//! The teacher crate's `oxm` module parses and emits OXM TLVs byte-for-byte; that wire-level
//! concern belongs to the (external, out of scope) OpenFlow codec. What survives here is its
//! domain vocabulary: a field identifies one header slot ([`FieldId`]), a field carries a typed
//! value and an optional mask ([`Field`]), and flow matches are built up as sets of fields
//! ([`FieldSet`], [`FullFieldSet`]) — directly grounded on `oxm::field_set`/
//! `oxm::expirementer::full_field_set` in the original Maple source (see
//! `examples/original_source/src/Maple.cc`), and on the field catalogue in the teacher's
//! `oxm::FlowMatchField`.

use smoltcp::wire::{EthernetAddress, Ipv4Address};
use std::collections::HashMap;

pub use crate::port::PortNumber;

/// Identifies one packet header slot, or a pipeline-only pseudo-field such as the switch id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FieldId {
    /// Ingress port (pipeline field, not present in the wire packet).
    InPort,
    /// Datapath id of the switch that received the packet (pipeline field).
    SwitchId,
    EthSrc,
    EthDst,
    EthType,
    VlanId,
    IpProto,
    Ipv4Src,
    Ipv4Dst,
    TcpSrc,
    TcpDst,
    UdpSrc,
    UdpDst,
}

/// A typed header value. Each [`FieldId`] has a natural representation; `Mac`/`Ipv4` reuse the
/// teacher's `smoltcp` dependency instead of degrading every field to a bare integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldValue {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    Mac(EthernetAddress),
    Ipv4(Ipv4Address),
}

impl FieldValue {
    fn matches(&self, test: &FieldValue, mask: Option<&FieldValue>) -> bool {
        match (self, mask) {
            (_, None) => self == test,
            (FieldValue::U8(v), Some(FieldValue::U8(m))) => {
                if let FieldValue::U8(t) = test { v & m == t & m } else { false }
            }
            (FieldValue::U16(v), Some(FieldValue::U16(m))) => {
                if let FieldValue::U16(t) = test { v & m == t & m } else { false }
            }
            (FieldValue::U32(v), Some(FieldValue::U32(m))) => {
                if let FieldValue::U32(t) = test { v & m == t & m } else { false }
            }
            (FieldValue::U64(v), Some(FieldValue::U64(m))) => {
                if let FieldValue::U64(t) = test { v & m == t & m } else { false }
            }
            (FieldValue::Mac(v), Some(FieldValue::Mac(m))) => {
                if let FieldValue::Mac(t) = test {
                    v.as_bytes()
                        .iter()
                        .zip(m.as_bytes())
                        .zip(t.as_bytes())
                        .all(|((a, mb), b)| a & mb == b & mb)
                } else {
                    false
                }
            }
            (FieldValue::Ipv4(v), Some(FieldValue::Ipv4(m))) => {
                if let FieldValue::Ipv4(t) = test {
                    v.as_bytes()
                        .iter()
                        .zip(m.as_bytes())
                        .zip(t.as_bytes())
                        .all(|((a, mb), b)| a & mb == b & mb)
                } else {
                    false
                }
            }
            _ => self == test,
        }
    }
}

/// One masked test/value for a single [`FieldId`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub id: FieldId,
    pub value: FieldValue,
    pub mask: Option<FieldValue>,
}

impl Field {
    pub fn new(id: FieldId, value: FieldValue) -> Self {
        Field { id, value, mask: None }
    }

    pub fn masked(id: FieldId, value: FieldValue, mask: FieldValue) -> Self {
        Field { id, value, mask: Some(mask) }
    }

    /// Does `value` satisfy this field's test (value + optional mask)?
    pub fn test(&self, value: &FieldValue) -> bool {
        self.value.matches(value, self.mask.as_ref())
    }
}

/// A mapping from field identifier to (value, mask) with a unique entry per identifier, in
/// insertion order of distinct identifiers — last write wins per identifier (spec §3).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldSet {
    order: Vec<FieldId>,
    fields: HashMap<FieldId, Field>,
}

impl FieldSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Insert or overwrite the entry for `field.id`. The position in insertion order is
    /// preserved across overwrites (last write wins, first position sticks).
    pub fn insert(&mut self, field: Field) {
        if !self.fields.contains_key(&field.id) {
            self.order.push(field.id);
        }
        self.fields.insert(field.id, field);
    }

    pub fn get(&self, id: FieldId) -> Option<&Field> {
        self.fields.get(&id)
    }

    pub fn remove(&mut self, id: FieldId) -> Option<Field> {
        if let Some(field) = self.fields.remove(&id) {
            self.order.retain(|existing| *existing != id);
            Some(field)
        } else {
            None
        }
    }

    /// Iterate fields in insertion order of their (first) distinct identifier.
    pub fn iter(&self) -> impl Iterator<Item = &Field> {
        self.order.iter().map(move |id| &self.fields[id])
    }
}

/// Extends a [`FieldSet`] with *included* and *excluded* multisets, used to express predicates
/// like "matches on switch X and Y but not Z" (spec §3). Grounded on
/// `oxm::expirementer::full_field_set` in the original source.
#[derive(Debug, Clone, Default)]
pub struct FullFieldSet {
    pub fields: FieldSet,
    included: Vec<(FieldId, FieldValue)>,
    excluded: Vec<(FieldId, FieldValue)>,
}

impl FullFieldSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fields(fields: FieldSet) -> Self {
        FullFieldSet { fields, included: Vec::new(), excluded: Vec::new() }
    }

    pub fn include(&mut self, id: FieldId, value: FieldValue) {
        self.included.push((id, value));
    }

    pub fn exclude(&mut self, id: FieldId, value: FieldValue) {
        self.excluded.push((id, value));
    }

    pub fn included(&self, id: FieldId) -> impl Iterator<Item = &FieldValue> {
        self.included.iter().filter(move |(i, _)| *i == id).map(|(_, v)| v)
    }

    pub fn excluded(&self, id: FieldId) -> impl Iterator<Item = &FieldValue> {
        self.excluded.iter().filter(move |(i, _)| *i == id).map(|(_, v)| v)
    }

    pub fn has_included(&self, id: FieldId) -> bool {
        self.included.iter().any(|(i, _)| *i == id)
    }

    /// Strip every test on `id` from the plain fields and the included/excluded multisets.
    /// Used by the backend to remove switch-id tests before emitting a match to a switch
    /// (spec §4.4).
    pub fn strip(&mut self, id: FieldId) {
        self.fields.remove(id);
        self.included.retain(|(i, _)| *i != id);
        self.excluded.retain(|(i, _)| *i != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_set_preserves_first_insertion_position_on_overwrite() {
        let mut fs = FieldSet::new();
        fs.insert(Field::new(FieldId::EthDst, FieldValue::U8(1)));
        fs.insert(Field::new(FieldId::Ipv4Src, FieldValue::U8(2)));
        fs.insert(Field::new(FieldId::EthDst, FieldValue::U8(3)));

        let ids: Vec<_> = fs.iter().map(|f| f.id).collect();
        assert_eq!(ids, vec![FieldId::EthDst, FieldId::Ipv4Src]);
        assert_eq!(fs.get(FieldId::EthDst).unwrap().value, FieldValue::U8(3));
    }

    #[test]
    fn full_field_set_strip_removes_from_all_three() {
        let mut ffs = FullFieldSet::new();
        ffs.fields.insert(Field::new(FieldId::SwitchId, FieldValue::U64(1)));
        ffs.include(FieldId::SwitchId, FieldValue::U64(1));
        ffs.include(FieldId::SwitchId, FieldValue::U64(2));
        ffs.exclude(FieldId::SwitchId, FieldValue::U64(3));

        ffs.strip(FieldId::SwitchId);
        assert!(ffs.fields.get(FieldId::SwitchId).is_none());
        assert_eq!(ffs.included(FieldId::SwitchId).count(), 0);
        assert_eq!(ffs.excluded(FieldId::SwitchId).count(), 0);
    }

    #[test]
    fn masked_match_respects_wildcard_bits() {
        let field = Field::masked(
            FieldId::Ipv4Dst,
            FieldValue::U32(0xC0A8_0000),
            FieldValue::U32(0xFFFF_0000),
        );
        assert!(field.test(&FieldValue::U32(0xC0A8_00FF)));
        assert!(!field.test(&FieldValue::U32(0xC0A9_0000)));
    }
}
