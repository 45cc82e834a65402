//! Patch sites for the realtime fixed-offset mode.
//!
//! A frozen group keeps one pre-encoded message image plus the list of byte
//! ranges that change between cycles: the group sequence number, each
//! message sequence number and each payload field value. Everything outside
//! those ranges stays bit-identical to the image produced at freeze time.

use bytes::BytesMut;

use crate::error::{PubSubError, Result};
use crate::types::{BuiltInType, Variant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetKind {
    /// Sequence number inside the group header.
    GroupSequenceNumber,
    /// Sequence number inside the header of payload message `message`.
    MessageSequenceNumber { message: usize },
    /// Start of the encoded value of payload field `field` of message
    /// `message`.
    Field {
        message: usize,
        field: usize,
        ty: BuiltInType,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetEntry {
    pub offset: usize,
    pub kind: OffsetKind,
}

impl OffsetEntry {
    /// Byte length of the patch site.
    pub fn len(&self) -> usize {
        match self.kind {
            OffsetKind::GroupSequenceNumber | OffsetKind::MessageSequenceNumber { .. } => 2,
            // Only fixed-size types are ever recorded for a frozen buffer;
            // variant-encoded offsets of variable-length fields report 0.
            OffsetKind::Field { ty, .. } => ty.fixed_wire_size().unwrap_or(0),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Absolute byte offsets of every mutable site in one encoded
/// NetworkMessage, in encoding order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OffsetTable {
    pub entries: Vec<OffsetEntry>,
}

impl OffsetTable {
    pub(crate) fn record(&mut self, kind: OffsetKind, offset: usize) {
        self.entries.push(OffsetEntry { offset, kind });
    }

    /// Entries that point at payload field values.
    pub fn field_entries(&self) -> impl Iterator<Item = &OffsetEntry> {
        self.entries
            .iter()
            .filter(|e| matches!(e.kind, OffsetKind::Field { .. }))
    }

    fn find(&self, kind: OffsetKind) -> Option<usize> {
        self.entries
            .iter()
            .find(|e| e.kind == kind)
            .map(|e| e.offset)
    }
}

/// A pre-encoded NetworkMessage image plus its offset table. Created once at
/// freeze time; the byte length never changes afterwards.
#[derive(Debug, Clone)]
pub struct OffsetBuffer {
    bytes: BytesMut,
    table: OffsetTable,
}

impl OffsetBuffer {
    pub(crate) fn new(bytes: BytesMut, table: OffsetTable) -> Self {
        Self { bytes, table }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn table(&self) -> &OffsetTable {
        &self.table
    }

    /// Patch the group header sequence number. No-op when the frozen layout
    /// carries no group sequence number.
    pub(crate) fn set_group_sequence_number(&mut self, sequence_number: u16) {
        if let Some(off) = self.table.find(OffsetKind::GroupSequenceNumber) {
            self.bytes[off..off + 2].copy_from_slice(&sequence_number.to_le_bytes());
        }
    }

    /// Patch the sequence number of payload message `message`.
    pub(crate) fn set_message_sequence_number(&mut self, message: usize, sequence_number: u16) {
        if let Some(off) = self.table.find(OffsetKind::MessageSequenceNumber { message }) {
            self.bytes[off..off + 2].copy_from_slice(&sequence_number.to_le_bytes());
        }
    }

    /// Patch the value of payload field `field` of message `message`. The
    /// value's type must match the type recorded at freeze time.
    pub(crate) fn write_field(
        &mut self,
        message: usize,
        field: usize,
        value: &Variant,
    ) -> Result<()> {
        let entry = self
            .table
            .entries
            .iter()
            .find(|e| {
                matches!(e.kind, OffsetKind::Field { message: m, field: f, .. }
                    if m == message && f == field)
            })
            .copied()
            .ok_or_else(|| {
                PubSubError::Encoding(format!(
                    "no frozen offset for message {message} field {field}"
                ))
            })?;
        let OffsetKind::Field { ty, .. } = entry.kind else {
            unreachable!()
        };
        if value.built_in_type() != ty {
            return Err(PubSubError::Encoding(format!(
                "field type changed after freeze: expected {:?}, got {:?}",
                ty,
                value.built_in_type()
            )));
        }
        write_scalar_at(&mut self.bytes, entry.offset, value)
    }
}

/// Write a fixed-size scalar value at `offset`, little-endian.
pub(crate) fn write_scalar_at(bytes: &mut [u8], offset: usize, value: &Variant) -> Result<()> {
    let size = value
        .built_in_type()
        .fixed_wire_size()
        .ok_or(PubSubError::UnsupportedInRawEncoding(value.built_in_type()))?;
    let dst = bytes
        .get_mut(offset..offset + size)
        .ok_or_else(|| PubSubError::Encoding("offset past end of frozen buffer".into()))?;
    match *value {
        Variant::Boolean(v) => dst.copy_from_slice(&[u8::from(v)]),
        Variant::SByte(v) => dst.copy_from_slice(&v.to_le_bytes()),
        Variant::Byte(v) => dst.copy_from_slice(&v.to_le_bytes()),
        Variant::Int16(v) => dst.copy_from_slice(&v.to_le_bytes()),
        Variant::UInt16(v) => dst.copy_from_slice(&v.to_le_bytes()),
        Variant::Int32(v) => dst.copy_from_slice(&v.to_le_bytes()),
        Variant::UInt32(v) => dst.copy_from_slice(&v.to_le_bytes()),
        Variant::Int64(v) => dst.copy_from_slice(&v.to_le_bytes()),
        Variant::UInt64(v) => dst.copy_from_slice(&v.to_le_bytes()),
        Variant::Float(v) => dst.copy_from_slice(&v.to_le_bytes()),
        Variant::Double(v) => dst.copy_from_slice(&v.to_le_bytes()),
        Variant::DateTime(v) => dst.copy_from_slice(&v.to_le_bytes()),
        Variant::StatusCode(v) => dst.copy_from_slice(&v.to_le_bytes()),
        Variant::String(_) | Variant::ByteString(_) => unreachable!(),
    }
    Ok(())
}

/// Read a fixed-size scalar value of type `ty` at `offset`, little-endian.
pub(crate) fn read_scalar_at(bytes: &[u8], offset: usize, ty: BuiltInType) -> Result<Variant> {
    let size = ty
        .fixed_wire_size()
        .ok_or(PubSubError::UnsupportedInRawEncoding(ty))?;
    let src = bytes
        .get(offset..offset + size)
        .ok_or_else(|| PubSubError::Decoding("offset past end of received buffer".into()))?;
    let value = match ty {
        BuiltInType::Boolean => Variant::Boolean(src[0] != 0),
        BuiltInType::SByte => Variant::SByte(i8::from_le_bytes([src[0]])),
        BuiltInType::Byte => Variant::Byte(src[0]),
        BuiltInType::Int16 => Variant::Int16(i16::from_le_bytes(src.try_into().unwrap())),
        BuiltInType::UInt16 => Variant::UInt16(u16::from_le_bytes(src.try_into().unwrap())),
        BuiltInType::Int32 => Variant::Int32(i32::from_le_bytes(src.try_into().unwrap())),
        BuiltInType::UInt32 => Variant::UInt32(u32::from_le_bytes(src.try_into().unwrap())),
        BuiltInType::Int64 => Variant::Int64(i64::from_le_bytes(src.try_into().unwrap())),
        BuiltInType::UInt64 => Variant::UInt64(u64::from_le_bytes(src.try_into().unwrap())),
        BuiltInType::Float => Variant::Float(f32::from_le_bytes(src.try_into().unwrap())),
        BuiltInType::Double => Variant::Double(f64::from_le_bytes(src.try_into().unwrap())),
        BuiltInType::DateTime => Variant::DateTime(i64::from_le_bytes(src.try_into().unwrap())),
        BuiltInType::StatusCode => Variant::StatusCode(u32::from_le_bytes(src.try_into().unwrap())),
        BuiltInType::String | BuiltInType::ByteString => unreachable!(),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer_with_one_field() -> OffsetBuffer {
        let mut table = OffsetTable::default();
        table.record(OffsetKind::GroupSequenceNumber, 2);
        table.record(
            OffsetKind::Field {
                message: 0,
                field: 0,
                ty: BuiltInType::UInt32,
            },
            4,
        );
        OffsetBuffer::new(BytesMut::from(&[0u8; 8][..]), table)
    }

    #[test]
    fn test_patch_group_sequence_number() {
        let mut buf = buffer_with_one_field();
        buf.set_group_sequence_number(0x1234);
        assert_eq!(&buf.bytes()[2..4], &[0x34, 0x12]);
    }

    #[test]
    fn test_patch_field_in_place() {
        let mut buf = buffer_with_one_field();
        buf.write_field(0, 0, &Variant::UInt32(1000)).unwrap();
        assert_eq!(&buf.bytes()[4..8], &1000u32.to_le_bytes());
        assert_eq!(buf.len(), 8);
    }

    #[test]
    fn test_patch_rejects_type_change() {
        let mut buf = buffer_with_one_field();
        let err = buf.write_field(0, 0, &Variant::Float(1.0)).unwrap_err();
        assert!(matches!(err, PubSubError::Encoding(_)));
    }

    #[test]
    fn test_patch_rejects_unknown_site() {
        let mut buf = buffer_with_one_field();
        let err = buf.write_field(0, 3, &Variant::UInt32(1)).unwrap_err();
        assert!(matches!(err, PubSubError::Encoding(_)));
    }

    #[test]
    fn test_scalar_round_trip_at_offset() {
        let mut bytes = [0u8; 16];
        write_scalar_at(&mut bytes, 3, &Variant::Double(2.5)).unwrap();
        assert_eq!(
            read_scalar_at(&bytes, 3, BuiltInType::Double).unwrap(),
            Variant::Double(2.5)
        );

        write_scalar_at(&mut bytes, 0, &Variant::Boolean(true)).unwrap();
        assert_eq!(
            read_scalar_at(&bytes, 0, BuiltInType::Boolean).unwrap(),
            Variant::Boolean(true)
        );
    }

    #[test]
    fn test_scalar_rejects_variable_length_types() {
        let mut bytes = [0u8; 16];
        let err = write_scalar_at(&mut bytes, 0, &Variant::String("x".into())).unwrap_err();
        assert!(matches!(err, PubSubError::UnsupportedInRawEncoding(_)));
    }
}
