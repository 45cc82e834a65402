//! Value model shared by the wire codec and the PubSub engine.
//!
//! Only the built-in scalar types the UADP payload carries are modelled.
//! Structured types, arrays and diagnostics are out of scope for the data
//! plane; the address space owning richer values lives in the host server.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::StatusCode;

/// Opaque identifier of a variable node in the host address space.
///
/// The information model itself is external to this crate; nodes are only
/// ever referenced, never dereferenced here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

/// UA DateTime: 100-nanosecond intervals since 1601-01-01 (UTC).
pub type UtcTime = i64;

/// Seconds between the UA epoch (1601-01-01) and the Unix epoch.
const UA_EPOCH_OFFSET_SECS: i64 = 11_644_473_600;

/// Current time as a UA DateTime.
pub fn datetime_now() -> UtcTime {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => (d.as_secs() as i64 + UA_EPOCH_OFFSET_SECS) * 10_000_000
            + (d.subsec_nanos() / 100) as i64,
        Err(_) => 0,
    }
}

/// OPC UA built-in type identifiers carried by UADP payload fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum BuiltInType {
    Boolean = 1,
    SByte = 2,
    Byte = 3,
    Int16 = 4,
    UInt16 = 5,
    Int32 = 6,
    UInt32 = 7,
    Int64 = 8,
    UInt64 = 9,
    Float = 10,
    Double = 11,
    String = 12,
    DateTime = 13,
    ByteString = 15,
    StatusCode = 19,
}

impl BuiltInType {
    /// Convert a wire type id to a BuiltInType.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Boolean),
            2 => Some(Self::SByte),
            3 => Some(Self::Byte),
            4 => Some(Self::Int16),
            5 => Some(Self::UInt16),
            6 => Some(Self::Int32),
            7 => Some(Self::UInt32),
            8 => Some(Self::Int64),
            9 => Some(Self::UInt64),
            10 => Some(Self::Float),
            11 => Some(Self::Double),
            12 => Some(Self::String),
            13 => Some(Self::DateTime),
            15 => Some(Self::ByteString),
            19 => Some(Self::StatusCode),
            _ => None,
        }
    }

    /// Get the wire type id of the BuiltInType.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Encoded size in bytes for types with a fixed-size wire image.
    /// `None` for length-prefixed types.
    pub fn fixed_wire_size(self) -> Option<usize> {
        match self {
            Self::Boolean | Self::SByte | Self::Byte => Some(1),
            Self::Int16 | Self::UInt16 => Some(2),
            Self::Int32 | Self::UInt32 | Self::Float | Self::StatusCode => Some(4),
            Self::Int64 | Self::UInt64 | Self::Double | Self::DateTime => Some(8),
            Self::String | Self::ByteString => None,
        }
    }

    /// Whether a field of this type may live in a frozen fixed-offset buffer.
    ///
    /// DateTime is fixed-size on the wire but explicitly rejected: a frozen
    /// buffer is never re-encoded, and a timestamp that never advances is
    /// worse than no timestamp.
    pub fn rt_patchable(self) -> bool {
        self != Self::DateTime && self.fixed_wire_size().is_some()
    }
}

/// A scalar value of one of the built-in types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Variant {
    Boolean(bool),
    SByte(i8),
    Byte(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Float(f32),
    Double(f64),
    String(String),
    DateTime(UtcTime),
    ByteString(Vec<u8>),
    StatusCode(u32),
}

impl Variant {
    pub fn built_in_type(&self) -> BuiltInType {
        match self {
            Variant::Boolean(_) => BuiltInType::Boolean,
            Variant::SByte(_) => BuiltInType::SByte,
            Variant::Byte(_) => BuiltInType::Byte,
            Variant::Int16(_) => BuiltInType::Int16,
            Variant::UInt16(_) => BuiltInType::UInt16,
            Variant::Int32(_) => BuiltInType::Int32,
            Variant::UInt32(_) => BuiltInType::UInt32,
            Variant::Int64(_) => BuiltInType::Int64,
            Variant::UInt64(_) => BuiltInType::UInt64,
            Variant::Float(_) => BuiltInType::Float,
            Variant::Double(_) => BuiltInType::Double,
            Variant::String(_) => BuiltInType::String,
            Variant::DateTime(_) => BuiltInType::DateTime,
            Variant::ByteString(_) => BuiltInType::ByteString,
            Variant::StatusCode(_) => BuiltInType::StatusCode,
        }
    }

    /// Zero/empty placeholder value of the given type. Used when a message
    /// layout has to be synthesized before real values exist.
    pub fn zero(ty: BuiltInType) -> Variant {
        match ty {
            BuiltInType::Boolean => Variant::Boolean(false),
            BuiltInType::SByte => Variant::SByte(0),
            BuiltInType::Byte => Variant::Byte(0),
            BuiltInType::Int16 => Variant::Int16(0),
            BuiltInType::UInt16 => Variant::UInt16(0),
            BuiltInType::Int32 => Variant::Int32(0),
            BuiltInType::UInt32 => Variant::UInt32(0),
            BuiltInType::Int64 => Variant::Int64(0),
            BuiltInType::UInt64 => Variant::UInt64(0),
            BuiltInType::Float => Variant::Float(0.0),
            BuiltInType::Double => Variant::Double(0.0),
            BuiltInType::String => Variant::String(String::new()),
            BuiltInType::DateTime => Variant::DateTime(0),
            BuiltInType::ByteString => Variant::ByteString(Vec::new()),
            BuiltInType::StatusCode => Variant::StatusCode(0),
        }
    }
}

/// A value together with its quality and sampling time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataValue {
    pub value: Variant,
    pub status: StatusCode,
    pub source_timestamp: Option<UtcTime>,
}

impl DataValue {
    pub fn new(value: Variant) -> Self {
        Self {
            value,
            status: StatusCode::GOOD,
            source_timestamp: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_built_in_type_round_trip() {
        for id in 0u8..=32 {
            if let Some(ty) = BuiltInType::from_u8(id) {
                assert_eq!(ty.as_u8(), id);
            }
        }
        assert!(BuiltInType::from_u8(14).is_none());
        assert!(BuiltInType::from_u8(0).is_none());
    }

    #[test]
    fn test_fixed_wire_sizes() {
        assert_eq!(BuiltInType::Boolean.fixed_wire_size(), Some(1));
        assert_eq!(BuiltInType::UInt32.fixed_wire_size(), Some(4));
        assert_eq!(BuiltInType::Double.fixed_wire_size(), Some(8));
        assert_eq!(BuiltInType::String.fixed_wire_size(), None);
    }

    #[test]
    fn test_rt_patchable_rejects_datetime_and_strings() {
        assert!(BuiltInType::UInt32.rt_patchable());
        assert!(BuiltInType::Float.rt_patchable());
        assert!(!BuiltInType::DateTime.rt_patchable());
        assert!(!BuiltInType::String.rt_patchable());
        assert!(!BuiltInType::ByteString.rt_patchable());
    }

    #[test]
    fn test_zero_placeholder_matches_type() {
        for id in 1u8..=19 {
            if let Some(ty) = BuiltInType::from_u8(id) {
                assert_eq!(Variant::zero(ty).built_in_type(), ty);
            }
        }
    }

    #[test]
    fn test_datetime_now_is_after_2020() {
        // 2020-01-01 as UA DateTime.
        let ticks_2020 = (1_577_836_800i64 + 11_644_473_600) * 10_000_000;
        assert!(datetime_now() > ticks_2020);
    }
}
