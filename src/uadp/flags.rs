use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Selects the optional NetworkMessage header fields that appear on the
    /// wire. Bits beyond the named ones are reserved; setting one is an
    /// encoding error, receiving one is ignored.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct NetworkMessageContentMask: u32 {
        const PUBLISHER_ID = 1 << 0;
        const GROUP_HEADER = 1 << 1;
        const WRITER_GROUP_ID = 1 << 2;
        const GROUP_VERSION = 1 << 3;
        const NETWORK_MESSAGE_NUMBER = 1 << 4;
        const SEQUENCE_NUMBER = 1 << 5;
        const PAYLOAD_HEADER = 1 << 6;
        const TIMESTAMP = 1 << 7;
        const PICOSECONDS = 1 << 8;
        const DATASET_CLASS_ID = 1 << 9;
        const PROMOTED_FIELDS = 1 << 10;
    }
}

bitflags! {
    /// Selects the optional DataSetMessage header fields.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct DataSetMessageContentMask: u32 {
        const TIMESTAMP = 1 << 0;
        const PICOSECONDS = 1 << 1;
        const STATUS = 1 << 2;
        const MAJOR_VERSION = 1 << 3;
        const MINOR_VERSION = 1 << 4;
        const SEQUENCE_NUMBER = 1 << 5;
    }
}

/// Bit layout of the encoded headers. The codec is the only consumer.
pub(crate) mod wire {
    pub const UADP_VERSION: u8 = 1;
    pub const VERSION_MASK: u8 = 0x0F;

    pub const FLAGS_PUBLISHER_ID: u8 = 1 << 4;
    pub const FLAGS_GROUP_HEADER: u8 = 1 << 5;
    pub const FLAGS_PAYLOAD_HEADER: u8 = 1 << 6;
    pub const FLAGS_EXTENDED1: u8 = 1 << 7;

    pub const EXT1_PUBLISHER_ID_TYPE: u8 = 0x07;
    pub const EXT1_DATASET_CLASS_ID: u8 = 1 << 3;
    pub const EXT1_SECURITY: u8 = 1 << 4;
    pub const EXT1_TIMESTAMP: u8 = 1 << 5;
    pub const EXT1_PICOSECONDS: u8 = 1 << 6;
    pub const EXT1_EXTENDED2: u8 = 1 << 7;

    pub const GROUP_WRITER_GROUP_ID: u8 = 1 << 0;
    pub const GROUP_VERSION: u8 = 1 << 1;
    pub const GROUP_NETWORK_MESSAGE_NUMBER: u8 = 1 << 2;
    pub const GROUP_SEQUENCE_NUMBER: u8 = 1 << 3;

    pub const DSM1_VALID: u8 = 1 << 0;
    pub const DSM1_ENCODING: u8 = 0x06;
    pub const DSM1_ENCODING_SHIFT: u8 = 1;
    pub const DSM1_SEQUENCE_NUMBER: u8 = 1 << 3;
    pub const DSM1_STATUS: u8 = 1 << 4;
    pub const DSM1_MAJOR_VERSION: u8 = 1 << 5;
    pub const DSM1_MINOR_VERSION: u8 = 1 << 6;
    pub const DSM1_FLAGS2: u8 = 1 << 7;

    pub const DSM2_TYPE: u8 = 0x0F;
    pub const DSM2_TIMESTAMP: u8 = 1 << 4;
    pub const DSM2_PICOSECONDS: u8 = 1 << 5;

    /// Variant encoding mask: low six bits carry the built-in type id, the
    /// top two flag array values (not produced by this stack).
    pub const VARIANT_TYPE_ID: u8 = 0x3F;
    pub const VARIANT_ARRAY: u8 = 0xC0;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_masks_have_no_overlap_with_reserved_bits() {
        assert_eq!(NetworkMessageContentMask::all().bits() & !0x7FF, 0);
        assert_eq!(DataSetMessageContentMask::all().bits() & !0x3F, 0);
    }

    #[test]
    fn test_mask_operations() {
        let mask = NetworkMessageContentMask::PUBLISHER_ID
            | NetworkMessageContentMask::GROUP_HEADER
            | NetworkMessageContentMask::PAYLOAD_HEADER;

        assert!(mask.contains(NetworkMessageContentMask::PUBLISHER_ID));
        assert!(!mask.contains(NetworkMessageContentMask::TIMESTAMP));

        let without_header = mask - NetworkMessageContentMask::GROUP_HEADER;
        assert!(!without_header.contains(NetworkMessageContentMask::GROUP_HEADER));
        assert!(without_header.contains(NetworkMessageContentMask::PAYLOAD_HEADER));
    }

    #[test]
    fn test_unknown_bits_survive_retain() {
        let raw = 0x8000_0001u32;
        let mask = NetworkMessageContentMask::from_bits_retain(raw);
        assert_eq!(mask.bits(), raw);
        assert!(NetworkMessageContentMask::from_bits(raw).is_none());
    }
}
