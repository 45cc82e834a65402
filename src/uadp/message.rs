use serde::{Deserialize, Serialize};

use crate::types::{UtcTime, Variant};

/// Publisher identifier carried in the NetworkMessage header. The wire size
/// follows the variant, signalled by three bits in ExtendedFlags1.
///
/// String publisher ids exist in the UADP specification but are not produced
/// by this stack; decoding one fails the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PublisherId {
    Byte(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
}

impl PublisherId {
    pub(crate) fn type_bits(self) -> u8 {
        match self {
            PublisherId::Byte(_) => 0,
            PublisherId::UInt16(_) => 1,
            PublisherId::UInt32(_) => 2,
            PublisherId::UInt64(_) => 3,
        }
    }
}

/// Optional group-level header: which fields are present is flagged per
/// field in the encoded group flags byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GroupHeader {
    pub writer_group_id: Option<u16>,
    pub group_version: Option<u32>,
    pub network_message_number: Option<u16>,
    pub sequence_number: Option<u16>,
}

/// In-memory form of a UADP NetworkMessage.
///
/// `payload_header`, when present, lists one dataSetWriterId per payload
/// message; the two vectors must stay the same length.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NetworkMessage {
    pub publisher_id: Option<PublisherId>,
    pub dataset_class_id: Option<[u8; 16]>,
    pub group_header: Option<GroupHeader>,
    pub payload_header: Option<Vec<u16>>,
    pub timestamp: Option<UtcTime>,
    pub picoseconds: Option<u16>,
    pub messages: Vec<DataSetMessage>,
}

/// How payload field values are encoded inside a DataSetMessage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FieldEncoding {
    /// Each field as a type-tagged variant.
    #[default]
    Variant,
    /// Fixed-size field values concatenated in field order; decoding
    /// requires the reader's metadata.
    RawData,
}

impl FieldEncoding {
    pub(crate) fn bits(self) -> u8 {
        match self {
            FieldEncoding::Variant => 0,
            FieldEncoding::RawData => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataSetMessageHeader {
    pub valid: bool,
    pub field_encoding: FieldEncoding,
    pub sequence_number: Option<u16>,
    pub timestamp: Option<UtcTime>,
    pub picoseconds: Option<u16>,
    /// Low 16 bits of the writer's status code.
    pub status: Option<u16>,
    pub config_major_version: Option<u32>,
    pub config_minor_version: Option<u32>,
}

impl Default for DataSetMessageHeader {
    fn default() -> Self {
        Self {
            valid: true,
            field_encoding: FieldEncoding::default(),
            sequence_number: None,
            timestamp: None,
            picoseconds: None,
            status: None,
            config_major_version: None,
            config_minor_version: None,
        }
    }
}

/// The payload of a DataSetMessage.
///
/// Event frames are a UADP message type this stack neither produces nor
/// consumes; they fail encode and decode with `BadNotImplemented`.
#[derive(Debug, Clone, PartialEq)]
pub enum DataSetMessageBody {
    /// Full field set in field order.
    KeyFrame { fields: Vec<Variant> },
    /// Changed fields only, each tagged with its field index.
    DeltaFrame { fields: Vec<(u16, Variant)> },
    /// Header only; lets subscribers distinguish an idle writer from a dead
    /// one.
    KeepAlive,
}

impl DataSetMessageBody {
    pub(crate) fn type_bits(&self) -> u8 {
        match self {
            DataSetMessageBody::KeyFrame { .. } => 0,
            DataSetMessageBody::DeltaFrame { .. } => 1,
            DataSetMessageBody::KeepAlive => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataSetMessage {
    pub header: DataSetMessageHeader,
    pub body: DataSetMessageBody,
}

impl DataSetMessage {
    /// Keyframe with a default header (valid, variant encoding, no optional
    /// fields).
    pub fn key_frame(fields: Vec<Variant>) -> Self {
        Self {
            header: DataSetMessageHeader::default(),
            body: DataSetMessageBody::KeyFrame { fields },
        }
    }

    pub fn keep_alive() -> Self {
        Self {
            header: DataSetMessageHeader::default(),
            body: DataSetMessageBody::KeepAlive,
        }
    }
}
