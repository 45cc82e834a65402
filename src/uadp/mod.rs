//! UADP NetworkMessage wire format.
//!
//! The in-memory message model lives in [`message`], the little-endian
//! encoder/decoder in [`codec`], and the fixed-offset machinery used by the
//! realtime mode in [`offsets`]. Optional header fields are gated by content
//! masks declared in [`flags`].

pub mod codec;
pub mod flags;
pub mod message;
pub mod offsets;

pub use codec::{
    compute_data_set_offsets, compute_offsets, decode_data_set_message, decode_network_message,
    encode_data_set_message, encode_network_message,
};
pub use flags::{DataSetMessageContentMask, NetworkMessageContentMask};
pub use message::{
    DataSetMessage, DataSetMessageBody, DataSetMessageHeader, FieldEncoding, GroupHeader,
    NetworkMessage, PublisherId,
};
pub use offsets::{OffsetBuffer, OffsetEntry, OffsetKind, OffsetTable};
