//! UADP encoder/decoder.
//!
//! Everything is little-endian regardless of host byte order. Encoding
//! writes into a `BytesMut`; decoding walks a byte slice with an explicit
//! position so the same helpers serve both the normal path and the offset
//! computation done once at freeze time.

use bytes::{BufMut, BytesMut};
use tracing::trace;

use crate::error::{PubSubError, Result};
use crate::pubsub::config::DataSetMetaData;
use crate::types::{BuiltInType, Variant};

use super::flags::wire;
use super::message::{
    DataSetMessage, DataSetMessageBody, DataSetMessageHeader, FieldEncoding, GroupHeader,
    NetworkMessage, PublisherId,
};
use super::offsets::{OffsetKind, OffsetTable};

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Encode a complete NetworkMessage.
pub fn encode_network_message(nm: &NetworkMessage, buf: &mut BytesMut) -> Result<()> {
    encode_inner(nm, buf, &mut None)
}

/// Encode a complete NetworkMessage and record the byte offset of every
/// mutable site (sequence numbers and payload field values). One pass; used
/// once per group at freeze time.
pub fn compute_offsets(nm: &NetworkMessage, buf: &mut BytesMut) -> Result<OffsetTable> {
    let mut table = OffsetTable::default();
    encode_inner(nm, buf, &mut Some(&mut table))?;
    Ok(table)
}

/// Encode a single DataSetMessage. Exposed for tests and for hosts that
/// frame payloads themselves.
pub fn encode_data_set_message(dsm: &DataSetMessage, buf: &mut BytesMut) -> Result<()> {
    encode_dsm(dsm, buf, &mut None, 0)
}

/// Encode a single DataSetMessage into an empty buffer and record the
/// offsets of its mutable sites relative to the start of the message.
/// Readers that validate and patch one payload message at a time use this;
/// a NetworkMessage may carry several such messages behind one header.
pub fn compute_data_set_offsets(dsm: &DataSetMessage, buf: &mut BytesMut) -> Result<OffsetTable> {
    let mut table = OffsetTable::default();
    encode_dsm(dsm, buf, &mut Some(&mut table), 0)?;
    Ok(table)
}

fn record(offsets: &mut Option<&mut OffsetTable>, kind: OffsetKind, offset: usize) {
    if let Some(table) = offsets.as_deref_mut() {
        table.record(kind, offset);
    }
}

fn encode_inner(
    nm: &NetworkMessage,
    buf: &mut BytesMut,
    offsets: &mut Option<&mut OffsetTable>,
) -> Result<()> {
    if nm.messages.is_empty() {
        return Err(PubSubError::Encoding(
            "network message has no payload messages".into(),
        ));
    }
    if let Some(ids) = &nm.payload_header {
        if ids.len() != nm.messages.len() {
            return Err(PubSubError::Encoding(
                "payload header writer id count must match message count".into(),
            ));
        }
        if ids.len() > u8::MAX as usize {
            return Err(PubSubError::Encoding(
                "more than 255 messages per network message".into(),
            ));
        }
    } else if nm.messages.len() > 1 {
        return Err(PubSubError::Encoding(
            "a payload header is required to carry multiple messages".into(),
        ));
    }

    let mut ext1 = 0u8;
    if let Some(pid) = nm.publisher_id {
        ext1 |= pid.type_bits();
    }
    if nm.dataset_class_id.is_some() {
        ext1 |= wire::EXT1_DATASET_CLASS_ID;
    }
    if nm.timestamp.is_some() {
        ext1 |= wire::EXT1_TIMESTAMP;
    }
    if nm.picoseconds.is_some() {
        ext1 |= wire::EXT1_PICOSECONDS;
    }

    let mut flags = wire::UADP_VERSION & wire::VERSION_MASK;
    if nm.publisher_id.is_some() {
        flags |= wire::FLAGS_PUBLISHER_ID;
    }
    if nm.group_header.is_some() {
        flags |= wire::FLAGS_GROUP_HEADER;
    }
    if nm.payload_header.is_some() {
        flags |= wire::FLAGS_PAYLOAD_HEADER;
    }
    if ext1 != 0 {
        flags |= wire::FLAGS_EXTENDED1;
    }
    buf.put_u8(flags);
    if ext1 != 0 {
        buf.put_u8(ext1);
    }

    match nm.publisher_id {
        Some(PublisherId::Byte(v)) => buf.put_u8(v),
        Some(PublisherId::UInt16(v)) => buf.put_u16_le(v),
        Some(PublisherId::UInt32(v)) => buf.put_u32_le(v),
        Some(PublisherId::UInt64(v)) => buf.put_u64_le(v),
        None => {}
    }

    if let Some(guid) = &nm.dataset_class_id {
        buf.put_slice(guid);
    }

    if let Some(gh) = &nm.group_header {
        encode_group_header(gh, buf, offsets);
    }

    if let Some(ids) = &nm.payload_header {
        buf.put_u8(ids.len() as u8);
        for id in ids {
            buf.put_u16_le(*id);
        }
    }

    if let Some(ts) = nm.timestamp {
        buf.put_i64_le(ts);
    }
    if let Some(ps) = nm.picoseconds {
        buf.put_u16_le(ps);
    }

    // With more than one payload message, a sizes array precedes the
    // payload. Reserve it now and backpatch after each message is encoded.
    let sizes_pos = if nm.payload_header.is_some() && nm.messages.len() > 1 {
        let pos = buf.len();
        buf.put_bytes(0, nm.messages.len() * 2);
        Some(pos)
    } else {
        None
    };

    for (i, dsm) in nm.messages.iter().enumerate() {
        let start = buf.len();
        encode_dsm(dsm, buf, offsets, i)?;
        if let Some(sizes_pos) = sizes_pos {
            let size = buf.len() - start;
            if size > u16::MAX as usize {
                return Err(PubSubError::Encoding(
                    "payload message exceeds 65535 bytes".into(),
                ));
            }
            let at = sizes_pos + 2 * i;
            buf[at..at + 2].copy_from_slice(&(size as u16).to_le_bytes());
        }
    }

    Ok(())
}

fn encode_group_header(
    gh: &GroupHeader,
    buf: &mut BytesMut,
    offsets: &mut Option<&mut OffsetTable>,
) {
    let mut gflags = 0u8;
    if gh.writer_group_id.is_some() {
        gflags |= wire::GROUP_WRITER_GROUP_ID;
    }
    if gh.group_version.is_some() {
        gflags |= wire::GROUP_VERSION;
    }
    if gh.network_message_number.is_some() {
        gflags |= wire::GROUP_NETWORK_MESSAGE_NUMBER;
    }
    if gh.sequence_number.is_some() {
        gflags |= wire::GROUP_SEQUENCE_NUMBER;
    }
    buf.put_u8(gflags);
    if let Some(v) = gh.writer_group_id {
        buf.put_u16_le(v);
    }
    if let Some(v) = gh.group_version {
        buf.put_u32_le(v);
    }
    if let Some(v) = gh.network_message_number {
        buf.put_u16_le(v);
    }
    if let Some(v) = gh.sequence_number {
        record(offsets, OffsetKind::GroupSequenceNumber, buf.len());
        buf.put_u16_le(v);
    }
}

fn encode_dsm(
    dsm: &DataSetMessage,
    buf: &mut BytesMut,
    offsets: &mut Option<&mut OffsetTable>,
    message: usize,
) -> Result<()> {
    let h = &dsm.header;

    let mut flags2 = dsm.body.type_bits() & wire::DSM2_TYPE;
    if h.timestamp.is_some() {
        flags2 |= wire::DSM2_TIMESTAMP;
    }
    if h.picoseconds.is_some() {
        flags2 |= wire::DSM2_PICOSECONDS;
    }

    let mut flags1 = (h.field_encoding.bits() << wire::DSM1_ENCODING_SHIFT) & wire::DSM1_ENCODING;
    if h.valid {
        flags1 |= wire::DSM1_VALID;
    }
    if h.sequence_number.is_some() {
        flags1 |= wire::DSM1_SEQUENCE_NUMBER;
    }
    if h.status.is_some() {
        flags1 |= wire::DSM1_STATUS;
    }
    if h.config_major_version.is_some() {
        flags1 |= wire::DSM1_MAJOR_VERSION;
    }
    if h.config_minor_version.is_some() {
        flags1 |= wire::DSM1_MINOR_VERSION;
    }
    if flags2 != 0 {
        flags1 |= wire::DSM1_FLAGS2;
    }

    buf.put_u8(flags1);
    if flags2 != 0 {
        buf.put_u8(flags2);
    }
    if let Some(v) = h.sequence_number {
        record(offsets, OffsetKind::MessageSequenceNumber { message }, buf.len());
        buf.put_u16_le(v);
    }
    if let Some(v) = h.timestamp {
        buf.put_i64_le(v);
    }
    if let Some(v) = h.picoseconds {
        buf.put_u16_le(v);
    }
    if let Some(v) = h.status {
        buf.put_u16_le(v);
    }
    if let Some(v) = h.config_major_version {
        buf.put_u32_le(v);
    }
    if let Some(v) = h.config_minor_version {
        buf.put_u32_le(v);
    }

    match &dsm.body {
        DataSetMessageBody::KeyFrame { fields } => {
            if fields.len() > u16::MAX as usize {
                return Err(PubSubError::Encoding("too many payload fields".into()));
            }
            match h.field_encoding {
                FieldEncoding::Variant => {
                    buf.put_u16_le(fields.len() as u16);
                    for (field, value) in fields.iter().enumerate() {
                        buf.put_u8(value.built_in_type().as_u8());
                        record(
                            offsets,
                            OffsetKind::Field {
                                message,
                                field,
                                ty: value.built_in_type(),
                            },
                            buf.len(),
                        );
                        encode_value(value, buf)?;
                    }
                }
                FieldEncoding::RawData => {
                    for (field, value) in fields.iter().enumerate() {
                        if value.built_in_type().fixed_wire_size().is_none() {
                            return Err(PubSubError::UnsupportedInRawEncoding(
                                value.built_in_type(),
                            ));
                        }
                        record(
                            offsets,
                            OffsetKind::Field {
                                message,
                                field,
                                ty: value.built_in_type(),
                            },
                            buf.len(),
                        );
                        encode_value(value, buf)?;
                    }
                }
            }
        }
        DataSetMessageBody::DeltaFrame { fields } => {
            if h.field_encoding == FieldEncoding::RawData {
                return Err(PubSubError::NotSupported(
                    "raw-data encoded deltaframes".into(),
                ));
            }
            if fields.len() > u16::MAX as usize {
                return Err(PubSubError::Encoding("too many payload fields".into()));
            }
            buf.put_u16_le(fields.len() as u16);
            for (index, value) in fields {
                buf.put_u16_le(*index);
                buf.put_u8(value.built_in_type().as_u8());
                encode_value(value, buf)?;
            }
        }
        DataSetMessageBody::KeepAlive => {}
    }

    Ok(())
}

/// Write the value image of a variant, without its type tag.
fn encode_value(value: &Variant, buf: &mut BytesMut) -> Result<()> {
    match value {
        Variant::Boolean(v) => buf.put_u8(u8::from(*v)),
        Variant::SByte(v) => buf.put_i8(*v),
        Variant::Byte(v) => buf.put_u8(*v),
        Variant::Int16(v) => buf.put_i16_le(*v),
        Variant::UInt16(v) => buf.put_u16_le(*v),
        Variant::Int32(v) => buf.put_i32_le(*v),
        Variant::UInt32(v) => buf.put_u32_le(*v),
        Variant::Int64(v) => buf.put_i64_le(*v),
        Variant::UInt64(v) => buf.put_u64_le(*v),
        Variant::Float(v) => buf.put_f32_le(*v),
        Variant::Double(v) => buf.put_f64_le(*v),
        Variant::DateTime(v) => buf.put_i64_le(*v),
        Variant::StatusCode(v) => buf.put_u32_le(*v),
        Variant::String(s) => {
            let bytes = s.as_bytes();
            if bytes.len() > i32::MAX as usize {
                return Err(PubSubError::Encoding("string exceeds i32 length".into()));
            }
            buf.put_i32_le(bytes.len() as i32);
            buf.put_slice(bytes);
        }
        Variant::ByteString(b) => {
            if b.len() > i32::MAX as usize {
                return Err(PubSubError::Encoding("byte string exceeds i32 length".into()));
            }
            buf.put_i32_le(b.len() as i32);
            buf.put_slice(b);
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// NetworkMessage header plus the payload bookkeeping needed to walk the
/// messages that follow it.
#[derive(Debug)]
pub(crate) struct DecodedHeader {
    /// Header fields; `messages` is left empty.
    pub nm: NetworkMessage,
    /// Per-message encoded sizes, present when the wire carried more than
    /// one payload message.
    pub payload_sizes: Option<Vec<u16>>,
}

impl DecodedHeader {
    pub fn message_count(&self) -> usize {
        self.nm
            .payload_header
            .as_ref()
            .map(|ids| ids.len())
            .unwrap_or(1)
    }
}

fn take<'a>(buf: &'a [u8], pos: &mut usize, n: usize) -> Result<&'a [u8]> {
    let slice = buf
        .get(*pos..*pos + n)
        .ok_or_else(|| PubSubError::Decoding("buffer too short".into()))?;
    *pos += n;
    Ok(slice)
}

fn read_u8(buf: &[u8], pos: &mut usize) -> Result<u8> {
    Ok(take(buf, pos, 1)?[0])
}

fn read_u16_le(buf: &[u8], pos: &mut usize) -> Result<u16> {
    Ok(u16::from_le_bytes(take(buf, pos, 2)?.try_into().unwrap()))
}

fn read_u32_le(buf: &[u8], pos: &mut usize) -> Result<u32> {
    Ok(u32::from_le_bytes(take(buf, pos, 4)?.try_into().unwrap()))
}

fn read_u64_le(buf: &[u8], pos: &mut usize) -> Result<u64> {
    Ok(u64::from_le_bytes(take(buf, pos, 8)?.try_into().unwrap()))
}

fn read_i64_le(buf: &[u8], pos: &mut usize) -> Result<i64> {
    Ok(i64::from_le_bytes(take(buf, pos, 8)?.try_into().unwrap()))
}

/// Decode the NetworkMessage header up to (but excluding) the first payload
/// message.
pub(crate) fn decode_header(buf: &[u8], pos: &mut usize) -> Result<DecodedHeader> {
    let flags = read_u8(buf, pos)?;
    if flags & wire::VERSION_MASK != wire::UADP_VERSION {
        return Err(PubSubError::Decoding(format!(
            "unsupported UADP version {}",
            flags & wire::VERSION_MASK
        )));
    }

    let ext1 = if flags & wire::FLAGS_EXTENDED1 != 0 {
        read_u8(buf, pos)?
    } else {
        0
    };
    if ext1 & wire::EXT1_SECURITY != 0 {
        return Err(PubSubError::NotSupported("security header".into()));
    }
    if ext1 & wire::EXT1_EXTENDED2 != 0 {
        return Err(PubSubError::NotSupported(
            "extended flags 2 (chunking, promoted fields)".into(),
        ));
    }

    let publisher_id = if flags & wire::FLAGS_PUBLISHER_ID != 0 {
        Some(match ext1 & wire::EXT1_PUBLISHER_ID_TYPE {
            0 => PublisherId::Byte(read_u8(buf, pos)?),
            1 => PublisherId::UInt16(read_u16_le(buf, pos)?),
            2 => PublisherId::UInt32(read_u32_le(buf, pos)?),
            3 => PublisherId::UInt64(read_u64_le(buf, pos)?),
            4 => return Err(PubSubError::NotSupported("string publisher ids".into())),
            other => {
                return Err(PubSubError::Decoding(format!(
                    "invalid publisher id type {other}"
                )))
            }
        })
    } else {
        None
    };

    let dataset_class_id = if ext1 & wire::EXT1_DATASET_CLASS_ID != 0 {
        let mut guid = [0u8; 16];
        guid.copy_from_slice(take(buf, pos, 16)?);
        Some(guid)
    } else {
        None
    };

    let group_header = if flags & wire::FLAGS_GROUP_HEADER != 0 {
        // Reserved group flag bits are ignored on decode.
        let gflags = read_u8(buf, pos)?;
        Some(GroupHeader {
            writer_group_id: (gflags & wire::GROUP_WRITER_GROUP_ID != 0)
                .then(|| read_u16_le(buf, pos))
                .transpose()?,
            group_version: (gflags & wire::GROUP_VERSION != 0)
                .then(|| read_u32_le(buf, pos))
                .transpose()?,
            network_message_number: (gflags & wire::GROUP_NETWORK_MESSAGE_NUMBER != 0)
                .then(|| read_u16_le(buf, pos))
                .transpose()?,
            sequence_number: (gflags & wire::GROUP_SEQUENCE_NUMBER != 0)
                .then(|| read_u16_le(buf, pos))
                .transpose()?,
        })
    } else {
        None
    };

    let payload_header = if flags & wire::FLAGS_PAYLOAD_HEADER != 0 {
        let count = read_u8(buf, pos)? as usize;
        if count == 0 {
            return Err(PubSubError::MalformedPayload("empty payload header"));
        }
        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            ids.push(read_u16_le(buf, pos)?);
        }
        Some(ids)
    } else {
        None
    };

    let timestamp = (ext1 & wire::EXT1_TIMESTAMP != 0)
        .then(|| read_i64_le(buf, pos))
        .transpose()?;
    let picoseconds = (ext1 & wire::EXT1_PICOSECONDS != 0)
        .then(|| read_u16_le(buf, pos))
        .transpose()?;

    let payload_sizes = match &payload_header {
        Some(ids) if ids.len() > 1 => {
            let mut sizes = Vec::with_capacity(ids.len());
            let mut total = 0usize;
            for _ in 0..ids.len() {
                let size = read_u16_le(buf, pos)?;
                if size == 0 {
                    return Err(PubSubError::MalformedPayload("zero-length payload message"));
                }
                total += size as usize;
                sizes.push(size);
            }
            if *pos + total > buf.len() {
                return Err(PubSubError::MalformedPayload(
                    "payload sizes exceed the received buffer",
                ));
            }
            Some(sizes)
        }
        _ => None,
    };

    Ok(DecodedHeader {
        nm: NetworkMessage {
            publisher_id,
            dataset_class_id,
            group_header,
            payload_header,
            timestamp,
            picoseconds,
            messages: Vec::new(),
        },
        payload_sizes,
    })
}

/// Decode one DataSetMessage. Raw-data payloads need the reader's metadata
/// to recover field boundaries and types.
pub fn decode_data_set_message(
    buf: &[u8],
    pos: &mut usize,
    meta: Option<&DataSetMetaData>,
) -> Result<DataSetMessage> {
    let flags1 = read_u8(buf, pos)?;
    let flags2 = if flags1 & wire::DSM1_FLAGS2 != 0 {
        read_u8(buf, pos)?
    } else {
        0
    };

    let field_encoding = match (flags1 & wire::DSM1_ENCODING) >> wire::DSM1_ENCODING_SHIFT {
        0 => FieldEncoding::Variant,
        1 => FieldEncoding::RawData,
        2 => return Err(PubSubError::NotSupported("DataValue field encoding".into())),
        _ => return Err(PubSubError::Decoding("invalid field encoding".into())),
    };

    let message_type = flags2 & wire::DSM2_TYPE;

    let header = DataSetMessageHeader {
        valid: flags1 & wire::DSM1_VALID != 0,
        field_encoding,
        sequence_number: (flags1 & wire::DSM1_SEQUENCE_NUMBER != 0)
            .then(|| read_u16_le(buf, pos))
            .transpose()?,
        timestamp: (flags2 & wire::DSM2_TIMESTAMP != 0)
            .then(|| read_i64_le(buf, pos))
            .transpose()?,
        picoseconds: (flags2 & wire::DSM2_PICOSECONDS != 0)
            .then(|| read_u16_le(buf, pos))
            .transpose()?,
        status: (flags1 & wire::DSM1_STATUS != 0)
            .then(|| read_u16_le(buf, pos))
            .transpose()?,
        config_major_version: (flags1 & wire::DSM1_MAJOR_VERSION != 0)
            .then(|| read_u32_le(buf, pos))
            .transpose()?,
        config_minor_version: (flags1 & wire::DSM1_MINOR_VERSION != 0)
            .then(|| read_u32_le(buf, pos))
            .transpose()?,
    };

    let body = match message_type {
        0 => match field_encoding {
            FieldEncoding::Variant => {
                let count = read_u16_le(buf, pos)? as usize;
                let mut fields = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    fields.push(decode_variant(buf, pos)?);
                }
                DataSetMessageBody::KeyFrame { fields }
            }
            FieldEncoding::RawData => {
                let meta = meta.ok_or_else(|| {
                    PubSubError::Decoding(
                        "raw-encoded payload cannot be decoded without dataset metadata".into(),
                    )
                })?;
                let mut fields = Vec::with_capacity(meta.fields.len());
                for fm in &meta.fields {
                    if fm.built_in_type.fixed_wire_size().is_none() {
                        return Err(PubSubError::UnsupportedInRawEncoding(fm.built_in_type));
                    }
                    fields.push(decode_scalar(fm.built_in_type, buf, pos)?);
                }
                DataSetMessageBody::KeyFrame { fields }
            }
        },
        1 => {
            if field_encoding == FieldEncoding::RawData {
                return Err(PubSubError::NotSupported(
                    "raw-data encoded deltaframes".into(),
                ));
            }
            let count = read_u16_le(buf, pos)? as usize;
            let mut fields = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                let index = read_u16_le(buf, pos)?;
                fields.push((index, decode_variant(buf, pos)?));
            }
            DataSetMessageBody::DeltaFrame { fields }
        }
        2 => return Err(PubSubError::NotImplemented("event frame payloads")),
        3 => DataSetMessageBody::KeepAlive,
        other => {
            return Err(PubSubError::Decoding(format!(
                "unknown dataset message type {other}"
            )))
        }
    };

    Ok(DataSetMessage { header, body })
}

/// Decode a complete NetworkMessage. Raw-data payloads are rejected here;
/// the subscriber pipeline decodes those per reader with the reader's
/// metadata.
pub fn decode_network_message(buf: &[u8]) -> Result<NetworkMessage> {
    let mut pos = 0;
    let header = decode_header(buf, &mut pos)?;
    let count = header.message_count();
    let DecodedHeader { mut nm, payload_sizes } = header;

    for i in 0..count {
        if pos >= buf.len() {
            return Err(PubSubError::MalformedPayload(
                "fewer payload messages than announced in the payload header",
            ));
        }
        match &payload_sizes {
            Some(sizes) => {
                let end = pos + sizes[i] as usize;
                let dsm = decode_data_set_message(&buf[..end], &mut pos, None)?;
                trace!(message = i, "decoded payload message");
                nm.messages.push(dsm);
                // Trailing padding inside a sized message is tolerated.
                pos = end;
            }
            None => {
                nm.messages.push(decode_data_set_message(buf, &mut pos, None)?);
            }
        }
    }

    Ok(nm)
}

fn decode_variant(buf: &[u8], pos: &mut usize) -> Result<Variant> {
    let mask = read_u8(buf, pos)?;
    if mask & wire::VARIANT_ARRAY != 0 {
        return Err(PubSubError::Decoding(
            "array and matrix values are not supported".into(),
        ));
    }
    let type_id = mask & wire::VARIANT_TYPE_ID;
    let ty = BuiltInType::from_u8(type_id).ok_or(PubSubError::UnknownField { type_id })?;
    decode_scalar(ty, buf, pos)
}

fn decode_scalar(ty: BuiltInType, buf: &[u8], pos: &mut usize) -> Result<Variant> {
    let value = match ty {
        BuiltInType::Boolean => Variant::Boolean(read_u8(buf, pos)? != 0),
        BuiltInType::SByte => Variant::SByte(read_u8(buf, pos)? as i8),
        BuiltInType::Byte => Variant::Byte(read_u8(buf, pos)?),
        BuiltInType::Int16 => Variant::Int16(read_u16_le(buf, pos)? as i16),
        BuiltInType::UInt16 => Variant::UInt16(read_u16_le(buf, pos)?),
        BuiltInType::Int32 => Variant::Int32(read_u32_le(buf, pos)? as i32),
        BuiltInType::UInt32 => Variant::UInt32(read_u32_le(buf, pos)?),
        BuiltInType::Int64 => Variant::Int64(read_i64_le(buf, pos)?),
        BuiltInType::UInt64 => Variant::UInt64(read_u64_le(buf, pos)?),
        BuiltInType::Float => Variant::Float(f32::from_le_bytes(take(buf, pos, 4)?.try_into().unwrap())),
        BuiltInType::Double => {
            Variant::Double(f64::from_le_bytes(take(buf, pos, 8)?.try_into().unwrap()))
        }
        BuiltInType::DateTime => Variant::DateTime(read_i64_le(buf, pos)?),
        BuiltInType::StatusCode => Variant::StatusCode(read_u32_le(buf, pos)?),
        BuiltInType::String => {
            let bytes = decode_length_prefixed(buf, pos)?;
            Variant::String(
                String::from_utf8(bytes.to_vec())
                    .map_err(|_| PubSubError::Decoding("invalid utf-8 in string value".into()))?,
            )
        }
        BuiltInType::ByteString => Variant::ByteString(decode_length_prefixed(buf, pos)?.to_vec()),
    };
    Ok(value)
}

fn decode_length_prefixed<'a>(buf: &'a [u8], pos: &mut usize) -> Result<&'a [u8]> {
    let len = read_u32_le(buf, pos)? as i32;
    match len {
        // Null strings collapse to empty on decode.
        -1 | 0 => Ok(&[]),
        n if n < -1 => Err(PubSubError::Decoding("negative string length".into())),
        n => take(buf, pos, n as usize),
    }
}

#[cfg(test)]
#[path = "tests/codec.rs"]
mod tests;
