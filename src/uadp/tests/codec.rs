use bytes::BytesMut;

use crate::error::PubSubError;
use crate::pubsub::config::{DataSetMetaData, FieldMetaData};
use crate::types::{BuiltInType, Variant};
use crate::uadp::codec::{
    compute_data_set_offsets, compute_offsets, decode_data_set_message, decode_header,
    decode_network_message, encode_data_set_message, encode_network_message,
};
use crate::uadp::message::{
    DataSetMessage, DataSetMessageBody, DataSetMessageHeader, FieldEncoding, GroupHeader,
    NetworkMessage, PublisherId,
};
use crate::uadp::offsets::OffsetKind;

fn sample_header() -> NetworkMessage {
    NetworkMessage {
        publisher_id: Some(PublisherId::UInt16(2234)),
        group_header: Some(GroupHeader {
            writer_group_id: Some(100),
            sequence_number: Some(7),
            ..Default::default()
        }),
        payload_header: Some(vec![62541]),
        ..Default::default()
    }
}

fn sample_message(encoding: FieldEncoding) -> NetworkMessage {
    let mut nm = sample_header();
    nm.messages.push(DataSetMessage {
        header: DataSetMessageHeader {
            field_encoding: encoding,
            sequence_number: Some(3),
            ..Default::default()
        },
        body: DataSetMessageBody::KeyFrame {
            fields: vec![Variant::UInt32(1000)],
        },
    });
    nm
}

#[test]
fn test_variant_keyframe_byte_image() {
    let nm = sample_message(FieldEncoding::Variant);
    let mut buf = BytesMut::new();
    encode_network_message(&nm, &mut buf).unwrap();
    assert_eq!(
        &buf[..],
        &[
            0xF1, // version 1, publisher id, group header, payload header, ext1
            0x01, // ext1: publisher id type UInt16
            0xBA, 0x08, // publisher id 2234
            0x09, // group flags: writer group id + sequence number
            0x64, 0x00, // writer group id 100
            0x07, 0x00, // group sequence number 7
            0x01, // payload count
            0x4D, 0xF4, // dataSetWriterId 62541
            0x09, // dsm flags1: valid + sequence number
            0x03, 0x00, // dsm sequence number 3
            0x01, 0x00, // field count
            0x07, // built-in type id UInt32
            0xE8, 0x03, 0x00, 0x00, // 1000
        ]
    );
}

#[test]
fn test_raw_keyframe_byte_image() {
    let nm = sample_message(FieldEncoding::RawData);
    let mut buf = BytesMut::new();
    encode_network_message(&nm, &mut buf).unwrap();
    // Raw payload: no field count, no type tag, just the value.
    assert_eq!(
        &buf[12..],
        &[0x0B, 0x03, 0x00, 0xE8, 0x03, 0x00, 0x00]
    );
}

#[test]
fn test_variant_keyframe_round_trip() {
    let mut nm = sample_header();
    nm.timestamp = Some(132_000_000_000_000_000);
    nm.messages.push(DataSetMessage {
        header: DataSetMessageHeader {
            sequence_number: Some(65535),
            status: Some(0),
            config_major_version: Some(1),
            config_minor_version: Some(2),
            ..Default::default()
        },
        body: DataSetMessageBody::KeyFrame {
            fields: vec![
                Variant::Boolean(true),
                Variant::Int16(-5),
                Variant::UInt32(1000),
                Variant::Double(13.37),
                Variant::String("pump station".into()),
                Variant::ByteString(vec![1, 2, 3]),
            ],
        },
    });

    let mut buf = BytesMut::new();
    encode_network_message(&nm, &mut buf).unwrap();
    let decoded = decode_network_message(&buf).unwrap();
    assert_eq!(decoded, nm);
}

#[test]
fn test_sequence_number_wraps_at_u16() {
    let mut nm = sample_message(FieldEncoding::Variant);
    nm.group_header.as_mut().unwrap().sequence_number = Some(u16::MAX);
    let mut buf = BytesMut::new();
    encode_network_message(&nm, &mut buf).unwrap();
    let decoded = decode_network_message(&buf).unwrap();
    assert_eq!(
        decoded.group_header.unwrap().sequence_number,
        Some(u16::MAX)
    );
}

#[test]
fn test_delta_frame_round_trip() {
    let mut nm = sample_header();
    nm.messages.push(DataSetMessage {
        header: DataSetMessageHeader::default(),
        body: DataSetMessageBody::DeltaFrame {
            fields: vec![(2, Variant::Float(1.5)), (7, Variant::Byte(0xAA))],
        },
    });
    let mut buf = BytesMut::new();
    encode_network_message(&nm, &mut buf).unwrap();
    assert_eq!(decode_network_message(&buf).unwrap(), nm);
}

#[test]
fn test_keep_alive_round_trip() {
    let mut nm = sample_header();
    nm.messages.push(DataSetMessage::keep_alive());
    let mut buf = BytesMut::new();
    encode_network_message(&nm, &mut buf).unwrap();
    let decoded = decode_network_message(&buf).unwrap();
    assert!(matches!(
        decoded.messages[0].body,
        DataSetMessageBody::KeepAlive
    ));
}

#[test]
fn test_multiple_messages_carry_a_sizes_array() {
    let mut nm = sample_header();
    nm.payload_header = Some(vec![1, 2]);
    nm.messages.push(DataSetMessage::keep_alive());
    nm.messages.push(DataSetMessage {
        header: DataSetMessageHeader::default(),
        body: DataSetMessageBody::KeyFrame {
            fields: vec![Variant::Byte(9)],
        },
    });

    let mut buf = BytesMut::new();
    encode_network_message(&nm, &mut buf).unwrap();
    // Header is 12 bytes + one extra writer id; sizes follow the payload
    // header: keepalive encodes to 2 bytes, the keyframe to 5.
    assert_eq!(&buf[14..18], &[0x02, 0x00, 0x05, 0x00]);

    let decoded = decode_network_message(&buf).unwrap();
    assert_eq!(decoded, nm);
}

#[test]
fn test_multiple_messages_without_payload_header_fail_encode() {
    let mut nm = sample_header();
    nm.payload_header = None;
    nm.messages.push(DataSetMessage::keep_alive());
    nm.messages.push(DataSetMessage::keep_alive());
    let err = encode_network_message(&nm, &mut BytesMut::new()).unwrap_err();
    assert!(matches!(err, PubSubError::Encoding(_)));
}

#[test]
fn test_payload_header_count_mismatch_fails_encode() {
    let mut nm = sample_message(FieldEncoding::Variant);
    nm.payload_header = Some(vec![1, 2]);
    let err = encode_network_message(&nm, &mut BytesMut::new()).unwrap_err();
    assert!(matches!(err, PubSubError::Encoding(_)));
}

#[test]
fn test_raw_encoding_rejects_variable_length_fields() {
    let mut nm = sample_header();
    nm.messages.push(DataSetMessage {
        header: DataSetMessageHeader {
            field_encoding: FieldEncoding::RawData,
            ..Default::default()
        },
        body: DataSetMessageBody::KeyFrame {
            fields: vec![Variant::String("not fixed size".into())],
        },
    });
    let err = encode_network_message(&nm, &mut BytesMut::new()).unwrap_err();
    assert!(matches!(
        err,
        PubSubError::UnsupportedInRawEncoding(BuiltInType::String)
    ));
}

#[test]
fn test_short_buffer_fails_decode() {
    let nm = sample_message(FieldEncoding::Variant);
    let mut buf = BytesMut::new();
    encode_network_message(&nm, &mut buf).unwrap();
    for cut in 1..buf.len() {
        let err = decode_network_message(&buf[..cut]).unwrap_err();
        assert!(
            matches!(
                err,
                PubSubError::Decoding(_) | PubSubError::MalformedPayload(_)
            ),
            "truncation at {cut} produced {err:?}"
        );
    }
}

#[test]
fn test_unknown_built_in_type_fails_decode() {
    let nm = sample_message(FieldEncoding::Variant);
    let mut buf = BytesMut::new();
    encode_network_message(&nm, &mut buf).unwrap();
    // Corrupt the variant type tag (14 is unassigned in our model).
    buf[17] = 14;
    let err = decode_network_message(&buf).unwrap_err();
    assert!(matches!(err, PubSubError::UnknownField { type_id: 14 }));
}

#[test]
fn test_header_without_payload_is_malformed() {
    let nm = sample_message(FieldEncoding::Variant);
    let mut buf = BytesMut::new();
    encode_network_message(&nm, &mut buf).unwrap();
    // Keep exactly the header bytes and drop the payload entirely.
    let err = decode_network_message(&buf[..12]).unwrap_err();
    assert!(matches!(err, PubSubError::MalformedPayload(_)));
}

#[test]
fn test_payload_sizes_exceeding_buffer_are_malformed() {
    let mut nm = sample_header();
    nm.payload_header = Some(vec![1, 2]);
    nm.messages.push(DataSetMessage::keep_alive());
    nm.messages.push(DataSetMessage::keep_alive());
    let mut buf = BytesMut::new();
    encode_network_message(&nm, &mut buf).unwrap();
    // Drop the second message's bytes; the sizes array still announces it.
    let err = decode_network_message(&buf[..buf.len() - 2]).unwrap_err();
    assert!(matches!(err, PubSubError::MalformedPayload(_)));
}

#[test]
fn test_raw_decode_requires_metadata() {
    let nm = sample_message(FieldEncoding::RawData);
    let mut buf = BytesMut::new();
    encode_network_message(&nm, &mut buf).unwrap();
    let err = decode_network_message(&buf).unwrap_err();
    assert!(matches!(err, PubSubError::Decoding(_)));
}

#[test]
fn test_raw_decode_with_metadata() {
    let nm = sample_message(FieldEncoding::RawData);
    let mut buf = BytesMut::new();
    encode_network_message(&nm, &mut buf).unwrap();

    let meta = DataSetMetaData {
        name: "demo".into(),
        fields: vec![FieldMetaData {
            name: "speed".into(),
            built_in_type: BuiltInType::UInt32,
        }],
    };

    let mut pos = 0;
    let header = decode_header(&buf, &mut pos).unwrap();
    assert_eq!(header.nm.payload_header, Some(vec![62541]));
    let dsm = decode_data_set_message(&buf, &mut pos, Some(&meta)).unwrap();
    assert_eq!(
        dsm.body,
        DataSetMessageBody::KeyFrame {
            fields: vec![Variant::UInt32(1000)]
        }
    );
    assert_eq!(pos, buf.len());
}

#[test]
fn test_decode_ignores_reserved_group_flag_bits() {
    let nm = sample_message(FieldEncoding::Variant);
    let mut buf = BytesMut::new();
    encode_network_message(&nm, &mut buf).unwrap();
    // Set a reserved bit in the group flags byte.
    buf[4] |= 0x40;
    let decoded = decode_network_message(&buf).unwrap();
    assert_eq!(decoded.group_header, nm.group_header);
}

#[test]
fn test_compute_offsets_records_all_patch_sites() {
    let nm = sample_message(FieldEncoding::RawData);
    let mut buf = BytesMut::new();
    let table = compute_offsets(&nm, &mut buf).unwrap();

    assert_eq!(table.entries.len(), 3);
    assert_eq!(table.entries[0].kind, OffsetKind::GroupSequenceNumber);
    assert_eq!(table.entries[0].offset, 7);
    assert_eq!(
        table.entries[1].kind,
        OffsetKind::MessageSequenceNumber { message: 0 }
    );
    assert_eq!(table.entries[1].offset, 13);
    assert_eq!(
        table.entries[2].kind,
        OffsetKind::Field {
            message: 0,
            field: 0,
            ty: BuiltInType::UInt32,
        }
    );
    assert_eq!(table.entries[2].offset, 15);
    assert_eq!(&buf[15..19], &1000u32.to_le_bytes());
}

#[test]
fn test_offsets_are_monotonic_within_each_message() {
    let mut nm = sample_header();
    nm.payload_header = Some(vec![10, 20]);
    for _ in 0..2 {
        nm.messages.push(DataSetMessage {
            header: DataSetMessageHeader {
                field_encoding: FieldEncoding::RawData,
                sequence_number: Some(0),
                ..Default::default()
            },
            body: DataSetMessageBody::KeyFrame {
                fields: vec![
                    Variant::UInt16(1),
                    Variant::UInt64(2),
                    Variant::Float(3.0),
                ],
            },
        });
    }

    let mut buf = BytesMut::new();
    let table = compute_offsets(&nm, &mut buf).unwrap();
    for message in 0..2 {
        let offsets: Vec<usize> = table
            .entries
            .iter()
            .filter(|e| matches!(e.kind, OffsetKind::Field { message: m, .. } if m == message))
            .map(|e| e.offset)
            .collect();
        assert_eq!(offsets.len(), 3);
        assert!(offsets.windows(2).all(|w| w[0] < w[1]));
    }
}

#[test]
fn test_single_data_set_message_encode() {
    let dsm = DataSetMessage::key_frame(vec![Variant::Byte(0x7F)]);
    let mut buf = BytesMut::new();
    encode_data_set_message(&dsm, &mut buf).unwrap();
    assert_eq!(&buf[..], &[0x01, 0x01, 0x00, 0x03, 0x7F]);
}

#[test]
fn test_data_set_offsets_are_message_relative() {
    let dsm = DataSetMessage {
        header: DataSetMessageHeader {
            field_encoding: FieldEncoding::RawData,
            sequence_number: Some(0),
            ..Default::default()
        },
        body: DataSetMessageBody::KeyFrame {
            fields: vec![Variant::UInt32(0)],
        },
    };
    let mut buf = BytesMut::new();
    let table = compute_data_set_offsets(&dsm, &mut buf).unwrap();

    // flags1, sequence number, value: offsets count from the message
    // start, not from any enclosing NetworkMessage header.
    assert_eq!(buf.len(), 7);
    assert_eq!(table.entries.len(), 2);
    assert_eq!(
        table.entries[0].kind,
        OffsetKind::MessageSequenceNumber { message: 0 }
    );
    assert_eq!(table.entries[0].offset, 1);
    assert_eq!(
        table.entries[1].kind,
        OffsetKind::Field {
            message: 0,
            field: 0,
            ty: BuiltInType::UInt32,
        }
    );
    assert_eq!(table.entries[1].offset, 3);
}
