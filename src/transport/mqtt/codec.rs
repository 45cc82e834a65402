//! MQTT 3.1.1 packet encoding and an incremental parser.
//!
//! Only the packet set the channel needs is implemented; this is not a
//! general-purpose MQTT library. Integers are big-endian per the OASIS
//! specification, unlike the little-endian UADP payloads the channel
//! carries opaquely.

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PubSubError, Result};

const PROTOCOL_NAME: &str = "MQTT";
const PROTOCOL_LEVEL: u8 = 4;
const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// MQTT quality of service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum Qos {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for Qos {
    type Error = PubSubError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Qos::AtMostOnce),
            1 => Ok(Qos::AtLeastOnce),
            2 => Ok(Qos::ExactlyOnce),
            n => Err(PubSubError::InvalidArgument(format!("invalid MQTT QoS {n}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Connect {
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u16,
    pub clean_session: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Connack {
    pub session_present: bool,
    pub return_code: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Publish {
    pub dup: bool,
    pub qos: Qos,
    pub retain: bool,
    pub topic: String,
    /// Present exactly when `qos` is above `AtMostOnce`.
    pub packet_id: Option<u16>,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Subscribe {
    pub packet_id: u16,
    pub topics: Vec<(String, Qos)>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Suback {
    pub packet_id: u16,
    pub return_codes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Unsubscribe {
    pub packet_id: u16,
    pub topics: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Packet {
    Connect(Connect),
    Connack(Connack),
    Publish(Publish),
    Puback(u16),
    Pubrec(u16),
    Pubrel(u16),
    Pubcomp(u16),
    Subscribe(Subscribe),
    Suback(Suback),
    Unsubscribe(Unsubscribe),
    Unsuback(u16),
    Pingreq,
    Pingresp,
    Disconnect,
}

/// Encode the remaining-length varint: 7 bits per byte, high bit marks a
/// continuation.
fn write_remaining_length(buf: &mut BytesMut, mut len: usize) -> Result<()> {
    if len > MAX_REMAINING_LENGTH {
        return Err(PubSubError::Encoding("mqtt payload too long".into()));
    }
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if len == 0 {
            return Ok(());
        }
    }
}

fn write_string(buf: &mut BytesMut, s: &str) -> Result<()> {
    if s.len() > u16::MAX as usize {
        return Err(PubSubError::Encoding("mqtt string too long".into()));
    }
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
    Ok(())
}

impl Packet {
    /// Fixed-header type/flags byte.
    fn type_byte(&self) -> u8 {
        match self {
            Packet::Connect(_) => 0x10,
            Packet::Connack(_) => 0x20,
            Packet::Publish(p) => {
                0x30 | (u8::from(p.dup) << 3) | ((p.qos as u8) << 1) | u8::from(p.retain)
            }
            Packet::Puback(_) => 0x40,
            Packet::Pubrec(_) => 0x50,
            Packet::Pubrel(_) => 0x62,
            Packet::Pubcomp(_) => 0x70,
            Packet::Subscribe(_) => 0x82,
            Packet::Suback(_) => 0x90,
            Packet::Unsubscribe(_) => 0xA2,
            Packet::Unsuback(_) => 0xB0,
            Packet::Pingreq => 0xC0,
            Packet::Pingresp => 0xD0,
            Packet::Disconnect => 0xE0,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        let mut body = BytesMut::new();
        match self {
            Packet::Connect(c) => {
                write_string(&mut body, PROTOCOL_NAME)?;
                body.put_u8(PROTOCOL_LEVEL);
                let mut flags = 0u8;
                if c.clean_session {
                    flags |= 0x02;
                }
                if c.password.is_some() {
                    flags |= 0x40;
                }
                if c.username.is_some() {
                    flags |= 0x80;
                }
                body.put_u8(flags);
                body.put_u16(c.keep_alive_secs);
                write_string(&mut body, &c.client_id)?;
                if let Some(username) = &c.username {
                    write_string(&mut body, username)?;
                }
                if let Some(password) = &c.password {
                    write_string(&mut body, password)?;
                }
            }
            Packet::Connack(c) => {
                body.put_u8(u8::from(c.session_present));
                body.put_u8(c.return_code);
            }
            Packet::Publish(p) => {
                write_string(&mut body, &p.topic)?;
                if p.qos != Qos::AtMostOnce {
                    let id = p.packet_id.ok_or_else(|| {
                        PubSubError::Encoding("qos>0 publish without packet id".into())
                    })?;
                    body.put_u16(id);
                }
                body.put_slice(&p.payload);
            }
            Packet::Puback(id)
            | Packet::Pubrec(id)
            | Packet::Pubrel(id)
            | Packet::Pubcomp(id)
            | Packet::Unsuback(id) => {
                body.put_u16(*id);
            }
            Packet::Subscribe(s) => {
                body.put_u16(s.packet_id);
                for (topic, qos) in &s.topics {
                    write_string(&mut body, topic)?;
                    body.put_u8(*qos as u8);
                }
            }
            Packet::Suback(s) => {
                body.put_u16(s.packet_id);
                for code in &s.return_codes {
                    body.put_u8(*code);
                }
            }
            Packet::Unsubscribe(u) => {
                body.put_u16(u.packet_id);
                for topic in &u.topics {
                    write_string(&mut body, topic)?;
                }
            }
            Packet::Pingreq | Packet::Pingresp | Packet::Disconnect => {}
        }

        buf.put_u8(self.type_byte());
        write_remaining_length(buf, body.len())?;
        buf.put_slice(&body);
        Ok(())
    }
}

// -- decoding ---------------------------------------------------------------

fn take<'a>(buf: &'a [u8], pos: &mut usize, n: usize) -> Result<&'a [u8]> {
    let slice = buf
        .get(*pos..*pos + n)
        .ok_or_else(|| PubSubError::Decoding("mqtt packet body too short".into()))?;
    *pos += n;
    Ok(slice)
}

fn read_u8(buf: &[u8], pos: &mut usize) -> Result<u8> {
    Ok(take(buf, pos, 1)?[0])
}

fn read_u16(buf: &[u8], pos: &mut usize) -> Result<u16> {
    Ok(u16::from_be_bytes(take(buf, pos, 2)?.try_into().unwrap()))
}

fn read_string(buf: &[u8], pos: &mut usize) -> Result<String> {
    let len = read_u16(buf, pos)? as usize;
    let bytes = take(buf, pos, len)?;
    String::from_utf8(bytes.to_vec())
        .map_err(|_| PubSubError::Decoding("invalid utf-8 in mqtt string".into()))
}

fn decode_body(type_byte: u8, body: &[u8]) -> Result<Packet> {
    let mut pos = 0;
    let packet = match type_byte >> 4 {
        2 => {
            let flags = read_u8(body, &mut pos)?;
            Packet::Connack(Connack {
                session_present: flags & 0x01 != 0,
                return_code: read_u8(body, &mut pos)?,
            })
        }
        3 => {
            let qos = Qos::try_from((type_byte >> 1) & 0x03)
                .map_err(|_| PubSubError::Decoding("publish with invalid qos".into()))?;
            let topic = read_string(body, &mut pos)?;
            let packet_id = if qos != Qos::AtMostOnce {
                Some(read_u16(body, &mut pos)?)
            } else {
                None
            };
            Packet::Publish(Publish {
                dup: type_byte & 0x08 != 0,
                qos,
                retain: type_byte & 0x01 != 0,
                topic,
                packet_id,
                payload: body[pos..].to_vec(),
            })
        }
        4 => Packet::Puback(read_u16(body, &mut pos)?),
        5 => Packet::Pubrec(read_u16(body, &mut pos)?),
        6 => Packet::Pubrel(read_u16(body, &mut pos)?),
        7 => Packet::Pubcomp(read_u16(body, &mut pos)?),
        8 => {
            let packet_id = read_u16(body, &mut pos)?;
            let mut topics = Vec::new();
            while pos < body.len() {
                let topic = read_string(body, &mut pos)?;
                let qos = Qos::try_from(read_u8(body, &mut pos)?)
                    .map_err(|_| PubSubError::Decoding("subscribe with invalid qos".into()))?;
                topics.push((topic, qos));
            }
            Packet::Subscribe(Subscribe { packet_id, topics })
        }
        9 => {
            let packet_id = read_u16(body, &mut pos)?;
            Packet::Suback(Suback {
                packet_id,
                return_codes: body[pos..].to_vec(),
            })
        }
        10 => {
            let packet_id = read_u16(body, &mut pos)?;
            let mut topics = Vec::new();
            while pos < body.len() {
                topics.push(read_string(body, &mut pos)?);
            }
            Packet::Unsubscribe(Unsubscribe { packet_id, topics })
        }
        11 => Packet::Unsuback(read_u16(body, &mut pos)?),
        12 => Packet::Pingreq,
        13 => Packet::Pingresp,
        14 => Packet::Disconnect,
        other => {
            return Err(PubSubError::Decoding(format!(
                "unexpected mqtt packet type {other}"
            )))
        }
    };
    Ok(packet)
}

/// Incremental parser over a TCP byte stream. Bytes are appended as they
/// arrive; complete packets are popped off the front.
pub(crate) struct MqttParser {
    buf: Vec<u8>,
    limit: usize,
}

impl MqttParser {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
        }
    }

    pub fn push(&mut self, data: &[u8]) -> Result<()> {
        if self.buf.len() + data.len() > self.limit {
            return Err(PubSubError::Communication(
                "mqtt receive buffer overflow".into(),
            ));
        }
        self.buf.extend_from_slice(data);
        Ok(())
    }

    /// Pop the next complete packet, or `None` when more bytes are needed.
    pub fn next_packet(&mut self) -> Result<Option<Packet>> {
        if self.buf.len() < 2 {
            return Ok(None);
        }

        // Remaining-length varint, at most 4 bytes.
        let mut remaining = 0usize;
        let mut multiplier = 1usize;
        let mut header_len = 1;
        loop {
            let Some(&byte) = self.buf.get(header_len) else {
                return Ok(None);
            };
            remaining += (byte & 0x7F) as usize * multiplier;
            multiplier *= 128;
            header_len += 1;
            if byte & 0x80 == 0 {
                break;
            }
            if header_len > 4 {
                return Err(PubSubError::Decoding(
                    "malformed mqtt remaining length".into(),
                ));
            }
        }

        let total = header_len + remaining;
        if self.buf.len() < total {
            return Ok(None);
        }

        let packet = decode_body(self.buf[0], &self.buf[header_len..total])?;
        debug!(?packet, "mqtt packet received");
        self.buf.drain(..total);
        Ok(Some(packet))
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(packet: &Packet) -> BytesMut {
        let mut buf = BytesMut::new();
        packet.encode(&mut buf).unwrap();
        buf
    }

    #[test]
    fn test_connect_byte_image() {
        let buf = encode(&Packet::Connect(Connect {
            client_id: "test-id".into(),
            username: None,
            password: None,
            keep_alive_secs: 60,
            clean_session: false,
        }));
        assert_eq!(
            &buf[..],
            &[
                0x10, 19, // fixed header
                0, 4, b'M', b'Q', b'T', b'T', 4, // protocol name + level
                0x00, 0, 60, // flags + keepalive
                0, 7, b't', b'e', b's', b't', b'-', b'i', b'd',
            ]
        );
    }

    #[test]
    fn test_connect_flags_for_credentials() {
        let buf = encode(&Packet::Connect(Connect {
            client_id: "c".into(),
            username: Some("user".into()),
            password: Some("pass".into()),
            keep_alive_secs: 10,
            clean_session: true,
        }));
        // flags byte: username | password | clean session
        assert_eq!(buf[9], 0x80 | 0x40 | 0x02);
    }

    #[test]
    fn test_publish_qos_flag_mapping() {
        for (qos, expected) in [
            (Qos::AtMostOnce, 0x30),
            (Qos::AtLeastOnce, 0x32),
            (Qos::ExactlyOnce, 0x34),
        ] {
            let buf = encode(&Packet::Publish(Publish {
                dup: false,
                qos,
                retain: false,
                topic: "t".into(),
                packet_id: (qos != Qos::AtMostOnce).then_some(1),
                payload: vec![0xAB],
            }));
            assert_eq!(buf[0], expected, "{qos:?}");
        }
    }

    #[test]
    fn test_qos_try_from_rejects_out_of_range() {
        assert!(Qos::try_from(0).is_ok());
        assert!(Qos::try_from(2).is_ok());
        let err = Qos::try_from(3).unwrap_err();
        assert!(matches!(err, PubSubError::InvalidArgument(_)));
    }

    #[test]
    fn test_publish_round_trip() {
        let publish = Packet::Publish(Publish {
            dup: false,
            qos: Qos::AtLeastOnce,
            retain: false,
            topic: "plant/line1".into(),
            packet_id: Some(77),
            payload: vec![1, 2, 3, 4],
        });
        let buf = encode(&publish);

        let mut parser = MqttParser::new(1024);
        parser.push(&buf).unwrap();
        assert_eq!(parser.next_packet().unwrap(), Some(publish));
        assert_eq!(parser.buffered(), 0);
    }

    #[test]
    fn test_parser_handles_split_and_coalesced_packets() {
        let mut stream = BytesMut::new();
        Packet::Pingresp.encode(&mut stream).unwrap();
        Packet::Puback(9).encode(&mut stream).unwrap();

        let mut parser = MqttParser::new(1024);
        // Feed byte by byte; packets must pop out exactly twice.
        let mut packets = Vec::new();
        for byte in stream.iter() {
            parser.push(&[*byte]).unwrap();
            while let Some(p) = parser.next_packet().unwrap() {
                packets.push(p);
            }
        }
        assert_eq!(packets, vec![Packet::Pingresp, Packet::Puback(9)]);
    }

    #[test]
    fn test_parser_enforces_receive_buffer_limit() {
        let mut parser = MqttParser::new(4);
        parser.push(&[1, 2, 3]).unwrap();
        let err = parser.push(&[4, 5]).unwrap_err();
        assert!(matches!(err, PubSubError::Communication(_)));
    }

    #[test]
    fn test_subscribe_unsubscribe_round_trip() {
        let subscribe = Packet::Subscribe(Subscribe {
            packet_id: 5,
            topics: vec![("customTopic".into(), Qos::AtLeastOnce)],
        });
        let unsubscribe = Packet::Unsubscribe(Unsubscribe {
            packet_id: 6,
            topics: vec!["customTopic".into()],
        });

        let mut buf = BytesMut::new();
        subscribe.encode(&mut buf).unwrap();
        unsubscribe.encode(&mut buf).unwrap();

        let mut parser = MqttParser::new(1024);
        parser.push(&buf).unwrap();
        // The broker-bound packets decode as themselves (loopback testing).
        assert_eq!(parser.next_packet().unwrap(), Some(subscribe));
        assert_eq!(parser.next_packet().unwrap(), Some(unsubscribe));
    }

    #[test]
    fn test_remaining_length_multi_byte() {
        let mut buf = BytesMut::new();
        write_remaining_length(&mut buf, 321).unwrap();
        assert_eq!(&buf[..], &[0xC1, 0x02]);
    }
}
