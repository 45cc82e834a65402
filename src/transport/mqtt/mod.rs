//! MQTT channel.
//!
//! Wraps a plain TCP (or TLS) connection to a broker and speaks just enough
//! MQTT 3.1.1 for the PubSub data plane: CONNECT/CONNACK, PUBLISH with QoS
//! 0..2 including the acknowledgement handshakes, SUBSCRIBE/UNSUBSCRIBE and
//! keep-alive pings. The connection address carries the default topic:
//! `opc.mqtt://host:port/topic`.

use std::collections::{BTreeSet, VecDeque};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::error::{PubSubError, Result};
use crate::transport::{Channel, TransportUrl};

pub mod codec;
#[cfg(feature = "tls")]
mod tls;

use codec::{Connect, MqttParser, Packet, Publish, Subscribe, Unsubscribe};
pub use codec::Qos;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_CHUNK: usize = 4096;

/// TLS settings for `opc.mqtt` connections. Client certificate and key are
/// configured together or not at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsOptions {
    pub ca_file: PathBuf,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqttOptions {
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    pub clean_session: bool,
    /// QoS used when the engine publishes through `Channel::send`.
    pub publish_qos: Qos,
    /// QoS requested when subscribing to the default topic.
    pub subscribe_qos: Qos,
    /// Upper bound for one encoded outbound packet. Fixed for the lifetime
    /// of the channel.
    pub send_buffer_size: usize,
    /// Upper bound for buffered unparsed inbound bytes.
    pub recv_buffer_size: usize,
    pub tls: Option<TlsOptions>,
}

impl Default for MqttOptions {
    fn default() -> Self {
        Self {
            client_id: "uapub".into(),
            username: None,
            password: None,
            keep_alive: Duration::from_secs(60),
            clean_session: true,
            publish_qos: Qos::AtMostOnce,
            subscribe_qos: Qos::AtMostOnce,
            send_buffer_size: 64 * 1024,
            recv_buffer_size: 64 * 1024,
            tls: None,
        }
    }
}

enum MqttStream {
    Plain(TcpStream),
    #[cfg(feature = "tls")]
    Tls(Box<tls::TlsStream>),
}

impl MqttStream {
    fn tcp(&self) -> &TcpStream {
        match self {
            MqttStream::Plain(s) => s,
            #[cfg(feature = "tls")]
            MqttStream::Tls(t) => &t.sock,
        }
    }
}

impl Read for MqttStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            MqttStream::Plain(s) => s.read(buf),
            #[cfg(feature = "tls")]
            MqttStream::Tls(t) => t.read(buf),
        }
    }
}

impl Write for MqttStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            MqttStream::Plain(s) => s.write(buf),
            #[cfg(feature = "tls")]
            MqttStream::Tls(t) => t.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            MqttStream::Plain(s) => s.flush(),
            #[cfg(feature = "tls")]
            MqttStream::Tls(t) => t.flush(),
        }
    }
}

fn connack_reason(code: u8) -> &'static str {
    match code {
        1 => "unacceptable protocol version",
        2 => "client identifier rejected",
        3 => "server unavailable",
        4 => "bad user name or password",
        5 => "not authorized",
        _ => "unknown CONNACK return code",
    }
}

fn map_io(e: std::io::Error) -> PubSubError {
    use std::io::ErrorKind::*;
    match e.kind() {
        ConnectionRefused => PubSubError::ConnectionRejected("tcp connection refused".into()),
        UnexpectedEof | ConnectionReset | ConnectionAborted | BrokenPipe | NotConnected => {
            PubSubError::NotConnected
        }
        _ => PubSubError::Network(e),
    }
}

fn is_timeout(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

pub struct MqttChannel {
    stream: Option<MqttStream>,
    parser: MqttParser,
    opts: MqttOptions,
    default_topic: String,
    subscribed: Vec<String>,
    next_packet_id: u16,
    /// Outbound QoS 1 publishes waiting for PUBACK.
    awaiting_puback: BTreeSet<u16>,
    /// Outbound QoS 2 publishes waiting for PUBREC.
    awaiting_pubrec: BTreeSet<u16>,
    /// Outbound QoS 2 publishes (PUBREL sent) waiting for PUBCOMP.
    awaiting_pubcomp: BTreeSet<u16>,
    /// Inbound QoS 2 publishes (PUBREC sent) waiting for PUBREL.
    awaiting_pubrel: BTreeSet<u16>,
    inbound: VecDeque<Vec<u8>>,
    last_tx: Instant,
}

impl MqttChannel {
    /// Open a broker connection: TCP, optional TLS handshake, MQTT CONNECT,
    /// then wait for the CONNACK. On any failure everything acquired so far
    /// is released before returning; the caller never has to clean up a
    /// half-connected channel.
    pub fn connect(url: &TransportUrl, opts: MqttOptions) -> Result<Self> {
        #[cfg(not(feature = "tls"))]
        if opts.tls.is_some() {
            return Err(PubSubError::InvalidArgument(
                "TLS requested but uapub was built without the `tls` feature".into(),
            ));
        }
        if let Some(tls) = &opts.tls {
            if tls.cert_file.is_some() != tls.key_file.is_some() {
                return Err(PubSubError::InvalidArgument(
                    "client certificate and key must be configured together".into(),
                ));
            }
        }
        let default_topic = url.path.trim_matches('/').to_string();
        if default_topic.is_empty() {
            return Err(PubSubError::InvalidArgument(
                "mqtt connection address must carry a topic".into(),
            ));
        }

        let tcp = TcpStream::connect((url.host.as_str(), url.port)).map_err(map_io)?;
        tcp.set_nodelay(true)?;

        #[cfg(feature = "tls")]
        let stream = match &opts.tls {
            Some(tls_opts) => MqttStream::Tls(Box::new(tls::wrap(tcp, &url.host, tls_opts)?)),
            None => MqttStream::Plain(tcp),
        };
        #[cfg(not(feature = "tls"))]
        let stream = MqttStream::Plain(tcp);

        let mut channel = Self {
            stream: Some(stream),
            parser: MqttParser::new(opts.recv_buffer_size),
            default_topic,
            subscribed: Vec::new(),
            next_packet_id: 0,
            awaiting_puback: BTreeSet::new(),
            awaiting_pubrec: BTreeSet::new(),
            awaiting_pubcomp: BTreeSet::new(),
            awaiting_pubrel: BTreeSet::new(),
            inbound: VecDeque::new(),
            last_tx: Instant::now(),
            opts,
        };

        channel.send_packet(&Packet::Connect(Connect {
            client_id: channel.opts.client_id.clone(),
            username: channel.opts.username.clone(),
            password: channel.opts.password.clone(),
            keep_alive_secs: channel.opts.keep_alive.as_secs().min(u16::MAX as u64) as u16,
            clean_session: channel.opts.clean_session,
        }))?;
        channel.wait_for_connack()?;

        info!(topic = %channel.default_topic, "mqtt channel connected");
        Ok(channel)
    }

    fn wait_for_connack(&mut self) -> Result<()> {
        let deadline = Instant::now() + CONNECT_TIMEOUT;
        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or_else(|| {
                    PubSubError::Communication("timed out waiting for CONNACK".into())
                })?;
            self.read_available(remaining.min(Duration::from_millis(200)))?;
            match self.parser.next_packet()? {
                Some(Packet::Connack(ack)) => {
                    return if ack.return_code == 0 {
                        Ok(())
                    } else {
                        Err(PubSubError::ConnectionRejected(
                            connack_reason(ack.return_code).into(),
                        ))
                    };
                }
                Some(other) => {
                    warn!(?other, "unexpected packet before CONNACK");
                    return Err(PubSubError::Communication(
                        "protocol violation: expected CONNACK".into(),
                    ));
                }
                None => {}
            }
        }
    }

    fn next_packet_id(&mut self) -> u16 {
        // Packet id 0 is reserved by the protocol.
        self.next_packet_id = self.next_packet_id.wrapping_add(1);
        if self.next_packet_id == 0 {
            self.next_packet_id = 1;
        }
        self.next_packet_id
    }

    fn send_packet(&mut self, packet: &Packet) -> Result<()> {
        let mut buf = BytesMut::new();
        packet.encode(&mut buf)?;
        if buf.len() > self.opts.send_buffer_size {
            return Err(PubSubError::Communication("mqtt send buffer full".into()));
        }
        let stream = self.stream.as_mut().ok_or(PubSubError::NotConnected)?;
        stream.write_all(&buf).map_err(map_io)?;
        stream.flush().map_err(map_io)?;
        self.last_tx = Instant::now();
        trace!(bytes = buf.len(), "mqtt packet sent");
        Ok(())
    }

    /// Read whatever arrives within `timeout` into the parser. A zero
    /// timeout only drains bytes that are already queued in the kernel.
    fn read_available(&mut self, timeout: Duration) -> Result<()> {
        let mut collected = Vec::new();
        let mut outcome: Result<()> = Ok(());
        let mut peer_closed = false;

        {
            let stream = self.stream.as_mut().ok_or(PubSubError::NotConnected)?;
            let mut chunk = [0u8; READ_CHUNK];

            if timeout.is_zero() {
                stream.tcp().set_nonblocking(true)?;
            } else {
                stream.tcp().set_nonblocking(false)?;
                stream.tcp().set_read_timeout(Some(timeout))?;
            }

            match stream.read(&mut chunk) {
                Ok(0) => peer_closed = true,
                Ok(n) => collected.extend_from_slice(&chunk[..n]),
                Err(e) if is_timeout(&e) => {}
                Err(e) => outcome = Err(map_io(e)),
            }

            // Drain the rest without blocking again.
            if outcome.is_ok() && !peer_closed {
                stream.tcp().set_nonblocking(true)?;
                loop {
                    match stream.read(&mut chunk) {
                        Ok(0) => {
                            peer_closed = true;
                            break;
                        }
                        Ok(n) => collected.extend_from_slice(&chunk[..n]),
                        Err(e) if is_timeout(&e) => break,
                        Err(e) => {
                            outcome = Err(map_io(e));
                            break;
                        }
                    }
                }
                let _ = stream.tcp().set_nonblocking(false);
            }
        }

        if !collected.is_empty() {
            self.parser.push(&collected)?;
            trace!(buffered = self.parser.buffered(), "mqtt bytes buffered");
        }
        if peer_closed {
            self.teardown();
            return Err(PubSubError::NotConnected);
        }
        if let Err(e) = outcome {
            self.teardown();
            return Err(e);
        }
        Ok(())
    }

    fn handle_packet(&mut self, packet: Packet) -> Result<()> {
        match packet {
            Packet::Publish(Publish {
                qos,
                packet_id,
                payload,
                topic,
                ..
            }) => {
                trace!(%topic, bytes = payload.len(), ?qos, "inbound publish");
                self.inbound.push_back(payload);
                match (qos, packet_id) {
                    (Qos::AtMostOnce, _) => {}
                    (Qos::AtLeastOnce, Some(id)) => self.send_packet(&Packet::Puback(id))?,
                    (Qos::ExactlyOnce, Some(id)) => {
                        self.awaiting_pubrel.insert(id);
                        self.send_packet(&Packet::Pubrec(id))?;
                    }
                    _ => {
                        return Err(PubSubError::Communication(
                            "qos>0 publish without packet id".into(),
                        ))
                    }
                }
            }
            Packet::Puback(id) => {
                if !self.awaiting_puback.remove(&id) {
                    debug!(id, "unmatched PUBACK");
                }
            }
            Packet::Pubrec(id) => {
                self.awaiting_pubrec.remove(&id);
                self.awaiting_pubcomp.insert(id);
                self.send_packet(&Packet::Pubrel(id))?;
            }
            Packet::Pubrel(id) => {
                self.awaiting_pubrel.remove(&id);
                self.send_packet(&Packet::Pubcomp(id))?;
            }
            Packet::Pubcomp(id) => {
                if !self.awaiting_pubcomp.remove(&id) {
                    debug!(id, "unmatched PUBCOMP");
                }
            }
            Packet::Suback(suback) => {
                if suback.return_codes.contains(&0x80) {
                    warn!(id = suback.packet_id, "broker rejected a subscription");
                }
            }
            Packet::Unsuback(id) => {
                trace!(id, "unsubscribe acknowledged");
            }
            Packet::Pingresp => {}
            other => {
                debug!(?other, "ignoring unexpected mqtt packet");
            }
        }
        Ok(())
    }

    fn poll_inner(&mut self, timeout: Duration) -> Result<()> {
        if self.stream.is_none() {
            return Err(PubSubError::NotConnected);
        }
        self.read_available(timeout)?;
        while let Some(packet) = self.parser.next_packet()? {
            self.handle_packet(packet)?;
        }

        let keep_alive = self.opts.keep_alive;
        if !keep_alive.is_zero() && self.last_tx.elapsed() >= keep_alive {
            self.send_packet(&Packet::Pingreq)?;
        }
        Ok(())
    }

    fn teardown(&mut self) {
        // Dropping the stream closes TLS before TCP; state goes with it.
        self.stream = None;
        self.parser.clear();
        self.subscribed.clear();
        self.awaiting_puback.clear();
        self.awaiting_pubrec.clear();
        self.awaiting_pubcomp.clear();
        self.awaiting_pubrel.clear();
        self.inbound.clear();
    }

    /// Publish one message. QoS values outside 0..=2 are rejected before
    /// anything touches the wire.
    pub fn publish(&mut self, topic: &str, payload: &[u8], qos: u8) -> Result<()> {
        let qos = Qos::try_from(qos)?;
        let packet_id = match qos {
            Qos::AtMostOnce => None,
            _ => Some(self.next_packet_id()),
        };
        if let Some(id) = packet_id {
            match qos {
                Qos::AtLeastOnce => self.awaiting_puback.insert(id),
                Qos::ExactlyOnce => self.awaiting_pubrec.insert(id),
                Qos::AtMostOnce => unreachable!(),
            };
        }
        self.send_packet(&Packet::Publish(Publish {
            dup: false,
            qos,
            retain: false,
            topic: topic.to_string(),
            packet_id,
            payload: payload.to_vec(),
        }))
    }

    pub fn subscribe(&mut self, topic: &str, qos: u8) -> Result<()> {
        let qos = Qos::try_from(qos)?;
        let packet_id = self.next_packet_id();
        self.send_packet(&Packet::Subscribe(Subscribe {
            packet_id,
            topics: vec![(topic.to_string(), qos)],
        }))?;
        if !self.subscribed.iter().any(|t| t == topic) {
            self.subscribed.push(topic.to_string());
        }
        Ok(())
    }

    pub fn unsubscribe(&mut self, topic: &str) -> Result<()> {
        let packet_id = self.next_packet_id();
        self.send_packet(&Packet::Unsubscribe(Unsubscribe {
            packet_id,
            topics: vec![topic.to_string()],
        }))?;
        self.subscribed.retain(|t| t != topic);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn disconnected(opts: MqttOptions, default_topic: &str) -> Self {
        Self {
            stream: None,
            parser: MqttParser::new(opts.recv_buffer_size),
            default_topic: default_topic.to_string(),
            subscribed: Vec::new(),
            next_packet_id: 0,
            awaiting_puback: BTreeSet::new(),
            awaiting_pubrec: BTreeSet::new(),
            awaiting_pubcomp: BTreeSet::new(),
            awaiting_pubrel: BTreeSet::new(),
            inbound: VecDeque::new(),
            last_tx: Instant::now(),
            opts,
        }
    }
}

impl Channel for MqttChannel {
    fn send(&mut self, buf: &[u8]) -> Result<()> {
        let topic = self.default_topic.clone();
        let qos = self.opts.publish_qos as u8;
        self.publish(&topic, buf, qos)
    }

    fn receive(&mut self, timeout: Duration, on_message: &mut dyn FnMut(&[u8])) -> Result<usize> {
        if !self.subscribed.iter().any(|t| t == &self.default_topic) {
            let topic = self.default_topic.clone();
            let qos = self.opts.subscribe_qos as u8;
            self.subscribe(&topic, qos)?;
        }
        self.poll_inner(timeout)?;

        let mut delivered = 0;
        while let Some(payload) = self.inbound.pop_front() {
            on_message(&payload);
            delivered += 1;
        }
        Ok(delivered)
    }

    fn poll(&mut self, timeout: Duration) -> Result<()> {
        self.poll_inner(timeout)
    }

    fn close(&mut self) -> Result<()> {
        if self.stream.is_some() {
            // Best effort; the peer may already be gone.
            let _ = self.send_packet(&Packet::Disconnect);
            self.teardown();
            info!(topic = %self.default_topic, "mqtt channel closed");
        }
        Ok(())
    }
}
