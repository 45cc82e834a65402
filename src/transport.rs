//! Transport channels.
//!
//! A channel moves opaque byte buffers; it knows nothing about UADP. The
//! concrete transports are selected by the scheme of the connection address:
//! `opc.udp://host:port/`, `opc.mqtt://host:port/topic`, `opc.eth://iface`.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{PubSubError, Result};

pub mod mqtt;
pub mod udp;

pub use mqtt::{MqttChannel, MqttOptions, Qos, TlsOptions};
pub use udp::UdpChannel;

/// Capability set every transport implements.
///
/// `poll` is the cooperative tick: transports that run their own protocol
/// state (MQTT) make progress there; datagram transports treat it as a
/// no-op. Buffers handed to the `receive` callback are only valid for the
/// duration of the call; the callback copies what it needs.
pub trait Channel {
    /// Hand one encoded message to the transport. Returns `Ok` once the
    /// bytes are accepted; there is no delivery guarantee.
    fn send(&mut self, buf: &[u8]) -> Result<()>;

    /// Deliver pending messages through `on_message`, waiting up to
    /// `timeout` for the first one. An expired timeout is not an error; the
    /// call returns the number of messages delivered.
    fn receive(&mut self, timeout: Duration, on_message: &mut dyn FnMut(&[u8])) -> Result<usize>;

    /// Drive transport-internal protocol state once.
    fn poll(&mut self, timeout: Duration) -> Result<()>;

    /// Tear the channel down. Further operations fail with `NotConnected`.
    fn close(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportScheme {
    Udp,
    Mqtt,
    Eth,
}

/// Parsed form of a connection address URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportUrl {
    pub scheme: TransportScheme,
    pub host: String,
    pub port: u16,
    /// Path with the leading slash stripped; carries the default topic for
    /// MQTT, empty otherwise.
    pub path: String,
}

impl TransportUrl {
    pub fn parse(url: &str) -> Result<Self> {
        let bad = || PubSubError::InvalidArgument(format!("invalid transport url: {url}"));

        if let Some(rest) = url.strip_prefix("opc.eth://") {
            let iface = rest.trim_end_matches('/');
            if iface.is_empty() {
                return Err(bad());
            }
            return Ok(Self {
                scheme: TransportScheme::Eth,
                host: iface.to_string(),
                port: 0,
                path: String::new(),
            });
        }

        let (scheme, rest, default_port) = if let Some(rest) = url.strip_prefix("opc.udp://") {
            (TransportScheme::Udp, rest, 4840)
        } else if let Some(rest) = url.strip_prefix("opc.mqtt://") {
            (TransportScheme::Mqtt, rest, 1883)
        } else {
            return Err(bad());
        };

        let (authority, path) = match rest.split_once('/') {
            Some((a, p)) => (a, p.to_string()),
            None => (rest, String::new()),
        };

        let (host, port) = match authority.rsplit_once(':') {
            Some((h, p)) => (h, p.parse::<u16>().map_err(|_| bad())?),
            None => (authority, default_port),
        };
        if host.is_empty() {
            return Err(bad());
        }

        Ok(Self {
            scheme,
            host: host.to_string(),
            port,
            path,
        })
    }
}

impl FromStr for TransportUrl {
    type Err = PubSubError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for TransportUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scheme {
            TransportScheme::Udp => write!(f, "opc.udp://{}:{}/{}", self.host, self.port, self.path),
            TransportScheme::Mqtt => {
                write!(f, "opc.mqtt://{}:{}/{}", self.host, self.port, self.path)
            }
            TransportScheme::Eth => write!(f, "opc.eth://{}", self.host),
        }
    }
}

/// Open the channel a connection address selects. The MQTT options are only
/// consulted for `opc.mqtt` addresses.
pub fn open_channel(url: &TransportUrl, mqtt: Option<&MqttOptions>) -> Result<Box<dyn Channel>> {
    match url.scheme {
        TransportScheme::Udp => Ok(Box::new(UdpChannel::open(url)?)),
        TransportScheme::Mqtt => {
            let opts = mqtt.cloned().unwrap_or_default();
            Ok(Box::new(MqttChannel::connect(url, opts)?))
        }
        TransportScheme::Eth => Err(PubSubError::NotImplemented(
            "raw ethernet transport channels",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_udp_url() {
        let url = TransportUrl::parse("opc.udp://224.0.0.22:4840/").unwrap();
        assert_eq!(url.scheme, TransportScheme::Udp);
        assert_eq!(url.host, "224.0.0.22");
        assert_eq!(url.port, 4840);
        assert_eq!(url.path, "");
    }

    #[test]
    fn test_parse_udp_url_default_port() {
        let url = TransportUrl::parse("opc.udp://239.0.0.1").unwrap();
        assert_eq!(url.port, 4840);
    }

    #[test]
    fn test_parse_mqtt_url_with_topic() {
        let url = TransportUrl::parse("opc.mqtt://broker.local:1883/customTopic").unwrap();
        assert_eq!(url.scheme, TransportScheme::Mqtt);
        assert_eq!(url.host, "broker.local");
        assert_eq!(url.port, 1883);
        assert_eq!(url.path, "customTopic");
    }

    #[test]
    fn test_parse_eth_url() {
        let url = TransportUrl::parse("opc.eth://eth0").unwrap();
        assert_eq!(url.scheme, TransportScheme::Eth);
        assert_eq!(url.host, "eth0");
    }

    #[test]
    fn test_unknown_scheme_is_invalid_argument() {
        for url in ["opc.amqp://host:1/", "http://host/", "opc.udp:/missing"] {
            let err = TransportUrl::parse(url).unwrap_err();
            assert!(matches!(err, PubSubError::InvalidArgument(_)), "{url}");
        }
    }

    #[test]
    fn test_bad_port_is_invalid_argument() {
        let err = TransportUrl::parse("opc.udp://host:notaport/").unwrap_err();
        assert!(matches!(err, PubSubError::InvalidArgument(_)));
    }

    #[test]
    fn test_display_round_trip() {
        let url = TransportUrl::parse("opc.mqtt://broker:1883/t1").unwrap();
        assert_eq!(TransportUrl::parse(&url.to_string()).unwrap(), url);
    }

    #[test]
    fn test_eth_channels_are_not_implemented() {
        let url = TransportUrl::parse("opc.eth://eth0").unwrap();
        let err = open_channel(&url, None).unwrap_err();
        assert!(matches!(err, PubSubError::NotImplemented(_)));
    }
}
