//! UDP channel: unicast or multicast datagrams.
//!
//! One socket on an ephemeral port does the sending; the receive socket is
//! bound to the configured port lazily, on the first `receive` call, so a
//! publish-only and a subscribe-only connection to the same address can
//! coexist on one host.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::Duration;

use tracing::{debug, trace};

use crate::error::{PubSubError, Result};
use crate::transport::{Channel, TransportUrl};

const MAX_DATAGRAM: usize = 65_535;

pub struct UdpChannel {
    target: SocketAddr,
    send_socket: Option<UdpSocket>,
    recv_socket: Option<UdpSocket>,
    group: Option<Ipv4Addr>,
}

impl UdpChannel {
    pub fn open(url: &TransportUrl) -> Result<Self> {
        let target = (url.host.as_str(), url.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                PubSubError::InvalidArgument(format!("cannot resolve host: {}", url.host))
            })?;

        let group = match target.ip() {
            IpAddr::V4(ip) if ip.is_multicast() => Some(ip),
            IpAddr::V6(ip) if ip.is_multicast() => {
                return Err(PubSubError::NotSupported("ipv6 multicast".into()))
            }
            _ => None,
        };

        let send_socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        if group.is_some() {
            send_socket.set_multicast_loop_v4(true)?;
            send_socket.set_multicast_ttl_v4(1)?;
        }
        debug!(%target, multicast = group.is_some(), "udp channel open");

        Ok(Self {
            target,
            send_socket: Some(send_socket),
            recv_socket: None,
            group,
        })
    }

    fn recv_socket(&mut self) -> Result<&UdpSocket> {
        if self.send_socket.is_none() {
            return Err(PubSubError::NotConnected);
        }
        if self.recv_socket.is_none() {
            let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, self.target.port()))?;
            if let Some(group) = self.group {
                socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
            }
            debug!(port = self.target.port(), "udp receive socket bound");
            self.recv_socket = Some(socket);
        }
        self.recv_socket.as_ref().ok_or(PubSubError::NotConnected)
    }
}

fn timed_out(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

impl Channel for UdpChannel {
    fn send(&mut self, buf: &[u8]) -> Result<()> {
        let socket = self.send_socket.as_ref().ok_or(PubSubError::NotConnected)?;
        let sent = socket.send_to(buf, self.target)?;
        trace!(bytes = sent, target = %self.target, "udp send");
        Ok(())
    }

    fn receive(&mut self, timeout: Duration, on_message: &mut dyn FnMut(&[u8])) -> Result<usize> {
        let socket = self.recv_socket()?;
        let mut scratch = [0u8; MAX_DATAGRAM];
        let mut delivered = 0;

        if !timeout.is_zero() {
            socket.set_read_timeout(Some(timeout))?;
            match socket.recv_from(&mut scratch) {
                Ok((n, from)) => {
                    trace!(bytes = n, %from, "udp receive");
                    on_message(&scratch[..n]);
                    delivered += 1;
                }
                Err(e) if timed_out(&e) => return Ok(0),
                Err(e) => return Err(e.into()),
            }
        }

        // Drain whatever else already arrived without blocking again.
        socket.set_nonblocking(true)?;
        loop {
            match socket.recv_from(&mut scratch) {
                Ok((n, from)) => {
                    trace!(bytes = n, %from, "udp receive");
                    on_message(&scratch[..n]);
                    delivered += 1;
                }
                Err(e) if timed_out(&e) => break,
                Err(e) => {
                    socket.set_nonblocking(false)?;
                    return Err(e.into());
                }
            }
        }
        socket.set_nonblocking(false)?;

        Ok(delivered)
    }

    fn poll(&mut self, _timeout: Duration) -> Result<()> {
        if self.send_socket.is_none() {
            return Err(PubSubError::NotConnected);
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let (Some(socket), Some(group)) = (&self.recv_socket, self.group) {
            // Best effort; the kernel drops membership with the socket anyway.
            let _ = socket.leave_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED);
        }
        self.recv_socket = None;
        self.send_socket = None;
        debug!(target = %self.target, "udp channel closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(url: &str) -> UdpChannel {
        UdpChannel::open(&TransportUrl::parse(url).unwrap()).unwrap()
    }

    #[test]
    fn test_unicast_loopback_send_receive() {
        let mut tx = open("opc.udp://127.0.0.1:29411/");
        let mut rx = open("opc.udp://127.0.0.1:29411/");

        // Bind the receive side first so the datagram has somewhere to land.
        let got = rx.receive(Duration::ZERO, &mut |_| {}).unwrap();
        assert_eq!(got, 0);

        tx.send(b"hello uadp").unwrap();

        let mut messages = Vec::new();
        let got = rx
            .receive(Duration::from_secs(2), &mut |b| messages.push(b.to_vec()))
            .unwrap();
        assert_eq!(got, 1);
        assert_eq!(messages[0], b"hello uadp");
    }

    #[test]
    fn test_receive_timeout_is_not_an_error() {
        let mut rx = open("opc.udp://127.0.0.1:29412/");
        let got = rx
            .receive(Duration::from_millis(50), &mut |_| panic!("no message expected"))
            .unwrap();
        assert_eq!(got, 0);
    }

    #[test]
    fn test_send_after_close_is_not_connected() {
        let mut ch = open("opc.udp://127.0.0.1:29413/");
        ch.close().unwrap();
        assert!(matches!(
            ch.send(b"x").unwrap_err(),
            PubSubError::NotConnected
        ));
        assert!(matches!(
            ch.receive(Duration::ZERO, &mut |_| {}).unwrap_err(),
            PubSubError::NotConnected
        ));
    }
}
