//! UDP transport.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::num::NonZeroUsize;
use std::time::Duration;

use bytes::Bytes;
use lru::LruCache;
use tracing::{debug, trace};

use crate::common::Address;
use crate::messenger::Packet;

use super::Transport;

/// Largest payload a UDP datagram can carry.
const MAX_DATAGRAM_SIZE: usize = 65_507;

/// The maximum duration to block waiting for incoming packets.
/// Lower values reduce how long control messages wait, at the cost of CPU usage.
pub const MAX_THREAD_BLOCK_DURATION: Duration = Duration::from_millis(10);

/// Hostnames resolved through the system resolver that are remembered.
const RESOLVED_CACHE_SIZE: usize = 256;

#[derive(Debug)]
/// [Transport] over a [UdpSocket], one JSON-RPC batch per datagram.
pub struct UdpTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
    buf: Vec<u8>,
    /// Resolved hostnames, IP literals are never looked up.
    resolved: LruCache<(String, u16), SocketAddr>,
}

impl UdpTransport {
    /// Bind a socket to `address`, use port `0` for a random port.
    pub fn bind(address: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(address)?;
        socket.set_read_timeout(Some(MAX_THREAD_BLOCK_DURATION))?;

        let local_addr = socket.local_addr()?;

        Ok(Self {
            socket,
            local_addr,
            buf: vec![0; MAX_DATAGRAM_SIZE],
            resolved: LruCache::new(
                NonZeroUsize::new(RESOLVED_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN),
            ),
        })
    }

    /// Change how long [Transport::read] blocks, [Duration::ZERO] makes it non-blocking.
    pub fn with_poll_interval(self, interval: Duration) -> io::Result<Self> {
        if interval.is_zero() {
            self.socket.set_nonblocking(true)?;
        } else {
            self.socket.set_nonblocking(false)?;
            self.socket.set_read_timeout(Some(interval))?;
        }

        Ok(self)
    }

    // === Getters ===

    /// Returns the address the socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    // === Private Methods ===

    fn resolve(&mut self, address: &Address) -> io::Result<SocketAddr> {
        if let Ok(ip) = address.hostname.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, address.port));
        }

        let key = (address.hostname.clone(), address.port);

        if let Some(target) = self.resolved.get(&key) {
            return Ok(*target);
        }

        let target = (address.hostname.as_str(), address.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::AddrNotAvailable, address.to_string())
            })?;

        debug!(context = "udp_transport", %address, %target, "Resolved hostname");

        self.resolved.put(key, target);

        Ok(target)
    }
}

impl Transport for UdpTransport {
    fn write(&mut self, packet: &Packet) -> io::Result<()> {
        let target = self.resolve(packet.receiver.address())?;

        trace!(context = "udp_transport", %target, size = packet.buffer.len(), "Sending packet");

        self.socket.send_to(&packet.buffer, target)?;

        Ok(())
    }

    fn read(&mut self) -> io::Result<Option<Bytes>> {
        match self.socket.recv_from(&mut self.buf) {
            Ok((size, from)) => {
                trace!(context = "udp_transport", %from, size, "Received packet");

                Ok(Some(Bytes::copy_from_slice(&self.buf[..size])))
            }
            Err(error)
                if matches!(
                    error.kind(),
                    io::ErrorKind::WouldBlock
                        | io::ErrorKind::TimedOut
                        | io::ErrorKind::ConnectionReset
                        | io::ErrorKind::ConnectionRefused
                ) =>
            {
                Ok(None)
            }
            Err(error) => Err(error),
        }
    }

    /// Unspecified bind addresses are advertised as the loopback address.
    fn local_address(&self) -> Address {
        let ip = match self.local_addr.ip() {
            IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
            ip => ip,
        };

        Address::new(ip.to_string(), self.local_addr.port())
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use crate::common::{Contact, Id};
    use crate::messenger::{encode, Message, Outbound};

    use super::*;

    #[test]
    fn send_and_receive() {
        let mut a = UdpTransport::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        let mut b = UdpTransport::bind(SocketAddr::from(([0, 0, 0, 0], 0))).unwrap();

        assert_eq!(b.local_address().hostname, "127.0.0.1");
        assert_eq!(b.local_address().port, b.local_addr().port());

        let packet = encode(Outbound {
            message: Message::request("PING", json!([])),
            sender: Contact::new(Id::random(), a.local_address()),
            receiver: Contact::new(Id::random(), b.local_address()),
        })
        .unwrap();

        a.write(&packet).unwrap();

        let mut received = None;
        for _ in 0..100 {
            if let Some(buffer) = b.read().unwrap() {
                received = Some(buffer);
                break;
            }
        }

        assert_eq!(received, Some(packet.buffer));
        assert_eq!(a.read().unwrap(), None);
    }

    #[test]
    fn resolve_caches_hostnames_only() {
        let mut transport = UdpTransport::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();

        assert_eq!(
            transport.resolve(&Address::new("10.0.0.7", 6881)).unwrap(),
            SocketAddr::from(([10, 0, 0, 7], 6881))
        );
        assert_eq!(
            transport.resolve(&Address::new("::1", 6881)).unwrap(),
            SocketAddr::from((Ipv6Addr::LOCALHOST, 6881))
        );
        assert!(transport.resolved.is_empty());

        let target = transport.resolve(&Address::new("localhost", 6881)).unwrap();
        assert!(target.ip().is_loopback());
        assert_eq!(target.port(), 6881);
        assert_eq!(transport.resolved.len(), 1);

        assert_eq!(
            transport.resolve(&Address::new("localhost", 6881)).unwrap(),
            target
        );
        assert_eq!(transport.resolved.len(), 1);
    }

    #[test]
    fn non_blocking() {
        let mut transport = UdpTransport::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .unwrap()
            .with_poll_interval(Duration::ZERO)
            .unwrap();

        assert_eq!(transport.read().unwrap(), None);
    }
}
