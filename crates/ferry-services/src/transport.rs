//! Datagram transport capability.
//!
//! [`Transport`] is the only place that knows how to build a socket for an
//! address family. Protocol code is written once against [`Endpoint`], which
//! speaks [`WireMessage`] over any transport; tests inject lossy transports
//! through the same seam.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::time::Instant;

use ferry_core::wire::{WireMessage, MAX_DATAGRAM};

/// Receive buffer. Anything larger than a valid datagram is truncated and
/// then rejected by the decoder.
const RECV_BUFFER: usize = 2048;

/// Family-specific socket construction plus raw datagram I/O.
pub trait Transport: Send + Sync + Sized + 'static {
    fn bind(addr: SocketAddr) -> impl Future<Output = io::Result<Self>> + Send;

    fn local_addr(&self) -> io::Result<SocketAddr>;

    fn send_to(
        &self,
        buf: &[u8],
        target: SocketAddr,
    ) -> impl Future<Output = io::Result<usize>> + Send;

    fn recv_from(
        &self,
        buf: &mut [u8],
    ) -> impl Future<Output = io::Result<(usize, SocketAddr)>> + Send;
}

// ── UDP ───────────────────────────────────────────────────────────────────────

/// Plain UDP. IPv6 sockets are bound v6-only so each family runs its own
/// stack and a v4 client is never answered from a v6 socket.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
}

impl Transport for UdpTransport {
    async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
        if addr.is_ipv6() {
            socket.set_only_v6(true)?;
        }
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        let socket = UdpSocket::from_std(socket.into())?;
        Ok(Self { socket })
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(buf, target).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }
}

// ── Endpoint ──────────────────────────────────────────────────────────────────

/// A bound transport that sends and receives whole protocol messages.
#[derive(Debug)]
pub struct Endpoint<T = UdpTransport> {
    transport: T,
    local_addr: SocketAddr,
}

impl<T: Transport> Endpoint<T> {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let transport = T::bind(addr).await?;
        let local_addr = transport.local_addr()?;
        Ok(Self {
            transport,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub async fn send(&self, msg: &WireMessage, dest: SocketAddr) -> io::Result<()> {
        let bytes = msg
            .encode()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        debug_assert!(bytes.len() <= MAX_DATAGRAM);
        self.transport.send_to(&bytes, dest).await?;
        tracing::debug!(%dest, message = %msg, "SEND");
        Ok(())
    }

    /// Next well-formed message. Undecodable datagrams are logged and skipped.
    pub async fn recv(&self) -> io::Result<(WireMessage, SocketAddr)> {
        let mut buf = [0u8; RECV_BUFFER];
        loop {
            let (len, from) = match self.transport.recv_from(&mut buf).await {
                Ok(r) => r,
                // ICMP port-unreachable from an earlier send surfaces here on
                // some platforms; it says nothing about this socket.
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused
                    ) =>
                {
                    tracing::debug!(error = %e, "ignoring transient recv error");
                    continue;
                }
                Err(e) => return Err(e),
            };
            match WireMessage::decode(&buf[..len]) {
                Ok(msg) => {
                    tracing::debug!(%from, message = %msg, "RECV");
                    return Ok((msg, from));
                }
                Err(e) => {
                    tracing::warn!(%from, len, error = %e, "dropping malformed datagram");
                }
            }
        }
    }

    /// Like [`recv`](Self::recv) but gives up at `deadline`, returning `None`.
    pub async fn recv_until(
        &self,
        deadline: Instant,
    ) -> io::Result<Option<(WireMessage, SocketAddr)>> {
        match tokio::time::timeout_at(deadline, self.recv()).await {
            Ok(r) => r.map(Some),
            Err(_) => Ok(None),
        }
    }

    pub async fn recv_timeout(
        &self,
        wait: Duration,
    ) -> io::Result<Option<(WireMessage, SocketAddr)>> {
        self.recv_until(Instant::now() + wait).await
    }
}

/// `addr` on another port. IPv6 flow info and scope id are kept, so a
/// link-local peer stays reachable through the interface it came in on.
pub fn with_port(addr: SocketAddr, port: u16) -> SocketAddr {
    let mut addr = addr;
    addr.set_port(port);
    addr
}

/// Collapse IPv4-mapped IPv6 addresses to plain IPv4 so the peer's family
/// is judged by what it really is.
pub fn canonical_addr(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
            Some(v4) => SocketAddr::from((v4, v6.port())),
            None => addr,
        },
        SocketAddr::V4(_) => addr,
    }
}
