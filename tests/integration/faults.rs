//! Fault-injecting transports and the transfers that survive them.

use crate::*;

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use ferry_core::wire::{MessageType, HEADER_LEN};
use ferry_ctl::TransferEnd;
use ferry_services::{FileStream, UdpTransport};

// ── LossyTransport ───────────────────────────────────────────────────────────

/// Data MSGs handed to any `LossyTransport`, dropped or not.
static LOSSY_DATA_SENDS: AtomicUsize = AtomicUsize::new(0);

/// Drops every third outgoing datagram per socket. FIN is never retransmitted
/// by the protocol, so the channel lets it through.
pub struct LossyTransport {
    inner: UdpTransport,
    sent: AtomicUsize,
}

fn kind_of(buf: &[u8]) -> Option<MessageType> {
    buf.first().and_then(|b| MessageType::try_from(*b).ok())
}

fn carries_data(buf: &[u8]) -> bool {
    kind_of(buf) == Some(MessageType::Msg) && buf.len() > HEADER_LEN
}

impl Transport for LossyTransport {
    fn bind(addr: SocketAddr) -> impl Future<Output = io::Result<Self>> + Send {
        async move {
            Ok(Self {
                inner: UdpTransport::bind(addr).await?,
                sent: AtomicUsize::new(0),
            })
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    fn send_to(
        &self,
        buf: &[u8],
        target: SocketAddr,
    ) -> impl Future<Output = io::Result<usize>> + Send {
        async move {
            if carries_data(buf) {
                LOSSY_DATA_SENDS.fetch_add(1, Ordering::SeqCst);
            }
            if kind_of(buf) != Some(MessageType::Fin) {
                let n = self.sent.fetch_add(1, Ordering::SeqCst) + 1;
                if n % 3 == 0 {
                    return Ok(buf.len());
                }
            }
            self.inner.send_to(buf, target).await
        }
    }

    fn recv_from(
        &self,
        buf: &mut [u8],
    ) -> impl Future<Output = io::Result<(usize, SocketAddr)>> + Send {
        self.inner.recv_from(buf)
    }
}

// ── CorruptingTransport ──────────────────────────────────────────────────────

/// Flips a payload byte in every other data MSG, leaving the carried hash
/// untouched.
pub struct CorruptingTransport {
    inner: UdpTransport,
    data_sent: AtomicUsize,
}

impl Transport for CorruptingTransport {
    fn bind(addr: SocketAddr) -> impl Future<Output = io::Result<Self>> + Send {
        async move {
            Ok(Self {
                inner: UdpTransport::bind(addr).await?,
                data_sent: AtomicUsize::new(0),
            })
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    fn send_to(
        &self,
        buf: &[u8],
        target: SocketAddr,
    ) -> impl Future<Output = io::Result<usize>> + Send {
        async move {
            if carries_data(buf) && self.data_sent.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
                let mut bad = buf.to_vec();
                if let Some(last) = bad.last_mut() {
                    *last ^= 0xFF;
                }
                return self.inner.send_to(&bad, target).await;
            }
            self.inner.send_to(buf, target).await
        }
    }

    fn recv_from(
        &self,
        buf: &mut [u8],
    ) -> impl Future<Output = io::Result<(usize, SocketAddr)>> + Send {
        self.inner.recv_from(buf)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_lossy_channel_delivers_identical_bytes() -> Result<()> {
    let data = random_payload(1_900);
    let source = FileStream::from_bytes(data.clone(), 400);
    let chunks = source.chunk_count();
    let mut registry = StreamRegistry::new();
    registry.register(1, source);

    let handle = start_server::<LossyTransport>(local_config(), registry).await?;
    let server = v4_addr(&handle)?;

    let mut client = client_for::<LossyTransport>(server).await?;
    let transfer = client.request(1, server, None).await?;

    assert_eq!(transfer.end, TransferEnd::Finished);
    assert_eq!(transfer.data, Bytes::from(data));
    assert_eq!(transfer.chunks, chunks);
    let observed = LOSSY_DATA_SENDS.load(Ordering::SeqCst);
    assert!(
        observed > chunks,
        "expected retransmissions: {observed} data sends for {chunks} chunks"
    );

    handle.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_corrupted_chunks_are_resent() -> Result<()> {
    let data = random_payload(1_000);
    let mut registry = StreamRegistry::new();
    registry.register(4, FileStream::from_bytes(data.clone(), 400));

    let handle = start_server::<CorruptingTransport>(local_config(), registry).await?;
    let server = v4_addr(&handle)?;

    let mut client = client_for::<UdpTransport>(server).await?;
    let transfer = client.request(4, server, None).await?;

    assert_eq!(transfer.end, TransferEnd::Finished);
    assert_eq!(transfer.data, Bytes::from(data));
    assert_eq!(transfer.chunks, 3);

    let stats = handle.stop().await?;
    assert_eq!(stats.sessions_completed, 1);
    Ok(())
}
