//! Receiving side of a transfer.
//!
//! The client sends REQ from its only socket, learns the session's ACK port
//! from INF, and then accepts exactly the next sequence number, acking the
//! highest in-order sequence after every accepted message and on every quiet
//! poll. Anything out of order or failing its hash is dropped without an
//! ACK; the server's retransmit timer covers it.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use ferry_core::config::ClientConfig;
use ferry_core::wire::{ErrorCode, MessageType, WireMessage, FIN_IDENTIFIER};
use ferry_services::{with_port, Endpoint, Transport, UdpTransport};

/// Shortest receive poll. A zero poll would never accumulate lag.
const MIN_POLL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy)]
pub struct ClientSettings {
    /// Receive poll interval. Each quiet poll re-sends the current ACK.
    pub ack_timeout: Duration,
    pub server_not_responding: Duration,
}

impl From<&ClientConfig> for ClientSettings {
    fn from(config: &ClientConfig) -> Self {
        Self {
            ack_timeout: config.ack_timeout(),
            server_not_responding: config.server_not_responding(),
        }
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self::from(&ClientConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientPhase {
    Idle,
    WaitingForRendezvous,
    Receiving,
    Terminated,
}

/// Why a transfer that produced data stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferEnd {
    /// Server sent FIN.
    Finished,
    /// `max_chunks` data chunks received.
    ChunkLimit,
    /// [`StopHandle::stop`] was called.
    Stopped,
}

#[derive(Debug, Clone)]
pub struct Transfer {
    pub data: Bytes,
    /// Data chunks accepted. Keep-alives are not counted.
    pub chunks: usize,
    pub end: TransferEnd,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("server replied with {0}")]
    Server(ErrorCode),

    #[error("server not responding ({} bytes received before it went silent)", .partial.len())]
    ServerNotResponding { partial: Bytes },

    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

/// Stops a running request from another task. Sticky: once stopped, the
/// client ends every later request immediately.
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<watch::Sender<bool>>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.send_replace(true);
    }
}

/// State of one request in flight.
struct Reception {
    expected_seq: u32,
    data: BytesMut,
    chunks: usize,
    ack_target: Option<SocketAddr>,
    server_lag: Duration,
}

enum Polled {
    Message(WireMessage, SocketAddr),
    Quiet,
    Stop,
}

pub struct StreamClient<T: Transport = UdpTransport> {
    endpoint: Endpoint<T>,
    settings: ClientSettings,
    phase: ClientPhase,
    stop_tx: Arc<watch::Sender<bool>>,
    stop_rx: watch::Receiver<bool>,
}

impl<T: Transport> StreamClient<T> {
    pub async fn bind(local: SocketAddr, mut settings: ClientSettings) -> io::Result<Self> {
        settings.ack_timeout = settings.ack_timeout.max(MIN_POLL);
        let endpoint = Endpoint::<T>::bind(local).await?;
        let (stop_tx, stop_rx) = watch::channel(false);
        Ok(Self {
            endpoint,
            settings,
            phase: ClientPhase::Idle,
            stop_tx: Arc::new(stop_tx),
            stop_rx,
        })
    }

    /// Bind an ephemeral socket in the same family as `server`.
    pub async fn for_server(server: SocketAddr, settings: ClientSettings) -> io::Result<Self> {
        let any: IpAddr = match server {
            SocketAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
            SocketAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
        };
        Self::bind(SocketAddr::new(any, 0), settings).await
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.local_addr()
    }

    pub fn phase(&self) -> ClientPhase {
        self.phase
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(self.stop_tx.clone())
    }

    /// Request `stream_id` from `server` and receive it to the end.
    ///
    /// `max_chunks` stops after that many data chunks (0 = no limit).
    pub async fn request(
        &mut self,
        stream_id: u32,
        server: SocketAddr,
        max_chunks: Option<usize>,
    ) -> Result<Transfer, ClientError> {
        let max_chunks = max_chunks.filter(|n| *n > 0);
        let request = WireMessage::request(stream_id, self.endpoint.port());
        let mut rx = Reception {
            expected_seq: 0,
            data: BytesMut::new(),
            chunks: 0,
            ack_target: None,
            server_lag: Duration::ZERO,
        };

        if *self.stop_rx.borrow_and_update() {
            self.phase = ClientPhase::Terminated;
            return Ok(Transfer {
                data: Bytes::new(),
                chunks: 0,
                end: TransferEnd::Stopped,
            });
        }

        tracing::info!(%server, stream_id, local = %self.local_addr(), "requesting stream");
        self.endpoint.send(&request, server).await?;
        self.phase = ClientPhase::WaitingForRendezvous;

        let result = self.receive(&mut rx, &request, server, max_chunks).await;

        if let Some(target) = rx.ack_target {
            if let Err(e) = self.endpoint.send(&WireMessage::fin(FIN_IDENTIFIER), target).await {
                tracing::warn!(%target, error = %e, "failed to send FIN");
            }
        }
        self.phase = ClientPhase::Terminated;
        result
    }

    async fn receive(
        &mut self,
        rx: &mut Reception,
        request: &WireMessage,
        server: SocketAddr,
        max_chunks: Option<usize>,
    ) -> Result<Transfer, ClientError> {
        loop {
            let polled = tokio::select! {
                _ = self.stop_rx.changed() => Polled::Stop,
                r = self.endpoint.recv_timeout(self.settings.ack_timeout) => match r? {
                    Some((msg, from)) => Polled::Message(msg, from),
                    None => Polled::Quiet,
                },
            };

            let mut ack = false;
            match polled {
                Polled::Stop => {
                    tracing::info!("stopped by caller");
                    return Ok(rx.finish(TransferEnd::Stopped));
                }
                Polled::Quiet => {
                    rx.server_lag += self.settings.ack_timeout;
                    if rx.server_lag >= self.settings.server_not_responding {
                        tracing::info!(
                            lag_ms = rx.server_lag.as_millis() as u64,
                            "server not responding: timeout"
                        );
                        return Err(ClientError::ServerNotResponding {
                            partial: rx.data.split().freeze(),
                        });
                    }
                    if rx.ack_target.is_none() {
                        tracing::debug!(%server, "no rendezvous yet, repeating REQ");
                        self.endpoint.send(request, server).await?;
                    }
                    ack = true;
                }
                Polled::Message(msg, from) => match msg.kind {
                    MessageType::Fin => {
                        tracing::info!(chunks = rx.chunks, bytes = rx.data.len(), "transmission ended");
                        return Ok(rx.finish(TransferEnd::Finished));
                    }
                    MessageType::Err => {
                        let code = ErrorCode::from_code(msg.identifier);
                        tracing::error!(%code, "server error");
                        return Err(ClientError::Server(code));
                    }
                    MessageType::Inf => match msg.port() {
                        Some(port) => {
                            let target = with_port(from, port);
                            if rx.ack_target != Some(target) {
                                tracing::info!(%target, "sending ACKs to session");
                                rx.ack_target = Some(target);
                                self.phase = ClientPhase::Receiving;
                            }
                            ack = true;
                        }
                        None => tracing::warn!(%from, "INF without a port"),
                    },
                    MessageType::Msg
                        if msg.identifier == rx.expected_seq.wrapping_add(1) && msg.verify() =>
                    {
                        tracing::debug!(
                            seq = msg.identifier,
                            size = msg.size(),
                            lag_s = msg.lag(),
                            "accepted MSG"
                        );
                        rx.expected_seq = msg.identifier;
                        rx.server_lag = Duration::ZERO;
                        ack = true;
                        if !msg.payload.is_empty() {
                            rx.data.extend_from_slice(&msg.payload);
                            rx.chunks += 1;
                        }
                    }
                    MessageType::Msg => {
                        tracing::debug!(
                            seq = msg.identifier,
                            expected = rx.expected_seq.wrapping_add(1),
                            hash = ?msg.payload_hash.map(|h| hex::encode(&h[..8])),
                            "discarding MSG"
                        );
                    }
                    _ => tracing::debug!(%from, message = %msg, "ignoring"),
                },
            }

            if ack {
                if let Some(target) = rx.ack_target {
                    self.endpoint
                        .send(&WireMessage::ack(rx.expected_seq), target)
                        .await?;
                }
            }

            if max_chunks.is_some_and(|limit| rx.chunks >= limit) {
                tracing::info!(chunks = rx.chunks, "chunk limit reached, ending transmission");
                return Ok(rx.finish(TransferEnd::ChunkLimit));
            }
        }
    }

    /// Run [`request`](Self::request) as its own task.
    pub fn spawn_request(
        mut self,
        stream_id: u32,
        server: SocketAddr,
        max_chunks: Option<usize>,
    ) -> JoinHandle<Result<Transfer, ClientError>> {
        tokio::spawn(async move { self.request(stream_id, server, max_chunks).await })
    }
}

impl Reception {
    fn finish(&mut self, end: TransferEnd) -> Transfer {
        Transfer {
            data: self.data.split().freeze(),
            chunks: self.chunks,
            end,
        }
    }
}
