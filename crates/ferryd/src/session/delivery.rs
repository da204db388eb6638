//! One stream delivered to one client.
//!
//! A session owns a private send/receive socket pair on the client's address
//! family. It first announces its ACK port with INF(0) until the client
//! acknowledges, then sends one message at a time and waits for the matching
//! ACK before advancing. Nothing newer than `next_seq` is ever on the wire.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::Instant;

use ferry_core::config::ServerConfig;
use ferry_core::wire::{MessageType, WireMessage, FIN_IDENTIFIER};
use ferry_services::{with_port, Endpoint, NextChunk, ServedStream, Transport, UdpTransport};

use super::state::{Liveness, RetransmitTimer};

/// Timing knobs a session needs, lifted out of [`ServerConfig`].
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub ack_timeout: Duration,
    pub client_not_responding: Duration,
    pub next_chunk_wait: Duration,
}

impl From<&ServerConfig> for SessionSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            ack_timeout: config.ack_timeout(),
            client_not_responding: config.client_not_responding(),
            next_chunk_wait: config.next_chunk_wait(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    AwaitingRendezvous,
    Streaming,
    Draining,
    Closed,
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Content exhausted and FIN sent.
    Completed,
    /// Client sent FIN.
    ClientClosed,
    /// Accumulated lag reached the threshold. No FIN was sent.
    ClientNotResponding,
    /// Server stop. FIN sent to the client.
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct SessionReport {
    pub stream_id: u32,
    pub client: SocketAddr,
    pub outcome: SessionOutcome,
    /// Data chunks the client acknowledged. Keep-alives are not counted.
    pub chunks_delivered: u64,
    pub datagrams_sent: u64,
    pub retransmissions: u64,
    pub final_ack_timeout: Duration,
}

/// Result of pushing one message until it is acknowledged.
enum Delivery {
    Acked,
    ClientClosed,
    ClientNotResponding,
    Shutdown,
}

/// What arrived while waiting for an ACK.
enum AckWait {
    Acked,
    Fin,
    TimedOut,
    Shutdown,
}

pub struct DeliverySession<T: Transport = UdpTransport> {
    stream_id: u32,
    client: SocketAddr,
    content: ServedStream,
    send: Endpoint<T>,
    recv: Endpoint<T>,
    timer: RetransmitTimer,
    next_chunk_wait: Duration,
    next_seq: u32,
    phase: SessionPhase,
    client_connected: bool,
    shutdown: broadcast::Receiver<()>,
    chunks_delivered: u64,
    datagrams_sent: u64,
    retransmissions: u64,
}

impl<T: Transport> DeliverySession<T> {
    /// Bind the session's socket pair on `bind_addr`'s address (ephemeral
    /// ports). A link-local address needs its scope id here.
    pub async fn open(
        stream_id: u32,
        client: SocketAddr,
        bind_addr: SocketAddr,
        content: ServedStream,
        settings: SessionSettings,
        shutdown: broadcast::Receiver<()>,
    ) -> io::Result<Self> {
        let send = Endpoint::<T>::bind(with_port(bind_addr, 0)).await?;
        let recv = Endpoint::<T>::bind(with_port(bind_addr, 0)).await?;
        Ok(Self {
            stream_id,
            client,
            content,
            send,
            recv,
            timer: RetransmitTimer::new(settings.ack_timeout, settings.client_not_responding),
            next_chunk_wait: settings.next_chunk_wait,
            next_seq: 0,
            phase: SessionPhase::AwaitingRendezvous,
            client_connected: true,
            shutdown,
            chunks_delivered: 0,
            datagrams_sent: 0,
            retransmissions: 0,
        })
    }

    /// Port the client must send ACKs and FIN to.
    pub fn ack_port(&self) -> u16 {
        self.recv.port()
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub async fn run(mut self) -> SessionReport {
        tracing::info!(
            stream_id = self.stream_id,
            client = %self.client,
            ack_port = self.ack_port(),
            "session started"
        );

        let outcome = self.drive().await;

        self.phase = SessionPhase::Draining;
        self.content.close();
        if self.client_connected {
            if let Err(e) = self.send.send(&WireMessage::fin(FIN_IDENTIFIER), self.client).await {
                tracing::warn!(client = %self.client, error = %e, "failed to send FIN");
            } else {
                self.datagrams_sent += 1;
            }
        }
        self.phase = SessionPhase::Closed;

        tracing::info!(
            stream_id = self.stream_id,
            client = %self.client,
            ?outcome,
            chunks = self.chunks_delivered,
            retransmissions = self.retransmissions,
            "transmission ended"
        );

        SessionReport {
            stream_id: self.stream_id,
            client: self.client,
            outcome,
            chunks_delivered: self.chunks_delivered,
            datagrams_sent: self.datagrams_sent,
            retransmissions: self.retransmissions,
            final_ack_timeout: self.timer.timeout(),
        }
    }

    async fn drive(&mut self) -> SessionOutcome {
        // ── Rendezvous ──────────────────────────────────────────────────────
        let info = WireMessage::info(self.next_seq, self.ack_port());
        match self.deliver(&info).await {
            Delivery::Acked => {}
            other => return self.finish(other),
        }
        self.phase = SessionPhase::Streaming;

        // ── Streaming ───────────────────────────────────────────────────────
        loop {
            let next = tokio::select! {
                _ = self.shutdown.recv() => return self.finish(Delivery::Shutdown),
                next = self.content.next_chunk(self.next_chunk_wait) => next,
            };

            let (msg, is_data) = match next {
                NextChunk::Chunk(chunk) => (WireMessage::data(self.next_seq, chunk), true),
                NextChunk::Pending => {
                    tracing::trace!(seq = self.next_seq, "no chunk ready, sending keep-alive");
                    (WireMessage::keep_alive(self.next_seq), false)
                }
                NextChunk::Exhausted => return SessionOutcome::Completed,
            };

            match self.deliver(&msg).await {
                Delivery::Acked => {
                    if is_data {
                        self.chunks_delivered += 1;
                    }
                }
                other => return self.finish(other),
            }
        }
    }

    fn finish(&mut self, delivery: Delivery) -> SessionOutcome {
        match delivery {
            Delivery::Acked => SessionOutcome::Completed,
            Delivery::ClientClosed => {
                tracing::info!(client = %self.client, "client closed connection");
                self.client_connected = false;
                SessionOutcome::ClientClosed
            }
            Delivery::ClientNotResponding => {
                tracing::info!(
                    client = %self.client,
                    lag_ms = self.timer.lag().as_millis() as u64,
                    "client not responding: timeout"
                );
                self.client_connected = false;
                SessionOutcome::ClientNotResponding
            }
            Delivery::Shutdown => SessionOutcome::Shutdown,
        }
    }

    /// Send `msg` and resend it unchanged until ACK(next_seq) arrives.
    async fn deliver(&mut self, msg: &WireMessage) -> Delivery {
        let mut attempt = 0u64;
        loop {
            if attempt > 0 {
                self.retransmissions += 1;
            }
            attempt += 1;

            match self.send.send(msg, self.client).await {
                Ok(()) => self.datagrams_sent += 1,
                // Treated like a lost datagram; the ACK wait below times out.
                Err(e) => tracing::warn!(client = %self.client, error = %e, "send failed"),
            }

            match self.await_ack().await {
                AckWait::Acked => {
                    self.timer.on_ack();
                    self.next_seq = self.next_seq.wrapping_add(1);
                    return Delivery::Acked;
                }
                AckWait::Fin => return Delivery::ClientClosed,
                AckWait::Shutdown => return Delivery::Shutdown,
                AckWait::TimedOut => {
                    if self.timer.on_timeout() == Liveness::NotResponding {
                        return Delivery::ClientNotResponding;
                    }
                }
            }
        }
    }

    async fn await_ack(&mut self) -> AckWait {
        let deadline = Instant::now() + self.timer.timeout();
        loop {
            let received = tokio::select! {
                _ = self.shutdown.recv() => return AckWait::Shutdown,
                r = self.recv.recv_until(deadline) => r,
            };

            match received {
                Ok(Some((msg, from))) => match msg.kind {
                    MessageType::Ack if msg.identifier == self.next_seq => return AckWait::Acked,
                    MessageType::Fin => return AckWait::Fin,
                    _ => {
                        tracing::trace!(%from, message = %msg, expected = self.next_seq, "ignoring");
                    }
                },
                Ok(None) => return AckWait::TimedOut,
                Err(e) => {
                    tracing::warn!(error = %e, "ack socket recv failed");
                    tokio::time::sleep_until(deadline).await;
                    return AckWait::TimedOut;
                }
            }
        }
    }
}
