//! Request listener.
//!
//! One well-known socket per address family. REQ datagrams for registered
//! streams spawn a [`DeliverySession`] bound on the same family; REQs for
//! unknown ids get ERR(STREAM_NOT_FOUND) straight from the well-known socket.

use std::io;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};

use ferry_core::config::ServerConfig;
use ferry_core::wire::{ErrorCode, MessageType, WireMessage};
use ferry_services::{
    canonical_addr, new_session_table, with_port, ContentSource, Endpoint, SessionMeta,
    SessionTable, StreamRegistry, Transport, UdpTransport,
};

use crate::session::{DeliverySession, SessionOutcome, SessionReport, SessionSettings};

// ── Stats ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct ServerStats {
    sessions_started: AtomicU64,
    sessions_completed: AtomicU64,
    sessions_client_closed: AtomicU64,
    sessions_not_responding: AtomicU64,
    errors_sent: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub sessions_started: u64,
    pub sessions_completed: u64,
    pub sessions_client_closed: u64,
    pub sessions_not_responding: u64,
    pub errors_sent: u64,
}

impl ServerStats {
    fn record(&self, outcome: SessionOutcome) {
        let counter = match outcome {
            SessionOutcome::Completed => &self.sessions_completed,
            SessionOutcome::ClientClosed => &self.sessions_client_closed,
            SessionOutcome::ClientNotResponding => &self.sessions_not_responding,
            SessionOutcome::Shutdown => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sessions_started: self.sessions_started.load(Ordering::Relaxed),
            sessions_completed: self.sessions_completed.load(Ordering::Relaxed),
            sessions_client_closed: self.sessions_client_closed.load(Ordering::Relaxed),
            sessions_not_responding: self.sessions_not_responding.load(Ordering::Relaxed),
            errors_sent: self.errors_sent.load(Ordering::Relaxed),
        }
    }
}

// ── Server ────────────────────────────────────────────────────────────────────

pub struct StreamServer<T: Transport = UdpTransport> {
    config: ServerConfig,
    registry: StreamRegistry,
    _transport: PhantomData<fn() -> T>,
}

impl<T: Transport> StreamServer<T> {
    pub fn new(config: ServerConfig) -> Self {
        Self::with_registry(config, StreamRegistry::new())
    }

    pub fn with_registry(config: ServerConfig, registry: StreamRegistry) -> Self {
        Self {
            config,
            registry,
            _transport: PhantomData,
        }
    }

    /// Register before `start()`; the registry is frozen once running.
    pub fn register_stream(&mut self, id: u32, source: impl ContentSource + 'static) {
        self.registry.register(id, source);
    }

    pub fn registry(&self) -> &StreamRegistry {
        &self.registry
    }

    /// Bind the well-known sockets and spawn the accept loop.
    pub async fn start(self) -> Result<ServerHandle> {
        let v4 = match self.config.listen_v4 {
            Some(addr) => Some(
                Endpoint::<T>::bind(addr)
                    .await
                    .with_context(|| format!("failed to bind IPv4 listener on {addr}"))?,
            ),
            None => None,
        };
        let v6 = match self.config.listen_v6 {
            Some(addr) => Some(
                Endpoint::<T>::bind(addr)
                    .await
                    .with_context(|| format!("failed to bind IPv6 listener on {addr}"))?,
            ),
            None => None,
        };
        if v4.is_none() && v6.is_none() {
            anyhow::bail!("no listen address configured");
        }

        let ipv4_addr = v4.as_ref().map(|e| e.local_addr());
        let ipv6_addr = v6.as_ref().map(|e| e.local_addr());
        if let Some(addr) = ipv4_addr {
            tracing::info!(%addr, "server IPv4 bound");
        }
        if let Some(addr) = ipv6_addr {
            tracing::info!(%addr, "server IPv6 bound");
        }
        tracing::info!(streams = ?self.registry, "streams registered");

        let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
        let sessions = new_session_table();
        let stats = Arc::new(ServerStats::default());

        let accept = AcceptLoop {
            v4,
            v6,
            registry: self.registry,
            settings: SessionSettings::from(&self.config),
            sessions: sessions.clone(),
            stats: stats.clone(),
            shutdown_tx: shutdown_tx.clone(),
            shutdown: shutdown_rx,
            tasks: JoinSet::new(),
        };
        let task = tokio::spawn(accept.run());

        Ok(ServerHandle {
            ipv4_addr,
            ipv6_addr,
            sessions,
            stats,
            shutdown_tx,
            task,
        })
    }
}

/// A running server.
pub struct ServerHandle {
    ipv4_addr: Option<SocketAddr>,
    ipv6_addr: Option<SocketAddr>,
    sessions: SessionTable,
    stats: Arc<ServerStats>,
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn ipv4_addr(&self) -> Option<SocketAddr> {
        self.ipv4_addr
    }

    pub fn ipv6_addr(&self) -> Option<SocketAddr> {
        self.ipv6_addr
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Signal the accept loop and every session, and wait for all of them.
    /// No server socket is used after this returns.
    pub async fn stop(self) -> Result<StatsSnapshot> {
        let _ = self.shutdown_tx.send(());
        self.task.await.context("accept loop panicked")?;
        Ok(self.stats.snapshot())
    }
}

// ── Accept loop ───────────────────────────────────────────────────────────────

struct AcceptLoop<T: Transport> {
    v4: Option<Endpoint<T>>,
    v6: Option<Endpoint<T>>,
    registry: StreamRegistry,
    settings: SessionSettings,
    sessions: SessionTable,
    stats: Arc<ServerStats>,
    shutdown_tx: broadcast::Sender<()>,
    shutdown: broadcast::Receiver<()>,
    tasks: JoinSet<SessionReport>,
}

impl<T: Transport> AcceptLoop<T> {
    async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!(active = self.tasks.len(), "accept loop shutting down");
                    break;
                }

                r = recv_on(self.v4.as_ref()) => self.handle_datagram(r, Family::V4).await,
                r = recv_on(self.v6.as_ref()) => self.handle_datagram(r, Family::V6).await,

                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    self.reap(joined);
                }
            }
        }

        while let Some(joined) = self.tasks.join_next().await {
            self.reap(joined);
        }
        tracing::info!("all sessions closed");
    }

    async fn handle_datagram(
        &mut self,
        received: io::Result<(WireMessage, SocketAddr)>,
        family: Family,
    ) {
        let (msg, from) = match received {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(?family, error = %e, "recv_from failed");
                return;
            }
        };
        let from = canonical_addr(from);

        if msg.kind != MessageType::Req {
            tracing::debug!(%from, message = %msg, "ignoring non-request on listener");
            return;
        }
        let Some(ack_port) = msg.port() else {
            tracing::warn!(%from, size = msg.size(), "REQ without a reply port");
            return;
        };
        let stream_id = msg.identifier;
        let client = with_port(from, ack_port);
        tracing::info!(%from, stream_id, "client request");

        if self.sessions.contains_key(&from) {
            tracing::debug!(%from, stream_id, "duplicate REQ, session already running");
            return;
        }

        let Some(content) = self.registry.prepare(stream_id) else {
            tracing::info!(%client, stream_id, "stream not found");
            self.send_error(ErrorCode::StreamNotFound, client).await;
            return;
        };

        let Some(bind_addr) = self.bind_addr_for(client) else {
            tracing::warn!(%client, "no listener for the client's address family");
            return;
        };

        let session = match DeliverySession::<T>::open(
            stream_id,
            client,
            bind_addr,
            content,
            self.settings,
            self.shutdown_tx.subscribe(),
        )
        .await
        {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(%client, error = %e, "failed to bind session sockets");
                return;
            }
        };

        self.sessions.insert(
            from,
            SessionMeta {
                stream_id,
                client,
                ack_port: session.ack_port(),
                started_at: Instant::now(),
            },
        );
        self.stats.sessions_started.fetch_add(1, Ordering::Relaxed);
        tracing::info!(%client, stream_id, "sending stream");

        let entry = TableEntry {
            sessions: self.sessions.clone(),
            key: from,
        };
        self.tasks.spawn(async move {
            let _entry = entry;
            session.run().await
        });
    }

    /// The listener's own address on an ephemeral port, scope id included.
    fn bind_addr_for(&self, client: SocketAddr) -> Option<SocketAddr> {
        let listener = match client {
            SocketAddr::V4(_) => self.v4.as_ref(),
            SocketAddr::V6(_) => self.v6.as_ref(),
        }?;
        Some(with_port(listener.local_addr(), 0))
    }

    async fn send_error(&self, code: ErrorCode, client: SocketAddr) {
        let socket = match client {
            SocketAddr::V4(_) => self.v4.as_ref(),
            SocketAddr::V6(_) => self.v6.as_ref(),
        };
        let Some(socket) = socket else {
            return;
        };
        match socket.send(&WireMessage::error(code), client).await {
            Ok(()) => {
                self.stats.errors_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => tracing::warn!(%client, error = %e, "failed to send ERR"),
        }
    }

    fn reap(&self, joined: Result<SessionReport, tokio::task::JoinError>) {
        match joined {
            Ok(report) => {
                self.stats.record(report.outcome);
                tracing::debug!(
                    client = %report.client,
                    stream_id = report.stream_id,
                    outcome = ?report.outcome,
                    chunks = report.chunks_delivered,
                    datagrams = report.datagrams_sent,
                    retransmissions = report.retransmissions,
                    ack_timeout_ms = report.final_ack_timeout.as_millis() as u64,
                    "session finished"
                );
            }
            Err(e) => tracing::error!(error = %e, "session task failed"),
        }
    }
}

/// Removes a session's table entry when its task ends, panics included.
struct TableEntry {
    sessions: SessionTable,
    key: SocketAddr,
}

impl Drop for TableEntry {
    fn drop(&mut self) {
        self.sessions.remove(&self.key);
    }
}

#[derive(Debug, Clone, Copy)]
enum Family {
    V4,
    V6,
}

async fn recv_on<T: Transport>(
    endpoint: Option<&Endpoint<T>>,
) -> io::Result<(WireMessage, SocketAddr)> {
    match endpoint {
        Some(ep) => ep.recv().await,
        None => std::future::pending().await,
    }
}
