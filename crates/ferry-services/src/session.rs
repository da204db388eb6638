//! Live session table — one entry per delivery session currently running.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;

/// What the server knows about a running session.
#[derive(Debug, Clone)]
pub struct SessionMeta {
    pub stream_id: u32,
    /// Where data goes: the requester's IP and its declared ACK-receiving port.
    pub client: SocketAddr,
    /// Private port this session reads ACKs on.
    pub ack_port: u16,
    pub started_at: Instant,
}

/// Keyed by the address the REQ came from, so a retried REQ from the same
/// client socket does not spawn a second session.
pub type SessionTable = Arc<DashMap<SocketAddr, SessionMeta>>;

pub fn new_session_table() -> SessionTable {
    Arc::new(DashMap::new())
}
