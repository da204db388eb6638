//! ferryd — stream server.
//!
//! [`StreamServer`] owns the well-known request sockets and the stream
//! registry; each accepted request runs as its own [`DeliverySession`] task.

pub mod listener;
pub mod session;

pub use listener::{ServerHandle, ServerStats, StatsSnapshot, StreamServer};
pub use session::{DeliverySession, SessionOutcome, SessionReport, SessionSettings};
