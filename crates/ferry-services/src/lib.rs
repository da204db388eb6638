//! ferry-services — everything a server or client needs around the wire
//! format: content sources, the stream registry, the socket capability,
//! and the live session table.

pub mod registry;
pub mod session;
pub mod stream;
pub mod transport;

pub use registry::StreamRegistry;
pub use session::{new_session_table, SessionMeta, SessionTable};
pub use stream::{ContentSource, FileStream, NextChunk, PeriodicStream, ServedStream, StreamError};
pub use transport::{canonical_addr, with_port, Endpoint, Transport, UdpTransport};
