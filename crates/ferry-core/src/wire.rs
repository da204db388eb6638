//! Ferry wire format — the datagrams exchanged between server and client.
//!
//! Every datagram is a fixed 20-byte header, optionally followed by a
//! 32-byte payload digest and up to [`MAX_PAYLOAD`] bytes of payload. The
//! digest block is present only when `size > 0`; control messages and
//! keep-alives are header-only.
//!
//! All multi-byte integers are big-endian.
//!
//! ```text
//!  0      1              5              9         12                  20
//! +------+--------------+--------------+---------+-------------------+
//! | TYPE |  IDENTIFIER  |     SIZE     |   pad   |     TIMESTAMP     |
//! +------+--------------+--------------+---------+-------------------+
//! |                 PAYLOAD HASH (BLAKE3, 32 bytes)                  |  size > 0
//! +------------------------------------------------------------------+
//! |                     PAYLOAD (size bytes)                         |  size > 0
//! +------------------------------------------------------------------+
//! ```
//!
//! No I/O happens here.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::crypto::{self, HASH_LEN};

// ── Header ────────────────────────────────────────────────────────────────────

/// Fixed-size header that starts every datagram.
///
/// Wire size: 20 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct MessageHeader {
    /// One of the [`MessageType`] tags.
    pub kind: u8,
    /// Sequence number (MSG/ACK), stream id (REQ), error code (ERR).
    pub identifier: U32<BigEndian>,
    /// Payload length in bytes. 0 for control messages and keep-alives.
    pub size: U32<BigEndian>,
    /// Reserved, must be zero.
    pub reserved: [u8; 3],
    /// Sender wall-clock seconds since the Unix epoch.
    pub timestamp: U64<BigEndian>,
}

assert_eq_size!(MessageHeader, [u8; 20]);

// ── Constants ─────────────────────────────────────────────────────────────────

/// Byte length of the fixed header.
pub const HEADER_LEN: usize = 20;

/// Maximum payload carried by a single message.
pub const MAX_PAYLOAD: usize = 400;

/// Largest datagram either side will ever send.
pub const MAX_DATAGRAM: usize = HEADER_LEN + HASH_LEN + MAX_PAYLOAD;

/// Identifier carried by the FIN a peer sends when it closes.
pub const FIN_IDENTIFIER: u32 = 1;

// ── Message type ──────────────────────────────────────────────────────────────

/// Message type tags. Power-of-two values so they never overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Client asks for a stream. identifier = stream id, payload = ACK port.
    Req = 0b0000_0001,
    /// Application error. identifier = [`ErrorCode`].
    Err = 0b0000_0010,
    /// Data chunk or keep-alive. identifier = sequence number.
    Msg = 0b0000_0100,
    /// Acknowledgement. identifier = sequence number.
    Ack = 0b0000_1000,
    /// Either side is done.
    Fin = 0b0001_0000,
    /// Rendezvous. payload = the session's private ACK port.
    Inf = 0b0010_0000,
}

impl TryFrom<u8> for MessageType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(MessageType::Req),
            0x02 => Ok(MessageType::Err),
            0x04 => Ok(MessageType::Msg),
            0x08 => Ok(MessageType::Ack),
            0x10 => Ok(MessageType::Fin),
            0x20 => Ok(MessageType::Inf),
            other => Err(WireError::UnknownType(other)),
        }
    }
}

impl From<MessageType> for u8 {
    fn from(t: MessageType) -> u8 {
        t as u8
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Req => "REQ",
            MessageType::Err => "ERR",
            MessageType::Msg => "MSG",
            MessageType::Ack => "ACK",
            MessageType::Fin => "FIN",
            MessageType::Inf => "INF",
        };
        f.write_str(name)
    }
}

// ── Error codes ───────────────────────────────────────────────────────────────

/// Application-level error carried in the identifier of an ERR message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// The requested stream id is not registered.
    StreamNotFound,
    /// A code this build does not know. Kept so it can still be surfaced.
    Other(u32),
}

impl ErrorCode {
    pub fn code(self) -> u32 {
        match self {
            ErrorCode::StreamNotFound => 1,
            ErrorCode::Other(c) => c,
        }
    }

    pub fn from_code(code: u32) -> Self {
        match code {
            1 => ErrorCode::StreamNotFound,
            other => ErrorCode::Other(other),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::StreamNotFound => f.write_str("STREAM_NOT_FOUND"),
            ErrorCode::Other(c) => write!(f, "error code {c}"),
        }
    }
}

// ── Message ───────────────────────────────────────────────────────────────────

/// One decoded datagram.
///
/// Built right before it is sent and decoded fresh on every receive.
/// `size` is not stored: it is always `payload.len()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    pub kind: MessageType,
    pub identifier: u32,
    pub timestamp: u64,
    /// Digest of `payload`. `None` exactly when the payload is empty.
    pub payload_hash: Option<[u8; HASH_LEN]>,
    pub payload: Bytes,
}

impl WireMessage {
    /// Build a message stamped with the current time, hashing the payload.
    pub fn new(kind: MessageType, identifier: u32, payload: Bytes) -> Self {
        let payload_hash = if payload.is_empty() {
            None
        } else {
            Some(crypto::hash(&payload))
        };
        Self {
            kind,
            identifier,
            timestamp: unix_now(),
            payload_hash,
            payload,
        }
    }

    /// REQ: ask for `stream_id`, telling the server where to send data.
    pub fn request(stream_id: u32, ack_port: u16) -> Self {
        Self::new(MessageType::Req, stream_id, port_payload(ack_port))
    }

    pub fn error(code: ErrorCode) -> Self {
        Self::new(MessageType::Err, code.code(), Bytes::new())
    }

    /// MSG carrying one chunk of stream content.
    pub fn data(seq: u32, chunk: Bytes) -> Self {
        Self::new(MessageType::Msg, seq, chunk)
    }

    /// Zero-size MSG that only keeps the peer's inactivity timer from firing.
    pub fn keep_alive(seq: u32) -> Self {
        Self::new(MessageType::Msg, seq, Bytes::new())
    }

    /// INF: rendezvous, announcing the session's private ACK port.
    pub fn info(seq: u32, ack_port: u16) -> Self {
        Self::new(MessageType::Inf, seq, port_payload(ack_port))
    }

    pub fn ack(seq: u32) -> Self {
        Self::new(MessageType::Ack, seq, Bytes::new())
    }

    pub fn fin(identifier: u32) -> Self {
        Self::new(MessageType::Fin, identifier, Bytes::new())
    }

    /// Payload length as carried in the header.
    pub fn size(&self) -> usize {
        self.payload.len()
    }

    /// Port carried in a REQ or INF payload.
    pub fn port(&self) -> Option<u16> {
        let raw: [u8; 4] = self.payload.as_ref().try_into().ok()?;
        u16::try_from(u32::from_be_bytes(raw)).ok()
    }

    /// Recompute the payload digest and compare it to the carried one.
    pub fn verify(&self) -> bool {
        match &self.payload_hash {
            Some(expected) => crypto::verify(&self.payload, expected),
            None => self.payload.is_empty(),
        }
    }

    /// Seconds between the sender's timestamp and our clock.
    pub fn lag(&self) -> u64 {
        unix_now().saturating_sub(self.timestamp)
    }

    /// Serialise into a single datagram.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let size = self.payload.len();
        if size > MAX_PAYLOAD {
            return Err(WireError::PayloadTooLarge(size));
        }

        let header = MessageHeader {
            kind: self.kind.into(),
            identifier: U32::new(self.identifier),
            size: U32::new(size as u32),
            reserved: [0u8; 3],
            timestamp: U64::new(self.timestamp),
        };

        let mut out = Vec::with_capacity(HEADER_LEN + HASH_LEN + size);
        out.extend_from_slice(header.as_bytes());
        if size > 0 {
            let digest = self
                .payload_hash
                .unwrap_or_else(|| crypto::hash(&self.payload));
            out.extend_from_slice(&digest);
            out.extend_from_slice(&self.payload);
        }
        Ok(out)
    }

    /// Parse a datagram. The payload digest is carried, not checked; call
    /// [`WireMessage::verify`] for data-bearing messages.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let header = match MessageHeader::read_from_prefix(buf) {
            Some(h) => h,
            None => return Err(WireError::MalformedPacket { len: buf.len() }),
        };

        let kind = MessageType::try_from(header.kind)?;
        let size = header.size.get() as usize;
        if size > MAX_PAYLOAD {
            return Err(WireError::PayloadTooLarge(size));
        }

        let (payload_hash, payload) = if size == 0 {
            (None, Bytes::new())
        } else {
            let body = &buf[HEADER_LEN..];
            if body.len() < HASH_LEN + size {
                return Err(WireError::TruncatedPayload {
                    declared: size,
                    available: body.len().saturating_sub(HASH_LEN),
                });
            }
            let mut digest = [0u8; HASH_LEN];
            digest.copy_from_slice(&body[..HASH_LEN]);
            (
                Some(digest),
                Bytes::copy_from_slice(&body[HASH_LEN..HASH_LEN + size]),
            )
        };

        Ok(Self {
            kind,
            identifier: header.identifier.get(),
            timestamp: header.timestamp.get(),
            payload_hash,
            payload,
        })
    }
}

impl fmt::Display for WireMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} [{}]", self.kind, self.identifier, self.size())
    }
}

fn port_payload(port: u16) -> Bytes {
    Bytes::copy_from_slice(&u32::from(port).to_be_bytes())
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("malformed packet: {len} bytes is shorter than the {}-byte header", HEADER_LEN)]
    MalformedPacket { len: usize },

    #[error("truncated payload: header declares {declared} bytes, {available} present")]
    TruncatedPayload { declared: usize, available: usize },

    #[error("unknown message type: 0x{0:02x}")]
    UnknownType(u8),

    #[error("payload length {0} exceeds maximum {}", MAX_PAYLOAD)]
    PayloadTooLarge(usize),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
