//! Content sources: what a registered stream id actually serves.
//!
//! A [`ContentSource`] is an immutable definition held by the registry.
//! Every accepted request calls [`ContentSource::prepare`] and gets its own
//! [`ServedStream`]: a private cursor (finite sources) or a private producer
//! task (live sources). Two clients asking for the same stream id never share
//! a cursor, so neither can steal or interleave the other's chunks.

use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use ferry_core::wire::MAX_PAYLOAD;

/// Chunks a live producer may run ahead of its session.
const LIVE_BUFFER: usize = 16;

/// A registered stream definition.
pub trait ContentSource: Send + Sync {
    /// Short human-readable description for logs.
    fn describe(&self) -> String;

    /// Open an independent served view of this stream.
    ///
    /// Live sources spawn their producer here, so this must be called from
    /// within a Tokio runtime.
    fn prepare(&self) -> ServedStream;
}

// ── File ──────────────────────────────────────────────────────────────────────

/// Finite stream: one file, sliced into fixed-size chunks, served once.
#[derive(Debug, Clone)]
pub struct FileStream {
    data: Bytes,
    chunk_size: usize,
    origin: Option<PathBuf>,
}

impl FileStream {
    /// Load `path` fully. The bytes are shared by every served view.
    pub fn open(path: impl AsRef<Path>, chunk_size: usize) -> Result<Self, StreamError> {
        let path = path.as_ref();
        let data =
            std::fs::read(path).map_err(|e| StreamError::ReadFailed(path.to_path_buf(), e))?;
        Ok(Self {
            data: Bytes::from(data),
            chunk_size: clamp_chunk(chunk_size),
            origin: Some(path.to_path_buf()),
        })
    }

    pub fn from_bytes(data: impl Into<Bytes>, chunk_size: usize) -> Self {
        Self {
            data: data.into(),
            chunk_size: clamp_chunk(chunk_size),
            origin: None,
        }
    }

    /// The whole file body.
    pub fn contents(&self) -> &Bytes {
        &self.data
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Number of data messages a full transfer takes.
    pub fn chunk_count(&self) -> usize {
        self.data.len().div_ceil(self.chunk_size)
    }
}

impl ContentSource for FileStream {
    fn describe(&self) -> String {
        match &self.origin {
            Some(p) => format!("file {} ({} bytes)", p.display(), self.data.len()),
            None => format!("in-memory file ({} bytes)", self.data.len()),
        }
    }

    fn prepare(&self) -> ServedStream {
        ServedStream::finite(self.data.clone(), self.chunk_size)
    }
}

fn clamp_chunk(chunk_size: usize) -> usize {
    chunk_size.clamp(1, MAX_PAYLOAD)
}

// ── Periodic ──────────────────────────────────────────────────────────────────

/// Infinite stream: the same payload every `interval` until closed.
#[derive(Debug, Clone)]
pub struct PeriodicStream {
    payload: Bytes,
    interval: Duration,
}

impl PeriodicStream {
    pub fn new(payload: impl Into<Bytes>, interval: Duration) -> Self {
        let mut payload: Bytes = payload.into();
        payload.truncate(MAX_PAYLOAD);
        Self { payload, interval }
    }

    /// The classic "PING" generator.
    pub fn ping(interval: Duration) -> Self {
        Self::new(Bytes::from_static(b"PING"), interval)
    }
}

impl ContentSource for PeriodicStream {
    fn describe(&self) -> String {
        format!(
            "periodic {:?} every {}ms",
            String::from_utf8_lossy(&self.payload),
            self.interval.as_millis()
        )
    }

    fn prepare(&self) -> ServedStream {
        ServedStream::live(self.payload.clone(), self.interval)
    }
}

// ── Served view ───────────────────────────────────────────────────────────────

/// Result of asking a served view for its next chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextChunk {
    Chunk(Bytes),
    /// Nothing produced within the wait. Live streams only.
    Pending,
    /// Permanently done. Finite streams, or any stream after `close()`.
    Exhausted,
}

/// One session's private view of a stream.
pub struct ServedStream {
    cursor: Cursor,
}

enum Cursor {
    Finite {
        data: Bytes,
        offset: usize,
        chunk_size: usize,
    },
    Live {
        rx: mpsc::Receiver<Bytes>,
        producer: JoinHandle<()>,
    },
    Closed,
}

impl ServedStream {
    /// Cursor over `data`, handing out `chunk_size` slices without copying.
    pub fn finite(data: Bytes, chunk_size: usize) -> Self {
        Self {
            cursor: Cursor::Finite {
                data,
                offset: 0,
                chunk_size: clamp_chunk(chunk_size),
            },
        }
    }

    /// Start a producer that queues `payload` every `interval`.
    /// The first chunk is available immediately.
    pub fn live(payload: Bytes, interval: Duration) -> Self {
        let (tx, rx) = mpsc::channel(LIVE_BUFFER);
        let producer = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if tx.send(payload.clone()).await.is_err() {
                    break;
                }
            }
        });
        Self {
            cursor: Cursor::Live { rx, producer },
        }
    }

    /// Next chunk, waiting up to `wait` for live producers.
    ///
    /// Finite views never wait: they return a chunk or `Exhausted` at once.
    pub async fn next_chunk(&mut self, wait: Duration) -> NextChunk {
        match &mut self.cursor {
            Cursor::Finite {
                data,
                offset,
                chunk_size,
            } => {
                if *offset >= data.len() {
                    return NextChunk::Exhausted;
                }
                let end = (*offset + *chunk_size).min(data.len());
                let chunk = data.slice(*offset..end);
                *offset = end;
                NextChunk::Chunk(chunk)
            }
            Cursor::Live { rx, .. } => match tokio::time::timeout(wait, rx.recv()).await {
                Ok(Some(chunk)) => NextChunk::Chunk(chunk),
                Ok(None) => NextChunk::Exhausted,
                Err(_) => NextChunk::Pending,
            },
            Cursor::Closed => NextChunk::Exhausted,
        }
    }

    /// Stop any background production. Safe to call repeatedly.
    pub fn close(&mut self) {
        if let Cursor::Live { producer, .. } = std::mem::replace(&mut self.cursor, Cursor::Closed)
        {
            producer.abort();
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.cursor, Cursor::Closed)
    }
}

impl Drop for ServedStream {
    fn drop(&mut self) {
        self.close();
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
}
