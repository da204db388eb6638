//! Stream registry: stream id → immutable content definition.
//!
//! Filled before the server starts and only read afterwards, so it is shared
//! between sessions as a plain `Arc`-backed map with no locking.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ferry_core::config::StreamConfig;

use crate::stream::{ContentSource, FileStream, PeriodicStream, ServedStream, StreamError};

#[derive(Clone, Default)]
pub struct StreamRegistry {
    streams: HashMap<u32, Arc<dyn ContentSource>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `source` under `id`, replacing any earlier definition.
    pub fn register(&mut self, id: u32, source: impl ContentSource + 'static) {
        self.streams.insert(id, Arc::new(source));
    }

    pub fn get(&self, id: u32) -> Option<&Arc<dyn ContentSource>> {
        self.streams.get(&id)
    }

    /// Fresh served view for one session, or `None` for an unknown id.
    pub fn prepare(&self, id: u32) -> Option<ServedStream> {
        self.streams.get(&id).map(|s| s.prepare())
    }

    pub fn ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.streams.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Build a registry from `[[streams]]` config entries. File streams are
    /// read now so a missing file fails startup rather than a request.
    pub fn from_config(entries: &[StreamConfig], chunk_size: usize) -> Result<Self, StreamError> {
        let mut registry = Self::new();
        for entry in entries {
            match entry {
                StreamConfig::File { id, path } => {
                    registry.register(*id, FileStream::open(path, chunk_size)?);
                }
                StreamConfig::Periodic {
                    id,
                    payload,
                    interval_ms,
                } => {
                    registry.register(
                        *id,
                        PeriodicStream::new(payload.clone(), Duration::from_millis(*interval_ms)),
                    );
                }
            }
        }
        Ok(registry)
    }
}

impl std::fmt::Debug for StreamRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.ids().into_iter().map(|id| {
                let desc = self.streams.get(&id).map(|s| s.describe()).unwrap_or_default();
                (id, desc)
            }))
            .finish()
    }
}
