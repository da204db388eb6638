//! Configuration system for Ferry.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $FERRY_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/ferry/config.toml
//!   3. ~/.config/ferry/config.toml

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::wire::MAX_PAYLOAD;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FerryConfig {
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub streams: Vec<StreamConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Well-known IPv4 request address. None = no IPv4 stack.
    pub listen_v4: Option<SocketAddr>,
    /// Well-known IPv6 request address. None = no IPv6 stack.
    pub listen_v6: Option<SocketAddr>,
    /// Base retransmit timeout; doubles on every unanswered send.
    pub ack_timeout_ms: u64,
    /// Accumulated silence after which a client is dropped.
    pub client_not_responding_ms: u64,
    /// How long a session waits for the next chunk before sending a keep-alive.
    pub next_chunk_wait_ms: u64,
    /// Payload bytes per MSG. At most 400.
    pub chunk_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Default server to request from.
    pub server: SocketAddr,
    /// Receive poll interval. Every expiry re-sends the current ACK.
    pub ack_timeout_ms: u64,
    /// Accumulated silence after which the server is given up on.
    pub server_not_responding_ms: u64,
}

/// One registered stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamConfig {
    /// The whole file, chunked, once.
    File { id: u32, path: PathBuf },
    /// `payload` every `interval_ms`, forever.
    Periodic {
        id: u32,
        #[serde(default = "default_periodic_payload")]
        payload: String,
        interval_ms: u64,
    },
}

impl StreamConfig {
    pub fn id(&self) -> u32 {
        match self {
            StreamConfig::File { id, .. } | StreamConfig::Periodic { id, .. } => *id,
        }
    }
}

fn default_periodic_payload() -> String {
    "PING".to_string()
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for FerryConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            client: ClientConfig::default(),
            streams: Vec::new(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_v4: Some(SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT))),
            listen_v6: Some(SocketAddr::from(([0u16; 8], DEFAULT_PORT))),
            ack_timeout_ms: 1_000,
            client_not_responding_ms: 30_000,
            next_chunk_wait_ms: 15_000,
            chunk_size: MAX_PAYLOAD,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            ack_timeout_ms: 1_000,
            server_not_responding_ms: 60_000,
        }
    }
}

/// Well-known request port used when nothing else is configured.
pub const DEFAULT_PORT: u16 = 8801;

impl ServerConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn client_not_responding(&self) -> Duration {
        Duration::from_millis(self.client_not_responding_ms)
    }

    pub fn next_chunk_wait(&self) -> Duration {
        Duration::from_millis(self.next_chunk_wait_ms)
    }
}

impl ClientConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn server_not_responding(&self) -> Duration {
        Duration::from_millis(self.server_not_responding_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("ferry")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl FerryConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::file_path())
    }

    /// Same as [`load`](Self::load) with an explicit file. A missing file
    /// means defaults.
    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            Self::from_file(path)?
        } else {
            FerryConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse a specific file, without env overrides.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("FERRY_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&FerryConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Reject values the protocol cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.server;
        if s.listen_v4.is_none() && s.listen_v6.is_none() {
            return Err(invalid("server.listen", "at least one of listen_v4/listen_v6 is required"));
        }
        if s.chunk_size == 0 || s.chunk_size > MAX_PAYLOAD {
            return Err(invalid(
                "server.chunk_size",
                format!("{} is outside 1..={MAX_PAYLOAD}", s.chunk_size),
            ));
        }
        for (field, value) in [
            ("server.ack_timeout_ms", s.ack_timeout_ms),
            ("server.client_not_responding_ms", s.client_not_responding_ms),
            ("server.next_chunk_wait_ms", s.next_chunk_wait_ms),
            ("client.ack_timeout_ms", self.client.ack_timeout_ms),
            ("client.server_not_responding_ms", self.client.server_not_responding_ms),
        ] {
            if value == 0 {
                return Err(invalid(field, "must be greater than zero"));
            }
        }

        let mut seen = HashSet::new();
        for stream in &self.streams {
            if !seen.insert(stream.id()) {
                return Err(invalid("streams", format!("duplicate stream id {}", stream.id())));
            }
            if let StreamConfig::Periodic {
                id,
                payload,
                interval_ms,
            } = stream
            {
                if *interval_ms == 0 {
                    return Err(invalid("streams.interval_ms", format!("stream {id}: must be greater than zero")));
                }
                if payload.is_empty() || payload.len() > s.chunk_size {
                    return Err(invalid(
                        "streams.payload",
                        format!("stream {id}: payload must be 1..={} bytes", s.chunk_size),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Apply FERRY_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("FERRY_SERVER__LISTEN_V4") {
            if let Ok(a) = v.parse() {
                self.server.listen_v4 = Some(a);
            }
        }
        if let Ok(v) = std::env::var("FERRY_SERVER__LISTEN_V6") {
            if let Ok(a) = v.parse() {
                self.server.listen_v6 = Some(a);
            }
        }
        if let Ok(v) = std::env::var("FERRY_SERVER__ACK_TIMEOUT_MS") {
            if let Ok(ms) = v.parse() {
                self.server.ack_timeout_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("FERRY_SERVER__CLIENT_NOT_RESPONDING_MS") {
            if let Ok(ms) = v.parse() {
                self.server.client_not_responding_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("FERRY_SERVER__NEXT_CHUNK_WAIT_MS") {
            if let Ok(ms) = v.parse() {
                self.server.next_chunk_wait_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("FERRY_CLIENT__SERVER") {
            if let Ok(a) = v.parse() {
                self.client.server = a;
            }
        }
        if let Ok(v) = std::env::var("FERRY_CLIENT__ACK_TIMEOUT_MS") {
            if let Ok(ms) = v.parse() {
                self.client.ack_timeout_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("FERRY_CLIENT__SERVER_NOT_RESPONDING_MS") {
            if let Ok(ms) = v.parse() {
                self.client.server_not_responding_ms = ms;
            }
        }
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}
