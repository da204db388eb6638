//! ferry-core — wire format, payload hashing, and configuration.
//! All other Ferry crates depend on this one.

pub mod config;
pub mod crypto;
pub mod wire;

pub use wire::{ErrorCode, MessageType, WireError, WireMessage};
