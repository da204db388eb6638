//! ferry-ctl — requests a stream from a ferry server and reassembles it.

pub mod client;

pub use client::{
    ClientError, ClientPhase, ClientSettings, StopHandle, StreamClient, Transfer, TransferEnd,
};
