//! Ferry integration test harness.
//!
//! Every test runs a real server and client in-process over loopback UDP.
//! Timeouts are shrunk to tens of milliseconds so liveness and backoff
//! behaviour can be observed quickly. IPv6 tests skip when `::1` cannot be
//! bound; the link-local test skips when no interface has an `fe80::`
//! address.
//!
//!   cargo test --test integration

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV6};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};

use ferry_core::config::ServerConfig;
use ferry_ctl::{ClientSettings, StreamClient};
use ferry_services::{StreamRegistry, Transport};
use ferryd::{ServerHandle, StreamServer};

mod faults;
mod liveness;
mod transfer;

// ── Harness ───────────────────────────────────────────────────────────────────

/// The sample text used throughout: one chunk, multi-byte UTF-8.
pub const SAMPLE: &str = "1234567890\ntest\nzażółć gęsią jaźń";

/// IPv4 loopback only, fast timers.
pub fn local_config() -> ServerConfig {
    ServerConfig {
        listen_v4: Some(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))),
        listen_v6: None,
        ack_timeout_ms: 50,
        client_not_responding_ms: 2_000,
        next_chunk_wait_ms: 200,
        chunk_size: 400,
    }
}

pub fn fast_client() -> ClientSettings {
    ClientSettings {
        ack_timeout: Duration::from_millis(50),
        server_not_responding: Duration::from_secs(2),
    }
}

pub async fn start_server<T: Transport>(
    config: ServerConfig,
    registry: StreamRegistry,
) -> Result<ServerHandle> {
    StreamServer::<T>::with_registry(config, registry)
        .start()
        .await
        .context("server failed to start")
}

pub async fn client_for<T: Transport>(server: SocketAddr) -> Result<StreamClient<T>> {
    let local = match server {
        SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
        SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::LOCALHOST, 0)),
    };
    StreamClient::<T>::bind(local, fast_client())
        .await
        .context("client failed to bind")
}

pub fn v4_addr(handle: &ServerHandle) -> Result<SocketAddr> {
    handle.ipv4_addr().context("server has no IPv4 listener")
}

/// Poll `cond` every 10ms until it holds or `limit` passes.
pub async fn wait_until(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// Whether IPv6 loopback is usable on this host.
pub fn ipv6_available() -> bool {
    std::net::UdpSocket::bind((Ipv6Addr::LOCALHOST, 0)).is_ok()
}

/// A bindable link-local IPv6 address with its interface scope, taken from
/// `ip -o -6 addr show scope link`. Lines look like:
/// "2: eth0    inet6 fe80::1/64 scope link \       valid_lft forever ..."
pub fn link_local_addr() -> Option<SocketAddrV6> {
    let output = Command::new("ip")
        .args(["-o", "-6", "addr", "show", "scope", "link"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }

    for line in String::from_utf8_lossy(&output.stdout).lines() {
        if line.contains("tentative") || line.contains("dadfailed") {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        let Some(index) = fields
            .first()
            .and_then(|f| f.trim_end_matches(':').parse::<u32>().ok())
        else {
            continue;
        };
        let Some(pos) = fields.iter().position(|f| *f == "inet6") else {
            continue;
        };
        let Some(ip) = fields
            .get(pos + 1)
            .and_then(|a| a.split('/').next())
            .and_then(|a| a.parse::<Ipv6Addr>().ok())
        else {
            continue;
        };
        if ip.segments()[0] & 0xffc0 != 0xfe80 {
            continue;
        }
        let addr = SocketAddrV6::new(ip, 0, 0, index);
        if std::net::UdpSocket::bind(addr).is_ok() {
            return Some(addr);
        }
    }
    None
}

/// `len` random bytes.
pub fn random_payload(len: usize) -> Vec<u8> {
    use rand::RngCore;
    let mut data = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut data);
    data
}
