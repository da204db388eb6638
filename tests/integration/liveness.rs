//! A client that stops answering, seen from the server.

use crate::*;

use std::time::Duration;

use ferry_core::wire::{MessageType, WireMessage};
use ferry_services::{Endpoint, FileStream, UdpTransport};
use tokio::time::Instant;

fn silent_config() -> ServerConfig {
    ServerConfig {
        ack_timeout_ms: 50,
        client_not_responding_ms: 600,
        ..local_config()
    }
}

/// Sends a REQ and then never acknowledges anything.
async fn silent_client(server: SocketAddr) -> Result<Endpoint> {
    let ep: Endpoint = Endpoint::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).await?;
    ep.send(&WireMessage::request(1, ep.port()), server).await?;
    Ok(ep)
}

#[tokio::test]
async fn test_silent_client_released_without_fin() -> Result<()> {
    let mut registry = StreamRegistry::new();
    registry.register(1, FileStream::from_bytes(SAMPLE, 400));
    let handle = start_server::<UdpTransport>(silent_config(), registry).await?;
    let server = v4_addr(&handle)?;

    let client = silent_client(server).await?;
    assert!(wait_until(Duration::from_secs(1), || handle.sessions().len() == 1).await);
    assert!(
        wait_until(Duration::from_secs(3), || handle.sessions().is_empty()).await,
        "session should be dropped once the lag passes the threshold"
    );

    let mut kinds = Vec::new();
    while let Some((msg, _)) = client.recv_timeout(Duration::from_millis(50)).await? {
        kinds.push(msg.kind);
    }
    assert!(kinds.len() > 1, "INF should have been retransmitted");
    assert!(
        kinds.iter().all(|k| *k == MessageType::Inf),
        "nothing but INF expected, got {kinds:?}"
    );

    let stats = handle.stop().await?;
    assert_eq!(stats.sessions_not_responding, 1);
    Ok(())
}

#[tokio::test]
async fn test_retransmit_interval_backs_off() -> Result<()> {
    let mut registry = StreamRegistry::new();
    registry.register(1, FileStream::from_bytes(SAMPLE, 400));
    let handle = start_server::<UdpTransport>(silent_config(), registry).await?;
    let server = v4_addr(&handle)?;

    let client = silent_client(server).await?;
    let mut arrivals = Vec::new();
    while let Some((msg, _)) = client.recv_timeout(Duration::from_secs(1)).await? {
        if msg.kind == MessageType::Inf {
            arrivals.push(Instant::now());
        }
    }

    // Waits of 50, 100, 200, 400ms: four sends before the lag reaches 600ms.
    assert_eq!(arrivals.len(), 4, "one INF per wait");
    let gaps: Vec<Duration> = arrivals.windows(2).map(|w| w[1] - w[0]).collect();
    assert!(gaps[1] > gaps[0], "gaps should grow: {gaps:?}");
    assert!(gaps[2] > gaps[1], "gaps should grow: {gaps:?}");
    assert!(gaps[2] >= Duration::from_millis(150), "third wait is 200ms: {gaps:?}");

    handle.stop().await?;
    Ok(())
}
