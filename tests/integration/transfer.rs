//! End-to-end transfers over a clean loopback channel.

use crate::*;

use std::time::Duration;

use bytes::Bytes;
use ferry_core::wire::ErrorCode;
use ferry_ctl::{ClientError, TransferEnd};
use ferry_services::{FileStream, PeriodicStream, UdpTransport};

#[tokio::test]
async fn test_sample_file_arrives_in_one_chunk() -> Result<()> {
    let mut registry = StreamRegistry::new();
    registry.register(1, FileStream::from_bytes(SAMPLE, 400));
    let handle = start_server::<UdpTransport>(local_config(), registry).await?;
    let server = v4_addr(&handle)?;

    let mut client = client_for::<UdpTransport>(server).await?;
    let transfer = client.request(1, server, None).await?;

    assert_eq!(transfer.end, TransferEnd::Finished);
    assert_eq!(transfer.chunks, 1);
    assert_eq!(std::str::from_utf8(&transfer.data)?, SAMPLE);

    assert!(wait_until(Duration::from_secs(2), || handle.sessions().is_empty()).await);
    let stats = handle.stop().await?;
    assert_eq!(stats.sessions_started, 1);
    assert_eq!(stats.sessions_completed, 1);
    Ok(())
}

#[tokio::test]
async fn test_file_from_disk_multi_chunk() -> Result<()> {
    let data = random_payload(4_321);
    let path = std::env::temp_dir().join(format!("ferry-it-{}.bin", std::process::id()));
    std::fs::write(&path, &data)?;

    let mut registry = StreamRegistry::new();
    registry.register(3, FileStream::open(&path, 400)?);
    let handle = start_server::<UdpTransport>(local_config(), registry).await?;
    let server = v4_addr(&handle)?;

    let mut client = client_for::<UdpTransport>(server).await?;
    let transfer = client.request(3, server, None).await?;
    let _ = std::fs::remove_file(&path);

    assert_eq!(transfer.data, Bytes::from(data));
    assert_eq!(transfer.chunks, 11);

    handle.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_unknown_stream_returns_error() -> Result<()> {
    let mut registry = StreamRegistry::new();
    registry.register(1, FileStream::from_bytes(SAMPLE, 400));
    let handle = start_server::<UdpTransport>(local_config(), registry).await?;
    let server = v4_addr(&handle)?;

    let mut client = client_for::<UdpTransport>(server).await?;
    match client.request(99, server, None).await {
        Err(ClientError::Server(ErrorCode::StreamNotFound)) => {}
        other => panic!("expected STREAM_NOT_FOUND, got {other:?}"),
    }

    let stats = handle.stop().await?;
    assert_eq!(stats.errors_sent, 1);
    assert_eq!(stats.sessions_started, 0);
    Ok(())
}

#[tokio::test]
async fn test_periodic_stream_with_chunk_limit() -> Result<()> {
    let mut registry = StreamRegistry::new();
    registry.register(2, PeriodicStream::ping(Duration::from_millis(20)));
    let handle = start_server::<UdpTransport>(local_config(), registry).await?;
    let server = v4_addr(&handle)?;

    let mut client = client_for::<UdpTransport>(server).await?;
    let transfer = client.request(2, server, Some(3)).await?;

    assert_eq!(transfer.end, TransferEnd::ChunkLimit);
    assert_eq!(transfer.data, Bytes::from_static(b"PINGPINGPING"));

    // The client's FIN ends the session on the server.
    assert!(wait_until(Duration::from_secs(2), || handle.sessions().is_empty()).await);
    let stats = handle.stop().await?;
    assert_eq!(stats.sessions_client_closed, 1);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_clients_get_independent_copies() -> Result<()> {
    let data = random_payload(3_000);
    let mut registry = StreamRegistry::new();
    registry.register(1, FileStream::from_bytes(data.clone(), 400));
    let handle = start_server::<UdpTransport>(local_config(), registry).await?;
    let server = v4_addr(&handle)?;

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let client = client_for::<UdpTransport>(server).await?;
        tasks.push(client.spawn_request(1, server, None));
    }
    for task in tasks {
        let transfer = task.await??;
        assert_eq!(transfer.end, TransferEnd::Finished);
        assert_eq!(transfer.data, Bytes::from(data.clone()));
    }

    let stats = handle.stop().await?;
    assert_eq!(stats.sessions_started, 4);
    assert_eq!(stats.sessions_completed, 4);
    Ok(())
}

#[tokio::test]
async fn test_ipv6_transfer() -> Result<()> {
    if !ipv6_available() {
        eprintln!("SKIP: IPv6 loopback not available");
        return Ok(());
    }

    let config = ServerConfig {
        listen_v4: Some(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))),
        listen_v6: Some(SocketAddr::from((Ipv6Addr::LOCALHOST, 0))),
        ..local_config()
    };
    let mut registry = StreamRegistry::new();
    registry.register(1, FileStream::from_bytes(SAMPLE, 400));
    let handle = start_server::<UdpTransport>(config, registry).await?;
    let v6 = handle.ipv6_addr().context("no IPv6 listener")?;
    let v4 = v4_addr(&handle)?;

    let mut client6 = client_for::<UdpTransport>(v6).await?;
    let mut client4 = client_for::<UdpTransport>(v4).await?;
    let (r6, r4) = tokio::join!(client6.request(1, v6, None), client4.request(1, v4, None));

    assert_eq!(std::str::from_utf8(&r6?.data)?, SAMPLE);
    assert_eq!(std::str::from_utf8(&r4?.data)?, SAMPLE);

    let stats = handle.stop().await?;
    assert_eq!(stats.sessions_completed, 2);
    Ok(())
}

#[tokio::test]
async fn test_link_local_transfer_keeps_scope() -> Result<()> {
    let Some(local) = link_local_addr() else {
        eprintln!("SKIP: no usable fe80:: address");
        return Ok(());
    };

    let config = ServerConfig {
        listen_v4: None,
        listen_v6: Some(SocketAddr::V6(local)),
        ..local_config()
    };
    let mut registry = StreamRegistry::new();
    registry.register(1, FileStream::from_bytes(SAMPLE, 400));
    let handle = start_server::<UdpTransport>(config, registry).await?;
    let server = handle.ipv6_addr().context("no IPv6 listener")?;
    match server {
        SocketAddr::V6(v6) => assert_eq!(v6.scope_id(), local.scope_id()),
        other => panic!("listener bound as {other}"),
    }

    let mut client = StreamClient::<UdpTransport>::bind(SocketAddr::V6(local), fast_client())
        .await
        .context("client failed to bind")?;
    let transfer = client.request(1, server, None).await?;

    assert_eq!(transfer.end, TransferEnd::Finished);
    assert_eq!(std::str::from_utf8(&transfer.data)?, SAMPLE);

    let stats = handle.stop().await?;
    assert_eq!(stats.sessions_started, 1);
    assert_eq!(stats.sessions_completed, 1);
    Ok(())
}

#[tokio::test]
async fn test_stop_ends_live_sessions_promptly() -> Result<()> {
    let mut registry = StreamRegistry::new();
    registry.register(2, PeriodicStream::ping(Duration::from_millis(20)));
    let handle = start_server::<UdpTransport>(local_config(), registry).await?;
    let server = v4_addr(&handle)?;

    let client = client_for::<UdpTransport>(server).await?;
    let receiving = client.spawn_request(2, server, None);
    assert!(wait_until(Duration::from_secs(2), || !handle.sessions().is_empty()).await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    tokio::time::timeout(Duration::from_secs(1), handle.stop())
        .await
        .context("stop did not return within a second")??;

    // The session says goodbye on the way out.
    let transfer = tokio::time::timeout(Duration::from_secs(2), receiving).await???;
    assert_eq!(transfer.end, TransferEnd::Finished);
    assert!(transfer.chunks >= 1);
    Ok(())
}
