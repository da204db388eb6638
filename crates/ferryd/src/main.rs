//! ferryd — serves the streams listed in the config file.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use ferry_core::config::FerryConfig;
use ferry_services::StreamRegistry;
use ferryd::StreamServer;

const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(10);

fn print_usage() {
    println!("Usage: ferryd [--config <path>]");
    println!();
    println!("Options:");
    println!("  --config <path>   Config file (default: $FERRY_CONFIG or ~/.config/ferry/config.toml)");
    println!("  --version         Print version and exit");
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut config_path: Option<PathBuf> = None;
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                config_path = Some(args.get(i).context("--config requires a value")?.into());
            }
            "--version" => {
                println!("ferryd {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "help" | "--help" | "-h" => {
                print_usage();
                return Ok(());
            }
            other => {
                eprintln!("Unknown argument: {other}");
                eprintln!();
                print_usage();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    let config = match config_path {
        Some(path) => FerryConfig::load_from(&path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => {
            if let Err(e) = FerryConfig::write_default_if_missing() {
                tracing::warn!(error = %e, "failed to write default config");
            }
            FerryConfig::load().context("failed to load config")?
        }
    };

    let registry = StreamRegistry::from_config(&config.streams, config.server.chunk_size)
        .context("failed to load streams")?;
    if registry.is_empty() {
        tracing::warn!("no streams configured, every request will get STREAM_NOT_FOUND");
    }
    for id in registry.ids() {
        if let Some(source) = registry.get(id) {
            tracing::info!(stream_id = id, source = %source.describe(), "stream registered");
        }
    }

    let server: StreamServer = StreamServer::with_registry(config.server.clone(), registry);
    let handle = server.start().await.context("failed to start server")?;
    tracing::info!(
        ipv4 = ?handle.ipv4_addr(),
        ipv6 = ?handle.ipv6_addr(),
        "ferryd running"
    );

    let session_printer = {
        let sessions = handle.sessions().clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SNAPSHOT_INTERVAL);
            loop {
                interval.tick().await;
                if sessions.is_empty() {
                    continue;
                }
                tracing::info!(count = sessions.len(), "session table snapshot");
                for s in sessions.iter() {
                    tracing::info!(
                        from = %s.key(),
                        client = %s.client,
                        stream_id = s.stream_id,
                        ack_port = s.ack_port,
                        age_secs = s.started_at.elapsed().as_secs(),
                        "  session"
                    );
                }
            }
        })
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("shutdown signal received");

    session_printer.abort();
    let stats = handle.stop().await?;
    tracing::info!(
        started = stats.sessions_started,
        completed = stats.sessions_completed,
        client_closed = stats.sessions_client_closed,
        not_responding = stats.sessions_not_responding,
        errors_sent = stats.errors_sent,
        "ferryd stopped"
    );
    Ok(())
}
