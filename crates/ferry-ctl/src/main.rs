//! ferry-ctl — command-line client for a ferry server.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};

use ferry_core::config::FerryConfig;
use ferry_ctl::{ClientError, ClientSettings, StreamClient, TransferEnd};

fn print_usage() {
    println!("Usage: ferry-ctl [options] request <stream-id>");
    println!();
    println!("Commands:");
    println!("  request <id>   Receive stream <id> and print it to stdout");
    println!();
    println!("Options:");
    println!("  --server <addr>       Server address (default: from config, 127.0.0.1:8801)");
    println!("  --max-chunks <n>      Stop after <n> data chunks");
    println!("  --output <path>       Write the received bytes to <path> instead of stdout");
}

async fn cmd_request(
    config: &FerryConfig,
    server: SocketAddr,
    stream_id: u32,
    max_chunks: Option<usize>,
    output: Option<PathBuf>,
) -> Result<()> {
    let settings = ClientSettings::from(&config.client);
    let mut client: StreamClient = StreamClient::for_server(server, settings)
        .await
        .context("failed to bind client socket")?;

    let stop = client.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted, closing connection");
            stop.stop();
        }
    });

    let transfer = match client.request(stream_id, server, max_chunks).await {
        Ok(t) => t,
        Err(ClientError::ServerNotResponding { partial }) if !partial.is_empty() => {
            tracing::warn!(bytes = partial.len(), "server went silent, keeping partial data");
            emit(&partial, output.as_ref()).await?;
            anyhow::bail!("server {server} stopped responding");
        }
        Err(e) => return Err(e).with_context(|| format!("request for stream {stream_id} failed")),
    };

    if transfer.end != TransferEnd::Finished {
        tracing::info!(end = ?transfer.end, chunks = transfer.chunks, "transfer ended early");
    }
    emit(&transfer.data, output.as_ref()).await
}

async fn emit(data: &[u8], output: Option<&PathBuf>) -> Result<()> {
    match output {
        Some(path) => {
            tokio::fs::write(path, data)
                .await
                .with_context(|| format!("failed to write {}", path.display()))?;
            tracing::info!(path = %path.display(), bytes = data.len(), "saved");
        }
        None => println!("{}", String::from_utf8_lossy(data)),
    }
    Ok(())
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = FerryConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        FerryConfig::default()
    });

    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut server = config.client.server;
    let mut max_chunks = None;
    let mut output = None;
    let mut remaining: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--server" => {
                i += 1;
                server = args
                    .get(i)
                    .context("--server requires a value")?
                    .parse()
                    .context("--server must be an address like 127.0.0.1:8801 or [::1]:8801")?;
            }
            "--max-chunks" => {
                i += 1;
                max_chunks = Some(
                    args.get(i)
                        .context("--max-chunks requires a value")?
                        .parse::<usize>()
                        .context("--max-chunks must be a number")?,
                );
            }
            "--output" => {
                i += 1;
                output = Some(PathBuf::from(args.get(i).context("--output requires a value")?));
            }
            other => remaining.push(other),
        }
        i += 1;
    }

    match remaining.as_slice() {
        ["request", id] => {
            let stream_id: u32 = id.parse().context("stream id must be a number")?;
            cmd_request(&config, server, stream_id, max_chunks, output).await
        }
        ["help"] | ["--help"] | ["-h"] | [] => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}
