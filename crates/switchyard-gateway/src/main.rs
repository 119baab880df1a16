//! Switchyard gateway binary.
//!
//! Runs the central broker: the WebSocket listener for persistent
//! connections and the HTTP fallback for one-shot callers.

use anyhow::Result;
use clap::Parser;
use switchyard_gateway::{Gateway, GatewayConfig};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "switchyard-gateway")]
#[command(about = "Message-routing gateway for switchyard")]
struct Args {
    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Socket (WebSocket) port to listen on (0 = auto-assign)
    #[arg(short, long, default_value = "8765")]
    port: u16,

    /// HTTP fallback port to listen on (0 = auto-assign)
    #[arg(long, default_value = "8766")]
    http_port: u16,

    /// Shared authentication key clients must present
    #[arg(long)]
    auth_key: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    info!("Starting switchyard gateway");

    let config = GatewayConfig::new(args.host, args.port, args.http_port, args.auth_key);
    let mut handle = Gateway::start(config).await?;

    info!(
        "Gateway running: socket {} http {}",
        handle.socket_addr(),
        handle.http_addr()
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");
    handle.shutdown().await;

    Ok(())
}
