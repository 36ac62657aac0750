//! Tether signaling server binary.
//!
//! # Usage
//!
//! ```bash
//! # Listen on the default port
//! tether-server --bind 0.0.0.0:5001
//!
//! # Expire unanswered join requests after 30 seconds
//! tether-server --join-timeout-secs 30 --announce-disconnects
//! ```

use std::time::Duration;

use clap::Parser;
use tether_core::ConnectionConfig;
use tether_server::{DriverConfig, Server, ServerRuntimeConfig};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Tether WebRTC signaling server
#[derive(Parser, Debug)]
#[command(name = "tether-server")]
#[command(about = "WebRTC signaling relay with creator-approved rooms")]
#[command(version)]
struct Args {
    /// Address to bind to
    #[arg(short, long, default_value = "0.0.0.0:5001")]
    bind: String,

    /// Maximum concurrent connections
    #[arg(long, default_value = "10000")]
    max_connections: usize,

    /// Close connections silent for this many seconds
    #[arg(long, default_value = "60")]
    idle_timeout_secs: u64,

    /// Seconds between heartbeat pings
    #[arg(long, default_value = "20")]
    heartbeat_interval_secs: u64,

    /// Decline join requests left unanswered this many seconds
    #[arg(long)]
    join_timeout_secs: Option<u64>,

    /// Tell every session when any session disconnects
    #[arg(long)]
    announce_disconnects: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn runtime_config(&self) -> ServerRuntimeConfig {
        ServerRuntimeConfig {
            bind_address: self.bind.clone(),
            driver: DriverConfig {
                connection: ConnectionConfig {
                    idle_timeout: Duration::from_secs(self.idle_timeout_secs),
                    heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
                },
                max_connections: self.max_connections,
                join_request_timeout: self.join_timeout_secs.map(Duration::from_secs),
                announce_disconnects: self.announce_disconnects,
            },
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!("Tether server starting");
    tracing::info!("Binding to {}", args.bind);

    let server = Server::bind(args.runtime_config()).await?;

    tracing::info!("Server listening on {}", server.local_addr()?);

    server.run().await?;

    Ok(())
}
