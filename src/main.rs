//! Chat Relay — real-time WebSocket broadcast with admission control
//!
//! Modular structure:
//! - config.rs: TOML configuration and CLI overrides
//! - logging.rs: tracing subscriber setup
//! - types.rs: Core data structures and wire messages
//! - ban.rs: Temporary IP bans with a background sweep
//! - rate_limit.rs: Sliding-window limiter and violation tracking
//! - helpers.rs: Content validation and sanitization
//! - broadcast.rs: Fan-out to connected clients
//! - client.rs: WebSocket client lifecycle
//! - routes.rs: HTTP routes
//! - metrics.rs: Relay counters

mod ban;
mod broadcast;
mod client;
mod config;
mod error;
mod helpers;
mod logging;
mod metrics;
mod rate_limit;
mod routes;
mod types;

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use dashmap::DashMap;
use tracing::info;

use crate::ban::BanRegistry;
use crate::config::RelayConfig;
use crate::metrics::RelayMetrics;
use crate::rate_limit::RateLimiter;
use crate::types::Clients;

/// Real-time chat relay with flood protection
#[derive(Parser, Debug)]
#[command(name = "chat-relay")]
#[command(version)]
#[command(about = "WebSocket broadcast relay with rate limiting and temporary IP bans", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to bind
    #[arg(long)]
    host: Option<IpAddr>,

    /// Port to listen on
    #[arg(short, long, env = "PORT")]
    port: Option<u16>,

    /// Directory with index.html and static assets
    #[arg(long)]
    static_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => RelayConfig::load(path)
            .map_err(|e| anyhow::anyhow!("failed to load {}: {}", path.display(), e))?,
        None => RelayConfig::default(),
    }
    .with_host(args.host)
    .with_port(args.port)
    .with_static_dir(args.static_dir)
    .with_log_level(args.log_level);
    config.validate()?;

    logging::init_logging(&config.logging)?;
    info!("Starting chat relay v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "admission: {} msgs / {}s, ban after {} violations for {}s, forgive every {}s idle",
        config.admission.max_messages_per_window,
        config.admission.window_secs,
        config.admission.ban_threshold,
        config.admission.ban_duration_secs,
        config.admission.forgiveness_delay_secs
    );

    let bans = BanRegistry::spawn(config.admission.ban_sweep_interval());
    let limiter = Arc::new(RateLimiter::new(config.admission.clone(), bans.clone()));
    let clients: Clients = Arc::new(DashMap::new());
    let metrics = Arc::new(RelayMetrics::new());

    let routes = routes::routes(&config.server, clients, limiter, metrics);

    let addr = SocketAddr::new(config.server.host, config.server.port);
    info!("Server running at http://{}/", addr);

    // Server task
    let server = warp::serve(routes).run(addr);

    // Graceful shutdown with signal handling
    tokio::select! {
        _ = server => {
            info!("Server process finished");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Cleaning up...");
        }
    }

    bans.shutdown();
    info!("Shutdown complete.");

    Ok(())
}
