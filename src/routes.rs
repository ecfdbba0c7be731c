//! HTTP and WebSocket routes.

use std::sync::Arc;

use serde_json::json;
use warp::{Filter, Rejection, Reply};

use crate::client::handle_upgrade;
use crate::config::ServerConfig;
use crate::metrics::RelayMetrics;
use crate::rate_limit::RateLimiter;
use crate::types::Clients;

/// `GET /ws`: ban check, then WebSocket upgrade
pub fn ws_route(
    clients: Clients,
    limiter: Arc<RateLimiter>,
    metrics: Arc<RelayMetrics>,
    max_frame_bytes: usize,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let clients_filter = warp::any().map(move || clients.clone());
    let limiter_filter = warp::any().map(move || limiter.clone());
    let metrics_filter = warp::any().map(move || metrics.clone());

    warp::path("ws")
        .and(warp::path::end())
        .and(warp::ws())
        .and(warp::addr::remote())
        .and(clients_filter)
        .and(limiter_filter)
        .and(metrics_filter)
        .map(move |ws: warp::ws::Ws, remote, clients, limiter, metrics| {
            handle_upgrade(ws, remote, clients, limiter, metrics, max_frame_bytes)
        })
}

/// `GET /health`: liveness plus admission counters
pub fn health_route(
    clients: Clients,
    limiter: Arc<RateLimiter>,
    metrics: Arc<RelayMetrics>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    warp::path("health")
        .and(warp::path::end())
        .and(warp::get())
        .map(move || {
            warp::reply::json(&json!({
                "status": "ok",
                "connected_clients": clients.len(),
                "tracked_clients": limiter.active_clients(),
                "stored_bans": limiter.bans().len(),
                "metrics": metrics.snapshot(),
            }))
        })
}

/// Every route the relay serves
pub fn routes(
    server: &ServerConfig,
    clients: Clients,
    limiter: Arc<RateLimiter>,
    metrics: Arc<RelayMetrics>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let ws = ws_route(
        clients.clone(),
        limiter.clone(),
        metrics.clone(),
        server.max_frame_bytes,
    );
    let health = health_route(clients, limiter, metrics);

    // Static file routes
    let index_route = warp::path::end().and(warp::fs::file(server.static_dir.join("index.html")));
    let fallback_root = warp::path::end().map(|| "Chat relay is running!");
    let static_route = warp::fs::dir(server.static_dir.clone());

    let cors = warp::cors().allow_methods(vec!["GET", "POST"]);
    let cors = if server.allowed_origins.is_empty() {
        cors.allow_any_origin()
    } else {
        cors.allow_origins(server.allowed_origins.iter().map(String::as_str))
    };

    ws.or(health)
        .or(index_route)
        .or(fallback_root)
        .or(static_route)
        .with(cors)
        .with(warp::trace::request())
}
