//! WebSocket client handling and connection lifecycle.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use warp::http::StatusCode;
use warp::Reply;

use crate::broadcast::{broadcast, send_error, send_to};
use crate::helpers::{generate_msg_id, now_ts, sanitize_html, validate_content, ContentRejection};
use crate::metrics::RelayMetrics;
use crate::rate_limit::{ConnectionVerdict, MessageVerdict, RateLimiter};
use crate::types::{Client, ClientId, Clients, HandshakeRefusal, Incoming, Outgoing, RejectReason, Tx};

/// Close code sent with a ban (RFC 6455 policy violation)
const POLICY_VIOLATION: u16 = 1008;

/// What the read loop does after a message
enum Flow {
    Continue,
    Disconnect,
}

/// Drops a session's broadcast entry and admission state when the session
/// ends, including when its task unwinds.
struct SessionGuard {
    client_id: ClientId,
    clients: Clients,
    limiter: Arc<RateLimiter>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.clients.remove(&self.client_id);
        self.limiter.unregister_client(&self.client_id);
    }
}

/// Extract the message body from a text frame.
///
/// A JSON object must be a `msg` envelope with string `text`, otherwise the
/// frame is not a chat message (`None`). Anything that is not a JSON object is
/// the message text itself.
fn message_body(frame: &str) -> Option<String> {
    match serde_json::from_str::<serde_json::Value>(frame) {
        Ok(value @ serde_json::Value::Object(_)) => match serde_json::from_value::<Incoming>(value) {
            Ok(Incoming::Msg { text }) => Some(text),
            Err(_) => None,
        },
        _ => Some(frame.to_string()),
    }
}

/// Gate a WebSocket upgrade on the ban registry.
///
/// Banned addresses get a 403 with a `TEMP_BANNED` body and `Retry-After`;
/// everyone else is upgraded.
pub fn handle_upgrade(
    ws: warp::ws::Ws,
    remote: Option<SocketAddr>,
    clients: Clients,
    limiter: Arc<RateLimiter>,
    metrics: Arc<RelayMetrics>,
    max_frame_bytes: usize,
) -> warp::reply::Response {
    let address = match remote {
        Some(addr) => addr.ip(),
        None => {
            warn!("connection without a remote address, using 0.0.0.0 as ban key");
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        }
    };

    match limiter.admit_connection(address, Instant::now()) {
        ConnectionVerdict::Admit => ws
            .max_message_size(max_frame_bytes)
            .on_upgrade(move |socket| client_connected(socket, address, clients, limiter, metrics))
            .into_response(),
        ConnectionVerdict::Reject {
            reason,
            retry_after,
        } => {
            metrics.increment_refused();
            // round up so clients never retry early
            let retry_after_secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            info!(
                "refused handshake from {}: {} (retry in {}s)",
                address,
                reason.code(),
                retry_after_secs
            );
            let body = HandshakeRefusal {
                code: reason,
                message: reason.message().to_string(),
                retry_after_secs,
            };
            let reply = warp::reply::with_status(warp::reply::json(&body), StatusCode::FORBIDDEN);
            warp::reply::with_header(reply, "retry-after", retry_after_secs.to_string())
                .into_response()
        }
    }
}

/// Handle a new WebSocket connection.
pub async fn client_connected(
    ws: warp::ws::WebSocket,
    address: IpAddr,
    clients: Clients,
    limiter: Arc<RateLimiter>,
    metrics: Arc<RelayMetrics>,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel();

    // Forward task: send messages from rx to WebSocket sink
    let forward_task = tokio::task::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    // Another session from this address may have been banned since the handshake
    if limiter.bans().is_banned(&address, Instant::now()) {
        metrics.increment_refused();
        send_error(&tx, RejectReason::Banned);
        let _ = tx.send(warp::ws::Message::close_with(
            POLICY_VIOLATION,
            RejectReason::Banned.code(),
        ));
        drop(tx);
        let _ = forward_task.await;
        return;
    }

    let client_id = Uuid::new_v4().to_string();
    limiter.register_client(&client_id, address);
    clients.insert(client_id.clone(), Client { tx: tx.clone() });
    let session = SessionGuard {
        client_id: client_id.clone(),
        clients: clients.clone(),
        limiter: limiter.clone(),
    };
    metrics.increment_connections();
    info!("New connection: {} (id: {})", address, client_id);

    send_to(
        &tx,
        &Outgoing::System {
            text: "Connected to the chat relay.".to_string(),
        },
    );

    // Main message loop
    while let Some(result) = ws_rx.next().await {
        let flow = match result {
            Ok(msg) => {
                if msg.is_text() {
                    match msg.to_str() {
                        Ok(text) => match message_body(text) {
                            Some(body) => {
                                handle_message(&client_id, &body, &tx, &clients, &limiter, &metrics)
                            }
                            None => {
                                debug!("dropping malformed msg envelope from {}", client_id);
                                metrics.increment_content_rejected();
                                Flow::Continue
                            }
                        },
                        Err(_) => Flow::Continue,
                    }
                } else if msg.is_close() {
                    Flow::Disconnect
                } else {
                    if msg.is_binary() {
                        debug!("ignoring binary frame from {}", client_id);
                        metrics.increment_content_rejected();
                    }
                    Flow::Continue
                }
            }
            Err(e) => {
                warn!("websocket error for {}: {}", address, e);
                Flow::Disconnect
            }
        };

        if let Flow::Disconnect = flow {
            break;
        }
    }

    // Cleanup
    drop(session);
    info!("Client disconnected: {} ({})", client_id, address);

    drop(tx);
    let _ = forward_task.await;
}

/// Run one message through content validation and the rate limiter, then
/// act on the verdict.
fn handle_message(
    client_id: &str,
    raw: &str,
    tx: &Tx,
    clients: &Clients,
    limiter: &RateLimiter,
    metrics: &RelayMetrics,
) -> Flow {
    let text = match validate_content(raw, limiter.config().max_message_length) {
        Ok(text) => text,
        Err(ContentRejection::Empty) => {
            debug!("dropping empty message from {}", client_id);
            metrics.increment_content_rejected();
            return Flow::Continue;
        }
        Err(ContentRejection::TooLong { length, max }) => {
            debug!("message too long from {}: {} > {}", client_id, length, max);
            metrics.increment_content_rejected();
            send_error(tx, RejectReason::TooLong);
            return Flow::Continue;
        }
    };

    let now = Instant::now();
    let verdict = match limiter.evaluate_message(client_id, now) {
        Ok(verdict) => verdict,
        Err(e) => {
            error!("{}", e);
            return Flow::Disconnect;
        }
    };

    match verdict {
        MessageVerdict::Admit => {
            let sanitized = sanitize_html(text);
            debug!("message from {}: {}", client_id, sanitized);
            metrics.increment_messages();
            broadcast(
                clients,
                &Outgoing::Msg {
                    id: generate_msg_id(),
                    text: sanitized,
                    ts: now_ts(),
                },
            );
            Flow::Continue
        }
        MessageVerdict::Reject {
            reason,
            violation_count,
        } => {
            warn!(
                "rate limit exceeded for {} (violation #{})",
                client_id, violation_count
            );
            metrics.increment_rate_limited();
            send_error(tx, reason);
            Flow::Continue
        }
        MessageVerdict::BanAndDisconnect { address, duration } => {
            limiter.bans().ban(address, duration, now);
            metrics.increment_bans();
            warn!(
                "banned {} for {}s after repeated flooding by {}",
                address,
                duration.as_secs(),
                client_id
            );
            send_error(tx, RejectReason::Banned);
            let _ = tx.send(warp::ws::Message::close_with(
                POLICY_VIOLATION,
                RejectReason::Banned.code(),
            ));
            Flow::Disconnect
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ban::BanRegistry;
    use crate::config::AdmissionConfig;
    use crate::routes::ws_route;
    use dashmap::DashMap;
    use std::time::Duration;

    fn setup(config: AdmissionConfig) -> (Clients, Arc<RateLimiter>, Arc<RelayMetrics>) {
        let clients: Clients = Arc::new(DashMap::new());
        let limiter = Arc::new(RateLimiter::new(config, Arc::new(BanRegistry::new())));
        (clients, limiter, Arc::new(RelayMetrics::new()))
    }

    async fn recv_json(client: &mut warp::test::WsClient) -> serde_json::Value {
        let msg = client.recv().await.unwrap();
        serde_json::from_str(msg.to_str().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_messages_are_sanitized_and_broadcast() {
        let (clients, limiter, metrics) = setup(AdmissionConfig::default());
        let route = ws_route(clients, limiter.clone(), metrics.clone(), 10_000);

        let mut client = warp::test::ws().path("/ws").handshake(route).await.unwrap();
        assert_eq!(recv_json(&mut client).await["type"], "system");

        client.send_text(r#"{"type":"msg","text":"  <b>hi</b>  "}"#).await;
        let msg = recv_json(&mut client).await;
        assert_eq!(msg["type"], "msg");
        assert_eq!(msg["text"], "&lt;b&gt;hi&lt;/b&gt;");

        // plain text frames are messages too
        client.send_text("hello").await;
        assert_eq!(recv_json(&mut client).await["text"], "hello");
        assert_eq!(metrics.snapshot().messages_broadcast, 2);
    }

    #[tokio::test]
    async fn test_content_rejections_do_not_count() {
        let config = AdmissionConfig {
            max_messages_per_window: 1,
            ..AdmissionConfig::default()
        };
        let (clients, limiter, metrics) = setup(config);
        let route = ws_route(clients, limiter, metrics, 10_000);

        let mut client = warp::test::ws().path("/ws").handshake(route).await.unwrap();
        recv_json(&mut client).await;

        client.send_text("   ").await;
        client.send_text("x".repeat(501)).await;
        let err = recv_json(&mut client).await;
        assert_eq!(err["type"], "error");
        assert_eq!(err["code"], "TOO_LONG");

        // the window is still empty, so this one passes
        client.send_text("ok").await;
        assert_eq!(recv_json(&mut client).await["text"], "ok");

        client.send_text("again").await;
        assert_eq!(recv_json(&mut client).await["code"], "RATE_LIMIT_EXCEEDED");
    }

    #[test]
    fn test_message_body_extraction() {
        assert_eq!(message_body(r#"{"type":"msg","text":"hi"}"#), Some("hi".to_string()));
        assert_eq!(message_body("hello there"), Some("hello there".to_string()));
        // JSON that is not an object is still plain text
        assert_eq!(message_body("42"), Some("42".to_string()));
        assert_eq!(message_body(r#"{"type":"msg","text":42}"#), None);
        assert_eq!(message_body(r#"{"type":"msg"}"#), None);
        assert_eq!(message_body(r#"{"type":"typing"}"#), None);
    }

    #[tokio::test]
    async fn test_non_string_text_is_dropped_silently() {
        let (clients, limiter, metrics) = setup(AdmissionConfig::default());
        let route = ws_route(clients, limiter, metrics.clone(), 10_000);

        let mut client = warp::test::ws().path("/ws").handshake(route).await.unwrap();
        recv_json(&mut client).await;

        client.send_text(r#"{"type":"msg","text":42}"#).await;
        client.send_text("after").await;

        // the next frame is the broadcast of "after", nothing came from the envelope
        let msg = recv_json(&mut client).await;
        assert_eq!(msg["type"], "msg");
        assert_eq!(msg["text"], "after");

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_broadcast, 1);
        assert_eq!(snapshot.content_rejected, 1);
    }

    #[tokio::test]
    async fn test_empty_messages_are_counted_as_content_rejections() {
        let (clients, limiter, metrics) = setup(AdmissionConfig::default());
        let route = ws_route(clients, limiter, metrics.clone(), 10_000);

        let mut client = warp::test::ws().path("/ws").handshake(route).await.unwrap();
        recv_json(&mut client).await;

        client.send_text("   ").await;
        client.send_text("x".repeat(501)).await;
        assert_eq!(recv_json(&mut client).await["code"], "TOO_LONG");
        assert_eq!(metrics.snapshot().content_rejected, 2);
    }

    #[tokio::test]
    async fn test_huge_ban_duration_still_bans_and_cleans_up() {
        let config = AdmissionConfig {
            max_messages_per_window: 1,
            ban_threshold: 1,
            ban_duration_secs: u64::MAX,
            ..AdmissionConfig::default()
        };
        let (clients, limiter, metrics) = setup(config);
        let route = ws_route(clients.clone(), limiter.clone(), metrics, 10_000);

        let mut client = warp::test::ws().path("/ws").handshake(route).await.unwrap();
        recv_json(&mut client).await;

        client.send_text("one").await;
        assert_eq!(recv_json(&mut client).await["type"], "msg");
        client.send_text("two").await;
        assert_eq!(recv_json(&mut client).await["code"], "TEMP_BANNED");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(limiter
            .bans()
            .is_banned(&IpAddr::V4(Ipv4Addr::LOCALHOST), Instant::now()));
        assert_eq!(limiter.active_clients(), 0);
        assert!(clients.is_empty());
    }

    #[tokio::test]
    async fn test_eleventh_message_is_rate_limited() {
        let (clients, limiter, metrics) = setup(AdmissionConfig::default());
        let route = ws_route(clients, limiter, metrics.clone(), 10_000);

        let mut client = warp::test::ws().path("/ws").handshake(route).await.unwrap();
        recv_json(&mut client).await;

        for i in 0..10 {
            client.send_text(format!("m{}", i)).await;
            assert_eq!(recv_json(&mut client).await["type"], "msg");
        }
        client.send_text("m10").await;
        let err = recv_json(&mut client).await;
        assert_eq!(err["code"], "RATE_LIMIT_EXCEEDED");
        assert_eq!(metrics.snapshot().rate_limited, 1);
    }

    #[tokio::test]
    async fn test_flooding_bans_and_refuses_reconnect() {
        let config = AdmissionConfig {
            max_messages_per_window: 1,
            ban_threshold: 2,
            ..AdmissionConfig::default()
        };
        let (clients, limiter, metrics) = setup(config);
        let route = ws_route(clients.clone(), limiter.clone(), metrics.clone(), 10_000);

        let mut client = warp::test::ws()
            .path("/ws")
            .handshake(route.clone())
            .await
            .unwrap();
        recv_json(&mut client).await;

        client.send_text("one").await;
        assert_eq!(recv_json(&mut client).await["type"], "msg");
        client.send_text("two").await;
        assert_eq!(recv_json(&mut client).await["code"], "RATE_LIMIT_EXCEEDED");
        client.send_text("three").await;
        assert_eq!(recv_json(&mut client).await["code"], "TEMP_BANNED");
        let closing = client.recv().await;
        assert!(closing.map(|m| m.is_close()).unwrap_or(true));

        // the test client connects over loopback
        let address = IpAddr::V4(Ipv4Addr::LOCALHOST);
        assert!(limiter.bans().is_banned(&address, Instant::now()));
        assert_eq!(metrics.snapshot().bans_issued, 1);

        assert!(warp::test::ws().path("/ws").handshake(route).await.is_err());
        assert_eq!(metrics.snapshot().connections_refused, 1);

        // state is gone once the session ends
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(limiter.active_clients(), 0);
        assert!(clients.is_empty());
    }

    #[tokio::test]
    async fn test_refusal_body_and_retry_after() {
        let (clients, limiter, metrics) = setup(AdmissionConfig::default());
        let address: IpAddr = "10.1.2.3".parse().unwrap();
        limiter
            .bans()
            .ban(address, Duration::from_secs(120), Instant::now());

        let route = ws_route(clients, limiter, metrics, 10_000);
        let resp = warp::test::request()
            .path("/ws")
            .remote_addr(SocketAddr::new(address, 40_000))
            .header("connection", "upgrade")
            .header("upgrade", "websocket")
            .header("sec-websocket-version", "13")
            .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
            .reply(&route)
            .await;

        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert_eq!(resp.headers()["retry-after"], "120");
        let body: serde_json::Value = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(body["code"], "TEMP_BANNED");
        assert_eq!(body["retry_after_secs"], 120);
    }
}
