//! Fan-out of outgoing messages to connected clients.

use tracing::warn;

use crate::types::{Clients, Outgoing, RejectReason, Tx};

/// Send a message to every connected client, sender included.
pub fn broadcast(clients: &Clients, msg: &Outgoing) {
    let s = match serde_json::to_string(msg) {
        Ok(s) => s,
        Err(e) => {
            warn!("failed to serialize broadcast: {}", e);
            return;
        }
    };
    for c in clients.iter() {
        let _ = c.value().tx.send(warp::ws::Message::text(s.clone()));
    }
}

/// Send a message to one client.
pub fn send_to(tx: &Tx, msg: &Outgoing) {
    if let Ok(s) = serde_json::to_string(msg) {
        let _ = tx.send(warp::ws::Message::text(s));
    }
}

/// Send an error notification to one client.
pub fn send_error(tx: &Tx, reason: RejectReason) {
    send_to(
        tx,
        &Outgoing::Error {
            code: reason,
            message: reason.message().to_string(),
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Client;
    use dashmap::DashMap;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    #[test]
    fn test_broadcast_reaches_everyone() {
        let clients: Clients = Arc::new(DashMap::new());
        let mut receivers = Vec::new();
        for i in 0..3 {
            let (tx, rx) = mpsc::unbounded_channel();
            clients.insert(format!("c{}", i), Client { tx });
            receivers.push(rx);
        }

        broadcast(
            &clients,
            &Outgoing::Msg {
                id: "abc".to_string(),
                text: "hi".to_string(),
                ts: 1,
            },
        );

        for rx in receivers.iter_mut() {
            let msg = rx.try_recv().unwrap();
            let json: serde_json::Value = serde_json::from_str(msg.to_str().unwrap()).unwrap();
            assert_eq!(json["type"], "msg");
            assert_eq!(json["text"], "hi");
        }
    }

    #[test]
    fn test_send_error_carries_code() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        send_error(&tx, RejectReason::TooLong);
        let msg = rx.try_recv().unwrap();
        let json: serde_json::Value = serde_json::from_str(msg.to_str().unwrap()).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["code"], "TOO_LONG");
        assert_eq!(json["message"], "Message too long.");
    }
}
