//! Core data types and type aliases for the relay.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Per-connection identifier assigned when the socket is accepted.
pub type ClientId = String;

/// Sender channel for WebSocket messages to a client.
pub type Tx = mpsc::UnboundedSender<warp::ws::Message>;

/// Connected clients map: client_id -> Client
pub type Clients = Arc<DashMap<ClientId, Client>>;

/// A connected client as seen by the broadcaster.
#[derive(Clone)]
pub struct Client {
    pub tx: Tx,
}

/// Why a connection or message was turned away. Serialized as the stable
/// codes clients branch on.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    #[serde(rename = "RATE_LIMIT_EXCEEDED")]
    RateLimited,
    #[serde(rename = "TEMP_BANNED")]
    Banned,
    #[serde(rename = "TOO_LONG")]
    TooLong,
}

impl RejectReason {
    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::RateLimited => "RATE_LIMIT_EXCEEDED",
            RejectReason::Banned => "TEMP_BANNED",
            RejectReason::TooLong => "TOO_LONG",
        }
    }

    /// Human-readable text sent alongside the code.
    pub fn message(&self) -> &'static str {
        match self {
            RejectReason::RateLimited => "You are sending messages too fast. Please slow down.",
            RejectReason::Banned => "You have been temporarily banned for flooding.",
            RejectReason::TooLong => "Message too long.",
        }
    }
}

/// Messages sent from server to client.
#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Outgoing {
    System { text: String },
    Msg { id: String, text: String, ts: u64 },
    Error { code: RejectReason, message: String },
}

/// Messages received from client.
#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Incoming {
    Msg { text: String },
}

/// Body of the HTTP response that refuses a WebSocket handshake.
#[derive(Serialize, Deserialize, Debug)]
pub struct HandshakeRefusal {
    pub code: RejectReason,
    pub message: String,
    pub retry_after_secs: u64,
}
