//! Per-client sliding-window rate limiting with escalating bans.
//!
//! Each client keeps the timestamps of its admitted messages inside the
//! trailing window plus a violation counter. Going over the window cap is a
//! violation; enough violations turn into a ban of the client's address.
//! Violations decay by one per idle `forgiveness_delay`, at most one step per
//! evaluated message.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::ban::BanRegistry;
use crate::config::AdmissionConfig;
use crate::error::AdmissionError;
use crate::types::{ClientId, RejectReason};

/// Outcome of a connection attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionVerdict {
    Admit,
    Reject {
        reason: RejectReason,
        retry_after: Duration,
    },
}

/// Outcome of one inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageVerdict {
    Admit,
    Reject {
        reason: RejectReason,
        violation_count: u32,
    },
    /// The caller installs the ban and closes the connection.
    BanAndDisconnect { address: IpAddr, duration: Duration },
}

/// Admission state of one connected client
#[derive(Debug)]
struct ClientState {
    address: IpAddr,
    /// Admitted messages inside the window, oldest first
    recent: VecDeque<Instant>,
    violations: u32,
    last_violation: Option<Instant>,
}

impl ClientState {
    fn new(address: IpAddr) -> Self {
        Self {
            address,
            recent: VecDeque::new(),
            violations: 0,
            last_violation: None,
        }
    }

    fn evaluate(&mut self, now: Instant, config: &AdmissionConfig) -> MessageVerdict {
        let window = config.window();
        while let Some(&oldest) = self.recent.front() {
            if now.saturating_duration_since(oldest) > window {
                self.recent.pop_front();
            } else {
                break;
            }
        }

        // Forgiveness runs before the limit check and resets the decay clock.
        if self.violations > 0 {
            if let Some(last) = self.last_violation {
                if now.saturating_duration_since(last) > config.forgiveness_delay() {
                    self.violations -= 1;
                    self.last_violation = Some(now);
                    debug!(
                        "forgave one violation for {}, {} left",
                        self.address, self.violations
                    );
                }
            }
        }

        if self.recent.len() >= config.max_messages_per_window {
            self.violations += 1;
            self.last_violation = Some(now);

            if self.violations >= config.ban_threshold {
                return MessageVerdict::BanAndDisconnect {
                    address: self.address,
                    duration: config.ban_duration(),
                };
            }
            return MessageVerdict::Reject {
                reason: RejectReason::RateLimited,
                violation_count: self.violations,
            };
        }

        self.recent.push_back(now);
        MessageVerdict::Admit
    }
}

/// Rate limiter and violation tracker for all connected clients.
///
/// Each client's state sits behind its own lock, so evaluations for one
/// client are serialized while different clients proceed in parallel.
pub struct RateLimiter {
    config: AdmissionConfig,
    bans: Arc<BanRegistry>,
    clients: DashMap<ClientId, Arc<Mutex<ClientState>>>,
}

impl RateLimiter {
    pub fn new(config: AdmissionConfig, bans: Arc<BanRegistry>) -> Self {
        Self {
            config,
            bans,
            clients: DashMap::new(),
        }
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    pub fn bans(&self) -> &Arc<BanRegistry> {
        &self.bans
    }

    /// Check a connection attempt against the ban registry. Runs before any
    /// client state exists.
    pub fn admit_connection(&self, address: IpAddr, now: Instant) -> ConnectionVerdict {
        match self.bans.remaining(&address, now) {
            Some(retry_after) => {
                debug!("refusing connection from banned {}", address);
                ConnectionVerdict::Reject {
                    reason: RejectReason::Banned,
                    retry_after,
                }
            }
            None => ConnectionVerdict::Admit,
        }
    }

    /// Allocate fresh state for an accepted connection.
    ///
    /// `client_id` must be unique among live connections; registering an id
    /// twice replaces the earlier state.
    pub fn register_client(&self, client_id: &str, address: IpAddr) {
        let previous = self.clients.insert(
            client_id.to_string(),
            Arc::new(Mutex::new(ClientState::new(address))),
        );
        if previous.is_some() {
            warn!("client {} registered twice, state reset", client_id);
        }
    }

    /// Decide whether one message from `client_id` may pass.
    pub fn evaluate_message(
        &self,
        client_id: &str,
        now: Instant,
    ) -> Result<MessageVerdict, AdmissionError> {
        // Clone the handle out so the map shard is not held while evaluating.
        let state = self
            .clients
            .get(client_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| AdmissionError::UnknownClient(client_id.to_string()))?;

        let verdict = state.lock().evaluate(now, &self.config);
        Ok(verdict)
    }

    /// Discard a client's state. Unknown ids are ignored.
    pub fn unregister_client(&self, client_id: &str) -> bool {
        self.clients.remove(client_id).is_some()
    }

    /// Number of clients with live state
    pub fn active_clients(&self) -> usize {
        self.clients.len()
    }

    #[cfg(test)]
    fn snapshot(&self, client_id: &str) -> Option<(usize, u32)> {
        self.clients.get(client_id).map(|entry| {
            let state = entry.value().lock();
            (state.recent.len(), state.violations)
        })
    }
}
