//! Temporary IP bans.
//!
//! Lookups evict expired entries on the spot, so an expired ban is never
//! reported regardless of when the background sweep last ran. The sweep only
//! keeps memory bounded.

use std::net::IpAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Longest ban the registry will install (one year)
pub const MAX_BAN_DURATION: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Banned addresses and their expiry
pub struct BanRegistry {
    /// address -> expires_at
    entries: DashMap<IpAddr, Instant>,

    /// Periodic sweep task, if one was started
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl BanRegistry {
    /// Create a registry without a background sweep
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            sweeper: Mutex::new(None),
        }
    }

    /// Create a registry and start its periodic sweep on the current runtime.
    ///
    /// The task only holds a weak reference, so it ends by itself once the
    /// registry is dropped; `shutdown` stops it earlier.
    pub fn spawn(sweep_interval: Duration) -> Arc<Self> {
        let registry = Arc::new(Self::new());
        let weak: Weak<Self> = Arc::downgrade(&registry);

        let handle = tokio::task::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                match weak.upgrade() {
                    Some(registry) => {
                        registry.sweep_expired(Instant::now());
                    }
                    None => break,
                }
            }
        });

        *registry.sweeper.lock() = Some(handle);
        registry
    }

    /// Stop the background sweep. Lookups keep working.
    pub fn shutdown(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
            info!("ban sweeper stopped");
        }
    }

    /// True iff `address` has a ban expiring after `now`.
    pub fn is_banned(&self, address: &IpAddr, now: Instant) -> bool {
        self.remaining(address, now).is_some()
    }

    /// Time left on the ban for `address`, evicting it if it has expired.
    pub fn remaining(&self, address: &IpAddr, now: Instant) -> Option<Duration> {
        if self
            .entries
            .remove_if(address, |_, expires_at| *expires_at <= now)
            .is_some()
        {
            debug!("ban for {} expired", address);
            return None;
        }

        self.entries
            .get(address)
            .map(|expires_at| expires_at.saturating_duration_since(now))
    }

    /// Ban `address` until `now + duration`, replacing any existing ban.
    /// Durations above `MAX_BAN_DURATION` are capped.
    pub fn ban(&self, address: IpAddr, duration: Duration, now: Instant) -> Instant {
        let capped = duration.min(MAX_BAN_DURATION);
        if capped < duration {
            warn!("ban for {} capped from {:?} to {:?}", address, duration, capped);
        }
        let expires_at = match now.checked_add(capped) {
            Some(expires_at) => expires_at,
            None => {
                warn!("ban expiry for {} not representable, ban skipped", address);
                return now;
            }
        };
        self.entries.insert(address, expires_at);
        expires_at
    }

    /// Drop every ban that expired at or before `now`. Returns how many went.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, expires_at| *expires_at > now);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!("swept {} expired bans, {} remaining", removed, self.entries.len());
        }
        removed
    }

    /// Number of stored entries, including expired ones not yet swept
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl Default for BanRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BanRegistry {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.get_mut().take() {
            handle.abort();
        }
    }
}
