//! Relay configuration.
//!
//! Loaded from an optional TOML file, then overridden from the command line.
//! Every section falls back to its defaults, so a file only needs the keys it
//! changes.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use warp::http::uri::Authority;
use warp::http::HeaderValue;

use crate::ban::MAX_BAN_DURATION;

/// Upper bound for the sliding window (one hour)
const MAX_WINDOW_SECS: u64 = 60 * 60;

/// Upper bound for forgiveness delay and sweep interval (one day)
const MAX_DELAY_SECS: u64 = 24 * 60 * 60;

/// Top-level configuration for the relay
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub server: ServerConfig,
    pub admission: AdmissionConfig,
    pub logging: LoggingConfig,
}

/// Listener, static files and transport limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind
    pub host: IpAddr,

    /// Port to bind
    pub port: u16,

    /// Directory served at `/` (index.html) and for static assets
    pub static_dir: PathBuf,

    /// CORS origins; empty allows any origin
    pub allowed_origins: Vec<String>,

    /// Largest WebSocket message accepted by the transport (bytes)
    pub max_frame_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::from([0, 0, 0, 0]),
            port: 3000,
            static_dir: PathBuf::from("static"),
            allowed_origins: Vec::new(),
            max_frame_bytes: 10_000,
        }
    }
}

/// Rate limiting, violation decay and ban parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Sliding window length (seconds)
    pub window_secs: u64,

    /// Messages admitted per window
    pub max_messages_per_window: usize,

    /// Violations that trigger a ban
    pub ban_threshold: u32,

    /// How long a ban lasts (seconds)
    pub ban_duration_secs: u64,

    /// Idle time since the last violation before one violation is forgiven (seconds)
    pub forgiveness_delay_secs: u64,

    /// Longest accepted message, in characters
    pub max_message_length: usize,

    /// How often expired bans are swept from memory (seconds)
    pub ban_sweep_interval_secs: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            window_secs: 5,
            max_messages_per_window: 10,
            ban_threshold: 6,
            ban_duration_secs: 120,      // 2 minutes
            forgiveness_delay_secs: 20,
            max_message_length: 500,
            ban_sweep_interval_secs: 60,
        }
    }
}

impl AdmissionConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn ban_duration(&self) -> Duration {
        Duration::from_secs(self.ban_duration_secs)
    }

    pub fn forgiveness_delay(&self) -> Duration {
        Duration::from_secs(self.forgiveness_delay_secs)
    }

    pub fn ban_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.ban_sweep_interval_secs)
    }
}

/// Log output settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Base level when RUST_LOG is not set (trace, debug, info, warn, error)
    pub level: String,

    /// `compact` or `json`
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

impl RelayConfig {
    /// Load configuration from TOML file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    // Builder-style methods for CLI overrides

    pub fn with_host(mut self, host: Option<IpAddr>) -> Self {
        if let Some(host) = host {
            self.server.host = host;
        }
        self
    }

    pub fn with_port(mut self, port: Option<u16>) -> Self {
        if let Some(port) = port {
            self.server.port = port;
        }
        self
    }

    pub fn with_static_dir(mut self, dir: Option<PathBuf>) -> Self {
        if let Some(dir) = dir {
            self.server.static_dir = dir;
        }
        self
    }

    pub fn with_log_level(mut self, level: Option<String>) -> Self {
        if let Some(level) = level {
            self.logging.level = level;
        }
        self
    }

    /// Validate configuration values
    pub fn validate(&self) -> anyhow::Result<()> {
        let a = &self.admission;

        if a.window_secs == 0 {
            anyhow::bail!("admission.window_secs must be greater than 0");
        }
        if a.max_messages_per_window == 0 {
            anyhow::bail!("admission.max_messages_per_window must be greater than 0");
        }
        if a.ban_threshold == 0 {
            anyhow::bail!("admission.ban_threshold must be greater than 0");
        }
        if a.ban_sweep_interval_secs == 0 {
            anyhow::bail!("admission.ban_sweep_interval_secs must be greater than 0");
        }
        if a.max_message_length == 0 {
            anyhow::bail!("admission.max_message_length must be greater than 0");
        }

        let bounds = [
            ("window_secs", a.window_secs, MAX_WINDOW_SECS),
            ("forgiveness_delay_secs", a.forgiveness_delay_secs, MAX_DELAY_SECS),
            ("ban_sweep_interval_secs", a.ban_sweep_interval_secs, MAX_DELAY_SECS),
            ("ban_duration_secs", a.ban_duration_secs, MAX_BAN_DURATION.as_secs()),
        ];
        for (name, value, max) in bounds {
            if value > max {
                anyhow::bail!("admission.{} ({}) must not exceed {}", name, value, max);
            }
        }

        for origin in &self.server.allowed_origins {
            validate_origin(origin)?;
        }

        match self.logging.format.as_str() {
            "compact" | "json" => {}
            other => anyhow::bail!("logging.format must be 'compact' or 'json', got '{}'", other),
        }

        Ok(())
    }
}

/// Check a CORS origin the same way warp parses it: `scheme://authority`,
/// nothing else.
fn validate_origin(origin: &str) -> anyhow::Result<()> {
    let invalid = || {
        anyhow::anyhow!(
            "invalid CORS origin '{}': expected http(s)://host[:port] without a path",
            origin
        )
    };

    let (scheme, authority) = origin.split_once("://").ok_or_else(invalid)?;
    if scheme != "http" && scheme != "https" {
        return Err(invalid());
    }
    if authority.is_empty() || authority.contains(['/', '@']) {
        return Err(invalid());
    }
    authority.parse::<Authority>().map_err(|_| invalid())?;
    HeaderValue::from_str(origin).map_err(|_| invalid())?;
    Ok(())
}
