//! Core configuration types and loading.

use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use super::defaults::*;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Server information.
    pub server: ServerConfig,
    /// Network listen configuration.
    pub listen: ListenConfig,
    /// Object manager loop settings.
    #[serde(default)]
    pub omgr: OmgrConfig,
    /// Blocking worker pool settings.
    #[serde(default)]
    pub invoker: InvokerConfig,
    /// Client session settings.
    #[serde(default)]
    pub session: SessionConfig,
    /// Authentication settings.
    #[serde(default)]
    pub auth: AuthConfig,
    /// Log output settings.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Scheduled reboot settings.
    #[serde(default)]
    pub reboot: RebootConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

/// Server identity configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Server name, used in logs.
    pub name: String,
    /// Prometheus metrics HTTP port (disabled when unset).
    pub metrics_port: Option<u16>,
}

/// Network listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenConfig {
    /// Address to bind (e.g., "0.0.0.0:47624").
    pub address: SocketAddr,
    /// Seconds a new connection has to authenticate (default: 10).
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout: u64,
    /// Largest accepted frame in bytes (default: 1 MiB).
    #[serde(default = "default_max_frame")]
    pub max_frame: usize,
}

impl ListenConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout)
    }
}

/// Object manager configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct OmgrConfig {
    /// Units running longer than this many milliseconds are logged (default: 500).
    #[serde(default = "default_long_unit_ms")]
    pub long_unit_warn_ms: u64,
}

impl Default for OmgrConfig {
    fn default() -> Self {
        Self {
            long_unit_warn_ms: default_long_unit_ms(),
        }
    }
}

impl OmgrConfig {
    pub fn long_unit_threshold(&self) -> Duration {
        Duration::from_millis(self.long_unit_warn_ms)
    }
}

/// Invoker (blocking worker pool) configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct InvokerConfig {
    /// Units allowed to run concurrently (default: 4).
    #[serde(default = "default_invoker_workers")]
    pub workers: usize,
    /// Units running longer than this many milliseconds are logged (default: 500).
    #[serde(default = "default_long_unit_ms")]
    pub long_unit_warn_ms: u64,
}

impl Default for InvokerConfig {
    fn default() -> Self {
        Self {
            workers: default_invoker_workers(),
            long_unit_warn_ms: default_long_unit_ms(),
        }
    }
}

impl InvokerConfig {
    pub fn long_unit_threshold(&self) -> Duration {
        Duration::from_millis(self.long_unit_warn_ms)
    }
}

/// Client session configuration.
///
/// A session whose connection is lost is kept for `grace_period` seconds so
/// the client can resume it; the flush sweep ends it after that.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Seconds a disconnected session may wait for its client (default: 420).
    #[serde(default = "default_grace_period")]
    pub grace_period: u64,
    /// Seconds between flush sweeps (default: 60).
    #[serde(default = "default_flush_interval")]
    pub flush_interval: u64,
    /// Outbound messages queued per connection before dropping (default: 512).
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
    /// Client-object events held for a detached session (default: 1024).
    #[serde(default = "default_resume_backlog")]
    pub resume_backlog: usize,
    /// Inbound messages allowed per second per session (default: 100).
    #[serde(default = "default_messages_per_second")]
    pub messages_per_second: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            grace_period: default_grace_period(),
            flush_interval: default_flush_interval(),
            outbound_queue: default_outbound_queue(),
            resume_backlog: default_resume_backlog(),
            messages_per_second: default_messages_per_second(),
        }
    }
}

impl SessionConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval)
    }
}

/// How connecting clients are authenticated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// Every username is accepted.
    #[default]
    Open,
    /// Only the `[auth.users]` table is accepted.
    Static,
}

/// Authentication configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub mode: AuthMode,
    /// Username to password table for `static` mode.
    #[serde(default)]
    pub users: HashMap<String, String>,
}

/// Log output configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

/// Scheduled reboot configuration.
///
/// With `day_frequency` set, a reboot is planned every that many days at
/// `hour` local time. Clients are warned at each of `warnings` minutes
/// before it.
#[derive(Debug, Clone, Deserialize)]
pub struct RebootConfig {
    /// Days between automatic reboots (default: 0, disabled).
    #[serde(default)]
    pub day_frequency: u32,
    /// Local hour of the automatic reboot (default: 5).
    #[serde(default = "default_reboot_hour")]
    pub hour: u32,
    /// Move reboots that fall on a weekend to the following Monday.
    #[serde(default)]
    pub skip_weekends: bool,
    /// Minutes before the reboot at which clients are warned, descending
    /// (default: 30, 20, 15, 10, 5, 2).
    #[serde(default = "default_reboot_warnings")]
    pub warnings: Vec<u64>,
    /// Text sent with each warning instead of the standard message key.
    pub message: Option<String>,
}

impl Default for RebootConfig {
    fn default() -> Self {
        Self {
            day_frequency: 0,
            hour: default_reboot_hour(),
            skip_weekends: false,
            warnings: default_reboot_warnings(),
            message: None,
        }
    }
}
