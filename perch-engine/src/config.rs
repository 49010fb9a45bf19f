//! Engine configuration.
//!
//! One value, passed at construction and replaced wholesale through
//! [`crate::Engine::apply_config`]. Every section is `#[serde(default)]`, so a
//! TOML file only needs the keys it wants to change.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Real name sent in `USER` when none is configured.
pub const DEFAULT_REALNAME: &str = "perch";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Channels joined once the server welcomes us (001).
    pub autojoin: Vec<String>,
    /// Sent as `PASS` before registration. Read from config but never written
    /// back out.
    #[serde(skip_serializing)]
    pub server_password: Option<String>,
    pub ctcp: CtcpConfig,
    pub notifications: NotificationConfig,
    pub keepalive: KeepaliveConfig,
    pub sasl: SaslConfig,
    pub tls: TlsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CtcpConfig {
    /// Answer `CTCP VERSION` with `version_string`.
    pub respond_to_version: bool,
    /// Drop CTCP requests and replies (ACTION is always shown).
    pub ignore: bool,
    pub version_string: String,
}

impl Default for CtcpConfig {
    fn default() -> Self {
        Self {
            respond_to_version: true,
            ignore: false,
            version_string: concat!("perch ", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// One line per JOIN/PART/KICK. Ignored while `activity_summaries` is on.
    pub show_join_part: bool,
    pub show_quit_nick: bool,
    /// Batch JOIN/PART/KICK into one summary per channel per window.
    pub activity_summaries: bool,
    pub activity_window_secs: u64,
    /// Channel and private notices go to the chat target instead of status.
    pub route_notices_inline: bool,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            show_join_part: true,
            show_quit_nick: true,
            activity_summaries: true,
            activity_window_secs: 10,
            route_notices_inline: true,
        }
    }
}

impl NotificationConfig {
    /// Batch window, never shorter than one second.
    pub fn activity_window(&self) -> Duration {
        Duration::from_secs(self.activity_window_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepaliveConfig {
    pub enabled: bool,
    /// Idle seconds before the first probe.
    pub idle_secs: u64,
    /// Seconds between probes.
    pub interval_secs: u64,
    /// Failed probes before the kernel drops the connection.
    pub count: u32,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            idle_secs: 120,
            interval_secs: 30,
            count: 4,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SaslConfig {
    pub enabled: bool,
    /// Authentication identity. Falls back to the connection nick.
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// PEM certificate chain presented to the server.
    pub client_certfile: Option<PathBuf>,
    /// PEM private key. When unset the key is read from `client_certfile`.
    pub client_keyfile: Option<PathBuf>,
}
