// Shared types between the facade, controller and backends

//! Shared data structures
//!
//! This module defines the profile descriptor, transient credentials, the
//! session status vocabulary reported to callers, and the configuration
//! structures read from the TOML file.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Tunnel profile descriptor. Identity is the provider bundle identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// Bundle identifier of the tunnel provider
    pub bundle_identifier: String,
    /// Identifier of the storage group shared with the provider
    pub group_identifier: String,
    /// Label shown in the system VPN settings
    pub display_label: String,
}

/// Username/password pair handed to the provider for a single connect call.
///
/// Never persisted by this crate; wiped from memory on drop.
#[derive(Clone, Default, Zeroize, ZeroizeOnDrop)]
pub struct Credentials {
    /// Account name, if supplied
    pub username: Option<String>,
    /// Account password, if supplied
    pub password: Option<String>,
}

impl Credentials {
    /// Create credentials from optional parts
    pub fn new(username: Option<String>, password: Option<String>) -> Self {
        Self { username, password }
    }

    /// Both parts, or None if either one is absent
    pub fn pair(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => Some((user.as_str(), pass.as_str())),
            _ => None,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Session status vocabulary reported to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Tunnel is up
    Connected,
    /// Tunnel is coming up
    Connecting,
    /// Tunnel is down, or nothing is loaded
    Disconnected,
    /// Tunnel is going down
    Disconnecting,
    /// Registration is not usable
    Invalid,
    /// Tunnel is re-establishing after a network change
    Reasserting,
    /// The OS reported a code outside the known set
    Unknown,
}

impl SessionStatus {
    /// Wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Connected => "connected",
            SessionStatus::Connecting => "connecting",
            SessionStatus::Disconnected => "disconnected",
            SessionStatus::Disconnecting => "disconnecting",
            SessionStatus::Invalid => "invalid",
            SessionStatus::Reasserting => "reasserting",
            SessionStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "connected" => Ok(SessionStatus::Connected),
            "connecting" => Ok(SessionStatus::Connecting),
            "disconnected" => Ok(SessionStatus::Disconnected),
            "disconnecting" => Ok(SessionStatus::Disconnecting),
            "invalid" => Ok(SessionStatus::Invalid),
            "reasserting" => Ok(SessionStatus::Reasserting),
            "unknown" => Ok(SessionStatus::Unknown),
            other => Err(format!("unknown session status '{}'", other)),
        }
    }
}

/// Which OS facility the daemon drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// NetworkManager over the system D-Bus
    NetworkManager,
    /// In-process simulation, for dry runs
    Memory,
}

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// `[general]` section
    #[serde(default)]
    pub general: GeneralConfig,
}

/// General configuration options
#[derive(Debug, Deserialize, Clone)]
pub struct GeneralConfig {
    /// Default log filter, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// OS facility to drive
    #[serde(default = "default_backend")]
    pub backend: BackendKind,
    /// Root of the directories shared with tunnel providers
    #[serde(default = "default_shared_dir")]
    pub shared_dir: PathBuf,
    /// Where the profile descriptor is persisted (kept in memory only if unset)
    #[serde(default)]
    pub profile_path: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            backend: default_backend(),
            shared_dir: default_shared_dir(),
            profile_path: None,
        }
    }
}

// Default values for configuration
fn default_log_level() -> String {
    "info".to_string()
}

fn default_backend() -> BackendKind {
    BackendKind::NetworkManager
}

fn default_shared_dir() -> PathBuf {
    PathBuf::from("/run/vpn-bridge")
}
