//! Configuration
//!
//! Timeouts and limits for discovery and the per-device protocol, loadable
//! from a YAML file. Everything has a sensible default so embedding
//! applications can run with `AppConfig::default()` and never touch a file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::fs;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

/// Transport backend settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    /// Client name announced to the MIDI system
    #[serde(default = "default_client_name")]
    pub client_name: String,
    /// Hotplug poll interval in milliseconds
    #[serde(default = "default_hotplug_poll_ms")]
    pub hotplug_poll_ms: u64,
}

/// Discovery settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DiscoveryConfig {
    /// How long to wait for an Identity Reply per output port
    #[serde(default = "default_identity_timeout_ms")]
    pub identity_timeout_ms: u64,
    /// Rescans triggered from within a rescan past this depth are refused
    #[serde(default = "default_max_rescan_depth")]
    pub max_rescan_depth: u32,
}

/// Per-device session settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    /// Reply timeout for ordinary commands
    #[serde(default = "default_reply_timeout_ms")]
    pub reply_timeout_ms: u64,
    /// Reply timeout for the capability probes at session open
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

fn default_client_name() -> String {
    "zoomlink".to_string()
}

fn default_hotplug_poll_ms() -> u64 {
    1000
}

fn default_identity_timeout_ms() -> u64 {
    500
}

fn default_max_rescan_depth() -> u32 {
    5
}

fn default_reply_timeout_ms() -> u64 {
    1000
}

fn default_probe_timeout_ms() -> u64 {
    300
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            client_name: default_client_name(),
            hotplug_poll_ms: default_hotplug_poll_ms(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            identity_timeout_ms: default_identity_timeout_ms(),
            max_rescan_depth: default_max_rescan_depth(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reply_timeout_ms: default_reply_timeout_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a YAML file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }
}

impl TransportConfig {
    pub fn hotplug_poll(&self) -> Duration {
        Duration::from_millis(self.hotplug_poll_ms)
    }
}

impl DiscoveryConfig {
    pub fn identity_timeout(&self) -> Duration {
        Duration::from_millis(self.identity_timeout_ms)
    }
}

impl SessionConfig {
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}
