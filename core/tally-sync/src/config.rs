//! Sync configuration.
//!
//! Every timing and sizing constant of a session lives here. Nothing is
//! negotiated with the peer; both sides run with their own values.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default chunk size for payload transfer (16 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// Default pairing code length.
pub const DEFAULT_PAIRING_CODE_LENGTH: usize = 6;

/// Configuration for a sync device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Device name shown to the peer.
    pub device_label: String,
    /// Length of generated pairing codes.
    pub pairing_code_length: usize,
    /// Maximum chunk size in bytes.
    pub chunk_size: usize,
    /// How long a session may wait for the direct connection (ms).
    pub session_timeout_ms: u64,
    /// Upper bound on candidate gathering (ms).
    pub gathering_timeout_ms: u64,
    /// Interval between keep-alive messages (ms).
    pub heartbeat_interval_ms: u64,
    /// Recovery attempts after the link drops.
    pub max_reconnect_attempts: u32,
    /// Pause between recovery attempts (ms).
    pub reconnect_delay_ms: u64,
    /// How long a dropped link may stay down before recovery starts (ms).
    pub disconnect_grace_ms: u64,
    /// Longest connection token accepted for decoding (characters).
    pub max_token_length: usize,
    /// Capacity of the orchestrator's event channel. A full channel pauses
    /// the orchestrator until the observer reads.
    pub event_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            device_label: "Tally Device".to_string(),
            pairing_code_length: DEFAULT_PAIRING_CODE_LENGTH,
            chunk_size: DEFAULT_CHUNK_SIZE,
            session_timeout_ms: 180_000,
            gathering_timeout_ms: 5_000,
            heartbeat_interval_ms: 5_000,
            max_reconnect_attempts: 3,
            reconnect_delay_ms: 2_000,
            disconnect_grace_ms: 3_000,
            max_token_length: 4_096,
            event_buffer: 64,
        }
    }
}

impl SyncConfig {
    /// Creates a config with the default values and the given device label.
    pub fn with_label(label: impl Into<String>) -> Self {
        Self {
            device_label: label.into(),
            ..Self::default()
        }
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn gathering_timeout(&self) -> Duration {
        Duration::from_millis(self.gathering_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }

    /// Serializes the config to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Parses a config from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
