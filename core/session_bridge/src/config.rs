//! Bridge configuration
//!
//! Defaults describe a private two-member lobby over one reliable-sequenced
//! channel. Any field may be overridden from a JSON file.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::directory::Visibility;
use crate::transport::Topology;

/// Default lobby capacity
pub const DEFAULT_MAX_MEMBERS: usize = 2;

/// Default time allowed for each handshake sub-state
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

/// Default time allowed for the engine server to come up
pub const DEFAULT_SERVER_START_TIMEOUT_MS: u64 = 5_000;

/// Default upper bound on datagrams ingested per tick
pub const DEFAULT_MAX_DATAGRAMS_PER_TICK: usize = 32;

/// Runtime settings for a [`SessionBridge`](crate::SessionBridge)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub max_members: usize,
    pub visibility: Visibility,
    pub handshake_timeout_ms: u64,
    pub server_start_timeout_ms: u64,
    pub max_datagrams_per_tick: usize,
    pub topology: Topology,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            max_members: DEFAULT_MAX_MEMBERS,
            visibility: Visibility::Private,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            server_start_timeout_ms: DEFAULT_SERVER_START_TIMEOUT_MS,
            max_datagrams_per_tick: DEFAULT_MAX_DATAGRAMS_PER_TICK,
            topology: Topology::reliable_sequenced(),
        }
    }
}

impl BridgeConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn server_start_timeout(&self) -> Duration {
        Duration::from_millis(self.server_start_timeout_ms)
    }

    /// Parse overrides from JSON; missing fields keep their defaults
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, Box<dyn std::error::Error>> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::from_json(&text)?)
    }
}
