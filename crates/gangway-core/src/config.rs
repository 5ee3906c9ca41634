//! Engine configuration
//!
//! Loaded from the environment by embedders; every knob has a serde
//! default so a plain `EngineConfig::default()` is a working setup.

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use tracing::warn;

fn default_max_auto_advance() -> u32 {
    8
}

fn default_request_deadline_secs() -> u64 {
    25
}

fn default_discovery_window_secs() -> u64 {
    10
}

fn default_max_tool_timeout_secs() -> u64 {
    300
}

fn default_pending_callback_ttl_secs() -> u64 {
    3600
}

/// Tunables of the setup-flow engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Consecutive auto-advances before a flow is declared looping
    #[serde(default = "default_max_auto_advance")]
    pub max_auto_advance: u32,

    /// Overall deadline for a single request, bounding discovery waits
    /// independently of tool timeouts
    #[serde(default = "default_request_deadline_secs")]
    pub request_deadline_secs: u64,

    /// How long a discovery step accumulates announcements
    #[serde(default = "default_discovery_window_secs")]
    pub discovery_window_secs: u64,

    /// Upper clamp on tool-declared timeouts
    #[serde(default = "default_max_tool_timeout_secs")]
    pub max_tool_timeout_secs: u64,

    /// How long a session may wait parked for an OAuth callback
    #[serde(default = "default_pending_callback_ttl_secs")]
    pub pending_callback_ttl_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_auto_advance: default_max_auto_advance(),
            request_deadline_secs: default_request_deadline_secs(),
            discovery_window_secs: default_discovery_window_secs(),
            max_tool_timeout_secs: default_max_tool_timeout_secs(),
            pending_callback_ttl_secs: default_pending_callback_ttl_secs(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from `GANGWAY_*` environment variables, falling
    /// back to defaults for anything unset or unparsable
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.max_auto_advance = env_u64("GANGWAY_MAX_AUTO_ADVANCE")
            .map(|v| v as u32)
            .unwrap_or(config.max_auto_advance);
        config.request_deadline_secs =
            env_u64("GANGWAY_REQUEST_DEADLINE_SECS").unwrap_or(config.request_deadline_secs);
        config.discovery_window_secs =
            env_u64("GANGWAY_DISCOVERY_WINDOW_SECS").unwrap_or(config.discovery_window_secs);
        config.max_tool_timeout_secs =
            env_u64("GANGWAY_MAX_TOOL_TIMEOUT_SECS").unwrap_or(config.max_tool_timeout_secs);
        config.pending_callback_ttl_secs = env_u64("GANGWAY_PENDING_CALLBACK_TTL_SECS")
            .unwrap_or(config.pending_callback_ttl_secs);
        config
    }

    /// The request deadline as a duration
    #[inline]
    pub fn request_deadline(&self) -> Duration {
        Duration::from_secs(self.request_deadline_secs)
    }

    /// The discovery window, clamped to the request deadline
    #[inline]
    pub fn discovery_window(&self) -> Duration {
        Duration::from_secs(self.discovery_window_secs.min(self.request_deadline_secs))
    }

    /// A tool's effective timeout: its declared bound, clamped
    #[inline]
    pub fn tool_timeout(&self, declared_secs: u64) -> Duration {
        Duration::from_secs(declared_secs.min(self.max_tool_timeout_secs))
    }
}

fn env_u64(key: &str) -> Option<u64> {
    let raw = env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(%key, %raw, "ignoring unparsable engine configuration value");
            None
        }
    }
}
