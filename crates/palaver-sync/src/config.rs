//! Runtime configuration.
//!
//! Two layers, in priority order:
//!
//! 1. **Compiled defaults**: [`SyncConfig::default()`]
//! 2. **Environment variables**: `PALAVER_*` overrides
//!
//! Malformed env values are logged and ignored rather than failing startup.

use std::time::Duration;

use palaver_core::retry::RetryConfig;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Knobs for the sync core.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    /// Reconnection policy for the connection supervisor.
    pub reconnect: RetryConfig,
    /// Capacity of the client command channel.
    pub command_capacity: usize,
    /// Capacity of the push-event channel (supervisor → client loop).
    pub push_capacity: usize,
    /// Capacity of the user-facing client event channel.
    pub event_capacity: usize,
    /// How long a typing indicator stays raised without a clearing event,
    /// in milliseconds.
    pub typing_expiry_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            reconnect: RetryConfig::default(),
            command_capacity: 64,
            push_capacity: 256,
            event_capacity: 256,
            typing_expiry_ms: 6_000,
        }
    }
}

impl SyncConfig {
    /// Defaults with `PALAVER_*` environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        apply_u64("PALAVER_TYPING_EXPIRY_MS", &mut config.typing_expiry_ms);
        apply_u32(
            "PALAVER_RECONNECT_MAX_ATTEMPTS",
            &mut config.reconnect.max_attempts,
        );
        apply_u64(
            "PALAVER_RECONNECT_INITIAL_DELAY_MS",
            &mut config.reconnect.initial_delay_ms,
        );
        apply_u64(
            "PALAVER_RECONNECT_MAX_DELAY_MS",
            &mut config.reconnect.max_delay_ms,
        );
        config
    }

    /// Typing expiry as a [`Duration`].
    pub fn typing_expiry(&self) -> Duration {
        Duration::from_millis(self.typing_expiry_ms)
    }
}

fn apply_u64(var: &str, slot: &mut u64) {
    if let Ok(raw) = std::env::var(var) {
        match raw.parse() {
            Ok(v) => *slot = v,
            Err(_) => warn!(var, value = %raw, "ignoring malformed env override"),
        }
    }
}

fn apply_u32(var: &str, slot: &mut u32) {
    if let Ok(raw) = std::env::var(var) {
        match raw.parse() {
            Ok(v) => *slot = v,
            Err(_) => warn!(var, value = %raw, "ignoring malformed env override"),
        }
    }
}
