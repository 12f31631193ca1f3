//! Connectivity state published by the connection supervisor.

use serde::{Deserialize, Serialize};

/// Phase of the supervisor's state machine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionPhase {
    /// No transport session and no retry in progress.
    #[default]
    Disconnected,
    /// Connecting or reconnecting with backoff.
    Connecting,
    /// Live transport session.
    Connected,
}

/// Process-wide connectivity snapshot.
///
/// Published through a `watch` channel by the supervisor; read-only for
/// everyone else (the passive connectivity indicator).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivityState {
    /// Current phase.
    pub phase: ConnectionPhase,
    /// Description of the most recent transport failure, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Opaque session token for the live session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
}

impl ConnectivityState {
    /// Snapshot for a fresh supervisor about to make its first attempt.
    pub fn connecting() -> Self {
        Self {
            phase: ConnectionPhase::Connecting,
            ..Self::default()
        }
    }

    /// Whether the transport session is live.
    pub fn is_connected(&self) -> bool {
        self.phase == ConnectionPhase::Connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_disconnected() {
        let state = ConnectivityState::default();
        assert_eq!(state.phase, ConnectionPhase::Disconnected);
        assert!(!state.is_connected());
    }

    #[test]
    fn serde_omits_absent_fields() {
        let json = serde_json::to_value(ConnectivityState::connecting()).unwrap();
        assert_eq!(json["phase"], "connecting");
        assert!(json.get("lastError").is_none());
        assert!(json.get("sessionToken").is_none());
    }
}
