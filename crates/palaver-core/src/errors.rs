//! Error hierarchy for the sync core.
//!
//! Errors here are the conditions that cross component boundaries. Purely
//! local recoverable conditions (unknown local id on update, unmatched push
//! event, late delta after cancellation) are *not* errors: they are logged
//! no-ops or outcome-enum variants at the site that observes them.

use thiserror::Error;

use crate::ids::ChatId;

/// Convenience alias.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Failures that cross a sync-core boundary.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Transport-level failure (connect, emit, or mid-session loss).
    /// Transient: drives the connection supervisor's backoff.
    #[error("transport: {0}")]
    Transport(String),

    /// The bounded reconnection policy was exhausted.
    #[error("gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted {
        /// Attempts made before giving up.
        attempts: u32,
    },

    /// A streaming operation failed mid-flight. Fatal to that one
    /// operation only; partial content is preserved by the caller.
    #[error("stream failed for chat {chat_id}: {message}")]
    Stream {
        /// Chat whose stream failed.
        chat_id: ChatId,
        /// Transport-provided description.
        message: String,
    },

    /// A request (send, regenerate) was rejected by the server.
    #[error("request rejected: {0}")]
    RequestRejected(String),

    /// The session credential was rejected. Fatal to the session: the
    /// caller must force a logout; the core only emits the signal.
    #[error("authentication rejected")]
    AuthRejected,

    /// The client loop is gone (command sent after shutdown).
    #[error("sync client is shut down")]
    ClientClosed,
}

impl SyncError {
    /// Whether the error should drive the reconnection state machine.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}
