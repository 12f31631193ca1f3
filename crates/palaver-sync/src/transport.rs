//! Seams for the excluded collaborators: the real-time transport and the
//! request service.
//!
//! The sync core consumes these through narrow traits; HTTP plumbing,
//! socket framing, and session bootstrap live behind them. Wire event names
//! map onto this surface as follows:
//!
//! - `connection-established` → a successful [`Transport::connect`] (the
//!   returned [`TransportSession`] carries the session token),
//! - `connection-failed` / `generic-error` → [`Transport::connect`] errors,
//! - `connection-lost` → [`TransportEvent::Lost`],
//! - `message-created`, `message-edited`, `chat-changed`, `chat-removed`,
//!   `typing-changed` → [`TransportEvent::Push`].
//!
//! Dropping a [`TransportSession`] detaches everything: the event receiver
//! closes and no listener survives, so a superseded session can never
//! double-deliver push events.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use palaver_core::errors::SyncError;
use palaver_core::events::{PushEvent, StreamEvent};
use palaver_core::ids::{ChatId, ServerId};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Opaque session credential from the (excluded) bootstrap collaborator.
///
/// Must be available before [`Transport::connect`] is called.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionCredential(pub String);

impl From<&str> for SessionCredential {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Inbound events from a live transport session.
#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    /// Server push notification.
    Push(PushEvent),
    /// The session dropped at the transport level.
    Lost {
        /// Transport-provided reason.
        reason: String,
    },
}

/// Outbound notifications the core emits through the transport.
#[derive(Clone, Debug, PartialEq)]
pub enum OutboundEvent {
    /// The local user started or stopped typing.
    Typing {
        /// Target chat.
        chat_id: ChatId,
        /// Raised or cleared.
        typing: bool,
    },
    /// Ask the server to stop an in-flight generation.
    StopStream {
        /// Target chat.
        chat_id: ChatId,
    },
}

/// A live transport session.
///
/// The connection supervisor is the exclusive owner; no other component may
/// hold a reference to the handle.
pub struct TransportSession {
    /// Emit/disconnect surface.
    pub handle: Box<dyn TransportHandle>,
    /// Inbound event stream. Closes when the session is torn down.
    pub events: mpsc::Receiver<TransportEvent>,
    /// Session token granted on establishment, when the transport has one.
    pub session_token: Option<String>,
}

/// Connects transport sessions.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish a session. Errors are terminal for this attempt:
    /// [`SyncError::AuthRejected`] for credential rejection (fatal to the
    /// session), [`SyncError::Transport`] for anything transient.
    async fn connect(&self, credential: &SessionCredential)
    -> Result<TransportSession, SyncError>;
}

/// The emit/teardown surface of one session.
#[async_trait]
pub trait TransportHandle: Send {
    /// Emit an outbound event. Failures are logged by callers, never fatal.
    async fn emit(&mut self, event: OutboundEvent) -> Result<(), SyncError>;

    /// Tear the session down (explicit, client-initiated disconnect).
    async fn disconnect(&mut self);
}

/// Acknowledgement of an accepted non-streaming request.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MessageAck {
    /// Server identity assigned to the accepted message, when returned
    /// synchronously (the push echo carries it otherwise).
    pub server_id: Option<ServerId>,
    /// Authoritative timestamp, when returned synchronously.
    pub created_at: Option<DateTime<Utc>>,
}

/// One incremental-generation operation in flight.
pub struct StreamingReply {
    /// Ordered stream events; ends with `Done` or `Error`.
    pub events: mpsc::Receiver<StreamEvent>,
    /// Cooperative cancellation: triggering it tells upstream to stop.
    pub cancel: CancellationToken,
}

/// Sends user requests. HTTP plumbing lives behind this seam.
#[async_trait]
pub trait RequestService: Send + Sync {
    /// Send a plain message; the server echoes it as a push event.
    async fn send_message(&self, chat_id: &ChatId, content: &str)
    -> Result<MessageAck, SyncError>;

    /// Request an incremental assistant generation.
    async fn stream_message(
        &self,
        chat_id: &ChatId,
        content: &str,
    ) -> Result<StreamingReply, SyncError>;

    /// Regenerate the latest assistant message, streaming the replacement.
    async fn regenerate(&self, chat_id: &ChatId) -> Result<StreamingReply, SyncError>;
}
