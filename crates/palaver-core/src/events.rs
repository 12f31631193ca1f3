//! Wire event types.
//!
//! Two event families:
//!
//! - **[`PushEvent`]**: server-initiated, out-of-band notifications of state
//!   change (message created/edited, chat changed/removed, typing, errors).
//!   Delivered through the real-time transport and reconciled into chat
//!   state by `palaver-sync`.
//! - **[`StreamEvent`]**: incremental-generation events for one streaming
//!   session (text deltas, terminal done/error). Purely in-memory on the
//!   receiving side; never persisted.
//!
//! Both are internally tagged (`"type"`) with camelCase fields, matching the
//! transport's JSON wire format.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ChatId, ServerId};
use crate::messages::Role;

/// A server-confirmed message as carried by push events.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushMessage {
    /// Server identity.
    pub id: ServerId,
    /// Author role.
    pub role: Role,
    /// Full message content (not a delta).
    pub content: String,
    /// Authoritative server timestamp.
    pub created_at: DateTime<Utc>,
    /// Present and true when the message was edited after creation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_edited: Option<bool>,
}

/// Chat metadata as carried by `chat.changed` events.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSummary {
    /// Chat identity.
    pub id: ChatId,
    /// Current title.
    pub title: String,
}

/// A server-initiated push notification.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PushEvent {
    /// A message was accepted by the server (possibly an echo of our own).
    #[serde(rename = "message.created")]
    MessageCreated {
        /// Target chat.
        #[serde(rename = "chatId")]
        chat_id: ChatId,
        /// The confirmed message.
        message: PushMessage,
    },

    /// A previously delivered message was edited.
    #[serde(rename = "message.edited")]
    MessageEdited {
        /// Target chat.
        #[serde(rename = "chatId")]
        chat_id: ChatId,
        /// The corrected message.
        message: PushMessage,
    },

    /// Chat metadata changed, or a chat we have not seen yet was created.
    #[serde(rename = "chat.changed")]
    ChatChanged {
        /// New metadata.
        chat: ChatSummary,
    },

    /// A chat was deleted server-side.
    #[serde(rename = "chat.removed")]
    ChatRemoved {
        /// Evicted chat.
        #[serde(rename = "chatId")]
        chat_id: ChatId,
    },

    /// Someone started or stopped typing.
    #[serde(rename = "typing.changed")]
    TypingChanged {
        /// Target chat.
        #[serde(rename = "chatId")]
        chat_id: ChatId,
        /// Raised or cleared.
        typing: bool,
    },

    /// Generic server-side error notification.
    #[serde(rename = "error")]
    Error {
        /// Error description.
        message: String,
    },
}

impl PushEvent {
    /// The chat this event targets, when it targets one.
    pub fn chat_id(&self) -> Option<&ChatId> {
        match self {
            Self::MessageCreated { chat_id, .. }
            | Self::MessageEdited { chat_id, .. }
            | Self::ChatRemoved { chat_id }
            | Self::TypingChanged { chat_id, .. } => Some(chat_id),
            Self::ChatChanged { chat } => Some(&chat.id),
            Self::Error { .. } => None,
        }
    }
}

/// Events for one incremental-generation session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    /// Incremental text content.
    #[serde(rename = "delta")]
    Delta {
        /// Text fragment.
        delta: String,
    },

    /// Stream completed successfully.
    #[serde(rename = "done")]
    Done {
        /// Server identity of the finished message, when known.
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<ServerId>,
        /// Authoritative server timestamp, when known.
        #[serde(rename = "createdAt", skip_serializing_if = "Option::is_none")]
        created_at: Option<DateTime<Utc>>,
    },

    /// Stream failed. Terminal for this one operation only.
    #[serde(rename = "error")]
    Error {
        /// Error description.
        message: String,
    },
}
