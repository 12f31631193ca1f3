//! The in-memory chat and message model.
//!
//! A [`Chat`] owns its messages as a `Vec` kept totally ordered by
//! `(created_at, local_id)`. `created_at` is provisional (client clock) for
//! optimistic entries and becomes authoritative once a server value is
//! merged. [`LocalId`] is the tie-break for same-timestamp entries; since it
//! is UUID v7 the tie-break follows creation order.
//!
//! Chats are owned exclusively by the store in `palaver-sync`; nothing here
//! is shared or locked.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ChatId, LocalId, ServerId};

/// Message author role.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Authored by the local or a remote user.
    User,
    /// Generated by the assistant.
    Assistant,
    /// Injected by the system.
    System,
}

/// Streaming lifecycle of a message.
///
/// At most one message per chat may be [`StreamState::Streaming`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    /// Not streaming (terminal for completed messages).
    #[default]
    None,
    /// Content is growing delta by delta.
    Streaming,
    /// Stream ended, terminal metadata not yet merged.
    Finalizing,
}

/// A single chat message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Client-generated identity, stable for the lifetime of the object.
    pub local_id: LocalId,
    /// Server identity, absent until the server accepts the message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_id: Option<ServerId>,
    /// Author role.
    pub role: Role,
    /// Message text. Grows during streaming.
    pub content: String,
    /// Creation timestamp. Client clock until a server value is merged.
    pub created_at: DateTime<Utc>,
    /// Set only by an explicit edit event.
    pub is_edited: bool,
    /// Streaming lifecycle.
    #[serde(default, skip_serializing_if = "is_stream_state_none")]
    pub stream_state: StreamState,
}

fn is_stream_state_none(s: &StreamState) -> bool {
    *s == StreamState::None
}

impl Message {
    /// The total-order key within a chat.
    pub fn ordering_key(&self) -> (DateTime<Utc>, LocalId) {
        (self.created_at, self.local_id)
    }

    /// Whether the server has confirmed this message.
    pub fn is_confirmed(&self) -> bool {
        self.server_id.is_some()
    }
}

/// Input for creating a message through the store.
#[derive(Clone, Debug, Default)]
pub struct MessageDraft {
    /// Explicit local identity; a fresh one is assigned when absent.
    pub local_id: Option<LocalId>,
    /// Server identity, when the draft is built from a confirmed event.
    pub server_id: Option<ServerId>,
    /// Author role.
    pub role: Option<Role>,
    /// Initial content.
    pub content: String,
    /// Explicit timestamp; the client clock is used when absent.
    pub created_at: Option<DateTime<Utc>>,
    /// Initial streaming state.
    pub stream_state: StreamState,
}

impl MessageDraft {
    /// Draft for an optimistic user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Some(Role::User),
            content: content.into(),
            ..Self::default()
        }
    }

    /// Draft for an assistant message opened by a stream start.
    pub fn streaming_assistant() -> Self {
        Self {
            role: Some(Role::Assistant),
            stream_state: StreamState::Streaming,
            ..Self::default()
        }
    }
}

/// Partial update applied to an existing message.
///
/// `None` fields are left untouched.
#[derive(Clone, Debug, Default)]
pub struct MessagePatch {
    /// Assign or confirm the server identity.
    pub server_id: Option<ServerId>,
    /// Replace the timestamp with the server's authoritative value.
    pub created_at: Option<DateTime<Utc>>,
    /// Mark as edited.
    pub is_edited: Option<bool>,
    /// Move to a new streaming state.
    pub stream_state: Option<StreamState>,
}

impl MessagePatch {
    /// Whether the patch changes nothing.
    pub fn is_empty(&self) -> bool {
        self.server_id.is_none()
            && self.created_at.is_none()
            && self.is_edited.is_none()
            && self.stream_state.is_none()
    }
}

/// A chat: identity, title, ordered messages, and the ephemeral typing flag.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    /// Server-assigned chat identity.
    pub id: ChatId,
    /// Display title.
    pub title: String,
    /// Messages ordered by `(created_at, local_id)`.
    pub messages: Vec<Message>,
    /// Someone is typing. Ephemeral, never persisted.
    #[serde(skip)]
    pub typing: bool,
    /// When the typing flag was last raised, for expiry.
    #[serde(skip)]
    pub typing_since: Option<DateTime<Utc>>,
}

impl Chat {
    /// Create an empty chat.
    pub fn new(id: ChatId, title: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            messages: Vec::new(),
            typing: false,
            typing_since: None,
        }
    }

    /// Insert preserving the ordering invariant. Returns the insert index.
    pub fn insert_ordered(&mut self, message: Message) -> usize {
        let key = message.ordering_key();
        let idx = self
            .messages
            .partition_point(|m| m.ordering_key() <= key);
        self.messages.insert(idx, message);
        idx
    }

    /// Index of the message with the given local identity.
    pub fn position_of(&self, local_id: LocalId) -> Option<usize> {
        self.messages.iter().position(|m| m.local_id == local_id)
    }

    /// The message with the given local identity.
    pub fn message(&self, local_id: LocalId) -> Option<&Message> {
        self.position_of(local_id).map(|i| &self.messages[i])
    }

    /// Mutable access by local identity.
    pub fn message_mut(&mut self, local_id: LocalId) -> Option<&mut Message> {
        let idx = self.position_of(local_id)?;
        Some(&mut self.messages[idx])
    }

    /// The message holding the given server identity, if any.
    ///
    /// The store guarantees at most one such message per chat.
    pub fn find_by_server_id(&self, server_id: &ServerId) -> Option<&Message> {
        self.messages
            .iter()
            .find(|m| m.server_id.as_ref() == Some(server_id))
    }

    /// The currently streaming message, if any.
    pub fn streaming_message(&self) -> Option<&Message> {
        self.messages
            .iter()
            .find(|m| m.stream_state == StreamState::Streaming)
    }

    /// Re-sort a message whose timestamp changed (remove + ordered reinsert).
    ///
    /// No-op if the local identity is unknown.
    pub fn reposition(&mut self, local_id: LocalId) {
        if let Some(idx) = self.position_of(local_id) {
            let message = self.messages.remove(idx);
            let _ = self.insert_ordered(message);
        }
    }
}
