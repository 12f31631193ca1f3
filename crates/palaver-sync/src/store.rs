//! The chat state store, the single in-memory source of truth.
//!
//! Owns every [`Chat`] and its ordered message list. All other components
//! read and write through the operations here; nothing aliases a chat
//! directly. The store is a plain struct with no interior locking: it is
//! owned by the single client task ([`crate::client::SyncClient`]), so no
//! operation can interleave with another on the same chat.
//!
//! Unknown-identity updates are recoverable conditions (a late event after
//! the local chat was removed), never fatal: they log and return `false`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use palaver_core::ids::{ChatId, LocalId, ServerId};
use palaver_core::messages::{Chat, Message, MessageDraft, MessagePatch, Role};
use tracing::{debug, warn};

/// Single source of truth for all chats.
#[derive(Debug, Default)]
pub struct ChatStore {
    chats: HashMap<ChatId, Chat>,
}

impl ChatStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or update a chat's metadata. Messages are preserved on update.
    pub fn upsert_chat(&mut self, id: ChatId, title: impl Into<String>) {
        let title = title.into();
        match self.chats.get_mut(&id) {
            Some(chat) => chat.title = title,
            None => {
                let _ = self.chats.insert(id.clone(), Chat::new(id, title));
            }
        }
    }

    /// Evict a chat entirely. Returns whether it existed.
    pub fn remove_chat(&mut self, chat_id: &ChatId) -> bool {
        let removed = self.chats.remove(chat_id).is_some();
        if !removed {
            debug!(chat_id = %chat_id, "remove_chat: unknown chat");
        }
        removed
    }

    /// Whether the store holds the chat.
    pub fn contains_chat(&self, chat_id: &ChatId) -> bool {
        self.chats.contains_key(chat_id)
    }

    /// Read access to a chat.
    pub fn chat(&self, chat_id: &ChatId) -> Option<&Chat> {
        self.chats.get(chat_id)
    }

    /// The ordered message list for a chat.
    pub fn messages(&self, chat_id: &ChatId) -> Option<&[Message]> {
        self.chats.get(chat_id).map(|c| c.messages.as_slice())
    }

    /// All chat identities currently held.
    pub fn chat_ids(&self) -> impl Iterator<Item = &ChatId> {
        self.chats.keys()
    }

    /// Raise or clear the typing indicator. Logged no-op on unknown chat.
    pub fn set_typing(&mut self, chat_id: &ChatId, typing: bool) -> bool {
        let Some(chat) = self.chats.get_mut(chat_id) else {
            debug!(chat_id = %chat_id, "set_typing: unknown chat");
            return false;
        };
        chat.typing = typing;
        chat.typing_since = typing.then(Utc::now);
        true
    }

    /// Clear typing flags raised before `cutoff`. Returns the chats cleared.
    ///
    /// Guards against a server that never sends the clearing event.
    pub fn expire_typing(&mut self, cutoff: DateTime<Utc>) -> Vec<ChatId> {
        let mut cleared = Vec::new();
        for chat in self.chats.values_mut() {
            if chat.typing && chat.typing_since.is_some_and(|since| since < cutoff) {
                chat.typing = false;
                chat.typing_since = None;
                cleared.push(chat.id.clone());
            }
        }
        cleared
    }

    /// Insert a message, preserving the ordering invariant.
    ///
    /// Assigns a fresh [`LocalId`] when the draft carries none and returns
    /// the assigned identity. If the draft carries a `server_id` already
    /// present in the chat, no duplicate is inserted and the identity of the
    /// existing holder is returned (the one-message-per-server-id
    /// invariant). Returns `None` only for an unknown chat.
    pub fn add_message(&mut self, chat_id: &ChatId, draft: MessageDraft) -> Option<LocalId> {
        let Some(chat) = self.chats.get_mut(chat_id) else {
            warn!(chat_id = %chat_id, "add_message: unknown chat");
            return None;
        };
        if let Some(ref server_id) = draft.server_id {
            if let Some(existing) = chat.find_by_server_id(server_id) {
                debug!(
                    chat_id = %chat_id,
                    server_id = %server_id,
                    "add_message: server id already held, skipping duplicate"
                );
                return Some(existing.local_id);
            }
        }
        let message = Message {
            local_id: draft.local_id.unwrap_or_else(LocalId::generate),
            server_id: draft.server_id,
            role: draft.role.unwrap_or(Role::User),
            content: draft.content,
            created_at: draft.created_at.unwrap_or_else(Utc::now),
            is_edited: false,
            stream_state: draft.stream_state,
        };
        let local_id = message.local_id;
        let _ = chat.insert_ordered(message);
        Some(local_id)
    }

    /// Replace a message's content and apply a metadata patch.
    ///
    /// `new_content` is always the full accumulated text, never a raw delta.
    /// Unknown chat or local id is a logged no-op returning `false`. A patch
    /// whose `server_id` is already held by a *different* message in the
    /// chat is refused (dedup invariant). A patched `created_at` repositions
    /// the message in the ordering.
    pub fn update_message_content(
        &mut self,
        chat_id: &ChatId,
        local_id: LocalId,
        new_content: impl Into<String>,
        patch: MessagePatch,
    ) -> bool {
        let Some(chat) = self.chats.get_mut(chat_id) else {
            debug!(chat_id = %chat_id, local_id = %local_id, "update: unknown chat");
            return false;
        };
        if let Some(ref server_id) = patch.server_id {
            if chat
                .find_by_server_id(server_id)
                .is_some_and(|m| m.local_id != local_id)
            {
                warn!(
                    chat_id = %chat_id,
                    server_id = %server_id,
                    "update: server id already held by another message, refusing patch"
                );
                return false;
            }
        }
        let Some(message) = chat.message_mut(local_id) else {
            debug!(chat_id = %chat_id, local_id = %local_id, "update: unknown message");
            return false;
        };
        message.content = new_content.into();
        if let Some(server_id) = patch.server_id {
            message.server_id = Some(server_id);
        }
        if let Some(is_edited) = patch.is_edited {
            message.is_edited = is_edited;
        }
        if let Some(stream_state) = patch.stream_state {
            message.stream_state = stream_state;
        }
        if let Some(created_at) = patch.created_at {
            message.created_at = created_at;
            chat.reposition(local_id);
        }
        true
    }

    /// Locate a message by server identity.
    pub fn find_by_server_id(
        &self,
        chat_id: &ChatId,
        server_id: &ServerId,
    ) -> Option<&Message> {
        self.chats.get(chat_id)?.find_by_server_id(server_id)
    }

    /// Locate a message by local identity.
    pub fn find_by_local_id(&self, chat_id: &ChatId, local_id: LocalId) -> Option<&Message> {
        self.chats.get(chat_id)?.message(local_id)
    }

    /// The most recent message matching a predicate, scanning newest-first.
    pub fn rfind_message(
        &self,
        chat_id: &ChatId,
        predicate: impl Fn(&Message) -> bool,
    ) -> Option<&Message> {
        self.chats
            .get(chat_id)?
            .messages
            .iter()
            .rev()
            .find(|m| predicate(m))
    }
}
