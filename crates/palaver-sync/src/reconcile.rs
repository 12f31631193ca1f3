//! Push event reconciliation.
//!
//! Merges out-of-band server notifications into chat state without
//! clobbering an in-flight stream or a not-yet-acknowledged optimistic
//! message. The correlation order for message events is the core
//! deduplication algorithm:
//!
//! 1. exact `server_id` match → merge (update/edit),
//! 2. optimistic-echo match (most recent unconfirmed, non-streaming message
//!    of the same role) → attach the server identity,
//! 3. fallback → append a brand-new message.
//!
//! Applying the same event twice lands on step 1 the second time, so
//! delivery is idempotent. A local send appends its optimistic message
//! synchronously, before the request is even issued, so the echo always
//! arrives after the append and step 2 is the convergence point.

use metrics::counter;
use palaver_core::events::{PushEvent, PushMessage};
use palaver_core::ids::{ChatId, LocalId};
use palaver_core::messages::{MessageDraft, MessagePatch, StreamState};
use tracing::{debug, info, warn};

use crate::store::ChatStore;

/// What applying a push event did to the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reconciled {
    /// Merged into the existing holder of the event's server id.
    UpdatedExisting(LocalId),
    /// Attached the server identity to an optimistic message.
    CorrelatedOptimistic(LocalId),
    /// Appended a brand-new message built from the event.
    Appended(LocalId),
    /// Typing flag applied.
    TypingApplied,
    /// Chat metadata upserted.
    ChatUpserted,
    /// Chat evicted from local state.
    ChatEvicted,
    /// Event did not apply (unknown chat, streaming conflict, stale).
    Ignored,
}

/// Apply one push event to the store.
pub fn apply(store: &mut ChatStore, event: &PushEvent) -> Reconciled {
    match event {
        PushEvent::MessageCreated { chat_id, message } => {
            apply_message(store, chat_id, message, false)
        }
        PushEvent::MessageEdited { chat_id, message } => {
            apply_message(store, chat_id, message, true)
        }
        PushEvent::ChatChanged { chat } => {
            // Also the "new chat" notification: unknown chats are created.
            store.upsert_chat(chat.id.clone(), chat.title.clone());
            counter!("reconcile_chat_upserts_total").increment(1);
            Reconciled::ChatUpserted
        }
        PushEvent::ChatRemoved { chat_id } => {
            if store.remove_chat(chat_id) {
                counter!("reconcile_chat_evictions_total").increment(1);
                Reconciled::ChatEvicted
            } else {
                Reconciled::Ignored
            }
        }
        PushEvent::TypingChanged { chat_id, typing } => {
            if store.set_typing(chat_id, *typing) {
                Reconciled::TypingApplied
            } else {
                Reconciled::Ignored
            }
        }
        PushEvent::Error { message } => {
            warn!(message, "server error push event");
            Reconciled::Ignored
        }
    }
}

/// Correlation for message.created / message.edited.
fn apply_message(
    store: &mut ChatStore,
    chat_id: &ChatId,
    message: &PushMessage,
    edit: bool,
) -> Reconciled {
    if !store.contains_chat(chat_id) {
        // Not a new-chat notification; a late event for a chat we dropped.
        debug!(chat_id = %chat_id, server_id = %message.id, "push for unknown chat, ignoring");
        counter!("reconcile_ignored_total").increment(1);
        return Reconciled::Ignored;
    }

    // Step 1: exact server id match.
    if let Some(existing) = store.find_by_server_id(chat_id, &message.id) {
        if existing.stream_state == StreamState::Streaming {
            // Stream completion is the authoritative terminal update; the
            // push must not replace an in-flight message.
            debug!(
                chat_id = %chat_id,
                server_id = %message.id,
                "push for streaming message deferred to stream completion"
            );
            return Reconciled::Ignored;
        }
        let local_id = existing.local_id;
        let _ = store.update_message_content(
            chat_id,
            local_id,
            message.content.clone(),
            MessagePatch {
                created_at: Some(message.created_at),
                is_edited: message.is_edited.or(edit.then_some(true)),
                ..MessagePatch::default()
            },
        );
        counter!("reconcile_updates_total").increment(1);
        return Reconciled::UpdatedExisting(local_id);
    }

    // Step 2: optimistic-echo match. Heuristic: most recent unconfirmed,
    // non-streaming message of the same role.
    let candidate = store
        .rfind_message(chat_id, |m| {
            m.server_id.is_none() && m.stream_state != StreamState::Streaming && m.role == message.role
        })
        .map(|m| m.local_id);
    if let Some(local_id) = candidate {
        let _ = store.update_message_content(
            chat_id,
            local_id,
            message.content.clone(),
            MessagePatch {
                server_id: Some(message.id.clone()),
                created_at: Some(message.created_at),
                is_edited: message.is_edited.or(edit.then_some(true)),
                ..MessagePatch::default()
            },
        );
        info!(chat_id = %chat_id, server_id = %message.id, local_id = %local_id, "correlated optimistic message");
        counter!("reconcile_correlations_total").increment(1);
        return Reconciled::CorrelatedOptimistic(local_id);
    }

    // Step 3: fallback append.
    let draft = MessageDraft {
        server_id: Some(message.id.clone()),
        role: Some(message.role),
        content: message.content.clone(),
        created_at: Some(message.created_at),
        ..MessageDraft::default()
    };
    match store.add_message(chat_id, draft) {
        Some(local_id) => {
            if message.is_edited.unwrap_or(false) || edit {
                let _ = store.update_message_content(
                    chat_id,
                    local_id,
                    message.content.clone(),
                    MessagePatch {
                        is_edited: Some(true),
                        ..MessagePatch::default()
                    },
                );
            }
            counter!("reconcile_appends_total").increment(1);
            Reconciled::Appended(local_id)
        }
        None => Reconciled::Ignored,
    }
}
