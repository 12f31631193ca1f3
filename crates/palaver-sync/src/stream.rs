//! Streaming session manager: one in-flight generation per chat.
//!
//! Each chat holds at most one [`ActiveStream`]. Starting a second stream
//! while one is active cancels the first (most-recent-intent wins): the
//! displaced message keeps whatever content it accumulated and leaves
//! `Streaming` state; the new message becomes the sole streaming entry.
//!
//! Deltas are applied in arrival order and always written to the store as
//! the full accumulated content, so the store's content field stays
//! consistent even if a downstream observer misses an update. The manager
//! never reorders or buffers deltas; in-order delivery is an assumption on
//! the transport, not something enforced here.
//!
//! Cancellation is cooperative and idempotent: the token signals upstream
//! to stop sending, the local message is finalized with the accumulated
//! content, and a second cancel (or one after natural completion) is a
//! no-op. Late deltas after cancellation are logged and ignored.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use palaver_core::ids::{ChatId, LocalId, ServerId};
use palaver_core::messages::{MessageDraft, MessagePatch, StreamState};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::store::ChatStore;

/// Handle to a started stream.
#[derive(Clone, Debug)]
pub struct StreamHandle {
    /// Local identity of the assistant message being streamed into.
    pub local_id: LocalId,
    /// Cooperative cancellation token for the transport side.
    pub cancel: CancellationToken,
}

/// Terminal metadata delivered on stream completion.
#[derive(Clone, Debug, Default)]
pub struct StreamDone {
    /// Server identity of the finished message, when the transport knows it.
    pub server_id: Option<ServerId>,
    /// Authoritative timestamp, when the transport knows it.
    pub created_at: Option<DateTime<Utc>>,
}

struct ActiveStream {
    local_id: LocalId,
    buffer: String,
    cancel: CancellationToken,
}

/// Owns the in-flight streaming sessions, keyed by chat.
#[derive(Default)]
pub struct StreamManager {
    active: HashMap<ChatId, ActiveStream>,
}

impl StreamManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a chat has an in-flight stream.
    pub fn is_streaming(&self, chat_id: &ChatId) -> bool {
        self.active.contains_key(chat_id)
    }

    /// The streaming message's local identity for a chat, if any.
    pub fn streaming_local_id(&self, chat_id: &ChatId) -> Option<LocalId> {
        self.active.get(chat_id).map(|s| s.local_id)
    }

    /// Start a stream on a chat, displacing any active one.
    ///
    /// Appends a fresh assistant message with `Streaming` state and returns
    /// the handle. Returns `None` for an unknown chat.
    pub fn start(&mut self, store: &mut ChatStore, chat_id: &ChatId) -> Option<StreamHandle> {
        if self.is_streaming(chat_id) {
            debug!(chat_id = %chat_id, "displacing active stream (most recent intent wins)");
            let _ = self.cancel(store, chat_id);
        }
        let local_id = store.add_message(chat_id, MessageDraft::streaming_assistant())?;
        let cancel = CancellationToken::new();
        let _ = self.active.insert(
            chat_id.clone(),
            ActiveStream {
                local_id,
                buffer: String::new(),
                cancel: cancel.clone(),
            },
        );
        Some(StreamHandle { local_id, cancel })
    }

    /// Apply one content delta, in arrival order.
    ///
    /// Writes the full accumulated content through the store. A delta for a
    /// chat with no active stream (late after cancel or completion) is a
    /// logged ignore, never an error.
    pub fn apply_delta(&mut self, store: &mut ChatStore, chat_id: &ChatId, delta: &str) {
        let Some(stream) = self.active.get_mut(chat_id) else {
            debug!(chat_id = %chat_id, "delta for inactive stream, ignoring");
            return;
        };
        stream.buffer.push_str(delta);
        let applied = store.update_message_content(
            chat_id,
            stream.local_id,
            stream.buffer.clone(),
            MessagePatch::default(),
        );
        if !applied {
            // The chat was removed under the stream; drop the session.
            warn!(chat_id = %chat_id, "stream target vanished, dropping session");
            let stream = self.active.remove(chat_id);
            if let Some(s) = stream {
                s.cancel.cancel();
            }
        }
    }

    /// Finalize a stream successfully.
    ///
    /// The completion is the authoritative terminal update for the message:
    /// terminal metadata is merged and `stream_state` cleared. Idempotent;
    /// completing an inactive chat is a no-op.
    pub fn complete(&mut self, store: &mut ChatStore, chat_id: &ChatId, done: StreamDone) {
        let Some(stream) = self.active.remove(chat_id) else {
            debug!(chat_id = %chat_id, "complete for inactive stream, ignoring");
            return;
        };
        let _ = store.update_message_content(
            chat_id,
            stream.local_id,
            stream.buffer,
            MessagePatch {
                server_id: done.server_id,
                created_at: done.created_at,
                is_edited: None,
                stream_state: Some(StreamState::None),
            },
        );
    }

    /// Finalize a stream after a transport error.
    ///
    /// Partial output is preserved, never thrown away; only `stream_state`
    /// is cleared. Fatal to this one operation, nothing else.
    pub fn fail(&mut self, store: &mut ChatStore, chat_id: &ChatId, error: &str) {
        let Some(stream) = self.active.remove(chat_id) else {
            debug!(chat_id = %chat_id, "error for inactive stream, ignoring");
            return;
        };
        warn!(chat_id = %chat_id, error, "stream failed, keeping partial content");
        stream.cancel.cancel();
        let _ = store.update_message_content(
            chat_id,
            stream.local_id,
            stream.buffer,
            MessagePatch {
                stream_state: Some(StreamState::None),
                ..MessagePatch::default()
            },
        );
    }

    /// Cancel a stream cooperatively. Not an error.
    ///
    /// Signals the token so upstream stops sending and finalizes the local
    /// message with the content accumulated so far. Returns whether a
    /// stream was actually cancelled; a second call is a no-op.
    pub fn cancel(&mut self, store: &mut ChatStore, chat_id: &ChatId) -> bool {
        let Some(stream) = self.active.remove(chat_id) else {
            debug!(chat_id = %chat_id, "cancel with no active stream, no-op");
            return false;
        };
        stream.cancel.cancel();
        let _ = store.update_message_content(
            chat_id,
            stream.local_id,
            stream.buffer,
            MessagePatch {
                stream_state: Some(StreamState::None),
                ..MessagePatch::default()
            },
        );
        true
    }

    /// Cancel every active stream (teardown path).
    pub fn cancel_all(&mut self, store: &mut ChatStore) {
        let chats: Vec<ChatId> = self.active.keys().cloned().collect();
        for chat_id in chats {
            let _ = self.cancel(store, &chat_id);
        }
    }
}
