//! The sync client: the single logical event loop.
//!
//! [`SyncClient::run`] owns the chat store, the stream manager, and the
//! reconciler, and multiplexes four inputs in one `select!` loop: commands
//! from the [`ClientHandle`], push events forwarded by the connection
//! supervisor, per-chat stream events (a `StreamMap` of receivers), and the
//! typing-expiry tick. Store mutations therefore never interleave; mutual
//! exclusion is structural, with no locking.
//!
//! Network requests never suspend the loop: sends and stream starts are
//! spawned, and their results come back through an internal channel as just
//! another loop input. Network failures are converted to local state
//! transitions and one-shot [`ClientEvent`]s at this boundary; they never
//! propagate as faults into the store.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use palaver_core::connectivity::ConnectivityState;
use palaver_core::errors::SyncError;
use palaver_core::events::{PushEvent, StreamEvent};
use palaver_core::ids::{ChatId, LocalId};
use palaver_core::messages::{Message, MessageDraft, MessagePatch};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_stream::adapters::Chain;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Once, StreamExt, StreamMap, once};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::SyncConfig;
use crate::connection::{ConnectionSupervisor, ConnectivityEvent};
use crate::reconcile::{self, Reconciled};
use crate::store::ChatStore;
use crate::stream::{StreamDone, StreamManager};
use crate::transport::{
    MessageAck, OutboundEvent, RequestService, SessionCredential, StreamingReply, Transport,
};

/// One-shot, user-facing signals from the sync core.
#[derive(Clone, Debug)]
pub enum ClientEvent {
    /// Connectivity notification from the supervisor.
    Connectivity(ConnectivityEvent),
    /// A streaming operation failed; partial content was preserved.
    StreamFailed {
        /// Chat whose stream failed.
        chat_id: ChatId,
        /// Transport-provided description.
        message: String,
    },
    /// A send request was rejected; the optimistic message remains pending.
    SendFailed {
        /// Chat whose send failed.
        chat_id: ChatId,
        /// Rejection description.
        message: String,
    },
    /// Generic server-side error push.
    ServerError {
        /// Error description.
        message: String,
    },
}

/// Commands accepted by the client loop.
enum Command {
    SendMessage {
        chat_id: ChatId,
        content: String,
    },
    StreamMessage {
        chat_id: ChatId,
        content: String,
    },
    Regenerate {
        chat_id: ChatId,
    },
    CancelStream {
        chat_id: ChatId,
    },
    UpsertChat {
        chat_id: ChatId,
        title: String,
    },
    RemoveChat {
        chat_id: ChatId,
    },
    SetTyping {
        chat_id: ChatId,
        typing: bool,
    },
    Snapshot {
        chat_id: ChatId,
        reply: oneshot::Sender<Option<Vec<Message>>>,
    },
    Shutdown,
}

/// Results of spawned network requests, fed back into the loop.
enum Internal {
    SendAck {
        chat_id: ChatId,
        local_id: LocalId,
        result: Result<MessageAck, SyncError>,
    },
    StreamReady {
        chat_id: ChatId,
        local_id: LocalId,
        result: Result<StreamingReply, SyncError>,
    },
}

/// Event source for one registered stream session. The trailing `error`
/// fires only if the channel closes before a terminal event, so a dead
/// request-service task cannot leave a message stuck in `Streaming`.
type SessionEvents = Chain<ReceiverStream<StreamEvent>, Once<StreamEvent>>;

/// Cloneable handle to a running [`SyncClient`].
#[derive(Clone)]
pub struct ClientHandle {
    commands: mpsc::Sender<Command>,
    connectivity: watch::Receiver<ConnectivityState>,
    events: broadcast::Sender<ClientEvent>,
}

impl ClientHandle {
    /// Send a message optimistically.
    pub async fn send_message(&self, chat_id: ChatId, content: impl Into<String>) -> Result<(), SyncError> {
        self.command(Command::SendMessage {
            chat_id,
            content: content.into(),
        })
        .await
    }

    /// Start (or replace) an incremental generation on a chat.
    pub async fn stream_message(&self, chat_id: ChatId, content: impl Into<String>) -> Result<(), SyncError> {
        self.command(Command::StreamMessage {
            chat_id,
            content: content.into(),
        })
        .await
    }

    /// Regenerate the latest assistant reply.
    pub async fn regenerate(&self, chat_id: ChatId) -> Result<(), SyncError> {
        self.command(Command::Regenerate { chat_id }).await
    }

    /// Cancel the chat's in-flight stream, if any. Idempotent.
    pub async fn cancel_stream(&self, chat_id: ChatId) -> Result<(), SyncError> {
        self.command(Command::CancelStream { chat_id }).await
    }

    /// Create or retitle a chat locally.
    pub async fn upsert_chat(&self, chat_id: ChatId, title: impl Into<String>) -> Result<(), SyncError> {
        self.command(Command::UpsertChat {
            chat_id,
            title: title.into(),
        })
        .await
    }

    /// Evict a chat from local state.
    pub async fn remove_chat(&self, chat_id: ChatId) -> Result<(), SyncError> {
        self.command(Command::RemoveChat { chat_id }).await
    }

    /// Notify the server that the local user is typing.
    pub async fn set_typing(&self, chat_id: ChatId, typing: bool) -> Result<(), SyncError> {
        self.command(Command::SetTyping { chat_id, typing }).await
    }

    /// The current ordered message list for a chat.
    pub async fn snapshot(&self, chat_id: ChatId) -> Result<Option<Vec<Message>>, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Snapshot { chat_id, reply }).await?;
        rx.await.map_err(|_| SyncError::ClientClosed)
    }

    /// Stop the client loop.
    pub async fn shutdown(&self) -> Result<(), SyncError> {
        self.command(Command::Shutdown).await
    }

    /// The passive connectivity indicator.
    pub fn connectivity(&self) -> watch::Receiver<ConnectivityState> {
        self.connectivity.clone()
    }

    /// Subscribe to one-shot client events.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    async fn command(&self, command: Command) -> Result<(), SyncError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SyncError::ClientClosed)
    }
}

/// Channels wiring a [`SyncClient`] to a connection supervisor.
pub struct SyncChannels {
    /// Give this to [`ConnectionSupervisor::run`] as its push sink.
    pub push_tx: mpsc::Sender<PushEvent>,
    /// Give this to [`ConnectionSupervisor::run`] as its outbound source.
    pub outbound_rx: mpsc::Receiver<OutboundEvent>,
}

/// The synchronization core's event loop.
pub struct SyncClient {
    store: ChatStore,
    streams: StreamManager,
    requests: Arc<dyn RequestService>,
    config: SyncConfig,
    commands_rx: mpsc::Receiver<Command>,
    push_rx: mpsc::Receiver<PushEvent>,
    internal_tx: mpsc::Sender<Internal>,
    internal_rx: mpsc::Receiver<Internal>,
    stream_events: StreamMap<ChatId, SessionEvents>,
    transport_cancels: HashMap<ChatId, CancellationToken>,
    outbound_tx: mpsc::Sender<OutboundEvent>,
    events_tx: broadcast::Sender<ClientEvent>,
    connectivity_events: broadcast::Receiver<ConnectivityEvent>,
}

impl SyncClient {
    /// Build a client plus its handle and supervisor wiring.
    ///
    /// The caller connects `channels` to a [`ConnectionSupervisor`] (or a
    /// test double) and then drives [`SyncClient::run`].
    pub fn new(
        requests: Arc<dyn RequestService>,
        config: SyncConfig,
        connectivity_state: watch::Receiver<ConnectivityState>,
        connectivity_events: broadcast::Receiver<ConnectivityEvent>,
    ) -> (Self, ClientHandle, SyncChannels) {
        let (commands_tx, commands_rx) = mpsc::channel(config.command_capacity);
        let (push_tx, push_rx) = mpsc::channel(config.push_capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel(config.push_capacity);
        let (internal_tx, internal_rx) = mpsc::channel(config.command_capacity);
        let (events_tx, _) = broadcast::channel(config.event_capacity);
        let handle = ClientHandle {
            commands: commands_tx,
            connectivity: connectivity_state,
            events: events_tx.clone(),
        };
        let channels = SyncChannels {
            push_tx,
            outbound_rx,
        };
        let client = Self {
            store: ChatStore::new(),
            streams: StreamManager::new(),
            requests,
            config,
            commands_rx,
            push_rx,
            internal_tx,
            internal_rx,
            stream_events: StreamMap::new(),
            transport_cancels: HashMap::new(),
            outbound_tx,
            events_tx,
            connectivity_events,
        };
        (client, handle, channels)
    }

    /// Run the event loop until shutdown.
    #[instrument(skip_all)]
    pub async fn run(mut self) {
        let tick_period = self.config.typing_expiry() / 2;
        let mut typing_tick = tokio::time::interval(tick_period.max(std::time::Duration::from_millis(250)));
        let mut connectivity_open = true;
        loop {
            tokio::select! {
                command = self.commands_rx.recv() => match command {
                    None | Some(Command::Shutdown) => break,
                    Some(command) => self.handle_command(command),
                },
                Some(push) = self.push_rx.recv() => self.handle_push(&push),
                Some(internal) = self.internal_rx.recv() => self.handle_internal(internal),
                Some((chat_id, event)) = self.stream_events.next(), if !self.stream_events.is_empty() => {
                    self.handle_stream_event(&chat_id, event);
                }
                connectivity = self.connectivity_events.recv(), if connectivity_open => {
                    match connectivity {
                        Ok(event) => {
                            let _ = self.events_tx.send(ClientEvent::Connectivity(event));
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "missed connectivity notifications");
                        }
                        Err(broadcast::error::RecvError::Closed) => connectivity_open = false,
                    }
                }
                _ = typing_tick.tick() => {
                    let cutoff = Utc::now()
                        - chrono::Duration::from_std(self.config.typing_expiry())
                            .unwrap_or_else(|_| chrono::Duration::seconds(6));
                    let cleared = self.store.expire_typing(cutoff);
                    if !cleared.is_empty() {
                        debug!(chats = cleared.len(), "expired stale typing indicators");
                    }
                }
            }
        }
        // Teardown: finalize in-flight streams, stop upstream generation.
        for cancel in self.transport_cancels.values() {
            cancel.cancel();
        }
        self.streams.cancel_all(&mut self.store);
        info!("sync client stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::SendMessage { chat_id, content } => self.send_message(chat_id, content),
            Command::StreamMessage { chat_id, content } => {
                self.start_stream(chat_id, Some(content));
            }
            Command::Regenerate { chat_id } => self.start_stream(chat_id, None),
            Command::CancelStream { chat_id } => self.cancel_stream(&chat_id),
            Command::UpsertChat { chat_id, title } => self.store.upsert_chat(chat_id, title),
            Command::RemoveChat { chat_id } => {
                self.cancel_stream(&chat_id);
                let _ = self.store.remove_chat(&chat_id);
            }
            Command::SetTyping { chat_id, typing } => {
                if self
                    .outbound_tx
                    .try_send(OutboundEvent::Typing { chat_id, typing })
                    .is_err()
                {
                    debug!("typing notification dropped (transport busy or down)");
                }
            }
            Command::Snapshot { chat_id, reply } => {
                let snapshot = self.store.messages(&chat_id).map(<[Message]>::to_vec);
                let _ = reply.send(snapshot);
            }
            Command::Shutdown => unreachable!("handled in the loop"),
        }
    }

    /// Optimistic send: append locally, then confirm in the background.
    ///
    /// Every send is its own message, identical content included; the
    /// server's echo correlates back through the reconciler.
    fn send_message(&mut self, chat_id: ChatId, content: String) {
        let Some(local_id) = self
            .store
            .add_message(&chat_id, MessageDraft::user(content.clone()))
        else {
            warn!(chat_id = %chat_id, "send for unknown chat, dropping");
            return;
        };
        let requests = Arc::clone(&self.requests);
        let internal = self.internal_tx.clone();
        drop(tokio::spawn(async move {
            let result = requests.send_message(&chat_id, &content).await;
            let _ = internal
                .send(Internal::SendAck {
                    chat_id,
                    local_id,
                    result,
                })
                .await;
        }));
    }

    /// Open a streaming generation; `content` is `None` for regenerate.
    fn start_stream(&mut self, chat_id: ChatId, content: Option<String>) {
        // Displace any in-flight stream, transport side included. The old
        // event source goes too: late events from the displaced session
        // must never reach the replacement.
        if let Some(cancel) = self.transport_cancels.remove(&chat_id) {
            cancel.cancel();
        }
        let _ = self.stream_events.remove(&chat_id);
        let Some(handle) = self.streams.start(&mut self.store, &chat_id) else {
            warn!(chat_id = %chat_id, "stream for unknown chat, dropping");
            return;
        };
        let requests = Arc::clone(&self.requests);
        let internal = self.internal_tx.clone();
        let local_id = handle.local_id;
        drop(tokio::spawn(async move {
            let result = match content {
                Some(content) => requests.stream_message(&chat_id, &content).await,
                None => requests.regenerate(&chat_id).await,
            };
            let _ = internal
                .send(Internal::StreamReady {
                    chat_id,
                    local_id,
                    result,
                })
                .await;
        }));
    }

    fn cancel_stream(&mut self, chat_id: &ChatId) {
        if let Some(cancel) = self.transport_cancels.remove(chat_id) {
            cancel.cancel();
        }
        let _ = self.stream_events.remove(chat_id);
        if self.streams.cancel(&mut self.store, chat_id) {
            if self
                .outbound_tx
                .try_send(OutboundEvent::StopStream {
                    chat_id: chat_id.clone(),
                })
                .is_err()
            {
                debug!(chat_id = %chat_id, "stop-stream notification dropped");
            }
        }
    }

    fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::SendAck {
                chat_id,
                local_id,
                result,
            } => match result {
                Ok(ack) => {
                    let current = self
                        .store
                        .find_by_local_id(&chat_id, local_id)
                        .map(|m| m.content.clone());
                    if let Some(content) = current {
                        let _ = self.store.update_message_content(
                            &chat_id,
                            local_id,
                            content,
                            MessagePatch {
                                server_id: ack.server_id,
                                created_at: ack.created_at,
                                ..MessagePatch::default()
                            },
                        );
                    }
                }
                Err(error) => {
                    warn!(chat_id = %chat_id, error = %error, "send rejected");
                    let _ = self.events_tx.send(ClientEvent::SendFailed {
                        chat_id,
                        message: error.to_string(),
                    });
                }
            },
            Internal::StreamReady {
                chat_id,
                local_id,
                result,
            } => {
                // The stream may have been cancelled or displaced while the
                // request was in flight.
                if self.streams.streaming_local_id(&chat_id) != Some(local_id) {
                    debug!(chat_id = %chat_id, "stream reply for displaced session");
                    if let Ok(reply) = result {
                        reply.cancel.cancel();
                    }
                    return;
                }
                match result {
                    Ok(reply) => {
                        let _ = self.transport_cancels.insert(chat_id.clone(), reply.cancel);
                        let tail = once(StreamEvent::Error {
                            message: "stream channel closed before completion".to_string(),
                        });
                        let _ = self
                            .stream_events
                            .insert(chat_id, ReceiverStream::new(reply.events).chain(tail));
                    }
                    Err(error) => {
                        self.streams.fail(&mut self.store, &chat_id, &error.to_string());
                        let _ = self.events_tx.send(ClientEvent::StreamFailed {
                            chat_id,
                            message: error.to_string(),
                        });
                    }
                }
            }
        }
    }

    fn handle_stream_event(&mut self, chat_id: &ChatId, event: StreamEvent) {
        match event {
            StreamEvent::Delta { delta } => {
                self.streams.apply_delta(&mut self.store, chat_id, &delta);
            }
            StreamEvent::Done { id, created_at } => {
                self.streams.complete(
                    &mut self.store,
                    chat_id,
                    StreamDone {
                        server_id: id,
                        created_at,
                    },
                );
                let _ = self.stream_events.remove(chat_id);
                let _ = self.transport_cancels.remove(chat_id);
            }
            StreamEvent::Error { message } => {
                self.streams.fail(&mut self.store, chat_id, &message);
                let _ = self.stream_events.remove(chat_id);
                let _ = self.transport_cancels.remove(chat_id);
                let _ = self.events_tx.send(ClientEvent::StreamFailed {
                    chat_id: chat_id.clone(),
                    message,
                });
            }
        }
    }

    fn handle_push(&mut self, push: &PushEvent) {
        if let PushEvent::Error { message } = push {
            let _ = self.events_tx.send(ClientEvent::ServerError {
                message: message.clone(),
            });
        }
        let outcome = reconcile::apply(&mut self.store, push);
        debug!(?outcome, "applied push event");
        if matches!(outcome, Reconciled::ChatEvicted) {
            // A server-side delete also tears down any local stream.
            if let Some(chat_id) = push.chat_id() {
                if let Some(cancel) = self.transport_cancels.remove(chat_id) {
                    cancel.cancel();
                }
                let _ = self.stream_events.remove(chat_id);
            }
        }
    }
}

/// Wire a supervisor and a client together and spawn both.
///
/// Returns the handle; both tasks stop on [`ClientHandle::shutdown`] (the
/// supervisor via the shutdown token, the client via its command channel).
pub fn spawn(
    transport: Arc<dyn Transport>,
    requests: Arc<dyn RequestService>,
    credential: SessionCredential,
    config: SyncConfig,
) -> ClientHandle {
    let supervisor = ConnectionSupervisor::new(transport, config.reconnect.clone());
    let state = supervisor.state();
    let events = supervisor.subscribe();
    let shutdown = supervisor.shutdown_token();
    let (client, handle, channels) = SyncClient::new(requests, config, state, events);
    drop(tokio::spawn(supervisor.run(
        credential,
        channels.push_tx,
        channels.outbound_rx,
    )));
    let client_task = async move {
        client.run().await;
        // Client gone: tear the transport down too.
        shutdown.cancel();
    };
    drop(tokio::spawn(client_task));
    handle
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use assert_matches::assert_matches;
    use chrono::TimeZone;
    use mockall::mock;
    use palaver_core::events::PushMessage;
    use palaver_core::ids::ServerId;
    use palaver_core::messages::{Role, StreamState};

    mock! {
        pub Requests {}

        #[async_trait::async_trait]
        impl RequestService for Requests {
            async fn send_message(
                &self,
                chat_id: &ChatId,
                content: &str,
            ) -> Result<MessageAck, SyncError>;
            async fn stream_message(
                &self,
                chat_id: &ChatId,
                content: &str,
            ) -> Result<StreamingReply, SyncError>;
            async fn regenerate(&self, chat_id: &ChatId) -> Result<StreamingReply, SyncError>;
        }
    }

    struct Rig {
        handle: ClientHandle,
        push_tx: mpsc::Sender<PushEvent>,
        _outbound_rx: mpsc::Receiver<OutboundEvent>,
        _state_tx: watch::Sender<ConnectivityState>,
        _events_tx: broadcast::Sender<ConnectivityEvent>,
    }

    fn rig(requests: impl RequestService + 'static) -> Rig {
        let (state_tx, state_rx) = watch::channel(ConnectivityState::connecting());
        let (events_tx, events_rx) = broadcast::channel(8);
        let (client, handle, channels) = SyncClient::new(
            Arc::new(requests),
            SyncConfig::default(),
            state_rx,
            events_rx,
        );
        drop(tokio::spawn(client.run()));
        Rig {
            handle,
            push_tx: channels.push_tx,
            _outbound_rx: channels.outbound_rx,
            _state_tx: state_tx,
            _events_tx: events_tx,
        }
    }

    /// Poll a snapshot until the predicate holds or the deadline passes.
    async fn wait_until(
        handle: &ClientHandle,
        chat_id: &ChatId,
        predicate: impl Fn(&[Message]) -> bool,
    ) -> Vec<Message> {
        for _ in 0..500 {
            if let Some(messages) = handle.snapshot(chat_id.clone()).await.unwrap() {
                if predicate(&messages) {
                    return messages;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test(start_paused = true)]
    async fn optimistic_send_confirmed_by_ack() {
        let mut requests = MockRequests::new();
        let _ = requests.expect_send_message().returning(|_, _| {
            Ok(MessageAck {
                server_id: Some(ServerId::from("s1")),
                created_at: None,
            })
        });
        let rig = rig(requests);
        let chat_id = ChatId::from("c1");
        rig.handle.upsert_chat(chat_id.clone(), "Test").await.unwrap();
        rig.handle.send_message(chat_id.clone(), "hi").await.unwrap();

        let messages = wait_until(&rig.handle, &chat_id, |m| {
            m.len() == 1 && m[0].server_id.is_some()
        })
        .await;
        assert_eq!(messages[0].content, "hi");
        assert_eq!(messages[0].server_id, Some(ServerId::from("s1")));
        rig.handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn push_echo_after_send_does_not_duplicate() {
        let mut requests = MockRequests::new();
        let _ = requests
            .expect_send_message()
            .returning(|_, _| Ok(MessageAck::default()));
        let rig = rig(requests);
        let chat_id = ChatId::from("c1");
        rig.handle.upsert_chat(chat_id.clone(), "Test").await.unwrap();
        rig.handle.send_message(chat_id.clone(), "hi").await.unwrap();
        let _ = wait_until(&rig.handle, &chat_id, |m| m.len() == 1).await;

        rig.push_tx
            .send(PushEvent::MessageCreated {
                chat_id: chat_id.clone(),
                message: PushMessage {
                    id: ServerId::from("s1"),
                    role: Role::User,
                    content: "hi".into(),
                    created_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
                    is_edited: None,
                },
            })
            .await
            .unwrap();

        let messages = wait_until(&rig.handle, &chat_id, |m| {
            m.iter().any(|m| m.server_id == Some(ServerId::from("s1")))
        })
        .await;
        assert_eq!(messages.len(), 1);
        rig.handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_identical_send_appends_and_requests_again() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let mut requests = MockRequests::new();
        let _ = requests.expect_send_message().returning(move |_, _| {
            let _ = seen.fetch_add(1, Ordering::SeqCst);
            Ok(MessageAck::default())
        });
        let rig = rig(requests);
        let chat_id = ChatId::from("c1");
        rig.handle.upsert_chat(chat_id.clone(), "Test").await.unwrap();
        rig.handle.send_message(chat_id.clone(), "hi").await.unwrap();
        let _ = wait_until(&rig.handle, &chat_id, |m| m.len() == 1).await;

        // Server confirms the first copy.
        rig.push_tx
            .send(PushEvent::MessageCreated {
                chat_id: chat_id.clone(),
                message: PushMessage {
                    id: ServerId::from("s1"),
                    role: Role::User,
                    content: "hi".into(),
                    created_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
                    is_edited: None,
                },
            })
            .await
            .unwrap();
        let _ = wait_until(&rig.handle, &chat_id, |m| m[0].is_confirmed()).await;

        // Saying the same thing twice is two messages and two requests.
        rig.handle.send_message(chat_id.clone(), "hi").await.unwrap();
        let messages = wait_until(&rig.handle, &chat_id, |m| m.len() == 2).await;
        assert!(messages.iter().any(|m| m.server_id.is_none()));
        for _ in 0..500 {
            if calls.load(Ordering::SeqCst) == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        rig.handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stream_deltas_accumulate_and_finalize() {
        let (chunk_tx, chunk_rx) = mpsc::channel(8);
        let mut requests = MockRequests::new();
        let mut reply = Some(StreamingReply {
            events: chunk_rx,
            cancel: CancellationToken::new(),
        });
        let _ = requests
            .expect_stream_message()
            .returning(move |_, _| Ok(reply.take().expect("single stream")));
        let rig = rig(requests);
        let chat_id = ChatId::from("c1");
        rig.handle.upsert_chat(chat_id.clone(), "Test").await.unwrap();
        rig.handle
            .stream_message(chat_id.clone(), "question")
            .await
            .unwrap();

        // The assistant placeholder appears immediately.
        let _ = wait_until(&rig.handle, &chat_id, |m| {
            m.iter().any(|m| m.stream_state == StreamState::Streaming)
        })
        .await;

        for delta in ["Hel", "lo", " world"] {
            chunk_tx
                .send(StreamEvent::Delta {
                    delta: delta.into(),
                })
                .await
                .unwrap();
        }
        chunk_tx
            .send(StreamEvent::Done {
                id: Some(ServerId::from("s9")),
                created_at: None,
            })
            .await
            .unwrap();

        let messages = wait_until(&rig.handle, &chat_id, |m| {
            m.iter()
                .any(|m| m.content == "Hello world" && m.stream_state == StreamState::None)
        })
        .await;
        let done = messages.iter().find(|m| m.role == Role::Assistant).unwrap();
        assert_eq!(done.server_id, Some(ServerId::from("s9")));
        rig.handle.shutdown().await.unwrap();
    }

    /// Request service whose second stream request never resolves, holding
    /// the loop between displacing one stream and registering the next.
    struct StallingRequests {
        first: Mutex<Option<StreamingReply>>,
    }

    #[async_trait::async_trait]
    impl RequestService for StallingRequests {
        async fn send_message(
            &self,
            _chat_id: &ChatId,
            _content: &str,
        ) -> Result<MessageAck, SyncError> {
            Ok(MessageAck::default())
        }

        async fn stream_message(
            &self,
            _chat_id: &ChatId,
            _content: &str,
        ) -> Result<StreamingReply, SyncError> {
            let first = self.first.lock().unwrap().take();
            match first {
                Some(reply) => Ok(reply),
                None => std::future::pending().await,
            }
        }

        async fn regenerate(&self, _chat_id: &ChatId) -> Result<StreamingReply, SyncError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn displaced_stream_events_do_not_reach_replacement() {
        let (chunk_tx, chunk_rx) = mpsc::channel(8);
        let requests = StallingRequests {
            first: Mutex::new(Some(StreamingReply {
                events: chunk_rx,
                cancel: CancellationToken::new(),
            })),
        };
        let rig = rig(requests);
        let chat_id = ChatId::from("c1");
        rig.handle.upsert_chat(chat_id.clone(), "Test").await.unwrap();
        rig.handle.stream_message(chat_id.clone(), "first").await.unwrap();
        let _ = wait_until(&rig.handle, &chat_id, |m| !m.is_empty()).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        chunk_tx
            .send(StreamEvent::Delta {
                delta: "keep".into(),
            })
            .await
            .unwrap();
        let _ = wait_until(&rig.handle, &chat_id, |m| {
            m.iter().any(|m| m.content == "keep")
        })
        .await;

        // Displace; the replacement request stalls, so its receiver is not
        // registered yet.
        rig.handle.stream_message(chat_id.clone(), "second").await.unwrap();
        let _ = wait_until(&rig.handle, &chat_id, |m| m.len() == 2).await;

        // A late delta from the displaced stream goes nowhere.
        let _ = chunk_tx
            .send(StreamEvent::Delta {
                delta: "STALE".into(),
            })
            .await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let messages = rig.handle.snapshot(chat_id.clone()).await.unwrap().unwrap();
        let replacement = messages
            .iter()
            .find(|m| m.stream_state == StreamState::Streaming)
            .unwrap();
        assert_eq!(replacement.content, "");
        let displaced = messages.iter().find(|m| m.content == "keep").unwrap();
        assert_eq!(displaced.stream_state, StreamState::None);
        rig.handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn channel_close_without_terminal_event_fails_stream() {
        let (chunk_tx, chunk_rx) = mpsc::channel(8);
        let mut requests = MockRequests::new();
        let mut reply = Some(StreamingReply {
            events: chunk_rx,
            cancel: CancellationToken::new(),
        });
        let _ = requests
            .expect_stream_message()
            .returning(move |_, _| Ok(reply.take().expect("single stream")));
        let rig = rig(requests);
        let mut client_events = rig.handle.subscribe();
        let chat_id = ChatId::from("c1");
        rig.handle.upsert_chat(chat_id.clone(), "Test").await.unwrap();
        rig.handle.stream_message(chat_id.clone(), "q").await.unwrap();
        chunk_tx
            .send(StreamEvent::Delta {
                delta: "partial".into(),
            })
            .await
            .unwrap();
        let _ = wait_until(&rig.handle, &chat_id, |m| {
            m.iter().any(|m| m.content == "partial")
        })
        .await;

        // The request-service side dies without sending done or error.
        drop(chunk_tx);

        let messages = wait_until(&rig.handle, &chat_id, |m| {
            m.iter()
                .any(|m| m.content == "partial" && m.stream_state == StreamState::None)
        })
        .await;
        assert_eq!(messages.len(), 1);
        let event = client_events.recv().await.unwrap();
        assert_matches!(event, ClientEvent::StreamFailed { .. });
        rig.handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stream_error_preserves_partial_content() {
        let (chunk_tx, chunk_rx) = mpsc::channel(8);
        let mut requests = MockRequests::new();
        let mut reply = Some(StreamingReply {
            events: chunk_rx,
            cancel: CancellationToken::new(),
        });
        let _ = requests
            .expect_stream_message()
            .returning(move |_, _| Ok(reply.take().expect("single stream")));
        let rig = rig(requests);
        let mut client_events = rig.handle.subscribe();
        let chat_id = ChatId::from("c1");
        rig.handle.upsert_chat(chat_id.clone(), "Test").await.unwrap();
        rig.handle.stream_message(chat_id.clone(), "q").await.unwrap();

        chunk_tx
            .send(StreamEvent::Delta {
                delta: "partial".into(),
            })
            .await
            .unwrap();
        chunk_tx
            .send(StreamEvent::Error {
                message: "upstream hiccup".into(),
            })
            .await
            .unwrap();

        let messages = wait_until(&rig.handle, &chat_id, |m| {
            m.iter()
                .any(|m| m.content == "partial" && m.stream_state == StreamState::None)
        })
        .await;
        assert_eq!(messages.len(), 1);
        // One-shot error surfaced.
        let event = client_events.recv().await.unwrap();
        assert_matches!(event, ClientEvent::StreamFailed { .. });
        rig.handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stream_is_idempotent_through_handle() {
        let (_chunk_tx, chunk_rx) = mpsc::channel::<StreamEvent>(8);
        let cancel = CancellationToken::new();
        let transport_cancel = cancel.clone();
        let mut requests = MockRequests::new();
        let mut reply = Some(StreamingReply {
            events: chunk_rx,
            cancel,
        });
        let _ = requests
            .expect_stream_message()
            .returning(move |_, _| Ok(reply.take().expect("single stream")));
        let rig = rig(requests);
        let chat_id = ChatId::from("c1");
        rig.handle.upsert_chat(chat_id.clone(), "Test").await.unwrap();
        rig.handle.stream_message(chat_id.clone(), "q").await.unwrap();
        let _ = wait_until(&rig.handle, &chat_id, |m| !m.is_empty()).await;
        // Let the StreamReady result land so the transport token is held.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        rig.handle.cancel_stream(chat_id.clone()).await.unwrap();
        let after_first = wait_until(&rig.handle, &chat_id, |m| {
            m.iter().all(|m| m.stream_state == StreamState::None)
        })
        .await;
        assert!(transport_cancel.is_cancelled());

        rig.handle.cancel_stream(chat_id.clone()).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let after_second = rig.handle.snapshot(chat_id.clone()).await.unwrap().unwrap();
        assert_eq!(after_first, after_second);
        rig.handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn chat_removed_push_evicts_and_stops_stream() {
        let (_chunk_tx, chunk_rx) = mpsc::channel::<StreamEvent>(8);
        let cancel = CancellationToken::new();
        let transport_cancel = cancel.clone();
        let mut requests = MockRequests::new();
        let mut reply = Some(StreamingReply {
            events: chunk_rx,
            cancel,
        });
        let _ = requests
            .expect_stream_message()
            .returning(move |_, _| Ok(reply.take().expect("single stream")));
        let rig = rig(requests);
        let chat_id = ChatId::from("c1");
        rig.handle.upsert_chat(chat_id.clone(), "Test").await.unwrap();
        rig.handle.stream_message(chat_id.clone(), "q").await.unwrap();
        let _ = wait_until(&rig.handle, &chat_id, |m| !m.is_empty()).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        rig.push_tx
            .send(PushEvent::ChatRemoved {
                chat_id: chat_id.clone(),
            })
            .await
            .unwrap();

        for _ in 0..500 {
            if rig.handle.snapshot(chat_id.clone()).await.unwrap().is_none() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
        assert!(rig.handle.snapshot(chat_id.clone()).await.unwrap().is_none());
        assert!(transport_cancel.is_cancelled());
        rig.handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn send_rejection_surfaces_one_shot_event() {
        let mut requests = MockRequests::new();
        let _ = requests
            .expect_send_message()
            .returning(|_, _| Err(SyncError::RequestRejected("quota".into())));
        let rig = rig(requests);
        let mut client_events = rig.handle.subscribe();
        let chat_id = ChatId::from("c1");
        rig.handle.upsert_chat(chat_id.clone(), "Test").await.unwrap();
        rig.handle.send_message(chat_id.clone(), "hi").await.unwrap();

        let event = client_events.recv().await.unwrap();
        assert_matches!(event, ClientEvent::SendFailed { .. });
        // The optimistic message is still there, unconfirmed.
        let messages = rig.handle.snapshot(chat_id.clone()).await.unwrap().unwrap();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].server_id.is_none());
        rig.handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn commands_after_shutdown_fail_cleanly() {
        let requests = MockRequests::new();
        let rig = rig(requests);
        rig.handle.shutdown().await.unwrap();
        // The loop drains; subsequent commands see a closed channel.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let result = rig.handle.upsert_chat(ChatId::from("c1"), "x").await;
        assert_matches!(result, Err(SyncError::ClientClosed));
    }
}
