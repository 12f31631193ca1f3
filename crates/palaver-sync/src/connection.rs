//! Connection supervisor: owns the real-time transport lifecycle.
//!
//! State machine: `Disconnected → Connecting → Connected`, with
//! `Connected → Connecting` on transport-level loss and
//! `Connecting → Disconnected` once the bounded reconnection policy is
//! exhausted. Backoff counters and delays are fields of the running
//! supervisor, never module state, so the machine is testable in isolation
//! (with paused tokio time).
//!
//! The supervisor owns exactly one [`TransportSession`] at a time. A new
//! session is only established after the prior one is dropped, which closes
//! its event receiver and detaches every listener, so a superseded session
//! can never double-deliver push events into reconciliation.
//!
//! Loss classification: a shutdown-token disconnect is *explicit* and
//! transitions silently; everything else is *unexpected* and produces a
//! one-shot [`ConnectivityEvent::ConnectionLost`] before backoff begins.

use std::sync::Arc;

use metrics::counter;
use palaver_core::connectivity::{ConnectionPhase, ConnectivityState};
use palaver_core::errors::SyncError;
use palaver_core::events::PushEvent;
use palaver_core::retry::RetryConfig;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::transport::{
    OutboundEvent, SessionCredential, Transport, TransportEvent, TransportSession,
};

/// Capacity of the one-shot notification channel.
const EVENT_CAPACITY: usize = 32;

/// One-shot, user-visible connectivity notifications.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectivityEvent {
    /// The session dropped unexpectedly; reconnection is starting.
    ConnectionLost {
        /// Transport-provided reason.
        reason: String,
    },
    /// A reconnection attempt succeeded after a loss.
    Reconnected,
    /// The bounded reconnection policy was exhausted.
    GaveUp {
        /// Attempts made before settling in `Disconnected`.
        attempts: u32,
    },
    /// The credential was rejected; forced-logout signal.
    AuthRejected,
}

/// Why the connected phase ended.
enum SessionEnd {
    Shutdown,
    Lost { reason: String },
}

/// Supervises the transport connection for the lifetime of a session.
pub struct ConnectionSupervisor {
    transport: Arc<dyn Transport>,
    retry: RetryConfig,
    state_tx: watch::Sender<ConnectivityState>,
    events_tx: broadcast::Sender<ConnectivityEvent>,
    shutdown: CancellationToken,
}

impl ConnectionSupervisor {
    /// Create a supervisor over a transport. The initial published state is
    /// `Connecting` (the process-start state).
    pub fn new(transport: Arc<dyn Transport>, retry: RetryConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectivityState::connecting());
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            transport,
            retry,
            state_tx,
            events_tx,
            shutdown: CancellationToken::new(),
        }
    }

    /// The passive connectivity indicator.
    pub fn state(&self) -> watch::Receiver<ConnectivityState> {
        self.state_tx.subscribe()
    }

    /// Subscribe to one-shot connectivity notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityEvent> {
        self.events_tx.subscribe()
    }

    /// Token for explicit, client-initiated teardown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn publish(&self, state: ConnectivityState) {
        let _ = self.state_tx.send_replace(state);
    }

    fn notify(&self, event: ConnectivityEvent) {
        // No subscribers is fine; notifications are best-effort.
        let _ = self.events_tx.send(event);
    }

    /// Run the connection lifecycle until shutdown, exhaustion, or auth
    /// rejection. Forwards push events into `push_tx` and outbound
    /// operations from `outbound_rx` through the owned handle.
    #[instrument(skip_all)]
    pub async fn run(
        self,
        credential: SessionCredential,
        push_tx: mpsc::Sender<PushEvent>,
        mut outbound_rx: mpsc::Receiver<OutboundEvent>,
    ) {
        let mut ever_connected = false;
        loop {
            let session = match self.connect_with_backoff(&credential).await {
                Some(session) => session,
                None => return,
            };
            if ever_connected {
                self.notify(ConnectivityEvent::Reconnected);
            }
            ever_connected = true;
            self.publish(ConnectivityState {
                phase: ConnectionPhase::Connected,
                last_error: None,
                session_token: session.session_token.clone(),
            });
            info!("transport session established");

            match self
                .drive_session(session, &push_tx, &mut outbound_rx)
                .await
            {
                SessionEnd::Shutdown => {
                    // Explicit disconnect: silent transition.
                    debug!("explicit disconnect, supervisor stopping");
                    self.publish(ConnectivityState::default());
                    return;
                }
                SessionEnd::Lost { reason } => {
                    warn!(reason = %reason, "unexpected connection loss");
                    counter!("connection_losses_total").increment(1);
                    self.notify(ConnectivityEvent::ConnectionLost {
                        reason: reason.clone(),
                    });
                    self.publish(ConnectivityState {
                        phase: ConnectionPhase::Connecting,
                        last_error: Some(reason),
                        session_token: None,
                    });
                    // Session already dropped by drive_session; reconnect.
                }
            }
        }
    }

    /// Connect with capped exponential backoff.
    ///
    /// `None` means the supervisor is done: shutdown, exhausted attempts,
    /// or auth rejection.
    async fn connect_with_backoff(
        &self,
        credential: &SessionCredential,
    ) -> Option<TransportSession> {
        let mut attempts: u32 = 0;
        loop {
            if self.shutdown.is_cancelled() {
                self.publish(ConnectivityState::default());
                return None;
            }
            counter!("connection_attempts_total").increment(1);
            match self.transport.connect(credential).await {
                Ok(session) => return Some(session),
                Err(SyncError::AuthRejected) => {
                    warn!("credential rejected by transport");
                    self.notify(ConnectivityEvent::AuthRejected);
                    self.publish(ConnectivityState {
                        phase: ConnectionPhase::Disconnected,
                        last_error: Some(SyncError::AuthRejected.to_string()),
                        session_token: None,
                    });
                    return None;
                }
                Err(error) => {
                    attempts += 1;
                    debug!(attempt = attempts, error = %error, "connect attempt failed");
                    if !self.retry.should_retry(attempts) {
                        info!(attempts, "reconnection attempts exhausted");
                        self.notify(ConnectivityEvent::GaveUp { attempts });
                        self.publish(ConnectivityState {
                            phase: ConnectionPhase::Disconnected,
                            last_error: Some(error.to_string()),
                            session_token: None,
                        });
                        return None;
                    }
                    self.publish(ConnectivityState {
                        phase: ConnectionPhase::Connecting,
                        last_error: Some(error.to_string()),
                        session_token: None,
                    });
                    let delay = self.retry.delay_for(attempts);
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = self.shutdown.cancelled() => {
                            self.publish(ConnectivityState::default());
                            return None;
                        }
                    }
                }
            }
        }
    }

    /// Pump one live session until shutdown or loss. Consumes the session
    /// so its listeners are detached before any reconnect.
    async fn drive_session(
        &self,
        mut session: TransportSession,
        push_tx: &mpsc::Sender<PushEvent>,
        outbound_rx: &mut mpsc::Receiver<OutboundEvent>,
    ) -> SessionEnd {
        let mut outbound_open = true;
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => {
                    session.handle.disconnect().await;
                    return SessionEnd::Shutdown;
                }
                event = session.events.recv() => match event {
                    Some(TransportEvent::Push(push)) => {
                        if push_tx.send(push).await.is_err() {
                            // Client loop is gone; treat as explicit teardown.
                            session.handle.disconnect().await;
                            return SessionEnd::Shutdown;
                        }
                    }
                    Some(TransportEvent::Lost { reason }) => {
                        return SessionEnd::Lost { reason };
                    }
                    None => {
                        return SessionEnd::Lost {
                            reason: "event channel closed".to_string(),
                        };
                    }
                },
                outbound = outbound_rx.recv(), if outbound_open => match outbound {
                    Some(event) => {
                        if let Err(error) = session.handle.emit(event).await {
                            warn!(error = %error, "failed to emit outbound event");
                        }
                    }
                    // Command side dropped; keep pumping inbound events.
                    None => outbound_open = false,
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use palaver_core::ids::ChatId;
    use crate::transport::TransportHandle;

    /// Scripted connect outcomes for a fake transport.
    enum Script {
        Fail,
        AuthReject,
        Connect,
    }

    struct FakeHandle {
        emitted: Arc<Mutex<Vec<OutboundEvent>>>,
        disconnected: Arc<Mutex<bool>>,
    }

    #[async_trait]
    impl TransportHandle for FakeHandle {
        async fn emit(&mut self, event: OutboundEvent) -> Result<(), SyncError> {
            self.emitted.lock().unwrap().push(event);
            Ok(())
        }

        async fn disconnect(&mut self) {
            *self.disconnected.lock().unwrap() = true;
        }
    }

    struct FakeTransport {
        script: Mutex<VecDeque<Script>>,
        /// Sender for each established session, in order.
        sessions: Arc<Mutex<Vec<mpsc::Sender<TransportEvent>>>>,
        emitted: Arc<Mutex<Vec<OutboundEvent>>>,
        disconnected: Arc<Mutex<bool>>,
    }

    impl FakeTransport {
        fn new(script: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                sessions: Arc::new(Mutex::new(Vec::new())),
                emitted: Arc::new(Mutex::new(Vec::new())),
                disconnected: Arc::new(Mutex::new(false)),
            })
        }

        fn latest_session(&self) -> mpsc::Sender<TransportEvent> {
            self.sessions.lock().unwrap().last().unwrap().clone()
        }

        fn session_count(&self) -> usize {
            self.sessions.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn connect(
            &self,
            _credential: &SessionCredential,
        ) -> Result<TransportSession, SyncError> {
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(Script::Connect) => {
                    let (tx, rx) = mpsc::channel(16);
                    self.sessions.lock().unwrap().push(tx);
                    Ok(TransportSession {
                        handle: Box::new(FakeHandle {
                            emitted: Arc::clone(&self.emitted),
                            disconnected: Arc::clone(&self.disconnected),
                        }),
                        events: rx,
                        session_token: Some("tok".to_string()),
                    })
                }
                Some(Script::AuthReject) => Err(SyncError::AuthRejected),
                Some(Script::Fail) | None => {
                    Err(SyncError::Transport("connection refused".into()))
                }
            }
        }
    }

    fn retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    struct Running {
        push_rx: mpsc::Receiver<PushEvent>,
        outbound_tx: mpsc::Sender<OutboundEvent>,
        state: watch::Receiver<ConnectivityState>,
        events: broadcast::Receiver<ConnectivityEvent>,
        shutdown: CancellationToken,
        task: tokio::task::JoinHandle<()>,
    }

    fn spawn(transport: Arc<FakeTransport>, retry: RetryConfig) -> Running {
        let supervisor = ConnectionSupervisor::new(transport, retry);
        let state = supervisor.state();
        let events = supervisor.subscribe();
        let shutdown = supervisor.shutdown_token();
        let (push_tx, push_rx) = mpsc::channel(16);
        let (outbound_tx, outbound_rx) = mpsc::channel(16);
        let task = tokio::spawn(supervisor.run(
            SessionCredential::from("cred"),
            push_tx,
            outbound_rx,
        ));
        Running {
            push_rx,
            outbound_tx,
            state,
            events,
            shutdown,
            task,
        }
    }

    async fn wait_for_phase(state: &mut watch::Receiver<ConnectivityState>, phase: ConnectionPhase) {
        loop {
            if state.borrow().phase == phase {
                return;
            }
            state.changed().await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn connects_and_publishes_state() {
        let transport = FakeTransport::new(vec![Script::Connect]);
        let mut running = spawn(Arc::clone(&transport), retry(3));
        wait_for_phase(&mut running.state, ConnectionPhase::Connected).await;
        let snapshot = running.state.borrow().clone();
        assert_eq!(snapshot.session_token.as_deref(), Some("tok"));
        assert!(snapshot.last_error.is_none());
        running.shutdown.cancel();
        running.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn forwards_push_events() {
        let transport = FakeTransport::new(vec![Script::Connect]);
        let mut running = spawn(Arc::clone(&transport), retry(3));
        wait_for_phase(&mut running.state, ConnectionPhase::Connected).await;

        let push = PushEvent::ChatRemoved {
            chat_id: ChatId::from("c1"),
        };
        transport
            .latest_session()
            .send(TransportEvent::Push(push.clone()))
            .await
            .unwrap();
        let received = running.push_rx.recv().await.unwrap();
        assert_eq!(received, push);
        running.shutdown.cancel();
        running.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_after_unexpected_loss() {
        let transport = FakeTransport::new(vec![Script::Connect, Script::Connect]);
        let mut running = spawn(Arc::clone(&transport), retry(3));
        wait_for_phase(&mut running.state, ConnectionPhase::Connected).await;

        transport
            .latest_session()
            .send(TransportEvent::Lost {
                reason: "socket closed".into(),
            })
            .await
            .unwrap();

        // Loss notification, then a fresh session.
        let event = running.events.recv().await.unwrap();
        assert_matches!(event, ConnectivityEvent::ConnectionLost { .. });
        let event = running.events.recv().await.unwrap();
        assert_eq!(event, ConnectivityEvent::Reconnected);
        wait_for_phase(&mut running.state, ConnectionPhase::Connected).await;
        assert_eq!(transport.session_count(), 2);

        running.shutdown.cancel();
        running.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn settles_disconnected_after_exhausting_attempts() {
        let transport = FakeTransport::new(vec![]); // every connect fails
        let mut running = spawn(Arc::clone(&transport), retry(3));

        wait_for_phase(&mut running.state, ConnectionPhase::Disconnected).await;
        running.task.await.unwrap();

        let mut gave_up = None;
        while let Ok(event) = running.events.try_recv() {
            if let ConnectivityEvent::GaveUp { attempts } = event {
                gave_up = Some(attempts);
            }
        }
        assert_eq!(gave_up, Some(3));
        // Settled: no further sessions were attempted.
        assert_eq!(transport.session_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_shutdown_is_silent() {
        let transport = FakeTransport::new(vec![Script::Connect]);
        let mut running = spawn(Arc::clone(&transport), retry(3));
        wait_for_phase(&mut running.state, ConnectionPhase::Connected).await;

        running.shutdown.cancel();
        running.task.await.unwrap();

        assert_eq!(running.state.borrow().phase, ConnectionPhase::Disconnected);
        // No user-visible notification for an explicit disconnect.
        assert_matches!(
            running.events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        );
        assert!(*transport.disconnected.lock().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn auth_rejection_stops_retrying() {
        let transport = FakeTransport::new(vec![Script::AuthReject, Script::Connect]);
        let mut running = spawn(Arc::clone(&transport), retry(5));

        wait_for_phase(&mut running.state, ConnectionPhase::Disconnected).await;
        running.task.await.unwrap();

        let event = running.events.recv().await.unwrap();
        assert_eq!(event, ConnectivityEvent::AuthRejected);
        // The scripted second connect was never consumed.
        assert_eq!(transport.session_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn outbound_events_flow_through_owned_handle() {
        let transport = FakeTransport::new(vec![Script::Connect]);
        let mut running = spawn(Arc::clone(&transport), retry(3));
        wait_for_phase(&mut running.state, ConnectionPhase::Connected).await;

        let typing = OutboundEvent::Typing {
            chat_id: ChatId::from("c1"),
            typing: true,
        };
        running.outbound_tx.send(typing.clone()).await.unwrap();

        // Poll until the supervisor forwards it.
        loop {
            if transport.emitted.lock().unwrap().contains(&typing) {
                break;
            }
            tokio::task::yield_now().await;
        }
        running.shutdown.cancel();
        running.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failure_then_success_backs_off_and_connects() {
        let transport = FakeTransport::new(vec![Script::Fail, Script::Connect]);
        let mut running = spawn(Arc::clone(&transport), retry(3));

        wait_for_phase(&mut running.state, ConnectionPhase::Connected).await;
        assert_eq!(transport.session_count(), 1);
        // The intermediate failure left its trace in the error field history;
        // current snapshot is clean.
        assert!(running.state.borrow().last_error.is_none());

        running.shutdown.cancel();
        running.task.await.unwrap();
    }
}
