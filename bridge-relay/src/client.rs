//! RelayClient - one persistent session to a paired device via the relay.
//!
//! # Architecture
//!
//! RelayClient uses the pure connection state machine and single-flight
//! queue from `signbridge-core` and interprets their decisions to perform
//! I/O via the [`RelayTransport`] trait.
//!
//! ```text
//! DeviceSyncManager → RelayClient → RelayTransport → Relay → Device
//!                          ↓
//!               signbridge-core (RelayState, PendingQueue, RetryPolicy)
//! ```
//!
//! Three tasks cooperate on a client:
//! - callers of [`RelayClient::send`] enqueue and await a oneshot
//! - a reader task consumes transport events (receipts, responses)
//! - a ticker task re-evaluates the head of the queue every tick
//!
//! Exactly one request is on the wire at a time. A request that exhausts its
//! attempts without a receipt, or whose response does not arrive in time
//! after a receipt, fails with a timeout, the queue advances, and the
//! transport is dropped so the next send reconnects.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde_json::Value;
use signbridge_core::{
    Action, ConnectMode, Event, PendingQueue, QueueError, RelayEvent, RelayState, RetryPolicy,
    Verdict,
};
use signbridge_types::{
    AgentResponse, BridgeError, EnvelopeKind, ExceptionModel, RelayEnvelope, RequestId, SessionId,
    ENVELOPE_FORMAT,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::crypto::{CryptoError, SymmetricKey};
use crate::transport::{RelayTransport, SessionTicket, TransportError, TransportEvent};

/// Relay client errors.
#[derive(Debug, Clone, Error)]
pub enum RelayError {
    /// Transport error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Crypto error.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// The session could not be (re)established in time.
    #[error("device {device} did not connect: {detail}")]
    ConnectTimeout {
        /// Device name.
        device: String,
        /// What was being waited for.
        detail: String,
    },

    /// No receipt after every attempt, or no response after the receipt.
    #[error("device {device} is not responding")]
    Timeout {
        /// Device name.
        device: String,
    },

    /// The relay could not deliver the request.
    #[error("could not send message to device {device}: {detail}")]
    Undeliverable {
        /// Device name.
        device: String,
        /// Transport detail.
        detail: String,
    },

    /// The device answered with a structured failure.
    #[error("device error: {0}")]
    Remote(ExceptionModel),

    /// No shared key yet.
    #[error("session has no shared key")]
    NotPaired,

    /// Too many requests queued.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// A message could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The client was stopped while the request was outstanding.
    #[error("relay session stopped")]
    Stopped,
}

impl From<RelayError> for BridgeError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::ConnectTimeout { device, .. } => BridgeError::ConnectTimeout { device },
            RelayError::Timeout { device } => BridgeError::RelayTimeout { device },
            RelayError::Undeliverable { device, detail } => {
                BridgeError::RelayUndeliverable { device, detail }
            }
            RelayError::Remote(exception) => BridgeError::Agent(exception),
            RelayError::Crypto(e) => BridgeError::Integrity(e.to_string()),
            other => BridgeError::Internal(other.to_string()),
        }
    }
}

/// Configuration for RelayClient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayClientConfig {
    /// Transmissions of one request before giving up on a receipt.
    pub max_send_attempts: u32,
    /// Wait after a transmission before resending.
    pub retry_delay: Duration,
    /// Default wait for the response once receipted.
    pub response_timeout: Duration,
    /// Overall bound on establishing a session.
    pub connect_timeout: Duration,
    /// Bound on waiting for the relay's connection id.
    pub connection_id_timeout: Duration,
    /// Bound on waiting for a reconnect before failing a queued send.
    pub reconnect_wait: Duration,
    /// Period of the retry/timeout evaluation.
    pub tick: Duration,
    /// Maximum queued requests.
    pub queue_capacity: usize,
}

impl Default for RelayClientConfig {
    fn default() -> Self {
        Self {
            max_send_attempts: 3,
            retry_delay: Duration::from_secs(5),
            response_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(40),
            connection_id_timeout: Duration::from_secs(10),
            reconnect_wait: Duration::from_secs(10),
            tick: Duration::from_secs(1),
            queue_capacity: 256,
        }
    }
}

impl RelayClientConfig {
    /// Set the number of send attempts.
    pub fn with_max_send_attempts(mut self, attempts: u32) -> Self {
        self.max_send_attempts = attempts.max(1);
        self
    }

    /// Set the delay between attempts.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Set the default response timeout.
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Set the overall connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the connection id wait.
    pub fn with_connection_id_timeout(mut self, timeout: Duration) -> Self {
        self.connection_id_timeout = timeout;
        self
    }

    /// Set the reconnect wait.
    pub fn with_reconnect_wait(mut self, wait: Duration) -> Self {
        self.reconnect_wait = wait;
        self
    }

    /// Set the evaluation period.
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// The retry policy these settings describe.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_send_attempts,
            retry_delay: self.retry_delay,
        }
    }
}

type Completion = oneshot::Sender<Result<Value, RelayError>>;

struct Shared {
    state: RelayState,
    session_id: Option<SessionId>,
    session_id_raw: Option<String>,
    connection_id: Option<String>,
    peer_connected: bool,
    peer_info: Option<Value>,
    device_name: String,
    key: Option<SymmetricKey>,
    queue: PendingQueue<Completion>,
    handshake: Option<Completion>,
    generation: u64,
    ticker: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

impl Shared {
    fn apply(&mut self, event: Event) -> Vec<Action> {
        let (state, actions) = std::mem::take(&mut self.state).on_event(event);
        self.state = state;
        actions
    }

    fn ticket(&self) -> Option<SessionTicket> {
        let session_id = self.session_id.clone()?;
        let session_id_raw = self
            .session_id_raw
            .clone()
            .unwrap_or_else(|| session_id.to_string());
        Some(SessionTicket {
            session_id,
            session_id_raw,
        })
    }
}

struct Inner {
    config: RelayClientConfig,
    policy: RetryPolicy,
    transport: Arc<dyn RelayTransport>,
    epoch: Instant,
    shared: Mutex<Shared>,
}

enum Step {
    Transmit(SessionId, String, String, u32),
    Expire(Completion, String),
    Reconnect,
}

/// A relay session to one device.
///
/// Cheap to clone; clones share the session.
#[derive(Clone)]
pub struct RelayClient {
    inner: Arc<Inner>,
}

impl RelayClient {
    /// A client for a device that is not paired yet.
    pub fn new(transport: Arc<dyn RelayTransport>, config: RelayClientConfig) -> Self {
        Self::build(transport, config, None, "device".to_string(), None)
    }

    /// A client for an already paired device.
    pub fn for_device(
        transport: Arc<dyn RelayTransport>,
        config: RelayClientConfig,
        session_id: SessionId,
        device_name: &str,
        key: SymmetricKey,
    ) -> Self {
        Self::build(
            transport,
            config,
            Some(session_id),
            device_name.to_string(),
            Some(key),
        )
    }

    fn build(
        transport: Arc<dyn RelayTransport>,
        config: RelayClientConfig,
        session_id: Option<SessionId>,
        device_name: String,
        key: Option<SymmetricKey>,
    ) -> Self {
        let shared = Shared {
            state: RelayState::new(),
            session_id,
            session_id_raw: None,
            connection_id: None,
            peer_connected: false,
            peer_info: None,
            device_name,
            key,
            queue: PendingQueue::new(config.queue_capacity),
            handshake: None,
            generation: 0,
            ticker: None,
            reader: None,
        };
        Self {
            inner: Arc::new(Inner {
                policy: config.retry_policy(),
                config,
                transport,
                epoch: Instant::now(),
                shared: Mutex::new(shared),
            }),
        }
    }

    fn now_ms(&self) -> u64 {
        self.inner.epoch.elapsed().as_millis() as u64
    }

    /// Install the identity learned during pairing.
    pub async fn set_device(&self, device_name: &str, key: SymmetricKey) {
        let mut shared = self.inner.shared.lock().await;
        shared.device_name = device_name.to_string();
        shared.key = Some(key);
    }

    /// Device display name.
    pub async fn device_name(&self) -> String {
        self.inner.shared.lock().await.device_name.clone()
    }

    /// Relay session id, once known.
    pub async fn session_id(&self) -> Option<SessionId> {
        self.inner.shared.lock().await.session_id.clone()
    }

    /// Whether requests can be transmitted right now.
    pub async fn is_ready(&self) -> bool {
        self.inner.shared.lock().await.state.is_ready()
    }

    /// Whether the peer device attached to the session.
    pub async fn peer_connected(&self) -> bool {
        self.inner.shared.lock().await.peer_connected
    }

    /// Information the relay sent with the peer-connected event.
    pub async fn peer_info(&self) -> Option<Value> {
        self.inner.shared.lock().await.peer_info.clone()
    }

    /// Number of queued requests, including the one in flight.
    pub async fn pending_len(&self) -> usize {
        self.inner.shared.lock().await.queue.len()
    }

    // ===========================================
    // Connection lifecycle
    // ===========================================

    /// Open a session: register a new one (`Pair`) or resume an existing one.
    pub async fn connect(&self, mode: ConnectMode) -> Result<SessionTicket, RelayError> {
        let limit = self.inner.config.connect_timeout;
        match tokio::time::timeout(limit, self.connect_inner(mode)).await {
            Ok(result) => result,
            Err(_) => {
                let generation = self.inner.shared.lock().await.generation;
                self.fail_connect(generation, "connect timed out").await;
                Err(self.connect_timeout("connect timed out").await)
            }
        }
    }

    async fn connect_inner(&self, mode: ConnectMode) -> Result<SessionTicket, RelayError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let generation = {
            let mut shared = self.inner.shared.lock().await;
            if shared.state.is_ready() {
                if let Some(ticket) = shared.ticket() {
                    return Ok(ticket);
                }
            }
            if shared.state.is_connecting() {
                drop(shared);
                return self.await_ready_ticket().await;
            }
            let actions = shared.apply(Event::ConnectRequested { mode: mode.clone() });
            if !actions.contains(&Action::OpenTransport) {
                return Err(RelayError::Transport(TransportError::NotConnected));
            }
            shared.generation += 1;
            shared.connection_id = None;
            shared.peer_connected = false;
            shared.peer_info = None;
            if let ConnectMode::Resume { session_id } = &mode {
                shared.session_id = Some(session_id.clone());
            }
            if shared.ticker.is_none() {
                shared.ticker = Some(tokio::spawn(ticker_loop(
                    Arc::downgrade(&self.inner),
                    self.inner.config.tick,
                )));
            }
            shared.generation
        };

        info!(?mode, "opening relay connection");
        if let Err(e) = self.inner.transport.open(tx).await {
            self.fail_connect(generation, &e.to_string()).await;
            return Err(e.into());
        }
        {
            let reader = tokio::spawn(read_events(Arc::downgrade(&self.inner), generation, rx));
            let mut shared = self.inner.shared.lock().await;
            if let Some(old) = shared.reader.replace(reader) {
                old.abort();
            }
        }

        let connection_id = match self.poll_connection_id(generation).await {
            Some(id) => id,
            None => {
                self.fail_connect(generation, "connection id timeout").await;
                return Err(self.connect_timeout("connection id timeout").await);
            }
        };
        debug!(%connection_id, "got relay connection id");

        let actions = {
            let mut shared = self.inner.shared.lock().await;
            shared.apply(Event::ConnectionIdReceived {
                connection_id: connection_id.clone(),
            })
        };
        for action in actions {
            let outcome = match action {
                Action::CreateSession { connection_id } => {
                    match self.inner.transport.create_session(&connection_id).await {
                        Ok(ticket) => {
                            let mut shared = self.inner.shared.lock().await;
                            shared.session_id = Some(ticket.session_id.clone());
                            shared.session_id_raw = Some(ticket.session_id_raw.clone());
                            info!(session_id = %ticket.session_id, "pairing session started");
                            Ok(())
                        }
                        Err(e) => Err(e),
                    }
                }
                Action::ResumeSession {
                    session_id,
                    connection_id,
                } => self
                    .inner
                    .transport
                    .resume_session(&session_id, &connection_id)
                    .await
                    .map(|()| info!(%session_id, "relay session recovered")),
                _ => Ok(()),
            };
            if let Err(e) = outcome {
                self.fail_connect(generation, &e.to_string()).await;
                return Err(e.into());
            }
        }

        let (actions, ticket) = {
            let mut shared = self.inner.shared.lock().await;
            let session_id = shared
                .session_id
                .clone()
                .ok_or(RelayError::Transport(TransportError::NotConnected))?;
            let actions = shared.apply(Event::SessionEstablished { session_id });
            (actions, shared.ticket())
        };
        self.run_actions(actions).await;

        if matches!(mode, ConnectMode::Pair) {
            let client = self.clone();
            let wait = self.inner.config.connect_timeout;
            tokio::spawn(async move {
                tokio::time::sleep(wait).await;
                client.expire_unattended_pairing(generation).await;
            });
        }

        ticket.ok_or(RelayError::Transport(TransportError::NotConnected))
    }

    async fn await_ready_ticket(&self) -> Result<SessionTicket, RelayError> {
        if self.wait_ready(self.inner.config.connect_timeout).await {
            if let Some(ticket) = self.inner.shared.lock().await.ticket() {
                return Ok(ticket);
            }
        }
        Err(self.connect_timeout("session not ready").await)
    }

    async fn poll_connection_id(&self, generation: u64) -> Option<String> {
        let deadline = Instant::now() + self.inner.config.connection_id_timeout;
        loop {
            {
                let shared = self.inner.shared.lock().await;
                if shared.generation != generation {
                    return None;
                }
                if let Some(id) = shared.connection_id.clone() {
                    return Some(id);
                }
            }
            if Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(self.inner.config.tick).await;
        }
    }

    async fn wait_ready(&self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        loop {
            {
                let shared = self.inner.shared.lock().await;
                if shared.state.is_ready() {
                    return true;
                }
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.inner.config.tick).await;
        }
    }

    async fn fail_connect(&self, generation: u64, error: &str) {
        let actions = {
            let mut shared = self.inner.shared.lock().await;
            if shared.generation != generation {
                return;
            }
            shared.apply(Event::ConnectFailed {
                error: error.to_string(),
            })
        };
        self.run_actions(actions).await;
    }

    async fn connect_timeout(&self, detail: &str) -> RelayError {
        RelayError::ConnectTimeout {
            device: self.device_name().await,
            detail: detail.to_string(),
        }
    }

    async fn expire_unattended_pairing(&self, generation: u64) {
        let (actions, handshake) = {
            let mut shared = self.inner.shared.lock().await;
            if shared.generation != generation || shared.peer_connected {
                return;
            }
            warn!("no device attached to the pairing session; closing it");
            (shared.apply(Event::StopRequested), shared.handshake.take())
        };
        if let Some(waiter) = handshake {
            let _ = waiter.send(Err(self.connect_timeout("device did not attach").await));
        }
        self.run_actions(actions).await;
    }

    async fn run_actions(&self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::CloseTransport => {
                    if let Err(e) = self.inner.transport.close().await {
                        warn!(error = %e, "error while closing relay transport");
                    }
                }
                Action::StartSending => self.kick().await,
                Action::Emit(RelayEvent::Ready { session_id }) => {
                    info!(%session_id, "relay session ready")
                }
                Action::Emit(RelayEvent::ConnectFailed { error }) => {
                    warn!(%error, "relay connection failed")
                }
                Action::Emit(RelayEvent::Disconnected { reason }) => {
                    info!(%reason, "relay connection closed")
                }
                // Handled inline by connect().
                Action::OpenTransport
                | Action::CreateSession { .. }
                | Action::ResumeSession { .. } => {}
            }
        }
    }

    fn spawn_reconnect(&self) {
        tokio::spawn(reconnect_task(self.clone()));
    }

    async fn reconnect(&self) {
        let session_id = {
            let shared = self.inner.shared.lock().await;
            if shared.state.is_ready() || shared.state.is_connecting() {
                return;
            }
            match shared.session_id.clone() {
                Some(id) => id,
                None => return,
            }
        };
        if let Err(e) = self.connect(ConnectMode::Resume { session_id }).await {
            warn!(error = %e, "could not reconnect device");
        }
    }

    /// Drop the transport and fail everything outstanding.
    pub async fn stop(&self) {
        let (actions, drained, handshake, ticker, reader) = {
            let mut shared = self.inner.shared.lock().await;
            shared.generation += 1;
            (
                shared.apply(Event::StopRequested),
                shared.queue.drain(),
                shared.handshake.take(),
                shared.ticker.take(),
                shared.reader.take(),
            )
        };
        info!(dropped = drained.len(), "stopping relay session");
        for request in drained {
            let _ = request.completion.send(Err(RelayError::Stopped));
        }
        if let Some(waiter) = handshake {
            let _ = waiter.send(Err(RelayError::Stopped));
        }
        for task in [ticker, reader].into_iter().flatten() {
            task.abort();
        }
        self.run_actions(actions).await;
    }

    // ===========================================
    // Requests
    // ===========================================

    /// Post the pairing handshake and wait for the device's reply.
    pub async fn send_handshake(&self) -> Result<Value, RelayError> {
        let (tx, rx) = oneshot::channel();
        let session_id = {
            let mut shared = self.inner.shared.lock().await;
            let session_id = shared
                .session_id
                .clone()
                .ok_or(RelayError::Transport(TransportError::NotConnected))?;
            shared.handshake = Some(tx);
            session_id
        };
        let envelope = RelayEnvelope::new(EnvelopeKind::Sync, RequestId::new().to_string(), None);
        self.inner.transport.post(&session_id, &envelope).await?;

        match tokio::time::timeout(self.inner.config.response_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RelayError::Stopped),
            Err(_) => {
                self.inner.shared.lock().await.handshake = None;
                Err(RelayError::Timeout {
                    device: self.device_name().await,
                })
            }
        }
    }

    /// Send an application message and wait for the device's response.
    ///
    /// The message's `requestId` is used as the envelope id when present.
    /// `timeout` overrides the response timeout for this request.
    pub async fn send(&self, message: &Value, timeout: Option<Duration>) -> Result<Value, RelayError> {
        let id = message
            .get("requestId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| RequestId::new().to_string());
        let plaintext =
            serde_json::to_string(message).map_err(|e| RelayError::Serialization(e.to_string()))?;
        let (tx, rx) = oneshot::channel();
        let now = self.now_ms();

        let (ready, connecting) = {
            let mut shared = self.inner.shared.lock().await;
            let content = shared
                .key
                .as_ref()
                .ok_or(RelayError::NotPaired)?
                .encrypt_str(&plaintext)?;
            let response_timeout = timeout.unwrap_or(self.inner.config.response_timeout);
            shared
                .queue
                .enqueue(id.clone(), content, response_timeout, tx, now)?;
            (shared.state.is_ready(), shared.state.is_connecting())
        };
        debug!(request_id = %id, "queued relay request");

        if ready {
            self.kick().await;
        } else {
            if !connecting {
                self.spawn_reconnect();
            }
            if !self.wait_ready(self.inner.config.reconnect_wait).await {
                let removed = {
                    let mut shared = self.inner.shared.lock().await;
                    let in_flight = shared
                        .queue
                        .head()
                        .map(|h| h.id == id && h.last_sent.is_some())
                        .unwrap_or(false);
                    if in_flight {
                        None
                    } else {
                        shared.queue.remove(&id)
                    }
                };
                if removed.is_some() {
                    return Err(self.connect_timeout("reconnect timed out").await);
                }
            }
        }

        rx.await.unwrap_or(Err(RelayError::Stopped))
    }

    /// Start transmitting the head if nothing is in flight.
    ///
    /// Expiry is left to `tick`; this only sends or asks for a reconnect.
    async fn kick(&self) {
        loop {
            let next = {
                let mut shared = self.inner.shared.lock().await;
                if shared.queue.is_empty() {
                    return;
                }
                if !shared.state.is_ready() {
                    if shared.state.is_connecting() {
                        return;
                    }
                    None
                } else {
                    let unsent = shared
                        .queue
                        .head()
                        .map(|h| h.last_sent.is_none())
                        .unwrap_or(false);
                    if !unsent {
                        return;
                    }
                    let now = self.now_ms();
                    match (shared.session_id.clone(), shared.queue.record_send(now)) {
                        (Some(session), Some(send)) => Some((session, send)),
                        _ => return,
                    }
                }
            };
            match next {
                Some((session, (id, content, attempt))) => {
                    if !self.transmit(session, id, content, attempt).await {
                        return;
                    }
                }
                None => {
                    self.spawn_reconnect();
                    return;
                }
            }
        }
    }

    /// Post the head. Returns `true` when the head failed permanently and
    /// the next request should go out.
    async fn transmit(&self, session: SessionId, id: String, content: String, attempt: u32) -> bool {
        debug!(request_id = %id, attempt, "sending relay request");
        let envelope = RelayEnvelope::new(EnvelopeKind::Request, id.clone(), Some(content));
        let last = self.inner.policy.is_last_attempt(attempt);
        let failure = match self.inner.transport.post(&session, &envelope).await {
            Ok(outcome) if !outcome.sent_to_device && last => {
                Some("message was not delivered to the device".to_string())
            }
            Ok(_) => None,
            Err(e) if last => Some(e.to_string()),
            Err(e) => {
                warn!(request_id = %id, attempt, error = %e, "relay post failed; will retry");
                None
            }
        };
        let Some(detail) = failure else {
            return false;
        };

        let (failed, device) = {
            let mut shared = self.inner.shared.lock().await;
            (shared.queue.take_head_if(&id), shared.device_name.clone())
        };
        match failed {
            Some(request) => {
                warn!(request_id = %id, %detail, "giving up on relay request");
                let _ = request
                    .completion
                    .send(Err(RelayError::Undeliverable { device, detail }));
                true
            }
            None => false,
        }
    }

    /// Re-evaluate the head against the retry policy.
    async fn tick(&self) {
        let now = self.now_ms();
        let step = {
            let mut shared = self.inner.shared.lock().await;
            let Some(head) = shared.queue.head() else {
                return;
            };
            let ready = shared.state.is_ready();
            let connecting = shared.state.is_connecting();
            match self.inner.policy.evaluate(head, now) {
                Verdict::Wait => return,
                Verdict::Send | Verdict::Resend if ready => {
                    match (shared.session_id.clone(), shared.queue.record_send(now)) {
                        (Some(session), Some((id, content, attempt))) => {
                            Step::Transmit(session, id, content, attempt)
                        }
                        _ => return,
                    }
                }
                Verdict::Send => {
                    if connecting {
                        return;
                    }
                    Step::Reconnect
                }
                Verdict::Resend => {
                    // Count the attempt even though the transport is down so
                    // the request still expires.
                    shared.queue.record_send(now);
                    if connecting {
                        return;
                    }
                    Step::Reconnect
                }
                Verdict::Expire { receipted } => match shared.queue.advance() {
                    Some(request) => {
                        warn!(
                            request_id = %request.id,
                            receipted,
                            "relay request timed out"
                        );
                        Step::Expire(request.completion, shared.device_name.clone())
                    }
                    None => return,
                },
            }
        };

        match step {
            Step::Transmit(session, id, content, attempt) => {
                if self.transmit(session, id, content, attempt).await {
                    self.kick().await;
                }
            }
            Step::Expire(completion, device) => {
                let _ = completion.send(Err(RelayError::Timeout { device }));
                self.force_reconnect().await;
                self.kick().await;
            }
            Step::Reconnect => self.spawn_reconnect(),
        }
    }

    async fn force_reconnect(&self) {
        let actions = self
            .inner
            .shared
            .lock()
            .await
            .apply(Event::ForceReconnect);
        self.run_actions(actions).await;
    }

    // ===========================================
    // Inbound
    // ===========================================

    async fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::ConnectionId(id) => {
                self.inner.shared.lock().await.connection_id = Some(id);
            }
            TransportEvent::PeerConnected(info) => {
                info!("device attached to relay session");
                let mut shared = self.inner.shared.lock().await;
                shared.peer_connected = true;
                shared.peer_info = info;
            }
            TransportEvent::Receipt(id) => {
                if self.inner.shared.lock().await.queue.mark_receipt(&id) {
                    debug!(request_id = %id, "got receipt for request");
                } else {
                    debug!(request_id = %id, "got receipt for disposed request");
                }
            }
            TransportEvent::ResponseAvailable => {
                let Some(session) = self.session_id().await else {
                    return;
                };
                match self.inner.transport.fetch_response(&session).await {
                    Ok(envelope) => self.handle_envelope(envelope).await,
                    Err(e) => warn!(error = %e, "could not fetch relay response"),
                }
            }
            TransportEvent::Closed(reason) => {
                let actions = self
                    .inner
                    .shared
                    .lock()
                    .await
                    .apply(Event::TransportClosed { reason });
                self.run_actions(actions).await;
            }
        }
    }

    async fn handle_envelope(&self, envelope: RelayEnvelope) {
        let result = if envelope.format != ENVELOPE_FORMAT {
            Err(RelayError::Remote(ExceptionModel::new(
                format!("unknown data format: {}", envelope.format),
                "command_decrypt_error",
            )))
        } else {
            match envelope.kind {
                EnvelopeKind::Sync => {
                    let result = envelope
                        .content()
                        .ok_or_else(|| RelayError::Serialization("empty handshake".into()))
                        .and_then(|c| {
                            serde_json::from_str::<Value>(c)
                                .map_err(|e| RelayError::Serialization(e.to_string()))
                        });
                    if let Some(waiter) = self.inner.shared.lock().await.handshake.take() {
                        let _ = waiter.send(result);
                    }
                    return;
                }
                EnvelopeKind::Receipt => {
                    self.inner.shared.lock().await.queue.mark_receipt(&envelope.id);
                    return;
                }
                EnvelopeKind::Request => {
                    debug!(id = %envelope.id, "ignoring request envelope from relay");
                    return;
                }
                EnvelopeKind::Response => self.open_response(&envelope).await,
                EnvelopeKind::Error => Err(RelayError::Remote(error_exception(&envelope))),
            }
        };

        let request = self.inner.shared.lock().await.queue.take_head_if(&envelope.id);
        match request {
            Some(request) => {
                debug!(request_id = %envelope.id, "relay request completed");
                let _ = request.completion.send(result);
                self.kick().await;
            }
            // A response for a request that already timed out.
            None => debug!(request_id = %envelope.id, "got response for disposed request"),
        }
    }

    async fn open_response(&self, envelope: &RelayEnvelope) -> Result<Value, RelayError> {
        let content = envelope
            .content()
            .ok_or_else(|| RelayError::Serialization("empty response".into()))?;
        let plaintext = {
            let shared = self.inner.shared.lock().await;
            shared
                .key
                .as_ref()
                .ok_or(RelayError::NotPaired)?
                .decrypt_str(content)?
        };
        let response: AgentResponse = serde_json::from_str(&plaintext)
            .map_err(|e| RelayError::Serialization(e.to_string()))?;
        match response.into_result() {
            Ok(value) => Ok(value),
            Err(BridgeError::Agent(exception)) => Err(RelayError::Remote(exception)),
            Err(other) => Err(RelayError::Remote(other.to_exception())),
        }
    }
}

fn error_exception(envelope: &RelayEnvelope) -> ExceptionModel {
    envelope
        .content()
        .and_then(|c| serde_json::from_str::<ExceptionModel>(c).ok())
        .unwrap_or_else(|| {
            ExceptionModel::new("Cryptographic error on mobile native", "command_decrypt_error")
        })
}

impl std::fmt::Debug for RelayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayClient")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

fn reconnect_task(client: RelayClient) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move { client.reconnect().await })
}

async fn ticker_loop(inner: Weak<Inner>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        RelayClient { inner }.tick().await;
    }
}

async fn read_events(
    inner: Weak<Inner>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if inner.shared.lock().await.generation != generation {
            break;
        }
        RelayClient { inner }.handle_event(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MockRelayTransport, Responder};
    use serde_json::json;

    fn key() -> SymmetricKey {
        SymmetricKey::from_bytes([7u8; 32])
    }

    /// Plays a device that echoes the command name.
    fn echo_device(key: SymmetricKey) -> Responder {
        Arc::new(move |_: &SessionId, env: &RelayEnvelope| {
            if env.kind != EnvelopeKind::Request {
                return None;
            }
            let plain = key.decrypt_str(env.content()?).ok()?;
            let msg: Value = serde_json::from_str(&plain).ok()?;
            let reply = json!({
                "requestId": env.id,
                "success": true,
                "response": {"echo": msg["command"]},
            });
            let content = key.encrypt_str(&reply.to_string()).ok()?;
            Some(RelayEnvelope::new(EnvelopeKind::Response, env.id.clone(), Some(content)))
        })
    }

    fn paired(mock: &MockRelayTransport) -> RelayClient {
        RelayClient::for_device(
            Arc::new(mock.clone()),
            RelayClientConfig::default(),
            SessionId::new("session-1"),
            "Phone",
            key(),
        )
    }

    fn resume() -> ConnectMode {
        ConnectMode::Resume {
            session_id: SessionId::new("session-1"),
        }
    }

    fn request(id: &str) -> Value {
        json!({"requestId": id, "command": id, "domain": "localhost"})
    }

    // ===========================================
    // Connect
    // ===========================================

    #[tokio::test(start_paused = true)]
    async fn resume_connect_reassociates_session() {
        let mock = MockRelayTransport::new();
        let client = paired(&mock);

        let ticket = client.connect(resume()).await.unwrap();

        assert_eq!(ticket.session_id, SessionId::new("session-1"));
        assert!(client.is_ready().await);
        assert_eq!(
            mock.resumed_sessions(),
            vec![(SessionId::new("session-1"), "conn-1".to_string())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn pair_connect_registers_new_session() {
        let mock = MockRelayTransport::new();
        mock.set_session_ticket("s-new", "RAW-NEW");
        let client = RelayClient::new(Arc::new(mock.clone()), RelayClientConfig::default());

        let ticket = client.connect(ConnectMode::Pair).await.unwrap();

        assert_eq!(ticket.session_id, SessionId::new("s-new"));
        assert_eq!(ticket.session_id_raw, "RAW-NEW");
        assert_eq!(mock.created_sessions(), vec!["conn-1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_fails_without_connection_id() {
        let mock = MockRelayTransport::new();
        mock.set_connection_id(None);
        let client = paired(&mock);

        let err = client.connect(resume()).await.unwrap_err();

        assert!(matches!(err, RelayError::ConnectTimeout { .. }));
        assert!(!client.is_ready().await);
        assert_eq!(mock.close_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unattended_pairing_session_is_closed() {
        let mock = MockRelayTransport::new();
        let client = RelayClient::new(Arc::new(mock.clone()), RelayClientConfig::default());
        client.connect(ConnectMode::Pair).await.unwrap();

        tokio::time::sleep(Duration::from_secs(41)).await;

        assert!(!client.is_ready().await);
        assert!(!mock.is_open());
    }

    // ===========================================
    // Send / receive
    // ===========================================

    #[tokio::test(start_paused = true)]
    async fn send_returns_decrypted_response() {
        let mock = MockRelayTransport::new();
        mock.set_responder(echo_device(key()));
        let client = paired(&mock);
        client.connect(resume()).await.unwrap();

        let value = client.send(&request("listCertificates"), None).await.unwrap();

        assert_eq!(value, json!({"echo": "listCertificates"}));
        assert_eq!(client.pending_len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn send_while_disconnected_reconnects_first() {
        let mock = MockRelayTransport::new();
        mock.set_responder(echo_device(key()));
        let client = paired(&mock);

        let value = client.send(&request("getInfo"), None).await.unwrap();

        assert_eq!(value["echo"], "getInfo");
        assert_eq!(mock.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn send_without_key_is_rejected() {
        let mock = MockRelayTransport::new();
        let client = RelayClient::new(Arc::new(mock), RelayClientConfig::default());
        let err = client.send(&request("x"), None).await.unwrap_err();
        assert!(matches!(err, RelayError::NotPaired));
    }

    #[tokio::test(start_paused = true)]
    async fn fifo_single_flight() {
        let mock = MockRelayTransport::new();
        let client = paired(&mock);
        client.connect(resume()).await.unwrap();

        let mut handles = Vec::new();
        for id in ["a", "b", "c"] {
            let c = client.clone();
            handles.push(tokio::spawn(async move { c.send(&request(id), None).await }));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_secs(3)).await;

        // Only A is on the wire.
        assert_eq!(mock.posted_request_ids(), vec!["a".to_string()]);

        let reply = |id: &str| {
            let body = json!({"requestId": id, "success": true, "response": id});
            RelayEnvelope::new(
                EnvelopeKind::Response,
                id,
                Some(key().encrypt_str(&body.to_string()).unwrap()),
            )
        };

        mock.deliver_response(reply("a"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            mock.posted_request_ids(),
            vec!["a".to_string(), "b".to_string()]
        );

        mock.deliver_response(reply("b"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        mock.deliver_response(reply("c"));

        let results: Vec<Value> = futures_util::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .collect();
        assert_eq!(results, vec![json!("a"), json!("b"), json!("c")]);
    }

    #[tokio::test(start_paused = true)]
    async fn no_receipt_retries_then_times_out_and_reconnects() {
        let mock = MockRelayTransport::new();
        mock.set_auto_receipt(false);
        let client = paired(&mock);
        client.connect(resume()).await.unwrap();

        let err = client.send(&request("r"), None).await.unwrap_err();

        assert!(matches!(err, RelayError::Timeout { .. }));
        assert_eq!(mock.posted_request_ids(), vec!["r", "r", "r"]);
        assert!(mock.close_count() >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn response_timeout_after_receipt() {
        let mock = MockRelayTransport::new();
        let client = paired(&mock);
        client.connect(resume()).await.unwrap();

        let started = Instant::now();
        let err = client
            .send(&request("slow"), Some(Duration::from_secs(5)))
            .await
            .unwrap_err();

        assert!(matches!(err, RelayError::Timeout { .. }));
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(started.elapsed() < Duration::from_secs(10));
        // Receipted, so never resent.
        assert_eq!(mock.posted_request_ids(), vec!["slow"]);
    }

    #[tokio::test(start_paused = true)]
    async fn queue_advances_after_timeout() {
        let mock = MockRelayTransport::new();
        let client = paired(&mock);
        client.connect(resume()).await.unwrap();

        let c = client.clone();
        let first = tokio::spawn(async move {
            c.send(&request("first"), Some(Duration::from_secs(2))).await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        mock.set_responder(echo_device(key()));
        let second = client.send(&request("second"), None).await.unwrap();

        assert!(matches!(
            first.await.unwrap(),
            Err(RelayError::Timeout { .. })
        ));
        assert_eq!(second["echo"], "second");
    }

    #[tokio::test(start_paused = true)]
    async fn undelivered_on_last_attempt() {
        let mock = MockRelayTransport::new();
        mock.set_auto_receipt(false);
        mock.set_sent_to_device(false);
        let client = paired(&mock);
        client.connect(resume()).await.unwrap();

        let err = client.send(&request("u"), None).await.unwrap_err();

        assert!(matches!(err, RelayError::Undeliverable { .. }));
        assert_eq!(mock.posted_request_ids().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn device_error_envelope_carries_exception() {
        let mock = MockRelayTransport::new();
        mock.set_responder(Arc::new(|_: &SessionId, env: &RelayEnvelope| {
            let ex = json!({"message": "no", "complete": "no", "origin": "mobile", "code": "mobile_not_authorized"});
            Some(RelayEnvelope::new(
                EnvelopeKind::Error,
                env.id.clone(),
                Some(ex.to_string()),
            ))
        }));
        let client = paired(&mock);

        let err = client.send(&request("x"), None).await.unwrap_err();

        match err {
            RelayError::Remote(ex) => assert_eq!(ex.code, "mobile_not_authorized"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn empty_error_envelope_is_decrypt_error() {
        let mock = MockRelayTransport::new();
        mock.set_responder(Arc::new(|_: &SessionId, env: &RelayEnvelope| {
            Some(RelayEnvelope::new(EnvelopeKind::Error, env.id.clone(), None))
        }));
        let client = paired(&mock);

        let err: BridgeError = client.send(&request("x"), None).await.unwrap_err().into();
        assert_eq!(err.code(), "command_decrypt_error");
    }

    #[tokio::test(start_paused = true)]
    async fn tampered_response_is_integrity_error() {
        let mock = MockRelayTransport::new();
        mock.set_responder(Arc::new(|_: &SessionId, env: &RelayEnvelope| {
            let other = SymmetricKey::from_bytes([9u8; 32]);
            let content = other.encrypt_str(r#"{"success":true}"#).ok()?;
            Some(RelayEnvelope::new(EnvelopeKind::Response, env.id.clone(), Some(content)))
        }));
        let client = paired(&mock);

        let err = client.send(&request("x"), None).await.unwrap_err();
        assert!(matches!(err, RelayError::Crypto(CryptoError::Integrity)));
        assert_eq!(BridgeError::from(err).code(), "command_decrypt_error");
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_format_is_rejected() {
        let mock = MockRelayTransport::new();
        mock.set_responder(Arc::new(|_: &SessionId, env: &RelayEnvelope| {
            let mut reply = RelayEnvelope::new(EnvelopeKind::Response, env.id.clone(), None);
            reply.format = 3;
            Some(reply)
        }));
        let client = paired(&mock);

        let err = client.send(&request("x"), None).await.unwrap_err();
        assert!(matches!(err, RelayError::Remote(ref ex) if ex.code == "command_decrypt_error"));
    }

    // ===========================================
    // Handshake / stop
    // ===========================================

    #[tokio::test(start_paused = true)]
    async fn handshake_returns_peer_payload() {
        let mock = MockRelayTransport::new();
        mock.set_responder(Arc::new(|_: &SessionId, env: &RelayEnvelope| {
            (env.kind == EnvelopeKind::Sync).then(|| {
                RelayEnvelope::new(
                    EnvelopeKind::Sync,
                    env.id.clone(),
                    Some(r#"{"encodedXY":"abc"}"#.into()),
                )
            })
        }));
        let client = RelayClient::new(Arc::new(mock.clone()), RelayClientConfig::default());
        client.connect(ConnectMode::Pair).await.unwrap();

        let reply = client.send_handshake().await.unwrap();
        assert_eq!(reply["encodedXY"], "abc");
    }

    #[tokio::test(start_paused = true)]
    async fn stop_fails_outstanding_requests() {
        let mock = MockRelayTransport::new();
        let client = paired(&mock);
        client.connect(resume()).await.unwrap();

        let c = client.clone();
        let pending = tokio::spawn(async move { c.send(&request("p"), None).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        client.stop().await;

        assert!(matches!(pending.await.unwrap(), Err(RelayError::Stopped)));
        assert!(!mock.is_open());
    }

    #[test]
    fn relay_errors_map_to_bridge_codes() {
        let cases = [
            (
                RelayError::Timeout {
                    device: "d".into(),
                },
                "mobile_timeout",
            ),
            (
                RelayError::Undeliverable {
                    device: "d".into(),
                    detail: "x".into(),
                },
                "mobile_send_message",
            ),
            (
                RelayError::ConnectTimeout {
                    device: "d".into(),
                    detail: "x".into(),
                },
                "mobile_connect_timeout",
            ),
        ];
        for (err, code) in cases {
            assert_eq!(BridgeError::from(err).code(), code);
        }
    }
}
