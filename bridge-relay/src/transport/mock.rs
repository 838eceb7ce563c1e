//! Mock relay transport for testing.
//!
//! Captures posted envelopes, lets tests push relay events, and can play a
//! device through a [`Responder`] closure.

use super::{
    PostOutcome, RelayTransport, SessionTicket, TransportError, TransportEvent, TransportFactory,
};
use async_trait::async_trait;
use signbridge_types::{EnvelopeKind, RelayEnvelope, SessionId};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Plays the device side: given a posted envelope, optionally produce the
/// response envelope the relay will announce.
pub type Responder = Arc<dyn Fn(&SessionId, &RelayEnvelope) -> Option<RelayEnvelope> + Send + Sync>;

/// Mock relay transport.
#[derive(Default)]
pub struct MockRelayTransport {
    inner: Arc<Mutex<MockInner>>,
}

struct MockInner {
    events: Option<mpsc::UnboundedSender<TransportEvent>>,
    open: bool,
    open_count: usize,
    close_count: usize,
    connection_id: Option<String>,
    ticket: SessionTicket,
    peer_on_create: Option<Option<serde_json::Value>>,
    auto_receipt: bool,
    sent_to_device: bool,
    responder: Option<Responder>,
    posted: Vec<(SessionId, RelayEnvelope)>,
    responses: VecDeque<RelayEnvelope>,
    created: Vec<String>,
    resumed: Vec<(SessionId, String)>,
    fail_next_open: Option<String>,
    fail_next_post: Option<String>,
    fail_next_resume: Option<String>,
}

impl Default for MockInner {
    fn default() -> Self {
        Self {
            events: None,
            open: false,
            open_count: 0,
            close_count: 0,
            connection_id: Some("conn-1".into()),
            ticket: SessionTicket {
                session_id: SessionId::new("session-1"),
                session_id_raw: "raw-session-1".into(),
            },
            peer_on_create: None,
            auto_receipt: true,
            sent_to_device: true,
            responder: None,
            posted: Vec::new(),
            responses: VecDeque::new(),
            created: Vec::new(),
            resumed: Vec::new(),
            fail_next_open: None,
            fail_next_post: None,
            fail_next_resume: None,
        }
    }
}

impl MockRelayTransport {
    /// Create a new mock transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Connection id announced on open; `None` never announces one.
    pub fn set_connection_id(&self, id: Option<&str>) {
        self.inner.lock().unwrap().connection_id = id.map(str::to_string);
    }

    /// Ticket returned by `create_session`.
    pub fn set_session_ticket(&self, session_id: &str, raw: &str) {
        self.inner.lock().unwrap().ticket = SessionTicket {
            session_id: SessionId::new(session_id),
            session_id_raw: raw.to_string(),
        };
    }

    /// Announce the peer right after `create_session`.
    pub fn set_peer_on_create(&self, info: Option<serde_json::Value>) {
        self.inner.lock().unwrap().peer_on_create = Some(info);
    }

    /// Whether posted requests are receipted immediately.
    pub fn set_auto_receipt(&self, enabled: bool) {
        self.inner.lock().unwrap().auto_receipt = enabled;
    }

    /// Value of `sentToDevice` returned by `post`.
    pub fn set_sent_to_device(&self, sent: bool) {
        self.inner.lock().unwrap().sent_to_device = sent;
    }

    /// Install a device simulator.
    pub fn set_responder(&self, responder: Responder) {
        self.inner.lock().unwrap().responder = Some(responder);
    }

    /// Cause the next open() to fail with the given error.
    pub fn fail_next_open(&self, error: &str) {
        self.inner.lock().unwrap().fail_next_open = Some(error.to_string());
    }

    /// Cause the next post() to fail with the given error.
    pub fn fail_next_post(&self, error: &str) {
        self.inner.lock().unwrap().fail_next_post = Some(error.to_string());
    }

    /// Cause the next resume_session() to fail with the given error.
    pub fn fail_next_resume(&self, error: &str) {
        self.inner.lock().unwrap().fail_next_resume = Some(error.to_string());
    }

    /// Push an event as if the relay sent it.
    pub fn emit(&self, event: TransportEvent) {
        let inner = self.inner.lock().unwrap();
        if let Some(events) = &inner.events {
            let _ = events.send(event);
        }
    }

    /// Queue a response envelope and announce it.
    pub fn deliver_response(&self, envelope: RelayEnvelope) {
        let mut inner = self.inner.lock().unwrap();
        inner.responses.push_back(envelope);
        if let Some(events) = &inner.events {
            let _ = events.send(TransportEvent::ResponseAvailable);
        }
    }

    /// Announce that the peer device attached.
    pub fn connect_peer(&self, info: Option<serde_json::Value>) {
        self.emit(TransportEvent::PeerConnected(info));
    }

    /// Simulate the relay dropping the push channel.
    pub fn drop_connection(&self, reason: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(events) = inner.events.take() {
            let _ = events.send(TransportEvent::Closed(reason.to_string()));
        }
        inner.open = false;
    }

    /// Every envelope posted, in order.
    pub fn posted(&self) -> Vec<RelayEnvelope> {
        let inner = self.inner.lock().unwrap();
        inner.posted.iter().map(|(_, e)| e.clone()).collect()
    }

    /// Ids of posted request envelopes, in order (resends repeat).
    pub fn posted_request_ids(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .posted
            .iter()
            .filter(|(_, e)| e.kind == EnvelopeKind::Request)
            .map(|(_, e)| e.id.clone())
            .collect()
    }

    /// Connection ids passed to `create_session`.
    pub fn created_sessions(&self) -> Vec<String> {
        self.inner.lock().unwrap().created.clone()
    }

    /// `(session, connection)` pairs passed to `resume_session`.
    pub fn resumed_sessions(&self) -> Vec<(SessionId, String)> {
        self.inner.lock().unwrap().resumed.clone()
    }

    /// Whether the push channel is open.
    pub fn is_open(&self) -> bool {
        self.inner.lock().unwrap().open
    }

    /// Times `open` succeeded.
    pub fn open_count(&self) -> usize {
        self.inner.lock().unwrap().open_count
    }

    /// Times `close` was called.
    pub fn close_count(&self) -> usize {
        self.inner.lock().unwrap().close_count
    }
}

impl Clone for MockRelayTransport {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for MockRelayTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockRelayTransport")
            .field("open", &self.is_open())
            .finish()
    }
}

#[async_trait]
impl RelayTransport for MockRelayTransport {
    async fn open(
        &self,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();

        // Check for forced failure
        if let Some(error) = inner.fail_next_open.take() {
            return Err(TransportError::ConnectionFailed(error));
        }

        if let Some(id) = inner.connection_id.clone() {
            let _ = events.send(TransportEvent::ConnectionId(id));
        }
        inner.events = Some(events);
        inner.open = true;
        inner.open_count += 1;
        Ok(())
    }

    async fn create_session(&self, connection_id: &str) -> Result<SessionTicket, TransportError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.open {
            return Err(TransportError::NotConnected);
        }
        inner.created.push(connection_id.to_string());
        if let Some(info) = inner.peer_on_create.clone() {
            if let Some(events) = &inner.events {
                let _ = events.send(TransportEvent::PeerConnected(info));
            }
        }
        Ok(inner.ticket.clone())
    }

    async fn resume_session(
        &self,
        session_id: &SessionId,
        connection_id: &str,
    ) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.open {
            return Err(TransportError::NotConnected);
        }
        if let Some(error) = inner.fail_next_resume.take() {
            return Err(TransportError::CallFailed(error));
        }
        inner
            .resumed
            .push((session_id.clone(), connection_id.to_string()));
        Ok(())
    }

    async fn post(
        &self,
        session_id: &SessionId,
        envelope: &RelayEnvelope,
    ) -> Result<PostOutcome, TransportError> {
        let (responder, outcome) = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.open {
                return Err(TransportError::NotConnected);
            }
            if let Some(error) = inner.fail_next_post.take() {
                return Err(TransportError::CallFailed(error));
            }
            inner.posted.push((session_id.clone(), envelope.clone()));
            if inner.auto_receipt && envelope.kind == EnvelopeKind::Request {
                if let Some(events) = &inner.events {
                    let _ = events.send(TransportEvent::Receipt(envelope.id.clone()));
                }
            }
            (
                inner.responder.clone(),
                PostOutcome {
                    sent_to_device: inner.sent_to_device,
                },
            )
        };

        // Run the simulator without holding the lock; it may call back in.
        if let Some(responder) = responder {
            if let Some(reply) = responder(session_id, envelope) {
                self.deliver_response(reply);
            }
        }
        Ok(outcome)
    }

    async fn fetch_response(&self, _session_id: &SessionId) -> Result<RelayEnvelope, TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.responses.pop_front().ok_or(TransportError::NoResponse)
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.events = None;
        inner.open = false;
        inner.close_count += 1;
        Ok(())
    }
}

/// Factory handing out [`MockRelayTransport`]s and remembering them.
#[derive(Clone, Default)]
pub struct MockTransportFactory {
    created: Arc<Mutex<Vec<MockRelayTransport>>>,
    setup: Option<Arc<dyn Fn(&MockRelayTransport) + Send + Sync>>,
}

impl MockTransportFactory {
    /// Create a factory producing default mocks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a factory that runs `setup` on every new mock.
    pub fn with_setup(setup: impl Fn(&MockRelayTransport) + Send + Sync + 'static) -> Self {
        Self {
            created: Arc::default(),
            setup: Some(Arc::new(setup)),
        }
    }

    /// Every transport created so far.
    pub fn transports(&self) -> Vec<MockRelayTransport> {
        self.created.lock().unwrap().clone()
    }

    /// The most recently created transport.
    pub fn last(&self) -> Option<MockRelayTransport> {
        self.created.lock().unwrap().last().cloned()
    }
}

impl TransportFactory for MockTransportFactory {
    fn create(&self) -> Arc<dyn RelayTransport> {
        let mock = MockRelayTransport::new();
        if let Some(setup) = &self.setup {
            setup(&mock);
        }
        self.created.lock().unwrap().push(mock.clone());
        Arc::new(mock)
    }
}

impl std::fmt::Debug for MockTransportFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransportFactory")
            .field("created", &self.created.lock().map(|c| c.len()).unwrap_or(0))
            .finish()
    }
}
