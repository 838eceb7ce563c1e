//! Relay transport abstraction.
//!
//! This module provides a pluggable transport layer that abstracts the
//! relay hub: a push channel that announces events (connection id, peer
//! connected, response available, receipts) plus request/response calls
//! that register sessions and move envelopes.
//!
//! # Design
//!
//! - `open()` starts the push channel; events arrive on the supplied sender
//! - `create_session()` / `resume_session()` bind a session to the connection
//! - `post()` hands a request envelope to the relay for delivery
//! - `fetch_response()` collects the envelope announced by `ResponseAvailable`
//! - `close()` tears the push channel down
//!
//! `HubRelayTransport` talks to the cloud relay; `MockRelayTransport` is
//! scripted for tests.
//!
//! # Example
//!
//! ```ignore
//! let transport = MockRelayTransport::new();
//! let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
//! transport.open(tx).await?;
//! let ticket = transport.create_session("conn-1").await?;
//! transport.post(&ticket.session_id, &envelope).await?;
//! ```

mod hub;
mod mock;

pub use hub::{HubRelayTransport, HubTransportConfig, HubTransportFactory, RECORD_SEPARATOR};
pub use mock::{MockRelayTransport, MockTransportFactory, Responder};

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use signbridge_types::{RelayEnvelope, SessionId};
use thiserror::Error;
use tokio::sync::mpsc;

/// Transport errors.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The push channel could not be opened.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Not connected.
    #[error("not connected")]
    NotConnected,

    /// An HTTP-style call to the relay failed.
    #[error("relay call failed: {0}")]
    CallFailed(String),

    /// No response was waiting for the session.
    #[error("no response available")]
    NoResponse,
}

/// Push events from the relay.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The relay assigned a connection id.
    ConnectionId(String),
    /// The peer device attached to the session.
    PeerConnected(Option<Value>),
    /// A response envelope is waiting to be fetched.
    ResponseAvailable,
    /// The relay delivered the request with this id.
    Receipt(String),
    /// The push channel closed.
    Closed(String),
}

/// Ids returned when a new session is registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionTicket {
    /// Session id used for every later call.
    pub session_id: SessionId,
    /// Raw form shown to the peer during pairing.
    pub session_id_raw: String,
}

/// Result of posting a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostOutcome {
    /// Whether the relay pushed the request to the device right away.
    #[serde(default)]
    pub sent_to_device: bool,
}

/// Transport trait for one relay connection.
///
/// Implementations handle the underlying mechanism (hub websocket plus
/// REST calls, mock, etc).
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Open the push channel. Events are delivered to `events` until the
    /// channel closes or `close()` is called.
    async fn open(&self, events: mpsc::UnboundedSender<TransportEvent>)
        -> Result<(), TransportError>;

    /// Register a new session bound to `connection_id`.
    async fn create_session(&self, connection_id: &str) -> Result<SessionTicket, TransportError>;

    /// Re-associate `session_id` with `connection_id`.
    async fn resume_session(
        &self,
        session_id: &SessionId,
        connection_id: &str,
    ) -> Result<(), TransportError>;

    /// Post a request envelope for delivery.
    async fn post(
        &self,
        session_id: &SessionId,
        envelope: &RelayEnvelope,
    ) -> Result<PostOutcome, TransportError>;

    /// Fetch the response envelope announced for `session_id`.
    async fn fetch_response(&self, session_id: &SessionId) -> Result<RelayEnvelope, TransportError>;

    /// Close the push channel.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Creates one transport per relay session.
pub trait TransportFactory: Send + Sync {
    /// A fresh, unopened transport.
    fn create(&self) -> Arc<dyn RelayTransport>;
}
