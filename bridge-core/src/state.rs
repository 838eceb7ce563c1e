//! Relay connection state machine.
//!
//! This module provides a pure, side-effect-free state machine for the
//! lifecycle of one relay session. The state machine takes events as input
//! and produces a new state plus a list of actions to execute.
//!
//! The actual I/O (opening the transport, registering the session) is
//! performed by `signbridge-relay`, not by this module.

use signbridge_types::SessionId;

/// How a connection attaches to the relay once the transport is open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectMode {
    /// Register a brand new session for pairing.
    Pair,
    /// Re-associate an existing session with the new connection.
    Resume {
        /// The session being resumed.
        session_id: SessionId,
    },
}

/// Relay session state - NO I/O, just state transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayState {
    /// No transport.
    Disconnected,
    /// Transport opening, waiting for the relay to assign a connection id.
    Connecting {
        /// How to attach once connected.
        mode: ConnectMode,
    },
    /// Connection id known, session registration in progress.
    Connected {
        /// How to attach.
        mode: ConnectMode,
        /// Relay-assigned connection id.
        connection_id: String,
    },
    /// Session established; requests may be transmitted.
    Ready {
        /// The established session.
        session_id: SessionId,
    },
}

impl RelayState {
    /// Create a new state machine in the Disconnected state.
    pub fn new() -> Self {
        Self::Disconnected
    }

    /// Process an event and return the new state plus actions to execute.
    ///
    /// This is a pure function. The caller is responsible for executing the
    /// returned actions.
    pub fn on_event(self, event: Event) -> (Self, Vec<Action>) {
        match (self, event) {
            // From Disconnected
            (Self::Disconnected, Event::ConnectRequested { mode }) => {
                (Self::Connecting { mode }, vec![Action::OpenTransport])
            }

            // From Connecting
            (Self::Connecting { mode }, Event::ConnectionIdReceived { connection_id }) => {
                let action = match &mode {
                    ConnectMode::Pair => Action::CreateSession {
                        connection_id: connection_id.clone(),
                    },
                    ConnectMode::Resume { session_id } => Action::ResumeSession {
                        session_id: session_id.clone(),
                        connection_id: connection_id.clone(),
                    },
                };
                (
                    Self::Connected {
                        mode,
                        connection_id,
                    },
                    vec![action],
                )
            }

            // From Connected
            (Self::Connected { .. }, Event::SessionEstablished { session_id }) => (
                Self::Ready {
                    session_id: session_id.clone(),
                },
                vec![
                    Action::Emit(RelayEvent::Ready { session_id }),
                    Action::StartSending,
                ],
            ),

            // Failures while connecting
            (
                Self::Connecting { .. } | Self::Connected { .. },
                Event::ConnectFailed { error },
            ) => (
                Self::Disconnected,
                vec![
                    Action::CloseTransport,
                    Action::Emit(RelayEvent::ConnectFailed { error }),
                ],
            ),

            // Transport loss from any live state
            (Self::Disconnected, Event::TransportClosed { .. }) => (Self::Disconnected, vec![]),
            (_, Event::TransportClosed { reason }) => (
                Self::Disconnected,
                vec![Action::Emit(RelayEvent::Disconnected { reason })],
            ),

            // A timed-out request forces a fresh transport on the next send
            (Self::Ready { .. }, Event::ForceReconnect) => (
                Self::Disconnected,
                vec![
                    Action::CloseTransport,
                    Action::Emit(RelayEvent::Disconnected {
                        reason: "forced reconnect after timeout".into(),
                    }),
                ],
            ),

            (Self::Disconnected, Event::StopRequested) => (Self::Disconnected, vec![]),
            (_, Event::StopRequested) => (Self::Disconnected, vec![Action::CloseTransport]),

            // Invalid transitions - stay in current state
            (state, _) => (state, vec![]),
        }
    }

    /// Whether requests may be transmitted.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }

    /// Whether a connection attempt is in progress.
    pub fn is_connecting(&self) -> bool {
        matches!(self, Self::Connecting { .. } | Self::Connected { .. })
    }

    /// The established session id, if ready.
    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            Self::Ready { session_id } => Some(session_id),
            _ => None,
        }
    }
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new()
    }
}

/// Events that can occur in the relay session lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Caller asked to connect.
    ConnectRequested {
        /// How to attach.
        mode: ConnectMode,
    },
    /// Relay assigned a connection id.
    ConnectionIdReceived {
        /// The assigned id.
        connection_id: String,
    },
    /// Session registration or resumption succeeded.
    SessionEstablished {
        /// The session id.
        session_id: SessionId,
    },
    /// Connecting failed or timed out.
    ConnectFailed {
        /// Error message describing the failure.
        error: String,
    },
    /// The transport closed.
    TransportClosed {
        /// Reason reported by the transport.
        reason: String,
    },
    /// A request expired; drop the transport so the next send reconnects.
    ForceReconnect,
    /// Caller asked to stop.
    StopRequested,
}

/// Actions to be executed by the relay client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Open the transport to the relay.
    OpenTransport,
    /// Register a new session bound to the connection.
    CreateSession {
        /// Relay-assigned connection id.
        connection_id: String,
    },
    /// Re-associate an existing session with the connection.
    ResumeSession {
        /// Session to resume.
        session_id: SessionId,
        /// Relay-assigned connection id.
        connection_id: String,
    },
    /// Close the transport.
    CloseTransport,
    /// Begin transmitting the head of the pending queue.
    StartSending,
    /// Emit an event to observers.
    Emit(RelayEvent),
}

/// Events emitted to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// Session ready.
    Ready {
        /// The session id.
        session_id: SessionId,
    },
    /// Connecting failed.
    ConnectFailed {
        /// Error message describing the failure.
        error: String,
    },
    /// Transport lost.
    Disconnected {
        /// Reason for disconnection.
        reason: String,
    },
}
