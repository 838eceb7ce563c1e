//! Local signing agent connectors.
//!
//! A connector opens one duplex link to the agent. Messages are JSON
//! values; the link reports the agent going away as a final
//! [`AgentEvent::Closed`].
//!
//! # Design
//!
//! - `connect()` starts a fresh agent instance and returns its link
//! - Sending on `outbound` hands a message to the agent
//! - `inbound` yields every agent message, then `Closed` exactly once
//! - Dropping `outbound` lets the agent exit
//!
//! # Example
//!
//! ```ignore
//! let connector = ProcessAgentConnector::new(&config.agent);
//! let mut link = connector.connect().await?;
//! link.outbound.send(json!({"command": "getInfo"}))?;
//! while let Some(event) = link.inbound.recv().await { /* ... */ }
//! ```

mod framing;
mod mock;
mod process;

pub use framing::{read_frame, write_frame, MAX_FRAME_SIZE};
pub use mock::{reply_error, reply_ok, AgentHandler, MockAgentConnector};
pub use process::ProcessAgentConnector;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

/// Agent connection errors.
#[derive(Debug, Clone, Error)]
pub enum AgentError {
    /// The agent could not be started.
    #[error("agent failed to start: {0}")]
    SpawnFailed(String),
}

/// Events from the agent.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// A message from the agent.
    Message(Value),
    /// The agent went away.
    Closed(String),
}

/// One open link to an agent instance.
#[derive(Debug)]
pub struct AgentLink {
    /// Messages to the agent.
    pub outbound: mpsc::UnboundedSender<Value>,
    /// Messages from the agent.
    pub inbound: mpsc::UnboundedReceiver<AgentEvent>,
}

/// Opens links to the local signing agent.
///
/// Implementations handle the underlying mechanism (child process with
/// length-prefixed stdio, mock, etc).
#[async_trait]
pub trait AgentConnector: Send + Sync {
    /// Start an agent instance.
    async fn connect(&self) -> Result<AgentLink, AgentError>;
}
