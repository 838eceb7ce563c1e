//! Mock agent connector for testing.
//!
//! Records every message sent to each link, answers through an optional
//! [`AgentHandler`], and lets tests push messages or close a link.

use super::{AgentConnector, AgentError, AgentEvent, AgentLink};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Plays the agent: given a message, optionally produce the reply.
pub type AgentHandler = Arc<dyn Fn(&Value) -> Option<Value> + Send + Sync>;

/// Mock agent connector. Each `connect()` is a new agent instance.
#[derive(Clone, Default)]
pub struct MockAgentConnector {
    inner: Arc<Mutex<MockInner>>,
}

#[derive(Default)]
struct MockInner {
    handler: Option<AgentHandler>,
    fail_next_connect: Option<String>,
    delay_next_connect: Option<Duration>,
    links: Vec<Option<mpsc::UnboundedSender<AgentEvent>>>,
    received: Vec<(usize, Value)>,
}

/// A success reply to `message`.
pub fn reply_ok(message: &Value, response: Value) -> Value {
    json!({
        "requestId": message["requestId"],
        "success": true,
        "response": response,
    })
}

/// A failure reply to `message`.
pub fn reply_error(message: &Value, text: &str, code: &str) -> Value {
    json!({
        "requestId": message["requestId"],
        "success": false,
        "exception": {"message": text, "complete": text, "origin": "native", "code": code},
    })
}

impl MockAgentConnector {
    /// Create a connector with no handler; messages are only recorded.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a connector that answers through `handler`.
    pub fn with_handler(handler: impl Fn(&Value) -> Option<Value> + Send + Sync + 'static) -> Self {
        let mock = Self::new();
        mock.set_handler(handler);
        mock
    }

    /// Replace the handler used by every link.
    pub fn set_handler(&self, handler: impl Fn(&Value) -> Option<Value> + Send + Sync + 'static) {
        self.inner.lock().unwrap().handler = Some(Arc::new(handler));
    }

    /// Cause the next connect() to fail with the given error.
    pub fn fail_next_connect(&self, error: &str) {
        self.inner.lock().unwrap().fail_next_connect = Some(error.to_string());
    }

    /// Make the next connect() take `delay` before the agent starts.
    pub fn delay_next_connect(&self, delay: Duration) {
        self.inner.lock().unwrap().delay_next_connect = Some(delay);
    }

    /// Number of agent instances started.
    pub fn connect_count(&self) -> usize {
        self.inner.lock().unwrap().links.len()
    }

    /// Every message received, across links, in arrival order.
    pub fn received(&self) -> Vec<Value> {
        self.inner
            .lock()
            .unwrap()
            .received
            .iter()
            .map(|(_, m)| m.clone())
            .collect()
    }

    /// Messages received on one link.
    pub fn received_on(&self, link: usize) -> Vec<Value> {
        self.inner
            .lock()
            .unwrap()
            .received
            .iter()
            .filter(|(l, _)| *l == link)
            .map(|(_, m)| m.clone())
            .collect()
    }

    /// Command names received, in arrival order.
    pub fn commands(&self) -> Vec<String> {
        self.received()
            .iter()
            .filter_map(|m| m["command"].as_str().map(str::to_string))
            .collect()
    }

    /// Push a message from the agent on `link`.
    pub fn send(&self, link: usize, message: Value) {
        let inner = self.inner.lock().unwrap();
        if let Some(Some(tx)) = inner.links.get(link) {
            let _ = tx.send(AgentEvent::Message(message));
        }
    }

    /// Simulate the agent on `link` going away.
    pub fn close(&self, link: usize, reason: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(slot) = inner.links.get_mut(link) {
            if let Some(tx) = slot.take() {
                let _ = tx.send(AgentEvent::Closed(reason.to_string()));
            }
        }
    }

    /// Wait until at least `count` messages have been received.
    pub async fn wait_for_messages(&self, count: usize) {
        while self.inner.lock().unwrap().received.len() < count {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

#[async_trait]
impl AgentConnector for MockAgentConnector {
    async fn connect(&self) -> Result<AgentLink, AgentError> {
        let delay = self.inner.lock().unwrap().delay_next_connect.take();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Value>();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let link = {
            let mut inner = self.inner.lock().unwrap();
            if let Some(error) = inner.fail_next_connect.take() {
                return Err(AgentError::SpawnFailed(error));
            }
            inner.links.push(Some(in_tx));
            inner.links.len() - 1
        };

        let shared = self.inner.clone();
        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let (handler, tx) = {
                    let mut inner = shared.lock().unwrap();
                    inner.received.push((link, message.clone()));
                    (inner.handler.clone(), inner.links[link].clone())
                };
                let reply = handler.and_then(|h| h(&message));
                if let (Some(reply), Some(tx)) = (reply, tx) {
                    let _ = tx.send(AgentEvent::Message(reply));
                }
            }
        });

        Ok(AgentLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
