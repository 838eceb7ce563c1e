//! Native channel - one duplex link to the local agent plus its
//! correlation table.
//!
//! Any number of requests may be outstanding; responses complete them in
//! whatever order the agent answers, matched by request id. When the link
//! drops, every outstanding request on the channel, whichever session
//! issued it, fails with `NativeDisconnected`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use signbridge_core::{CorrelationError, Correlator};
use signbridge_types::{AgentRequest, AgentResponse, BridgeError, ClientId};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::agent::{AgentConnector, AgentEvent};

/// Failure text used when the agent goes away without a reason.
pub const NO_RESPONSE: &str = "Did not receive response from native application";

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

type Completion = oneshot::Sender<Result<AgentResponse, BridgeError>>;

struct ChannelState {
    pending: Correlator<Completion>,
    closed: Option<String>,
    retired: bool,
}

/// A link to one agent instance.
pub struct NativeChannel {
    id: u64,
    outbound: mpsc::UnboundedSender<Value>,
    state: Arc<Mutex<ChannelState>>,
}

fn lock(state: &Mutex<ChannelState>) -> MutexGuard<'_, ChannelState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl NativeChannel {
    /// Start an agent instance and begin reading its messages.
    pub async fn open(connector: &dyn AgentConnector) -> Result<Arc<Self>, BridgeError> {
        let link = connector
            .connect()
            .await
            .map_err(|e| BridgeError::NativeConnectFailed(e.to_string()))?;
        let id = NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(Mutex::new(ChannelState {
            pending: Correlator::new(),
            closed: None,
            retired: false,
        }));
        tokio::spawn(read_loop(id, state.clone(), link.inbound));
        info!(channel = id, "native channel opened");

        Ok(Arc::new(Self {
            id,
            outbound: link.outbound,
            state,
        }))
    }

    /// Process-unique channel identity.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the channel can still carry requests.
    pub fn is_usable(&self) -> bool {
        let state = lock(&self.state);
        state.closed.is_none() && !state.retired
    }

    /// Number of outstanding requests.
    pub fn pending_len(&self) -> usize {
        lock(&self.state).pending.len()
    }

    /// Send a request on behalf of `client` and wait for its response.
    pub async fn call(
        &self,
        client: ClientId,
        request: &AgentRequest,
    ) -> Result<AgentResponse, BridgeError> {
        let message =
            serde_json::to_value(request).map_err(|e| BridgeError::Internal(e.to_string()))?;
        let (tx, rx) = oneshot::channel();
        {
            let mut state = lock(&self.state);
            if let Some(reason) = &state.closed {
                return Err(BridgeError::NativeDisconnected {
                    reason: reason.clone(),
                });
            }
            state
                .pending
                .register(request.request_id.clone(), client, tx)
                .map_err(|e| BridgeError::Internal(e.to_string()))?;
        }

        if self.outbound.send(message).is_err() {
            lock(&self.state).pending.remove(&request.request_id);
            return Err(BridgeError::NativeDisconnected {
                reason: NO_RESPONSE.to_string(),
            });
        }
        debug!(
            channel = self.id,
            request_id = %request.request_id,
            command = %request.command,
            "request sent to agent"
        );

        rx.await.unwrap_or_else(|_| {
            Err(BridgeError::NativeDisconnected {
                reason: NO_RESPONSE.to_string(),
            })
        })
    }

    /// Send a control message that expects no answer and stop correlating.
    ///
    /// Used for the shutdown message: the agent exits after handling it and
    /// whatever it says on the way out is ignored.
    pub fn retire(&self, message: Value) {
        lock(&self.state).retired = true;
        if self.outbound.send(message).is_err() {
            debug!(channel = self.id, "agent already gone");
        }
        info!(channel = self.id, "native channel retired");
    }

    /// Drop the callbacks of a session that went away.
    pub fn forget_client(&self, client: ClientId) {
        let dropped = lock(&self.state).pending.remove_client(client);
        if !dropped.is_empty() {
            debug!(channel = self.id, %client, count = dropped.len(), "dropped callbacks of departed session");
        }
    }
}

impl std::fmt::Debug for NativeChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("NativeChannel")
            .field("id", &self.id)
            .field("pending", &state.pending.len())
            .field("closed", &state.closed)
            .field("retired", &state.retired)
            .finish()
    }
}

async fn read_loop(
    id: u64,
    state: Arc<Mutex<ChannelState>>,
    mut inbound: mpsc::UnboundedReceiver<AgentEvent>,
) {
    let reason = loop {
        match inbound.recv().await {
            Some(AgentEvent::Message(message)) => {
                if let Err(error) = dispatch(id, &state, message) {
                    break error;
                }
            }
            Some(AgentEvent::Closed(reason)) => {
                break BridgeError::NativeDisconnected {
                    reason: if reason.is_empty() { NO_RESPONSE.to_string() } else { reason },
                }
            }
            None => {
                break BridgeError::NativeDisconnected {
                    reason: NO_RESPONSE.to_string(),
                }
            }
        }
    };

    let drained = {
        let mut state = lock(&state);
        state.closed = Some(reason.to_string());
        state.pending.drain()
    };
    if !drained.is_empty() {
        warn!(channel = id, count = drained.len(), error = %reason, "failing outstanding requests");
    }
    for (_, _, completion) in drained {
        let _ = completion.send(Err(reason.clone()));
    }
    info!(channel = id, "native channel closed");
}

/// Route one agent message. An error ends the channel.
fn dispatch(id: u64, state: &Mutex<ChannelState>, message: Value) -> Result<(), BridgeError> {
    let response = match AgentResponse::parse(message) {
        Ok(response) => response,
        Err(e) => {
            warn!(channel = id, error = %e, "unparseable agent message");
            return Ok(());
        }
    };

    let mut state = lock(state);
    if state.retired {
        debug!(channel = id, "ignoring message on retired channel");
        return Ok(());
    }
    let resolved = state.pending.resolve(&response);
    match resolved {
        Ok((request_id, _, completion)) => {
            drop(state);
            debug!(channel = id, %request_id, success = response.success, "agent responded");
            let _ = completion.send(Ok(response));
            Ok(())
        }
        Err(CorrelationError::Unknown(request_id)) => {
            warn!(channel = id, %request_id, "response for unknown request");
            Ok(())
        }
        Err(CorrelationError::Ambiguous { outstanding }) => {
            error!(channel = id, outstanding, "cannot correlate response without requestId");
            Err(BridgeError::ProtocolCorrelation { outstanding })
        }
        Err(e) => {
            warn!(channel = id, error = %e, "correlation failure");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{reply_ok, MockAgentConnector};
    use serde_json::json;
    use signbridge_types::RequestId;

    fn request(command: &str) -> AgentRequest {
        AgentRequest {
            request_id: RequestId::new(),
            license: None,
            domain: "example.com".into(),
            command: command.into(),
            request: json!({}),
            language: "en".into(),
            keep_alive: true,
            trace: false,
            pkcs11_modules: vec![],
            require_license: false,
        }
    }

    #[tokio::test]
    async fn response_resolves_matching_call() {
        let mock = MockAgentConnector::with_handler(|m| Some(reply_ok(m, m["command"].clone())));
        let channel = NativeChannel::open(&mock).await.unwrap();

        let response = channel.call(ClientId::new(1), &request("getInfo")).await.unwrap();

        assert_eq!(response.into_result().unwrap(), json!("getInfo"));
        assert_eq!(channel.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_order_responses_reach_their_callers() {
        let mock = MockAgentConnector::new();
        let channel = NativeChannel::open(&mock).await.unwrap();

        let calls: Vec<_> = (0..5)
            .map(|i| {
                let channel = channel.clone();
                tokio::spawn(async move {
                    channel
                        .call(ClientId::new(i), &request(&format!("cmd-{i}")))
                        .await
                })
            })
            .collect();
        mock.wait_for_messages(5).await;

        for message in mock.received().iter().rev() {
            mock.send(0, reply_ok(message, message["command"].clone()));
        }

        for (i, call) in calls.into_iter().enumerate() {
            let value = call.await.unwrap().unwrap().into_result().unwrap();
            assert_eq!(value, json!(format!("cmd-{i}")));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn single_outstanding_call_accepts_response_without_id() {
        let mock = MockAgentConnector::new();
        let channel = NativeChannel::open(&mock).await.unwrap();
        let call = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.call(ClientId::new(1), &request("getInfo")).await })
        };
        mock.wait_for_messages(1).await;

        mock.send(0, json!({"success": true, "response": 7}));

        let value = call.await.unwrap().unwrap().into_result().unwrap();
        assert_eq!(value, json!(7));
        assert!(channel.is_usable());
    }

    #[tokio::test(start_paused = true)]
    async fn ambiguous_response_fails_every_call_and_closes() {
        let mock = MockAgentConnector::new();
        let channel = NativeChannel::open(&mock).await.unwrap();
        let calls: Vec<_> = (0..2)
            .map(|i| {
                let channel = channel.clone();
                tokio::spawn(async move { channel.call(ClientId::new(i), &request("x")).await })
            })
            .collect();
        mock.wait_for_messages(2).await;

        mock.send(0, json!({"success": true, "response": 1}));

        for call in calls {
            let err = call.await.unwrap().unwrap_err();
            assert_eq!(err.code(), "protocol_correlation_error");
        }
        assert!(!channel.is_usable());
    }

    #[tokio::test(start_paused = true)]
    async fn response_without_id_while_idle_closes_channel() {
        let mock = MockAgentConnector::new();
        let channel = NativeChannel::open(&mock).await.unwrap();

        mock.send(0, json!({"success": true, "response": 1}));
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        assert!(!channel.is_usable());
        let err = channel.call(ClientId::new(1), &request("x")).await.unwrap_err();
        assert_eq!(err.code(), "native_disconnected");
        assert!(err.to_string().contains("without requestId while 0"));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_fails_outstanding_calls() {
        let mock = MockAgentConnector::new();
        let channel = NativeChannel::open(&mock).await.unwrap();
        let call = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.call(ClientId::new(1), &request("signHash")).await })
        };
        mock.wait_for_messages(1).await;

        mock.close(0, "");

        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.code(), "native_disconnected");
        assert_eq!(err.to_string(), NO_RESPONSE);
        tokio::task::yield_now().await;
        assert!(!channel.is_usable());

        let err = channel.call(ClientId::new(1), &request("x")).await.unwrap_err();
        assert_eq!(err.code(), "native_disconnected");
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_ids_are_dropped() {
        let mock = MockAgentConnector::new();
        let channel = NativeChannel::open(&mock).await.unwrap();

        mock.send(0, json!({"requestId": "nope", "success": true}));
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        assert!(channel.is_usable());
    }

    #[tokio::test]
    async fn connect_failure_maps_to_connect_error() {
        let mock = MockAgentConnector::new();
        mock.fail_next_connect("not installed");
        let err = NativeChannel::open(&mock).await.unwrap_err();
        assert_eq!(err.code(), "native_connect_failure");
    }

    #[tokio::test(start_paused = true)]
    async fn retired_channel_ignores_parting_messages() {
        let mock = MockAgentConnector::with_handler(|_| Some(json!({"success": true})));
        let channel = NativeChannel::open(&mock).await.unwrap();

        channel.retire(json!({"command": "getInfo", "keepAlive": false}));
        mock.wait_for_messages(1).await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        assert!(!channel.is_usable());
        assert_eq!(mock.received()[0]["keepAlive"], false);
    }
}
