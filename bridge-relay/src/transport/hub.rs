//! HubRelayTransport - the cloud relay reached over its hub socket and REST API.
//!
//! The relay exposes two surfaces:
//! - a JSON hub at `{server}session/` that pushes `connectionId`, `connected`,
//!   `message` and `receipt` invocations
//! - REST endpoints under `{server}api/sessions/` that register sessions and
//!   move envelopes
//!
//! Hub frames are JSON objects terminated by the 0x1E record separator. The
//! socket is negotiated over HTTP first, then opened with a JSON protocol
//! handshake and kept alive with periodic pings.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use signbridge_types::{RelayEnvelope, SessionId};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::{
    PostOutcome, RelayTransport, SessionTicket, TransportError, TransportEvent, TransportFactory,
};

/// Terminates every hub frame.
pub const RECORD_SEPARATOR: char = '\u{1e}';

const HUB_PATH: &str = "session/";
const SESSIONS_PATH: &str = "api/sessions/";

// Hub message types
const INVOCATION: u8 = 1;
const PING: u8 = 6;
const CLOSE: u8 = 7;

type HubStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Configuration for HubRelayTransport.
#[derive(Clone, Debug)]
pub struct HubTransportConfig {
    /// Relay base URL, always ending in `/`.
    pub server_url: String,
    /// Bound on the hub connect and on every REST call (default: 30s).
    pub request_timeout: Duration,
    /// Keep-alive ping interval on the hub socket (default: 15s).
    pub ping_interval: Duration,
    /// Client description sent when a session is registered or resumed.
    pub properties: Value,
}

impl HubTransportConfig {
    /// Configuration for the relay at `server_url`.
    pub fn new(server_url: impl Into<String>) -> Self {
        let mut server_url = server_url.into();
        if !server_url.ends_with('/') {
            server_url.push('/');
        }
        Self {
            server_url,
            request_timeout: Duration::from_secs(30),
            ping_interval: Duration::from_secs(15),
            properties: json!({
                "browser": "signbridge",
                "operatingSystem": std::env::consts::OS,
            }),
        }
    }

    /// Override the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn sessions_url(&self) -> String {
        format!("{}{SESSIONS_PATH}", self.server_url)
    }

    fn session_url(&self, session_id: &SessionId, suffix: &str) -> String {
        format!("{}{SESSIONS_PATH}{}{suffix}", self.server_url, session_id.as_str())
    }

    fn negotiate_url(&self) -> String {
        format!("{}{HUB_PATH}negotiate?negotiateVersion=1", self.server_url)
    }

    fn hub_socket_url(&self, token: &str) -> Result<String, TransportError> {
        let base = if let Some(rest) = self.server_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.server_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            return Err(TransportError::ConnectionFailed(format!(
                "unsupported relay URL: {}",
                self.server_url
            )));
        };
        Ok(format!("{base}{HUB_PATH}?id={token}"))
    }

    fn session_body(&self, connection_id: &str) -> Value {
        json!({
            "connectionId": connection_id,
            "properties": self.properties,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Negotiation {
    #[serde(default)]
    connection_token: Option<String>,
    connection_id: String,
}

#[derive(Debug, Deserialize)]
struct HubFrame {
    #[serde(rename = "type", default)]
    kind: Option<u8>,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    arguments: Vec<Value>,
    #[serde(default)]
    error: Option<String>,
}

/// What one hub frame means for the relay client.
#[derive(Debug, PartialEq)]
enum HubSignal {
    Event(TransportEvent),
    Ignore,
    Closed(String),
}

fn interpret(frame: HubFrame) -> HubSignal {
    match frame.kind {
        // Handshake reply: `{}` accepts, `{"error": ..}` rejects.
        None => match frame.error {
            Some(e) => HubSignal::Closed(format!("hub handshake rejected: {e}")),
            None => HubSignal::Ignore,
        },
        Some(INVOCATION) => invocation(frame.target.as_deref().unwrap_or_default(), frame.arguments),
        Some(PING) => HubSignal::Ignore,
        Some(CLOSE) => HubSignal::Closed(
            frame
                .error
                .unwrap_or_else(|| "hub closed the connection".to_string()),
        ),
        Some(other) => {
            debug!(kind = other, "ignoring hub frame");
            HubSignal::Ignore
        }
    }
}

fn invocation(target: &str, arguments: Vec<Value>) -> HubSignal {
    let first = arguments.into_iter().next();
    match (target, first) {
        ("connectionId", Some(Value::String(id))) => {
            HubSignal::Event(TransportEvent::ConnectionId(id))
        }
        ("connected", info) => HubSignal::Event(TransportEvent::PeerConnected(
            info.filter(|v| !v.is_null()).map(unwrap_encoded),
        )),
        ("message", _) => HubSignal::Event(TransportEvent::ResponseAvailable),
        ("receipt", Some(Value::String(id))) => HubSignal::Event(TransportEvent::Receipt(id)),
        (other, _) => {
            debug!(invocation = other, "ignoring hub invocation");
            HubSignal::Ignore
        }
    }
}

/// The relay sometimes sends JSON documents as JSON strings.
fn unwrap_encoded(value: Value) -> Value {
    match value {
        Value::String(text) => serde_json::from_str(&text).unwrap_or(Value::String(text)),
        other => other,
    }
}

fn frames(text: &str) -> impl Iterator<Item = &str> {
    text.split(RECORD_SEPARATOR)
        .filter(|frame| !frame.trim().is_empty())
}

fn encode_frame(value: &Value) -> String {
    format!("{value}{RECORD_SEPARATOR}")
}

/// Forward the frames of one socket message. Returns a reason when the
/// socket should close.
fn deliver(text: &str, events: &mpsc::UnboundedSender<TransportEvent>) -> Option<String> {
    for raw in frames(text) {
        let frame: HubFrame = match serde_json::from_str(raw) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "malformed hub frame");
                continue;
            }
        };
        match interpret(frame) {
            HubSignal::Event(event) => {
                if events.send(event).is_err() {
                    return Some("event receiver dropped".to_string());
                }
            }
            HubSignal::Ignore => {}
            HubSignal::Closed(reason) => return Some(reason),
        }
    }
    None
}

async fn pump(
    mut socket: HubStream,
    events: mpsc::UnboundedSender<TransportEvent>,
    mut shutdown: oneshot::Receiver<()>,
    ping_interval: Duration,
) {
    let mut ping = tokio::time::interval(ping_interval);
    ping.tick().await;

    let reason = loop {
        tokio::select! {
            _ = &mut shutdown => {
                let _ = socket
                    .send(Message::Text(encode_frame(&json!({ "type": CLOSE }))))
                    .await;
                let _ = socket.close(None).await;
                debug!("hub socket closed locally");
                return;
            }
            _ = ping.tick() => {
                let frame = encode_frame(&json!({ "type": PING }));
                if let Err(e) = socket.send(Message::Text(frame)).await {
                    break e.to_string();
                }
            }
            message = socket.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if let Some(reason) = deliver(&text, &events) {
                        break reason;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    break frame
                        .map(|f| f.reason.to_string())
                        .filter(|r| !r.is_empty())
                        .unwrap_or_else(|| "hub closed the connection".to_string());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break e.to_string(),
                None => break "hub socket ended".to_string(),
            }
        }
    };

    warn!(reason = %reason, "relay hub disconnected");
    let _ = events.send(TransportEvent::Closed(reason));
}

struct HubSocket {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Real relay transport: one hub socket plus REST calls.
pub struct HubRelayTransport {
    config: Arc<HubTransportConfig>,
    http: reqwest::Client,
    socket: Mutex<Option<HubSocket>>,
}

impl HubRelayTransport {
    /// Create a transport with its own HTTP client.
    pub fn new(config: HubTransportConfig) -> Result<Self, TransportError> {
        let http = build_client(&config)?;
        Ok(Self::with_client(Arc::new(config), http))
    }

    fn with_client(config: Arc<HubTransportConfig>, http: reqwest::Client) -> Self {
        Self {
            config,
            http,
            socket: Mutex::new(None),
        }
    }

    async fn negotiate(&self) -> Result<String, TransportError> {
        let text = self
            .body(self.http.post(self.config.negotiate_url()))
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("negotiate: {e}")))?;
        let negotiation: Negotiation = serde_json::from_str(&text).map_err(|e| {
            TransportError::ConnectionFailed(format!("invalid negotiate reply: {e}"))
        })?;
        Ok(negotiation
            .connection_token
            .unwrap_or(negotiation.connection_id))
    }

    async fn body(&self, request: reqwest::RequestBuilder) -> Result<String, TransportError> {
        let response = request.send().await.map_err(call_failed)?;
        let status = response.status();
        let text = response.text().await.map_err(call_failed)?;
        if !status.is_success() {
            return Err(TransportError::CallFailed(format!("{status}: {text}")));
        }
        Ok(text)
    }
}

fn build_client(config: &HubTransportConfig) -> Result<reqwest::Client, TransportError> {
    reqwest::Client::builder()
        .timeout(config.request_timeout)
        .build()
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))
}

fn call_failed(e: reqwest::Error) -> TransportError {
    TransportError::CallFailed(e.to_string())
}

fn parse_envelope(text: &str) -> Result<RelayEnvelope, TransportError> {
    RelayEnvelope::from_json(text)
        .or_else(|first| match serde_json::from_str::<String>(text) {
            Ok(inner) => RelayEnvelope::from_json(&inner),
            Err(_) => Err(first),
        })
        .map_err(|e| TransportError::CallFailed(format!("invalid response envelope: {e}")))
}

#[async_trait]
impl RelayTransport for HubRelayTransport {
    async fn open(
        &self,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<(), TransportError> {
        self.close().await?;

        let token = self.negotiate().await?;
        let url = self.config.hub_socket_url(&token)?;
        let (mut socket, _) = tokio::time::timeout(
            self.config.request_timeout,
            tokio_tungstenite::connect_async(url.as_str()),
        )
        .await
        .map_err(|_| TransportError::ConnectionFailed("timed out opening relay hub".to_string()))?
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        let handshake = encode_frame(&json!({ "protocol": "json", "version": 1 }));
        socket
            .send(Message::Text(handshake))
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        let (shutdown, stop) = oneshot::channel();
        let task = tokio::spawn(pump(socket, events, stop, self.config.ping_interval));
        *self.socket.lock().await = Some(HubSocket { shutdown, task });

        info!(server = %self.config.server_url, "relay hub connected");
        Ok(())
    }

    async fn create_session(&self, connection_id: &str) -> Result<SessionTicket, TransportError> {
        let request = self
            .http
            .post(self.config.sessions_url())
            .json(&self.config.session_body(connection_id));
        let text = self.body(request).await?;
        serde_json::from_str(&text)
            .map_err(|e| TransportError::CallFailed(format!("invalid session ticket: {e}")))
    }

    async fn resume_session(
        &self,
        session_id: &SessionId,
        connection_id: &str,
    ) -> Result<(), TransportError> {
        let request = self
            .http
            .put(self.config.session_url(session_id, ""))
            .json(&self.config.session_body(connection_id));
        self.body(request).await?;
        Ok(())
    }

    async fn post(
        &self,
        session_id: &SessionId,
        envelope: &RelayEnvelope,
    ) -> Result<PostOutcome, TransportError> {
        let request = self
            .http
            .post(self.config.session_url(session_id, "/request"))
            .json(envelope);
        let text = self.body(request).await?;
        if text.trim().is_empty() {
            return Ok(PostOutcome::default());
        }
        serde_json::from_str(&text)
            .map_err(|e| TransportError::CallFailed(format!("invalid post reply: {e}")))
    }

    async fn fetch_response(&self, session_id: &SessionId) -> Result<RelayEnvelope, TransportError> {
        let response = self
            .http
            .get(self.config.session_url(session_id, "/response"))
            .send()
            .await
            .map_err(call_failed)?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::NO_CONTENT {
            return Err(TransportError::NoResponse);
        }
        let text = response.text().await.map_err(call_failed)?;
        if !status.is_success() {
            return Err(TransportError::CallFailed(format!("{status}: {text}")));
        }
        if text.trim().is_empty() {
            return Err(TransportError::NoResponse);
        }
        parse_envelope(&text)
    }

    async fn close(&self) -> Result<(), TransportError> {
        if let Some(socket) = self.socket.lock().await.take() {
            if socket.shutdown.send(()).is_err() {
                // Pump already exited on its own.
                socket.task.abort();
            }
        }
        Ok(())
    }
}

/// Builds hub transports that share one HTTP client.
#[derive(Clone)]
pub struct HubTransportFactory {
    config: Arc<HubTransportConfig>,
    http: reqwest::Client,
}

impl HubTransportFactory {
    /// Factory for the relay described by `config`.
    pub fn new(config: HubTransportConfig) -> Result<Self, TransportError> {
        let http = build_client(&config)?;
        Ok(Self {
            config: Arc::new(config),
            http,
        })
    }
}

impl TransportFactory for HubTransportFactory {
    fn create(&self) -> Arc<dyn RelayTransport> {
        Arc::new(HubRelayTransport::with_client(
            self.config.clone(),
            self.http.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use signbridge_types::EnvelopeKind;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn frame(text: &str) -> HubFrame {
        serde_json::from_str(text).unwrap()
    }

    /// Answer one HTTP request with `status` and `body`; yields the request text.
    async fn serve_once(status: &'static str, body: &'static str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request).to_string();
                if let Some(end) = text.find("\r\n\r\n") {
                    let length = text[..end]
                        .lines()
                        .find_map(|l| {
                            let (name, value) = l.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())?
                        })
                        .unwrap_or(0);
                    if request.len() >= end + 4 + length || n == 0 {
                        break;
                    }
                } else if n == 0 {
                    break;
                }
            }
            let reply = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(reply.as_bytes()).await.unwrap();
            stream.shutdown().await.unwrap();
            String::from_utf8_lossy(&request).to_string()
        });
        (url, handle)
    }

    // =========================================================================
    // URLs
    // =========================================================================

    #[test]
    fn config_normalizes_trailing_slash() {
        let config = HubTransportConfig::new("https://relay.example.com");
        assert_eq!(config.server_url, "https://relay.example.com/");
        assert_eq!(config.sessions_url(), "https://relay.example.com/api/sessions/");
        assert_eq!(
            config.session_url(&SessionId::new("s-1"), "/request"),
            "https://relay.example.com/api/sessions/s-1/request"
        );
        assert_eq!(
            config.negotiate_url(),
            "https://relay.example.com/session/negotiate?negotiateVersion=1"
        );
    }

    #[test]
    fn socket_url_switches_scheme() {
        let secure = HubTransportConfig::new("https://relay.example.com/");
        assert_eq!(
            secure.hub_socket_url("tok").unwrap(),
            "wss://relay.example.com/session/?id=tok"
        );

        let plain = HubTransportConfig::new("http://127.0.0.1:8080");
        assert_eq!(
            plain.hub_socket_url("tok").unwrap(),
            "ws://127.0.0.1:8080/session/?id=tok"
        );

        let bad = HubTransportConfig::new("ftp://relay.example.com");
        assert!(matches!(
            bad.hub_socket_url("tok"),
            Err(TransportError::ConnectionFailed(_))
        ));
    }

    // =========================================================================
    // Frames
    // =========================================================================

    #[test]
    fn invocations_map_to_events() {
        assert_eq!(
            interpret(frame(r#"{"type":1,"target":"connectionId","arguments":["c-1"]}"#)),
            HubSignal::Event(TransportEvent::ConnectionId("c-1".into()))
        );
        assert_eq!(
            interpret(frame(r#"{"type":1,"target":"message","arguments":[]}"#)),
            HubSignal::Event(TransportEvent::ResponseAvailable)
        );
        assert_eq!(
            interpret(frame(r#"{"type":1,"target":"receipt","arguments":["r-9"]}"#)),
            HubSignal::Event(TransportEvent::Receipt("r-9".into()))
        );
        assert_eq!(
            interpret(frame(r#"{"type":1,"target":"unknown","arguments":[1]}"#)),
            HubSignal::Ignore
        );
    }

    #[test]
    fn connected_unwraps_encoded_device_info() {
        let signal = interpret(frame(
            r#"{"type":1,"target":"connected","arguments":["{\"model\":\"Pixel\"}"]}"#,
        ));
        assert_eq!(
            signal,
            HubSignal::Event(TransportEvent::PeerConnected(Some(json!({"model": "Pixel"}))))
        );

        let bare = interpret(frame(r#"{"type":1,"target":"connected","arguments":[null]}"#));
        assert_eq!(bare, HubSignal::Event(TransportEvent::PeerConnected(None)));
    }

    #[test]
    fn control_frames() {
        assert_eq!(interpret(frame("{}")), HubSignal::Ignore);
        assert_eq!(interpret(frame(r#"{"type":6}"#)), HubSignal::Ignore);
        assert!(matches!(
            interpret(frame(r#"{"error":"unsupported protocol"}"#)),
            HubSignal::Closed(reason) if reason.contains("unsupported protocol")
        ));
        assert!(matches!(
            interpret(frame(r#"{"type":7,"error":"server shutdown"}"#)),
            HubSignal::Closed(reason) if reason == "server shutdown"
        ));
    }

    #[test]
    fn deliver_splits_batched_frames() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let text = "{}\u{1e}{\"type\":1,\"target\":\"connectionId\",\"arguments\":[\"c-1\"]}\u{1e}not json\u{1e}{\"type\":1,\"target\":\"message\",\"arguments\":[]}\u{1e}";

        assert_eq!(deliver(text, &tx), None);
        assert_eq!(rx.try_recv().unwrap(), TransportEvent::ConnectionId("c-1".into()));
        assert_eq!(rx.try_recv().unwrap(), TransportEvent::ResponseAvailable);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn envelope_accepts_string_encoded_body() {
        let envelope = RelayEnvelope::new(EnvelopeKind::Response, "r-1", Some("abc".into()));
        let json = envelope.to_json().unwrap();
        let quoted = serde_json::to_string(&json).unwrap();

        assert_eq!(parse_envelope(&json).unwrap(), envelope);
        assert_eq!(parse_envelope(&quoted).unwrap(), envelope);
        assert!(parse_envelope("[]").is_err());
    }

    // =========================================================================
    // Socket pump
    // =========================================================================

    #[tokio::test]
    async fn pump_forwards_hub_events_then_reports_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let handshake = ws.next().await.unwrap().unwrap();
            assert!(handshake.to_text().unwrap().contains("\"protocol\":\"json\""));
            ws.send(Message::Text(
                "{}\u{1e}{\"type\":1,\"target\":\"connectionId\",\"arguments\":[\"c-7\"]}\u{1e}"
                    .to_string(),
            ))
            .await
            .unwrap();
            ws.send(Message::Text(
                "{\"type\":1,\"target\":\"receipt\",\"arguments\":[\"req-1\"]}\u{1e}".to_string(),
            ))
            .await
            .unwrap();
            ws.send(Message::Text("{\"type\":7,\"error\":\"bye\"}\u{1e}".to_string()))
                .await
                .unwrap();
        });

        let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/session/?id=t"))
            .await
            .unwrap();
        socket
            .send(Message::Text(encode_frame(
                &json!({ "protocol": "json", "version": 1 }),
            )))
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let (_shutdown, stop) = oneshot::channel();
        let task = tokio::spawn(pump(socket, tx, stop, Duration::from_secs(15)));

        assert_eq!(rx.recv().await.unwrap(), TransportEvent::ConnectionId("c-7".into()));
        assert_eq!(rx.recv().await.unwrap(), TransportEvent::Receipt("req-1".into()));
        assert_eq!(rx.recv().await.unwrap(), TransportEvent::Closed("bye".into()));

        task.await.unwrap();
        server.await.unwrap();
    }

    // =========================================================================
    // REST calls
    // =========================================================================

    #[tokio::test]
    async fn create_session_posts_connection_id() {
        let (url, server) =
            serve_once("200 OK", r#"{"sessionId":"s-42","sessionIdRaw":"RAW42"}"#).await;
        let transport = HubRelayTransport::new(HubTransportConfig::new(url)).unwrap();

        let ticket = transport.create_session("conn-1").await.unwrap();
        assert_eq!(ticket.session_id, SessionId::new("s-42"));
        assert_eq!(ticket.session_id_raw, "RAW42");

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /api/sessions/ "));
        assert!(request.contains("\"connectionId\":\"conn-1\""));
    }

    #[tokio::test]
    async fn post_reads_delivery_flag() {
        let (url, server) = serve_once("200 OK", r#"{"sentToDevice":true}"#).await;
        let transport = HubRelayTransport::new(HubTransportConfig::new(url)).unwrap();
        let envelope = RelayEnvelope::new(EnvelopeKind::Request, "req-1", Some("cipher".into()));

        let outcome = transport.post(&SessionId::new("s-1"), &envelope).await.unwrap();
        assert!(outcome.sent_to_device);
        assert!(server.await.unwrap().starts_with("POST /api/sessions/s-1/request "));
    }

    #[tokio::test]
    async fn missing_response_is_no_response() {
        let (url, server) = serve_once("404 Not Found", "").await;
        let transport = HubRelayTransport::new(HubTransportConfig::new(url)).unwrap();

        let result = transport.fetch_response(&SessionId::new("s-1")).await;
        assert!(matches!(result, Err(TransportError::NoResponse)));
        assert!(server.await.unwrap().starts_with("GET /api/sessions/s-1/response "));
    }

    #[tokio::test]
    async fn server_error_is_call_failure() {
        let (url, server) = serve_once("500 Internal Server Error", "boom").await;
        let transport = HubRelayTransport::new(HubTransportConfig::new(url)).unwrap();

        let result = transport
            .resume_session(&SessionId::new("s-1"), "conn-2")
            .await;
        assert!(matches!(result, Err(TransportError::CallFailed(msg)) if msg.contains("boom")));
        assert!(server.await.unwrap().starts_with("PUT /api/sessions/s-1 "));
    }

    #[tokio::test]
    async fn close_without_open_is_noop() {
        let transport =
            HubRelayTransport::new(HubTransportConfig::new("http://127.0.0.1:9/")).unwrap();
        assert!(transport.close().await.is_ok());
    }

    // =========================================================================
    // Trait compliance
    // =========================================================================

    #[test]
    fn hub_transport_implements_trait() {
        fn assert_transport<T: RelayTransport>() {}
        assert_transport::<HubRelayTransport>();

        fn assert_factory<T: TransportFactory>() {}
        assert_factory::<HubTransportFactory>();
    }
}
