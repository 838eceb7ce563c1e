//! Line-delimited JSON frontend.
//!
//! Many client sessions share one byte stream. Each input line is a
//! [`FrontendEvent`]; each output line is a [`FrontendMessage`]:
//!
//! ```text
//! {"type":"connect","client":1,"origin":"https://example.com/page"}
//! {"type":"request","client":1,"message":{"requestId":1,"command":"listCertificates"}}
//! {"type":"disconnect","client":1}
//! ```
//!
//! Requests run concurrently; replies are written as they complete, so their
//! order on the output is not the input order.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use signbridge_types::{ClientId, ClientReply, ClientRequest};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::HostError;
use crate::server::BridgeHost;

/// One input line.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FrontendEvent {
    /// A caller opened a session.
    Connect {
        /// Id chosen by the frontend.
        client: ClientId,
        /// Caller origin URL, or `@popup`.
        origin: String,
    },
    /// A caller sent a command.
    Request {
        /// Session the command belongs to.
        client: ClientId,
        /// The command.
        message: ClientRequest,
    },
    /// A caller went away.
    Disconnect {
        /// Session to close.
        client: ClientId,
    },
}

/// One output line.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FrontendMessage {
    /// Session accepted.
    Connected {
        /// The session.
        client: ClientId,
    },
    /// Reply to a command.
    Reply {
        /// The session.
        client: ClientId,
        /// The reply.
        message: ClientReply,
    },
    /// Session closed.
    Disconnected {
        /// The session.
        client: ClientId,
    },
    /// The paired-device alert indicator changed.
    Alert {
        /// Whether a device needs re-pairing.
        active: bool,
    },
    /// An input line could not be handled.
    Error {
        /// The session, when known.
        #[serde(skip_serializing_if = "Option::is_none")]
        client: Option<ClientId>,
        /// What went wrong.
        message: String,
    },
}

/// Serve `host` over a pair of byte streams until the input ends.
///
/// At end of input, waits for in-flight requests, then disconnects every
/// session.
pub async fn serve<R, W>(host: Arc<BridgeHost>, reader: R, writer: W) -> Result<(), HostError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel::<FrontendMessage>();
    let writer_task = tokio::spawn(write_loop(writer, rx));
    let alert_task = spawn_alert_forwarder(&host, tx.clone());

    let mut in_flight = JoinSet::new();
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let event = match serde_json::from_str::<FrontendEvent>(&line) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "invalid frontend line");
                let _ = tx.send(FrontendMessage::Error {
                    client: None,
                    message: format!("invalid message: {e}"),
                });
                continue;
            }
        };

        match event {
            FrontendEvent::Connect { client, origin } => {
                let message = match host.connect(client, &origin) {
                    Ok(_) => FrontendMessage::Connected { client },
                    Err(e) => FrontendMessage::Error {
                        client: Some(client),
                        message: e.to_string(),
                    },
                };
                let _ = tx.send(message);
            }
            FrontendEvent::Request { client, message } => {
                let host = host.clone();
                let tx = tx.clone();
                in_flight.spawn(async move {
                    let reply = host.request(client, message).await;
                    let _ = tx.send(FrontendMessage::Reply {
                        client,
                        message: reply,
                    });
                });
            }
            FrontendEvent::Disconnect { client } => {
                if host.disconnect(client).await {
                    let _ = tx.send(FrontendMessage::Disconnected { client });
                }
            }
        }

        // Reap finished requests so the set does not grow without bound.
        while in_flight.try_join_next().is_some() {}
    }

    info!(pending = in_flight.len(), "frontend input closed");
    while in_flight.join_next().await.is_some() {}
    host.shutdown().await;

    if let Some(task) = alert_task {
        task.abort();
    }
    drop(tx);
    match writer_task.await {
        Ok(result) => result,
        Err(e) => Err(HostError::Io(std::io::Error::other(e))),
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<FrontendMessage>,
) -> Result<(), HostError>
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = rx.recv().await {
        let mut line = match serde_json::to_vec(&message) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "could not encode frontend message");
                continue;
            }
        };
        line.push(b'\n');
        writer.write_all(&line).await?;
        writer.flush().await?;
    }
    debug!("frontend writer finished");
    Ok(())
}

fn spawn_alert_forwarder(
    host: &BridgeHost,
    tx: mpsc::UnboundedSender<FrontendMessage>,
) -> Option<tokio::task::JoinHandle<()>> {
    let mut alerts = host.router().dispatcher().devices()?.alert_indicator();
    Some(tokio::spawn(async move {
        while alerts.changed().await.is_ok() {
            let active = *alerts.borrow_and_update();
            if tx.send(FrontendMessage::Alert { active }).is_err() {
                break;
            }
        }
    }))
}
