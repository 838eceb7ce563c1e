//! Agent connector that starts the agent as a child process.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::framing::{read_frame, write_frame};
use super::{AgentConnector, AgentError, AgentEvent, AgentLink};
use crate::config::AgentConfig;

/// Starts one agent process per link and speaks length-prefixed JSON on
/// its stdin/stdout.
#[derive(Debug, Clone)]
pub struct ProcessAgentConnector {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessAgentConnector {
    /// Create a connector for the configured agent executable.
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
        }
    }
}

#[async_trait]
impl AgentConnector for ProcessAgentConnector {
    async fn connect(&self) -> Result<AgentLink, AgentError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AgentError::SpawnFailed(format!("{}: {e}", self.program.display())))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AgentError::SpawnFailed("agent stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::SpawnFailed("agent stdout unavailable".into()))?;
        info!(pid = ?child.id(), program = %self.program.display(), "agent started");

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(stdin, out_rx));
        tokio::spawn(read_loop(child, stdout, in_tx));

        Ok(AgentLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

async fn write_loop(mut stdin: ChildStdin, mut outbound: mpsc::UnboundedReceiver<Value>) {
    while let Some(message) = outbound.recv().await {
        if let Err(e) = write_frame(&mut stdin, &message).await {
            warn!(error = %e, "could not write to agent");
            break;
        }
    }
    debug!("agent stdin closed");
}

async fn read_loop(mut child: Child, mut stdout: ChildStdout, inbound: mpsc::UnboundedSender<AgentEvent>) {
    let reason = loop {
        match read_frame(&mut stdout).await {
            Ok(Some(message)) => {
                if inbound.send(AgentEvent::Message(message)).is_err() {
                    break "channel dropped".to_string();
                }
            }
            Ok(None) => break "agent exited".to_string(),
            Err(e) => break e.to_string(),
        }
    };
    match child.try_wait() {
        Ok(Some(status)) => debug!(%status, "agent process finished"),
        Ok(None) => {
            if let Err(e) = child.start_kill() {
                warn!(error = %e, "could not stop agent process");
            }
        }
        Err(e) => warn!(error = %e, "could not query agent process"),
    }
    info!(%reason, "agent link closed");
    inbound.send(AgentEvent::Closed(reason)).ok();
}
