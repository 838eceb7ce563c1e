//! Messages exchanged with the local signing agent and with callers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{BridgeError, ExceptionModel, RequestId, Thumbprint};

/// Outbound message to the local signing agent (or, encrypted, to a device).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRequest {
    /// Correlation id echoed back in the response.
    pub request_id: RequestId,
    /// Caller-supplied license, stripped for some relayed commands.
    pub license: Option<Value>,
    /// Domain the agent licenses the call against.
    pub domain: String,
    /// Command name.
    pub command: String,
    /// Command payload.
    pub request: Value,
    /// UI language for agent dialogs.
    pub language: String,
    /// Whether the agent should stay alive after replying.
    pub keep_alive: bool,
    /// Whether the agent should trace.
    pub trace: bool,
    /// Extra PKCS#11 module paths the agent should load.
    pub pkcs11_modules: Vec<String>,
    /// Force license enforcement for this domain.
    pub require_license: bool,
}

/// Inbound message from the local agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentResponse {
    /// Id of the request this answers; absent on some legacy agents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    /// Whether the command succeeded.
    pub success: bool,
    /// Success payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    /// Failure payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<ExceptionModel>,
}

impl AgentResponse {
    /// Parse an inbound message that may arrive as an object or as a JSON string.
    pub fn parse(value: Value) -> Result<Self, serde_json::Error> {
        match value {
            Value::String(text) => serde_json::from_str(&text),
            other => serde_json::from_value(other),
        }
    }

    /// A successful response.
    pub fn ok(request_id: Option<RequestId>, response: Value) -> Self {
        Self {
            request_id,
            success: true,
            response: Some(response),
            exception: None,
        }
    }

    /// A failed response.
    pub fn failed(request_id: Option<RequestId>, exception: ExceptionModel) -> Self {
        Self {
            request_id,
            success: false,
            response: None,
            exception: Some(exception),
        }
    }

    /// Collapse into the tagged result used at every boundary.
    pub fn into_result(self) -> Result<Value, BridgeError> {
        if self.success {
            Ok(self.response.unwrap_or(Value::Null))
        } else {
            let exception = self.exception.unwrap_or_else(|| {
                ExceptionModel::new("command failed without an exception", "undefined")
            });
            Err(BridgeError::Agent(exception))
        }
    }
}

/// Consent prompt payload sent to the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationRequest {
    /// Certificate about to sign.
    pub certificate_thumbprint: Thumbprint,
    /// Number of signatures requested.
    pub signature_count: u64,
    /// Whether to offer "don't ask again"; `None` lets the agent decide.
    pub enable_dont_ask_again: Option<bool>,
}

/// Consent prompt outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationResponse {
    /// Whether the user approved.
    pub authorized: bool,
    /// Whether the user asked to remember the decision.
    #[serde(default)]
    pub dont_ask_again: bool,
    /// Certificate summary used when persisting trust.
    #[serde(default)]
    pub certificate: Option<CertificateSummary>,
}

/// Minimal certificate description persisted alongside a trust decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateSummary {
    /// Certificate thumbprint.
    pub thumbprint: Thumbprint,
    /// Subject display name.
    #[serde(default)]
    pub subject_name: Option<String>,
    /// Issuer display name.
    #[serde(default)]
    pub issuer_name: Option<String>,
}

/// A command submitted by a client session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRequest {
    /// Caller's correlation id, echoed in the reply.
    pub request_id: Value,
    /// Command name.
    pub command: String,
    /// Command payload.
    #[serde(default)]
    pub request: Value,
    /// License forwarded to the agent.
    #[serde(default)]
    pub license: Option<Value>,
    /// Share one agent channel with every session of the same domain.
    #[serde(default)]
    pub use_domain_native_pool: bool,
}

/// Reply to a [`ClientRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientReply {
    /// The caller's correlation id.
    pub request_id: Value,
    /// Whether the command succeeded.
    pub success: bool,
    /// Success payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    /// Failure payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<ExceptionModel>,
}

impl ClientReply {
    /// Build a reply from a handler outcome.
    pub fn from_result(request_id: Value, result: Result<Value, BridgeError>) -> Self {
        match result {
            Ok(response) => Self {
                request_id,
                success: true,
                response: Some(response),
                exception: None,
            },
            Err(err) => Self {
                request_id,
                success: false,
                response: None,
                exception: Some(err.to_exception()),
            },
        }
    }
}
