//! Error taxonomy and the structured failure shape sent back to callers.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Origin tag stamped on exceptions produced by the bridge itself.
pub const BRIDGE_ORIGIN: &str = "bridge";

/// Structured failure as it crosses every boundary: agent replies, device
/// replies and the replies sent to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionModel {
    /// Short human-readable message.
    #[serde(default)]
    pub message: String,
    /// Full detail, often identical to `message`.
    #[serde(default)]
    pub complete: String,
    /// Which component produced the failure.
    #[serde(default)]
    pub origin: String,
    /// Stable machine-readable code.
    #[serde(default = "undefined_code")]
    pub code: String,
}

fn undefined_code() -> String {
    "undefined".to_string()
}

impl ExceptionModel {
    /// Build an exception originating in the bridge.
    pub fn new(message: impl Into<String>, code: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            complete: message.clone(),
            message,
            origin: BRIDGE_ORIGIN.to_string(),
            code: code.into(),
        }
    }
}

impl std::fmt::Display for ExceptionModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

/// Errors surfaced to callers of the bridge.
///
/// Every variant maps to a stable wire code via [`BridgeError::code`] and
/// converts into an [`ExceptionModel`] for the reply.
#[derive(Debug, Clone, Error)]
pub enum BridgeError {
    /// The channel to the local agent dropped while the request was outstanding.
    #[error("{reason}")]
    NativeDisconnected {
        /// Transport-level reason reported by the channel.
        reason: String,
    },

    /// A channel to the local agent could not be opened.
    #[error("failed to connect to native application: {0}")]
    NativeConnectFailed(String),

    /// A relay session could not be established in time.
    #[error("device {device} did not connect to the relay")]
    ConnectTimeout {
        /// Name of the device being reached.
        device: String,
    },

    /// An uncorrelatable response arrived on a channel.
    #[error("response without requestId while {outstanding} requests are outstanding")]
    ProtocolCorrelation {
        /// Number of callbacks outstanding when the response arrived.
        outstanding: usize,
    },

    /// The caller's domain is forbidden by the block-list.
    #[error("the ({domain}) domain is currently forbidden")]
    BlockedDomain {
        /// The blocked caller domain.
        domain: String,
    },

    /// The user declined the consent prompt.
    #[error("operation cancelled by the user")]
    UserCancelled,

    /// A required command parameter was absent or empty.
    #[error("{0}")]
    ParameterMissing(String),

    /// An encrypted payload failed its integrity check or could not be decrypted.
    #[error("error on message integrity: {0}")]
    Integrity(String),

    /// A relay request timed out.
    #[error("device {device} is not responding")]
    RelayTimeout {
        /// Name of the device being reached.
        device: String,
    },

    /// A relay request could not be delivered to the device.
    #[error("could not send message to device {device}: {detail}")]
    RelayUndeliverable {
        /// Name of the device being reached.
        device: String,
        /// Transport detail.
        detail: String,
    },

    /// The local agent runs on an operating system the bridge does not support.
    #[error("not supported OS: {os}")]
    UnsupportedOs {
        /// OS reported by the agent.
        os: String,
    },

    /// The remote device refused the request because pairing is no longer valid.
    #[error("device {device} is not authorized")]
    DeviceNotAuthorized {
        /// Name of the device.
        device: String,
    },

    /// An opaque path handle is unknown to the session.
    #[error("{kind} not found: {handle}")]
    PathNotFound {
        /// `File` or `Folder`.
        kind: &'static str,
        /// The handle supplied by the caller.
        handle: String,
    },

    /// The command is not allowed for this caller.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Structured failure reported by the local agent or a remote device.
    #[error("{0}")]
    Agent(ExceptionModel),

    /// Anything else.
    #[error("{0}")]
    Internal(String),
}

impl BridgeError {
    /// Stable wire code.
    pub fn code(&self) -> &str {
        match self {
            Self::NativeDisconnected { .. } => "native_disconnected",
            Self::NativeConnectFailed(_) => "native_connect_failure",
            Self::ConnectTimeout { .. } => "mobile_connect_timeout",
            Self::ProtocolCorrelation { .. } => "protocol_correlation_error",
            Self::BlockedDomain { .. } => "blocked_domain",
            Self::UserCancelled => "user_cancelled",
            Self::ParameterMissing(_) => "command_parameter_not_set",
            Self::Integrity(_) => "command_decrypt_error",
            Self::RelayTimeout { .. } => "mobile_timeout",
            Self::RelayUndeliverable { .. } => "mobile_send_message",
            Self::UnsupportedOs { .. } => "os_not_supported",
            Self::DeviceNotAuthorized { .. } => "mobile_not_authorized",
            Self::PathNotFound { .. } => "path_not_found",
            Self::Forbidden(_) => "forbidden",
            Self::Agent(exception) => &exception.code,
            Self::Internal(_) => "undefined",
        }
    }

    /// Shorthand for a missing parameter named `name`.
    pub fn missing(name: &str) -> Self {
        Self::ParameterMissing(format!("The {name} parameter cannot be empty"))
    }

    /// Convert into the reply shape, keeping agent exceptions verbatim.
    pub fn to_exception(&self) -> ExceptionModel {
        match self {
            Self::Agent(exception) => exception.clone(),
            other => ExceptionModel::new(other.to_string(), other.code()),
        }
    }
}

impl From<BridgeError> for ExceptionModel {
    fn from(err: BridgeError) -> Self {
        err.to_exception()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = BridgeError::BlockedDomain {
            domain: "evil.example".into(),
        };
        assert_eq!(
            err.to_string(),
            "the (evil.example) domain is currently forbidden"
        );
        assert_eq!(err.code(), "blocked_domain");
    }

    #[test]
    fn missing_parameter_message() {
        let err = BridgeError::missing("certificateThumbprint");
        assert_eq!(err.code(), "command_parameter_not_set");
        assert_eq!(
            err.to_string(),
            "The certificateThumbprint parameter cannot be empty"
        );
    }

    #[test]
    fn agent_exception_passes_through_unchanged() {
        let original = ExceptionModel {
            message: "token removed".into(),
            complete: "PKCS#11 CKR_DEVICE_REMOVED".into(),
            origin: "native".into(),
            code: "token_error".into(),
        };
        let err = BridgeError::Agent(original.clone());
        assert_eq!(err.code(), "token_error");
        assert_eq!(err.to_exception(), original);
    }

    #[test]
    fn bridge_exception_carries_origin() {
        let ex = BridgeError::UserCancelled.to_exception();
        assert_eq!(ex.origin, BRIDGE_ORIGIN);
        assert_eq!(ex.code, "user_cancelled");
        assert_eq!(ex.message, ex.complete);
    }

    #[test]
    fn exception_deserializes_with_missing_fields() {
        let ex: ExceptionModel = serde_json::from_str(r#"{"message":"boom"}"#).unwrap();
        assert_eq!(ex.code, "undefined");
        assert_eq!(ex.message, "boom");
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<BridgeError>();
    }
}
