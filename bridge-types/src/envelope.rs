//! Relay envelope - the wire wrapper for every message exchanged with a device.

use serde::{Deserialize, Serialize};

/// Envelope kind discriminator.
///
/// Serialized lowercase; capitalized spellings used by older relay hubs are
/// accepted on input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    /// Plaintext pairing handshake.
    #[serde(alias = "Sync")]
    Sync,
    /// Encrypted application request.
    #[serde(alias = "Request")]
    Request,
    /// Encrypted application response.
    #[serde(alias = "Response")]
    Response,
    /// Delivery receipt for a request.
    #[serde(alias = "Receipt")]
    Receipt,
    /// Relay or device level error; content is a plaintext exception.
    #[serde(alias = "Error")]
    Error,
}

/// Current envelope format version.
pub const ENVELOPE_FORMAT: u8 = 0;

/// The envelope wraps all relay traffic.
///
/// `content` is transport-encoded ciphertext for requests and responses,
/// and plaintext JSON for the pairing handshake and errors. The relay only sees the
/// envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayEnvelope {
    /// Kind discriminator.
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    /// Correlation id of the request this envelope belongs to.
    pub id: String,
    /// Payload; `None` for receipts and empty errors.
    #[serde(default)]
    pub content: Option<String>,
    /// Format version.
    #[serde(default)]
    pub format: u8,
}

impl RelayEnvelope {
    /// Create an envelope in the current format.
    pub fn new(kind: EnvelopeKind, id: impl Into<String>, content: Option<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            content,
            format: ENVELOPE_FORMAT,
        }
    }

    /// A delivery receipt for `id`.
    pub fn receipt(id: impl Into<String>) -> Self {
        Self::new(EnvelopeKind::Receipt, id, None)
    }

    /// Content, treating the empty string as absent.
    pub fn content(&self) -> Option<&str> {
        self.content.as_deref().filter(|c| !c.is_empty())
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
