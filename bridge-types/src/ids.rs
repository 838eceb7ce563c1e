//! Identity types for signbridge.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Pseudo-domain assigned to the bridge's own UI surface.
pub const POPUP_DOMAIN: &str = "@popup";

/// Domain sent to the agent for calls that must not be licensed per-site.
pub const LOCALHOST_DOMAIN: &str = "localhost";

/// Correlation id carried by every message sent to an agent or device.
///
/// UUID v4 text when generated locally; ids echoed back by a peer are
/// kept verbatim.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Generate a new random request id.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Wrap an id received from a peer.
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the textual form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestId({})", self.0)
    }
}

/// Identifies one connected client session inside the host.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(u64);

impl ClientId {
    /// Create from a raw counter value.
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw counter value.
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientId({})", self.0)
    }
}

/// Relay-assigned session id that addresses one paired device.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Wrap a relay-assigned id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the textual form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.0)
    }
}

/// A certificate's content hash, used as its stable identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Thumbprint(String);

impl Thumbprint {
    /// Wrap a thumbprint string.
    pub fn new(thumb: impl Into<String>) -> Self {
        Self(thumb.into())
    }

    /// Borrow the textual form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Thumbprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The caller's origin identity: the sharing and authorization key.
///
/// Always lowercase. The bridge's own UI is the `@popup` pseudo-domain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Domain(String);

impl Domain {
    /// Create a domain, normalizing to lowercase.
    pub fn new(domain: &str) -> Self {
        Self(domain.to_lowercase())
    }

    /// The UI pseudo-domain.
    pub fn popup() -> Self {
        Self(POPUP_DOMAIN.to_string())
    }

    /// Extract the host of an origin URL (`scheme://host[:port]/...`).
    ///
    /// Returns `None` when the URL has no `//` authority section or the
    /// host is empty.
    pub fn from_origin_url(url: &str) -> Option<Self> {
        let start = url.find("//")? + 2;
        let rest = &url[start..];
        let end = rest.find(|c| c == '/' || c == ':').unwrap_or(rest.len());
        let host = &rest[..end];
        if host.is_empty() {
            return None;
        }
        Some(Self::new(host))
    }

    /// Whether this is the UI pseudo-domain.
    pub fn is_popup(&self) -> bool {
        self.0 == POPUP_DOMAIN
    }

    /// Borrow the textual form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_unique() {
        let a = RequestId::new();
        let b = RequestId::new();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
    }

    #[test]
    fn request_id_serializes_as_plain_string() {
        let id = RequestId::from_string("abc-123");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"abc-123\"");
    }

    #[test]
    fn domain_parsed_from_origin_url() {
        let d = Domain::from_origin_url("https://Sub.Example.COM:8443/path?q=1").unwrap();
        assert_eq!(d.as_str(), "sub.example.com");

        let d = Domain::from_origin_url("http://localhost/").unwrap();
        assert_eq!(d.as_str(), "localhost");
    }

    #[test]
    fn domain_rejects_url_without_authority() {
        assert!(Domain::from_origin_url("about:blank").is_none());
        assert!(Domain::from_origin_url("file:///etc/hosts").is_none());
    }

    #[test]
    fn popup_pseudo_domain() {
        assert!(Domain::popup().is_popup());
        assert!(!Domain::new("example.com").is_popup());
    }
}
