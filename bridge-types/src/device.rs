//! Persisted description of a paired remote device.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{SessionId, Thumbprint};

/// How urgently a device needs to be re-paired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResyncLevel {
    /// Healthy.
    #[default]
    None,
    /// Transient failures observed.
    Warn,
    /// The device rejected us; pairing must be redone.
    Alert,
}

/// A paired device.
///
/// Created on successful pairing and never silently deleted; disabling is
/// explicit through `enabled`.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    /// Identifier reported by the device during pairing.
    pub device_id: String,
    /// Relay session that addresses the device.
    pub session_id: SessionId,
    /// Display name.
    pub name: String,
    /// Device type / OS reported during pairing.
    pub os: String,
    /// Transport-encoded symmetric key shared with the device.
    pub key: String,
    /// Whether the device takes part in routing.
    pub enabled: bool,
    /// Resync severity.
    #[serde(default)]
    pub resync: ResyncLevel,
    /// Unix millis of the last certificate refresh; `None` forces a refresh.
    #[serde(default)]
    pub refreshed_at: Option<u64>,
    /// Certificates known to live on the device, keyed by thumbprint.
    #[serde(default)]
    pub known_certificates: BTreeMap<Thumbprint, Value>,
}

impl DeviceRecord {
    /// Whether the device holds the certificate.
    pub fn knows(&self, thumbprint: &Thumbprint) -> bool {
        self.known_certificates.contains_key(thumbprint)
    }
}

impl fmt::Debug for DeviceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRecord")
            .field("device_id", &self.device_id)
            .field("session_id", &self.session_id)
            .field("name", &self.name)
            .field("os", &self.os)
            .field("key", &"[REDACTED]")
            .field("enabled", &self.enabled)
            .field("resync", &self.resync)
            .field("refreshed_at", &self.refreshed_at)
            .field("known_certificates", &self.known_certificates.len())
            .finish()
    }
}
