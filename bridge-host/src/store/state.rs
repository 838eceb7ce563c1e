//! JSON-file backed state store.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use signbridge_relay::{DeviceError, DeviceStore};
use signbridge_types::{CertificateSummary, DeviceRecord, Domain, Thumbprint};
use tokio::sync::Mutex;
use tracing::debug;

use super::{SettingsStore, TrustStore};
use crate::error::StoreError;

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoreState {
    #[serde(default)]
    trust: BTreeMap<Domain, BTreeMap<Thumbprint, CertificateSummary>>,
    #[serde(default)]
    certificates: BTreeMap<Thumbprint, Value>,
    #[serde(default)]
    pkcs11_modules: Vec<String>,
    #[serde(default)]
    devices: Vec<DeviceRecord>,
}

/// State store kept in memory and, when opened on a path, written to a
/// JSON file after every change.
#[derive(Debug)]
pub struct StateStore {
    path: Option<PathBuf>,
    state: Mutex<StoreState>,
}

impl StateStore {
    /// A store that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(StoreState::default()),
        }
    }

    /// Open the store at `path`, starting empty if the file does not exist.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let state = match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreState::default(),
            Err(e) => {
                return Err(StoreError::Io {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        Ok(Self {
            path: Some(path.to_path_buf()),
            state: Mutex::new(state),
        })
    }

    async fn persist(&self, state: &StoreState) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let bytes = serde_json::to_vec_pretty(state)?;
        let tmp = path.with_extension("tmp");
        let io_err = |source| StoreError::Io {
            path: path.clone(),
            source,
        };
        tokio::fs::write(&tmp, bytes).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, path).await.map_err(io_err)?;
        debug!(path = %path.display(), "state saved");
        Ok(())
    }
}

#[async_trait]
impl TrustStore for StateStore {
    async fn is_trusted(&self, domain: &Domain, thumbprint: &Thumbprint) -> Result<bool, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .trust
            .get(domain)
            .is_some_and(|certs| certs.contains_key(thumbprint)))
    }

    async fn set_trusted(
        &self,
        domain: &Domain,
        certificate: &CertificateSummary,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state
            .trust
            .entry(domain.clone())
            .or_default()
            .insert(certificate.thumbprint.clone(), certificate.clone());
        self.persist(&state).await
    }

    async fn clear_trusted(&self, domain: &Domain, thumbprint: &Thumbprint) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let removed = state
            .trust
            .get_mut(domain)
            .and_then(|certs| certs.remove(thumbprint))
            .is_some();
        if removed {
            self.persist(&state).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl SettingsStore for StateStore {
    async fn cached_certificate(&self, thumbprint: &Thumbprint) -> Result<Option<Value>, StoreError> {
        Ok(self.state.lock().await.certificates.get(thumbprint).cloned())
    }

    async fn cache_certificate(&self, thumbprint: &Thumbprint, content: Value) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.certificates.insert(thumbprint.clone(), content);
        self.persist(&state).await
    }

    async fn pkcs11_modules(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.state.lock().await.pkcs11_modules.clone())
    }

    async fn add_pkcs11_modules(&self, modules: &[String]) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let mut added = false;
        for module in modules {
            let known = state
                .pkcs11_modules
                .iter()
                .any(|m| m.eq_ignore_ascii_case(module));
            if !known && !module.is_empty() {
                state.pkcs11_modules.push(module.clone());
                added = true;
            }
        }
        if added {
            self.persist(&state).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceStore for StateStore {
    async fn devices(&self) -> Result<Vec<DeviceRecord>, DeviceError> {
        Ok(self.state.lock().await.devices.clone())
    }

    async fn save_device(&self, record: DeviceRecord) -> Result<(), DeviceError> {
        let mut state = self.state.lock().await;
        match state
            .devices
            .iter_mut()
            .find(|d| d.session_id == record.session_id)
        {
            Some(existing) => *existing = record,
            None => state.devices.push(record),
        }
        Ok(self.persist(&state).await?)
    }
}
