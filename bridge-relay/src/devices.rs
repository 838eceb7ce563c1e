//! Device sync manager - pairing and the roster of relay sessions.
//!
//! Pairing runs as a linear sequence of awaited steps:
//!
//! ```text
//! connect(Pair) → peer attaches → handshake → derive key
//!              → decrypt identity → persist record → refresh certificates
//!              → refresh roster
//! ```
//!
//! The roster holds one [`RelayClient`] per enabled device. It is
//! recomputed from the persisted records by [`DeviceSyncManager::refresh_roster`].

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use signbridge_core::{index_by_thumbprint, plan_roster, ConnectMode};
use signbridge_types::{
    BridgeError, DeviceRecord, RequestId, ResyncLevel, SessionId, Thumbprint, LOCALHOST_DOMAIN,
};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::client::{RelayClient, RelayClientConfig, RelayError};
use crate::crypto::{CryptoError, EphemeralKeyPair};
use crate::transport::TransportFactory;

/// Device management errors.
#[derive(Debug, Clone, Error)]
pub enum DeviceError {
    /// Relay error.
    #[error(transparent)]
    Relay(#[from] RelayError),

    /// Crypto error.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// The device store failed.
    #[error("device store error: {0}")]
    Store(String),

    /// No pairing is in progress for the session.
    #[error("no pairing in progress for session {0}")]
    UnknownSession(SessionId),

    /// No device with that id.
    #[error("unknown device: {0}")]
    UnknownDevice(String),

    /// The peer's handshake reply was unusable.
    #[error("invalid handshake: {0}")]
    Handshake(String),

    /// The peer did not finish pairing in time.
    #[error("pairing timed out")]
    PairingTimeout,
}

impl From<DeviceError> for BridgeError {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::Relay(e) => e.into(),
            DeviceError::Crypto(e) => BridgeError::Integrity(e.to_string()),
            DeviceError::PairingTimeout => BridgeError::ConnectTimeout {
                device: "pending device".into(),
            },
            other => BridgeError::Internal(other.to_string()),
        }
    }
}

/// Persistence for device records.
#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// All devices, in pairing order.
    async fn devices(&self) -> Result<Vec<DeviceRecord>, DeviceError>;

    /// Insert or replace the record with the same session id.
    async fn save_device(&self, record: DeviceRecord) -> Result<(), DeviceError>;
}

/// Configuration for DeviceSyncManager.
#[derive(Debug, Clone)]
pub struct DeviceSyncConfig {
    /// Settings for every relay session.
    pub relay: RelayClientConfig,
    /// Bound on waiting for a pending device.
    pub pairing_timeout: Duration,
    /// Poll period while waiting for a pending device.
    pub poll_interval: Duration,
    /// Minimum age of a device's certificate list before an info call
    /// refreshes it.
    pub info_refresh_interval: Duration,
    /// UI language forwarded to devices.
    pub language: String,
}

impl Default for DeviceSyncConfig {
    fn default() -> Self {
        Self {
            relay: RelayClientConfig::default(),
            pairing_timeout: Duration::from_secs(35),
            poll_interval: Duration::from_millis(200),
            info_refresh_interval: Duration::from_secs(3600),
            language: "en".into(),
        }
    }
}

/// Progress of one pairing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncProgress {
    /// Waiting for the device to scan the code.
    Waiting,
    /// Handshake in progress.
    Started,
    /// Record persisted.
    Complete,
    /// Pairing failed.
    Failed(String),
}

/// What the caller shows to the device being paired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingTicket {
    /// Session id to wait on.
    pub session_id: SessionId,
    /// Raw session id for the pairing code.
    pub session_id_raw: String,
    /// Our public x coordinate for the pairing code.
    pub encoded_x: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HandshakeReply {
    encoded_xy: String,
    name: String,
    device_type: String,
    device_id: String,
}

struct Pairing {
    client: RelayClient,
    progress: SyncProgress,
}

struct RosterEntry {
    client: RelayClient,
    record: DeviceRecord,
}

struct Inner {
    config: DeviceSyncConfig,
    store: Arc<dyn DeviceStore>,
    transports: Arc<dyn TransportFactory>,
    roster: Mutex<Vec<RosterEntry>>,
    pairings: StdMutex<HashMap<SessionId, Pairing>>,
    alert: watch::Sender<bool>,
}

/// Pairs devices and keeps one relay session per enabled device.
#[derive(Clone)]
pub struct DeviceSyncManager {
    inner: Arc<Inner>,
}

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl DeviceSyncManager {
    /// Create a manager. Call [`refresh_roster`](Self::refresh_roster) to
    /// open sessions for already paired devices.
    pub fn new(
        config: DeviceSyncConfig,
        store: Arc<dyn DeviceStore>,
        transports: Arc<dyn TransportFactory>,
    ) -> Self {
        let (alert, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                transports,
                roster: Mutex::new(Vec::new()),
                pairings: StdMutex::new(HashMap::new()),
                alert,
            }),
        }
    }

    // ===========================================
    // Pairing
    // ===========================================

    /// Open a pairing session and start waiting for the device.
    pub async fn start_pairing(&self) -> Result<PairingTicket, DeviceError> {
        let keypair = EphemeralKeyPair::generate();
        let encoded_x = keypair.encoded_x();
        let client = RelayClient::new(self.inner.transports.create(), self.inner.config.relay.clone());
        let ticket = client.connect(ConnectMode::Pair).await?;

        self.set_pairing(
            &ticket.session_id,
            Pairing {
                client: client.clone(),
                progress: SyncProgress::Waiting,
            },
        );
        info!(session_id = %ticket.session_id, "waiting for device to pair");

        let manager = self.clone();
        let session_id = ticket.session_id.clone();
        tokio::spawn(async move {
            manager.complete_pairing(session_id, client, keypair).await;
        });

        Ok(PairingTicket {
            session_id: ticket.session_id,
            session_id_raw: ticket.session_id_raw,
            encoded_x,
        })
    }

    /// Progress of the pairing on `session_id`, if one is known.
    pub fn pairing_progress(&self, session_id: &SessionId) -> Option<SyncProgress> {
        self.lock_pairings()
            .get(session_id)
            .map(|p| p.progress.clone())
    }

    /// Wait until the device on `session_id` started the handshake or, with
    /// `finish_sync`, until its record is persisted.
    pub async fn await_pending_device(
        &self,
        session_id: &SessionId,
        finish_sync: bool,
    ) -> Result<(), DeviceError> {
        let deadline = Instant::now() + self.inner.config.pairing_timeout;
        loop {
            let progress = self
                .pairing_progress(session_id)
                .ok_or_else(|| DeviceError::UnknownSession(session_id.clone()))?;
            match progress {
                SyncProgress::Complete => {
                    if finish_sync {
                        self.lock_pairings().remove(session_id);
                    }
                    return Ok(());
                }
                SyncProgress::Started if !finish_sync => return Ok(()),
                SyncProgress::Failed(reason) => {
                    self.lock_pairings().remove(session_id);
                    return Err(DeviceError::Handshake(reason));
                }
                SyncProgress::Waiting | SyncProgress::Started => {}
            }

            if Instant::now() >= deadline {
                warn!(%session_id, "pending device did not pair in time");
                let pairing = self.lock_pairings().remove(session_id);
                if let Some(pairing) = pairing {
                    pairing.client.stop().await;
                }
                return Err(DeviceError::PairingTimeout);
            }
            tokio::time::sleep(self.inner.config.poll_interval).await;
        }
    }

    async fn complete_pairing(
        &self,
        session_id: SessionId,
        client: RelayClient,
        keypair: EphemeralKeyPair,
    ) {
        match self.run_handshake(&session_id, &client, &keypair).await {
            Ok(record) => {
                info!(device = %record.name, "device paired");
                self.refresh_device_certificates(&session_id).await;
                if let Err(e) = self.refresh_roster().await {
                    warn!(error = %e, "could not refresh device roster");
                }
                self.set_progress(&session_id, SyncProgress::Complete);
            }
            Err(e) => {
                warn!(%session_id, error = %e, "pairing failed");
                self.set_progress(&session_id, SyncProgress::Failed(e.to_string()));
                client.stop().await;
            }
        }
    }

    async fn run_handshake(
        &self,
        session_id: &SessionId,
        client: &RelayClient,
        keypair: &EphemeralKeyPair,
    ) -> Result<DeviceRecord, DeviceError> {
        let deadline = Instant::now() + self.inner.config.relay.connect_timeout;
        while !client.peer_connected().await {
            if Instant::now() >= deadline {
                return Err(DeviceError::PairingTimeout);
            }
            tokio::time::sleep(self.inner.config.poll_interval).await;
        }
        self.set_progress(session_id, SyncProgress::Started);

        let reply = client.send_handshake().await?;
        let reply: HandshakeReply =
            serde_json::from_value(reply).map_err(|e| DeviceError::Handshake(e.to_string()))?;
        let key = keypair.derive_shared_key(&reply.encoded_xy)?;

        let record = DeviceRecord {
            device_id: key.decrypt_str(&reply.device_id)?,
            session_id: session_id.clone(),
            name: key.decrypt_str(&reply.name)?,
            os: key.decrypt_str(&reply.device_type)?,
            key: key.to_base64(),
            enabled: true,
            resync: ResyncLevel::None,
            refreshed_at: None,
            known_certificates: Default::default(),
        };
        client.set_device(&record.name, key).await;
        self.inner.store.save_device(record.clone()).await?;

        // The pairing session becomes the device's session.
        let mut roster = self.inner.roster.lock().await;
        roster.retain(|e| e.record.session_id != record.session_id);
        roster.push(RosterEntry {
            client: client.clone(),
            record: record.clone(),
        });
        Ok(record)
    }

    fn lock_pairings(&self) -> std::sync::MutexGuard<'_, HashMap<SessionId, Pairing>> {
        self.inner
            .pairings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_pairing(&self, session_id: &SessionId, pairing: Pairing) {
        self.lock_pairings().insert(session_id.clone(), pairing);
    }

    fn set_progress(&self, session_id: &SessionId, progress: SyncProgress) {
        if let Some(pairing) = self.lock_pairings().get_mut(session_id) {
            pairing.progress = progress;
        }
    }

    // ===========================================
    // Roster
    // ===========================================

    /// Reconcile live sessions with the persisted records.
    pub async fn refresh_roster(&self) -> Result<(), DeviceError> {
        let devices = self.inner.store.devices().await?;
        let mut roster = self.inner.roster.lock().await;
        let live: HashSet<SessionId> = roster.iter().map(|e| e.record.session_id.clone()).collect();
        let plan = plan_roster(&devices, &live);

        let (closing, mut kept): (Vec<_>, Vec<_>) = std::mem::take(&mut *roster)
            .into_iter()
            .partition(|e| plan.close.contains(&e.record.session_id));
        for entry in closing {
            info!(device = %entry.record.name, "closing device session");
            entry.client.stop().await;
        }
        for record in plan.keep {
            if let Some(entry) = kept.iter_mut().find(|e| e.record.session_id == record.session_id) {
                entry.record = record;
            }
        }
        for record in plan.open {
            let key = match crate::crypto::SymmetricKey::from_base64(&record.key) {
                Ok(key) => key,
                Err(e) => {
                    warn!(device = %record.name, error = %e, "device record has an unusable key");
                    continue;
                }
            };
            let client = RelayClient::for_device(
                self.inner.transports.create(),
                self.inner.config.relay.clone(),
                record.session_id.clone(),
                &record.name,
                key,
            );
            info!(device = %record.name, "opening device session");
            let connecting = client.clone();
            let session_id = record.session_id.clone();
            tokio::spawn(async move {
                if let Err(e) = connecting.connect(ConnectMode::Resume { session_id }).await {
                    warn!(error = %e, "could not connect device");
                }
            });
            kept.push(RosterEntry { client, record });
        }

        // Store order is the roster order.
        kept.sort_by_key(|e| {
            devices
                .iter()
                .position(|d| d.session_id == e.record.session_id)
                .unwrap_or(usize::MAX)
        });
        *roster = kept;
        self.inner.alert.send_replace(plan.alert);
        debug!(devices = roster.len(), alert = plan.alert, "device roster refreshed");
        Ok(())
    }

    /// Records of the devices with a live session, in roster order.
    pub async fn connected_devices(&self) -> Vec<DeviceRecord> {
        self.inner
            .roster
            .lock()
            .await
            .iter()
            .map(|e| e.record.clone())
            .collect()
    }

    /// The first connected device that holds `thumbprint`.
    pub async fn device_for_certificate(&self, thumbprint: &Thumbprint) -> Option<DeviceRecord> {
        self.inner
            .roster
            .lock()
            .await
            .iter()
            .find(|e| e.record.knows(thumbprint))
            .map(|e| e.record.clone())
    }

    /// Whether some device needs re-pairing.
    pub fn has_alert(&self) -> bool {
        *self.inner.alert.borrow()
    }

    /// Subscribe to the re-pairing indicator.
    pub fn alert_indicator(&self) -> watch::Receiver<bool> {
        self.inner.alert.subscribe()
    }

    async fn client_for(&self, session_id: &SessionId) -> Option<RelayClient> {
        self.inner
            .roster
            .lock()
            .await
            .iter()
            .find(|e| &e.record.session_id == session_id)
            .map(|e| e.client.clone())
    }

    /// Send a message to a connected device.
    pub async fn send_to_device(
        &self,
        session_id: &SessionId,
        message: &Value,
    ) -> Result<Value, DeviceError> {
        let client = self.client_for(session_id).await.ok_or_else(|| {
            DeviceError::UnknownDevice(session_id.to_string())
        })?;
        Ok(client.send(message, None).await?)
    }

    async fn update_record<F>(&self, session_id: &SessionId, update: F) -> Result<DeviceRecord, DeviceError>
    where
        F: FnOnce(&mut DeviceRecord),
    {
        let mut record = {
            let roster = self.inner.roster.lock().await;
            match roster.iter().find(|e| &e.record.session_id == session_id) {
                Some(entry) => entry.record.clone(),
                None => {
                    drop(roster);
                    self.inner
                        .store
                        .devices()
                        .await?
                        .into_iter()
                        .find(|d| &d.session_id == session_id)
                        .ok_or_else(|| DeviceError::UnknownDevice(session_id.to_string()))?
                }
            }
        };
        update(&mut record);
        self.inner.store.save_device(record.clone()).await?;

        let mut roster = self.inner.roster.lock().await;
        if let Some(entry) = roster.iter_mut().find(|e| &e.record.session_id == session_id) {
            entry.record = record.clone();
        }
        Ok(record)
    }

    // ===========================================
    // Device maintenance
    // ===========================================

    /// Fetch the device's certificate list and cache it by thumbprint.
    ///
    /// Failures are recorded against the device and yield `None`.
    pub async fn refresh_device_certificates(&self, session_id: &SessionId) -> Option<DeviceRecord> {
        let message = json!({
            "requestId": RequestId::new().to_string(),
            "domain": LOCALHOST_DOMAIN,
            "command": "listCertificates",
            "request": {},
            "language": self.inner.config.language,
        });
        match self.send_to_device(session_id, &message).await {
            Ok(listing) => {
                let certificates = listing.as_array().map(|l| index_by_thumbprint(l)).unwrap_or_default();
                let count = certificates.len();
                let updated = self
                    .update_record(session_id, |record| {
                        record.known_certificates = certificates;
                        record.refreshed_at = Some(now_unix_ms());
                    })
                    .await;
                match updated {
                    Ok(record) => {
                        info!(device = %record.name, count, "device certificates refreshed");
                        Some(record)
                    }
                    Err(e) => {
                        warn!(error = %e, "could not save device certificates");
                        None
                    }
                }
            }
            Err(e) => {
                if let Err(e) = self.handle_device_error(session_id, e.into(), true).await {
                    warn!(error = %e, "device certificate refresh failed");
                }
                None
            }
        }
    }

    /// Record a failure reported for a device.
    ///
    /// A rejected authorization disables the device and raises the alert;
    /// timeouts and delivery failures mark it for a resync warning. With
    /// `silent` those are swallowed, otherwise the error is returned after
    /// recording it. Anything else is returned unchanged.
    pub async fn handle_device_error(
        &self,
        session_id: &SessionId,
        error: BridgeError,
        silent: bool,
    ) -> Result<(), BridgeError> {
        let level = match &error {
            BridgeError::Agent(ex) if ex.code == "mobile_not_authorized" => ResyncLevel::Alert,
            BridgeError::DeviceNotAuthorized { .. } => ResyncLevel::Alert,
            BridgeError::RelayTimeout { .. }
            | BridgeError::RelayUndeliverable { .. }
            | BridgeError::ConnectTimeout { .. } => ResyncLevel::Warn,
            _ => return Err(error),
        };

        let updated = self
            .update_record(session_id, |record| {
                record.resync = level;
                if level == ResyncLevel::Alert {
                    record.enabled = false;
                }
            })
            .await;
        match updated {
            Ok(record) if level == ResyncLevel::Alert => {
                warn!(device = %record.name, "device rejected the request; disabling it");
                self.inner.alert.send_replace(true);
                if let Err(e) = self.refresh_roster().await {
                    warn!(error = %e, "could not refresh device roster");
                }
            }
            Ok(record) => warn!(device = %record.name, code = error.code(), "device is not responding"),
            Err(e) => warn!(error = %e, "could not record device failure"),
        }

        if silent {
            Ok(())
        } else {
            Err(error)
        }
    }

    /// Ask every device whose certificate list is stale for its info and
    /// refresh its certificates on success. Runs in the background.
    pub async fn refresh_stale_devices(&self) {
        let threshold = self.inner.config.info_refresh_interval.as_millis() as u64;
        let now = now_unix_ms();
        let stale: Vec<SessionId> = self
            .connected_devices()
            .await
            .into_iter()
            .filter(|d| d.refreshed_at.map_or(true, |at| now.saturating_sub(at) >= threshold))
            .map(|d| d.session_id)
            .collect();

        for session_id in stale {
            let manager = self.clone();
            tokio::spawn(async move {
                if let Err(e) = manager.fetch_device_info(&session_id, true).await {
                    debug!(session = %session_id, error = %e, "stale device refresh failed");
                }
            });
        }
    }

    /// Send `getInfo` to a device; on success clear its resync marker and
    /// refresh its certificates.
    async fn fetch_device_info(
        &self,
        session_id: &SessionId,
        silent: bool,
    ) -> Result<(), BridgeError> {
        let message = json!({
            "requestId": RequestId::new().to_string(),
            "domain": LOCALHOST_DOMAIN,
            "command": "getInfo",
            "request": {},
            "language": self.inner.config.language,
        });
        match self.send_to_device(session_id, &message).await {
            Ok(_) => {
                if let Err(e) = self
                    .update_record(session_id, |record| record.resync = ResyncLevel::None)
                    .await
                {
                    warn!(error = %e, "could not clear device resync marker");
                }
                self.refresh_device_certificates(session_id).await;
                Ok(())
            }
            Err(e) => self.handle_device_error(session_id, e.into(), silent).await,
        }
    }

    /// Re-enable a device by id and check it responds.
    pub async fn refresh_device(&self, device_id: &str) -> Result<(), BridgeError> {
        let record = self
            .inner
            .store
            .devices()
            .await?
            .into_iter()
            .find(|d| d.device_id == device_id);
        let Some(mut record) = record else {
            return Ok(());
        };
        record.enabled = true;
        let session_id = record.session_id.clone();
        self.inner.store.save_device(record).await?;
        self.refresh_roster().await?;
        self.fetch_device_info(&session_id, false).await
    }

    /// Disable a device by id and close its session.
    pub async fn disable_device(&self, device_id: &str) -> Result<(), DeviceError> {
        let mut record = self
            .inner
            .store
            .devices()
            .await?
            .into_iter()
            .find(|d| d.device_id == device_id)
            .ok_or_else(|| DeviceError::UnknownDevice(device_id.to_string()))?;
        record.enabled = false;
        self.inner.store.save_device(record).await?;
        self.refresh_roster().await
    }

    /// Stop every session.
    pub async fn shutdown(&self) {
        let entries = std::mem::take(&mut *self.inner.roster.lock().await);
        for entry in entries {
            entry.client.stop().await;
        }
        let pairings: Vec<Pairing> = self.lock_pairings().drain().map(|(_, p)| p).collect();
        for pairing in pairings {
            pairing.client.stop().await;
        }
    }
}

impl std::fmt::Debug for DeviceSyncManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSyncManager")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}
