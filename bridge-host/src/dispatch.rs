//! Local vs remote dispatch of agent commands.
//!
//! Every agent call goes through [`Dispatcher::call`]. Commands with a
//! remote hook may run on a paired device instead of, or in addition to,
//! the local agent:
//!
//! | Command               | Hook                                   |
//! |-----------------------|----------------------------------------|
//! | `readCertificate`     | pre-call, license stripped             |
//! | `authorizeSignatures` | pre-call, license stripped             |
//! | `signData`            | pre-call                               |
//! | `signHash`            | pre-call                               |
//! | `signHashBatch`       | pre-call                               |
//! | `getInfo`             | post-call, refresh stale devices       |
//! | `listCertificates`    | post-call, merge device listings       |
//!
//! A pre-call goes to the first connected device whose certificate cache
//! holds the request's `certificateThumbprint`; otherwise the call stays
//! local.

use std::sync::Arc;

use serde_json::Value;
use signbridge_core::{ListingMerge, Restriction};
use signbridge_relay::DeviceSyncManager;
use signbridge_types::{
    AgentRequest, BridgeError, DeviceRecord, RequestId, Thumbprint, LOCALHOST_DOMAIN,
};
use tracing::{debug, info};

use crate::blocklist::BlockListService;
use crate::config::AgentConfig;
use crate::pool::NativeConnectionPool;
use crate::session::ClientSession;
use crate::store::SettingsStore;

/// Per-call options.
///
/// Every call keeps the agent alive; only the pool's shutdown message sends
/// `keepAlive: false`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallOptions {
    /// Send the call as `localhost` so it is not licensed per site.
    pub bypass_licensing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RemoteHook {
    PreCall { strip_license: bool },
    RefreshDevices,
    MergeListings,
}

fn remote_hook(command: &str) -> Option<RemoteHook> {
    match command {
        "readCertificate" | "authorizeSignatures" => Some(RemoteHook::PreCall {
            strip_license: true,
        }),
        "signData" | "signHash" | "signHashBatch" => Some(RemoteHook::PreCall {
            strip_license: false,
        }),
        "getInfo" => Some(RemoteHook::RefreshDevices),
        "listCertificates" => Some(RemoteHook::MergeListings),
        _ => None,
    }
}

/// Sends agent commands to the local agent or a paired device.
pub struct Dispatcher {
    pool: NativeConnectionPool,
    devices: Option<DeviceSyncManager>,
    settings: Arc<dyn SettingsStore>,
    blocklist: Arc<BlockListService>,
    language: String,
    trace: bool,
}

impl Dispatcher {
    /// Create a dispatcher. Without `devices` every call is local.
    pub fn new(
        pool: NativeConnectionPool,
        devices: Option<DeviceSyncManager>,
        settings: Arc<dyn SettingsStore>,
        blocklist: Arc<BlockListService>,
        agent: &AgentConfig,
    ) -> Self {
        Self {
            pool,
            devices,
            settings,
            blocklist,
            language: agent.language.clone(),
            trace: agent.trace,
        }
    }

    /// The channel pool.
    pub fn pool(&self) -> &NativeConnectionPool {
        &self.pool
    }

    /// The device manager, when devices are enabled.
    pub fn devices(&self) -> Option<&DeviceSyncManager> {
        self.devices.as_ref()
    }

    /// Build the agent message for a call.
    pub async fn build_request(
        &self,
        session: &ClientSession,
        command: &str,
        request: Value,
        options: CallOptions,
    ) -> Result<AgentRequest, BridgeError> {
        let site = session.domain().as_str();
        let domain = if options.bypass_licensing || session.is_popup() {
            LOCALHOST_DOMAIN
        } else {
            site
        };
        Ok(AgentRequest {
            request_id: RequestId::new(),
            license: session.license(),
            domain: domain.to_string(),
            command: command.to_string(),
            request,
            language: self.language.clone(),
            keep_alive: true,
            trace: self.trace,
            pkcs11_modules: self.settings.pkcs11_modules().await?,
            require_license: self
                .blocklist
                .is_restricted(site, Restriction::ForceRequireLicense),
        })
    }

    /// Run `command` for `session` and return the agent's response value.
    pub async fn call(
        &self,
        session: &ClientSession,
        command: &str,
        request: Value,
        options: CallOptions,
    ) -> Result<Value, BridgeError> {
        let message = self.build_request(session, command, request, options).await?;

        if let (Some(devices), Some(hook)) = (&self.devices, remote_hook(command)) {
            match hook {
                RemoteHook::PreCall { strip_license } => {
                    if let Some(device) = self.device_holding(devices, &message.request).await {
                        return self.call_device(devices, &device, message, strip_license).await;
                    }
                }
                RemoteHook::RefreshDevices => {
                    let result = self.call_local(session, &message).await?;
                    devices.refresh_stale_devices().await;
                    return Ok(result);
                }
                RemoteHook::MergeListings => {
                    let local = self.call_local(session, &message).await?;
                    return Ok(merge_device_listings(devices, local).await);
                }
            }
        }

        self.call_local(session, &message).await
    }

    async fn call_local(
        &self,
        session: &ClientSession,
        message: &AgentRequest,
    ) -> Result<Value, BridgeError> {
        let channel = self.pool.acquire(session).await?;
        channel.call(session.id(), message).await?.into_result()
    }

    async fn device_holding(
        &self,
        devices: &DeviceSyncManager,
        request: &Value,
    ) -> Option<DeviceRecord> {
        let thumbprint = request
            .get("certificateThumbprint")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())?;
        devices
            .device_for_certificate(&Thumbprint::new(thumbprint))
            .await
    }

    async fn call_device(
        &self,
        devices: &DeviceSyncManager,
        device: &DeviceRecord,
        mut message: AgentRequest,
        strip_license: bool,
    ) -> Result<Value, BridgeError> {
        if strip_license {
            message.license = None;
        }
        let body =
            serde_json::to_value(&message).map_err(|e| BridgeError::Internal(e.to_string()))?;
        info!(device = %device.name, command = %message.command, "delegating command to device");

        match devices.send_to_device(&device.session_id, &body).await {
            Ok(response) => Ok(response),
            Err(e) => {
                let error = BridgeError::from(e);
                match devices
                    .handle_device_error(&device.session_id, error.clone(), false)
                    .await
                {
                    Ok(()) => Err(error),
                    Err(e) => Err(e),
                }
            }
        }
    }
}

/// Local listing first, then each connected device in roster order; a
/// later entry for the same thumbprint wins.
async fn merge_device_listings(devices: &DeviceSyncManager, local: Value) -> Value {
    let mut merge = ListingMerge::new();
    if let Value::Array(certs) = local {
        merge.extend(certs);
    }
    for device in devices.connected_devices().await {
        let record = if device.refreshed_at.is_none() {
            devices.refresh_device_certificates(&device.session_id).await
        } else {
            Some(device)
        };
        if let Some(record) = record {
            debug!(device = %record.name, count = record.known_certificates.len(), "merging device certificates");
            merge.extend(record.known_certificates.into_values());
        }
    }
    Value::Array(merge.finish())
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("devices", &self.devices.is_some())
            .field("language", &self.language)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{reply_ok, MockAgentConnector};
    use crate::blocklist::StaticBlockListSource;
    use crate::config::PoolConfig;
    use crate::store::StateStore;
    use serde_json::json;
    use signbridge_core::BlockList;
    use signbridge_types::{ClientId, Domain};
    use std::time::Duration;

    fn dispatcher(mock: &MockAgentConnector, blocklist: BlockList) -> Dispatcher {
        let pool = NativeConnectionPool::new(Arc::new(mock.clone()), &PoolConfig::default(), "en");
        let service = BlockListService::new(
            Arc::new(StaticBlockListSource::new(blocklist)),
            Duration::from_millis(100),
        );
        Dispatcher::new(
            pool,
            None,
            Arc::new(StateStore::in_memory()),
            Arc::new(service),
            &AgentConfig::default(),
        )
    }

    #[test]
    fn hooks_table() {
        assert_eq!(
            remote_hook("signHash"),
            Some(RemoteHook::PreCall { strip_license: false })
        );
        assert_eq!(
            remote_hook("readCertificate"),
            Some(RemoteHook::PreCall { strip_license: true })
        );
        assert_eq!(remote_hook("listCertificates"), Some(RemoteHook::MergeListings));
        assert_eq!(remote_hook("signPdf"), None);
    }

    #[tokio::test]
    async fn message_carries_session_context() {
        let mock = MockAgentConnector::new();
        let d = dispatcher(&mock, BlockList::empty());
        let session = ClientSession::new(ClientId::new(1), Domain::new("example.com"));

        let message = d
            .build_request(&session, "signHash", json!({"hash": "AA"}), CallOptions::default())
            .await
            .unwrap();

        assert_eq!(message.domain, "example.com");
        assert_eq!(message.language, "en");
        assert!(message.keep_alive);
        assert!(!message.require_license);
    }

    #[tokio::test]
    async fn popup_and_bypass_use_localhost() {
        let mock = MockAgentConnector::new();
        let d = dispatcher(&mock, BlockList::empty());
        let popup = ClientSession::new(ClientId::new(1), Domain::popup());
        let site = ClientSession::new(ClientId::new(2), Domain::new("example.com"));

        let a = d
            .build_request(&popup, "getInfo", json!({}), CallOptions::default())
            .await
            .unwrap();
        let b = d
            .build_request(
                &site,
                "signHash",
                json!({}),
                CallOptions {
                    bypass_licensing: true,
                },
            )
            .await
            .unwrap();

        assert_eq!(a.domain, LOCALHOST_DOMAIN);
        assert_eq!(b.domain, LOCALHOST_DOMAIN);
    }

    #[tokio::test]
    async fn forced_licensing_sets_require_license() {
        let mock = MockAgentConnector::new();
        let d = dispatcher(&mock, BlockList::from_entries([("*.example.com", 2u32)]));
        d.blocklist.refresh().await.unwrap();
        let session = ClientSession::new(ClientId::new(1), Domain::new("shop.example.com"));

        let message = d
            .build_request(&session, "signHash", json!({}), CallOptions::default())
            .await
            .unwrap();

        assert!(message.require_license);
    }

    #[tokio::test]
    async fn call_without_devices_goes_local() {
        let mock = MockAgentConnector::with_handler(|m| Some(reply_ok(m, json!([{"thumbprint": "aa"}]))));
        let d = dispatcher(&mock, BlockList::empty());
        let session = ClientSession::new(ClientId::new(1), Domain::new("example.com"));

        let listing = d
            .call(&session, "listCertificates", json!({}), CallOptions::default())
            .await
            .unwrap();

        assert_eq!(listing, json!([{"thumbprint": "aa"}]));
        assert_eq!(mock.commands(), vec!["listCertificates"]);
    }
}
