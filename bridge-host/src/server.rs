//! Bridge host coordination.
//!
//! `BridgeHost` owns the session registry and the command router. Sessions
//! are created by [`BridgeHost::connect`] and destroyed by
//! [`BridgeHost::disconnect`]; nothing else adds or removes them.

use std::sync::Arc;

use dashmap::DashMap;
use signbridge_relay::DeviceSyncManager;
use signbridge_types::{BridgeError, ClientId, ClientReply, ClientRequest, Domain, POPUP_DOMAIN};
use tracing::{debug, info, warn};

use crate::agent::AgentConnector;
use crate::authorization::AuthorizationGate;
use crate::blocklist::BlockListService;
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::pool::NativeConnectionPool;
use crate::router::{CommandRouter, RouterConfig};
use crate::session::ClientSession;
use crate::store::StateStore;

/// Main bridge host.
pub struct BridgeHost {
    router: CommandRouter,
    /// Live sessions by client id.
    sessions: DashMap<ClientId, Arc<ClientSession>>,
}

impl std::fmt::Debug for BridgeHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeHost")
            .field("router", &self.router)
            .field("sessions_count", &self.sessions.len())
            .finish()
    }
}

impl BridgeHost {
    /// Create a host around an assembled router.
    pub fn new(router: CommandRouter) -> Self {
        Self {
            router,
            sessions: DashMap::new(),
        }
    }

    /// Assemble the pool, dispatcher, gate and router from configuration.
    ///
    /// `store` backs trust, settings and (through `devices`) the device roster.
    pub fn from_config(
        config: &Config,
        connector: Arc<dyn AgentConnector>,
        store: Arc<StateStore>,
        blocklist: Arc<BlockListService>,
        devices: Option<DeviceSyncManager>,
    ) -> Self {
        let pool = NativeConnectionPool::new(connector, &config.pool, &config.agent.language);
        let dispatcher = Dispatcher::new(
            pool,
            devices,
            store.clone(),
            blocklist.clone(),
            &config.agent,
        );
        let router = CommandRouter::new(
            dispatcher,
            AuthorizationGate::new(store.clone()),
            blocklist,
            store,
            RouterConfig {
                batch_chunk: config.authorization.batch_chunk_size,
                ..RouterConfig::default()
            },
        );
        Self::new(router)
    }

    /// Get the command router.
    pub fn router(&self) -> &CommandRouter {
        &self.router
    }

    /// Get the channel pool.
    pub fn pool(&self) -> &NativeConnectionPool {
        self.router.dispatcher().pool()
    }

    /// Register a session for `client`.
    ///
    /// `origin` is either the UI pseudo-domain `@popup` or the caller's
    /// origin URL, whose host becomes the session domain.
    pub fn connect(&self, client: ClientId, origin: &str) -> Result<Arc<ClientSession>, BridgeError> {
        let domain = if origin == POPUP_DOMAIN {
            Domain::popup()
        } else {
            Domain::from_origin_url(origin)
                .ok_or_else(|| BridgeError::Internal(format!("invalid origin: {origin}")))?
        };

        let session = Arc::new(ClientSession::new(client, domain));
        match self.sessions.entry(client) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(BridgeError::Internal(format!("{client} is already connected")))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(session.clone());
            }
        }

        info!(%client, domain = %session.domain(), total = self.sessions.len(), "client connected");
        Ok(session)
    }

    /// Look up a live session.
    pub fn session(&self, client: ClientId) -> Option<Arc<ClientSession>> {
        self.sessions.get(&client).map(|s| s.clone())
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Run one request for `client`.
    pub async fn request(&self, client: ClientId, request: ClientRequest) -> ClientReply {
        let Some(session) = self.session(client) else {
            warn!(%client, command = %request.command, "request from unknown client");
            return ClientReply::from_result(
                request.request_id,
                Err(BridgeError::Internal(format!("{client} is not connected"))),
            );
        };
        self.router.handle(&session, request).await
    }

    /// Remove the session for `client` and release its agent channel.
    ///
    /// Returns false when the client was not connected.
    pub async fn disconnect(&self, client: ClientId) -> bool {
        let Some((_, session)) = self.sessions.remove(&client) else {
            debug!(%client, "disconnect for unknown client");
            return false;
        };
        session.mark_disconnected();
        self.pool().release(&session).await;
        info!(%client, domain = %session.domain(), remaining = self.sessions.len(), "client disconnected");
        true
    }

    /// Disconnect every session.
    pub async fn shutdown(&self) {
        let clients: Vec<ClientId> = self.sessions.iter().map(|s| *s.key()).collect();
        for client in clients {
            self.disconnect(client).await;
        }
        if let Some(devices) = self.router.dispatcher().devices() {
            devices.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{reply_ok, MockAgentConnector};
    use crate::blocklist::StaticBlockListSource;
    use serde_json::json;
    use std::time::Duration;

    fn host(mock: &MockAgentConnector) -> BridgeHost {
        let blocklist = Arc::new(BlockListService::new(
            Arc::new(StaticBlockListSource::default()),
            Duration::from_millis(100),
        ));
        BridgeHost::from_config(
            &Config::default(),
            Arc::new(mock.clone()),
            Arc::new(StateStore::in_memory()),
            blocklist,
            None,
        )
    }

    fn request(command: &str) -> ClientRequest {
        ClientRequest {
            request_id: json!(7),
            command: command.into(),
            request: json!({}),
            license: None,
            use_domain_native_pool: false,
        }
    }

    #[test]
    fn connect_derives_domain_from_origin() {
        let mock = MockAgentConnector::new();
        let host = host(&mock);

        let site = host.connect(ClientId::new(1), "https://Shop.Example.com:8443/cart").unwrap();
        let popup = host.connect(ClientId::new(2), POPUP_DOMAIN).unwrap();

        assert_eq!(site.domain().as_str(), "shop.example.com");
        assert!(popup.is_popup());
        assert_eq!(host.session_count(), 2);
    }

    #[test]
    fn connect_rejects_bad_origin_and_duplicates() {
        let mock = MockAgentConnector::new();
        let host = host(&mock);

        assert!(host.connect(ClientId::new(1), "not a url").is_err());
        host.connect(ClientId::new(1), "https://example.com").unwrap();
        assert!(host.connect(ClientId::new(1), "https://example.com").is_err());
        assert_eq!(host.session_count(), 1);
    }

    #[tokio::test]
    async fn request_from_unknown_client_fails() {
        let mock = MockAgentConnector::new();
        let host = host(&mock);

        let reply = host.request(ClientId::new(9), request("listCertificates")).await;

        assert!(!reply.success);
        assert_eq!(reply.request_id, json!(7));
    }

    #[tokio::test]
    async fn disconnect_releases_private_channel() {
        let mock = MockAgentConnector::with_handler(|m| Some(reply_ok(m, json!([]))));
        let host = host(&mock);
        let client = ClientId::new(1);
        let session = host.connect(client, "https://example.com").unwrap();

        let reply = host.request(client, request("listCertificates")).await;
        assert!(reply.success);
        assert!(host.pool().has_private(client).await);

        assert!(host.disconnect(client).await);
        assert!(session.is_disconnected());
        assert!(!host.pool().has_private(client).await);
        assert!(!host.disconnect(client).await);

        mock.wait_for_messages(2).await;
        let shutdown = mock.received().pop().unwrap();
        assert_eq!(shutdown["keepAlive"], false);
    }
}
