//! Native connection pool - who owns which agent channel, and when it
//! goes away.
//!
//! A session either owns a private channel or shares the pooled channel of
//! its domain. The pooled reference count is the number of member
//! sessions. When the last member leaves, shutdown is deferred (short for
//! the UI pseudo-domain, long for sites) and cancelled if a session of the
//! domain acquires the channel again before it fires.
//!
//! There is no close primitive: shutting a channel down means sending the
//! agent a `keepAlive: false` message, after which it exits.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde_json::{json, Value};
use signbridge_types::{BridgeError, ClientId, Domain, LOCALHOST_DOMAIN};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::agent::AgentConnector;
use crate::channel::NativeChannel;
use crate::config::PoolConfig;
use crate::session::ClientSession;

/// How a session reaches the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMode {
    /// A channel owned by the session alone.
    Private,
    /// The channel shared by every session of the domain.
    Pooled,
}

struct PooledEntry {
    channel: Arc<NativeChannel>,
    members: HashSet<ClientId>,
    shutdown: Option<(u64, JoinHandle<()>)>,
}

impl PooledEntry {
    fn cancel_shutdown(&mut self) -> bool {
        match self.shutdown.take() {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum OpenKey {
    Private(ClientId),
    Pooled(Domain),
}

#[derive(Default)]
struct PoolState {
    private: HashMap<ClientId, Arc<NativeChannel>>,
    pooled: HashMap<Domain, PooledEntry>,
    opening: HashMap<OpenKey, Arc<Mutex<()>>>,
    next_timer: u64,
}

impl PoolState {
    /// A usable channel the session may use right now, joining the pooled
    /// channel when the session's mode (or membership) says so.
    fn find_usable(&mut self, session: &ClientSession) -> Option<Arc<NativeChannel>> {
        let id = session.id();
        let domain = session.domain();

        if let Some(channel) = self.private.get(&id) {
            if channel.is_usable() {
                return Some(channel.clone());
            }
            self.private.remove(&id);
        }

        let entry = self.pooled.get_mut(domain)?;
        let wants_pool =
            session.channel_mode() == ChannelMode::Pooled || entry.members.contains(&id);
        if !wants_pool || !entry.channel.is_usable() {
            return None;
        }
        if entry.cancel_shutdown() {
            info!(%domain, "pooled channel shutdown cancelled");
        }
        entry.members.insert(id);
        debug!(%domain, refcount = entry.members.len(), "joined pooled channel");
        Some(entry.channel.clone())
    }

    /// Which open guard the session needs when it has no usable channel.
    fn open_key(&self, session: &ClientSession) -> OpenKey {
        let domain = session.domain();
        let member = self
            .pooled
            .get(domain)
            .is_some_and(|e| e.members.contains(&session.id()));
        if member || session.channel_mode() == ChannelMode::Pooled {
            OpenKey::Pooled(domain.clone())
        } else {
            OpenKey::Private(session.id())
        }
    }

    fn finish_opening(&mut self, key: &OpenKey, opener: &Arc<Mutex<()>>) {
        if self.opening.get(key).is_some_and(|o| Arc::ptr_eq(o, opener)) {
            self.opening.remove(key);
        }
    }
}

struct Inner {
    connector: Arc<dyn AgentConnector>,
    popup_delay: Duration,
    site_delay: Duration,
    language: String,
    state: Mutex<PoolState>,
}

/// Owns every agent channel.
#[derive(Clone)]
pub struct NativeConnectionPool {
    inner: Arc<Inner>,
}

impl NativeConnectionPool {
    /// Create an empty pool.
    pub fn new(connector: Arc<dyn AgentConnector>, config: &PoolConfig, language: &str) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                popup_delay: config.popup_shutdown_delay(),
                site_delay: config.site_shutdown_delay(),
                language: language.to_string(),
                state: Mutex::new(PoolState::default()),
            }),
        }
    }

    /// The message that makes an agent exit.
    pub fn shutdown_message(&self) -> Value {
        shutdown_message(&self.inner.language)
    }

    /// The channel `session` should use, opening one if needed.
    ///
    /// A session keeps the channel it first acquired while that channel is
    /// usable; its mode only matters when it has none. Opening holds only a
    /// per-domain (or per-session) guard, so a slow agent start never blocks
    /// other domains.
    pub async fn acquire(&self, session: &ClientSession) -> Result<Arc<NativeChannel>, BridgeError> {
        let id = session.id();
        let domain = session.domain();
        if session.is_disconnected() {
            return Err(BridgeError::NativeDisconnected {
                reason: "client disconnected".into(),
            });
        }

        let (key, opener) = {
            let mut state = self.inner.state.lock().await;
            if let Some(channel) = state.find_usable(session) {
                return Ok(channel);
            }
            let key = state.open_key(session);
            let opener = state.opening.entry(key.clone()).or_default().clone();
            (key, opener)
        };

        let _opening = opener.lock().await;
        {
            let mut state = self.inner.state.lock().await;
            if let Some(channel) = state.find_usable(session) {
                state.finish_opening(&key, &opener);
                return Ok(channel);
            }
        }

        let opened = NativeChannel::open(self.inner.connector.as_ref()).await;
        let mut state = self.inner.state.lock().await;
        state.finish_opening(&key, &opener);
        let channel = opened?;

        if session.is_disconnected() {
            channel.retire(self.shutdown_message());
            return Err(BridgeError::NativeDisconnected {
                reason: "client disconnected".into(),
            });
        }

        match key {
            OpenKey::Private(_) => {
                info!(%domain, client = %id, channel = channel.id(), "private channel created");
                state.private.insert(id, channel.clone());
            }
            OpenKey::Pooled(_) => {
                // Members of a dead channel stay members of its replacement.
                let mut members = match state.pooled.remove(domain) {
                    Some(mut old) => {
                        old.cancel_shutdown();
                        debug!(%domain, channel = old.channel.id(), "replaced dead pooled channel");
                        old.members
                    }
                    None => HashSet::new(),
                };
                members.insert(id);
                info!(%domain, channel = channel.id(), refcount = members.len(), "pooled channel created");
                state.pooled.insert(
                    domain.clone(),
                    PooledEntry {
                        channel: channel.clone(),
                        members,
                        shutdown: None,
                    },
                );
            }
        }
        Ok(channel)
    }

    /// Let go of whatever channel `session` holds.
    pub async fn release(&self, session: &ClientSession) {
        let id = session.id();
        let domain = session.domain();
        let mut state = self.inner.state.lock().await;

        if let Some(channel) = state.private.remove(&id) {
            channel.forget_client(id);
            if channel.is_usable() {
                channel.retire(self.shutdown_message());
            }
            info!(%domain, client = %id, "private channel shut down");
            return;
        }

        let timer = state.next_timer;
        let Some(entry) = state.pooled.get_mut(domain) else {
            return;
        };
        if !entry.members.remove(&id) {
            return;
        }
        entry.channel.forget_client(id);
        debug!(%domain, refcount = entry.members.len(), "left pooled channel");
        if !entry.members.is_empty() {
            return;
        }

        let delay = if domain.is_popup() {
            self.inner.popup_delay
        } else {
            self.inner.site_delay
        };
        let pool = Arc::downgrade(&self.inner);
        let target = domain.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fire_shutdown(pool, target, timer).await;
        });
        entry.shutdown = Some((timer, handle));
        state.next_timer += 1;
        info!(%domain, delay_ms = delay.as_millis() as u64, "pooled channel shutdown scheduled");
    }

    /// Number of sessions sharing the domain's pooled channel.
    pub async fn refcount(&self, domain: &Domain) -> usize {
        self.inner
            .state
            .lock()
            .await
            .pooled
            .get(domain)
            .map_or(0, |e| e.members.len())
    }

    /// Identity of the domain's pooled channel.
    pub async fn pooled_channel_id(&self, domain: &Domain) -> Option<u64> {
        self.inner
            .state
            .lock()
            .await
            .pooled
            .get(domain)
            .map(|e| e.channel.id())
    }

    /// Whether the domain's pooled channel is waiting to shut down.
    pub async fn shutdown_pending(&self, domain: &Domain) -> bool {
        self.inner
            .state
            .lock()
            .await
            .pooled
            .get(domain)
            .is_some_and(|e| e.shutdown.is_some())
    }

    /// Whether `client` owns a private channel.
    pub async fn has_private(&self, client: ClientId) -> bool {
        self.inner.state.lock().await.private.contains_key(&client)
    }
}

fn shutdown_message(language: &str) -> Value {
    json!({
        "domain": LOCALHOST_DOMAIN,
        "command": "getInfo",
        "language": language,
        "keepAlive": false,
        "request": {"cancelInstances": false},
    })
}

async fn fire_shutdown(pool: Weak<Inner>, domain: Domain, timer: u64) {
    let Some(inner) = pool.upgrade() else {
        return;
    };
    let mut state = inner.state.lock().await;
    let due = state.pooled.get(&domain).is_some_and(|e| {
        e.members.is_empty() && matches!(e.shutdown, Some((t, _)) if t == timer)
    });
    if !due {
        return;
    }
    if let Some(entry) = state.pooled.remove(&domain) {
        if entry.channel.is_usable() {
            entry.channel.retire(shutdown_message(&inner.language));
        }
        info!(%domain, channel = entry.channel.id(), "pooled channel shut down");
    }
}

impl std::fmt::Debug for NativeConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeConnectionPool")
            .field("popup_delay", &self.inner.popup_delay)
            .field("site_delay", &self.inner.site_delay)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::MockAgentConnector;
    use serde_json::json;
    use signbridge_types::ClientRequest;

    fn pool(mock: &MockAgentConnector) -> NativeConnectionPool {
        NativeConnectionPool::new(Arc::new(mock.clone()), &PoolConfig::default(), "en")
    }

    fn session(id: u64, domain: Domain, pooled: bool) -> ClientSession {
        let s = ClientSession::new(ClientId::new(id), domain);
        s.apply_request_options(&ClientRequest {
            request_id: json!(id),
            command: "getInfo".into(),
            request: json!({}),
            license: None,
            use_domain_native_pool: pooled,
        });
        s
    }

    #[tokio::test(start_paused = true)]
    async fn private_channels_are_per_session() {
        let mock = MockAgentConnector::new();
        let pool = pool(&mock);
        let a = session(1, Domain::new("example.com"), false);
        let b = session(2, Domain::new("example.com"), false);

        let ca = pool.acquire(&a).await.unwrap();
        let again = pool.acquire(&a).await.unwrap();
        let cb = pool.acquire(&b).await.unwrap();

        assert_eq!(ca.id(), again.id());
        assert_ne!(ca.id(), cb.id());
        assert_eq!(mock.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn private_release_sends_shutdown_immediately() {
        let mock = MockAgentConnector::new();
        let pool = pool(&mock);
        let a = session(1, Domain::new("example.com"), false);
        let channel = pool.acquire(&a).await.unwrap();

        pool.release(&a).await;
        mock.wait_for_messages(1).await;

        let message = &mock.received()[0];
        assert_eq!(message["keepAlive"], false);
        assert_eq!(message["domain"], "localhost");
        assert_eq!(message["request"]["cancelInstances"], false);
        assert!(!channel.is_usable());
        assert!(!pool.has_private(ClientId::new(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn pooled_channel_is_shared_and_counted() {
        let mock = MockAgentConnector::new();
        let pool = pool(&mock);
        let domain = Domain::new("example.com");
        let a = session(1, domain.clone(), true);
        let b = session(2, domain.clone(), true);

        let ca = pool.acquire(&a).await.unwrap();
        let cb = pool.acquire(&b).await.unwrap();
        pool.acquire(&b).await.unwrap();

        assert_eq!(ca.id(), cb.id());
        assert_eq!(pool.refcount(&domain).await, 2);
        assert_eq!(mock.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn last_release_shuts_down_after_delay() {
        let mock = MockAgentConnector::new();
        let pool = pool(&mock);
        let domain = Domain::new("example.com");
        let a = session(1, domain.clone(), true);
        pool.acquire(&a).await.unwrap();

        pool.release(&a).await;
        assert!(pool.shutdown_pending(&domain).await);

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(mock.received().is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        mock.wait_for_messages(1).await;
        assert_eq!(mock.received()[0]["keepAlive"], false);
        assert!(pool.pooled_channel_id(&domain).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn popup_uses_short_delay() {
        let mock = MockAgentConnector::new();
        let pool = pool(&mock);
        let ui = session(1, Domain::popup(), true);
        pool.acquire(&ui).await.unwrap();

        pool.release(&ui).await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(pool.pooled_channel_id(&Domain::popup()).await.is_none());
        assert_eq!(mock.received().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dead_channel_is_replaced_on_next_acquire() {
        let mock = MockAgentConnector::new();
        let pool = pool(&mock);
        let domain = Domain::new("example.com");
        let a = session(1, domain.clone(), true);
        let first = pool.acquire(&a).await.unwrap();

        mock.close(0, "crashed");
        tokio::time::sleep(Duration::from_millis(1)).await;
        let second = pool.acquire(&a).await.unwrap();

        assert_ne!(first.id(), second.id());
        assert_eq!(pool.refcount(&domain).await, 1);
        assert_eq!(mock.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn crash_keeps_every_member_counted() {
        let mock = MockAgentConnector::new();
        let pool = pool(&mock);
        let domain = Domain::new("example.com");
        let a = session(1, domain.clone(), true);
        let b = session(2, domain.clone(), true);
        pool.acquire(&a).await.unwrap();
        pool.acquire(&b).await.unwrap();

        mock.close(0, "crashed");
        tokio::time::sleep(Duration::from_millis(1)).await;
        let replacement = pool.acquire(&a).await.unwrap();
        assert_eq!(pool.refcount(&domain).await, 2);

        pool.release(&a).await;
        assert_eq!(pool.refcount(&domain).await, 1);
        assert!(!pool.shutdown_pending(&domain).await);

        let shared = pool.acquire(&b).await.unwrap();
        assert_eq!(shared.id(), replacement.id());
        assert_eq!(mock.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_agent_start_does_not_block_other_domains() {
        let mock = MockAgentConnector::new();
        let pool = pool(&mock);
        let slow = session(1, Domain::new("slow.example"), true);
        let fast = session(2, Domain::new("fast.example"), true);

        mock.delay_next_connect(Duration::from_secs(10));
        let started = tokio::time::Instant::now();
        let pending = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(&slow).await.map(|c| c.id()) })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;

        pool.acquire(&fast).await.unwrap();
        pool.release(&fast).await;

        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!pending.is_finished());
        assert!(pending.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_first_acquires_open_one_channel() {
        let mock = MockAgentConnector::new();
        let pool = pool(&mock);
        let domain = Domain::new("example.com");

        mock.delay_next_connect(Duration::from_secs(1));
        let tasks: Vec<_> = (1..=3)
            .map(|i| {
                let pool = pool.clone();
                let s = session(i, domain.clone(), true);
                tokio::spawn(async move { pool.acquire(&s).await.map(|c| c.id()) })
            })
            .collect();

        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap().unwrap());
        }

        assert!(ids.iter().all(|id| *id == ids[0]));
        assert_eq!(pool.refcount(&domain).await, 3);
        assert_eq!(mock.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn release_of_unknown_session_is_noop() {
        let mock = MockAgentConnector::new();
        let pool = pool(&mock);
        pool.release(&session(9, Domain::new("example.com"), true)).await;
        assert_eq!(mock.connect_count(), 0);
    }
}
