//! Domain block-list service.
//!
//! Holds the current [`BlockList`], refreshes it periodically from a
//! [`BlockListSource`], and refreshes it again shortly after a caller is
//! blocked.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use signbridge_core::{BlockList, Restriction};
use tokio::time::interval;

use crate::error::HostError;

/// Where block-lists come from.
#[async_trait]
pub trait BlockListSource: Send + Sync {
    /// Fetch the current list.
    async fn fetch(&self) -> Result<BlockList, HostError>;
}

/// Fetches the home-data document (`{"bl": {pattern: mask}}`) over HTTP.
#[derive(Debug, Clone)]
pub struct HttpBlockListSource {
    client: reqwest::Client,
    url: String,
}

impl HttpBlockListSource {
    /// Create a source for `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl BlockListSource for HttpBlockListSource {
    async fn fetch(&self) -> Result<BlockList, HostError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| HostError::BlockList(e.to_string()))?;
        response
            .json::<BlockList>()
            .await
            .map_err(|e| HostError::BlockList(e.to_string()))
    }
}

/// A fixed list; used when no endpoint is configured.
#[derive(Debug, Clone, Default)]
pub struct StaticBlockListSource {
    list: BlockList,
}

impl StaticBlockListSource {
    /// Serve `list` forever.
    pub fn new(list: BlockList) -> Self {
        Self { list }
    }
}

#[async_trait]
impl BlockListSource for StaticBlockListSource {
    async fn fetch(&self) -> Result<BlockList, HostError> {
        Ok(self.list.clone())
    }
}

/// The block-list in force.
pub struct BlockListService {
    current: RwLock<BlockList>,
    source: Arc<dyn BlockListSource>,
    refresh_after_block: Duration,
}

impl BlockListService {
    /// Start with an empty list; call [`refresh`](Self::refresh) to load.
    pub fn new(source: Arc<dyn BlockListSource>, refresh_after_block: Duration) -> Self {
        Self {
            current: RwLock::new(BlockList::empty()),
            source,
            refresh_after_block,
        }
    }

    /// Whether `domain` carries `restriction`.
    pub fn is_restricted(&self, domain: &str, restriction: Restriction) -> bool {
        self.current
            .read()
            .map(|list| list.is_restricted(domain, restriction))
            .unwrap_or(false)
    }

    /// Number of patterns in force.
    pub fn len(&self) -> usize {
        self.current.read().map(|list| list.len()).unwrap_or(0)
    }

    /// Whether nothing is restricted.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace the list with a fresh fetch. The old list stays on failure.
    pub async fn refresh(&self) -> Result<usize, HostError> {
        let list = self.source.fetch().await?;
        let count = list.len();
        if let Ok(mut current) = self.current.write() {
            *current = list;
        }
        Ok(count)
    }

    /// Refresh in the background after the configured short delay.
    pub fn refresh_soon(self: &Arc<Self>) {
        let service = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(service.refresh_after_block).await;
            match service.refresh().await {
                Ok(count) => tracing::debug!("Block-list refreshed after block ({} patterns)", count),
                Err(e) => tracing::warn!("Block-list refresh failed: {}", e),
            }
        });
    }
}

impl std::fmt::Debug for BlockListService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockListService")
            .field("patterns", &self.len())
            .finish()
    }
}

/// Spawn the periodic block-list refresh.
///
/// The first refresh happens immediately. Returns a handle that can be
/// used to abort the task.
pub fn spawn_refresh_task(
    service: Arc<BlockListService>,
    every: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if every.is_zero() {
            tracing::info!("Block-list refresh disabled");
            return;
        }

        tracing::info!("Block-list refresh started (interval: {}s)", every.as_secs());

        let mut timer = interval(every);

        loop {
            timer.tick().await;

            match service.refresh().await {
                Ok(count) => tracing::info!("Block-list refreshed: {} patterns", count),
                Err(e) => tracing::error!("Block-list refresh error: {}", e),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        fetches: AtomicUsize,
        list: BlockList,
    }

    #[async_trait]
    impl BlockListSource for CountingSource {
        async fn fetch(&self) -> Result<BlockList, HostError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(self.list.clone())
        }
    }

    struct FailingSource;

    #[async_trait]
    impl BlockListSource for FailingSource {
        async fn fetch(&self) -> Result<BlockList, HostError> {
            Err(HostError::BlockList("unreachable".into()))
        }
    }

    fn counting(list: BlockList) -> Arc<CountingSource> {
        Arc::new(CountingSource {
            fetches: AtomicUsize::new(0),
            list,
        })
    }

    #[tokio::test]
    async fn refresh_loads_list() {
        let source = counting(BlockList::from_entries([("*.evil.com", 4u32)]));
        let service = BlockListService::new(source, Duration::from_millis(100));
        assert!(!service.is_restricted("a.evil.com", Restriction::Forbidden));

        service.refresh().await.unwrap();

        assert!(service.is_restricted("a.evil.com", Restriction::Forbidden));
        assert!(!service.is_restricted("a.evil.com", Restriction::ForceRequireLicense));
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_list() {
        let service = BlockListService::new(Arc::new(FailingSource), Duration::from_millis(100));
        assert!(service.refresh().await.is_err());
        assert!(service.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_soon_waits_for_delay() {
        let source = counting(BlockList::empty());
        let service = Arc::new(BlockListService::new(source.clone(), Duration::from_millis(100)));

        service.refresh_soon();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(source.fetches.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_task_refreshes_on_interval() {
        let source = counting(BlockList::empty());
        let service = Arc::new(BlockListService::new(source.clone(), Duration::from_millis(100)));

        let handle = spawn_refresh_task(service, Duration::from_secs(3600));
        tokio::time::sleep(Duration::from_secs(3600 * 2 + 1)).await;

        assert_eq!(source.fetches.load(Ordering::SeqCst), 3);
        handle.abort();
    }

    #[tokio::test]
    async fn refresh_task_disabled() {
        let service = Arc::new(BlockListService::new(
            Arc::new(StaticBlockListSource::default()),
            Duration::from_millis(100),
        ));

        let handle = spawn_refresh_task(service, Duration::ZERO);

        // Task should complete immediately when disabled
        tokio::time::timeout(Duration::from_millis(100), handle)
            .await
            .expect("Task should complete when disabled")
            .expect("Task should not panic");
    }
}
