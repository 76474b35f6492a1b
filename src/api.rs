// Public facade: the thin surface a caller actually links against.
// Everything here delegates to `cache`, `comm`, and `fabric`; this
// module's only job is argument plumbing and turning internal types into
// the handful of calls an application makes.

use crate::cache::{CacheAccessTable, CacheEntry, CacheManager};
use crate::comm::{CommEntity, Driver, LinkManager, Mailbox};
use crate::common::{CacheId, CacheKey, CacheKeyMeta, ClusterId, RankId};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::fabric::{AcceleratorRuntime, Fabric};
use crate::memory::RegBufferPool;
use crate::wire::{ResponseInfo, TransferCacheReq};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const RESPONSE_POLL_INTERVAL: Duration = Duration::from_micros(200);

/// A running instance of the transfer engine for one local device.
/// Construct with `Engine::initialize`, and drop (or call `finalize`) to
/// stop the servicing thread cleanly.
pub struct Engine {
    cache_manager: Arc<CacheManager>,
    link_manager: Arc<LinkManager>,
    driver: Option<Driver>,
}

impl Engine {
    pub fn initialize(
        options: &HashMap<String, String>,
        fabric: Arc<dyn Fabric + Send + Sync>,
        accel: Arc<dyn AcceleratorRuntime + Send + Sync>,
    ) -> Result<Self> {
        let config = EngineConfig::from_options(options)?;

        let host_bounce = match &config.host_mem_pool_config {
            Some(pool_cfg) => {
                const BUFFER_SIZE: u64 = 64 * 1024;
                let num_buffers = (pool_cfg.memory_size / BUFFER_SIZE).max(1);
                let base_addr = accel.alloc(BUFFER_SIZE * num_buffers)?;
                Some(Arc::new(RegBufferPool::new(
                    fabric.as_ref(),
                    base_addr,
                    BUFFER_SIZE,
                    num_buffers,
                    true,
                )?))
            }
            None => None,
        };

        let cache_manager = Arc::new(CacheManager::new(Arc::new(CacheAccessTable::new())));
        let link_manager = Arc::new(LinkManager::new(
            config,
            cache_manager.clone(),
            fabric,
            accel,
            host_bounce,
        ));
        let driver = Driver::spawn(link_manager.clone());

        tracing::info!("transfer engine initialized");
        Ok(Engine { cache_manager, link_manager, driver: Some(driver) })
    }

    pub fn finalize(mut self) -> Result<()> {
        if let Some(driver) = self.driver.take() {
            driver.stop();
        }
        Ok(())
    }

    pub fn link(&self, cluster_id: ClusterId, rank_id: RankId) -> Result<()> {
        self.link_manager.link(cluster_id, rank_id).map(|_| ())
    }

    /// As `link`, but shares the caller-supplied mailbox with the peer side
    /// instead of creating a private one this process has no way to hand to
    /// anyone — how two in-process `Engine`s wire up for a test.
    pub fn link_with_mailbox(
        &self,
        cluster_id: ClusterId,
        rank_id: RankId,
        mailbox: Arc<Mailbox>,
        responds_to_requests: bool,
    ) -> Result<()> {
        self.link_manager
            .link_with_mailbox(cluster_id, rank_id, mailbox, responds_to_requests)
            .map(|_| ())
    }

    /// Tears a link down. With `force = false`, waits up to `timeout` for any
    /// job the peer entity is mid-flight on before giving up with
    /// `LinkBusy`; `force = true` tears it down immediately.
    pub fn unlink(&self, cluster_id: ClusterId, rank_id: RankId, force: bool, timeout: Duration) -> Result<()> {
        self.link_manager.unlink(cluster_id, rank_id, force, timeout)
    }

    pub fn entity(&self, cluster_id: ClusterId, rank_id: RankId) -> Option<Arc<CommEntity>> {
        self.link_manager.get(cluster_id, rank_id)
    }

    pub fn register_cache(&self, entry: CacheEntry) -> Result<CacheId> {
        self.cache_manager.register(entry)
    }

    pub fn unregister_cache(&self, cache_id: CacheId) -> Result<()> {
        self.cache_manager.unregister(cache_id)
    }

    pub fn register_key(&self, cache_id: CacheId, meta: CacheKeyMeta) -> Result<()> {
        self.cache_manager.register_key(cache_id, meta)
    }

    pub fn remove_key(&self, key: CacheKey) -> Result<()> {
        self.cache_manager.remove_key(key)
    }

    /// Sends `req` to the peer named by `(cluster_id, rank_id)` and blocks
    /// until a response arrives or `timeout` elapses. Used for both
    /// directions of data movement: whether bytes end up flowing host->device,
    /// device->host, or device->device is entirely a function of the cache
    /// placements `req` names, not of whether the caller thinks of this as a
    /// "pull" or a "push".
    pub fn transfer(
        &self,
        cluster_id: ClusterId,
        rank_id: RankId,
        req: TransferCacheReq,
        timeout: Duration,
    ) -> Result<ResponseInfo> {
        let entity = self
            .link_manager
            .get(cluster_id, rank_id)
            .ok_or_else(|| EngineError::NotYetLink(format!("{cluster_id}:{rank_id}")))?;
        entity.mailbox().post_request(req)?;

        let deadline = Instant::now() + timeout;
        loop {
            if let Some(resp) = entity.mailbox().take_response() {
                return Ok(resp);
            }
            if Instant::now() >= deadline {
                return Err(EngineError::Timeout(format!(
                    "no response from {cluster_id}:{rank_id} within {timeout:?}"
                )));
            }
            thread::sleep(RESPONSE_POLL_INTERVAL);
        }
    }
}
