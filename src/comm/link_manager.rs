// Tracks the set of linked peers and owns their `CommEntity`s, following a
// `CommParams` shape (`rank_table`, `timeout`, `link_retry_count`).

use crate::cache::CacheManager;
use crate::common::{ClusterId, RankId};
use crate::comm::entity::CommEntity;
use crate::comm::transport::Mailbox;
use crate::config::{EngineConfig, Role};
use crate::error::{EngineError, Result};
use crate::fabric::{AcceleratorRuntime, Fabric};
use crate::memory::RegBufferPool;
use dashmap::DashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub struct LinkManager {
    config: EngineConfig,
    cache_manager: Arc<CacheManager>,
    fabric: Arc<dyn Fabric + Send + Sync>,
    accel: Arc<dyn AcceleratorRuntime + Send + Sync>,
    host_bounce: Option<Arc<RegBufferPool>>,
    entities: DashMap<(ClusterId, RankId), Arc<CommEntity>>,
    role: Role,
}

impl LinkManager {
    pub fn new(
        config: EngineConfig,
        cache_manager: Arc<CacheManager>,
        fabric: Arc<dyn Fabric + Send + Sync>,
        accel: Arc<dyn AcceleratorRuntime + Send + Sync>,
        host_bounce: Option<Arc<RegBufferPool>>,
    ) -> Self {
        let role = config.role;
        LinkManager {
            config,
            cache_manager,
            fabric,
            accel,
            host_bounce,
            entities: DashMap::new(),
            role,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn switch_role(&mut self, role: Role) -> Result<()> {
        if !self.entities.is_empty() {
            return Err(EngineError::LinkBusy(
                "cannot switch role while links are established".into(),
            ));
        }
        self.role = role;
        Ok(())
    }

    /// Establishes a link to `(cluster_id, rank_id)`, retrying
    /// `link_retry_count` times within an overall `link_total_time_s`
    /// budget before giving up.
    pub fn link(&self, cluster_id: ClusterId, rank_id: RankId) -> Result<Arc<CommEntity>> {
        self.link_with_mailbox(cluster_id, rank_id, Arc::new(Mailbox::default()), true)
    }

    /// As `link`, but wires the entity to a caller-supplied mailbox instead
    /// of a private one — how two in-process `Engine`s in an integration
    /// test share a single request/response channel instead of each
    /// talking to an unreachable peer process. `responds_to_requests` marks
    /// which end of that shared channel actually executes inbound transfer
    /// jobs; the other end only ever posts a request and waits on the
    /// response half.
    pub fn link_with_mailbox(
        &self,
        cluster_id: ClusterId,
        rank_id: RankId,
        mailbox: Arc<Mailbox>,
        responds_to_requests: bool,
    ) -> Result<Arc<CommEntity>> {
        if self.entities.contains_key(&(cluster_id, rank_id)) {
            return Err(EngineError::AlreadyLink(format!("{cluster_id}:{rank_id}")));
        }

        let deadline = Instant::now() + Duration::from_secs(self.config.link_total_time_s as u64);
        let mut last_err = None;
        for attempt in 0..self.config.link_retry_count {
            match self.fabric.comm_init(cluster_id, rank_id) {
                Ok(()) => {
                    let entity = Arc::new(CommEntity::new(
                        cluster_id,
                        rank_id,
                        self.cache_manager.clone(),
                        self.fabric.clone(),
                        self.accel.clone(),
                        self.host_bounce.clone(),
                        mailbox.clone(),
                        responds_to_requests,
                    ));
                    self.entities.insert((cluster_id, rank_id), entity.clone());
                    return Ok(entity);
                }
                Err(err) => {
                    last_err = Some(err);
                    if Instant::now() >= deadline {
                        break;
                    }
                    if attempt + 1 < self.config.link_retry_count {
                        thread::sleep(Duration::from_millis(50));
                    }
                }
            }
        }
        Err(EngineError::LinkFailed(format!(
            "{cluster_id}:{rank_id}: {}",
            last_err.map(|e| e.to_string()).unwrap_or_else(|| "retry budget exhausted".into())
        )))
    }

    /// Tears a link down. With `force = false`, waits up to `timeout` for any
    /// job the entity is mid-flight on (`Receiving` committing, or `Sending`
    /// still moving bytes) to reach a terminal state first, failing with
    /// `LinkBusy` if it doesn't clear in time; `force = true` tears the link
    /// down immediately regardless of in-flight work.
    pub fn unlink(&self, cluster_id: ClusterId, rank_id: RankId, force: bool, timeout: Duration) -> Result<()> {
        {
            let entry = self
                .entities
                .get(&(cluster_id, rank_id))
                .ok_or_else(|| EngineError::NotYetLink(format!("{cluster_id}:{rank_id}")))?;
            if !force {
                let deadline = Instant::now() + timeout;
                while entry.has_pending_job() {
                    if Instant::now() >= deadline {
                        return Err(EngineError::LinkBusy(format!(
                            "{cluster_id}:{rank_id} still has an in-flight job after {timeout:?}"
                        )));
                    }
                    thread::sleep(Duration::from_millis(5));
                }
            }
        }

        let (_, entity) = self
            .entities
            .remove(&(cluster_id, rank_id))
            .ok_or_else(|| EngineError::NotYetLink(format!("{cluster_id}:{rank_id}")))?;
        entity.mark_destroyed();
        self.fabric
            .comm_finalize(cluster_id, rank_id)
            .map_err(|e| EngineError::UnlinkFailed(e.to_string()))
    }

    pub fn get(&self, cluster_id: ClusterId, rank_id: RankId) -> Option<Arc<CommEntity>> {
        self.entities.get(&(cluster_id, rank_id)).map(|r| r.clone())
    }

    pub fn entities(&self) -> Vec<Arc<CommEntity>> {
        self.entities.iter().map(|r| r.value().clone()).collect()
    }
}
