// In-process software stand-ins for the accelerator runtime and fabric,
// used by tests and by any deployment without real RDMA-class hardware.
// Addresses are offsets into a single growable arena rather than real
// device pointers; one-sided ops reach directly into a registered peer's
// arena, mirroring the hardware's "no remote CPU involvement" semantics.

use crate::common::{ClusterId, RankId};
use crate::error::{EngineError, Result};
use crate::fabric::traits::{AcceleratorRuntime, Fabric, MemDesc, OneSideOpDesc};
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A flat byte arena addressed by offset. `alloc` hands out non-overlapping
/// ranges; offset 0 is never issued so 0 can keep meaning "null".
pub struct SimAccelerator {
    arena: Mutex<Vec<u8>>,
}

impl Default for SimAccelerator {
    fn default() -> Self {
        Self::new()
    }
}

impl SimAccelerator {
    pub fn new() -> Self {
        SimAccelerator { arena: Mutex::new(vec![0u8; 1]) }
    }

    /// Grows the arena and returns the offset of the new region.
    pub fn alloc(&self, len: u64) -> u64 {
        let mut arena = self.arena.lock();
        let addr = arena.len() as u64;
        arena.resize(arena.len() + len as usize, 0);
        addr
    }

    pub fn write(&self, addr: u64, data: &[u8]) {
        let mut arena = self.arena.lock();
        arena[addr as usize..addr as usize + data.len()].copy_from_slice(data);
    }

    pub fn read(&self, addr: u64, len: u64) -> Vec<u8> {
        let arena = self.arena.lock();
        arena[addr as usize..addr as usize + len as usize].to_vec()
    }
}

impl AcceleratorRuntime for SimAccelerator {
    fn alloc(&self, len: u64) -> Result<u64> {
        Ok(self.alloc(len))
    }

    fn device_memcpy(&self, dst: u64, src: u64, len: u64) -> Result<()> {
        let mut arena = self.arena.lock();
        let (dst, src, len) = (dst as usize, src as usize, len as usize);
        if dst == src {
            return Ok(());
        }
        let data: Vec<u8> = arena[src..src + len].to_vec();
        arena[dst..dst + len].copy_from_slice(&data);
        Ok(())
    }

    fn host_to_device(&self, dst: u64, src: &[u8]) -> Result<()> {
        self.write(dst, src);
        Ok(())
    }

    fn device_to_host(&self, dst: &mut [u8], src: u64) -> Result<()> {
        let arena = self.arena.lock();
        let src = src as usize;
        dst.copy_from_slice(&arena[src..src + dst.len()]);
        Ok(())
    }
}

/// One-sided fabric over a registry of peer arenas. Each process owns one
/// `SimAccelerator` for its own memory; `register_peer` is how a test wires
/// two processes' fabrics together in lieu of a real network handshake.
pub struct SimFabric {
    local: Arc<SimAccelerator>,
    linked: DashSet<(ClusterId, RankId)>,
    peers: DashMap<(ClusterId, RankId), Arc<SimAccelerator>>,
    next_event: AtomicU64,
    /// Events recorded but not yet destroyed. `SimFabric`'s ops complete
    /// synchronously, so `poll_event` always reports `true`; this set only
    /// exists to catch a caller polling or destroying a handle it never got
    /// from `record_event`, or destroying one twice.
    live_events: DashSet<u64>,
}

impl SimFabric {
    pub fn new(local: Arc<SimAccelerator>) -> Self {
        SimFabric {
            local,
            linked: DashSet::new(),
            peers: DashMap::new(),
            next_event: AtomicU64::new(1),
            live_events: DashSet::new(),
        }
    }

    pub fn register_peer(&self, cluster_id: ClusterId, rank_id: RankId, accel: Arc<SimAccelerator>) {
        self.peers.insert((cluster_id, rank_id), accel);
    }

    fn peer(&self, cluster_id: ClusterId, rank_id: RankId) -> Result<Arc<SimAccelerator>> {
        self.peers
            .get(&(cluster_id, rank_id))
            .map(|r| r.clone())
            .ok_or_else(|| EngineError::NotYetLink(format!("no simulated peer for {cluster_id}:{rank_id}")))
    }
}

impl Fabric for SimFabric {
    fn comm_init(&self, cluster_id: ClusterId, rank_id: RankId) -> Result<()> {
        if !self.linked.insert((cluster_id, rank_id)) {
            return Err(EngineError::AlreadyLink(format!("{cluster_id}:{rank_id}")));
        }
        Ok(())
    }

    fn comm_finalize(&self, cluster_id: ClusterId, rank_id: RankId) -> Result<()> {
        if !self.linked.remove(&(cluster_id, rank_id)).is_some() {
            return Err(EngineError::NotYetLink(format!("{cluster_id}:{rank_id}")));
        }
        Ok(())
    }

    fn comm_bind_mem(&self, _cluster_id: ClusterId, _desc: &MemDesc) -> Result<()> {
        Ok(())
    }

    fn register_global_mem(&self, base_addr: u64, len: u64) -> Result<MemDesc> {
        Ok(MemDesc { base_addr, len, handle: Vec::new() })
    }

    fn comm_prepare(&self, cluster_id: ClusterId, rank_id: RankId, _op_count: usize) -> Result<()> {
        if !self.linked.contains(&(cluster_id, rank_id)) {
            return Err(EngineError::NotYetLink(format!("{cluster_id}:{rank_id}")));
        }
        Ok(())
    }

    fn batch_put(&self, cluster_id: ClusterId, rank_id: RankId, ops: &[OneSideOpDesc]) -> Result<()> {
        let peer = self.peer(cluster_id, rank_id)?;
        for op in ops {
            let data = self.local.read(op.local_addr, op.len);
            peer.write(op.remote_addr, &data);
        }
        Ok(())
    }

    fn batch_get(&self, cluster_id: ClusterId, rank_id: RankId, ops: &[OneSideOpDesc]) -> Result<()> {
        let peer = self.peer(cluster_id, rank_id)?;
        for op in ops {
            let data = peer.read(op.remote_addr, op.len);
            self.local.write(op.local_addr, &data);
        }
        Ok(())
    }

    fn exchange_mem_desc(&self, cluster_id: ClusterId, local: &MemDesc) -> Result<MemDesc> {
        let (_, peer) = self
            .peers
            .iter()
            .find(|entry| entry.key().0 == cluster_id)
            .map(|entry| (*entry.key(), entry.value().clone()))
            .ok_or_else(|| EngineError::NotYetLink(format!("no simulated peer in cluster {cluster_id}")))?;
        let _ = peer;
        Ok(local.clone())
    }

    fn record_event(&self, cluster_id: ClusterId, rank_id: RankId) -> Result<u64> {
        if !self.linked.contains(&(cluster_id, rank_id)) {
            return Err(EngineError::NotYetLink(format!("{cluster_id}:{rank_id}")));
        }
        let event = self.next_event.fetch_add(1, Ordering::SeqCst);
        self.live_events.insert(event);
        Ok(event)
    }

    fn poll_event(&self, _cluster_id: ClusterId, _rank_id: RankId, event: u64) -> Result<bool> {
        if !self.live_events.contains(&event) {
            return Err(EngineError::Internal(format!("poll of unknown event {event}")));
        }
        // Every op before `record_event` ran synchronously, so the event has
        // already signalled by the time it's observable at all.
        Ok(true)
    }

    fn destroy_event(&self, _cluster_id: ClusterId, _rank_id: RankId, event: u64) -> Result<()> {
        if !self.live_events.remove(&event).is_some() {
            return Err(EngineError::Internal(format!("destroy of unknown event {event}")));
        }
        Ok(())
    }
}
