// Collaborator interfaces the engine drives but does not implement itself:
// a device-memory runtime and a one-sided RDMA-style fabric. Production
// builds wire these to vendor SDKs; `sim` below gives an in-process
// software implementation for tests.

use crate::common::{ClusterId, RankId};
use crate::error::Result;

/// A single one-sided put/get descriptor: copy `len` bytes starting at
/// `local_addr` in the caller's address space to/from `remote_addr` in the
/// peer's: the one-sided primitive shape the rest of this module builds on.
#[derive(Debug, Clone, Copy)]
pub struct OneSideOpDesc {
    pub local_addr: u64,
    pub remote_addr: u64,
    pub len: u64,
}

/// Opaque handle returned by `register_mem`, exchanged with peers so they can
/// address into this process's registered region.
#[derive(Debug, Clone)]
pub struct MemDesc {
    pub base_addr: u64,
    pub len: u64,
    pub handle: Vec<u8>,
}

/// Device-side allocate/copy/event primitives. Mirrors the subset of a
/// runtime SDK (`rtMalloc`/`rtMemcpy`/`rtEvent*` in the system this engine's
/// wire format was distilled from) that the transfer jobs actually call.
pub trait AcceleratorRuntime: Send + Sync {
    /// Reserves `len` bytes of device memory and returns its base address.
    /// Backs the pools `MemoryPool`/`RegBufferPool` carve fixed-size buffers
    /// out of, so two pools never alias the same region of the arena.
    fn alloc(&self, len: u64) -> Result<u64>;
    fn device_memcpy(&self, dst: u64, src: u64, len: u64) -> Result<()>;
    fn host_to_device(&self, dst: u64, src: &[u8]) -> Result<()>;
    fn device_to_host(&self, dst: &mut [u8], src: u64) -> Result<()>;
}

/// One-sided communication fabric: link setup, memory registration, and
/// batched put/get against a remote rank's registered memory.
pub trait Fabric: Send + Sync {
    /// Establishes (or re-establishes) the transport-level connection to a
    /// peer rank within a cluster.
    fn comm_init(&self, cluster_id: ClusterId, rank_id: RankId) -> Result<()>;

    /// Tears down the transport-level connection.
    fn comm_finalize(&self, cluster_id: ClusterId, rank_id: RankId) -> Result<()>;

    /// Binds a registered memory region so the peer's one-sided ops can
    /// target it.
    fn comm_bind_mem(&self, cluster_id: ClusterId, desc: &MemDesc) -> Result<()>;

    /// Registers a local region for remote one-sided access, returning the
    /// descriptor peers need to exchange.
    fn register_global_mem(&self, base_addr: u64, len: u64) -> Result<MemDesc>;

    /// Readies the transport for a burst of ops against `cluster_id` (credit
    /// reservation / queue-pair warm-up, depending on the backing transport).
    fn comm_prepare(&self, cluster_id: ClusterId, rank_id: RankId, op_count: usize) -> Result<()>;

    /// Pushes local bytes into a peer's registered memory.
    fn batch_put(&self, cluster_id: ClusterId, rank_id: RankId, ops: &[OneSideOpDesc]) -> Result<()>;

    /// Pulls bytes out of a peer's registered memory into local memory.
    fn batch_get(&self, cluster_id: ClusterId, rank_id: RankId, ops: &[OneSideOpDesc]) -> Result<()>;

    /// Exchanges this process's memory descriptor with a peer's, returning
    /// the peer's descriptor for the same logical region.
    fn exchange_mem_desc(&self, cluster_id: ClusterId, local: &MemDesc) -> Result<MemDesc>;

    /// Records a completion event for the ops already submitted against
    /// `cluster_id`/`rank_id`, returning a handle `poll_event`/`destroy_event`
    /// use to track it. Lets a job span several FSM ticks: submit a batch,
    /// record an event, and only move on once that event signals.
    fn record_event(&self, cluster_id: ClusterId, rank_id: RankId) -> Result<u64>;

    /// Returns whether the event has signalled yet. Never blocks.
    fn poll_event(&self, cluster_id: ClusterId, rank_id: RankId, event: u64) -> Result<bool>;

    /// Releases an event handle once `poll_event` has reported it signalled.
    fn destroy_event(&self, cluster_id: ClusterId, rank_id: RankId, event: u64) -> Result<()>;
}
