// Shared identifiers and small value types used across the engine: a
// single place for process-wide type aliases, scoped to what the transfer
// engine needs.

use serde::{Deserialize, Serialize};

/// Process-unique dense cache identifier.
pub type CacheId = i64;

/// Sentinel used on the wire for "addressing is by key, not by cache id".
pub const CACHE_ID_BY_KEY: CacheId = -1;

/// Identifies a remote cluster (peer process group).
pub type ClusterId = u64;

/// Rank of a peer within its cluster.
pub type RankId = u32;

/// A caller-supplied request identifier, scoped to a model.
pub type ReqId = u64;

/// Identifies the model a request belongs to (multiple models may share a link).
pub type ModelId = u64;

/// Sentinel meaning "this key is not a prefix key".
pub const NOT_A_PREFIX: u64 = u64::MAX;

/// Index of a batch slot within a contiguous-layout cache.
pub type BatchIndex = u64;

/// Index of a block within a paged/blocked-layout cache.
pub type BlockIndex = u64;

/// Where a cache's bytes physically live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CachePlacement {
    Host,
    Device,
}

impl CachePlacement {
    pub fn from_wire(v: i32) -> Option<Self> {
        match v {
            0 => Some(CachePlacement::Host),
            1 => Some(CachePlacement::Device),
            _ => None,
        }
    }

    pub fn to_wire(self) -> i32 {
        match self {
            CachePlacement::Host => 0,
            CachePlacement::Device => 1,
        }
    }
}

/// How a cache's tensors are shaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheLayout {
    /// `[batch_size, ...]`, stride = per-batch bytes.
    Contiguous,
    /// `[num_blocks, ...]`, stride = per-block bytes.
    Blocks,
    /// Externally registered memory; `num_blocks` may still be nonzero.
    Mix,
}

/// Explicit tagged variants replacing the duck-typed `cache_id=-1` /
/// `prefix_id=MAX` convention used on the wire (DESIGN NOTES, "Duck-typed
/// key types").
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Addressing {
    ById { cache_id: CacheId, batch_index: BatchIndex },
    ByKey { req_id: ReqId, model_id: ModelId },
    ByPrefix { prefix_id: u64, model_id: ModelId },
}

/// `(prompt_cluster_id, req_id_or_prefix_id, model_id)`: the canonical key
/// used to index into the cache manager's key table. `prompt_cluster_id` is
/// included because `req_id` is only unique within the prompt cluster that
/// issued it — two prompt clusters reusing the same `req_id` against the
/// same decoder must not collide. `prompt_cache_id` is left out: it names
/// the very cache this key resolves to, so it cannot also be an input to
/// that resolution. The remaining attribution fields `prompt_cache_id` /
/// `prompt_batch_index` / `is_allocate_blocks` live on `CacheKeyMeta`.
pub type CacheKey = (ClusterId, ReqId, ModelId);

/// Full metadata recorded alongside a `CacheKey`'s binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheKeyMeta {
    pub prompt_cluster_id: ClusterId,
    pub prompt_cache_id: CacheId,
    pub prompt_batch_index: BatchIndex,
    pub req_id: ReqId,
    pub prefix_id: u64,
    pub model_id: ModelId,
    pub is_allocate_blocks: bool,
}

impl CacheKeyMeta {
    pub fn is_prefix(&self) -> bool {
        self.prefix_id != NOT_A_PREFIX
    }

    /// Callers populating `prompt_cluster_id` must set it to the pulling
    /// peer's cluster id (the cluster on the other end of the link this key
    /// was registered for), not some engine-global constant, or eviction
    /// lookups across different peer clusters won't agree on the key.
    pub fn key(&self) -> CacheKey {
        if self.is_prefix() {
            (self.prompt_cluster_id, self.prefix_id, self.model_id)
        } else {
            (self.prompt_cluster_id, self.req_id, self.model_id)
        }
    }
}
