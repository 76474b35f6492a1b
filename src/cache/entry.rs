// Registered-cache data model.

use crate::common::{BatchIndex, CacheId, CacheLayout, CachePlacement, ModelId, ReqId};
use crate::error::{EngineError, Result};
use std::collections::HashMap;

/// A registered KV-cache payload.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub cache_id: CacheId,
    pub placement: CachePlacement,
    pub layout: CacheLayout,
    pub num_tensors: u32,
    /// Ordered base pointers, one per tensor. Never zero.
    pub cache_addrs: Vec<u64>,
    pub tensor_size: u64,
    pub batch_size: u32,
    pub num_blocks: u64,
    pub stride: u64,
    pub is_owned: bool,
    pub remote_accessible: bool,
    /// Maps a `(req_id, model_id)` request key to the batch slot it owns,
    /// used to auto-evict the key once its pull completes.
    pub id_to_batch_index_and_size: HashMap<(ReqId, ModelId), (BatchIndex, u64)>,
}

impl CacheEntry {
    pub fn validate(&self) -> Result<()> {
        if self.cache_addrs.len() != self.num_tensors as usize {
            return Err(EngineError::ParamInvalid(format!(
                "cache {}: cache_addrs.len()={} != num_tensors={}",
                self.cache_id,
                self.cache_addrs.len(),
                self.num_tensors
            )));
        }
        if self.cache_addrs.iter().any(|a| *a == 0) {
            return Err(EngineError::ParamInvalid(format!(
                "cache {}: a tensor base address is null",
                self.cache_id
            )));
        }
        let is_blocks = matches!(self.layout, CacheLayout::Blocks);
        if is_blocks != (self.num_blocks > 0) {
            return Err(EngineError::ParamInvalid(format!(
                "cache {}: layout={:?} but num_blocks={}",
                self.cache_id, self.layout, self.num_blocks
            )));
        }
        Ok(())
    }

    pub fn is_blocked(&self) -> bool {
        self.num_blocks > 0
    }
}
