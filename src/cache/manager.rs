// Cache registration and key bookkeeping, with auto-evict-on-pull-completion
// logic and an access-table-updater callback shape adapted from a reference
// FSM's `QueryCacheEntryAndOffset` and `CacheAccessTableUpdater`.

use crate::cache::access_table::{CacheAccessTable, EntrySnapshot, KeyRecord};
use crate::cache::entry::CacheEntry;
use crate::common::{BatchIndex, CacheId, CacheKey, CacheKeyMeta};
use crate::error::{EngineError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

struct ManagedEntry {
    entry: CacheEntry,
    /// `batch_index -> key` binding, mirrors `CacheEntry::id_to_batch_index_and_size`
    /// but keyed the other way for removal-by-batch-index.
    keys: HashMap<BatchIndex, CacheKeyMeta>,
    /// Set once `unregister` is called while keys are still outstanding; the
    /// entry is freed for real only once `keys` drains to empty.
    pending_removal: bool,
}

/// Tracks every locally-registered cache and the `CacheKey` bindings pointing
/// into it. All mutating operations take a single short-lived lock and, on
/// success, republish the access table snapshot peers read from.
pub struct CacheManager {
    state: Mutex<HashMap<CacheId, ManagedEntry>>,
    key_index: Mutex<HashMap<CacheKey, CacheId>>,
    next_cache_id: AtomicI64,
    access_table: Arc<CacheAccessTable>,
}

impl CacheManager {
    pub fn new(access_table: Arc<CacheAccessTable>) -> Self {
        CacheManager {
            state: Mutex::new(HashMap::new()),
            key_index: Mutex::new(HashMap::new()),
            next_cache_id: AtomicI64::new(1),
            access_table,
        }
    }

    /// Registers (or allocates, for an engine-owned pool region) a cache and
    /// assigns it a dense id, overwriting whatever `entry.cache_id` carried.
    pub fn register(&self, mut entry: CacheEntry) -> Result<CacheId> {
        let cache_id = self.next_cache_id.fetch_add(1, Ordering::SeqCst);
        entry.cache_id = cache_id;
        entry.validate()?;
        let mut state = self.state.lock();
        state.insert(
            cache_id,
            ManagedEntry { entry, keys: HashMap::new(), pending_removal: false },
        );
        self.publish_locked(&state);
        Ok(cache_id)
    }

    /// Removes a cache immediately if it has no outstanding keys; otherwise
    /// marks it retained until the last key is removed via `remove_key`.
    pub fn unregister(&self, cache_id: CacheId) -> Result<()> {
        let mut state = self.state.lock();
        let managed = state
            .get_mut(&cache_id)
            .ok_or_else(|| EngineError::CacheNotExist(format!("cache {cache_id}")))?;
        if managed.keys.is_empty() {
            state.remove(&cache_id);
        } else {
            managed.pending_removal = true;
        }
        self.publish_locked(&state);
        Ok(())
    }

    /// Binds a `CacheKey` to a `(cache_id, batch_index)` slot. Fails if the
    /// key already points elsewhere, or if that slot already has a key
    /// At most one live key per slot.
    pub fn register_key(&self, cache_id: CacheId, meta: CacheKeyMeta) -> Result<()> {
        let mut state = self.state.lock();
        let mut key_index = self.key_index.lock();

        let key = meta.key();
        if let Some(existing) = key_index.get(&key) {
            if *existing != cache_id {
                return Err(EngineError::ParamInvalid(format!(
                    "key {key:?} already bound to cache {existing}"
                )));
            }
        }

        let managed = state
            .get_mut(&cache_id)
            .ok_or_else(|| EngineError::CacheNotExist(format!("cache {cache_id}")))?;
        if managed.keys.contains_key(&meta.prompt_batch_index) {
            return Err(EngineError::ParamInvalid(format!(
                "cache {cache_id} batch_index {} already has a key bound",
                meta.prompt_batch_index
            )));
        }

        managed
            .entry
            .id_to_batch_index_and_size
            .insert((meta.req_id, meta.model_id), (meta.prompt_batch_index, managed.entry.stride));
        key_index.insert(key, cache_id);
        managed.keys.insert(meta.prompt_batch_index, meta);
        self.publish_locked(&state);
        Ok(())
    }

    /// Erases a key binding. If the owning cache was pending removal and this
    /// was its last key, the cache is freed now.
    pub fn remove_key(&self, key: CacheKey) -> Result<()> {
        let mut state = self.state.lock();
        let mut key_index = self.key_index.lock();

        let cache_id = key_index
            .remove(&key)
            .ok_or_else(|| EngineError::ParamInvalid(format!("no such key: {key:?}")))?;
        if let Some(managed) = state.get_mut(&cache_id) {
            let mut removed = Vec::new();
            managed.keys.retain(|_, meta| {
                if meta.key() == key {
                    removed.push((meta.req_id, meta.model_id));
                    false
                } else {
                    true
                }
            });
            for id_key in &removed {
                managed.entry.id_to_batch_index_and_size.remove(id_key);
            }
            if managed.pending_removal && managed.keys.is_empty() {
                state.remove(&cache_id);
            }
        }
        self.publish_locked(&state);
        Ok(())
    }

    pub fn get_entry(&self, cache_id: CacheId) -> Option<CacheEntry> {
        self.state.lock().get(&cache_id).map(|m| m.entry.clone())
    }

    /// Resolves a `CacheKey` to its owning cache id and a clone of the entry.
    pub fn get_entry_by_key(&self, key: CacheKey) -> Option<(CacheId, CacheEntry)> {
        let key_index = self.key_index.lock();
        let cache_id = *key_index.get(&key)?;
        self.state.lock().get(&cache_id).map(|m| (cache_id, m.entry.clone()))
    }

    pub fn get_key_meta(&self, cache_id: CacheId, batch_index: BatchIndex) -> Option<CacheKeyMeta> {
        self.state.lock().get(&cache_id)?.keys.get(&batch_index).cloned()
    }

    /// Copies tensor data between two registered caches, index pair by index
    /// pair, using the caller-provided raw-memory copy primitive (an
    /// accelerator's device-to-device or host-to-device memcpy). Both caches
    /// must share `num_tensors` and `tensor_size`.
    pub fn copy_cache(
        &self,
        src_id: CacheId,
        dst_id: CacheId,
        index_pairs: &[(u64, u64)],
        mut copy_fn: impl FnMut(u64, u64, u64) -> Result<()>,
    ) -> Result<()> {
        let state = self.state.lock();
        let src = &state
            .get(&src_id)
            .ok_or_else(|| EngineError::CacheNotExist(format!("cache {src_id}")))?
            .entry;
        let dst = &state
            .get(&dst_id)
            .ok_or_else(|| EngineError::CacheNotExist(format!("cache {dst_id}")))?
            .entry;
        if src.num_tensors != dst.num_tensors {
            return Err(EngineError::ParamInvalid(format!(
                "copy_cache: tensor count mismatch {} vs {}",
                src.num_tensors, dst.num_tensors
            )));
        }
        for &(src_index, dst_index) in index_pairs {
            for tensor in 0..src.num_tensors as u64 {
                let src_addr = src.cache_addrs[tensor as usize] + src_index * src.stride;
                let dst_addr = dst.cache_addrs[tensor as usize] + dst_index * dst.stride;
                let len = src.stride.min(dst.stride);
                copy_fn(src_addr, dst_addr, len)?;
            }
        }
        Ok(())
    }

    fn publish_locked(&self, state: &HashMap<CacheId, ManagedEntry>) {
        let snapshots: Vec<EntrySnapshot> = state
            .values()
            .map(|m| {
                let keys = m
                    .keys
                    .values()
                    .map(|meta| KeyRecord {
                        req_id: meta.req_id,
                        model_id: meta.model_id,
                        batch_index: meta.prompt_batch_index,
                        size: m.entry.stride,
                    })
                    .collect();
                EntrySnapshot::from_entry(&m.entry, keys)
            })
            .collect();
        // Best-effort: a snapshot that somehow exceeds the fixed region is
        // logged and skipped rather than poisoning the manager's own state.
        if let Err(err) = self.access_table.publish(&snapshots) {
            tracing::warn!(error = %err, "failed to publish cache access table");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{CacheLayout, CachePlacement};
    use std::collections::HashMap as Map;

    fn entry(num_tensors: u32) -> CacheEntry {
        CacheEntry {
            cache_id: 0,
            placement: CachePlacement::Device,
            layout: CacheLayout::Contiguous,
            num_tensors,
            cache_addrs: (0..num_tensors as u64).map(|i| 0x1000 + i * 0x100).collect(),
            tensor_size: 4096,
            batch_size: 8,
            num_blocks: 0,
            stride: 512,
            is_owned: true,
            remote_accessible: false,
            id_to_batch_index_and_size: Map::new(),
        }
    }

    fn key_meta(req_id: u64, batch_index: u64) -> CacheKeyMeta {
        CacheKeyMeta {
            prompt_cluster_id: 1,
            prompt_cache_id: 0,
            prompt_batch_index: batch_index,
            req_id,
            prefix_id: crate::common::NOT_A_PREFIX,
            model_id: 0,
            is_allocate_blocks: false,
        }
    }

    #[test]
    fn register_then_unregister_with_no_keys_frees_immediately() {
        let mgr = CacheManager::new(Arc::new(CacheAccessTable::new()));
        let id = mgr.register(entry(2)).unwrap();
        assert!(mgr.get_entry(id).is_some());
        mgr.unregister(id).unwrap();
        assert!(mgr.get_entry(id).is_none());
    }

    #[test]
    fn unregister_with_outstanding_key_is_deferred() {
        let mgr = CacheManager::new(Arc::new(CacheAccessTable::new()));
        let id = mgr.register(entry(1)).unwrap();
        mgr.register_key(id, key_meta(7, 0)).unwrap();
        mgr.unregister(id).unwrap();
        assert!(mgr.get_entry(id).is_some(), "entry must survive while key is live");
        mgr.remove_key((1, 7, 0)).unwrap();
        assert!(mgr.get_entry(id).is_none());
    }

    #[test]
    fn duplicate_key_binding_to_different_cache_fails() {
        let mgr = CacheManager::new(Arc::new(CacheAccessTable::new()));
        let a = mgr.register(entry(1)).unwrap();
        let b = mgr.register(entry(1)).unwrap();
        mgr.register_key(a, key_meta(1, 0)).unwrap();
        let err = mgr.register_key(b, key_meta(1, 0)).unwrap_err();
        assert_eq!(err.kind(), "ParamInvalid");
    }

    #[test]
    fn copy_cache_requires_matching_tensor_count() {
        let mgr = CacheManager::new(Arc::new(CacheAccessTable::new()));
        let a = mgr.register(entry(1)).unwrap();
        let b = mgr.register(entry(2)).unwrap();
        let err = mgr.copy_cache(a, b, &[(0, 0)], |_, _, _| Ok(())).unwrap_err();
        assert_eq!(err.kind(), "ParamInvalid");
    }
}
