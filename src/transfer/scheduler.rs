// Dispatches an inbound `TransferCacheReq` to the right transfer job, in
// the same resolve-type / check-param / query-cache-entry sequence a
// reference send-path state handler uses. `prepare` builds the job but does
// not run it — `comm::entity` drives it to completion one FSM tick at a
// time via `SendJob::step`.

use crate::cache::{CacheEntry, CacheManager};
use crate::common::{Addressing, CacheId, CachePlacement, ClusterId, NOT_A_PREFIX};
use crate::error::{EngineError, Result};
use crate::memory::RegBufferPool;
use crate::transfer::job::SendJob;
use crate::transfer::{d2d, d2h, h2d};
use crate::wire::{ResponseInfo, TransferCacheReq};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    D2D,
    D2H,
    H2D,
}

/// `cache_id = -1` means "resolve by key"; a `prefix_id` other than the
/// sentinel means "resolve by prefix" and takes precedence over a plain
/// request key (a prefix binds a whole shared block range, not a single
/// request's slot).
pub fn resolve_addressing(req: &TransferCacheReq) -> Addressing {
    if req.cache_id != crate::common::CACHE_ID_BY_KEY {
        Addressing::ById { cache_id: req.cache_id, batch_index: req.batch_index }
    } else if req.prefix_id != NOT_A_PREFIX {
        Addressing::ByPrefix { prefix_id: req.prefix_id, model_id: req.model_id }
    } else {
        Addressing::ByKey { req_id: req.req_id, model_id: req.model_id }
    }
}

pub fn resolve_transfer_kind(src: CachePlacement, dst: CachePlacement) -> Result<TransferKind> {
    match (src, dst) {
        (CachePlacement::Device, CachePlacement::Device) => Ok(TransferKind::D2D),
        (CachePlacement::Device, CachePlacement::Host) => Ok(TransferKind::D2H),
        (CachePlacement::Host, CachePlacement::Device) => Ok(TransferKind::H2D),
        (CachePlacement::Host, CachePlacement::Host) => Err(EngineError::ParamInvalid(
            "host-to-host transfers are not supported".into(),
        )),
    }
}

/// Structural checks that don't need the resolved cache entry: wire-level
/// counts must agree with the payload actually attached to the request.
fn pre_check(req: &TransferCacheReq) -> Result<()> {
    if req.dst_addrs.len() != req.dst_addr_count as usize {
        return Err(EngineError::ParamInvalid("dst_addr_count mismatch".into()));
    }
    if req.src_buffer_infos.len() != req.buffer_info_count as usize
        || req.dst_buffer_infos.len() != req.buffer_info_count as usize
    {
        return Err(EngineError::ParamInvalid("buffer_info_count mismatch".into()));
    }
    Ok(())
}

/// Five checks run in this fixed order against the resolved source entry,
/// mirroring a reference send-path's `CheckParam`.
fn check_param(req: &TransferCacheReq, entry: &CacheEntry) -> Result<()> {
    if req.num_tensors != entry.num_tensors {
        return Err(EngineError::ParamInvalid(format!(
            "num_tensors {} does not match source cache's {}",
            req.num_tensors, entry.num_tensors
        )));
    }
    if req.is_pull_block != entry.is_blocked() {
        return Err(EngineError::ParamInvalid(format!(
            "is_pull_block={} but source cache is_blocked={}",
            req.is_pull_block,
            entry.is_blocked()
        )));
    }
    if req.is_pull_block && req.max_block_index >= entry.num_blocks {
        return Err(EngineError::ParamInvalid(format!(
            "max_block_index {} out of bounds for {} blocks",
            req.max_block_index, entry.num_blocks
        )));
    }
    if req.pull_size > entry.stride {
        return Err(EngineError::ParamInvalid(format!(
            "pull_size {} exceeds cache stride {}",
            req.pull_size, entry.stride
        )));
    }
    if req.src_tensor_indices_size > 0 {
        let end = req.src_tensor_start_index as u64 + req.src_tensor_indices_size as u64;
        if end > entry.num_tensors as u64 {
            return Err(EngineError::ParamInvalid(format!(
                "tensor range [{}, {end}) exceeds source's {} tensors",
                req.src_tensor_start_index, entry.num_tensors
            )));
        }
    }
    Ok(())
}

/// A job built and ready to be driven, plus the bookkeeping needed to
/// evict its key and build a response once it finishes.
pub struct PreparedJob {
    pub job: SendJob,
    pub cache_id: CacheId,
    pub entry: CacheEntry,
}

/// Resolves the request's source entry, validates it, and constructs the
/// matching job without running it.
pub fn prepare(
    req: &TransferCacheReq,
    cache_manager: &CacheManager,
    cluster_id: ClusterId,
    host_bounce: Option<&RegBufferPool>,
) -> Result<PreparedJob> {
    pre_check(req)?;
    let (cache_id, entry) = resolve_entry(req, cache_manager, cluster_id)?;
    check_param(req, &entry)?;

    let dst_placement = CachePlacement::from_wire(req.dst_placement)
        .ok_or_else(|| EngineError::ParamInvalid(format!("bad dst_placement: {}", req.dst_placement)))?;
    let kind = resolve_transfer_kind(entry.placement, dst_placement)?;

    let job = match kind {
        TransferKind::D2D => SendJob::D2D(d2d::D2DJob::new(&entry, req)?),
        TransferKind::D2H => {
            let bounce = host_bounce
                .ok_or_else(|| EngineError::FeatureNotEnabled("no host bounce pool configured".into()))?;
            SendJob::D2H(d2h::D2HJob::new(&entry, req, bounce.buffer_size())?)
        }
        TransferKind::H2D => {
            let bounce = host_bounce
                .ok_or_else(|| EngineError::FeatureNotEnabled("no host bounce pool configured".into()))?;
            let _ = bounce;
            SendJob::H2D(h2d::H2DJob::new(&entry, req, h2d::DEFAULT_BUFFER_NUM)?)
        }
    };

    Ok(PreparedJob { job, cache_id, entry })
}

/// Builds the response to hand back to the requester, and applies the
/// key-eviction-on-pull rule once the job's outcome (success or failure) is
/// known, mirroring `QueryCacheEntryAndOffset`'s
/// `!is_prefix && is_owned && !is_pull_block` eviction rule.
pub fn finish(
    req: &TransferCacheReq,
    cache_id: CacheId,
    entry: &CacheEntry,
    cache_manager: &CacheManager,
    cluster_id: ClusterId,
    result: Result<u64>,
) -> (ResponseInfo, u64) {
    let outcome = match &result {
        Ok(bytes) => (
            ResponseInfo::success(req.req_id, req.model_id, req.buffer_info_count, req.block_size as u32),
            *bytes,
        ),
        Err(err) => (ResponseInfo::failure(req.req_id, req.model_id, err), 0),
    };
    maybe_evict_key(req, cache_id, entry, cache_manager, cluster_id);
    outcome
}

fn resolve_entry(
    req: &TransferCacheReq,
    cache_manager: &CacheManager,
    cluster_id: ClusterId,
) -> Result<(CacheId, CacheEntry)> {
    match resolve_addressing(req) {
        Addressing::ById { cache_id, .. } => {
            let entry = cache_manager
                .get_entry(cache_id)
                .ok_or_else(|| EngineError::CacheNotExist(format!("cache {cache_id}")))?;
            Ok((cache_id, entry))
        }
        Addressing::ByKey { req_id, model_id } | Addressing::ByPrefix { prefix_id: req_id, model_id } => {
            cache_manager
                .get_entry_by_key((cluster_id, req_id, model_id))
                .ok_or_else(|| EngineError::CacheNotExist(format!("key ({cluster_id}, {req_id}, {model_id})")))
        }
    }
}

fn maybe_evict_key(
    req: &TransferCacheReq,
    cache_id: CacheId,
    entry: &CacheEntry,
    cache_manager: &CacheManager,
    cluster_id: ClusterId,
) {
    let _ = cache_id;
    let is_prefix = req.prefix_id != NOT_A_PREFIX;
    if !is_prefix && entry.is_owned && !req.is_pull_block {
        let _ = cache_manager.remove_key((cluster_id, req.req_id, req.model_id));
    }
}
