// Shared addressing helpers every transfer job needs: which tensors a
// request is restricted to, and the per-request source offset a contiguous
// (non-block) pull must add on top of a buffer info's own block offset.

use crate::cache::CacheEntry;
use crate::wire::TransferCacheReq;
use std::ops::Range;

/// The tensor indices this request actually touches. A nonzero
/// `src_tensor_indices_size` restricts the pull to a contiguous slice
/// `[src_tensor_start_index, src_tensor_start_index + src_tensor_indices_size)`
/// of the source's tensor list (a "layer range" pull); otherwise every
/// tensor in the source is in play.
pub fn tensor_range(req: &TransferCacheReq, entry: &CacheEntry) -> Range<usize> {
    if req.src_tensor_indices_size > 0 {
        let start = req.src_tensor_start_index as usize;
        start..start + req.src_tensor_indices_size as usize
    } else {
        0..entry.num_tensors as usize
    }
}

/// Extra byte offset a contiguous-layout source address needs on top of a
/// `BufferInfo::block_start_index * stride` term. Block pulls already
/// encode which row to read via `block_start_index`, so this is zero for
/// them; contiguous pulls instead select their row via `batch_index`.
pub fn contiguous_source_offset(req: &TransferCacheReq, entry: &CacheEntry) -> u64 {
    if req.is_pull_block {
        0
    } else {
        req.batch_index * entry.stride
    }
}
