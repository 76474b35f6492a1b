// Device-to-device transfer: both the source cache and the destination the
// requester named live on an accelerator, so the whole job is a sequence of
// one-sided put batches: a per-tensor, per-buffer-range descriptor loop
// capped at 64 ops per fabric call (`MAX_OPS_PER_BATCH`) and at
// `job::MAX_TASK_NUM` descriptors drained per FSM tick.

use crate::cache::CacheEntry;
use crate::common::{ClusterId, RankId};
use crate::error::{EngineError, Result};
use crate::fabric::{Fabric, OneSideOpDesc};
use crate::transfer::addressing;
use crate::transfer::job::{JobProgress, MAX_TASK_NUM};
use crate::wire::TransferCacheReq;
use std::collections::VecDeque;

pub const MAX_OPS_PER_BATCH: usize = 64;

/// A device-to-device pull, already reduced to its flat descriptor list.
/// `step` drains at most `MAX_TASK_NUM` of them per call, submitted in
/// `MAX_OPS_PER_BATCH`-sized fabric batches, then records a completion event
/// and yields; the next `step` call polls that event before moving on.
pub struct D2DJob {
    remaining: VecDeque<OneSideOpDesc>,
    pending_event: Option<u64>,
    bytes_done: u64,
}

impl D2DJob {
    pub fn new(entry: &CacheEntry, req: &TransferCacheReq) -> Result<Self> {
        let range = addressing::tensor_range(req, entry);
        if req.dst_addrs.len() != range.len() {
            return Err(EngineError::ParamInvalid(format!(
                "d2d: dst_addrs.len()={} != tensor range len={}",
                req.dst_addrs.len(),
                range.len()
            )));
        }
        if req.src_buffer_infos.len() != req.dst_buffer_infos.len() {
            return Err(EngineError::ParamInvalid(format!(
                "d2d: src_buffer_infos.len()={} != dst_buffer_infos.len()={}",
                req.src_buffer_infos.len(),
                req.dst_buffer_infos.len()
            )));
        }

        let offset = addressing::contiguous_source_offset(req, entry);
        let mut ops = VecDeque::with_capacity(range.len() * req.src_buffer_infos.len());
        for (i, tensor) in range.enumerate() {
            let dst_addr = req.dst_addrs[i];
            for (src_info, dst_info) in req.src_buffer_infos.iter().zip(req.dst_buffer_infos.iter()) {
                if src_info.buffer_len != dst_info.buffer_len {
                    return Err(EngineError::ParamInvalid(format!(
                        "d2d: buffer_len mismatch {} vs {}",
                        src_info.buffer_len, dst_info.buffer_len
                    )));
                }
                ops.push_back(OneSideOpDesc {
                    local_addr: entry.cache_addrs[tensor] + offset + src_info.block_start_index * entry.stride,
                    remote_addr: dst_addr + dst_info.block_start_index * entry.stride,
                    len: src_info.buffer_len,
                });
            }
        }

        Ok(D2DJob { remaining: ops, pending_event: None, bytes_done: 0 })
    }

    pub fn step(&mut self, fabric: &dyn Fabric, cluster_id: ClusterId, rank_id: RankId) -> Result<JobProgress> {
        if let Some(event) = self.pending_event {
            if !fabric.poll_event(cluster_id, rank_id, event)? {
                return Ok(JobProgress::Continue);
            }
            fabric.destroy_event(cluster_id, rank_id, event)?;
            self.pending_event = None;
        }

        if self.remaining.is_empty() {
            return Ok(JobProgress::Done(self.bytes_done));
        }

        let take = self.remaining.len().min(MAX_TASK_NUM);
        let slice: Vec<OneSideOpDesc> = self.remaining.drain(..take).collect();
        for chunk in slice.chunks(MAX_OPS_PER_BATCH) {
            fabric.comm_prepare(cluster_id, rank_id, chunk.len())?;
            fabric.batch_put(cluster_id, rank_id, chunk)?;
        }
        self.bytes_done += slice.iter().map(|op| op.len).sum::<u64>();
        self.pending_event = Some(fabric.record_event(cluster_id, rank_id)?);
        Ok(JobProgress::Continue)
    }
}

/// Drives `job` to completion in-process, for tests that don't go through
/// `comm::entity`'s tick loop.
#[cfg(test)]
fn run_to_completion(job: &mut D2DJob, fabric: &dyn Fabric, cluster_id: ClusterId, rank_id: RankId) -> Result<u64> {
    loop {
        match job.step(fabric, cluster_id, rank_id)? {
            JobProgress::Continue => continue,
            JobProgress::Done(bytes) => return Ok(bytes),
        }
    }
}
