// Device-to-host transfer: the source tensor lives on an accelerator the
// fabric cannot RDMA out of directly, so each range is staged through a
// fabric-registered host bounce buffer before the one-sided put. Built via
// the same addressing/tensor-range/batch-index scheme as `d2d`, with an
// extra host-side stage copy per chunk.

use crate::cache::CacheEntry;
use crate::common::{ClusterId, RankId};
use crate::error::{EngineError, Result};
use crate::fabric::{AcceleratorRuntime, Fabric, OneSideOpDesc};
use crate::memory::RegBufferPool;
use crate::transfer::addressing;
use crate::transfer::job::{JobProgress, MAX_TASK_NUM};
use crate::wire::TransferCacheReq;
use std::collections::VecDeque;

struct StageTask {
    src_addr: u64,
    dst_addr: u64,
    len: u64,
}

/// Device-to-host pull. `step` stages and puts at most `MAX_TASK_NUM` chunks
/// per call, then records a completion event and yields; the next `step`
/// call polls that event before moving on.
pub struct D2HJob {
    remaining: VecDeque<StageTask>,
    pending_event: Option<u64>,
    bytes_done: u64,
}

impl D2HJob {
    pub fn new(entry: &CacheEntry, req: &TransferCacheReq, stage_size: u64) -> Result<Self> {
        let range = addressing::tensor_range(req, entry);
        if req.dst_addrs.len() != range.len() {
            return Err(EngineError::ParamInvalid(format!(
                "d2h: dst_addrs.len()={} != tensor range len={}",
                req.dst_addrs.len(),
                range.len()
            )));
        }
        if req.src_buffer_infos.len() != req.dst_buffer_infos.len() {
            return Err(EngineError::ParamInvalid(
                "d2h: src_buffer_infos and dst_buffer_infos length mismatch".into(),
            ));
        }

        let offset = addressing::contiguous_source_offset(req, entry);
        let mut tasks = VecDeque::new();
        for (i, tensor) in range.enumerate() {
            let dst_addr = req.dst_addrs[i];
            for (src_info, dst_info) in req.src_buffer_infos.iter().zip(req.dst_buffer_infos.iter()) {
                if src_info.buffer_len != dst_info.buffer_len {
                    return Err(EngineError::ParamInvalid(format!(
                        "d2h: buffer_len mismatch {} vs {}",
                        src_info.buffer_len, dst_info.buffer_len
                    )));
                }
                let mut remaining = src_info.buffer_len;
                let mut src_cursor = entry.cache_addrs[tensor] + offset + src_info.block_start_index * entry.stride;
                let mut dst_cursor = dst_addr + dst_info.block_start_index * entry.stride;
                while remaining > 0 {
                    let chunk = remaining.min(stage_size);
                    tasks.push_back(StageTask { src_addr: src_cursor, dst_addr: dst_cursor, len: chunk });
                    remaining -= chunk;
                    src_cursor += chunk;
                    dst_cursor += chunk;
                }
            }
        }

        Ok(D2HJob { remaining: tasks, pending_event: None, bytes_done: 0 })
    }

    pub fn step(
        &mut self,
        accel: &dyn AcceleratorRuntime,
        fabric: &dyn Fabric,
        bounce: &RegBufferPool,
        cluster_id: ClusterId,
        rank_id: RankId,
    ) -> Result<JobProgress> {
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
        for _ in 0..take {
            let task = self.remaining.pop_front().expect("checked non-empty above");
            let stage_addr = bounce.checkout()?;
            accel.device_memcpy(stage_addr, task.src_addr, task.len)?;
            fabric.comm_prepare(cluster_id, rank_id, 1)?;
            let put_result = fabric.batch_put(
                cluster_id,
                rank_id,
                &[OneSideOpDesc { local_addr: stage_addr, remote_addr: task.dst_addr, len: task.len }],
            );
            bounce.checkin(stage_addr);
            put_result?;
            self.bytes_done += task.len;
        }
        self.pending_event = Some(fabric.record_event(cluster_id, rank_id)?);
        Ok(JobProgress::Continue)
    }
}

#[cfg(test)]
fn run_to_completion(
    job: &mut D2HJob,
    accel: &dyn AcceleratorRuntime,
    fabric: &dyn Fabric,
    bounce: &RegBufferPool,
    cluster_id: ClusterId,
    rank_id: RankId,
) -> Result<u64> {
    loop {
        match job.step(accel, fabric, bounce, cluster_id, rank_id)? {
            JobProgress::Continue => continue,
            JobProgress::Done(bytes) => return Ok(bytes),
        }
    }
}
