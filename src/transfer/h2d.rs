// Host-to-device transfer: the source tensor lives in host memory and the
// destination is a peer's device memory. The most elaborate of the three
// jobs: two rotating staging buffers (`DEFAULT_BUFFER_NUM`, 32 MiB each) are
// each driven through their own Idle -> Copy -> AwaitingEvent -> End cycle,
// fed batch by batch from a `TaskBatcher` over the request's data ranges.
// While one buffer is mid-flight waiting on its put to land, the other can
// already be staging its next batch, so copy and transfer pipeline.

use crate::cache::CacheEntry;
use crate::common::{ClusterId, RankId};
use crate::error::{EngineError, Result};
use crate::fabric::{AcceleratorRuntime, Fabric, OneSideOpDesc};
use crate::memory::RegBufferPool;
use crate::transfer::addressing;
use crate::transfer::batcher::{BufferSlice, DataRange, MAX_SLICE_SIZE, TaskBatcher};
use crate::transfer::job::JobProgress;
use crate::wire::TransferCacheReq;
use parking_lot::Mutex;
use std::collections::VecDeque;

pub const DEFAULT_WORKER_COUNT: usize = 8;
pub const DEFAULT_BUFFER_NUM: usize = 2;
pub const BUFFER_SIZE: u64 = 32 * 1024 * 1024;

/// A batch can never carry more bytes than fit in one staging buffer: each
/// `TaskBatcher` slice is at most `MAX_SLICE_SIZE`, so capping the slice
/// count at `BUFFER_SIZE / MAX_SLICE_SIZE` bounds a batch's total size at
/// `BUFFER_SIZE`.
const MAX_SLICES_PER_BATCH: usize = (BUFFER_SIZE / MAX_SLICE_SIZE) as usize;

struct RangeMeta {
    src_base: u64,
    dst_base: u64,
}

enum BufferState {
    Idle,
    Copy { slices: Vec<BufferSlice> },
    AwaitingEvent { event: u64 },
    End,
}

struct BufferCtx {
    state: BufferState,
    stage_addr: Option<u64>,
}

/// Host-to-device pull, driven one buffer-state-transition per `step` call
/// per buffer.
pub struct H2DJob {
    metas: Vec<RangeMeta>,
    batcher: TaskBatcher,
    buffers: Vec<BufferCtx>,
    bytes_done: u64,
}

impl H2DJob {
    pub fn new(entry: &CacheEntry, req: &TransferCacheReq, buffer_num: usize) -> Result<Self> {
        let range = addressing::tensor_range(req, entry);
        if req.dst_addrs.len() != range.len() {
            return Err(EngineError::ParamInvalid(format!(
                "h2d: dst_addrs.len()={} != tensor range len={}",
                req.dst_addrs.len(),
                range.len()
            )));
        }
        if req.src_buffer_infos.len() != req.dst_buffer_infos.len() {
            return Err(EngineError::ParamInvalid(
                "h2d: src_buffer_infos and dst_buffer_infos length mismatch".into(),
            ));
        }

        let offset = addressing::contiguous_source_offset(req, entry);
        let mut metas = Vec::new();
        let mut data_ranges = Vec::new();
        for (i, tensor) in range.enumerate() {
            let dst_addr = req.dst_addrs[i];
            for (src_info, dst_info) in req.src_buffer_infos.iter().zip(req.dst_buffer_infos.iter()) {
                if src_info.buffer_len != dst_info.buffer_len {
                    return Err(EngineError::ParamInvalid(format!(
                        "h2d: buffer_len mismatch {} vs {}",
                        src_info.buffer_len, dst_info.buffer_len
                    )));
                }
                let index = metas.len();
                metas.push(RangeMeta {
                    src_base: entry.cache_addrs[tensor] + offset + src_info.block_start_index * entry.stride,
                    dst_base: dst_addr + dst_info.block_start_index * entry.stride,
                });
                data_ranges.push(DataRange { tensor_index: index, offset: 0, len: src_info.buffer_len });
            }
        }

        let buffers = (0..buffer_num.max(1))
            .map(|_| BufferCtx { state: BufferState::Idle, stage_addr: None })
            .collect();

        Ok(H2DJob { metas, batcher: TaskBatcher::new(data_ranges), buffers, bytes_done: 0 })
    }

    pub fn step(
        &mut self,
        accel: &dyn AcceleratorRuntime,
        fabric: &dyn Fabric,
        bounce: &RegBufferPool,
        cluster_id: ClusterId,
        rank_id: RankId,
        worker_count: usize,
    ) -> Result<JobProgress> {
        for idx in 0..self.buffers.len() {
            self.step_buffer(idx, accel, fabric, bounce, cluster_id, rank_id, worker_count)?;
        }
        if self.buffers.iter().all(|b| matches!(b.state, BufferState::End)) {
            Ok(JobProgress::Done(self.bytes_done))
        } else {
            Ok(JobProgress::Continue)
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn step_buffer(
        &mut self,
        idx: usize,
        accel: &dyn AcceleratorRuntime,
        fabric: &dyn Fabric,
        bounce: &RegBufferPool,
        cluster_id: ClusterId,
        rank_id: RankId,
        worker_count: usize,
    ) -> Result<()> {
        let current = std::mem::replace(&mut self.buffers[idx].state, BufferState::End);
        let next = match current {
            BufferState::Idle => {
                let slices = self.batcher.next_batch(Some(MAX_SLICES_PER_BATCH));
                if slices.is_empty() {
                    BufferState::End
                } else {
                    self.buffers[idx].stage_addr = Some(bounce.checkout()?);
                    BufferState::Copy { slices }
                }
            }
            BufferState::Copy { slices } => {
                let stage_addr = self.buffers[idx].stage_addr.expect("stage_addr set when entering Copy");
                let base = slices[0].buffer_offset;
                copy_slices(accel, &self.metas, &slices, stage_addr, base, worker_count)?;

                let ops: Vec<OneSideOpDesc> = slices
                    .iter()
                    .map(|s| OneSideOpDesc {
                        local_addr: stage_addr + (s.buffer_offset - base),
                        remote_addr: self.metas[s.data_index].dst_base + s.data_offset,
                        len: s.data_size,
                    })
                    .collect();
                fabric.comm_prepare(cluster_id, rank_id, ops.len())?;
                fabric.batch_put(cluster_id, rank_id, &ops)?;
                self.bytes_done += ops.iter().map(|op| op.len).sum::<u64>();

                let event = fabric.record_event(cluster_id, rank_id)?;
                BufferState::AwaitingEvent { event }
            }
            BufferState::AwaitingEvent { event } => {
                if fabric.poll_event(cluster_id, rank_id, event)? {
                    fabric.destroy_event(cluster_id, rank_id, event)?;
                    if let Some(addr) = self.buffers[idx].stage_addr.take() {
                        bounce.checkin(addr);
                    }
                    BufferState::Idle
                } else {
                    BufferState::AwaitingEvent { event }
                }
            }
            BufferState::End => BufferState::End,
        };
        self.buffers[idx].state = next;
        Ok(())
    }
}

fn copy_slices(
    accel: &dyn AcceleratorRuntime,
    metas: &[RangeMeta],
    slices: &[BufferSlice],
    stage_addr: u64,
    base_offset: u64,
    worker_count: usize,
) -> Result<()> {
    let queue: Mutex<VecDeque<&BufferSlice>> = Mutex::new(slices.iter().collect());
    let first_error: Mutex<Option<EngineError>> = Mutex::new(None);
    let workers = worker_count.max(1).min(DEFAULT_WORKER_COUNT);

    crossbeam::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|_| loop {
                let slice = match queue.lock().pop_front() {
                    Some(s) => s,
                    None => return,
                };
                if first_error.lock().is_some() {
                    return;
                }
                let src_addr = metas[slice.data_index].src_base + slice.data_offset;
                let dst_stage = stage_addr + (slice.buffer_offset - base_offset);
                if let Err(e) = accel.device_memcpy(dst_stage, src_addr, slice.data_size) {
                    let mut slot = first_error.lock();
                    if slot.is_none() {
                        *slot = Some(e);
                    }
                }
            });
        }
    })
    .map_err(|_| EngineError::Internal("h2d copy worker pool panicked".into()))?;

    if let Some(err) = first_error.into_inner() {
        return Err(err);
    }
    Ok(())
}

#[cfg(test)]
fn run_to_completion(
    job: &mut H2DJob,
    accel: &dyn AcceleratorRuntime,
    fabric: &dyn Fabric,
    bounce: &RegBufferPool,
    cluster_id: ClusterId,
    rank_id: RankId,
    worker_count: usize,
) -> Result<u64> {
    loop {
        match job.step(accel, fabric, bounce, cluster_id, rank_id, worker_count)? {
            JobProgress::Continue => continue,
            JobProgress::Done(bytes) => return Ok(bytes),
        }
    }
}
