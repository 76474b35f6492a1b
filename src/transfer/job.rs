// A transfer job that can be driven one FSM tick at a time instead of run to
// completion in a single call: each `step` submits at most one tick's worth
// of work and returns whether more ticks are needed.

use crate::common::{ClusterId, RankId};
use crate::error::Result;
use crate::fabric::{AcceleratorRuntime, Fabric};
use crate::memory::RegBufferPool;
use crate::transfer::{d2d, d2h, h2d};

/// Descriptors are drained off a job's backlog in batches of this size
/// before a completion event is recorded and the job yields back to the
/// caller, so one job never monopolizes the servicing thread.
pub const MAX_TASK_NUM: usize = 1024;

pub enum JobProgress {
    Continue,
    Done(u64),
}

/// One of the three placement-pair transfer strategies, wrapped so
/// `comm::entity` can drive any of them identically.
pub enum SendJob {
    D2D(d2d::D2DJob),
    D2H(d2h::D2HJob),
    H2D(h2d::H2DJob),
}

impl SendJob {
    #[allow(clippy::too_many_arguments)]
    pub fn step(
        &mut self,
        fabric: &dyn Fabric,
        accel: &dyn AcceleratorRuntime,
        bounce: Option<&RegBufferPool>,
        cluster_id: ClusterId,
        rank_id: RankId,
        worker_count: usize,
    ) -> Result<JobProgress> {
        match self {
            SendJob::D2D(job) => job.step(fabric, cluster_id, rank_id),
            SendJob::D2H(job) => {
                let bounce = bounce.ok_or_else(|| {
                    crate::error::EngineError::FeatureNotEnabled(
                        "no host bounce pool configured".into(),
                    )
                })?;
                job.step(accel, fabric, bounce, cluster_id, rank_id)
            }
            SendJob::H2D(job) => {
                let bounce = bounce.ok_or_else(|| {
                    crate::error::EngineError::FeatureNotEnabled(
                        "no host bounce pool configured".into(),
                    )
                })?;
                job.step(accel, fabric, bounce, cluster_id, rank_id, worker_count)
            }
        }
    }
}
