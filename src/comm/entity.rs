// Per-peer link state machine (`cur_state_`, `ChangeState`,
// `GetTimeoutPoint`, the statistic maps, and the `FsmState` enum all follow
// a reference comm-entity/state-machine shape). One `CommEntity` per
// linked peer rank; a single non-async servicing thread (`fsm::Driver`)
// ticks every entity in a spin/poll loop rather than awaiting futures: the
// wire protocol is a polled mailbox, not a runtime scheduler's job.

use crate::cache::{CacheEntry, CacheManager};
use crate::common::{CacheId, ClusterId, RankId};
use crate::comm::transport::Mailbox;
use crate::config::DEFAULT_REQUEST_TIMEOUT;
use crate::error::{EngineError, Result};
use crate::fabric::{AcceleratorRuntime, Fabric};
use crate::memory::RegBufferPool;
use crate::stats::{RecvStatisticInfo, SendStatisticInfo};
use crate::transfer::job::{JobProgress, SendJob};
use crate::transfer::scheduler;
use crate::wire::TransferCacheReq;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

const H2D_WORKER_COUNT: usize = crate::transfer::h2d::DEFAULT_WORKER_COUNT;

/// A job mid-flight: which request it answers, the job driving its bytes
/// across, and the bookkeeping `scheduler::finish` needs once it completes.
struct ActiveSend {
    req: TransferCacheReq,
    job: SendJob,
    cache_id: CacheId,
    entry: CacheEntry,
    start: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsmState {
    Idle,
    Receiving,
    Sending,
    Error,
    Destroyed,
}

impl FsmState {
    fn can_transition_to(self, next: FsmState) -> bool {
        use FsmState::*;
        matches!(
            (self, next),
            (Idle, Receiving)
                | (Receiving, Sending)
                | (Receiving, Idle)
                | (Sending, Idle)
                | (_, Error)
                | (Error, Idle)
                | (_, Destroyed)
        )
    }
}

pub struct CommEntity {
    pub cluster_id: ClusterId,
    pub rank_id: RankId,
    state: Mutex<FsmState>,
    mailbox: Arc<Mailbox>,
    pending: Mutex<Option<TransferCacheReq>>,
    active_send: Mutex<Option<ActiveSend>>,
    timeout_point: Mutex<Option<Instant>>,
    cache_manager: Arc<CacheManager>,
    fabric: Arc<dyn Fabric + Send + Sync>,
    accel: Arc<dyn AcceleratorRuntime + Send + Sync>,
    host_bounce: Option<Arc<RegBufferPool>>,
    /// Whether this end of the link is the one that executes inbound
    /// requests. A link's two `CommEntity`s share one mailbox but only the
    /// responder's FSM polls it for requests — the initiator only waits on
    /// the response half, mirroring a real deployment where the request
    /// slot lives in the responder's address space and the initiator has no
    /// local read access to trigger its own servicing loop from it.
    responds_to_requests: bool,
    pub send_stats: SendStatisticInfo,
    pub recv_stats: RecvStatisticInfo,
}

impl CommEntity {
    pub fn new(
        cluster_id: ClusterId,
        rank_id: RankId,
        cache_manager: Arc<CacheManager>,
        fabric: Arc<dyn Fabric + Send + Sync>,
        accel: Arc<dyn AcceleratorRuntime + Send + Sync>,
        host_bounce: Option<Arc<RegBufferPool>>,
        mailbox: Arc<Mailbox>,
        responds_to_requests: bool,
    ) -> Self {
        CommEntity {
            cluster_id,
            rank_id,
            state: Mutex::new(FsmState::Idle),
            mailbox,
            pending: Mutex::new(None),
            active_send: Mutex::new(None),
            timeout_point: Mutex::new(None),
            cache_manager,
            fabric,
            accel,
            host_bounce,
            responds_to_requests,
            send_stats: SendStatisticInfo::default(),
            recv_stats: RecvStatisticInfo::default(),
        }
    }

    pub fn cur_state(&self) -> FsmState {
        *self.state.lock()
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    pub fn mailbox_handle(&self) -> Arc<Mailbox> {
        self.mailbox.clone()
    }

    fn change_state(&self, next: FsmState) -> Result<()> {
        let mut state = self.state.lock();
        if !state.can_transition_to(next) {
            return Err(EngineError::Internal(format!(
                "illegal fsm transition {:?} -> {:?}",
                *state, next
            )));
        }
        *state = next;
        Ok(())
    }

    /// Whether a link-teardown caller must wait before tearing this entity
    /// down: `Receiving` still has a request it may commit to, `Sending` has
    /// a job mid-flight.
    pub fn has_pending_job(&self) -> bool {
        matches!(self.cur_state(), FsmState::Receiving | FsmState::Sending)
    }

    pub fn mark_error(&self) {
        let _ = self.change_state(FsmState::Error);
    }

    pub fn mark_destroyed(&self) {
        let _ = self.change_state(FsmState::Destroyed);
    }

    /// Advances the state machine by one step. Called repeatedly by the
    /// servicing thread; a no-op whenever there is nothing to do in the
    /// current state.
    pub fn service_tick(&self) -> Result<()> {
        match self.cur_state() {
            FsmState::Idle => self.tick_idle(),
            FsmState::Receiving => self.tick_receiving(),
            FsmState::Sending => self.tick_sending(),
            FsmState::Error | FsmState::Destroyed => Ok(()),
        }
    }

    fn tick_idle(&self) -> Result<()> {
        if !self.responds_to_requests {
            return Ok(());
        }
        if let Some(req) = self.mailbox.take_request() {
            self.recv_stats.record(req.dst_buffer_size);
            let timeout = if req.timeout_in_ms > 0 {
                Duration::from_millis(req.timeout_in_ms as u64)
            } else {
                DEFAULT_REQUEST_TIMEOUT
            };
            *self.timeout_point.lock() = Some(Instant::now() + timeout);
            *self.pending.lock() = Some(req);
            self.change_state(FsmState::Receiving)?;
        }
        Ok(())
    }

    fn tick_receiving(&self) -> Result<()> {
        let expired = (*self.timeout_point.lock())
            .map(|t| Instant::now() >= t)
            .unwrap_or(false);
        if expired {
            if let Some(req) = self.pending.lock().take() {
                let resp = crate::wire::ResponseInfo::failure(
                    req.req_id,
                    req.model_id,
                    &EngineError::Timeout(format!("request {} exceeded its deadline", req.req_id)),
                );
                let _ = self.mailbox.post_response(resp);
            }
            self.send_stats.record_failure();
            return self.change_state(FsmState::Idle);
        }
        self.change_state(FsmState::Sending)
    }

    /// Drives the in-flight job, if any, by one tick; otherwise starts one
    /// from the pending request. A job that isn't done after this tick
    /// leaves the entity in `Sending` so the next `service_tick` call picks
    /// up where it left off, rather than running the whole transfer to
    /// completion inside a single tick.
    fn tick_sending(&self) -> Result<()> {
        if self.active_send.lock().is_none() {
            let req = match self.pending.lock().take() {
                Some(req) => req,
                None => return self.change_state(FsmState::Idle),
            };
            match scheduler::prepare(&req, &self.cache_manager, self.cluster_id, self.host_bounce.as_deref()) {
                Ok(prepared) => {
                    *self.active_send.lock() = Some(ActiveSend {
                        req,
                        job: prepared.job,
                        cache_id: prepared.cache_id,
                        entry: prepared.entry,
                        start: Instant::now(),
                    });
                }
                Err(err) => {
                    self.send_stats.record_failure();
                    let resp = crate::wire::ResponseInfo::failure(req.req_id, req.model_id, &err);
                    let _ = self.mailbox.post_response(resp);
                    return self.change_state(FsmState::Idle);
                }
            }
        }

        let progress = {
            let mut slot = self.active_send.lock();
            let active = slot.as_mut().expect("just populated above");
            active.job.step(
                self.fabric.as_ref(),
                self.accel.as_ref(),
                self.host_bounce.as_deref(),
                self.cluster_id,
                self.rank_id,
                H2D_WORKER_COUNT,
            )
        };

        match progress {
            Ok(JobProgress::Continue) => Ok(()),
            Ok(JobProgress::Done(bytes)) => self.finish_send(Ok(bytes)),
            Err(err) => self.finish_send(Err(err)),
        }
    }

    fn finish_send(&self, result: Result<u64>) -> Result<()> {
        let active = self.active_send.lock().take().expect("finish_send called with an active job");
        let (resp, bytes) = scheduler::finish(
            &active.req,
            active.cache_id,
            &active.entry,
            &self.cache_manager,
            self.cluster_id,
            result,
        );
        if resp.ok() {
            self.send_stats.record_success(bytes, active.start.elapsed().as_micros() as u64);
        } else {
            self.send_stats.record_failure();
        }
        let _ = self.mailbox.post_response(resp);
        self.change_state(FsmState::Idle)
    }
}
