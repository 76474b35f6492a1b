// The one non-async servicing thread that advances every linked entity's
// state machine. DESIGN NOTES rules out an async runtime here: each tick is
// a cheap poll-and-dispatch, and a dedicated OS thread spinning with a short
// sleep is simpler to reason about than scheduling this onto a reactor.

use crate::comm::link_manager::LinkManager;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Bounds how long the servicing thread sleeps between ticks when it finds
/// nothing to do, trading latency for CPU usage.
const IDLE_POLL_INTERVAL: Duration = Duration::from_micros(200);

pub struct Driver {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Driver {
    pub fn spawn(link_manager: Arc<LinkManager>) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let thread_shutdown = shutdown.clone();
        let handle = thread::Builder::new()
            .name("kv-transfer-fsm".into())
            .spawn(move || {
                while !thread_shutdown.load(Ordering::Relaxed) {
                    let mut did_work = false;
                    for entity in link_manager.entities() {
                        match entity.service_tick() {
                            Ok(()) => {}
                            Err(err) => {
                                tracing::warn!(error = %err, cluster_id = entity.cluster_id, rank_id = entity.rank_id, "fsm tick failed, marking link errored");
                                entity.mark_error();
                            }
                        }
                        did_work = true;
                    }
                    if !did_work {
                        thread::sleep(IDLE_POLL_INTERVAL);
                    }
                }
            })
            .expect("failed to spawn fsm servicing thread");
        Driver { shutdown, handle: Some(handle) }
    }

    pub fn stop(mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
