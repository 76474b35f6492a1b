// In-process request/response mailbox standing in for the flag-prefixed
// request/response slots (an 8-byte flag region followed by a fixed-size
// payload region). A real deployment maps
// these slots onto fabric-registered memory a peer writes into directly;
// here the flag and payload are ordinary process memory guarded by an
// atomic swap, which is sufficient to drive the same polling FSM.

use crate::error::{EngineError, Result};
use crate::wire::{ResponseInfo, TransferCacheReq};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

struct Slot<T> {
    occupied: AtomicBool,
    payload: Mutex<Option<T>>,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Slot { occupied: AtomicBool::new(false), payload: Mutex::new(None) }
    }
}

impl<T> Slot<T> {
    fn post(&self, value: T) -> Result<()> {
        if self.occupied.swap(true, Ordering::AcqRel) {
            return Err(EngineError::LinkBusy("mailbox slot already occupied".into()));
        }
        *self.payload.lock() = Some(value);
        Ok(())
    }

    fn try_take(&self) -> Option<T> {
        if !self.occupied.load(Ordering::Acquire) {
            return None;
        }
        let value = self.payload.lock().take();
        self.occupied.store(false, Ordering::Release);
        value
    }
}

/// One link's pair of mailboxes: requests flow requester -> owner, responses
/// flow owner -> requester.
#[derive(Default)]
pub struct Mailbox {
    request: Slot<TransferCacheReq>,
    response: Slot<ResponseInfo>,
}

impl Mailbox {
    pub fn post_request(&self, req: TransferCacheReq) -> Result<()> {
        self.request.post(req)
    }

    pub fn take_request(&self) -> Option<TransferCacheReq> {
        self.request.try_take()
    }

    pub fn post_response(&self, resp: ResponseInfo) -> Result<()> {
        self.response.post(resp)
    }

    pub fn take_response(&self) -> Option<ResponseInfo> {
        self.response.try_take()
    }
}
