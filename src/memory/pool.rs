// Capacity-bounded free-list allocator over a single pre-reserved region:
// a free-list of address ranges guarded by a mutex, usage tracked with
// atomics, sized from `mem_pool_config` / `host_mem_pool_config`.

use crate::error::{EngineError, Result};
use crate::fabric::AcceleratorRuntime;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct FreeBlock {
    addr: u64,
    len: u64,
}

/// A single contiguous region, carved out with first-fit allocation and
/// coalesced on free. One instance backs the device cache pool; a second
/// (when `host_mem_pool_config` is set) backs host bounce buffers.
pub struct MemoryPool {
    base_addr: u64,
    capacity: u64,
    used: AtomicU64,
    free_blocks: Mutex<Vec<FreeBlock>>,
}

impl MemoryPool {
    /// Reserves `capacity` bytes up front via the accelerator runtime, so
    /// the range this pool hands out never overlaps memory already in use
    /// elsewhere in the same arena.
    pub fn new(accel: &Arc<dyn AcceleratorRuntime>, capacity: u64) -> Result<Self> {
        let base_addr = accel.alloc(capacity)?;
        Ok(MemoryPool {
            base_addr,
            capacity,
            used: AtomicU64::new(0),
            free_blocks: Mutex::new(vec![FreeBlock { addr: base_addr, len: capacity }]),
        })
    }

    /// Variant that takes an already-reserved base address, used when the
    /// pool wraps a region a `SimAccelerator::alloc` call already carved out.
    pub fn with_base(base_addr: u64, capacity: u64) -> Self {
        MemoryPool {
            base_addr,
            capacity,
            used: AtomicU64::new(0),
            free_blocks: Mutex::new(vec![FreeBlock { addr: base_addr, len: capacity }]),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::SeqCst)
    }

    pub fn alloc(&self, size: u64) -> Result<u64> {
        if size == 0 {
            return Err(EngineError::ParamInvalid("alloc size must be > 0".into()));
        }
        let mut blocks = self.free_blocks.lock();
        let slot = blocks
            .iter()
            .position(|b| b.len >= size)
            .ok_or_else(|| {
                EngineError::OutOfMemory(format!(
                    "no free block >= {size} bytes ({} used of {} capacity)",
                    self.used(),
                    self.capacity
                ))
            })?;
        let block = blocks[slot];
        if block.len == size {
            blocks.remove(slot);
        } else {
            blocks[slot] = FreeBlock { addr: block.addr + size, len: block.len - size };
        }
        self.used.fetch_add(size, Ordering::SeqCst);
        Ok(block.addr)
    }

    pub fn free(&self, addr: u64, size: u64) {
        if size == 0 {
            return;
        }
        let mut blocks = self.free_blocks.lock();
        let insert_at = blocks.partition_point(|b| b.addr < addr);
        blocks.insert(insert_at, FreeBlock { addr, len: size });
        // Coalesce with both neighbors now adjacent to the freed block.
        let mut i = 0;
        while i + 1 < blocks.len() {
            if blocks[i].addr + blocks[i].len == blocks[i + 1].addr {
                blocks[i].len += blocks[i + 1].len;
                blocks.remove(i + 1);
            } else {
                i += 1;
            }
        }
        self.used.fetch_sub(size, Ordering::SeqCst);
    }
}
