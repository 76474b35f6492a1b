// Pool of fabric-registered bounce buffers (capacity, host/device flag, a
// buffer map guarded by a mutex). Used by the H2D staging pipeline to
// rotate a fixed number of fixed-size buffers through the fabric instead
// of registering memory on every transfer.

use crate::error::Result;
use crate::fabric::{Fabric, MemDesc};
use crate::memory::pool::MemoryPool;

pub struct RegBufferPool {
    pool: MemoryPool,
    mem_desc: MemDesc,
    buffer_size: u64,
    is_host: bool,
}

impl RegBufferPool {
    /// Registers `num_buffers * buffer_size` bytes starting at `base_addr`
    /// with the fabric, then carves it into fixed-size buffers.
    pub fn new(
        fabric: &dyn Fabric,
        base_addr: u64,
        buffer_size: u64,
        num_buffers: u64,
        is_host: bool,
    ) -> Result<Self> {
        let capacity = buffer_size * num_buffers;
        let mem_desc = fabric.register_global_mem(base_addr, capacity)?;
        Ok(RegBufferPool {
            pool: MemoryPool::with_base(base_addr, capacity),
            mem_desc,
            buffer_size,
            is_host,
        })
    }

    pub fn mem_desc(&self) -> &MemDesc {
        &self.mem_desc
    }

    pub fn is_host(&self) -> bool {
        self.is_host
    }

    pub fn buffer_size(&self) -> u64 {
        self.buffer_size
    }

    pub fn checkout(&self) -> Result<u64> {
        self.pool.alloc(self.buffer_size)
    }

    pub fn checkin(&self, addr: u64) {
        self.pool.free(addr, self.buffer_size);
    }
}
