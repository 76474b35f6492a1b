// Coalesces a sequence of per-tensor byte ranges into merged slices no
// larger than `MAX_SLICE_SIZE`, yielding at most `DEFAULT_MAX_SLICES_PER_BATCH`
// slices per call and carrying any leftover position across calls so a
// transfer too large for one batch keeps making progress over several
// `next_batch` calls.

/// One input range: `len` bytes of tensor `tensor_index` starting at byte
/// offset `offset` within that tensor's cache region.
#[derive(Debug, Clone, Copy)]
pub struct DataRange {
    pub tensor_index: usize,
    pub offset: u64,
    pub len: u64,
}

/// One output slice: `data_size` bytes of tensor `data_index` starting at
/// `data_offset`, destined for `buffer_offset` in the flat transfer buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSlice {
    pub buffer_offset: u64,
    pub data_index: usize,
    pub data_offset: u64,
    pub data_size: u64,
}

/// A single merged slice can carry at most 4 MiB (`task_batcher.cc`
/// `kMaxBlockSize`).
pub const MAX_SLICE_SIZE: u64 = 4 * 1024 * 1024;

/// Default cap on slices returned from one `next_batch` call
/// (`task_batcher.cc` `kMaxTaskNumInBatch`); a caller may raise it by passing
/// an explicit `max_slices`.
pub const DEFAULT_MAX_SLICES_PER_BATCH: usize = 64;

/// Stateful coalescer over a fixed list of input ranges. Construct once per
/// transfer request and call `next_batch` until `is_done`.
pub struct TaskBatcher {
    ranges: Vec<DataRange>,
    current_range: usize,
    intra_range_offset: u64,
    buffer_cursor: u64,
}

impl TaskBatcher {
    /// `ranges` must already be ordered so that any two ranges that are
    /// contiguous in the destination buffer and touch the same tensor at
    /// adjacent byte offsets appear back to back — that ordering is what
    /// lets coalescing merge them.
    pub fn new(ranges: Vec<DataRange>) -> Self {
        TaskBatcher { ranges, current_range: 0, intra_range_offset: 0, buffer_cursor: 0 }
    }

    pub fn is_done(&self) -> bool {
        self.current_range >= self.ranges.len()
    }

    /// Total bytes this batcher will ever emit, used by callers to size the
    /// destination buffer up front.
    pub fn total_len(&self) -> u64 {
        self.ranges.iter().map(|r| r.len).sum()
    }

    /// Produces the next batch of merged slices, capped at `max_slices`
    /// (defaults to `DEFAULT_MAX_SLICES_PER_BATCH` when `None`).
    pub fn next_batch(&mut self, max_slices: Option<usize>) -> Vec<BufferSlice> {
        let cap = max_slices.unwrap_or(DEFAULT_MAX_SLICES_PER_BATCH);
        let mut out: Vec<BufferSlice> = Vec::new();

        while out.len() < cap && self.current_range < self.ranges.len() {
            let range = self.ranges[self.current_range];
            let remaining = range.len - self.intra_range_offset;
            if remaining == 0 {
                self.current_range += 1;
                self.intra_range_offset = 0;
                continue;
            }

            let data_offset = range.offset + self.intra_range_offset;

            let merged = out.last_mut().filter(|last| {
                last.data_index == range.tensor_index
                    && last.data_offset + last.data_size == data_offset
                    && last.data_size < MAX_SLICE_SIZE
            });

            if let Some(last) = merged {
                let room = MAX_SLICE_SIZE - last.data_size;
                let take = remaining.min(room);
                last.data_size += take;
                self.intra_range_offset += take;
                self.buffer_cursor += take;
            } else {
                let take = remaining.min(MAX_SLICE_SIZE);
                out.push(BufferSlice {
                    buffer_offset: self.buffer_cursor,
                    data_index: range.tensor_index,
                    data_offset,
                    data_size: take,
                });
                self.intra_range_offset += take;
                self.buffer_cursor += take;
            }

            if self.intra_range_offset == range.len {
                self.current_range += 1;
                self.intra_range_offset = 0;
            }
        }

        out
    }
}
