//! Transfer job execution: batching utilities plus one job implementation
//! per source/destination placement pair, tied together by `scheduler`.

pub mod addressing;
pub mod batcher;
pub mod d2d;
pub mod d2h;
pub mod h2d;
pub mod job;
pub mod scheduler;

pub use batcher::{BufferSlice, DataRange, TaskBatcher};
pub use job::{JobProgress, SendJob, MAX_TASK_NUM};
pub use scheduler::{resolve_transfer_kind, TransferKind};
