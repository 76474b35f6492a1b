//! The boundary to hardware this engine doesn't implement itself: an
//! accelerator runtime and a one-sided RDMA-style fabric (`traits`), plus an
//! in-process software implementation of both (`sim`) for environments
//! without the real thing.

pub mod sim;
pub mod traits;

pub use sim::{SimAccelerator, SimFabric};
pub use traits::{AcceleratorRuntime, Fabric, MemDesc, OneSideOpDesc};
