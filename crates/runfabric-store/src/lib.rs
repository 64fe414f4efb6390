//! Run lifecycle persistence (spec §4.1): a `Storage` seam plus the
//! `RunLifecycle` manager that drives the PENDING/RUNNING/terminal state
//! machine on top of it.

mod lifecycle;
mod storage;

pub use lifecycle::{LifecycleError, RunLifecycle};
pub use storage::{FileStorage, MemoryStorage, SharedStorage, Storage};
