//! Simulator core: processes, demand paging, and the tick-driven scheduler.

pub mod barrier;
pub mod exec;
pub mod paging;
pub mod process;
pub mod registry;
pub mod scheduler;
pub mod snapshot;
pub mod supervisor;

pub use paging::PagingAllocator;
pub use process::{PageEntry, Process, ProcessHandle};
pub use registry::ProcessRegistry;
pub use scheduler::Scheduler;
pub use snapshot::SystemSnapshot;
pub use supervisor::System;
