//! Process-global sampling state read by profsession.
//!
//! This crate holds the pieces of profiling that live inside the host process
//! rather than inside a profiling session:
//! - **Memory**: a tracking allocator and the global memory profile rate
//! - **Contention**: mutex-contention and block sampling, with instrumented
//!   primitives that feed them
//! - **Threads**: enumeration of the process's OS threads
//!
//! # Usage
//!
//! Install the tracking allocator so heap and allocation profiles have data:
//! ```rust,ignore
//! #[global_allocator]
//! static ALLOC: profsession_runtime::TrackingAllocator = profsession_runtime::TrackingAllocator;
//! ```
//!
//! Use [`ProfiledMutex`] (or wrap waits in [`blocking`]) where contention
//! should show up in mutex and block profiles:
//! ```rust,ignore
//! let shared = profsession_runtime::ProfiledMutex::new(Vec::new());
//! shared.lock().push(42);
//! ```
//!
//! The settings here are process-wide. Changing them while a session is
//! running changes what that session records.

pub mod contention;
pub mod memory;
pub mod threads;

pub use contention::{
    ContentionSite, ContentionStats, ProfiledMutex, ProfiledMutexGuard, block_profile,
    block_profile_rate, blocking, mutex_profile, mutex_profile_fraction, record_block,
    record_contention, set_block_profile_rate, set_mutex_profile_fraction,
};
pub use memory::{
    DEFAULT_MEMORY_PROFILE_RATE, SizeClass, TrackingAllocator, memory_profile_rate,
    set_memory_profile_rate, size_classes, tracking_installed,
};
pub use threads::{ThreadInfo, ThreadState, current_tid};
