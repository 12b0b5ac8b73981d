//! Single-session profiling for the current process.
//!
//! At most one session runs at a time. A session records one [`Mode`] into a
//! fixed file name under its folder and is finished exactly once, by
//! [`Profiler::stop`], by SIGINT/SIGTERM, or by dropping the [`Profiler`].
//!
//! ```rust,no_run
//! use profsession::{Mode, Options};
//!
//! # fn main() -> profsession::Result<()> {
//! let mut profiler = Options::new().mode(Mode::Cpu).folder("profiles").start()?;
//! // ... work ...
//! profiler.stop()?;
//! # Ok(())
//! # }
//! ```
//!
//! Memory, mutex and block profiles read counters kept by
//! [`profsession_runtime`]; execution traces need [`TraceLayer`] in the
//! installed `tracing` subscriber.

pub mod backend;
pub mod cli;
pub mod commands;
pub mod error;
pub mod guard;
pub mod mode;
pub mod options;
pub mod report;
pub mod session;
pub mod sink;
pub mod strategy;
mod watcher;

pub use backend::{Backend, Capture, NativeBackend, Snapshot, TraceLayer};
pub use error::{Error, Result, die};
pub use guard::{GuardState, SessionGuard};
pub use mode::{Mode, Viewer};
pub use options::Options;
pub use report::Report;
pub use session::{Profiler, Session};
pub use sink::Sink;
pub use strategy::{Settings, Teardown};
