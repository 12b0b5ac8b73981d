//! Capture backends.
//!
//! A [`Backend`] knows how to run each kind of capture against a [`Sink`];
//! the session layer only decides which one to run and when. Streaming
//! captures own their sink until [`Capture::stop`] hands it back, so a sink
//! can never be closed under a capture that is still writing.

mod clock;
mod cpu;
pub mod profile;
mod snapshot;
pub mod trace;

use crate::error::Result;
use crate::sink::Sink;
use profsession_runtime as runtime;
use std::sync::Arc;

pub use clock::CLOCK_FREQUENCY_HZ;
pub use profile::{Profile, ProfileBuilder};
pub use trace::TraceLayer;

/// Profiles written in one go rather than streamed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Snapshot {
    Heap,
    Allocs,
    Mutex,
    Block,
    Goroutine,
    ThreadCreate,
}

/// A capture that keeps writing to its sink until stopped
pub trait Capture: Send {
    /// Stop capturing, write anything still buffered and hand the sink back.
    fn stop(self: Box<Self>) -> Result<Sink>;
}

pub trait Backend: Send + Sync {
    fn start_cpu(&self, sink: Sink, frequency: i32) -> Result<Box<dyn Capture>>;

    fn start_trace(&self, sink: Sink) -> Result<Box<dyn Capture>>;

    fn start_clock(&self, sink: Sink) -> Result<Box<dyn Capture>>;

    fn write_snapshot(&self, kind: Snapshot, sink: &mut Sink) -> Result<()>;

    fn memory_profile_rate(&self) -> usize;

    fn set_memory_profile_rate(&self, rate: usize);

    /// Returns the previous fraction
    fn set_mutex_profile_fraction(&self, fraction: i32) -> i32;

    /// Returns the previous rate
    fn set_block_profile_rate(&self, rate: i64) -> i64;
}

/// In-process backend: pprof-rs for CPU, [`TraceLayer`] for traces, and
/// the runtime crate's counters for everything else.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeBackend;

impl Backend for NativeBackend {
    fn start_cpu(&self, sink: Sink, frequency: i32) -> Result<Box<dyn Capture>> {
        cpu::start(sink, frequency)
    }

    fn start_trace(&self, sink: Sink) -> Result<Box<dyn Capture>> {
        trace::start(sink)
    }

    fn start_clock(&self, sink: Sink) -> Result<Box<dyn Capture>> {
        clock::start(sink)
    }

    fn write_snapshot(&self, kind: Snapshot, sink: &mut Sink) -> Result<()> {
        snapshot::build(kind)?.write_to(sink)?;
        Ok(())
    }

    fn memory_profile_rate(&self) -> usize {
        runtime::memory_profile_rate()
    }

    fn set_memory_profile_rate(&self, rate: usize) {
        runtime::set_memory_profile_rate(rate);
    }

    fn set_mutex_profile_fraction(&self, fraction: i32) -> i32 {
        runtime::set_mutex_profile_fraction(fraction)
    }

    fn set_block_profile_rate(&self, rate: i64) -> i64 {
        runtime::set_block_profile_rate(rate)
    }
}

pub fn native() -> Arc<dyn Backend> {
    Arc::new(NativeBackend)
}
