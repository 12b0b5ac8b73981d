//! Per-mode setup and teardown.
//!
//! [`resolve`] maps every [`Mode`] to the function that starts its capture.
//! A strategy either fails with nothing left running, or returns the
//! [`Teardown`] that undoes exactly what it started.

use crate::backend::{Backend, Snapshot};
use crate::error::Result;
use crate::mode::Mode;
use crate::sink::Sink;
use std::fmt;
use std::sync::Arc;

/// Knobs a strategy applies while its session runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    /// `None` keeps the current process-wide rate
    pub memory_profile_rate: Option<usize>,
    pub mutex_fraction: i32,
    pub cpu_frequency: i32,
}

pub const DEFAULT_MUTEX_FRACTION: i32 = 1;
pub const DEFAULT_CPU_FREQUENCY: i32 = 100;

impl Default for Settings {
    fn default() -> Self {
        Settings {
            memory_profile_rate: None,
            mutex_fraction: DEFAULT_MUTEX_FRACTION,
            cpu_frequency: DEFAULT_CPU_FREQUENCY,
        }
    }
}

/// Stops a capture, writes and closes its file and restores whatever the
/// strategy changed. Consumed by [`Teardown::run`], so it runs at most once.
pub struct Teardown(Box<dyn FnOnce() -> Result<()> + Send>);

impl Teardown {
    pub fn new(f: impl FnOnce() -> Result<()> + Send + 'static) -> Self {
        Teardown(Box::new(f))
    }

    pub fn run(self) -> Result<()> {
        (self.0)()
    }
}

impl fmt::Debug for Teardown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Teardown")
    }
}

pub type Strategy = fn(Sink, &Settings, &Arc<dyn Backend>) -> Result<Teardown>;

pub fn resolve(mode: Mode) -> Strategy {
    match mode {
        Mode::Cpu => cpu,
        Mode::MemoryHeap => heap,
        Mode::MemoryAlloc => allocs,
        Mode::Mutex => mutex,
        Mode::Block => block,
        Mode::Goroutine => goroutine,
        Mode::ThreadCreate => thread_create,
        Mode::Trace => trace,
        Mode::Clock => clock,
    }
}

/// Runs its closure when dropped, on every return path
struct Restore<F: FnOnce()>(Option<F>);

impl<F: FnOnce()> Restore<F> {
    fn new(f: F) -> Self {
        Restore(Some(f))
    }
}

impl<F: FnOnce()> Drop for Restore<F> {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

fn cpu(sink: Sink, settings: &Settings, backend: &Arc<dyn Backend>) -> Result<Teardown> {
    let capture = backend.start_cpu(sink, settings.cpu_frequency)?;
    Ok(Teardown::new(move || capture.stop()?.close()))
}

fn trace(sink: Sink, _settings: &Settings, backend: &Arc<dyn Backend>) -> Result<Teardown> {
    let capture = backend.start_trace(sink)?;
    Ok(Teardown::new(move || capture.stop()?.close()))
}

fn clock(sink: Sink, _settings: &Settings, backend: &Arc<dyn Backend>) -> Result<Teardown> {
    let capture = backend.start_clock(sink)?;
    Ok(Teardown::new(move || capture.stop()?.close()))
}

fn heap(sink: Sink, settings: &Settings, backend: &Arc<dyn Backend>) -> Result<Teardown> {
    memory(sink, settings, backend, Snapshot::Heap)
}

fn allocs(sink: Sink, settings: &Settings, backend: &Arc<dyn Backend>) -> Result<Teardown> {
    memory(sink, settings, backend, Snapshot::Allocs)
}

fn memory(
    mut sink: Sink,
    settings: &Settings,
    backend: &Arc<dyn Backend>,
    kind: Snapshot,
) -> Result<Teardown> {
    let previous = backend.memory_profile_rate();
    if let Some(rate) = settings.memory_profile_rate {
        backend.set_memory_profile_rate(rate);
    }
    let restore = {
        let backend = Arc::clone(backend);
        Restore::new(move || backend.set_memory_profile_rate(previous))
    };

    let backend = Arc::clone(backend);
    Ok(Teardown::new(move || {
        let _restore = restore;
        backend.write_snapshot(kind, &mut sink)?;
        sink.close()
    }))
}

fn mutex(mut sink: Sink, settings: &Settings, backend: &Arc<dyn Backend>) -> Result<Teardown> {
    let previous = backend.set_mutex_profile_fraction(settings.mutex_fraction);
    let restore = {
        let backend = Arc::clone(backend);
        Restore::new(move || {
            backend.set_mutex_profile_fraction(previous);
        })
    };

    let backend = Arc::clone(backend);
    Ok(Teardown::new(move || {
        let _restore = restore;
        backend.write_snapshot(Snapshot::Mutex, &mut sink)?;
        sink.close()
    }))
}

fn block(mut sink: Sink, _settings: &Settings, backend: &Arc<dyn Backend>) -> Result<Teardown> {
    let previous = backend.set_block_profile_rate(1);
    let restore = {
        let backend = Arc::clone(backend);
        Restore::new(move || {
            backend.set_block_profile_rate(previous);
        })
    };

    let backend = Arc::clone(backend);
    Ok(Teardown::new(move || {
        let _restore = restore;
        backend.write_snapshot(Snapshot::Block, &mut sink)?;
        sink.close()
    }))
}

fn goroutine(mut sink: Sink, _settings: &Settings, backend: &Arc<dyn Backend>) -> Result<Teardown> {
    backend.write_snapshot(Snapshot::Goroutine, &mut sink)?;
    Ok(Teardown::new(move || sink.close()))
}

fn thread_create(
    mut sink: Sink,
    _settings: &Settings,
    backend: &Arc<dyn Backend>,
) -> Result<Teardown> {
    let backend = Arc::clone(backend);
    Ok(Teardown::new(move || {
        backend.write_snapshot(Snapshot::ThreadCreate, &mut sink)?;
        sink.close()
    }))
}

#[cfg(test)]
pub(crate) mod testing {
    //! A backend that records what it was asked to do.

    use crate::backend::{Backend, Capture, Snapshot};
    use crate::error::{Error, Result};
    use crate::mode::Mode;
    use crate::sink::Sink;
    use std::io::Write;
    use std::sync::atomic::{AtomicI32, AtomicI64, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Default)]
    pub(crate) struct RecordingBackend {
        pub calls: Arc<Mutex<Vec<String>>>,
        pub memory_rate: AtomicUsize,
        pub mutex_fraction: AtomicI32,
        pub block_rate: AtomicI64,
        /// Fail `start_*` and `write_snapshot` with a backend error
        pub fail: bool,
    }

    impl RecordingBackend {
        pub fn with_memory_rate(rate: usize) -> Self {
            RecordingBackend {
                memory_rate: AtomicUsize::new(rate),
                ..Default::default()
            }
        }

        pub fn failing() -> Self {
            RecordingBackend {
                fail: true,
                ..Default::default()
            }
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn log(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }

        fn start(&self, name: &str, mode: Mode, mut sink: Sink) -> Result<Box<dyn Capture>> {
            self.log(format!("start {name}"));
            if self.fail {
                return Err(Error::backend(mode, "refused"));
            }
            sink.write_all(format!("{name}:").as_bytes())?;
            Ok(Box::new(RecordingCapture {
                name: name.to_string(),
                sink,
                calls: Arc::clone(&self.calls),
            }))
        }
    }

    struct RecordingCapture {
        name: String,
        sink: Sink,
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl Capture for RecordingCapture {
        fn stop(self: Box<Self>) -> Result<Sink> {
            let RecordingCapture { name, mut sink, calls } = *self;
            calls.lock().unwrap().push(format!("stop {name}"));
            sink.write_all(b"stopped")?;
            Ok(sink)
        }
    }

    impl Backend for RecordingBackend {
        fn start_cpu(&self, sink: Sink, frequency: i32) -> Result<Box<dyn Capture>> {
            self.start(&format!("cpu@{frequency}"), Mode::Cpu, sink)
        }

        fn start_trace(&self, sink: Sink) -> Result<Box<dyn Capture>> {
            self.start("trace", Mode::Trace, sink)
        }

        fn start_clock(&self, sink: Sink) -> Result<Box<dyn Capture>> {
            self.start("clock", Mode::Clock, sink)
        }

        fn write_snapshot(&self, kind: Snapshot, sink: &mut Sink) -> Result<()> {
            self.log(format!("snapshot {kind:?}"));
            if self.fail {
                return Err(Error::Backend {
                    mode: Mode::Goroutine,
                    reason: "refused".into(),
                });
            }
            sink.write_all(format!("{kind:?}").as_bytes())?;
            Ok(())
        }

        fn memory_profile_rate(&self) -> usize {
            self.memory_rate.load(Ordering::SeqCst)
        }

        fn set_memory_profile_rate(&self, rate: usize) {
            self.log(format!("memory rate {rate}"));
            self.memory_rate.store(rate, Ordering::SeqCst);
        }

        fn set_mutex_profile_fraction(&self, fraction: i32) -> i32 {
            self.log(format!("mutex fraction {fraction}"));
            self.mutex_fraction.swap(fraction, Ordering::SeqCst)
        }

        fn set_block_profile_rate(&self, rate: i64) -> i64 {
            self.log(format!("block rate {rate}"));
            self.block_rate.swap(rate, Ordering::SeqCst)
        }
    }
}
