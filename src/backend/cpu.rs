use super::Capture;
use crate::error::{Error, Result};
use crate::mode::Mode;
use crate::sink::Sink;
use pprof::protos::Message;
use std::io::Write;

/// Frames from these libraries are unwound through but not sampled
const BLOCKLIST: &[&str] = &["libc", "libgcc", "pthread", "vdso"];

/// Timer-driven stack sampling through pprof-rs
pub(crate) struct CpuCapture {
    guard: pprof::ProfilerGuard<'static>,
    sink: Sink,
}

pub(crate) fn start(sink: Sink, frequency: i32) -> Result<Box<dyn Capture>> {
    if frequency <= 0 {
        return Err(Error::InvalidArgument(format!(
            "CPU sampling frequency must be positive, got {frequency}"
        )));
    }
    let guard = pprof::ProfilerGuardBuilder::default()
        .frequency(frequency)
        .blocklist(BLOCKLIST)
        .build()
        .map_err(|e| Error::backend(Mode::Cpu, e))?;
    tracing::debug!(frequency, path = %sink.path().display(), "CPU sampling started");
    Ok(Box::new(CpuCapture { guard, sink }))
}

impl Capture for CpuCapture {
    fn stop(self: Box<Self>) -> Result<Sink> {
        let CpuCapture { guard, mut sink } = *self;
        let report = guard.report().build();
        // Stops the sampling timer before anything is written
        drop(guard);

        let profile = report
            .and_then(|report| report.pprof())
            .map_err(|e| Error::backend(Mode::Cpu, e))?;
        sink.write_all(&profile.encode_to_vec())?;
        Ok(sink)
    }
}
