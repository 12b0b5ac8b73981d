//! Wall-clock sampling: on-CPU and off-CPU time per thread.

use super::Capture;
use super::profile::{Profile, ProfileBuilder};
use crate::error::{Error, Result};
use crate::sink::Sink;
use profsession_runtime::{ThreadInfo, current_tid, threads};
use std::collections::BTreeMap;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Off the common 100 Hz so samples do not line up with periodic work
pub const CLOCK_FREQUENCY_HZ: u32 = 99;

pub(crate) struct ClockCapture {
    stop: Sender<()>,
    handle: JoinHandle<Result<Sink>>,
}

pub(crate) fn start(sink: Sink) -> Result<Box<dyn Capture>> {
    let (stop, stopped) = mpsc::channel();
    let handle = thread::Builder::new()
        .name("profsession-clock".into())
        .spawn(move || sample(sink, stopped))
        .map_err(|e| Error::Sampler(format!("cannot spawn clock sampler: {e}")))?;
    Ok(Box::new(ClockCapture { stop, handle }))
}

impl Capture for ClockCapture {
    fn stop(self: Box<Self>) -> Result<Sink> {
        let ClockCapture { stop, handle } = *self;
        // A send error means the sampler already exited, join reports why
        let _ = stop.send(());
        handle
            .join()
            .map_err(|_| Error::Sampler("clock sampler panicked".into()))?
    }
}

fn sample(mut sink: Sink, stopped: Receiver<()>) -> Result<Sink> {
    let own_tid = current_tid();
    let period = Duration::from_secs(1) / CLOCK_FREQUENCY_HZ;
    let started = Instant::now();
    let mut samples = ClockSamples::default();

    loop {
        match stopped.recv_timeout(period) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
        match threads::snapshot() {
            Ok(threads) => samples.add(&threads, own_tid),
            Err(err) => tracing::debug!(error = %err, "thread snapshot failed"),
        }
    }

    tracing::debug!(ticks = samples.ticks, "clock sampler stopped");
    samples.profile(period, started.elapsed()).write_to(&mut sink)?;
    Ok(sink)
}

/// Tick counts per (thread name, on CPU)
#[derive(Debug, Default)]
struct ClockSamples {
    counts: BTreeMap<(String, bool), i64>,
    ticks: u64,
}

impl ClockSamples {
    fn add(&mut self, threads: &[ThreadInfo], skip_tid: u64) {
        self.ticks += 1;
        for thread in threads.iter().filter(|t| t.tid != skip_tid) {
            *self
                .counts
                .entry((thread.name.clone(), thread.state.is_on_cpu()))
                .or_default() += 1;
        }
    }

    fn profile(&self, period: Duration, elapsed: Duration) -> Profile {
        let period_ns = period.as_nanos() as i64;
        let mut builder = ProfileBuilder::new(
            &[("samples", "count"), ("time", "nanoseconds")],
            ("wall", "nanoseconds"),
            period_ns,
        );
        builder
            .default_sample_type("time")
            .comment(&format!("{} ticks at {CLOCK_FREQUENCY_HZ} Hz", self.ticks))
            .duration(elapsed);

        for ((name, on_cpu), &count) in &self.counts {
            let state = if *on_cpu { "[on-cpu]" } else { "[off-cpu]" };
            let leaf = builder.location(state, "<scheduler>", 0);
            let root = builder.location(name, "<thread>", 0);
            builder.sample(vec![leaf, root], vec![count, count * period_ns], &[("thread", name)]);
        }
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use profsession_runtime::ThreadState;
    use prost::Message;

    fn thread(tid: u64, name: &str, state: ThreadState) -> ThreadInfo {
        ThreadInfo {
            tid,
            name: name.to_string(),
            state,
        }
    }

    #[test]
    fn test_samples_split_on_and_off_cpu() {
        let mut samples = ClockSamples::default();
        let tick = [
            thread(1, "main", ThreadState::Running),
            thread(2, "io", ThreadState::Sleeping),
            thread(3, "sampler", ThreadState::Running),
        ];
        samples.add(&tick, 3);
        samples.add(&tick, 3);

        assert_eq!(samples.ticks, 2);
        assert_eq!(samples.counts[&("main".to_string(), true)], 2);
        assert_eq!(samples.counts[&("io".to_string(), false)], 2);
        assert!(!samples.counts.contains_key(&("sampler".to_string(), true)));
    }

    #[test]
    fn test_profile_values_scale_with_period() {
        let mut samples = ClockSamples::default();
        samples.add(&[thread(1, "main", ThreadState::DiskSleep)], 0);
        let profile = samples.profile(Duration::from_millis(10), Duration::from_millis(10));

        assert_eq!(profile.total(0), 1);
        assert_eq!(profile.total(1), 10_000_000);
        assert!(profile.location_names().values().any(|n| n == "[off-cpu]"));
    }

    #[test]
    fn test_capture_writes_profile_on_stop() {
        let dir = tempfile::tempdir().unwrap();
        let capture = start(Sink::create(dir.path(), "clock.pprof").unwrap()).unwrap();
        thread::sleep(Duration::from_millis(100));
        let sink = capture.stop().unwrap();
        let path = sink.path().to_path_buf();
        sink.close().unwrap();

        let profile = Profile::decode(std::fs::read(path).unwrap().as_slice()).unwrap();
        assert!(profile.total(0) > 0);
        assert!(profile.duration_nanos > 0);
    }
}
