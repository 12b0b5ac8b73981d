use crate::cli::RunArgs;
use crate::options::Options;
use anyhow::Context;
use profsession_runtime::{ProfiledMutex, blocking};
use std::hint::black_box;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Built-in work to profile
#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Workload {
    /// Busy arithmetic on every worker
    Spin,
    /// Allocate and free buffers of many sizes, keeping some alive
    Alloc,
    /// Workers fighting over one ProfiledMutex
    Contend,
    /// Short blocking sleeps
    Sleep,
    /// Keep spawning short-lived threads
    Spawn,
    /// Each worker picks one of the above
    Mixed,
}

const SINGLE: [Workload; 5] = [
    Workload::Spin,
    Workload::Alloc,
    Workload::Contend,
    Workload::Sleep,
    Workload::Spawn,
];

/// Build session options: environment first, then explicit flags.
pub fn options(args: &RunArgs) -> anyhow::Result<Options> {
    let mut options = Options::from_env().context("Invalid PROFSESSION_* environment")?;
    if let Some(mode) = args.mode {
        options = options.mode(mode);
    }
    if let Some(dir) = &args.dir {
        options = options.folder(dir);
    }
    if let Some(rate) = args.memory_rate {
        options = options.memory_profile_rate(rate);
    }
    if let Some(fraction) = args.mutex_fraction {
        options = options.mutex_fraction(fraction);
    }
    if let Some(freq) = args.cpu_freq {
        options = options.cpu_frequency(freq);
    }
    if args.quiet {
        options = options.quiet(true);
    }
    if args.no_signals {
        options = options.without_signal_handling();
    }
    Ok(options)
}

/// Run the run command
pub fn run(args: &RunArgs) -> anyhow::Result<()> {
    let options = options(args)?;
    let mode = options.mode;
    let mut profiler = options
        .start()
        .with_context(|| format!("Failed to start {mode} profiling"))?;

    eprintln!(
        "recording {} profile into {} (Ctrl-C to stop)...",
        mode,
        profiler.session().output_path().display()
    );

    let deadline = args.duration.map(|d| Instant::now() + d);
    run_workload(args.workload, args.threads, deadline);

    profiler
        .stop()
        .with_context(|| format!("Failed to stop {mode} profiling"))?;
    Ok(())
}

/// Run `workload` on `threads` workers until `deadline` (forever if `None`).
pub fn run_workload(workload: Workload, threads: usize, deadline: Option<Instant>) {
    let shared = Arc::new(ProfiledMutex::new(Vec::<u64>::new()));
    let _span = tracing::info_span!("workload", ?workload, threads).entered();

    thread::scope(|scope| {
        for id in 0..threads {
            let kind = match workload {
                Workload::Mixed => SINGLE[id % SINGLE.len()],
                single => single,
            };
            let shared = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("worker-{id}"))
                .spawn_scoped(scope, move || worker(id, kind, &shared, deadline));
            if let Err(e) = spawned {
                tracing::warn!(worker = id, error = %e, "failed to spawn worker");
            }
        }
    });
}

fn worker(
    id: usize,
    workload: Workload,
    shared: &ProfiledMutex<Vec<u64>>,
    deadline: Option<Instant>,
) {
    let mut retained: Vec<Vec<u8>> = Vec::new();
    let mut round = 0u64;

    while deadline.is_none_or(|d| Instant::now() < d) {
        let _round = tracing::info_span!("round", worker = id, round).entered();
        match workload {
            Workload::Spin => {
                black_box(spin(round ^ id as u64));
            }
            Workload::Alloc => allocate(round, &mut retained),
            Workload::Contend => contend(round, shared),
            Workload::Sleep => blocking(|| thread::sleep(Duration::from_millis(5))),
            Workload::Spawn => spawn_short_lived(id, round),
            Workload::Mixed => unreachable!("mixed is resolved per worker"),
        }
        if round % 100 == 0 {
            tracing::debug!(worker = id, round, "workload progress");
        }
        round += 1;
    }
}

fn spin(seed: u64) -> u64 {
    let mut x = seed | 1;
    for _ in 0..200_000 {
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
    }
    x
}

/// Up to 256 buffers stay alive; every fourth allocation is kept.
fn allocate(round: u64, retained: &mut Vec<Vec<u8>>) {
    for i in 0..64u64 {
        let size = 16usize << ((round + i) % 12);
        let buffer = black_box(vec![0u8; size]);
        if i % 4 == 0 {
            if retained.len() >= 256 {
                retained.swap_remove((round as usize + i as usize) % 256);
            }
            retained.push(buffer);
        }
    }
}

fn contend(round: u64, shared: &ProfiledMutex<Vec<u64>>) {
    let mut values = shared.lock();
    values.push(round);
    if values.len() > 1024 {
        values.clear();
    }
    // Hold the lock long enough for the other workers to queue up
    black_box(spin(round));
}

fn spawn_short_lived(id: usize, round: u64) {
    let spawned = thread::Builder::new()
        .name(format!("spawned-{id}-{round}"))
        .spawn(|| thread::sleep(Duration::from_millis(20)));
    match spawned {
        Ok(handle) => {
            let _ = blocking(|| handle.join());
        }
        Err(e) => tracing::warn!(error = %e, "failed to spawn thread"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_workload_finishes_by_deadline() {
        let mut all = SINGLE.to_vec();
        all.push(Workload::Mixed);
        for workload in all {
            let started = Instant::now();
            run_workload(workload, 2, Some(Instant::now() + Duration::from_millis(50)));
            assert!(started.elapsed() < Duration::from_secs(5), "{workload:?}");
        }
    }

    #[test]
    fn test_allocate_bounds_retained_buffers() {
        let mut retained = Vec::new();
        for round in 0..100 {
            allocate(round, &mut retained);
        }
        assert!(retained.len() <= 256);
    }
}
