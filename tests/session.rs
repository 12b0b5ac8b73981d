use profsession::backend::Profile;
use profsession::{Error, GuardState, Mode, Options, SessionGuard};
use prost::Message;
use serial_test::serial;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn options(dir: &Path, mode: Mode, guard: &Arc<SessionGuard>) -> Options {
    Options::new()
        .folder(dir)
        .mode(mode)
        .quiet(true)
        .without_signal_handling()
        .guard(Arc::clone(guard))
}

fn busy(duration: Duration) -> u64 {
    let started = std::time::Instant::now();
    let mut x = 1u64;
    while started.elapsed() < duration {
        x = x.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    }
    x
}

fn decode(path: &Path) -> Profile {
    Profile::decode(std::fs::read(path).unwrap().as_slice()).unwrap()
}

#[test]
#[serial]
fn every_mode_writes_its_file() {
    let dir = tempfile::tempdir().unwrap();
    let guard = Arc::new(SessionGuard::new());

    for mode in Mode::ALL {
        let mut profiler = options(dir.path(), mode, &guard).start().unwrap();
        std::hint::black_box(busy(Duration::from_millis(30)));
        profiler.stop().unwrap();

        let path = dir.path().join(mode.file_name());
        assert_eq!(profiler.session().output_path(), path);
        let len = std::fs::metadata(&path).unwrap().len();
        assert!(len > 0, "{mode} wrote an empty file");
        assert_eq!(guard.state(), GuardState::Idle);
    }
}

#[test]
#[serial]
fn snapshot_outputs_are_pprof() {
    let dir = tempfile::tempdir().unwrap();
    let guard = Arc::new(SessionGuard::new());

    for mode in [Mode::Goroutine, Mode::ThreadCreate, Mode::Clock] {
        let mut profiler = options(dir.path(), mode, &guard).start().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        profiler.stop().unwrap();

        let profile = decode(&dir.path().join(mode.file_name()));
        assert!(!profile.sample_type.is_empty(), "{mode}");
        assert!(profile.total(0) > 0, "{mode} has no samples");
    }
}

#[test]
#[serial]
fn trace_output_is_a_json_array() {
    let dir = tempfile::tempdir().unwrap();
    let guard = Arc::new(SessionGuard::new());

    let mut profiler = options(dir.path(), Mode::Trace, &guard).start().unwrap();
    profiler.stop().unwrap();

    let text = std::fs::read_to_string(dir.path().join("trace.out")).unwrap();
    let events: Vec<serde_json::Value> = serde_json::from_str(&text).unwrap();
    assert!(events.iter().any(|e| e["name"] == "trace started"));
    assert!(events.iter().any(|e| e["name"] == "trace stopped"));
}

#[test]
#[serial]
fn memory_rate_is_restored_after_session() {
    let dir = tempfile::tempdir().unwrap();
    let guard = Arc::new(SessionGuard::new());
    let before = profsession_runtime::memory_profile_rate();

    let seen = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&seen);
    let mut profiler = options(dir.path(), Mode::MemoryAlloc, &guard)
        .memory_profile_rate(1)
        .callback(move |_| *slot.lock().unwrap() = Some(profsession_runtime::memory_profile_rate()))
        .start()
        .unwrap();
    assert_eq!(profsession_runtime::memory_profile_rate(), 1);
    profiler.stop().unwrap();

    assert_eq!(profsession_runtime::memory_profile_rate(), before);
    assert_eq!(*seen.lock().unwrap(), Some(before));
    let profile = decode(&dir.path().join("memory.pprof"));
    assert_eq!(profile.string_at(profile.default_sample_type), "alloc_space");
}

#[test]
#[serial]
fn mutex_and_block_record_contention() {
    let dir = tempfile::tempdir().unwrap();
    let guard = Arc::new(SessionGuard::new());
    let before_fraction = profsession_runtime::mutex_profile_fraction();
    let before_rate = profsession_runtime::block_profile_rate();

    for mode in [Mode::Mutex, Mode::Block] {
        let mut profiler = options(dir.path(), mode, &guard).start().unwrap();

        let shared = Arc::new(profsession_runtime::ProfiledMutex::new(0u64));
        let holder = shared.lock();
        let waiter = {
            let shared = Arc::clone(&shared);
            std::thread::spawn(move || *shared.lock() += 1)
        };
        std::thread::sleep(Duration::from_millis(50));
        drop(holder);
        waiter.join().unwrap();

        profiler.stop().unwrap();
        let profile = decode(&dir.path().join(mode.file_name()));
        assert!(profile.total(0) > 0, "{mode} recorded nothing");
        assert!(profile.total(1) > 0, "{mode} recorded no delay");
    }

    assert_eq!(profsession_runtime::mutex_profile_fraction(), before_fraction);
    assert_eq!(profsession_runtime::block_profile_rate(), before_rate);
}

#[test]
#[serial]
fn global_guard_blocks_overlapping_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let base = || {
        Options::new()
            .folder(dir.path())
            .quiet(true)
            .without_signal_handling()
    };

    let mut first = base().mode(Mode::Goroutine).start().unwrap();
    let err = base().mode(Mode::ThreadCreate).start().unwrap_err();
    assert!(matches!(err, Error::AlreadyStarted));
    assert_eq!(err.to_string(), "profiler instance has already been started");

    first.stop().unwrap();
    let err = first.stop().unwrap_err();
    assert_eq!(err.to_string(), "profiler instance was not started");
    assert!(!SessionGuard::global().is_active());
}

#[test]
#[serial]
fn unwritable_folder_falls_back_to_temp() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("file");
    std::fs::write(&blocker, b"").unwrap();
    let guard = Arc::new(SessionGuard::new());

    let mut profiler = options(&blocker.join("out"), Mode::Goroutine, &guard)
        .start()
        .unwrap();
    profiler.stop().unwrap();

    let path = profiler.session().output_path().to_path_buf();
    assert!(path.exists());
    assert!(!path.starts_with(dir.path()));
    assert_eq!(profiler.session().folder(), path.parent().unwrap());
    std::fs::remove_dir_all(path.parent().unwrap()).unwrap();
}
