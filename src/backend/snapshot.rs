//! One-shot profiles built from the runtime crate's counters.

use super::Snapshot;
use super::profile::{Profile, ProfileBuilder};
use crate::error::{Error, Result};
use crate::mode::Mode;
use profsession_runtime::{self as runtime, ContentionSite, ContentionStats, SizeClass, ThreadInfo};
use std::collections::BTreeMap;

pub(crate) fn build(kind: Snapshot) -> Result<Profile> {
    let profile = match kind {
        Snapshot::Heap => memory(
            &runtime::size_classes(),
            runtime::memory_profile_rate(),
            runtime::tracking_installed(),
            "inuse_space",
        ),
        Snapshot::Allocs => memory(
            &runtime::size_classes(),
            runtime::memory_profile_rate(),
            runtime::tracking_installed(),
            "alloc_space",
        ),
        Snapshot::Mutex => contention(
            &runtime::mutex_profile(),
            "contentions",
            i64::from(runtime::mutex_profile_fraction()),
        ),
        Snapshot::Block => contention(
            &runtime::block_profile(),
            "contentions",
            runtime::block_profile_rate(),
        ),
        Snapshot::Goroutine => goroutines(&threads(Mode::Goroutine)?),
        Snapshot::ThreadCreate => thread_create(&threads(Mode::ThreadCreate)?),
    };
    Ok(profile)
}

fn threads(mode: Mode) -> Result<Vec<ThreadInfo>> {
    runtime::threads::snapshot().map_err(|e| Error::backend(mode, e))
}

/// Heap and allocation profiles share one layout; only the sample type a
/// viewer shows first differs.
pub(crate) fn memory(
    classes: &[SizeClass],
    rate: usize,
    installed: bool,
    default_type: &str,
) -> Profile {
    let mut builder = ProfileBuilder::new(
        &[
            ("alloc_objects", "count"),
            ("alloc_space", "bytes"),
            ("inuse_objects", "count"),
            ("inuse_space", "bytes"),
        ],
        ("space", "bytes"),
        rate as i64,
    );
    builder.default_sample_type(default_type);
    if !installed {
        builder.comment(
            "TrackingAllocator is not the global allocator, no allocations were recorded",
        );
    } else if rate == 0 {
        builder.comment("memory profile rate is 0, allocation sampling was disabled");
    }

    for class in classes {
        if class.alloc_objects == 0 {
            continue;
        }
        let label = format!("{}-{}", class.min_size, class.max_size);
        let leaf = builder.location(&format!("size class {label} B"), "<allocator>", 0);
        builder.sample(
            vec![leaf],
            vec![
                class.alloc_objects as i64,
                class.alloc_bytes as i64,
                class.inuse_objects() as i64,
                class.inuse_bytes() as i64,
            ],
            &[("bytes", &label)],
        );
    }
    builder.build()
}

pub(crate) fn contention(
    sites: &[(ContentionSite, ContentionStats)],
    count_type: &str,
    period: i64,
) -> Profile {
    let mut builder = ProfileBuilder::new(
        &[(count_type, "count"), ("delay", "nanoseconds")],
        (count_type, "count"),
        period,
    );
    for (site, stats) in sites {
        let leaf = builder.location(&site.to_string(), site.file, i64::from(site.line));
        builder.sample(
            vec![leaf],
            vec![stats.count as i64, stats.delay_ns as i64],
            &[],
        );
    }
    builder.build()
}

/// Live threads grouped by name and scheduler state
pub(crate) fn goroutines(threads: &[ThreadInfo]) -> Profile {
    let mut groups: BTreeMap<(&str, &str), i64> = BTreeMap::new();
    for thread in threads {
        *groups
            .entry((thread.name.as_str(), thread.state.as_str()))
            .or_default() += 1;
    }

    let mut builder = ProfileBuilder::new(&[("goroutine", "count")], ("goroutine", "count"), 1);
    builder.comment(&format!("{} threads", threads.len()));
    for ((name, state), count) in groups {
        let leaf = builder.location(&format!("[{state}]"), "<scheduler>", 0);
        let root = builder.location(name, "<thread>", 0);
        builder.sample(vec![leaf, root], vec![count], &[("state", state)]);
    }
    builder.build()
}

/// One sample per live OS thread
pub(crate) fn thread_create(threads: &[ThreadInfo]) -> Profile {
    let mut builder =
        ProfileBuilder::new(&[("threadcreate", "count")], ("threadcreate", "count"), 1);
    for thread in threads {
        let leaf = builder.location(&thread.name, "<thread>", 0);
        builder.sample(vec![leaf], vec![1], &[("tid", &thread.tid.to_string())]);
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use profsession_runtime::ThreadState;

    fn class(min_size: usize, max_size: usize, allocs: u64, frees: u64) -> SizeClass {
        SizeClass {
            min_size,
            max_size,
            alloc_objects: allocs,
            alloc_bytes: allocs * min_size as u64,
            free_objects: frees,
            free_bytes: frees * min_size as u64,
        }
    }

    fn thread(tid: u64, name: &str, state: ThreadState) -> ThreadInfo {
        ThreadInfo {
            tid,
            name: name.to_string(),
            state,
        }
    }

    #[test]
    fn test_memory_profile_skips_empty_classes() {
        let classes = [class(16, 31, 10, 4), class(32, 63, 0, 0), class(64, 127, 2, 2)];
        let profile = memory(&classes, 1, true, "inuse_space");

        assert_eq!(profile.sample.len(), 2);
        assert_eq!(profile.total(0), 12);
        assert_eq!(profile.total(2), 6);
        assert_eq!(profile.total(3), 6 * 16);
        assert_eq!(profile.string_at(profile.default_sample_type), "inuse_space");
        assert!(profile.comment.is_empty());
    }

    #[test]
    fn test_memory_profile_notes_missing_allocator() {
        let profile = memory(&[], 512 * 1024, false, "alloc_space");
        assert_eq!(profile.comment.len(), 1);
        assert!(profile.string_at(profile.comment[0]).contains("TrackingAllocator"));
        assert_eq!(profile.period, 512 * 1024);
    }

    #[test]
    fn test_contention_profile_sites() {
        let sites = [
            (
                ContentionSite { file: "src/queue.rs", line: 40 },
                ContentionStats { count: 3, delay_ns: 9_000 },
            ),
            (
                ContentionSite { file: "src/pool.rs", line: 7 },
                ContentionStats { count: 1, delay_ns: 500 },
            ),
        ];
        let profile = contention(&sites, "contentions", 1);
        let names = profile.location_names();

        assert_eq!(profile.sample_type_names(), vec!["contentions", "delay"]);
        assert_eq!(profile.total(0), 4);
        assert_eq!(profile.total(1), 9_500);
        assert!(names.values().any(|n| n == "src/queue.rs:40"));
    }

    #[test]
    fn test_goroutines_grouped_by_name_and_state() {
        let threads = [
            thread(1, "main", ThreadState::Running),
            thread(2, "worker", ThreadState::Sleeping),
            thread(3, "worker", ThreadState::Sleeping),
            thread(4, "worker", ThreadState::Running),
        ];
        let profile = goroutines(&threads);

        assert_eq!(profile.sample.len(), 3);
        assert_eq!(profile.total(0), 4);
        let sleeping = profile
            .sample
            .iter()
            .find(|s| s.value == vec![2])
            .unwrap();
        assert_eq!(profile.string_at(sleeping.label[0].str), "sleeping");
    }

    #[test]
    fn test_thread_create_one_sample_per_thread() {
        let threads = [
            thread(10, "main", ThreadState::Running),
            thread(11, "main", ThreadState::Sleeping),
        ];
        let profile = thread_create(&threads);
        assert_eq!(profile.sample.len(), 2);
        assert_eq!(profile.total(0), 2);
    }

    #[test]
    fn test_goroutine_snapshot_includes_current_thread() {
        let profile = build(Snapshot::Goroutine).unwrap();
        assert!(profile.total(0) >= 1);
    }
}
