//! Mutex-contention and block sampling.
//!
//! Waits are attributed to the call site that waited, captured with
//! `#[track_caller]`. Two process-wide knobs control recording:
//! - the mutex profile fraction: on average 1 in `fraction` contention
//!   events is recorded (0 disables)
//! - the block profile rate: waits of at least `rate` nanoseconds are
//!   recorded (0 disables, 1 records every wait)

use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::panic::Location;
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU64, Ordering};
use std::sync::{LazyLock, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::{Duration, Instant};

static MUTEX_FRACTION: AtomicI32 = AtomicI32::new(0);
static BLOCK_RATE: AtomicI64 = AtomicI64::new(0);
static MUTEX_EVENTS: AtomicU64 = AtomicU64::new(0);

type Table = LazyLock<Mutex<HashMap<ContentionSite, ContentionStats>>>;

static MUTEX_TABLE: Table = LazyLock::new(Default::default);
static BLOCK_TABLE: Table = LazyLock::new(Default::default);

/// Source location that waited
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentionSite {
    pub file: &'static str,
    pub line: u32,
}

impl From<&'static Location<'static>> for ContentionSite {
    fn from(location: &'static Location<'static>) -> Self {
        ContentionSite {
            file: location.file(),
            line: location.line(),
        }
    }
}

impl fmt::Display for ContentionSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// Estimated number of waits and total nanoseconds spent waiting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContentionStats {
    pub count: u64,
    pub delay_ns: u64,
}

/// Current mutex profile fraction
pub fn mutex_profile_fraction() -> i32 {
    MUTEX_FRACTION.load(Ordering::SeqCst)
}

/// Set the mutex profile fraction and return the previous one.
/// A negative value only reads the current setting.
pub fn set_mutex_profile_fraction(fraction: i32) -> i32 {
    if fraction < 0 {
        return mutex_profile_fraction();
    }
    MUTEX_FRACTION.swap(fraction, Ordering::SeqCst)
}

/// Current block profile rate in nanoseconds
pub fn block_profile_rate() -> i64 {
    BLOCK_RATE.load(Ordering::SeqCst)
}

/// Set the block profile rate and return the previous one.
pub fn set_block_profile_rate(rate: i64) -> i64 {
    BLOCK_RATE.swap(rate.max(0), Ordering::SeqCst)
}

fn add(table: &Table, site: ContentionSite, count: u64, delay_ns: u64) {
    let mut table = table.lock().unwrap_or_else(PoisonError::into_inner);
    let stats = table.entry(site).or_default();
    stats.count += count;
    stats.delay_ns += delay_ns;
}

fn snapshot(table: &Table) -> Vec<(ContentionSite, ContentionStats)> {
    let table = table.lock().unwrap_or_else(PoisonError::into_inner);
    let mut entries: Vec<_> = table.iter().map(|(s, c)| (s.clone(), *c)).collect();
    entries.sort_by(|a, b| b.1.delay_ns.cmp(&a.1.delay_ns).then(a.0.line.cmp(&b.0.line)));
    entries
}

/// Record that `site` waited `delay` for a contended lock.
pub fn record_contention(site: ContentionSite, delay: Duration) {
    let fraction = mutex_profile_fraction();
    if fraction <= 0 {
        return;
    }
    let fraction = fraction as u64;
    if MUTEX_EVENTS.fetch_add(1, Ordering::Relaxed) % fraction != 0 {
        return;
    }
    let delay_ns = u64::try_from(delay.as_nanos()).unwrap_or(u64::MAX);
    add(&MUTEX_TABLE, site, fraction, delay_ns.saturating_mul(fraction));
}

/// Record that `site` was blocked for `delay`.
///
/// Waits shorter than the block profile rate are dropped.
pub fn record_block(site: ContentionSite, delay: Duration) {
    let rate = block_profile_rate();
    if rate <= 0 {
        return;
    }
    let delay_ns = u64::try_from(delay.as_nanos()).unwrap_or(u64::MAX);
    if delay_ns < rate as u64 {
        return;
    }
    add(&BLOCK_TABLE, site, 1, delay_ns);
}

/// Recorded mutex contention, largest total delay first
pub fn mutex_profile() -> Vec<(ContentionSite, ContentionStats)> {
    snapshot(&MUTEX_TABLE)
}

/// Recorded blocking events, largest total delay first
pub fn block_profile() -> Vec<(ContentionSite, ContentionStats)> {
    snapshot(&BLOCK_TABLE)
}

/// Run `f` and record the time it took as a blocking event at the caller.
#[track_caller]
pub fn blocking<R>(f: impl FnOnce() -> R) -> R {
    let site = ContentionSite::from(Location::caller());
    let started = Instant::now();
    let result = f();
    record_block(site, started.elapsed());
    result
}

/// A mutex that reports contended acquisitions to the mutex and block profiles.
///
/// Poisoning is ignored: a panic while the lock was held does not make later
/// `lock` calls fail.
#[derive(Debug, Default)]
pub struct ProfiledMutex<T: ?Sized> {
    inner: Mutex<T>,
}

impl<T> ProfiledMutex<T> {
    pub const fn new(value: T) -> Self {
        ProfiledMutex {
            inner: Mutex::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: ?Sized> ProfiledMutex<T> {
    #[track_caller]
    pub fn lock(&self) -> ProfiledMutexGuard<'_, T> {
        let guard = match self.inner.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                let site = ContentionSite::from(Location::caller());
                let started = Instant::now();
                let guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
                let waited = started.elapsed();
                record_contention(site.clone(), waited);
                record_block(site, waited);
                guard
            }
        };
        ProfiledMutexGuard { guard }
    }
}

pub struct ProfiledMutexGuard<'a, T: ?Sized> {
    guard: MutexGuard<'a, T>,
}

impl<T: ?Sized> Deref for ProfiledMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T: ?Sized> DerefMut for ProfiledMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}
