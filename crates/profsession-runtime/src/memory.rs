//! Allocation sampling: the memory profile rate and the tracking allocator.

use std::alloc::{GlobalAlloc, Layout, System};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// Average number of allocated bytes between two recorded samples.
pub const DEFAULT_MEMORY_PROFILE_RATE: usize = 512 * 1024;

/// One slot per bit length of an allocation size (0 through 64 bits)
const SIZE_CLASS_COUNT: usize = usize::BITS as usize + 1;

static MEMORY_PROFILE_RATE: AtomicUsize = AtomicUsize::new(DEFAULT_MEMORY_PROFILE_RATE);
static INSTALLED: AtomicBool = AtomicBool::new(false);

struct Counters {
    alloc_objects: AtomicU64,
    alloc_bytes: AtomicU64,
    free_objects: AtomicU64,
    free_bytes: AtomicU64,
}

impl Counters {
    const fn new() -> Self {
        Counters {
            alloc_objects: AtomicU64::new(0),
            alloc_bytes: AtomicU64::new(0),
            free_objects: AtomicU64::new(0),
            free_bytes: AtomicU64::new(0),
        }
    }
}

static COUNTERS: [Counters; SIZE_CLASS_COUNT] = [const { Counters::new() }; SIZE_CLASS_COUNT];

/// Current memory profile rate. Zero means allocation sampling is off.
pub fn memory_profile_rate() -> usize {
    MEMORY_PROFILE_RATE.load(Ordering::SeqCst)
}

/// Set the memory profile rate, returning the previous value.
///
/// A rate of 1 records every allocation. Blocks keep the weight they were
/// sampled with, so a free always cancels its own allocation.
pub fn set_memory_profile_rate(rate: usize) -> usize {
    MEMORY_PROFILE_RATE.swap(rate, Ordering::SeqCst)
}

/// Whether [`TrackingAllocator`] has served at least one allocation.
pub fn tracking_installed() -> bool {
    INSTALLED.load(Ordering::Relaxed)
}

/// Estimated allocation totals for sizes in `min_size..=max_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SizeClass {
    pub min_size: usize,
    pub max_size: usize,
    pub alloc_objects: u64,
    pub alloc_bytes: u64,
    pub free_objects: u64,
    pub free_bytes: u64,
}

impl SizeClass {
    pub fn inuse_objects(&self) -> u64 {
        self.alloc_objects.saturating_sub(self.free_objects)
    }

    pub fn inuse_bytes(&self) -> u64 {
        self.alloc_bytes.saturating_sub(self.free_bytes)
    }
}

/// Snapshot of every size class that has seen at least one sample.
pub fn size_classes() -> Vec<SizeClass> {
    COUNTERS
        .iter()
        .enumerate()
        .filter_map(|(class, counters)| {
            let alloc_objects = counters.alloc_objects.load(Ordering::Relaxed);
            if alloc_objects == 0 {
                return None;
            }
            let (min_size, max_size) = class_bounds(class);
            Some(SizeClass {
                min_size,
                max_size,
                alloc_objects,
                alloc_bytes: counters.alloc_bytes.load(Ordering::Relaxed),
                free_objects: counters.free_objects.load(Ordering::Relaxed),
                free_bytes: counters.free_bytes.load(Ordering::Relaxed),
            })
        })
        .collect()
}

#[inline]
fn size_class(size: usize) -> usize {
    (usize::BITS - size.leading_zeros()) as usize
}

fn class_bounds(class: usize) -> (usize, usize) {
    if class == 0 {
        return (0, 0);
    }
    let min = 1usize << (class - 1);
    let max = if class >= usize::BITS as usize {
        usize::MAX
    } else {
        (1usize << class) - 1
    };
    (min, max)
}

/// Finalizer from splitmix64, spreads pointer bits before the modulo
#[inline]
fn mix(addr: usize) -> u64 {
    let mut x = addr as u64;
    x ^= x >> 33;
    x = x.wrapping_mul(0xff51_afd7_ed55_8ccd);
    x ^= x >> 33;
    x = x.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    x ^ (x >> 33)
}

/// Decide whether the block at `addr` is sampled and with what weight.
///
/// Returns the estimated (objects, bytes) the sample stands for.
#[inline]
fn sample_weight(addr: usize, size: usize, rate: usize) -> Option<(u64, u64)> {
    if rate == 0 || size == 0 {
        return None;
    }
    if size >= rate {
        return Some((1, size as u64));
    }
    if mix(addr) % (rate as u64) < size as u64 {
        Some(((rate / size) as u64, rate as u64))
    } else {
        None
    }
}

/// Live sampled blocks the alloc table can hold at once
const ALLOC_TABLE_CAPACITY: usize = 1 << 16;
/// Probe limit for one insert or lookup
const MAX_PROBE: usize = 1024;
/// Freed slot; lookups keep probing past it
const TOMBSTONE: usize = usize::MAX;

/// Weight a sampled block was counted with, so its free subtracts the same.
struct AllocEntry {
    ptr: AtomicUsize,
    size: AtomicUsize,
    objects: AtomicU64,
    bytes: AtomicU64,
}

impl AllocEntry {
    const fn new() -> Self {
        AllocEntry {
            ptr: AtomicUsize::new(0),
            size: AtomicUsize::new(0),
            objects: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
        }
    }
}

static ALLOC_TABLE: [AllocEntry; ALLOC_TABLE_CAPACITY] =
    [const { AllocEntry::new() }; ALLOC_TABLE_CAPACITY];
/// Entries currently live in the alloc table
static TRACKED: AtomicUsize = AtomicUsize::new(0);

#[inline]
fn table_index(addr: usize) -> usize {
    // Low bits are mostly alignment
    (addr >> 4) % ALLOC_TABLE_CAPACITY
}

/// Remember a sampled block. Returns false when no slot was found, in which
/// case the block must not be counted.
#[inline]
fn track_alloc(addr: usize, size: usize, objects: u64, bytes: u64) -> bool {
    let mut idx = table_index(addr);
    for _ in 0..MAX_PROBE {
        let entry = &ALLOC_TABLE[idx];
        let stored = entry.ptr.load(Ordering::Acquire);
        if (stored == 0 || stored == TOMBSTONE)
            && entry
                .ptr
                .compare_exchange(stored, addr, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        {
            entry.size.store(size, Ordering::Relaxed);
            entry.objects.store(objects, Ordering::Relaxed);
            entry.bytes.store(bytes, Ordering::Release);
            TRACKED.fetch_add(1, Ordering::Relaxed);
            return true;
        }
        idx = (idx + 1) % ALLOC_TABLE_CAPACITY;
    }
    false
}

/// Forget a block, returning (size, objects, bytes) if it was sampled.
#[inline]
fn untrack_alloc(addr: usize) -> Option<(usize, u64, u64)> {
    if TRACKED.load(Ordering::Relaxed) == 0 {
        return None;
    }
    let mut idx = table_index(addr);
    for _ in 0..MAX_PROBE {
        let entry = &ALLOC_TABLE[idx];
        let stored = entry.ptr.load(Ordering::Acquire);
        if stored == addr {
            let bytes = entry.bytes.load(Ordering::Acquire);
            let objects = entry.objects.load(Ordering::Relaxed);
            let size = entry.size.load(Ordering::Relaxed);
            entry.ptr.store(TOMBSTONE, Ordering::Release);
            TRACKED.fetch_sub(1, Ordering::Relaxed);
            return Some((size, objects, bytes));
        }
        if stored == 0 {
            return None;
        }
        idx = (idx + 1) % ALLOC_TABLE_CAPACITY;
    }
    None
}

#[inline]
fn record_alloc(ptr: *mut u8, size: usize) {
    if !INSTALLED.load(Ordering::Relaxed) {
        INSTALLED.store(true, Ordering::Relaxed);
    }
    let addr = ptr as usize;
    let Some((objects, bytes)) = sample_weight(addr, size, memory_profile_rate()) else {
        return;
    };
    if track_alloc(addr, size, objects, bytes) {
        let counters = &COUNTERS[size_class(size)];
        counters.alloc_objects.fetch_add(objects, Ordering::Relaxed);
        counters.alloc_bytes.fetch_add(bytes, Ordering::Relaxed);
    }
}

/// Subtracts exactly what the matching [`record_alloc`] added, whatever the
/// rate is now.
#[inline]
fn record_free(ptr: *mut u8) {
    if let Some((size, objects, bytes)) = untrack_alloc(ptr as usize) {
        let counters = &COUNTERS[size_class(size)];
        counters.free_objects.fetch_add(objects, Ordering::Relaxed);
        counters.free_bytes.fetch_add(bytes, Ordering::Relaxed);
    }
}

/// A global allocator that wraps [`System`] and feeds the memory profile.
///
/// Recording is a handful of relaxed atomic adds and never allocates.
pub struct TrackingAllocator;

unsafe impl GlobalAlloc for TrackingAllocator {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { System.alloc(layout) };
        if !ptr.is_null() {
            record_alloc(ptr, layout.size());
        }
        ptr
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        record_free(ptr);
        unsafe { System.dealloc(ptr, layout) }
    }

    #[inline]
    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { System.alloc_zeroed(layout) };
        if !ptr.is_null() {
            record_alloc(ptr, layout.size());
        }
        ptr
    }

    #[inline]
    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_ptr = unsafe { System.realloc(ptr, layout, new_size) };
        if !new_ptr.is_null() {
            record_free(ptr);
            record_alloc(new_ptr, new_size);
        }
        new_ptr
    }
}
