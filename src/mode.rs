//! Profiling modes and the fixed output file each one writes.

use crate::error::Error;
use std::fmt;
use std::str::FromStr;

pub const CPU_FILE_NAME: &str = "cpu.pprof";
/// Shared by heap and alloc profiling
pub const MEMORY_FILE_NAME: &str = "memory.pprof";
pub const BLOCK_FILE_NAME: &str = "block.pprof";
pub const GOROUTINE_FILE_NAME: &str = "goroutine.pprof";
pub const MUTEX_FILE_NAME: &str = "mutex.pprof";
pub const THREAD_CREATE_FILE_NAME: &str = "threadcreate.pprof";
pub const TRACE_FILE_NAME: &str = "trace.out";
pub const CLOCK_FILE_NAME: &str = "clock.pprof";

/// The kind of capture a session performs. Exactly one per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Mode {
    /// Sampled on-CPU stacks
    #[default]
    Cpu,
    /// Live allocations at the end of the session
    MemoryHeap,
    /// Every sampled allocation since process start
    MemoryAlloc,
    /// Lock contention recorded by instrumented mutexes
    Mutex,
    /// Time spent blocked in instrumented waits
    Block,
    /// Live threads of the process at session start, written under the
    /// goroutine profile name
    Goroutine,
    /// OS threads of the process at session end
    ThreadCreate,
    /// Streamed span and event timeline
    Trace,
    /// Wall-clock sampling of on-CPU and off-CPU thread time
    Clock,
}

/// Tool suggested in the report for looking at the output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Viewer {
    Pprof,
    Perfetto,
}

impl Mode {
    pub const ALL: [Mode; 9] = [
        Mode::Cpu,
        Mode::MemoryHeap,
        Mode::MemoryAlloc,
        Mode::Mutex,
        Mode::Block,
        Mode::Goroutine,
        Mode::ThreadCreate,
        Mode::Trace,
        Mode::Clock,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Mode::Cpu => "cpu",
            Mode::MemoryHeap => "heap",
            Mode::MemoryAlloc => "allocs",
            Mode::Mutex => "mutex",
            Mode::Block => "block",
            Mode::Goroutine => "goroutine",
            Mode::ThreadCreate => "threadcreate",
            Mode::Trace => "trace",
            Mode::Clock => "clock",
        }
    }

    /// File written under the session's output folder
    pub fn file_name(self) -> &'static str {
        match self {
            Mode::Cpu => CPU_FILE_NAME,
            Mode::MemoryHeap | Mode::MemoryAlloc => MEMORY_FILE_NAME,
            Mode::Mutex => MUTEX_FILE_NAME,
            Mode::Block => BLOCK_FILE_NAME,
            Mode::Goroutine => GOROUTINE_FILE_NAME,
            Mode::ThreadCreate => THREAD_CREATE_FILE_NAME,
            Mode::Trace => TRACE_FILE_NAME,
            Mode::Clock => CLOCK_FILE_NAME,
        }
    }

    pub fn viewer(self) -> Viewer {
        match self {
            Mode::Trace => Viewer::Perfetto,
            _ => Viewer::Pprof,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Mode::Cpu => "sampled on-CPU call stacks",
            Mode::MemoryHeap => "in-use memory by allocation size class",
            Mode::MemoryAlloc => "all sampled allocations by size class",
            Mode::Mutex => "contended ProfiledMutex acquisitions by call site",
            Mode::Block => "blocking waits by call site",
            Mode::Goroutine => "live threads and their state at start",
            Mode::ThreadCreate => "OS threads present at stop",
            Mode::Trace => "span and event timeline (Chrome trace JSON)",
            Mode::Clock => "on-CPU and off-CPU wall-clock time per thread",
        }
    }

    /// Heap and alloc profiling both drive the memory profile rate
    pub fn is_memory(self) -> bool {
        matches!(self, Mode::MemoryHeap | Mode::MemoryAlloc)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "memory" | "mem" => return Ok(Mode::MemoryHeap),
            "alloc" => return Ok(Mode::MemoryAlloc),
            "thread-create" | "threads" => return Ok(Mode::ThreadCreate),
            _ => {}
        }
        Mode::ALL
            .into_iter()
            .find(|mode| mode.name() == normalized)
            .ok_or_else(|| {
                let known: Vec<_> = Mode::ALL.iter().map(|m| m.name()).collect();
                Error::InvalidArgument(format!(
                    "unknown profiling mode '{}', expected one of: {}",
                    s,
                    known.join(", ")
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_file_name_table() {
        assert_eq!(Mode::Cpu.file_name(), "cpu.pprof");
        assert_eq!(Mode::MemoryHeap.file_name(), "memory.pprof");
        assert_eq!(Mode::MemoryAlloc.file_name(), "memory.pprof");
        assert_eq!(Mode::Block.file_name(), "block.pprof");
        assert_eq!(Mode::Goroutine.file_name(), "goroutine.pprof");
        assert_eq!(Mode::Mutex.file_name(), "mutex.pprof");
        assert_eq!(Mode::ThreadCreate.file_name(), "threadcreate.pprof");
        assert_eq!(Mode::Trace.file_name(), "trace.out");
        assert_eq!(Mode::Clock.file_name(), "clock.pprof");
    }

    #[test]
    fn test_only_memory_modes_share_a_file() {
        let files: HashSet<_> = Mode::ALL.iter().map(|m| m.file_name()).collect();
        assert_eq!(files.len(), Mode::ALL.len() - 1);
        assert!(
            Mode::ALL
                .iter()
                .filter(|m| m.is_memory())
                .all(|m| m.file_name() == MEMORY_FILE_NAME)
        );
    }

    #[test]
    fn test_parse_names_and_aliases() {
        for mode in Mode::ALL {
            assert_eq!(mode.name().parse::<Mode>().unwrap(), mode);
        }
        assert_eq!("Memory".parse::<Mode>().unwrap(), Mode::MemoryHeap);
        assert_eq!(" alloc ".parse::<Mode>().unwrap(), Mode::MemoryAlloc);
        assert_eq!("thread-create".parse::<Mode>().unwrap(), Mode::ThreadCreate);
    }

    #[test]
    fn test_parse_unknown_mode() {
        let err = "flamegraph".parse::<Mode>().unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(err.to_string().contains("flamegraph"));
    }

    #[test]
    fn test_only_trace_uses_perfetto() {
        for mode in Mode::ALL {
            let expected = if mode == Mode::Trace {
                Viewer::Perfetto
            } else {
                Viewer::Pprof
            };
            assert_eq!(mode.viewer(), expected);
        }
    }
}
