//! OS thread enumeration from /proc/self/task.

use std::io;

/// Scheduler state of a thread as reported in /proc/[pid]/task/[tid]/stat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadState {
    Running,
    Sleeping,
    DiskSleep,
    Stopped,
    Zombie,
    Idle,
    Unknown,
}

impl ThreadState {
    pub fn from_code(code: char) -> Self {
        match code {
            'R' => ThreadState::Running,
            'S' => ThreadState::Sleeping,
            'D' => ThreadState::DiskSleep,
            'T' | 't' => ThreadState::Stopped,
            'Z' | 'X' => ThreadState::Zombie,
            'I' => ThreadState::Idle,
            _ => ThreadState::Unknown,
        }
    }

    /// Whether the thread was on (or queued for) a CPU
    pub fn is_on_cpu(self) -> bool {
        self == ThreadState::Running
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ThreadState::Running => "running",
            ThreadState::Sleeping => "sleeping",
            ThreadState::DiskSleep => "disk sleep",
            ThreadState::Stopped => "stopped",
            ThreadState::Zombie => "zombie",
            ThreadState::Idle => "idle",
            ThreadState::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadInfo {
    pub tid: u64,
    pub name: String,
    pub state: ThreadState,
}

/// Parse the name and state out of a task `stat` line.
///
/// The name sits between the first `(` and the last `)` and may itself
/// contain spaces and parentheses.
pub fn parse_stat(line: &str) -> Option<(String, ThreadState)> {
    let open = line.find('(')?;
    let close = line.rfind(')')?;
    if close < open {
        return None;
    }
    let name = line[open + 1..close].to_string();
    let code = line[close + 1..].trim_start().chars().next()?;
    Some((name, ThreadState::from_code(code)))
}

/// Every thread of the current process, ordered by thread id.
#[cfg(target_os = "linux")]
pub fn snapshot() -> io::Result<Vec<ThreadInfo>> {
    let mut threads = Vec::new();
    for entry in std::fs::read_dir("/proc/self/task")?.flatten() {
        let Some(tid) = entry.file_name().to_str().and_then(|s| s.parse::<u64>().ok()) else {
            continue;
        };
        // Threads can exit between read_dir and read
        let Ok(stat) = std::fs::read_to_string(entry.path().join("stat")) else {
            continue;
        };
        if let Some((name, state)) = parse_stat(&stat) {
            threads.push(ThreadInfo { tid, name, state });
        }
    }
    threads.sort_by_key(|t| t.tid);
    Ok(threads)
}

/// Only the calling thread is visible without procfs.
#[cfg(not(target_os = "linux"))]
pub fn snapshot() -> io::Result<Vec<ThreadInfo>> {
    let current = std::thread::current();
    Ok(vec![ThreadInfo {
        tid: current_tid(),
        name: current.name().unwrap_or("unnamed").to_string(),
        state: ThreadState::Running,
    }])
}

/// Kernel thread id of the calling thread
#[cfg(target_os = "linux")]
pub fn current_tid() -> u64 {
    nix::unistd::gettid().as_raw() as u64
}

#[cfg(not(target_os = "linux"))]
pub fn current_tid() -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    std::thread::current().id().hash(&mut hasher);
    hasher.finish()
}
