//! Process-wide exclusivity gate for profiling sessions.
//!
//! Sessions mutate process-global sampling settings (memory profile rate,
//! mutex fraction, the CPU sampling timer), so two overlapping sessions would
//! corrupt each other. The guard admits one session at a time. Every
//! transition is a single compare-and-swap, so racing starts (or a racing
//! caller and interrupt stop) cannot both win.

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, LazyLock};

const IDLE: u8 = 0;
const ACTIVE: u8 = 1;

static GLOBAL: LazyLock<Arc<SessionGuard>> = LazyLock::new(|| Arc::new(SessionGuard::new()));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardState {
    Idle,
    Active,
}

#[derive(Debug)]
pub struct SessionGuard {
    state: AtomicU8,
}

impl SessionGuard {
    pub const fn new() -> Self {
        SessionGuard {
            state: AtomicU8::new(IDLE),
        }
    }

    /// The guard shared by every session that does not bring its own
    pub fn global() -> Arc<SessionGuard> {
        Arc::clone(&GLOBAL)
    }

    pub fn state(&self) -> GuardState {
        match self.state.load(Ordering::Acquire) {
            ACTIVE => GuardState::Active,
            _ => GuardState::Idle,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state() == GuardState::Active
    }

    /// Idle -> Active. Fails with [`Error::AlreadyStarted`] if a session holds it.
    pub fn acquire(&self) -> Result<()> {
        self.state
            .compare_exchange(IDLE, ACTIVE, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| Error::AlreadyStarted)
    }

    /// Active -> Idle. Fails with [`Error::NotStarted`] if nothing holds it.
    pub fn release(&self) -> Result<()> {
        self.state
            .compare_exchange(ACTIVE, IDLE, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| Error::NotStarted)
    }

    /// Force the guard back to idle without stopping anything.
    pub fn reset(&self) {
        self.state.store(IDLE, Ordering::Release);
    }
}

impl Default for SessionGuard {
    fn default() -> Self {
        Self::new()
    }
}
