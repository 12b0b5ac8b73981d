//! Running profiling sessions.
//!
//! [`Options::start`](crate::Options::start) hands back a [`Profiler`]. The
//! session it drives ends exactly once: by [`Profiler::stop`], by an
//! interrupt reaching its watcher, or by dropping the `Profiler`. Each of
//! those claims the session's stop slot first; whoever loses the claim does
//! nothing.

use crate::error::{Error, Result};
use crate::guard::SessionGuard;
use crate::mode::Mode;
use crate::options::{Callback, Options};
use crate::report::Report;
use crate::sink::Sink;
use crate::strategy::{self, Settings, Teardown};
use crate::watcher::{self, Watcher};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// What a session was started with and where it writes
#[derive(Debug)]
pub struct Session {
    id: u64,
    mode: Mode,
    folder: PathBuf,
    output_path: PathBuf,
    settings: Settings,
    quiet: bool,
    signal_handling: bool,
    interrupted: AtomicBool,
}

impl Session {
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Folder the output file was created in. Differs from the configured
    /// folder when that could not be created.
    pub fn folder(&self) -> &Path {
        &self.folder
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn quiet(&self) -> bool {
        self.quiet
    }

    pub fn signal_handling(&self) -> bool {
        self.signal_handling
    }

    /// Whether an interrupt ended the session
    pub fn interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }
}

/// Work still owed by a session that has not been stopped
struct Pending {
    teardown: Teardown,
    callback: Option<Callback>,
}

enum Slot {
    Pending(Pending),
    StoppedByCaller,
    StoppedByInterrupt,
}

enum Claim {
    Won(Pending),
    AlreadyStopped,
    Interrupted,
}

/// State shared between the caller's `Profiler` and the watcher thread
struct Shared {
    session: Session,
    guard: Arc<SessionGuard>,
    slot: Mutex<Slot>,
    exit_on_interrupt: bool,
}

impl Shared {
    /// Take the stop slot, leaving a marker of who took it.
    fn claim(&self, by_interrupt: bool) -> Claim {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        match &*slot {
            Slot::StoppedByCaller => return Claim::AlreadyStopped,
            Slot::StoppedByInterrupt => return Claim::Interrupted,
            Slot::Pending(_) => {}
        }
        let marker = if by_interrupt {
            Slot::StoppedByInterrupt
        } else {
            Slot::StoppedByCaller
        };
        match std::mem::replace(&mut *slot, marker) {
            Slot::Pending(pending) => Claim::Won(pending),
            _ => Claim::AlreadyStopped,
        }
    }

    fn is_pending(&self) -> bool {
        matches!(
            *self.slot.lock().unwrap_or_else(PoisonError::into_inner),
            Slot::Pending(_)
        )
    }

    /// Release the guard, tear down, call back, report.
    fn finish(&self, pending: Pending) -> Result<()> {
        let released = self.guard.release();
        let torn_down = pending.teardown.run();
        released?;
        torn_down?;
        tracing::debug!(
            session = self.session.id,
            mode = %self.session.mode,
            "profiling session stopped"
        );

        if let Some(callback) = pending.callback {
            callback(&self.session);
        }
        if !self.session.quiet {
            Report::new(&self.session).print();
        }
        Ok(())
    }

    /// Runs on the watcher thread. Returns the result the process should
    /// exit with, if it should.
    fn interrupt(&self) -> Option<Result<()>> {
        let Claim::Won(pending) = self.claim(true) else {
            return None;
        };
        self.session.interrupted.store(true, Ordering::Release);
        if !self.session.quiet {
            eprintln!("interrupt received, performing tear down");
        }

        let result = self.finish(pending);
        if self.exit_on_interrupt {
            return Some(result);
        }
        if let Err(err) = result {
            tracing::error!(error = %err, "stopping interrupted session failed");
        }
        None
    }
}

/// Handle to a running session
pub struct Profiler {
    shared: Arc<Shared>,
    watcher: Option<Watcher>,
}

impl Profiler {
    pub(crate) fn start(options: Options) -> Result<Profiler> {
        let guard = Arc::clone(&options.guard);
        guard.acquire()?;
        Self::setup(options).inspect_err(|_| {
            // Setup cannot have released it, the guard is still ours
            let _ = guard.release();
        })
    }

    fn setup(options: Options) -> Result<Profiler> {
        let Options {
            folder,
            mode,
            settings,
            quiet,
            signal_handling,
            callback,
            guard,
            backend,
            exit_on_interrupt,
        } = options;

        if signal_handling {
            watcher::install_handler()?;
        }

        let sink = Sink::create(&folder, mode.file_name())?;
        let output_path = sink.path().to_path_buf();
        let folder = output_path.parent().map(Path::to_path_buf).unwrap_or(folder);
        let teardown = strategy::resolve(mode)(sink, &settings, &backend)?;

        let session = Session {
            id: NEXT_SESSION.fetch_add(1, Ordering::Relaxed),
            mode,
            folder,
            output_path,
            settings,
            quiet,
            signal_handling,
            interrupted: AtomicBool::new(false),
        };
        tracing::debug!(
            session = session.id,
            %mode,
            path = %session.output_path.display(),
            "profiling session started"
        );

        let shared = Arc::new(Shared {
            session,
            guard,
            slot: Mutex::new(Slot::Pending(Pending { teardown, callback })),
            exit_on_interrupt,
        });

        let watcher = if signal_handling {
            let on_interrupt = {
                let shared = Arc::clone(&shared);
                move || shared.interrupt()
            };
            let terminate = watcher::terminate_process();
            match watcher::arm(shared.session.id, on_interrupt, terminate) {
                Ok(watcher) => Some(watcher),
                Err(err) => {
                    if let Claim::Won(pending) = shared.claim(false)
                        && let Err(teardown_err) = pending.teardown.run()
                    {
                        tracing::warn!(error = %teardown_err, "teardown after failed start");
                    }
                    return Err(err);
                }
            }
        } else {
            None
        };

        Ok(Profiler { shared, watcher })
    }

    pub fn session(&self) -> &Session {
        &self.shared.session
    }

    /// Stop the session: release the guard, finish the capture, run the
    /// callback and print the report.
    ///
    /// Stopping twice is [`Error::NotStarted`]. Stopping a session an
    /// interrupt already stopped waits for that stop and returns `Ok`.
    pub fn stop(&mut self) -> Result<()> {
        let claim = self.shared.claim(false);
        if let Some(watcher) = self.watcher.take() {
            watcher.disarm();
        }
        match claim {
            Claim::Won(pending) => self.shared.finish(pending),
            Claim::Interrupted => Ok(()),
            Claim::AlreadyStopped => Err(Error::NotStarted),
        }
    }
}

impl fmt::Debug for Profiler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Profiler")
            .field("session", &self.shared.session)
            .finish()
    }
}

impl Drop for Profiler {
    fn drop(&mut self) {
        if !self.shared.is_pending() {
            if let Some(watcher) = self.watcher.take() {
                watcher.disarm();
            }
            return;
        }
        if let Err(err) = self.stop() {
            tracing::error!(
                error = %err,
                mode = %self.shared.session.mode,
                "stopping profiler on drop failed"
            );
        }
    }
}
