//! Interrupt handling for running sessions.
//!
//! One process-wide `ctrlc` handler (SIGINT and SIGTERM) is installed the
//! first time a session asks for it. The handler never tears anything down
//! itself: it forwards the interrupt into a one-slot channel per armed
//! session, and each session's watcher thread, blocked on that channel,
//! runs the stop sequence. With nothing armed the process exits with 130.
//!
//! A watcher that terminates the process first waits until every session
//! the interrupt reached has finished stopping.

use crate::error::{Error, Result, die, exit_code};
use std::sync::mpsc::{self, SyncSender};
use std::sync::{Condvar, Mutex, OnceLock, PoisonError};
use std::thread::{self, JoinHandle};

struct Armed {
    session: u64,
    interrupt: SyncSender<()>,
}

static ARMED: Mutex<Vec<Armed>> = Mutex::new(Vec::new());
static HANDLER: OnceLock<std::result::Result<(), String>> = OnceLock::new();
/// Interrupts delivered to a watcher whose stop has not finished yet
static IN_FLIGHT: Mutex<usize> = Mutex::new(0);
static SETTLED: Condvar = Condvar::new();

/// What a watcher does once its session's stop has run
pub(crate) type Terminate = Box<dyn FnOnce(Result<()>) + Send>;

/// Install the process-wide signal handler, once.
pub(crate) fn install_handler() -> Result<()> {
    HANDLER
        .get_or_init(|| {
            ctrlc::set_handler(on_signal)
                .map_err(|e| format!("cannot install interrupt handler: {e}"))
        })
        .clone()
        .map_err(Error::Signal)
}

fn on_signal() {
    if !forward() {
        std::process::exit(exit_code::INTERRUPTED);
    }
}

/// Deliver an interrupt to every armed session. Returns false when none is armed.
pub(crate) fn forward() -> bool {
    let armed = ARMED.lock().unwrap_or_else(PoisonError::into_inner);
    for session in armed.iter() {
        // Counted before sending so the watcher never settles it first
        *IN_FLIGHT.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        // A full slot already holds an undelivered interrupt
        if session.interrupt.try_send(()).is_err() {
            drop(Delivery);
        }
    }
    !armed.is_empty()
}

/// Exit with 0 on success, or through [`die`].
pub(crate) fn terminate_process() -> Terminate {
    Box::new(|result| match result {
        Ok(()) => std::process::exit(exit_code::SUCCESS),
        Err(err) => die(&err),
    })
}

/// Marks one delivered interrupt as handled, even if the stop panicked.
struct Delivery;

impl Drop for Delivery {
    fn drop(&mut self) {
        let mut in_flight = IN_FLIGHT.lock().unwrap_or_else(PoisonError::into_inner);
        *in_flight = in_flight.saturating_sub(1);
        SETTLED.notify_all();
    }
}

fn wait_settled() {
    let in_flight = IN_FLIGHT.lock().unwrap_or_else(PoisonError::into_inner);
    let _settled = SETTLED
        .wait_while(in_flight, |n| *n > 0)
        .unwrap_or_else(PoisonError::into_inner);
}

/// A session's watcher thread
#[derive(Debug)]
pub(crate) struct Watcher {
    session: u64,
    handle: JoinHandle<()>,
}

/// Spawn a watcher that runs `on_interrupt` when an interrupt reaches `session`.
///
/// `on_interrupt` returns `Some` when the process should end with that
/// result, which `terminate` receives after all interrupted sessions settle.
pub(crate) fn arm(
    session: u64,
    on_interrupt: impl FnOnce() -> Option<Result<()>> + Send + 'static,
    terminate: Terminate,
) -> Result<Watcher> {
    let (interrupt, interrupted) = mpsc::sync_channel(1);
    let handle = thread::Builder::new()
        .name("profsession-watcher".into())
        .spawn(move || {
            // Err means the session was disarmed
            if interrupted.recv().is_err() {
                return;
            }
            let delivery = Delivery;
            let outcome = on_interrupt();
            drop(delivery);
            if let Some(result) = outcome {
                wait_settled();
                terminate(result);
            }
        })
        .map_err(|e| Error::Signal(format!("cannot spawn interrupt watcher: {e}")))?;

    ARMED
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(Armed { session, interrupt });
    tracing::debug!(session, "interrupt watcher armed");
    Ok(Watcher { session, handle })
}

impl Watcher {
    /// Stop forwarding interrupts to this session and wait for the watcher
    /// to finish, including a stop it may be running.
    pub(crate) fn disarm(self) {
        ARMED
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|armed| armed.session != self.session);

        if self.handle.thread().id() == thread::current().id() {
            return;
        }
        if self.handle.join().is_err() {
            tracing::error!(session = self.session, "interrupt watcher panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    fn keep_running() -> Terminate {
        Box::new(|_| {})
    }

    #[test]
    #[serial]
    fn test_interrupt_runs_watcher_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let watcher = arm(
            9001,
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                None
            },
            keep_running(),
        )
        .unwrap();

        assert!(forward());
        assert!(forward());
        watcher.disarm();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[serial]
    fn test_disarm_without_interrupt_skips_callback() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let watcher = arm(
            9002,
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                None
            },
            keep_running(),
        )
        .unwrap();

        watcher.disarm();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!forward());
    }

    #[test]
    #[serial]
    fn test_terminate_waits_for_every_interrupted_session() {
        let slow_done = Arc::new(AtomicBool::new(false));
        let seen_at_exit = Arc::new(Mutex::new(Vec::new()));

        let fast = {
            let slow_done = Arc::clone(&slow_done);
            let seen = Arc::clone(&seen_at_exit);
            arm(
                9003,
                || Some(Ok(())),
                Box::new(move |result| {
                    assert!(result.is_ok());
                    seen.lock().unwrap().push(slow_done.load(Ordering::SeqCst));
                }),
            )
            .unwrap()
        };
        let slow = {
            let slow_done = Arc::clone(&slow_done);
            arm(
                9004,
                move || {
                    thread::sleep(Duration::from_millis(100));
                    slow_done.store(true, Ordering::SeqCst);
                    None
                },
                keep_running(),
            )
            .unwrap()
        };

        assert!(forward());
        fast.disarm();
        slow.disarm();
        assert_eq!(*seen_at_exit.lock().unwrap(), vec![true]);
        assert_eq!(*IN_FLIGHT.lock().unwrap(), 0);
    }

    #[test]
    #[serial]
    fn test_handler_install_is_idempotent() {
        install_handler().unwrap();
        install_handler().unwrap();
    }
}
