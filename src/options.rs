//! Session configuration.

use crate::backend::{self, Backend};
use crate::error::{Error, Result};
use crate::guard::SessionGuard;
use crate::mode::Mode;
use crate::session::{Profiler, Session};
use crate::strategy::Settings;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

/// Environment variable names read by [`Options::from_env`]
pub const ENV_MODE: &str = "PROFSESSION_MODE";
/// Output folder
pub const ENV_DIR: &str = "PROFSESSION_DIR";
/// Bytes between memory samples (0 disables, 1 records every allocation)
pub const ENV_MEMORY_RATE: &str = "PROFSESSION_MEMORY_RATE";
pub const ENV_MUTEX_FRACTION: &str = "PROFSESSION_MUTEX_FRACTION";
/// CPU sampling frequency in Hz
pub const ENV_CPU_FREQ: &str = "PROFSESSION_CPU_FREQ";
pub const ENV_QUIET: &str = "PROFSESSION_QUIET";
pub const ENV_NO_SIGNALS: &str = "PROFSESSION_NO_SIGNALS";

pub const DEFAULT_FOLDER: &str = ".";

/// Called with the finished session after its output is written
pub type Callback = Box<dyn FnOnce(&Session) + Send>;

/// Builder for a profiling session
pub struct Options {
    pub(crate) folder: PathBuf,
    pub(crate) mode: Mode,
    pub(crate) settings: Settings,
    pub(crate) quiet: bool,
    pub(crate) signal_handling: bool,
    pub(crate) callback: Option<Callback>,
    pub(crate) guard: Arc<SessionGuard>,
    pub(crate) backend: Arc<dyn Backend>,
    /// Exit the process once an interrupt-triggered stop completes
    pub(crate) exit_on_interrupt: bool,
}

impl Options {
    pub fn new() -> Self {
        Options {
            folder: PathBuf::from(DEFAULT_FOLDER),
            mode: Mode::default(),
            settings: Settings::default(),
            quiet: false,
            signal_handling: true,
            callback: None,
            guard: SessionGuard::global(),
            backend: backend::native(),
            exit_on_interrupt: true,
        }
    }

    /// Defaults overridden by the `PROFSESSION_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::new().with_env(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`, which maps variable names to values.
    /// Unset and empty variables leave the current setting alone.
    pub fn with_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(mode) = get(ENV_MODE) {
            self.mode = mode.trim().parse()?;
        }
        if let Some(dir) = get(ENV_DIR) {
            self.folder = PathBuf::from(dir);
        }
        if let Some(rate) = get(ENV_MEMORY_RATE) {
            self.settings.memory_profile_rate = Some(parse_number(ENV_MEMORY_RATE, &rate)?);
        }
        if let Some(fraction) = get(ENV_MUTEX_FRACTION) {
            self.settings.mutex_fraction = parse_number(ENV_MUTEX_FRACTION, &fraction)?;
        }
        if let Some(freq) = get(ENV_CPU_FREQ) {
            self.settings.cpu_frequency = parse_number(ENV_CPU_FREQ, &freq)?;
        }
        if let Some(quiet) = get(ENV_QUIET) {
            self.quiet = parse_flag(ENV_QUIET, &quiet)?;
        }
        if let Some(no_signals) = get(ENV_NO_SIGNALS) {
            self.signal_handling = !parse_flag(ENV_NO_SIGNALS, &no_signals)?;
        }
        Ok(self)
    }

    /// Folder for the output file, created with its parents if missing
    pub fn folder(mut self, folder: impl Into<PathBuf>) -> Self {
        self.folder = folder.into();
        self
    }

    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Memory profile rate for memory modes, restored when the session ends
    pub fn memory_profile_rate(mut self, rate: usize) -> Self {
        self.settings.memory_profile_rate = Some(rate);
        self
    }

    pub fn mutex_fraction(mut self, fraction: i32) -> Self {
        self.settings.mutex_fraction = fraction;
        self
    }

    pub fn cpu_frequency(mut self, hz: i32) -> Self {
        self.settings.cpu_frequency = hz;
        self
    }

    /// Suppress the report printed when the session stops
    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    /// Leave SIGINT and SIGTERM to the host
    pub fn without_signal_handling(mut self) -> Self {
        self.signal_handling = false;
        self
    }

    pub fn callback(mut self, callback: impl FnOnce(&Session) + Send + 'static) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }

    /// Use `guard` instead of the process-wide one
    pub fn guard(mut self, guard: Arc<SessionGuard>) -> Self {
        self.guard = guard;
        self
    }

    pub fn backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = backend;
        self
    }

    pub fn start(self) -> Result<Profiler> {
        Profiler::start(self)
    }
}

impl Default for Options {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("folder", &self.folder)
            .field("mode", &self.mode)
            .field("settings", &self.settings)
            .field("quiet", &self.quiet)
            .field("signal_handling", &self.signal_handling)
            .field("callback", &self.callback.is_some())
            .finish_non_exhaustive()
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| Error::InvalidArgument(format!("{key}={value:?}: {e}")))
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::InvalidArgument(format!(
            "{key}={value:?}: expected true or false"
        ))),
    }
}
