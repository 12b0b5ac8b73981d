use crate::mode::Mode;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("profiler instance has already been started")]
    AlreadyStarted,

    #[error("profiler instance was not started")]
    NotStarted,

    #[error("{mode} capture failed: {reason}")]
    Backend { mode: Mode, reason: String },

    #[error("Sampler error: {0}")]
    Sampler(String),

    #[error("Signal handling error: {0}")]
    Signal(String),

    #[error("Failed to create temp folder: {0}")]
    TempFolder(#[source] std::io::Error),

    #[error("Failed to create profile file {}: {source}", path.display())]
    ProfileFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, Error>;

pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const GENERAL_ERROR: i32 = 1;
    pub const INVALID_ARGUMENTS: i32 = 2;
    pub const MISUSE: i32 = 3;
    pub const BACKEND_ERROR: i32 = 4;
    pub const OUTPUT_ERROR: i32 = 5;
    /// Interrupt delivered while no session was armed (128 + SIGINT)
    pub const INTERRUPTED: i32 = 130;
}

impl Error {
    pub fn backend(mode: Mode, reason: impl ToString) -> Self {
        Error::Backend {
            mode,
            reason: reason.to_string(),
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Error::AlreadyStarted | Error::NotStarted => exit_code::MISUSE,
            Error::Backend { .. } | Error::Sampler(_) | Error::Signal(_) => {
                exit_code::BACKEND_ERROR
            }
            Error::TempFolder(_) | Error::ProfileFile { .. } | Error::Io(_) => {
                exit_code::OUTPUT_ERROR
            }
            Error::InvalidArgument(_) => exit_code::INVALID_ARGUMENTS,
        }
    }
}

/// Print `err` and terminate the process with its exit code.
pub fn die(err: &Error) -> ! {
    eprintln!("profiler instance exited: {err}");
    std::process::exit(err.exit_code())
}
