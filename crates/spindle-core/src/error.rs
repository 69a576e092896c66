//! Error types for the spindle runtime

use core::fmt;

/// Result type for runtime operations
pub type SchedResult<T> = Result<T, SchedError>;

/// Errors that can occur in runtime operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedError {
    /// Operation was cancelled before completion
    Cancelled,

    /// Operation timed out
    TimedOut,

    /// The (fd, event) pair is already registered
    EventExists,

    /// No such (fd, event) registration
    NoSuchEvent,

    /// Stack allocation (mmap/mprotect) failed
    StackAlloc,

    /// Scheduler was already started
    AlreadyStarted,

    /// Scheduler has been stopped
    Stopped,

    /// Invalid configuration value
    InvalidConfig(&'static str),

    /// Not running on a scheduler worker thread
    NotOnWorker,

    /// Platform-specific error carrying the raw errno
    Platform(i32),
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedError::Cancelled => write!(f, "operation cancelled"),
            SchedError::TimedOut => write!(f, "operation timed out"),
            SchedError::EventExists => write!(f, "event already registered for fd"),
            SchedError::NoSuchEvent => write!(f, "no such event registration"),
            SchedError::StackAlloc => write!(f, "fiber stack allocation failed"),
            SchedError::AlreadyStarted => write!(f, "scheduler already started"),
            SchedError::Stopped => write!(f, "scheduler is stopped"),
            SchedError::InvalidConfig(what) => write!(f, "invalid configuration: {}", what),
            SchedError::NotOnWorker => write!(f, "not on a scheduler worker thread"),
            SchedError::Platform(errno) => write!(f, "os error {}", errno),
        }
    }
}

impl std::error::Error for SchedError {}

impl From<SchedError> for std::io::Error {
    fn from(e: SchedError) -> Self {
        match e {
            SchedError::TimedOut => std::io::Error::from_raw_os_error(110), // ETIMEDOUT
            SchedError::Platform(errno) => std::io::Error::from_raw_os_error(errno),
            other => std::io::Error::new(std::io::ErrorKind::Other, other),
        }
    }
}
