//! Error taxonomy for the profiling engine
//!
//! Configuration errors (`InvalidArgument`, `UnsupportedMeasurement`) surface
//! from the call that caused them and leave session state untouched.
//! Lifecycle errors (`AlreadyRunning`, `NotRunning`) leave the session in its
//! prior state. `StackIntegrityViolation` taints a single thread's data.

use crate::session::ThreadKey;
use thiserror::Error;

/// Errors raised by the profiler
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProfileError {
    #[error("profiler is already running")]
    AlreadyRunning,

    #[error("profiler is not running")]
    NotRunning,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("stack integrity violation on thread {thread}: {detail}")]
    StackIntegrityViolation { thread: ThreadKey, detail: String },

    #[error("unsupported measurement: {0}")]
    UnsupportedMeasurement(String),
}

pub type Result<T> = std::result::Result<T, ProfileError>;
