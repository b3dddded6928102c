//! Error types for the faultline toolkit
//!
//! Injected stream faults travel as [`std::io::Error`] because the public
//! stream surface is `std::io::{Read, Write}`. This module holds the error
//! enums for the mock socket service and the task utilities, plus the fixed
//! messages used by the stream fault paths.

use std::io;

use thiserror::Error;

/// Message raised by operations on a closed revivable writer
pub const STREAM_CLOSED_MSG: &str = "Stream Closed";

/// Message raised by writes on a killed revivable writer with no
/// injected exception
pub const STREAM_KILLED_MSG: &str = "Stream [temporarily] killed";

/// Errors raised by [`MockSocketService`](crate::socket::MockSocketService)
/// registry operations
#[derive(Error, Debug)]
pub enum MockSocketServiceError {
    #[error("No connected socket mocks available")]
    NoConnectedSockets,

    #[error("[{count}] connected mock sockets instead of {expectation}")]
    WrongSocketCount { count: usize, expectation: String },

    #[error("No socket connected in {0}ms")]
    WaitTimeout(u64),

    #[error("Interrupted while waiting for a socket mock")]
    WaitInterrupted,
}

/// Errors raised by the task utilities in [`crate::task`]
#[derive(Error, Debug)]
pub enum TaskError {
    #[error("Time limit of {0}ms exceeded")]
    TimeLimitExceeded(u64),

    #[error("Task panicked: {0}")]
    Failed(String),

    #[error("Task result not available within {0}ms")]
    ResultTimeout(u64),
}

/// Result type alias for service registry operations
pub type ServiceResult<T> = std::result::Result<T, MockSocketServiceError>;

/// Build the fixed "closed stream" I/O error.
pub(crate) fn stream_closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, STREAM_CLOSED_MSG)
}

/// Build the fixed "killed stream" I/O error (kill with no exception set).
pub(crate) fn stream_killed_error() -> io::Error {
    io::Error::other(STREAM_KILLED_MSG)
}

/// Build the interrupted-I/O error raised when a blocking wait observes the
/// calling thread's interrupt flag.
pub(crate) fn interrupted_error() -> io::Error {
    io::Error::new(io::ErrorKind::Interrupted, "interrupted I/O")
}
