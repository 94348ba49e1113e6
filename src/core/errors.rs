/*!
 * Error Types
 * Centralized error handling with thiserror and miette
 */

use super::types::{Pid, StreamKind};
use miette::Diagnostic;
use std::io;
use thiserror::Error;

/// Errors raised by pipe creation, process launch and stream I/O
///
/// Every OS-level failure carries the underlying `io::Error` as its source so
/// the errno survives for diagnostics.
#[derive(Error, Debug, Diagnostic)]
pub enum PopenError {
    #[error("Failed to create pipe: {source}")]
    #[diagnostic(
        code(popen::pipe_creation_failed),
        help("Check the open file descriptor limit and that the FIFO directory is writable.")
    )]
    PipeCreationFailed {
        #[source]
        source: io::Error,
    },

    #[error("Failed to create process '{command}': {source}")]
    #[diagnostic(
        code(popen::spawn_failed),
        help("Check that the shell exists and the working directory is valid.")
    )]
    ProcessSpawnFailed {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to wrap {stream} pipe as a stream: {source}")]
    #[diagnostic(code(popen::stream_wrap_failed))]
    StreamWrapFailed {
        stream: StreamKind,
        #[source]
        source: io::Error,
    },

    #[error("Invalid stream handle: {0}")]
    #[diagnostic(
        code(popen::invalid_stream_handle),
        help("Only stdout/stderr handles returned by a launch can be polled.")
    )]
    InvalidStreamHandle(String),

    #[error("Read failed on {stream}: {source}")]
    #[diagnostic(code(popen::read_failed))]
    ReadFailed {
        stream: StreamKind,
        #[source]
        source: io::Error,
    },

    #[error("Write failed on {stream}: {source}")]
    #[diagnostic(code(popen::write_failed))]
    WriteFailed {
        stream: StreamKind,
        #[source]
        source: io::Error,
    },

    #[error("Invalid state: {0}")]
    #[diagnostic(
        code(popen::invalid_state),
        help("Operation cannot be performed in the current pipe or record state.")
    )]
    InvalidState(String),

    #[error("Process {0} not found")]
    #[diagnostic(
        code(popen::not_found),
        help("The process was never launched by this registry or its status was already collected.")
    )]
    NotFound(Pid),

    #[error("Timed out after {elapsed_ms}ms waiting on process {pid}")]
    #[diagnostic(code(popen::timeout))]
    Timeout { pid: Pid, elapsed_ms: u64 },

    #[error("Failed to query status of process {pid}: {source}")]
    #[diagnostic(code(popen::wait_failed))]
    WaitFailed {
        pid: Pid,
        #[source]
        source: io::Error,
    },
}

impl PopenError {
    /// Raw OS error code of the underlying failure, if any
    pub fn os_error_code(&self) -> Option<i32> {
        match self {
            PopenError::PipeCreationFailed { source }
            | PopenError::ProcessSpawnFailed { source, .. }
            | PopenError::StreamWrapFailed { source, .. }
            | PopenError::ReadFailed { source, .. }
            | PopenError::WriteFailed { source, .. }
            | PopenError::WaitFailed { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }

    pub(crate) fn pipe(source: impl Into<io::Error>) -> Self {
        PopenError::PipeCreationFailed {
            source: source.into(),
        }
    }
}

/// Result alias used throughout the crate
pub type PopenResult<T> = Result<T, PopenError>;
