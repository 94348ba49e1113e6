/*!
 * Asynchronous Reads
 *
 * Per-stream non-blocking read state machine. Each poll either returns data
 * that is already available, asks the caller to try again, or reports that
 * the stream is closed for good. It never blocks.
 */

use super::text::strip_carriage_returns;
use crate::core::errors::PopenError;
use crate::core::limits::ASYNC_READ_BUFFER_SIZE;
use crate::core::types::{Chunk, StreamKind};
use crate::pipe::PipeEndpoint;
use bytes::Bytes;
use log::{debug, trace, warn};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::fmt;
use std::io::{self, Read};

/// Read state of one output stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    /// No read outstanding
    Idle,
    /// Last read found the pipe empty; waiting for readiness
    Pending,
    /// Last read returned data
    Completed,
    /// Unrecoverable read error
    Failed,
    /// Writer side closed and everything was read
    Closed,
}

impl ReadState {
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, ReadState::Failed | ReadState::Closed)
    }
}

/// Non-blocking reader bound to the read end of an asynchronous pipe
///
/// The endpoint must have been opened non-blocking; a blocking endpoint
/// would stall `poll` inside `read(2)`.
pub struct AsyncReadState {
    stream: StreamKind,
    endpoint: Option<PipeEndpoint>,
    state: ReadState,
    bytes_read: usize,
    buffer: Box<[u8; ASYNC_READ_BUFFER_SIZE]>,
    failure: Option<PopenError>,
}

impl AsyncReadState {
    pub fn new(stream: StreamKind, endpoint: PipeEndpoint) -> Self {
        Self {
            stream,
            endpoint: Some(endpoint),
            state: ReadState::Idle,
            bytes_read: 0,
            buffer: Box::new([0u8; ASYNC_READ_BUFFER_SIZE]),
            failure: None,
        }
    }

    #[inline]
    pub fn stream(&self) -> StreamKind {
        self.stream
    }

    #[inline]
    pub fn state(&self) -> ReadState {
        self.state
    }

    #[inline]
    pub fn is_pending(&self) -> bool {
        self.state == ReadState::Pending
    }

    /// Bytes surfaced by the last completed read, after normalization
    #[inline]
    pub fn bytes_read(&self) -> usize {
        self.bytes_read
    }

    /// Cause of a `Failed` state
    pub fn failure(&self) -> Option<&PopenError> {
        self.failure.as_ref()
    }

    /// Whether a read can be attempted without blocking
    ///
    /// Only a pending read needs the OS to tell it anything; every other
    /// state is already signalled.
    pub fn is_signalled(&self) -> bool {
        match self.state {
            ReadState::Pending => self.readiness().unwrap_or(true),
            _ => true,
        }
    }

    /// Poll the stream once
    pub fn poll(&mut self) -> Chunk {
        match self.state {
            ReadState::Failed | ReadState::Closed => return Chunk::Closed,
            ReadState::Pending => match self.readiness() {
                Ok(false) => return Chunk::TryAgain,
                Ok(true) => {}
                Err(e) => return self.fail(e),
            },
            ReadState::Idle | ReadState::Completed => {}
        }
        self.submit_read()
    }

    /// Abandon an outstanding read before the buffer or endpoint go away
    ///
    /// Non-blocking `read(2)` calls finish before returning, so the kernel
    /// never holds a reference into the buffer once a poll returns. A
    /// pending state only records that the last attempt found the pipe
    /// empty, and cancelling it is a state change.
    pub fn cancel(&mut self) {
        if self.state == ReadState::Pending {
            trace!("Cancelled pending {} read", self.stream);
            self.state = ReadState::Idle;
        }
    }

    fn readiness(&self) -> io::Result<bool> {
        let endpoint = self
            .endpoint
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "read endpoint released"))?;
        let mut fds = [PollFd::new(endpoint.borrow_fd()?, PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::ZERO) {
            Ok(0) => Ok(false),
            // POLLHUP and POLLERR also mean the next read will not block
            Ok(_) => Ok(fds[0].revents().map_or(false, |events| !events.is_empty())),
            Err(Errno::EINTR) => Ok(false),
            Err(e) => Err(io::Error::from(e)),
        }
    }

    fn submit_read(&mut self) -> Chunk {
        let endpoint = match self.endpoint.as_mut() {
            Some(endpoint) => endpoint,
            None => {
                return self.fail(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "read endpoint released",
                ))
            }
        };

        let outcome = loop {
            match endpoint.read(&mut self.buffer[..]) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => break other,
            }
        };

        match outcome {
            Ok(0) => {
                debug!("{} reached end of stream", self.stream);
                self.bytes_read = 0;
                self.state = ReadState::Closed;
                Chunk::Closed
            }
            Ok(n) => {
                let kept = strip_carriage_returns(&mut self.buffer[..n]);
                self.bytes_read = kept;
                self.state = ReadState::Completed;
                if kept == 0 {
                    Chunk::TryAgain
                } else {
                    Chunk::Data(Bytes::copy_from_slice(&self.buffer[..kept]))
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.bytes_read = 0;
                self.state = ReadState::Pending;
                Chunk::TryAgain
            }
            Err(e) => self.fail(e),
        }
    }

    fn fail(&mut self, source: io::Error) -> Chunk {
        warn!("Read on {} failed, closing stream: {}", self.stream, source);
        self.bytes_read = 0;
        self.state = ReadState::Failed;
        self.failure = Some(PopenError::ReadFailed {
            stream: self.stream,
            source,
        });
        Chunk::Closed
    }
}

impl fmt::Debug for AsyncReadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncReadState")
            .field("stream", &self.stream)
            .field("state", &self.state)
            .field("bytes_read", &self.bytes_read)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl Drop for AsyncReadState {
    fn drop(&mut self) {
        // Cancel before the buffer and endpoint are released
        self.cancel();
        self.endpoint.take();
    }
}
