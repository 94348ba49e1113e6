/*!
 * Handle Pair
 * Read/write pipe endpoints with per-endpoint inheritance control
 */

use super::endpoint::{Closer, PipeEndpoint};
use super::fifo::{open_fifo_pair, FifoLocation};
use crate::core::errors::{PopenError, PopenResult};
use log::{debug, warn};
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};

/// Owns the two ends of one pipe
///
/// A child inherits every inheritable descriptor open at spawn time, so any
/// end the parent keeps must be close-on-exec. An inheritable parent-side
/// write end would keep the pipe open after the child exits and reads on
/// the other end would never see EOF.
#[derive(Debug)]
pub struct HandlePair {
    read: Option<PipeEndpoint>,
    write: Option<PipeEndpoint>,
    closer: Closer,
    fifo: FifoLocation,
}

impl HandlePair {
    pub fn new(closer: Closer, fifo: FifoLocation) -> Self {
        Self {
            read: None,
            write: None,
            closer,
            fifo,
        }
    }

    /// Create the pipe with the requested inheritance
    ///
    /// When either end must be inheritable, the pipe is created with both
    /// ends inheritable and each end that must not be is replaced by a
    /// close-on-exec duplicate. `asynchronous` makes the read end
    /// non-blocking; the write end always stays blocking.
    pub fn create_pipe(
        &mut self,
        inherit_read: bool,
        inherit_write: bool,
        asynchronous: bool,
    ) -> PopenResult<()> {
        if self.read.is_some() || self.write.is_some() {
            return Err(PopenError::InvalidState(
                "pipe endpoints already created".to_string(),
            ));
        }

        let inheritable = inherit_read || inherit_write;
        let (read, write) = if asynchronous {
            self.create_asynchronous_pipe(inheritable)?
        } else {
            let flags = if inheritable {
                OFlag::empty()
            } else {
                OFlag::O_CLOEXEC
            };
            nix::unistd::pipe2(flags).map_err(PopenError::pipe)?
        };

        self.read = Some(PipeEndpoint::new(read, self.closer.clone()));
        self.write = Some(PipeEndpoint::new(write, self.closer.clone()));

        if inheritable {
            if !inherit_read {
                let original = self.forget_read();
                self.read = Some(Self::uninheritable_copy(original)?);
            }
            if !inherit_write {
                let original = self.forget_write();
                self.write = Some(Self::uninheritable_copy(original)?);
            }
        }

        debug!(
            "Created {} pipe (read fd {}, write fd {}, inherit read: {}, inherit write: {})",
            if asynchronous { "asynchronous" } else { "synchronous" },
            self.read.as_ref().map(|e| e.raw_fd()).unwrap_or(-1),
            self.write.as_ref().map(|e| e.raw_fd()).unwrap_or(-1),
            inherit_read,
            inherit_write
        );
        Ok(())
    }

    /// Open a uniquely named FIFO as the pipe
    ///
    /// Read end non-blocking, write end blocking.
    pub fn create_asynchronous_pipe(&self, inheritable: bool) -> PopenResult<(OwnedFd, OwnedFd)> {
        let path = self.fifo.next_path();
        let (read, write) = open_fifo_pair(&path).map_err(PopenError::pipe)?;
        if inheritable {
            set_inheritable(&read, true).map_err(PopenError::pipe)?;
            set_inheritable(&write, true).map_err(PopenError::pipe)?;
        }
        Ok((read, write))
    }

    fn uninheritable_copy(original: Option<PipeEndpoint>) -> PopenResult<PipeEndpoint> {
        let original = original.ok_or_else(|| {
            PopenError::InvalidState("pipe endpoint missing during duplication".to_string())
        })?;
        let duplicated = original.duplicate();
        let fd = original.raw_fd();
        if let Err(e) = original.close() {
            warn!("Failed to close inheritable pipe fd {}: {}", fd, e);
        }
        duplicated.map_err(PopenError::pipe)
    }

    #[inline]
    pub fn read(&self) -> Option<&PipeEndpoint> {
        self.read.as_ref()
    }

    #[inline]
    pub fn write(&self) -> Option<&PipeEndpoint> {
        self.write.as_ref()
    }

    /// Transfer the read end out without closing it
    pub fn forget_read(&mut self) -> Option<PipeEndpoint> {
        self.read.take()
    }

    /// Transfer the write end out without closing it
    pub fn forget_write(&mut self) -> Option<PipeEndpoint> {
        self.write.take()
    }

    pub fn close_read(&mut self) -> io::Result<()> {
        self.read.take().map_or(Ok(()), PipeEndpoint::close)
    }

    pub fn close_write(&mut self) -> io::Result<()> {
        self.write.take().map_or(Ok(()), PipeEndpoint::close)
    }

    pub fn is_empty(&self) -> bool {
        self.read.is_none() && self.write.is_none()
    }
}

fn set_inheritable(fd: &OwnedFd, inheritable: bool) -> io::Result<()> {
    let flags = if inheritable {
        FdFlag::empty()
    } else {
        FdFlag::FD_CLOEXEC
    };
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(flags))?;
    Ok(())
}

/// Whether a child spawned now would inherit the endpoint
pub fn is_inheritable(endpoint: &PipeEndpoint) -> io::Result<bool> {
    let flags = fcntl(endpoint.raw_fd(), FcntlArg::F_GETFD)?;
    Ok(!FdFlag::from_bits_truncate(flags).contains(FdFlag::FD_CLOEXEC))
}
