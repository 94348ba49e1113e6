/*!
 * Process Status
 * Exit status of a launched child, retrievable independently of its streams
 */

use crate::core::types::Pid;
use nix::sys::wait::WaitStatus;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

/// How a child process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ProcessStatus {
    pub pid: Pid,
    /// Exit code, absent when the child was killed by a signal
    pub exit_code: Option<i32>,
    /// Terminating signal, if any
    pub signal: Option<i32>,
}

impl ProcessStatus {
    pub fn new(pid: Pid, exit_code: Option<i32>, signal: Option<i32>) -> Self {
        Self {
            pid,
            exit_code,
            signal,
        }
    }

    pub fn from_exit_status(pid: Pid, status: ExitStatus) -> Self {
        Self::new(pid, status.code(), status.signal())
    }

    /// Final status from a `waitid` result; `None` while the child runs
    pub fn from_wait_status(pid: Pid, status: WaitStatus) -> Option<Self> {
        match status {
            WaitStatus::Exited(_, code) => Some(Self::new(pid, Some(code), None)),
            WaitStatus::Signaled(_, signal, _) => Some(Self::new(pid, None, Some(signal as i32))),
            _ => None,
        }
    }

    /// `Some(true)` for exit code zero, `None` when terminated by a signal
    pub fn success(&self) -> Option<bool> {
        self.exit_code.map(|code| code == 0)
    }

    /// Whether the child exited normally rather than by a signal
    #[inline]
    pub fn exited(&self) -> bool {
        self.exit_code.is_some()
    }

    #[inline]
    pub fn signalled(&self) -> bool {
        self.signal.is_some()
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.exit_code, self.signal) {
            (Some(code), _) => write!(f, "pid {} exited with code {}", self.pid, code),
            (None, Some(signal)) => write!(f, "pid {} killed by signal {}", self.pid, signal),
            (None, None) => write!(f, "pid {} exited", self.pid),
        }
    }
}
