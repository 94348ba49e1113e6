/*!
 * Core Types
 * Common types shared by the pipe, I/O and process layers
 */

use super::errors::PopenError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// OS process ID type
pub type Pid = u32;

/// Standard stream of a launched child
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Stdin,
    Stdout,
    Stderr,
}

impl StreamKind {
    /// True for the two streams the parent reads from
    #[inline]
    pub fn is_output(self) -> bool {
        !matches!(self, StreamKind::Stdin)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StreamKind::Stdin => "stdin",
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one externally exposed stream
///
/// Copyable and comparable; unique within the registry that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamRef {
    id: u64,
    kind: StreamKind,
}

impl StreamRef {
    pub(crate) fn new(id: u64, kind: StreamKind) -> Self {
        Self { id, kind }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn kind(&self) -> StreamKind {
        self.kind
    }
}

impl fmt::Display for StreamRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.kind, self.id)
    }
}

/// The three stream references handed out for one launch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamRefs {
    pub stdin: StreamRef,
    pub stdout: StreamRef,
    pub stderr: StreamRef,
}

impl StreamRefs {
    pub fn contains(&self, stream: StreamRef) -> bool {
        self.stdin == stream || self.stdout == stream || self.stderr == stream
    }

    pub fn get(&self, kind: StreamKind) -> StreamRef {
        match kind {
            StreamKind::Stdin => self.stdin,
            StreamKind::Stdout => self.stdout,
            StreamKind::Stderr => self.stderr,
        }
    }
}

/// Outcome of one non-blocking poll of an output stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    /// Non-empty data, in write order
    Data(Bytes),
    /// Nothing available yet; poll again later
    TryAgain,
    /// No more data will ever arrive
    Closed,
}

impl Chunk {
    #[inline]
    pub fn is_data(&self) -> bool {
        matches!(self, Chunk::Data(_))
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        matches!(self, Chunk::Closed)
    }

    pub fn into_data(self) -> Option<Bytes> {
        match self {
            Chunk::Data(bytes) => Some(bytes),
            _ => None,
        }
    }
}

/// File mode of the parent-side streams
///
/// Text mode strips carriage returns from synchronous reads so both read
/// modes surface the same bytes. Asynchronous polls always strip them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamMode {
    #[default]
    Text,
    Binary,
}

impl FromStr for StreamMode {
    type Err = PopenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "t" | "text" => Ok(StreamMode::Text),
            "b" | "binary" => Ok(StreamMode::Binary),
            other => Err(PopenError::InvalidState(format!(
                "unknown stream mode '{}'",
                other
            ))),
        }
    }
}
