/*!
 * Limits and Constants
 *
 * Centralized location for buffer sizes, naming and polling defaults.
 * Organized by domain for maintainability and discoverability.
 */

use std::time::Duration;

// =============================================================================
// PIPE I/O
// =============================================================================

/// Bytes requested per asynchronous read (4KB)
/// Larger output is retrieved through repeated polls
pub const ASYNC_READ_BUFFER_SIZE: usize = 4 * 1024;

/// Number of externally visible streams per launched process
pub const OPEN_STREAM_COUNT: u32 = 3;

/// Prefix of FIFO names used for asynchronous pipes
pub const FIFO_NAME_PREFIX: &str = "popen_io";

// =============================================================================
// PROCESS
// =============================================================================

/// Shell used to interpret command strings
pub const DEFAULT_SHELL: &str = "/bin/sh";

/// Sleep between status checks while waiting on a child
pub const DEFAULT_WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Sleep between drain rounds when neither stream produced data
pub const DEFAULT_DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Statuses of released processes kept for later lookup; oldest evicted first
pub const MAX_FINISHED_STATUSES: usize = 1024;

// =============================================================================
// OUTPUT BUFFERING
// =============================================================================

/// Lines retained by a safe output buffer
pub const DEFAULT_MAX_LINE_COUNT: usize = 64;

/// Characters retained per line by a safe output buffer
pub const DEFAULT_MAX_LINE_LENGTH: usize = 256;

/// Marker for elided output
pub const ELLIPSIS: &str = "...";
