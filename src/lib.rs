/*!
 * Popen I/O Library
 * Child processes with piped standard streams and non-blocking output reads
 */

pub mod core;
pub mod io;
pub mod monitoring;
pub mod output;
pub mod pipe;
pub mod process;

// Re-exports
pub use crate::core::{
    Chunk, Pid, PopenConfig, PopenError, PopenResult, StreamKind, StreamMode, StreamRef,
    StreamRefs,
};
pub use monitoring::init_tracing;
pub use output::{CapturedOutput, OutputDrain, OutputHandler, SafeOutputBuffer};
pub use pipe::{Closer, CountingCloser, HandleCloser, SystemCloser};
pub use process::{
    ChildOutput, ChildStdin, LaunchOptions, LaunchedProcess, ProcessLauncher, ProcessRegistry,
    ProcessStatus,
};
