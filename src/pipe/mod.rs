/*!
 * Pipe Module
 * OS pipe endpoints, handle pairs and named FIFOs
 */

pub mod endpoint;
pub mod fifo;
pub mod handle_pair;

// Re-export public API
pub use endpoint::{Closer, CountingCloser, HandleCloser, PipeEndpoint, SystemCloser};
pub use fifo::FifoLocation;
pub use handle_pair::{is_inheritable, HandlePair};
