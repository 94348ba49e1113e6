/*!
 * Core Module
 * Shared types, errors, limits and configuration
 */

pub mod config;
pub mod errors;
pub mod limits;
pub mod types;

pub use config::PopenConfig;
pub use errors::{PopenError, PopenResult};
pub use types::{Chunk, Pid, StreamKind, StreamMode, StreamRef, StreamRefs};
