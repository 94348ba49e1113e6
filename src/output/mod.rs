/*!
 * Output Module
 * Draining and buffering child output
 */

pub mod drain;
pub mod safe_buffer;

pub use drain::{CapturedOutput, OutputDrain, OutputHandler};
pub use safe_buffer::SafeOutputBuffer;
