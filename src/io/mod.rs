/*!
 * I/O Module
 * Non-blocking reads of child output
 */

pub mod async_read;
pub mod text;

pub use async_read::{AsyncReadState, ReadState};
pub use text::strip_carriage_returns;
