//! Tab management
//!
//! Maps UI tabs onto registry sessions and buffers output for background tabs.

mod buffer;
mod multiplexer;

pub use buffer::OutputBuffer;
pub use multiplexer::{Tab, TabMultiplexer};
