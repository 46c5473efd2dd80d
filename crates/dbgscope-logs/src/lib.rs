//! Log buffering for dbgscope
//!
//! This crate provides the byte ring buffer, the sink contract log sources
//! feed, a ring-backed line buffer and record filtering.

mod filter;
mod line_buffer;
mod ring_buffer;
mod sink;

pub use filter::RecordFilter;
pub use line_buffer::LineBuffer;
pub use ring_buffer::{RingBuffer, RingBufferError, RingValue};
pub use sink::LogSink;

// Re-export types used in our public API
pub use dbgscope_types::{FileTime, LogRecord};
