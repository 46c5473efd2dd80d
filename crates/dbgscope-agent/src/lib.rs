//! DebugView agent client for dbgscope
//!
//! This crate connects to a remote DebugView agent, decodes its binary frame
//! stream into log records and feeds them to a [`LogSink`].

mod clock;
mod emitter;
mod error;
mod protocol;
mod reader;

pub use clock::ClockConverter;
pub use error::{ReaderError, Result};
pub use protocol::{AGENT_PORT, AgentRecord, FrameDecoder, INIT_COMMAND, MAX_FRAME_LENGTH};
pub use reader::{DbgviewReader, ReaderOptions, ReaderState, StopReason};

// Re-export types that are used in our public API
pub use dbgscope_logs::LogSink;
pub use dbgscope_types::LogRecord;
