//! Errors that end a reader session.
//!
//! Every variant is reported to the sink as exactly one record before the
//! reader stops. Connection problems are tagged `[internal]`; malformed stream
//! content is tagged `dbgview.exe`.

use thiserror::Error;

use dbgscope_types::{AGENT_SOURCE, INTERNAL_SOURCE};

/// Result type alias for reader operations.
pub type Result<T, E = ReaderError> = std::result::Result<T, E>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReaderError {
    #[error("Unable to connect to {description}, {cause}")]
    Connect { description: String, cause: String },

    #[error("<error sending init command>")]
    InitCommand { cause: String },

    #[error("Unable to connect to {description}, {cause}")]
    Handshake { description: String, cause: String },

    #[error("Unable to connect to {description}, agent reported a zero counter frequency")]
    InvalidCalibration { description: String },

    #[error("<error parsing message length>")]
    InvalidFrameLength { length: Option<u32> },

    #[error("<error reading message>")]
    ShortPayload { expected: u32 },

    #[error("<error parsing pid>")]
    MalformedPid,
}

impl ReaderError {
    /// Source tag of the record that reports this error
    pub fn source_tag(&self) -> &'static str {
        if self.is_connection_error() {
            INTERNAL_SOURCE
        } else {
            AGENT_SOURCE
        }
    }

    /// Failed before any frame was read
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. }
                | Self::InitCommand { .. }
                | Self::Handshake { .. }
                | Self::InvalidCalibration { .. }
        )
    }

    /// Message text of the record that reports this error
    pub fn record_message(&self) -> String {
        if self.is_connection_error() {
            self.to_string()
        } else {
            format!("{}\n", self)
        }
    }
}
