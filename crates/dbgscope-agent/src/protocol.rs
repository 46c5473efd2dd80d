//! Wire format of the DebugView agent stream.
//!
//! After the handshake the agent sends length-prefixed frames. A frame of
//! length zero is a keepalive; any other frame carries back-to-back records:
//!
//! ```text
//! u32 sequence | u64 filetime | i64 counter | u8 0x01 | u32 pid | u8 0x02 | u8 separator | message\0 | pad to 4
//! ```
//!
//! Padding is computed from the read position inside the frame after every
//! record. All integers are little-endian.

use dbgscope_types::FileTime;

use crate::error::ReaderError;

/// TCP port the agent listens on
pub const AGENT_PORT: u16 = 2020;

/// Command that starts a capture session
pub const INIT_COMMAND: [u8; 20] = [
    0x24, 0x00, 0x05, 0x83, //
    0x04, 0x00, 0x05, 0x83, //
    0x08, 0x00, 0x05, 0x83, //
    0x28, 0x00, 0x05, 0x83, //
    0x18, 0x00, 0x05, 0x83,
];

/// Frame lengths at or above this value are rejected
pub const MAX_FRAME_LENGTH: u32 = 0x7fff_ffff;

const PID_OPEN_MARKER: u8 = 0x01;
const PID_CLOSE_MARKER: u8 = 0x02;

/// Records are padded to this alignment within a frame
const RECORD_ALIGNMENT: usize = 4;

/// One record as sent by the agent, before timestamp resolution
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentRecord {
    pub sequence: u32,
    pub file_time: FileTime,
    /// Raw performance-counter value
    pub counter: i64,
    pub pid: u32,
    /// Message text with a trailing newline
    pub message: String,
}

/// Iterates the records of one frame payload.
///
/// Running out of bytes where a sequence number is expected ends the frame.
/// A malformed record yields one error and ends iteration; the rest of the
/// frame is not examined.
pub struct FrameDecoder<'a> {
    payload: &'a [u8],
    pos: usize,
    done: bool,
}

impl<'a> FrameDecoder<'a> {
    pub fn new(payload: &'a [u8]) -> Self {
        Self {
            payload,
            pos: 0,
            done: false,
        }
    }

    /// Read position within the payload
    pub fn position(&self) -> usize {
        self.pos
    }

    fn take<const N: usize>(&mut self) -> Option<[u8; N]> {
        let bytes = self.payload.get(self.pos..self.pos + N)?;
        self.pos += N;
        bytes.try_into().ok()
    }

    fn skip(&mut self, n: usize) {
        self.pos = (self.pos + n).min(self.payload.len());
    }

    fn read_u8(&mut self) -> Option<u8> {
        self.take::<1>().map(|[b]| b)
    }

    fn read_u32(&mut self) -> Option<u32> {
        self.take().map(u32::from_le_bytes)
    }

    fn read_u64(&mut self) -> Option<u64> {
        self.take().map(u64::from_le_bytes)
    }

    fn read_i64(&mut self) -> Option<i64> {
        self.take().map(i64::from_le_bytes)
    }

    /// Text up to the next NUL (or the end of the frame), terminator consumed
    fn read_c_string(&mut self) -> String {
        let rest = &self.payload[self.pos..];
        let len = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        let text = String::from_utf8_lossy(&rest[..len]).into_owned();
        self.skip(len + 1);
        text
    }

    /// File time, counter, and the marker-delimited pid
    fn read_header(&mut self) -> Option<(u64, i64, u8, u32, u8)> {
        let file_time = self.read_u64()?;
        let counter = self.read_i64()?;
        let open = self.read_u8()?;
        let pid = self.read_u32()?;
        let close = self.read_u8()?;
        Some((file_time, counter, open, pid, close))
    }

    fn read_record_body(&mut self, sequence: u32) -> Result<AgentRecord, ReaderError> {
        let (file_time, counter, pid) = match self.read_header() {
            Some((file_time, counter, PID_OPEN_MARKER, pid, PID_CLOSE_MARKER)) => {
                (file_time, counter, pid)
            }
            _ => return Err(ReaderError::MalformedPid),
        };

        // separator between pid block and text
        self.skip(1);
        let mut message = self.read_c_string();
        message.push('\n');

        let remainder = self.pos % RECORD_ALIGNMENT;
        if remainder > 0 {
            self.skip(RECORD_ALIGNMENT - remainder);
        }

        Ok(AgentRecord {
            sequence,
            file_time: FileTime(file_time),
            counter,
            pid,
            message,
        })
    }
}

impl Iterator for FrameDecoder<'_> {
    type Item = Result<AgentRecord, ReaderError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let Some(sequence) = self.read_u32() else {
            self.done = true;
            return None;
        };

        let result = self.read_record_body(sequence);
        if result.is_err() {
            self.done = true;
        }
        Some(result)
    }
}

impl std::iter::FusedIterator for FrameDecoder<'_> {}

/// Validate a frame length read from the stream
pub fn check_frame_length(length: u32) -> Result<u32, ReaderError> {
    if length >= MAX_FRAME_LENGTH {
        Err(ReaderError::InvalidFrameLength {
            length: Some(length),
        })
    } else {
        Ok(length)
    }
}
