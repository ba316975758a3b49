//! CRLF line framing for the broker's TCP byte stream
//!
//! Network reads deliver arbitrary chunks: a single receive may hold a
//! partial line, several complete lines, or a delimiter split across two
//! reads. The decoder accumulates bytes and yields complete frames in wire
//! order, keeping any unconsumed tail for the next read.

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

use crate::LINE_DELIMITER;

/// Cap on buffered, not-yet-framed bytes. A peer that stops sending
/// delimiters must not grow the buffer without bound.
pub const MAX_BUFFERED_BYTES: usize = 64 * 1024;

/// Errors that can occur while framing the byte stream
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("receive buffer holds {0} bytes with no line delimiter (max: {MAX_BUFFERED_BYTES})")]
    BufferOverflow(usize),
}

/// Streaming decoder state for delimiter-framed lines
#[derive(Debug, Default)]
pub struct LineDecoder {
    /// Partial frame data being accumulated
    buffer: BytesMut,
}

impl LineDecoder {
    /// Create a new line decoder
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
        }
    }

    /// Append freshly received bytes to the accumulator
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to extract the next complete frame
    ///
    /// Returns `Ok(Some(frame))` for each complete line with the delimiter
    /// stripped. Empty lines (consecutive delimiters) are skipped without
    /// error. Returns `Ok(None)` once no full frame remains buffered.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, CodecError> {
        loop {
            let Some(pos) = find_delimiter(&self.buffer) else {
                if self.buffer.len() > MAX_BUFFERED_BYTES {
                    return Err(CodecError::BufferOverflow(self.buffer.len()));
                }
                return Ok(None);
            };

            let frame = self.buffer.split_to(pos);
            self.buffer.advance(LINE_DELIMITER.len());

            if frame.is_empty() {
                continue;
            }
            return Ok(Some(frame.freeze()));
        }
    }

    /// Discard everything buffered (overflow recovery)
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Current number of buffered bytes
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

fn find_delimiter(buf: &[u8]) -> Option<usize> {
    buf.windows(LINE_DELIMITER.len())
        .position(|window| window == LINE_DELIMITER)
}
