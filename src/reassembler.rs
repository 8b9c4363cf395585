//! Reassembly of XBus frames from arbitrarily chunked transport reads.
//!
//! Serial reads carry no framing: a frame may be split across several reads and
//! one read may carry several frames. The reassembler only accumulates bytes and
//! answers "is there a complete unit yet"; protocol meaning stays with the
//! connection.

use log::trace;

use crate::xbus;

#[derive(Debug, Default)]
pub struct StreamReassembler {
    buf: Vec<u8>,
}

impl StreamReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one transport read.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Drop everything buffered, e.g. after asking the device to resend.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Take the whole buffer once it is longer than `min_len` and ends with `suffix`.
    ///
    /// Used for multi-frame responses (flash info, file info) whose only
    /// terminator is a known end-of-export notification.
    pub fn take_if_ends_with(&mut self, suffix: &[u8], min_len: usize) -> Option<Vec<u8>> {
        if self.buf.len() > min_len && self.buf.ends_with(suffix) {
            Some(std::mem::take(&mut self.buf))
        } else {
            None
        }
    }

    /// Extract one complete, checksum-valid frame from the head of the buffer.
    ///
    /// Bytes that cannot start a valid frame are skipped one at a time. Returns
    /// `None` when the buffer holds no complete frame yet; a partial frame stays
    /// buffered for the next `feed`.
    pub fn next_unit(&mut self) -> Option<Vec<u8>> {
        let mut skip = 0usize;
        let unit = loop {
            let rest = &self.buf[skip..];
            if rest.len() < xbus::HEADER_LEN {
                break None;
            }
            if !xbus::has_frame_header(rest) {
                skip += 1;
                continue;
            }
            let len = xbus::FRAME_OVERHEAD + rest[3] as usize;
            if rest.len() < len {
                break None;
            }
            if !xbus::is_valid(&rest[..len]) {
                skip += 1;
                continue;
            }
            break Some(len);
        };

        if skip > 0 {
            trace!("skipped {} bytes looking for a frame header", skip);
            self.buf.drain(..skip);
        }
        unit.map(|len| self.buf.drain(..len).collect())
    }
}
