//! Accumulation buffer for encoded traces.
//!
//! A payload collects the msgpack bodies of whole traces up to a byte
//! ceiling. The outer array header is not part of the body: it is emitted
//! on the way out so the trace count stays correct however many traces end
//! up in the buffer.

use bytes::Bytes;
use std::io;

/// Default payload ceiling (5MiB), sized to one collector request.
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 5 << 20;

/// Size of a msgpack array header for `count` elements.
pub fn array_header_size(count: usize) -> usize {
    if count < 16 {
        1
    } else if count <= u16::MAX as usize {
        3
    } else {
        5
    }
}

/// A size-bounded buffer of wire-format trace bytes ready for transmission.
#[derive(Debug)]
pub struct Payload {
    body: Vec<u8>,
    trace_count: usize,
    max_bytes: usize,
}

impl Payload {
    /// Creates an empty payload with the given byte ceiling
    pub fn new(max_bytes: usize) -> Self {
        Payload {
            body: Vec::new(),
            trace_count: 0,
            max_bytes,
        }
    }

    /// Appends one encoded trace.
    ///
    /// Returns false (and leaves the payload untouched) when the addition
    /// would push the total size past the ceiling; the caller ships the
    /// current payload and retries against a fresh one.
    pub fn push_trace(&mut self, encoded: &[u8]) -> bool {
        let projected =
            array_header_size(self.trace_count + 1) + self.body.len() + encoded.len();
        if projected > self.max_bytes {
            return false;
        }
        self.body.extend_from_slice(encoded);
        self.trace_count += 1;
        true
    }

    /// Number of traces accumulated so far
    pub fn trace_count(&self) -> usize {
        self.trace_count
    }

    /// True when no trace has been accumulated
    pub fn is_empty(&self) -> bool {
        self.trace_count == 0
    }

    /// Exact wire size: outer array header plus body
    pub fn size_in_bytes(&self) -> usize {
        array_header_size(self.trace_count) + self.body.len()
    }

    /// Streams the payload (header then body) to a writer
    pub fn write_to<W: io::Write>(&self, writer: &mut W) -> io::Result<()> {
        let mut header = Vec::with_capacity(5);
        // infallible: the header buffer is a Vec
        rmp::encode::write_array_len(&mut header, self.trace_count as u32)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        writer.write_all(&header)?;
        writer.write_all(&self.body)
    }

    /// Returns the payload as one contiguous request body
    pub fn to_bytes(&self) -> Bytes {
        let mut out = Vec::with_capacity(self.size_in_bytes());
        // writing into a Vec cannot fail
        let _ = self.write_to(&mut out);
        Bytes::from(out)
    }

    /// Clears the payload for reuse
    pub fn reset(&mut self) {
        self.body.clear();
        self.trace_count = 0;
    }
}

impl Default for Payload {
    fn default() -> Self {
        Payload::new(DEFAULT_MAX_PAYLOAD_BYTES)
    }
}
