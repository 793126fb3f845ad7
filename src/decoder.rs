//! Incremental UTF-8 reassembly for engine byte output.
//!
//! Engines write raw bytes per decode step, and a single code point can
//! straddle two steps. [`StreamDecoder`] accepts those chunks as they arrive
//! and yields complete text units: one code point each, or the whole
//! end-of-turn sentinel when one is configured.
//!
//! At any point the buffered tail is either empty or exactly the bytes that
//! cannot yet be proven complete or invalid. Malformed input is never an
//! error: the scanner skips one byte and resynchronises.

use tracing::trace;

/// Length of the UTF-8 sequence introduced by `lead`, from its bit pattern.
///
/// Returns `None` for continuation bytes and the `11111xxx` range.
pub fn utf8_sequence_len(lead: u8) -> Option<usize> {
    if lead & 0x80 == 0x00 {
        Some(1)
    } else if lead & 0xE0 == 0xC0 {
        Some(2)
    } else if lead & 0xF0 == 0xE0 {
        Some(3)
    } else if lead & 0xF8 == 0xF0 {
        Some(4)
    } else {
        None
    }
}

/// True for `10xxxxxx` bytes.
pub fn is_continuation_byte(byte: u8) -> bool {
    byte & 0xC0 == 0x80
}

/// Outcome of scanning the front of the unconsumed buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scan {
    /// A complete unit of this many bytes.
    Unit(usize),
    /// The front byte cannot start a valid unit.
    Skip,
    /// Not enough bytes to decide yet.
    Wait,
}

fn scan(rest: &[u8], sentinel: Option<&[u8]>) -> Scan {
    if let Some(sentinel) = sentinel {
        if rest.starts_with(sentinel) {
            return Scan::Unit(sentinel.len());
        }
        if sentinel.starts_with(rest) {
            return Scan::Wait;
        }
    }

    let Some(len) = utf8_sequence_len(rest[0]) else {
        return Scan::Skip;
    };

    let available = rest.len().min(len);
    if !rest[1..available].iter().all(|&b| is_continuation_byte(b)) {
        return Scan::Skip;
    }
    if available < len {
        return Scan::Wait;
    }

    // Bit patterns match, but overlong forms and surrogates are still invalid.
    if std::str::from_utf8(&rest[..len]).is_ok() {
        Scan::Unit(len)
    } else {
        Scan::Skip
    }
}

/// Byte accumulator that turns an engine's output stream into text units.
///
/// Scoped to a single submission; never shared between generations.
#[derive(Debug, Clone, Default)]
pub struct StreamDecoder {
    buffer: Vec<u8>,
    sentinel: Option<Vec<u8>>,
}

impl StreamDecoder {
    /// A decoder that emits one unit per code point.
    pub fn new() -> Self {
        Self::default()
    }

    /// A decoder that additionally emits `sentinel` as a single unit, even
    /// when its bytes arrive across several chunks.
    ///
    /// An empty sentinel is ignored.
    pub fn with_sentinel(sentinel: impl Into<String>) -> Self {
        let sentinel = sentinel.into();
        Self {
            buffer: Vec::new(),
            sentinel: (!sentinel.is_empty()).then(|| sentinel.into_bytes()),
        }
    }

    /// Append a chunk and return the units it completes, in order.
    ///
    /// The returned iterator is lazy: each unit is assembled when `next` is
    /// called, so a consumer can react to a unit before the rest of the chunk
    /// is scanned. Bytes the iterator did not reach stay buffered.
    pub fn feed(&mut self, bytes: &[u8]) -> Units<'_> {
        self.buffer.extend_from_slice(bytes);
        Units {
            decoder: self,
            pos: 0,
        }
    }

    /// Release whatever is still buffered at the end of a generation.
    ///
    /// Bytes held back only because they could still become the sentinel are
    /// returned as ordinary units; an incomplete trailing sequence is dropped.
    pub fn finish(&mut self) -> Vec<String> {
        let held = std::mem::take(&mut self.buffer);
        if held.is_empty() {
            return Vec::new();
        }

        let mut plain = StreamDecoder::new();
        let units: Vec<String> = plain.feed(&held).collect();
        if !plain.buffer.is_empty() {
            trace!(
                dropped = plain.buffer.len(),
                "Dropping incomplete UTF-8 tail at end of stream"
            );
        }
        units
    }

    /// Bytes buffered but not yet emitted.
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }

    /// Discard any buffered bytes.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

/// Lazy sequence of units produced by one [`StreamDecoder::feed`] call.
///
/// Dropping it compacts the decoder's buffer down to the unscanned tail.
pub struct Units<'a> {
    decoder: &'a mut StreamDecoder,
    pos: usize,
}

impl Iterator for Units<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        loop {
            let rest = &self.decoder.buffer[self.pos..];
            if rest.is_empty() {
                return None;
            }

            match scan(rest, self.decoder.sentinel.as_deref()) {
                Scan::Unit(len) => {
                    let unit = String::from_utf8_lossy(&rest[..len]).into_owned();
                    self.pos += len;
                    return Some(unit);
                }
                Scan::Skip => {
                    trace!(byte = rest[0], "Resynchronising past malformed byte");
                    self.pos += 1;
                }
                Scan::Wait => return None,
            }
        }
    }
}

impl Drop for Units<'_> {
    fn drop(&mut self) {
        self.decoder.buffer.drain(..self.pos);
    }
}
