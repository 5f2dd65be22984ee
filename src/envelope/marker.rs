//! Header boundary detection
//!
//! The header is not length-prefixed: it ends where its closing marker
//! ends. Bytes are appended one at a time to a bounded buffer and the
//! buffer's tail is compared against the marker after every byte, so a
//! marker split across any number of reads is still found.

use crate::error::{Error, Result};

/// Case-insensitive byte sequence that terminates a header
#[derive(Debug, Clone)]
pub struct ClosingMarker {
    marker: Vec<u8>,
}

impl ClosingMarker {
    pub fn new(marker: impl AsRef<[u8]>) -> Self {
        Self {
            marker: marker.as_ref().to_ascii_lowercase(),
        }
    }

    pub fn len(&self) -> usize {
        self.marker.len()
    }

    pub fn is_empty(&self) -> bool {
        self.marker.is_empty()
    }

    /// Whether `buf` ends with the marker
    pub fn terminates(&self, buf: &[u8]) -> bool {
        !self.marker.is_empty()
            && buf.len() >= self.marker.len()
            && buf[buf.len() - self.marker.len()..].eq_ignore_ascii_case(&self.marker)
    }
}

/// Bounded accumulator for header bytes
#[derive(Debug)]
pub struct HeaderBuffer {
    bytes: Vec<u8>,
    marker: ClosingMarker,
    limit: usize,
}

impl HeaderBuffer {
    pub fn new(marker: ClosingMarker, limit: usize) -> Self {
        Self {
            bytes: Vec::new(),
            marker,
            limit,
        }
    }

    /// Append one byte. Returns `Ok(true)` once the marker has been seen.
    /// Fails as soon as the buffer reaches its limit without the marker.
    pub fn push(&mut self, byte: u8) -> Result<bool> {
        if self.bytes.len() >= self.limit {
            return Err(self.overflow());
        }
        if self.bytes.capacity() == self.bytes.len() {
            let grow = 1024.min(self.limit - self.bytes.len());
            self.bytes.try_reserve(grow).map_err(|_| {
                Error::MalformedHeader("cannot allocate header buffer".into())
            })?;
        }
        self.bytes.push(byte);
        if self.marker.terminates(&self.bytes) {
            return Ok(true);
        }
        if self.bytes.len() >= self.limit {
            return Err(self.overflow());
        }
        Ok(false)
    }

    fn overflow(&self) -> Error {
        Error::MalformedHeader(format!("no closing marker within {} bytes", self.limit))
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Release the accumulated bytes, leaving the buffer empty
    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_case_insensitive() {
        let marker = ClosingMarker::new("</haggle>");
        assert!(marker.terminates(b"<Haggle></HAGGLE>"));
        assert!(marker.terminates(b"</hAgGlE>"));
        assert!(!marker.terminates(b"</haggle> "));
        assert!(!marker.terminates(b"gle>"));
    }

    #[test]
    fn test_marker_found_one_byte_at_a_time() {
        let mut buf = HeaderBuffer::new(ClosingMarker::new("</end>"), 64);
        let input = b"<end>x</end>";
        let hits: Vec<bool> = input.iter().map(|b| buf.push(*b).unwrap()).collect();
        assert_eq!(hits.iter().filter(|h| **h).count(), 1);
        assert!(hits[input.len() - 1]);
    }

    #[test]
    fn test_limit_without_marker_fails() {
        let mut buf = HeaderBuffer::new(ClosingMarker::new("</end>"), 8);
        for b in b"abcdefg" {
            assert!(!buf.push(*b).unwrap());
        }
        assert!(matches!(buf.push(b'h'), Err(Error::MalformedHeader(_))));
        assert_eq!(buf.len(), 8);
        assert!(buf.push(b'i').is_err());
    }

    #[test]
    fn test_marker_ending_exactly_at_limit_accepted() {
        let mut buf = HeaderBuffer::new(ClosingMarker::new("</end>"), 12);
        let input = b"<end>x</end>";
        let last = input.iter().map(|b| buf.push(*b).unwrap()).last();
        assert_eq!(last, Some(true));
        assert_eq!(buf.len(), 12);
    }
}
