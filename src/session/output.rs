//! Bounded retained output.
//!
//! Keeps the most recent `limit` bytes of a block's output. Older bytes are
//! dropped from the buffer only; the live update stream still carries them.

use std::collections::VecDeque;

/// Default retained bytes per block.
pub const DEFAULT_OUTPUT_LIMIT: usize = 1024 * 1024;

/// Retained output of one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputBuffer {
    data: VecDeque<u8>,
    limit: usize,
    dropped: u64,
}

impl OutputBuffer {
    /// Creates an empty buffer keeping at most `limit` bytes.
    ///
    /// # Panics
    /// Panics if `limit` is zero.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        assert!(limit > 0, "output limit must be positive");
        Self {
            data: VecDeque::new(),
            limit,
            dropped: 0,
        }
    }

    /// Appends bytes, dropping the oldest beyond the limit.
    ///
    /// Returns true if this call caused the first truncation.
    pub fn push(&mut self, bytes: &[u8]) -> bool {
        let was_truncated = self.is_truncated();
        self.data.extend(bytes);
        let excess = self.data.len().saturating_sub(self.limit);
        if excess > 0 {
            self.data.drain(..excess);
            self.dropped += excess as u64;
        }
        !was_truncated && self.is_truncated()
    }

    /// Bytes dropped so far.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// True once any byte has been dropped.
    #[must_use]
    pub fn is_truncated(&self) -> bool {
        self.dropped > 0
    }

    /// Retained byte count, excluding the marker.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True if nothing is retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Maximum retained bytes.
    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Retained bytes, prefixed with a truncation marker if any were dropped.
    #[must_use]
    pub fn contents(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.data.len() + 48);
        if self.is_truncated() {
            out.extend_from_slice(truncation_marker(self.dropped).as_bytes());
        }
        out.extend(self.data.iter());
        out
    }

    /// Like [`Self::contents`], decoded lossily.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.contents()).into_owned()
    }
}

/// Marker placed where dropped output used to be.
#[must_use]
pub fn truncation_marker(dropped: u64) -> String {
    format!("[... {dropped} bytes truncated ...]\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_under_limit_keeps_everything() {
        let mut buf = OutputBuffer::new(16);
        assert!(!buf.push(b"hello\n"));
        assert_eq!(buf.text(), "hello\n");
        assert!(!buf.is_truncated());
    }

    #[test]
    fn test_overflow_keeps_tail_with_marker() {
        let mut buf = OutputBuffer::new(4);
        assert!(!buf.push(b"ab"));
        assert!(buf.push(b"cdef"));
        assert_eq!(buf.len(), 4);
        assert_eq!(buf.dropped(), 2);
        assert_eq!(buf.text(), "[... 2 bytes truncated ...]\ncdef");

        // Only the first truncation is reported.
        assert!(!buf.push(b"gh"));
        assert_eq!(buf.dropped(), 4);
        assert_eq!(buf.text(), "[... 4 bytes truncated ...]\nefgh");
    }

    #[test]
    fn test_memory_stays_bounded() {
        let mut buf = OutputBuffer::new(1024);
        for _ in 0..10_000 {
            buf.push(b"line of continuous output\n");
        }
        assert_eq!(buf.len(), 1024);
        assert_eq!(buf.dropped(), 10_000 * 26 - 1024);
    }
}
