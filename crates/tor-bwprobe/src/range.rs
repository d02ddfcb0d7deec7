//! Byte ranges for HTTP range requests.

use std::fmt::{self, Display};

use rand::Rng;

/// An inclusive range of bytes within a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    /// First byte.
    start: u64,
    /// Last byte, inclusive.
    end: u64,
}

impl ByteRange {
    /// Return the first byte of this range.
    pub fn start(&self) -> u64 {
        self.start
    }
    /// Return the last byte of this range.
    pub fn end(&self) -> u64 {
        self.end
    }
    /// Return the number of bytes in this range.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
    /// Return false; a byte range always holds at least one byte.
    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Formats as the value of an HTTP `Range` header.
impl Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bytes={}-{}", self.start, self.end)
    }
}

/// Return a uniformly random range of `size` bytes within a file of
/// `content_length` bytes.
///
/// # Panics
///
/// Panics if `size` is zero or larger than `content_length`.
pub fn random_range<R: Rng>(rng: &mut R, content_length: u64, size: u64) -> ByteRange {
    assert!(size > 0, "empty byte range requested");
    assert!(
        size <= content_length,
        "byte range of {} bytes requested from {} bytes",
        size,
        content_length
    );
    let start = rng.gen_range(0..=content_length - size);
    ByteRange {
        start,
        end: start + size - 1,
    }
}
