//! HTTP `Range` header parsing.
//!
//! Recognizes the single-range form `bytes=<start>-<end>` against a known total
//! size. A comma-separated list is tokenized, but callers in this crate only
//! ever honor the first resulting range; multipart/byteranges responses are out
//! of scope.
//!
//! Validation rules, in order:
//! - the value must start with `bytes=`
//! - both bounds must parse as non-negative integers (open-ended and suffix
//!   forms are rejected)
//! - `start` must not exceed `end`
//! - `start >= size` is unsatisfiable and rejected
//! - `end` is clamped to `size - 1` when it overshoots
//!
//! This module performs no IO and has no side effects.

use crate::error::{RelayError, RelayResult};

/// A validated byte interval within a resource of known size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ByteRange {
    /// First byte offset (inclusive).
    pub start: u64,
    /// Number of bytes covered.
    pub length: u64,
}

impl ByteRange {
    /// Last byte offset (inclusive).
    pub fn end(&self) -> u64 {
        self.start + self.length - 1
    }
}

/// Parse a raw `Range` header value against `size` (total resource bytes).
///
/// Callers must treat an error as "serve the full resource" or reject the
/// request; it is never fatal.
pub fn parse_range_header(header: &str, size: u64) -> RelayResult<Vec<ByteRange>> {
    let Some(rest) = header.strip_prefix("bytes=") else {
        return Err(RelayError::InvalidRange("missing bytes= prefix"));
    };

    let mut ranges = Vec::new();
    for part in rest.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }

        let Some((start, end)) = part.split_once('-') else {
            return Err(RelayError::InvalidRange("malformed range interval"));
        };
        let start: u64 = start
            .trim()
            .parse()
            .map_err(|_| RelayError::InvalidRange("invalid range start"))?;
        let end: u64 = end
            .trim()
            .parse()
            .map_err(|_| RelayError::InvalidRange("invalid range end"))?;

        if start > end {
            return Err(RelayError::InvalidRange("range start exceeds end"));
        }
        if start >= size {
            return Err(RelayError::InvalidRange("range start beyond resource size"));
        }

        let end = end.min(size.saturating_sub(1));
        ranges.push(ByteRange {
            start,
            length: end - start + 1,
        });
    }

    Ok(ranges)
}
