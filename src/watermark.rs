//! Transfer-log watermarks
//!
//! The host keeps an ever-growing log of transfers per direction. A watermark
//! is the number of records already published from one of those logs; each
//! observation yields only the records strictly after it.

use std::ops::Range;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Watermark {
    emitted: usize,
}

impl Watermark {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records published so far
    pub fn emitted(&self) -> usize {
        self.emitted
    }

    /// Record that the log now holds `len` entries
    ///
    /// Returns the index range of entries not yet published and moves the
    /// watermark past them. A log that did not grow (or shrank) yields nothing
    /// and leaves the watermark where it was.
    pub fn advance(&mut self, len: usize) -> Option<Range<usize>> {
        if len <= self.emitted {
            return None;
        }
        let fresh = self.emitted..len;
        self.emitted = len;
        Some(fresh)
    }
}
