//! Batched flush notifications for mapping changes.

use crate::page::PageRange;
use core::fmt;
use kernel_config::memory::{FLUSH_BATCH_CAPACITY, FLUSH_BATCH_MERGE_SLACK, PAGE_SIZE};

/// Identifies one user process; used only to scope flushes.
/// Task management itself lives outside the memory core.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
#[repr(transparent)]
pub struct ProcessId(pub u32);

/// The environment whose translation caches must observe a mapping change.
///
/// Executors whose current environment does not match skip the actual
/// cache flush (kernel always matches; a user target matches only the
/// executor currently running that process).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FlushTarget {
    Kernel,
    User(ProcessId),
}

/// A bounded batch of page-aligned virtual ranges awaiting a flush.
///
/// Appending merges the incoming range into the last entry whenever the gap
/// between them is within [`FLUSH_BATCH_MERGE_SLACK`]; once the batch is at
/// capacity, a merge is forced regardless of the gap. Over-flushing the
/// merged gap is cheaper than shipping another inter-processor interrupt.
#[derive(Clone)]
pub struct VirtualRangeBatch {
    ranges: [PageRange; FLUSH_BATCH_CAPACITY],
    len: usize,
}

impl VirtualRangeBatch {
    pub const fn new() -> VirtualRangeBatch {
        VirtualRangeBatch {
            ranges: [PageRange::empty(); FLUSH_BATCH_CAPACITY],
            len: 0,
        }
    }

    /// A batch holding exactly one range.
    pub fn with_range(range: PageRange) -> VirtualRangeBatch {
        let mut batch = VirtualRangeBatch::new();
        batch.append(range);
        batch
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == FLUSH_BATCH_CAPACITY
    }

    pub fn as_slice(&self) -> &[PageRange] {
        &self.ranges[..self.len]
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Appends `range`, merging it into the last entry when the gap is
    /// within the configured slack or when the batch is at capacity.
    ///
    /// Empty ranges are ignored.
    pub fn append(&mut self, range: PageRange) {
        if range.is_empty() {
            return;
        }
        if self.len > 0 {
            let last = self.ranges[self.len - 1];
            let merge = if range.start() <= last.end() + 1 {
                // Overlapping or adjacent.
                true
            } else {
                let gap_pages = range.start() - (last.end() + 1);
                gap_pages * PAGE_SIZE <= FLUSH_BATCH_MERGE_SLACK
            };
            if merge || self.len == FLUSH_BATCH_CAPACITY {
                let start = if range.start() < last.start() {
                    range.start()
                } else {
                    last.start()
                };
                let end = if range.end() > last.end() {
                    range.end()
                } else {
                    last.end()
                };
                self.ranges[self.len - 1] = PageRange::new(start, end);
                return;
            }
        }
        self.ranges[self.len] = range;
        self.len += 1;
    }
}

impl Default for VirtualRangeBatch {
    fn default() -> VirtualRangeBatch {
        VirtualRangeBatch::new()
    }
}

impl fmt::Debug for VirtualRangeBatch {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list().entries(self.as_slice().iter()).finish()
    }
}
