//! Splits the global item range into one contiguous sub-range per worker.

use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Half-open range `[start_index, end_index)` assigned to one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Partition {
    pub start_index: u64,
    pub end_index: u64,
}

impl Partition {
    pub fn new(start_index: u64, end_index: u64) -> Self {
        debug_assert!(start_index <= end_index);
        Self {
            start_index,
            end_index,
        }
    }

    pub fn len(&self) -> u64 {
        self.end_index - self.start_index
    }

    pub fn is_empty(&self) -> bool {
        self.start_index == self.end_index
    }

    pub fn contains(&self, index: u64) -> bool {
        self.start_index <= index && index < self.end_index
    }

    pub fn range(&self) -> Range<u64> {
        self.start_index..self.end_index
    }
}

/// Divides `[0, total_items)` into `num_workers` ranges.
///
/// Sizes differ by at most one; the remainder goes to the lowest worker ids.
/// When there are fewer items than workers the trailing ranges are empty.
/// Returns no ranges for `num_workers == 0`.
pub fn partition(total_items: u64, num_workers: usize) -> Vec<Partition> {
    if num_workers == 0 {
        return Vec::new();
    }

    let workers = num_workers as u64;
    let base = total_items / workers;
    let remainder = total_items % workers;

    let mut start = 0;
    (0..workers)
        .map(|id| {
            let size = base + u64::from(id < remainder);
            let part = Partition::new(start, start + size);
            start += size;
            part
        })
        .collect()
}
