//! Bounded bar history

use crate::data::Bar;
use std::collections::VecDeque;

/// Fixed-capacity ring of the most recent bars, oldest first
#[derive(Debug, Clone)]
pub struct HistoryBuffer {
    bars: VecDeque<Bar>,
    capacity: usize,
}

impl HistoryBuffer {
    /// Create new buffer; a zero capacity is bumped to one
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            bars: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a bar, evicting the oldest when full
    pub fn push(&mut self, bar: Bar) {
        if self.bars.len() == self.capacity {
            self.bars.pop_front();
        }
        self.bars.push_back(bar);
    }

    /// Last `k` bars, most recent last
    pub fn last_n(&self, k: usize) -> Vec<Bar> {
        let skip = self.bars.len().saturating_sub(k);
        self.bars.iter().skip(skip).copied().collect()
    }

    /// Get the most recent bar
    pub fn latest(&self) -> Option<&Bar> {
        self.bars.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bar> {
        self.bars.iter()
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.bars.clear();
    }
}
