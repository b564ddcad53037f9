//! Batched sub-query multiplexing.
//!
//! When many small sub-queries are cheaper to run through one evaluation
//! session than to re-instantiate the whole pipeline per query, the host
//! ships N (range, query) pairs in the option map and the coordinator
//! feeds them to the session in FIFO order.

use std::collections::VecDeque;

use crate::data::ScanRange;

/// One (range, predicate-query) pair multiplexed through a shared scan
/// session.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchEntry {
    pub range: ScanRange,
    pub query: String,
}

/// FIFO of batch entries populated at session start.
///
/// Exhaustion is idempotent: once drained, every further [`next`] keeps
/// returning `None`.
///
/// [`next`]: BatchCoordinator::next
#[derive(Debug, Default)]
pub struct BatchCoordinator {
    entries: VecDeque<BatchEntry>,
}

impl BatchCoordinator {
    pub fn new(entries: impl IntoIterator<Item = BatchEntry>) -> Self {
        BatchCoordinator {
            entries: entries.into_iter().collect(),
        }
    }

    /// Remove and return the oldest entry, or `None` when exhausted.
    pub fn next(&mut self) -> Option<BatchEntry> {
        self.entries.pop_front()
    }

    /// Entries not yet consumed.
    pub fn remaining(&self) -> usize {
        self.entries.len()
    }

    pub fn is_exhausted(&self) -> bool {
        self.entries.is_empty()
    }
}
