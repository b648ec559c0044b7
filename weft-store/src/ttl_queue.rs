//! TTL countdown queue.
//!
//! A min-heap over absolute expiry deadlines. Entries are never
//! removed eagerly: a record update simply pushes a new entry, and
//! entries whose (key, version, ttl_version) no longer match the live
//! record are discarded when they surface.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtlCountdownEntry {
    pub expiry: Instant,
    pub key: String,
    pub version: u64,
    pub ttl_version: u64,
}

impl Ord for TtlCountdownEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.expiry
            .cmp(&other.expiry)
            .then_with(|| self.key.cmp(&other.key))
            .then_with(|| self.version.cmp(&other.version))
            .then_with(|| self.ttl_version.cmp(&other.ttl_version))
    }
}

impl PartialOrd for TtlCountdownEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
pub struct TtlCountdownQueue {
    heap: BinaryHeap<Reverse<TtlCountdownEntry>>,
}

impl TtlCountdownQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: TtlCountdownEntry) {
        self.heap.push(Reverse(entry));
    }

    /// Deadline the countdown timer should be armed for.
    pub fn next_expiry(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse(entry)| entry.expiry)
    }

    /// Pop the head if its deadline has passed.
    pub fn pop_due(&mut self, now: Instant) -> Option<TtlCountdownEntry> {
        if self.next_expiry()? <= now {
            self.heap.pop().map(|Reverse(entry)| entry)
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
