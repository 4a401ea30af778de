//! Clock and identifier allocation.
//!
//! Job ids are monotonic `u32`s that wrap at a configured ceiling and then
//! gap-search past ids still held by live records. Step ids are per-job
//! monotonic. Both counters survive restarts through the id-counter state
//! file.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Wall-clock seam. The controller reads time through this so tests can
/// substitute a fixed clock.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// System wall clock.
#[derive(Debug, Default, Clone)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Fixed clock for tests.
#[derive(Debug, Clone)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Allocates job ids. Ids are never reused while a record with that id
/// still exists; after wrapping, allocation probes forward past live ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobIdAllocator {
    next_id: u32,
    first_id: u32,
    max_id: u32,
}

impl JobIdAllocator {
    pub fn new(first_id: u32, max_id: u32) -> Self {
        assert!(first_id > 0 && first_id < max_id);
        Self {
            next_id: first_id,
            first_id,
            max_id,
        }
    }

    /// Restores allocator state from the id-counter file.
    pub fn restore(next_id: u32, first_id: u32, max_id: u32) -> Self {
        let mut alloc = Self::new(first_id, max_id);
        alloc.next_id = next_id.clamp(first_id, max_id);
        alloc
    }

    pub fn next_unallocated(&self) -> u32 {
        self.next_id
    }

    /// Returns the next free id, probing past ids for which `in_use`
    /// reports a live record. Returns `None` only when every id in the
    /// configured range is live.
    pub fn alloc(&mut self, in_use: impl Fn(u32) -> bool) -> Option<u32> {
        let span = (self.max_id - self.first_id + 1) as u64;
        for _ in 0..span {
            let candidate = self.next_id;
            self.next_id = if candidate >= self.max_id {
                self.first_id
            } else {
                candidate + 1
            };
            if !in_use(candidate) {
                return Some(candidate);
            }
        }
        None
    }
}

/// Per-job step id counter.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StepIdCounter {
    next: u32,
}

impl StepIdCounter {
    pub fn alloc(&mut self) -> u32 {
        let id = self.next;
        self.next += 1;
        id
    }

    pub fn peek(&self) -> u32 {
        self.next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn job_ids_are_monotonic() {
        let mut alloc = JobIdAllocator::new(1000, 1010);
        let a = alloc.alloc(|_| false).unwrap();
        let b = alloc.alloc(|_| false).unwrap();
        assert_eq!(b, a + 1);
    }

    #[test]
    fn wrap_skips_live_ids() {
        let mut alloc = JobIdAllocator::new(1, 4);
        let live: HashSet<u32> = [1u32, 2].into_iter().collect();
        // Consume the whole range once.
        for _ in 0..4 {
            alloc.alloc(|_| false);
        }
        // Wrapped: 1 and 2 are still live, so 3 comes back first.
        let id = alloc.alloc(|id| live.contains(&id)).unwrap();
        assert_eq!(id, 3);
    }

    #[test]
    fn exhausted_range_returns_none() {
        let mut alloc = JobIdAllocator::new(1, 3);
        assert_eq!(alloc.alloc(|_| true), None);
    }

    #[test]
    fn step_ids_count_from_zero() {
        let mut ctr = StepIdCounter::default();
        assert_eq!(ctr.alloc(), 0);
        assert_eq!(ctr.alloc(), 1);
        assert_eq!(ctr.peek(), 2);
    }
}
