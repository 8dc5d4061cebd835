//! The snapshot counter: the database's logical clock.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonically increasing 64-bit counter defining the logical time of
/// the database.
///
/// Incremented exactly once at the successful commit of each mutating
/// read-write transaction. All increments happen while the write slot
/// is held, so commit order and counter order coincide.
#[derive(Debug)]
pub struct SnapshotCounter(AtomicU64);

impl SnapshotCounter {
    /// Creates a counter starting at `initial` (the engine's persisted
    /// version when opening an existing database, 0 for a fresh one).
    pub fn new(initial: u64) -> Self {
        Self(AtomicU64::new(initial))
    }

    /// Returns the current snapshot number.
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    /// Increments the counter by one, returning the new value.
    ///
    /// Callers must hold the write slot.
    pub fn increment(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Advances the counter to `snapshot` if it is ahead, for commits
    /// observed from other processes. Never decreases.
    pub fn advance_to(&self, snapshot: u64) {
        self.0.fetch_max(snapshot, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increments_by_one() {
        let counter = SnapshotCounter::new(0);
        assert_eq!(counter.current(), 0);
        assert_eq!(counter.increment(), 1);
        assert_eq!(counter.increment(), 2);
        assert_eq!(counter.current(), 2);
    }

    #[test]
    fn advance_to_never_decreases() {
        let counter = SnapshotCounter::new(5);
        counter.advance_to(3);
        assert_eq!(counter.current(), 5);
        counter.advance_to(9);
        assert_eq!(counter.current(), 9);
    }
}
