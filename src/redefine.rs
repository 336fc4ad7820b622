//! Redefinition epoch
//!
//! Every class redefinition advances a global epoch. Cache entries remember
//! the epoch at which their identity was last checked in an [`EpochCell`];
//! a reader compares the two without locking and re-validates only when
//! the cell is behind.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

/// First epoch value; cells start at 0 so they are stale until validated
pub const INITIAL_EPOCH: u64 = 1;

/// Process-wide counter advanced on class redefinition
#[derive(Debug)]
pub struct RedefineEpoch {
    epoch: AtomicU64,
    lock: Mutex<()>,
}

impl Default for RedefineEpoch {
    fn default() -> Self {
        Self::new()
    }
}

impl RedefineEpoch {
    pub fn new() -> Self {
        Self {
            epoch: AtomicU64::new(INITIAL_EPOCH),
            lock: Mutex::new(()),
        }
    }

    pub fn current(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Advance after a redefinition; returns the new epoch.
    ///
    /// Steps by two so the value stays odd and never equals a cleared cell.
    pub fn advance(&self) -> u64 {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let next = self.epoch.load(Ordering::Relaxed) + 2;
        self.epoch.store(next, Ordering::Release);
        next
    }
}

/// Epoch at which one entry was last validated
#[derive(Debug, Default)]
pub struct EpochCell {
    validated_at: AtomicU64,
}

impl EpochCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether no redefinition happened since the last validation
    pub fn is_current(&self, epoch: &RedefineEpoch) -> bool {
        self.validated_at.load(Ordering::Acquire) == epoch.current()
    }

    /// Record a successful validation performed while `at` was current
    pub fn mark_validated(&self, at: u64) {
        self.validated_at.store(at, Ordering::Release);
    }

    pub fn invalidate(&self) {
        self.validated_at.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_cell_goes_stale_on_advance() {
        let epoch = RedefineEpoch::new();
        let cell = EpochCell::new();
        assert!(!cell.is_current(&epoch));

        cell.mark_validated(epoch.current());
        assert!(cell.is_current(&epoch));

        assert_eq!(epoch.advance(), 3);
        assert!(!cell.is_current(&epoch));

        cell.mark_validated(epoch.current());
        cell.invalidate();
        assert!(!cell.is_current(&epoch));
    }

    #[test]
    fn test_concurrent_advances_are_not_lost() {
        let epoch = Arc::new(RedefineEpoch::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let epoch = Arc::clone(&epoch);
                thread::spawn(move || {
                    for _ in 0..100 {
                        epoch.advance();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(epoch.current(), INITIAL_EPOCH + 2 * 400);
    }
}
