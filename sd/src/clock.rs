//! Lamport logical clock
//!
//! Gives a causal ordering hint across restarts of one worker. Not a vector
//! clock; values from different workers are never merged here.

use std::sync::atomic::{AtomicU64, Ordering};

/// The clock operations the reconciler relies on
pub trait LogicalClock: Send + Sync {
    /// Current value
    fn value(&self) -> u64;

    /// Observe a remote value: local becomes `max(local, remote) + 1`
    fn adjust(&self, remote: u64) -> u64;

    /// Advance by one and return the new value
    fn forward(&self) -> u64;
}

/// Lock-free Lamport clock
#[derive(Debug, Default)]
pub struct LamportClock {
    value: AtomicU64,
}

impl LamportClock {
    pub fn new(initial: u64) -> Self {
        Self {
            value: AtomicU64::new(initial),
        }
    }
}

impl LogicalClock for LamportClock {
    fn value(&self) -> u64 {
        self.value.load(Ordering::SeqCst)
    }

    fn adjust(&self, remote: u64) -> u64 {
        let next = |local: u64| local.max(remote).saturating_add(1);
        // fetch_update only fails when the closure returns None, which this one never does
        match self.value.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |local| Some(next(local))) {
            Ok(previous) | Err(previous) => next(previous),
        }
    }

    fn forward(&self) -> u64 {
        self.value.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_adjust_takes_max_plus_one() {
        let clock = LamportClock::new(5);
        assert_eq!(clock.adjust(100), 101);
        assert_eq!(clock.value(), 101);

        // Remote behind local still advances by one
        assert_eq!(clock.adjust(3), 102);
    }

    #[test]
    fn test_forward() {
        let clock = LamportClock::new(10);
        assert_eq!(clock.forward(), 11);
        assert_eq!(clock.forward(), 12);
        assert_eq!(clock.value(), 12);
    }

    #[test]
    fn test_default_starts_at_zero() {
        let clock = LamportClock::default();
        assert_eq!(clock.value(), 0);
        assert_eq!(clock.adjust(0), 1);
    }

    #[test]
    fn test_concurrent_forward() {
        let clock = Arc::new(LamportClock::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let clock = Arc::clone(&clock);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        clock.forward();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(clock.value(), 4000);
    }
}
