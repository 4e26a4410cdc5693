//! `ManagedBlocker`: the pool's extension point for user-supplied blocking strategies
//! that still cooperate with compensation.

use crate::error::Result;

/// A blocking strategy that [`crate::pool::Pool::await_blocker`] runs with parallelism
/// compensation: before and after `block()`, the pool checks `is_releasable()` and, if
/// the caller is a worker, may spin up or resume a spare worker while this thread is
/// blocked so the running-thread count stays near the target parallelism.
pub trait ManagedBlocker {
    /// Block until releasable, or return once some forward progress has been made.
    /// May be called more than once; only returns early, never retries on your behalf.
    fn block(&mut self) -> Result<()>;

    /// Must return `true` if `block()` would return immediately without blocking.
    /// `await_blocker` checks this before ever calling `block()`, so a blocker whose
    /// condition already holds never blocks at all.
    fn is_releasable(&mut self) -> bool;
}

/// A `ManagedBlocker` that simply sleeps for a fixed duration, useful for simulating
/// blocking I/O in tests and examples.
pub struct SleepBlocker {
    until: std::time::Instant,
}

impl SleepBlocker {
    pub fn for_duration(d: std::time::Duration) -> Self {
        SleepBlocker {
            until: std::time::Instant::now() + d,
        }
    }
}

impl ManagedBlocker for SleepBlocker {
    fn block(&mut self) -> Result<()> {
        if let Some(remaining) = self.until.checked_duration_since(std::time::Instant::now()) {
            std::thread::sleep(remaining);
        }
        Ok(())
    }

    fn is_releasable(&mut self) -> bool {
        std::time::Instant::now() >= self.until
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sleep_blocker_is_releasable_after_duration() {
        let mut b = SleepBlocker::for_duration(std::time::Duration::from_millis(10));
        assert!(!b.is_releasable());
        b.block().unwrap();
        assert!(b.is_releasable());
    }
}
