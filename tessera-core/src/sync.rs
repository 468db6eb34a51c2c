//! Monotonic counter with blocking waits.
//!
//! The only blocking primitive in the engine: increment-then-notify on
//! one side, wait-until-at-least on the other. Frame data readiness and
//! the compositor's multi-input wait are both built on it.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
pub struct Monitor {
    value: Mutex<u64>,
    changed: Condvar,
}

impl Monitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(value: u64) -> Self {
        Self {
            value: Mutex::new(value),
            changed: Condvar::new(),
        }
    }

    pub fn get(&self) -> u64 {
        *self.lock()
    }

    /// Add one and wake all waiters. Returns the new value.
    pub fn increment(&self) -> u64 {
        let mut value = self.lock();
        *value += 1;
        self.changed.notify_all();
        *value
    }

    /// Raise the value to `target`. Lower targets are ignored.
    /// Returns whether the value moved.
    pub fn advance_to(&self, target: u64) -> bool {
        let mut value = self.lock();
        if *value >= target {
            return false;
        }
        *value = target;
        self.changed.notify_all();
        true
    }

    /// Block until the value is at least `target`.
    pub fn wait_ge(&self, target: u64) -> u64 {
        let guard = self
            .changed
            .wait_while(self.lock(), |v| *v < target)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }

    /// Block until the value is at least `target` or `timeout` passes.
    /// Returns `false` on timeout.
    pub fn timed_wait_ge(&self, target: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut value = self.lock();
        while *value < target {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            value = self
                .changed
                .wait_timeout(value, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    fn lock(&self) -> MutexGuard<'_, u64> {
        self.value.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn increment_wakes_waiter() {
        let monitor = Arc::new(Monitor::new());
        let waiter = {
            let monitor = Arc::clone(&monitor);
            thread::spawn(move || monitor.wait_ge(2))
        };
        monitor.increment();
        monitor.increment();
        assert_eq!(waiter.join().unwrap(), 2);
    }

    #[test]
    fn timed_wait_times_out() {
        let monitor = Monitor::with_value(4);
        let start = Instant::now();
        assert!(!monitor.timed_wait_ge(5, Duration::from_millis(10)));
        assert!(start.elapsed() >= Duration::from_millis(10));
        assert!(monitor.timed_wait_ge(4, Duration::from_millis(10)));
    }

    #[test]
    fn advance_is_forward_only() {
        let monitor = Monitor::with_value(3);
        assert!(!monitor.advance_to(2));
        assert!(monitor.advance_to(7));
        assert_eq!(monitor.get(), 7);
    }
}
