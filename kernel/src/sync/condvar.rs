//! Condition variable
//!
//! Wakeups are counted in an atomic sequence so interrupt handlers can
//! signal without taking locks; the card-detect ISR relies on this.

use core::sync::atomic::{AtomicU32, Ordering};

pub struct ConditionVariable {
    sequence: AtomicU32,
}

impl ConditionVariable {
    pub const fn new() -> Self {
        Self { sequence: AtomicU32::new(0) }
    }

    /// Block until the next wakeup after this call.
    pub fn wait(&self) {
        let seen = self.sequence.load(Ordering::Acquire);
        while self.sequence.load(Ordering::Acquire) == seen {
            crate::scheduler::yield_now();
        }
    }

    /// Block until a wakeup or the timeout. Returns false on timeout.
    pub fn wait_timeout(&self, ms: u64) -> bool {
        let seen = self.sequence.load(Ordering::Acquire);
        let deadline = crate::time::Deadline::after_ms(ms);
        while self.sequence.load(Ordering::Acquire) == seen {
            if deadline.expired() {
                return false;
            }
            crate::scheduler::yield_now();
        }
        true
    }

    /// Wake all current waiters. Safe from interrupt context.
    pub fn wakeup(&self) {
        self.sequence.fetch_add(1, Ordering::Release);
    }
}

impl Default for ConditionVariable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_elapses() {
        let cond = ConditionVariable::new();
        assert!(!cond.wait_timeout(5));
    }

    #[test]
    fn wakeup_before_wait_is_seen() {
        let cond = ConditionVariable::new();
        let seen = cond.sequence.load(Ordering::Acquire);
        cond.wakeup();
        assert_ne!(cond.sequence.load(Ordering::Acquire), seen);
    }
}
