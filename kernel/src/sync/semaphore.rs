//! Counting semaphore
//!
//! The SD/MMC device semaphore (count 1) serializes bus transactions;
//! waiters yield to the scheduler instead of spinning hot.

use core::sync::atomic::{AtomicI32, Ordering};

pub struct KSemaphore {
    count: AtomicI32,
}

impl KSemaphore {
    pub const fn new(count: i32) -> Self {
        Self { count: AtomicI32::new(count) }
    }

    /// Acquire (decrement), yielding while the count is exhausted.
    pub fn acquire(&self) -> SemaphoreGuard<'_> {
        loop {
            if self.try_acquire_raw() {
                return SemaphoreGuard { sema: self };
            }
            crate::scheduler::yield_now();
        }
    }

    /// Try to acquire without blocking.
    pub fn try_acquire(&self) -> Option<SemaphoreGuard<'_>> {
        if self.try_acquire_raw() {
            Some(SemaphoreGuard { sema: self })
        } else {
            None
        }
    }

    fn try_acquire_raw(&self) -> bool {
        let count = self.count.load(Ordering::Relaxed);
        if count <= 0 {
            return false;
        }
        self.count
            .compare_exchange(count, count - 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn release(&self) {
        self.count.fetch_add(1, Ordering::Release);
    }

    pub fn count(&self) -> i32 {
        self.count.load(Ordering::Relaxed)
    }
}

/// Releases on every exit path.
pub struct SemaphoreGuard<'a> {
    sema: &'a KSemaphore,
}

impl Drop for SemaphoreGuard<'_> {
    fn drop(&mut self) {
        self.sema.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_releases() {
        let sema = KSemaphore::new(1);
        {
            let _guard = sema.acquire();
            assert_eq!(sema.count(), 0);
            assert!(sema.try_acquire().is_none());
        }
        assert_eq!(sema.count(), 1);
        assert!(sema.try_acquire().is_some());
    }
}
