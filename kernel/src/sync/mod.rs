//! Synchronization primitives
//!
//! Blocking primitives built over the scheduler: a counting semaphore with
//! RAII guards and an IRQ-wakeable condition variable. Short critical
//! sections elsewhere use `spin::Mutex` directly.

pub mod condvar;
pub mod semaphore;

pub use condvar::ConditionVariable;
pub use semaphore::{KSemaphore, SemaphoreGuard};
