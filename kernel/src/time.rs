//! Time utilities
//!
//! Millisecond uptime driven by the SysTick interrupt on hardware. The host
//! build advances the clock from `scheduler::yield_now`, which keeps timeout
//! loops deterministic in tests.

use core::sync::atomic::{AtomicU64, Ordering};

/// System uptime in milliseconds
static UPTIME_MS: AtomicU64 = AtomicU64::new(0);

/// Get current uptime in milliseconds
pub fn uptime_ms() -> u64 {
    UPTIME_MS.load(Ordering::Relaxed)
}

pub fn uptime_secs() -> u64 {
    uptime_ms() / 1000
}

/// Advance the clock (SysTick handler; 1 ms per tick)
pub fn tick() {
    UPTIME_MS.fetch_add(1, Ordering::Relaxed);
}

/// Deadline helper for polling loops
#[derive(Debug, Clone, Copy)]
pub struct Deadline(u64);

impl Deadline {
    pub fn after_ms(ms: u64) -> Self {
        Deadline(uptime_ms() + ms)
    }

    pub fn expired(&self) -> bool {
        uptime_ms() > self.0
    }
}
