//! Hardware abstraction layer
//!
//! Digital pins, interrupt registration and cache-maintained DMA buffers.
//! Register access is confined to the ARM target; the host build backs pins
//! with a settable state table so driver logic is testable.

pub mod cache;
pub mod pins;

pub use cache::CacheAlignedBuffer;
pub use pins::{DigitalPin, PinDirection, PinInterruptMode, PinPullMode};

use alloc::collections::BTreeMap;
use spin::Mutex;

/// Registered interrupt handler; returns true when the IRQ was handled.
pub type IrqHandler = fn() -> bool;

static IRQ_HANDLERS: Mutex<BTreeMap<u32, IrqHandler>> = Mutex::new(BTreeMap::new());

pub fn register_irq_handler(irq: u32, handler: IrqHandler) {
    let previous = IRQ_HANDLERS.lock().insert(irq, handler);
    if previous.is_some() {
        crate::log_warn!("[hal] IRQ {} handler replaced", irq);
    }
}

/// Entry point from the vector table shims.
pub fn dispatch_irq(irq: u32) {
    let handler = IRQ_HANDLERS.lock().get(&irq).copied();
    match handler {
        Some(handler) => {
            if !handler() {
                crate::log_warn!("[hal] IRQ {} unhandled", irq);
            }
        }
        None => crate::log_warn!("[hal] spurious IRQ {}", irq),
    }
}
