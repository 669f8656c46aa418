//! PadOS-RS kernel
//!
//! Operating system for an ARM Cortex-M touch tablet: preemptive scheduler,
//! SD/MMC block driver with partition publication, FAT-aware VFS, a
//! region-based display compositor for the RA8875 panel, and the
//! retained-mode GUI framework applications build on.
//!
//! The host build compiles the same tree without the hardware-register
//! modules; `cargo test` exercises the protocol and compositor logic there.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), no_main)]

extern crate alloc;

// Core services
mod config;
mod logger;
mod math;
mod region;
mod serial;
mod time;

// Kernel infrastructure
mod hal;
mod ipc;
mod scheduler;
mod sync;
mod vfs;

// Drivers
mod drivers;
mod input;

// Display server and GUI framework
mod appserver;
mod gui;

#[cfg(not(test))]
use alloc::boxed::Box;

#[cfg(not(test))]
use crate::math::Rect;

#[cfg(not(test))]
#[global_allocator]
static ALLOCATOR: linked_list_allocator::LockedHeap = linked_list_allocator::LockedHeap::empty();

#[cfg(not(test))]
fn init_heap() {
    use core::ptr::addr_of_mut;
    static mut HEAP: [u8; config::HEAP_SIZE] = [0; config::HEAP_SIZE];
    unsafe {
        ALLOCATOR
            .lock()
            .init(addr_of_mut!(HEAP) as *mut u8, config::HEAP_SIZE);
    }
}

/// Bring the system up: heap, scheduler, display server, storage, input,
/// then the first application.
#[cfg(not(test))]
fn boot() {
    serial::init();
    crate::log!("PadOS-RS {} booting", env!("CARGO_PKG_VERSION"));

    init_heap();
    scheduler::init();

    // Display first so early failures stay visible.
    #[cfg(target_arch = "arm")]
    {
        let mut gfx = drivers::ra8875::Ra8875Driver::new();
        gfx.init_display();
        appserver::init(Box::new(gfx));
    }
    #[cfg(not(target_arch = "arm"))]
    appserver::init(Box::new(drivers::ra8875::NullGfx));

    // SD/MMC storage: controller plus card-detect pin.
    #[cfg(target_arch = "arm")]
    {
        const HSMCI_BASE: usize = 0x4000_0000;
        let controller = Box::new(drivers::sdmmc::controller::HsmciController::new(HSMCI_BASE));
        let card_detect = hal::DigitalPin::new(3, 18);
        if let Err(error) = drivers::sdmmc::init(controller, card_detect) {
            crate::log_error!("[boot] sdmmc init failed: {:?}", error);
        }
    }

    scheduler::spawn("input", input_entry);
    scheduler::spawn("desktop", desktop_entry);

    crate::log!("[boot] system up");
}

#[cfg(not(test))]
fn input_entry() {
    input::input_thread();
}

/// First application: a full-screen backdrop that owns keyboard focus.
/// Real applications attach their own view trees next to it.
#[cfg(not(test))]
fn desktop_entry() {
    use crate::appserver::protocol::view_flags;

    let mut app = match gui::Application::new("desktop") {
        Ok(app) => app,
        Err(error) => {
            crate::log_error!("[desktop] registration failed: {:?}", error);
            return;
        }
    };

    let backdrop = app.create_view(
        "backdrop",
        Rect::from_size(
            config::DISPLAY_WIDTH as f32,
            config::DISPLAY_HEIGHT as f32,
        ),
        view_flags::WILL_DRAW,
    );
    app.set_erase_color(backdrop, drivers::ra8875::rgb(16, 32, 48));
    if let Err(error) = app.add_view(backdrop) {
        crate::log_error!("[desktop] attach failed: {:?}", error);
        return;
    }
    app.set_focus(backdrop, true);

    loop {
        app.tick();
        scheduler::sleep_ms(10);
    }
}

// ============================================================================
// Entry points
// ============================================================================

#[cfg(target_arch = "arm")]
#[cortex_m_rt::entry]
fn arm_main() -> ! {
    boot();
    loop {
        scheduler::yield_now();
        cortex_m::asm::wfi();
    }
}

/// Peripheral interrupts funnel through the HAL's handler registry.
#[cfg(target_arch = "arm")]
#[cortex_m_rt::exception]
unsafe fn DefaultHandler(irqn: i16) {
    if irqn >= 0 {
        hal::dispatch_irq(irqn as u32);
    }
}

/// Headless smoke run for the host build: boot, let the cooperative
/// services settle, exit.
#[cfg(all(not(test), not(target_arch = "arm")))]
#[no_mangle]
extern "C" fn main(_argc: isize, _argv: *const *const u8) -> isize {
    boot();
    for _ in 0..10_000 {
        appserver::drive();
        input::dispatch_pending();
        scheduler::yield_now();
    }
    crate::log!("[boot] host smoke run complete");
    0
}

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    crate::log_level!(crate::logger::LogLevel::Error, "KERNEL PANIC: {}", info);
    loop {
        core::hint::spin_loop();
    }
}
