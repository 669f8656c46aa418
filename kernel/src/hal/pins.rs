//! Digital pins
//!
//! A `DigitalPin` names one GPIO line. Configuration is applied through the
//! PIO controller on hardware; off target the line level and interrupt latch
//! live in a shared table so tests can poke them (`set_level_for_test`).
//! The pin also implements the `embedded-hal` digital traits so external
//! driver crates can sit on top of it.

use core::convert::Infallible;
use core::sync::atomic::{AtomicU32, Ordering};

use embedded_hal::digital::{ErrorType, InputPin, OutputPin, PinState};

/// Ports A..E, 32 lines each
const PORT_COUNT: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinDirection {
    In,
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinPullMode {
    None,
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinInterruptMode {
    None,
    RisingEdge,
    FallingEdge,
    BothEdges,
}

/// Line levels per port; doubles as the loopback store off target.
static PORT_LEVELS: [AtomicU32; PORT_COUNT] = [
    AtomicU32::new(0),
    AtomicU32::new(0),
    AtomicU32::new(0),
    AtomicU32::new(0),
    AtomicU32::new(0),
];

/// Latched edge-interrupt status per port.
static PORT_IRQ_STATUS: [AtomicU32; PORT_COUNT] = [
    AtomicU32::new(0),
    AtomicU32::new(0),
    AtomicU32::new(0),
    AtomicU32::new(0),
    AtomicU32::new(0),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DigitalPin {
    port: u8,
    index: u8,
}

impl DigitalPin {
    pub const fn new(port: u8, index: u8) -> Self {
        Self { port, index }
    }

    fn mask(&self) -> u32 {
        1 << self.index
    }

    /// IRQ number of the owning PIO controller.
    pub fn peripheral_irq(&self) -> u32 {
        10 + self.port as u32
    }

    pub fn set_direction(&self, direction: PinDirection) {
        #[cfg(target_arch = "arm")]
        pio::set_direction(self.port, self.mask(), direction);
        #[cfg(not(target_arch = "arm"))]
        let _ = direction;
    }

    pub fn set_pull_mode(&self, pull: PinPullMode) {
        #[cfg(target_arch = "arm")]
        pio::set_pull(self.port, self.mask(), pull);
        #[cfg(not(target_arch = "arm"))]
        let _ = pull;
    }

    pub fn set_interrupt_mode(&self, mode: PinInterruptMode) {
        #[cfg(target_arch = "arm")]
        pio::set_interrupt_mode(self.port, self.mask(), mode);
        #[cfg(not(target_arch = "arm"))]
        let _ = mode;
    }

    pub fn enable_interrupts(&self) {
        #[cfg(target_arch = "arm")]
        pio::enable_interrupt(self.port, self.mask());
    }

    pub fn read(&self) -> bool {
        #[cfg(target_arch = "arm")]
        {
            return pio::read(self.port, self.mask());
        }
        #[cfg(not(target_arch = "arm"))]
        {
            PORT_LEVELS[self.port as usize].load(Ordering::Acquire) & self.mask() != 0
        }
    }

    pub fn write(&self, high: bool) {
        #[cfg(target_arch = "arm")]
        pio::write(self.port, self.mask(), high);
        #[cfg(not(target_arch = "arm"))]
        {
            if high {
                PORT_LEVELS[self.port as usize].fetch_or(self.mask(), Ordering::Release);
            } else {
                PORT_LEVELS[self.port as usize].fetch_and(!self.mask(), Ordering::Release);
            }
        }
    }

    /// Read and clear the latched edge-interrupt status for this line.
    pub fn get_and_clear_interrupt_status(&self) -> bool {
        let status = PORT_IRQ_STATUS[self.port as usize].fetch_and(!self.mask(), Ordering::AcqRel);
        status & self.mask() != 0
    }

    /// Drive the line from a test and latch the edge.
    pub fn set_level_for_test(&self, high: bool) {
        if high {
            PORT_LEVELS[self.port as usize].fetch_or(self.mask(), Ordering::Release);
        } else {
            PORT_LEVELS[self.port as usize].fetch_and(!self.mask(), Ordering::Release);
        }
        PORT_IRQ_STATUS[self.port as usize].fetch_or(self.mask(), Ordering::Release);
    }
}

impl ErrorType for DigitalPin {
    type Error = Infallible;
}

impl InputPin for DigitalPin {
    fn is_high(&mut self) -> Result<bool, Self::Error> {
        Ok(DigitalPin::read(self))
    }

    fn is_low(&mut self) -> Result<bool, Self::Error> {
        Ok(!DigitalPin::read(self))
    }
}

impl OutputPin for DigitalPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.write(false);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.write(true);
        Ok(())
    }

    fn set_state(&mut self, state: PinState) -> Result<(), Self::Error> {
        self.write(state == PinState::High);
        Ok(())
    }
}

// ============================================================================
// PIO controller registers (SAME70)
// ============================================================================

#[cfg(target_arch = "arm")]
mod pio {
    use super::{PinDirection, PinInterruptMode, PinPullMode};

    const PIO_BASE: usize = 0x400E_0E00;
    const PORT_STRIDE: usize = 0x200;

    const PIO_PER: usize = 0x00; // enable
    const PIO_OER: usize = 0x10; // output enable
    const PIO_ODR: usize = 0x14; // output disable
    const PIO_SODR: usize = 0x30; // set output
    const PIO_CODR: usize = 0x34; // clear output
    const PIO_PDSR: usize = 0x3C; // data status
    const PIO_IER: usize = 0x40; // interrupt enable
    const PIO_PUER: usize = 0x64; // pull-up enable
    const PIO_PUDR: usize = 0x60; // pull-up disable
    const PIO_PPDER: usize = 0x94; // pull-down enable
    const PIO_ESR: usize = 0xC0; // edge select
    const PIO_AIMDR: usize = 0xB4; // any-edge (additional modes disable)
    const PIO_AIMER: usize = 0xB0; // additional modes enable
    const PIO_REHLSR: usize = 0xD4; // rising edge
    const PIO_FELLSR: usize = 0xD0; // falling edge

    fn reg(port: u8, offset: usize) -> *mut u32 {
        (PIO_BASE + port as usize * PORT_STRIDE + offset) as *mut u32
    }

    fn write_reg(port: u8, offset: usize, value: u32) {
        unsafe { core::ptr::write_volatile(reg(port, offset), value) }
    }

    pub fn set_direction(port: u8, mask: u32, direction: PinDirection) {
        write_reg(port, PIO_PER, mask);
        match direction {
            PinDirection::Out => write_reg(port, PIO_OER, mask),
            PinDirection::In => write_reg(port, PIO_ODR, mask),
        }
    }

    pub fn set_pull(port: u8, mask: u32, pull: PinPullMode) {
        match pull {
            PinPullMode::None => write_reg(port, PIO_PUDR, mask),
            PinPullMode::Up => write_reg(port, PIO_PUER, mask),
            PinPullMode::Down => write_reg(port, PIO_PPDER, mask),
        }
    }

    pub fn set_interrupt_mode(port: u8, mask: u32, mode: PinInterruptMode) {
        match mode {
            PinInterruptMode::None => write_reg(port, PIO_AIMDR, mask),
            PinInterruptMode::BothEdges => {
                write_reg(port, PIO_AIMER, mask);
                write_reg(port, PIO_ESR, mask);
                write_reg(port, PIO_AIMDR, mask);
            }
            PinInterruptMode::RisingEdge => {
                write_reg(port, PIO_AIMER, mask);
                write_reg(port, PIO_ESR, mask);
                write_reg(port, PIO_REHLSR, mask);
            }
            PinInterruptMode::FallingEdge => {
                write_reg(port, PIO_AIMER, mask);
                write_reg(port, PIO_ESR, mask);
                write_reg(port, PIO_FELLSR, mask);
            }
        }
    }

    pub fn enable_interrupt(port: u8, mask: u32) {
        write_reg(port, PIO_IER, mask);
    }

    pub fn read(port: u8, mask: u32) -> bool {
        unsafe { core::ptr::read_volatile(reg(port, PIO_PDSR)) & mask != 0 }
    }

    pub fn write(port: u8, mask: u32, high: bool) {
        if high {
            write_reg(port, PIO_SODR, mask);
        } else {
            write_reg(port, PIO_CODR, mask);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_latches_interrupt() {
        let pin = DigitalPin::new(3, 7);
        pin.set_level_for_test(false);
        assert!(!pin.read());
        assert!(pin.get_and_clear_interrupt_status());
        assert!(!pin.get_and_clear_interrupt_status());

        pin.set_level_for_test(true);
        assert!(pin.read());
        assert!(pin.get_and_clear_interrupt_status());
    }
}
