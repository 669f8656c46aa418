//! SD/MMC host controller seam
//!
//! The driver's protocol engine talks to the bus through `HostController`.
//! Hardware is the HSMCI peripheral; the test suite substitutes a scripted
//! card model.

#[cfg(target_arch = "arm")]
use super::cmd::{self, flags};

/// Scatter/gather for one data phase
pub enum DataDirection<'a, 'b> {
    Read(&'a mut [&'b mut [u8]]),
    Write(&'a [&'b [u8]]),
}

impl DataDirection<'_, '_> {
    pub fn total_len(&self) -> usize {
        match self {
            DataDirection::Read(segments) => segments.iter().map(|s| s.len()).sum(),
            DataDirection::Write(segments) => segments.iter().map(|s| s.len()).sum(),
        }
    }
}

/// One outstanding command at a time; the driver's device semaphore
/// guarantees it.
pub trait HostController: Send {
    /// Reset the controller and the bus.
    fn reset(&mut self);

    /// Clock the bus for 74 cycles with no transaction (card power-up).
    fn send_clock(&mut self);

    /// Program clock rate, bus width (1/4/8) and high-speed timing.
    fn apply_speed_and_bus_width(&mut self, clock_hz: u32, bus_width: u8, high_speed: bool);

    /// Issue a command without a data phase. Returns false on CRC error,
    /// response timeout or missing busy release.
    fn send_cmd(&mut self, cmd: u32, arg: u32) -> bool;

    /// 32-bit response of the last command.
    fn response(&self) -> u32;

    /// 136-bit response (CID/CSD) of the last command, spec bit 127 first.
    fn response128(&self) -> [u8; 16];

    /// Issue a command with a data phase and run the transfer to completion.
    fn start_data_cmd(
        &mut self,
        cmd: u32,
        arg: u32,
        block_size_log2: u32,
        block_count: u32,
        data: DataDirection,
    ) -> bool;

    /// Stop an open-ended transfer (CMD12).
    fn stop_data_cmd(&mut self, cmd: u32, arg: u32) -> bool;
}

// ============================================================================
// HSMCI (SAME70) implementation
// ============================================================================

/// Register-level HSMCI controller. PIO transfer path; DMA is not needed at
/// the clock rates this board runs.
#[cfg(target_arch = "arm")]
pub struct HsmciController {
    base: usize,
    last_response: u32,
}

#[cfg(target_arch = "arm")]
mod regs {
    pub const CR: usize = 0x00; // control
    pub const MR: usize = 0x04; // mode
    pub const DTOR: usize = 0x08; // data timeout
    pub const SDCR: usize = 0x0C; // SD/SDIO card (bus width, slot)
    pub const ARGR: usize = 0x10; // argument
    pub const CMDR: usize = 0x14; // command
    pub const BLKR: usize = 0x18; // block
    pub const RSPR: usize = 0x20; // response (x4)
    pub const RDR: usize = 0x30; // receive data
    pub const TDR: usize = 0x34; // transmit data
    pub const SR: usize = 0x40; // status

    pub const CR_MCIEN: u32 = 1 << 0;
    pub const CR_PWSDIS: u32 = 1 << 3;
    pub const CR_SWRST: u32 = 1 << 7;

    pub const SR_CMDRDY: u32 = 1 << 0;
    pub const SR_RXRDY: u32 = 1 << 1;
    pub const SR_TXRDY: u32 = 1 << 2;
    pub const SR_NOTBUSY: u32 = 1 << 5;
    pub const SR_XFRDONE: u32 = 1 << 27;
    pub const SR_ERROR_MASK: u32 = 0x21FB_0000; // CRC, timeout, overrun, underrun

    // CMDR fields
    pub const CMDR_RSPTYP_48: u32 = 1 << 6;
    pub const CMDR_RSPTYP_136: u32 = 2 << 6;
    pub const CMDR_RSPTYP_R1B: u32 = 3 << 6;
    pub const CMDR_OPDCMD: u32 = 1 << 11;
    pub const CMDR_MAXLAT: u32 = 1 << 12;
    pub const CMDR_TRCMD_START: u32 = 1 << 16;
    pub const CMDR_TRCMD_STOP: u32 = 2 << 16;
    pub const CMDR_TRDIR_READ: u32 = 1 << 18;
    pub const CMDR_TRTYP_MULTIPLE: u32 = 1 << 19;
    pub const CMDR_TRTYP_BYTE: u32 = 4 << 19;
}

#[cfg(target_arch = "arm")]
impl HsmciController {
    pub const fn new(base: usize) -> Self {
        Self { base, last_response: 0 }
    }

    fn write_reg(&self, offset: usize, value: u32) {
        unsafe { core::ptr::write_volatile((self.base + offset) as *mut u32, value) }
    }

    fn read_reg(&self, offset: usize) -> u32 {
        unsafe { core::ptr::read_volatile((self.base + offset) as *const u32) }
    }

    /// Bounded wait: a transfer stuck longer than this is abandoned and
    /// left to the driver's retry loop.
    const STUCK_TIMEOUT_MS: u64 = 50;

    fn wait_status(&self, mask: u32) -> Result<(), ()> {
        let deadline = crate::time::Deadline::after_ms(Self::STUCK_TIMEOUT_MS);
        loop {
            let status = self.read_reg(regs::SR);
            if status & regs::SR_ERROR_MASK != 0 {
                return Err(());
            }
            if status & mask != 0 {
                return Ok(());
            }
            if deadline.expired() {
                return Err(());
            }
            core::hint::spin_loop();
        }
    }

    fn cmdr_value(cmd: u32) -> u32 {
        let mut cmdr = cmd::cmd_index(cmd) | regs::CMDR_MAXLAT;
        if cmd & flags::RESP_PRESENT != 0 {
            cmdr |= if cmd & flags::RESP_136 != 0 {
                regs::CMDR_RSPTYP_136
            } else if cmd & flags::RESP_BUSY != 0 {
                regs::CMDR_RSPTYP_R1B
            } else {
                regs::CMDR_RSPTYP_48
            };
        }
        if cmd & flags::OPEN_DRAIN != 0 {
            cmdr |= regs::CMDR_OPDCMD;
        }
        cmdr
    }

    fn issue(&mut self, cmdr: u32, arg: u32) -> bool {
        self.write_reg(regs::ARGR, arg);
        self.write_reg(regs::CMDR, cmdr);
        if self.wait_status(regs::SR_CMDRDY).is_err() {
            return false;
        }
        self.last_response = self.read_reg(regs::RSPR);
        true
    }
}

#[cfg(target_arch = "arm")]
impl HostController for HsmciController {
    fn reset(&mut self) {
        self.write_reg(regs::CR, regs::CR_SWRST);
        self.write_reg(regs::CR, regs::CR_MCIEN | regs::CR_PWSDIS);
        self.write_reg(regs::DTOR, 0x7F); // max data timeout
        self.write_reg(regs::MR, 0);
    }

    fn send_clock(&mut self) {
        // Special command: 74 clock cycles of idle
        self.issue(0, 0);
    }

    fn apply_speed_and_bus_width(&mut self, clock_hz: u32, bus_width: u8, high_speed: bool) {
        const MCK_HZ: u32 = 150_000_000;
        let div = (MCK_HZ / clock_hz.max(1)).saturating_sub(2).min(0x1FF);
        let mut mr = div >> 1;
        if div & 1 != 0 {
            mr |= 1 << 16; // CLKODD
        }
        if high_speed {
            mr |= 1 << 14; // HSMODE via CFG in newer parts; kept in MR shadow
        }
        self.write_reg(regs::MR, mr);
        let sdcr = match bus_width {
            8 => 3 << 6,
            4 => 2 << 6,
            _ => 0,
        };
        self.write_reg(regs::SDCR, sdcr);
    }

    fn send_cmd(&mut self, cmd: u32, arg: u32) -> bool {
        if !self.issue(Self::cmdr_value(cmd), arg) {
            return false;
        }
        if cmd & flags::RESP_BUSY != 0 {
            return self.wait_status(regs::SR_NOTBUSY).is_ok();
        }
        true
    }

    fn response(&self) -> u32 {
        self.last_response
    }

    fn response128(&self) -> [u8; 16] {
        let mut response = [0u8; 16];
        for word in 0..4 {
            let value = self.read_reg(regs::RSPR + word * 4);
            response[word * 4..word * 4 + 4].copy_from_slice(&value.to_be_bytes());
        }
        response
    }

    fn start_data_cmd(
        &mut self,
        cmd: u32,
        arg: u32,
        block_size_log2: u32,
        block_count: u32,
        mut data: DataDirection,
    ) -> bool {
        let block_size = 1u32 << block_size_log2;
        self.write_reg(regs::BLKR, block_size << 16 | block_count);

        let mut cmdr = Self::cmdr_value(cmd) | regs::CMDR_TRCMD_START;
        if cmd & flags::WRITE == 0 {
            cmdr |= regs::CMDR_TRDIR_READ;
        }
        if cmd & flags::MULTI_BLOCK != 0 {
            cmdr |= regs::CMDR_TRTYP_MULTIPLE;
        } else if cmd & flags::SDIO_BYTE != 0 {
            cmdr |= regs::CMDR_TRTYP_BYTE;
        }

        if !self.issue(cmdr, arg) {
            return false;
        }

        let total = (block_size * block_count) as usize;
        match &mut data {
            DataDirection::Read(segments) => {
                let mut remaining = total;
                for segment in segments.iter_mut() {
                    crate::hal::cache::invalidate_range(segment.as_ptr(), segment.len());
                    let mut offset = 0;
                    while offset < segment.len() && remaining > 0 {
                        if self.wait_status(regs::SR_RXRDY).is_err() {
                            return false;
                        }
                        let word = self.read_reg(regs::RDR);
                        let take = (segment.len() - offset).min(4).min(remaining);
                        segment[offset..offset + take]
                            .copy_from_slice(&word.to_le_bytes()[..take]);
                        offset += take;
                        remaining -= take;
                    }
                    crate::hal::cache::invalidate_range(segment.as_ptr(), segment.len());
                }
            }
            DataDirection::Write(segments) => {
                let mut remaining = total;
                for segment in segments.iter() {
                    crate::hal::cache::clean_range(segment.as_ptr(), segment.len());
                    let mut offset = 0;
                    while offset < segment.len() && remaining > 0 {
                        if self.wait_status(regs::SR_TXRDY).is_err() {
                            return false;
                        }
                        let take = (segment.len() - offset).min(4).min(remaining);
                        let mut word = [0u8; 4];
                        word[..take].copy_from_slice(&segment[offset..offset + take]);
                        self.write_reg(regs::TDR, u32::from_le_bytes(word));
                        offset += take;
                        remaining -= take;
                    }
                }
            }
        }
        self.wait_status(regs::SR_XFRDONE).is_ok()
    }

    fn stop_data_cmd(&mut self, cmd: u32, arg: u32) -> bool {
        self.issue(Self::cmdr_value(cmd) | regs::CMDR_TRCMD_STOP, arg)
    }
}
