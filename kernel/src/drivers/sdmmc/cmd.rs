//! SD/SDIO/MMC command set
//!
//! Commands are encoded as `index | response-type | transfer flags` the way
//! the controller consumes them. Register and bit layouts follow the SD
//! Physical Layer / SDIO / JEDEC MMC specifications.

/// Extract the command index
pub const fn cmd_index(cmd: u32) -> u32 {
    cmd & 0x3F
}

/// Command encoding flags
pub mod flags {
    /// A response is expected
    pub const RESP_PRESENT: u32 = 1 << 8;
    /// 136-bit response
    pub const RESP_136: u32 = 1 << 9;
    /// Response carries a CRC
    pub const RESP_CRC: u32 = 1 << 10;
    /// Card drives busy on DAT0 after the response
    pub const RESP_BUSY: u32 = 1 << 11;
    /// Open-drain command phase (identification mode)
    pub const OPEN_DRAIN: u32 = 1 << 14;
    /// Data phase, host to card
    pub const WRITE: u32 = 1 << 15;
    /// Single-block data phase
    pub const SINGLE_BLOCK: u32 = 1 << 16;
    /// Multi-block data phase
    pub const MULTI_BLOCK: u32 = 1 << 17;
    /// SDIO byte-mode data phase
    pub const SDIO_BYTE: u32 = 1 << 18;
}

/// Response type shorthands
pub mod resp {
    use super::flags::*;
    pub const R1: u32 = RESP_PRESENT | RESP_CRC;
    pub const R1B: u32 = RESP_PRESENT | RESP_CRC | RESP_BUSY;
    pub const R2: u32 = RESP_PRESENT | RESP_136;
    pub const R3: u32 = RESP_PRESENT; // OCR, no CRC
    pub const R4: u32 = RESP_PRESENT; // SDIO OCR, no CRC
    pub const R5: u32 = RESP_PRESENT | RESP_CRC;
    pub const R6: u32 = RESP_PRESENT | RESP_CRC;
    pub const R7: u32 = RESP_PRESENT | RESP_CRC;
}

const fn cmd(index: u32, flags: u32) -> u32 {
    index | flags
}

// ============================================================================
// Commands
// ============================================================================

pub const CMD0_GO_IDLE_STATE: u32 = cmd(0, flags::OPEN_DRAIN);
pub const MMC_CMD1_SEND_OP_COND: u32 = cmd(1, resp::R3 | flags::OPEN_DRAIN);
pub const CMD2_ALL_SEND_CID: u32 = cmd(2, resp::R2 | flags::OPEN_DRAIN);
pub const SD_CMD3_SEND_RELATIVE_ADDR: u32 = cmd(3, resp::R6 | flags::OPEN_DRAIN);
pub const MMC_CMD3_SET_RELATIVE_ADDR: u32 = cmd(3, resp::R1);
pub const SDIO_CMD5_SEND_OP_COND: u32 = cmd(5, resp::R4 | flags::OPEN_DRAIN);
pub const SD_CMD6_SWITCH_FUNC: u32 = cmd(6, resp::R1 | flags::SINGLE_BLOCK);
pub const MMC_CMD6_SWITCH: u32 = cmd(6, resp::R1B);
pub const CMD7_SELECT_CARD: u32 = cmd(7, resp::R1B);
pub const SD_CMD8_SEND_IF_COND: u32 = cmd(8, resp::R7 | flags::OPEN_DRAIN);
pub const MMC_CMD8_SEND_EXT_CSD: u32 = cmd(8, resp::R1 | flags::SINGLE_BLOCK);
pub const CMD9_SEND_CSD: u32 = cmd(9, resp::R2);
pub const CMD12_STOP_TRANSMISSION: u32 = cmd(12, resp::R1B);
pub const CMD13_SEND_STATUS: u32 = cmd(13, resp::R1);
pub const CMD16_SET_BLOCKLEN: u32 = cmd(16, resp::R1);
pub const CMD17_READ_SINGLE_BLOCK: u32 = cmd(17, resp::R1 | flags::SINGLE_BLOCK);
pub const CMD18_READ_MULTIPLE_BLOCK: u32 = cmd(18, resp::R1 | flags::MULTI_BLOCK);
pub const CMD24_WRITE_BLOCK: u32 = cmd(24, resp::R1 | flags::SINGLE_BLOCK | flags::WRITE);
pub const CMD25_WRITE_MULTIPLE_BLOCK: u32 = cmd(25, resp::R1 | flags::MULTI_BLOCK | flags::WRITE);
pub const CMD55_APP_CMD: u32 = cmd(55, resp::R1);

pub const SD_ACMD6_SET_BUS_WIDTH: u32 = cmd(6, resp::R1);
pub const SD_ACMD41_SD_SEND_OP_COND: u32 = cmd(41, resp::R3 | flags::OPEN_DRAIN);
pub const SD_ACMD51_SEND_SCR: u32 = cmd(51, resp::R1 | flags::SINGLE_BLOCK);

pub const SDIO_CMD52_IO_RW_DIRECT: u32 = cmd(52, resp::R5);
pub const SDIO_CMD53_IO_R_BYTE_EXTENDED: u32 = cmd(53, resp::R5 | flags::SDIO_BYTE);
pub const SDIO_CMD53_IO_W_BYTE_EXTENDED: u32 =
    cmd(53, resp::R5 | flags::SDIO_BYTE | flags::WRITE);

// ============================================================================
// OCR (operating conditions register)
// ============================================================================

pub mod ocr {
    pub const VDD_27_28: u32 = 1 << 15;
    pub const VDD_28_29: u32 = 1 << 16;
    pub const VDD_29_30: u32 = 1 << 17;
    pub const VDD_30_31: u32 = 1 << 18;
    pub const VDD_31_32: u32 = 1 << 19;
    pub const VDD_32_33: u32 = 1 << 20;

    /// Voltage window the host supports
    pub const VOLTAGE_SUPPORT: u32 =
        VDD_27_28 | VDD_28_29 | VDD_29_30 | VDD_30_31 | VDD_31_32 | VDD_32_33;

    /// Power-up complete (busy bit, active low while initializing)
    pub const POWER_UP_BUSY: u32 = 1 << 31;
    /// Card capacity status: set for SDHC/SDXC
    pub const CCS: u32 = 1 << 30;
    /// ACMD41 argument: host supports high capacity
    pub const HCS: u32 = 1 << 30;

    /// SDIO: number of I/O functions
    pub const SDIO_NF: u32 = 7 << 28;
    /// SDIO: memory present
    pub const SDIO_MP: u32 = 1 << 27;

    /// MMC access mode field
    pub const ACCESS_MODE_MASK: u32 = 3 << 29;
    pub const ACCESS_MODE_SECTOR: u32 = 2 << 29;
}

// ============================================================================
// Card status (R1)
// ============================================================================

pub mod card_status {
    pub const ADDRESS_OUT_OF_RANGE: u32 = 1 << 31;
    pub const ADDRESS_MISALIGN: u32 = 1 << 30;
    pub const BLOCK_LEN_ERROR: u32 = 1 << 29;
    pub const WP_VIOLATION: u32 = 1 << 26;
    pub const COM_CRC_ERROR: u32 = 1 << 23;
    pub const ILLEGAL_COMMAND: u32 = 1 << 22;
    pub const CARD_ECC_FAILED: u32 = 1 << 21;
    pub const CC_ERROR: u32 = 1 << 20;
    pub const ERROR: u32 = 1 << 19;
    pub const READY_FOR_DATA: u32 = 1 << 8;
    pub const SWITCH_ERROR: u32 = 1 << 7;

    /// Any bit that invalidates a completed read/write
    pub const ERR_RD_WR: u32 = ADDRESS_OUT_OF_RANGE
        | ADDRESS_MISALIGN
        | BLOCK_LEN_ERROR
        | WP_VIOLATION
        | COM_CRC_ERROR
        | ILLEGAL_COMMAND
        | CARD_ECC_FAILED
        | CC_ERROR
        | ERROR;
}

// ============================================================================
// CMD8 (SD interface condition)
// ============================================================================

pub mod if_cond {
    /// Check pattern echoed by the card
    pub const PATTERN: u32 = 0xAA;
    pub const MASK_PATTERN: u32 = 0xFF;
    /// 2.7-3.6 V
    pub const HIGH_VOLTAGE: u32 = 0x100;
    pub const MASK_VOLTAGE: u32 = 0xF00;
}

// ============================================================================
// SD CMD6 (function switch)
// ============================================================================

pub mod sd_switch {
    pub const MODE_SWITCH: u32 = 1 << 31;
    pub const GRP6_NO_INFLUENCE: u32 = 0xF << 20;
    pub const GRP5_NO_INFLUENCE: u32 = 0xF << 16;
    pub const GRP4_NO_INFLUENCE: u32 = 0xF << 12;
    pub const GRP3_NO_INFLUENCE: u32 = 0xF << 8;
    pub const GRP2_DEFAULT: u32 = 0x0 << 4;
    pub const GRP1_HIGH_SPEED: u32 = 0x1;

    /// Switch status block size in bytes (512 bits)
    pub const STATUS_SIZE: usize = 64;
    /// Function group 1 "function not supported" result code
    pub const GRP_RC_ERROR: u8 = 0xF;

    /// Result code assigned to function group 1 (status bits 379:376)
    pub fn grp1_result(status: &[u8]) -> u8 {
        status[16] & 0x0F
    }

    /// Busy flag for the selected group-1 function (status bits 287:272)
    pub fn grp1_busy(status: &[u8], function: u8) -> bool {
        let busy = u16::from_be_bytes([status[28], status[29]]);
        (busy >> function) & 1 != 0
    }
}

// ============================================================================
// MMC CMD6 (EXT_CSD switch)
// ============================================================================

pub mod mmc_switch {
    pub const ACCESS_SET_BITS: u32 = 1 << 24;
    pub const ACCESS_WRITE_BYTE: u32 = 3 << 24;

    pub const INDEX_BUS_WIDTH: u32 = 183 << 16;
    pub const VALUE_BUS_WIDTH_1BIT: u32 = 0 << 8;
    pub const VALUE_BUS_WIDTH_4BIT: u32 = 1 << 8;
    pub const VALUE_BUS_WIDTH_8BIT: u32 = 2 << 8;

    pub const INDEX_HS_TIMING: u32 = 185 << 16;
    pub const VALUE_HS_TIMING_ENABLE: u32 = 1 << 8;
}

// ============================================================================
// EXT_CSD layout
// ============================================================================

pub mod ext_csd {
    pub const SIZE: usize = 512;
    /// Sector count, 4 bytes little-endian
    pub const SEC_COUNT_INDEX: usize = 212;
    /// Card type byte
    pub const CARD_TYPE_INDEX: usize = 196;
    /// High-speed 52 MHz capable
    pub const CTYPE_52MHZ: u8 = 0x02;
}

// ============================================================================
// SDIO CCCR registers & CMD52/CMD53 argument fields
// ============================================================================

pub mod sdio {
    /// Function 0: the common I/O area
    pub const CIA: u8 = 0;

    pub const CCCR_CAP: u32 = 0x08; // card capability
    pub const CCCR_CIS_PTR: u32 = 0x09; // CIS area pointer (3 bytes)
    pub const CCCR_BUS_CTRL: u32 = 0x07; // bus interface control
    pub const CCCR_HS: u32 = 0x13; // high-speed control
    pub const CCCR_IOA: u32 = 0x06; // I/O abort

    pub const CAP_4BLS: u8 = 0x80; // 4-bit support for low-speed cards
    pub const BUSWIDTH_4B: u8 = 0x02;
    pub const SHS: u8 = 0x01; // supports high speed
    pub const EHS: u8 = 0x02; // enable high speed
    /// Reset request written to CCCR_IOA
    pub const IOA_RES: u8 = 0x08;

    pub const CISTPL_END: u8 = 0xFF;
    pub const CISTPL_FUNCE: u8 = 0x22;

    // CMD52 argument fields
    pub const CMD52_WR_DATA: u32 = 0;
    pub const CMD52_REG_ADDR: u32 = 9;
    pub const CMD52_RAW_FLAG: u32 = 27;
    pub const CMD52_FUNCTION_NUM: u32 = 28;
    pub const CMD52_RW_FLAG: u32 = 31;
    pub const CMD52_READ: u8 = 0;
    pub const CMD52_WRITE: u8 = 1;

    // CMD53 argument fields
    pub const CMD53_COUNT: u32 = 0;
    pub const CMD53_REG_ADDR: u32 = 9;
    pub const CMD53_OP_CODE: u32 = 26;
    pub const CMD53_BLOCK_MODE: u32 = 27;
    pub const CMD53_FUNCTION_NUM: u32 = 28;
    pub const CMD53_RW_FLAG: u32 = 31;
    pub const CMD53_READ: u8 = 0;
    pub const CMD53_WRITE: u8 = 1;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_extraction() {
        assert_eq!(cmd_index(CMD18_READ_MULTIPLE_BLOCK), 18);
        assert_eq!(cmd_index(SD_ACMD41_SD_SEND_OP_COND), 41);
        assert_eq!(cmd_index(CMD0_GO_IDLE_STATE), 0);
    }

    #[test]
    fn data_commands_carry_transfer_flags() {
        assert!(CMD25_WRITE_MULTIPLE_BLOCK & flags::WRITE != 0);
        assert!(CMD25_WRITE_MULTIPLE_BLOCK & flags::MULTI_BLOCK != 0);
        assert!(CMD17_READ_SINGLE_BLOCK & flags::WRITE == 0);
        assert!(SDIO_CMD53_IO_R_BYTE_EXTENDED & flags::SDIO_BYTE != 0);
    }
}
