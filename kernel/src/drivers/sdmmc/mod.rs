//! SD/SDIO/MMC host driver
//!
//! Card discovery and identification, OCR/CSD/SCR negotiation, clock and
//! bus-width ramp-up, block and multi-block transfers, SDIO CCCR/CIS access
//! and partition publication under `/dev/disk/`.
//!
//! A dedicated monitor thread owns the card-detect state machine. The device
//! semaphore serializes bus transactions; the instance mutex guards driver
//! state. Block I/O retries up to ten times before surfacing `IoError`.

pub mod cmd;
pub mod controller;
pub mod csd;

use alloc::boxed::Box;
use alloc::format;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use spin::{Mutex, Once};

use crate::config::BLOCK_SIZE;
use crate::hal::{CacheAlignedBuffer, DigitalPin, PinDirection, PinInterruptMode, PinPullMode};
use crate::sync::{ConditionVariable, KSemaphore};
use crate::time::Deadline;
use crate::vfs::partition::decode_disk_partitions;
use crate::vfs::{
    self, devctl, DeviceGeometry, DeviceInode, DeviceOps, ErrorCode, KResult, SdioArgs,
    INVALID_NODE_HANDLE,
};

use cmd::{card_status, ext_csd, if_cond, mmc_switch, ocr, sd_switch, sdio};
use controller::{DataDirection, HostController};
use csd::CardVersion;

const BLOCK_SIZE_LOG2: u32 = BLOCK_SIZE.trailing_zeros();

/// Initialization bus clock: 400 kHz, 1-bit, no high speed
const CLOCK_INIT_HZ: u32 = 400_000;

/// Retry budget for block I/O
const IO_RETRIES: u32 = 10;

/// OCR busy polling deadline
const OCR_TIMEOUT_MS: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardState {
    Initializing,
    NoCard,
    Ready,
    Unusable,
}

/// Card type bit set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CardType(pub u8);

impl CardType {
    pub const NONE: CardType = CardType(0);
    pub const SD: CardType = CardType(1 << 0);
    pub const MMC: CardType = CardType(1 << 1);
    pub const SDIO: CardType = CardType(1 << 2);
    /// High capacity (block addressing)
    pub const HC: CardType = CardType(1 << 3);
    pub const SD_COMBO: CardType = CardType(Self::SD.0 | Self::SDIO.0);

    pub fn contains(self, other: CardType) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: CardType) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: CardType) {
        self.0 |= other.0;
    }
}

#[derive(Debug, Clone)]
pub struct CardInfo {
    pub state: CardState,
    pub card_type: CardType,
    pub version: CardVersion,
    pub rca: u16,
    pub clock: u32,
    pub bus_width: u8,
    pub high_speed: bool,
    pub sector_count: u64,
    pub csd: [u8; 16],
}

impl CardInfo {
    fn new() -> Self {
        Self {
            state: CardState::Initializing,
            card_type: CardType::NONE,
            version: CardVersion::Unknown,
            rca: 0,
            clock: CLOCK_INIT_HZ,
            bus_width: 1,
            high_speed: false,
            sector_count: 0,
            csd: [0; 16],
        }
    }
}

struct Inner {
    controller: Box<dyn HostController>,
    card: CardInfo,
    card_inserted: bool,
    raw_inode: Option<Arc<DeviceInode>>,
    partitions: Vec<Arc<DeviceInode>>,
    /// Scratch for SCR/EXT_CSD/switch-status data phases during init
    scratch: CacheAlignedBuffer,
}

impl Inner {
    fn is_ready(&self) -> bool {
        self.card.state == CardState::Ready
    }

    fn apply_speed_and_bus_width(&mut self) {
        let card = &self.card;
        self.controller
            .apply_speed_and_bus_width(card.clock, card.bus_width, card.high_speed);
    }
}

pub struct SdmmcDriver {
    weak_self: Weak<SdmmcDriver>,
    inner: Mutex<Inner>,
    /// Count-1 semaphore serializing all bus transactions
    device_semaphore: KSemaphore,
    card_detect_condition: ConditionVariable,
    card_state_condition: ConditionVariable,
    pin_cd: DigitalPin,
    device_path_base: String,
}

static DRIVER: Once<Arc<SdmmcDriver>> = Once::new();

/// Bring up the SD/MMC driver as the global block-device instance.
pub fn init(controller: Box<dyn HostController>, pin_cd: DigitalPin) -> KResult<()> {
    let driver = SdmmcDriver::new(
        controller,
        pin_cd,
        String::from(crate::config::SDMMC_DEVICE_PATH),
    );
    driver.start()?;
    DRIVER.call_once(|| driver);
    crate::log!("[sdmmc] driver online");
    Ok(())
}

fn monitor_entry() {
    if let Some(driver) = DRIVER.get() {
        driver.monitor_loop();
    }
}

fn card_detect_irq() -> bool {
    match DRIVER.get() {
        Some(driver) => driver.handle_irq(),
        None => false,
    }
}

impl SdmmcDriver {
    pub fn new(
        controller: Box<dyn HostController>,
        pin_cd: DigitalPin,
        device_path_base: String,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak_self: weak.clone(),
            inner: Mutex::new(Inner {
                controller,
                card: CardInfo::new(),
                card_inserted: false,
                raw_inode: None,
                partitions: Vec::new(),
                scratch: CacheAlignedBuffer::new(BLOCK_SIZE),
            }),
            device_semaphore: KSemaphore::new(1),
            card_detect_condition: ConditionVariable::new(),
            card_state_condition: ConditionVariable::new(),
            pin_cd,
            device_path_base,
        })
    }

    fn ops_arc(&self) -> Arc<dyn DeviceOps> {
        self.weak_self.upgrade().expect("driver alive")
    }

    /// Configure the card-detect pin, publish the raw node and start the
    /// monitor thread.
    pub fn start(self: &Arc<Self>) -> KResult<()> {
        self.pin_cd.set_direction(PinDirection::In);
        self.pin_cd.set_pull_mode(PinPullMode::Up);
        self.pin_cd.set_interrupt_mode(PinInterruptMode::BothEdges);
        self.pin_cd.enable_interrupts();

        let raw = DeviceInode::new(self.ops_arc());
        vfs::register_device(&format!("{}raw", self.device_path_base), raw.clone())?;
        self.inner.lock().raw_inode = Some(raw);

        crate::hal::register_irq_handler(self.pin_cd.peripheral_irq(), card_detect_irq);
        crate::scheduler::spawn("sdmmc_monitor", monitor_entry);
        Ok(())
    }

    pub fn card_state(&self) -> CardState {
        self.inner.lock().card.state
    }

    pub fn card_info(&self) -> CardInfo {
        self.inner.lock().card.clone()
    }

    /// Card-detect pin edge. Wakes the monitor thread.
    pub fn handle_irq(&self) -> bool {
        if self.pin_cd.get_and_clear_interrupt_status() {
            self.card_detect_condition.wakeup();
            true
        } else {
            false
        }
    }

    // ========================================================================
    // Monitor thread
    // ========================================================================

    pub fn monitor_loop(&self) -> ! {
        self.inner.lock().card.state = CardState::NoCard;
        loop {
            self.poll_card_once();
        }
    }

    /// One pass of the card-detect state machine. Blocks on the detect
    /// condition while nothing changes.
    fn poll_card_once(&self) {
        let has_card = !self.pin_cd.read(); // active low
        {
            let inner = self.inner.lock();
            if has_card == inner.card_inserted
                && (!inner.card_inserted || inner.card.state == CardState::Ready)
            {
                drop(inner);
                self.card_detect_condition.wait_timeout(1000);
            }
        }

        crate::scheduler::sleep_ms(100); // de-bounce
        let has_card = !self.pin_cd.read();

        let needs_restart = {
            let inner = self.inner.lock();
            has_card != inner.card_inserted || inner.card.state != CardState::Ready
        };
        if !needs_restart {
            return;
        }

        let state = {
            let mut inner = self.inner.lock();
            inner.card_inserted = has_card;
            inner.card.state = CardState::NoCard;
            self.restart_card(&mut inner);
            inner.card.state
        };

        match state {
            CardState::NoCard => {
                let _ = self.decode_partitions(true);
            }
            CardState::Ready => {
                let size = self.inner.lock().card.sector_count * BLOCK_SIZE as u64;
                crate::log!("[sdmmc] card ready: {} bytes", size);
                let _ = self.decode_partitions(true);
                self.probe_filesystem();
            }
            CardState::Initializing => {
                crate::log_error!("[sdmmc] restart_card() failed");
            }
            CardState::Unusable => {
                crate::log_error!("[sdmmc] card initialization failed");
                crate::scheduler::sleep_ms(500);
            }
        }
    }

    /// Mount the first partition read-only and log the volume root, so an
    /// inserted card is immediately inspectable from the console.
    fn probe_filesystem(&self) {
        let path = format!("{}0", self.device_path_base);
        let Ok(file) = vfs::open(&path) else { return };
        match vfs::fat::FatVolume::mount(file) {
            Ok(volume) => match volume.root_entries() {
                Ok(entries) => {
                    for entry in entries.iter().take(16) {
                        crate::log!(
                            "[sdmmc]   {} {:>9} {}",
                            if entry.is_dir { "<dir> " } else { "      " },
                            entry.size,
                            entry.name
                        );
                    }
                }
                Err(error) => crate::log_warn!("[sdmmc] root listing failed: {:?}", error),
            },
            Err(error) => {
                crate::log_debug!("[sdmmc] no mountable FAT volume on {}: {:?}", path, error)
            }
        }
    }

    fn set_state(&self, inner: &mut Inner, state: CardState) {
        if inner.card.state != state {
            inner.card.state = state;
            self.card_state_condition.wakeup();
        }
    }

    fn restart_card(&self, inner: &mut Inner) -> bool {
        if inner.card.state == CardState::Initializing {
            return true;
        }
        if inner.card_inserted {
            inner.card.state = CardState::Initializing;
            // 1-bit bus and init clock for the identification phase
            inner.card.clock = CLOCK_INIT_HZ;
            inner.card.bus_width = 1;
            inner.card.high_speed = false;

            inner.controller.reset();
            inner.apply_speed_and_bus_width();

            if self.initialize_card(inner) {
                self.set_state(inner, CardState::Ready);
                return true;
            }
            self.set_state(inner, CardState::Unusable);
        } else {
            self.set_state(inner, CardState::NoCard);
        }
        false
    }

    // ========================================================================
    // Initialization ladder
    // ========================================================================

    /// Run identification and bring the card to transfer state with maximum
    /// bus width and clock.
    fn initialize_card(&self, inner: &mut Inner) -> bool {
        inner.card.card_type = CardType::SD;
        inner.card.version = CardVersion::Unknown;
        inner.card.rca = 0;

        crate::log!("[sdmmc] starting SD card install");

        // 74 idle clocks, then reset any SDIO function state
        inner.controller.send_clock();
        let mut reset = sdio::IOA_RES;
        self.cmd52(inner, sdio::CMD52_WRITE, sdio::CIA, sdio::CCCR_IOA, 0, &mut reset);

        if !inner.controller.send_cmd(cmd::CMD0_GO_IDLE_STATE, 0) {
            return false;
        }
        let v2 = match self.cmd8_sd(inner) {
            Some(v2) => v2,
            None => return false, // unusable card
        };
        if !self.operational_condition_sdio(inner) {
            return false;
        }

        if inner.card.card_type.contains(CardType::SD)
            && !self.operational_condition_sd(inner, v2)
        {
            // Not an SD memory card; retry the whole install as MMC.
            crate::log!("[sdmmc] starting MMC install");
            inner.card.card_type = CardType::MMC;
            return self.initialize_mmc(inner);
        }

        if inner.card.card_type.contains(CardType::SD)
            && !inner.controller.send_cmd(cmd::CMD2_ALL_SEND_CID, 0)
        {
            return false;
        }
        if !inner.controller.send_cmd(cmd::SD_CMD3_SEND_RELATIVE_ADDR, 0) {
            return false;
        }
        inner.card.rca = (inner.controller.response() >> 16) as u16;

        if inner.card.card_type.contains(CardType::SD) {
            if !self.cmd9(inner) {
                return false;
            }
            inner.card.clock = csd::decode_clock(&inner.card.csd, false);
            inner.card.sector_count = csd::decode_sd_capacity(&inner.card.csd);
        }
        let rca_arg = (inner.card.rca as u32) << 16;
        if !inner.controller.send_cmd(cmd::CMD7_SELECT_CARD, rca_arg) {
            return false;
        }
        if inner.card.card_type.contains(CardType::SD) && !self.acmd51_sd(inner) {
            return false;
        }
        if inner.card.card_type.contains(CardType::SDIO) && !self.get_max_speed_sdio(inner) {
            return false;
        }
        // 4-bit bus
        if inner.card.card_type.contains(CardType::SDIO) && !self.set_bus_width_sdio(inner) {
            return false;
        }
        if inner.card.card_type.contains(CardType::SD) && !self.acmd6_sd(inner) {
            return false;
        }
        inner.apply_speed_and_bus_width();
        // High speed
        if inner.card.card_type.contains(CardType::SDIO) && !self.set_high_speed_sdio(inner) {
            return false;
        }
        if inner.card.card_type.contains(CardType::SD)
            && inner.card.version > CardVersion::Sd1_0
            && !self.set_high_speed_sd(inner)
        {
            return false;
        }
        inner.apply_speed_and_bus_width();

        if inner.card.card_type.contains(CardType::SD)
            && !inner
                .controller
                .send_cmd(cmd::CMD16_SET_BLOCKLEN, BLOCK_SIZE as u32)
        {
            return false;
        }
        true
    }

    fn initialize_mmc(&self, inner: &mut Inner) -> bool {
        if !inner.controller.send_cmd(cmd::CMD0_GO_IDLE_STATE, 0) {
            return false;
        }
        if !self.operational_condition_mmc(inner) {
            return false;
        }
        if !inner.controller.send_cmd(cmd::CMD2_ALL_SEND_CID, 0) {
            return false;
        }
        inner.card.rca = 1;
        let rca_arg = (inner.card.rca as u32) << 16;
        if !inner.controller.send_cmd(cmd::MMC_CMD3_SET_RELATIVE_ADDR, rca_arg) {
            return false;
        }
        if !self.cmd9(inner) {
            return false;
        }
        inner.card.version = csd::decode_mmc_version(&inner.card.csd);
        inner.card.clock = csd::decode_clock(&inner.card.csd, true);
        if csd::mmc_c_size(&inner.card.csd) != 0xFFF {
            inner.card.sector_count = csd::decode_mmc_capacity(&inner.card.csd);
        }
        if !inner.controller.send_cmd(cmd::CMD7_SELECT_CARD, rca_arg) {
            return false;
        }

        if inner.card.version >= CardVersion::Mmc4 {
            let mut authorize_high_speed = false;
            if !self.cmd8_mmc(inner, &mut authorize_high_speed) {
                return false;
            }
            if !self.set_bus_width_mmc(inner, 4) {
                return false;
            }
            inner.apply_speed_and_bus_width();

            if authorize_high_speed {
                if !self.set_high_speed_mmc(inner) {
                    return false;
                }
                inner.apply_speed_and_bus_width();
            }
        } else {
            inner.apply_speed_and_bus_width();
        }

        // Some cards are not ready right after the high-speed switch busy
        // phase; retrying CMD16 rides it out.
        for _ in 0..IO_RETRIES {
            if inner
                .controller
                .send_cmd(cmd::CMD16_SET_BLOCKLEN, BLOCK_SIZE as u32)
            {
                return true;
            }
        }
        false
    }

    /// CMD8: interface condition. `Some(v2)` on success, `None` for a card
    /// that answered with a bad pattern (unusable).
    fn cmd8_sd(&self, inner: &mut Inner) -> Option<bool> {
        if !inner.controller.send_cmd(
            cmd::SD_CMD8_SEND_IF_COND,
            if_cond::PATTERN | if_cond::HIGH_VOLTAGE,
        ) {
            return Some(false); // no response: not a v2 card
        }
        let response = inner.controller.response();
        if response == 0xFFFF_FFFF {
            return Some(false); // non-compliant R7
        }
        if response & (if_cond::MASK_PATTERN | if_cond::MASK_VOLTAGE)
            != (if_cond::PATTERN | if_cond::HIGH_VOLTAGE)
        {
            crate::log_error!("[sdmmc] CMD8 bad pattern {:#010x}, unusable card", response);
            return None;
        }
        crate::log!("[sdmmc] SD card v2");
        Some(true)
    }

    /// ACMD41 loop: publish the host voltage window, poll OCR busy.
    fn operational_condition_sd(&self, inner: &mut Inner, v2: bool) -> bool {
        let deadline = Deadline::after_ms(OCR_TIMEOUT_MS);
        loop {
            if !inner.controller.send_cmd(cmd::CMD55_APP_CMD, 0) {
                crate::log_error!("[sdmmc] CMD55 failed");
                return false;
            }
            let mut arg = ocr::VOLTAGE_SUPPORT;
            if v2 {
                arg |= ocr::HCS;
            }
            if !inner.controller.send_cmd(cmd::SD_ACMD41_SD_SEND_OP_COND, arg) {
                crate::log_error!("[sdmmc] ACMD41 failed");
                return false;
            }
            let response = inner.controller.response();
            if response & ocr::POWER_UP_BUSY != 0 {
                if response & ocr::CCS != 0 {
                    inner.card.card_type.insert(CardType::HC);
                }
                return true;
            }
            if deadline.expired() {
                crate::log_error!("[sdmmc] ACMD41 timeout ({:#010x})", response);
                return false;
            }
            crate::scheduler::yield_now();
        }
    }

    /// CMD1 loop for MMC, requesting sector access mode.
    fn operational_condition_mmc(&self, inner: &mut Inner) -> bool {
        let deadline = Deadline::after_ms(OCR_TIMEOUT_MS);
        loop {
            if !inner.controller.send_cmd(
                cmd::MMC_CMD1_SEND_OP_COND,
                ocr::VOLTAGE_SUPPORT | ocr::ACCESS_MODE_SECTOR,
            ) {
                crate::log_error!("[sdmmc] CMD1 failed");
                return false;
            }
            let response = inner.controller.response();
            if response & ocr::POWER_UP_BUSY != 0 {
                if response & ocr::ACCESS_MODE_MASK == ocr::ACCESS_MODE_SECTOR {
                    inner.card.card_type.insert(CardType::HC);
                }
                return true;
            }
            if deadline.expired() {
                crate::log_error!("[sdmmc] CMD1 timeout ({:#010x})", response);
                return false;
            }
            crate::scheduler::yield_now();
        }
    }

    /// CMD5 probe: detect an SDIO function block and wait for its power-up.
    fn operational_condition_sdio(&self, inner: &mut Inner) -> bool {
        if !inner.controller.send_cmd(cmd::SDIO_CMD5_SEND_OP_COND, 0) {
            return true; // no error, card type just isn't SDIO
        }
        let mut response = inner.controller.response();
        if response & ocr::SDIO_NF == 0 {
            return true;
        }

        let deadline = Deadline::after_ms(OCR_TIMEOUT_MS);
        loop {
            if !inner
                .controller
                .send_cmd(cmd::SDIO_CMD5_SEND_OP_COND, response & ocr::VOLTAGE_SUPPORT)
            {
                crate::log_error!("[sdmmc] CMD5 failed");
                return false;
            }
            response = inner.controller.response();
            if response & ocr::POWER_UP_BUSY != 0 {
                break;
            }
            if deadline.expired() {
                crate::log_error!("[sdmmc] CMD5 timeout ({:#010x})", response);
                return false;
            }
            crate::scheduler::yield_now();
        }
        inner.card.card_type = if response & ocr::SDIO_MP != 0 {
            CardType::SD_COMBO
        } else {
            CardType::SDIO
        };
        true
    }

    /// CMD9: fetch the CSD.
    fn cmd9(&self, inner: &mut Inner) -> bool {
        let rca_arg = (inner.card.rca as u32) << 16;
        if !inner.controller.send_cmd(cmd::CMD9_SEND_CSD, rca_arg) {
            return false;
        }
        inner.card.csd = inner.controller.response128();
        true
    }

    /// CMD13 until the card reports ready-for-data.
    fn cmd13(&self, inner: &mut Inner) -> bool {
        let rca_arg = (inner.card.rca as u32) << 16;
        let deadline = Deadline::after_ms(OCR_TIMEOUT_MS);
        loop {
            if !inner.controller.send_cmd(cmd::CMD13_SEND_STATUS, rca_arg) {
                return false;
            }
            if inner.controller.response() & card_status::READY_FOR_DATA != 0 {
                return true;
            }
            if deadline.expired() {
                crate::log_error!("[sdmmc] CMD13 timeout");
                return false;
            }
            crate::scheduler::yield_now();
        }
    }

    /// ACMD51: read the SCR to learn the SD spec version.
    fn acmd51_sd(&self, inner: &mut Inner) -> bool {
        const SCR_SIZE: usize = 8;
        let rca_arg = (inner.card.rca as u32) << 16;
        let mut retries = 0;
        loop {
            if !inner.controller.send_cmd(cmd::CMD55_APP_CMD, rca_arg) {
                return false;
            }
            let Inner { controller, scratch, .. } = &mut *inner;
            let mut segments = [&mut scratch[..SCR_SIZE]];
            if controller.start_data_cmd(
                cmd::SD_ACMD51_SEND_SCR,
                0,
                SCR_SIZE.trailing_zeros(),
                1,
                DataDirection::Read(&mut segments),
            ) {
                break;
            }
            retries += 1;
            if retries > 5 {
                return false;
            }
        }
        inner.card.version = csd::decode_scr_version(&inner.scratch[..SCR_SIZE]);
        true
    }

    /// ACMD6: switch the SD bus to 4 bits.
    fn acmd6_sd(&self, inner: &mut Inner) -> bool {
        let rca_arg = (inner.card.rca as u32) << 16;
        if !inner.controller.send_cmd(cmd::CMD55_APP_CMD, rca_arg) {
            return false;
        }
        if !inner.controller.send_cmd(cmd::SD_ACMD6_SET_BUS_WIDTH, 0x2) {
            return false;
        }
        inner.card.bus_width = 4;
        crate::log!("[sdmmc] 4-bit bus width enabled");
        true
    }

    /// CMD6 mode switch to high speed; validates the returned switch status.
    fn set_high_speed_sd(&self, inner: &mut Inner) -> bool {
        let Inner { controller, scratch, .. } = &mut *inner;
        let status_len = sd_switch::STATUS_SIZE;
        let mut segments = [&mut scratch[..status_len]];
        if !controller.start_data_cmd(
            cmd::SD_CMD6_SWITCH_FUNC,
            sd_switch::MODE_SWITCH
                | sd_switch::GRP6_NO_INFLUENCE
                | sd_switch::GRP5_NO_INFLUENCE
                | sd_switch::GRP4_NO_INFLUENCE
                | sd_switch::GRP3_NO_INFLUENCE
                | sd_switch::GRP2_DEFAULT
                | sd_switch::GRP1_HIGH_SPEED,
            status_len.trailing_zeros(),
            1,
            DataDirection::Read(&mut segments),
        ) {
            return false;
        }
        if inner.controller.response() & card_status::SWITCH_ERROR != 0 {
            crate::log_error!("[sdmmc] CMD6 switch error");
            return false;
        }
        let status = &inner.scratch[..status_len];
        if sd_switch::grp1_result(status) == sd_switch::GRP_RC_ERROR {
            return true; // high speed unsupported, not a protocol error
        }
        if sd_switch::grp1_busy(status, 1) {
            crate::log_error!("[sdmmc] CMD6 function group 1 busy");
            return false;
        }
        // The switch takes effect within 8 clocks of the status end bit.
        inner.controller.send_clock();
        inner.card.high_speed = true;
        inner.card.clock *= 2;
        true
    }

    /// CMD8 (MMC): read EXT_CSD; learns 52 MHz capability and, for
    /// high-capacity cards, the sector count.
    fn cmd8_mmc(&self, inner: &mut Inner, authorize_high_speed: &mut bool) -> bool {
        let Inner { controller, scratch, .. } = &mut *inner;
        let mut segments = [&mut scratch[..BLOCK_SIZE]];
        if !controller.start_data_cmd(
            cmd::MMC_CMD8_SEND_EXT_CSD,
            0,
            BLOCK_SIZE_LOG2,
            1,
            DataDirection::Read(&mut segments),
        ) {
            return false;
        }
        let ext = &inner.scratch[..ext_csd::SIZE];
        *authorize_high_speed = ext[ext_csd::CARD_TYPE_INDEX] & ext_csd::CTYPE_52MHZ != 0;
        if csd::mmc_c_size(&inner.card.csd) == 0xFFF {
            inner.card.sector_count = u32::from_le_bytes(
                ext[ext_csd::SEC_COUNT_INDEX..ext_csd::SEC_COUNT_INDEX + 4]
                    .try_into()
                    .unwrap(),
            ) as u64;
        }
        true
    }

    fn set_bus_width_mmc(&self, inner: &mut Inner, bus_width: u8) -> bool {
        let arg = mmc_switch::ACCESS_SET_BITS
            | mmc_switch::INDEX_BUS_WIDTH
            | match bus_width {
                8 => mmc_switch::VALUE_BUS_WIDTH_8BIT,
                4 => mmc_switch::VALUE_BUS_WIDTH_4BIT,
                _ => mmc_switch::VALUE_BUS_WIDTH_1BIT,
            };
        if !inner.controller.send_cmd(cmd::MMC_CMD6_SWITCH, arg) {
            return false;
        }
        if inner.controller.response() & card_status::SWITCH_ERROR != 0 {
            crate::log_error!("[sdmmc] MMC CMD6 bus-width switch error");
            return false;
        }
        inner.card.bus_width = bus_width;
        crate::log!("[sdmmc] {}-bit bus width enabled", bus_width);
        true
    }

    fn set_high_speed_mmc(&self, inner: &mut Inner) -> bool {
        if !inner.controller.send_cmd(
            cmd::MMC_CMD6_SWITCH,
            mmc_switch::ACCESS_WRITE_BYTE
                | mmc_switch::INDEX_HS_TIMING
                | mmc_switch::VALUE_HS_TIMING_ENABLE,
        ) {
            return false;
        }
        if inner.controller.response() & card_status::SWITCH_ERROR != 0 {
            crate::log_error!("[sdmmc] MMC CMD6 HS_TIMING switch error");
            return false;
        }
        inner.card.high_speed = true;
        inner.card.clock = 52_000_000;
        true
    }

    // ========================================================================
    // SDIO
    // ========================================================================

    /// CMD52: one-byte register exchange. `data` carries the write value in
    /// and the response byte out.
    fn cmd52(
        &self,
        inner: &mut Inner,
        rw: u8,
        function: u8,
        register_addr: u32,
        read_after_write: u8,
        data: &mut u8,
    ) -> bool {
        let arg = ((*data as u32) << sdio::CMD52_WR_DATA)
            | ((rw as u32) << sdio::CMD52_RW_FLAG)
            | ((function as u32) << sdio::CMD52_FUNCTION_NUM)
            | ((read_after_write as u32) << sdio::CMD52_RAW_FLAG)
            | (register_addr << sdio::CMD52_REG_ADDR);
        if !inner.controller.send_cmd(cmd::SDIO_CMD52_IO_RW_DIRECT, arg) {
            return false;
        }
        *data = (inner.controller.response() & 0xFF) as u8;
        true
    }

    /// CMD53 multi-byte transfer, 1..=512 bytes.
    fn cmd53_read(
        &self,
        inner: &mut Inner,
        function: u8,
        register_addr: u32,
        increment_addr: u8,
        buffer: &mut [u8],
    ) -> bool {
        let size = buffer.len();
        if size == 0 || size > BLOCK_SIZE {
            crate::log_error!("[sdmmc] CMD53 invalid size {}", size);
            return false;
        }
        let arg = cmd53_arg(sdio::CMD53_READ, function, register_addr, increment_addr, size);
        let mut segments = [buffer];
        inner.controller.start_data_cmd(
            cmd::SDIO_CMD53_IO_R_BYTE_EXTENDED,
            arg,
            0,
            size as u32,
            DataDirection::Read(&mut segments),
        )
    }

    fn cmd53_write(
        &self,
        inner: &mut Inner,
        function: u8,
        register_addr: u32,
        increment_addr: u8,
        buffer: &[u8],
    ) -> bool {
        let size = buffer.len();
        if size == 0 || size > BLOCK_SIZE {
            crate::log_error!("[sdmmc] CMD53 invalid size {}", size);
            return false;
        }
        let arg = cmd53_arg(sdio::CMD53_WRITE, function, register_addr, increment_addr, size);
        let segments = [buffer];
        inner.controller.start_data_cmd(
            cmd::SDIO_CMD53_IO_W_BYTE_EXTENDED,
            arg,
            0,
            size as u32,
            DataDirection::Write(&segments),
        )
    }

    /// Walk the CIS to the function-0 FUNCE tuple and decode the maximum
    /// transfer speed.
    fn get_max_speed_sdio(&self, inner: &mut Inner) -> bool {
        // CIS pointer out of the CCCR
        let mut cis_addr_bytes = [0u8; 4];
        let mut addr = sdio::CCCR_CIS_PTR;
        for byte in cis_addr_bytes.iter_mut().take(3) {
            self.cmd52(inner, sdio::CMD52_READ, sdio::CIA, addr, 0, byte);
            addr += 1;
        }
        let cis_start = u32::from_le_bytes(cis_addr_bytes);

        let mut tuple_addr = cis_start;
        let mut header = [0u8; 3];
        loop {
            for (i, byte) in header.iter_mut().enumerate() {
                let mut value = 0;
                self.cmd52(inner, sdio::CMD52_READ, sdio::CIA, tuple_addr + i as u32, 0, &mut value);
                *byte = value;
            }
            if header[0] == sdio::CISTPL_END {
                return false; // tuple chain ended without FUNCE
            }
            if header[0] == sdio::CISTPL_FUNCE && header[2] == 0x00 {
                break; // function-0 extension tuple
            }
            if header[1] == 0 {
                return false;
            }
            tuple_addr += 2 + header[1] as u32;
            if tuple_addr > cis_start + 256 {
                return false; // off the end of the CIS area
            }
        }

        // TPLFE_MAX_TRAN_SPEED is the fourth byte of the tuple body.
        let mut speed = 0;
        self.cmd52(inner, sdio::CMD52_READ, sdio::CIA, tuple_addr + 5, 0, &mut speed);
        inner.card.clock = csd::decode_sdio_clock(speed);
        true
    }

    /// Enable the 4-bit bus through the CCCR when the card is capable.
    fn set_bus_width_sdio(&self, inner: &mut Inner) -> bool {
        let mut value = 0;
        if !self.cmd52(inner, sdio::CMD52_READ, sdio::CIA, sdio::CCCR_CAP, 0, &mut value) {
            return false;
        }
        if value & sdio::CAP_4BLS != sdio::CAP_4BLS {
            return true; // 1-bit only, not a protocol error
        }
        let mut value = sdio::BUSWIDTH_4B;
        if !self.cmd52(inner, sdio::CMD52_WRITE, sdio::CIA, sdio::CCCR_BUS_CTRL, 1, &mut value) {
            return false;
        }
        inner.card.bus_width = 4;
        crate::log!("[sdmmc] 4-bit bus width enabled");
        true
    }

    /// Enable SDIO high-speed timing through the CCCR.
    fn set_high_speed_sdio(&self, inner: &mut Inner) -> bool {
        let mut value = 0;
        if !self.cmd52(inner, sdio::CMD52_READ, sdio::CIA, sdio::CCCR_HS, 0, &mut value) {
            return false;
        }
        if value & sdio::SHS != sdio::SHS {
            return true; // not supported, not a protocol error
        }
        let mut value = sdio::EHS;
        if !self.cmd52(inner, sdio::CMD52_WRITE, sdio::CIA, sdio::CCCR_HS, 1, &mut value) {
            return false;
        }
        inner.card.high_speed = true;
        inner.card.clock *= 2;
        true
    }

    // ========================================================================
    // Block I/O
    // ========================================================================

    fn io_prologue(
        &self,
        inode: Option<&Arc<DeviceInode>>,
        total_len: usize,
        position: u64,
    ) -> KResult<Option<(u64, usize)>> {
        let mut length = total_len;
        let mut position = position;
        if let Some(inode) = inode {
            let span = inode.span.lock();
            if position + length as u64 > span.size {
                if position >= span.size {
                    return Ok(None); // at or past the end
                }
                length = (span.size - position) as usize;
            }
            position += span.start;
        }
        if position % BLOCK_SIZE as u64 != 0 || length % BLOCK_SIZE != 0 {
            return Err(ErrorCode::InvalidArg);
        }
        Ok(Some((position, length)))
    }

    /// Standard-capacity cards take byte addresses, high-capacity cards take
    /// block addresses.
    fn start_argument(card_type: CardType, first_block: u32) -> u32 {
        if card_type.contains(CardType::HC) {
            first_block
        } else {
            first_block * BLOCK_SIZE as u32
        }
    }

    fn read_blocks(
        &self,
        segments: &mut [&mut [u8]],
        position: u64,
        length: usize,
    ) -> KResult<usize> {
        let first_block = (position / BLOCK_SIZE as u64) as u32;
        let block_count = (length / BLOCK_SIZE) as u32;
        if block_count == 0 {
            return Ok(0);
        }

        for _retry in 0..IO_RETRIES {
            let _bus = self.device_semaphore.acquire();
            let mut inner = self.inner.lock();

            if !inner.is_ready() {
                return Err(ErrorCode::NoDevice);
            }
            if !self.cmd13(&mut inner) {
                continue;
            }

            let command = if block_count > 1 {
                cmd::CMD18_READ_MULTIPLE_BLOCK
            } else {
                cmd::CMD17_READ_SINGLE_BLOCK
            };
            let start = Self::start_argument(inner.card.card_type, first_block);

            if !inner.controller.start_data_cmd(
                command,
                start,
                BLOCK_SIZE_LOG2,
                block_count,
                DataDirection::Read(&mut *segments),
            ) {
                continue;
            }
            let response = inner.controller.response();
            if response & card_status::ERR_RD_WR != 0 {
                crate::log_error!(
                    "[sdmmc] read cmd{} response {:#010x} error bits",
                    cmd::cmd_index(command),
                    response
                );
                continue;
            }
            // Non-compliant cards sometimes fail the first CMD12; one silent
            // retry is tolerated on reads.
            if block_count > 1
                && !inner.controller.stop_data_cmd(cmd::CMD12_STOP_TRANSMISSION, 0)
            {
                inner.controller.stop_data_cmd(cmd::CMD12_STOP_TRANSMISSION, 0);
            }
            return Ok(length);
        }
        Err(ErrorCode::IoError)
    }

    fn write_blocks(&self, segments: &[&[u8]], position: u64, length: usize) -> KResult<usize> {
        let first_block = (position / BLOCK_SIZE as u64) as u32;
        let block_count = (length / BLOCK_SIZE) as u32;
        if block_count == 0 {
            return Ok(0);
        }

        for _retry in 0..IO_RETRIES {
            let _bus = self.device_semaphore.acquire();
            let mut inner = self.inner.lock();

            if !inner.is_ready() {
                return Err(ErrorCode::NoDevice);
            }

            let command = if block_count > 1 {
                cmd::CMD25_WRITE_MULTIPLE_BLOCK
            } else {
                cmd::CMD24_WRITE_BLOCK
            };
            let start = Self::start_argument(inner.card.card_type, first_block);

            if !inner.controller.start_data_cmd(
                command,
                start,
                BLOCK_SIZE_LOG2,
                block_count,
                DataDirection::Write(segments),
            ) {
                continue;
            }
            let response = inner.controller.response();
            if response & card_status::ERR_RD_WR != 0 {
                crate::log_error!(
                    "[sdmmc] write cmd{} response {:#010x} error bits",
                    cmd::cmd_index(command),
                    response
                );
                continue;
            }
            if block_count > 1
                && !inner.controller.stop_data_cmd(cmd::CMD12_STOP_TRANSMISSION, 0)
            {
                continue;
            }
            return Ok(length);
        }
        Err(ErrorCode::IoError)
    }

    // ========================================================================
    // Partition table
    // ========================================================================

    /// Re-decode the partition table and reconcile the published `/dev`
    /// nodes. With `force` false, an open partition that disappeared from
    /// the new table fails the whole operation with `Busy`. An unreadable
    /// table is not an error: the published nodes stay as they are.
    pub fn decode_partitions(&self, force: bool) -> KResult<()> {
        let geometry = {
            let inner = self.inner.lock();
            let geometry = DeviceGeometry {
                bytes_per_sector: BLOCK_SIZE as u32,
                sector_count: inner.card.sector_count,
                read_only: false,
                removable: true,
            };
            if let Some(raw) = &inner.raw_inode {
                raw.span.lock().size = inner.card.sector_count * BLOCK_SIZE as u64;
            }
            geometry
        };

        crate::log!("[sdmmc] decoding partition table");

        let mut table_buf = CacheAlignedBuffer::new(BLOCK_SIZE);
        let decoded = decode_disk_partitions(&mut table_buf, &geometry, &mut |offset, out| {
            let len = out.len();
            let mut segments = [out];
            match self.read_blocks(&mut segments, offset, len) {
                Ok(n) if n == len => Ok(()),
                Ok(_) => Err(ErrorCode::IoError),
                Err(e) => Err(e),
            }
        })?;
        let Some(decoded) = decoded else {
            // Unreadable table: reconciliation is skipped, the published
            // nodes stay as they are.
            crate::log_warn!("[sdmmc] keeping current partition nodes");
            return Ok(());
        };

        for (i, p) in decoded.iter().enumerate() {
            crate::log!(
                "[sdmmc]   partition {}: {:>10} -> {:>10} {:02x} ({})",
                i,
                p.start,
                p.start + p.size - 1,
                p.part_type,
                p.size
            );
        }

        let mut inner = self.inner.lock();

        // An open partition missing from the new table blocks the re-read.
        for node in &inner.partitions {
            let span = *node.span.lock();
            let found = decoded
                .iter()
                .any(|d| d.start == span.start && d.size == span.size);
            if !force && !found && node.open_count() > 0 {
                crate::log_error!("[sdmmc] open partition has changed");
                return Err(ErrorCode::Busy);
            }
        }

        // Refresh matching nodes in place; unpublish the rest. Nodes still
        // held open are kept for reassignment to a new entry.
        let mut consumed = alloc::vec![false; decoded.len()];
        let mut recycled: Vec<Arc<DeviceInode>> = Vec::new();
        let mut kept: Vec<Arc<DeviceInode>> = Vec::new();
        for node in core::mem::take(&mut inner.partitions) {
            let span = *node.span.lock();
            let matched = decoded
                .iter()
                .enumerate()
                .find(|(i, d)| !consumed[*i] && d.start == span.start && d.size == span.size)
                .map(|(i, d)| (i, *d));
            match matched {
                Some((i, desc)) => {
                    consumed[i] = true;
                    node.span.lock().partition_type = desc.part_type;
                    kept.push(node);
                }
                None => {
                    let handle = node.node_handle();
                    if handle != INVALID_NODE_HANDLE {
                        let _ = vfs::remove_device(handle);
                    }
                    if node.open_count() > 0 {
                        recycled.push(node);
                    }
                }
            }
        }

        // New entries take a recycled inode when one is available.
        for (i, desc) in decoded.iter().enumerate() {
            if consumed[i] {
                continue;
            }
            let node = recycled
                .pop()
                .unwrap_or_else(|| DeviceInode::new(self.ops_arc()));
            {
                let mut span = node.span.lock();
                span.start = desc.start;
                span.size = desc.size;
                span.partition_type = desc.part_type;
            }
            kept.push(node);
        }

        kept.sort_by_key(|node| node.span.lock().start);
        inner.partitions = kept;

        // Nodes may have moved in the table and therefore changed names. A
        // first pass gives every published node a unique temporary name so
        // the final pass cannot collide.
        for (i, node) in inner.partitions.iter().enumerate() {
            if node.node_handle() != INVALID_NODE_HANDLE {
                let path = format!("{}{}_new", self.device_path_base, i);
                let _ = vfs::rename_device(node.node_handle(), &path);
            }
        }
        for (i, node) in inner.partitions.iter().enumerate() {
            let path = format!("{}{}", self.device_path_base, i);
            if node.node_handle() != INVALID_NODE_HANDLE {
                let _ = vfs::rename_device(node.node_handle(), &path);
            } else {
                let _ = vfs::register_device(&path, node.clone());
            }
        }
        Ok(())
    }
}

fn cmd53_arg(rw: u8, function: u8, register_addr: u32, increment_addr: u8, size: usize) -> u32 {
    (((size % BLOCK_SIZE) as u32) << sdio::CMD53_COUNT)
        | (register_addr << sdio::CMD53_REG_ADDR)
        | ((increment_addr as u32) << sdio::CMD53_OP_CODE)
        | (0u32 << sdio::CMD53_BLOCK_MODE)
        | ((function as u32) << sdio::CMD53_FUNCTION_NUM)
        | ((rw as u32) << sdio::CMD53_RW_FLAG)
}

// ============================================================================
// VFS integration
// ============================================================================

impl DeviceOps for SdmmcDriver {
    fn open(&self, _inode: &Arc<DeviceInode>) -> KResult<()> {
        let inner = self.inner.lock();
        if !inner.is_ready() {
            return Err(ErrorCode::NoDevice);
        }
        Ok(())
    }

    fn read_at(
        &self,
        inode: Option<&Arc<DeviceInode>>,
        segments: &mut [&mut [u8]],
        position: u64,
    ) -> KResult<usize> {
        let total: usize = segments.iter().map(|s| s.len()).sum();
        match self.io_prologue(inode, total, position)? {
            Some((position, length)) => self.read_blocks(segments, position, length),
            None => Ok(0),
        }
    }

    fn write_at(
        &self,
        inode: Option<&Arc<DeviceInode>>,
        segments: &[&[u8]],
        position: u64,
    ) -> KResult<usize> {
        let total: usize = segments.iter().map(|s| s.len()).sum();
        match self.io_prologue(inode, total, position)? {
            Some((position, length)) => self.write_blocks(segments, position, length),
            None => Ok(0),
        }
    }

    fn device_control(&self, request: u32, in_data: &[u8], out_data: &mut [u8]) -> KResult<()> {
        match request {
            devctl::GET_DEVICE_GEOMETRY => {
                let inner = self.inner.lock();
                if !inner.is_ready() {
                    return Err(ErrorCode::NoDevice);
                }
                DeviceGeometry {
                    bytes_per_sector: BLOCK_SIZE as u32,
                    sector_count: inner.card.sector_count,
                    read_only: false,
                    removable: true,
                }
                .encode(out_data)
            }
            devctl::REREAD_PARTITION_TABLE => {
                if !self.inner.lock().is_ready() {
                    return Err(ErrorCode::NoDevice);
                }
                self.decode_partitions(false)
            }
            devctl::SDIO_READ_DIRECT => {
                let args = SdioArgs::decode(in_data)?;
                if out_data.is_empty() {
                    return Err(ErrorCode::InvalidArg);
                }
                let mut inner = self.inner.lock();
                if !inner.is_ready() {
                    return Err(ErrorCode::NoDevice);
                }
                let mut data = 0;
                if !self.cmd52(&mut inner, sdio::CMD52_READ, args.function, args.addr, 0, &mut data)
                {
                    return Err(ErrorCode::IoError);
                }
                out_data[0] = data;
                Ok(())
            }
            devctl::SDIO_WRITE_DIRECT => {
                let args = SdioArgs::decode(in_data)?;
                let mut data = *in_data
                    .get(SdioArgs::ENCODED_SIZE)
                    .ok_or(ErrorCode::InvalidArg)?;
                let mut inner = self.inner.lock();
                if !inner.is_ready() {
                    return Err(ErrorCode::NoDevice);
                }
                if !self.cmd52(&mut inner, sdio::CMD52_WRITE, args.function, args.addr, 0, &mut data)
                {
                    return Err(ErrorCode::IoError);
                }
                Ok(())
            }
            devctl::SDIO_READ_EXTENDED => {
                let args = SdioArgs::decode(in_data)?;
                if out_data.is_empty() || out_data.len() > BLOCK_SIZE {
                    return Err(ErrorCode::InvalidArg);
                }
                let mut inner = self.inner.lock();
                if !inner.is_ready() {
                    return Err(ErrorCode::NoDevice);
                }
                if !self.cmd53_read(&mut inner, args.function, args.addr, args.increment_addr, out_data)
                {
                    return Err(ErrorCode::IoError);
                }
                Ok(())
            }
            devctl::SDIO_WRITE_EXTENDED => {
                let args = SdioArgs::decode(in_data)?;
                let payload = &in_data[SdioArgs::ENCODED_SIZE..];
                if payload.is_empty() || payload.len() > BLOCK_SIZE {
                    return Err(ErrorCode::InvalidArg);
                }
                let mut inner = self.inner.lock();
                if !inner.is_ready() {
                    return Err(ErrorCode::NoDevice);
                }
                if !self.cmd53_write(&mut inner, args.function, args.addr, args.increment_addr, payload)
                {
                    return Err(ErrorCode::IoError);
                }
                Ok(())
            }
            _ => Err(ErrorCode::NotImplemented),
        }
    }
}
