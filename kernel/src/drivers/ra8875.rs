//! RA8875 display driver
//!
//! Drives an 800x480 TFT through the RA8875's drawing engine. Every
//! primitive the compositor emits maps onto an accelerated operation: the
//! rectangle/line/circle drawing engine and the BTE block mover. The blitter
//! is polled between operations; there is no frame buffer in kernel memory.
//!
//! The compositor talks to the panel through the `GfxBackend` trait so the
//! region machinery can be exercised against a recording double.

use embedded_graphics_core::pixelcolor::raw::RawU16;
use embedded_graphics_core::pixelcolor::{IntoStorage, Rgb565};

use crate::config::{DISPLAY_HEIGHT, DISPLAY_WIDTH};
use crate::math::{IPoint, IRect};

/// Drawing backend the application server renders through.
///
/// All rectangles are exclusive on the right/bottom edge and in screen
/// coordinates; the implementation owns the inclusive conversion its
/// hardware wants.
pub trait GfxBackend: Send {
    fn resolution(&self) -> IPoint;

    /// Busy-wait until the drawing engine is idle.
    fn wait_blitter(&mut self);

    /// Restrict subsequent drawing to `rect`.
    fn set_window(&mut self, rect: IRect);

    fn set_fg_color(&mut self, color: Rgb565);
    fn set_bg_color(&mut self, color: Rgb565);

    fn fill_rect(&mut self, rect: IRect);
    fn draw_line(&mut self, p1: IPoint, p2: IPoint);
    fn fill_circle(&mut self, center: IPoint, radius: i32);

    /// Accelerated on-screen move of `src` so its top-left lands on `dst`.
    /// Handles overlapping spans.
    fn move_rect(&mut self, src: IRect, dst: IPoint);

    /// Render text at `pos` using the character ROM. Returns the advance
    /// width in pixels.
    fn draw_string(&mut self, text: &str, pos: IPoint) -> i32;

    /// Copy a 565 bitmap to `dst`. Pixels equal to `transparent` are
    /// skipped when the key is given.
    fn draw_bitmap(&mut self, dst: IRect, data: &[u16], transparent: Option<Rgb565>);
}

/// Pack components into the panel's native format.
pub fn rgb(r: u8, g: u8, b: u8) -> Rgb565 {
    Rgb565::new(r >> 3, g >> 2, b >> 3)
}

pub fn color_to_raw(color: Rgb565) -> u16 {
    color.into_storage()
}

pub fn color_from_raw(raw: u16) -> Rgb565 {
    Rgb565::from(RawU16::new(raw))
}

// ============================================================================
// Register map
// ============================================================================

#[allow(dead_code)]
mod reg {
    // System
    pub const PWRR: u8 = 0x01; // power and display control
    pub const MRWC: u8 = 0x02; // memory read/write port
    pub const PCSR: u8 = 0x04; // pixel clock
    pub const SYSR: u8 = 0x10; // system configuration (color depth, bus)
    pub const HDWR: u8 = 0x14; // horizontal display width
    pub const VDHR0: u8 = 0x19; // vertical display height
    pub const VDHR1: u8 = 0x1A;

    // Active window
    pub const HSAW0: u8 = 0x30;
    pub const HSAW1: u8 = 0x31;
    pub const VSAW0: u8 = 0x32;
    pub const VSAW1: u8 = 0x33;
    pub const HEAW0: u8 = 0x34;
    pub const HEAW1: u8 = 0x35;
    pub const VEAW0: u8 = 0x36;
    pub const VEAW1: u8 = 0x37;

    // Memory write cursor
    pub const CURH0: u8 = 0x46;
    pub const CURH1: u8 = 0x47;
    pub const CURV0: u8 = 0x48;
    pub const CURV1: u8 = 0x49;

    // Text cursor
    pub const F_CURXL: u8 = 0x2A;
    pub const F_CURXH: u8 = 0x2B;
    pub const F_CURYL: u8 = 0x2C;
    pub const F_CURYH: u8 = 0x2D;
    pub const MWCR0: u8 = 0x40; // memory write control (text/graphics mode)

    // Colors
    pub const BGCR0: u8 = 0x60;
    pub const BGCR1: u8 = 0x61;
    pub const BGCR2: u8 = 0x62;
    pub const FGCR0: u8 = 0x63;
    pub const FGCR1: u8 = 0x64;
    pub const FGCR2: u8 = 0x65;

    // Drawing engine
    pub const DCR: u8 = 0x90; // draw control
    pub const DLHSR0: u8 = 0x91; // line/square start
    pub const DLHSR1: u8 = 0x92;
    pub const DLVSR0: u8 = 0x93;
    pub const DLVSR1: u8 = 0x94;
    pub const DLHER0: u8 = 0x95; // line/square end
    pub const DLHER1: u8 = 0x96;
    pub const DLVER0: u8 = 0x97;
    pub const DLVER1: u8 = 0x98;
    pub const DCHR0: u8 = 0x99; // circle center
    pub const DCHR1: u8 = 0x9A;
    pub const DCVR0: u8 = 0x9B;
    pub const DCVR1: u8 = 0x9C;
    pub const DCRR: u8 = 0x9D; // circle radius

    pub const DCR_LINE_SQR_TRI: u8 = 0x80; // start line/square/triangle
    pub const DCR_SQUARE: u8 = 0x10;
    pub const DCR_FILL: u8 = 0x20;
    pub const DCR_CIRCLE: u8 = 0x40; // start circle

    // Block transfer engine
    pub const HSBE0: u8 = 0x54; // source
    pub const HSBE1: u8 = 0x55;
    pub const VSBE0: u8 = 0x56;
    pub const VSBE1: u8 = 0x57;
    pub const HDBE0: u8 = 0x58; // destination
    pub const HDBE1: u8 = 0x59;
    pub const VDBE0: u8 = 0x5A;
    pub const VDBE1: u8 = 0x5B;
    pub const BEWR0: u8 = 0x5C; // width
    pub const BEWR1: u8 = 0x5D;
    pub const BEHR0: u8 = 0x5E; // height
    pub const BEHR1: u8 = 0x5F;
    pub const BECR0: u8 = 0x50; // control 0 (enable, block mode)
    pub const BECR1: u8 = 0x51; // control 1 (operation, ROP)

    pub const BECR0_ENABLE: u8 = 0x80;
    pub const BECR0_SRC_BLOCK: u8 = 0x00;
    pub const BECR0_DST_BLOCK: u8 = 0x00;
    pub const BTE_OP_MOVE_POS_ROP: u8 = 0x02; // top-left to bottom-right scan
    pub const BTE_OP_MOVE_NEG_ROP: u8 = 0x03; // bottom-right to top-left scan
    pub const BTE_OP_EXPAND_TRANSPARENT: u8 = 0x05;
    pub const BTE_OP_WRITE_ROP: u8 = 0x00;
    pub const BTE_OP_WRITE_TRANSPARENT: u8 = 0x04;
    pub const BTE_ROP_S: u8 = 0xC0; // ROP: destination = source

    // Status bits
    pub const STATUS_MEMORY_BUSY: u8 = 0x80;
    pub const STATUS_BTE_BUSY: u8 = 0x40;
}

// ============================================================================
// Bus access (8080-style parallel interface via external memory bank)
// ============================================================================

#[cfg(target_arch = "arm")]
mod bus {
    /// Command/data windows of the external bus chip select wired to the
    /// controller.
    const LCD_CMD: *mut u16 = 0x6000_0000 as *mut u16;
    const LCD_DATA: *mut u16 = 0x6001_0000 as *mut u16;

    pub fn write_cmd(reg: u8) {
        unsafe { core::ptr::write_volatile(LCD_CMD, reg as u16) }
    }

    pub fn write_data(value: u8) {
        unsafe { core::ptr::write_volatile(LCD_DATA, value as u16) }
    }

    pub fn write_data16(value: u16) {
        unsafe { core::ptr::write_volatile(LCD_DATA, value) }
    }

    pub fn read_status() -> u8 {
        unsafe { (core::ptr::read_volatile(LCD_CMD) >> 8) as u8 }
    }
}

#[cfg(not(target_arch = "arm"))]
mod bus {
    pub fn write_cmd(_reg: u8) {}
    pub fn write_data(_value: u8) {}
    pub fn write_data16(_value: u16) {}
    pub fn read_status() -> u8 {
        0
    }
}

// ============================================================================
// Driver
// ============================================================================

pub struct Ra8875Driver {
    fg_color: Rgb565,
    bg_color: Rgb565,
}

impl Ra8875Driver {
    pub const fn new() -> Self {
        Self {
            fg_color: Rgb565::new(0, 0, 0),
            bg_color: Rgb565::new(31, 63, 31),
        }
    }

    fn write_reg(&self, register: u8, value: u8) {
        bus::write_cmd(register);
        bus::write_data(value);
    }

    fn write_reg16(&self, low: u8, high: u8, value: u16) {
        self.write_reg(low, value as u8);
        self.write_reg(high, (value >> 8) as u8);
    }

    /// PLL, pixel clock, panel timing, then display on.
    pub fn init_display(&mut self) {
        self.write_reg(reg::SYSR, 0x0C); // 16bpp, 8080 16-bit bus
        self.write_reg(reg::PCSR, 0x81); // falling edge, clk/2
        self.write_reg(reg::HDWR, (DISPLAY_WIDTH / 8 - 1) as u8);
        self.write_reg16(reg::VDHR0, reg::VDHR1, (DISPLAY_HEIGHT - 1) as u16);
        self.write_reg(reg::PWRR, 0x80); // display on
        self.set_window(IRect::from_size(DISPLAY_WIDTH, DISPLAY_HEIGHT));
        crate::log!("[ra8875] display online {}x{}", DISPLAY_WIDTH, DISPLAY_HEIGHT);
    }

    fn write_color(&self, base0: u8, base1: u8, base2: u8, color: Rgb565) {
        let raw = color.into_storage();
        self.write_reg(base0, ((raw >> 11) & 0x1F) as u8);
        self.write_reg(base1, ((raw >> 5) & 0x3F) as u8);
        self.write_reg(base2, (raw & 0x1F) as u8);
    }
}

impl Default for Ra8875Driver {
    fn default() -> Self {
        Self::new()
    }
}

impl GfxBackend for Ra8875Driver {
    fn resolution(&self) -> IPoint {
        IPoint::new(DISPLAY_WIDTH, DISPLAY_HEIGHT)
    }

    fn wait_blitter(&mut self) {
        while bus::read_status() & (reg::STATUS_MEMORY_BUSY | reg::STATUS_BTE_BUSY) != 0 {
            core::hint::spin_loop();
        }
    }

    fn set_window(&mut self, rect: IRect) {
        self.write_reg16(reg::HSAW0, reg::HSAW1, rect.left as u16);
        self.write_reg16(reg::VSAW0, reg::VSAW1, rect.top as u16);
        self.write_reg16(reg::HEAW0, reg::HEAW1, (rect.right - 1) as u16);
        self.write_reg16(reg::VEAW0, reg::VEAW1, (rect.bottom - 1) as u16);
    }

    fn set_fg_color(&mut self, color: Rgb565) {
        self.fg_color = color;
        self.write_color(reg::FGCR0, reg::FGCR1, reg::FGCR2, color);
    }

    fn set_bg_color(&mut self, color: Rgb565) {
        self.bg_color = color;
        self.write_color(reg::BGCR0, reg::BGCR1, reg::BGCR2, color);
    }

    fn fill_rect(&mut self, rect: IRect) {
        if !rect.is_valid() {
            return;
        }
        self.write_reg16(reg::DLHSR0, reg::DLHSR1, rect.left as u16);
        self.write_reg16(reg::DLVSR0, reg::DLVSR1, rect.top as u16);
        self.write_reg16(reg::DLHER0, reg::DLHER1, (rect.right - 1) as u16);
        self.write_reg16(reg::DLVER0, reg::DLVER1, (rect.bottom - 1) as u16);
        self.write_reg(reg::DCR, reg::DCR_FILL | reg::DCR_LINE_SQR_TRI | reg::DCR_SQUARE);
    }

    fn draw_line(&mut self, p1: IPoint, p2: IPoint) {
        if p1.y == p2.y {
            // One-pixel-high fill is faster than the line engine
            let (l, r) = if p1.x <= p2.x { (p1.x, p2.x) } else { (p2.x, p1.x) };
            self.fill_rect(IRect::new(l, p1.y, r + 1, p1.y + 1));
            return;
        }
        if p1.x == p2.x {
            let (t, b) = if p1.y <= p2.y { (p1.y, p2.y) } else { (p2.y, p1.y) };
            self.fill_rect(IRect::new(p1.x, t, p1.x + 1, b + 1));
            return;
        }
        self.write_reg16(reg::DLHSR0, reg::DLHSR1, p1.x as u16);
        self.write_reg16(reg::DLVSR0, reg::DLVSR1, p1.y as u16);
        self.write_reg16(reg::DLHER0, reg::DLHER1, p2.x as u16);
        self.write_reg16(reg::DLVER0, reg::DLVER1, p2.y as u16);
        self.write_reg(reg::DCR, reg::DCR_LINE_SQR_TRI);
    }

    fn fill_circle(&mut self, center: IPoint, radius: i32) {
        self.write_reg16(reg::DCHR0, reg::DCHR1, center.x as u16);
        self.write_reg16(reg::DCVR0, reg::DCVR1, center.y as u16);
        self.write_reg(reg::DCRR, radius as u8);
        self.write_reg(reg::DCR, reg::DCR_FILL | reg::DCR_CIRCLE);
    }

    fn move_rect(&mut self, src: IRect, dst: IPoint) {
        self.wait_blitter();
        self.set_window(IRect::from_size(DISPLAY_WIDTH, DISPLAY_HEIGHT));

        // Overlapping moves toward the bottom/right must scan backwards.
        let (ctrl, src_pos, dst_pos) =
            if dst.y > src.top || (dst.y == src.top && dst.x > src.left) {
                (
                    reg::BTE_OP_MOVE_NEG_ROP,
                    IPoint::new(src.right - 1, src.bottom - 1),
                    dst + IPoint::new(src.width() - 1, src.height() - 1),
                )
            } else {
                (reg::BTE_OP_MOVE_POS_ROP, src.top_left(), dst)
            };

        self.write_reg16(reg::HSBE0, reg::HSBE1, src_pos.x as u16);
        self.write_reg16(reg::VSBE0, reg::VSBE1, src_pos.y as u16);
        self.write_reg16(reg::HDBE0, reg::HDBE1, dst_pos.x as u16);
        self.write_reg16(reg::VDBE0, reg::VDBE1, dst_pos.y as u16);
        self.write_reg16(reg::BEWR0, reg::BEWR1, src.width() as u16);
        self.write_reg16(reg::BEHR0, reg::BEHR1, src.height() as u16);
        self.write_reg(reg::BECR1, ctrl | reg::BTE_ROP_S);
        self.write_reg(
            reg::BECR0,
            reg::BECR0_SRC_BLOCK | reg::BECR0_DST_BLOCK | reg::BECR0_ENABLE,
        );
    }

    fn draw_string(&mut self, text: &str, pos: IPoint) -> i32 {
        // Character ROM text mode: 8x16 glyphs
        const GLYPH_WIDTH: i32 = 8;
        self.write_reg(reg::MWCR0, 0x80); // text mode
        self.write_reg16(reg::F_CURXL, reg::F_CURXH, pos.x as u16);
        self.write_reg16(reg::F_CURYL, reg::F_CURYH, pos.y as u16);
        bus::write_cmd(reg::MRWC);
        for byte in text.bytes() {
            bus::write_data(byte);
        }
        self.write_reg(reg::MWCR0, 0x00); // back to graphics mode
        text.len() as i32 * GLYPH_WIDTH
    }

    fn draw_bitmap(&mut self, dst: IRect, data: &[u16], transparent: Option<Rgb565>) {
        self.wait_blitter();
        self.write_reg16(reg::HDBE0, reg::HDBE1, dst.left as u16);
        self.write_reg16(reg::VDBE0, reg::VDBE1, dst.top as u16);
        self.write_reg16(reg::BEWR0, reg::BEWR1, dst.width() as u16);
        self.write_reg16(reg::BEHR0, reg::BEHR1, dst.height() as u16);
        // The transparent key rides in the background color registers.
        let op = match transparent {
            Some(key) => {
                self.write_color(reg::BGCR0, reg::BGCR1, reg::BGCR2, key);
                reg::BTE_OP_WRITE_TRANSPARENT
            }
            None => reg::BTE_OP_WRITE_ROP,
        };
        self.write_reg(reg::BECR1, op | reg::BTE_ROP_S);
        self.write_reg(reg::BECR0, reg::BECR0_DST_BLOCK | reg::BECR0_ENABLE);
        bus::write_cmd(reg::MRWC);
        let count = (dst.width() * dst.height()) as usize;
        for &pixel in data.iter().take(count) {
            bus::write_data16(pixel);
        }
    }
}

/// Headless backend: accepts every operation and draws nothing. Used when
/// the kernel boots without a panel and by the host test build.
pub struct NullGfx;

impl GfxBackend for NullGfx {
    fn resolution(&self) -> IPoint {
        IPoint::new(DISPLAY_WIDTH, DISPLAY_HEIGHT)
    }

    fn wait_blitter(&mut self) {}
    fn set_window(&mut self, _rect: IRect) {}
    fn set_fg_color(&mut self, _color: Rgb565) {}
    fn set_bg_color(&mut self, _color: Rgb565) {}
    fn fill_rect(&mut self, _rect: IRect) {}
    fn draw_line(&mut self, _p1: IPoint, _p2: IPoint) {}
    fn fill_circle(&mut self, _center: IPoint, _radius: i32) {}
    fn move_rect(&mut self, _src: IRect, _dst: IPoint) {}

    fn draw_string(&mut self, text: &str, _pos: IPoint) -> i32 {
        text.len() as i32 * 8
    }

    fn draw_bitmap(&mut self, _dst: IRect, _data: &[u16], _transparent: Option<Rgb565>) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn color_packing() {
        assert_eq!(color_to_raw(rgb(255, 255, 255)), 0xFFFF);
        assert_eq!(color_to_raw(rgb(255, 0, 0)), 0xF800);
        assert_eq!(color_to_raw(rgb(0, 255, 0)), 0x07E0);
        assert_eq!(color_to_raw(rgb(0, 0, 255)), 0x001F);
        assert_eq!(color_from_raw(0xF800), rgb(255, 0, 0));
    }

    #[test]
    fn transparent_key_matches_the_legacy_sentinel() {
        // Magenta with the low green bit set, as the compositing paths use
        assert_eq!(
            color_from_raw(crate::config::TRANSPARENT_RGB16),
            Rgb565::new(0x1F, 0x01, 0x1F)
        );
    }
}
