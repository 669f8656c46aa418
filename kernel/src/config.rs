//! Board and framework configuration
//!
//! Compile-time constants for the SAME70/STM32H7-class tablet hardware and
//! the GUI framework's tuning knobs.

/// Display panel resolution (RA8875, landscape)
pub const DISPLAY_WIDTH: i32 = 800;
pub const DISPLAY_HEIGHT: i32 = 480;

/// Kernel heap size in bytes
pub const HEAP_SIZE: usize = 192 * 1024;

/// Data-cache line size. DMA buffers are aligned to and padded to this.
pub const DCACHE_LINE_SIZE: usize = 32;

/// SD/MMC block size. All block I/O offsets and lengths are multiples.
pub const BLOCK_SIZE: usize = 512;

/// Per-application GUI send buffer; overflow triggers a flush.
pub const SEND_BUFFER_SIZE: usize = 1024;

/// Base path for SD/MMC device nodes: `<base>raw`, `<base>0`, `<base>1`, ...
pub const SDMMC_DEVICE_PATH: &str = "/dev/disk/";

// ============================================================================
// Input timing (seconds / pixels)
// ============================================================================

/// Delay before a held key starts repeating
pub const KEYREPEAT_DELAY: f32 = 0.3;
/// Interval between repeated key-down events
pub const KEYREPEAT_REPEAT: f32 = 0.08;
/// Hold time before a stationary touch becomes a long-press
pub const LONG_PRESS_DELAY: f32 = 0.5;
/// Movement past this distance turns a press into a drag
pub const BEGIN_DRAG_OFFSET: f32 = 20.0;

/// Conventional transparent-key color for bitmap blits (RGB16 magenta)
pub const TRANSPARENT_RGB16: u16 = (0x1f << 11) | (0x01 << 5) | 0x1f;
