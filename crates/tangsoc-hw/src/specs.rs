/// Clock specifications
pub mod clocks {
    /// On-board crystal (27 MHz)
    pub const CLK27_HZ: u64 = 27_000_000;

    /// HDMI serializer clock (5x pixel clock for 720p)
    pub const HDMI5X_HZ: u64 = 371_250_000;

    /// HDMI pixel clock for 1280x720@60
    pub const HDMI_HZ: u64 = 74_250_000;

    /// Emulation core clock (runs at the pixel rate)
    pub const NES_HZ: u64 = 74_250_000;

    /// Default system clock on the SD-card board (hdmi / 2)
    pub const SYS_HZ: u64 = 37_125_000;

    /// Default system clock on the legacy board (second PLL)
    pub const SYS_HZ_LEGACY: u64 = 54_000_000;

    /// Power-on reset countdown, in crystal cycles
    pub const POR_CYCLES: u32 = 0xFFFF;

    /// Input cycles a GW2A PLL needs to report lock after reset release
    pub const PLL_LOCK_CYCLES: u32 = 64;
}

/// Bus widths of the bridged interfaces
pub mod bus {
    /// SD bridge slave port data width
    pub const SDCARD_SLAVE_DATA_WIDTH: u32 = 32;
    /// SD bridge slave port address width (word addressing)
    pub const SDCARD_SLAVE_ADDRESS_WIDTH: u32 = 11;
    /// SD bridge DMA master data width
    pub const SDCARD_MASTER_DATA_WIDTH: u32 = 32;
    /// SD bridge DMA master address width (word addressing)
    pub const SDCARD_MASTER_ADDRESS_WIDTH: u32 = 29;
    /// Emulation core ROM port data width
    pub const ROM_DATA_WIDTH: u32 = 16;
    /// Emulation core ROM port address width (word addressing)
    pub const ROM_ADDRESS_WIDTH: u32 = 21;
    /// Watchdog for stalled bus cycles, in system clock ticks
    pub const BUS_TIMEOUT_TICKS: u64 = 1_000_000;
}

/// Video specifications
pub mod video {
    /// Active width of the HDMI output
    pub const HRES: u32 = 1280;
    /// Horizontal sync start
    pub const HSYNC_START: u32 = 1390;
    /// Horizontal sync end
    pub const HSYNC_END: u32 = 1430;
    /// Horizontal total
    pub const HSCAN: u32 = 1650;
    /// Active height of the HDMI output
    pub const VRES: u32 = 720;
    /// Vertical sync start
    pub const VSYNC_START: u32 = 725;
    /// Vertical sync end
    pub const VSYNC_END: u32 = 730;
    /// Vertical total
    pub const VSCAN: u32 = 750;

    /// The emulator picture is shown while `WINDOW_X_START < hcount < WINDOW_X_END`
    pub const WINDOW_X_START: u32 = 255;
    /// See [`WINDOW_X_START`]
    pub const WINDOW_X_END: u32 = 1024;

    /// Pixels the emulation core emits per requested line (256 pixels tripled)
    pub const CORE_LINE_PIXELS: u32 = 768;

    /// Depth of the pixel queue between the core and the display
    pub const PIXEL_QUEUE_DEPTH: usize = 2048;
}
