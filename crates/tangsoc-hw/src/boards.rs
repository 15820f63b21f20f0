//! Per-board variant data.
//!
//! Both targets share the same video pipeline but disagree on a handful of details:
//! how the system clock is produced, what selector slot 0 shows, which constant color
//! the fixed slots emit, and whether line requests are gated to the visible lines.

/// Tang Nano 20K with the SD-card bridge and SDRAM-backed ROM relay
pub mod tang_nano_20k {
    /// Board name as accepted on the command line
    pub const NAME: &str = "tang-nano-20k";

    /// System clock (derived from the HDMI pixel clock)
    pub const SYS_HZ: u64 = crate::specs::clocks::SYS_HZ;

    /// Slot 0 shows the queued producer output inside the picture window
    pub const SLOT0_QUEUED: bool = true;

    /// Slot 4 color (magenta)
    pub const SLOT4_COLOR: (u8, u8, u8) = (0xff, 0x00, 0xff);

    /// Out-of-range selector color (white)
    pub const FALLBACK_COLOR: (u8, u8, u8) = (0xff, 0xff, 0xff);

    /// Line requests are only raised while `vcount < vres`
    pub const LINE_REQUEST_GATED: bool = true;
}

/// Earlier revision of the target: separate system PLL, passthrough slot 0
pub mod tang_nano_20k_legacy {
    /// Board name as accepted on the command line
    pub const NAME: &str = "tang-nano-20k-legacy";

    /// System clock (own PLL)
    pub const SYS_HZ: u64 = crate::specs::clocks::SYS_HZ_LEGACY;

    /// Slot 0 passes the timing generator's own picture through
    pub const SLOT0_QUEUED: bool = false;

    /// Slot 4 color (white)
    pub const SLOT4_COLOR: (u8, u8, u8) = (0xff, 0xff, 0xff);

    /// Out-of-range selector color (white)
    pub const FALLBACK_COLOR: (u8, u8, u8) = (0xff, 0xff, 0xff);

    /// Line requests follow raw hsync
    pub const LINE_REQUEST_GATED: bool = false;
}
