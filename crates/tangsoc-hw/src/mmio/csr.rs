//! CSR bank layout.
//!
//! Each peripheral owns a 2 KB window inside the CSR region; registers are 32-bit
//! aligned.

/// Byte offsets relative to `memory_map::csr::BASE`
pub mod registers {
    /// Video source selector (8 bits, read/write)
    pub const NES_VID_SELECT: u32 = 0x0000;

    /// SD bridge event trigger levels (read only)
    pub const WBSDCARD_EV_STATUS: u32 = 0x0800;

    /// SD bridge latched events (write 1 to clear)
    pub const WBSDCARD_EV_PENDING: u32 = 0x0804;

    /// SD bridge event enables
    pub const WBSDCARD_EV_ENABLE: u32 = 0x0808;
}

/// Event bit positions inside the SD bridge event registers
pub mod wbsdcard_events {
    /// Data transfer complete pulse
    pub const INT_DATA: u32 = 1 << 0;
    /// Command complete pulse
    pub const INT_CMD: u32 = 1 << 1;
}
