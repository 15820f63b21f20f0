//! Bus regions of the Tang Nano 20K SoC.
//!
//! All addresses are byte addresses on the 32-bit system bus.

/// Main RAM (SDRAM behind the LiteDRAM crossbar)
pub mod main_ram {
    /// Main RAM base address
    pub const BASE: u32 = 0x4000_0000;
    /// Main RAM size (8 MB, one M12L64322A)
    pub const SIZE: usize = 8 * 1024 * 1024;
}

/// SD controller register window (slave port of the SD bridge)
pub mod sdcard {
    /// Register window base address
    pub const BASE: u32 = 0x3000_0000;
    /// Register window size (1 KB = 256 words)
    pub const SIZE: usize = 1024;
}

/// Region the SD controller's DMA master is confined to.
///
/// Master addresses are remapped into this window by the bus fabric.
pub mod sdcard_dma {
    /// DMA region base address
    pub const BASE: u32 = 0x4000_0000;
    /// DMA region size (8 MB)
    pub const SIZE: usize = 0x0080_0000;
}

/// CSR bank
pub mod csr {
    /// CSR region base address
    pub const BASE: u32 = 0xF000_0000;
    /// CSR region size (64 KB)
    pub const SIZE: usize = 0x1_0000;
}

/// Interrupt map
pub mod interrupts {
    /// IRQ slot of the SD bridge event manager
    pub const WBSDCARD: u32 = 4;
}
