//! Register map of the wrapped SD host controller (opencores `sdc_controller`).
//!
//! Offsets are byte-style. The bridge forwards the low eight bits of the slave word
//! address, so offset `r` is reached at word address `r` of the register window.

/// SD controller register offsets
pub mod registers {
    /// Command argument; writing it starts the command held in [`COMMAND`]
    pub const ARGUMENT: u32 = 0x00;

    /// Command setup (index, response type, checks, data direction)
    pub const COMMAND: u32 = 0x04;

    /// Response bits [127:96] (long) or the 32-bit payload (short)
    pub const RESP0: u32 = 0x08;
    pub const RESP1: u32 = 0x0c;
    pub const RESP2: u32 = 0x10;
    pub const RESP3: u32 = 0x14;

    /// Data timeout, in SD clock cycles
    pub const DATA_TIMEOUT: u32 = 0x18;

    /// Controller setup (bit 0 selects the 4-bit bus)
    pub const CONTROL: u32 = 0x1c;

    /// Command response timeout, in SD clock cycles
    pub const CMD_TIMEOUT: u32 = 0x20;

    /// SD clock divider: `sd_clk = sys_clk / (2 * (div + 1))`
    pub const CLOCK_DIVIDER: u32 = 0x24;

    /// Software reset (bit 0)
    pub const RESET: u32 = 0x28;

    /// Supported voltage window (read only)
    pub const VOLTAGE: u32 = 0x2c;

    /// Controller capabilities (read only)
    pub const CAPABILITIES: u32 = 0x30;

    /// Command event status; any write clears it
    pub const CMD_ISR: u32 = 0x34;

    /// Command event enable
    pub const CMD_ISER: u32 = 0x38;

    /// Data event status; any write clears it
    pub const DATA_ISR: u32 = 0x3c;

    /// Data event enable
    pub const DATA_ISER: u32 = 0x40;

    /// Block size in bytes, minus one
    pub const BLOCK_SIZE: u32 = 0x44;

    /// Block count, minus one
    pub const BLOCK_COUNT: u32 = 0x48;

    /// DMA source/destination byte address
    pub const DMA_ADDRESS: u32 = 0x60;
}

/// Command register fields
pub mod command {
    /// Response type mask
    pub const RESPONSE_MASK: u32 = 0x0003;
    /// No response
    pub const RESPONSE_NONE: u32 = 0x0000;
    /// 48-bit response
    pub const RESPONSE_SHORT: u32 = 0x0001;
    /// 136-bit response
    pub const RESPONSE_LONG: u32 = 0x0002;
    /// 48-bit response followed by busy on DAT0
    pub const RESPONSE_SHORT_BUSY: u32 = 0x0003;
    /// Wait for DAT0 to be released after the response
    pub const BUSY_CHECK: u32 = 1 << 2;
    /// Check the response CRC7
    pub const CRC_CHECK: u32 = 1 << 3;
    /// Check the response command index
    pub const INDEX_CHECK: u32 = 1 << 4;
    /// Data direction mask
    pub const DATA_MASK: u32 = 0x0060;
    /// Card-to-host data transfer
    pub const DATA_READ: u32 = 0x0020;
    /// Host-to-card data transfer
    pub const DATA_WRITE: u32 = 0x0040;
    /// Command index shift
    pub const INDEX_SHIFT: u32 = 8;
    /// Command index mask (after shifting)
    pub const INDEX_MASK: u32 = 0x3f;
}

/// Command event bits (`CMD_ISR` / `CMD_ISER`)
pub mod cmd_events {
    pub const COMPLETE: u32 = 1 << 0;
    pub const ERROR: u32 = 1 << 1;
    pub const TIMEOUT: u32 = 1 << 2;
    pub const CRC: u32 = 1 << 3;
    pub const INDEX: u32 = 1 << 4;
}

/// Data event bits (`DATA_ISR` / `DATA_ISER`)
pub mod data_events {
    pub const COMPLETE: u32 = 1 << 0;
    pub const ERROR: u32 = 1 << 1;
    pub const TIMEOUT: u32 = 1 << 2;
    pub const CRC: u32 = 1 << 3;
    pub const BUS: u32 = 1 << 4;
}

/// Reset values of the configuration registers
pub mod defaults {
    /// 512-byte blocks
    pub const BLOCK_SIZE: u32 = 511;
    /// Divide the system clock by 2 * (1 + 1)
    pub const CLOCK_DIVIDER: u32 = 1;
    pub const CMD_TIMEOUT: u32 = 0x0400;
    pub const DATA_TIMEOUT: u32 = 0xffff;
    /// 3.3 V
    pub const VOLTAGE: u32 = 0x0000_0100;
    /// 4-bit bus supported
    pub const CAPABILITIES: u32 = 0x0000_0001;
}
