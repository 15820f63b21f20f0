//! Wishbone B4 signal model.
//!
//! A [`Request`] is everything an initiator drives during one clock cycle and a
//! [`Response`] everything the target drives back. Both are plain values: components
//! present their registered outputs, the fabric routes them, and each side updates its
//! state from what it received.

/// Cycle type identifiers
pub mod cti {
    /// Single access
    pub const CLASSIC: u8 = 0b000;
    /// Constant address burst
    pub const CONSTANT: u8 = 0b001;
    /// Incrementing burst
    pub const INCREMENTING: u8 = 0b010;
    /// Last beat of a burst
    pub const END_OF_BURST: u8 = 0b111;
}

/// Burst type extension
pub mod bte {
    pub const LINEAR: u8 = 0b00;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Request {
    pub cyc: bool,
    pub stb: bool,
    pub we: bool,
    pub adr: u32,
    pub dat_w: u32,
    pub sel: u8,
    pub cti: u8,
    pub bte: u8,
}

impl Request {
    /// Nothing on the bus
    pub fn idle() -> Self {
        Self::default()
    }

    /// Single read of the word at `adr`
    pub fn read(adr: u32, sel: u8) -> Self {
        Self {
            cyc: true,
            stb: true,
            adr,
            sel,
            ..Self::default()
        }
    }

    /// Single write of `dat_w` to the word at `adr`
    pub fn write(adr: u32, dat_w: u32, sel: u8) -> Self {
        Self {
            cyc: true,
            stb: true,
            we: true,
            adr,
            dat_w,
            sel,
            ..Self::default()
        }
    }

    /// Same request tagged as one beat of an incrementing burst
    pub fn with_burst(mut self, last: bool) -> Self {
        self.cti = if last {
            cti::END_OF_BURST
        } else {
            cti::INCREMENTING
        };
        self.bte = bte::LINEAR;
        self
    }

    /// `cyc && stb`: the target must eventually acknowledge
    pub fn is_active(&self) -> bool {
        self.cyc && self.stb
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Response {
    pub ack: bool,
    pub err: bool,
    pub dat_r: u32,
}

impl Response {
    pub fn idle() -> Self {
        Self::default()
    }

    pub fn ack(dat_r: u32) -> Self {
        Self {
            ack: true,
            err: false,
            dat_r,
        }
    }

    pub fn error() -> Self {
        Self {
            ack: false,
            err: true,
            dat_r: 0,
        }
    }

    /// The access finished, successfully or not
    pub fn is_done(&self) -> bool {
        self.ack || self.err
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Addressing {
    /// `adr` counts data-width words
    Word,
    /// `adr` counts bytes
    Byte,
}

/// Shape of one Wishbone interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceSpec {
    pub data_width: u32,
    pub address_width: u32,
    pub addressing: Addressing,
}

impl InterfaceSpec {
    pub const fn word(data_width: u32, address_width: u32) -> Self {
        Self {
            data_width,
            address_width,
            addressing: Addressing::Word,
        }
    }

    /// Bytes per data word
    pub fn bytes_per_word(&self) -> u32 {
        self.data_width / 8
    }

    /// Mask of the byte-select lines
    pub fn sel_mask(&self) -> u8 {
        ((1u16 << self.bytes_per_word()) - 1) as u8
    }

    /// Mask of the data lines
    pub fn data_mask(&self) -> u32 {
        if self.data_width >= 32 {
            u32::MAX
        } else {
            (1u32 << self.data_width) - 1
        }
    }

    /// Drop address bits the interface does not carry
    pub fn truncate(&self, adr: u32) -> u32 {
        if self.address_width >= 32 {
            adr
        } else {
            adr & ((1u32 << self.address_width) - 1)
        }
    }

    /// Byte address of `adr` on this interface
    pub fn byte_address(&self, adr: u32) -> u32 {
        let adr = self.truncate(adr);
        match self.addressing {
            Addressing::Word => adr.wrapping_mul(self.bytes_per_word()),
            Addressing::Byte => adr,
        }
    }
}
