//! HDMI video path: timing generation, source selection and the display sink.

pub mod prbs;
pub mod selector;
pub mod sink;
pub mod timing;

pub use prbs::Prbs31;
pub use selector::{
    SelectorOutput, SelectorRegister, Slot0Mode, Source, VideoPolicy, VideoSelector,
};
pub use sink::DisplaySink;
pub use timing::{TimingGenerator, TimingSample, VideoTimings};

/// 24-bit color
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const BLACK: Rgb = Rgb::new(0, 0, 0);
    pub const WHITE: Rgb = Rgb::new(0xff, 0xff, 0xff);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    pub const fn from_tuple(rgb: (u8, u8, u8)) -> Self {
        Self::new(rgb.0, rgb.1, rgb.2)
    }

    /// Split a 24-bit word: r = bits 0..8, g = 8..16, b = 16..24
    pub const fn from_bits(bits: u32) -> Self {
        Self::new(bits as u8, (bits >> 8) as u8, (bits >> 16) as u8)
    }

    /// Expand an RGB565 word
    pub const fn from_rgb565(value: u16) -> Self {
        let r = ((value >> 11) & 0x1f) as u8;
        let g = ((value >> 5) & 0x3f) as u8;
        let b = (value & 0x1f) as u8;
        Self::new((r << 3) | (r >> 2), (g << 2) | (g >> 4), (b << 3) | (b >> 2))
    }

    /// Pack as `0x00RRGGBB`
    pub const fn to_u32(self) -> u32 {
        (self.r as u32) << 16 | (self.g as u32) << 8 | self.b as u32
    }
}

/// One sample of the output video stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PixelSample {
    pub valid: bool,
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub hsync: bool,
    pub vsync: bool,
    pub de: bool,
}

impl PixelSample {
    pub fn rgb(&self) -> Rgb {
        Rgb::new(self.r, self.g, self.b)
    }
}
