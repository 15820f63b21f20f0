//! Video timing generator.
//!
//! Walks the raster one pixel per accepted tick and reports sync, data-enable and the
//! current position. Optionally paints eight vertical color bars as its own picture,
//! which is what a passthrough selector slot shows.

use super::Rgb;
use crate::error::SocError;
use tangsoc_hw::specs::{clocks, video};

/// Raster geometry: active area, sync pulse position and total size for each axis
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoTimings {
    pub pixel_hz: u64,
    pub hres: u32,
    pub hsync_start: u32,
    pub hsync_end: u32,
    pub hscan: u32,
    pub vres: u32,
    pub vsync_start: u32,
    pub vsync_end: u32,
    pub vscan: u32,
}

impl Default for VideoTimings {
    /// 1280x720@60Hz
    fn default() -> Self {
        Self {
            pixel_hz: clocks::HDMI_HZ,
            hres: video::HRES,
            hsync_start: video::HSYNC_START,
            hsync_end: video::HSYNC_END,
            hscan: video::HSCAN,
            vres: video::VRES,
            vsync_start: video::VSYNC_START,
            vsync_end: video::VSYNC_END,
            vscan: video::VSCAN,
        }
    }
}

impl VideoTimings {
    pub fn validate(&self) -> Result<(), SocError> {
        let axis_ok = |res: u32, start: u32, end: u32, scan: u32| {
            res > 0 && res <= start && start < end && end <= scan
        };
        if !axis_ok(self.hres, self.hsync_start, self.hsync_end, self.hscan)
            || !axis_ok(self.vres, self.vsync_start, self.vsync_end, self.vscan)
        {
            return Err(SocError::Config(format!("inconsistent video timings {self:?}")));
        }
        Ok(())
    }

    /// Pixel ticks per frame
    pub fn frame_ticks(&self) -> u64 {
        self.hscan as u64 * self.vscan as u64
    }
}

/// Timing stream output for one tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimingSample {
    pub valid: bool,
    pub hsync: bool,
    pub vsync: bool,
    pub de: bool,
    pub hcount: u32,
    pub vcount: u32,
    /// The generator's own picture (color bars or black)
    pub rgb: Rgb,
}

const COLOR_BARS: [Rgb; 8] = [
    Rgb::new(0xff, 0xff, 0xff),
    Rgb::new(0xff, 0xff, 0x00),
    Rgb::new(0x00, 0xff, 0xff),
    Rgb::new(0x00, 0xff, 0x00),
    Rgb::new(0xff, 0x00, 0xff),
    Rgb::new(0xff, 0x00, 0x00),
    Rgb::new(0x00, 0x00, 0xff),
    Rgb::new(0x00, 0x00, 0x00),
];

#[derive(Debug, Clone)]
pub struct TimingGenerator {
    timings: VideoTimings,
    color_bars: bool,
    hcount: u32,
    vcount: u32,
}

impl TimingGenerator {
    pub fn new(timings: VideoTimings, color_bars: bool) -> Self {
        Self {
            timings,
            color_bars,
            hcount: 0,
            vcount: 0,
        }
    }

    pub fn timings(&self) -> &VideoTimings {
        &self.timings
    }

    pub fn hcount(&self) -> u32 {
        self.hcount
    }

    pub fn vcount(&self) -> u32 {
        self.vcount
    }

    pub fn hres(&self) -> u32 {
        self.timings.hres
    }

    pub fn vres(&self) -> u32 {
        self.timings.vres
    }

    /// Restart at the top-left corner
    pub fn reset(&mut self) {
        self.hcount = 0;
        self.vcount = 0;
    }

    /// The stream sample presented this tick
    pub fn current(&self) -> TimingSample {
        let t = &self.timings;
        let de = self.hcount < t.hres && self.vcount < t.vres;
        let rgb = if self.color_bars && de {
            let bar = (self.hcount * 8 / t.hres.max(1)).min(7);
            COLOR_BARS[bar as usize]
        } else {
            Rgb::BLACK
        };
        TimingSample {
            valid: true,
            hsync: (t.hsync_start..t.hsync_end).contains(&self.hcount),
            vsync: (t.vsync_start..t.vsync_end).contains(&self.vcount),
            de,
            hcount: self.hcount,
            vcount: self.vcount,
            rgb,
        }
    }

    /// Advance to the next pixel when the consumer accepted the current one
    pub fn tick(&mut self, ready: bool) {
        if !ready {
            return;
        }
        self.hcount += 1;
        if self.hcount == self.timings.hscan {
            self.hcount = 0;
            self.vcount += 1;
            if self.vcount == self.timings.vscan {
                self.vcount = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny() -> VideoTimings {
        VideoTimings {
            pixel_hz: 1_000_000,
            hres: 8,
            hsync_start: 9,
            hsync_end: 10,
            hscan: 12,
            vres: 4,
            vsync_start: 5,
            vsync_end: 6,
            vscan: 7,
        }
    }

    #[test]
    fn default_is_720p() {
        let t = VideoTimings::default();
        assert!(t.validate().is_ok());
        assert_eq!(t.frame_ticks(), 1650 * 750);
        // 60 frames per second at 74.25 MHz
        assert_eq!(t.pixel_hz / t.frame_ticks(), 60);
    }

    #[test]
    fn counts_active_and_sync_ticks_per_frame() {
        let mut vtg = TimingGenerator::new(tiny(), false);
        let (mut de, mut hsync, mut vsync) = (0, 0, 0);
        for _ in 0..tiny().frame_ticks() {
            let s = vtg.current();
            de += s.de as u32;
            hsync += s.hsync as u32;
            vsync += s.vsync as u32;
            vtg.tick(true);
        }
        assert_eq!(de, 8 * 4);
        assert_eq!(hsync, 7);
        assert_eq!(vsync, 12);
        assert_eq!((vtg.hcount(), vtg.vcount()), (0, 0));
    }

    #[test]
    fn holds_position_without_ready() {
        let mut vtg = TimingGenerator::new(tiny(), false);
        vtg.tick(true);
        vtg.tick(false);
        assert_eq!(vtg.hcount(), 1);
    }

    #[test]
    fn color_bars_only_inside_active_area() {
        let mut vtg = TimingGenerator::new(tiny(), true);
        assert_eq!(vtg.current().rgb, Rgb::WHITE);
        for _ in 0..7 {
            vtg.tick(true);
        }
        assert_eq!(vtg.current().rgb, Rgb::BLACK);
        vtg.tick(true);
        assert!(!vtg.current().de);
    }

    #[test]
    fn rejects_inconsistent_timings() {
        let mut t = tiny();
        t.hsync_end = t.hsync_start;
        assert!(t.validate().is_err());
    }
}
