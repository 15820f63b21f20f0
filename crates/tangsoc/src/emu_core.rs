//! Emulation core interface.
//!
//! The core lives in its own clock domain. It sees the display's line request and
//! vsync through synchronizers, pushes one pixel at a time toward the pixel queue and
//! reads its program image through the ROM bridge.
//!
//! [`DemoCore`] is a stand-in with the same bus behavior as a real core: it loads a
//! 64-entry RGB565 palette from ROM at every frame start and renders a fixed tile
//! pattern from it, one line per request.

use crate::video::Rgb;
use crate::wishbone::{Request, Response};
use tangsoc_hw::specs::video::CORE_LINE_PIXELS;
use tracing::debug;

/// What the core sees on one edge of its clock
#[derive(Debug, Clone, Copy, Default)]
pub struct CoreInputs {
    /// Line request from the display, synchronized
    pub line_ready: bool,
    /// Display vsync, synchronized
    pub vsync: bool,
    /// The pixel offered this tick was taken
    pub pixel_accepted: bool,
    /// ROM bus response to the request offered this tick
    pub rom: Response,
}

pub trait EmulationCore {
    /// Request driven on the ROM bus this tick
    fn rom_request(&self) -> Request;

    /// Pixel offered this tick
    fn pixel(&self) -> Option<Rgb>;

    fn tick(&mut self, inputs: &CoreInputs);

    /// Return to the reset state; called when the core's domain enters reset
    fn reset(&mut self);
}

pub const PALETTE_ENTRIES: usize = 64;

/// Tile width in output pixels
const TILE_WIDTH: u32 = 96;
/// Tile height in lines
const TILE_HEIGHT: u32 = 90;

#[derive(Debug, Clone)]
pub struct DemoCore {
    palette: [Rgb; PALETTE_ENTRIES],
    palette_base: u32,
    line_pixels: u32,
    fetch: Option<u32>,
    palette_loads: u64,
    // Line being emitted, if any
    x: Option<u32>,
    y: u32,
    lines: u64,
    prev_line_ready: bool,
    prev_vsync: bool,
}

impl DemoCore {
    /// Core whose palette starts at ROM word `palette_base`
    pub fn new(palette_base: u32) -> Self {
        Self {
            palette: [Rgb::BLACK; PALETTE_ENTRIES],
            palette_base,
            line_pixels: CORE_LINE_PIXELS,
            // The palette is fetched right out of reset
            fetch: Some(0),
            palette_loads: 0,
            x: None,
            y: 0,
            lines: 0,
            prev_line_ready: false,
            prev_vsync: false,
        }
    }

    /// Pixels emitted per requested line
    pub fn with_line_pixels(mut self, pixels: u32) -> Self {
        self.line_pixels = pixels.max(1);
        self
    }

    pub fn palette(&self) -> &[Rgb; PALETTE_ENTRIES] {
        &self.palette
    }

    /// Completed palette loads
    pub fn palette_loads(&self) -> u64 {
        self.palette_loads
    }

    /// Lines rendered in full
    pub fn lines(&self) -> u64 {
        self.lines
    }

    /// Palette index of the pixel at (`x`, `y`) of the emitted picture
    pub fn tile_index(x: u32, y: u32) -> usize {
        ((x / TILE_WIDTH + (y / TILE_HEIGHT) * 8) % PALETTE_ENTRIES as u32) as usize
    }
}

impl EmulationCore for DemoCore {
    fn rom_request(&self) -> Request {
        match self.fetch {
            Some(entry) => Request::read(self.palette_base + entry, 0b11),
            None => Request::idle(),
        }
    }

    fn pixel(&self) -> Option<Rgb> {
        self.x
            .map(|x| self.palette[Self::tile_index(x, self.y)])
    }

    fn tick(&mut self, inputs: &CoreInputs) {
        if let Some(entry) = self.fetch
            && inputs.rom.ack
        {
            self.palette[entry as usize] = Rgb::from_rgb565(inputs.rom.dat_r as u16);
            let next = entry + 1;
            if next as usize == PALETTE_ENTRIES {
                self.fetch = None;
                self.palette_loads += 1;
                debug!(loads = self.palette_loads, "palette loaded");
            } else {
                self.fetch = Some(next);
            }
        }

        if let Some(x) = self.x
            && inputs.pixel_accepted
        {
            if x + 1 >= self.line_pixels {
                self.x = None;
                self.y += 1;
                self.lines += 1;
            } else {
                self.x = Some(x + 1);
            }
        }

        if inputs.vsync && !self.prev_vsync {
            self.y = 0;
            if self.fetch.is_none() {
                self.fetch = Some(0);
            }
        }
        if inputs.line_ready && !self.prev_line_ready && self.x.is_none() {
            self.x = Some(0);
        }
        self.prev_vsync = inputs.vsync;
        self.prev_line_ready = inputs.line_ready;
    }

    fn reset(&mut self) {
        // The palette registers keep their contents; only the fetch restarts
        self.fetch = Some(0);
        self.x = None;
        self.y = 0;
        self.prev_line_ready = false;
        self.prev_vsync = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Serve ROM reads from `rom` with one tick of latency
    fn run(core: &mut DemoCore, rom: &[u16], ticks: usize, line_ready: impl Fn(usize) -> bool) {
        let mut pending: Option<u32> = None;
        for tick in 0..ticks {
            let req = core.rom_request();
            let resp = match pending.take() {
                Some(adr) if req.is_active() && req.adr == adr => {
                    Response::ack(rom[adr as usize] as u32)
                }
                _ => {
                    if req.is_active() {
                        pending = Some(req.adr);
                    }
                    Response::idle()
                }
            };
            core.tick(&CoreInputs {
                line_ready: line_ready(tick),
                vsync: false,
                pixel_accepted: true,
                rom: resp,
            });
        }
    }

    #[test]
    fn palette_is_fetched_from_rom_base() {
        let rom: Vec<u16> = (0..200u16).map(|n| n.wrapping_mul(0x0841)).collect();
        let mut core = DemoCore::new(100);
        run(&mut core, &rom, 200, |_| false);
        assert_eq!(core.palette_loads(), 1);
        assert_eq!(core.palette()[0], Rgb::from_rgb565(rom[100]));
        assert_eq!(core.palette()[63], Rgb::from_rgb565(rom[163]));
        assert!(!core.rom_request().is_active());
    }

    #[test]
    fn line_request_emits_one_line() {
        let rom = vec![0xf800u16; 64];
        let mut core = DemoCore::new(0);
        run(&mut core, &rom, 200, |_| false);
        assert!(core.pixel().is_none());

        run(&mut core, &rom, 2000, |tick| (5..10).contains(&tick));
        assert_eq!(core.lines(), 1);
        assert!(core.pixel().is_none());
    }

    #[test]
    fn pixel_holds_until_accepted() {
        let mut core = DemoCore::new(0);
        core.palette = std::array::from_fn(|n| Rgb::new(n as u8, 0, 0));
        core.fetch = None;
        let held = CoreInputs {
            line_ready: true,
            ..CoreInputs::default()
        };
        core.tick(&held);
        for _ in 0..3 {
            core.tick(&held);
            assert_eq!(core.pixel(), Some(Rgb::new(0, 0, 0)));
        }
        core.tick(&CoreInputs {
            pixel_accepted: true,
            ..held
        });
        // Still in the first tile
        assert_eq!(core.pixel(), Some(Rgb::new(0, 0, 0)));
        core.x = Some(TILE_WIDTH);
        assert_eq!(core.pixel(), Some(Rgb::new(1, 0, 0)));
        core.y = TILE_HEIGHT;
        assert_eq!(core.pixel(), Some(Rgb::new(9, 0, 0)));
    }

    #[test]
    fn reset_restarts_the_palette_fetch() {
        let rom = vec![0x001fu16; 64];
        let mut core = DemoCore::new(0);
        run(&mut core, &rom, 200, |tick| tick == 150);
        assert!(core.pixel().is_some());

        core.reset();
        assert!(core.pixel().is_none());
        assert!(core.rom_request().is_active());
        run(&mut core, &rom, 200, |_| false);
        assert_eq!(core.palette_loads(), 2);
    }
}
