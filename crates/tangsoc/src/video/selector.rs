//! Video source selection.
//!
//! Five sources share the HDMI output, picked by an 8-bit register:
//!
//! | value | source                                                   |
//! |-------|----------------------------------------------------------|
//! | 0     | passthrough or queued producer output (board dependent)  |
//! | 1     | queued producer output                                   |
//! | 2     | PRBS31 pattern                                           |
//! | 3     | producer output, bypassing the queue                     |
//! | 4     | constant color (board dependent)                         |
//! | other | fallback color (board dependent)                         |
//!
//! Sync and data-enable always come from the timing generator, `valid` follows the
//! timing stream and ready flows straight back to it. The queue is only read inside the
//! picture window, so blanking never drains it.

use super::{PixelSample, Prbs31, Rgb, TimingSample};
use crate::cdc::{AsyncFifo, Synchronizer};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tangsoc_hw::boards::{tang_nano_20k, tang_nano_20k_legacy};
use tangsoc_hw::specs::video;
use tracing::debug;

/// Software-visible selector value. Clones share the same register.
#[derive(Debug, Clone, Default)]
pub struct SelectorRegister(Arc<AtomicU8>);

impl SelectorRegister {
    pub fn new(initial: u8) -> Self {
        Self(Arc::new(AtomicU8::new(initial)))
    }

    pub fn get(&self) -> u8 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set(&self, value: u8) {
        self.0.store(value, Ordering::Relaxed);
    }
}

/// What selector slot 0 shows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot0Mode {
    /// The timing generator's own picture, inside the window
    Passthrough,
    /// The queued producer output, inside the window
    QueueGated,
}

/// Per-board tuning of the selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoPolicy {
    pub slot0: Slot0Mode,
    pub slot4_color: Rgb,
    pub fallback_color: Rgb,
    /// The window is `window_x_start < hcount < window_x_end` on visible lines
    pub window_x_start: u32,
    pub window_x_end: u32,
    /// Raise line requests only on visible lines
    pub gate_line_request: bool,
}

impl VideoPolicy {
    pub fn tang_nano_20k() -> Self {
        Self {
            slot0: if tang_nano_20k::SLOT0_QUEUED {
                Slot0Mode::QueueGated
            } else {
                Slot0Mode::Passthrough
            },
            slot4_color: Rgb::from_tuple(tang_nano_20k::SLOT4_COLOR),
            fallback_color: Rgb::from_tuple(tang_nano_20k::FALLBACK_COLOR),
            window_x_start: video::WINDOW_X_START,
            window_x_end: video::WINDOW_X_END,
            gate_line_request: tang_nano_20k::LINE_REQUEST_GATED,
        }
    }

    pub fn tang_nano_20k_legacy() -> Self {
        Self {
            slot0: if tang_nano_20k_legacy::SLOT0_QUEUED {
                Slot0Mode::QueueGated
            } else {
                Slot0Mode::Passthrough
            },
            slot4_color: Rgb::from_tuple(tang_nano_20k_legacy::SLOT4_COLOR),
            fallback_color: Rgb::from_tuple(tang_nano_20k_legacy::FALLBACK_COLOR),
            window_x_start: video::WINDOW_X_START,
            window_x_end: video::WINDOW_X_END,
            gate_line_request: tang_nano_20k_legacy::LINE_REQUEST_GATED,
        }
    }

    /// Decode a selector value
    pub fn source(&self, select: u8) -> Source {
        match select {
            0 => match self.slot0 {
                Slot0Mode::Passthrough => Source::Passthrough,
                Slot0Mode::QueueGated => Source::QueueGated,
            },
            1 => Source::Queue,
            2 => Source::Pattern,
            3 => Source::Direct,
            4 => Source::Constant(self.slot4_color),
            _ => Source::Constant(self.fallback_color),
        }
    }

    /// Whether the producer feeds the queue while `select` is active
    pub fn queues_producer(&self, select: u8) -> bool {
        self.source(select).reads_queue()
    }

    /// Whether the raster position is inside the picture window
    pub fn in_window(&self, timing: &TimingSample, vres: u32) -> bool {
        timing.hcount > self.window_x_start
            && timing.hcount < self.window_x_end
            && timing.vcount < vres
    }

    /// Line request toward the producer
    pub fn line_request(&self, timing: &TimingSample, vres: u32) -> bool {
        if self.gate_line_request {
            timing.hsync && timing.vcount < vres
        } else {
            timing.hsync
        }
    }
}

/// A decoded selector value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Passthrough,
    QueueGated,
    Queue,
    Pattern,
    Direct,
    Constant(Rgb),
}

impl Source {
    pub fn reads_queue(&self) -> bool {
        matches!(self, Source::QueueGated | Source::Queue)
    }
}

/// Output of one selector tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectorOutput {
    pub pixel: PixelSample,
    /// Ready toward the timing generator
    pub vin_ready: bool,
}

/// HDMI-domain half of the selector
#[derive(Debug, Clone)]
pub struct VideoSelector {
    policy: VideoPolicy,
    register: SelectorRegister,
    select: u8,
    vres: u32,
    prbs: Prbs31,
    direct: Synchronizer<Rgb>,
    starved: u64,
}

impl VideoSelector {
    pub fn new(policy: VideoPolicy, register: SelectorRegister, prbs_seed: u32, vres: u32) -> Self {
        let select = register.get();
        Self {
            policy,
            register,
            select,
            vres,
            prbs: Prbs31::new(prbs_seed),
            direct: Synchronizer::new(Rgb::BLACK),
            starved: 0,
        }
    }

    pub fn policy(&self) -> &VideoPolicy {
        &self.policy
    }

    /// The selector value in effect this tick
    pub fn select(&self) -> u8 {
        self.select
    }

    /// Window ticks in which the queue had nothing to show
    pub fn starved(&self) -> u64 {
        self.starved
    }

    /// Return to the reset state (keeps the PRBS seed sequence running from scratch)
    pub fn reset(&mut self, prbs_seed: u32) {
        self.select = self.register.get();
        self.prbs = Prbs31::new(prbs_seed);
        self.direct.reset(Rgb::BLACK);
    }

    /// One HDMI clock edge.
    ///
    /// `producer` is the producer's current pixel, sampled through a synchronizer for
    /// the direct slot. The queue's read side is clocked here on every call.
    pub fn tick(
        &mut self,
        timing: &TimingSample,
        vout_ready: bool,
        queue: &mut AsyncFifo<Rgb>,
        producer: Rgb,
    ) -> SelectorOutput {
        let source = self.policy.source(self.select);
        let in_window = self.policy.in_window(timing, self.vres);

        let mut read = false;
        let rgb = match source {
            Source::Passthrough => {
                if in_window {
                    timing.rgb
                } else {
                    Rgb::BLACK
                }
            }
            Source::QueueGated | Source::Queue => {
                read = in_window && vout_ready;
                let head = queue.source_peek().copied();
                if in_window && head.is_none() {
                    self.starved += 1;
                }
                match (source, head) {
                    (Source::QueueGated, Some(rgb)) if in_window => rgb,
                    (Source::Queue, Some(rgb)) => rgb,
                    _ => Rgb::BLACK,
                }
            }
            Source::Pattern => self.prbs.rgb(),
            Source::Direct => self.direct.output(),
            Source::Constant(rgb) => rgb,
        };

        queue.read_tick(read);
        self.prbs.tick();
        self.direct.tick(producer);

        let next = self.register.get();
        if next != self.select {
            debug!("video source {} -> {}", self.select, next);
            self.select = next;
        }

        SelectorOutput {
            pixel: PixelSample {
                valid: timing.valid,
                r: rgb.r,
                g: rgb.g,
                b: rgb.b,
                hsync: timing.hsync,
                vsync: timing.vsync,
                de: timing.de,
            },
            vin_ready: vout_ready,
        }
    }
}
