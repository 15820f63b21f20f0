//! Interrupt event sources.
//!
//! Each [`EventSourcePulse`] latches the rising edge of its trigger into a pending bit
//! that stays set until software writes 1 to it. The [`EventManager`] gathers the sources
//! behind three registers (status, pending, enable) and drives a single irq line.

use tracing::{debug, trace};

/// Edge-latched interrupt flag
#[derive(Debug, Clone)]
pub struct EventSourcePulse {
    name: &'static str,
    trigger: bool,
    pending: bool,
}

impl EventSourcePulse {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            trigger: false,
            pending: false,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Current trigger level
    pub fn status(&self) -> bool {
        self.trigger
    }

    pub fn pending(&self) -> bool {
        self.pending
    }

    /// Sample the trigger. A rising edge sets pending, winning over a clear issued in
    /// the same tick.
    fn tick(&mut self, trigger: bool, clear: bool) {
        let rising = trigger && !self.trigger;
        if clear && self.pending {
            trace!("{}: pending cleared", self.name);
        }
        self.pending = (self.pending && !clear) || rising;
        if rising {
            debug!("{}: event", self.name);
        }
        self.trigger = trigger;
    }
}

/// Status/pending/enable register set with one irq output
#[derive(Debug, Clone)]
pub struct EventManager {
    sources: Vec<EventSourcePulse>,
    enable: u32,
    clear: u32,
}

impl EventManager {
    /// Sources are numbered in the order given, bit 0 first
    pub fn new(names: &[&'static str]) -> Self {
        debug_assert!(names.len() <= 32);
        Self {
            sources: names.iter().map(|&n| EventSourcePulse::new(n)).collect(),
            enable: 0,
            clear: 0,
        }
    }

    pub fn sources(&self) -> &[EventSourcePulse] {
        &self.sources
    }

    pub fn status(&self) -> u32 {
        self.bits(|s| s.trigger)
    }

    pub fn pending(&self) -> u32 {
        self.bits(|s| s.pending)
    }

    pub fn enable(&self) -> u32 {
        self.enable
    }

    pub fn set_enable(&mut self, value: u32) {
        self.enable = value & self.mask();
    }

    /// Write-1-to-clear; takes effect on the next [`EventManager::tick`]
    pub fn write_pending(&mut self, value: u32) {
        self.clear |= value & self.mask();
    }

    /// Interrupt line toward the platform
    pub fn irq(&self) -> bool {
        self.pending() & self.enable != 0
    }

    /// Sample every trigger (indexed like the sources)
    pub fn tick(&mut self, triggers: &[bool]) {
        debug_assert_eq!(triggers.len(), self.sources.len());
        let clear = std::mem::take(&mut self.clear);
        for (idx, (source, &trigger)) in self.sources.iter_mut().zip(triggers).enumerate() {
            source.tick(trigger, clear & (1 << idx) != 0);
        }
    }

    fn mask(&self) -> u32 {
        if self.sources.len() >= 32 {
            u32::MAX
        } else {
            (1u32 << self.sources.len()) - 1
        }
    }

    fn bits(&self, f: impl Fn(&EventSourcePulse) -> bool) -> u32 {
        self.sources
            .iter()
            .enumerate()
            .fold(0, |acc, (idx, s)| acc | (f(s) as u32) << idx)
    }
}
