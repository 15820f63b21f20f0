//! Clock domain crossing primitives.
//!
//! Single-bit and control values cross through a [`Synchronizer`]; multi-bit streams
//! cross through an [`AsyncFifo`], whose Gray-coded pointers are the only state shared
//! between the two sides.

use std::fmt;

/// Two flip-flop synchronizer (MultiReg).
///
/// `tick` is called on every edge of the destination domain with the current value of
/// the source signal; the output lags the input by two edges.
#[derive(Debug, Clone, Copy)]
pub struct Synchronizer<T: Copy> {
    stages: [T; 2],
}

impl<T: Copy> Synchronizer<T> {
    pub fn new(init: T) -> Self {
        Self {
            stages: [init, init],
        }
    }

    /// Sample `input` and return the new output
    pub fn tick(&mut self, input: T) -> T {
        self.stages[1] = self.stages[0];
        self.stages[0] = input;
        self.stages[1]
    }

    pub fn output(&self) -> T {
        self.stages[1]
    }

    /// Force both stages to `value` (reset)
    pub fn reset(&mut self, value: T) {
        self.stages = [value, value];
    }
}

fn to_gray(bin: u32) -> u32 {
    bin ^ (bin >> 1)
}

fn from_gray(gray: u32) -> u32 {
    let mut bin = gray;
    let mut shift = gray >> 1;
    while shift != 0 {
        bin ^= shift;
        shift >>= 1;
    }
    bin
}

/// Bounded FIFO with independent write and read clocks.
///
/// Pointers are one bit wider than the address so full and empty can be told apart.
/// Each side compares its own pointer with a synchronized, therefore late, copy of the
/// other side's pointer: the writer may believe the queue is fuller than it is and the
/// reader may believe it is emptier, never the reverse. Occupancy can not exceed
/// [`AsyncFifo::capacity`] and no sample is ever read twice.
#[derive(Clone)]
pub struct AsyncFifo<T> {
    storage: Vec<Option<T>>,
    depth: u32,
    mask: u32,
    wptr: u32,
    rptr: u32,
    /// Read pointer (Gray) as seen by the write domain
    rptr_sync: Synchronizer<u32>,
    /// Write pointer (Gray) as seen by the read domain
    wptr_sync: Synchronizer<u32>,
}

impl<T> fmt::Debug for AsyncFifo<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncFifo")
            .field("depth", &self.depth)
            .field("wptr", &self.wptr)
            .field("rptr", &self.rptr)
            .finish()
    }
}

impl<T: Clone> AsyncFifo<T> {
    /// Create a FIFO holding up to `depth` entries.
    ///
    /// # Panics
    ///
    /// `depth` must be a non-zero power of two.
    pub fn new(depth: usize) -> Self {
        assert!(
            depth.is_power_of_two() && depth <= 1 << 30,
            "AsyncFifo depth must be a power of two, got {depth}"
        );
        Self {
            storage: vec![None; depth],
            depth: depth as u32,
            mask: (2 * depth as u32) - 1,
            wptr: 0,
            rptr: 0,
            rptr_sync: Synchronizer::new(0),
            wptr_sync: Synchronizer::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.depth as usize
    }

    /// Drop every entry and return both pointers and their synchronized copies to zero
    pub fn reset(&mut self) {
        self.storage.iter_mut().for_each(|slot| *slot = None);
        self.wptr = 0;
        self.rptr = 0;
        self.rptr_sync.reset(0);
        self.wptr_sync.reset(0);
    }

    // ---- write domain ----------------------------------------------------------------

    /// Occupancy as seen by the writer (an over-estimate)
    pub fn write_level(&self) -> usize {
        let rptr = from_gray(self.rptr_sync.output());
        (self.wptr.wrapping_sub(rptr) & self.mask) as usize
    }

    /// The writer may push this tick
    pub fn sink_ready(&self) -> bool {
        self.write_level() < self.depth as usize
    }

    /// One edge of the write clock. Returns whether `data` was accepted.
    pub fn write_tick(&mut self, data: Option<T>) -> bool {
        let accepted = match data {
            Some(value) if self.sink_ready() => {
                let slot = (self.wptr % self.depth) as usize;
                self.storage[slot] = Some(value);
                self.wptr = (self.wptr + 1) & self.mask;
                true
            }
            _ => false,
        };
        self.rptr_sync.tick(to_gray(self.rptr));
        accepted
    }

    // ---- read domain -----------------------------------------------------------------

    /// Occupancy as seen by the reader (an under-estimate)
    pub fn read_level(&self) -> usize {
        let wptr = from_gray(self.wptr_sync.output());
        (wptr.wrapping_sub(self.rptr) & self.mask) as usize
    }

    /// An entry is available to the reader this tick
    pub fn source_valid(&self) -> bool {
        self.read_level() > 0
    }

    /// The head entry, if the reader can see one
    pub fn source_peek(&self) -> Option<&T> {
        if self.source_valid() {
            self.storage[(self.rptr % self.depth) as usize].as_ref()
        } else {
            None
        }
    }

    /// One edge of the read clock. Pops the head entry when `ready` and valid.
    pub fn read_tick(&mut self, ready: bool) -> Option<T> {
        let popped = if ready && self.source_valid() {
            let slot = (self.rptr % self.depth) as usize;
            self.rptr = (self.rptr + 1) & self.mask;
            self.storage[slot].take()
        } else {
            None
        };
        self.wptr_sync.tick(to_gray(self.wptr));
        popped
    }
}
