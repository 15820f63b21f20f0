//! Hardware constants for the Tang Nano 20K SoC targets: clocks, bus regions, register
//! maps and per-board variant data.

pub mod boards;
pub mod memory_map;
pub mod specs;

pub mod mmio {
    pub mod csr;
    pub mod sdc;
}
