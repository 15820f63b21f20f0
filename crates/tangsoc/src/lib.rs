pub mod args;
pub mod cdc;
pub mod core;
pub mod crg;
pub mod csr;
pub mod display;
pub mod dram;
pub mod emu_core;
pub mod error;
pub mod firmware;
pub mod host;
pub mod interconnect;
pub mod irq;
pub mod rom_bridge;
pub mod scheduler;
pub mod sdcard;
pub mod video;
pub mod wishbone;

// Re-export commonly used types
pub use args::{Args, build_soc, load_rom_data};
pub use crate::core::{Board, FeatureSet, Soc, SocConfig, SocStats, StopReason};
pub use crg::{ClockPlan, CrgConfig};
pub use emu_core::{DemoCore, EmulationCore};
pub use error::SocError;
pub use firmware::BootImage;
pub use host::HostBus;
pub use sdcard::{BlockDevice, FileBlockDevice, MemoryBlockDevice};
pub use video::{Rgb, VideoPolicy, VideoTimings};
