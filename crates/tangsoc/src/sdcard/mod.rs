//! SD card subsystem: the controller bridge on the system bus, the wrapped host
//! controller, the pads between them and a card model on the other side.

pub mod bridge;
pub mod card;
pub mod controller;
pub mod crc;
pub mod pins;

pub use bridge::SdBridge;
pub use card::{BlockDevice, CardState, FileBlockDevice, MemoryBlockDevice, SdCard};
pub use controller::SdController;
pub use pins::{SdLines, SdPads, TriState, TriStateBus};
