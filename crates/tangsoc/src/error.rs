//! Error type shared by construction, configuration and host-side helpers.
//!
//! Per-tick logic never fails; everything here is raised before simulation starts or by
//! the host initiator when the fabric answers with `err`.

use crate::crg::ClockError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SocError {
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Clock plan error: {0}")]
    Clock(#[from] ClockError),
    #[error("Bus width mismatch: {0}")]
    Width(String),
    #[error("Bus access to {addr:#010x} did not complete within {ticks} ticks")]
    BusTimeout { addr: u32, ticks: u64 },
    #[error("Bus error at {addr:#010x}")]
    BusError { addr: u32 },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Image error: {0}")]
    Image(String),
    #[error("SD card error: {0}")]
    Card(String),
}
