//! Host-side bus access.
//!
//! [`HostInitiator`] is a bus master standing in for the soft CPU: it holds one access
//! on the bus until the fabric answers, then drops `cyc` for at least one tick so the
//! arbiter can hand the bus to another master. [`HostBus`] is the blocking view of it used by
//! the boot firmware and the tests; the SoC implements it by running ticks until the
//! access completes.

use crate::error::SocError;
use crate::wishbone::{InterfaceSpec, Request, Response};
use tracing::trace;

/// 32-bit word access by byte address
pub trait HostBus {
    fn read32(&mut self, addr: u32) -> Result<u32, SocError>;
    fn write32(&mut self, addr: u32, value: u32) -> Result<(), SocError>;

    /// Poll `addr` until `done` holds for its value, at most `polls` times
    fn poll32(
        &mut self,
        addr: u32,
        polls: u32,
        done: impl Fn(u32) -> bool,
    ) -> Result<u32, SocError>
    where
        Self: Sized,
    {
        for _ in 0..polls {
            let value = self.read32(addr)?;
            if done(value) {
                return Ok(value);
            }
        }
        Err(SocError::BusTimeout {
            addr,
            ticks: polls as u64,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct HostInitiator {
    current: Option<Request>,
    completed: Option<Response>,
    /// The last access ended on the previous tick; the bus is released for this one
    released: bool,
    accesses: u64,
}

impl HostInitiator {
    /// 32-bit data, 30-bit word address: the whole byte address space
    pub const SPEC: InterfaceSpec = InterfaceSpec::word(32, 30);

    pub fn new() -> Self {
        Self::default()
    }

    /// Start an access; `addr` is a byte address
    pub fn start(&mut self, addr: u32, write: Option<u32>) {
        debug_assert!(self.current.is_none(), "host access already in flight");
        let adr = addr >> 2;
        let req = match write {
            Some(value) => Request::write(adr, value, 0xf),
            None => Request::read(adr, 0xf),
        };
        trace!(addr, ?write, "host access");
        self.current = Some(req);
        self.completed = None;
    }

    pub fn busy(&self) -> bool {
        self.current.is_some()
    }

    /// Request on the bus this tick
    pub fn request(&self) -> Request {
        match self.current {
            Some(req) if !self.released => req,
            _ => Request::idle(),
        }
    }

    /// The fabric's answer to [`HostInitiator::request`]
    pub fn update(&mut self, resp: &Response) {
        if std::mem::take(&mut self.released) {
            return;
        }
        if self.current.is_some() && resp.is_done() {
            self.current = None;
            self.completed = Some(*resp);
            self.released = true;
            self.accesses += 1;
        }
    }

    /// Response of the last finished access, once
    pub fn take_completed(&mut self) -> Option<Response> {
        self.completed.take()
    }

    /// Abandon the access in flight
    pub fn abort(&mut self) {
        self.current = None;
        self.completed = None;
        self.released = false;
    }

    /// Accesses completed so far
    pub fn accesses(&self) -> u64 {
        self.accesses
    }
}
