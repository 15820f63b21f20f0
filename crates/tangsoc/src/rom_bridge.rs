//! ROM read relay between the emulation core and SDRAM.
//!
//! The core's ROM bus (16-bit data, 21-bit word address) is clocked by the core's
//! domain; the SDRAM port by the system domain. Requests and responses cross through
//! two small queues. Exactly one transaction is in flight at a time and each is relayed
//! as is: no caching, no reordering, no address translation beyond width adaptation.

use crate::cdc::AsyncFifo;
use crate::dram::{PortId, PortOut, PortStatus, Wishbone2Native};
use crate::error::SocError;
use crate::wishbone::{InterfaceSpec, Request, Response};
use tangsoc_hw::specs::bus;
use tracing::trace;

const QUEUE_DEPTH: usize = 4;

#[derive(Debug, Clone)]
pub struct RomBridge {
    requests: AsyncFifo<Request>,
    responses: AsyncFifo<u32>,
    // Core side
    outstanding: bool,
    // System side
    adapter: Wishbone2Native,
    current: Option<Request>,
    pending_resp: Option<u32>,
    /// The port access in flight was issued before the last reset
    discard: bool,
    relayed: u64,
}

impl RomBridge {
    /// Upstream interface of the emulation core
    pub const UPSTREAM_SPEC: InterfaceSpec =
        InterfaceSpec::word(bus::ROM_DATA_WIDTH, bus::ROM_ADDRESS_WIDTH);

    /// Bridge onto crossbar port `port` of `port_width` bits
    pub fn new(port: PortId, port_width: u32) -> Result<Self, SocError> {
        Ok(Self {
            requests: AsyncFifo::new(QUEUE_DEPTH),
            responses: AsyncFifo::new(QUEUE_DEPTH),
            outstanding: false,
            adapter: Wishbone2Native::new(port, Self::UPSTREAM_SPEC.data_width, port_width)?,
            current: None,
            pending_resp: None,
            discard: false,
            relayed: 0,
        })
    }

    pub fn port(&self) -> PortId {
        self.adapter.port()
    }

    /// Whether the core has a transaction in flight
    pub fn outstanding(&self) -> bool {
        self.outstanding
    }

    /// Transactions completed on the SDRAM side
    pub fn relayed(&self) -> u64 {
        self.relayed
    }

    /// Forget every queued request and response.
    ///
    /// A port access already accepted by the crossbar still runs to completion, since
    /// the port has no way to cancel it, but its answer never reaches the core.
    pub fn reset(&mut self) {
        self.requests.reset();
        self.responses.reset();
        self.outstanding = false;
        self.pending_resp = None;
        if self.adapter.busy() {
            self.discard = true;
        } else {
            self.current = None;
            self.discard = false;
        }
    }

    /// The SDRAM controller was reset too: the port access in flight is gone
    pub fn abort_port(&mut self) {
        self.adapter.reset();
        self.current = None;
        self.discard = false;
    }

    /// One edge of the core's clock
    pub fn upstream_tick(&mut self, req: &Request) -> Response {
        let data = self.responses.read_tick(self.outstanding);
        let resp = match data {
            Some(data) => {
                self.outstanding = false;
                Response::ack(data & Self::UPSTREAM_SPEC.data_mask())
            }
            None => Response::idle(),
        };

        // The request acknowledged this tick is still on the bus; wait for the next one
        let issue = req.is_active() && !self.outstanding && !resp.ack;
        let relayed = Request {
            adr: Self::UPSTREAM_SPEC.truncate(req.adr),
            dat_w: req.dat_w & Self::UPSTREAM_SPEC.data_mask(),
            sel: req.sel & Self::UPSTREAM_SPEC.sel_mask(),
            ..*req
        };
        if self.requests.write_tick(issue.then_some(relayed)) {
            trace!(adr = relayed.adr, we = relayed.we, "rom request");
            self.outstanding = true;
        }
        resp
    }

    /// What the bridge drives on its SDRAM port this system tick
    pub fn port_out(&self) -> PortOut {
        match &self.current {
            Some(req) => self.adapter.port_out(req),
            None => PortOut::default(),
        }
    }

    /// One edge of the system clock, with the crossbar's answer to
    /// [`RomBridge::port_out`]
    pub fn downstream_tick(&mut self, status: &PortStatus) {
        if let Some(req) = self.current {
            let resp = self.adapter.update(&req, status);
            if resp.ack {
                self.current = None;
                if self.discard {
                    self.discard = false;
                } else {
                    self.pending_resp = Some(resp.dat_r);
                    self.relayed += 1;
                }
            }
        }

        if self.responses.write_tick(self.pending_resp) {
            self.pending_resp = None;
        }

        let idle = self.current.is_none() && self.pending_resp.is_none();
        if let Some(req) = self.requests.read_tick(idle) {
            self.current = Some(req);
        }
    }
}
