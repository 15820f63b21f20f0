//! SDRAM model behind a multi-port crossbar.
//!
//! The crossbar hands out native ports. A native port issues commands
//! (`valid`/`we`/`addr`), then supplies write data on a later tick or receives read
//! data after a fixed latency. At most one command is accepted per tick across all
//! ports, granted round-robin. Port addresses count port-width words.
//!
//! [`Wishbone2Native`] turns a Wishbone slave interface into native port traffic; it
//! backs both the main RAM region on the system bus and the ROM bridge.

use crate::error::SocError;
use crate::wishbone::{Request, Response};
use std::collections::VecDeque;
use tracing::{instrument, trace};

/// Ticks between an accepted read command and its data
pub const DEFAULT_READ_LATENCY: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortId(pub usize);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NativeCmd {
    pub valid: bool,
    pub we: bool,
    pub addr: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NativeWdata {
    pub valid: bool,
    pub data: u32,
    /// One bit per byte lane
    pub we_mask: u8,
}

/// Everything a port drives during one tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortOut {
    pub cmd: NativeCmd,
    pub wdata: NativeWdata,
    pub rdata_ready: bool,
}

/// Everything the crossbar answers a port with during one tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortStatus {
    pub cmd_ready: bool,
    pub wdata_ready: bool,
    pub rdata_valid: bool,
    pub rdata: u32,
}

#[derive(Debug, Clone)]
struct PortState {
    data_width: u32,
    pending_writes: VecDeque<u32>,
    reads: VecDeque<(u32, u32)>,
}

/// SDRAM storage plus the port crossbar
#[derive(Debug, Clone)]
pub struct Crossbar {
    storage: Vec<u8>,
    ports: Vec<PortState>,
    rr_next: usize,
    read_latency: u32,
}

impl Crossbar {
    pub fn new(size: usize, read_latency: u32) -> Self {
        Self {
            storage: vec![0; size],
            ports: Vec::new(),
            rr_next: 0,
            read_latency: read_latency.max(1),
        }
    }

    /// Allocate a native port of `data_width` bits (16 or 32)
    pub fn get_port(&mut self, data_width: u32) -> Result<PortId, SocError> {
        if data_width != 16 && data_width != 32 {
            return Err(SocError::Width(format!(
                "native ports are 16 or 32 bits wide, not {data_width}"
            )));
        }
        self.ports.push(PortState {
            data_width,
            pending_writes: VecDeque::new(),
            reads: VecDeque::new(),
        });
        Ok(PortId(self.ports.len() - 1))
    }

    pub fn port_width(&self, port: PortId) -> u32 {
        self.ports[port.0].data_width
    }

    pub fn ports(&self) -> usize {
        self.ports.len()
    }

    pub fn size(&self) -> usize {
        self.storage.len()
    }

    /// Direct view of the memory contents
    pub fn contents(&self) -> &[u8] {
        &self.storage
    }

    /// Copy `data` into memory at byte `offset`, bypassing the ports
    pub fn load(&mut self, offset: usize, data: &[u8]) -> Result<(), SocError> {
        let end = offset
            .checked_add(data.len())
            .filter(|&end| end <= self.storage.len())
            .ok_or_else(|| {
                SocError::Image(format!(
                    "{} bytes at {:#x} do not fit in {} bytes of SDRAM",
                    data.len(),
                    offset,
                    self.storage.len()
                ))
            })?;
        self.storage[offset..end].copy_from_slice(data);
        Ok(())
    }

    /// Controller reset: commands in flight are dropped, memory contents are kept
    pub fn abort_all(&mut self) {
        for port in &mut self.ports {
            port.pending_writes.clear();
            port.reads.clear();
        }
        self.rr_next = 0;
    }

    /// Read `len` bytes at byte `offset`, bypassing the ports
    pub fn dump(&self, offset: usize, len: usize) -> &[u8] {
        let start = offset.min(self.storage.len());
        let end = offset.saturating_add(len).min(self.storage.len());
        &self.storage[start..end]
    }

    fn word_bytes(&self, port: usize, addr: u32) -> usize {
        let bytes = (self.ports[port].data_width / 8) as usize;
        (addr as usize * bytes) % self.storage.len().max(1)
    }

    fn read_word(&self, port: usize, addr: u32) -> u32 {
        let bytes = (self.ports[port].data_width / 8) as usize;
        let base = self.word_bytes(port, addr);
        (0..bytes).fold(0u32, |acc, lane| {
            let byte = self.storage.get(base + lane).copied().unwrap_or(0);
            acc | (byte as u32) << (8 * lane)
        })
    }

    fn write_word(&mut self, port: usize, addr: u32, data: u32, we_mask: u8) {
        let bytes = (self.ports[port].data_width / 8) as usize;
        let base = self.word_bytes(port, addr);
        for lane in 0..bytes {
            if we_mask & (1 << lane) != 0
                && let Some(byte) = self.storage.get_mut(base + lane)
            {
                *byte = (data >> (8 * lane)) as u8;
            }
        }
    }

    /// One system clock tick. `outs` holds the output of every port, indexed by
    /// [`PortId`]; the returned statuses are the handshakes of this same tick.
    pub fn tick(&mut self, outs: &[PortOut]) -> Vec<PortStatus> {
        debug_assert_eq!(outs.len(), self.ports.len());
        let mut status = vec![PortStatus::default(); self.ports.len()];

        // Read data whose latency has elapsed
        for (idx, port) in self.ports.iter_mut().enumerate() {
            for entry in port.reads.iter_mut() {
                entry.0 = entry.0.saturating_sub(1);
            }
            if let Some(&(0, data)) = port.reads.front()
                && outs[idx].rdata_ready
            {
                port.reads.pop_front();
                status[idx].rdata_valid = true;
                status[idx].rdata = data;
            }
        }

        // Write data for previously accepted write commands
        for idx in 0..self.ports.len() {
            let wdata = outs[idx].wdata;
            if wdata.valid
                && let Some(addr) = self.ports[idx].pending_writes.pop_front()
            {
                self.write_word(idx, addr, wdata.data, wdata.we_mask);
                status[idx].wdata_ready = true;
                trace!(port = idx, addr, data = wdata.data, "sdram write");
            }
        }

        // One command per tick, round-robin
        let count = self.ports.len();
        let winner = (0..count)
            .map(|n| (self.rr_next + n) % count)
            .find(|&idx| outs[idx].cmd.valid);
        if let Some(idx) = winner {
            let cmd = outs[idx].cmd;
            status[idx].cmd_ready = true;
            self.rr_next = (idx + 1) % count;
            if cmd.we {
                self.ports[idx].pending_writes.push_back(cmd.addr);
            } else {
                let data = self.read_word(idx, cmd.addr);
                self.ports[idx].reads.push_back((self.read_latency, data));
                trace!(port = idx, addr = cmd.addr, data, "sdram read");
            }
        }

        status
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AdapterState {
    Cmd,
    Write,
    Read,
}

/// Wishbone slave to native port adapter.
///
/// Each Wishbone access becomes one command followed by one write beat or one read
/// beat. When the port is wider than the Wishbone interface, `ratio` Wishbone words
/// share a port word: the port address is `adr / ratio` and the lane is `adr % ratio`.
#[derive(Debug, Clone)]
pub struct Wishbone2Native {
    port: PortId,
    wb_width: u32,
    ratio: u32,
    state: AdapterState,
}

impl Wishbone2Native {
    pub fn new(port: PortId, wb_width: u32, port_width: u32) -> Result<Self, SocError> {
        if wb_width == 0 || wb_width > port_width || port_width % wb_width != 0 {
            return Err(SocError::Width(format!(
                "{wb_width}-bit wishbone can not drive a {port_width}-bit native port"
            )));
        }
        Ok(Self {
            port,
            wb_width,
            ratio: port_width / wb_width,
            state: AdapterState::Cmd,
        })
    }

    pub fn port(&self) -> PortId {
        self.port
    }

    pub fn ratio(&self) -> u32 {
        self.ratio
    }

    /// Whether an access is in flight on the port
    pub fn busy(&self) -> bool {
        self.state != AdapterState::Cmd
    }

    /// Forget the access in flight; only valid together with [`Crossbar::abort_all`]
    pub fn reset(&mut self) {
        self.state = AdapterState::Cmd;
    }

    fn lane(&self, adr: u32) -> u32 {
        adr % self.ratio
    }

    fn wb_mask(&self) -> u32 {
        if self.wb_width >= 32 {
            u32::MAX
        } else {
            (1 << self.wb_width) - 1
        }
    }

    /// What the adapter drives on the port this tick for the Wishbone request `wb`
    pub fn port_out(&self, wb: &Request) -> PortOut {
        match self.state {
            AdapterState::Cmd => PortOut {
                cmd: NativeCmd {
                    valid: wb.is_active(),
                    we: wb.we,
                    addr: wb.adr / self.ratio,
                },
                ..PortOut::default()
            },
            AdapterState::Write => {
                let shift = self.lane(wb.adr) * self.wb_width;
                let lanes = self.wb_width / 8;
                let sel = wb.sel as u32 & ((1 << lanes) - 1);
                PortOut {
                    wdata: NativeWdata {
                        valid: true,
                        data: (wb.dat_w & self.wb_mask()) << shift,
                        we_mask: (sel << (self.lane(wb.adr) * lanes)) as u8,
                    },
                    ..PortOut::default()
                }
            }
            AdapterState::Read => PortOut {
                rdata_ready: true,
                ..PortOut::default()
            },
        }
    }

    /// Advance with the crossbar's answer; returns the Wishbone response of this tick
    #[instrument(level = "trace", skip(self), fields(port = self.port.0))]
    pub fn update(&mut self, wb: &Request, status: &PortStatus) -> Response {
        match self.state {
            AdapterState::Cmd => {
                if wb.is_active() && status.cmd_ready {
                    self.state = if wb.we {
                        AdapterState::Write
                    } else {
                        AdapterState::Read
                    };
                }
                Response::idle()
            }
            AdapterState::Write => {
                if status.wdata_ready {
                    self.state = AdapterState::Cmd;
                    Response::ack(0)
                } else {
                    Response::idle()
                }
            }
            AdapterState::Read => {
                if status.rdata_valid {
                    self.state = AdapterState::Cmd;
                    let shift = self.lane(wb.adr) * self.wb_width;
                    Response::ack((status.rdata >> shift) & self.wb_mask())
                } else {
                    Response::idle()
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Run one Wishbone access through an adapter to completion
    fn access(
        xbar: &mut Crossbar,
        adapter: &mut Wishbone2Native,
        req: Request,
    ) -> (Response, usize) {
        for tick in 0..64 {
            let mut outs = vec![PortOut::default(); xbar.ports()];
            outs[adapter.port().0] = adapter.port_out(&req);
            let status = xbar.tick(&outs);
            let resp = adapter.update(&req, &status[adapter.port().0]);
            if resp.ack {
                return (resp, tick);
            }
        }
        panic!("access never acknowledged");
    }

    #[test]
    fn write_then_read_back_through_32_bit_port() {
        let mut xbar = Crossbar::new(1024, DEFAULT_READ_LATENCY);
        let port = xbar.get_port(32).unwrap();
        let mut wb = Wishbone2Native::new(port, 32, 32).unwrap();

        access(&mut xbar, &mut wb, Request::write(3, 0xdead_beef, 0xf));
        assert_eq!(&xbar.contents()[12..16], &[0xef, 0xbe, 0xad, 0xde]);

        let (resp, ticks) = access(&mut xbar, &mut wb, Request::read(3, 0xf));
        assert_eq!(resp.dat_r, 0xdead_beef);
        assert!(ticks >= DEFAULT_READ_LATENCY as usize);
    }

    #[test]
    fn sixteen_bit_wishbone_selects_lanes_of_a_32_bit_port() {
        let mut xbar = Crossbar::new(64, 2);
        xbar.load(0, &[0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88])
            .unwrap();
        let port = xbar.get_port(32).unwrap();
        let mut rom = Wishbone2Native::new(port, 16, 32).unwrap();
        assert_eq!(rom.ratio(), 2);

        let words: Vec<u32> = (0..4)
            .map(|adr| access(&mut xbar, &mut rom, Request::read(adr, 0b11)).0.dat_r)
            .collect();
        assert_eq!(words, vec![0x2211, 0x4433, 0x6655, 0x8877]);

        // A write into the upper lane leaves the lower lane alone
        access(&mut xbar, &mut rom, Request::write(1, 0xabcd, 0b11));
        assert_eq!(&xbar.contents()[0..4], &[0x11, 0x22, 0xcd, 0xab]);
    }

    #[test]
    fn wider_wishbone_than_port_is_rejected() {
        let mut xbar = Crossbar::new(64, 2);
        let port = xbar.get_port(16).unwrap();
        assert!(matches!(
            Wishbone2Native::new(port, 32, 16),
            Err(SocError::Width(_))
        ));
        assert!(matches!(xbar.get_port(64), Err(SocError::Width(_))));
    }

    #[test]
    fn one_command_per_tick_round_robin() {
        let mut xbar = Crossbar::new(64, 1);
        let a = xbar.get_port(32).unwrap();
        let b = xbar.get_port(32).unwrap();
        let read = PortOut {
            cmd: NativeCmd {
                valid: true,
                we: false,
                addr: 0,
            },
            rdata_ready: true,
            ..PortOut::default()
        };

        let first = xbar.tick(&[read, read]);
        assert!(first[a.0].cmd_ready && !first[b.0].cmd_ready);
        let second = xbar.tick(&[read, read]);
        assert!(!second[a.0].cmd_ready && second[b.0].cmd_ready);
    }

    #[test]
    fn abort_drops_the_read_in_flight() {
        let mut xbar = Crossbar::new(64, 4);
        xbar.load(0, &[1, 0, 0, 0, 2, 0, 0, 0]).unwrap();
        let port = xbar.get_port(32).unwrap();
        let mut wb = Wishbone2Native::new(port, 32, 32).unwrap();

        let stale = Request::read(0, 0xf);
        let status = xbar.tick(&[wb.port_out(&stale)]);
        wb.update(&stale, &status[0]);
        assert!(wb.busy());

        xbar.abort_all();
        wb.reset();
        let (resp, _) = access(&mut xbar, &mut wb, Request::read(1, 0xf));
        assert_eq!(resp.dat_r, 2);
    }
}
