//! Shared system bus fabric.
//!
//! Masters and slaves are registered once at construction and referred to by handle.
//! Every system tick the fabric runs in two phases:
//!
//! 1. [`Interconnect::decode`] takes the request of every master, arbitrates, and
//!    returns the request each slave sees.
//! 2. [`Interconnect::respond`] takes the response of every slave and returns the
//!    response each master sees.
//!
//! Masters with a region have their byte addresses folded into it
//! (`origin + (address % size)`). Slaves receive their own word address
//! (`(address - origin) / 4`). Accesses that hit no slave, and accesses left without an
//! acknowledge for `timeout` ticks, are answered with `err`.

use crate::error::SocError;
use crate::wishbone::{InterfaceSpec, Request, Response};
use tracing::{debug, warn};

/// A byte address window on the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub origin: u32,
    pub size: u32,
}

impl Region {
    pub const fn new(origin: u32, size: u32) -> Self {
        Self { origin, size }
    }

    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.origin && (addr - self.origin) < self.size
    }

    fn overlaps(&self, other: &Region) -> bool {
        let a_end = self.origin as u64 + self.size as u64;
        let b_end = other.origin as u64 + other.size as u64;
        (self.origin as u64) < b_end && (other.origin as u64) < a_end
    }

    /// Fold an arbitrary byte address into this region
    pub fn remap(&self, addr: u32) -> u32 {
        self.origin.wrapping_add(addr % self.size)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MasterId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlaveId(pub usize);

#[derive(Debug, Clone)]
struct MasterPort {
    name: String,
    spec: InterfaceSpec,
    region: Option<Region>,
}

#[derive(Debug, Clone)]
struct SlavePort {
    name: String,
    region: Region,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Idle,
    Slave { master: usize, slave: usize },
    Unmapped { master: usize, addr: u32 },
}

#[derive(Debug, Clone)]
pub struct Interconnect {
    masters: Vec<MasterPort>,
    slaves: Vec<SlavePort>,
    grant: Option<usize>,
    rr_next: usize,
    route: Route,
    watchdog: u64,
    timeout: u64,
    errors: u64,
}

impl Interconnect {
    /// Create an empty fabric whose watchdog fires after `timeout` ticks
    pub fn new(timeout: u64) -> Self {
        Self {
            masters: Vec::new(),
            slaves: Vec::new(),
            grant: None,
            rr_next: 0,
            route: Route::Idle,
            watchdog: 0,
            timeout,
            errors: 0,
        }
    }

    /// Register an initiator, optionally confined to `region`
    pub fn add_master(
        &mut self,
        name: &str,
        spec: InterfaceSpec,
        region: Option<Region>,
    ) -> Result<MasterId, SocError> {
        if let Some(region) = region
            && region.size == 0
        {
            return Err(SocError::Config(format!("master {name} has an empty region")));
        }
        debug!("bus master {}: {:?} {:x?}", name, spec, region);
        self.masters.push(MasterPort {
            name: name.to_string(),
            spec,
            region,
        });
        Ok(MasterId(self.masters.len() - 1))
    }

    /// Register a target serving `region`
    pub fn add_slave(&mut self, name: &str, region: Region) -> Result<SlaveId, SocError> {
        if region.size == 0 {
            return Err(SocError::Config(format!("slave {name} has an empty region")));
        }
        if let Some(other) = self.slaves.iter().find(|s| s.region.overlaps(&region)) {
            return Err(SocError::Config(format!(
                "slave {} overlaps slave {}",
                name, other.name
            )));
        }
        debug!("bus slave {}: {:x?}", name, region);
        self.slaves.push(SlavePort {
            name: name.to_string(),
            region,
        });
        Ok(SlaveId(self.slaves.len() - 1))
    }

    pub fn masters(&self) -> usize {
        self.masters.len()
    }

    pub fn slaves(&self) -> usize {
        self.slaves.len()
    }

    /// Master currently owning the bus
    pub fn grant(&self) -> Option<MasterId> {
        self.grant.map(MasterId)
    }

    /// Number of `err` responses produced by the fabric itself
    pub fn errors(&self) -> u64 {
        self.errors
    }

    /// Byte address a master request targets after remapping
    fn target_address(&self, master: usize, req: &Request) -> u32 {
        let port = &self.masters[master];
        let addr = port.spec.byte_address(req.adr);
        match port.region {
            Some(region) => region.remap(addr),
            None => addr,
        }
    }

    /// Arbitrate and route master requests (indexed by [`MasterId`]) to the slaves
    /// (indexed by [`SlaveId`]).
    pub fn decode(&mut self, master_reqs: &[Request]) -> Vec<Request> {
        debug_assert_eq!(master_reqs.len(), self.masters.len());
        let mut slave_reqs = vec![Request::idle(); self.slaves.len()];

        // Hold the grant for the whole cycle, then hand it round-robin
        if !self.grant.is_some_and(|g| master_reqs[g].cyc) {
            let count = self.masters.len();
            self.grant = (0..count)
                .map(|n| (self.rr_next + n) % count.max(1))
                .find(|&m| master_reqs[m].cyc);
            if let Some(g) = self.grant {
                self.rr_next = (g + 1) % count;
            }
            self.watchdog = 0;
        }

        self.route = match self.grant {
            None => Route::Idle,
            Some(master) => {
                let req = &master_reqs[master];
                let addr = self.target_address(master, req);
                match self.slaves.iter().position(|s| s.region.contains(addr)) {
                    Some(slave) => {
                        let region = self.slaves[slave].region;
                        slave_reqs[slave] = Request {
                            adr: (addr - region.origin) >> 2,
                            ..*req
                        };
                        Route::Slave { master, slave }
                    }
                    None => Route::Unmapped { master, addr },
                }
            }
        };

        slave_reqs
    }

    /// Route slave responses back to the granted master.
    ///
    /// `master_reqs` must be the same requests passed to [`Interconnect::decode`] this
    /// tick.
    pub fn respond(&mut self, master_reqs: &[Request], slave_resps: &[Response]) -> Vec<Response> {
        debug_assert_eq!(slave_resps.len(), self.slaves.len());
        let mut master_resps = vec![Response::idle(); self.masters.len()];

        let (master, mut resp) = match self.route {
            Route::Idle => return master_resps,
            Route::Slave { master, slave } => (master, slave_resps[slave]),
            Route::Unmapped { master, addr } => {
                if master_reqs[master].is_active() {
                    warn!(
                        "{}: access to unmapped address {:#010x}",
                        self.masters[master].name, addr
                    );
                    self.errors += 1;
                    (master, Response::error())
                } else {
                    (master, Response::idle())
                }
            }
        };

        if master_reqs[master].is_active() && !resp.is_done() {
            self.watchdog += 1;
            if self.watchdog >= self.timeout {
                warn!(
                    "{}: bus timeout after {} ticks at {:#010x}",
                    self.masters[master].name,
                    self.watchdog,
                    self.target_address(master, &master_reqs[master])
                );
                self.errors += 1;
                self.watchdog = 0;
                resp = Response::error();
            }
        } else {
            self.watchdog = 0;
        }

        master_resps[master] = resp;
        master_resps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostInitiator;

    fn fabric(timeout: u64) -> (Interconnect, MasterId, MasterId, SlaveId, SlaveId) {
        let mut bus = Interconnect::new(timeout);
        let cpu = bus
            .add_master("cpu", InterfaceSpec::word(32, 30), None)
            .unwrap();
        let dma = bus
            .add_master(
                "dma",
                InterfaceSpec::word(32, 29),
                Some(Region::new(0x4000_0000, 0x0080_0000)),
            )
            .unwrap();
        let regs = bus
            .add_slave("regs", Region::new(0x3000_0000, 0x400))
            .unwrap();
        let ram = bus
            .add_slave("ram", Region::new(0x4000_0000, 0x0080_0000))
            .unwrap();
        (bus, cpu, dma, regs, ram)
    }

    #[test]
    fn decodes_to_slave_local_word_address() {
        let (mut bus, cpu, _dma, regs, ram) = fabric(100);
        let reqs = [Request::read(0x3000_0010 >> 2, 0xf), Request::idle()];
        let slaves = bus.decode(&reqs);
        assert_eq!(slaves[regs.0].adr, 4);
        assert!(slaves[regs.0].is_active());
        assert!(!slaves[ram.0].cyc);

        let resps = bus.respond(&reqs, &[Response::ack(0x1234), Response::idle()]);
        assert_eq!(resps[cpu.0], Response::ack(0x1234));
    }

    #[test]
    fn master_region_folds_addresses() {
        let (mut bus, _cpu, dma, _regs, ram) = fabric(100);
        // Offset 0x100 expressed without the region origin
        let reqs = [Request::idle(), Request::write(0x100 >> 2, 7, 0xf)];
        let slaves = bus.decode(&reqs);
        assert_eq!(bus.grant(), Some(dma));
        assert_eq!(slaves[ram.0].adr, 0x40);
        assert_eq!(slaves[ram.0].dat_w, 7);
    }

    #[test]
    fn unmapped_address_gets_err() {
        let (mut bus, cpu, ..) = fabric(100);
        let reqs = [Request::read(0x1000_0000 >> 2, 0xf), Request::idle()];
        bus.decode(&reqs);
        let resps = bus.respond(&reqs, &[Response::idle(), Response::idle()]);
        assert!(resps[cpu.0].err);
        assert_eq!(bus.errors(), 1);
    }

    #[test]
    fn watchdog_answers_stalled_cycles_with_err() {
        let (mut bus, cpu, ..) = fabric(5);
        let reqs = [Request::read(0x3000_0000 >> 2, 0xf), Request::idle()];
        let mut errs = 0;
        for tick in 0..5 {
            bus.decode(&reqs);
            let resps = bus.respond(&reqs, &[Response::idle(), Response::idle()]);
            if resps[cpu.0].err {
                errs += 1;
                assert_eq!(tick, 4);
            }
        }
        assert_eq!(errs, 1);
    }

    #[test]
    fn round_robin_holds_grant_while_cyc_is_high() {
        let (mut bus, cpu, dma, ..) = fabric(100);
        let both = [
            Request::read(0x3000_0000 >> 2, 0xf),
            Request::read(0x0, 0xf),
        ];
        bus.decode(&both);
        assert_eq!(bus.grant(), Some(cpu));
        bus.decode(&both);
        assert_eq!(bus.grant(), Some(cpu));

        // cpu releases: dma wins
        let dma_only = [Request::idle(), both[1]];
        bus.decode(&dma_only);
        assert_eq!(bus.grant(), Some(dma));

        // both request again: dma keeps it until it drops cyc, then cpu is next
        bus.decode(&both);
        assert_eq!(bus.grant(), Some(dma));
        bus.decode(&[both[0], Request::idle()]);
        assert_eq!(bus.grant(), Some(cpu));
    }

    #[test]
    fn polling_host_lets_a_waiting_master_in() {
        let (mut bus, cpu, dma, ..) = fabric(100);
        let mut host = HostInitiator::new();
        let dma_req = Request::write(0x10 >> 2, 5, 0xf);
        let mut dma_granted = false;
        for _ in 0..20 {
            // Back-to-back register polls, answered on the tick they are issued
            if !host.busy() {
                host.start(0x3000_0000, None);
            }
            let reqs = [host.request(), dma_req];
            bus.decode(&reqs);
            if bus.grant() == Some(dma) {
                dma_granted = true;
                break;
            }
            let resps = bus.respond(&reqs, &[Response::ack(0), Response::idle()]);
            host.update(&resps[cpu.0]);
            host.take_completed();
        }
        assert!(dma_granted);
    }

    #[test]
    fn overlapping_slaves_are_rejected() {
        let (mut bus, ..) = fabric(100);
        assert!(matches!(
            bus.add_slave("dup", Region::new(0x4000_1000, 0x100)),
            Err(SocError::Config(_))
        ));
    }
}
