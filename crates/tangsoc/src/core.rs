//! The assembled SoC.
//!
//! [`Soc`] owns every component and drives them from the clock scheduler: the power
//! domain runs the reset sequencer, `hdmi` runs the video pipeline, `nes` runs the
//! emulation core and the upstream side of the ROM bridge, and `sys` runs the bus
//! fabric with main RAM, the CSR bank, the SD bridge and the host initiator. Optional
//! subsystems are picked once, at construction, through a [`FeatureSet`].

use crate::cdc::{AsyncFifo, Synchronizer};
use crate::crg::{ClockPlan, Crg, CrgConfig, Derivation, DomainId};
use crate::csr::CsrBank;
use crate::dram::{Crossbar, DEFAULT_READ_LATENCY, PortOut, Wishbone2Native};
use crate::emu_core::{CoreInputs, EmulationCore};
use crate::error::SocError;
use crate::firmware::{self, BootImage};
use crate::host::{HostBus, HostInitiator};
use crate::interconnect::{Interconnect, MasterId, Region, SlaveId};
use crate::rom_bridge::RomBridge;
use crate::scheduler::{ClockId, Scheduler};
use crate::sdcard::pins::resolve;
use crate::sdcard::{BlockDevice, SdBridge, SdCard};
use crate::video::{
    DisplaySink, PixelSample, Rgb, SelectorRegister, TimingGenerator, VideoPolicy,
    VideoSelector, VideoTimings,
};
use crate::wishbone::Response;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tangsoc_hw::boards::{tang_nano_20k, tang_nano_20k_legacy};
use tangsoc_hw::memory_map::{self, interrupts};
use tangsoc_hw::specs::{bus, video};
use tracing::{debug, info, trace_span, warn};

/// Board target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Board {
    /// SD-card board: system clock divided from the pixel clock, queued slot 0
    #[default]
    TangNano20k,
    /// Earlier revision: own system PLL, passthrough slot 0
    TangNano20kLegacy,
}

impl Board {
    pub fn name(&self) -> &'static str {
        match self {
            Board::TangNano20k => tang_nano_20k::NAME,
            Board::TangNano20kLegacy => tang_nano_20k_legacy::NAME,
        }
    }

    pub fn sys_hz(&self) -> u64 {
        match self {
            Board::TangNano20k => tang_nano_20k::SYS_HZ,
            Board::TangNano20kLegacy => tang_nano_20k_legacy::SYS_HZ,
        }
    }

    pub fn video_policy(&self) -> VideoPolicy {
        match self {
            Board::TangNano20k => VideoPolicy::tang_nano_20k(),
            Board::TangNano20kLegacy => VideoPolicy::tang_nano_20k_legacy(),
        }
    }
}

impl fmt::Display for Board {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Board {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            tang_nano_20k::NAME => Ok(Board::TangNano20k),
            tang_nano_20k_legacy::NAME => Ok(Board::TangNano20kLegacy),
            _ => Err(format!(
                "unknown board {s:?} (expected {} or {})",
                tang_nano_20k::NAME,
                tang_nano_20k_legacy::NAME
            )),
        }
    }
}

/// Configuration for the SoC
#[derive(Debug, Clone)]
pub struct SocConfig {
    pub board: Board,
    /// System clock; the board default when unset
    pub sys_hz: Option<u64>,
    pub timings: VideoTimings,
    /// Selector policy; the board's when unset
    pub policy: Option<VideoPolicy>,
    pub crg: CrgConfig,
    /// Selector value out of reset
    pub selector: u8,
    pub prbs_seed: u32,
    /// Paint color bars as the timing generator's own picture
    pub color_bars: bool,
    /// Fabric watchdog, in system ticks
    pub bus_timeout: u64,
    pub dram_read_latency: u32,
    /// Width of the ROM bridge's SDRAM port (16 or 32)
    pub rom_port_width: u32,
    /// Keep up to this many output samples in the display sink
    pub capture_samples: Option<usize>,
    /// Stop after this many displayed frames
    pub max_frames: Option<u64>,
    /// Stop after this many system clock ticks
    pub max_ticks: Option<u64>,
    /// Stop after this much wall-clock time
    pub timeout_ms: Option<u64>,
}

impl Default for SocConfig {
    fn default() -> Self {
        Self {
            board: Board::default(),
            sys_hz: None,
            timings: VideoTimings::default(),
            policy: None,
            crg: CrgConfig::default(),
            selector: 0,
            prbs_seed: 1,
            color_bars: false,
            bus_timeout: bus::BUS_TIMEOUT_TICKS,
            dram_read_latency: DEFAULT_READ_LATENCY,
            rom_port_width: 32,
            capture_samples: None,
            max_frames: None,
            max_ticks: None,
            timeout_ms: None,
        }
    }
}

/// Optional subsystems
#[derive(Default)]
pub struct FeatureSet {
    sdcard: Option<Box<dyn BlockDevice>>,
    core: Option<Box<dyn EmulationCore>>,
}

impl fmt::Debug for FeatureSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeatureSet")
            .field("sdcard", &self.sdcard)
            .field("core", &self.core.is_some())
            .finish()
    }
}

impl FeatureSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// SD bridge, controller and a card backed by `device`
    pub fn with_sdcard(mut self, device: Box<dyn BlockDevice>) -> Self {
        self.sdcard = Some(device);
        self
    }

    /// Emulation core, with the ROM bridge it reads through
    pub fn with_emulation_core(mut self, core: Box<dyn EmulationCore>) -> Self {
        self.core = Some(core);
        self
    }

    pub fn has_sdcard(&self) -> bool {
        self.sdcard.is_some()
    }

    pub fn has_emulation_core(&self) -> bool {
        self.core.is_some()
    }
}

/// Result of running the SoC
#[derive(Debug, Clone, PartialEq)]
pub enum StopReason {
    /// The requested number of frames was displayed
    FrameLimit,
    /// The tick budget ran out
    TickLimit,
    /// Wall-clock timeout reached
    Timeout,
    /// Simulation error occurred
    Error(String),
}

/// Counters collected while running
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SocStats {
    pub sys_ticks: u64,
    pub hdmi_ticks: u64,
    pub nes_ticks: u64,
    pub frames: u64,
    /// Window ticks the queue had nothing to show
    pub starved: u64,
    /// `err` answers produced by the fabric
    pub bus_errors: u64,
    /// ROM transactions relayed to SDRAM
    pub rom_relayed: u64,
    /// Rising edges of the SD bridge irq line
    pub sd_irqs: u64,
}

#[derive(Debug, Clone, Copy)]
struct Domains {
    power: DomainId,
    hdmi: DomainId,
    nes: DomainId,
    sys: DomainId,
}

struct SdSubsystem {
    bridge: SdBridge,
    card: SdCard,
    slave: SlaveId,
    master: MasterId,
    irq: bool,
}

struct CoreSubsystem {
    core: Box<dyn EmulationCore>,
    bridge: RomBridge,
    line_ready: Synchronizer<bool>,
    vsync: Synchronizer<bool>,
    queue_enable: Synchronizer<bool>,
    /// Latest pixel the core offered, for the direct slot
    pixel: Rgb,
}

pub struct Soc {
    config: SocConfig,
    scheduler: Scheduler,
    fired: Vec<ClockId>,
    crg: Crg,
    domains: Domains,
    in_reset: Vec<bool>,

    // System domain
    bus: Interconnect,
    host: HostInitiator,
    host_master: MasterId,
    crossbar: Crossbar,
    main_ram: Wishbone2Native,
    main_ram_slave: SlaveId,
    csr: CsrBank,
    csr_slave: SlaveId,
    sd: Option<SdSubsystem>,

    // Video domain
    selector_register: SelectorRegister,
    vtg: TimingGenerator,
    selector: VideoSelector,
    sink: DisplaySink,
    pixel_queue: AsyncFifo<Rgb>,
    last_sample: PixelSample,
    line_request: bool,
    vsync: bool,
    /// The selected slot consumes the pixel queue
    queue_enable: bool,

    // Emulation core domain
    emu: Option<CoreSubsystem>,

    stats: SocStats,
    start_time: Instant,
}

impl fmt::Debug for Soc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Soc")
            .field("board", &self.config.board)
            .field("por", &self.crg.por_state())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl Soc {
    /// Build the SoC described by `config` with the subsystems in `features`
    pub fn new(config: SocConfig, features: FeatureSet) -> Result<Self, SocError> {
        config.timings.validate()?;
        if config.prbs_seed == 0 {
            return Err(SocError::Config("PRBS seed must be non-zero".to_string()));
        }
        if config.bus_timeout == 0 {
            return Err(SocError::Config("bus timeout must be non-zero".to_string()));
        }

        info!("=== Clock plan ({}) ===", config.board);
        let sys_hz = config.sys_hz.unwrap_or(config.board.sys_hz());
        let plan = ClockPlan::tang_nano_20k(sys_hz)?;
        let domains = Domains {
            power: plan.power(),
            hdmi: plan.require("hdmi")?,
            nes: plan.require("nes")?,
            sys: plan.require("sys")?,
        };
        let scheduler = Self::build_scheduler(&plan);
        let domain_count = plan.domains().len();
        let crg = Crg::new(plan, config.crg);

        info!("=== System bus ===");
        let mut bus = Interconnect::new(config.bus_timeout);
        let host_master = bus.add_master("host", HostInitiator::SPEC, None)?;
        let mut crossbar = Crossbar::new(memory_map::main_ram::SIZE, config.dram_read_latency);
        let main_ram = Wishbone2Native::new(crossbar.get_port(32)?, 32, 32)?;
        let main_ram_slave = bus.add_slave(
            "main_ram",
            Region::new(memory_map::main_ram::BASE, memory_map::main_ram::SIZE as u32),
        )?;
        let csr_slave = bus.add_slave(
            "csr",
            Region::new(memory_map::csr::BASE, memory_map::csr::SIZE as u32),
        )?;

        let sd = match features.sdcard {
            Some(device) => {
                info!("SD card: {} blocks", device.block_count());
                let master = bus.add_master(
                    "sdcard_dma",
                    SdBridge::MASTER_SPEC,
                    Some(Region::new(
                        memory_map::sdcard_dma::BASE,
                        memory_map::sdcard_dma::SIZE as u32,
                    )),
                )?;
                let slave = bus.add_slave(
                    "sdcard",
                    Region::new(memory_map::sdcard::BASE, memory_map::sdcard::SIZE as u32),
                )?;
                Some(SdSubsystem {
                    bridge: SdBridge::new(),
                    card: SdCard::new(device),
                    slave,
                    master,
                    irq: false,
                })
            }
            None => None,
        };

        let emu = match features.core {
            Some(core) => {
                let port = crossbar.get_port(config.rom_port_width)?;
                info!("ROM bridge on {}-bit SDRAM port", config.rom_port_width);
                Some(CoreSubsystem {
                    core,
                    bridge: RomBridge::new(port, config.rom_port_width)?,
                    line_ready: Synchronizer::new(false),
                    vsync: Synchronizer::new(false),
                    queue_enable: Synchronizer::new(false),
                    pixel: Rgb::BLACK,
                })
            }
            None => None,
        };

        info!("=== Video ===");
        let policy = config.policy.unwrap_or(config.board.video_policy());
        let selector_register = SelectorRegister::new(config.selector);
        let vtg = TimingGenerator::new(config.timings, config.color_bars);
        let selector = VideoSelector::new(
            policy,
            selector_register.clone(),
            config.prbs_seed,
            config.timings.vres,
        );
        let mut sink = DisplaySink::new(config.timings.hres, config.timings.vres);
        if let Some(limit) = config.capture_samples {
            sink = sink.with_capture(limit);
        }
        info!(
            "{}x{} output, slot 0 {:?}, selector {}",
            config.timings.hres, config.timings.vres, policy.slot0, config.selector
        );

        Ok(Self {
            scheduler,
            fired: Vec::new(),
            crg,
            domains,
            in_reset: vec![true; domain_count],
            bus,
            host: HostInitiator::new(),
            host_master,
            crossbar,
            main_ram,
            main_ram_slave,
            csr: CsrBank::new(selector_register.clone()),
            csr_slave,
            sd,
            selector_register,
            vtg,
            selector,
            sink,
            pixel_queue: AsyncFifo::new(video::PIXEL_QUEUE_DEPTH),
            last_sample: PixelSample::default(),
            line_request: false,
            vsync: false,
            queue_enable: false,
            emu,
            stats: SocStats::default(),
            start_time: Instant::now(),
            config,
        })
    }

    /// One scheduler clock per domain, in the plan's order
    fn build_scheduler(plan: &ClockPlan) -> Scheduler {
        let mut scheduler = Scheduler::new();
        for spec in plan.domains() {
            match spec.derivation {
                Derivation::Input | Derivation::Synthesized => {
                    scheduler.add_root(&spec.name, spec.hz);
                }
                Derivation::Divided { source, ratio } => {
                    scheduler.add_divided(&spec.name, ClockId(source.0), ratio);
                }
            }
        }
        scheduler
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn config(&self) -> &SocConfig {
        &self.config
    }

    pub fn crg(&self) -> &Crg {
        &self.crg
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Shared selector register (also reachable through the CSR bank)
    pub fn selector_register(&self) -> SelectorRegister {
        self.selector_register.clone()
    }

    pub fn selector(&self) -> &VideoSelector {
        &self.selector
    }

    pub fn sink(&self) -> &DisplaySink {
        &self.sink
    }

    /// Output sample of the last video tick
    pub fn last_sample(&self) -> PixelSample {
        self.last_sample
    }

    pub fn pixel_queue(&self) -> &AsyncFifo<Rgb> {
        &self.pixel_queue
    }

    pub fn sd_bridge(&self) -> Option<&SdBridge> {
        self.sd.as_ref().map(|sd| &sd.bridge)
    }

    pub fn sd_card_mut(&mut self) -> Option<&mut SdCard> {
        self.sd.as_mut().map(|sd| &mut sd.card)
    }

    pub fn rom_bridge(&self) -> Option<&RomBridge> {
        self.emu.as_ref().map(|emu| &emu.bridge)
    }

    /// Platform interrupt vector, one bit per slot
    pub fn interrupts(&self) -> u32 {
        let sd = self.sd.as_ref().is_some_and(|sd| sd.bridge.irq());
        (sd as u32) << interrupts::WBSDCARD
    }

    pub fn main_ram(&self) -> &[u8] {
        self.crossbar.contents()
    }

    /// Preload main RAM at byte `offset` (ROM images live at offset 0)
    pub fn load_main_ram(&mut self, offset: usize, data: &[u8]) -> Result<(), SocError> {
        self.crossbar.load(offset, data)
    }

    pub fn stats(&self) -> SocStats {
        SocStats {
            frames: self.sink.frame_count(),
            starved: self.selector.starved(),
            bus_errors: self.bus.errors(),
            rom_relayed: self.rom_bridge().map_or(0, |b| b.relayed()),
            ..self.stats
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Whether the video, core and system domains all run
    pub fn out_of_reset(&self) -> bool {
        [self.domains.hdmi, self.domains.nes, self.domains.sys]
            .iter()
            .all(|&d| !self.crg.domain_in_reset(d))
    }

    // ========================================================================
    // Reset control
    // ========================================================================

    /// Assert or release the board's reset button
    pub fn set_external_reset(&mut self, asserted: bool) {
        self.crg.set_external_reset(asserted);
        self.enter_asserted_resets();
    }

    pub fn power_cycle(&mut self) {
        self.crg.power_cycle();
        self.enter_asserted_resets();
    }

    /// Reset assertion is asynchronous: domains the CRG has just put back into reset
    /// drop their state now rather than on their next edge
    fn enter_asserted_resets(&mut self) {
        for domain in [self.domains.hdmi, self.domains.nes, self.domains.sys] {
            if self.crg.domain_in_reset(domain) && !self.in_reset[domain.0] {
                self.in_reset[domain.0] = true;
                self.reset_domain(domain);
            }
        }
    }

    /// Step until every domain has left reset, for at most `max_steps` steps
    pub fn wait_for_reset_release(&mut self, max_steps: u64) -> Result<(), SocError> {
        for _ in 0..max_steps {
            if self.out_of_reset() {
                return Ok(());
            }
            self.step();
        }
        Err(SocError::Config(format!(
            "reset still asserted after {max_steps} steps (POR {:?})",
            self.crg.por_state()
        )))
    }

    // ========================================================================
    // Scheduling
    // ========================================================================

    /// Advance to the next clock edge and run every domain that ticks there
    pub fn step(&mut self) {
        let mut fired = std::mem::take(&mut self.fired);
        self.scheduler.advance(&mut fired);
        for &clock in &fired {
            let domain = DomainId(clock.0);
            if domain == self.domains.power {
                self.crg.tick_power();
                continue;
            }
            self.crg.tick_domain(domain);
            let in_reset = self.crg.domain_in_reset(domain);
            if in_reset != self.in_reset[domain.0] {
                self.in_reset[domain.0] = in_reset;
                if in_reset {
                    self.reset_domain(domain);
                }
            }
            if in_reset {
                continue;
            }

            if domain == self.domains.hdmi {
                let _span = trace_span!("hdmi").entered();
                self.tick_hdmi();
            } else if domain == self.domains.nes {
                let _span = trace_span!("nes").entered();
                self.tick_nes();
            } else if domain == self.domains.sys {
                let _span = trace_span!("sys").entered();
                self.tick_sys();
            }
        }
        self.fired = fired;
    }

    fn reset_domain(&mut self, domain: DomainId) {
        debug!("domain {} entered reset", self.crg.plan().spec(domain).name);
        if domain == self.domains.hdmi {
            self.vtg.reset();
            self.selector.reset(self.config.prbs_seed);
            self.line_request = false;
            self.vsync = false;
            self.queue_enable = false;
            self.pixel_queue.reset();
        } else if domain == self.domains.nes {
            self.pixel_queue.reset();
            if let Some(emu) = self.emu.as_mut() {
                emu.core.reset();
                emu.bridge.reset();
                emu.line_ready.reset(false);
                emu.vsync.reset(false);
                emu.queue_enable.reset(false);
            }
        } else if domain == self.domains.sys {
            if self.host.busy() {
                warn!("host access dropped by reset");
            }
            self.host.abort();
            self.crossbar.abort_all();
            self.main_ram.reset();
            if let Some(emu) = self.emu.as_mut() {
                emu.bridge.reset();
                emu.bridge.abort_port();
            }
            self.csr = CsrBank::new(self.selector_register.clone());
            if let Some(sd) = self.sd.as_mut() {
                sd.bridge = SdBridge::new();
                sd.irq = false;
            }
        }
    }

    /// Run until a stop condition is reached
    pub fn run(&mut self) -> StopReason {
        if self.config.max_frames.is_none()
            && self.config.max_ticks.is_none()
            && self.config.timeout_ms.is_none()
        {
            return StopReason::Error("no frame, tick or time limit set".to_string());
        }
        loop {
            if let Some(reason) = self.stop_condition() {
                info!("Stopping: {:?}", reason);
                return reason;
            }
            // Check the wall clock once per batch of steps
            for _ in 0..4096 {
                self.step();
            }
        }
    }

    /// Run until the display completes one more frame, or `max_steps` elapse.
    /// Returns whether a frame completed.
    pub fn step_frame(&mut self, max_steps: u64) -> bool {
        let frames = self.sink.frame_count();
        for _ in 0..max_steps {
            self.step();
            if self.sink.frame_count() != frames {
                return true;
            }
        }
        false
    }

    /// The configured limit that has been reached, if any
    pub fn stop_condition(&self) -> Option<StopReason> {
        if let Some(max) = self.config.max_frames
            && self.sink.frame_count() >= max
        {
            return Some(StopReason::FrameLimit);
        }
        if let Some(max) = self.config.max_ticks
            && self.stats.sys_ticks >= max
        {
            return Some(StopReason::TickLimit);
        }
        if let Some(timeout_ms) = self.config.timeout_ms {
            let elapsed_ms = self.start_time.elapsed().as_millis() as u64;
            if elapsed_ms >= timeout_ms {
                info!("Timeout reached: {} ms", elapsed_ms);
                return Some(StopReason::Timeout);
            }
        }
        None
    }

    // ========================================================================
    // Domains
    // ========================================================================

    fn tick_hdmi(&mut self) {
        self.stats.hdmi_ticks += 1;
        let timing = self.vtg.current();
        let producer = self.emu.as_ref().map_or(Rgb::BLACK, |emu| emu.pixel);
        let out = self.selector.tick(
            &timing,
            self.sink.ready(),
            &mut self.pixel_queue,
            producer,
        );
        self.sink.tick(&out.pixel);
        self.vtg.tick(out.vin_ready);

        self.line_request = self
            .selector
            .policy()
            .line_request(&timing, self.vtg.vres());
        self.vsync = timing.vsync;
        self.queue_enable = self
            .selector
            .policy()
            .queues_producer(self.selector.select());
        self.last_sample = out.pixel;
    }

    fn tick_nes(&mut self) {
        self.stats.nes_ticks += 1;
        let Some(emu) = self.emu.as_mut() else {
            self.pixel_queue.write_tick(None);
            return;
        };

        let line_ready = emu.line_ready.tick(self.line_request);
        let vsync = emu.vsync.tick(self.vsync);
        let queued = emu.queue_enable.tick(self.queue_enable);
        let pixel = emu.core.pixel();
        let pixel_accepted = if queued {
            self.pixel_queue.write_tick(pixel)
        } else {
            self.pixel_queue.write_tick(None);
            true
        };
        let rom = emu.bridge.upstream_tick(&emu.core.rom_request());
        emu.core.tick(&CoreInputs {
            line_ready,
            vsync,
            pixel_accepted,
            rom,
        });
        if let Some(pixel) = pixel {
            emu.pixel = pixel;
        }
    }

    fn tick_sys(&mut self) {
        self.stats.sys_ticks += 1;

        // Masters, in registration order
        let mut master_reqs = vec![self.host.request()];
        if let Some(sd) = &self.sd {
            master_reqs.push(sd.bridge.master_request());
        }
        let slave_reqs = self.bus.decode(&master_reqs);

        // SDRAM ports, in port order
        let ram_req = slave_reqs[self.main_ram_slave.0];
        let mut outs: Vec<PortOut> = vec![self.main_ram.port_out(&ram_req)];
        if let Some(emu) = &self.emu {
            outs.push(emu.bridge.port_out());
        }
        let status = self.crossbar.tick(&outs);

        let mut slave_resps = vec![Response::idle(); slave_reqs.len()];
        slave_resps[self.main_ram_slave.0] = self
            .main_ram
            .update(&ram_req, &status[self.main_ram.port().0]);
        if let Some(sd) = self.sd.as_mut() {
            slave_resps[sd.slave.0] = sd.bridge.slave_tick(&slave_reqs[sd.slave.0]);
        }
        let events = self.sd.as_mut().map(|sd| sd.bridge.events_mut());
        slave_resps[self.csr_slave.0] = self.csr.tick(&slave_reqs[self.csr_slave.0], events);

        let master_resps = self.bus.respond(&master_reqs, &slave_resps);
        self.host.update(&master_resps[self.host_master.0]);

        if let Some(emu) = self.emu.as_mut() {
            emu.bridge.downstream_tick(&status[emu.bridge.port().0]);
        }

        if let Some(sd) = self.sd.as_mut() {
            let lines = resolve(&sd.bridge.pads(), sd.card.cmd_out(), sd.card.dat_out());
            let dma_resp = master_resps
                .get(sd.master.0)
                .copied()
                .unwrap_or_else(Response::idle);
            sd.bridge.tick(&lines, &dma_resp);
            sd.card.tick(sd.bridge.pads().clk, &lines);

            let irq = sd.bridge.irq();
            if irq && !sd.irq {
                self.stats.sd_irqs += 1;
            }
            sd.irq = irq;
        }
    }

    // ========================================================================
    // Host access
    // ========================================================================

    /// Run one host access to completion. The sys clock edges counted include those
    /// spent in reset, so an access issued before reset release waits for it.
    fn host_access(&mut self, addr: u32, write: Option<u32>) -> Result<u32, SocError> {
        if self.host.busy() {
            return Err(SocError::Config("host access already in flight".to_string()));
        }
        let sys = ClockId(self.domains.sys.0);
        let start = self.scheduler.edges(sys);
        let limit = self.config.bus_timeout.saturating_mul(2) + 64;
        while self.crg.domain_in_reset(self.domains.sys) {
            let waited = self.scheduler.edges(sys) - start;
            if waited > limit {
                return Err(SocError::BusTimeout {
                    addr,
                    ticks: waited,
                });
            }
            self.step();
        }
        self.host.start(addr, write);
        while self.host.busy() {
            let waited = self.scheduler.edges(sys) - start;
            if waited > limit {
                self.host.abort();
                return Err(SocError::BusTimeout {
                    addr,
                    ticks: waited,
                });
            }
            self.step();
        }
        match self.host.take_completed() {
            Some(resp) if resp.err => Err(SocError::BusError { addr }),
            Some(resp) => Ok(resp.dat_r),
            None => Err(SocError::BusError { addr }),
        }
    }

    /// Bring the card up and copy the ROM image from it to the start of main RAM
    pub fn sd_boot(&mut self, image: &BootImage, clock_divider: u32) -> Result<usize, SocError> {
        if self.sd.is_none() {
            return Err(SocError::Config("SD boot needs the SD card subsystem".to_string()));
        }
        firmware::sd_boot(self, image, memory_map::main_ram::BASE, clock_divider)
    }
}

impl HostBus for Soc {
    fn read32(&mut self, addr: u32) -> Result<u32, SocError> {
        self.host_access(addr, None)
    }

    fn write32(&mut self, addr: u32, value: u32) -> Result<(), SocError> {
        self.host_access(addr, Some(value)).map(|_| ())
    }
}

/// Main RAM as seen from the ROM bridge: ROM word `word` is the little-endian halfword
/// at byte `2 * word`
pub fn rom_word(main_ram: &[u8], word: u32) -> Option<u16> {
    let at = 2 * word as usize;
    main_ram
        .get(at..at + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emu_core::DemoCore;

    fn fast_config() -> SocConfig {
        SocConfig {
            crg: CrgConfig {
                por_cycles: 16,
                pll_lock_cycles: 4,
            },
            timings: VideoTimings {
                pixel_hz: 74_250_000,
                hres: 32,
                hsync_start: 34,
                hsync_end: 36,
                hscan: 40,
                vres: 8,
                vsync_start: 9,
                vsync_end: 10,
                vscan: 12,
            },
            bus_timeout: 64,
            ..SocConfig::default()
        }
    }

    #[test]
    fn board_names_round_trip() {
        for board in [Board::TangNano20k, Board::TangNano20kLegacy] {
            assert_eq!(board.name().parse::<Board>(), Ok(board));
        }
        assert!("tang-primer".parse::<Board>().is_err());
    }

    #[test]
    fn zero_seed_is_rejected() {
        let config = SocConfig {
            prbs_seed: 0,
            ..fast_config()
        };
        assert!(matches!(
            Soc::new(config, FeatureSet::new()),
            Err(SocError::Config(_))
        ));
    }

    #[test]
    fn domains_leave_reset_and_tick_at_plan_ratios() {
        let mut soc = Soc::new(fast_config(), FeatureSet::new()).unwrap();
        assert!(!soc.out_of_reset());
        soc.wait_for_reset_release(10_000).unwrap();
        let before = soc.stats();
        while soc.stats().hdmi_ticks - before.hdmi_ticks < 200 {
            soc.step();
        }
        let after = soc.stats();
        // nes shares the pixel clock's divider; sys is the pixel clock halved
        assert_eq!(after.nes_ticks - before.nes_ticks, 200);
        assert_eq!(after.sys_ticks - before.sys_ticks, 100);
        assert!(soc.scheduler().now_seconds() > 0.0);
    }

    #[test]
    fn host_reaches_main_ram_and_csr() {
        let mut soc = Soc::new(fast_config(), FeatureSet::new()).unwrap();
        soc.write32(memory_map::main_ram::BASE + 8, 0xdead_beef).unwrap();
        assert_eq!(soc.read32(memory_map::main_ram::BASE + 8).unwrap(), 0xdead_beef);
        assert_eq!(&soc.main_ram()[8..12], &0xdead_beefu32.to_le_bytes());

        soc.write32(memory_map::csr::BASE, 2).unwrap();
        assert_eq!(soc.selector_register().get(), 2);
    }

    #[test]
    fn unmapped_access_is_a_bus_error() {
        let mut soc = Soc::new(fast_config(), FeatureSet::new()).unwrap();
        assert!(matches!(
            soc.read32(0x1000_0000),
            Err(SocError::BusError { addr: 0x1000_0000 })
        ));
        // No SD bridge: its window is unmapped too
        assert!(soc.read32(memory_map::sdcard::BASE).is_err());
        assert!(soc.stats().bus_errors >= 2);
    }

    #[test]
    fn rom_word_reads_little_endian_halfwords() {
        let ram = [0x34, 0x12, 0x78, 0x56];
        assert_eq!(rom_word(&ram, 1), Some(0x5678));
        assert_eq!(rom_word(&ram, 2), None);
    }

    #[test]
    fn run_needs_a_limit() {
        let mut soc = Soc::new(fast_config(), FeatureSet::new()).unwrap();
        assert!(matches!(soc.run(), StopReason::Error(_)));
        let mut soc = Soc::new(
            SocConfig {
                max_frames: Some(2),
                ..fast_config()
            },
            FeatureSet::new(),
        )
        .unwrap();
        assert_eq!(soc.run(), StopReason::FrameLimit);
        assert!(soc.stats().frames >= 2);
    }

    #[test]
    fn queue_enable_crosses_into_the_core_domain() {
        let config = SocConfig {
            selector: 2,
            ..fast_config()
        };
        let core = DemoCore::new(0).with_line_pixels(8);
        let features = FeatureSet::new().with_emulation_core(Box::new(core));
        let mut soc = Soc::new(config, features).unwrap();
        let core_copy = |soc: &Soc| soc.emu.as_ref().unwrap().queue_enable.output();

        soc.wait_for_reset_release(10_000).unwrap();
        for _ in 0..2000 {
            soc.step();
        }
        // The pattern slot leaves the queue alone
        assert!(!soc.queue_enable);
        assert_eq!(soc.pixel_queue().write_level(), 0);

        soc.selector_register().set(0);
        while !soc.queue_enable {
            soc.step();
        }
        let nes = soc.stats().nes_ticks;
        assert!(!core_copy(&soc));
        while !core_copy(&soc) {
            soc.step();
        }
        // Two core edges at most, one of which may share the hdmi edge's step
        assert!((1..=2).contains(&(soc.stats().nes_ticks - nes)));
    }

    #[test]
    fn power_cycle_enters_reset_at_once() {
        let core = DemoCore::new(0).with_line_pixels(8);
        let features = FeatureSet::new().with_emulation_core(Box::new(core));
        let mut soc = Soc::new(fast_config(), features).unwrap();
        soc.wait_for_reset_release(10_000).unwrap();
        for _ in 0..3000 {
            soc.step();
        }

        soc.power_cycle();
        assert!(soc.in_reset[soc.domains.hdmi.0]);
        assert!(soc.in_reset[soc.domains.nes.0]);
        assert!(soc.in_reset[soc.domains.sys.0]);
        assert!(!soc.queue_enable);
        assert_eq!(soc.pixel_queue().write_level(), 0);
        assert_eq!(soc.pixel_queue().read_level(), 0);
        assert!(!soc.rom_bridge().unwrap().outstanding());

        // A host access issued now waits for the sequencer
        soc.write32(memory_map::csr::BASE, 1).unwrap();
        assert_eq!(soc.read32(memory_map::csr::BASE).unwrap(), 1);
        assert!(!soc.in_reset[soc.domains.sys.0]);
    }
}
