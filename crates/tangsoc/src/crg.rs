//! Clock and reset generation.
//!
//! A [`ClockPlan`] describes every clock domain of the SoC and how it is produced: the
//! free-running power domain driven by the crystal, PLL outputs, and integer-divided
//! clocks. [`Crg`] sequences the resets of those domains:
//!
//! - a power-on countdown clocked by the power domain (`PowerUnstable -> CountingDown ->
//!   Stable`),
//! - PLLs held in reset until the countdown expires, reporting lock a fixed number of
//!   input cycles later,
//! - one two-stage reset synchronizer per domain (asynchronous assert, synchronous
//!   release).

use tangsoc_hw::specs::clocks;
use thiserror::Error;
use tracing::{debug, info};

/// Lowest frequency the GW2A PLL can produce
pub const PLL_MIN_HZ: u64 = 3_125_000;

/// Highest frequency the GW2A PLL can produce
pub const PLL_MAX_HZ: u64 = 625_000_000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClockError {
    #[error("clock {0} has a zero frequency")]
    ZeroFrequency(String),
    #[error("clock {name} at {hz} Hz is outside the PLL output range")]
    NotRepresentable { name: String, hz: u64 },
    #[error("clock {0} is defined twice")]
    Duplicate(String),
    #[error("clock {0} is not part of the plan")]
    Missing(String),
}

/// Index of a domain inside its [`ClockPlan`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DomainId(pub usize);

/// How a domain's clock is produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Derivation {
    /// The board oscillator; never reset
    Input,
    /// A PLL output
    Synthesized,
    /// An integer division of another domain
    Divided { source: DomainId, ratio: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainSpec {
    pub name: String,
    pub hz: u64,
    pub derivation: Derivation,
    /// Also held in reset while the external reset request is asserted
    pub external_reset: bool,
}

/// The domain table produced by [`ClockPlanBuilder`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClockPlan {
    domains: Vec<DomainSpec>,
}

impl ClockPlan {
    pub fn domains(&self) -> &[DomainSpec] {
        &self.domains
    }

    /// The free-running power domain
    pub fn power(&self) -> DomainId {
        DomainId(0)
    }

    pub fn input_hz(&self) -> u64 {
        self.domains[0].hz
    }

    pub fn find(&self, name: &str) -> Option<DomainId> {
        self.domains.iter().position(|d| d.name == name).map(DomainId)
    }

    /// Like [`ClockPlan::find`], for domains the caller cannot run without
    pub fn require(&self, name: &str) -> Result<DomainId, ClockError> {
        self.find(name)
            .ok_or_else(|| ClockError::Missing(name.to_string()))
    }

    pub fn spec(&self, id: DomainId) -> &DomainSpec {
        &self.domains[id.0]
    }

    /// The default Tang Nano 20K plan.
    ///
    /// `sys_hz` decides between the two board targets: 37.125 MHz is half the pixel
    /// clock and is divided down, 54 MHz needs its own PLL.
    pub fn tang_nano_20k(sys_hz: u64) -> Result<ClockPlan, ClockError> {
        ClockPlanBuilder::new(clocks::CLK27_HZ)
            .synthesized("hdmi5x", clocks::HDMI5X_HZ)
            .derived("hdmi", clocks::HDMI_HZ)
            .derived("nes", clocks::NES_HZ)
            .derived("sys", sys_hz)
            .with_external_reset()
            .build()
    }
}

/// Builds a [`ClockPlan`], choosing integer division over synthesis whenever an exact
/// ratio exists.
#[derive(Debug, Clone)]
pub struct ClockPlanBuilder {
    domains: Vec<DomainSpec>,
    error: Option<ClockError>,
}

impl ClockPlanBuilder {
    /// Start a plan driven by an oscillator at `input_hz` (the power domain, `por`)
    pub fn new(input_hz: u64) -> Self {
        let mut builder = Self {
            domains: Vec::new(),
            error: None,
        };
        if input_hz == 0 {
            builder.error = Some(ClockError::ZeroFrequency("por".to_string()));
        }
        builder.domains.push(DomainSpec {
            name: "por".to_string(),
            hz: input_hz,
            derivation: Derivation::Input,
            external_reset: false,
        });
        builder
    }

    /// Add a PLL output
    pub fn synthesized(mut self, name: &str, hz: u64) -> Self {
        if self.check(name, hz) {
            if !(PLL_MIN_HZ..=PLL_MAX_HZ).contains(&hz) {
                self.error = Some(ClockError::NotRepresentable {
                    name: name.to_string(),
                    hz,
                });
            } else {
                self.push(name, hz, Derivation::Synthesized);
            }
        }
        self
    }

    /// Add a domain, dividing an existing one when possible.
    ///
    /// The smallest integer ratio (at least 2) from any non-power domain wins; without
    /// one the domain gets its own PLL.
    pub fn derived(self, name: &str, hz: u64) -> Self {
        if hz == 0 {
            return self.synthesized(name, hz);
        }

        let source = self
            .domains
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(_, d)| d.hz % hz == 0 && d.hz / hz >= 2)
            .min_by_key(|(_, d)| d.hz / hz)
            .map(|(idx, d)| (DomainId(idx), (d.hz / hz) as u32));

        match source {
            Some((source, ratio)) => {
                let mut builder = self;
                if builder.check(name, hz) {
                    builder.push(name, hz, Derivation::Divided { source, ratio });
                }
                builder
            }
            None => self.synthesized(name, hz),
        }
    }

    /// Mark the most recently added domain as sensitive to the external reset request
    pub fn with_external_reset(mut self) -> Self {
        if self.domains.len() > 1
            && let Some(last) = self.domains.last_mut()
        {
            last.external_reset = true;
        }
        self
    }

    pub fn build(self) -> Result<ClockPlan, ClockError> {
        if let Some(error) = self.error {
            return Err(error);
        }
        for domain in &self.domains {
            debug!(
                "clock {}: {} Hz ({:?})",
                domain.name, domain.hz, domain.derivation
            );
        }
        Ok(ClockPlan {
            domains: self.domains,
        })
    }

    fn check(&mut self, name: &str, hz: u64) -> bool {
        if self.error.is_some() {
            return false;
        }
        if hz == 0 {
            self.error = Some(ClockError::ZeroFrequency(name.to_string()));
            return false;
        }
        if self.domains.iter().any(|d| d.name == name) {
            self.error = Some(ClockError::Duplicate(name.to_string()));
            return false;
        }
        true
    }

    fn push(&mut self, name: &str, hz: u64, derivation: Derivation) {
        self.domains.push(DomainSpec {
            name: name.to_string(),
            hz,
            derivation,
            external_reset: false,
        });
    }
}

/// Timing knobs of the reset sequencer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrgConfig {
    /// Power ticks between power-up and a stable power-on reset
    pub por_cycles: u32,
    /// Input ticks a PLL needs to lock after its reset is released
    pub pll_lock_cycles: u32,
}

impl Default for CrgConfig {
    fn default() -> Self {
        Self {
            por_cycles: clocks::POR_CYCLES,
            pll_lock_cycles: clocks::PLL_LOCK_CYCLES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PorState {
    PowerUnstable,
    CountingDown,
    Stable,
}

#[derive(Debug, Clone, Copy, Default)]
struct Pll {
    lock_count: u32,
    locked: bool,
}

/// Two-stage reset synchronizer: asserts immediately, releases two domain edges after
/// the request drops.
#[derive(Debug, Clone, Copy)]
struct ResetSync {
    stages: [bool; 2],
}

impl ResetSync {
    fn asserted() -> Self {
        Self {
            stages: [true, true],
        }
    }
}

/// Clock/reset generator
#[derive(Debug, Clone)]
pub struct Crg {
    plan: ClockPlan,
    config: CrgConfig,
    por_state: PorState,
    por_count: u32,
    external_reset: bool,
    plls: Vec<Option<Pll>>,
    resets: Vec<ResetSync>,
}

impl Crg {
    pub fn new(plan: ClockPlan, config: CrgConfig) -> Self {
        let plls = plan
            .domains
            .iter()
            .map(|d| (d.derivation == Derivation::Synthesized).then(Pll::default))
            .collect();
        let resets = vec![ResetSync::asserted(); plan.domains.len()];
        Self {
            plan,
            config,
            por_state: PorState::PowerUnstable,
            por_count: config.por_cycles,
            external_reset: false,
            plls,
            resets,
        }
    }

    pub fn plan(&self) -> &ClockPlan {
        &self.plan
    }

    pub fn domains(&self) -> &[DomainSpec] {
        self.plan.domains()
    }

    pub fn por_state(&self) -> PorState {
        self.por_state
    }

    /// Assert or release the external reset request (the board's reset button)
    pub fn set_external_reset(&mut self, asserted: bool) {
        if asserted != self.external_reset {
            info!(asserted, "external reset");
        }
        self.external_reset = asserted;
        if asserted {
            for (idx, spec) in self.plan.domains.iter().enumerate() {
                if spec.external_reset {
                    self.resets[idx] = ResetSync::asserted();
                }
            }
        }
    }

    /// Drop power: the countdown re-arms and every domain returns to reset
    pub fn power_cycle(&mut self) {
        info!("power cycle");
        self.por_state = PorState::PowerUnstable;
        self.por_count = self.config.por_cycles;
        for pll in self.plls.iter_mut().flatten() {
            *pll = Pll::default();
        }
        for reset in &mut self.resets {
            *reset = ResetSync::asserted();
        }
    }

    /// One edge of the power (crystal) domain: advances the countdown and the PLL lock
    /// counters.
    ///
    /// The counter is loaded by [`Crg::new`] and [`Crg::power_cycle`], so `Stable` is
    /// reached on exactly the `por_cycles`-th power edge (the first one when
    /// `por_cycles` is zero).
    pub fn tick_power(&mut self) {
        if self.por_state == PorState::PowerUnstable {
            self.por_state = PorState::CountingDown;
        }
        if self.por_state == PorState::CountingDown {
            self.por_count = self.por_count.saturating_sub(1);
            if self.por_count == 0 {
                info!("power-on reset released");
                self.por_state = PorState::Stable;
            }
        }

        for idx in 0..self.plls.len() {
            let held = self.pll_held(DomainId(idx));
            let lock_cycles = self.config.pll_lock_cycles;
            if let Some(pll) = self.plls[idx].as_mut() {
                if held {
                    *pll = Pll::default();
                } else if !pll.locked {
                    pll.lock_count += 1;
                    if pll.lock_count >= lock_cycles {
                        pll.locked = true;
                        info!("PLL {} locked", self.plan.domains[idx].name);
                    }
                }
            }
        }

        self.refresh_async_asserts();
    }

    /// One edge of domain `id`: shifts its reset synchronizer
    pub fn tick_domain(&mut self, id: DomainId) {
        let request = self.reset_request(id);
        let sync = &mut self.resets[id.0];
        let was_in_reset = sync.stages[1];
        if request {
            *sync = ResetSync::asserted();
        } else {
            sync.stages[1] = sync.stages[0];
            sync.stages[0] = false;
        }
        if was_in_reset && !sync.stages[1] {
            info!("domain {} out of reset", self.plan.domains[id.0].name);
        }
    }

    /// Whether domain `id` is currently held in reset
    pub fn domain_in_reset(&self, id: DomainId) -> bool {
        self.reset_request(id) || self.resets[id.0].stages[1]
    }

    /// Whether the PLL of a synthesized domain reports lock
    pub fn pll_locked(&self, id: DomainId) -> Option<bool> {
        self.plls[id.0].map(|pll| pll.locked)
    }

    fn pll_held(&self, id: DomainId) -> bool {
        self.por_state != PorState::Stable
            || (self.plan.domains[id.0].external_reset && self.external_reset)
    }

    fn reset_request(&self, id: DomainId) -> bool {
        let spec = &self.plan.domains[id.0];
        if spec.derivation == Derivation::Input {
            return false;
        }
        if self.por_state != PorState::Stable || (spec.external_reset && self.external_reset) {
            return true;
        }
        match spec.derivation {
            Derivation::Input => false,
            Derivation::Synthesized => !self.plls[id.0].is_some_and(|pll| pll.locked),
            Derivation::Divided { source, .. } => self.reset_request(source),
        }
    }

    fn refresh_async_asserts(&mut self) {
        for idx in 0..self.resets.len() {
            if self.reset_request(DomainId(idx)) {
                self.resets[idx] = ResetSync::asserted();
            }
        }
    }
}
