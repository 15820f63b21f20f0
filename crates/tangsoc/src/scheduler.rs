//! Multi-domain clock edge scheduling.
//!
//! This module interleaves the clock domains of the SoC, keeping the exact frequency
//! ratios of the hardware. Root clocks (the crystal and every PLL output) are placed on an
//! exact rational timeline; divided clocks are phase-locked to their source and fire on
//! every N-th source edge. All edges that land on the same instant are reported together,
//! in dependency order (sources before the clocks derived from them).

use std::cmp::Ordering;
use tracing::trace;

/// Handle to a clock registered with the [`Scheduler`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClockId(pub usize);

#[derive(Debug, Clone)]
enum Timebase {
    /// Edge `k` (1-based) happens at `k / hz` seconds
    Root { hz: u64 },
    /// Fires on every `ratio`-th edge of `source`
    Divided {
        source: ClockId,
        ratio: u32,
        count: u32,
    },
}

#[derive(Debug, Clone)]
struct ClockEntry {
    name: String,
    timebase: Timebase,
    edges: u64,
}

/// An instant on the rational timeline: `edge / hz` seconds
#[derive(Debug, Clone, Copy)]
struct Instant {
    edge: u64,
    hz: u64,
}

impl Instant {
    fn cmp_time(&self, other: &Instant) -> Ordering {
        let lhs = self.edge as u128 * other.hz as u128;
        let rhs = other.edge as u128 * self.hz as u128;
        lhs.cmp(&rhs)
    }
}

/// Scheduler for interleaving clock domains
#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    clocks: Vec<ClockEntry>,
    now: Option<Instant>,
    steps: u64,
}

impl Scheduler {
    /// Create a scheduler with no clocks
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a free-running clock
    pub fn add_root(&mut self, name: &str, hz: u64) -> ClockId {
        debug_assert!(hz > 0, "clock {name} must have a non-zero frequency");
        self.push(name, Timebase::Root { hz })
    }

    /// Register a clock that fires on every `ratio`-th edge of `source`.
    ///
    /// `source` must already be registered, which keeps ids in dependency order.
    pub fn add_divided(&mut self, name: &str, source: ClockId, ratio: u32) -> ClockId {
        debug_assert!(source.0 < self.clocks.len());
        debug_assert!(ratio >= 1);
        self.push(
            name,
            // Edge `ratio` of the source is the first divided edge
            Timebase::Divided {
                source,
                ratio,
                count: 0,
            },
        )
    }

    fn push(&mut self, name: &str, timebase: Timebase) -> ClockId {
        self.clocks.push(ClockEntry {
            name: name.to_string(),
            timebase,
            edges: 0,
        });
        ClockId(self.clocks.len() - 1)
    }

    /// Number of registered clocks
    pub fn len(&self) -> usize {
        self.clocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clocks.is_empty()
    }

    /// Name a clock was registered under
    pub fn name(&self, id: ClockId) -> &str {
        &self.clocks[id.0].name
    }

    /// Edges a clock has produced so far
    pub fn edges(&self, id: ClockId) -> u64 {
        self.clocks[id.0].edges
    }

    /// Number of scheduling steps taken
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Current simulated time in seconds
    pub fn now_seconds(&self) -> f64 {
        self.now
            .map(|t| t.edge as f64 / t.hz as f64)
            .unwrap_or(0.0)
    }

    /// Advance to the next instant at which any clock has an edge.
    ///
    /// `fired` is cleared and filled with every clock that ticks at that instant, ordered
    /// so that a divided clock always follows its source.
    pub fn advance(&mut self, fired: &mut Vec<ClockId>) {
        fired.clear();

        let mut next: Option<Instant> = None;
        for entry in &self.clocks {
            if let Timebase::Root { hz } = entry.timebase {
                let candidate = Instant {
                    edge: entry.edges + 1,
                    hz,
                };
                next = match next {
                    Some(best) if best.cmp_time(&candidate) != Ordering::Greater => Some(best),
                    _ => Some(candidate),
                };
            }
        }

        let Some(next) = next else {
            return;
        };

        for idx in 0..self.clocks.len() {
            let fires = match self.clocks[idx].timebase {
                Timebase::Root { hz } => {
                    let candidate = Instant {
                        edge: self.clocks[idx].edges + 1,
                        hz,
                    };
                    candidate.cmp_time(&next) == Ordering::Equal
                }
                Timebase::Divided { source, .. } => fired.contains(&source),
            };

            if !fires {
                continue;
            }

            let entry = &mut self.clocks[idx];
            match &mut entry.timebase {
                Timebase::Root { .. } => {
                    entry.edges += 1;
                    fired.push(ClockId(idx));
                }
                Timebase::Divided { ratio, count, .. } => {
                    *count += 1;
                    if *count == *ratio {
                        *count = 0;
                        entry.edges += 1;
                        fired.push(ClockId(idx));
                    }
                }
            }
        }

        self.now = Some(next);
        self.steps += 1;
        trace!(step = self.steps, edges = fired.len(), "scheduler advanced");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(scheduler: &mut Scheduler, steps: usize) -> Vec<Vec<ClockId>> {
        let mut fired = Vec::new();
        let mut out = Vec::new();
        for _ in 0..steps {
            scheduler.advance(&mut fired);
            out.push(fired.clone());
        }
        out
    }

    #[test]
    fn divided_clock_fires_every_nth_source_edge() {
        let mut s = Scheduler::new();
        let fast = s.add_root("hdmi5x", 371_250_000);
        let hdmi = s.add_divided("hdmi", fast, 5);
        let sys = s.add_divided("sys", hdmi, 2);

        run(&mut s, 100);

        assert_eq!(s.edges(fast), 100);
        assert_eq!(s.edges(hdmi), 20);
        assert_eq!(s.edges(sys), 10);
    }

    #[test]
    fn divided_clock_is_reported_after_its_source() {
        let mut s = Scheduler::new();
        let fast = s.add_root("fast", 10);
        let slow = s.add_divided("slow", fast, 2);

        let steps = run(&mut s, 4);
        assert_eq!(steps[0], vec![fast]);
        assert_eq!(steps[1], vec![fast, slow]);
        assert_eq!(steps[3], vec![fast, slow]);
    }

    #[test]
    fn root_clocks_interleave_at_exact_ratio() {
        let mut s = Scheduler::new();
        let xtal = s.add_root("clk27", 27_000_000);
        let pll = s.add_root("sys", 54_000_000);

        let steps = run(&mut s, 30);

        // 54 MHz is exactly 2x 27 MHz: every crystal edge coincides with a PLL edge.
        assert_eq!(s.edges(pll), 2 * s.edges(xtal));
        for fired in steps.iter().filter(|f| f.contains(&xtal)) {
            assert!(fired.contains(&pll));
        }
    }

    #[test]
    fn coprime_roots_share_only_common_instants() {
        let mut s = Scheduler::new();
        let a = s.add_root("a", 3);
        let b = s.add_root("b", 2);

        // One second holds 3 edges of a and 2 of b, coinciding only at t = 1s.
        let steps = run(&mut s, 4);
        assert_eq!(steps.iter().filter(|f| f.len() == 2).count(), 1);
        assert_eq!(s.edges(a), 3);
        assert_eq!(s.edges(b), 2);
        assert!((s.now_seconds() - 1.0).abs() < 1e-12);
    }
}
