//! SD bus pads.
//!
//! The command line and the four data lines are open to both the controller and the
//! card. Each side drives a value and an output enable; an undriven line floats high
//! through its pull-up and conflicting drivers resolve to low.

/// One tri-state output
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TriState {
    pub o: bool,
    pub oe: bool,
}

impl TriState {
    pub const RELEASED: TriState = TriState { o: true, oe: false };

    pub fn drive(level: bool) -> Self {
        Self { o: level, oe: true }
    }
}

/// Four tri-state outputs, one bit per line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TriStateBus {
    pub o: u8,
    pub oe: u8,
}

impl TriStateBus {
    pub const RELEASED: TriStateBus = TriStateBus { o: 0xf, oe: 0 };

    /// Drive DAT0 only
    pub fn dat0(level: bool) -> Self {
        Self {
            o: level as u8 | 0xe,
            oe: 0x1,
        }
    }

    /// Drive all four lines with a nibble
    pub fn nibble(value: u8) -> Self {
        Self {
            o: value & 0xf,
            oe: 0xf,
        }
    }
}

/// Everything the controller side drives onto the pads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdPads {
    pub clk: bool,
    pub cmd: TriState,
    pub dat: TriStateBus,
}

impl Default for SdPads {
    fn default() -> Self {
        Self {
            clk: false,
            cmd: TriState::RELEASED,
            dat: TriStateBus::RELEASED,
        }
    }
}

/// Resolved line levels, as both sides see them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdLines {
    pub cmd: bool,
    pub dat: u8,
}

impl Default for SdLines {
    fn default() -> Self {
        Self { cmd: true, dat: 0xf }
    }
}

impl SdLines {
    pub fn dat0(&self) -> bool {
        self.dat & 1 != 0
    }
}

fn resolve_line(a: TriState, b: TriState) -> bool {
    (!a.oe || a.o) && (!b.oe || b.o)
}

fn resolve_bus(a: TriStateBus, b: TriStateBus) -> u8 {
    // A line reads low if any side drives it low
    let low = (a.oe & !a.o) | (b.oe & !b.o);
    !low & 0xf
}

/// Wire the controller pads and the card outputs together
pub fn resolve(host: &SdPads, card_cmd: TriState, card_dat: TriStateBus) -> SdLines {
    SdLines {
        cmd: resolve_line(host.cmd, card_cmd),
        dat: resolve_bus(host.dat, card_dat),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undriven_lines_float_high() {
        let lines = resolve(&SdPads::default(), TriState::RELEASED, TriStateBus::RELEASED);
        assert_eq!(lines, SdLines::default());
    }

    #[test]
    fn single_driver_wins() {
        let host = SdPads {
            cmd: TriState::drive(false),
            ..SdPads::default()
        };
        let lines = resolve(&host, TriState::RELEASED, TriStateBus::nibble(0b1010));
        assert!(!lines.cmd);
        assert_eq!(lines.dat, 0b1010);
    }

    #[test]
    fn contention_resolves_low() {
        let host = SdPads {
            cmd: TriState::drive(true),
            dat: TriStateBus::nibble(0xf),
            ..SdPads::default()
        };
        let lines = resolve(&host, TriState::drive(false), TriStateBus::dat0(false));
        assert!(!lines.cmd);
        assert_eq!(lines.dat, 0xe);
    }
}
