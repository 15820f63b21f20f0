//! SD controller bridge.
//!
//! Wraps the SD host controller for the system bus: a register slave port, the
//! controller's DMA master port and an event manager turning the controller's two
//! interrupt outputs into latched events on a single irq line.

use super::controller::SdController;
use super::pins::{SdLines, SdPads};
use crate::irq::EventManager;
use crate::wishbone::{InterfaceSpec, Request, Response};
use tangsoc_hw::specs::bus;
use tracing::{instrument, trace};

/// Event manager source names, bit 0 first
pub const EVENTS: [&str; 2] = ["int_data", "int_cmd"];

#[derive(Debug, Clone)]
pub struct SdBridge {
    controller: SdController,
    events: EventManager,
    ack: bool,
}

impl Default for SdBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl SdBridge {
    /// Register port: 32-bit data, 11-bit word address
    pub const SLAVE_SPEC: InterfaceSpec = InterfaceSpec::word(
        bus::SDCARD_SLAVE_DATA_WIDTH,
        bus::SDCARD_SLAVE_ADDRESS_WIDTH,
    );

    /// DMA port: 32-bit data, 29-bit word address
    pub const MASTER_SPEC: InterfaceSpec = InterfaceSpec::word(
        bus::SDCARD_MASTER_DATA_WIDTH,
        bus::SDCARD_MASTER_ADDRESS_WIDTH,
    );

    pub fn new() -> Self {
        Self {
            controller: SdController::new(),
            events: EventManager::new(&EVENTS),
            ack: false,
        }
    }

    pub fn controller(&self) -> &SdController {
        &self.controller
    }

    pub fn events(&self) -> &EventManager {
        &self.events
    }

    pub fn events_mut(&mut self) -> &mut EventManager {
        &mut self.events
    }

    /// Interrupt line toward the platform
    pub fn irq(&self) -> bool {
        self.events.irq()
    }

    pub fn pads(&self) -> SdPads {
        self.controller.pads()
    }

    /// Request on the DMA master port this tick
    pub fn master_request(&self) -> Request {
        self.controller.dma_request()
    }

    /// Register port. The acknowledge is registered: it comes one tick after the
    /// request and drops for one tick after each access.
    #[instrument(level = "trace", skip(self))]
    pub fn slave_tick(&mut self, req: &Request) -> Response {
        let ack = self.ack;
        self.ack = req.is_active() && !ack;
        if !(ack && req.is_active()) {
            return Response::idle();
        }

        let offset = req.adr & 0xff;
        if req.we {
            self.controller.write(offset, req.dat_w);
            Response::ack(0)
        } else {
            let value = self.controller.read(offset);
            trace!(offset, value, "sdcard register read");
            Response::ack(value)
        }
    }

    /// Advance the controller and sample its interrupt outputs. Returns whether
    /// `sd_clk` rose.
    pub fn tick(&mut self, lines: &SdLines, master_resp: &Response) -> bool {
        let rising = self.controller.tick(lines, master_resp);
        self.events
            .tick(&[self.controller.int_data(), self.controller.int_cmd()]);
        rising
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tangsoc_hw::mmio::sdc::{cmd_events, command, registers};

    fn access(bridge: &mut SdBridge, req: Request) -> (Response, usize) {
        for tick in 0..4 {
            let resp = bridge.slave_tick(&req);
            if resp.ack {
                bridge.slave_tick(&Request::idle());
                return (resp, tick);
            }
        }
        panic!("no acknowledge");
    }

    #[test]
    fn register_ack_is_registered() {
        let mut bridge = SdBridge::new();
        let (resp, tick) = access(&mut bridge, Request::read(registers::VOLTAGE, 0xf));
        assert_eq!(tick, 1);
        assert_eq!(resp.dat_r, 0x100);

        // Held request: ack, gap, ack
        let req = Request::read(registers::CAPABILITIES, 0xf);
        let acks: Vec<bool> = (0..5).map(|_| bridge.slave_tick(&req).ack).collect();
        assert_eq!(acks, vec![false, true, false, true, false]);
    }

    #[test]
    fn word_address_selects_register_offset() {
        let mut bridge = SdBridge::new();
        access(&mut bridge, Request::write(registers::BLOCK_COUNT, 7, 0xf));
        let (resp, _) = access(&mut bridge, Request::read(registers::BLOCK_COUNT, 0xf));
        assert_eq!(resp.dat_r, 7);
        // Bits above the register window are ignored
        let (resp, _) = access(
            &mut bridge,
            Request::read(0x100 | registers::BLOCK_COUNT, 0xf),
        );
        assert_eq!(resp.dat_r, 7);
    }

    #[test]
    fn command_interrupt_latches_once_until_acknowledged() {
        let mut bridge = SdBridge::new();
        access(&mut bridge, Request::write(registers::CLOCK_DIVIDER, 0, 0xf));
        access(&mut bridge, Request::write(registers::CMD_ISER, 1, 0xf));
        access(&mut bridge, Request::write(registers::CMD_TIMEOUT, 16, 0xf));
        bridge.events_mut().set_enable(0b11);
        access(
            &mut bridge,
            Request::write(
                registers::COMMAND,
                8 << command::INDEX_SHIFT | command::RESPONSE_SHORT,
                0xf,
            ),
        );
        access(&mut bridge, Request::write(registers::ARGUMENT, 0x1aa, 0xf));

        let mut raised = 0;
        let mut prev = false;
        for _ in 0..1000 {
            bridge.tick(&SdLines::default(), &Response::idle());
            let irq = bridge.irq();
            raised += (irq && !prev) as u32;
            prev = irq;
        }
        assert_eq!(raised, 1);
        assert_eq!(bridge.events().pending(), 0b10);
        assert_ne!(bridge.controller().read(registers::CMD_ISR) & cmd_events::COMPLETE, 0);

        // Pending cleared, trigger still high: no new event
        bridge.events_mut().write_pending(0b10);
        for _ in 0..10 {
            bridge.tick(&SdLines::default(), &Response::idle());
        }
        assert!(!bridge.irq());

        // Acknowledge at the controller, then a new command raises it again
        access(&mut bridge, Request::write(registers::CMD_ISR, 0, 0xf));
        access(&mut bridge, Request::write(registers::ARGUMENT, 0x1aa, 0xf));
        for _ in 0..1000 {
            bridge.tick(&SdLines::default(), &Response::idle());
        }
        assert!(bridge.irq());
    }
}
