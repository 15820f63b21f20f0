//! CSR bank on the system bus.
//!
//! Holds the video source selector and the SD bridge's event registers. The slave sees
//! word addresses relative to the CSR region; registers are decoded by byte offset.

use crate::irq::EventManager;
use crate::video::SelectorRegister;
use crate::wishbone::{Request, Response};
use tangsoc_hw::mmio::csr::registers;
use tracing::{instrument, trace, warn};

#[derive(Debug, Clone)]
pub struct CsrBank {
    selector: SelectorRegister,
    ack: bool,
}

impl CsrBank {
    pub fn new(selector: SelectorRegister) -> Self {
        Self {
            selector,
            ack: false,
        }
    }

    pub fn selector(&self) -> &SelectorRegister {
        &self.selector
    }

    /// One system tick. `events` is the SD bridge's event manager, if the bridge is
    /// present; its registers read as zero otherwise.
    #[instrument(level = "trace", skip(self, events))]
    pub fn tick(&mut self, req: &Request, events: Option<&mut EventManager>) -> Response {
        let ack = self.ack;
        self.ack = req.is_active() && !ack;
        if !(ack && req.is_active()) {
            return Response::idle();
        }

        let offset = req.adr << 2;
        if req.we {
            self.write(offset, req.dat_w, req.sel, events);
            Response::ack(0)
        } else {
            let value = self.read(offset, events.as_deref());
            trace!(offset, value, "csr read");
            Response::ack(value)
        }
    }

    fn read(&self, offset: u32, events: Option<&EventManager>) -> u32 {
        match (offset, events) {
            (registers::NES_VID_SELECT, _) => self.selector.get() as u32,
            (registers::WBSDCARD_EV_STATUS, Some(ev)) => ev.status(),
            (registers::WBSDCARD_EV_PENDING, Some(ev)) => ev.pending(),
            (registers::WBSDCARD_EV_ENABLE, Some(ev)) => ev.enable(),
            _ => 0,
        }
    }

    fn write(&mut self, offset: u32, value: u32, sel: u8, events: Option<&mut EventManager>) {
        match (offset, events) {
            (registers::NES_VID_SELECT, _) => {
                if sel & 1 != 0 {
                    self.selector.set(value as u8);
                }
            }
            (registers::WBSDCARD_EV_PENDING, Some(ev)) => ev.write_pending(value),
            (registers::WBSDCARD_EV_ENABLE, Some(ev)) => ev.set_enable(value),
            (registers::WBSDCARD_EV_STATUS, _) => {}
            _ => warn!("csr write to unknown offset {:#06x}", offset),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tangsoc_hw::mmio::csr::wbsdcard_events;

    fn access(
        csr: &mut CsrBank,
        req: Request,
        mut events: Option<&mut EventManager>,
    ) -> Response {
        for _ in 0..4 {
            let resp = csr.tick(&req, events.as_deref_mut());
            if resp.ack {
                csr.tick(&Request::idle(), None);
                return resp;
            }
        }
        panic!("no acknowledge");
    }

    #[test]
    fn selector_register_is_shared() {
        let register = SelectorRegister::new(0);
        let mut csr = CsrBank::new(register.clone());
        access(&mut csr, Request::write(0, 0x1_02, 0xf), None);
        assert_eq!(register.get(), 2);
        register.set(7);
        assert_eq!(access(&mut csr, Request::read(0, 0xf), None).dat_r, 7);
    }

    #[test]
    fn event_registers_follow_the_manager() {
        let mut csr = CsrBank::new(SelectorRegister::new(0));
        let mut ev = EventManager::new(&["int_data", "int_cmd"]);
        let enable = registers::WBSDCARD_EV_ENABLE >> 2;
        let pending = registers::WBSDCARD_EV_PENDING >> 2;

        access(&mut csr, Request::write(enable, wbsdcard_events::INT_CMD, 0xf), Some(&mut ev));
        assert_eq!(ev.enable(), wbsdcard_events::INT_CMD);

        ev.tick(&[false, true]);
        let resp = access(&mut csr, Request::read(pending, 0xf), Some(&mut ev));
        assert_eq!(resp.dat_r, wbsdcard_events::INT_CMD);
        assert!(ev.irq());

        access(&mut csr, Request::write(pending, wbsdcard_events::INT_CMD, 0xf), Some(&mut ev));
        ev.tick(&[false, true]);
        assert!(!ev.irq());
    }

    #[test]
    fn event_registers_read_zero_without_bridge() {
        let mut csr = CsrBank::new(SelectorRegister::new(0));
        let status = registers::WBSDCARD_EV_STATUS >> 2;
        assert_eq!(access(&mut csr, Request::read(status, 0xf), None).dat_r, 0);
    }
}
