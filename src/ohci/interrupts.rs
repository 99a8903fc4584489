use log::trace;

use crate::ohci::registers::offsets;
use crate::ohci::Ohci1394;
use crate::HcdContext;

// IntEvent bits
pub(crate) const INT_REQ_TX_COMPLETE: u32 = 1 << 0;
pub(crate) const INT_RESP_TX_COMPLETE: u32 = 1 << 1;
pub(crate) const INT_RQ_PKT: u32 = 1 << 4;
pub(crate) const INT_RS_PKT: u32 = 1 << 5;
pub(crate) const INT_SELF_ID_COMPLETE2: u32 = 1 << 15;
pub(crate) const INT_SELF_ID_COMPLETE: u32 = 1 << 16;
pub(crate) const INT_BUS_RESET: u32 = 1 << 17;
pub(crate) const INT_PHY: u32 = 1 << 19;
pub(crate) const INT_PHY_REG_RCVD: u32 = 1 << 26;
pub(crate) const INT_MASTER_ENABLE: u32 = 1 << 31;

impl<C: HcdContext> Ohci1394<C> {
    /// OR bits into IntEvent and re-evaluate the interrupt line
    pub(crate) fn raise_event(&mut self, bits: u32) {
        self.regs.set_bits(offsets::INT_EVENT_SET, bits);
        self.check_irq();
    }

    /// The line is asserted iff the master enable is on and an unmasked
    /// event is pending; only level changes reach the host
    pub(crate) fn check_irq(&mut self) {
        let event = self.regs.read(offsets::INT_EVENT_SET);
        let mask = self.regs.read(offsets::INT_MASK_SET);
        let assert = mask & INT_MASTER_ENABLE != 0 && event & mask != 0;
        if assert != self.irq_asserted {
            trace!("IRQ line {}", if assert { "asserted" } else { "lowered" });
            self.hcd_ctx.set_irq(assert);
            self.irq_asserted = assert;
        }
    }
}
