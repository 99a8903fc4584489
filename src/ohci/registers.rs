use anyhow::Result;
use log::trace;

use crate::ohci::link::LinkState;
use crate::ohci::receive::ArContext;
use crate::ohci::{ContextId, Ohci1394, MMIO_SIZE};
use crate::{AtContext, HcdContext};

/// Symbolic offsets into the 2 KiB register window (OHCI 1.1 chapter 5).
/// Registers with set/clear semantics are listed as their `_SET` (primary)
/// and `_CLEAR` (alias) words; reads of either return the primary value.
pub mod offsets {
    pub const VERSION: u32 = 0x000;
    pub const GUID_ROM: u32 = 0x004;
    pub const AT_RETRIES: u32 = 0x008;
    pub const CSR_READ_DATA: u32 = 0x00C;
    pub const CSR_COMPARE_DATA: u32 = 0x010;
    pub const CSR_CONTROL: u32 = 0x014;
    pub const CONFIG_ROM_HDR: u32 = 0x018;
    pub const BUS_ID: u32 = 0x01C;
    pub const BUS_OPTIONS: u32 = 0x020;
    pub const GUID_HI: u32 = 0x024;
    pub const GUID_LO: u32 = 0x028;
    pub const CONFIG_ROM_MAP: u32 = 0x034;
    pub const POSTED_WRITE_ADDR_LO: u32 = 0x038;
    pub const POSTED_WRITE_ADDR_HI: u32 = 0x03C;
    pub const VENDOR_ID: u32 = 0x040;
    pub const HC_CONTROL_SET: u32 = 0x050;
    pub const HC_CONTROL_CLEAR: u32 = 0x054;
    pub const SELF_ID_BUFFER: u32 = 0x064;
    pub const SELF_ID_COUNT: u32 = 0x068;
    pub const IR_MULTI_CHAN_MASK_HI_SET: u32 = 0x070;
    pub const IR_MULTI_CHAN_MASK_HI_CLEAR: u32 = 0x074;
    pub const IR_MULTI_CHAN_MASK_LO_SET: u32 = 0x078;
    pub const IR_MULTI_CHAN_MASK_LO_CLEAR: u32 = 0x07C;
    pub const INT_EVENT_SET: u32 = 0x080;
    pub const INT_EVENT_CLEAR: u32 = 0x084; // reads back int_event & int_mask
    pub const INT_MASK_SET: u32 = 0x088;
    pub const INT_MASK_CLEAR: u32 = 0x08C;
    pub const ISO_XMIT_INT_EVENT_SET: u32 = 0x090;
    pub const ISO_XMIT_INT_EVENT_CLEAR: u32 = 0x094;
    pub const ISO_XMIT_INT_MASK_SET: u32 = 0x098;
    pub const ISO_XMIT_INT_MASK_CLEAR: u32 = 0x09C;
    pub const ISO_RECV_INT_EVENT_SET: u32 = 0x0A0;
    pub const ISO_RECV_INT_EVENT_CLEAR: u32 = 0x0A4;
    pub const ISO_RECV_INT_MASK_SET: u32 = 0x0A8;
    pub const ISO_RECV_INT_MASK_CLEAR: u32 = 0x0AC;
    pub const INITIAL_BANDWIDTH_AVAILABLE: u32 = 0x0B0;
    pub const INITIAL_CHANNELS_AVAILABLE_HI: u32 = 0x0B4;
    pub const INITIAL_CHANNELS_AVAILABLE_LO: u32 = 0x0B8;
    pub const FAIRNESS_CONTROL: u32 = 0x0DC;
    pub const LINK_CONTROL_SET: u32 = 0x0E0;
    pub const LINK_CONTROL_CLEAR: u32 = 0x0E4;
    pub const NODE_ID: u32 = 0x0E8;
    pub const PHY_CONTROL: u32 = 0x0EC;
    pub const ISO_CYCLE_TIMER: u32 = 0x0F0;
    pub const ASYNC_REQ_FILTER_HI_SET: u32 = 0x100;
    pub const ASYNC_REQ_FILTER_HI_CLEAR: u32 = 0x104;
    pub const ASYNC_REQ_FILTER_LO_SET: u32 = 0x108;
    pub const ASYNC_REQ_FILTER_LO_CLEAR: u32 = 0x10C;
    pub const PHYS_REQ_FILTER_HI_SET: u32 = 0x110;
    pub const PHYS_REQ_FILTER_HI_CLEAR: u32 = 0x114;
    pub const PHYS_REQ_FILTER_LO_SET: u32 = 0x118;
    pub const PHYS_REQ_FILTER_LO_CLEAR: u32 = 0x11C;
    pub const PHYSICAL_UPPER_BOUND: u32 = 0x120;
    pub const AT_REQ_CONTROL_SET: u32 = 0x180;
    pub const AT_REQ_CONTROL_CLEAR: u32 = 0x184;
    pub const AT_REQ_COMMAND_PTR: u32 = 0x18C;
    pub const AT_RSP_CONTROL_SET: u32 = 0x1A0;
    pub const AT_RSP_CONTROL_CLEAR: u32 = 0x1A4;
    pub const AT_RSP_COMMAND_PTR: u32 = 0x1AC;
    pub const AR_REQ_CONTROL_SET: u32 = 0x1C0;
    pub const AR_REQ_CONTROL_CLEAR: u32 = 0x1C4;
    pub const AR_REQ_COMMAND_PTR: u32 = 0x1CC;
    pub const AR_RSP_CONTROL_SET: u32 = 0x1E0;
    pub const AR_RSP_CONTROL_CLEAR: u32 = 0x1E4;
    pub const AR_RSP_COMMAND_PTR: u32 = 0x1EC;
}

// HCControl bits
pub(crate) const HC_CONTROL_SOFT_RESET: u32 = 1 << 16;
pub(crate) const HC_CONTROL_LINK_ENABLE: u32 = 1 << 17;
pub(crate) const HC_CONTROL_SET_MASK: u32 = 0xE0CF_0000;
pub(crate) const HC_CONTROL_CLEAR_MASK: u32 = 0xE0CE_0000;

// LinkControl bits
pub(crate) const LINK_CONTROL_RCV_SELF_ID: u32 = 0x0000_0200;

// ContextControl bits, common to all four asynchronous contexts
pub(crate) const CONTEXT_ACTIVE: u32 = 1 << 10;
pub(crate) const CONTEXT_DEAD: u32 = 1 << 11;
pub(crate) const CONTEXT_WAKE: u32 = 1 << 12;
pub(crate) const CONTEXT_RUN: u32 = 1 << 15;

// NodeID fields
pub(crate) const NODEID_BUS_NUMBER: u32 = 0x0000_FFC0;
pub(crate) const NODEID_CPS: u32 = 0x0800_0000;
pub(crate) const NODEID_ROOT: u32 = 0x4000_0000;
pub(crate) const NODEID_ID_VALID: u32 = 0x8000_0000;

/// The authoritative flat register file
pub(crate) struct Registers {
    words: [u32; MMIO_SIZE / 4],
}

impl Default for Registers {
    fn default() -> Self {
        Registers {
            words: [0; MMIO_SIZE / 4],
        }
    }
}

impl Registers {
    pub fn read(&self, offset: u32) -> u32 {
        self.words[offset as usize >> 2]
    }

    pub fn write(&mut self, offset: u32, value: u32) {
        self.words[offset as usize >> 2] = value;
    }

    pub fn set_bits(&mut self, offset: u32, bits: u32) {
        self.words[offset as usize >> 2] |= bits;
    }

    pub fn clear_bits(&mut self, offset: u32, bits: u32) {
        self.words[offset as usize >> 2] &= !bits;
    }
}

impl<C: HcdContext> Ohci1394<C> {
    pub(crate) fn read_register(&self, offset: u32) -> u32 {
        use offsets::*;
        match offset {
            INT_EVENT_CLEAR => self.regs.read(INT_EVENT_SET) & self.regs.read(INT_MASK_SET),
            // The second word of every set/clear pair reads as the first
            HC_CONTROL_CLEAR
            | IR_MULTI_CHAN_MASK_HI_CLEAR
            | IR_MULTI_CHAN_MASK_LO_CLEAR
            | INT_MASK_CLEAR
            | ISO_XMIT_INT_EVENT_CLEAR
            | ISO_XMIT_INT_MASK_CLEAR
            | ISO_RECV_INT_EVENT_CLEAR
            | ISO_RECV_INT_MASK_CLEAR
            | LINK_CONTROL_CLEAR
            | ASYNC_REQ_FILTER_HI_CLEAR
            | ASYNC_REQ_FILTER_LO_CLEAR
            | PHYS_REQ_FILTER_HI_CLEAR
            | PHYS_REQ_FILTER_LO_CLEAR
            | AT_REQ_CONTROL_CLEAR
            | AT_RSP_CONTROL_CLEAR
            | AR_REQ_CONTROL_CLEAR
            | AR_RSP_CONTROL_CLEAR => self.regs.read(offset & !4),
            _ => self.regs.read(offset),
        }
    }

    pub(crate) fn write_register(&mut self, offset: u32, value: u32) -> Result<()> {
        use offsets::*;
        trace!("register write {:03x} <- {:08x}", offset, value);
        match offset {
            CSR_CONTROL => {
                // Selector 0 is the bus-manager compare-swap; 1..3 are only acknowledged
                if value & 3 == 0 {
                    let compare = self.regs.read(CSR_COMPARE_DATA);
                    self.regs.write(CSR_READ_DATA, compare);
                }
                self.regs.write(CSR_CONTROL, 0x8000_0000 | (value & 3));
            }
            HC_CONTROL_SET => {
                let bits = value & HC_CONTROL_SET_MASK;
                self.regs.set_bits(HC_CONTROL_SET, bits);
                if bits & HC_CONTROL_SOFT_RESET != 0 {
                    self.soft_reset();
                }
                if bits & HC_CONTROL_LINK_ENABLE != 0
                    && matches!(
                        self.link,
                        LinkState::Disconnected | LinkState::Arbitration1
                    )
                {
                    self.send_link_on()?;
                }
            }
            HC_CONTROL_CLEAR => {
                self.regs
                    .clear_bits(HC_CONTROL_SET, value & HC_CONTROL_CLEAR_MASK);
            }
            IR_MULTI_CHAN_MASK_HI_SET
            | IR_MULTI_CHAN_MASK_LO_SET
            | INT_EVENT_SET
            | INT_MASK_SET
            | ISO_XMIT_INT_EVENT_SET
            | ISO_XMIT_INT_MASK_SET
            | ISO_RECV_INT_EVENT_SET
            | ISO_RECV_INT_MASK_SET
            | LINK_CONTROL_SET
            | ASYNC_REQ_FILTER_HI_SET
            | ASYNC_REQ_FILTER_LO_SET
            | PHYS_REQ_FILTER_HI_SET
            | PHYS_REQ_FILTER_LO_SET => {
                self.regs.set_bits(offset, value);
            }
            IR_MULTI_CHAN_MASK_HI_CLEAR
            | IR_MULTI_CHAN_MASK_LO_CLEAR
            | INT_EVENT_CLEAR
            | INT_MASK_CLEAR
            | ISO_XMIT_INT_EVENT_CLEAR
            | ISO_XMIT_INT_MASK_CLEAR
            | ISO_RECV_INT_EVENT_CLEAR
            | ISO_RECV_INT_MASK_CLEAR
            | LINK_CONTROL_CLEAR
            | ASYNC_REQ_FILTER_HI_CLEAR
            | ASYNC_REQ_FILTER_LO_CLEAR
            | PHYS_REQ_FILTER_HI_CLEAR
            | PHYS_REQ_FILTER_LO_CLEAR => {
                self.regs.clear_bits(offset & !4, value);
            }
            NODE_ID => {
                // Only the bus-number field is writable
                let node_id = self.regs.read(NODE_ID);
                self.regs.write(
                    NODE_ID,
                    (node_id & !NODEID_BUS_NUMBER) | (value & NODEID_BUS_NUMBER),
                );
            }
            PHY_CONTROL => {
                self.phy_control_write(value)?;
            }
            AT_REQ_CONTROL_SET | AT_RSP_CONTROL_SET => {
                let at = if offset == AT_REQ_CONTROL_SET {
                    AtContext::Request
                } else {
                    AtContext::Response
                };
                let bits = value & (CONTEXT_RUN | CONTEXT_WAKE);
                self.regs.set_bits(offset, bits);
                if bits != 0 {
                    if bits & CONTEXT_RUN != 0 {
                        self.at_run(at);
                    }
                    self.hcd_ctx.schedule_at_timer(at);
                }
            }
            AT_REQ_CONTROL_CLEAR | AT_RSP_CONTROL_CLEAR => {
                self.regs.clear_bits(offset & !4, value);
            }
            AR_REQ_CONTROL_SET | AR_RSP_CONTROL_SET => {
                let ar = if offset == AR_REQ_CONTROL_SET {
                    ArContext::Request
                } else {
                    ArContext::Response
                };
                let bits = value & (CONTEXT_RUN | CONTEXT_WAKE);
                self.regs.set_bits(offset, bits);
                if bits & CONTEXT_RUN != 0 {
                    self.ar_run(ar);
                }
                if bits & CONTEXT_WAKE != 0 {
                    self.ar_wake(ar)?;
                }
            }
            AR_REQ_CONTROL_CLEAR | AR_RSP_CONTROL_CLEAR => {
                let ar = if offset == AR_REQ_CONTROL_CLEAR {
                    ArContext::Request
                } else {
                    ArContext::Response
                };
                let bits = value & CONTEXT_RUN;
                self.regs.clear_bits(offset & !4, bits);
                if bits != 0 {
                    self.ar_stop(ar);
                }
            }
            _ => {
                self.regs.write(offset, value);
            }
        }
        self.check_irq();
        Ok(())
    }

    pub(crate) fn context_control(&self, ctx: ContextId) -> u32 {
        self.regs.read(ctx.control())
    }
}
