use anyhow::{ensure, Result};
use log::info;

use crate::ohci::phy::PhyState;
use crate::ohci::registers::offsets;
use crate::ohci::registers::Registers;
use crate::ohci::transmit::AtEngine;
use crate::{AtContext, HcdContext};

mod descriptors;
mod interrupts;
mod link;
mod packets;
mod phy;
mod receive;
pub mod registers;
mod selfid;
mod transmit;

pub use link::LinkState;

/// Size of the OHCI register window (BAR 0)
pub const MMIO_SIZE: usize = 0x800;

/// Largest wire packet: 16 byte header plus maximum block payload
pub const REASSEMBLY_BUFFER_SIZE: usize = 16 + 65536;

/// The four asynchronous DMA contexts, in register-block order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ContextId {
    AtRequest,
    AtResponse,
    ArRequest,
    ArResponse,
}

impl ContextId {
    fn num(self) -> u32 {
        match self {
            ContextId::AtRequest => 0,
            ContextId::AtResponse => 1,
            ContextId::ArRequest => 2,
            ContextId::ArResponse => 3,
        }
    }

    pub(crate) fn base(self) -> u32 {
        0x180 + self.num() * 0x20
    }

    pub(crate) fn control(self) -> u32 {
        self.base()
    }

    pub(crate) fn command_ptr(self) -> u32 {
        self.base() + 0x0C
    }
}

impl From<AtContext> for ContextId {
    fn from(at: AtContext) -> Self {
        match at {
            AtContext::Request => ContextId::AtRequest,
            AtContext::Response => ContextId::AtResponse,
        }
    }
}

pub struct Ohci1394<C: HcdContext> {
    pub hcd_ctx: C,
    pub(crate) regs: Registers,
    pub(crate) phy: PhyState,
    at_req: AtEngine,
    at_rsp: AtEngine,

    pub(crate) link: LinkState,
    pub(crate) other_link: bool,
    pub(crate) root: bool,
    pub(crate) bid: u16,
    pub(crate) buf: Vec<u8>,
    pub(crate) bufpos: usize,

    pub(crate) irq_asserted: bool,
}

impl<C: HcdContext> Ohci1394<C> {
    pub fn new(hcd_ctx: C) -> Self {
        let mut device = Ohci1394 {
            hcd_ctx,
            regs: Default::default(),
            phy: Default::default(),
            at_req: Default::default(),
            at_rsp: Default::default(),
            link: LinkState::Unplugged,
            other_link: false,
            root: false,
            bid: 0,
            buf: vec![0; REASSEMBLY_BUFFER_SIZE],
            bufpos: 0,
            irq_asserted: false,
        };
        device.hard_reset();
        device
    }

    /// Power-on reset: seed the identity registers and the PHY shadow
    pub fn hard_reset(&mut self) {
        info!("OHCI1394: hard reset");
        self.regs = Default::default();
        self.regs.write(offsets::VERSION, 0x0001_0010); // OHCI release 1.1
        self.regs.write(offsets::BUS_ID, 0x3133_3934); // "1394"
        self.regs.write(offsets::BUS_OPTIONS, 0x0000_8002);
        self.regs.write(offsets::GUID_HI, 0x89AB_CDEF);
        self.regs.write(offsets::GUID_LO, 0x0123_4567);
        self.phy = Default::default();
        self.soft_reset();
    }

    /// softReset via HCControl: bus options reinitialize, noByteSwapData and
    /// programPhyEnable survive
    pub(crate) fn soft_reset(&mut self) {
        self.regs.write(offsets::BUS_OPTIONS, 0x0000_8002);
        let hc_control = self.regs.read(offsets::HC_CONTROL_SET) & 0x00C0_0000;
        self.regs.write(offsets::HC_CONTROL_SET, hc_control);
    }

    pub fn region_access_bar0(
        &mut self, offset: usize, data: &mut [u8], write: bool,
    ) -> Result<usize> {
        // Check size and offset
        ensure!(data.len() == 4, "Bar0 accesses need to be 4 bytes in size");
        ensure!(
            offset % 4 == 0,
            "Bar0 access offset needs to be at multiple of 4 bytes"
        );
        ensure!(
            offset < MMIO_SIZE,
            "Bar0 access outside the register window"
        );

        if write {
            let mut buffer = [0u8; 4];
            buffer.copy_from_slice(data);
            self.write_register(offset as u32, u32::from_ne_bytes(buffer))?;
        } else {
            let value = self.read_register(offset as u32);
            data.copy_from_slice(&value.to_ne_bytes());
        }

        Ok(data.len())
    }

    pub fn link_state(&self) -> LinkState {
        self.link
    }

    pub(crate) fn at_engine(&self, at: AtContext) -> &AtEngine {
        match at {
            AtContext::Request => &self.at_req,
            AtContext::Response => &self.at_rsp,
        }
    }

    pub(crate) fn at_engine_mut(&mut self, at: AtContext) -> &mut AtEngine {
        match at {
            AtContext::Request => &mut self.at_req,
            AtContext::Response => &mut self.at_rsp,
        }
    }

    pub(crate) fn set_context_event_code(&mut self, ctx: ContextId, code: u8) {
        let control = self.regs.read(ctx.control());
        self.regs
            .write(ctx.control(), (control & !0x1F) | code as u32);
    }

    pub(crate) fn dma_write_word(&mut self, address: u32, value: u32) -> Result<()> {
        self.hcd_ctx
            .dma_write(address as u64, &value.to_le_bytes())
    }
}
