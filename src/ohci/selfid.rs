use anyhow::Result;
use log::debug;

use crate::ohci::interrupts::{INT_BUS_RESET, INT_SELF_ID_COMPLETE, INT_SELF_ID_COMPLETE2};
use crate::ohci::link::LinkState;
use crate::ohci::packets::EVT_BUS_RESET;
use crate::ohci::receive::ArContext;
use crate::ohci::registers::{
    offsets, CONTEXT_RUN, LINK_CONTROL_RCV_SELF_ID, NODEID_BUS_NUMBER, NODEID_CPS,
    NODEID_ID_VALID, NODEID_ROOT,
};
use crate::ohci::{ContextId, Ohci1394};
use crate::HcdContext;

// SelfIDCount fields: byte count in the low word, generation in byte 2,
// error flag in the top byte
const SELF_ID_COUNT_SIZE: u32 = 0x0000_07FC;
const SELF_ID_COUNT_ERROR: u32 = 0x8000_0000;

// Self-ID packet bytes, composed low byte first
const SELF_ID_INITIATED: u8 = 0x02;
const SELF_ID_P0_TO_CHILD: u8 = 0x80;
const SELF_ID_P0_TO_PARENT: u8 = 0xC0;
const SELF_ID_CONTENDER: u8 = 0x08;
const SELF_ID_LINK_ACTIVE: u8 = 0x40;
const SELF_ID_TYPE: u8 = 0x80;

impl<C: HcdContext> Ohci1394<C> {
    /// Protocol-level bus reset: invalidate the node id, bump the self-ID
    /// generation, park the AT contexts and regenerate the self-ID stream
    pub(crate) fn bus_reset(&mut self) -> Result<()> {
        debug!(
            "bus reset (generation {})",
            self.self_id_generation().wrapping_add(1)
        );
        let node_id = (self.regs.read(offsets::NODE_ID) & !NODEID_BUS_NUMBER) | (0x3FF << 6);
        self.regs.write(
            offsets::NODE_ID,
            node_id & !(NODEID_CPS | NODEID_ROOT | NODEID_ID_VALID),
        );
        self.bump_generation();
        self.regs.set_bits(offsets::INT_EVENT_SET, INT_BUS_RESET);
        if self.link != LinkState::Connected {
            // alone on the bus
            self.root = true;
        }
        self.regs
            .clear_bits(ContextId::AtRequest.control(), CONTEXT_RUN);
        self.regs
            .clear_bits(ContextId::AtResponse.control(), CONTEXT_RUN);
        if self.context_control(ContextId::ArResponse) & CONTEXT_RUN != 0 {
            // a running response context observes the reset as a PHY packet
            let mut packet = [0u8; 12];
            packet[..4].copy_from_slice(&0x0000_00E0u32.to_le_bytes());
            packet[8..].copy_from_slice(&((self.self_id_generation() as u32) << 16).to_le_bytes());
            self.ar_deliver(ArContext::Response, &packet, EVT_BUS_RESET)?;
        }
        self.complete_self_id()
    }

    pub(crate) fn self_id_generation(&self) -> u8 {
        (self.regs.read(offsets::SELF_ID_COUNT) >> 16) as u8
    }

    fn bump_generation(&mut self) {
        let count = self.regs.read(offsets::SELF_ID_COUNT);
        let generation = ((count >> 16).wrapping_add(1)) & 0xFF;
        self.regs.write(
            offsets::SELF_ID_COUNT,
            (count & 0xFF00_FFFF) | (generation << 16),
        );
    }

    fn add_self_id_bytes(&mut self, count: u32) {
        let value = self.regs.read(offsets::SELF_ID_COUNT);
        let lo_word = (value & 0xFFFF).wrapping_add(count) & 0xFFFF;
        self.regs
            .write(offsets::SELF_ID_COUNT, (value & 0xFFFF_0000) | lo_word);
    }

    /// Rebuild the node id and, when self-ID reception is enabled, write the
    /// packetized self-ID stream into guest memory
    fn complete_self_id(&mut self) -> Result<()> {
        let mut node_id = if self.root { 0 } else { 1 };
        node_id |= 0x3FF << 6;
        if self.link == LinkState::Connected {
            node_id |= NODEID_CPS;
        }
        if self.root {
            node_id |= NODEID_ROOT;
        }
        node_id |= NODEID_ID_VALID;
        self.regs.write(offsets::NODE_ID, node_id);

        let count = self.regs.read(offsets::SELF_ID_COUNT);
        self.regs.write(
            offsets::SELF_ID_COUNT,
            count & !(SELF_ID_COUNT_SIZE | SELF_ID_COUNT_ERROR),
        );

        if self.regs.read(offsets::LINK_CONTROL_SET) & LINK_CONTROL_RCV_SELF_ID != 0 {
            let buffer = self.regs.read(offsets::SELF_ID_BUFFER);

            // Node 0, the root: each self-ID word is followed by its complement
            let sid = u32::from_le_bytes([
                SELF_ID_INITIATED | SELF_ID_P0_TO_CHILD,
                SELF_ID_CONTENDER,
                SELF_ID_LINK_ACTIVE,
                SELF_ID_TYPE,
            ]);
            self.dma_write_word(buffer.wrapping_add(4), sid)?;
            self.dma_write_word(buffer.wrapping_add(8), !sid)?;
            self.add_self_id_bytes(8);

            if self.link == LinkState::Connected {
                // Node 1, the child hanging off port 0
                let sid = u32::from_le_bytes([
                    SELF_ID_P0_TO_PARENT,
                    0,
                    SELF_ID_LINK_ACTIVE,
                    1 | SELF_ID_TYPE,
                ]);
                self.dma_write_word(buffer.wrapping_add(12), sid)?;
                self.dma_write_word(buffer.wrapping_add(16), !sid)?;
                self.add_self_id_bytes(8);
            }

            let header = ((self.self_id_generation() as u32) << 16) | 1;
            self.dma_write_word(buffer, header)?;
            self.add_self_id_bytes(4);
        }
        self.raise_event(INT_SELF_ID_COMPLETE | INT_SELF_ID_COMPLETE2);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testctx::TestCtx;

    const BUFFER: u32 = 0x400;

    fn device() -> Ohci1394<TestCtx> {
        let mut device = Ohci1394::new(TestCtx::new());
        device
            .write_register(offsets::SELF_ID_BUFFER, BUFFER)
            .unwrap();
        device
            .write_register(offsets::LINK_CONTROL_SET, LINK_CONTROL_RCV_SELF_ID)
            .unwrap();
        device
    }

    #[test]
    fn single_node_stream() {
        let mut device = device();
        device.bus_reset().unwrap();

        assert_eq!(device.self_id_generation(), 1);
        let count = device.read_register(offsets::SELF_ID_COUNT);
        assert_eq!(count & 0xFFFF, 12, "header plus one self-id pair");

        let header = device.hcd_ctx.ram_word(BUFFER);
        assert_eq!(header, (1 << 16) | 1);
        let sid = device.hcd_ctx.ram_word(BUFFER + 4);
        assert_eq!(sid, u32::from_le_bytes([0x82, 0x08, 0x40, 0x80]));
        assert_eq!(device.hcd_ctx.ram_word(BUFFER + 8), !sid);

        // alone on the bus: root, valid, no cable power status
        let node_id = device.read_register(offsets::NODE_ID);
        assert_eq!(node_id & 0x3F, 0);
        assert_eq!(node_id & NODEID_BUS_NUMBER, 0x3FF << 6);
        assert_ne!(node_id & NODEID_ROOT, 0);
        assert_ne!(node_id & NODEID_ID_VALID, 0);
        assert_eq!(node_id & NODEID_CPS, 0);

        let events = device.read_register(offsets::INT_EVENT_SET);
        assert_ne!(events & INT_BUS_RESET, 0);
        assert_ne!(events & (INT_SELF_ID_COMPLETE | INT_SELF_ID_COMPLETE2), 0);
    }

    #[test]
    fn generation_increments_once_per_reset() {
        let mut device = device();
        device.bus_reset().unwrap();
        device.bus_reset().unwrap();
        device.bus_reset().unwrap();
        assert_eq!(device.self_id_generation(), 3);
        // the byte count restarts every time
        let count = device.read_register(offsets::SELF_ID_COUNT);
        assert_eq!(count & 0xFFFF, 12);
    }

    #[test]
    fn stream_skipped_without_rcv_self_id() {
        let mut device = device();
        device
            .write_register(offsets::LINK_CONTROL_CLEAR, LINK_CONTROL_RCV_SELF_ID)
            .unwrap();
        device.bus_reset().unwrap();
        assert_eq!(device.self_id_generation(), 1);
        let count = device.read_register(offsets::SELF_ID_COUNT);
        assert_eq!(count & 0xFFFF, 0, "no bytes written");
        assert_eq!(device.hcd_ctx.ram_word(BUFFER), 0);
        // completion still signals
        let events = device.read_register(offsets::INT_EVENT_SET);
        assert_ne!(events & INT_SELF_ID_COMPLETE, 0);
    }

    #[test]
    fn bus_reset_parks_at_contexts() {
        let mut device = device();
        device
            .regs
            .set_bits(ContextId::AtRequest.control(), CONTEXT_RUN);
        device
            .regs
            .set_bits(ContextId::AtResponse.control(), CONTEXT_RUN);
        device.bus_reset().unwrap();
        assert_eq!(
            device.context_control(ContextId::AtRequest) & CONTEXT_RUN,
            0
        );
        assert_eq!(
            device.context_control(ContextId::AtResponse) & CONTEXT_RUN,
            0
        );
    }

    #[test]
    fn running_ar_response_sees_reset_packet() {
        let mut device = device();
        // park a receive descriptor and start the response context
        device.hcd_ctx.set_ram_word(0x200, 64); // req_count
        device.hcd_ctx.set_ram_word(0x204, 0x300); // data_address
        device.hcd_ctx.set_ram_word(0x208, 0); // end of chain
        device.hcd_ctx.set_ram_word(0x20C, 64); // res_count
        device
            .write_register(offsets::AR_RSP_COMMAND_PTR, 0x200 | 1)
            .unwrap();
        device
            .write_register(offsets::AR_RSP_CONTROL_SET, CONTEXT_RUN)
            .unwrap();

        device.bus_reset().unwrap();

        assert_eq!(device.hcd_ctx.ram_word(0x300), 0x0000_00E0);
        assert_eq!(device.hcd_ctx.ram_word(0x304), 0);
        assert_eq!(device.hcd_ctx.ram_word(0x308), 1 << 16, "generation word");
        // event code reports the bus reset
        assert_eq!(
            device.context_control(ContextId::ArResponse) & 0x1F,
            EVT_BUS_RESET as u32
        );
    }
}
