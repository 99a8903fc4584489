use anyhow::Result;
use log::trace;

use crate::ohci::descriptors::{
    branch_z, read_descriptor, write_descriptor, TransmitDescriptor, AT_CMD_OUTPUT_LAST,
    AT_CMD_OUTPUT_MORE, AT_KEY_IMMEDIATE, DESCRIPTOR_LENGTH,
};
use crate::ohci::interrupts::{INT_REQ_TX_COMPLETE, INT_RESP_TX_COMPLETE};
use crate::ohci::packets::{
    ACK_COMPLETE, ACK_PENDING, EVT_TCODE_ERR, PACKET_FLAGS_T_CODE, TCODE_PHY_PACKET,
    TCODE_READ_BLOCK_REQUEST, TCODE_READ_QUADLET_REQUEST, TCODE_WRITE_BLOCK_REQUEST,
    TCODE_WRITE_QUADLET_REQUEST,
};
use crate::ohci::registers::{CONTEXT_ACTIVE, CONTEXT_DEAD, CONTEXT_RUN, CONTEXT_WAKE};
use crate::ohci::{ContextId, Ohci1394};
use crate::{AtContext, HcdContext};

/// Cursor and staged completion code for one AT context; the run/active/
/// dead/wake bits live in the context-control register itself
#[derive(Debug, Default)]
pub(crate) struct AtEngine {
    address: u32,
    response: u8,
}

impl<C: HcdContext> Ohci1394<C> {
    /// Latch the command pointer and mark the context active; the staged
    /// response starts out as a tcode error until a packet says otherwise
    pub(crate) fn at_run(&mut self, at: AtContext) {
        let ctx = ContextId::from(at);
        let address = self.regs.read(ctx.command_ptr()) & 0xFFFF_FFF0;
        let engine = self.at_engine_mut(at);
        engine.address = address;
        engine.response = EVT_TCODE_ERR;
        self.regs.set_bits(ctx.control(), CONTEXT_ACTIVE);
    }

    /// One-shot timer body; scheduled from the register write path and
    /// re-armed after every descriptor until the chain terminates
    pub fn at_timer_elapsed(&mut self, at: AtContext) -> Result<()> {
        let ctx = ContextId::from(at);
        let control = self.context_control(ctx);
        if control & CONTEXT_DEAD != 0 || control & CONTEXT_RUN == 0 {
            self.regs
                .clear_bits(ctx.control(), CONTEXT_WAKE | CONTEXT_ACTIVE);
            return Ok(());
        }
        if control & CONTEXT_ACTIVE == 0 {
            if control & CONTEXT_WAKE == 0 {
                return Ok(());
            }
            self.regs.clear_bits(ctx.control(), CONTEXT_WAKE);
            let address = self.at_engine(at).address;
            let db: TransmitDescriptor = read_descriptor(address as u64, &mut self.hcd_ctx)?;
            if branch_z(db.branch_address) == 0 {
                return Ok(());
            }
            self.regs.write(ctx.command_ptr(), db.branch_address);
            self.at_run(at); // also sets active
        }
        self.regs.clear_bits(ctx.control(), CONTEXT_WAKE);

        let address = self.at_engine(at).address;
        let mut db: TransmitDescriptor = read_descriptor(address as u64, &mut self.hcd_ctx)?;
        match (db.cmd(), db.key()) {
            // OUTPUT_MORE, OUTPUT_LAST and their Immediate variants
            (AT_CMD_OUTPUT_MORE, 0)
            | (AT_CMD_OUTPUT_MORE, AT_KEY_IMMEDIATE)
            | (AT_CMD_OUTPUT_LAST, 0)
            | (AT_CMD_OUTPUT_LAST, AT_KEY_IMMEDIATE) => {}
            (cmd, key) => {
                trace!("AT {:?}: unknown descriptor command {:04x}/{:04x}", at, cmd, key);
                return Ok(());
            }
        }

        if db.is_immediate() {
            self.at_send_immediate(at, address, &db)?;
        } else {
            // Stage the buffer the descriptor points at and push it on the wire
            let mut data = vec![0u8; db.req_count as usize];
            self.hcd_ctx.dma_read(db.data_address as u64, &mut data)?;
            self.hcd_ctx.send(&data)?;
        }

        if db.cmd() == AT_CMD_OUTPUT_MORE {
            let step = DESCRIPTOR_LENGTH + if db.is_immediate() { 16 } else { 0 };
            let engine = self.at_engine_mut(at);
            engine.address = engine.address.wrapping_add(step as u32);
        } else {
            // OUTPUT_LAST: report completion and either branch or stop
            if db.wants_interrupt() {
                let bit = match at {
                    AtContext::Request => INT_REQ_TX_COMPLETE,
                    AtContext::Response => INT_RESP_TX_COMPLETE,
                };
                self.raise_event(bit);
            }
            let response = self.at_engine(at).response;
            self.set_context_event_code(ctx, response);
            db.transfer_status = self.context_control(ctx) as u16;
            write_descriptor(&db, address as u64, &mut self.hcd_ctx)?;
            if branch_z(db.branch_address) == 0 {
                self.regs.clear_bits(ctx.control(), CONTEXT_ACTIVE);
                return Ok(());
            }
            self.regs.write(ctx.command_ptr(), db.branch_address);
            self.at_run(at);
        }
        self.hcd_ctx.schedule_at_timer(at);
        Ok(())
    }

    /// Immediate descriptors carry the packet inline; the leading tcode
    /// selects how much of it goes on the wire and the acknowledge to stage
    fn at_send_immediate(
        &mut self, at: AtContext, address: u32, db: &TransmitDescriptor,
    ) -> Result<()> {
        let mut data = [0u8; 16];
        let count = (db.req_count as usize).min(data.len());
        self.hcd_ctx.dma_read(
            address as u64 + DESCRIPTOR_LENGTH as u64,
            &mut data[..count],
        )?;

        let flags = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        match flags & PACKET_FLAGS_T_CODE {
            TCODE_WRITE_QUADLET_REQUEST => {
                // quadlet requests always occupy the full immediate area
                self.hcd_ctx.send(&data)?;
                self.at_engine_mut(at).response = ACK_PENDING;
            }
            TCODE_WRITE_BLOCK_REQUEST | TCODE_READ_QUADLET_REQUEST
            | TCODE_READ_BLOCK_REQUEST => {
                self.hcd_ctx.send(&data[..count])?;
                self.at_engine_mut(at).response = ACK_PENDING;
            }
            TCODE_PHY_PACKET => {
                // typically a gap-count update; the bus resets either way
                self.at_engine_mut(at).response = ACK_COMPLETE;
                self.bus_reset()?;
            }
            tcode => {
                trace!("AT {:?}: unhandled immediate tcode {:02x}", at, tcode);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ohci::registers::offsets;
    use crate::testctx::{pump_at_timers, TestCtx};

    const DESCRIPTOR: u32 = 0x100;

    fn device() -> Ohci1394<TestCtx> {
        Ohci1394::new(TestCtx::new())
    }

    fn start_at_request(device: &mut Ohci1394<TestCtx>, command_ptr: u32) {
        device
            .write_register(offsets::AT_REQ_COMMAND_PTR, command_ptr)
            .unwrap();
        device
            .write_register(offsets::AT_REQ_CONTROL_SET, CONTEXT_RUN)
            .unwrap();
        pump_at_timers(device);
    }

    /// OUTPUT_LAST_Immediate quadlet-write with completion interrupt
    fn program_quadlet_write(device: &mut Ohci1394<TestCtx>, descriptor: u32, branch: u32) {
        device
            .hcd_ctx
            .set_ram_word(descriptor, (0x1230 << 16) | 16);
        device.hcd_ctx.set_ram_word(descriptor + 4, 0);
        device.hcd_ctx.set_ram_word(descriptor + 8, branch);
        device.hcd_ctx.set_ram_word(descriptor + 12, 0);
        device.hcd_ctx.set_ram_word(descriptor + 16, 1 << 10); // tcode 0, tLabel 1
        device.hcd_ctx.set_ram_word(descriptor + 20, 0xFFC1_0000);
        device.hcd_ctx.set_ram_word(descriptor + 24, 0x1000);
        device.hcd_ctx.set_ram_word(descriptor + 28, 0xDEAD_BEEF);
    }

    #[test]
    fn immediate_quadlet_write_goes_on_the_wire() {
        let mut device = device();
        program_quadlet_write(&mut device, DESCRIPTOR, 0);
        start_at_request(&mut device, DESCRIPTOR | 1);

        let sent = device.hcd_ctx.take_sent();
        assert_eq!(sent.len(), 16);
        assert_eq!(&sent[..4], &(1u32 << 10).to_le_bytes());
        assert_eq!(&sent[12..], &0xDEAD_BEEFu32.to_le_bytes());

        // completion: interrupt bit, staged ack, status write-back, stop at Z=0
        let events = device.read_register(offsets::INT_EVENT_SET);
        assert_ne!(events & INT_REQ_TX_COMPLETE, 0);
        let control = device.context_control(ContextId::AtRequest);
        assert_eq!(control & 0x1F, ACK_PENDING as u32);
        assert_eq!(control & CONTEXT_ACTIVE, 0);
        let status = device.hcd_ctx.ram_word(DESCRIPTOR + 12) >> 16;
        assert_eq!(status, 0x8412, "run | active | ack_pending");
    }

    #[test]
    fn output_more_chains_to_output_last() {
        let mut device = device();
        // OUTPUT_MORE pointing at an 8 byte payload, then a contiguous
        // OUTPUT_LAST with 4 more bytes
        device.hcd_ctx.set_ram_word(DESCRIPTOR, 8);
        device.hcd_ctx.set_ram_word(DESCRIPTOR + 4, 0x800);
        device.hcd_ctx.set_ram_word(DESCRIPTOR + 8, 0);
        device.hcd_ctx.set_ram_word(DESCRIPTOR + 12, 0);
        device.hcd_ctx.set_ram_word(DESCRIPTOR + 16, (0x1000 << 16) | 4);
        device.hcd_ctx.set_ram_word(DESCRIPTOR + 20, 0x810);
        device.hcd_ctx.set_ram_word(DESCRIPTOR + 24, 0);
        device.hcd_ctx.set_ram_word(DESCRIPTOR + 28, 0);
        device.hcd_ctx.set_ram_word(0x800, 0x0101_0101);
        device.hcd_ctx.set_ram_word(0x804, 0x0202_0202);
        device.hcd_ctx.set_ram_word(0x810, 0x0303_0303);

        start_at_request(&mut device, DESCRIPTOR | 1);

        let sent = device.hcd_ctx.take_sent();
        assert_eq!(sent.len(), 12);
        assert_eq!(&sent[..4], &[1, 1, 1, 1]);
        assert_eq!(&sent[8..], &[3, 3, 3, 3]);
        // no interrupt requested, but the status still lands in the last
        // descriptor and the engine parks
        assert_eq!(
            device.read_register(offsets::INT_EVENT_SET) & INT_REQ_TX_COMPLETE,
            0
        );
        assert_ne!(device.hcd_ctx.ram_word(DESCRIPTOR + 28) >> 16, 0);
        assert_eq!(
            device.context_control(ContextId::AtRequest) & CONTEXT_ACTIVE,
            0
        );
    }

    #[test]
    fn branch_is_followed_across_descriptors() {
        let mut device = device();
        program_quadlet_write(&mut device, DESCRIPTOR, 0x300 | 1);
        program_quadlet_write(&mut device, 0x300, 0);
        start_at_request(&mut device, DESCRIPTOR | 1);

        assert_eq!(device.hcd_ctx.take_sent().len(), 32, "both packets sent");
        assert_eq!(
            device.read_register(offsets::AT_REQ_COMMAND_PTR),
            0x300 | 1
        );
    }

    #[test]
    fn unknown_command_stalls_silently() {
        let mut device = device();
        device.hcd_ctx.set_ram_word(DESCRIPTOR, 0x2000 << 16); // bad cmd
        start_at_request(&mut device, DESCRIPTOR | 1);
        assert!(device.hcd_ctx.take_sent().is_empty());
        // context still claims active; the guest has to intervene
        assert_ne!(
            device.context_control(ContextId::AtRequest) & CONTEXT_ACTIVE,
            0
        );
    }

    #[test]
    fn timer_without_run_quiesces() {
        let mut device = device();
        program_quadlet_write(&mut device, DESCRIPTOR, 0);
        device
            .write_register(offsets::AT_REQ_COMMAND_PTR, DESCRIPTOR | 1)
            .unwrap();
        // wake alone schedules the timer but run is off
        device
            .write_register(offsets::AT_REQ_CONTROL_SET, CONTEXT_WAKE)
            .unwrap();
        pump_at_timers(&mut device);
        assert!(device.hcd_ctx.take_sent().is_empty());
        let control = device.context_control(ContextId::AtRequest);
        assert_eq!(control & (CONTEXT_WAKE | CONTEXT_ACTIVE), 0);
    }

    #[test]
    fn phy_packet_resets_the_bus() {
        let mut device = device();
        device.hcd_ctx.set_ram_word(DESCRIPTOR, (0x1200 << 16) | 8);
        device.hcd_ctx.set_ram_word(DESCRIPTOR + 8, 0);
        device.hcd_ctx.set_ram_word(DESCRIPTOR + 16, 0xE0); // PHY packet
        device.hcd_ctx.set_ram_word(DESCRIPTOR + 20, 0);
        start_at_request(&mut device, DESCRIPTOR | 1);

        assert!(device.hcd_ctx.take_sent().is_empty(), "nothing on the wire");
        assert_eq!(device.self_id_generation(), 1);
        // ACK_COMPLETE is staged, though the reset already cleared run
        assert_eq!(
            device.context_control(ContextId::AtRequest) & 0x1F,
            ACK_COMPLETE as u32
        );
    }
}
