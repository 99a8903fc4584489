use anyhow::Result;
use log::{debug, trace};

use crate::ohci::descriptors::{branch_z, read_descriptor, write_descriptor, ReceiveDescriptor};
use crate::ohci::interrupts::{INT_RQ_PKT, INT_RS_PKT};
use crate::ohci::packets::EVT_OVERRUN;
use crate::ohci::registers::{CONTEXT_ACTIVE, CONTEXT_WAKE};
use crate::ohci::{ContextId, Ohci1394};
use crate::HcdContext;

/// One of the two asynchronous-receive DMA contexts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ArContext {
    Request,
    Response,
}

impl ArContext {
    fn id(self) -> ContextId {
        match self {
            ArContext::Request => ContextId::ArRequest,
            ArContext::Response => ContextId::ArResponse,
        }
    }

    fn packet_event(self) -> u32 {
        match self {
            ArContext::Request => INT_RQ_PKT,
            ArContext::Response => INT_RS_PKT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum DeliverPhase {
    Copy,
    Trailer,
    Settle,
}

impl<C: HcdContext> Ohci1394<C> {
    pub(crate) fn ar_run(&mut self, ar: ArContext) {
        trace!("AR {:?}: run", ar);
        self.regs.set_bits(ar.id().control(), CONTEXT_ACTIVE);
    }

    pub(crate) fn ar_stop(&mut self, ar: ArContext) {
        trace!("AR {:?}: stop", ar);
        self.regs.clear_bits(ar.id().control(), CONTEXT_ACTIVE);
    }

    /// A woken, inactive context re-reads its current descriptor and resumes
    /// when the guest has appended to the chain
    pub(crate) fn ar_wake(&mut self, ar: ArContext) -> Result<()> {
        let ctx = ar.id();
        self.regs.clear_bits(ctx.control(), CONTEXT_WAKE);
        if self.context_control(ctx) & CONTEXT_ACTIVE != 0 {
            return Ok(());
        }
        let address = self.regs.read(ctx.command_ptr()) & 0xFFFF_FFF0;
        let db: ReceiveDescriptor = read_descriptor(address as u64, &mut self.hcd_ctx)?;
        if branch_z(db.branch_address) != 0 {
            self.regs.set_bits(ctx.control(), CONTEXT_ACTIVE);
            self.regs.write(ctx.command_ptr(), db.branch_address);
        }
        Ok(())
    }

    /// Deposit one framed packet into the context's descriptor chain: fill
    /// the current buffer, spill across branches as needed, then append the
    /// 32-bit packet-status trailer. A chain that runs out mid-packet drops
    /// the tail and deactivates with an overrun event code.
    pub(crate) fn ar_deliver(&mut self, ar: ArContext, packet: &[u8], event: u8) -> Result<()> {
        if packet.is_empty() {
            return Ok(());
        }
        let ctx = ar.id();
        self.set_context_event_code(ctx, event);

        let mut address = self.regs.read(ctx.command_ptr()) & 0xFFFF_FFF0;
        let mut db: ReceiveDescriptor = read_descriptor(address as u64, &mut self.hcd_ctx)?;
        let mut target = db
            .data_address
            .wrapping_add((db.req_count as u32).wrapping_sub(db.res_count as u32));
        let mut remaining = packet;
        let mut phase = DeliverPhase::Copy;

        loop {
            db.transfer_status = self.context_control(ctx) as u16;
            if db.res_count == 0 {
                write_descriptor(&db, address as u64, &mut self.hcd_ctx)?;
                let branch = db.branch_address;
                self.regs.write(ctx.command_ptr(), branch);
                if branch_z(branch) == 0 {
                    self.regs.clear_bits(ctx.control(), CONTEXT_ACTIVE);
                    if phase != DeliverPhase::Settle {
                        self.set_context_event_code(ctx, EVT_OVERRUN);
                        debug!(
                            "AR {:?}: chain exhausted, dropping {} bytes",
                            ar,
                            remaining.len()
                        );
                    }
                    break;
                }
                address = branch & 0xFFFF_FFF0;
                db = read_descriptor(address as u64, &mut self.hcd_ctx)?;
                target = db
                    .data_address
                    .wrapping_add((db.req_count as u32).wrapping_sub(db.res_count as u32));
            }
            match phase {
                DeliverPhase::Copy => {
                    let count = remaining.len().min(db.res_count as usize);
                    self.hcd_ctx.dma_write(target as u64, &remaining[..count])?;
                    db.res_count -= count as u16;
                    target = target.wrapping_add(count as u32);
                    remaining = &remaining[count..];
                    if remaining.is_empty() {
                        phase = DeliverPhase::Trailer;
                    }
                }
                DeliverPhase::Trailer => {
                    let status = self.context_control(ctx) << 16;
                    self.hcd_ctx.dma_write(target as u64, &status.to_le_bytes())?;
                    db.res_count = db.res_count.saturating_sub(4);
                    db.transfer_status = self.context_control(ctx) as u16;
                    write_descriptor(&db, address as u64, &mut self.hcd_ctx)?;
                    // one more turn so a filled descriptor still advances the chain
                    phase = DeliverPhase::Settle;
                }
                DeliverPhase::Settle => break,
            }
        }
        self.raise_event(ar.packet_event());
        Ok(())
    }
}
