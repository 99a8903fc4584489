use std::collections::VecDeque;

use anyhow::{bail, Result};

use crate::ohci::Ohci1394;
use crate::{AtContext, HcdContext};

/// Test double for the host environment: flat guest RAM, captured transport
/// output, recorded IRQ level and queued AT-timer fires. The arbitration
/// bid is fixed so two-device tests are deterministic.
pub(crate) struct TestCtx {
    pub ram: Vec<u8>,
    pub sent: Vec<u8>,
    pub irq_level: bool,
    pub pending_timers: VecDeque<AtContext>,
    pub bid: u16,
    pub bid_sequence: VecDeque<u16>,
}

impl TestCtx {
    pub fn new() -> Self {
        TestCtx {
            ram: vec![0; 0x1_0000],
            sent: Vec::new(),
            irq_level: false,
            pending_timers: VecDeque::new(),
            bid: 0x1234,
            bid_sequence: VecDeque::new(),
        }
    }

    pub fn ram_word(&self, address: u32) -> u32 {
        let address = address as usize;
        u32::from_le_bytes(self.ram[address..address + 4].try_into().unwrap())
    }

    pub fn set_ram_word(&mut self, address: u32, value: u32) {
        let address = address as usize;
        self.ram[address..address + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn take_sent(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.sent)
    }
}

impl HcdContext for TestCtx {
    fn send(&mut self, buffer: &[u8]) -> Result<usize> {
        self.sent.extend_from_slice(buffer);
        Ok(buffer.len())
    }

    fn dma_read(&mut self, address: u64, buffer: &mut [u8]) -> Result<()> {
        let address = address as usize;
        if address + buffer.len() > self.ram.len() {
            bail!("dma read outside test ram at {:#x}", address);
        }
        buffer.copy_from_slice(&self.ram[address..address + buffer.len()]);
        Ok(())
    }

    fn dma_write(&mut self, address: u64, buffer: &[u8]) -> Result<()> {
        let address = address as usize;
        if address + buffer.len() > self.ram.len() {
            bail!("dma write outside test ram at {:#x}", address);
        }
        self.ram[address..address + buffer.len()].copy_from_slice(buffer);
        Ok(())
    }

    fn set_irq(&mut self, asserted: bool) {
        self.irq_level = asserted;
    }

    fn schedule_at_timer(&mut self, context: AtContext) {
        self.pending_timers.push_back(context);
    }

    fn arbitration_bid(&mut self) -> u16 {
        self.bid_sequence.pop_front().unwrap_or(self.bid)
    }
}

/// Run every queued AT-timer fire to quiescence
pub(crate) fn pump_at_timers(device: &mut Ohci1394<TestCtx>) {
    while let Some(context) = device.hcd_ctx.pending_timers.pop_front() {
        device.at_timer_elapsed(context).unwrap();
    }
}

/// Shuttle bytes between two devices until neither has pending output or
/// timer work
pub(crate) fn pump_pair(a: &mut Ohci1394<TestCtx>, b: &mut Ohci1394<TestCtx>) {
    loop {
        pump_at_timers(a);
        pump_at_timers(b);
        let from_a = a.hcd_ctx.take_sent();
        if !from_a.is_empty() {
            b.transport_receive(&from_a).unwrap();
        }
        let from_b = b.hcd_ctx.take_sent();
        if !from_b.is_empty() {
            a.transport_receive(&from_b).unwrap();
        }
        if from_a.is_empty()
            && from_b.is_empty()
            && a.hcd_ctx.pending_timers.is_empty()
            && b.hcd_ctx.pending_timers.is_empty()
        {
            break;
        }
    }
}
