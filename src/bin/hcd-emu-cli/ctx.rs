use std::collections::VecDeque;
use std::io::Write;
use std::net::TcpStream;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::info;
use timerfd::{SetTimeFlags, TimerFd, TimerState};

use hcd_emu::{AtContext, HcdContext};

// Adapt from HcdContext to a TCP peer transport plus in-process guest RAM
pub struct EmuContext {
    stream: TcpStream,
    pub ram: Vec<u8>,
    pub timer: TimerFd,
    pub pending_timers: VecDeque<AtContext>,
    irq_level: bool,
}

impl EmuContext {
    pub fn new(stream: TcpStream, ram_size: usize) -> Result<Self> {
        Ok(EmuContext {
            stream,
            ram: vec![0; ram_size],
            timer: TimerFd::new().context("creating AT timer")?,
            pending_timers: VecDeque::new(),
            irq_level: false,
        })
    }

    pub fn ram_word(&self, address: u32) -> u32 {
        let address = address as usize;
        u32::from_le_bytes(self.ram[address..address + 4].try_into().unwrap())
    }

    pub fn set_ram_word(&mut self, address: u32, value: u32) {
        let address = address as usize;
        self.ram[address..address + 4].copy_from_slice(&value.to_le_bytes());
    }
}

impl HcdContext for EmuContext {
    fn send(&mut self, buffer: &[u8]) -> Result<usize> {
        self.stream
            .write_all(buffer)
            .context("peer transport write")?;
        Ok(buffer.len())
    }

    fn dma_read(&mut self, address: u64, buffer: &mut [u8]) -> Result<()> {
        let address = address as usize;
        if address + buffer.len() > self.ram.len() {
            bail!("guest read outside ram at {:#x}", address);
        }
        buffer.copy_from_slice(&self.ram[address..address + buffer.len()]);
        Ok(())
    }

    fn dma_write(&mut self, address: u64, buffer: &[u8]) -> Result<()> {
        let address = address as usize;
        if address + buffer.len() > self.ram.len() {
            bail!("guest write outside ram at {:#x}", address);
        }
        self.ram[address..address + buffer.len()].copy_from_slice(buffer);
        Ok(())
    }

    fn set_irq(&mut self, asserted: bool) {
        if asserted != self.irq_level {
            info!("IRQ line {}", if asserted { "asserted" } else { "lowered" });
        }
        self.irq_level = asserted;
    }

    fn schedule_at_timer(&mut self, context: AtContext) {
        self.pending_timers.push_back(context);
        // Minimal one-shot delay; the poller picks the fire up once the
        // current entry point has returned
        self.timer.set_state(
            TimerState::Oneshot(Duration::from_nanos(1)),
            SetTimeFlags::Default,
        );
    }
}
