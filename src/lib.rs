use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;

mod ffi;
pub mod ohci;

#[cfg(test)]
pub(crate) mod testctx;

/// One of the two asynchronous-transmit DMA contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtContext {
    Request,
    Response,
}

pub trait HcdContext {
    // Send bytes to the peer controller over the transport
    fn send(&mut self, buffer: &[u8]) -> Result<usize>;

    fn dma_read(&mut self, address: u64, buffer: &mut [u8]) -> Result<()>;
    fn dma_write(&mut self, address: u64, buffer: &[u8]) -> Result<()>;

    /// Drive the interrupt line; the device only reports level changes
    fn set_irq(&mut self, asserted: bool);

    /// Arm the zero-delay one-shot that re-enters the AT engine for `context`.
    /// The host must call [`ohci::Ohci1394::at_timer_elapsed`] once per request,
    /// after the current entry point has returned.
    fn schedule_at_timer(&mut self, context: AtContext);

    /// 15-bit bid used to arbitrate which node becomes bus root.
    /// The default derivation folds the wall clock; tests override this for determinism.
    fn arbitration_bid(&mut self) -> u16 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let seconds = now.as_secs();
        let micros = now.subsec_micros();
        let mut bid = 0u16;
        bid ^= seconds as u16;
        bid ^= (seconds >> 16) as u16;
        bid ^= (seconds >> 32) as u16;
        bid ^= (seconds >> 48) as u16;
        bid ^= micros as u16;
        bid ^= (micros >> 16) as u16;
        bid & 0x7FFF
    }
}
