use std::slice::{from_raw_parts, from_raw_parts_mut};

use anyhow::{anyhow, Result};
use log::error;

use crate::ohci::Ohci1394;
use crate::{AtContext, HcdContext};

// General FFI interface

type SendCallback = unsafe extern "C" fn(buffer: *const u8, len: usize);
type DmaReadCallback = unsafe extern "C" fn(dma_address: u64, buffer: *mut u8, len: usize) -> bool;
type DmaWriteCallback =
    unsafe extern "C" fn(dma_address: u64, buffer: *const u8, len: usize) -> bool;
type SetIrqCallback = unsafe extern "C" fn(asserted: bool);
type ScheduleAtTimerCallback = unsafe extern "C" fn(context: u32);

#[repr(C)]
pub struct FfiCallbacks {
    send_cb: SendCallback,
    dma_read_cb: DmaReadCallback,
    dma_write_cb: DmaWriteCallback,
    set_irq_cb: SetIrqCallback,
    schedule_at_timer_cb: ScheduleAtTimerCallback,
}

impl HcdContext for FfiCallbacks {
    fn send(&mut self, buffer: &[u8]) -> Result<usize> {
        unsafe {
            (self.send_cb)(buffer.as_ptr(), buffer.len());
        }

        // Assume everything went well...
        Ok(buffer.len())
    }

    fn dma_read(&mut self, address: u64, buffer: &mut [u8]) -> Result<()> {
        let ok = unsafe { (self.dma_read_cb)(address, buffer.as_mut_ptr(), buffer.len()) };
        if ok {
            Ok(())
        } else {
            Err(anyhow!("dma read failed at {:#x}", address))
        }
    }

    fn dma_write(&mut self, address: u64, buffer: &[u8]) -> Result<()> {
        let ok = unsafe { (self.dma_write_cb)(address, buffer.as_ptr(), buffer.len()) };
        if ok {
            Ok(())
        } else {
            Err(anyhow!("dma write failed at {:#x}", address))
        }
    }

    fn set_irq(&mut self, asserted: bool) {
        unsafe { (self.set_irq_cb)(asserted) }
    }

    fn schedule_at_timer(&mut self, context: AtContext) {
        let context = match context {
            AtContext::Request => 0,
            AtContext::Response => 1,
        };
        unsafe { (self.schedule_at_timer_cb)(context) }
    }
}

fn at_context_from_ffi(context: u32) -> Option<AtContext> {
    match context {
        0 => Some(AtContext::Request),
        1 => Some(AtContext::Response),
        _ => None,
    }
}

// OHCI1394 FFI Interface

pub struct Ohci1394FFI {
    device: Ohci1394<FfiCallbacks>,
}

impl Ohci1394FFI {
    #[no_mangle]
    pub extern "C" fn new_ohci1394(callbacks: FfiCallbacks) -> *mut Ohci1394FFI {
        let device_ffi = Ohci1394FFI {
            device: Ohci1394::new(callbacks),
        };
        Box::into_raw(Box::new(device_ffi))
    }

    #[no_mangle]
    pub extern "C" fn drop_ohci1394(device_ffi: *mut Ohci1394FFI) {
        unsafe {
            // Box will free on drop
            let _ = Box::from_raw(device_ffi);
        }
    }

    #[no_mangle]
    pub extern "C" fn ohci1394_region_access(
        &mut self, offset: usize, data_ptr: *const u8, data_len: usize, write: bool,
    ) -> bool {
        let data = unsafe { from_raw_parts_mut(data_ptr as *mut u8, data_len) };

        if let Err(e) = self.device.region_access_bar0(offset, data, write) {
            error!("Error accessing Bar0: {}", e);
            false
        } else {
            true
        }
    }

    #[no_mangle]
    pub extern "C" fn ohci1394_transport_open(&mut self) -> bool {
        if let Err(e) = self.device.transport_open() {
            error!("Error opening transport: {}", e);
            false
        } else {
            true
        }
    }

    #[no_mangle]
    pub extern "C" fn ohci1394_transport_close(&mut self) -> bool {
        if let Err(e) = self.device.transport_close() {
            error!("Error closing transport: {}", e);
            false
        } else {
            true
        }
    }

    #[no_mangle]
    pub extern "C" fn ohci1394_transport_receive(
        &mut self, data_ptr: *const u8, data_len: usize,
    ) -> bool {
        let data = unsafe { from_raw_parts(data_ptr, data_len) };

        if let Err(e) = self.device.transport_receive(data) {
            error!("Error receiving transport bytes: {}", e);
            false
        } else {
            true
        }
    }

    #[no_mangle]
    pub extern "C" fn ohci1394_at_timer_elapsed(&mut self, context: u32) -> bool {
        let Some(context) = at_context_from_ffi(context) else {
            error!("Unknown AT context {}", context);
            return false;
        };

        if let Err(e) = self.device.at_timer_elapsed(context) {
            error!("Error running AT context: {}", e);
            false
        } else {
            true
        }
    }

    #[no_mangle]
    pub extern "C" fn ohci1394_hard_reset(&mut self) {
        self.device.hard_reset();
    }
}
