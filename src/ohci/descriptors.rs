use anyhow::Result;
use packed_struct::derive::PackedStruct;
use packed_struct::PackedStruct;

use crate::HcdContext;

// Each descriptor is 16 bytes on guest memory: counts, flags and a branch pointer
pub(crate) const DESCRIPTOR_LENGTH: usize = 16;

// AT descriptor flags subfields
pub(crate) const AT_FLAGS_INTERRUPT: u16 = 0x0030;
pub(crate) const AT_FLAGS_KEY: u16 = 0x0700;
pub(crate) const AT_FLAGS_CMD: u16 = 0xF000;

pub(crate) const AT_CMD_OUTPUT_MORE: u16 = 0x0000;
pub(crate) const AT_CMD_OUTPUT_LAST: u16 = 0x1000;
pub(crate) const AT_KEY_IMMEDIATE: u16 = 0x0200;

/// Z field: a branch address with a zero low nibble terminates the chain
pub(crate) fn branch_z(branch_address: u32) -> u32 {
    branch_address & 0x0000_000F
}

pub(crate) fn read_descriptor<T>(address: u64, hcd_ctx: &mut dyn HcdContext) -> Result<T>
where
    T: PackedStruct<ByteArray = [u8; DESCRIPTOR_LENGTH]>,
{
    let mut data = [0u8; DESCRIPTOR_LENGTH];
    hcd_ctx.dma_read(address, &mut data)?;
    data.reverse(); // Reverse because of endianness

    let descriptor = T::unpack(&data)?;
    Ok(descriptor)
}

pub(crate) fn write_descriptor<T>(
    descriptor: &T, address: u64, hcd_ctx: &mut dyn HcdContext,
) -> Result<()>
where
    T: PackedStruct<ByteArray = [u8; DESCRIPTOR_LENGTH]>,
{
    let mut data = descriptor.pack()?;
    data.reverse(); // Reverse because of endianness
    hcd_ctx.dma_write(address, &data)
}

/// AT (transmit) descriptor; immediate variants carry 16 bytes of inline
/// packet data directly after this structure
#[derive(PackedStruct, Debug, Clone)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "16", endian = "msb")]
pub struct TransmitDescriptor {
    #[packed_field(bits = "0:15")]
    pub req_count: u16,

    #[packed_field(bits = "16:31")]
    pub flags: u16,

    #[packed_field(bits = "32:63")]
    pub data_address: u32,

    #[packed_field(bits = "64:95")]
    pub branch_address: u32,

    #[packed_field(bits = "96:111")]
    pub timestamp: u16,

    #[packed_field(bits = "112:127")]
    pub transfer_status: u16,
}

impl TransmitDescriptor {
    pub fn cmd(&self) -> u16 {
        self.flags & AT_FLAGS_CMD
    }

    pub fn key(&self) -> u16 {
        self.flags & AT_FLAGS_KEY
    }

    pub fn is_immediate(&self) -> bool {
        self.key() == AT_KEY_IMMEDIATE
    }

    pub fn wants_interrupt(&self) -> bool {
        self.flags & AT_FLAGS_INTERRUPT == AT_FLAGS_INTERRUPT
    }
}

/// AR (receive) descriptor; `res_count` tracks the writable space left in
/// the data buffer and counts down from `req_count`
#[derive(PackedStruct, Debug, Clone)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "16", endian = "msb")]
pub struct ReceiveDescriptor {
    #[packed_field(bits = "0:15")]
    pub req_count: u16,

    #[packed_field(bits = "16:31")]
    pub flags: u16,

    #[packed_field(bits = "32:63")]
    pub data_address: u32,

    #[packed_field(bits = "64:95")]
    pub branch_address: u32,

    #[packed_field(bits = "96:111")]
    pub res_count: u16,

    #[packed_field(bits = "112:127")]
    pub transfer_status: u16,
}
