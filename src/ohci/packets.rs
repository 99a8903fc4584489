use anyhow::Result;
use packed_struct::derive::PackedStruct;
use packed_struct::PackedStruct;

// Ack and event codes reported through a context's event-code field
pub(crate) const EVT_OVERRUN: u8 = 0x05;
pub(crate) const EVT_BUS_RESET: u8 = 0x09;
pub(crate) const EVT_TCODE_ERR: u8 = 0x0B;
pub(crate) const ACK_COMPLETE: u8 = 0x11;
pub(crate) const ACK_PENDING: u8 = 0x12;

// Response codes carried in the r_code byte of response packets
pub(crate) const RESP_COMPLETE: u8 = 0x00;
pub(crate) const RESP_ADDRESS_ERROR: u8 = 0x70;

// Layout of the flags word leading every packet
pub(crate) const PACKET_FLAGS_T_CODE: u32 = 0x0000_00F0;
pub(crate) const PACKET_FLAGS_RT: u32 = 0x0000_0300;
pub(crate) const PACKET_FLAGS_T_LABEL: u32 = 0x0000_FC00;

// Transaction codes, pre-shifted into the flags position
pub(crate) const TCODE_WRITE_QUADLET_REQUEST: u32 = 0x00;
pub(crate) const TCODE_WRITE_BLOCK_REQUEST: u32 = 0x10;
pub(crate) const TCODE_WRITE_RESPONSE: u32 = 0x20;
pub(crate) const TCODE_READ_QUADLET_REQUEST: u32 = 0x40;
pub(crate) const TCODE_READ_BLOCK_REQUEST: u32 = 0x50;
pub(crate) const TCODE_READ_QUADLET_RESPONSE: u32 = 0x60;
pub(crate) const TCODE_READ_BLOCK_RESPONSE: u32 = 0x70;
pub(crate) const TCODE_PHY_PACKET: u32 = 0xE0;

/// Decode a packet from its little-endian wire image
pub(crate) fn from_wire<T, const N: usize>(buffer: &[u8]) -> Result<T>
where
    T: PackedStruct<ByteArray = [u8; N]>,
{
    let mut data = [0u8; N];
    data.copy_from_slice(&buffer[..N]);
    data.reverse(); // Reverse because of endianness

    let packet = T::unpack(&data)?;
    Ok(packet)
}

/// Encode a packet into its little-endian wire image
pub(crate) fn to_wire<T, const N: usize>(packet: &T) -> Result<[u8; N]>
where
    T: PackedStruct<ByteArray = [u8; N]>,
{
    let mut data = packet.pack()?;
    data.reverse(); // Reverse because of endianness
    Ok(data)
}

/// Request carrying no payload (quadlet read); 12 bytes on the wire
#[derive(PackedStruct, Debug, Clone)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "12", endian = "msb")]
pub struct ReqNoDataPacket {
    #[packed_field(bits = "0:31")]
    pub flags: u32,

    #[packed_field(bits = "32:47")]
    pub destination_offset_high: u16,

    #[packed_field(bits = "48:63")]
    pub destination_id: u16,

    #[packed_field(bits = "64:95")]
    pub destination_offset_low: u32,
}

/// Quadlet-write request; the data quadlet rides directly in the header
#[derive(PackedStruct, Debug, Clone)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "16", endian = "msb")]
pub struct ReqQuadletPacket {
    #[packed_field(bits = "0:31")]
    pub flags: u32,

    #[packed_field(bits = "32:47")]
    pub destination_offset_high: u16,

    #[packed_field(bits = "48:63")]
    pub destination_id: u16,

    #[packed_field(bits = "64:95")]
    pub destination_offset_low: u32,

    #[packed_field(bits = "96:127")]
    pub data: u32,
}

/// Block request header; `data_length` payload bytes follow on the wire
/// for writes, or are requested from the target for reads
#[derive(PackedStruct, Debug, Clone)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "16", endian = "msb")]
pub struct ReqBlockPacket {
    #[packed_field(bits = "0:31")]
    pub flags: u32,

    #[packed_field(bits = "32:47")]
    pub destination_offset_high: u16,

    #[packed_field(bits = "48:63")]
    pub destination_id: u16,

    #[packed_field(bits = "64:95")]
    pub destination_offset_low: u32,

    #[packed_field(bits = "112:127")]
    pub data_length: u16,
}

/// Write response: r_code only, 12 bytes on the wire
#[derive(PackedStruct, Debug, Clone)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "12", endian = "msb")]
pub struct RspNoDataPacket {
    #[packed_field(bits = "0:15")]
    pub flags: u16,

    #[packed_field(bits = "16:31")]
    pub destination_id: u16,

    #[packed_field(bits = "40:47")]
    pub r_code: u8,

    #[packed_field(bits = "48:63")]
    pub source_id: u16,
}

/// Quadlet-read response
#[derive(PackedStruct, Debug, Clone)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "16", endian = "msb")]
pub struct RspQuadletPacket {
    #[packed_field(bits = "0:15")]
    pub flags: u16,

    #[packed_field(bits = "16:31")]
    pub destination_id: u16,

    #[packed_field(bits = "40:47")]
    pub r_code: u8,

    #[packed_field(bits = "48:63")]
    pub source_id: u16,

    #[packed_field(bits = "96:127")]
    pub data: u32,
}

/// Block-read response header; `data_length` payload bytes follow
#[derive(PackedStruct, Debug, Clone)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "16", endian = "msb")]
pub struct RspBlockPacket {
    #[packed_field(bits = "0:15")]
    pub flags: u16,

    #[packed_field(bits = "16:31")]
    pub destination_id: u16,

    #[packed_field(bits = "40:47")]
    pub r_code: u8,

    #[packed_field(bits = "48:63")]
    pub source_id: u16,

    #[packed_field(bits = "112:127")]
    pub data_length: u16,
}
