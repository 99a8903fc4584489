use anyhow::Result;
use log::{debug, trace, warn};

use crate::ohci::interrupts::INT_PHY;
use crate::ohci::packets::{
    from_wire, to_wire, ReqBlockPacket, ReqNoDataPacket, ReqQuadletPacket, RspBlockPacket,
    RspNoDataPacket, RspQuadletPacket, ACK_COMPLETE, PACKET_FLAGS_RT, PACKET_FLAGS_T_CODE,
    PACKET_FLAGS_T_LABEL, RESP_ADDRESS_ERROR, RESP_COMPLETE, TCODE_READ_BLOCK_REQUEST,
    TCODE_READ_BLOCK_RESPONSE, TCODE_READ_QUADLET_REQUEST, TCODE_READ_QUADLET_RESPONSE,
    TCODE_WRITE_BLOCK_REQUEST, TCODE_WRITE_QUADLET_REQUEST, TCODE_WRITE_RESPONSE,
};
use crate::ohci::receive::ArContext;
use crate::ohci::registers::{offsets, HC_CONTROL_LINK_ENABLE};
use crate::ohci::Ohci1394;
use crate::HcdContext;

/// Peer-link connection state, advanced by transport events and bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No transport
    Unplugged,
    /// Transport open, greeting not yet verified
    AwaitingMagic,
    /// Greeting verified, waiting for the peer's link to come up
    Disconnected,
    /// Peer link seen; a bid goes out as soon as traffic arrives
    Arbitration1,
    /// Bid sent, waiting for the peer's
    Arbitration2,
    /// Two-node bus established
    Connected,
}

const MAGIC: &[u8; 4] = b"1394";
const LINK_ON_WORD: u32 = 0xFFFF_FFFF;
const LINK_OFF_WORD: u32 = 0xFFFF_FFFE;

impl<C: HcdContext> Ohci1394<C> {
    pub(crate) fn link_enabled(&self) -> bool {
        self.regs.read(offsets::HC_CONTROL_SET) & HC_CONTROL_LINK_ENABLE != 0
    }

    pub(crate) fn send_link_on(&mut self) -> Result<()> {
        self.hcd_ctx.send(&LINK_ON_WORD.to_le_bytes())?;
        Ok(())
    }

    /// Transport came up: greet the peer, and announce our link if the
    /// guest already enabled it
    pub fn transport_open(&mut self) -> Result<()> {
        debug!("transport open, sending greeting");
        self.link = LinkState::AwaitingMagic;
        self.bufpos = 0;
        self.hcd_ctx.send(MAGIC)?;
        if self.link_enabled() {
            self.send_link_on()?;
            if self.other_link {
                self.bus_reset()?;
            }
        }
        Ok(())
    }

    /// Transport dropped: back to a single-node bus
    pub fn transport_close(&mut self) -> Result<()> {
        debug!("transport closed");
        self.link = LinkState::Unplugged;
        self.phy.record_port_event();
        self.regs.set_bits(offsets::INT_EVENT_SET, INT_PHY);
        self.bus_reset()
    }

    /// Consume a chunk of transport bytes: zero or more complete packets,
    /// with any partial tail kept in the reassembly buffer
    pub fn transport_receive(&mut self, data: &[u8]) -> Result<()> {
        let mut src = data;
        loop {
            match self.link {
                LinkState::Unplugged => {
                    if src.is_empty() {
                        break;
                    }
                    // data raced ahead of the open notification; synthesize it
                    self.transport_open()?;
                }
                LinkState::AwaitingMagic => {
                    self.fill_reassembly(&mut src, 4);
                    if self.bufpos < 4 {
                        break;
                    }
                    let magic_ok = &self.buf[..4] == MAGIC;
                    self.bufpos = 0;
                    if magic_ok {
                        debug!("peer greeting verified");
                        self.link = LinkState::Disconnected;
                    } else {
                        warn!("bad greeting from peer, discarding");
                    }
                }
                LinkState::Disconnected => {
                    self.fill_reassembly(&mut src, 4);
                    if self.bufpos < 4 {
                        break;
                    }
                    let word = u32::from_le_bytes([
                        self.buf[0], self.buf[1], self.buf[2], self.buf[3],
                    ]);
                    self.bufpos = 0;
                    if word != LINK_ON_WORD {
                        trace!("ignoring {:08x} while disconnected", word);
                        continue;
                    }
                    self.other_link = true;
                    self.link = LinkState::Arbitration1;
                    if self.link_enabled() {
                        self.send_arbitration_bid()?;
                    }
                    // otherwise we progress when our link comes up and the
                    // peer sends its bid
                }
                LinkState::Arbitration1 => {
                    if src.is_empty() {
                        break;
                    }
                    self.send_arbitration_bid()?;
                }
                LinkState::Arbitration2 => {
                    self.fill_reassembly(&mut src, 2);
                    if self.bufpos < 2 {
                        break;
                    }
                    let peer_bid = u16::from_le_bytes([self.buf[0], self.buf[1]]);
                    self.bufpos = 0;
                    if peer_bid == self.bid {
                        debug!("arbitration tie on {:04x}, re-bidding", peer_bid);
                        self.send_arbitration_bid()?;
                        continue;
                    }
                    // lower bid wins the root
                    self.root = self.bid < peer_bid;
                    self.link = LinkState::Connected;
                    debug!(
                        "connected as {} (bid {:04x} vs {:04x})",
                        if self.root { "root" } else { "child" },
                        self.bid,
                        peer_bid
                    );
                    self.bus_reset()?;
                }
                LinkState::Connected => {
                    if !self.link_enabled() {
                        break;
                    }
                    self.fill_reassembly(&mut src, 4);
                    if self.bufpos < 4 {
                        break;
                    }
                    let word = u32::from_le_bytes([
                        self.buf[0], self.buf[1], self.buf[2], self.buf[3],
                    ]);
                    if word == LINK_OFF_WORD {
                        debug!("peer link dropped");
                        self.bufpos = 0;
                        self.link = LinkState::Disconnected;
                        self.bus_reset()?;
                        continue;
                    }
                    let complete = match word & PACKET_FLAGS_T_CODE {
                        TCODE_WRITE_QUADLET_REQUEST => self.handle_request_quadlet_write(&mut src)?,
                        TCODE_WRITE_BLOCK_REQUEST => self.handle_request_block_write(&mut src)?,
                        TCODE_WRITE_RESPONSE => self.handle_response_quadlet_write(&mut src)?,
                        TCODE_READ_QUADLET_REQUEST => self.handle_request_quadlet_read(&mut src)?,
                        TCODE_READ_BLOCK_REQUEST => self.handle_request_block_read(&mut src)?,
                        TCODE_READ_QUADLET_RESPONSE => self.handle_response_quadlet_read(&mut src)?,
                        TCODE_READ_BLOCK_RESPONSE => self.handle_response_block_read(&mut src)?,
                        tcode => self.handle_unknown_tcode(&mut src, tcode)?,
                    };
                    if !complete {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Accumulate up to `required` bytes into the reassembly buffer,
    /// advancing the source slice past whatever was taken
    fn fill_reassembly(&mut self, src: &mut &[u8], required: usize) {
        if self.bufpos >= required {
            return;
        }
        let to_copy = (required - self.bufpos).min(src.len());
        self.buf[self.bufpos..self.bufpos + to_copy].copy_from_slice(&src[..to_copy]);
        *src = &src[to_copy..];
        self.bufpos += to_copy;
    }

    fn send_arbitration_bid(&mut self) -> Result<()> {
        self.bid = self.hcd_ctx.arbitration_bid() & 0x7FFF;
        trace!("sending arbitration bid {:04x}", self.bid);
        let bid = self.bid;
        self.hcd_ctx.send(&bid.to_le_bytes())?;
        self.link = LinkState::Arbitration2;
        Ok(())
    }

    /// Response flags echo the request's retry code and transaction label
    fn response_flags(request_flags: u32, tcode: u32) -> u16 {
        (tcode | (request_flags & (PACKET_FLAGS_RT | PACKET_FLAGS_T_LABEL))) as u16
    }

    fn handle_request_quadlet_write(&mut self, src: &mut &[u8]) -> Result<bool> {
        const SIZE: usize = 16;
        self.fill_reassembly(src, SIZE);
        if self.bufpos < SIZE {
            return Ok(false);
        }
        let req: ReqQuadletPacket = from_wire(&self.buf[..SIZE])?;
        self.hcd_ctx.dma_write(
            req.destination_offset_low as u64,
            &req.data.to_le_bytes(),
        )?;
        let rsp = RspNoDataPacket {
            flags: Self::response_flags(req.flags, TCODE_WRITE_RESPONSE),
            destination_id: req.destination_id ^ 1,
            r_code: RESP_COMPLETE,
            source_id: req.destination_id,
        };
        self.hcd_ctx.send(&to_wire(&rsp)?)?;
        self.bufpos = 0;
        Ok(true)
    }

    fn handle_request_block_write(&mut self, src: &mut &[u8]) -> Result<bool> {
        const HEADER: usize = 16;
        self.fill_reassembly(src, HEADER);
        if self.bufpos < HEADER {
            return Ok(false);
        }
        let req: ReqBlockPacket = from_wire(&self.buf[..HEADER])?;
        let total = HEADER + req.data_length as usize;
        self.fill_reassembly(src, total);
        if self.bufpos < total {
            return Ok(false);
        }
        self.hcd_ctx.dma_write(
            req.destination_offset_low as u64,
            &self.buf[HEADER..total],
        )?;
        let rsp = RspNoDataPacket {
            flags: Self::response_flags(req.flags, TCODE_WRITE_RESPONSE),
            destination_id: req.destination_id ^ 1,
            r_code: RESP_COMPLETE,
            source_id: req.destination_id,
        };
        self.hcd_ctx.send(&to_wire(&rsp)?)?;
        self.bufpos = 0;
        Ok(true)
    }

    fn handle_response_quadlet_write(&mut self, src: &mut &[u8]) -> Result<bool> {
        const SIZE: usize = 12;
        self.fill_reassembly(src, SIZE);
        if self.bufpos < SIZE {
            return Ok(false);
        }
        let packet = self.buf[..SIZE].to_vec();
        self.ar_deliver(ArContext::Response, &packet, ACK_COMPLETE)?;
        self.bufpos = 0;
        Ok(true)
    }

    fn handle_request_quadlet_read(&mut self, src: &mut &[u8]) -> Result<bool> {
        const SIZE: usize = 12;
        self.fill_reassembly(src, SIZE);
        if self.bufpos < SIZE {
            return Ok(false);
        }
        let req: ReqNoDataPacket = from_wire(&self.buf[..SIZE])?;
        let mut data = [0u8; 4];
        let r_code = self.read_request_target(
            req.destination_offset_high,
            req.destination_offset_low,
            &mut data,
        );
        let rsp = RspQuadletPacket {
            flags: Self::response_flags(req.flags, TCODE_READ_QUADLET_RESPONSE),
            destination_id: req.destination_id ^ 1,
            r_code,
            source_id: req.destination_id,
            data: u32::from_le_bytes(data),
        };
        self.hcd_ctx.send(&to_wire(&rsp)?)?;
        self.bufpos = 0;
        Ok(true)
    }

    fn handle_request_block_read(&mut self, src: &mut &[u8]) -> Result<bool> {
        const SIZE: usize = 16;
        self.fill_reassembly(src, SIZE);
        if self.bufpos < SIZE {
            return Ok(false);
        }
        let req: ReqBlockPacket = from_wire(&self.buf[..SIZE])?;
        let mut payload = vec![0u8; req.data_length as usize];
        let r_code = self.read_request_target(
            req.destination_offset_high,
            req.destination_offset_low,
            &mut payload,
        );
        let rsp = RspBlockPacket {
            flags: Self::response_flags(req.flags, TCODE_READ_BLOCK_RESPONSE),
            destination_id: req.destination_id ^ 1,
            r_code,
            source_id: req.destination_id,
            data_length: if r_code == RESP_COMPLETE {
                req.data_length
            } else {
                0
            },
        };
        self.hcd_ctx.send(&to_wire(&rsp)?)?;
        if r_code == RESP_COMPLETE {
            self.hcd_ctx.send(&payload)?;
        }
        self.bufpos = 0;
        Ok(true)
    }

    fn handle_response_quadlet_read(&mut self, src: &mut &[u8]) -> Result<bool> {
        const SIZE: usize = 16;
        self.fill_reassembly(src, SIZE);
        if self.bufpos < SIZE {
            return Ok(false);
        }
        let packet = self.buf[..SIZE].to_vec();
        self.ar_deliver(ArContext::Response, &packet, ACK_COMPLETE)?;
        self.bufpos = 0;
        Ok(true)
    }

    fn handle_response_block_read(&mut self, src: &mut &[u8]) -> Result<bool> {
        const HEADER: usize = 16;
        self.fill_reassembly(src, HEADER);
        if self.bufpos < HEADER {
            return Ok(false);
        }
        let header: RspBlockPacket = from_wire(&self.buf[..HEADER])?;
        let total = HEADER + header.data_length as usize;
        self.fill_reassembly(src, total);
        if self.bufpos < total {
            return Ok(false);
        }
        let packet = self.buf[..total].to_vec();
        self.ar_deliver(ArContext::Response, &packet, ACK_COMPLETE)?;
        self.bufpos = 0;
        Ok(true)
    }

    /// An unrecognized tcode consumes one base header and drops it, leaving
    /// the parser aligned for the next packet
    fn handle_unknown_tcode(&mut self, src: &mut &[u8], tcode: u32) -> Result<bool> {
        const SIZE: usize = 12;
        self.fill_reassembly(src, SIZE);
        if self.bufpos < SIZE {
            return Ok(false);
        }
        warn!("dropping packet with unknown tcode {:02x}", tcode);
        self.bufpos = 0;
        Ok(true)
    }

    /// Resolve an incoming read: the config-ROM window at the top of the
    /// address space, the low bus-0 window mapped straight to guest memory,
    /// or an address error
    fn read_request_target(
        &mut self, offset_high: u16, offset_low: u32, buffer: &mut [u8],
    ) -> u8 {
        if offset_high == 0xFFFF {
            if offset_low & 0xFFFF_FC00 == 0xF000_0400 {
                let address = self
                    .regs
                    .read(offsets::CONFIG_ROM_MAP)
                    .wrapping_add(offset_low & 0x3FF);
                match self.hcd_ctx.dma_read(address as u64, buffer) {
                    Ok(()) => RESP_COMPLETE,
                    Err(_) => RESP_ADDRESS_ERROR,
                }
            } else {
                RESP_ADDRESS_ERROR
            }
        } else if offset_high == 0 {
            match self.hcd_ctx.dma_read(offset_low as u64, buffer) {
                Ok(()) => RESP_COMPLETE,
                Err(_) => RESP_ADDRESS_ERROR,
            }
        } else {
            RESP_ADDRESS_ERROR
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::ohci::interrupts::{
        INT_BUS_RESET, INT_REQ_TX_COMPLETE, INT_RS_PKT, INT_SELF_ID_COMPLETE,
        INT_SELF_ID_COMPLETE2,
    };
    use crate::ohci::registers::{CONTEXT_RUN, NODEID_CPS, NODEID_ROOT};
    use crate::ohci::{ContextId, Ohci1394};
    use crate::testctx::{pump_pair, TestCtx};

    const SELF_ID_BUFFER: u32 = 0x8000;
    const AT_DESCRIPTOR: u32 = 0x1000;
    const AR_DESCRIPTOR: u32 = 0x2000;
    const AR_BUFFER: u32 = 0x3000;

    fn device(bid: u16) -> Ohci1394<TestCtx> {
        let mut ctx = TestCtx::new();
        ctx.bid = bid;
        let mut device = Ohci1394::new(ctx);
        device
            .write_register(offsets::SELF_ID_BUFFER, SELF_ID_BUFFER)
            .unwrap();
        device
            .write_register(offsets::LINK_CONTROL_SET, 0x200)
            .unwrap();
        device
    }

    fn enable_link(device: &mut Ohci1394<TestCtx>) {
        device
            .write_register(offsets::HC_CONTROL_SET, HC_CONTROL_LINK_ENABLE)
            .unwrap();
    }

    fn connected_pair() -> (Ohci1394<TestCtx>, Ohci1394<TestCtx>) {
        let mut a = device(0x0100);
        let mut b = device(0x0200);
        a.transport_open().unwrap();
        b.transport_open().unwrap();
        pump_pair(&mut a, &mut b);
        enable_link(&mut a);
        pump_pair(&mut a, &mut b);
        enable_link(&mut b);
        pump_pair(&mut a, &mut b);
        assert_eq!(a.link_state(), LinkState::Connected);
        assert_eq!(b.link_state(), LinkState::Connected);
        (a, b)
    }

    #[test]
    fn magic_handshake_reaches_disconnected() {
        let mut a = device(0x0100);
        let mut b = device(0x0200);
        a.transport_open().unwrap();
        b.transport_open().unwrap();
        pump_pair(&mut a, &mut b);
        assert_eq!(a.link_state(), LinkState::Disconnected);
        assert_eq!(b.link_state(), LinkState::Disconnected);
        // nothing to report yet
        assert_eq!(a.read_register(offsets::INT_EVENT_SET), 0);
        assert_eq!(b.read_register(offsets::INT_EVENT_SET), 0);
        assert!(!a.hcd_ctx.irq_level);
        assert!(!b.hcd_ctx.irq_level);
    }

    #[test]
    fn bad_greeting_is_discarded() {
        let mut device = device(0x0100);
        device.transport_open().unwrap();
        device.hcd_ctx.take_sent();
        device.transport_receive(b"xxxx").unwrap();
        assert_eq!(device.link_state(), LinkState::AwaitingMagic);
        assert_eq!(device.bufpos, 0);
        device.transport_receive(b"1394").unwrap();
        assert_eq!(device.link_state(), LinkState::Disconnected);
    }

    #[test]
    fn data_races_ahead_of_open_notification() {
        let mut device = device(0x0100);
        device.transport_receive(b"1394").unwrap();
        assert_eq!(device.link_state(), LinkState::Disconnected);
        // the synthesized open still greeted the peer
        assert_eq!(&device.hcd_ctx.take_sent(), b"1394");
    }

    #[test]
    fn arbitration_elects_lower_bid_as_root() {
        let (a, b) = connected_pair();
        assert!(a.root, "lower bid becomes root");
        assert!(!b.root);

        let a_node = a.read_register(offsets::NODE_ID);
        let b_node = b.read_register(offsets::NODE_ID);
        assert_eq!(a_node & 0x3F, 0);
        assert_eq!(b_node & 0x3F, 1);
        assert_ne!(a_node & NODEID_ROOT, 0);
        assert_eq!(b_node & NODEID_ROOT, 0);
        assert_ne!(a_node & NODEID_CPS, 0);
        assert_ne!(b_node & NODEID_CPS, 0);

        for device in [&a, &b] {
            assert_eq!(device.self_id_generation(), 1);
            let events = device.read_register(offsets::INT_EVENT_SET);
            let expected = INT_BUS_RESET | INT_SELF_ID_COMPLETE | INT_SELF_ID_COMPLETE2;
            assert_eq!(events & expected, expected);
            let count = device.read_register(offsets::SELF_ID_COUNT);
            assert_eq!(count & 0xFFFF, 20, "header plus two self-id pairs");
        }
    }

    #[test]
    fn arbitration_tie_rebids_immediately() {
        let mut a = device(0);
        let mut b = device(0);
        a.hcd_ctx.bid_sequence = VecDeque::from([0x0100, 0x0042]);
        b.hcd_ctx.bid_sequence = VecDeque::from([0x0100, 0x0099]);
        a.transport_open().unwrap();
        b.transport_open().unwrap();
        pump_pair(&mut a, &mut b);
        enable_link(&mut a);
        enable_link(&mut b);
        pump_pair(&mut a, &mut b);
        assert_eq!(a.link_state(), LinkState::Connected);
        assert_eq!(b.link_state(), LinkState::Connected);
        assert!(a.root, "second round decides");
        assert!(!b.root);
    }

    #[test]
    fn quadlet_write_round_trip() {
        let (mut a, mut b) = connected_pair();
        a.write_register(offsets::INT_EVENT_CLEAR, 0xFFFF_FFFF).unwrap();
        b.write_register(offsets::INT_EVENT_CLEAR, 0xFFFF_FFFF).unwrap();

        // a parks an AR-response descriptor for the reply
        a.hcd_ctx.set_ram_word(AR_DESCRIPTOR, 64);
        a.hcd_ctx.set_ram_word(AR_DESCRIPTOR + 4, AR_BUFFER);
        a.hcd_ctx.set_ram_word(AR_DESCRIPTOR + 8, 0);
        a.hcd_ctx.set_ram_word(AR_DESCRIPTOR + 12, 64);
        a.write_register(offsets::AR_RSP_COMMAND_PTR, AR_DESCRIPTOR | 1)
            .unwrap();
        a.write_register(offsets::AR_RSP_CONTROL_SET, CONTEXT_RUN)
            .unwrap();

        // guest on a: OUTPUT_LAST_Immediate quadlet write to node 1, offset 0x1000
        a.hcd_ctx.set_ram_word(AT_DESCRIPTOR, (0x1230 << 16) | 16);
        a.hcd_ctx.set_ram_word(AT_DESCRIPTOR + 4, 0);
        a.hcd_ctx.set_ram_word(AT_DESCRIPTOR + 8, 0);
        a.hcd_ctx.set_ram_word(AT_DESCRIPTOR + 12, 0);
        a.hcd_ctx.set_ram_word(AT_DESCRIPTOR + 16, 1 << 10); // tcode 0, tLabel 1
        a.hcd_ctx.set_ram_word(AT_DESCRIPTOR + 20, 0xFFC1_0000);
        a.hcd_ctx.set_ram_word(AT_DESCRIPTOR + 24, 0x1000);
        a.hcd_ctx.set_ram_word(AT_DESCRIPTOR + 28, 0xDEAD_BEEF);
        a.write_register(offsets::AT_REQ_COMMAND_PTR, AT_DESCRIPTOR | 1)
            .unwrap();
        a.write_register(offsets::AT_REQ_CONTROL_SET, CONTEXT_RUN)
            .unwrap();
        pump_pair(&mut a, &mut b);

        // the quadlet landed in the peer's memory
        assert_eq!(b.hcd_ctx.ram_word(0x1000), 0xDEAD_BEEF);

        // and the response made it back into the AR-response chain
        let events = a.read_register(offsets::INT_EVENT_SET);
        assert_ne!(events & INT_REQ_TX_COMPLETE, 0);
        assert_ne!(events & INT_RS_PKT, 0);
        assert_eq!(
            a.hcd_ctx.ram_word(AR_DESCRIPTOR + 12) & 0xFFFF,
            64 - 12 - 4,
            "12 byte response plus trailer"
        );
        let first = a.hcd_ctx.ram_word(AR_BUFFER);
        assert_eq!(first & 0xF0, 0x20, "write-response tcode");
        assert_eq!(first >> 16, 0xFFC0, "addressed back to node 0");
        assert_eq!(
            a.context_control(ContextId::ArResponse) & 0x1F,
            ACK_COMPLETE as u32
        );
        // AT completion wrote the descriptor status with the staged ack
        assert_eq!(
            a.context_control(ContextId::AtRequest) & 0x1F,
            crate::ohci::packets::ACK_PENDING as u32
        );
    }

    #[test]
    fn unknown_tcode_consumes_one_header() {
        let (mut a, _b) = connected_pair();
        let events_before = a.read_register(offsets::INT_EVENT_SET);

        let mut packet = [0u8; 12];
        packet[0] = 0x30; // unimplemented lock-request tcode
        a.transport_receive(&packet).unwrap();
        assert_eq!(a.bufpos, 0);
        assert_eq!(a.link_state(), LinkState::Connected);
        assert_eq!(a.read_register(offsets::INT_EVENT_SET), events_before);

        // the stream stays aligned: a following write request still lands
        let mut request = Vec::new();
        request.extend_from_slice(&0u32.to_le_bytes()); // tcode 0
        request.extend_from_slice(&0xFFC0_0000u32.to_le_bytes());
        request.extend_from_slice(&0x2000u32.to_le_bytes());
        request.extend_from_slice(&0x0123_4567u32.to_le_bytes());
        a.transport_receive(&request).unwrap();
        assert_eq!(a.hcd_ctx.ram_word(0x2000), 0x0123_4567);
    }

    #[test]
    fn incoming_read_requests_answer_from_guest_memory() {
        let (mut a, _b) = connected_pair();
        a.hcd_ctx.set_ram_word(0x4000, 0xFEED_FACE);
        a.hcd_ctx.take_sent();

        let mut request = Vec::new();
        request.extend_from_slice(&0x40u32.to_le_bytes()); // quadlet read
        request.extend_from_slice(&0xFFC0_0000u32.to_le_bytes());
        request.extend_from_slice(&0x4000u32.to_le_bytes());
        a.transport_receive(&request).unwrap();

        let response = a.hcd_ctx.take_sent();
        assert_eq!(response.len(), 16);
        assert_eq!(response[0] & 0xF0, 0x60, "quadlet-read response");
        assert_eq!(response[5], RESP_COMPLETE);
        assert_eq!(&response[12..], &0xFEED_FACEu32.to_le_bytes());
    }

    #[test]
    fn out_of_window_read_reports_address_error() {
        let (mut a, _b) = connected_pair();
        a.hcd_ctx.take_sent();

        let mut request = Vec::new();
        request.extend_from_slice(&0x40u32.to_le_bytes());
        request.extend_from_slice(&0xFFC0_1234u32.to_le_bytes()); // offset high 0x1234
        request.extend_from_slice(&0x4000u32.to_le_bytes());
        a.transport_receive(&request).unwrap();

        let response = a.hcd_ctx.take_sent();
        assert_eq!(response[5], RESP_ADDRESS_ERROR);
    }

    #[test]
    fn block_read_from_config_rom_window() {
        let (mut a, _b) = connected_pair();
        a.write_register(offsets::CONFIG_ROM_MAP, 0x5000).unwrap();
        a.hcd_ctx.set_ram_word(0x5000, 0x0404_3931);
        a.hcd_ctx.set_ram_word(0x5004, 0x3133_3934);
        a.hcd_ctx.take_sent();

        let mut request = Vec::new();
        request.extend_from_slice(&0x50u32.to_le_bytes()); // block read
        request.extend_from_slice(&0xFFC0_FFFFu32.to_le_bytes()); // offset high 0xFFFF
        request.extend_from_slice(&0xF000_0400u32.to_le_bytes());
        request.extend_from_slice(&(8u32 << 16).to_le_bytes()); // data_length 8
        a.transport_receive(&request).unwrap();

        let response = a.hcd_ctx.take_sent();
        assert_eq!(response.len(), 16 + 8, "header plus payload");
        assert_eq!(response[0] & 0xF0, 0x70);
        assert_eq!(response[5], RESP_COMPLETE);
        assert_eq!(&response[16..20], &0x0404_3931u32.to_le_bytes());
    }

    #[test]
    fn peer_link_drop_resets_to_disconnected() {
        let (mut a, _b) = connected_pair();
        let generation = a.self_id_generation();
        a.transport_receive(&0xFFFF_FFFEu32.to_le_bytes()).unwrap();
        assert_eq!(a.link_state(), LinkState::Disconnected);
        assert_eq!(a.self_id_generation(), generation + 1);
    }

    #[test]
    fn transport_close_unplugs_and_resets() {
        let (mut a, _b) = connected_pair();
        a.write_register(offsets::INT_EVENT_CLEAR, 0xFFFF_FFFF).unwrap();
        a.transport_close().unwrap();
        assert_eq!(a.link_state(), LinkState::Unplugged);
        let events = a.read_register(offsets::INT_EVENT_SET);
        assert_ne!(events & INT_PHY, 0);
        assert_ne!(events & INT_BUS_RESET, 0);
        assert_eq!(a.self_id_generation(), 2);
    }
}
