use std::io::{ErrorKind, Read};
use std::net::{TcpListener, TcpStream};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::{debug, info, warn, LevelFilter};
use polling::{Event, Events, PollMode, Poller};

use crate::ctx::EmuContext;
use hcd_emu::ohci::registers::offsets;
use hcd_emu::ohci::{LinkState, Ohci1394};

mod ctx;

// Guest RAM layout used by the scripted driver below
const AT_DESCRIPTOR: u32 = 0x1000;
const AR_DESCRIPTOR: u32 = 0x2000;
const AR_DATA_BUFFER: u32 = 0x3000;
const SELF_ID_BUFFER: u32 = 0x8000;

/// Two-node virtual FireWire bus: run one listening and one connecting
/// instance and watch them arbitrate, reset and exchange packets.
#[derive(Parser)]
struct Args {
    /// Listen for the peer controller on this address, e.g. 127.0.0.1:5394
    #[arg(long, conflicts_with = "connect")]
    listen: Option<String>,

    /// Connect to a listening peer controller
    #[arg(long)]
    connect: Option<String>,

    /// Guest RAM size in bytes
    #[arg(long, default_value_t = 0x10_0000)]
    ram: usize,

    /// Keep the link disabled after the transport opens
    #[arg(long)]
    link_disable: bool,

    /// Once connected, write this quadlet into the peer's guest memory:
    /// <hex offset>=<hex value>
    #[arg(long)]
    write_quadlet: Option<String>,
}

fn parse_quadlet(spec: &str) -> Result<(u32, u32)> {
    let (offset, value) = spec
        .split_once('=')
        .ok_or_else(|| anyhow!("expected <offset>=<value>, got {:?}", spec))?;
    let parse = |s: &str| {
        u32::from_str_radix(s.trim_start_matches("0x"), 16)
            .with_context(|| format!("bad hex number {:?}", s))
    };
    Ok((parse(offset)?, parse(value)?))
}

fn write_reg(device: &mut Ohci1394<EmuContext>, offset: u32, value: u32) -> Result<()> {
    let mut data = value.to_ne_bytes();
    device.region_access_bar0(offset as usize, &mut data, true)?;
    Ok(())
}

fn read_reg(device: &mut Ohci1394<EmuContext>, offset: u32) -> Result<u32> {
    let mut data = [0u8; 4];
    device.region_access_bar0(offset as usize, &mut data, false)?;
    Ok(u32::from_ne_bytes(data))
}

/// What a guest driver does right after mapping the BAR: point the self-ID
/// DMA somewhere, enable self-ID reception, unmask interrupts
fn guest_bring_up(device: &mut Ohci1394<EmuContext>, enable_link: bool) -> Result<()> {
    write_reg(device, offsets::SELF_ID_BUFFER, SELF_ID_BUFFER)?;
    write_reg(device, offsets::LINK_CONTROL_SET, 0x0000_0200)?; // rcvSelfID
    write_reg(device, offsets::INT_MASK_SET, 0xFFFF_FFFF)?;
    if enable_link {
        write_reg(device, offsets::HC_CONTROL_SET, 1 << 17)?; // linkEnable
    }
    Ok(())
}

/// Park an AR-response descriptor so responses from the peer have a landing
/// zone, then start the context
fn guest_start_ar_response(device: &mut Ohci1394<EmuContext>) -> Result<()> {
    let req_count = 64u32;
    device.hcd_ctx.set_ram_word(AR_DESCRIPTOR, req_count); // req_count, no flags
    device.hcd_ctx.set_ram_word(AR_DESCRIPTOR + 4, AR_DATA_BUFFER);
    device.hcd_ctx.set_ram_word(AR_DESCRIPTOR + 8, 0); // end of chain
    device.hcd_ctx.set_ram_word(AR_DESCRIPTOR + 12, req_count); // res_count
    write_reg(device, offsets::AR_RSP_COMMAND_PTR, AR_DESCRIPTOR | 1)?;
    write_reg(device, offsets::AR_RSP_CONTROL_SET, 1 << 15)?; // run
    Ok(())
}

/// Program an OUTPUT_LAST_Immediate quadlet-write request and kick the AT
/// request context
fn guest_write_quadlet(
    device: &mut Ohci1394<EmuContext>, offset: u32, value: u32,
) -> Result<()> {
    let node_id = read_reg(device, offsets::NODE_ID)?;
    let peer = (node_id & 0x3F) ^ 1;
    let destination_id = (node_id & 0xFFC0) | peer;
    info!(
        "writing {:08x} to peer node {} at offset {:#x}",
        value, peer, offset
    );

    // OUTPUT_LAST_Immediate, interrupt on completion, 16 byte packet
    device.hcd_ctx.set_ram_word(AT_DESCRIPTOR, 0x1230_u32 << 16 | 16);
    device.hcd_ctx.set_ram_word(AT_DESCRIPTOR + 4, 0);
    device.hcd_ctx.set_ram_word(AT_DESCRIPTOR + 8, 0); // end of chain
    device.hcd_ctx.set_ram_word(AT_DESCRIPTOR + 12, 0);

    // Inline packet: quadlet-write request, tLabel 1
    device.hcd_ctx.set_ram_word(AT_DESCRIPTOR + 16, 1 << 10);
    // destination id in the high half, destination offset high = 0
    device
        .hcd_ctx
        .set_ram_word(AT_DESCRIPTOR + 20, destination_id << 16);
    device.hcd_ctx.set_ram_word(AT_DESCRIPTOR + 24, offset);
    device.hcd_ctx.set_ram_word(AT_DESCRIPTOR + 28, value);

    write_reg(device, offsets::AT_REQ_COMMAND_PTR, AT_DESCRIPTOR | 1)?;
    write_reg(device, offsets::AT_REQ_CONTROL_SET, 1 << 15)?; // run
    Ok(())
}

/// Acknowledge pending interrupt events the way a driver would, logging
/// the interesting ones
fn guest_service_events(device: &mut Ohci1394<EmuContext>) -> Result<()> {
    let events = read_reg(device, offsets::INT_EVENT_SET)?;
    if events == 0 {
        return Ok(());
    }
    debug!("acknowledging events {:08x}", events);
    if events & (1 << 17) != 0 {
        let count = read_reg(device, offsets::SELF_ID_COUNT)?;
        let node_id = read_reg(device, offsets::NODE_ID)?;
        info!(
            "bus reset: generation {}, node id {:08x}, {} self-id bytes",
            (count >> 16) & 0xFF,
            node_id,
            count & 0x7FC
        );
        for i in 0..(count & 0x7FC) / 4 {
            debug!(
                "  self-id[{}] = {:08x}",
                i,
                device.hcd_ctx.ram_word(SELF_ID_BUFFER + i * 4)
            );
        }
    }
    if events & (1 << 5) != 0 {
        info!(
            "response packet delivered, first quadlets {:08x} {:08x}",
            device.hcd_ctx.ram_word(AR_DATA_BUFFER),
            device.hcd_ctx.ram_word(AR_DATA_BUFFER + 4)
        );
    }
    write_reg(device, offsets::INT_EVENT_CLEAR, events)?;
    Ok(())
}

fn main() -> Result<()> {
    pretty_env_logger::formatted_builder()
        .filter_level(LevelFilter::Info)
        .parse_default_env() // Overwrite from RUST_LOG env var
        .init();

    let args = Args::parse();
    let quadlet = args.write_quadlet.as_deref().map(parse_quadlet).transpose()?;

    let stream = match (&args.listen, &args.connect) {
        (Some(address), None) => {
            info!("waiting for peer on {}", address);
            let listener = TcpListener::bind(address).context("binding listen address")?;
            let (stream, peer) = listener.accept().context("accepting peer")?;
            info!("peer connected from {}", peer);
            stream
        }
        (None, Some(address)) => {
            info!("connecting to peer at {}", address);
            TcpStream::connect(address).context("connecting to peer")?
        }
        _ => {
            return Err(anyhow!("pass exactly one of --listen or --connect"));
        }
    };
    stream.set_nodelay(true).ok();

    let emu_ctx = EmuContext::new(stream.try_clone()?, args.ram)?;
    let mut device = Ohci1394::new(emu_ctx);

    guest_bring_up(&mut device, !args.link_disable)?;
    device.transport_open()?;

    let poller = Poller::new()?;
    let mut events = Events::new();

    const EVENT_KEY_SOCKET: usize = 0;
    const EVENT_KEY_TIMER: usize = 1;

    let mut socket = stream.try_clone()?;
    socket.set_nonblocking(true)?;
    unsafe {
        poller.add_with_mode(&socket, Event::readable(EVENT_KEY_SOCKET), PollMode::Edge)?;
        poller.add_with_mode(
            &device.hcd_ctx.timer,
            Event::readable(EVENT_KEY_TIMER),
            PollMode::Edge,
        )?;
    }

    let mut transaction_sent = false;
    let mut chunk = [0u8; 8192];

    info!("running");
    'outer: loop {
        events.clear();
        poller.wait(&mut events, None)?;

        for event in events.iter() {
            match event.key {
                EVENT_KEY_SOCKET => loop {
                    match socket.read(&mut chunk) {
                        Ok(0) => {
                            warn!("peer went away");
                            device.transport_close()?;
                            break 'outer;
                        }
                        Ok(n) => device.transport_receive(&chunk[..n])?,
                        Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                        Err(e) => return Err(e.into()),
                    }
                },
                EVENT_KEY_TIMER => {
                    device.hcd_ctx.timer.read();
                }
                x => {
                    unreachable!("Unknown event key {}", x);
                }
            }
        }

        while let Some(context) = device.hcd_ctx.pending_timers.pop_front() {
            device.at_timer_elapsed(context)?;
        }
        guest_service_events(&mut device)?;

        if device.link_state() == LinkState::Connected && !transaction_sent {
            transaction_sent = true;
            guest_start_ar_response(&mut device)?;
            if let Some((offset, value)) = quadlet {
                guest_write_quadlet(&mut device, offset, value)?;
            }
        }
    }

    Ok(())
}
