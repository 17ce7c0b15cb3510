//! pcapng capture writer
//!
//! Writes every packet to a pcapng file that Wireshark can open. Each frame
//! is wrapped in a synthetic IP + TCP header between the real client and
//! backend socket addresses, with per-flow sequence numbers so stream
//! reassembly works, and tagged with a comment naming the shard and client.
//!
//! Blocks are built in memory and written and flushed whole, so the file is
//! a valid capture up to the last completed packet even if the process stops
//! mid-session.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use bytes::{BufMut, BytesMut};
use log::{debug, info};

use crate::protocol::{Direction, Packet};
use super::{PacketContext, Plugin, PluginError};

const SECTION_HEADER_BLOCK: u32 = 0x0A0D_0D0A;
const INTERFACE_DESCRIPTION_BLOCK: u32 = 0x0000_0001;
const ENHANCED_PACKET_BLOCK: u32 = 0x0000_0006;
const BYTE_ORDER_MAGIC: u32 = 0x1A2B_3C4D;

/// Raw IPv4/IPv6 packets, version taken from the first nibble
const LINKTYPE_RAW: u16 = 101;

const OPT_END: u16 = 0;
const OPT_COMMENT: u16 = 1;
const SHB_USERAPPL: u16 = 4;
const IF_NAME: u16 = 2;

const IPV4_HEADER_LEN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;
const TCP_HEADER_LEN: usize = 20;

/// Largest TCP payload per synthetic segment
const MAX_SEGMENT: usize = 0xFFFF - IPV6_HEADER_LEN - TCP_HEADER_LEN;

struct CaptureState {
    out: BufWriter<File>,
    /// Next sequence number per (source, destination) flow
    sequence: HashMap<(SocketAddr, SocketAddr), u32>,
    packets: u64,
}

/// Plugin that records packets to a pcapng file
pub struct CaptureWriter {
    path: PathBuf,
    state: Mutex<Option<CaptureState>>,
}

impl CaptureWriter {
    /// Create (or truncate) a capture file and write its headers
    pub fn create(path: impl AsRef<Path>) -> Result<Self, PluginError> {
        let path = path.as_ref().to_path_buf();
        let mut out = BufWriter::new(File::create(&path)?);

        out.write_all(&section_header())?;
        out.write_all(&interface_description())?;
        out.flush()?;

        info!("Writing capture to {}", path.display());
        Ok(Self {
            path,
            state: Mutex::new(Some(CaptureState {
                out,
                sequence: HashMap::new(),
                packets: 0,
            })),
        })
    }

    /// Path of the capture file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush and close the file
    ///
    /// Later packets are rejected with `PluginError::Closed`. Closing twice is
    /// harmless.
    pub fn close(&self) -> Result<(), PluginError> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(mut state) = state {
            state.out.flush()?;
            debug!("Closed capture {} after {} packets", self.path.display(), state.packets);
        }
        Ok(())
    }
}

impl Plugin for CaptureWriter {
    fn name(&self) -> &'static str {
        "capture"
    }

    fn on_packet(&self, context: &PacketContext, packet: &Packet) -> Result<(), PluginError> {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let state = guard.as_mut().ok_or(PluginError::Closed)?;

        let (src, dst) = match packet.direction {
            Direction::ClientToServer => (context.client, context.server),
            Direction::ServerToClient => (context.server, context.client),
        };
        let comment = format!("Shard {}, client {}", context.local, context.client);
        let micros = packet.timestamp.timestamp_micros().max(0) as u64;

        for segment in packet.raw().chunks(MAX_SEGMENT) {
            let seq = *state.sequence.get(&(src, dst)).unwrap_or(&1);
            let ack = *state.sequence.get(&(dst, src)).unwrap_or(&1);
            state
                .sequence
                .insert((src, dst), seq.wrapping_add(segment.len() as u32));

            let datagram = ip_datagram(src, dst, seq, ack, segment);
            state.out.write_all(&enhanced_packet(micros, &datagram, &comment))?;
        }

        state.out.flush()?;
        state.packets += 1;
        Ok(())
    }
}

impl Drop for CaptureWriter {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn section_header() -> BytesMut {
    let mut options = BytesMut::new();
    put_option(&mut options, SHB_USERAPPL, format!("{} {}", crate::APP_NAME, crate::VERSION).as_bytes());
    put_option(&mut options, OPT_END, &[]);

    let mut body = BytesMut::new();
    body.put_u32_le(BYTE_ORDER_MAGIC);
    body.put_u16_le(1);
    body.put_u16_le(0);
    // Section length unknown
    body.put_i64_le(-1);
    body.put_slice(&options);

    block(SECTION_HEADER_BLOCK, &body)
}

fn interface_description() -> BytesMut {
    let mut body = BytesMut::new();
    body.put_u16_le(LINKTYPE_RAW);
    body.put_u16_le(0);
    // No snap length limit
    body.put_u32_le(0);
    put_option(&mut body, IF_NAME, crate::APP_NAME.as_bytes());
    put_option(&mut body, OPT_END, &[]);

    block(INTERFACE_DESCRIPTION_BLOCK, &body)
}

fn enhanced_packet(micros: u64, data: &[u8], comment: &str) -> BytesMut {
    let mut body = BytesMut::with_capacity(data.len() + comment.len() + 32);
    body.put_u32_le(0);
    body.put_u32_le((micros >> 32) as u32);
    body.put_u32_le(micros as u32);
    body.put_u32_le(data.len() as u32);
    body.put_u32_le(data.len() as u32);
    body.put_slice(data);
    pad(&mut body);
    put_option(&mut body, OPT_COMMENT, comment.as_bytes());
    put_option(&mut body, OPT_END, &[]);

    block(ENHANCED_PACKET_BLOCK, &body)
}

/// Frame a block body with its type and both length fields
fn block(block_type: u32, body: &[u8]) -> BytesMut {
    let total = (body.len() + 12) as u32;
    let mut buf = BytesMut::with_capacity(total as usize);
    buf.put_u32_le(block_type);
    buf.put_u32_le(total);
    buf.put_slice(body);
    buf.put_u32_le(total);
    buf
}

fn put_option(buf: &mut BytesMut, code: u16, value: &[u8]) {
    buf.put_u16_le(code);
    buf.put_u16_le(value.len() as u16);
    buf.put_slice(value);
    pad(buf);
}

fn pad(buf: &mut BytesMut) {
    while buf.len() % 4 != 0 {
        buf.put_u8(0);
    }
}

/// Build an IP packet holding one TCP segment
fn ip_datagram(src: SocketAddr, dst: SocketAddr, seq: u32, ack: u32, payload: &[u8]) -> BytesMut {
    let tcp = tcp_segment(src.port(), dst.port(), seq, ack, payload);

    match (src.ip(), dst.ip()) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            let mut buf = BytesMut::with_capacity(IPV4_HEADER_LEN + tcp.len());
            buf.put_u8(0x45);
            buf.put_u8(0);
            buf.put_u16((IPV4_HEADER_LEN + tcp.len()) as u16);
            buf.put_u16(0);
            // Don't fragment
            buf.put_u16(0x4000);
            buf.put_u8(64);
            buf.put_u8(6);
            buf.put_u16(0);
            buf.put_slice(&s.octets());
            buf.put_slice(&d.octets());

            let checksum = internet_checksum(&buf[..IPV4_HEADER_LEN]);
            buf[10..12].copy_from_slice(&checksum.to_be_bytes());
            buf.put_slice(&tcp);
            buf
        }
        (s, d) => {
            let mut buf = BytesMut::with_capacity(IPV6_HEADER_LEN + tcp.len());
            buf.put_u32(0x6000_0000);
            buf.put_u16(tcp.len() as u16);
            buf.put_u8(6);
            buf.put_u8(64);
            buf.put_slice(&to_v6(s).octets());
            buf.put_slice(&to_v6(d).octets());
            buf.put_slice(&tcp);
            buf
        }
    }
}

fn tcp_segment(src_port: u16, dst_port: u16, seq: u32, ack: u32, payload: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(TCP_HEADER_LEN + payload.len());
    buf.put_u16(src_port);
    buf.put_u16(dst_port);
    buf.put_u32(seq);
    buf.put_u32(ack);
    // Header length 5 words, PSH | ACK
    buf.put_u8(0x50);
    buf.put_u8(0x18);
    buf.put_u16(0xFFFF);
    // Checksum left zero
    buf.put_u16(0);
    buf.put_u16(0);
    buf.put_slice(payload);
    buf
}

fn to_v6(ip: IpAddr) -> Ipv6Addr {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    }
}

fn internet_checksum(header: &[u8]) -> u16 {
    let mut sum: u32 = header
        .chunks(2)
        .map(|pair| u32::from(u16::from_be_bytes([pair[0], *pair.get(1).unwrap_or(&0)])))
        .sum();
    while sum > 0xFFFF {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}
