//! Decoded packets
//!
//! A `Packet` is one frame as it moves through a shard: decoded, shown to the
//! plugins, possibly rewritten, then forwarded.

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::common::Result;
use super::frame::Frame;

/// Direction a packet travels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// From the game client to the backend
    ClientToServer,
    /// From the backend to the game client
    ServerToClient,
}

impl Direction {
    /// Short label used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::ClientToServer => "client_to_server",
            Direction::ServerToClient => "server_to_client",
        }
    }

    /// Arrow notation, `C -> S` or `S -> C`
    pub fn arrow(&self) -> &'static str {
        match self {
            Direction::ClientToServer => "C -> S",
            Direction::ServerToClient => "S -> C",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.arrow())
    }
}

/// One decoded frame in flight
#[derive(Debug, Clone)]
pub struct Packet {
    /// Travel direction
    pub direction: Direction,
    /// Decoded frame
    pub frame: Frame,
    /// Whether the frame arrived encrypted and was decrypted by the proxy
    pub decrypted: bool,
    /// When the frame was read
    pub timestamp: DateTime<Utc>,
    raw: Bytes,
    modified: bool,
}

impl Packet {
    /// Decode plaintext frame bytes into a packet
    pub fn decode(direction: Direction, raw: Bytes, decrypted: bool) -> Result<Self> {
        let frame = Frame::decode(&raw)?;
        Ok(Self {
            direction,
            frame,
            decrypted,
            timestamp: Utc::now(),
            raw,
            modified: false,
        })
    }

    /// Plaintext frame bytes as they will be forwarded
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    /// Length of the plaintext frame
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    /// Whether the frame carries no bytes (never true for a decoded frame)
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Service id of a data frame
    pub fn service_id(&self) -> Option<u8> {
        self.frame.data_id().map(|(service, _)| service)
    }

    /// Message id of a data frame, or the opcode of a control frame
    pub fn message_id(&self) -> u8 {
        match &self.frame {
            Frame::Data { message_id, .. } => *message_id,
            Frame::Control { opcode, .. } => *opcode,
        }
    }

    /// Frame payload
    pub fn payload(&self) -> &Bytes {
        self.frame.payload()
    }

    /// Replace the payload and re-encode the frame
    ///
    /// The packet is left untouched if the new frame cannot be encoded.
    pub fn replace_payload(&mut self, payload: Bytes) -> Result<()> {
        let mut frame = self.frame.clone();
        frame.set_payload(payload);
        self.raw = frame.encode()?.freeze();
        self.frame = frame;
        self.modified = true;
        Ok(())
    }

    /// Whether the packet was rewritten after decoding
    pub fn is_modified(&self) -> bool {
        self.modified
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unmodified_packet_keeps_original_bytes() {
        let raw = Frame::Data { service_id: 2, message_id: 9, payload: Bytes::from_static(b"hi") }
            .encode()
            .unwrap()
            .freeze();
        let packet = Packet::decode(Direction::ServerToClient, raw.clone(), true).unwrap();

        assert_eq!(packet.raw(), &raw);
        assert_eq!(packet.service_id(), Some(2));
        assert_eq!(packet.message_id(), 9);
        assert!(!packet.is_modified());
    }

    #[test]
    fn test_replace_payload_reencodes() {
        let raw = Frame::Data { service_id: 2, message_id: 9, payload: Bytes::from_static(b"hi") }
            .encode()
            .unwrap()
            .freeze();
        let mut packet = Packet::decode(Direction::ServerToClient, raw, false).unwrap();
        packet.replace_payload(Bytes::from_static(b"hello")).unwrap();

        assert!(packet.is_modified());
        let reparsed = Frame::decode(packet.raw()).unwrap();
        assert_eq!(reparsed.payload(), &Bytes::from_static(b"hello"));
        assert_eq!(reparsed.data_id(), Some((2, 9)));
    }
}
