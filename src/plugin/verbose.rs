//! Packet logger
//!
//! Prints one line per packet at info level: direction, shard, frame kind and
//! a hex dump of the plaintext frame.

use std::fmt::Write;

use log::info;

use crate::protocol::{Frame, Packet};
use super::{PacketContext, Plugin, PluginError};

/// Longest hex dump printed per packet
const MAX_DUMP: usize = 256;

/// Plugin that logs every packet
#[derive(Debug, Default, Clone, Copy)]
pub struct VerboseLogger;

impl VerboseLogger {
    /// Create the logger
    pub fn new() -> Self {
        Self
    }

    /// Format the log line for a packet
    pub fn describe(context: &PacketContext, packet: &Packet) -> String {
        let kind = match &packet.frame {
            Frame::Control { opcode, .. } => format!("control opcode={}", opcode),
            Frame::Data { service_id, message_id, .. } => {
                format!("data service={} message={}", service_id, message_id)
            }
        };

        format!(
            "[{}] [{}] {} len={} decrypted={}{} | {}",
            packet.direction.arrow(),
            context.local,
            kind,
            packet.len(),
            packet.decrypted,
            if packet.is_modified() { " modified" } else { "" },
            hex_dump(packet.raw()),
        )
    }
}

impl Plugin for VerboseLogger {
    fn name(&self) -> &'static str {
        "verbose"
    }

    fn on_packet(&self, context: &PacketContext, packet: &Packet) -> Result<(), PluginError> {
        info!("{}", Self::describe(context, packet));
        Ok(())
    }
}

fn hex_dump(bytes: &[u8]) -> String {
    let shown = &bytes[..bytes.len().min(MAX_DUMP)];
    let mut out = String::with_capacity(shown.len() * 3 + 8);
    for (i, byte) in shown.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{:02x}", byte);
    }
    if bytes.len() > MAX_DUMP {
        let _ = write!(out, " ... (+{} bytes)", bytes.len() - MAX_DUMP);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use crate::common::AddressSpec;
    use crate::protocol::Direction;
    use crate::proxy::ShardId;

    fn context() -> PacketContext {
        PacketContext {
            shard: ShardId(2),
            local: AddressSpec::new("127.0.0.1", 40000),
            remote: AddressSpec::new("games.example.com", 12000),
            client: "127.0.0.1:50000".parse().unwrap(),
            server: "10.0.0.1:12000".parse().unwrap(),
        }
    }

    #[test]
    fn test_describe_data_packet() {
        let raw = Frame::Data { service_id: 5, message_id: 221, payload: Bytes::from_static(b"\x01") }
            .encode()
            .unwrap()
            .freeze();
        let packet = Packet::decode(Direction::ServerToClient, raw, true).unwrap();

        let line = VerboseLogger::describe(&context(), &packet);
        assert!(line.starts_with("[S -> C] [127.0.0.1:40000] data service=5 message=221"));
        assert!(line.contains("decrypted=true"));
        assert!(line.contains("| 0d f0"));
    }

    #[test]
    fn test_long_dump_is_truncated() {
        let dump = hex_dump(&[0xAB; MAX_DUMP + 10]);
        assert!(dump.ends_with("... (+10 bytes)"));
    }

    #[test]
    fn test_logger_never_fails() {
        let raw = Frame::Control { opcode: 3, payload: Bytes::new() }.encode().unwrap().freeze();
        let packet = Packet::decode(Direction::ClientToServer, raw, false).unwrap();
        assert!(VerboseLogger::new().on_packet(&context(), &packet).is_ok());
    }
}
