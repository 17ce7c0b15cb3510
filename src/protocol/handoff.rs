//! Handoff detection
//!
//! A handoff is a server message telling the client to reconnect to another
//! backend. The proxy catches these, opens a shard towards the named backend,
//! and rewrites the message so the client connects to that shard instead.
//!
//! Detection is behind the `HandoffDetector` trait so other backends can
//! supply their own predicate and rewrite; `DmlHandoffDetector` handles the
//! two messages used by the login to game server flow.

use log::debug;

use crate::common::{AddressSpec, ProxyError, Result};
use super::dml::{DmlLayout, DmlRecord, DmlType, DmlValue};
use super::packet::{Direction, Packet};

/// Game service id of `MSG_CHARACTERSELECTED`
pub const CHARACTER_SELECTED: (u8, u8) = (7, 3);

/// Game service id of `MSG_SERVERTRANSFER`
pub const SERVER_TRANSFER: (u8, u8) = (5, 221);

/// Fields of `MSG_CHARACTERSELECTED`
pub const CHARACTER_SELECTED_LAYOUT: DmlLayout = &[
    ("IP", DmlType::Str),
    ("TCPPort", DmlType::Int),
    ("UDPPort", DmlType::Int),
    ("Key", DmlType::Str),
    ("UserID", DmlType::Gid),
    ("CharID", DmlType::Gid),
    ("ZoneID", DmlType::Gid),
    ("ZoneName", DmlType::Str),
    ("Location", DmlType::Str),
    ("Slot", DmlType::Int),
    ("PrepPhase", DmlType::Int),
    ("Error", DmlType::Int),
    ("LoginServer", DmlType::Str),
];

/// Fields of `MSG_SERVERTRANSFER`
pub const SERVER_TRANSFER_LAYOUT: DmlLayout = &[
    ("IP", DmlType::Str),
    ("TCPPort", DmlType::Int),
    ("UDPPort", DmlType::Int),
    ("Key", DmlType::Int),
    ("UserID", DmlType::Gid),
    ("CharID", DmlType::Gid),
    ("ZoneName", DmlType::Str),
    ("ZoneID", DmlType::Gid),
    ("Location", DmlType::Str),
    ("Slot", DmlType::Int),
    ("SessionID", DmlType::Gid),
    ("SessionSlot", DmlType::Int),
    ("TargetPlayerID", DmlType::Gid),
    ("FallbackIP", DmlType::Str),
    ("FallbackTCPPort", DmlType::Int),
    ("FallbackUDPPort", DmlType::Int),
    ("FallbackKey", DmlType::Int),
    ("FallbackZone", DmlType::Str),
    ("FallbackZoneID", DmlType::Gid),
    ("TransitionID", DmlType::Int),
];

/// Recognizes and rewrites handoff messages
pub trait HandoffDetector: Send + Sync {
    /// Backend address the packet sends the client to, if it is a handoff
    fn detect(&self, packet: &Packet) -> Result<Option<AddressSpec>>;

    /// Point a handoff packet at `local`
    ///
    /// # Parameters
    ///
    /// * `packet` - Packet for which `detect` returned an address
    /// * `local` - Listening address of the shard opened for the new backend
    /// * `current` - Listening address of the shard relaying this packet
    fn rewrite(&self, packet: &mut Packet, local: &AddressSpec, current: &AddressSpec) -> Result<()>;
}

/// Handoff detector for the DML login and transfer messages
#[derive(Debug, Default, Clone, Copy)]
pub struct DmlHandoffDetector;

impl DmlHandoffDetector {
    /// Create the detector
    pub fn new() -> Self {
        Self
    }

    fn layout(packet: &Packet) -> Option<DmlLayout> {
        if packet.direction != Direction::ServerToClient {
            return None;
        }
        match packet.frame.data_id()? {
            CHARACTER_SELECTED => Some(CHARACTER_SELECTED_LAYOUT),
            SERVER_TRANSFER => Some(SERVER_TRANSFER_LAYOUT),
            _ => None,
        }
    }
}

impl HandoffDetector for DmlHandoffDetector {
    fn detect(&self, packet: &Packet) -> Result<Option<AddressSpec>> {
        let Some(layout) = Self::layout(packet) else {
            return Ok(None);
        };

        let record = DmlRecord::decode(layout, packet.payload())?;
        let host = record.get_str("IP")?;
        let port = record.get_int("TCPPort")?;

        // A character list refresh carries no address
        if layout == CHARACTER_SELECTED_LAYOUT && host.is_empty() && port == 0 {
            return Ok(None);
        }

        let port = u16::try_from(port)
            .map_err(|_| ProxyError::Dml(format!("handoff port {} out of range", port)))?;

        debug!("Handoff to {}:{}", host, port);
        Ok(Some(AddressSpec::new(host, port)))
    }

    fn rewrite(&self, packet: &mut Packet, local: &AddressSpec, current: &AddressSpec) -> Result<()> {
        let layout = Self::layout(packet)
            .ok_or_else(|| ProxyError::Dml("packet is not a handoff".to_string()))?;

        let mut record = DmlRecord::decode(layout, packet.payload())?;
        record.set("IP", DmlValue::str(&local.host))?;
        record.set("TCPPort", DmlValue::Int(local.port as i32))?;

        if layout == SERVER_TRANSFER_LAYOUT {
            record.set("FallbackIP", DmlValue::str(&current.host))?;
            record.set("FallbackTCPPort", DmlValue::Int(current.port as i32))?;
        }

        packet.replace_payload(record.encode()?.freeze())
    }
}
