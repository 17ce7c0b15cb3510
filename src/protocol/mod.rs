//! Wire protocol module
//!
//! Frame codec, the buffered frame reader, DML records, and the handshake
//! and handoff messages the proxy has to understand. Everything else on the
//! wire is relayed without interpretation.

pub mod dml;
pub mod frame;
pub mod handoff;
pub mod handshake;
pub mod packet;
pub mod reader;

pub use dml::{DmlRecord, DmlType, DmlValue};
pub use frame::Frame;
pub use handoff::{DmlHandoffDetector, HandoffDetector};
pub use handshake::{EncryptedMessage, SessionAccept, SessionOffer, SignedMessage};
pub use packet::{Direction, Packet};
pub use reader::{FrameReader, RawFrame};
