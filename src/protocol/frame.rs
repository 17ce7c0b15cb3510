//! Frame codec
//!
//! Every message on the wire is a frame:
//!
//! ```text
//! u16 magic (0xF00D)
//! u16 size              ; >= 0x8000 means a u32 size follows
//! u8  is_control
//! u8  opcode
//! u16 reserved
//! control: payload ...
//! data:    u8 service_id, u8 message_id, u16 payload_len + 4, payload ..., u8 0
//! ```
//!
//! All integers are little-endian. `size` counts the bytes following the size
//! field(s).

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::common::{ProxyError, Result};

/// Frame magic
pub const FRAME_MAGIC: u16 = 0xF00D;

/// Sizes at or above this value are carried in an extra u32
pub const LARGE_FRAME: u16 = 0x8000;

/// Bytes the reader consumes before it knows the frame length
pub const HEADER_LEN: usize = 8;

/// Largest frame body accepted from a peer
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Body bytes that precede the payload of every frame
const BODY_HEADER_LEN: usize = 4;

/// Bytes a data frame adds around its payload
const DATA_OVERHEAD: usize = 5;

/// Largest payload a data frame can carry in its u16 length field
pub const MAX_DATA_PAYLOAD: usize = u16::MAX as usize - 4;

/// Whether raw stream bytes begin with a plaintext frame
///
/// Plaintext frames start with the little-endian magic even after a session
/// has switched to encryption.
pub fn is_plaintext(raw: &[u8]) -> bool {
    raw.len() >= 2 && raw[0] == 0x0D && raw[1] == 0xF0
}

/// Number of frame bytes that follow the first [`HEADER_LEN`] bytes
///
/// # Errors
///
/// Fails on bad magic, sizes too small to hold a body header, and sizes above
/// [`MAX_FRAME_SIZE`].
pub fn remaining_len(header: &[u8]) -> Result<usize> {
    if header.len() < HEADER_LEN {
        return Err(ProxyError::Frame(format!("short frame header: {} bytes", header.len())));
    }

    let mut buf = header;
    if buf.get_u16_le() != FRAME_MAGIC {
        return Err(ProxyError::Frame("received unsupported frame data".to_string()));
    }

    let size = buf.get_u16_le();
    let remaining = if size >= LARGE_FRAME {
        buf.get_u32_le() as usize
    } else {
        // The last four header bytes already belong to the body
        (size as usize)
            .checked_sub(BODY_HEADER_LEN)
            .ok_or_else(|| ProxyError::Frame(format!("frame size {} is too small", size)))?
    };

    if remaining > MAX_FRAME_SIZE {
        return Err(ProxyError::Frame(format!("frame of {} bytes exceeds limit", remaining)));
    }

    Ok(remaining)
}

/// A decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Session-level control message
    Control {
        /// Control opcode
        opcode: u8,
        /// Opcode-specific payload
        payload: Bytes,
    },
    /// Application message addressed to a service
    Data {
        /// Service the message belongs to
        service_id: u8,
        /// Message number within the service
        message_id: u8,
        /// Message payload
        payload: Bytes,
    },
}

impl Frame {
    /// Decode one complete frame
    pub fn decode(raw: &[u8]) -> Result<Self> {
        let mut buf = raw;
        need(buf, 4)?;

        if buf.get_u16_le() != FRAME_MAGIC {
            return Err(ProxyError::Frame("received unsupported frame data".to_string()));
        }

        let size = buf.get_u16_le();
        let body_len = if size >= LARGE_FRAME {
            need(buf, 4)?;
            buf.get_u32_le() as usize
        } else {
            size as usize
        };

        need(buf, body_len)?;
        let mut body = &buf[..body_len];
        need(body, BODY_HEADER_LEN)?;

        let is_control = body.get_u8() != 0;
        let opcode = body.get_u8();
        body.advance(2);

        if is_control {
            return Ok(Frame::Control { opcode, payload: Bytes::copy_from_slice(body) });
        }

        need(body, 4)?;
        let service_id = body.get_u8();
        let message_id = body.get_u8();
        let payload_len = (body.get_u16_le() as usize)
            .checked_sub(4)
            .ok_or_else(|| ProxyError::Frame("data frame length field too small".to_string()))?;

        need(body, payload_len)?;
        Ok(Frame::Data {
            service_id,
            message_id,
            payload: Bytes::copy_from_slice(&body[..payload_len]),
        })
    }

    /// Encode the frame
    ///
    /// # Errors
    ///
    /// A data payload longer than [`MAX_DATA_PAYLOAD`] or a body longer than
    /// [`MAX_FRAME_SIZE`] does not fit the length fields.
    pub fn encode(&self) -> Result<BytesMut> {
        let payload = self.payload();
        let mut size = BODY_HEADER_LEN + payload.len();
        if !self.is_control() {
            if payload.len() > MAX_DATA_PAYLOAD {
                return Err(ProxyError::Frame(format!(
                    "data payload of {} bytes exceeds {}",
                    payload.len(),
                    MAX_DATA_PAYLOAD
                )));
            }
            size += DATA_OVERHEAD;
        }
        if size > MAX_FRAME_SIZE {
            return Err(ProxyError::Frame(format!("frame of {} bytes exceeds limit", size)));
        }

        let mut buf = BytesMut::with_capacity(size + HEADER_LEN);
        buf.put_u16_le(FRAME_MAGIC);
        if size < LARGE_FRAME as usize {
            buf.put_u16_le(size as u16);
        } else {
            buf.put_u16_le(LARGE_FRAME);
            buf.put_u32_le(size as u32);
        }

        match self {
            Frame::Control { opcode, payload } => {
                buf.put_u8(1);
                buf.put_u8(*opcode);
                buf.put_u16_le(0);
                buf.put_slice(payload);
            }
            Frame::Data { service_id, message_id, payload } => {
                buf.put_u8(0);
                buf.put_u8(0);
                buf.put_u16_le(0);
                buf.put_u8(*service_id);
                buf.put_u8(*message_id);
                buf.put_u16_le((payload.len() + 4) as u16);
                buf.put_slice(payload);
                buf.put_u8(0);
            }
        }

        Ok(buf)
    }

    /// Whether this is a control frame
    pub fn is_control(&self) -> bool {
        matches!(self, Frame::Control { .. })
    }

    /// Control opcode, or `None` for data frames
    pub fn opcode(&self) -> Option<u8> {
        match self {
            Frame::Control { opcode, .. } => Some(*opcode),
            Frame::Data { .. } => None,
        }
    }

    /// `(service_id, message_id)` of a data frame
    pub fn data_id(&self) -> Option<(u8, u8)> {
        match self {
            Frame::Data { service_id, message_id, .. } => Some((*service_id, *message_id)),
            Frame::Control { .. } => None,
        }
    }

    /// Frame payload
    pub fn payload(&self) -> &Bytes {
        match self {
            Frame::Control { payload, .. } | Frame::Data { payload, .. } => payload,
        }
    }

    /// Replace the payload, keeping the frame kind and ids
    pub fn set_payload(&mut self, new_payload: Bytes) {
        match self {
            Frame::Control { payload, .. } | Frame::Data { payload, .. } => *payload = new_payload,
        }
    }
}

fn need(buf: &[u8], len: usize) -> Result<()> {
    if buf.len() < len {
        return Err(ProxyError::Frame(format!(
            "truncated frame: need {} bytes, have {}",
            len,
            buf.len()
        )));
    }
    Ok(())
}
