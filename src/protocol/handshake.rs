//! Session handshake messages
//!
//! A session opens with two control frames. The server sends a Session Offer
//! naming a static key slot and an echo value; the client answers with a
//! Session Accept carrying the session key and nonce, sealed under that
//! static key. A crypto length of 1 in either message means the session runs
//! in plaintext.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::common::{ProxyError, Result};

/// Control opcode of a Session Offer
pub const SESSION_OFFER: u8 = 0;

/// Control opcode of a Session Accept
pub const SESSION_ACCEPT: u8 = 5;

/// Crypto length that marks a message without crypto
const NO_CRYPTO: u32 = 1;

/// Offset of the crypto length field in an offer
const OFFER_CRYPTO_LEN: usize = 0x0E;

/// Offset of the session id field in an accept
const ACCEPT_SESSION_ID: usize = 0x0E;

/// Length of an encoded [`EncryptedMessage`]
pub const ENCRYPTED_MESSAGE_LEN: usize = 1 + 4 * 4 + 16 + 16;

/// Key parameters of a Session Offer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedMessage {
    pub flags: u8,
    /// Static key the client must seal its answer with
    pub key_slot: u8,
    pub key_mask: u8,
    pub challenge: Bytes,
    /// Value the client must return unchanged
    pub echo: u32,
}

impl SignedMessage {
    fn decode(mut buf: &[u8]) -> Result<Self> {
        need(buf, 4)?;
        let flags = buf.get_u8();
        let key_slot = buf.get_u8();
        let key_mask = buf.get_u8();
        let challenge_len = buf.get_u8() as usize;
        need(buf, challenge_len + 4)?;
        let challenge = Bytes::copy_from_slice(&buf[..challenge_len]);
        buf.advance(challenge_len);
        let echo = buf.get_u32_le();

        Ok(Self { flags, key_slot, key_mask, challenge, echo })
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.flags);
        buf.put_u8(self.key_slot);
        buf.put_u8(self.key_mask);
        buf.put_u8(self.challenge.len() as u8);
        buf.put_slice(&self.challenge);
        buf.put_u32_le(self.echo);
    }

    fn encoded_len(&self) -> usize {
        4 + self.challenge.len() + 4
    }
}

/// Server side of the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOffer {
    pub session_id: u16,
    pub timestamp: i32,
    pub millis: u32,
    /// `None` for a plaintext session
    pub signed: Option<SignedMessage>,
}

impl SessionOffer {
    /// Parse the payload of a Session Offer control frame
    pub fn decode(payload: &[u8]) -> Result<Self> {
        need(payload, OFFER_CRYPTO_LEN + 4)?;
        let mut buf = payload;
        let session_id = buf.get_u16_le();
        buf.advance(4);
        let timestamp = buf.get_i32_le();
        let millis = buf.get_u32_le();
        let crypto_len = buf.get_u32_le();

        let signed = if crypto_len == NO_CRYPTO {
            None
        } else {
            need(buf, crypto_len as usize)?;
            Some(SignedMessage::decode(&buf[..crypto_len as usize])?)
        };

        Ok(Self { session_id, timestamp, millis, signed })
    }

    /// Encode as a control frame payload
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u16_le(self.session_id);
        buf.put_i32_le(0);
        buf.put_i32_le(self.timestamp);
        buf.put_u32_le(self.millis);
        match &self.signed {
            Some(signed) => {
                buf.put_u32_le(signed.encoded_len() as u32);
                signed.encode(&mut buf);
            }
            None => {
                buf.put_u32_le(NO_CRYPTO);
                buf.put_u8(0);
            }
        }
        buf.put_u8(0);
        buf.freeze()
    }
}

/// Client side of the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionAccept {
    pub session_id: u16,
    pub time_high: u32,
    pub time_low: u32,
    pub millis: u32,
    /// Sealed [`EncryptedMessage`]; `None` for a plaintext session
    pub sealed: Option<Bytes>,
}

impl SessionAccept {
    /// Parse the payload of a Session Accept control frame
    pub fn decode(payload: &[u8]) -> Result<Self> {
        need(payload, ACCEPT_SESSION_ID + 2 + 4)?;
        let mut buf = payload;
        buf.advance(2);
        let time_high = buf.get_u32_le();
        let time_low = buf.get_u32_le();
        let millis = buf.get_u32_le();
        let session_id = buf.get_u16_le();
        let crypto_len = buf.get_u32_le();

        let sealed = if crypto_len == NO_CRYPTO || crypto_len == 0 {
            None
        } else {
            need(buf, crypto_len as usize)?;
            // One flag byte precedes the sealed message
            Some(Bytes::copy_from_slice(&buf[1..crypto_len as usize]))
        };

        Ok(Self { session_id, time_high, time_low, millis, sealed })
    }

    /// Encode as a control frame payload
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(128);
        buf.put_u16_le(0);
        buf.put_u32_le(self.time_high);
        buf.put_u32_le(self.time_low);
        buf.put_u32_le(self.millis);
        buf.put_u16_le(self.session_id);
        match &self.sealed {
            Some(sealed) => {
                buf.put_u32_le(sealed.len() as u32 + 1);
                buf.put_u8(0);
                buf.put_slice(sealed);
            }
            None => {
                buf.put_u32_le(NO_CRYPTO);
                buf.put_u8(0);
            }
        }
        buf.put_u8(0);
        buf.freeze()
    }
}

/// Plaintext of the sealed part of a Session Accept
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptedMessage {
    pub flags: u8,
    pub key_hash: u32,
    pub challenge_answer: u32,
    /// Must equal the offer's echo
    pub echo: u32,
    pub timestamp: u32,
    /// Session AES key
    pub key: [u8; 16],
    /// Initial GCM nonce
    pub nonce: [u8; 16],
}

impl EncryptedMessage {
    /// Parse an opened sealed message
    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        need(buf, ENCRYPTED_MESSAGE_LEN)?;
        let flags = buf.get_u8();
        let key_hash = buf.get_u32_le();
        let challenge_answer = buf.get_u32_le();
        let echo = buf.get_u32_le();
        let timestamp = buf.get_u32_le();
        let mut key = [0u8; 16];
        buf.copy_to_slice(&mut key);
        let mut nonce = [0u8; 16];
        buf.copy_to_slice(&mut nonce);

        Ok(Self { flags, key_hash, challenge_answer, echo, timestamp, key, nonce })
    }

    /// Encode before sealing
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(ENCRYPTED_MESSAGE_LEN);
        buf.put_u8(self.flags);
        buf.put_u32_le(self.key_hash);
        buf.put_u32_le(self.challenge_answer);
        buf.put_u32_le(self.echo);
        buf.put_u32_le(self.timestamp);
        buf.put_slice(&self.key);
        buf.put_slice(&self.nonce);
        buf.freeze()
    }
}

impl std::fmt::Debug for EncryptedMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedMessage")
            .field("flags", &self.flags)
            .field("echo", &self.echo)
            .field("key", &"<redacted>")
            .finish()
    }
}

fn need(buf: &[u8], len: usize) -> Result<()> {
    if buf.len() < len {
        return Err(ProxyError::Handshake(format!(
            "truncated handshake message: need {} bytes, have {}",
            len,
            buf.len()
        )));
    }
    Ok(())
}
