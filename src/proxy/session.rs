//! Per-connection session state
//!
//! Watches the handshake control frames of one shard connection. The server
//! pump records the Session Offer; the client pump opens the Session Accept,
//! binds the session key, and leaves one cipher per direction for each pump
//! to pick up before its next read.
//!
//! A client patched to seal its accept under a client-facing key has the
//! accept opened with that key, its key hash checked and replaced, and the
//! message resealed under the static key, so the server sees an accept
//! sealed the way it expects.

use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use log::{debug, warn};

use crate::common::{ProxyError, Result};
use crate::crypto::{
    open_sealed, seal, KeyChain, KeyId, KeyMaterial, SessionId, SessionKey, StreamCipher,
};
use crate::protocol::handshake::{SESSION_ACCEPT, SESSION_OFFER};
use crate::protocol::{Direction, EncryptedMessage, Packet, SessionAccept, SessionOffer};

/// Handshake progress reported to the pump
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandshakeEvent {
    /// The server offered a session
    Offered { session_id: SessionId, encrypted: bool },
    /// The client accepted and both ciphers are ready
    Established { session_id: SessionId, encrypted: bool },
}

#[derive(Debug, Clone, Copy)]
struct Offer {
    session_id: u16,
    key_slot: Option<u8>,
    echo: u32,
}

#[derive(Default)]
struct SessionState {
    offer: Option<Offer>,
    established: bool,
    client_cipher: Option<StreamCipher>,
    server_cipher: Option<StreamCipher>,
}

/// Handshake state shared by the two pumps of a shard
#[derive(Default)]
pub(crate) struct Session {
    state: Mutex<SessionState>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look at a packet for handshake messages
    ///
    /// An accept sealed under a client-facing key is rewritten in place.
    ///
    /// # Errors
    ///
    /// Malformed handshake messages, an accept without an offer, a failed
    /// echo or key hash check, and a key slot with neither a static key nor a
    /// seeded session key are all fatal to the connection.
    pub fn inspect(&self, packet: &mut Packet, keys: &KeyChain) -> Result<Option<HandshakeEvent>> {
        match (packet.direction, packet.frame.opcode()) {
            (Direction::ServerToClient, Some(SESSION_OFFER)) => {
                self.on_offer(packet.payload()).map(Some)
            }
            (Direction::ClientToServer, Some(SESSION_ACCEPT)) => {
                self.on_accept(packet, keys).map(Some)
            }
            _ => Ok(None),
        }
    }

    /// Hand over the cipher for one direction, once
    pub fn take_cipher(&self, direction: Direction) -> Option<StreamCipher> {
        let mut state = self.lock();
        match direction {
            Direction::ClientToServer => state.client_cipher.take(),
            Direction::ServerToClient => state.server_cipher.take(),
        }
    }

    fn on_offer(&self, payload: &[u8]) -> Result<HandshakeEvent> {
        let offer = SessionOffer::decode(payload)?;
        let encrypted = offer.signed.is_some();
        debug!(
            "Session offer {} (key slot {:?})",
            offer.session_id,
            offer.signed.as_ref().map(|s| s.key_slot)
        );

        self.lock().offer = Some(Offer {
            session_id: offer.session_id,
            key_slot: offer.signed.as_ref().map(|s| s.key_slot),
            echo: offer.signed.as_ref().map_or(0, |s| s.echo),
        });

        Ok(HandshakeEvent::Offered { session_id: SessionId(offer.session_id), encrypted })
    }

    fn on_accept(&self, packet: &mut Packet, keys: &KeyChain) -> Result<HandshakeEvent> {
        let mut accept = SessionAccept::decode(packet.payload())?;
        let mut state = self.lock();

        if state.established {
            return Err(ProxyError::Handshake("duplicate session accept".to_string()));
        }
        let offer = state.offer.ok_or_else(|| {
            ProxyError::Handshake("session accept without a session offer".to_string())
        })?;

        if accept.session_id != offer.session_id {
            warn!(
                "Session accept names session {}, offer was {}",
                accept.session_id, offer.session_id
            );
        }
        let session_id = SessionId(offer.session_id);

        let (Some(slot), Some(sealed)) = (offer.key_slot, accept.sealed.as_ref()) else {
            debug!("Session {} runs in plaintext", session_id);
            state.established = true;
            return Ok(HandshakeEvent::Established { session_id, encrypted: false });
        };
        let slot = KeyId(slot);

        let material = if let Ok(client_key) = keys.lookup_client(slot) {
            let static_key = keys.lookup_static(slot)?;
            let mut message = open_message(&client_key, sealed, offer.echo)?;
            if message.key_hash != client_key.key_hash() {
                return Err(ProxyError::Handshake(format!(
                    "key hash {:#010x} does not match client key {}",
                    message.key_hash, slot
                )));
            }

            message.key_hash = static_key.key_hash();
            accept.sealed = Some(Bytes::from(seal(&static_key, &message.encode())?));
            packet.replace_payload(accept.encode())?;
            debug!("Resealed session accept {} under static key {}", session_id, slot);

            bind(keys, session_id, &message)
        } else {
            match keys.lookup_static(slot) {
                Ok(static_key) => {
                    let message = open_message(&static_key, sealed, offer.echo)?;
                    bind(keys, session_id, &message)
                }
                Err(missing) => {
                    // Only a key injected ahead of time can stand in for the static key
                    let seeded = keys.lookup_session(session_id).map_err(|_| missing)?;
                    warn!("No static key {}, using the stored key of session {}", slot, session_id);
                    seeded
                }
            }
        };

        let session_key = SessionKey::try_from(&material)?;
        state.client_cipher = Some(StreamCipher::client(&session_key)?);
        state.server_cipher = Some(StreamCipher::server(&session_key)?);
        state.established = true;

        debug!("Session {} established", session_id);
        Ok(HandshakeEvent::Established { session_id, encrypted: true })
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Open a sealed accept message and check its echo
fn open_message(key: &KeyMaterial, sealed: &[u8], echo: u32) -> Result<EncryptedMessage> {
    let opened = open_sealed(key, sealed)?;
    let message = EncryptedMessage::decode(&opened)?;
    if message.echo != echo {
        return Err(ProxyError::Handshake("echo value mismatch".to_string()));
    }
    Ok(message)
}

/// Bind the proposed key; the binding that wins is returned
fn bind(keys: &KeyChain, session_id: SessionId, message: &EncryptedMessage) -> KeyMaterial {
    let proposed = SessionKey { key: message.key, nonce: message.nonce };
    keys.bind_session(session_id, proposed.to_material())
}
