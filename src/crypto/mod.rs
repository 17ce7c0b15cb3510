//! Cryptography module
//!
//! Key storage and the AES-GCM primitives used by the session layer.

pub mod aes;
pub mod key_chain;

pub use aes::{open_sealed, seal, SessionKey, StreamCipher, CLIENT_CHUNK, SERVER_CHUNK};
pub use key_chain::{KeyChain, KeyId, KeyMaterial, SessionId};
