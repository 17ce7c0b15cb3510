//! Chunked AES-128-GCM streams
//!
//! Once a session is established, each direction of a connection is a single
//! AES-128-GCM stream keyed by the session key. The stream is cut into fixed
//! size chunks of plaintext; after every full chunk the sender appends the
//! 16-byte GCM tag and a fresh random 16-byte nonce, then restarts GCM with
//! that nonce. Frame boundaries are unrelated to chunk boundaries.
//!
//! A `StreamCipher` holds both halves for one direction: the decryptor
//! mirrors the sending peer, the encryptor produces the stream we forward to
//! the receiving peer.

use bytes::{BufMut, BytesMut};
use openssl::rand::rand_bytes;
use openssl::symm::{decrypt_aead, encrypt_aead, Cipher, Crypter, Mode};

use crate::common::{ProxyError, Result};
use super::key_chain::{KeyMaterial, SESSION_KEY_LEN, STATIC_KEY_LEN};

/// Plaintext bytes per chunk on the client to server stream
pub const CLIENT_CHUNK: usize = 0x100 * 16;

/// Plaintext bytes per chunk on the server to client stream
pub const SERVER_CHUNK: usize = 0x1000 * 16;

/// GCM tag length
pub const TAG_LEN: usize = 16;

/// Stream nonce length
pub const NONCE_LEN: usize = 16;

/// Nonce length of a sealed handshake message
pub const SEAL_NONCE_LEN: usize = 12;

/// Bytes inserted into the stream at every chunk boundary
const TRAILER_LEN: usize = TAG_LEN + NONCE_LEN;

/// Session key and initial nonce
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey {
    /// AES-128 key
    pub key: [u8; STATIC_KEY_LEN],
    /// Initial GCM nonce of both directions
    pub nonce: [u8; NONCE_LEN],
}

impl SessionKey {
    /// Serialize as `key || nonce`
    pub fn to_material(&self) -> KeyMaterial {
        let mut bytes = Vec::with_capacity(SESSION_KEY_LEN);
        bytes.extend_from_slice(&self.key);
        bytes.extend_from_slice(&self.nonce);
        KeyMaterial::new(bytes)
    }
}

impl TryFrom<&KeyMaterial> for SessionKey {
    type Error = ProxyError;

    fn try_from(material: &KeyMaterial) -> Result<Self> {
        let bytes = material.as_bytes();
        if bytes.len() != SESSION_KEY_LEN {
            return Err(ProxyError::InvalidKey(format!(
                "session key is {} bytes, expected {}",
                bytes.len(),
                SESSION_KEY_LEN
            )));
        }

        let mut key = [0u8; STATIC_KEY_LEN];
        let mut nonce = [0u8; NONCE_LEN];
        key.copy_from_slice(&bytes[..STATIC_KEY_LEN]);
        nonce.copy_from_slice(&bytes[STATIC_KEY_LEN..]);
        Ok(Self { key, nonce })
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(<redacted>)")
    }
}

/// One GCM stream in one mode
struct GcmStream {
    mode: Mode,
    key: [u8; STATIC_KEY_LEN],
    crypter: Crypter,
    /// Plaintext bytes processed in the current chunk
    progress: usize,
}

impl GcmStream {
    fn new(mode: Mode, key: [u8; STATIC_KEY_LEN], nonce: &[u8]) -> Result<Self> {
        let crypter = Crypter::new(Cipher::aes_128_gcm(), mode, &key, Some(nonce))?;
        Ok(Self { mode, key, crypter, progress: 0 })
    }

    fn restart(&mut self, nonce: &[u8]) -> Result<()> {
        self.crypter = Crypter::new(Cipher::aes_128_gcm(), self.mode, &self.key, Some(nonce))?;
        self.progress = 0;
        Ok(())
    }

    fn update(&mut self, input: &[u8], out: &mut BytesMut) -> Result<()> {
        let start = out.len();
        out.resize(start + input.len() + Cipher::aes_128_gcm().block_size(), 0);
        let written = self.crypter.update(input, &mut out[start..])?;
        out.truncate(start + written);
        self.progress += input.len();
        Ok(())
    }
}

/// Decryptor and encryptor for one direction of a session
pub struct StreamCipher {
    chunk: usize,
    decryptor: GcmStream,
    encryptor: GcmStream,
}

impl StreamCipher {
    /// Create a stream pair with an explicit chunk size
    ///
    /// # Parameters
    ///
    /// * `chunk` - Plaintext bytes between tag/nonce trailers
    /// * `session` - Key and initial nonce shared by both halves
    pub fn new(chunk: usize, session: &SessionKey) -> Result<Self> {
        if chunk == 0 {
            return Err(ProxyError::InvalidKey("chunk size must be non-zero".to_string()));
        }

        Ok(Self {
            chunk,
            decryptor: GcmStream::new(Mode::Decrypt, session.key, &session.nonce)?,
            encryptor: GcmStream::new(Mode::Encrypt, session.key, &session.nonce)?,
        })
    }

    /// Cipher for the client to server direction
    pub fn client(session: &SessionKey) -> Result<Self> {
        Self::new(CLIENT_CHUNK, session)
    }

    /// Cipher for the server to client direction
    pub fn server(session: &SessionKey) -> Result<Self> {
        Self::new(SERVER_CHUNK, session)
    }

    /// Chunk size of this stream
    pub fn chunk(&self) -> usize {
        self.chunk
    }

    /// Number of ciphertext bytes that carry the next `plaintext_len` bytes
    ///
    /// Accounts for every tag/nonce trailer the decryptor will cross,
    /// including one that falls exactly at the end of the span.
    pub fn ciphertext_len(&self, plaintext_len: usize) -> usize {
        let remaining = self.chunk - self.decryptor.progress;
        let trailers = if remaining <= plaintext_len {
            (plaintext_len - remaining) / self.chunk + 1
        } else {
            0
        };
        plaintext_len + trailers * TRAILER_LEN
    }

    /// Decrypt a span of the incoming stream
    ///
    /// `data` must end on a plaintext byte or directly after a trailer; use
    /// [`StreamCipher::ciphertext_len`] to size reads.
    pub fn decrypt(&mut self, data: &[u8]) -> Result<BytesMut> {
        let mut out = BytesMut::with_capacity(data.len());
        let mut rest = data;

        while !rest.is_empty() {
            let take = (self.chunk - self.decryptor.progress).min(rest.len());
            self.decryptor.update(&rest[..take], &mut out)?;
            rest = &rest[take..];

            if self.decryptor.progress == self.chunk {
                if rest.len() < TRAILER_LEN {
                    return Err(ProxyError::Frame(
                        "encrypted stream ended inside a chunk trailer".to_string(),
                    ));
                }
                let (tag, tail) = rest.split_at(TAG_LEN);
                let (nonce, tail) = tail.split_at(NONCE_LEN);

                self.decryptor.crypter.set_tag(tag)?;
                let mut scratch = [0u8; 32];
                self.decryptor.crypter.finalize(&mut scratch).map_err(|_| {
                    ProxyError::Handshake("chunk authentication tag mismatch".to_string())
                })?;
                self.decryptor.restart(nonce)?;
                rest = tail;
            }
        }

        Ok(out)
    }

    /// Encrypt a span for the outgoing stream
    pub fn encrypt(&mut self, data: &[u8]) -> Result<BytesMut> {
        let trailers = (self.encryptor.progress + data.len()) / self.chunk;
        let mut out = BytesMut::with_capacity(data.len() + trailers * TRAILER_LEN);
        let mut rest = data;

        while !rest.is_empty() {
            let take = (self.chunk - self.encryptor.progress).min(rest.len());
            self.encryptor.update(&rest[..take], &mut out)?;
            rest = &rest[take..];

            if self.encryptor.progress == self.chunk {
                let mut scratch = [0u8; 32];
                self.encryptor.crypter.finalize(&mut scratch)?;
                let mut tag = [0u8; TAG_LEN];
                self.encryptor.crypter.get_tag(&mut tag)?;

                let mut nonce = [0u8; NONCE_LEN];
                rand_bytes(&mut nonce)?;

                out.put_slice(&tag);
                out.put_slice(&nonce);
                self.encryptor.restart(&nonce)?;
            }
        }

        Ok(out)
    }
}

impl std::fmt::Debug for StreamCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamCipher")
            .field("chunk", &self.chunk)
            .field("decrypted", &self.decryptor.progress)
            .field("encrypted", &self.encryptor.progress)
            .finish()
    }
}

/// Seal a handshake message under a static key
///
/// Output layout: `nonce(12) || ciphertext || tag(16)`.
pub fn seal(key: &KeyMaterial, plaintext: &[u8]) -> Result<Vec<u8>> {
    check_static_key(key)?;

    let mut nonce = [0u8; SEAL_NONCE_LEN];
    rand_bytes(&mut nonce)?;

    let mut tag = [0u8; TAG_LEN];
    let ciphertext = encrypt_aead(
        Cipher::aes_128_gcm(),
        key.as_bytes(),
        Some(&nonce),
        &[],
        plaintext,
        &mut tag,
    )?;

    let mut sealed = Vec::with_capacity(SEAL_NONCE_LEN + ciphertext.len() + TAG_LEN);
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    sealed.extend_from_slice(&tag);
    Ok(sealed)
}

/// Open a message produced by [`seal`]
pub fn open_sealed(key: &KeyMaterial, sealed: &[u8]) -> Result<Vec<u8>> {
    check_static_key(key)?;

    if sealed.len() < SEAL_NONCE_LEN + TAG_LEN {
        return Err(ProxyError::Handshake(format!(
            "sealed message too short: {} bytes",
            sealed.len()
        )));
    }

    let (nonce, rest) = sealed.split_at(SEAL_NONCE_LEN);
    let (ciphertext, tag) = rest.split_at(rest.len() - TAG_LEN);

    decrypt_aead(Cipher::aes_128_gcm(), key.as_bytes(), Some(nonce), &[], ciphertext, tag)
        .map_err(|_| ProxyError::Handshake("sealed message failed authentication".to_string()))
}

fn check_static_key(key: &KeyMaterial) -> Result<()> {
    if key.len() != STATIC_KEY_LEN {
        return Err(ProxyError::InvalidKey(format!(
            "static key is {} bytes, expected {}",
            key.len(),
            STATIC_KEY_LEN
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> SessionKey {
        SessionKey { key: [7u8; 16], nonce: [9u8; 16] }
    }

    #[test]
    fn test_stream_crosses_chunk_boundaries() {
        let mut sender = StreamCipher::new(64, &session()).unwrap();
        let mut proxy = StreamCipher::new(64, &session()).unwrap();

        let plaintext: Vec<u8> = (0..300u32).map(|i| i as u8).collect();
        let mut recovered = Vec::new();

        // Uneven spans, including one ending exactly on a chunk boundary
        for span in [plaintext[..10].to_vec(), plaintext[10..64].to_vec(), plaintext[64..300].to_vec()] {
            let expected_len = proxy.ciphertext_len(span.len());
            let ciphertext = sender.encrypt(&span).unwrap();
            assert_eq!(ciphertext.len(), expected_len);
            recovered.extend_from_slice(&proxy.decrypt(&ciphertext).unwrap());
        }

        assert_eq!(recovered, plaintext);
    }

    #[test]
    fn test_reencrypted_stream_is_readable_by_peer() {
        let mut client = StreamCipher::client(&session()).unwrap();
        let mut proxy = StreamCipher::client(&session()).unwrap();
        let mut server = StreamCipher::client(&session()).unwrap();

        let data = vec![0x5Au8; CLIENT_CHUNK * 2 + 100];
        let wire = client.encrypt(&data).unwrap();
        let plain = proxy.decrypt(&wire).unwrap();
        let forwarded = proxy.encrypt(&plain).unwrap();

        // Fresh nonces differ, so the bytes differ but the plaintext survives
        assert_ne!(forwarded, wire);
        assert_eq!(server.decrypt(&forwarded).unwrap(), data.as_slice());
    }

    #[test]
    fn test_tampered_tag_is_rejected() {
        let mut sender = StreamCipher::new(16, &session()).unwrap();
        let mut receiver = StreamCipher::new(16, &session()).unwrap();

        let mut ciphertext = sender.encrypt(&[1u8; 16]).unwrap();
        ciphertext[16] ^= 0xFF;
        assert!(receiver.decrypt(&ciphertext).is_err());
    }

    #[test]
    fn test_ciphertext_len_without_boundary() {
        let cipher = StreamCipher::server(&session()).unwrap();
        assert_eq!(cipher.ciphertext_len(8), 8);
        assert_eq!(cipher.ciphertext_len(SERVER_CHUNK), SERVER_CHUNK + TRAILER_LEN);
        assert_eq!(cipher.ciphertext_len(SERVER_CHUNK * 2 + 1), SERVER_CHUNK * 2 + 1 + 2 * TRAILER_LEN);
    }

    #[test]
    fn test_seal_and_open() {
        let key = KeyMaterial::new(vec![3u8; 16]);
        let sealed = seal(&key, b"session material").unwrap();
        assert_eq!(open_sealed(&key, &sealed).unwrap(), b"session material");

        let wrong = KeyMaterial::new(vec![4u8; 16]);
        assert!(open_sealed(&wrong, &sealed).is_err());
        assert!(open_sealed(&key, &sealed[..10]).is_err());
    }

    #[test]
    fn test_session_key_from_material() {
        let material = session().to_material();
        assert_eq!(SessionKey::try_from(&material).unwrap(), session());
        assert!(SessionKey::try_from(&KeyMaterial::new(vec![0u8; 16])).is_err());
    }
}
