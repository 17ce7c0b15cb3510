//! Frame reader
//!
//! Splits a TCP byte stream into frames, decrypting them when the session has
//! switched to encryption. Each connection direction owns one reader and
//! reuses its buffer for the life of the connection.

use std::io;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use log::trace;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;

use crate::common::{ProxyError, Result};
use crate::crypto::StreamCipher;
use super::frame::{is_plaintext, remaining_len, HEADER_LEN};

/// Initial buffer capacity
const READ_CAPACITY: usize = 8 * 1024;

/// One frame as read from the wire, in plaintext
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// Plaintext frame bytes
    pub bytes: Bytes,
    /// Whether the frame was encrypted on the wire
    pub encrypted: bool,
}

/// Buffered frame reader over an async byte stream
pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
    idle_timeout: Option<Duration>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Create a reader
    ///
    /// # Parameters
    ///
    /// * `inner` - Byte stream to read from
    /// * `idle_timeout` - Longest wait for any data before giving up
    pub fn new(inner: R, idle_timeout: Option<Duration>) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(READ_CAPACITY),
            idle_timeout,
        }
    }

    /// Wait until at least one byte of the next frame is buffered
    ///
    /// Returns `false` if the peer closed the stream cleanly between frames.
    pub async fn wait_readable(&mut self) -> Result<bool> {
        if !self.buf.is_empty() {
            return Ok(true);
        }
        Ok(self.fill().await? > 0)
    }

    /// Read the next complete frame
    ///
    /// With a cipher, a frame is decrypted unless its first bytes are the
    /// plaintext magic.
    ///
    /// # Errors
    ///
    /// Fails on malformed headers, decryption failure, idle timeout, and on
    /// end of stream inside a frame.
    pub async fn next_frame(&mut self, mut cipher: Option<&mut StreamCipher>) -> Result<RawFrame> {
        self.fill_to(2).await?;
        let encrypted = cipher.is_some() && !is_plaintext(&self.buf);

        let header_len = match cipher.as_deref() {
            Some(cipher) if encrypted => cipher.ciphertext_len(HEADER_LEN),
            _ => HEADER_LEN,
        };
        self.fill_to(header_len).await?;
        let mut frame = self.take(header_len, encrypted, cipher.as_deref_mut())?;

        let body_len = remaining_len(&frame)?;
        let wire_len = match cipher.as_deref() {
            Some(cipher) if encrypted => cipher.ciphertext_len(body_len),
            _ => body_len,
        };
        self.fill_to(wire_len).await?;
        let body = self.take(wire_len, encrypted, cipher.as_deref_mut())?;
        frame.unsplit(body);

        trace!("Read {} byte frame (encrypted: {})", frame.len(), encrypted);
        Ok(RawFrame { bytes: frame.freeze(), encrypted })
    }

    fn take(
        &mut self,
        len: usize,
        encrypted: bool,
        cipher: Option<&mut StreamCipher>,
    ) -> Result<BytesMut> {
        let chunk = self.buf.split_to(len);
        match cipher {
            Some(cipher) if encrypted => cipher.decrypt(&chunk),
            _ => Ok(chunk),
        }
    }

    async fn fill_to(&mut self, len: usize) -> Result<()> {
        while self.buf.len() < len {
            self.buf.reserve(len - self.buf.len());
            if self.fill().await? == 0 {
                return Err(ProxyError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed in the middle of a frame",
                )));
            }
        }
        Ok(())
    }

    async fn fill(&mut self) -> Result<usize> {
        let read = self.inner.read_buf(&mut self.buf);
        match self.idle_timeout {
            Some(limit) => timeout(limit, read)
                .await
                .map_err(|_| ProxyError::Timeout(format!("no data for {}s", limit.as_secs())))?
                .map_err(ProxyError::Io),
            None => read.await.map_err(ProxyError::Io),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SessionKey;
    use crate::protocol::frame::Frame;

    fn data_frame(payload: &'static [u8]) -> BytesMut {
        Frame::Data { service_id: 1, message_id: 2, payload: Bytes::from_static(payload) }.encode().unwrap()
    }

    #[tokio::test]
    async fn test_reads_back_to_back_frames() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&data_frame(b"one"));
        wire.extend_from_slice(&data_frame(b"second"));

        let mut reader = FrameReader::new(wire.as_slice(), None);
        assert!(reader.wait_readable().await.unwrap());
        let first = reader.next_frame(None).await.unwrap();
        assert_eq!(first.bytes, data_frame(b"one"));
        assert!(!first.encrypted);

        let second = reader.next_frame(None).await.unwrap();
        assert_eq!(second.bytes, data_frame(b"second"));
        assert!(!reader.wait_readable().await.unwrap());
    }

    #[tokio::test]
    async fn test_decrypts_encrypted_frames_and_passes_plaintext() {
        let session = SessionKey { key: [1u8; 16], nonce: [2u8; 16] };
        let mut sender = StreamCipher::new(16, &session).unwrap();
        let mut cipher = StreamCipher::new(16, &session).unwrap();

        let mut wire = Vec::new();
        wire.extend_from_slice(&sender.encrypt(&data_frame(b"secret payload")).unwrap());
        wire.extend_from_slice(&data_frame(b"clear"));

        let mut reader = FrameReader::new(wire.as_slice(), None);
        let first = reader.next_frame(Some(&mut cipher)).await.unwrap();
        assert!(first.encrypted);
        assert_eq!(first.bytes, data_frame(b"secret payload"));

        let second = reader.next_frame(Some(&mut cipher)).await.unwrap();
        assert!(!second.encrypted);
        assert_eq!(second.bytes, data_frame(b"clear"));
    }

    #[tokio::test]
    async fn test_eof_inside_frame_is_an_error() {
        let frame = data_frame(b"truncated");
        let mut reader = FrameReader::new(&frame[..frame.len() - 2], None);
        assert!(reader.next_frame(None).await.is_err());
    }
}
