//! Envelope codec for async streams

use crate::{Envelope, ProtocolError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum envelope size (32MB).
///
/// AGENT and CLASS envelopes carry whole behavior modules, so the ceiling
/// sits above the module size limit enforced by the code layer.
pub const MAX_ENVELOPE_SIZE: usize = 32 * 1024 * 1024;

/// Codec for reading and writing length-prefixed envelopes over async streams
pub struct EnvelopeCodec {
    /// Read buffer for incoming data
    read_buf: BytesMut,
    /// Maximum envelope size allowed
    max_envelope_size: usize,
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvelopeCodec {
    /// Create a new codec with default settings
    pub fn new() -> Self {
        Self {
            read_buf: BytesMut::with_capacity(8192),
            max_envelope_size: MAX_ENVELOPE_SIZE,
        }
    }

    /// Create a new codec with a custom maximum envelope size
    pub fn with_max_envelope_size(max_envelope_size: usize) -> Self {
        Self {
            read_buf: BytesMut::with_capacity(8192),
            max_envelope_size,
        }
    }

    /// Encode an envelope to bytes with a length prefix
    pub fn encode(&self, envelope: &Envelope) -> Result<Bytes, ProtocolError> {
        let body = envelope.to_msgpack()?;

        if body.len() > self.max_envelope_size {
            return Err(ProtocolError::EnvelopeTooLarge {
                size: body.len(),
                max: self.max_envelope_size,
            });
        }

        let mut buf = BytesMut::with_capacity(4 + body.len());
        buf.put_u32(body.len() as u32);
        buf.put_slice(&body);

        Ok(buf.freeze())
    }

    /// Write one envelope to an async writer
    pub async fn write_envelope<W>(
        &self,
        writer: &mut W,
        envelope: &Envelope,
    ) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        let encoded = self.encode(envelope)?;
        writer
            .write_all(&encoded)
            .await
            .map_err(|e| ProtocolError::Serialization(format!("Write error: {}", e)))?;
        writer
            .flush()
            .await
            .map_err(|e| ProtocolError::Serialization(format!("Flush error: {}", e)))?;
        Ok(())
    }

    /// Read one envelope from an async reader.
    ///
    /// Returns `None` on a clean end of stream before any data.
    pub async fn read_envelope<R>(&mut self, reader: &mut R) -> Result<Option<Envelope>, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            if let Some(envelope) = self.try_decode()? {
                return Ok(Some(envelope));
            }

            let mut temp_buf = [0u8; 8192];
            let n = reader
                .read(&mut temp_buf)
                .await
                .map_err(|e| ProtocolError::Serialization(format!("Read error: {}", e)))?;

            if n == 0 {
                // EOF: mid-envelope truncation is an error, a clean close is not
                if self.read_buf.is_empty() {
                    return Ok(None);
                } else {
                    return Err(ProtocolError::InvalidEnvelope);
                }
            }

            self.read_buf.extend_from_slice(&temp_buf[..n]);
        }
    }

    /// Try to decode one envelope from the internal buffer
    pub fn try_decode(&mut self) -> Result<Option<Envelope>, ProtocolError> {
        if self.read_buf.len() < 4 {
            return Ok(None);
        }

        let body_len = (&self.read_buf[..4]).get_u32() as usize;

        if body_len > self.max_envelope_size {
            return Err(ProtocolError::EnvelopeTooLarge {
                size: body_len,
                max: self.max_envelope_size,
            });
        }

        if self.read_buf.len() < 4 + body_len {
            return Ok(None);
        }

        self.read_buf.advance(4);
        let body = self.read_buf.split_to(body_len);

        let envelope = Envelope::from_msgpack(&body)?;
        Ok(Some(envelope))
    }

    /// Current size of the internal read buffer
    pub fn buffer_size(&self) -> usize {
        self.read_buf.len()
    }
}
