//! Outer frame codec.
//!
//! A raw transport frame is unwrapped in a fixed order: framing check,
//! envelope parse, decryption, decompression. Encoding applies the same
//! layers in reverse. The envelope layout itself is platform-specific and
//! supplied through [`EnvelopeSchema`].

mod cipher;
mod compression;
mod framing;

pub use cipher::CbcCipher;
pub use compression::{gunzip, gzip};
pub use framing::{FrameReader, FrameSplitter, Framing, LENGTH_PREFIX_SIZE};

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Frames above this size are rejected before any allocation.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Fewer bytes than the frame declares. Buffer more input and retry.
    #[error("Truncated frame: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    /// The frame is malformed and must be dropped.
    #[error("Corrupt frame: {0}")]
    Corrupt(String),

    #[error("Frame of {size} bytes exceeds limit of {max}")]
    TooLarge { size: usize, max: usize },
}

impl FrameError {
    #[must_use]
    pub const fn is_truncated(&self) -> bool {
        matches!(self, Self::Truncated { .. })
    }
}

impl From<std::io::Error> for FrameError {
    fn from(err: std::io::Error) -> Self {
        Self::Corrupt(err.to_string())
    }
}

impl From<prost::DecodeError> for FrameError {
    fn from(err: prost::DecodeError) -> Self {
        Self::Corrupt(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionMode {
    #[default]
    None,
    Gzip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncryptionMode {
    #[default]
    None,
    AesCbc,
}

/// Semantic meaning of an envelope kind, resolved through a static
/// per-platform table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameClass {
    /// Carries chat payload for the message decoder.
    Push,
    HeartbeatAck,
    EntryAck,
    /// Server-reported error. Fatal while authenticating.
    Error,
    /// Server closed the room.
    Closed,
    /// Known or unknown kind with nothing to do.
    Ignored,
}

/// One unwrapped transport frame. Lives for a single receive iteration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    pub kind: u32,
    pub compression: CompressionMode,
    pub encryption: EncryptionMode,
    pub payload: Bytes,
    pub needs_ack: bool,
    pub log_id: Option<u64>,
    /// Opaque bytes the server expects echoed back in the ack.
    pub ack_context: Option<Bytes>,
    pub timestamp_ms: Option<u64>,
}

impl Envelope {
    #[must_use]
    pub fn new(kind: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
            ..Self::default()
        }
    }
}

/// Platform envelope layout sitting between the framing layer and the
/// compression/encryption layers.
pub trait EnvelopeSchema: Send + Sync {
    /// Parse the envelope. The returned payload is still compressed and
    /// encrypted as the flags describe.
    fn parse(&self, body: &[u8]) -> Result<Envelope, FrameError>;

    /// Serialize an envelope whose payload has already been transformed.
    fn seal(&self, envelope: &Envelope) -> Vec<u8>;

    /// Called with the fully decoded payload.
    fn finish(&self, _envelope: &mut Envelope) -> Result<(), FrameError> {
        Ok(())
    }
}

/// Encodes and decodes whole frames for one platform.
pub struct FrameCodec<S> {
    schema: S,
    framing: Framing,
    cipher: Option<CbcCipher>,
    max_frame_size: usize,
}

impl<S: EnvelopeSchema> FrameCodec<S> {
    pub const fn new(schema: S, framing: Framing) -> Self {
        Self {
            schema,
            framing,
            cipher: None,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    #[must_use]
    pub fn with_cipher(mut self, cipher: CbcCipher) -> Self {
        self.cipher = Some(cipher);
        self
    }

    #[must_use]
    pub const fn with_max_frame_size(mut self, max: usize) -> Self {
        self.max_frame_size = max;
        self
    }

    pub const fn framing(&self) -> Framing {
        self.framing
    }

    pub const fn schema(&self) -> &S {
        &self.schema
    }

    /// Decode one raw frame into an envelope with a plain payload.
    pub fn decode(&self, raw: &[u8]) -> Result<Envelope, FrameError> {
        let body = match self.framing {
            Framing::Message => {
                if raw.len() > self.max_frame_size {
                    return Err(FrameError::TooLarge {
                        size: raw.len(),
                        max: self.max_frame_size,
                    });
                }
                raw
            }
            Framing::LengthPrefixed => {
                if raw.len() < LENGTH_PREFIX_SIZE {
                    return Err(FrameError::Truncated {
                        needed: LENGTH_PREFIX_SIZE,
                        available: raw.len(),
                    });
                }
                let declared = BigEndian::read_u32(&raw[..LENGTH_PREFIX_SIZE]) as usize;
                if declared > self.max_frame_size {
                    return Err(FrameError::TooLarge {
                        size: declared,
                        max: self.max_frame_size,
                    });
                }
                let needed = LENGTH_PREFIX_SIZE + declared;
                if raw.len() < needed {
                    return Err(FrameError::Truncated {
                        needed,
                        available: raw.len(),
                    });
                }
                &raw[LENGTH_PREFIX_SIZE..needed]
            }
        };

        let mut envelope = self.schema.parse(body)?;

        if envelope.encryption == EncryptionMode::AesCbc {
            let cipher = self
                .cipher
                .as_ref()
                .ok_or_else(|| FrameError::Corrupt("encrypted frame without key".to_string()))?;
            envelope.payload = Bytes::from(cipher.decrypt(&envelope.payload)?);
        }

        if envelope.compression == CompressionMode::Gzip {
            envelope.payload = Bytes::from(gunzip(&envelope.payload, self.max_frame_size)?);
        }

        self.schema.finish(&mut envelope)?;

        tracing::trace!(
            kind = envelope.kind,
            payload_len = envelope.payload.len(),
            needs_ack = envelope.needs_ack,
            "decoded frame"
        );

        Ok(envelope)
    }

    /// Build a frame carrying `payload` under the given layers.
    pub fn encode(
        &self,
        kind: u32,
        payload: &[u8],
        compression: CompressionMode,
        encryption: EncryptionMode,
    ) -> Result<Bytes, FrameError> {
        let mut envelope = Envelope::new(kind, payload.to_vec());
        envelope.compression = compression;
        envelope.encryption = encryption;
        self.encode_envelope(envelope)
    }

    /// Apply compression then encryption to the envelope payload, then seal
    /// and frame it.
    pub fn encode_envelope(&self, mut envelope: Envelope) -> Result<Bytes, FrameError> {
        if envelope.compression == CompressionMode::Gzip {
            envelope.payload = Bytes::from(gzip(&envelope.payload)?);
        }
        if envelope.encryption == EncryptionMode::AesCbc {
            let cipher = self
                .cipher
                .as_ref()
                .ok_or_else(|| FrameError::Corrupt("no key configured for encryption".to_string()))?;
            envelope.payload = Bytes::from(cipher.encrypt(&envelope.payload));
        }

        let body = self.schema.seal(&envelope);
        match self.framing {
            Framing::Message => Ok(Bytes::from(body)),
            Framing::LengthPrefixed => {
                let len = u32::try_from(body.len()).map_err(|_| FrameError::TooLarge {
                    size: body.len(),
                    max: u32::MAX as usize,
                })?;
                let mut out = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + body.len());
                out.put_u32(len);
                out.put_slice(&body);
                Ok(out.freeze())
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use bytes::Buf;

    /// `kind:u32 | flags:u8 | log_id:u64 | payload`, flags bit0 gzip,
    /// bit1 aes, bit2 needs-ack.
    pub(crate) struct TestSchema;

    impl EnvelopeSchema for TestSchema {
        fn parse(&self, body: &[u8]) -> Result<Envelope, FrameError> {
            if body.len() < 13 {
                return Err(FrameError::Truncated {
                    needed: 13,
                    available: body.len(),
                });
            }
            let mut buf = body;
            let kind = buf.get_u32();
            let flags = buf.get_u8();
            let log_id = buf.get_u64();
            Ok(Envelope {
                kind,
                compression: if flags & 1 != 0 {
                    CompressionMode::Gzip
                } else {
                    CompressionMode::None
                },
                encryption: if flags & 2 != 0 {
                    EncryptionMode::AesCbc
                } else {
                    EncryptionMode::None
                },
                needs_ack: flags & 4 != 0,
                log_id: Some(log_id),
                payload: Bytes::copy_from_slice(buf),
                ..Envelope::default()
            })
        }

        fn seal(&self, envelope: &Envelope) -> Vec<u8> {
            let mut flags = 0u8;
            if envelope.compression == CompressionMode::Gzip {
                flags |= 1;
            }
            if envelope.encryption == EncryptionMode::AesCbc {
                flags |= 2;
            }
            if envelope.needs_ack {
                flags |= 4;
            }
            let mut out = Vec::with_capacity(13 + envelope.payload.len());
            out.put_u32(envelope.kind);
            out.put_u8(flags);
            out.put_u64(envelope.log_id.unwrap_or_default());
            out.extend_from_slice(&envelope.payload);
            out
        }
    }

    pub(crate) fn test_cipher() -> CbcCipher {
        CbcCipher::new(*b"0123456789abcdef", *b"fedcba9876543210")
    }

    fn codec() -> FrameCodec<TestSchema> {
        FrameCodec::new(TestSchema, Framing::LengthPrefixed).with_cipher(test_cipher())
    }

    #[test]
    fn test_round_trip_all_layers() {
        let codec = codec();
        let payload = "弹幕 payload ".repeat(20);

        for compression in [CompressionMode::None, CompressionMode::Gzip] {
            for encryption in [EncryptionMode::None, EncryptionMode::AesCbc] {
                let raw = codec
                    .encode(310, payload.as_bytes(), compression, encryption)
                    .unwrap();
                let envelope = codec.decode(&raw).unwrap();
                assert_eq!(envelope.kind, 310);
                assert_eq!(envelope.compression, compression);
                assert_eq!(envelope.encryption, encryption);
                assert_eq!(&envelope.payload[..], payload.as_bytes());
            }
        }
    }

    #[test]
    fn test_truncated_input_is_recoverable() {
        let codec = codec();
        let raw = codec
            .encode(1, b"hello world", CompressionMode::Gzip, EncryptionMode::None)
            .unwrap();

        for cut in 0..raw.len() {
            let err = codec.decode(&raw[..cut]).unwrap_err();
            assert!(err.is_truncated(), "cut at {cut}: {err:?}");
        }
        assert!(codec.decode(&raw).is_ok());
    }

    #[test]
    fn test_oversized_declared_length() {
        let codec = FrameCodec::new(TestSchema, Framing::LengthPrefixed).with_max_frame_size(64);
        let mut raw = Vec::new();
        raw.put_u32(1024);
        raw.extend_from_slice(&[0u8; 16]);

        assert_eq!(
            codec.decode(&raw).unwrap_err(),
            FrameError::TooLarge { size: 1024, max: 64 }
        );
    }

    #[test]
    fn test_corrupted_ciphertext() {
        let codec = codec();
        let raw = codec
            .encode(
                310,
                b"some chat payload that spans blocks",
                CompressionMode::Gzip,
                EncryptionMode::AesCbc,
            )
            .unwrap();

        // Frame prefix (4) + schema header (13); flip the first ciphertext byte.
        let mut flipped = raw.to_vec();
        flipped[LENGTH_PREFIX_SIZE + 13] ^= 0xFF;
        assert!(matches!(
            codec.decode(&flipped).unwrap_err(),
            FrameError::Corrupt(_)
        ));

        // Drop one ciphertext byte and fix up the length prefix.
        let mut short = raw[LENGTH_PREFIX_SIZE..raw.len() - 1].to_vec();
        let mut reframed = Vec::new();
        reframed.put_u32(short.len() as u32);
        reframed.append(&mut short);
        assert!(matches!(
            codec.decode(&reframed).unwrap_err(),
            FrameError::Corrupt(_)
        ));
    }

    #[test]
    fn test_encrypted_frame_without_key() {
        let with_key = codec();
        let raw = with_key
            .encode(1, b"secret", CompressionMode::None, EncryptionMode::AesCbc)
            .unwrap();

        let without_key = FrameCodec::new(TestSchema, Framing::LengthPrefixed);
        assert!(matches!(
            without_key.decode(&raw).unwrap_err(),
            FrameError::Corrupt(_)
        ));
    }

    #[test]
    fn test_message_framing_has_no_prefix() {
        let codec = FrameCodec::new(TestSchema, Framing::Message);
        let raw = codec
            .encode(7, b"x", CompressionMode::None, EncryptionMode::None)
            .unwrap();
        assert_eq!(raw.len(), 14);
        assert_eq!(&codec.decode(&raw).unwrap().payload[..], b"x");
    }
}
