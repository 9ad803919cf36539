use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::{FrameError, MAX_FRAME_SIZE};

/// Width of the big-endian length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// How frames are delimited on the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Every transport message is exactly one frame.
    Message,
    /// `u32 length | body`, possibly several per transport message and
    /// possibly split across messages.
    LengthPrefixed,
}

/// Splits a byte stream into whole length-prefixed frames. Emitted frames
/// keep their prefix so they can be handed to `FrameCodec::decode` as is.
#[derive(Debug, Clone, Copy)]
pub struct FrameSplitter {
    max_frame_size: usize,
}

impl FrameSplitter {
    #[must_use]
    pub const fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for FrameSplitter {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}

impl Decoder for FrameSplitter {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        if src.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }
        let declared = BigEndian::read_u32(&src[..LENGTH_PREFIX_SIZE]) as usize;
        if declared > self.max_frame_size {
            return Err(FrameError::TooLarge {
                size: declared,
                max: self.max_frame_size,
            });
        }
        let total = LENGTH_PREFIX_SIZE + declared;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }
        Ok(Some(src.split_to(total).freeze()))
    }
}

impl Encoder<Bytes> for FrameSplitter {
    type Error = FrameError;

    fn encode(&mut self, body: Bytes, dst: &mut BytesMut) -> Result<(), FrameError> {
        if body.len() > self.max_frame_size {
            return Err(FrameError::TooLarge {
                size: body.len(),
                max: self.max_frame_size,
            });
        }
        dst.reserve(LENGTH_PREFIX_SIZE + body.len());
        dst.put_u32(body.len() as u32);
        dst.put_slice(&body);
        Ok(())
    }
}

/// Accumulates transport messages and yields complete frames.
#[derive(Debug)]
pub struct FrameReader {
    framing: Framing,
    splitter: FrameSplitter,
    pending: BytesMut,
}

impl FrameReader {
    #[must_use]
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            splitter: FrameSplitter::default(),
            pending: BytesMut::new(),
        }
    }

    /// Feed one transport message and collect every frame it completes.
    ///
    /// On a framing error the buffered bytes are discarded, since the
    /// stream can no longer be resynchronized.
    pub fn push(&mut self, data: Bytes) -> Result<Vec<Bytes>, FrameError> {
        match self.framing {
            Framing::Message => Ok(vec![data]),
            Framing::LengthPrefixed => {
                self.pending.extend_from_slice(&data);
                let mut frames = Vec::new();
                loop {
                    match self.splitter.decode(&mut self.pending) {
                        Ok(Some(frame)) => frames.push(frame),
                        Ok(None) => break,
                        Err(err) => {
                            self.pending.clear();
                            return Err(err);
                        }
                    }
                }
                Ok(frames)
            }
        }
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }
}
