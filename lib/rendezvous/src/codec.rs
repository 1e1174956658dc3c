// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Frame Codec
//!
//! Every message exchanged between the coordinator and its peers is a single frame:
//!
//! - length: u32 (big-endian), the size of the *whole* frame including these 4 bytes
//! - payload: `length - 4` opaque bytes
//!
//! The self-inclusive length is what independently built peers expect on the wire,
//! so it must not be changed to a payload-only length.
//!
//! [`FrameCodec`] is the async codec used by the reactor and [`crate::client`];
//! [`read_frame`] and [`write_frame`] serve peers that talk over blocking std streams.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::{Read, Write};
use tokio_util::codec::{Decoder, Encoder};

/// Size of the length field that prefixes every frame.
pub const LENGTH_FIELD_SIZE: usize = 4;

/// Default upper bound on a single frame (length field included).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Errors raised while encoding or decoding frames.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The stream closed in the middle of a frame.
    #[error("stream closed mid-frame: expected {expected} bytes, received {received}")]
    Truncated {
        /// Total frame size announced by the length field (or the length field itself).
        expected: usize,
        /// Bytes that actually arrived before the stream closed.
        received: usize,
    },

    /// The length field is smaller than the length field itself.
    #[error("invalid frame length {0}: must be at least {LENGTH_FIELD_SIZE}")]
    InvalidLength(usize),

    /// The frame exceeds the configured maximum size.
    #[error("frame too large: {size} bytes (max: {max} bytes)")]
    TooLarge {
        /// Total frame size, length field included.
        size: usize,
        /// Configured limit.
        max: usize,
    },

    /// Underlying transport error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Codec for length-prefixed frames with a self-inclusive length field.
///
/// Decoding yields the payload only; encoding takes the payload and prepends
/// `payload.len() + 4`.
#[derive(Debug, Clone, Default)]
pub struct FrameCodec {
    max_frame_size: Option<usize>,
}

impl FrameCodec {
    /// Create a codec, optionally enforcing a maximum frame size.
    pub fn new(max_frame_size: Option<usize>) -> Self {
        Self { max_frame_size }
    }

    fn check_size(&self, total_len: usize) -> Result<(), FrameError> {
        if let Some(max) = self.max_frame_size {
            if total_len > max {
                return Err(FrameError::TooLarge {
                    size: total_len,
                    max,
                });
            }
        }
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_FIELD_SIZE {
            return Ok(None);
        }

        // Peek at the frame length without consuming
        let total_len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if total_len < LENGTH_FIELD_SIZE {
            return Err(FrameError::InvalidLength(total_len));
        }
        self.check_size(total_len)?;

        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_FIELD_SIZE);
        Ok(Some(src.split_to(total_len - LENGTH_FIELD_SIZE).freeze()))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None if buf.is_empty() => Ok(None),
            None => {
                let expected = if buf.len() < LENGTH_FIELD_SIZE {
                    LENGTH_FIELD_SIZE
                } else {
                    u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize
                };
                Err(FrameError::Truncated {
                    expected,
                    received: buf.len(),
                })
            }
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let total_len = frame_len(payload.len())?;
        self.check_size(total_len)?;

        dst.reserve(total_len);
        dst.put_u32(total_len as u32);
        dst.put_slice(&payload);
        Ok(())
    }
}

fn frame_len(payload_len: usize) -> Result<usize, FrameError> {
    let total_len = payload_len + LENGTH_FIELD_SIZE;
    if total_len > u32::MAX as usize {
        return Err(FrameError::TooLarge {
            size: total_len,
            max: u32::MAX as usize,
        });
    }
    Ok(total_len)
}

/// Encode a single payload into a standalone frame.
pub fn encode_frame(payload: &[u8]) -> Result<Bytes, FrameError> {
    let total_len = frame_len(payload.len())?;
    let mut buf = BytesMut::with_capacity(total_len);
    buf.put_u32(total_len as u32);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Write one frame to a blocking writer.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError> {
    let frame = encode_frame(payload)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame from a blocking reader.
///
/// Returns `Ok(None)` when the stream ends cleanly on a frame boundary and
/// [`FrameError::Truncated`] when it ends anywhere else.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Bytes>, FrameError> {
    let mut len_buf = [0u8; LENGTH_FIELD_SIZE];
    let read = read_full(reader, &mut len_buf)?;
    if read == 0 {
        return Ok(None);
    }
    if read < LENGTH_FIELD_SIZE {
        return Err(FrameError::Truncated {
            expected: LENGTH_FIELD_SIZE,
            received: read,
        });
    }

    let total_len = u32::from_be_bytes(len_buf) as usize;
    if total_len < LENGTH_FIELD_SIZE {
        return Err(FrameError::InvalidLength(total_len));
    }

    let mut payload = vec![0u8; total_len - LENGTH_FIELD_SIZE];
    let read = read_full(reader, &mut payload)?;
    if read < payload.len() {
        return Err(FrameError::Truncated {
            expected: total_len,
            received: LENGTH_FIELD_SIZE + read,
        });
    }
    Ok(Some(Bytes::from(payload)))
}

/// Like `read_exact`, but reports how much was read before EOF instead of failing.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
