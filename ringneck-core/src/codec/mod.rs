//! Wire codec — Decoder / Encoder for `tokio_util::codec::Framed`.
//!
//! The decoder is a pure byte transformation: it reassembles frames
//! whose header or payload is split across any number of input chunks,
//! swallows KEEP_ALIVE tags, and fails fast on an unknown tag. A stream
//! that ends mid-frame surfaces as an unexpected-EOF error through
//! `decode_eof`.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::RingneckError;
use crate::frame::{Frame, FrameKind, HEADER_SIZE, MAX_PAYLOAD_SIZE};

/// Stateless codec for ringneck frames.
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = RingneckError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(&tag) = src.first() else {
                return Ok(None);
            };

            let kind = FrameKind::try_from(tag)?;

            // Liveness signals are consumed here and never yielded.
            if kind == FrameKind::KeepAlive {
                src.advance(1);
                continue;
            }

            if src.len() < HEADER_SIZE {
                return Ok(None);
            }

            let mut len_bytes = [0u8; 4];
            len_bytes.copy_from_slice(&src[1..HEADER_SIZE]);
            let payload_len = u32::from_be_bytes(len_bytes) as usize;

            if payload_len > MAX_PAYLOAD_SIZE {
                return Err(RingneckError::FrameTooLarge {
                    size: payload_len,
                    max: MAX_PAYLOAD_SIZE,
                });
            }

            let total = HEADER_SIZE + payload_len;
            if src.len() < total {
                src.reserve(total - src.len());
                return Ok(None);
            }

            let mut frame = src.split_to(total);
            frame.advance(HEADER_SIZE);
            let payload = frame.freeze();

            if kind == FrameKind::Exit && payload.len() != 1 {
                return Err(RingneckError::ProtocolViolation(
                    "exit frame must carry exactly one status byte",
                ));
            }

            return Ok(Some(Frame::from_parts(kind, payload)));
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(RingneckError::UnexpectedEof),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = RingneckError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode_into(dst)
    }
}
