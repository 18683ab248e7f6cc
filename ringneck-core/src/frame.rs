//! Wire frames — the atomic unit of the client/supervisor protocol.
//!
//! ```text
//! <1-byte tag> <4-byte big-endian payload length> <payload>
//! ```
//!
//! KEEP_ALIVE is the one exception: it is a bare tag byte with no length
//! and no payload. EXIT carries exactly one status byte.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::RingneckError;

/// Size of the tag + length header for payload-bearing frames.
pub const HEADER_SIZE: usize = 5;

/// Upper bound the decoder accepts for a single declared payload.
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024 * 1024;

/// Chunk size at which senders split large logical writes into
/// consecutive frames of the same kind.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Frame kind, as encoded in the wire tag byte.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// Session opener: carries a bincoded [`Request`](crate::Request).
    Invoke = 0x01,
    /// Bytes from the client's stdin. Empty payload marks end of stdin.
    Stdin = 0x02,
    /// Bytes from the child's stdout.
    Stdout = 0x03,
    /// Bytes from the child's stderr.
    Stderr = 0x04,
    /// Terminal frame carrying the child's exit status byte.
    Exit = 0x05,
    /// Liveness signal; never stored, never surfaced past the codec.
    KeepAlive = 0x06,
}

impl FrameKind {
    pub fn tag(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for FrameKind {
    type Error = RingneckError;

    fn try_from(tag: u8) -> Result<Self, RingneckError> {
        match tag {
            0x01 => Ok(FrameKind::Invoke),
            0x02 => Ok(FrameKind::Stdin),
            0x03 => Ok(FrameKind::Stdout),
            0x04 => Ok(FrameKind::Stderr),
            0x05 => Ok(FrameKind::Exit),
            0x06 => Ok(FrameKind::KeepAlive),
            other => Err(RingneckError::UnknownTag(other)),
        }
    }
}

/// One decoded protocol frame.
///
/// Payloads are [`Bytes`] so frames can be mirrored to the client and
/// appended to a staging buffer without copying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    kind: FrameKind,
    payload: Bytes,
}

impl Frame {
    /// Assemble a frame from already-validated parts (decoder use).
    pub(crate) fn from_parts(kind: FrameKind, payload: Bytes) -> Self {
        Self { kind, payload }
    }

    pub fn invoke(payload: impl Into<Bytes>) -> Self {
        Self {
            kind: FrameKind::Invoke,
            payload: payload.into(),
        }
    }

    pub fn stdin(payload: impl Into<Bytes>) -> Self {
        Self {
            kind: FrameKind::Stdin,
            payload: payload.into(),
        }
    }

    /// Empty STDIN frame, understood by the supervisor as end of stdin.
    pub fn stdin_eof() -> Self {
        Self::stdin(Bytes::new())
    }

    pub fn stdout(payload: impl Into<Bytes>) -> Self {
        Self {
            kind: FrameKind::Stdout,
            payload: payload.into(),
        }
    }

    pub fn stderr(payload: impl Into<Bytes>) -> Self {
        Self {
            kind: FrameKind::Stderr,
            payload: payload.into(),
        }
    }

    /// Terminal frame. The payload is exactly one status byte.
    pub fn exit(status: u8) -> Self {
        Self {
            kind: FrameKind::Exit,
            payload: Bytes::copy_from_slice(&[status]),
        }
    }

    pub fn keep_alive() -> Self {
        Self {
            kind: FrameKind::KeepAlive,
            payload: Bytes::new(),
        }
    }

    /// Split one logical write into consecutive frames of `kind`, each
    /// holding at most [`CHUNK_SIZE`] bytes.
    pub fn chunked(kind: FrameKind, mut data: Bytes) -> Vec<Frame> {
        if data.len() <= CHUNK_SIZE {
            return vec![Frame {
                kind,
                payload: data,
            }];
        }
        let mut frames = Vec::with_capacity(data.len().div_ceil(CHUNK_SIZE));
        while data.len() > CHUNK_SIZE {
            frames.push(Frame {
                kind,
                payload: data.split_to(CHUNK_SIZE),
            });
        }
        frames.push(Frame {
            kind,
            payload: data,
        });
        frames
    }

    // ── Accessors ────────────────────────────────────────────────

    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// The status byte, if this is an EXIT frame.
    pub fn exit_status(&self) -> Option<u8> {
        if self.kind == FrameKind::Exit {
            self.payload.first().copied()
        } else {
            None
        }
    }

    // ── Serialization ────────────────────────────────────────────

    /// Number of bytes this frame occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        if self.kind == FrameKind::KeepAlive {
            1
        } else {
            HEADER_SIZE + self.payload.len()
        }
    }

    /// Append the wire representation to `dst`.
    pub fn encode_into(&self, dst: &mut BytesMut) -> Result<(), RingneckError> {
        dst.reserve(self.encoded_len());
        dst.put_u8(self.kind.tag());
        if self.kind == FrameKind::KeepAlive {
            return Ok(());
        }
        let len = u32::try_from(self.payload.len()).map_err(|_| RingneckError::FrameTooLarge {
            size: self.payload.len(),
            max: u32::MAX as usize,
        })?;
        dst.put_u32(len);
        dst.extend_from_slice(&self.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_carries_one_byte() {
        let f = Frame::exit(7);
        assert_eq!(f.payload(), &[7]);
        assert_eq!(f.exit_status(), Some(7));
        assert_eq!(Frame::stdout(vec![7]).exit_status(), None);
    }

    #[test]
    fn keep_alive_is_bare_tag() {
        let f = Frame::keep_alive();
        let mut buf = BytesMut::new();
        f.encode_into(&mut buf).unwrap();
        assert_eq!(&buf[..], &[FrameKind::KeepAlive.tag()]);
    }

    #[test]
    fn empty_payload_encodes_header_only() {
        let mut buf = BytesMut::new();
        Frame::stdout(Bytes::new()).encode_into(&mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_SIZE);
        assert_eq!(buf[0], FrameKind::Stdout.tag());
        assert_eq!(&buf[1..5], &[0, 0, 0, 0]);
    }

    #[test]
    fn length_is_big_endian() {
        let mut buf = BytesMut::new();
        Frame::stderr(vec![0u8; 0x0102]).encode_into(&mut buf).unwrap();
        assert_eq!(&buf[1..5], &[0x00, 0x00, 0x01, 0x02]);
    }

    #[test]
    fn unknown_tag_rejected() {
        assert!(matches!(
            FrameKind::try_from(0x4f),
            Err(RingneckError::UnknownTag(0x4f))
        ));
    }

    #[test]
    fn chunking_splits_and_preserves_bytes() {
        let data: Vec<u8> = (0..CHUNK_SIZE * 2 + 10).map(|i| i as u8).collect();
        let frames = Frame::chunked(FrameKind::Stdout, Bytes::from(data.clone()));
        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|f| f.kind() == FrameKind::Stdout));
        let glued: Vec<u8> = frames.iter().flat_map(|f| f.payload().to_vec()).collect();
        assert_eq!(glued, data);
    }
}
