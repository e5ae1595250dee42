//! Length-prefixed frame codec for the check-in stream.
//!
//! Each frame is a 4-byte big-endian length prefix followed by a JSON
//! payload:
//!
//! ```text
//! +----------------------+------------------+
//! | length (4 bytes, BE) | JSON payload     |
//! +----------------------+------------------+
//! ```
//!
//! The length is validated before any allocation; oversized frames are
//! rejected with [`WireError::FrameTooLarge`].

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::WireError;
use crate::frames::Frame;

/// Default maximum frame size (2 MiB). Unit configuration payloads are the
/// largest thing that travels in a frame.
pub const MAX_FRAME_SIZE: usize = 2 * 1024 * 1024;

const HEADER_LEN: usize = 4;

/// Codec used with [`tokio_util::codec::Framed`] on both ends of the
/// check-in stream.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Codec with a custom frame size cap, used by tests.
    pub fn with_max_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, WireError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&src[..HEADER_LEN]);
        let len = u32::from_be_bytes(header) as usize;

        if len > self.max_frame_size {
            return Err(WireError::FrameTooLarge {
                len,
                max: self.max_frame_size,
            });
        }

        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(len);
        let frame = serde_json::from_slice(&payload)?;
        Ok(Some(frame))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = WireError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), WireError> {
        let payload = serde_json::to_vec(&frame)?;
        if payload.len() > self.max_frame_size {
            return Err(WireError::FrameTooLarge {
                len: payload.len(),
                max: self.max_frame_size,
            });
        }

        dst.reserve(HEADER_LEN + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::Hello;

    #[test]
    fn encode_decode_round_trip() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        let frame = Frame::Hello(Hello {
            token: "tok-123".to_string(),
        });
        codec.encode(frame, &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        match decoded {
            Frame::Hello(hello) => assert_eq!(hello.token, "tok-123"),
            other => panic!("unexpected frame: {other:?}"),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_waits_for_partial_frames() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        let frame = Frame::Hello(Hello {
            token: "tok".to_string(),
        });
        let mut full = BytesMut::new();
        codec.encode(frame, &mut full).unwrap();

        // Feed one byte at a time; decode must return None until complete.
        for byte in &full[..full.len() - 1] {
            buf.put_u8(*byte);
            assert!(codec.decode(&mut buf).unwrap().is_none());
        }
        buf.put_u8(full[full.len() - 1]);
        assert!(codec.decode(&mut buf).unwrap().is_some());
    }

    #[test]
    fn decode_rejects_oversized_frames() {
        let mut codec = FrameCodec::with_max_size(16);
        let mut buf = BytesMut::new();
        buf.put_u32(64);
        buf.extend_from_slice(&[0u8; 64]);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(WireError::FrameTooLarge { len: 64, max: 16 })
        ));
    }
}
