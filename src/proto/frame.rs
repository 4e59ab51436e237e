use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::CodecError;

/// Maximum size of a single frame, the length prefix included. Frames
/// declaring more than this terminate the channel.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

const PREFIX_SIZE: usize = 4;

/// Length-prefixed frame codec.
///
/// The little-endian `u32` prefix counts the whole frame, its own four
/// bytes included; the decoder strips it, the encoder prepends it.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>, CodecError> {
        if src.len() < PREFIX_SIZE {
            return Ok(None)
        }

        let declared = u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if declared < PREFIX_SIZE {
            return Err(CodecError::InvalidLength(declared))
        }
        if declared > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(declared))
        }

        if src.len() < declared {
            src.reserve(declared - src.len());
            return Ok(None)
        }

        src.advance(PREFIX_SIZE);
        Ok(Some(src.split_to(declared - PREFIX_SIZE)))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), CodecError> {
        let total = item.len() + PREFIX_SIZE;
        if total > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(total))
        }

        dst.reserve(total);
        dst.put_u32_le(total as u32);
        dst.put_slice(&item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_frame() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec.encode(Bytes::from_static(b"hello frames"), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&decoded[..], b"hello frames");
        assert!(buf.is_empty());
    }

    #[test]
    fn waits_for_a_complete_frame() {
        let mut codec = FrameCodec;
        let mut encoded = BytesMut::new();
        codec.encode(Bytes::from_static(b"split across reads"), &mut encoded).unwrap();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encoded[..3]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&encoded[3..10]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&encoded[10..]);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&decoded[..], b"split across reads");
    }

    #[test]
    fn decodes_back_to_back_frames() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec.encode(Bytes::from_static(b"one"), &mut buf).unwrap();
        codec.encode(Bytes::from_static(b"two"), &mut buf).unwrap();

        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"one");
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"two");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn rejects_an_oversize_frame() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        buf.put_u32_le((MAX_FRAME_SIZE + 1) as u32);
        assert!(matches!(codec.decode(&mut buf), Err(CodecError::FrameTooLarge(_))));
    }

    #[test]
    fn rejects_a_length_below_the_prefix() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        buf.put_u32_le(3);
        assert!(matches!(codec.decode(&mut buf), Err(CodecError::InvalidLength(3))));
    }
}
