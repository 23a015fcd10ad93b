//! Incremental frame assembly for byte streams
//!
//! Transports deliver arbitrary chunks: a BLE notification may hold half a
//! frame, a UART read may hold three. [`FrameCodec`] implements the
//! `tokio_util` codec traits so those chunks can be fed into a `BytesMut`
//! and drained frame by frame.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use super::{Command, Frame, FrameCodec, ProtocolError};

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        let magic = self.profile().header;

        // Skip line noise up to the next frame magic
        match src.windows(2).position(|w| w == magic) {
            Some(0) => {}
            Some(skip) => {
                trace!("Skipping {} bytes before frame magic", skip);
                src.advance(skip);
            }
            None => {
                // A lone first magic byte at the end may start the next frame
                let keep = usize::from(src.last() == Some(&magic[0]));
                src.advance(src.len() - keep);
                return Ok(None);
            }
        }

        let total = match self.frame_len(src) {
            Ok(Some(total)) => total,
            Ok(None) => return Ok(None),
            Err(err) => {
                // Drop the false magic so the next call makes progress
                src.advance(2);
                return Err(err.into());
            }
        };
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let bytes = src.split_to(total);
        Ok(Some(FrameCodec::decode(self, &bytes)?))
    }
}

impl Encoder<Command> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, command: Command, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let bytes = FrameCodec::encode(self, &command)?;
        dst.reserve(bytes.len());
        dst.put_slice(&bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{DecodeError, Opcode};
    use pretty_assertions::assert_eq;

    fn info_frame(codec: &FrameCodec, count: u16) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&count.to_le_bytes());
        payload.extend_from_slice(&[1, 0, 9, 0, 0, 0, 0, 0]);
        codec.encode_frame(Opcode::ReturnInfo, &payload).unwrap()
    }

    #[test]
    fn test_split_chunks_assemble() {
        let mut codec = FrameCodec::default();
        let bytes = info_frame(&codec, 2);
        let mut buf = BytesMut::new();

        buf.extend_from_slice(&bytes[..4]);
        assert_eq!(Decoder::decode(&mut codec, &mut buf).unwrap(), None);

        buf.extend_from_slice(&bytes[4..]);
        let frame = Decoder::decode(&mut codec, &mut buf).unwrap().unwrap();
        assert_eq!(frame.kind, Opcode::ReturnInfo);
        assert_eq!(frame.field(0), Some(2));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_resync_after_noise() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&[0x00, 0x13, 0x55][..]);
        assert_eq!(Decoder::decode(&mut codec, &mut buf).unwrap(), None);
        assert_eq!(&buf[..], &[0x55]);

        let knock_ok = codec.encode_frame(Opcode::ReturnOk, &[]).unwrap();
        buf.clear();
        buf.extend_from_slice(&[0xDE, 0xAD]);
        buf.extend_from_slice(&knock_ok);
        let frame = Decoder::decode(&mut codec, &mut buf).unwrap().unwrap();
        assert_eq!(frame.kind, Opcode::ReturnOk);
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&info_frame(&codec, 0));
        buf.extend_from_slice(&codec.encode_frame(Opcode::ReturnOk, &[]).unwrap());

        let first = Decoder::decode(&mut codec, &mut buf).unwrap().unwrap();
        let second = Decoder::decode(&mut codec, &mut buf).unwrap().unwrap();
        assert_eq!(first.kind, Opcode::ReturnInfo);
        assert_eq!(second.kind, Opcode::ReturnOk);
        assert_eq!(Decoder::decode(&mut codec, &mut buf).unwrap(), None);
    }

    #[test]
    fn test_corrupt_frame_is_consumed_and_reported() {
        let mut codec = FrameCodec::default();
        let mut bytes = info_frame(&codec, 1);
        bytes[6] ^= 0x01;
        let mut buf = BytesMut::from(&bytes[..]);

        let err = Decoder::decode(&mut codec, &mut buf).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Decode(DecodeError::ChecksumMismatch { .. })
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_wrong_address_makes_progress() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&[0x55, 0xAA, 0x12, 0x00, 0x2E, 0x3F][..]);

        let err = Decoder::decode(&mut codec, &mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::Decode(DecodeError::BadHeader)));
        assert_eq!(buf.len(), 4);
    }

    #[test]
    fn test_encoder_writes_frame() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        Encoder::encode(&mut codec, Command::Request, &mut buf).unwrap();
        assert_eq!(&buf[..], &[0x55, 0xAA, 0x11, 0x00, 0x20, 0x30]);
    }
}
