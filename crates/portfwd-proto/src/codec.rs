//! Frame codec for use with `tokio_util::codec::{FramedRead, FramedWrite}`

use bytes::{Buf, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::frame::{Frame, FrameType, Header};

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("Invalid frame type: {0}")]
    InvalidFrameType(u8),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(u32),

    #[error("Incomplete frame header")]
    IncompleteHeader,
}

/// yamux frame codec
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: u32,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            max_frame_size: crate::MAX_FRAME_SIZE,
        }
    }

    pub fn with_max_frame_size(mut self, max_frame_size: u32) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < Header::SIZE {
            src.reserve(Header::SIZE - src.len());
            return Ok(None);
        }

        let header = Header::decode(&src[..Header::SIZE])?;

        if header.frame_type != FrameType::Data {
            src.advance(Header::SIZE);
            return Ok(Some(Frame {
                header,
                body: bytes::Bytes::new(),
            }));
        }

        if header.length > self.max_frame_size {
            return Err(CodecError::FrameTooLarge(header.length));
        }

        let total = Header::SIZE + header.length as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(Header::SIZE);
        let body = src.split_to(header.length as usize).freeze();

        Ok(Some(Frame { header, body }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let oversized = frame.body.len() > self.max_frame_size as usize;
        if frame.header.frame_type == FrameType::Data && oversized {
            return Err(CodecError::FrameTooLarge(frame.body.len() as u32));
        }

        dst.reserve(Header::SIZE + frame.body.len());
        frame.header.encode(dst);
        dst.extend_from_slice(&frame.body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Flags, GoAwayCode};
    use bytes::Bytes;

    #[test]
    fn test_decode_waits_for_full_body() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(
                Frame::data(1, Flags::new(), Bytes::from_static(b"payload")),
                &mut buf,
            )
            .unwrap();

        let mut partial = buf.split_to(Header::SIZE + 3);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.unsplit(buf);
        let frame = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(frame.body, Bytes::from_static(b"payload"));
        assert!(partial.is_empty());
    }

    #[test]
    fn test_control_frames_have_no_body() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::window_update(3, Flags::new(), 1024), &mut buf)
            .unwrap();
        codec
            .encode(Frame::go_away(GoAwayCode::Normal), &mut buf)
            .unwrap();

        let update = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(update.frame_type(), FrameType::WindowUpdate);
        assert_eq!(update.header.length, 1024);
        assert!(update.body.is_empty());

        let go_away = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(go_away.frame_type(), FrameType::GoAway);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_oversized_data_frame_rejected() {
        let mut codec = FrameCodec::new().with_max_frame_size(4);
        let mut buf = BytesMut::new();
        Header::new(FrameType::Data, Flags::new(), 1, 5).encode(&mut buf);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::FrameTooLarge(5))
        ));
    }
}
