//! yamux frame primitives
//!
//! Every frame starts with a 12 byte big-endian header:
//!
//! ```text
//! | version (1) | type (1) | flags (2) | stream id (4) | length (4) |
//! ```
//!
//! Only `Data` frames carry a body (`length` bytes). For the other types the
//! length field holds a value: the window delta, the ping opaque value or the
//! go away code.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::CodecError;

/// Stream identifier
pub type StreamId = u32;

/// Frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Data = 0,
    WindowUpdate = 1,
    Ping = 2,
    GoAway = 3,
}

impl TryFrom<u8> for FrameType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameType::Data),
            1 => Ok(FrameType::WindowUpdate),
            2 => Ok(FrameType::Ping),
            3 => Ok(FrameType::GoAway),
            _ => Err(CodecError::InvalidFrameType(value)),
        }
    }
}

/// Frame flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags(u16);

impl Flags {
    pub const SYN: u16 = 0x1;
    pub const ACK: u16 = 0x2;
    pub const FIN: u16 = 0x4;
    pub const RST: u16 = 0x8;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_syn(mut self) -> Self {
        self.0 |= Self::SYN;
        self
    }

    pub fn with_ack(mut self) -> Self {
        self.0 |= Self::ACK;
        self
    }

    pub fn with_fin(mut self) -> Self {
        self.0 |= Self::FIN;
        self
    }

    pub fn with_rst(mut self) -> Self {
        self.0 |= Self::RST;
        self
    }

    pub fn has_syn(&self) -> bool {
        self.0 & Self::SYN != 0
    }

    pub fn has_ack(&self) -> bool {
        self.0 & Self::ACK != 0
    }

    pub fn has_fin(&self) -> bool {
        self.0 & Self::FIN != 0
    }

    pub fn has_rst(&self) -> bool {
        self.0 & Self::RST != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn bits(&self) -> u16 {
        self.0
    }

    pub fn from_bits(value: u16) -> Self {
        Self(value)
    }
}

/// Reason carried by a go away frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum GoAwayCode {
    Normal = 0,
    ProtocolError = 1,
    InternalError = 2,
}

impl GoAwayCode {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(GoAwayCode::Normal),
            1 => Some(GoAwayCode::ProtocolError),
            2 => Some(GoAwayCode::InternalError),
            _ => None,
        }
    }
}

/// Frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub frame_type: FrameType,
    pub flags: Flags,
    pub stream_id: StreamId,
    pub length: u32,
}

impl Header {
    /// version (1) + type (1) + flags (2) + stream_id (4) + length (4)
    pub const SIZE: usize = 12;

    pub fn new(frame_type: FrameType, flags: Flags, stream_id: StreamId, length: u32) -> Self {
        Self {
            version: crate::PROTOCOL_VERSION,
            frame_type,
            flags,
            stream_id,
            length,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(Self::SIZE);
        buf.put_u8(self.version);
        buf.put_u8(self.frame_type as u8);
        buf.put_u16(self.flags.bits());
        buf.put_u32(self.stream_id);
        buf.put_u32(self.length);
    }

    /// Decode a header from the first [`Header::SIZE`] bytes of `buf`
    pub fn decode(mut buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < Self::SIZE {
            return Err(CodecError::IncompleteHeader);
        }

        let version = buf.get_u8();
        if version != crate::PROTOCOL_VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }

        let frame_type = FrameType::try_from(buf.get_u8())?;
        let flags = Flags::from_bits(buf.get_u16());
        let stream_id = buf.get_u32();
        let length = buf.get_u32();

        Ok(Self {
            version,
            frame_type,
            flags,
            stream_id,
            length,
        })
    }
}

/// A complete frame: header plus the body of data frames
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub body: Bytes,
}

impl Frame {
    pub fn data(stream_id: StreamId, flags: Flags, body: Bytes) -> Self {
        Self {
            header: Header::new(FrameType::Data, flags, stream_id, body.len() as u32),
            body,
        }
    }

    pub fn window_update(stream_id: StreamId, flags: Flags, delta: u32) -> Self {
        Self {
            header: Header::new(FrameType::WindowUpdate, flags, stream_id, delta),
            body: Bytes::new(),
        }
    }

    pub fn ping(flags: Flags, opaque: u32) -> Self {
        Self {
            header: Header::new(FrameType::Ping, flags, crate::SESSION_STREAM_ID, opaque),
            body: Bytes::new(),
        }
    }

    pub fn go_away(code: GoAwayCode) -> Self {
        Self {
            header: Header::new(
                FrameType::GoAway,
                Flags::new(),
                crate::SESSION_STREAM_ID,
                code as u32,
            ),
            body: Bytes::new(),
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.header.stream_id
    }

    pub fn frame_type(&self) -> FrameType {
        self.header.frame_type
    }

    pub fn flags(&self) -> Flags {
        self.header.flags
    }
}
