// Frame layer: length-prefixed, typed frames on the broker byte stream.
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{Result, WireError};

/// Protocol magic written once after connecting, before any frames.
pub const MAGIC_V2: &[u8; 4] = b"  V2";

/// Size of the two length/type words that precede every payload.
pub const FRAME_HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Response = 0,
    Error = 1,
    Message = 2,
}

impl FrameType {
    pub fn from_wire(raw: u32) -> Result<Self> {
        match raw {
            0 => Ok(FrameType::Response),
            1 => Ok(FrameType::Error),
            2 => Ok(FrameType::Message),
            other => Err(WireError::UnknownFrameType(other)),
        }
    }
}

/// One frame as it appears on the wire.
///
/// ```
/// use bytes::Bytes;
/// use nsq_wire::{Frame, FrameType};
///
/// let frame = Frame::new(FrameType::Response, Bytes::from_static(b"OK"));
/// let encoded = frame.encode();
/// let decoded = Frame::decode(encoded).expect("decode");
/// assert_eq!(decoded.frame_type, FrameType::Response);
/// assert_eq!(decoded.payload, Bytes::from_static(b"OK"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(frame_type: FrameType, payload: Bytes) -> Self {
        Self { frame_type, payload }
    }

    /// Encodes `[u32be size][u32be type][payload]`; size covers the type word.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + self.payload.len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u32((4 + self.payload.len()) as u32);
        buf.put_u32(self.frame_type as u32);
        buf.extend_from_slice(&self.payload);
    }

    /// Decodes a frame from a buffer that starts with the size prefix.
    pub fn decode(mut input: Bytes) -> Result<Self> {
        if input.remaining() < FRAME_HEADER_LEN {
            return Err(WireError::Incomplete);
        }
        let size = input.get_u32() as usize;
        if size < 4 {
            return Err(WireError::ShortFrame(size));
        }
        let frame_type = FrameType::from_wire(input.get_u32())?;
        let body_len = size - 4;
        if input.remaining() < body_len {
            return Err(WireError::Incomplete);
        }
        let payload = input.slice(0..body_len);
        Ok(Self { frame_type, payload })
    }
}
