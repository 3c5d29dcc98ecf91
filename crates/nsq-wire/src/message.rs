// Message frame payload: timestamp, attempts, id, body.
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

use crate::{Result, WireError};

pub const MSG_ID_LEN: usize = 16;

/// Fixed prefix before the message body: i64 timestamp, u16 attempts, 16-byte id.
pub const MSG_HEADER_LEN: usize = 8 + 2 + MSG_ID_LEN;

/// Opaque 16-byte message identifier, printable ASCII in practice.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId(pub [u8; MSG_ID_LEN]);

impl MessageId {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in &self.0 {
            let c = if b.is_ascii_graphic() { b as char } else { '.' };
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({self})")
    }
}

/// A decoded message frame payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    /// Broker-side produce time, nanoseconds since the unix epoch.
    pub timestamp_ns: i64,
    /// Delivery attempts so far, starting at 1.
    pub attempts: u16,
    pub id: MessageId,
    pub body: Bytes,
}

impl WireMessage {
    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < MSG_HEADER_LEN {
            return Err(WireError::ShortMessage(payload.remaining()));
        }
        let timestamp_ns = payload.get_i64();
        let attempts = payload.get_u16();
        let mut id = [0u8; MSG_ID_LEN];
        payload.copy_to_slice(&mut id);
        Ok(Self {
            timestamp_ns,
            attempts,
            id: MessageId(id),
            body: payload,
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(MSG_HEADER_LEN + self.body.len());
        buf.put_i64(self.timestamp_ns);
        buf.put_u16(self.attempts);
        buf.extend_from_slice(&self.id.0);
        buf.extend_from_slice(&self.body);
        buf.freeze()
    }
}
