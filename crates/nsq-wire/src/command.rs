// Client-to-broker commands: newline-terminated verbs, optional length-prefixed body.
use bytes::{BufMut, Bytes, BytesMut};

use crate::message::MessageId;

/// Every command the consumer side of the protocol can send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Capability negotiation; body is the identity JSON document.
    Identify(Bytes),
    Sub { topic: String, channel: String },
    Rdy(i64),
    Fin(MessageId),
    Req { id: MessageId, delay_ms: u64 },
    Touch(MessageId),
    Nop,
    Cls,
    Auth(Bytes),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Identify(_) => "IDENTIFY",
            Command::Sub { .. } => "SUB",
            Command::Rdy(_) => "RDY",
            Command::Fin(_) => "FIN",
            Command::Req { .. } => "REQ",
            Command::Touch(_) => "TOUCH",
            Command::Nop => "NOP",
            Command::Cls => "CLS",
            Command::Auth(_) => "AUTH",
        }
    }

    /// Serializes the command to its wire form.
    ///
    /// Body-bearing commands (IDENTIFY, AUTH) append `[u32be len][body]`
    /// after the verb line.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            Command::Identify(body) => {
                buf.extend_from_slice(b"IDENTIFY\n");
                buf.put_u32(body.len() as u32);
                buf.extend_from_slice(body);
            }
            Command::Sub { topic, channel } => {
                buf.extend_from_slice(b"SUB ");
                buf.extend_from_slice(topic.as_bytes());
                buf.put_u8(b' ');
                buf.extend_from_slice(channel.as_bytes());
                buf.put_u8(b'\n');
            }
            Command::Rdy(count) => {
                buf.extend_from_slice(b"RDY ");
                buf.extend_from_slice(count.to_string().as_bytes());
                buf.put_u8(b'\n');
            }
            Command::Fin(id) => {
                buf.extend_from_slice(b"FIN ");
                buf.extend_from_slice(id.as_bytes());
                buf.put_u8(b'\n');
            }
            Command::Req { id, delay_ms } => {
                buf.extend_from_slice(b"REQ ");
                buf.extend_from_slice(id.as_bytes());
                buf.put_u8(b' ');
                buf.extend_from_slice(delay_ms.to_string().as_bytes());
                buf.put_u8(b'\n');
            }
            Command::Touch(id) => {
                buf.extend_from_slice(b"TOUCH ");
                buf.extend_from_slice(id.as_bytes());
                buf.put_u8(b'\n');
            }
            Command::Nop => buf.extend_from_slice(b"NOP\n"),
            Command::Cls => buf.extend_from_slice(b"CLS\n"),
            Command::Auth(secret) => {
                buf.extend_from_slice(b"AUTH\n");
                buf.put_u32(secret.len() as u32);
                buf.extend_from_slice(secret);
            }
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(32);
        self.encode_into(&mut buf);
        buf.freeze()
    }
}

/// Validates a topic or channel name.
///
/// Accepts 1..=64 characters drawn from `[.a-zA-Z0-9_-]`, with an optional
/// `#ephemeral` suffix counted against the length limit.
pub fn is_valid_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 64 {
        return false;
    }
    let base = name.strip_suffix("#ephemeral").unwrap_or(name);
    !base.is_empty()
        && base
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(text: &[u8; 16]) -> MessageId {
        MessageId(*text)
    }

    #[test]
    fn sub_encoding() {
        let cmd = Command::Sub {
            topic: "events".into(),
            channel: "archive".into(),
        };
        assert_eq!(cmd.encode().as_ref(), b"SUB events archive\n");
    }

    #[test]
    fn rdy_encoding() {
        assert_eq!(Command::Rdy(0).encode().as_ref(), b"RDY 0\n");
        assert_eq!(Command::Rdy(2500).encode().as_ref(), b"RDY 2500\n");
    }

    #[test]
    fn ack_encodings() {
        let mid = id(b"0123456789abcdef");
        assert_eq!(Command::Fin(mid).encode().as_ref(), b"FIN 0123456789abcdef\n");
        assert_eq!(
            Command::Req { id: mid, delay_ms: 1500 }.encode().as_ref(),
            b"REQ 0123456789abcdef 1500\n"
        );
        assert_eq!(
            Command::Touch(mid).encode().as_ref(),
            b"TOUCH 0123456789abcdef\n"
        );
    }

    #[test]
    fn bare_verbs() {
        assert_eq!(Command::Nop.encode().as_ref(), b"NOP\n");
        assert_eq!(Command::Cls.encode().as_ref(), b"CLS\n");
    }

    #[test]
    fn identify_carries_length_prefixed_body() {
        let body = Bytes::from_static(b"{\"client_id\":\"c\"}");
        let encoded = Command::Identify(body.clone()).encode();
        assert_eq!(&encoded[..9], b"IDENTIFY\n");
        assert_eq!(&encoded[9..13], &(body.len() as u32).to_be_bytes());
        assert_eq!(&encoded[13..], body.as_ref());
    }

    #[test]
    fn auth_carries_length_prefixed_secret() {
        let encoded = Command::Auth(Bytes::from_static(b"secret")).encode();
        assert_eq!(&encoded[..5], b"AUTH\n");
        assert_eq!(&encoded[5..9], &6u32.to_be_bytes());
        assert_eq!(&encoded[9..], b"secret");
    }

    #[test]
    fn name_validation() {
        assert!(is_valid_name("orders"));
        assert!(is_valid_name("orders.v2_live-a"));
        assert!(is_valid_name("orders#ephemeral"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("#ephemeral"));
        assert!(!is_valid_name("bad topic"));
        assert!(!is_valid_name("bad/topic"));
        assert!(!is_valid_name(&"x".repeat(65)));
        assert!(is_valid_name(&"x".repeat(64)));
    }
}
