use anyhow::bail;
use bytes::{Bytes, BytesMut};
use uuid::Uuid;

use crate::util::buf::{put_nul_joined, split_nul, try_get_string};

/// A user-addressed chat message. The `message_id` is generated once by the originating client
///  and travels unchanged through every node, which use it to suppress duplicates.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ChatMessage {
    pub message_id: String,
    pub sender: String,
    pub receiver: String,
    pub content: String,
}

impl ChatMessage {
    const NUM_FIELDS: usize = 4;

    pub fn new(sender: &str, receiver: &str, content: &str) -> ChatMessage {
        ChatMessage {
            message_id: Uuid::new_v4().to_string(),
            sender: sender.to_string(),
            receiver: receiver.to_string(),
            content: content.to_string(),
        }
    }

    pub fn to_payload(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_nul_joined(&mut buf, [&self.message_id, &self.sender, &self.receiver, &self.content]);
        buf.freeze()
    }

    /// The content may itself contain NUL bytes, only the first three separators are significant
    pub fn parse(payload: &[u8]) -> anyhow::Result<ChatMessage> {
        let fields = split_nul(payload, Self::NUM_FIELDS);
        if fields.len() < Self::NUM_FIELDS {
            bail!("chat message has {} fields, expected {}", fields.len(), Self::NUM_FIELDS);
        }

        Ok(ChatMessage {
            message_id: try_get_string(fields[0])?,
            sender: try_get_string(fields[1])?,
            receiver: try_get_string(fields[2])?,
            content: try_get_string(fields[3])?,
        })
    }

    /// the text a receiving user sees
    pub fn delivery_text(&self) -> String {
        format!("{}: {}", self.sender, self.content)
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;
    use super::*;

    fn msg(id: &str, sender: &str, receiver: &str, content: &str) -> ChatMessage {
        ChatMessage {
            message_id: id.to_string(),
            sender: sender.to_string(),
            receiver: receiver.to_string(),
            content: content.to_string(),
        }
    }

    #[rstest]
    #[case::simple(b"id1\0bob\0alice\0hi there", Some(msg("id1", "bob", "alice", "hi there")))]
    #[case::empty_content(b"id1\0bob\0alice\0", Some(msg("id1", "bob", "alice", "")))]
    #[case::nul_in_content(b"id1\0bob\0alice\0a\0b", Some(msg("id1", "bob", "alice", "a\0b")))]
    #[case::three_fields(b"id1\0bob\0alice", None)]
    #[case::empty(b"", None)]
    #[case::invalid_utf8(b"id1\0\xff\0alice\0x", None)]
    fn test_parse(#[case] payload: &[u8], #[case] expected: Option<ChatMessage>) {
        match ChatMessage::parse(payload) {
            Ok(actual) => assert_eq!(actual, expected.unwrap()),
            Err(_) => assert!(expected.is_none()),
        }
    }

    #[test]
    fn test_to_payload() {
        let m = msg("7f3a", "bob", "alice", "hello");
        assert_eq!(&m.to_payload()[..], b"7f3a\0bob\0alice\0hello");
        assert_eq!(ChatMessage::parse(&m.to_payload()).unwrap(), m);
    }

    #[test]
    fn test_new_generates_distinct_ids() {
        let a = ChatMessage::new("bob", "alice", "x");
        let b = ChatMessage::new("bob", "alice", "x");
        assert_ne!(a.message_id, b.message_id);
        assert!(Uuid::parse_str(&a.message_id).is_ok());
    }

    #[test]
    fn test_delivery_text() {
        assert_eq!(msg("1", "bob", "alice", "hello").delivery_text(), "bob: hello");
    }
}
