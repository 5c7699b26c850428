use std::fmt::{Debug, Formatter};

use anyhow::{bail, Context};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::messaging::chat_message::ChatMessage;
use crate::util::buf::put_nul_joined;

/// The message kinds defined by the wire protocol. The type byte is kept raw in [Envelope] so
///  that envelopes with unknown types still frame correctly and can be skipped.
#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum MessageType {
    DirectoryRequest = 0,
    /// both the reply to a directory request and the announcement of a peer node's port
    DirectoryResponse = 1,
    Identify = 2,
    Chat = 3,
    Echo = 4,
    Disconnect = 5,
}

pub const SUBTYPE_SERVERS: u8 = 0;
pub const SUBTYPE_USERS: u8 = 1;
pub const SUBTYPE_ANNOUNCE: u8 = 1;
pub const SUBTYPE_USER: u8 = 1;

pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;


#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct EnvelopeHeader {
    pub message_type: u8,
    pub subtype: u8,
    pub length: u16,
    pub reserved: u16,
}
impl EnvelopeHeader {
    pub const SERIALIZED_LEN: usize = 6;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.message_type);
        buf.put_u8(self.subtype);
        buf.put_u16(self.length);
        buf.put_u16(self.reserved);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<EnvelopeHeader> {
        Ok(EnvelopeHeader {
            message_type: buf.try_get_u8()?,
            subtype: buf.try_get_u8()?,
            length: buf.try_get_u16()?,
            reserved: buf.try_get_u16()?,
        })
    }
}


/// The unit of exchange on every connection: a fixed six byte header followed by `length`
///  bytes of payload. The header's length field is derived from the payload, so the two can
///  not disagree.
#[derive(Clone, Eq, PartialEq)]
pub struct Envelope {
    pub message_type: u8,
    pub subtype: u8,
    pub reserved: u16,
    pub payload: Bytes,
}

impl Debug for Envelope {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match MessageType::try_from(self.message_type) {
            Ok(t) => write!(f, "Envelope{{{:?}/{}, {} bytes}}", t, self.subtype, self.payload.len()),
            Err(_) => write!(f, "Envelope{{?{}/{}, {} bytes}}", self.message_type, self.subtype, self.payload.len()),
        }
    }
}

impl Envelope {
    pub fn new(message_type: MessageType, subtype: u8, payload: impl Into<Bytes>) -> Envelope {
        Envelope {
            message_type: message_type.into(),
            subtype,
            reserved: 0,
            payload: payload.into(),
        }
    }

    pub fn directory_request(subtype: u8) -> Envelope {
        Envelope::new(MessageType::DirectoryRequest, subtype, Bytes::new())
    }

    pub fn directory_response<S: AsRef<str>>(subtype: u8, entries: impl IntoIterator<Item = S>) -> Envelope {
        let mut buf = BytesMut::new();
        put_nul_joined(&mut buf, entries);
        Envelope::new(MessageType::DirectoryResponse, subtype, buf.freeze())
    }

    pub fn announce(port: u16) -> Envelope {
        Envelope::new(MessageType::DirectoryResponse, SUBTYPE_ANNOUNCE, port.to_string())
    }

    pub fn identify(username: &str) -> Envelope {
        Envelope::new(MessageType::Identify, SUBTYPE_USER, username.to_string())
    }

    pub fn chat(msg: &ChatMessage) -> Envelope {
        Envelope::new(MessageType::Chat, 0, msg.to_payload())
    }

    pub fn echo() -> Envelope {
        Envelope::new(MessageType::Echo, 0, Bytes::new())
    }

    pub fn disconnect(username: &str) -> Envelope {
        Envelope::new(MessageType::Disconnect, 0, username.to_string())
    }

    pub fn kind(&self) -> Option<MessageType> {
        MessageType::try_from(self.message_type).ok()
    }

    pub fn header(&self) -> anyhow::Result<EnvelopeHeader> {
        if self.payload.len() > MAX_PAYLOAD_LEN {
            bail!("payload of {} bytes exceeds the maximum of {} bytes", self.payload.len(), MAX_PAYLOAD_LEN);
        }
        Ok(EnvelopeHeader {
            message_type: self.message_type,
            subtype: self.subtype,
            length: self.payload.len() as u16,
            reserved: self.reserved,
        })
    }

    pub fn ser(&self, buf: &mut impl BufMut) -> anyhow::Result<()> {
        self.header()?.ser(buf);
        buf.put_slice(&self.payload);
        Ok(())
    }

    pub fn to_bytes(&self) -> anyhow::Result<Bytes> {
        let mut buf = BytesMut::with_capacity(EnvelopeHeader::SERIALIZED_LEN + self.payload.len());
        self.ser(&mut buf)?;
        Ok(buf.freeze())
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Envelope> {
        let header = EnvelopeHeader::try_deser(buf)?;
        let len = header.length as usize;
        if buf.remaining() < len {
            bail!("envelope announces {} bytes of payload, only {} available", len, buf.remaining());
        }
        Ok(Envelope {
            message_type: header.message_type,
            subtype: header.subtype,
            reserved: header.reserved,
            payload: buf.copy_to_bytes(len),
        })
    }

    /// Reads exactly one envelope from a stream. A stream that ends cleanly before the first
    ///  header byte yields `None`, a stream that ends anywhere inside an envelope is a framing
    ///  error.
    pub async fn read_from(reader: &mut (impl AsyncRead + Unpin)) -> anyhow::Result<Option<Envelope>> {
        let mut header_buf = [0u8; EnvelopeHeader::SERIALIZED_LEN];
        let mut filled = 0;
        while filled < header_buf.len() {
            let n = reader.read(&mut header_buf[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                bail!("connection closed after {} of {} header bytes", filled, EnvelopeHeader::SERIALIZED_LEN);
            }
            filled += n;
        }

        let header = EnvelopeHeader::try_deser(&mut &header_buf[..])?;
        let mut payload = vec![0u8; header.length as usize];
        reader.read_exact(&mut payload).await
            .with_context(|| format!("connection closed before the announced {} bytes of payload were received", header.length))?;

        Ok(Some(Envelope {
            message_type: header.message_type,
            subtype: header.subtype,
            reserved: header.reserved,
            payload: payload.into(),
        }))
    }

    pub async fn write_to(&self, writer: &mut (impl AsyncWrite + Unpin)) -> anyhow::Result<()> {
        let buf = self.to_bytes()?;
        writer.write_all(&buf).await?;
        writer.flush().await?;
        Ok(())
    }
}
