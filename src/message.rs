//! The user-facing unit of data this engine hands back from a receive and
//! accepts on a send: one complete message, already reassembled from frames
//! and already inflated if it arrived compressed.

use crate::error::{CloseCode, Error};
use bytes::Bytes;

/// A close frame's optional status code and reason, RFC 6455 §7.1.5/§7.1.6.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: CloseCode,
    pub reason: String,
}

impl CloseReason {
    pub fn new(code: CloseCode, reason: impl Into<String>) -> Self {
        Self { code, reason: reason.into() }
    }

    /// Decodes a close frame payload: empty, or a 2-byte code followed by a
    /// UTF-8 reason string.
    pub fn from_payload(payload: &[u8]) -> Result<Option<Self>, Error> {
        if payload.is_empty() {
            return Ok(None);
        }
        if payload.len() < 2 {
            return Err(Error::InvalidCloseFramePayload);
        }
        let code = u16::from_be_bytes([payload[0], payload[1]]);
        let reason = String::from_utf8(payload[2..].to_vec())?;
        Ok(Some(Self { code: CloseCode::from_code(code), reason }))
    }

    pub fn to_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.reason.len());
        out.extend_from_slice(&self.code.code().to_be_bytes());
        out.extend_from_slice(self.reason.as_bytes());
        out
    }
}

/// One complete, reassembled WebSocket message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Text(Bytes),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    Close(Option<CloseReason>),
}

impl Message {
    pub fn text(s: impl Into<String>) -> Self {
        Message::Text(Bytes::from(s.into()))
    }

    pub fn binary(data: impl Into<Bytes>) -> Self {
        Message::Binary(data.into())
    }

    pub fn is_text(&self) -> bool {
        matches!(self, Message::Text(_))
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, Message::Binary(_))
    }

    pub fn is_close(&self) -> bool {
        matches!(self, Message::Close(_))
    }

    /// Raw payload bytes, for whichever variant carries them. Close frames
    /// re-encode their reason into wire form.
    pub fn as_bytes(&self) -> Bytes {
        match self {
            Message::Text(b) | Message::Binary(b) | Message::Ping(b) | Message::Pong(b) => b.clone(),
            Message::Close(Some(reason)) => Bytes::from(reason.to_payload()),
            Message::Close(None) => Bytes::new(),
        }
    }

    /// Decodes a `Text` payload as UTF-8. Fails for non-text variants.
    pub fn as_text(&self) -> Result<&str, Error> {
        match self {
            Message::Text(_) => std::str::from_utf8(self.text_bytes())
                .map_err(|_| Error::InvalidUtf8InTextMessage),
            _ => Err(Error::InvalidOpcode),
        }
    }

    fn text_bytes(&self) -> &[u8] {
        match self {
            Message::Text(b) => b,
            _ => unreachable!("text_bytes only called on Message::Text"),
        }
    }
}
