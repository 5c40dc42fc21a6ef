use crate::dispatcher::Handler;
use crate::network::ConnectionId;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tracing::info;

/// Longest text a chat message may carry, in UTF-8 bytes
pub const MAX_TEXT_LEN: usize = 125;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("empty payload")]
    Empty,

    #[error("truncated message: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("text of {0} bytes exceeds the 125 byte limit")]
    TooLong(usize),

    #[error("text is not valid UTF-8")]
    InvalidUtf8,
}

/// One chat line: a message code byte followed by a short string
///
/// Wire layout: `code: u8`, `len: u16 (LE)`, `len` bytes of UTF-8.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub code: u8,
    pub text: String,
}

impl ChatMessage {
    pub fn new(code: u8, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
        }
    }

    pub fn decode(mut payload: &[u8]) -> Result<Self, DecodeError> {
        if payload.is_empty() {
            return Err(DecodeError::Empty);
        }
        let code = payload.get_u8();

        if payload.remaining() < 2 {
            return Err(DecodeError::Truncated {
                needed: 2,
                available: payload.remaining(),
            });
        }
        let len = payload.get_u16_le() as usize;
        if len > MAX_TEXT_LEN {
            return Err(DecodeError::TooLong(len));
        }
        if payload.remaining() < len {
            return Err(DecodeError::Truncated {
                needed: len,
                available: payload.remaining(),
            });
        }

        let text = std::str::from_utf8(&payload[..len])
            .map_err(|_| DecodeError::InvalidUtf8)?
            .to_owned();
        Ok(Self { code, text })
    }

    pub fn encode(&self) -> Result<Bytes, DecodeError> {
        let len = self.text.len();
        if len > MAX_TEXT_LEN {
            return Err(DecodeError::TooLong(len));
        }
        let mut buf = BytesMut::with_capacity(3 + len);
        buf.put_u8(self.code);
        buf.put_u16_le(len as u16);
        buf.extend_from_slice(self.text.as_bytes());
        Ok(buf.freeze())
    }
}

/// Decodes every payload as a [`ChatMessage`] and logs it
#[derive(Debug, Default)]
pub struct ChatLogHandler;

impl Handler for ChatLogHandler {
    fn handle(&self, conn: ConnectionId, payload: Bytes) -> anyhow::Result<()> {
        let message = ChatMessage::decode(&payload)?;
        info!(connection = %conn, code = message.code, "message: {}", message.text);
        Ok(())
    }

    fn on_connect(&self, conn: ConnectionId) {
        info!(connection = %conn, "Chat client joined");
    }
}
