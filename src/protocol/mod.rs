/// Chat message codec and logging handler
pub mod chat;

pub use chat::{ChatLogHandler, ChatMessage, DecodeError};
