//! Core data types.
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Message`] | Conversation turn with role and text |
//! | [`MessageRole`] | system, user or assistant |
//! | [`InboundMessage`] | Raw `(sender, text)` event from the chat transport |

pub mod message;

pub use message::{InboundMessage, Message, MessageRole};
