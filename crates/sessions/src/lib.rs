//! Session and message state for maestro.
//!
//! An append-only log of user/assistant messages per session, with
//! assistant messages decomposed into typed parts, plus session metadata
//! with cost rollups and the character-heuristic token accountant.

pub mod message;
pub mod session;
pub mod token;

pub use message::{
    AssistantMessage, MessageEntry, MessagePart, MessageStore, PartBody, PartPatch, ToolStatus,
    UserMessage,
};
pub use session::{SessionCreate, SessionInfo, SessionStore, SessionUpdate};
pub use token::{count_messages, estimate, is_overflow, TokenInfo};
