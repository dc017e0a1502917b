//! Shared domain types for maestro.
//!
//! Everything the other crates agree on lives here: the workspace error
//! type, sortable identifiers, the provider streaming chunk contract,
//! provider-level chat messages, model catalog records, agent
//! configuration, and runtime settings.

pub mod agent;
pub mod chat;
pub mod error;
pub mod id;
pub mod model;
pub mod settings;
pub mod stream;

pub use error::{Error, Result};
pub use id::{Identifier, IdPrefix};
pub use stream::{BoxStream, StopReason, StreamChunk, TokenUsage, ToolCallData};
