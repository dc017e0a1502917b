//! Tool runtime for maestro.
//!
//! The tool contract (`Tool` trait + output truncation), the process-wide
//! registry, and the interactive `question` tool with its out-of-band
//! reply channel.

pub mod question;
pub mod registry;
pub mod tool;

pub use question::{QuestionChannel, QuestionInfo, QuestionOption, QuestionReply, QuestionTool};
pub use registry::ToolRegistry;
pub use tool::{Tool, ToolContext, ToolOutput, MAX_OUTPUT_LENGTH};
