//! Character-heuristic token accounting.
//!
//! One rule: a token is roughly four characters. Cheap and deterministic,
//! which is all the pruning decisions that run before a real provider call
//! need.

use serde::{Deserialize, Serialize};

use maestro_domain::model::ModelInfo;

use crate::message::{MessageEntry, PartBody};

const CHARS_PER_TOKEN: u64 = 4;

/// Reserve at most this much of the context window for the reply when
/// checking overflow.
const OUTPUT_RESERVE_CAP: u64 = 16_384;

/// Aggregated token estimate over a message list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenInfo {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total: u64,
}

/// Estimate the token count of a text: `round(chars / 4)`, half-to-even,
/// clamped to zero.
pub fn estimate(text: &str) -> u64 {
    let len = text.chars().count() as u64;
    if len == 0 {
        return 0;
    }
    let quotient = len / CHARS_PER_TOKEN;
    match len % CHARS_PER_TOKEN {
        0 | 1 => quotient,
        2 => quotient + (quotient & 1),
        _ => quotient + 1,
    }
}

/// Sum estimates over a message list.
///
/// Classification: user content counts as input; assistant text and
/// reasoning as output; tool-call name + JSON-serialized args as output;
/// tool-result output as input.
pub fn count_messages(messages: &[MessageEntry]) -> TokenInfo {
    let mut input_tokens = 0;
    let mut output_tokens = 0;

    for entry in messages {
        match entry {
            MessageEntry::User(msg) => {
                input_tokens += estimate(&msg.content);
            }
            MessageEntry::Assistant(msg) => {
                for part in &msg.parts {
                    match &part.body {
                        PartBody::Text { content } | PartBody::Reasoning { content } => {
                            output_tokens += estimate(content);
                        }
                        PartBody::ToolCall {
                            tool_name,
                            tool_args,
                            ..
                        } => {
                            output_tokens += estimate(tool_name);
                            if !tool_args.is_null() {
                                output_tokens +=
                                    estimate(&tool_args.to_string());
                            }
                        }
                        PartBody::ToolResult { tool_output, .. } => {
                            input_tokens += estimate(tool_output);
                        }
                        PartBody::StepStart { .. } | PartBody::StepFinish { .. } => {}
                    }
                }
            }
        }
    }

    TokenInfo {
        input_tokens,
        output_tokens,
        total: input_tokens + output_tokens,
    }
}

/// Whether the message list exceeds the model's usable context:
/// `total > context_limit − min(output_limit, 16384)`. A zero context
/// limit disables the check.
pub fn is_overflow(messages: &[MessageEntry], model: &ModelInfo) -> bool {
    if model.context_limit == 0 {
        return false;
    }
    let reserve = model.output_limit.min(OUTPUT_RESERVE_CAP);
    let usable = model.context_limit.saturating_sub(reserve);
    count_messages(messages).total > usable
}
