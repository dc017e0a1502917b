use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// A boxed async stream, used for LLM streaming responses.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

/// Token usage reported by a provider on the terminal chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

/// Normalized termination code reported on a stream's `done` chunk.
///
/// Every adapter maps its backend's native reason into this set; unknown
/// reasons collapse to `EndTurn`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolCalls,
    MaxTokens,
    ContentFilter,
    Safety,
}

impl StopReason {
    /// Map a backend-native finish reason into the normalized set.
    pub fn normalize(native: &str) -> Self {
        match native {
            "tool_calls" | "tool_use" | "function_call" => Self::ToolCalls,
            "length" | "max_tokens" => Self::MaxTokens,
            "content_filter" => Self::ContentFilter,
            "safety" | "recitation" => Self::Safety,
            _ => Self::EndTurn,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::EndTurn => "end_turn",
            Self::ToolCalls => "tool_calls",
            Self::MaxTokens => "max_tokens",
            Self::ContentFilter => "content_filter",
            Self::Safety => "safety",
        }
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully-parsed tool invocation. Adapters only emit this once the
/// argument object is complete; fragmented argument deltas are assembled
/// inside the adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallData {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// One record of a streaming LLM call (provider-agnostic).
///
/// The first five variants come from provider adapters; `ToolResult` and
/// `Step` are synthesized by the orchestrator while it dispatches tools
/// and advances the agentic loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StreamChunk {
    /// Incremental assistant text.
    #[serde(rename = "text")]
    Text { text: String },

    /// Incremental "thinking" text surfaced by the provider.
    #[serde(rename = "reasoning")]
    Reasoning { text: String },

    /// A complete tool invocation.
    #[serde(rename = "tool_call")]
    ToolCall { tool_call: ToolCallData },

    /// The outcome of a dispatched tool, echoed back to stream consumers.
    #[serde(rename = "tool_result")]
    ToolResult {
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_call_id: Option<String>,
        output: String,
    },

    /// Agentic-loop step marker ("Step 2", ...).
    #[serde(rename = "step")]
    Step { text: String },

    /// Terminal chunk; exactly one per well-formed stream.
    #[serde(rename = "done")]
    Done {
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<TokenUsage>,
        stop_reason: StopReason,
    },

    /// Terminal failure; at most one per stream.
    #[serde(rename = "error")]
    Error { error: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_known_reasons() {
        assert_eq!(StopReason::normalize("stop"), StopReason::EndTurn);
        assert_eq!(StopReason::normalize("end_turn"), StopReason::EndTurn);
        assert_eq!(StopReason::normalize("tool_calls"), StopReason::ToolCalls);
        assert_eq!(StopReason::normalize("tool_use"), StopReason::ToolCalls);
        assert_eq!(StopReason::normalize("function_call"), StopReason::ToolCalls);
        assert_eq!(StopReason::normalize("length"), StopReason::MaxTokens);
        assert_eq!(StopReason::normalize("max_tokens"), StopReason::MaxTokens);
        assert_eq!(
            StopReason::normalize("content_filter"),
            StopReason::ContentFilter
        );
        assert_eq!(StopReason::normalize("safety"), StopReason::Safety);
    }

    #[test]
    fn normalize_unknown_falls_back_to_end_turn() {
        assert_eq!(StopReason::normalize(""), StopReason::EndTurn);
        assert_eq!(StopReason::normalize("anything"), StopReason::EndTurn);
    }

    #[test]
    fn chunk_serializes_with_type_tag() {
        let chunk = StreamChunk::Text {
            text: "hello".into(),
        };
        let json = serde_json::to_value(&chunk).unwrap();
        assert_eq!(json["type"], "text");
        assert_eq!(json["text"], "hello");
    }

    #[test]
    fn done_chunk_omits_missing_usage() {
        let chunk = StreamChunk::Done {
            usage: None,
            stop_reason: StopReason::EndTurn,
        };
        let json = serde_json::to_value(&chunk).unwrap();
        assert_eq!(json["type"], "done");
        assert_eq!(json["stop_reason"], "end_turn");
        assert!(json.get("usage").is_none());
    }

    #[test]
    fn tool_call_roundtrip() {
        let chunk = StreamChunk::ToolCall {
            tool_call: ToolCallData {
                id: "c1".into(),
                name: "echo".into(),
                arguments: serde_json::json!({"x": 1}),
            },
        };
        let json = serde_json::to_string(&chunk).unwrap();
        let back: StreamChunk = serde_json::from_str(&json).unwrap();
        match back {
            StreamChunk::ToolCall { tool_call } => {
                assert_eq!(tool_call.id, "c1");
                assert_eq!(tool_call.name, "echo");
                assert_eq!(tool_call.arguments["x"], 1);
            }
            other => panic!("expected ToolCall, got {other:?}"),
        }
    }
}
