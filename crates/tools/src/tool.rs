//! The tool contract.

use serde_json::Value;

use maestro_domain::Result;

/// Default per-tool output cap in characters.
pub const MAX_OUTPUT_LENGTH: usize = 50_000;

const TRUNCATION_MARKER: &str = "\n\n[Output truncated...]";

/// Execution context handed to every tool invocation.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub session_id: String,
    pub message_id: String,
    pub tool_call_id: Option<String>,
    /// Agent id the invoking loop is running as.
    pub agent: String,
}

/// What a tool returns.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    /// Short human-readable label ("Asked 2 questions").
    pub title: String,
    /// The text fed back to the model.
    pub output: String,
    /// Structured side data (answers, truncation info, ...).
    pub metadata: Value,
}

impl ToolOutput {
    pub fn new(title: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            output: output.into(),
            metadata: Value::Object(Default::default()),
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A registered tool.
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    /// Unique tool name, as exposed to the model.
    fn id(&self) -> &str;

    /// Description included in the provider tool schema.
    fn description(&self) -> &str;

    /// JSON Schema of the tool's arguments.
    fn parameters(&self) -> Value;

    /// Run the tool. Errors are surfaced to the model as an error tool
    /// result by the orchestrator.
    async fn execute(&self, args: Value, ctx: ToolContext) -> Result<ToolOutput>;

    /// Per-tool output cap; override to raise or lower it.
    fn max_output_length(&self) -> usize {
        MAX_OUTPUT_LENGTH
    }
}

/// Cut an output that exceeds the cap, appending a visible marker. The
/// truncation is recorded in `metadata` so it stays observable after the
/// text is shortened.
pub fn truncate_output(tool: &dyn Tool, result: ToolOutput) -> ToolOutput {
    let max = tool.max_output_length();
    let char_count = result.output.chars().count();
    if char_count <= max {
        return result;
    }

    let truncated: String = result.output.chars().take(max).collect();
    let mut metadata = result.metadata;
    if let Value::Object(map) = &mut metadata {
        map.insert("truncated".into(), Value::Bool(true));
        map.insert("original_length".into(), Value::from(char_count));
    }

    ToolOutput {
        title: result.title,
        output: format!("{truncated}{TRUNCATION_MARKER}"),
        metadata,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CappedTool(usize);

    #[async_trait::async_trait]
    impl Tool for CappedTool {
        fn id(&self) -> &str {
            "capped"
        }
        fn description(&self) -> &str {
            "test tool"
        }
        fn parameters(&self) -> Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(&self, _args: Value, _ctx: ToolContext) -> Result<ToolOutput> {
            Ok(ToolOutput::new("t", "o"))
        }
        fn max_output_length(&self) -> usize {
            self.0
        }
    }

    #[test]
    fn short_output_is_untouched() {
        let tool = CappedTool(100);
        let result = truncate_output(&tool, ToolOutput::new("t", "short"));
        assert_eq!(result.output, "short");
        assert!(result.metadata.get("truncated").is_none());
    }

    #[test]
    fn long_output_is_cut_with_marker() {
        let tool = CappedTool(10);
        let result = truncate_output(&tool, ToolOutput::new("t", "a".repeat(25)));
        assert!(result.output.starts_with(&"a".repeat(10)));
        assert!(result.output.ends_with("[Output truncated...]"));
        assert_eq!(result.metadata["truncated"], true);
        assert_eq!(result.metadata["original_length"], 25);
    }

    #[test]
    fn exact_cap_is_not_truncated() {
        let tool = CappedTool(10);
        let result = truncate_output(&tool, ToolOutput::new("t", "a".repeat(10)));
        assert_eq!(result.output, "a".repeat(10));
    }

    #[test]
    fn truncation_counts_characters_not_bytes() {
        let tool = CappedTool(3);
        let result = truncate_output(&tool, ToolOutput::new("t", "😀😀😀😀😀"));
        assert!(result.output.starts_with("😀😀😀"));
        assert_eq!(result.metadata["original_length"], 5);
    }

    #[test]
    fn default_cap_is_50k() {
        struct Plain;
        #[async_trait::async_trait]
        impl Tool for Plain {
            fn id(&self) -> &str {
                "plain"
            }
            fn description(&self) -> &str {
                ""
            }
            fn parameters(&self) -> Value {
                serde_json::json!({})
            }
            async fn execute(&self, _args: Value, _ctx: ToolContext) -> Result<ToolOutput> {
                Ok(ToolOutput::new("", ""))
            }
        }
        assert_eq!(Plain.max_output_length(), MAX_OUTPUT_LENGTH);
    }
}
