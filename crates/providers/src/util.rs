//! Small helpers shared by the provider adapters.

use maestro_domain::stream::{StopReason, StreamChunk};

/// Apply the stop-reason override: a stream that emitted at least one
/// tool call reports `tool_calls` no matter what the backend said. Some
/// backends report a plain "stop" with tool calls still pending, which
/// stalls the agentic loop.
pub(crate) fn finalize_stop_reason(saw_tool_calls: bool, native: Option<&str>) -> StopReason {
    if saw_tool_calls {
        return StopReason::ToolCalls;
    }
    StopReason::normalize(native.unwrap_or(""))
}

/// Convert a reqwest failure into a terminal error chunk.
pub(crate) fn error_chunk(context: &str, err: impl std::fmt::Display) -> StreamChunk {
    StreamChunk::Error {
        error: format!("{context}: {err}"),
    }
}

/// Resolve an API key from the first environment variable that is set.
pub(crate) fn env_api_key(vars: &[&str]) -> Option<String> {
    vars.iter()
        .find_map(|v| std::env::var(v).ok().filter(|s| !s.is_empty()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_forces_tool_calls() {
        assert_eq!(
            finalize_stop_reason(true, Some("stop")),
            StopReason::ToolCalls
        );
        assert_eq!(finalize_stop_reason(true, None), StopReason::ToolCalls);
    }

    #[test]
    fn no_tool_calls_normalizes_native() {
        assert_eq!(
            finalize_stop_reason(false, Some("length")),
            StopReason::MaxTokens
        );
        assert_eq!(finalize_stop_reason(false, None), StopReason::EndTurn);
    }
}
