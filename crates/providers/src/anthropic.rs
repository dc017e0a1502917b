//! Anthropic-native adapter.
//!
//! Implements the Anthropic Messages API: system prompt as a top-level
//! field, tool definitions with `input_schema`, streaming content-block
//! events, and the extended-thinking fallback — when the API rejects a
//! thinking configuration, the call is retried once without it and the
//! downgraded stream is surfaced.

use std::collections::HashMap;

use serde_json::Value;

use maestro_domain::chat::{ChatContent, Role};
use maestro_domain::model::ModelInfo;
use maestro_domain::stream::{BoxStream, StreamChunk, TokenUsage, ToolCallData};

use crate::sse::sse_chunk_stream;
use crate::traits::{Provider, StreamRequest};
use crate::util::{env_api_key, error_chunk, finalize_stop_reason};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 8_192;
const THINKING_BUDGET_TOKENS: u32 = 10_000;

/// An LLM adapter for the Anthropic Messages API.
pub struct AnthropicProvider {
    id: String,
    base_url: String,
    api_key: Option<String>,
    models: HashMap<String, ModelInfo>,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(api_key: Option<String>) -> Self {
        let base_url = std::env::var("ANTHROPIC_BASE_URL")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "https://api.anthropic.com".into());

        let models = default_catalog();

        Self {
            id: "anthropic".into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            models: models.into_iter().map(|m| (m.id.clone(), m)).collect(),
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(120))
                .build()
                .unwrap_or_default(),
        }
    }

    /// Build from `ANTHROPIC_API_KEY`.
    pub fn from_env() -> Self {
        Self::new(env_api_key(&["ANTHROPIC_API_KEY"]))
    }

    fn supports_extended_thinking(model_id: &str) -> bool {
        model_id.contains("opus-4") || model_id.contains("sonnet-4") || model_id.contains("3-7")
    }

    fn build_body(&self, request: &StreamRequest, with_thinking: bool) -> Value {
        let mut messages: Vec<Value> = Vec::new();
        for msg in &request.messages {
            let role = match msg.role {
                // The Messages API has no system role; system text goes in
                // the top-level field below.
                Role::System => continue,
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            let text = match &msg.content {
                ChatContent::Text(t) => t.clone(),
                ChatContent::Parts(_) => msg.content.joined_text(),
            };
            messages.push(serde_json::json!({"role": role, "content": text}));
        }

        let mut body = serde_json::json!({
            "model": request.model_id,
            "messages": messages,
            "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "stream": true,
        });

        if let Some(system) = &request.system {
            body["system"] = Value::String(system.clone());
        }

        if let Some(temp) = request.temperature {
            body["temperature"] = serde_json::json!(temp);
        }

        if let Some(tools) = &request.tools {
            if !tools.is_empty() {
                let wire_tools: Vec<Value> = tools
                    .iter()
                    .map(|t| {
                        serde_json::json!({
                            "name": t.name,
                            "description": t.description,
                            "input_schema": t.parameters,
                        })
                    })
                    .collect();
                body["tools"] = Value::Array(wire_tools);
            }
        }

        if with_thinking {
            body["thinking"] = serde_json::json!({
                "type": "enabled",
                "budget_tokens": THINKING_BUDGET_TOKENS,
            });
        }

        body
    }

    fn request(&self, body: &Value) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .json(body);
        if let Some(key) = &self.api_key {
            req = req.header("x-api-key", key);
        }
        req
    }
}

/// Whether an API rejection looks like a thinking-configuration problem
/// worth retrying without the feature.
fn is_thinking_rejection(error_body: &str) -> bool {
    let lower = error_body.to_lowercase();
    lower.contains("thinking")
        || lower.contains("budget")
        || lower.contains("unsupported")
        || lower.contains("invalid")
}

impl Provider for AnthropicProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        "Anthropic"
    }

    fn models(&self) -> &HashMap<String, ModelInfo> {
        &self.models
    }

    fn stream(&self, request: StreamRequest) -> BoxStream<'static, StreamChunk> {
        let use_thinking = Self::supports_extended_thinking(&request.model_id);
        let first = self.request(&self.build_body(&request, use_thinking));
        let fallback = if use_thinking {
            Some(self.request(&self.build_body(&request, false)))
        } else {
            None
        };
        let provider_id = self.id.clone();

        let stream = async_stream::stream! {
            let mut attempt = Some(first);
            let mut fallback = fallback;

            let response = loop {
                let Some(req) = attempt.take() else { return };
                match req.send().await {
                    Ok(r) if r.status().is_success() => break r,
                    Ok(r) => {
                        let status = r.status();
                        let text = r.text().await.unwrap_or_default();
                        if fallback.is_some() && is_thinking_rejection(&text) {
                            tracing::warn!(
                                "thinking configuration rejected; retrying without it"
                            );
                            attempt = fallback.take();
                            continue;
                        }
                        yield error_chunk(&provider_id, format!("HTTP {status}: {text}"));
                        return;
                    }
                    Err(e) => {
                        yield error_chunk(&provider_id, e);
                        return;
                    }
                }
            };

            let mut inner = sse_chunk_stream(response, messages_parser());
            while let Some(chunk) = futures_util::StreamExt::next(&mut inner).await {
                yield chunk;
            }
        };

        Box::pin(stream)
    }
}

/// Build the per-stream parser for Messages-API SSE events.
pub(crate) fn messages_parser() -> impl FnMut(&str) -> Vec<StreamChunk> + Send + 'static {
    // block index → (tool_use id, name, accumulated input JSON)
    let mut tool_blocks: HashMap<u64, (String, String, String)> = HashMap::new();
    let mut saw_tool_calls = false;
    let mut input_tokens: u64 = 0;
    let mut output_tokens: u64 = 0;
    let mut native_stop: Option<String> = None;

    move |data: &str| {
        let value: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(error = %e, "skipping unparseable SSE payload");
                return Vec::new();
            }
        };

        let mut chunks = Vec::new();
        match value.get("type").and_then(|v| v.as_str()) {
            Some("message_start") => {
                input_tokens = value
                    .pointer("/message/usage/input_tokens")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);
            }
            Some("content_block_start") => {
                let index = value.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
                if let Some(block) = value.get("content_block") {
                    if block.get("type").and_then(|v| v.as_str()) == Some("tool_use") {
                        tool_blocks.insert(
                            index,
                            (
                                block
                                    .get("id")
                                    .and_then(|v| v.as_str())
                                    .unwrap_or_default()
                                    .to_owned(),
                                block
                                    .get("name")
                                    .and_then(|v| v.as_str())
                                    .unwrap_or_default()
                                    .to_owned(),
                                String::new(),
                            ),
                        );
                    }
                }
            }
            Some("content_block_delta") => {
                let index = value.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
                match value.pointer("/delta/type").and_then(|v| v.as_str()) {
                    Some("text_delta") => {
                        if let Some(text) = value.pointer("/delta/text").and_then(|v| v.as_str()) {
                            chunks.push(StreamChunk::Text { text: text.into() });
                        }
                    }
                    Some("thinking_delta") => {
                        if let Some(text) =
                            value.pointer("/delta/thinking").and_then(|v| v.as_str())
                        {
                            chunks.push(StreamChunk::Reasoning { text: text.into() });
                        }
                    }
                    Some("input_json_delta") => {
                        if let Some(partial) =
                            value.pointer("/delta/partial_json").and_then(|v| v.as_str())
                        {
                            if let Some(block) = tool_blocks.get_mut(&index) {
                                block.2.push_str(partial);
                            }
                        }
                    }
                    _ => {}
                }
            }
            Some("content_block_stop") => {
                let index = value.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
                if let Some((id, name, args_json)) = tool_blocks.remove(&index) {
                    let arguments = if args_json.trim().is_empty() {
                        Value::Object(Default::default())
                    } else {
                        match serde_json::from_str(&args_json) {
                            Ok(v) => v,
                            Err(e) => {
                                tracing::warn!(
                                    tool = %name,
                                    error = %e,
                                    "tool input is not valid JSON; defaulting to empty object"
                                );
                                Value::Object(Default::default())
                            }
                        }
                    };
                    saw_tool_calls = true;
                    chunks.push(StreamChunk::ToolCall {
                        tool_call: ToolCallData {
                            id,
                            name,
                            arguments,
                        },
                    });
                }
            }
            Some("message_delta") => {
                if let Some(stop) = value.pointer("/delta/stop_reason").and_then(|v| v.as_str()) {
                    native_stop = Some(stop.to_owned());
                }
                if let Some(tokens) = value
                    .pointer("/usage/output_tokens")
                    .and_then(|v| v.as_u64())
                {
                    output_tokens = tokens;
                }
            }
            Some("message_stop") => {
                chunks.push(StreamChunk::Done {
                    usage: Some(TokenUsage {
                        input_tokens,
                        output_tokens,
                    }),
                    stop_reason: finalize_stop_reason(saw_tool_calls, native_stop.as_deref()),
                });
            }
            Some("error") => {
                let message = value
                    .pointer("/error/message")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown provider error");
                chunks.push(StreamChunk::Error {
                    error: message.to_owned(),
                });
            }
            _ => {}
        }

        chunks
    }
}

fn default_catalog() -> Vec<ModelInfo> {
    vec![
        ModelInfo {
            id: "claude-sonnet-4-20250514".into(),
            name: "Claude Sonnet 4".into(),
            provider_id: "anthropic".into(),
            context_limit: 200_000,
            output_limit: 8_192,
            supports_tools: true,
            supports_streaming: true,
            cost_input: 3.0,
            cost_output: 15.0,
        },
        ModelInfo {
            id: "claude-3-5-haiku-20241022".into(),
            name: "Claude 3.5 Haiku".into(),
            provider_id: "anthropic".into(),
            context_limit: 200_000,
            output_limit: 8_192,
            supports_tools: true,
            supports_streaming: true,
            cost_input: 0.8,
            cost_output: 4.0,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_domain::stream::StopReason;

    fn feed(
        parser: &mut (impl FnMut(&str) -> Vec<StreamChunk>),
        events: &[&str],
    ) -> Vec<StreamChunk> {
        events.iter().flat_map(|e| parser(e)).collect()
    }

    #[test]
    fn text_stream_with_usage() {
        let mut parser = messages_parser();
        let chunks = feed(
            &mut parser,
            &[
                r#"{"type":"message_start","message":{"usage":{"input_tokens":25}}}"#,
                r#"{"type":"content_block_start","index":0,"content_block":{"type":"text"}}"#,
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"hello"}}"#,
                r#"{"type":"content_block_stop","index":0}"#,
                r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":5}}"#,
                r#"{"type":"message_stop"}"#,
            ],
        );

        assert!(matches!(&chunks[0], StreamChunk::Text { text } if text == "hello"));
        match chunks.last().unwrap() {
            StreamChunk::Done { usage, stop_reason } => {
                assert_eq!(*stop_reason, StopReason::EndTurn);
                let usage = usage.unwrap();
                assert_eq!(usage.input_tokens, 25);
                assert_eq!(usage.output_tokens, 5);
            }
            other => panic!("expected Done, got {other:?}"),
        }
    }

    #[test]
    fn thinking_deltas_become_reasoning() {
        let mut parser = messages_parser();
        let chunks = feed(
            &mut parser,
            &[
                r#"{"type":"content_block_start","index":0,"content_block":{"type":"thinking"}}"#,
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":"hmm"}}"#,
            ],
        );
        assert!(matches!(&chunks[0], StreamChunk::Reasoning { text } if text == "hmm"));
    }

    #[test]
    fn tool_use_block_assembles_arguments() {
        let mut parser = messages_parser();
        let chunks = feed(
            &mut parser,
            &[
                r#"{"type":"content_block_start","index":0,"content_block":{"type":"tool_use","id":"toolu_1","name":"websearch"}}"#,
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{\"query\":"}}"#,
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"\"rust\"}"}}"#,
                r#"{"type":"content_block_stop","index":0}"#,
                r#"{"type":"message_delta","delta":{"stop_reason":"tool_use"},"usage":{"output_tokens":9}}"#,
                r#"{"type":"message_stop"}"#,
            ],
        );

        match &chunks[0] {
            StreamChunk::ToolCall { tool_call } => {
                assert_eq!(tool_call.id, "toolu_1");
                assert_eq!(tool_call.name, "websearch");
                assert_eq!(tool_call.arguments["query"], "rust");
            }
            other => panic!("expected ToolCall, got {other:?}"),
        }
        assert!(matches!(
            chunks.last().unwrap(),
            StreamChunk::Done { stop_reason: StopReason::ToolCalls, .. }
        ));
    }

    #[test]
    fn malformed_tool_input_defaults_to_empty() {
        let mut parser = messages_parser();
        let chunks = feed(
            &mut parser,
            &[
                r#"{"type":"content_block_start","index":0,"content_block":{"type":"tool_use","id":"t1","name":"ls"}}"#,
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{oops"}}"#,
                r#"{"type":"content_block_stop","index":0}"#,
            ],
        );
        match &chunks[0] {
            StreamChunk::ToolCall { tool_call } => {
                assert_eq!(tool_call.arguments, serde_json::json!({}));
            }
            other => panic!("expected ToolCall, got {other:?}"),
        }
    }

    #[test]
    fn native_stop_overridden_after_tool_use() {
        let mut parser = messages_parser();
        let chunks = feed(
            &mut parser,
            &[
                r#"{"type":"content_block_start","index":0,"content_block":{"type":"tool_use","id":"t1","name":"ls"}}"#,
                r#"{"type":"content_block_stop","index":0}"#,
                // Backend (wrongly) claims a plain end_turn.
                r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":1}}"#,
                r#"{"type":"message_stop"}"#,
            ],
        );
        assert!(matches!(
            chunks.last().unwrap(),
            StreamChunk::Done { stop_reason: StopReason::ToolCalls, .. }
        ));
    }

    #[test]
    fn error_event_becomes_error_chunk() {
        let mut parser = messages_parser();
        let chunks = feed(
            &mut parser,
            &[r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#],
        );
        assert!(matches!(&chunks[0], StreamChunk::Error { error } if error == "Overloaded"));
    }

    #[test]
    fn thinking_rejection_heuristic() {
        assert!(is_thinking_rejection("thinking is not supported"));
        assert!(is_thinking_rejection("budget_tokens out of range"));
        assert!(is_thinking_rejection("Invalid parameter"));
        assert!(!is_thinking_rejection("rate limit exceeded"));
    }

    #[test]
    fn extended_thinking_model_detection() {
        assert!(AnthropicProvider::supports_extended_thinking(
            "claude-sonnet-4-20250514"
        ));
        assert!(AnthropicProvider::supports_extended_thinking(
            "claude-3-7-sonnet-20250219"
        ));
        assert!(!AnthropicProvider::supports_extended_thinking(
            "claude-3-5-haiku-20241022"
        ));
    }

    #[test]
    fn system_goes_to_top_level_field() {
        let provider = AnthropicProvider::new(None);
        let request = StreamRequest {
            model_id: "claude-3-5-haiku-20241022".into(),
            messages: vec![
                maestro_domain::chat::ChatMessage::system("ignored here"),
                maestro_domain::chat::ChatMessage::user("hi"),
            ],
            tools: None,
            system: Some("be kind".into()),
            temperature: None,
            max_tokens: None,
        };
        let body = provider.build_body(&request, false);
        assert_eq!(body["system"], "be kind");
        // The system-role message is dropped from the messages array.
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["messages"][0]["role"], "user");
    }
}
