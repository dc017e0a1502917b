//! OpenAI-compatible chat-completions adapter.
//!
//! Serves two roles: a direct adapter for any OpenAI-wire backend, and —
//! via [`OpenAiCompatProvider::multi_backend`] — the gateway instance
//! registered as `zai` that model-prefix inference routes `gemini/`,
//! `groq/`, `deepseek/`, `openrouter/`, `zai/`, `claude-*`, `gpt-*` and
//! `o1*` requests to.
//!
//! Tool-call arguments arrive as fragmented JSON deltas keyed by index;
//! they are assembled here and emitted as exactly one `tool_call` chunk
//! per call once complete. Malformed argument JSON degrades to `{}`.

use std::collections::HashMap;

use serde_json::Value;

use maestro_domain::chat::{ChatContent, Role};
use maestro_domain::model::ModelInfo;
use maestro_domain::stream::{BoxStream, StreamChunk, TokenUsage, ToolCallData};

use crate::sse::sse_chunk_stream;
use crate::traits::{Provider, StreamRequest};
use crate::util::{env_api_key, error_chunk, finalize_stop_reason};

const DEFAULT_MAX_TOKENS: u32 = 8_192;

/// An LLM adapter for OpenAI-compatible chat-completion APIs.
pub struct OpenAiCompatProvider {
    id: String,
    name: String,
    base_url: String,
    api_key: Option<String>,
    models: HashMap<String, ModelInfo>,
    /// Model-id prefix stripped before the wire call (`"zai/"` → upstream
    /// sees the bare model name).
    strip_prefix: Option<String>,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: Option<String>,
        models: Vec<ModelInfo>,
    ) -> Self {
        let id = id.into();
        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            models: models.into_iter().map(|m| (m.id.clone(), m)).collect(),
            strip_prefix: None,
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(120))
                .build()
                .unwrap_or_default(),
            id,
        }
    }

    /// The multi-backend gateway instance. Registered under the id `zai`;
    /// endpoint and key come from `ZAI_API_BASE` / `ZAI_API_KEY`.
    pub fn multi_backend() -> Self {
        let base_url = std::env::var("ZAI_API_BASE")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "https://api.z.ai/api/paas/v4".into());

        let models = vec![ModelInfo {
            id: "zai/glm-4.7-flash".into(),
            name: "GLM-4.7 Flash".into(),
            provider_id: "zai".into(),
            context_limit: 128_000,
            output_limit: 8_192,
            supports_tools: true,
            supports_streaming: true,
            cost_input: 0.0,
            cost_output: 0.0,
        }];

        let mut provider = Self::new(
            "zai",
            "Z.ai",
            base_url,
            env_api_key(&["ZAI_API_KEY"]),
            models,
        );
        provider.strip_prefix = Some("zai/".into());
        provider
    }

    /// Add or replace a model in the catalog.
    pub fn add_model(&mut self, model: ModelInfo) {
        self.models.insert(model.id.clone(), model);
    }

    fn wire_model<'a>(&self, model_id: &'a str) -> &'a str {
        match &self.strip_prefix {
            Some(prefix) => model_id.strip_prefix(prefix.as_str()).unwrap_or(model_id),
            None => model_id,
        }
    }

    fn build_body(&self, request: &StreamRequest) -> Value {
        let mut messages: Vec<Value> = Vec::new();
        if let Some(system) = &request.system {
            messages.push(serde_json::json!({"role": "system", "content": system}));
        }
        for msg in &request.messages {
            let role = match msg.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            let content = match &msg.content {
                ChatContent::Text(t) => Value::String(t.clone()),
                ChatContent::Parts(_) => Value::String(msg.content.joined_text()),
            };
            messages.push(serde_json::json!({"role": role, "content": content}));
        }

        let mut body = serde_json::json!({
            "model": self.wire_model(&request.model_id),
            "messages": messages,
            "stream": true,
            "stream_options": {"include_usage": true},
            "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        });

        if let Some(temp) = request.temperature {
            body["temperature"] = serde_json::json!(temp);
        }

        if let Some(tools) = &request.tools {
            if !tools.is_empty() {
                let wire_tools: Vec<Value> = tools
                    .iter()
                    .map(|t| {
                        serde_json::json!({
                            "type": "function",
                            "function": {
                                "name": t.name,
                                "description": t.description,
                                "parameters": t.parameters,
                            }
                        })
                    })
                    .collect();
                body["tools"] = Value::Array(wire_tools);
            }
        }

        body
    }
}

impl Provider for OpenAiCompatProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn models(&self) -> &HashMap<String, ModelInfo> {
        &self.models
    }

    fn stream(&self, request: StreamRequest) -> BoxStream<'static, StreamChunk> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_body(&request);
        let mut req = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let provider_id = self.id.clone();

        let stream = async_stream::stream! {
            let response = match req.send().await {
                Ok(r) => r,
                Err(e) => {
                    yield error_chunk(&provider_id, e);
                    return;
                }
            };

            let status = response.status();
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                yield error_chunk(&provider_id, format!("HTTP {status}: {text}"));
                return;
            }

            let mut inner = sse_chunk_stream(response, chat_completions_parser());
            while let Some(chunk) = futures_util::StreamExt::next(&mut inner).await {
                yield chunk;
            }
        };

        Box::pin(stream)
    }
}

/// Build the per-stream parser closure for the chat-completions SSE wire.
///
/// Kept separate from the provider so the assembly logic is testable
/// without a live HTTP response.
pub(crate) fn chat_completions_parser() -> impl FnMut(&str) -> Vec<StreamChunk> + Send + 'static {
    // index → (call id, name, accumulated argument JSON)
    let mut pending: HashMap<u64, (String, String, String)> = HashMap::new();
    let mut saw_tool_calls = false;

    move |data: &str| {
        if data == "[DONE]" {
            return Vec::new();
        }

        let value: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(error = %e, "skipping unparseable SSE payload");
                return Vec::new();
            }
        };

        let mut chunks = Vec::new();
        let choice = value.get("choices").and_then(|c| c.get(0));

        if let Some(delta) = choice.and_then(|c| c.get("delta")) {
            if let Some(text) = delta.get("content").and_then(|v| v.as_str()) {
                if !text.is_empty() {
                    chunks.push(StreamChunk::Text { text: text.into() });
                }
            }
            if let Some(text) = delta.get("reasoning_content").and_then(|v| v.as_str()) {
                if !text.is_empty() {
                    chunks.push(StreamChunk::Reasoning { text: text.into() });
                }
            }
            if let Some(tool_calls) = delta.get("tool_calls").and_then(|v| v.as_array()) {
                for tc in tool_calls {
                    let index = tc.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
                    let entry = pending
                        .entry(index)
                        .or_insert_with(|| (format!("call_{index}"), String::new(), String::new()));
                    if let Some(id) = tc.get("id").and_then(|v| v.as_str()) {
                        if !id.is_empty() {
                            entry.0 = id.to_owned();
                        }
                    }
                    if let Some(function) = tc.get("function") {
                        if let Some(name) = function.get("name").and_then(|v| v.as_str()) {
                            if !name.is_empty() {
                                entry.1 = name.to_owned();
                            }
                        }
                        if let Some(args) = function.get("arguments").and_then(|v| v.as_str()) {
                            entry.2.push_str(args);
                        }
                    }
                }
            }
        }

        let finish_reason = choice
            .and_then(|c| c.get("finish_reason"))
            .and_then(|v| v.as_str());

        if let Some(native) = finish_reason {
            // Flush assembled tool calls in index order before the terminal
            // chunk.
            let mut completed: Vec<(u64, (String, String, String))> = pending.drain().collect();
            completed.sort_by_key(|(index, _)| *index);
            for (_, (id, name, args_json)) in completed {
                if name.is_empty() {
                    continue;
                }
                let arguments = if args_json.trim().is_empty() {
                    Value::Object(Default::default())
                } else {
                    match serde_json::from_str(&args_json) {
                        Ok(v) => v,
                        Err(e) => {
                            tracing::warn!(
                                tool = %name,
                                error = %e,
                                "tool call arguments are not valid JSON; defaulting to empty object"
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

            let usage = value.get("usage").and_then(|u| {
                if u.is_null() {
                    None
                } else {
                    Some(TokenUsage {
                        input_tokens: u.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
                        output_tokens: u
                            .get("completion_tokens")
                            .and_then(|v| v.as_u64())
                            .unwrap_or(0),
                    })
                }
            });

            chunks.push(StreamChunk::Done {
                usage,
                stop_reason: finalize_stop_reason(saw_tool_calls, Some(native)),
            });
        }

        chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_domain::stream::StopReason;

    fn feed(parser: &mut (impl FnMut(&str) -> Vec<StreamChunk>), events: &[&str]) -> Vec<StreamChunk> {
        events.iter().flat_map(|e| parser(e)).collect()
    }

    #[test]
    fn text_deltas_stream_through() {
        let mut parser = chat_completions_parser();
        let chunks = feed(
            &mut parser,
            &[
                r#"{"choices":[{"delta":{"content":"hel"}}]}"#,
                r#"{"choices":[{"delta":{"content":"lo"}}]}"#,
                r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#,
            ],
        );

        assert!(matches!(&chunks[0], StreamChunk::Text { text } if text == "hel"));
        assert!(matches!(&chunks[1], StreamChunk::Text { text } if text == "lo"));
        assert!(matches!(
            &chunks[2],
            StreamChunk::Done { stop_reason: StopReason::EndTurn, .. }
        ));
    }

    #[test]
    fn fragmented_tool_arguments_assemble_into_one_chunk() {
        let mut parser = chat_completions_parser();
        let chunks = feed(
            &mut parser,
            &[
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c1","function":{"name":"echo","arguments":"{\"x\""}}]}}]}"#,
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":":1}"}}]}}]}"#,
                r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
            ],
        );

        let tool_calls: Vec<_> = chunks
            .iter()
            .filter(|c| matches!(c, StreamChunk::ToolCall { .. }))
            .collect();
        assert_eq!(tool_calls.len(), 1);
        match tool_calls[0] {
            StreamChunk::ToolCall { tool_call } => {
                assert_eq!(tool_call.id, "c1");
                assert_eq!(tool_call.name, "echo");
                assert_eq!(tool_call.arguments["x"], 1);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn malformed_arguments_default_to_empty_object() {
        let mut parser = chat_completions_parser();
        let chunks = feed(
            &mut parser,
            &[
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c1","function":{"name":"echo","arguments":"{not json"}}]}}]}"#,
                r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
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
    fn stop_reason_overridden_when_tool_calls_present() {
        let mut parser = chat_completions_parser();
        // Backend reports "stop" even though a tool call was emitted.
        let chunks = feed(
            &mut parser,
            &[
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c1","function":{"name":"ls","arguments":"{}"}}]}}]}"#,
                r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#,
            ],
        );

        let done = chunks.last().unwrap();
        assert!(matches!(
            done,
            StreamChunk::Done { stop_reason: StopReason::ToolCalls, .. }
        ));
    }

    #[test]
    fn usage_parsed_from_finish_chunk() {
        let mut parser = chat_completions_parser();
        let chunks = feed(
            &mut parser,
            &[
                r#"{"choices":[{"delta":{"content":"hi"},"finish_reason":"stop"}],"usage":{"prompt_tokens":12,"completion_tokens":7}}"#,
            ],
        );

        match chunks.last().unwrap() {
            StreamChunk::Done { usage, .. } => {
                let usage = usage.unwrap();
                assert_eq!(usage.input_tokens, 12);
                assert_eq!(usage.output_tokens, 7);
            }
            other => panic!("expected Done, got {other:?}"),
        }
    }

    #[test]
    fn reasoning_content_streams_as_reasoning() {
        let mut parser = chat_completions_parser();
        let chunks = feed(
            &mut parser,
            &[r#"{"choices":[{"delta":{"reasoning_content":"thinking..."}}]}"#],
        );
        assert!(matches!(&chunks[0], StreamChunk::Reasoning { text } if text == "thinking..."));
    }

    #[test]
    fn done_sentinel_and_garbage_ignored() {
        let mut parser = chat_completions_parser();
        assert!(parser("[DONE]").is_empty());
        assert!(parser("not json at all").is_empty());
    }

    #[test]
    fn multiple_tool_calls_flush_in_index_order() {
        let mut parser = chat_completions_parser();
        let chunks = feed(
            &mut parser,
            &[
                r#"{"choices":[{"delta":{"tool_calls":[{"index":1,"id":"c2","function":{"name":"b","arguments":"{}"}}]}}]}"#,
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c1","function":{"name":"a","arguments":"{}"}}]}}]}"#,
                r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
            ],
        );

        let names: Vec<&str> = chunks
            .iter()
            .filter_map(|c| match c {
                StreamChunk::ToolCall { tool_call } => Some(tool_call.name.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn multi_backend_catalog_and_model_rewrite() {
        let provider = OpenAiCompatProvider::multi_backend();
        assert_eq!(provider.id(), "zai");
        assert!(provider.models().contains_key("zai/glm-4.7-flash"));
        assert_eq!(provider.wire_model("zai/glm-4.7-flash"), "glm-4.7-flash");
        assert_eq!(provider.wire_model("gpt-4o"), "gpt-4o");
    }

    #[test]
    fn body_includes_system_and_tools() {
        let provider = OpenAiCompatProvider::new("t", "T", "http://localhost:1", None, vec![]);
        let request = StreamRequest {
            model_id: "m".into(),
            messages: vec![maestro_domain::chat::ChatMessage::user("hi")],
            tools: Some(vec![maestro_domain::chat::ToolSchema {
                name: "echo".into(),
                description: "echoes".into(),
                parameters: serde_json::json!({"type": "object"}),
            }]),
            system: Some("be brief".into()),
            temperature: Some(0.2),
            max_tokens: None,
        };

        let body = provider.build_body(&request);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hi");
        assert_eq!(body["tools"][0]["function"]["name"], "echo");
        assert_eq!(body["max_tokens"], DEFAULT_MAX_TOKENS);
        assert_eq!(body["stream"], true);
    }
}
