use std::collections::HashMap;

use maestro_domain::chat::{ChatMessage, ToolSchema};
use maestro_domain::model::{ModelInfo, ProviderInfo};
use maestro_domain::stream::{BoxStream, StreamChunk};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request type
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A provider-agnostic streaming completion request.
#[derive(Debug, Clone, Default)]
pub struct StreamRequest {
    /// Model to call (provider-native id, e.g. `"zai/glm-4.7-flash"`).
    pub model_id: String,
    /// The conversation to send.
    pub messages: Vec<ChatMessage>,
    /// Tool definitions the model may invoke. `None` disables tools.
    pub tools: Option<Vec<ToolSchema>>,
    /// System prompt; providers place it wherever their API expects.
    pub system: Option<String>,
    /// Sampling temperature. `None` lets the provider choose.
    pub temperature: Option<f32>,
    /// Maximum response tokens. `None` lets the provider choose.
    pub max_tokens: Option<u32>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Core provider trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Trait every LLM adapter implements.
///
/// `stream` is infallible by signature: adapters convert any failure —
/// connection errors, bad responses, rejected parameters — into a terminal
/// [`StreamChunk::Error`] instead of raising.
pub trait Provider: Send + Sync {
    /// Stable identifier used by the registry and session bindings.
    fn id(&self) -> &str;

    /// Human-readable name.
    fn name(&self) -> &str;

    /// The model catalog this adapter advertises.
    fn models(&self) -> &HashMap<String, ModelInfo>;

    /// Open a streaming completion call.
    fn stream(&self, request: StreamRequest) -> BoxStream<'static, StreamChunk>;

    /// Snapshot of the provider and its models for enumerating callers.
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: self.id().to_owned(),
            name: self.name().to_owned(),
            models: self.models().clone(),
        }
    }
}
