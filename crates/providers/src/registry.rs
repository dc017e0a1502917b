//! Provider registry.
//!
//! Holds every registered adapter behind `Arc<dyn Provider>` and resolves
//! which adapter should serve a model id when the caller did not say.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use maestro_domain::model::{ModelInfo, ProviderInfo};

use crate::traits::Provider;

/// Model-id prefixes that route to the multi-backend gateway adapter.
const GATEWAY_PREFIXES: &[&str] = &[
    "gemini/",
    "groq/",
    "deepseek/",
    "openrouter/",
    "zai/",
    "claude-",
    "gpt-",
    "o1",
];

/// The gateway adapter's registered id.
const GATEWAY_PROVIDER_ID: &str = "zai";

/// Registry of LLM provider adapters. Registration is last-writer-wins on
/// the provider id.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: RwLock<HashMap<String, Arc<dyn Provider>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, provider: Arc<dyn Provider>) {
        let id = provider.id().to_owned();
        tracing::info!(provider_id = %id, "registered LLM provider");
        self.providers.write().insert(id, provider);
    }

    pub fn get(&self, provider_id: &str) -> Option<Arc<dyn Provider>> {
        self.providers.read().get(provider_id).cloned()
    }

    /// Snapshot of every provider and its catalog.
    pub fn list(&self) -> Vec<ProviderInfo> {
        let mut infos: Vec<ProviderInfo> = self
            .providers
            .read()
            .values()
            .map(|p| p.info())
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// Look up one model's catalog entry.
    pub fn get_model(&self, provider_id: &str, model_id: &str) -> Option<ModelInfo> {
        self.get(provider_id)
            .and_then(|p| p.models().get(model_id).cloned())
    }

    pub fn is_empty(&self) -> bool {
        self.providers.read().is_empty()
    }

    /// Infer a provider id from a model id when neither the prompt input
    /// nor the session binds one. Known gateway prefixes route to the
    /// multi-backend adapter; everything else falls back to
    /// `default_provider_id`.
    pub fn infer_provider(&self, model_id: &str, default_provider_id: &str) -> String {
        for prefix in GATEWAY_PREFIXES {
            if model_id.starts_with(prefix) {
                return GATEWAY_PROVIDER_ID.to_owned();
            }
        }
        default_provider_id.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_domain::stream::{BoxStream, StreamChunk};
    use maestro_domain::StopReason;

    struct FakeProvider {
        id: String,
        models: HashMap<String, ModelInfo>,
    }

    impl FakeProvider {
        fn new(id: &str) -> Self {
            let model = ModelInfo {
                id: format!("{id}-model"),
                name: "Fake".into(),
                provider_id: id.into(),
                context_limit: 1_000,
                output_limit: 100,
                supports_tools: true,
                supports_streaming: true,
                cost_input: 0.0,
                cost_output: 0.0,
            };
            Self {
                id: id.into(),
                models: [(model.id.clone(), model)].into(),
            }
        }
    }

    impl Provider for FakeProvider {
        fn id(&self) -> &str {
            &self.id
        }
        fn name(&self) -> &str {
            "Fake"
        }
        fn models(&self) -> &HashMap<String, ModelInfo> {
            &self.models
        }
        fn stream(&self, _request: crate::StreamRequest) -> BoxStream<'static, StreamChunk> {
            Box::pin(async_stream::stream! {
                yield StreamChunk::Done { usage: None, stop_reason: StopReason::EndTurn };
            })
        }
    }

    #[test]
    fn register_and_get() {
        let registry = ProviderRegistry::new();
        assert!(registry.is_empty());
        registry.register(Arc::new(FakeProvider::new("alpha")));
        assert!(registry.get("alpha").is_some());
        assert!(registry.get("beta").is_none());
    }

    #[test]
    fn reregistration_replaces() {
        let registry = ProviderRegistry::new();
        registry.register(Arc::new(FakeProvider::new("alpha")));
        registry.register(Arc::new(FakeProvider::new("alpha")));
        assert_eq!(registry.list().len(), 1);
    }

    #[test]
    fn get_model_resolves_catalog_entry() {
        let registry = ProviderRegistry::new();
        registry.register(Arc::new(FakeProvider::new("alpha")));
        assert!(registry.get_model("alpha", "alpha-model").is_some());
        assert!(registry.get_model("alpha", "other").is_none());
    }

    #[test]
    fn prefix_inference_routes_to_gateway() {
        let registry = ProviderRegistry::new();
        for model in [
            "gemini/gemini-2.0-flash",
            "groq/llama-3.3-70b",
            "deepseek/deepseek-chat",
            "openrouter/qwen",
            "zai/glm-4.7-flash",
            "claude-sonnet-4-20250514",
            "gpt-4o",
            "o1-mini",
        ] {
            assert_eq!(registry.infer_provider(model, "fallback"), "zai", "{model}");
        }
    }

    #[test]
    fn unknown_model_falls_back_to_default() {
        let registry = ProviderRegistry::new();
        assert_eq!(
            registry.infer_provider("llama-local", "fallback"),
            "fallback"
        );
    }
}
