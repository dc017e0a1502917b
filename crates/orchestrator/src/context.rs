//! Shared orchestrator context.
//!
//! One explicit object carrying every service the prompt loop touches,
//! threaded through calls instead of process-wide globals.

use std::sync::Arc;
use std::time::Duration;

use maestro_core::bus::EventBus;
use maestro_core::storage::Storage;
use maestro_domain::settings::Settings;
use maestro_providers::ProviderRegistry;
use maestro_sessions::{MessageStore, SessionStore};
use maestro_tools::{QuestionChannel, QuestionTool, ToolRegistry};

use crate::catalog::AgentCatalog;
use crate::processor::ProcessorRegistry;

/// Everything the orchestrator needs, grouped by concern:
/// - **infrastructure** — settings, bus, storage
/// - **state** — session and message stores
/// - **capabilities** — provider registry, tool registry, question channel
/// - **agents** — catalog and per-session processors
pub struct OrchestratorContext {
    pub settings: Settings,
    pub bus: Arc<EventBus>,
    pub storage: Storage,

    pub sessions: SessionStore,
    pub messages: MessageStore,

    pub providers: Arc<ProviderRegistry>,
    pub tools: Arc<ToolRegistry>,
    pub questions: Arc<QuestionChannel>,

    pub agents: Arc<AgentCatalog>,
    pub processors: Arc<ProcessorRegistry>,
}

impl OrchestratorContext {
    /// Wire up a context over the given storage. The built-in `question`
    /// tool is registered; everything else is up to the host.
    pub fn new(settings: Settings, storage: Storage) -> Arc<Self> {
        let bus = Arc::new(EventBus::new());
        let questions = Arc::new(QuestionChannel::new(
            bus.clone(),
            Duration::from_secs(settings.question_timeout_secs),
        ));

        let tools = Arc::new(ToolRegistry::new());
        tools.register(Arc::new(QuestionTool::new(questions.clone())));

        Arc::new(Self {
            sessions: SessionStore::new(storage.clone(), bus.clone()),
            messages: MessageStore::new(storage.clone(), bus.clone()),
            providers: Arc::new(ProviderRegistry::new()),
            tools,
            questions,
            agents: Arc::new(AgentCatalog::new()),
            processors: Arc::new(ProcessorRegistry::new()),
            settings,
            bus,
            storage,
        })
    }

    /// In-memory context for tests and ephemeral hosts.
    pub fn in_memory() -> Arc<Self> {
        Self::new(Settings::default(), Storage::in_memory())
    }

    /// Context persisted under the settings' storage path.
    pub fn with_local_storage(settings: Settings) -> Arc<Self> {
        let storage = Storage::local(settings.storage_path.clone());
        Self::new(settings, storage)
    }
}
