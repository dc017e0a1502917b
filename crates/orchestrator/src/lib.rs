//! The maestro orchestrator — the agentic prompt loop and everything it
//! leans on: the shared context object, the agent catalog, the per-session
//! processor, and context compaction.
//!
//! Entry point: [`Orchestrator::prompt`] takes a session + prompt input
//! and returns a pull-driven channel of
//! [`StreamChunk`](maestro_domain::StreamChunk)s suitable for SSE or
//! non-streaming aggregation.

pub mod catalog;
pub mod compaction;
pub mod context;
pub mod processor;
pub mod prompt;

pub use catalog::AgentCatalog;
pub use compaction::{CompactionResult, PruneResult};
pub use context::OrchestratorContext;
pub use processor::{ProcessorRegistry, SessionProcessor, StepStatus};
pub use prompt::{LoopState, Orchestrator, PromptInput};
