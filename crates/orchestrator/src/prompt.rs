//! The prompt loop.
//!
//! [`Orchestrator::prompt`] spawns a per-session task that runs either a
//! single turn or the multi-step agentic loop, streaming
//! [`StreamChunk`]s through a bounded channel — the consumer pulls, the
//! loop only advances as fast as it reads. A session has at most one
//! in-flight loop; different sessions run on independent tasks.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;

use maestro_core::bus::topics;
use maestro_core::storage::Storage;
use maestro_domain::agent::{is_tool_allowed, AgentInfo, PermissionAction};
use maestro_domain::chat::ChatMessage;
use maestro_domain::stream::{StopReason, StreamChunk, ToolCallData};
use maestro_providers::StreamRequest;
use maestro_sessions::message::{MessageEntry, PartBody, PartPatch, ToolStatus};
use maestro_tools::tool::{truncate_output, ToolContext};

use crate::context::OrchestratorContext;
use crate::processor::StepStatus;

/// Chunk channel capacity; backpressure point for slow consumers.
const CHANNEL_CAPACITY: usize = 64;

const DOOM_LOOP_WARNING: &str =
    "\n[Warning: doom loop detected - identical tool calls repeated, stopping]\n";

const TODO_REMINDER: &str = "[System] There are unfinished todo items. \
     Check the todo list and continue working on the remaining tasks.";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Input / loop state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Input to one prompt call.
#[derive(Debug, Clone)]
pub struct PromptInput {
    pub content: String,
    pub provider_id: Option<String>,
    pub model_id: Option<String>,
    pub system: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub tools_enabled: bool,
    /// `None` = use the agent default.
    pub auto_continue: Option<bool>,
    /// `None` = use the agent default.
    pub max_steps: Option<u32>,
}

impl PromptInput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            provider_id: None,
            model_id: None,
            system: None,
            temperature: None,
            max_tokens: None,
            tools_enabled: true,
            auto_continue: None,
            max_steps: None,
        }
    }

    /// Same overrides, different content; used for continuation and
    /// reminder turns.
    fn with_content(&self, content: String) -> Self {
        Self {
            content,
            auto_continue: Some(false),
            ..self.clone()
        }
    }
}

/// Live state of one agentic loop; exists for the duration of a prompt
/// call.
#[derive(Debug, Clone, Serialize)]
pub struct LoopState {
    pub step: u32,
    pub max_steps: u32,
    pub auto_continue: bool,
    pub stop_reason: Option<StopReason>,
    pub paused: bool,
    pub pause_reason: Option<String>,
    pub todo_reminder_count: u32,
    pub max_todo_reminders: u32,
    pub pending_reminder: Option<String>,
}

type LoopTable = Arc<Mutex<HashMap<String, LoopState>>>;

/// What a single turn reported back to the loop.
#[derive(Debug, Default)]
struct TurnOutcome {
    stop_reason: Option<StopReason>,
    had_tool_calls: bool,
    /// The chunk receiver went away; treat as cancellation.
    consumer_gone: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Orchestrator
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Orchestrator {
    ctx: Arc<OrchestratorContext>,
    loop_states: LoopTable,
}

impl Orchestrator {
    pub fn new(ctx: Arc<OrchestratorContext>) -> Self {
        Self {
            ctx,
            loop_states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn context(&self) -> &Arc<OrchestratorContext> {
        &self.ctx
    }

    /// Run a prompt against a session. Returns the chunk stream; the
    /// loop task ends when the stream is drained or the receiver is
    /// dropped.
    pub fn prompt(&self, session_id: &str, input: PromptInput) -> mpsc::Receiver<StreamChunk> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let ctx = self.ctx.clone();
        let loop_states = self.loop_states.clone();
        let session_id = session_id.to_owned();

        tokio::spawn(async move {
            tracing::debug!(session_id = %session_id, "prompt started");

            let session = match ctx.sessions.get(&session_id) {
                Ok(session) => session,
                Err(e) => {
                    let _ = tx
                        .send(StreamChunk::Error {
                            error: e.to_string(),
                        })
                        .await;
                    return;
                }
            };

            let agent = session
                .agent_id
                .as_deref()
                .and_then(|id| ctx.agents.get(id))
                .unwrap_or_else(|| ctx.agents.default_agent());

            let auto_continue = input.auto_continue.unwrap_or(agent.auto_continue);
            let max_steps = input.max_steps.unwrap_or(agent.max_steps);

            if auto_continue {
                agentic_loop(&ctx, &loop_states, &session_id, &input, &agent, max_steps, &tx)
                    .await;
            } else {
                single_turn(&ctx, &loop_states, &session_id, &input, &agent, false, &tx).await;
            }
        });

        rx
    }

    /// Cancel an active loop. Marks the state paused/cancelled, removes
    /// it, and aborts the processor; an in-flight tool execution runs to
    /// completion. Idempotent: a second call returns false.
    pub fn cancel(&self, session_id: &str) -> bool {
        let removed = {
            let mut table = self.loop_states.lock();
            match table.get_mut(session_id) {
                Some(state) => {
                    state.paused = true;
                    state.pause_reason = Some("cancelled".into());
                    table.remove(session_id);
                    true
                }
                None => false,
            }
        };

        if removed {
            if let Some(processor) = self.ctx.processors.get(session_id) {
                processor.lock().abort();
            }
            tracing::info!(session_id = %session_id, "prompt loop cancelled");
        }
        removed
    }

    /// Snapshot of the live loop state, if any.
    pub fn loop_state(&self, session_id: &str) -> Option<LoopState> {
        self.loop_states.lock().get(session_id).cloned()
    }

    /// Re-enter a loop that paused on a question after the reply arrived
    /// out of band. Continuation turns run while the model keeps asking
    /// for tools and the step budget holds.
    pub fn resume(&self, session_id: &str) -> mpsc::Receiver<StreamChunk> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let ctx = self.ctx.clone();
        let loop_states = self.loop_states.clone();
        let session_id = session_id.to_owned();

        tokio::spawn(async move {
            let resumable = {
                let mut table = loop_states.lock();
                match table.get_mut(&session_id) {
                    Some(state) if state.paused => {
                        state.paused = false;
                        state.pause_reason = None;
                        true
                    }
                    _ => false,
                }
            };
            if !resumable {
                let _ = tx
                    .send(StreamChunk::Error {
                        error: "No paused loop to resume".into(),
                    })
                    .await;
                return;
            }

            let agent = ctx
                .sessions
                .get(&session_id)
                .ok()
                .and_then(|s| s.agent_id)
                .and_then(|id| ctx.agents.get(&id))
                .unwrap_or_else(|| ctx.agents.default_agent());

            let continue_input = PromptInput::text("");

            loop {
                let next_step = {
                    let mut table = loop_states.lock();
                    match table.get_mut(&session_id) {
                        Some(state)
                            if state.stop_reason == Some(StopReason::ToolCalls)
                                && !state.paused
                                && state.step < state.max_steps =>
                        {
                            state.step += 1;
                            Some((state.step, state.max_steps))
                        }
                        _ => None,
                    }
                };
                let Some((step, max_steps)) = next_step else {
                    break;
                };

                if !send(
                    &tx,
                    StreamChunk::Text {
                        text: format!("\n[Resuming... step {step}/{max_steps}]\n"),
                    },
                )
                .await
                {
                    break;
                }

                let outcome = single_turn(
                    &ctx,
                    &loop_states,
                    &session_id,
                    &continue_input,
                    &agent,
                    true,
                    &tx,
                )
                .await;
                if outcome.consumer_gone {
                    break;
                }
            }
        });

        rx
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// The agentic loop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn agentic_loop(
    ctx: &Arc<OrchestratorContext>,
    loop_states: &LoopTable,
    session_id: &str,
    input: &PromptInput,
    agent: &AgentInfo,
    max_steps: u32,
    tx: &mpsc::Sender<StreamChunk>,
) {
    loop_states.lock().insert(
        session_id.to_owned(),
        LoopState {
            step: 0,
            max_steps,
            auto_continue: true,
            stop_reason: None,
            paused: false,
            pause_reason: None,
            todo_reminder_count: 0,
            max_todo_reminders: ctx.settings.max_todo_reminders,
            pending_reminder: None,
        },
    );
    let processor = ctx.processors.get_or_create(session_id, max_steps);

    loop {
        // A removed entry means the loop was cancelled out from under us.
        let running = matches!(
            loop_states.lock().get(session_id),
            Some(state) if !state.paused
        );
        if !running || !processor.lock().should_continue() {
            break;
        }

        let Some(step) = ({
            let mut table = loop_states.lock();
            table.get_mut(session_id).map(|state| {
                state.step += 1;
                state.step
            })
        }) else {
            break;
        };

        ctx.bus.publish(
            topics::STEP_STARTED,
            serde_json::json!({
                "session_id": session_id,
                "step": step,
                "max_steps": max_steps,
            }),
        );
        processor.lock().start_step();

        tracing::debug!(session_id = %session_id, step, "agentic loop step");

        let reminder = {
            let mut table = loop_states.lock();
            table
                .get_mut(session_id)
                .and_then(|state| state.pending_reminder.take())
        };

        let (turn_input, is_continuation) = if step == 1 {
            (input.clone(), false)
        } else if let Some(text) = reminder {
            // Reminder turns carry content, so they append a user message.
            (input.with_content(text), false)
        } else {
            (input.with_content(String::new()), true)
        };

        if step > 1 {
            if !send(
                tx,
                StreamChunk::Step {
                    text: format!("Step {step}"),
                },
            )
            .await
            {
                break;
            }
        }

        let outcome = single_turn(
            ctx,
            loop_states,
            session_id,
            &turn_input,
            agent,
            is_continuation,
            tx,
        )
        .await;
        if outcome.consumer_gone {
            break;
        }

        if processor.lock().is_doom_loop() {
            let _ = send(
                tx,
                StreamChunk::Text {
                    text: DOOM_LOOP_WARNING.into(),
                },
            )
            .await;
            processor.lock().finish_step(StepStatus::DoomLoop);
            publish_step_finished(ctx, session_id, step, max_steps);
            break;
        }

        processor.lock().finish_step(StepStatus::Completed);
        publish_step_finished(ctx, session_id, step, max_steps);

        if outcome.stop_reason != Some(StopReason::ToolCalls) {
            // No tool work left this turn; nudge about unfinished todos
            // before letting the loop end.
            let reminded = {
                let mut table = loop_states.lock();
                match table.get_mut(session_id) {
                    Some(state)
                        if state.todo_reminder_count < state.max_todo_reminders
                            && has_pending_todos(&ctx.storage, session_id) =>
                    {
                        state.todo_reminder_count += 1;
                        state.pending_reminder = Some(TODO_REMINDER.into());
                        true
                    }
                    _ => false,
                }
            };
            if reminded {
                tracing::debug!(session_id = %session_id, "pending todos; injecting reminder");
                continue;
            }
            break;
        }
    }

    // Status chunk on exit; no extra LLM call at teardown.
    let snapshot = loop_states.lock().get(session_id).cloned();
    if let Some(state) = snapshot {
        if state.paused {
            let reason = state.pause_reason.as_deref().unwrap_or("unknown");
            let _ = send(
                tx,
                StreamChunk::Text {
                    text: format!("\n[Paused: {reason}]\n"),
                },
            )
            .await;
        } else if state.step >= state.max_steps {
            let _ = send(
                tx,
                StreamChunk::Text {
                    text: format!("\n[Max steps ({}) reached]\n", state.max_steps),
                },
            )
            .await;
        }
    }

    loop_states.lock().remove(session_id);
    ctx.processors.remove(session_id);
}

fn publish_step_finished(
    ctx: &OrchestratorContext,
    session_id: &str,
    step: u32,
    max_steps: u32,
) {
    ctx.bus.publish(
        topics::STEP_FINISHED,
        serde_json::json!({
            "session_id": session_id,
            "step": step,
            "max_steps": max_steps,
        }),
    );
}

/// Whether session-scoped storage holds todos still pending or in
/// progress.
fn has_pending_todos(storage: &Storage, session_id: &str) -> bool {
    let key = vec!["todo".to_owned(), session_id.to_owned()];
    match storage.read(&key) {
        Ok(Some(serde_json::Value::Array(todos))) => todos.iter().any(|todo| {
            matches!(
                todo.get("status").and_then(|s| s.as_str()),
                Some("pending") | Some("in_progress")
            )
        }),
        _ => false,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Single turn
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn single_turn(
    ctx: &Arc<OrchestratorContext>,
    loop_states: &LoopTable,
    session_id: &str,
    input: &PromptInput,
    agent: &AgentInfo,
    is_continuation: bool,
    tx: &mpsc::Sender<StreamChunk>,
) -> TurnOutcome {
    let mut outcome = TurnOutcome::default();

    let session = match ctx.sessions.get(session_id) {
        Ok(session) => session,
        Err(e) => {
            let _ = send(
                tx,
                StreamChunk::Error {
                    error: e.to_string(),
                },
            )
            .await;
            return outcome;
        }
    };

    // Provider/model precedence: explicit input > session default >
    // global default, with prefix inference filling a missing provider.
    let model_id = input
        .model_id
        .clone()
        .or(session.model_id.clone())
        .unwrap_or_else(|| ctx.settings.default_model_id.clone());
    let provider_id = input
        .provider_id
        .clone()
        .or(session.provider_id.clone())
        .unwrap_or_else(|| {
            ctx.providers
                .infer_provider(&model_id, &ctx.settings.default_provider_id)
        });

    let Some(provider) = ctx.providers.get(&provider_id) else {
        let _ = send(
            tx,
            StreamChunk::Error {
                error: format!("Provider not found: {provider_id}"),
            },
        )
        .await;
        return outcome;
    };

    if !input.content.is_empty() && !is_continuation {
        if let Err(e) = ctx.messages.create_user(session_id, &input.content) {
            let _ = send(
                tx,
                StreamChunk::Error {
                    error: e.to_string(),
                },
            )
            .await;
            return outcome;
        }
    }

    let assistant = match ctx
        .messages
        .create_assistant(session_id, Some(&provider_id), Some(&model_id), false)
    {
        Ok(msg) => msg,
        Err(e) => {
            let _ = send(
                tx,
                StreamChunk::Error {
                    error: e.to_string(),
                },
            )
            .await;
            return outcome;
        }
    };

    let result = run_turn_stream(
        ctx,
        loop_states,
        session_id,
        &assistant.id,
        provider.as_ref(),
        &provider_id,
        &model_id,
        input,
        agent,
        tx,
        &mut outcome,
    )
    .await;

    if let Err(e) = result {
        let message = e.to_string();
        let _ = ctx.messages.set_error(session_id, &assistant.id, &message);
        let _ = send(tx, StreamChunk::Error { error: message }).await;
    }

    let _ = ctx.sessions.touch(session_id);
    outcome
}

#[allow(clippy::too_many_arguments)]
async fn run_turn_stream(
    ctx: &Arc<OrchestratorContext>,
    loop_states: &LoopTable,
    session_id: &str,
    assistant_id: &str,
    provider: &dyn maestro_providers::Provider,
    provider_id: &str,
    model_id: &str,
    input: &PromptInput,
    agent: &AgentInfo,
    tx: &mpsc::Sender<StreamChunk>,
    outcome: &mut TurnOutcome,
) -> maestro_domain::Result<()> {
    // Project history for the provider, excluding the empty assistant
    // message just created for this turn.
    let history = ctx.messages.list(session_id, None)?;
    let prior = &history[..history.len().saturating_sub(1)];
    let chat = build_chat_messages(prior);

    let system = ctx
        .agents
        .compose_system_prompt(agent, provider_id, input.system.as_deref());
    let tools = if input.tools_enabled {
        Some(ctx.tools.schema())
    } else {
        None
    };

    let request = StreamRequest {
        model_id: model_id.to_owned(),
        messages: chat,
        tools,
        system,
        temperature: input.temperature.or(agent.temperature),
        max_tokens: input.max_tokens.or(agent.max_tokens),
    };

    let mut stream = provider.stream(request);

    // Text and reasoning accumulate into one running part each.
    let mut text_part_id: Option<String> = None;
    let mut text_acc = String::new();
    let mut reasoning_part_id: Option<String> = None;
    let mut reasoning_acc = String::new();

    while let Some(chunk) = stream.next().await {
        match chunk {
            StreamChunk::Text { text } => {
                text_acc.push_str(&text);
                match &text_part_id {
                    None => {
                        let part = ctx.messages.add_part(
                            session_id,
                            assistant_id,
                            PartBody::Text {
                                content: text_acc.clone(),
                            },
                        )?;
                        text_part_id = Some(part.id);
                    }
                    Some(part_id) => {
                        ctx.messages.update_part(
                            session_id,
                            assistant_id,
                            part_id,
                            PartPatch::content(text_acc.clone()),
                        )?;
                    }
                }
                if !send(tx, StreamChunk::Text { text }).await {
                    outcome.consumer_gone = true;
                    return Ok(());
                }
            }

            StreamChunk::Reasoning { text } => {
                reasoning_acc.push_str(&text);
                match &reasoning_part_id {
                    None => {
                        let part = ctx.messages.add_part(
                            session_id,
                            assistant_id,
                            PartBody::Reasoning {
                                content: reasoning_acc.clone(),
                            },
                        )?;
                        reasoning_part_id = Some(part.id);
                    }
                    Some(part_id) => {
                        ctx.messages.update_part(
                            session_id,
                            assistant_id,
                            part_id,
                            PartPatch::content(reasoning_acc.clone()),
                        )?;
                    }
                }
                if !send(tx, StreamChunk::Reasoning { text }).await {
                    outcome.consumer_gone = true;
                    return Ok(());
                }
            }

            StreamChunk::ToolCall { tool_call } => {
                if handle_tool_call(
                    ctx,
                    loop_states,
                    session_id,
                    assistant_id,
                    &tool_call,
                    agent,
                    tx,
                    outcome,
                )
                .await?
                {
                    return Ok(()); // consumer gone
                }
            }

            StreamChunk::Done { usage, stop_reason } => {
                if let Some(usage) = usage {
                    ctx.messages.set_usage(session_id, assistant_id, usage)?;
                    let cost = ctx
                        .providers
                        .get_model(provider_id, model_id)
                        .map(|model| model.cost_of(&usage))
                        .unwrap_or(0.0);
                    let _ = ctx.sessions.record_usage(
                        session_id,
                        usage.input_tokens,
                        usage.output_tokens,
                        cost,
                    );
                }
                ctx.messages
                    .set_finish(session_id, assistant_id, stop_reason.as_str())?;

                outcome.stop_reason = Some(stop_reason);
                update_loop_state(loop_states, session_id, |state| {
                    state.stop_reason = Some(stop_reason);
                });

                if !send(tx, StreamChunk::Done { usage, stop_reason }).await {
                    outcome.consumer_gone = true;
                    return Ok(());
                }
            }

            StreamChunk::Error { error } => {
                ctx.messages.set_error(session_id, assistant_id, &error)?;
                if !send(tx, StreamChunk::Error { error }).await {
                    outcome.consumer_gone = true;
                }
                return Ok(());
            }

            other => {
                // Providers do not emit ToolResult/Step, but pass anything
                // unexpected through rather than dropping it.
                if !send(tx, other).await {
                    outcome.consumer_gone = true;
                    return Ok(());
                }
            }
        }
    }

    Ok(())
}

/// Handle one provider tool call: permission gate, persistence, state
/// events, execution, and the synthetic result chunk. Returns true when
/// the consumer went away.
#[allow(clippy::too_many_arguments)]
async fn handle_tool_call(
    ctx: &Arc<OrchestratorContext>,
    loop_states: &LoopTable,
    session_id: &str,
    assistant_id: &str,
    tool_call: &ToolCallData,
    agent: &AgentInfo,
    tx: &mpsc::Sender<StreamChunk>,
    outcome: &mut TurnOutcome,
) -> maestro_domain::Result<bool> {
    if is_tool_allowed(agent, &tool_call.name) == PermissionAction::Deny {
        let output = format!(
            "Error: Tool '{}' is not allowed for this agent",
            tool_call.name
        );
        ctx.messages.add_part(
            session_id,
            assistant_id,
            PartBody::ToolCall {
                tool_call_id: tool_call.id.clone(),
                tool_name: tool_call.name.clone(),
                tool_args: tool_call.arguments.clone(),
                tool_status: ToolStatus::Error,
            },
        )?;
        ctx.messages.add_part(
            session_id,
            assistant_id,
            PartBody::ToolResult {
                tool_call_id: tool_call.id.clone(),
                tool_output: output.clone(),
            },
        )?;
        if !send(
            tx,
            StreamChunk::ToolResult {
                tool_call_id: Some(tool_call.id.clone()),
                output,
            },
        )
        .await
        {
            outcome.consumer_gone = true;
            return Ok(true);
        }
        return Ok(false);
    }

    let tool_part = ctx.messages.add_part(
        session_id,
        assistant_id,
        PartBody::ToolCall {
            tool_call_id: tool_call.id.clone(),
            tool_name: tool_call.name.clone(),
            tool_args: tool_call.arguments.clone(),
            tool_status: ToolStatus::Running,
        },
    )?;
    publish_tool_state(
        ctx,
        session_id,
        assistant_id,
        &tool_part.id,
        &tool_call.name,
        "running",
    );

    // Interactive tools pause the loop before they block, so hosts can
    // observe the pause while the question waits for its reply.
    if tool_call.name == "question" && agent.pause_on_question {
        update_loop_state(loop_states, session_id, |state| {
            state.paused = true;
            state.pause_reason = Some("question".into());
        });
    }

    // Re-emit the tool_call chunk before executing so UIs can render
    // interactive tools before they block.
    if !send(
        tx,
        StreamChunk::ToolCall {
            tool_call: tool_call.clone(),
        },
    )
    .await
    {
        outcome.consumer_gone = true;
        return Ok(true);
    }

    let (output, status) = dispatch_tool(ctx, session_id, assistant_id, tool_call, agent).await?;
    outcome.had_tool_calls = true;

    ctx.messages.update_part(
        session_id,
        assistant_id,
        &tool_part.id,
        PartPatch::tool_status(status),
    )?;
    publish_tool_state(
        ctx,
        session_id,
        assistant_id,
        &tool_part.id,
        &tool_call.name,
        status.as_str(),
    );

    // The result arriving lifts a question pause.
    update_loop_state(loop_states, session_id, |state| {
        if state.paused && state.pause_reason.as_deref() == Some("question") {
            state.paused = false;
            state.pause_reason = None;
        }
    });

    if !send(
        tx,
        StreamChunk::ToolResult {
            tool_call_id: Some(tool_call.id.clone()),
            output,
        },
    )
    .await
    {
        outcome.consumer_gone = true;
        return Ok(true);
    }

    Ok(false)
}

/// Execute a tool and persist its result part. Returns the output text
/// fed back to the model and the terminal status.
async fn dispatch_tool(
    ctx: &Arc<OrchestratorContext>,
    session_id: &str,
    message_id: &str,
    tool_call: &ToolCallData,
    agent: &AgentInfo,
) -> maestro_domain::Result<(String, ToolStatus)> {
    let processor = ctx.processors.get_or_create(session_id, agent.max_steps);
    let doomed = processor
        .lock()
        .record_tool_call(&tool_call.name, &tool_call.arguments);

    let (output, status) = if doomed {
        tracing::warn!(
            session_id = %session_id,
            tool = %tool_call.name,
            "doom loop detected; skipping execution"
        );
        (
            format!(
                "Error: Doom loop detected - tool '{}' called repeatedly",
                tool_call.name
            ),
            ToolStatus::Error,
        )
    } else if let Some(tool) = ctx.tools.get(&tool_call.name) {
        let tool_ctx = ToolContext {
            session_id: session_id.to_owned(),
            message_id: message_id.to_owned(),
            tool_call_id: Some(tool_call.id.clone()),
            agent: agent.id.clone(),
        };
        match tool.execute(tool_call.arguments.clone(), tool_ctx).await {
            Ok(result) => {
                let result = truncate_output(tool.as_ref(), result);
                (
                    format!("[{}]\n{}", result.title, result.output),
                    ToolStatus::Completed,
                )
            }
            Err(e) => (format!("Error executing tool: {e}"), ToolStatus::Error),
        }
    } else {
        (
            format!("Error: Tool '{}' not found", tool_call.name),
            ToolStatus::Error,
        )
    };

    ctx.messages.add_part(
        session_id,
        message_id,
        PartBody::ToolResult {
            tool_call_id: tool_call.id.clone(),
            tool_output: output.clone(),
        },
    )?;

    Ok((output, status))
}

fn publish_tool_state(
    ctx: &OrchestratorContext,
    session_id: &str,
    message_id: &str,
    part_id: &str,
    tool_name: &str,
    status: &str,
) {
    ctx.bus.publish(
        topics::TOOL_STATE_CHANGED,
        serde_json::json!({
            "session_id": session_id,
            "message_id": message_id,
            "part_id": part_id,
            "tool_name": tool_name,
            "status": status,
        }),
    );
}

fn update_loop_state<F>(loop_states: &LoopTable, session_id: &str, mutate: F)
where
    F: FnOnce(&mut LoopState),
{
    if let Some(state) = loop_states.lock().get_mut(session_id) {
        mutate(state);
    }
}

async fn send(tx: &mpsc::Sender<StreamChunk>, chunk: StreamChunk) -> bool {
    tx.send(chunk).await.is_ok()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// History projection
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Flatten persisted history into provider messages.
///
/// Assistant messages become their joined text; tool results follow as a
/// synthetic user message of `Tool result:` blocks. Tool-call summaries
/// are never rendered as text — models imitate the pattern instead of
/// emitting structured tool calls.
pub(crate) fn build_chat_messages(history: &[MessageEntry]) -> Vec<ChatMessage> {
    let mut messages = Vec::new();

    for entry in history {
        match entry {
            MessageEntry::User(msg) => {
                // Empty continuation turns are dropped.
                if !msg.content.is_empty() {
                    messages.push(ChatMessage::user(&msg.content));
                }
            }
            MessageEntry::Assistant(msg) => {
                let mut text = String::new();
                let mut tool_results: Vec<&str> = Vec::new();

                for part in &msg.parts {
                    match &part.body {
                        PartBody::Text { content } => text.push_str(content),
                        PartBody::ToolResult { tool_output, .. } => {
                            tool_results.push(tool_output)
                        }
                        _ => {}
                    }
                }

                if !text.is_empty() {
                    messages.push(ChatMessage::assistant(text));
                }
                if !tool_results.is_empty() {
                    let blocks: Vec<String> = tool_results
                        .iter()
                        .map(|output| format!("Tool result:\n{output}"))
                        .collect();
                    messages.push(ChatMessage::user(blocks.join("\n\n")));
                }
            }
        }
    }

    messages
}
