//! Context compaction: prune old tool outputs and summarize history with
//! the hidden `compaction` agent.
//!
//! Prune is cheap and lossless-enough — it replaces old completed tool
//! outputs with a marker once they fall outside a protected token window.
//! Compact is the heavier path: an LLM-written summary message that future
//! turns can stand on, with a deterministic structural fallback when the
//! stream fails.

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::Serialize;
use std::sync::Arc;

use maestro_core::bus::topics;
use maestro_domain::chat::ChatMessage;
use maestro_domain::model::ModelInfo;
use maestro_domain::stream::StreamChunk;
use maestro_providers::StreamRequest;
use maestro_sessions::message::{MessageEntry, PartBody, PartPatch, ToolStatus};
use maestro_sessions::token::{count_messages, estimate, is_overflow as token_is_overflow};

use crate::context::OrchestratorContext;
use crate::prompt::build_chat_messages;

/// Auto-compact once a session holds this many messages.
pub const COMPACTION_THRESHOLD: usize = 50;
/// Keep at least this many estimated tokens of recent tool outputs.
pub const PRUNE_PROTECT: u64 = 40_000;
/// Do not persist a prune that reclaims less than this.
pub const PRUNE_MINIMUM: u64 = 20_000;
/// Tools whose outputs are never pruned.
pub const PRUNE_PROTECTED_TOOLS: &[&str] = &["skill"];
/// Replacement text for pruned outputs; also the boundary marker a later
/// prune scan stops at.
pub const PRUNED_MARKER: &str = "[pruned]";

const COMPACTION_PROMPT: &str =
    "Provide a detailed prompt for continuing our conversation above. \
     Focus on information that would be helpful for continuing the conversation, \
     including what we did, what we're doing, which files we're working on, \
     and what we're going to do next considering new session will not have \
     access to our conversation.";

/// Outcome of a persisted prune.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PruneResult {
    pub pruned_count: usize,
    pub tokens_saved: u64,
}

/// Outcome of a compaction run.
#[derive(Debug, Clone, Serialize)]
pub struct CompactionResult {
    pub session_id: String,
    pub summary: String,
    pub messages_compacted: usize,
    pub tokens_saved: u64,
    pub cost_saved: f64,
    pub compacted_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Prune
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Replace old completed tool outputs with [`PRUNED_MARKER`].
///
/// Scans newest-to-oldest, skipping the latest two user turns entirely
/// and halting at summary messages and prior prune boundaries. Outputs
/// inside the most recent [`PRUNE_PROTECT`] estimated tokens are kept;
/// everything older is marked. Nothing is persisted unless the marked
/// total beats [`PRUNE_MINIMUM`].
pub fn prune(
    ctx: &Arc<OrchestratorContext>,
    session_id: &str,
) -> maestro_domain::Result<Option<PruneResult>> {
    let messages = ctx.messages.list(session_id, None)?;

    let mut turns = 0usize;
    let mut total: u64 = 0;
    let mut saved: u64 = 0;
    // (message_id, part_id) pairs whose output gets replaced.
    let mut marked: Vec<(String, String)> = Vec::new();

    'scan: for entry in messages.iter().rev() {
        match entry {
            MessageEntry::User(_) => {
                turns += 1;
            }
            MessageEntry::Assistant(msg) => {
                if msg.summary {
                    break 'scan;
                }
                if turns < 2 {
                    continue;
                }

                for part in msg.parts.iter().rev() {
                    let PartBody::ToolResult {
                        tool_call_id,
                        tool_output,
                    } = &part.body
                    else {
                        continue;
                    };

                    // Only completed results are candidates; resolve the
                    // paired call for its name and status.
                    let Some((tool_name, status)) = paired_call(msg, tool_call_id) else {
                        continue;
                    };
                    if status != ToolStatus::Completed {
                        continue;
                    }
                    if PRUNE_PROTECTED_TOOLS.contains(&tool_name) {
                        continue;
                    }
                    if tool_output.starts_with(PRUNED_MARKER) {
                        // Boundary of a previous prune; older outputs are
                        // already gone.
                        break 'scan;
                    }

                    let tokens = estimate(tool_output);
                    total += tokens;
                    if total > PRUNE_PROTECT {
                        marked.push((msg.id.clone(), part.id.clone()));
                        saved += tokens;
                    }
                }
            }
        }
    }

    if saved <= PRUNE_MINIMUM {
        return Ok(None);
    }

    for (message_id, part_id) in &marked {
        ctx.messages.update_part(
            session_id,
            message_id,
            part_id,
            PartPatch::tool_output(PRUNED_MARKER),
        )?;
    }

    tracing::info!(
        session_id = %session_id,
        pruned = marked.len(),
        tokens_saved = saved,
        "pruned old tool outputs"
    );

    Ok(Some(PruneResult {
        pruned_count: marked.len(),
        tokens_saved: saved,
    }))
}

fn paired_call<'a>(
    msg: &'a maestro_sessions::message::AssistantMessage,
    tool_call_id: &str,
) -> Option<(&'a str, ToolStatus)> {
    msg.parts.iter().find_map(|part| match &part.body {
        PartBody::ToolCall {
            tool_call_id: id,
            tool_name,
            tool_status,
            ..
        } if id == tool_call_id => Some((tool_name.as_str(), *tool_status)),
        _ => None,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Compact
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Summarize the session's history into a `summary = true` assistant
/// message. Returns `None` when there is nothing to compact or no
/// provider adapter is registered for the resolved model.
pub async fn compact(
    ctx: &Arc<OrchestratorContext>,
    session_id: &str,
) -> maestro_domain::Result<Option<CompactionResult>> {
    let session = ctx.sessions.get(session_id)?;
    let messages = ctx.messages.list(session_id, None)?;
    if messages.is_empty() {
        return Ok(None);
    }

    let agent = ctx
        .agents
        .get("compaction")
        .unwrap_or_else(|| ctx.agents.default_agent());

    // Model precedence: the compaction agent's binding, else the
    // session's, else the configured default.
    let (provider_id, model_id) = match &agent.model {
        Some(binding) => (binding.provider_id.clone(), binding.model_id.clone()),
        None => {
            let model_id = session
                .model_id
                .clone()
                .unwrap_or_else(|| ctx.settings.default_model_id.clone());
            let provider_id = session.provider_id.clone().unwrap_or_else(|| {
                ctx.providers
                    .infer_provider(&model_id, &ctx.settings.default_provider_id)
            });
            (provider_id, model_id)
        }
    };

    let Some(provider) = ctx.providers.get(&provider_id) else {
        tracing::warn!(
            session_id = %session_id,
            provider_id = %provider_id,
            "compaction skipped; provider not registered"
        );
        return Ok(None);
    };

    let pre_tokens = count_messages(&messages).total;
    let messages_compacted = messages.len();

    let summary_msg =
        ctx.messages
            .create_assistant(session_id, Some(&provider_id), Some(&model_id), true)?;

    let mut chat = build_chat_messages(&messages);
    chat.push(ChatMessage::user(COMPACTION_PROMPT));

    let request = StreamRequest {
        model_id: model_id.clone(),
        messages: chat,
        tools: None,
        system: ctx
            .agents
            .compose_system_prompt(&agent, &provider_id, None),
        temperature: agent.temperature,
        max_tokens: agent.max_tokens,
    };

    // Collect the streamed summary; any stream error falls back to the
    // deterministic structural summary.
    let mut summary = String::new();
    let mut failed = false;
    let mut stream = provider.stream(request);
    while let Some(chunk) = stream.next().await {
        match chunk {
            StreamChunk::Text { text } => summary.push_str(&text),
            StreamChunk::Error { error } => {
                tracing::warn!(
                    session_id = %session_id,
                    error = %error,
                    "compaction stream failed; using structural fallback"
                );
                failed = true;
                break;
            }
            _ => {}
        }
    }
    if failed || summary.trim().is_empty() {
        summary = fallback_summary(&messages, pre_tokens);
    }

    ctx.messages.add_part(
        session_id,
        &summary_msg.id,
        PartBody::Text {
            content: summary.clone(),
        },
    )?;

    ctx.bus.publish(
        topics::SESSION_UPDATED,
        serde_json::json!({"id": session.id, "title": session.title}),
    );

    let tokens_saved = pre_tokens.saturating_sub(estimate(&summary));
    Ok(Some(CompactionResult {
        session_id: session_id.to_owned(),
        summary,
        messages_compacted,
        tokens_saved,
        // Flagged as unit-confused relative to per-million-token pricing;
        // kept as-is until the accounting is settled.
        cost_saved: tokens_saved as f64 * 1e-8,
        compacted_at: Utc::now(),
    }))
}

/// Deterministic summary used when the LLM stream fails: message count,
/// the first and last exchanges, and the running totals.
fn fallback_summary(messages: &[MessageEntry], total_tokens: u64) -> String {
    let mut lines = vec![format!(
        "[Conversation Summary - {} messages]",
        messages.len()
    )];

    if let Some(first) = messages.iter().find_map(entry_text) {
        lines.push(format!("First message: {}", clip(&first, 200)));
    }
    if let Some(last) = messages.iter().rev().find_map(entry_text) {
        lines.push(format!("Last message: {}", clip(&last, 200)));
    }
    lines.push(format!("Estimated tokens: {total_tokens}"));

    lines.join("\n")
}

fn entry_text(entry: &MessageEntry) -> Option<String> {
    match entry {
        MessageEntry::User(msg) if !msg.content.is_empty() => Some(msg.content.clone()),
        MessageEntry::Assistant(msg) => {
            let text: String = msg
                .parts
                .iter()
                .filter_map(|part| match &part.body {
                    PartBody::Text { content } => Some(content.as_str()),
                    _ => None,
                })
                .collect();
            if text.is_empty() {
                None
            } else {
                Some(text)
            }
        }
        _ => None,
    }
}

fn clip(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_owned()
    } else {
        let clipped: String = text.chars().take(max_chars).collect();
        format!("{clipped}...")
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Thresholds
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Whether the session has grown enough to warrant compaction.
pub fn should_compact(
    ctx: &Arc<OrchestratorContext>,
    session_id: &str,
) -> maestro_domain::Result<bool> {
    let messages = ctx.messages.list(session_id, None)?;
    Ok(messages.len() >= COMPACTION_THRESHOLD)
}

/// Token-accountant overflow check over the session's current messages.
pub fn is_overflow(
    ctx: &Arc<OrchestratorContext>,
    session_id: &str,
    model: &ModelInfo,
) -> maestro_domain::Result<bool> {
    let messages = ctx.messages.list(session_id, None)?;
    Ok(token_is_overflow(&messages, model))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> Arc<OrchestratorContext> {
        OrchestratorContext::in_memory()
    }

    /// Seed one user turn followed by an assistant message carrying a
    /// completed tool call/result pair with `output_chars` characters.
    fn seed_turn(ctx: &Arc<OrchestratorContext>, session_id: &str, n: usize, output_chars: usize) {
        ctx.messages
            .create_user(session_id, &format!("turn {n}"))
            .unwrap();
        let msg = ctx
            .messages
            .create_assistant(session_id, None, None, false)
            .unwrap();
        ctx.messages
            .add_part(
                session_id,
                &msg.id,
                PartBody::ToolCall {
                    tool_call_id: format!("c{n}"),
                    tool_name: "websearch".into(),
                    tool_args: serde_json::json!({"q": n}),
                    tool_status: ToolStatus::Completed,
                },
            )
            .unwrap();
        ctx.messages
            .add_part(
                session_id,
                &msg.id,
                PartBody::ToolResult {
                    tool_call_id: format!("c{n}"),
                    tool_output: "a".repeat(output_chars),
                },
            )
            .unwrap();
    }

    fn pruned_outputs(ctx: &Arc<OrchestratorContext>, session_id: &str) -> Vec<String> {
        let mut outputs = Vec::new();
        for entry in ctx.messages.list(session_id, None).unwrap() {
            if let MessageEntry::Assistant(msg) = entry {
                for part in msg.parts {
                    if let PartBody::ToolResult { tool_output, .. } = part.body {
                        outputs.push(tool_output);
                    }
                }
            }
        }
        outputs
    }

    #[test]
    fn prune_replaces_old_outputs_and_keeps_recent_turns() {
        let ctx = ctx();
        let session = ctx.sessions.create(Default::default()).unwrap();

        // Eight turns, each tool output ~15_000 tokens (60_000 chars).
        for n in 0..8 {
            seed_turn(&ctx, &session.id, n, 60_000);
        }

        let result = prune(&ctx, &session.id).unwrap().unwrap();
        assert!(result.pruned_count >= 1);
        assert!(result.tokens_saved > PRUNE_MINIMUM);

        let outputs = pruned_outputs(&ctx, &session.id);
        // The two most recent turns are untouched.
        assert!(!outputs[7].starts_with(PRUNED_MARKER));
        assert!(!outputs[6].starts_with(PRUNED_MARKER));
        // The oldest turns got the marker.
        assert_eq!(outputs[0], PRUNED_MARKER);
        assert_eq!(outputs[1], PRUNED_MARKER);
    }

    #[test]
    fn prune_below_minimum_is_a_noop() {
        let ctx = ctx();
        let session = ctx.sessions.create(Default::default()).unwrap();

        // Small outputs: prunable total stays under PRUNE_MINIMUM.
        for n in 0..8 {
            seed_turn(&ctx, &session.id, n, 4_000); // ~1_000 tokens each
        }

        assert!(prune(&ctx, &session.id).unwrap().is_none());
        let outputs = pruned_outputs(&ctx, &session.id);
        assert!(outputs.iter().all(|o| !o.starts_with(PRUNED_MARKER)));
    }

    #[test]
    fn prune_skips_protected_tools() {
        let ctx = ctx();
        let session = ctx.sessions.create(Default::default()).unwrap();

        for n in 0..4 {
            ctx.messages
                .create_user(&session.id, &format!("turn {n}"))
                .unwrap();
            let msg = ctx
                .messages
                .create_assistant(&session.id, None, None, false)
                .unwrap();
            ctx.messages
                .add_part(
                    &session.id,
                    &msg.id,
                    PartBody::ToolCall {
                        tool_call_id: format!("c{n}"),
                        tool_name: "skill".into(),
                        tool_args: serde_json::json!({}),
                        tool_status: ToolStatus::Completed,
                    },
                )
                .unwrap();
            ctx.messages
                .add_part(
                    &session.id,
                    &msg.id,
                    PartBody::ToolResult {
                        tool_call_id: format!("c{n}"),
                        tool_output: "s".repeat(400_000),
                    },
                )
                .unwrap();
        }

        assert!(prune(&ctx, &session.id).unwrap().is_none());
    }

    #[test]
    fn prune_ignores_incomplete_tool_results() {
        let ctx = ctx();
        let session = ctx.sessions.create(Default::default()).unwrap();

        for n in 0..4 {
            ctx.messages
                .create_user(&session.id, &format!("turn {n}"))
                .unwrap();
            let msg = ctx
                .messages
                .create_assistant(&session.id, None, None, false)
                .unwrap();
            ctx.messages
                .add_part(
                    &session.id,
                    &msg.id,
                    PartBody::ToolCall {
                        tool_call_id: format!("c{n}"),
                        tool_name: "websearch".into(),
                        tool_args: serde_json::json!({}),
                        tool_status: ToolStatus::Error,
                    },
                )
                .unwrap();
            ctx.messages
                .add_part(
                    &session.id,
                    &msg.id,
                    PartBody::ToolResult {
                        tool_call_id: format!("c{n}"),
                        tool_output: "e".repeat(400_000),
                    },
                )
                .unwrap();
        }

        assert!(prune(&ctx, &session.id).unwrap().is_none());
    }

    #[test]
    fn prune_halts_at_summary_message() {
        let ctx = ctx();
        let session = ctx.sessions.create(Default::default()).unwrap();

        // Old heavy turns behind a summary message.
        for n in 0..4 {
            seed_turn(&ctx, &session.id, n, 400_000);
        }
        ctx.messages
            .create_assistant(&session.id, None, None, true)
            .unwrap();
        // Light recent turns in front of it.
        for n in 4..7 {
            seed_turn(&ctx, &session.id, n, 400);
        }

        // Everything behind the summary is out of scope, so nothing
        // crosses the minimum.
        assert!(prune(&ctx, &session.id).unwrap().is_none());
    }

    #[tokio::test]
    async fn compact_without_provider_returns_none() {
        let ctx = ctx();
        let session = ctx.sessions.create(Default::default()).unwrap();
        for n in 0..10 {
            ctx.messages
                .create_user(&session.id, &format!("message {n}"))
                .unwrap();
        }

        // No provider registered for the default model.
        assert!(compact(&ctx, &session.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn compact_on_empty_session_returns_none() {
        let ctx = ctx();
        let session = ctx.sessions.create(Default::default()).unwrap();
        assert!(compact(&ctx, &session.id).await.unwrap().is_none());
    }

    #[test]
    fn fallback_summary_shape() {
        let ctx = ctx();
        let session = ctx.sessions.create(Default::default()).unwrap();
        for n in 0..10 {
            ctx.messages
                .create_user(&session.id, &format!("message {n}"))
                .unwrap();
        }
        let messages = ctx.messages.list(&session.id, None).unwrap();

        let summary = fallback_summary(&messages, count_messages(&messages).total);
        assert!(summary.contains("[Conversation Summary - 10 messages]"));
        assert!(summary.contains("First message: message 0"));
        assert!(summary.contains("Last message: message 9"));
    }

    #[test]
    fn should_compact_threshold() {
        let ctx = ctx();
        let session = ctx.sessions.create(Default::default()).unwrap();
        for _ in 0..COMPACTION_THRESHOLD - 1 {
            ctx.messages.create_user(&session.id, "m").unwrap();
        }
        assert!(!should_compact(&ctx, &session.id).unwrap());

        ctx.messages.create_user(&session.id, "m").unwrap();
        assert!(should_compact(&ctx, &session.id).unwrap());
    }
}
