//! The interactive `question` tool and its out-of-band reply channel.
//!
//! Asking blocks the agentic loop on a one-shot rendezvous keyed by the
//! request ID (the parent tool-call ID when there is one). The HTTP layer
//! — or any other host — resolves the rendezvous through
//! [`QuestionChannel::reply`] / [`QuestionChannel::reject`]; a timeout
//! guarantees the loop never blocks forever.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::oneshot;

use maestro_core::bus::{topics, EventBus};
use maestro_domain::{Error, Identifier, IdPrefix, Result};

use crate::tool::{Tool, ToolContext, ToolOutput};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Question shapes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A single option for a question.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionOption {
    /// Display text (1-5 words, concise).
    pub label: String,
    /// Explanation of the choice.
    #[serde(default)]
    pub description: String,
}

/// A question to ask the user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionInfo {
    /// Complete question text.
    pub question: String,
    /// Very short label (max 30 chars).
    pub header: String,
    /// Available choices; the schema requires at least two.
    #[serde(default)]
    pub options: Vec<QuestionOption>,
    /// Allow selecting more than one choice.
    #[serde(default)]
    pub multiple: bool,
    /// Allow typing a custom answer.
    #[serde(default = "d_true")]
    pub custom: bool,
}

/// A request published on the bus when questions are asked.
#[derive(Debug, Clone, Serialize)]
pub struct QuestionRequest {
    pub id: String,
    pub session_id: String,
    pub questions: Vec<QuestionInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

/// The user's reply: per-question lists of selected labels.
#[derive(Debug, Clone, Deserialize)]
pub struct QuestionReply {
    pub request_id: String,
    pub answers: Vec<Vec<String>>,
}

/// How a pending question was resolved.
#[derive(Debug, Clone)]
pub enum QuestionDecision {
    Answered(Vec<Vec<String>>),
    Rejected,
}

fn d_true() -> bool {
    true
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Channel
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One-shot rendezvous table for pending questions.
///
/// Each request ID resolves at most once: `reply`/`reject` consume the
/// sender, so later calls for the same ID return `false`.
pub struct QuestionChannel {
    pending: Mutex<HashMap<String, oneshot::Sender<QuestionDecision>>>,
    bus: Arc<EventBus>,
    timeout: Duration,
}

impl QuestionChannel {
    pub fn new(bus: Arc<EventBus>, timeout: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            bus,
            timeout,
        }
    }

    /// Publish the request and block until a reply, a rejection, or the
    /// configured timeout. The rendezvous is registered before the first
    /// await so a reply can never race past it.
    pub async fn ask(&self, request: QuestionRequest) -> Result<QuestionDecision> {
        self.ask_with_timeout(request, self.timeout).await
    }

    pub async fn ask_with_timeout(
        &self,
        request: QuestionRequest,
        timeout: Duration,
    ) -> Result<QuestionDecision> {
        let request_id = request.id.clone();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id.clone(), tx);

        self.bus.publish(
            topics::QUESTION_ASKED,
            serde_json::to_value(&request).unwrap_or_default(),
        );

        tracing::info!(
            request_id = %request_id,
            questions = request.questions.len(),
            timeout_secs = timeout.as_secs(),
            "waiting for question reply"
        );

        let outcome = tokio::time::timeout(timeout, rx).await;
        // Whatever happened, the key must not linger.
        self.pending.lock().remove(&request_id);

        match outcome {
            Ok(Ok(decision)) => Ok(decision),
            Ok(Err(_)) => Err(Error::Question(format!(
                "reply channel closed for request {request_id}"
            ))),
            Err(_) => Err(Error::Timeout(format!(
                "Question timed out after {} seconds",
                timeout.as_secs()
            ))),
        }
    }

    /// Deliver answers to a pending question. Returns whether a pending
    /// request matched.
    pub fn reply(&self, request_id: &str, answers: Vec<Vec<String>>) -> bool {
        let sender = self.pending.lock().remove(request_id);
        let Some(sender) = sender else {
            tracing::warn!(request_id = %request_id, "reply for unknown question request");
            return false;
        };

        let _ = sender.send(QuestionDecision::Answered(answers.clone()));
        self.bus.publish(
            topics::QUESTION_REPLIED,
            serde_json::json!({"request_id": request_id, "answers": answers}),
        );
        true
    }

    /// Dismiss a pending question without answering.
    pub fn reject(&self, request_id: &str) -> bool {
        let sender = self.pending.lock().remove(request_id);
        let Some(sender) = sender else {
            return false;
        };

        let _ = sender.send(QuestionDecision::Rejected);
        self.bus.publish(
            topics::QUESTION_REJECTED,
            serde_json::json!({"request_id": request_id}),
        );
        true
    }

    /// Currently-pending request IDs.
    pub fn pending(&self) -> Vec<String> {
        self.pending.lock().keys().cloned().collect()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const QUESTION_DESCRIPTION: &str = "\
Use this tool when you need to ask the user questions during execution. This allows you to:
1. Gather user preferences or requirements
2. Clarify ambiguous instructions
3. Get decisions on implementation choices as you work
4. Offer choices to the user about what direction to take.

IMPORTANT: You MUST provide at least 2 options for each question. Never ask open-ended questions without choices.

Usage notes:
- REQUIRED: Every question MUST have at least 2 options (minItems: 2)
- When `custom` is enabled (default), a \"Type your own answer\" option is added automatically; don't include \"Other\" or catch-all options
- Answers are returned as arrays of labels; set `multiple: true` to allow selecting more than one
- If you recommend a specific option, make that the first option in the list and add \"(Recommended)\" at the end of the label
";

/// The interactive question tool. Blocks the loop on the channel until an
/// out-of-band reply arrives.
pub struct QuestionTool {
    channel: Arc<QuestionChannel>,
}

impl QuestionTool {
    pub fn new(channel: Arc<QuestionChannel>) -> Self {
        Self { channel }
    }
}

#[async_trait::async_trait]
impl Tool for QuestionTool {
    fn id(&self) -> &str {
        "question"
    }

    fn description(&self) -> &str {
        QUESTION_DESCRIPTION
    }

    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "questions": {
                    "type": "array",
                    "description": "Questions to ask",
                    "items": {
                        "type": "object",
                        "properties": {
                            "question": {
                                "type": "string",
                                "description": "Complete question"
                            },
                            "header": {
                                "type": "string",
                                "description": "Very short label (max 30 chars)"
                            },
                            "options": {
                                "type": "array",
                                "description": "Available choices (MUST provide at least 2 options)",
                                "minItems": 2,
                                "items": {
                                    "type": "object",
                                    "properties": {
                                        "label": {
                                            "type": "string",
                                            "description": "Display text (1-5 words, concise)"
                                        },
                                        "description": {
                                            "type": "string",
                                            "description": "Explanation of choice"
                                        }
                                    },
                                    "required": ["label", "description"]
                                }
                            },
                            "multiple": {
                                "type": "boolean",
                                "description": "Allow selecting multiple choices",
                                "default": false
                            }
                        },
                        "required": ["question", "header", "options"]
                    }
                }
            },
            "required": ["questions"]
        })
    }

    async fn execute(&self, args: Value, ctx: ToolContext) -> Result<ToolOutput> {
        let questions: Vec<QuestionInfo> = match args.get("questions") {
            Some(value) => serde_json::from_value(value.clone())?,
            None => Vec::new(),
        };

        if questions.is_empty() {
            return Ok(ToolOutput::new("No questions", "No questions were provided."));
        }

        // Prefer the parent tool-call ID so the frontend can address the
        // reply without an extra lookup.
        let request_id = ctx
            .tool_call_id
            .clone()
            .unwrap_or_else(|| Identifier::generate(IdPrefix::Question));

        let request = QuestionRequest {
            id: request_id,
            session_id: ctx.session_id.clone(),
            questions: questions.clone(),
            tool_call_id: ctx.tool_call_id.clone(),
            message_id: Some(ctx.message_id.clone()),
        };

        match self.channel.ask(request).await {
            Ok(QuestionDecision::Answered(answers)) => {
                let formatted = questions
                    .iter()
                    .enumerate()
                    .map(|(i, q)| {
                        let answer = answers
                            .get(i)
                            .filter(|a| !a.is_empty())
                            .map(|a| a.join(", "))
                            .unwrap_or_else(|| "Unanswered".into());
                        format!("\"{}\"=\"{}\"", q.question, answer)
                    })
                    .collect::<Vec<_>>()
                    .join(", ");

                let plural = if questions.len() > 1 { "s" } else { "" };
                Ok(ToolOutput::new(
                    format!("Asked {} question{plural}", questions.len()),
                    format!(
                        "User has answered your questions: {formatted}. \
                         You can now continue with the user's answers in mind."
                    ),
                )
                .with_metadata(serde_json::json!({"answers": answers})))
            }
            Ok(QuestionDecision::Rejected) => Ok(ToolOutput::new(
                "Questions dismissed",
                "The user dismissed the questions without answering.",
            )
            .with_metadata(serde_json::json!({"rejected": true}))),
            Err(Error::Timeout(message)) => Ok(ToolOutput::new("Questions timed out", message)
                .with_metadata(serde_json::json!({"timeout": true}))),
            Err(e) => Err(e),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
