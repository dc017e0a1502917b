//! Message log: user and assistant messages, assistant parts, and the
//! store that persists them and mirrors every mutation onto the bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use maestro_core::bus::{topics, EventBus};
use maestro_core::storage::Storage;
use maestro_domain::{Error, Identifier, IdPrefix, Result, TokenUsage};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Parts
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Lifecycle of a tool-call part. Advances monotonically
/// pending → running → (completed | error).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Pending,
    Running,
    Completed,
    Error,
}

impl ToolStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

/// The typed payload of a message part.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PartBody {
    /// Streamed assistant text; content grows until the part is sealed.
    Text { content: String },

    /// Provider-surfaced thinking text, same accumulation rules.
    Reasoning { content: String },

    ToolCall {
        tool_call_id: String,
        tool_name: String,
        #[serde(default)]
        tool_args: serde_json::Value,
        tool_status: ToolStatus,
    },

    /// Paired 1:1 with an earlier `ToolCall` via `tool_call_id`.
    ToolResult {
        tool_call_id: String,
        tool_output: String,
    },

    StepStart {
        step_number: u32,
        max_steps: u32,
    },

    StepFinish {
        step_number: u32,
        max_steps: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input_tokens: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_tokens: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cost: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stop_reason: Option<String>,
    },
}

/// One typed fragment of an assistant message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePart {
    pub id: String,
    pub session_id: String,
    pub message_id: String,
    #[serde(flatten)]
    pub body: PartBody,
}

/// Field patch applied by [`MessageStore::update_part`]. Only fields that
/// exist on the part's variant are touched.
#[derive(Debug, Clone, Default)]
pub struct PartPatch {
    pub content: Option<String>,
    pub tool_status: Option<ToolStatus>,
    pub tool_output: Option<String>,
}

impl PartPatch {
    pub fn content(text: impl Into<String>) -> Self {
        Self {
            content: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn tool_status(status: ToolStatus) -> Self {
        Self {
            tool_status: Some(status),
            ..Self::default()
        }
    }

    pub fn tool_output(output: impl Into<String>) -> Self {
        Self {
            tool_output: Some(output.into()),
            ..Self::default()
        }
    }

    fn apply(&self, body: &mut PartBody) {
        match body {
            PartBody::Text { content } | PartBody::Reasoning { content } => {
                if let Some(new) = &self.content {
                    *content = new.clone();
                }
            }
            PartBody::ToolCall { tool_status, .. } => {
                if let Some(status) = self.tool_status {
                    *tool_status = status;
                }
            }
            PartBody::ToolResult { tool_output, .. } => {
                if let Some(output) = &self.tool_output {
                    *tool_output = output.clone();
                }
            }
            PartBody::StepStart { .. } | PartBody::StepFinish { .. } => {}
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Messages
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Plain text from the user; immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserMessage {
    pub id: String,
    pub session_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// A model response: empty at creation, grows an ordered part list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub id: String,
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub provider_id: Option<String>,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub parts: Vec<MessagePart>,
    #[serde(default)]
    pub usage: Option<TokenUsage>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub finish: Option<String>,
    /// True when this message was produced by compaction.
    #[serde(default)]
    pub summary: bool,
}

/// A message as stored in the log, discriminated on `role`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum MessageEntry {
    User(UserMessage),
    Assistant(AssistantMessage),
}

impl MessageEntry {
    pub fn id(&self) -> &str {
        match self {
            Self::User(m) => &m.id,
            Self::Assistant(m) => &m.id,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            Self::User(m) => m.created_at,
            Self::Assistant(m) => m.created_at,
        }
    }

    pub fn as_assistant(&self) -> Option<&AssistantMessage> {
        match self {
            Self::Assistant(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_user(&self) -> Option<&UserMessage> {
        match self {
            Self::User(m) => Some(m),
            _ => None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Append-only message store over [`Storage`], publishing a bus event
/// after every committed write. Layout: `message/{session_id}/{message_id}`.
#[derive(Clone)]
pub struct MessageStore {
    storage: Storage,
    bus: Arc<EventBus>,
}

impl MessageStore {
    pub fn new(storage: Storage, bus: Arc<EventBus>) -> Self {
        Self { storage, bus }
    }

    fn message_key(session_id: &str, message_id: &str) -> Vec<String> {
        vec!["message".into(), session_id.into(), message_id.into()]
    }

    fn publish_message_updated(&self, session_id: &str, message_id: &str) {
        self.bus.publish(
            topics::MESSAGE_UPDATED,
            serde_json::json!({"session_id": session_id, "message_id": message_id}),
        );
    }

    fn publish_part_updated(&self, session_id: &str, message_id: &str, part_id: &str) {
        self.bus.publish(
            topics::PART_UPDATED,
            serde_json::json!({
                "session_id": session_id,
                "message_id": message_id,
                "part_id": part_id,
            }),
        );
    }

    /// Append a user message.
    pub fn create_user(&self, session_id: &str, content: &str) -> Result<UserMessage> {
        let msg = UserMessage {
            id: Identifier::generate(IdPrefix::Message),
            session_id: session_id.to_owned(),
            content: content.to_owned(),
            created_at: Utc::now(),
        };

        self.storage.write(
            &Self::message_key(session_id, &msg.id),
            serde_json::to_value(MessageEntry::User(msg.clone()))?,
        )?;
        self.publish_message_updated(session_id, &msg.id);
        Ok(msg)
    }

    /// Append an empty assistant message tagged with its provider/model.
    pub fn create_assistant(
        &self,
        session_id: &str,
        provider_id: Option<&str>,
        model_id: Option<&str>,
        summary: bool,
    ) -> Result<AssistantMessage> {
        let msg = AssistantMessage {
            id: Identifier::generate(IdPrefix::Message),
            session_id: session_id.to_owned(),
            created_at: Utc::now(),
            provider_id: provider_id.map(str::to_owned),
            model_id: model_id.map(str::to_owned),
            parts: Vec::new(),
            usage: None,
            error: None,
            finish: None,
            summary,
        };

        self.storage.write(
            &Self::message_key(session_id, &msg.id),
            serde_json::to_value(MessageEntry::Assistant(msg.clone()))?,
        )?;
        self.publish_message_updated(session_id, &msg.id);
        Ok(msg)
    }

    pub fn get(&self, session_id: &str, message_id: &str) -> Result<MessageEntry> {
        let value = self
            .storage
            .read_or_raise(&Self::message_key(session_id, message_id))?;
        Ok(serde_json::from_value(value)?)
    }

    /// Messages for a session in ascending creation order.
    pub fn list(&self, session_id: &str, limit: Option<usize>) -> Result<Vec<MessageEntry>> {
        let keys = self
            .storage
            .list(&["message".into(), session_id.into()])?;

        let mut messages = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.storage.read(&key)? {
                messages.push(serde_json::from_value::<MessageEntry>(value)?);
            }
        }

        messages.sort_by_key(|m| (m.created_at(), m.id().to_owned()));
        if let Some(limit) = limit {
            messages.truncate(limit);
        }
        Ok(messages)
    }

    /// Append a part to an assistant message. The part is assigned its ID
    /// here; the caller supplies only the body.
    pub fn add_part(
        &self,
        session_id: &str,
        message_id: &str,
        body: PartBody,
    ) -> Result<MessagePart> {
        let part = MessagePart {
            id: Identifier::generate(IdPrefix::Part),
            session_id: session_id.to_owned(),
            message_id: message_id.to_owned(),
            body,
        };

        let key = Self::message_key(session_id, message_id);
        let mut entry: MessageEntry = serde_json::from_value(self.storage.read_or_raise(&key)?)?;
        match &mut entry {
            MessageEntry::Assistant(msg) => msg.parts.push(part.clone()),
            MessageEntry::User(_) => {
                return Err(Error::Other(format!(
                    "cannot add part to user message {message_id}"
                )))
            }
        }
        self.storage.write(&key, serde_json::to_value(&entry)?)?;

        self.publish_part_updated(session_id, message_id, &part.id);
        Ok(part)
    }

    /// Patch an existing part and republish `part.updated`.
    pub fn update_part(
        &self,
        session_id: &str,
        message_id: &str,
        part_id: &str,
        patch: PartPatch,
    ) -> Result<MessagePart> {
        let key = Self::message_key(session_id, message_id);
        let mut entry: MessageEntry = serde_json::from_value(self.storage.read_or_raise(&key)?)?;

        let updated = match &mut entry {
            MessageEntry::Assistant(msg) => {
                let part = msg
                    .parts
                    .iter_mut()
                    .find(|p| p.id == part_id)
                    .ok_or_else(|| Error::not_found(&["part", message_id, part_id]))?;
                patch.apply(&mut part.body);
                part.clone()
            }
            MessageEntry::User(_) => {
                return Err(Error::not_found(&["part", message_id, part_id]))
            }
        };

        self.storage.write(&key, serde_json::to_value(&entry)?)?;
        self.publish_part_updated(session_id, message_id, part_id);
        Ok(updated)
    }

    /// Record final usage on an assistant message. Missing messages are a
    /// no-op.
    pub fn set_usage(&self, session_id: &str, message_id: &str, usage: TokenUsage) -> Result<()> {
        self.set_assistant_field(session_id, message_id, |msg| msg.usage = Some(usage))
    }

    /// Record a terminal error on an assistant message.
    pub fn set_error(&self, session_id: &str, message_id: &str, error: &str) -> Result<()> {
        let error = error.to_owned();
        self.set_assistant_field(session_id, message_id, move |msg| msg.error = Some(error))
    }

    /// Record the finish reason on an assistant message.
    pub fn set_finish(&self, session_id: &str, message_id: &str, finish: &str) -> Result<()> {
        let finish = finish.to_owned();
        self.set_assistant_field(session_id, message_id, move |msg| msg.finish = Some(finish))
    }

    fn set_assistant_field<F>(&self, session_id: &str, message_id: &str, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut AssistantMessage),
    {
        let key = Self::message_key(session_id, message_id);
        let Some(value) = self.storage.read(&key)? else {
            return Ok(());
        };
        let mut entry: MessageEntry = serde_json::from_value(value)?;
        if let MessageEntry::Assistant(msg) = &mut entry {
            mutate(msg);
            self.storage.write(&key, serde_json::to_value(&entry)?)?;
        }
        Ok(())
    }

    pub fn delete(&self, session_id: &str, message_id: &str) -> Result<()> {
        self.storage
            .remove(&Self::message_key(session_id, message_id))?;
        self.bus.publish(
            topics::MESSAGE_REMOVED,
            serde_json::json!({"session_id": session_id, "message_id": message_id}),
        );
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
