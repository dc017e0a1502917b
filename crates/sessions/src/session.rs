//! Session metadata: ordering, defaults, and cumulative cost rollups.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use maestro_core::bus::{topics, EventBus};
use maestro_core::storage::Storage;
use maestro_domain::{Identifier, IdPrefix, Result};

/// A conversational thread and its metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub provider_id: Option<String>,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub total_cost: f64,
    #[serde(default)]
    pub total_input_tokens: u64,
    #[serde(default)]
    pub total_output_tokens: u64,
}

/// Fields accepted at session creation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionCreate {
    pub title: Option<String>,
    pub provider_id: Option<String>,
    pub model_id: Option<String>,
    pub agent_id: Option<String>,
}

/// Fields accepted by [`SessionStore::update`]. `None` leaves a field
/// untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionUpdate {
    pub title: Option<String>,
    pub provider_id: Option<String>,
    pub model_id: Option<String>,
    pub agent_id: Option<String>,
}

/// Session store over [`Storage`]. Layout: `session/{session_id}`.
#[derive(Clone)]
pub struct SessionStore {
    storage: Storage,
    bus: Arc<EventBus>,
}

impl SessionStore {
    pub fn new(storage: Storage, bus: Arc<EventBus>) -> Self {
        Self { storage, bus }
    }

    fn session_key(session_id: &str) -> Vec<String> {
        vec!["session".into(), session_id.into()]
    }

    fn write(&self, info: &SessionInfo) -> Result<()> {
        self.storage
            .write(&Self::session_key(&info.id), serde_json::to_value(info)?)
    }

    pub fn create(&self, data: SessionCreate) -> Result<SessionInfo> {
        let now = Utc::now();
        let info = SessionInfo {
            id: Identifier::generate(IdPrefix::Session),
            user_id: None,
            title: data
                .title
                .unwrap_or_else(|| format!("Session {}", now.to_rfc3339())),
            created_at: now,
            updated_at: now,
            provider_id: data.provider_id,
            model_id: data.model_id,
            agent_id: data.agent_id.or_else(|| Some("build".into())),
            total_cost: 0.0,
            total_input_tokens: 0,
            total_output_tokens: 0,
        };

        self.write(&info)?;
        self.bus.publish(
            topics::SESSION_CREATED,
            serde_json::json!({"id": info.id, "title": info.title}),
        );
        Ok(info)
    }

    pub fn get(&self, session_id: &str) -> Result<SessionInfo> {
        let value = self.storage.read_or_raise(&Self::session_key(session_id))?;
        Ok(serde_json::from_value(value)?)
    }

    /// Apply a field patch; `updated_at` is always refreshed.
    pub fn update(&self, session_id: &str, patch: SessionUpdate) -> Result<SessionInfo> {
        let mut info = self.get(session_id)?;
        if let Some(title) = patch.title {
            info.title = title;
        }
        if let Some(provider_id) = patch.provider_id {
            info.provider_id = Some(provider_id);
        }
        if let Some(model_id) = patch.model_id {
            info.model_id = Some(model_id);
        }
        if let Some(agent_id) = patch.agent_id {
            info.agent_id = Some(agent_id);
        }
        info.updated_at = Utc::now();

        self.write(&info)?;
        self.bus.publish(
            topics::SESSION_UPDATED,
            serde_json::json!({"id": info.id, "title": info.title}),
        );
        Ok(info)
    }

    /// Accumulate token/cost totals from one completed provider call.
    /// Totals only ever grow.
    pub fn record_usage(
        &self,
        session_id: &str,
        input_tokens: u64,
        output_tokens: u64,
        cost: f64,
    ) -> Result<SessionInfo> {
        let mut info = self.get(session_id)?;
        info.total_input_tokens += input_tokens;
        info.total_output_tokens += output_tokens;
        info.total_cost += cost.max(0.0);
        info.updated_at = Utc::now();

        self.write(&info)?;
        self.bus.publish(
            topics::SESSION_UPDATED,
            serde_json::json!({"id": info.id, "title": info.title}),
        );
        Ok(info)
    }

    /// Refresh `updated_at` without changing anything else.
    pub fn touch(&self, session_id: &str) -> Result<SessionInfo> {
        self.update(session_id, SessionUpdate::default())
    }

    /// Delete a session and everything under it: messages, todos, then the
    /// session record itself.
    pub fn delete(&self, session_id: &str) -> Result<()> {
        let info = self.get(session_id)?;

        for key in self
            .storage
            .list(&["message".into(), session_id.into()])?
        {
            self.storage.remove(&key)?;
        }
        self.storage
            .remove(&["todo".into(), session_id.into()])?;
        self.storage.remove(&Self::session_key(session_id))?;

        self.bus.publish(
            topics::SESSION_DELETED,
            serde_json::json!({"id": session_id, "title": info.title}),
        );
        Ok(())
    }

    /// Sessions ordered by `updated_at` descending.
    pub fn list(&self, limit: Option<usize>) -> Result<Vec<SessionInfo>> {
        let keys = self.storage.list(&["session".into()])?;
        let mut sessions = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.storage.read(&key)? {
                sessions.push(serde_json::from_value::<SessionInfo>(value)?);
            }
        }

        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        if let Some(limit) = limit {
            sessions.truncate(limit);
        }
        Ok(sessions)
    }
}
