//! Agent configuration: a named bundle of prompt, permissions, and
//! agentic-loop defaults.

use serde::{Deserialize, Serialize};

/// Where an agent may be used.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    #[default]
    Primary,
    Subagent,
    All,
}

/// What a permission entry decides for a tool.
///
/// Unknown action strings are rejected at deserialization time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionAction {
    #[default]
    Allow,
    Deny,
    Ask,
}

/// One entry in an agent's ordered permission list. `tool_name` may be a
/// concrete tool id or the `*` wildcard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentPermission {
    pub tool_name: String,
    #[serde(default)]
    pub action: PermissionAction,
}

impl AgentPermission {
    pub fn new(tool_name: impl Into<String>, action: PermissionAction) -> Self {
        Self {
            tool_name: tool_name.into(),
            action,
        }
    }
}

/// A model binding for an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentModel {
    pub provider_id: String,
    pub model_id: String,
}

/// Agent configuration schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub mode: AgentMode,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default = "d_true")]
    pub native: bool,

    // Model settings
    #[serde(default)]
    pub model: Option<AgentModel>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,

    // Prompt
    #[serde(default)]
    pub prompt: Option<String>,

    // Behavior
    /// Allowed tool ids; empty means all.
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<AgentPermission>,

    // Agentic loop settings
    #[serde(default = "d_true")]
    pub auto_continue: bool,
    #[serde(default = "d_max_steps")]
    pub max_steps: u32,
    #[serde(default = "d_true")]
    pub pause_on_question: bool,
}

impl AgentInfo {
    /// A bare agent with loop defaults; callers fill in the rest.
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            description: None,
            mode: AgentMode::Primary,
            hidden: false,
            native: true,
            model: None,
            temperature: None,
            top_p: None,
            max_tokens: None,
            prompt: None,
            tools: Vec::new(),
            permissions: Vec::new(),
            auto_continue: true,
            max_steps: d_max_steps(),
            pause_on_question: true,
        }
    }
}

/// Resolve whether `tool_name` is allowed for `agent`.
///
/// Permissions are scanned in order; every entry whose name equals the
/// candidate or is `*` overwrites the result. Last match wins; no match
/// means allow.
pub fn is_tool_allowed(agent: &AgentInfo, tool_name: &str) -> PermissionAction {
    let mut result = PermissionAction::Allow;
    for perm in &agent.permissions {
        if perm.tool_name == "*" || perm.tool_name == tool_name {
            result = perm.action;
        }
    }
    result
}

fn d_true() -> bool {
    true
}
fn d_max_steps() -> u32 {
    50
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent_with(perms: Vec<AgentPermission>) -> AgentInfo {
        let mut agent = AgentInfo::new("test");
        agent.permissions = perms;
        agent
    }

    #[test]
    fn no_permissions_defaults_to_allow() {
        let agent = agent_with(vec![]);
        assert_eq!(is_tool_allowed(&agent, "anything"), PermissionAction::Allow);
    }

    #[test]
    fn wildcard_deny_blocks_all() {
        let agent = agent_with(vec![AgentPermission::new("*", PermissionAction::Deny)]);
        assert_eq!(is_tool_allowed(&agent, "echo"), PermissionAction::Deny);
    }

    #[test]
    fn last_match_wins_over_wildcard() {
        let agent = agent_with(vec![
            AgentPermission::new("*", PermissionAction::Deny),
            AgentPermission::new("websearch", PermissionAction::Allow),
        ]);
        assert_eq!(
            is_tool_allowed(&agent, "websearch"),
            PermissionAction::Allow
        );
        assert_eq!(is_tool_allowed(&agent, "exec"), PermissionAction::Deny);
    }

    #[test]
    fn later_wildcard_overrides_specific() {
        let agent = agent_with(vec![
            AgentPermission::new("todo", PermissionAction::Allow),
            AgentPermission::new("*", PermissionAction::Deny),
        ]);
        assert_eq!(is_tool_allowed(&agent, "todo"), PermissionAction::Deny);
    }

    #[test]
    fn ask_action_is_representable() {
        let agent = agent_with(vec![AgentPermission::new("exec", PermissionAction::Ask)]);
        assert_eq!(is_tool_allowed(&agent, "exec"), PermissionAction::Ask);
    }

    #[test]
    fn unknown_action_string_rejected() {
        let result: Result<AgentPermission, _> =
            serde_json::from_value(serde_json::json!({"tool_name": "x", "action": "maybe"}));
        assert!(result.is_err());
    }

    #[test]
    fn agent_defaults() {
        let agent: AgentInfo =
            serde_json::from_value(serde_json::json!({"id": "a", "name": "a"})).unwrap();
        assert!(agent.auto_continue);
        assert_eq!(agent.max_steps, 50);
        assert!(agent.pause_on_question);
        assert_eq!(agent.mode, AgentMode::Primary);
        assert!(!agent.hidden);
    }
}
