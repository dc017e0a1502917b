//! Agent catalog: built-in agents, runtime-registered custom agents, and
//! system-prompt composition.

use std::collections::HashMap;

use parking_lot::RwLock;

use maestro_domain::agent::{
    AgentInfo, AgentMode, AgentPermission, PermissionAction,
};

/// Built-in agents plus custom registrations; custom wins on id collision.
pub struct AgentCatalog {
    builtin: HashMap<String, AgentInfo>,
    custom: RwLock<HashMap<String, AgentInfo>>,
    /// Provider-specific system prompt templates (provider id → text).
    /// Template text is host data; the catalog only composes it.
    provider_prompts: RwLock<HashMap<String, String>>,
}

impl Default for AgentCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentCatalog {
    pub fn new() -> Self {
        Self {
            builtin: builtin_agents(),
            custom: RwLock::new(HashMap::new()),
            provider_prompts: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, agent_id: &str) -> Option<AgentInfo> {
        if let Some(agent) = self.custom.read().get(agent_id) {
            return Some(agent.clone());
        }
        self.builtin.get(agent_id).cloned()
    }

    /// The `build` agent.
    pub fn default_agent(&self) -> AgentInfo {
        self.builtin
            .get("build")
            .cloned()
            .unwrap_or_else(|| AgentInfo::new("build"))
    }

    /// Register a custom agent (replaces a same-id registration, shadows a
    /// same-id built-in).
    pub fn register(&self, agent: AgentInfo) {
        self.custom.write().insert(agent.id.clone(), agent);
    }

    /// Remove a custom agent. Built-ins cannot be unregistered.
    pub fn unregister(&self, agent_id: &str) -> bool {
        self.custom.write().remove(agent_id).is_some()
    }

    /// List agents, optionally filtered by mode; hidden agents are only
    /// included on request. `build` sorts first, then by name.
    pub fn list(&self, mode: Option<AgentMode>, include_hidden: bool) -> Vec<AgentInfo> {
        let custom = self.custom.read();
        let mut merged: HashMap<&str, &AgentInfo> = self
            .builtin
            .iter()
            .map(|(id, agent)| (id.as_str(), agent))
            .collect();
        for (id, agent) in custom.iter() {
            merged.insert(id.as_str(), agent);
        }

        let mut agents: Vec<AgentInfo> = merged
            .values()
            .filter(|agent| include_hidden || !agent.hidden)
            .filter(|agent| mode.map_or(true, |m| agent.mode == m))
            .map(|agent| (*agent).clone())
            .collect();

        agents.sort_by(|a, b| {
            (a.name != "build", a.name.clone()).cmp(&(b.name != "build", b.name.clone()))
        });
        agents
    }

    /// Install a provider-specific system prompt template.
    pub fn set_provider_prompt(&self, provider_id: &str, prompt: impl Into<String>) {
        self.provider_prompts
            .write()
            .insert(provider_id.to_owned(), prompt.into());
    }

    pub fn provider_prompt(&self, provider_id: &str) -> Option<String> {
        self.provider_prompts.read().get(provider_id).cloned()
    }

    /// The agent's own contribution to the system prompt: its prompt (when
    /// it runs an agentic loop) plus a role line from its description.
    pub fn agent_prompt(&self, agent: &AgentInfo) -> String {
        let mut parts = Vec::new();
        if agent.auto_continue {
            if let Some(prompt) = &agent.prompt {
                if !prompt.is_empty() {
                    parts.push(prompt.clone());
                }
            }
        }
        if let Some(description) = &agent.description {
            parts.push(format!("You are the '{}' agent: {}", agent.name, description));
        }
        parts.join("\n\n")
    }

    /// Compose the full system prompt: provider template, then the agent's
    /// own prompt when distinct, then the caller override. Empty segments
    /// are skipped; `None` when nothing remains.
    pub fn compose_system_prompt(
        &self,
        agent: &AgentInfo,
        provider_id: &str,
        custom_system: Option<&str>,
    ) -> Option<String> {
        let mut parts: Vec<String> = Vec::new();

        let provider_prompt = self.provider_prompt(provider_id);
        if let Some(prompt) = &provider_prompt {
            if !prompt.is_empty() {
                parts.push(prompt.clone());
            }
        }

        let agent_prompt = self.agent_prompt(agent);
        if !agent_prompt.is_empty() && provider_prompt.as_deref() != Some(agent_prompt.as_str()) {
            parts.push(agent_prompt);
        }

        if let Some(system) = custom_system {
            if !system.is_empty() {
                parts.push(system.to_owned());
            }
        }

        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n\n"))
        }
    }
}

fn builtin_agents() -> HashMap<String, AgentInfo> {
    let mut agents = HashMap::new();

    let mut build = AgentInfo::new("build");
    build.description = Some(
        "Default agent with full capabilities. Continues working until task is complete.".into(),
    );
    build.mode = AgentMode::Primary;
    build.auto_continue = true;
    build.max_steps = 50;
    build.permissions = vec![
        AgentPermission::new("*", PermissionAction::Allow),
        AgentPermission::new("question", PermissionAction::Allow),
    ];
    agents.insert(build.id.clone(), build);

    let mut general = AgentInfo::new("general");
    general.description = Some(
        "General-purpose agent for researching complex questions and executing multi-step tasks."
            .into(),
    );
    general.mode = AgentMode::Subagent;
    general.auto_continue = true;
    general.max_steps = 30;
    general.permissions = vec![
        AgentPermission::new("*", PermissionAction::Allow),
        AgentPermission::new("todo", PermissionAction::Deny),
    ];
    agents.insert(general.id.clone(), general);

    let mut explore = AgentInfo::new("explore");
    explore.description = Some(
        "Fast agent specialized for exploring codebases and searching for information.".into(),
    );
    explore.mode = AgentMode::Subagent;
    explore.auto_continue = false;
    explore.permissions = vec![
        AgentPermission::new("*", PermissionAction::Deny),
        AgentPermission::new("websearch", PermissionAction::Allow),
        AgentPermission::new("webfetch", PermissionAction::Allow),
    ];
    agents.insert(explore.id.clone(), explore);

    let mut compaction = AgentInfo::new("compaction");
    compaction.name = "Compaction".into();
    compaction.description = Some("Summarizes conversation context for compaction".into());
    compaction.mode = AgentMode::Primary;
    compaction.hidden = true;
    compaction.auto_continue = false;
    compaction.max_steps = 1;
    compaction.permissions = vec![AgentPermission::new("*", PermissionAction::Allow)];
    agents.insert(compaction.id.clone(), compaction);

    agents
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_domain::agent::is_tool_allowed;

    #[test]
    fn builtins_present() {
        let catalog = AgentCatalog::new();
        for id in ["build", "general", "explore", "compaction"] {
            assert!(catalog.get(id).is_some(), "{id} missing");
        }
        assert_eq!(catalog.default_agent().id, "build");
    }

    #[test]
    fn explore_is_deny_by_default() {
        let catalog = AgentCatalog::new();
        let explore = catalog.get("explore").unwrap();
        assert_eq!(is_tool_allowed(&explore, "exec"), PermissionAction::Deny);
        assert_eq!(
            is_tool_allowed(&explore, "websearch"),
            PermissionAction::Allow
        );
        assert!(!explore.auto_continue);
    }

    #[test]
    fn general_denies_todo() {
        let catalog = AgentCatalog::new();
        let general = catalog.get("general").unwrap();
        assert_eq!(is_tool_allowed(&general, "todo"), PermissionAction::Deny);
        assert_eq!(is_tool_allowed(&general, "exec"), PermissionAction::Allow);
        assert_eq!(general.max_steps, 30);
    }

    #[test]
    fn custom_registration_shadows_builtin() {
        let catalog = AgentCatalog::new();
        let mut custom = AgentInfo::new("build");
        custom.max_steps = 7;
        catalog.register(custom);
        assert_eq!(catalog.get("build").unwrap().max_steps, 7);

        assert!(catalog.unregister("build"));
        assert_eq!(catalog.get("build").unwrap().max_steps, 50);
        assert!(!catalog.unregister("build"));
    }

    #[test]
    fn list_hides_hidden_by_default() {
        let catalog = AgentCatalog::new();
        let visible = catalog.list(None, false);
        assert!(visible.iter().all(|a| a.id != "compaction"));

        let all = catalog.list(None, true);
        assert!(all.iter().any(|a| a.id == "compaction"));
    }

    #[test]
    fn list_filters_by_mode_and_sorts_build_first() {
        let catalog = AgentCatalog::new();
        let primary = catalog.list(Some(AgentMode::Primary), false);
        assert_eq!(primary[0].id, "build");

        let subagents = catalog.list(Some(AgentMode::Subagent), false);
        assert!(subagents.iter().all(|a| a.mode == AgentMode::Subagent));
    }

    #[test]
    fn system_prompt_composition_order() {
        let catalog = AgentCatalog::new();
        catalog.set_provider_prompt("anthropic", "PROVIDER TEMPLATE");

        let mut agent = AgentInfo::new("tester");
        agent.description = Some("tests things".into());

        let composed = catalog
            .compose_system_prompt(&agent, "anthropic", Some("CUSTOM"))
            .unwrap();
        let provider_pos = composed.find("PROVIDER TEMPLATE").unwrap();
        let agent_pos = composed.find("You are the 'tester' agent").unwrap();
        let custom_pos = composed.find("CUSTOM").unwrap();
        assert!(provider_pos < agent_pos && agent_pos < custom_pos);
    }

    #[test]
    fn empty_segments_are_skipped() {
        let catalog = AgentCatalog::new();
        let agent = AgentInfo::new("bare");
        assert!(catalog
            .compose_system_prompt(&agent, "unknown", None)
            .is_none());
        assert_eq!(
            catalog
                .compose_system_prompt(&agent, "unknown", Some("only"))
                .unwrap(),
            "only"
        );
    }

    #[test]
    fn agent_prompt_requires_auto_continue() {
        let catalog = AgentCatalog::new();
        let mut agent = AgentInfo::new("a");
        agent.prompt = Some("WORK HARD".into());
        agent.auto_continue = false;
        assert!(!catalog.agent_prompt(&agent).contains("WORK HARD"));

        agent.auto_continue = true;
        assert!(catalog.agent_prompt(&agent).contains("WORK HARD"));
    }
}
