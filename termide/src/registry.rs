use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const BASE_AGENT: &str = "assistant";

const BASE_INSTRUCTIONS: &str = "You are the coding assistant built into termide, a terminal IDE. \
Answer questions about the user's code and project concisely. When asked to change code, \
return the complete modified code in a single fenced block followed by a short explanation.";

/// A named agent: system instructions plus an optional model override.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub name: String,
    pub instructions: String,
    /// Backend default when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl AgentProfile {
    pub fn new(name: impl Into<String>, instructions: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instructions: instructions.into(),
            model: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// The base agent and named specialists. Built once and handed to the orchestrator.
#[derive(Clone, Debug)]
pub struct AgentRegistry {
    base: AgentProfile,
    agents: BTreeMap<String, AgentProfile>,
    fallback: String,
}

impl AgentRegistry {
    /// A registry whose only agent is `base`.
    pub fn new(base: AgentProfile) -> Self {
        let fallback = base.name.clone();
        let mut agents = BTreeMap::new();
        agents.insert(base.name.clone(), base.clone());
        Self {
            base,
            agents,
            fallback,
        }
    }

    /// The built-in set: the base assistant plus code specialists.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new(AgentProfile::new(BASE_AGENT, BASE_INSTRUCTIONS));
        let specialists = [
            (
                "code_analyzer",
                "You analyze code for bugs, performance concerns, style violations and security problems. \
                 Cite line numbers and give concrete suggestions.",
            ),
            (
                "refactoring_planner",
                "You plan and perform refactorings that improve structure and readability without changing behavior.",
            ),
            (
                "documentation_generator",
                "You write clear documentation comments and usage notes for code.",
            ),
            (
                "error_diagnostician",
                "You diagnose errors from code, stack traces and terminal output, and propose fixes.",
            ),
            (
                "test_writer",
                "You write focused unit tests that cover normal cases and edge cases.",
            ),
        ];
        for (name, instructions) in specialists {
            registry.register(AgentProfile::new(name, instructions));
        }
        registry
    }

    /// Add or replace an agent. Replacing the base agent's name also replaces the base.
    pub fn register(&mut self, profile: AgentProfile) {
        if profile.name == self.base.name {
            self.base = profile.clone();
        }
        self.agents.insert(profile.name.clone(), profile);
    }

    pub fn base(&self) -> &AgentProfile {
        &self.base
    }

    pub fn get(&self, name: &str) -> Option<&AgentProfile> {
        self.agents.get(name)
    }

    /// Name looked up by the last step of the fallback chain.
    pub fn set_fallback(&mut self, name: impl Into<String>) {
        self.fallback = name.into();
    }

    pub fn fallback_name(&self) -> &str {
        &self.fallback
    }

    pub fn fallback_agent(&self) -> Option<&AgentProfile> {
        self.get(&self.fallback)
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_include_base_and_specialists() {
        let registry = AgentRegistry::with_defaults();
        assert_eq!(registry.base().name, BASE_AGENT);
        assert!(registry.get("code_analyzer").is_some());
        assert_eq!(registry.fallback_agent().map(|a| a.name.as_str()), Some(BASE_AGENT));
    }

    #[test]
    fn unknown_fallback_resolves_to_none() {
        let mut registry = AgentRegistry::with_defaults();
        registry.set_fallback("nobody");
        assert!(registry.fallback_agent().is_none());
        assert_eq!(registry.fallback_name(), "nobody");
    }

    #[test]
    fn registering_base_name_replaces_base() {
        let mut registry = AgentRegistry::new(AgentProfile::new("a", "old"));
        registry.register(AgentProfile::new("a", "new").with_model("gpt-4o-mini"));
        assert_eq!(registry.base().instructions, "new");
        assert_eq!(registry.get("a").and_then(|a| a.model.as_deref()), Some("gpt-4o-mini"));
    }
}
