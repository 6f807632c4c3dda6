//! Agent registry for runtime `agent_ref` lookup.

use std::collections::HashMap;

use super::box_agent::BoxAgent;
use super::capability::Agent;

/// Registry of available agents, indexed by `agent_ref`.
///
/// Built by the caller and handed to the executor; there is no global
/// registry.
#[derive(Debug)]
pub struct AgentRegistry {
    agents: HashMap<String, BoxAgent>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            agents: HashMap::new(),
        }
    }

    /// Register an agent under the given name.
    ///
    /// If an agent with this name already exists, it is replaced.
    pub fn register(&mut self, name: impl Into<String>, agent: impl Agent + 'static) {
        self.agents.insert(name.into(), BoxAgent::new(agent));
    }

    /// Builder-style `register`.
    pub fn with(mut self, name: impl Into<String>, agent: impl Agent + 'static) -> Self {
        self.register(name, agent);
        self
    }

    pub fn get(&self, name: &str) -> Option<&BoxAgent> {
        self.agents.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.agents.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.agents.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}
