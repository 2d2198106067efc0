use std::collections::HashMap;

use tracing::debug;

use relay_core::{AgentSpec, RelayConfig, SessionContext};

/// Catalog of agent roles a pipeline may dispatch to.
///
/// Ships with a built-in planner / implementor / knowledge trio; a config
/// with a non-empty `agents` list replaces or extends those by role name.
pub struct AgentRegistry {
    agents: HashMap<String, AgentSpec>,
}

impl AgentRegistry {
    /// Registry holding only the built-in roles.
    pub fn with_defaults() -> Self {
        let mut registry = Self {
            agents: HashMap::new(),
        };
        for spec in builtin_roles() {
            registry.register(spec);
        }
        registry
    }

    /// Built-ins plus any roles declared in the config. Declared roles win
    /// on name collisions.
    pub fn from_config(config: &RelayConfig) -> Self {
        let mut registry = Self::with_defaults();
        for spec in &config.agents {
            debug!(role = %spec.role, "registering configured agent role");
            registry.register(spec.clone());
        }
        registry
    }

    pub fn register(&mut self, spec: AgentSpec) {
        self.agents.insert(spec.role.clone(), spec);
    }

    pub fn resolve(&self, role: &str) -> Option<&AgentSpec> {
        self.agents.get(role)
    }

    pub fn contains(&self, role: &str) -> bool {
        self.agents.contains_key(role)
    }

    /// All registered role names, sorted for stable output.
    pub fn roles(&self) -> Vec<String> {
        let mut roles: Vec<String> = self.agents.keys().cloned().collect();
        roles.sort();
        roles
    }

    /// Required context keys the session has not produced yet, sorted.
    pub fn missing_keys(spec: &AgentSpec, context: &SessionContext) -> Vec<String> {
        let mut missing: Vec<String> = spec
            .requires
            .iter()
            .filter(|key| !context.contains_key(key.as_str()))
            .cloned()
            .collect();
        missing.sort();
        missing
    }
}

fn builtin_roles() -> Vec<AgentSpec> {
    vec![
        AgentSpec {
            role: "planner".to_string(),
            requires: vec!["user_input".to_string()],
            produces: vec!["plan".to_string(), "task_kind".to_string()],
            backend_class: Some("capable".to_string()),
            publishes: Vec::new(),
        },
        AgentSpec {
            role: "implementor".to_string(),
            requires: vec!["user_input".to_string(), "plan".to_string()],
            produces: vec!["implementation".to_string()],
            backend_class: Some("capable".to_string()),
            publishes: Vec::new(),
        },
        AgentSpec {
            role: "knowledge".to_string(),
            requires: vec!["user_input".to_string(), "plan".to_string()],
            produces: vec!["knowledge_summary".to_string(), "topics".to_string()],
            backend_class: Some("fast".to_string()),
            publishes: vec!["knowledge_summary".to_string()],
        },
    ]
}
