use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Static engine configuration supplied by the operator.
///
/// Field names are camelCase on the wire. Everything beyond the backend list
/// and pipeline is defaulted, so a minimal file only names backends and roles.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayConfig {
    pub backends: Vec<BackendSpec>,
    /// Units one session may consume over its lifetime. None = unlimited.
    #[serde(default)]
    pub session_budget: Option<u64>,
    /// Units all sessions together may consume per global window. None = unlimited.
    #[serde(default)]
    pub global_budget: Option<u64>,
    #[serde(default = "default_global_window_seconds")]
    pub global_window_seconds: u64,
    /// Fixed role order; agents may override with a declared follow-up role.
    pub pipeline: Vec<String>,
    #[serde(default)]
    pub retry: RetryConfig,
    /// How long a rate-limited backend sits out before re-eligibility.
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: u64,
    /// Upper bound on handoff steps, dynamic dispatch included.
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
    #[serde(default = "default_knowledge_flush_retries")]
    pub knowledge_flush_retries: u32,
    /// Role catalog override. Empty = built-in planner/implementor/knowledge.
    #[serde(default)]
    pub agents: Vec<AgentSpec>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendSpec {
    pub id: String,
    /// Unit budget per rolling window for this backend.
    pub rate_limit_per_window: u64,
    pub window_seconds: u64,
    /// Lower rank is preferred. Ties fall to recent error rate, then latency,
    /// then declaration order.
    pub priority: u32,
    /// Estimated units per call, used for admission checks and as the
    /// recorded spend when a transport reports no token count.
    #[serde(default = "default_cost_per_call")]
    pub cost_per_call: u64,
    /// Capability class matched against a role's preferred class.
    /// None serves every role.
    #[serde(default)]
    pub class: Option<String>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl BackendSpec {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Backoff schedule for retrying a backend after timeout or error.
/// Defaults encode base 500ms, doubled per attempt, capped at 8s, three
/// attempts per backend per routing round.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_attempts_per_backend")]
    pub max_attempts_per_backend: u32,
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts_per_backend: default_max_attempts_per_backend(),
            jitter_factor: default_jitter_factor(),
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Declarative agent descriptor, overriding the built-in catalog.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSpec {
    pub role: String,
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub produces: Vec<String>,
    #[serde(default)]
    pub backend_class: Option<String>,
    /// Produced keys flushed to the knowledge store at finalization.
    #[serde(default)]
    pub publishes: Vec<String>,
}

fn default_global_window_seconds() -> u64 {
    3600
}

fn default_cooldown_seconds() -> u64 {
    30
}

fn default_max_steps() -> u32 {
    16
}

fn default_knowledge_flush_retries() -> u32 {
    3
}

fn default_cost_per_call() -> u64 {
    1
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    8_000
}

fn default_max_attempts_per_backend() -> u32 {
    3
}

fn default_jitter_factor() -> f64 {
    0.2
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(String),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl RelayConfig {
    /// Load and validate a JSON config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        let config: Self =
            serde_json::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Structural checks. Role resolution against the registry happens when
    /// the engine is wired up.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backends.is_empty() {
            return Err(ConfigError::Invalid("at least one backend is required".into()));
        }
        if self.pipeline.is_empty() {
            return Err(ConfigError::Invalid("pipeline must name at least one role".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for backend in &self.backends {
            if backend.id.is_empty() {
                return Err(ConfigError::Invalid("backend id must not be empty".into()));
            }
            if !seen.insert(backend.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate backend id '{}'",
                    backend.id
                )));
            }
            if backend.window_seconds == 0 {
                return Err(ConfigError::Invalid(format!(
                    "backend '{}' windowSeconds must be positive",
                    backend.id
                )));
            }
        }
        // With a custom agent catalog the pipeline must stay inside it.
        // With the built-in catalog, role resolution happens in the engine.
        if !self.agents.is_empty() {
            for role in &self.pipeline {
                if !self.agents.iter().any(|a| &a.role == role) {
                    return Err(ConfigError::Invalid(format!(
                        "pipeline role '{role}' is not declared in agents"
                    )));
                }
            }
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return Err(ConfigError::Invalid("jitterFactor must be within [0, 1]".into()));
        }
        if self.retry.max_attempts_per_backend == 0 {
            return Err(ConfigError::Invalid(
                "maxAttemptsPerBackend must be at least 1".into(),
            ));
        }
        if self.max_steps == 0 {
            return Err(ConfigError::Invalid("maxSteps must be at least 1".into()));
        }
        Ok(())
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_seconds)
    }

    pub fn global_window(&self) -> Duration {
        Duration::from_secs(self.global_window_seconds)
    }

    pub fn backend(&self, id: &str) -> Option<&BackendSpec> {
        self.backends.iter().find(|b| b.id == id)
    }
}

impl Default for RelayConfig {
    /// Two local backends and the standard three-role pipeline. Enough to run
    /// the engine end-to-end without a config file.
    fn default() -> Self {
        Self {
            backends: vec![
                BackendSpec {
                    id: "primary".into(),
                    rate_limit_per_window: 10_000,
                    window_seconds: 60,
                    priority: 1,
                    cost_per_call: 25,
                    class: None,
                    request_timeout_ms: default_request_timeout_ms(),
                },
                BackendSpec {
                    id: "secondary".into(),
                    rate_limit_per_window: 10_000,
                    window_seconds: 60,
                    priority: 2,
                    cost_per_call: 10,
                    class: None,
                    request_timeout_ms: default_request_timeout_ms(),
                },
            ],
            session_budget: None,
            global_budget: None,
            global_window_seconds: default_global_window_seconds(),
            pipeline: vec!["planner".into(), "implementor".into(), "knowledge".into()],
            retry: RetryConfig::default(),
            cooldown_seconds: default_cooldown_seconds(),
            max_steps: default_max_steps(),
            knowledge_flush_retries: default_knowledge_flush_retries(),
            agents: Vec::new(),
        }
    }
}
