use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::DenialReason;
use crate::ids::SessionId;
use crate::usage::CallOutcome;

/// Aggregated session context: context-key to merged value.
/// BTreeMap so serialization and iteration order are deterministic.
pub type SessionContext = BTreeMap<String, serde_json::Value>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
    Aborted,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "aborted" => Ok(Self::Aborted),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

/// Why a session ended in `Failed`.
///
/// These are values, not panics: a failing session returns its cause and
/// leaves already-merged context intact for inspection. `Display` gives the
/// user-facing summary; raw backend text never passes through verbatim.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureCause {
    /// A role's required context keys were absent before its backend call.
    MissingKeys { role: String, keys: Vec<String> },
    /// The budget policy refused every candidate before any attempt.
    Denied { role: String, reason: DenialReason },
    /// Every candidate backend was attempted and failed.
    BackendsExhausted { role: String },
    /// An agent declared a follow-up role the registry does not know.
    UnknownRole { role: String },
    /// Dynamic dispatch exceeded the configured step bound.
    StepLimitExceeded { limit: u32 },
    /// Knowledge finalization could not commit within its retry budget.
    KnowledgeFlush { detail: String },
}

impl std::fmt::Display for FailureCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingKeys { role, keys } => {
                write!(f, "role '{role}' missing required context keys: {}", keys.join(", "))
            }
            Self::Denied { role, reason } => {
                write!(f, "routing for role '{role}' denied: {reason}")
            }
            Self::BackendsExhausted { role } => {
                write!(f, "all candidate backends exhausted for role '{role}'")
            }
            Self::UnknownRole { role } => write!(f, "unknown role '{role}'"),
            Self::StepLimitExceeded { limit } => {
                write!(f, "session exceeded the {limit}-step limit")
            }
            Self::KnowledgeFlush { detail } => {
                write!(f, "knowledge flush failed: {detail}")
            }
        }
    }
}

/// One entry in a session's ordered handoff log.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepRecord {
    pub seq: u32,
    pub role: String,
    /// Absent when the step failed before any backend was selected.
    pub backend_id: Option<String>,
    pub outcome: Option<CallOutcome>,
}

/// Terminal answer handed back across the session input boundary.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionReport {
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub final_context: SessionContext,
    pub failure_cause: Option<FailureCause>,
    pub steps: Vec<StepRecord>,
}
