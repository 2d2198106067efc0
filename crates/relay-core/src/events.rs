use serde::{Deserialize, Serialize};

use crate::ids::SessionId;
use crate::session::SessionStatus;
use crate::usage::CallOutcome;

/// Session lifecycle events emitted over the orchestrator's broadcast channel.
/// Observers (the CLI, tests) subscribe; nothing in the engine depends on a
/// listener being present.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SessionEvent {
    #[serde(rename = "session_started")]
    SessionStarted {
        session_id: SessionId,
        first_role: String,
    },

    #[serde(rename = "step_started")]
    StepStarted {
        session_id: SessionId,
        role: String,
        step: u32,
    },

    #[serde(rename = "backend_selected")]
    BackendSelected {
        session_id: SessionId,
        role: String,
        backend_id: String,
    },

    #[serde(rename = "call_recorded")]
    CallRecorded {
        session_id: SessionId,
        backend_id: String,
        outcome: CallOutcome,
        units: u64,
    },

    #[serde(rename = "context_merged")]
    ContextMerged {
        session_id: SessionId,
        role: String,
        keys: Vec<String>,
    },

    #[serde(rename = "knowledge_flushed")]
    KnowledgeFlushed {
        session_id: SessionId,
        topic: String,
        revision: i64,
    },

    #[serde(rename = "session_finished")]
    SessionFinished {
        session_id: SessionId,
        status: SessionStatus,
        failure: Option<String>,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::SessionStarted { session_id, .. }
            | Self::StepStarted { session_id, .. }
            | Self::BackendSelected { session_id, .. }
            | Self::CallRecorded { session_id, .. }
            | Self::ContextMerged { session_id, .. }
            | Self::KnowledgeFlushed { session_id, .. }
            | Self::SessionFinished { session_id, .. } => session_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::SessionStarted { .. } => "session_started",
            Self::StepStarted { .. } => "step_started",
            Self::BackendSelected { .. } => "backend_selected",
            Self::CallRecorded { .. } => "call_recorded",
            Self::ContextMerged { .. } => "context_merged",
            Self::KnowledgeFlushed { .. } => "knowledge_flushed",
            Self::SessionFinished { .. } => "session_finished",
        }
    }
}
