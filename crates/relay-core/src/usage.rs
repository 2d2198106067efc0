use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::ids::{RecordId, SessionId};

/// Classified result of one backend call attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    Success,
    RateLimited,
    Error,
    Timeout,
}

impl CallOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl std::fmt::Display for CallOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::RateLimited => write!(f, "rate_limited"),
            Self::Error => write!(f, "error"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

impl std::str::FromStr for CallOutcome {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "rate_limited" => Ok(Self::RateLimited),
            "error" => Ok(Self::Error),
            "timeout" => Ok(Self::Timeout),
            other => Err(format!("unknown call outcome: {other}")),
        }
    }
}

/// One logged backend call. Immutable once written; the ledger only appends.
///
/// Every attempt gets its own record with its own id and attempt number, so
/// retries never resubmit an earlier record and budget sums stay exact.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: RecordId,
    pub session_id: SessionId,
    pub backend_id: String,
    /// Consumption units (tokens or abstract cost). Zero for failed attempts.
    pub units: u64,
    pub outcome: CallOutcome,
    /// 1-based attempt number within one routing round.
    pub attempt: u32,
    /// Epoch milliseconds, UTC. Integer so window sums stay arithmetic.
    pub recorded_at_ms: i64,
}

impl UsageRecord {
    pub fn new(
        session_id: SessionId,
        backend_id: impl Into<String>,
        units: u64,
        outcome: CallOutcome,
        attempt: u32,
    ) -> Self {
        Self {
            id: RecordId::new(),
            session_id,
            backend_id: backend_id.into(),
            units,
            outcome,
            attempt,
            recorded_at_ms: Utc::now().timestamp_millis(),
        }
    }
}

/// A consumption scope the ledger can be summed over.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BudgetScope {
    Backend(String),
    Session(SessionId),
    Global,
}

impl std::fmt::Display for BudgetScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Backend(id) => write!(f, "backend:{id}"),
            Self::Session(id) => write!(f, "session:{id}"),
            Self::Global => write!(f, "global"),
        }
    }
}
