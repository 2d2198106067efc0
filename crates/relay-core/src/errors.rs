use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::usage::CallOutcome;

/// Typed failure taxonomy for backend transport calls.
/// Classifies errors by how the router should react: retry the same backend,
/// cool it down and fail over, or skip straight to the next candidate.
#[derive(Clone, Debug, thiserror::Error)]
pub enum BackendError {
    // Fail over after cooldown, never retried on the same backend
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    // Retryable on the same backend with backoff
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("backend service error: {0}")]
    ServiceError(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    // Fatal for this backend, skip to the next candidate without backoff
    #[error("request rejected: {0}")]
    InvalidPrompt(String),
    #[error("credentials rejected: {0}")]
    AuthRejected(String),
}

impl BackendError {
    /// Whether the same backend is worth another attempt after backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_) | Self::ServiceError(_) | Self::Timeout(_)
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvalidPrompt(_) | Self::AuthRejected(_))
    }

    pub fn suggested_delay(&self) -> Option<Duration> {
        if let Self::RateLimited { retry_after } = self {
            *retry_after
        } else {
            None
        }
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::Unavailable(_) => "unavailable",
            Self::ServiceError(_) => "service_error",
            Self::Timeout(_) => "timeout",
            Self::InvalidPrompt(_) => "invalid_prompt",
            Self::AuthRejected(_) => "auth_rejected",
        }
    }

    /// The ledger outcome this failure is recorded under.
    pub fn outcome(&self) -> CallOutcome {
        match self {
            Self::RateLimited { .. } => CallOutcome::RateLimited,
            Self::Timeout(_) => CallOutcome::Timeout,
            _ => CallOutcome::Error,
        }
    }
}

/// Why the budget policy refused to pick a backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    /// At least one candidate was healthy, but every healthy candidate would
    /// be pushed over a budget limit by this call.
    BudgetExceeded,
    /// Every candidate is rate-limited or unreachable right now.
    AllUnavailable,
}

impl std::fmt::Display for DenialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BudgetExceeded => write!(f, "budget exceeded"),
            Self::AllUnavailable => write!(f, "all backends unavailable"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(BackendError::Unavailable("refused".into()).is_retryable());
        assert!(BackendError::ServiceError("500".into()).is_retryable());
        assert!(BackendError::Timeout(Duration::from_secs(30)).is_retryable());
        assert!(!BackendError::RateLimited { retry_after: None }.is_retryable());
    }

    #[test]
    fn fatal_classification() {
        assert!(BackendError::InvalidPrompt("empty".into()).is_fatal());
        assert!(BackendError::AuthRejected("expired".into()).is_fatal());
        assert!(!BackendError::Timeout(Duration::from_secs(1)).is_fatal());
        assert!(!BackendError::RateLimited { retry_after: None }.is_fatal());
    }

    #[test]
    fn suggested_delay_only_for_rate_limit() {
        let rl = BackendError::RateLimited {
            retry_after: Some(Duration::from_secs(5)),
        };
        assert_eq!(rl.suggested_delay(), Some(Duration::from_secs(5)));
        assert_eq!(BackendError::ServiceError("x".into()).suggested_delay(), None);
    }

    #[test]
    fn outcome_mapping_is_total() {
        assert_eq!(
            BackendError::RateLimited { retry_after: None }.outcome(),
            CallOutcome::RateLimited
        );
        assert_eq!(
            BackendError::Timeout(Duration::from_secs(1)).outcome(),
            CallOutcome::Timeout
        );
        assert_eq!(BackendError::Unavailable("x".into()).outcome(), CallOutcome::Error);
        assert_eq!(BackendError::ServiceError("x".into()).outcome(), CallOutcome::Error);
        assert_eq!(BackendError::InvalidPrompt("x".into()).outcome(), CallOutcome::Error);
        assert_eq!(BackendError::AuthRejected("x".into()).outcome(), CallOutcome::Error);
    }

    #[test]
    fn error_kind_strings() {
        assert_eq!(
            BackendError::RateLimited { retry_after: None }.error_kind(),
            "rate_limited"
        );
        assert_eq!(BackendError::Unavailable("x".into()).error_kind(), "unavailable");
    }

    #[test]
    fn denial_reason_display() {
        assert_eq!(DenialReason::BudgetExceeded.to_string(), "budget exceeded");
        assert_eq!(DenialReason::AllUnavailable.to_string(), "all backends unavailable");
    }
}
