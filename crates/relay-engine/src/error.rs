use relay_core::DenialReason;
use relay_store::StoreError;

/// Failures surfaced by a routing round.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// The policy refused before any backend was attempted.
    #[error("routing denied: {0}")]
    Denied(DenialReason),

    /// At least one backend was attempted and every candidate is spent.
    #[error("all backends exhausted")]
    AllBackendsExhausted,

    /// The ledger could not be read during authorization. Budget
    /// enforcement cannot continue without those sums; write failures are
    /// absorbed per attempt instead.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failures at the orchestration boundary.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("unknown role '{0}'")]
    UnknownRole(String),

    #[error("session {0} not found")]
    SessionNotFound(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
