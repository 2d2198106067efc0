//! Shared types for the relay orchestration engine.
//!
//! Everything the other crates agree on lives here: branded identifiers,
//! usage-ledger records, backend error taxonomy, session lifecycle types,
//! broadcast events, and the operator-facing configuration.

pub mod config;
pub mod errors;
pub mod events;
pub mod ids;
pub mod session;
pub mod usage;

pub use config::{AgentSpec, BackendSpec, ConfigError, RelayConfig, RetryConfig};
pub use errors::{BackendError, DenialReason};
pub use events::SessionEvent;
pub use ids::{RecordId, SessionId};
pub use session::{FailureCause, SessionContext, SessionReport, SessionStatus, StepRecord};
pub use usage::{BudgetScope, CallOutcome, UsageRecord};
