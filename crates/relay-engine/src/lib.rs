//! The orchestration engine: budget-gated backend routing, the agent
//! registry, the per-session handoff state machine, and the orchestrator
//! that runs sessions concurrently with cooperative abort.

pub mod budget;
pub mod error;
pub mod orchestrator;
pub mod registry;
pub mod router;
pub mod sequencer;

pub use budget::{Authorization, BudgetPolicy, Candidate};
pub use error::{EngineError, RouterError};
pub use orchestrator::Orchestrator;
pub use registry::AgentRegistry;
pub use router::{BackendRouter, RouteOutcome};
pub use sequencer::HandoffSequencer;
