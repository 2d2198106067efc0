use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

use relay_backend::{BackendDirectory, HealthConfig, HealthMonitor};
use relay_core::{RelayConfig, SessionContext, SessionEvent, SessionId, SessionReport, SessionStatus};
use relay_store::{Database, KnowledgeRepo, SessionRepo, StoreError, UsageLedger};

use crate::budget::BudgetPolicy;
use crate::error::EngineError;
use crate::registry::AgentRegistry;
use crate::router::BackendRouter;
use crate::sequencer::HandoffSequencer;

const EVENT_CHANNEL_CAPACITY: usize = 256;

struct ActiveSession {
    cancel: CancellationToken,
}

/// Owns the full engine stack and the set of live sessions.
///
/// Each session runs independently; the only shared state is the store
/// underneath and the per-backend health monitor. Aborting a session
/// cancels its token; the sequencer honors it at the next phase boundary.
pub struct Orchestrator {
    sequencer: Arc<HandoffSequencer>,
    sessions: SessionRepo,
    ledger: UsageLedger,
    knowledge: KnowledgeRepo,
    active: DashMap<SessionId, ActiveSession>,
    events: broadcast::Sender<SessionEvent>,
    config: RelayConfig,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator").finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Assemble the engine from a config, an open database, and a directory
    /// of backend transports. Fails fast when the pipeline names a role the
    /// registry cannot resolve.
    pub fn new(
        config: RelayConfig,
        db: Database,
        directory: BackendDirectory,
    ) -> Result<Self, EngineError> {
        let registry = AgentRegistry::from_config(&config);
        for role in &config.pipeline {
            if !registry.contains(role) {
                return Err(EngineError::UnknownRole(role.clone()));
            }
        }

        let monitor = Arc::new(HealthMonitor::new(HealthConfig {
            failure_threshold: 3,
            probe_cooldown: config.cooldown(),
            stats_window: 32,
        }));
        let policy = BudgetPolicy::new(UsageLedger::new(db.clone()), &config);
        let router = BackendRouter::new(
            Arc::new(directory),
            monitor,
            UsageLedger::new(db.clone()),
            policy,
            &config,
        );

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let sequencer = HandoffSequencer::new(
            router,
            registry,
            SessionRepo::new(db.clone()),
            KnowledgeRepo::new(db.clone()),
            events.clone(),
            &config,
        );

        Ok(Self {
            sequencer: Arc::new(sequencer),
            sessions: SessionRepo::new(db.clone()),
            ledger: UsageLedger::new(db.clone()),
            knowledge: KnowledgeRepo::new(db),
            active: DashMap::new(),
            events,
            config,
        })
    }

    /// Run a session to completion on the caller's task.
    pub async fn run_session(
        &self,
        user_input: String,
        initial_role: Option<String>,
    ) -> Result<SessionReport, EngineError> {
        let session_id = SessionId::new();
        self.run_registered(session_id, user_input, initial_role).await
    }

    /// Spawn a session in the background and hand back its id immediately.
    pub fn start_session(
        self: &Arc<Self>,
        user_input: String,
        initial_role: Option<String>,
    ) -> SessionId {
        let session_id = SessionId::new();
        let orchestrator = Arc::clone(self);
        let id = session_id.clone();
        tokio::spawn(async move {
            let _ = orchestrator
                .run_registered(id, user_input, initial_role)
                .await;
        });
        session_id
    }

    #[instrument(skip(self, user_input, initial_role), fields(session_id = %session_id))]
    async fn run_registered(
        &self,
        session_id: SessionId,
        user_input: String,
        initial_role: Option<String>,
    ) -> Result<SessionReport, EngineError> {
        let cancel = CancellationToken::new();
        self.active.insert(
            session_id.clone(),
            ActiveSession {
                cancel: cancel.clone(),
            },
        );

        let result = self
            .sequencer
            .run(session_id.clone(), user_input, initial_role, cancel)
            .await;
        self.active.remove(&session_id);

        if let Err(err) = &result {
            error!(error = %err, "session run failed");
            // The row may still say running; close it out so inspection
            // tooling never sees a zombie.
            let _ = self.sessions.finish(
                &session_id,
                SessionStatus::Failed,
                &SessionContext::new(),
                None,
            );
        }
        result
    }

    /// Request cooperative cancellation of a live session.
    pub fn abort(&self, session_id: &SessionId) -> Result<(), EngineError> {
        match self.active.get(session_id) {
            Some(entry) => {
                info!(session_id = %session_id, "abort requested");
                entry.cancel.cancel();
                Ok(())
            }
            None => Err(EngineError::SessionNotFound(session_id.to_string())),
        }
    }

    /// Subscribe to the live session event feed.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Reconstruct a report for any archived session.
    pub fn report(&self, session_id: &SessionId) -> Result<SessionReport, EngineError> {
        let record = match self.sessions.get(session_id) {
            Ok(record) => record,
            Err(StoreError::NotFound(_)) => {
                return Err(EngineError::SessionNotFound(session_id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let steps = self.sessions.steps(session_id)?;
        Ok(SessionReport {
            session_id: session_id.clone(),
            status: record.status,
            final_context: record.final_context.unwrap_or_default(),
            failure_cause: record.failure,
            steps,
        })
    }

    /// Ids of sessions currently running.
    pub fn active_sessions(&self) -> Vec<SessionId> {
        self.active.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn ledger(&self) -> &UsageLedger {
        &self.ledger
    }

    pub fn knowledge(&self) -> &KnowledgeRepo {
        &self.knowledge
    }

    pub fn sessions(&self) -> &SessionRepo {
        &self.sessions
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }
}
