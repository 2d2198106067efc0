use std::collections::BTreeSet;

use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use relay_core::{
    AgentSpec, CallOutcome, FailureCause, RelayConfig, SessionContext, SessionEvent, SessionId,
    SessionReport, SessionStatus, StepRecord,
};
use relay_store::{KnowledgeRepo, SessionRepo, StoreError};

use crate::error::{EngineError, RouterError};
use crate::registry::AgentRegistry;
use crate::router::BackendRouter;

/// Where a running session currently is. The terminal states live in
/// `SessionStatus`; this only tracks the live loop.
enum Phase {
    Routing(String),
    Finalizing,
}

enum FlushError {
    /// Conflict retries ran out; another writer kept winning the topic.
    Exhausted(String),
    Store(StoreError),
}

/// Walks one session through its agent pipeline.
///
/// Each step resolves the role, validates its required context keys, routes
/// one backend call, and merges the reply into the session context before
/// the next role runs. Steps are strictly sequential within a session.
/// Cancellation is cooperative: the abort signal is checked between phases,
/// so an in-flight call completes and its usage is recorded, but its reply
/// is discarded.
pub struct HandoffSequencer {
    router: BackendRouter,
    registry: AgentRegistry,
    sessions: SessionRepo,
    knowledge: KnowledgeRepo,
    events: broadcast::Sender<SessionEvent>,
    pipeline: Vec<String>,
    max_steps: u32,
    flush_retries: u32,
}

impl HandoffSequencer {
    pub fn new(
        router: BackendRouter,
        registry: AgentRegistry,
        sessions: SessionRepo,
        knowledge: KnowledgeRepo,
        events: broadcast::Sender<SessionEvent>,
        config: &RelayConfig,
    ) -> Self {
        Self {
            router,
            registry,
            sessions,
            knowledge,
            events,
            pipeline: config.pipeline.clone(),
            max_steps: config.max_steps,
            flush_retries: config.knowledge_flush_retries,
        }
    }

    /// Run a session to a terminal status.
    ///
    /// Every exit path finalizes the session row; the report carries the
    /// merged context even for failed and aborted sessions.
    #[instrument(skip(self, user_input, cancel), fields(session_id = %session_id))]
    pub async fn run(
        &self,
        session_id: SessionId,
        user_input: String,
        initial_role: Option<String>,
        cancel: CancellationToken,
    ) -> Result<SessionReport, EngineError> {
        let first_role = match initial_role {
            Some(role) => role,
            None => self
                .pipeline
                .first()
                .cloned()
                .ok_or_else(|| EngineError::InvalidConfig("pipeline is empty".into()))?,
        };

        self.sessions.create(&session_id, &first_role)?;
        self.emit(SessionEvent::SessionStarted {
            session_id: session_id.clone(),
            first_role: first_role.clone(),
        });

        let mut context = SessionContext::new();
        context.insert("user_input".to_string(), Value::String(user_input));

        let mut phase = Phase::Routing(first_role);
        let mut seq: u32 = 0;
        let mut published: BTreeSet<String> = BTreeSet::new();

        let (status, failure) = loop {
            if cancel.is_cancelled() {
                info!(step = seq, "session aborted");
                break (SessionStatus::Aborted, None);
            }

            phase = match phase {
                Phase::Routing(role) => {
                    seq += 1;
                    if seq > self.max_steps {
                        warn!(limit = self.max_steps, "step limit exceeded");
                        break (
                            SessionStatus::Failed,
                            Some(FailureCause::StepLimitExceeded {
                                limit: self.max_steps,
                            }),
                        );
                    }
                    self.emit(SessionEvent::StepStarted {
                        session_id: session_id.clone(),
                        role: role.clone(),
                        step: seq,
                    });

                    let Some(agent) = self.registry.resolve(&role) else {
                        self.log_step(&session_id, seq, &role, None, None)?;
                        break (
                            SessionStatus::Failed,
                            Some(FailureCause::UnknownRole { role }),
                        );
                    };

                    // Never spend budget on a call that cannot assemble a
                    // valid prompt.
                    let missing = AgentRegistry::missing_keys(agent, &context);
                    if !missing.is_empty() {
                        self.log_step(&session_id, seq, &role, None, None)?;
                        break (
                            SessionStatus::Failed,
                            Some(FailureCause::MissingKeys {
                                role,
                                keys: missing,
                            }),
                        );
                    }

                    let prompt = build_prompt(agent, &context);
                    let result = self
                        .router
                        .invoke(&session_id, &prompt, agent.backend_class.as_deref())
                        .await;

                    if cancel.is_cancelled() {
                        // The call already completed and its usage landed;
                        // only the result is thrown away.
                        let (backend_id, outcome) = match &result {
                            Ok(route) => (Some(route.backend_id.clone()), Some(CallOutcome::Success)),
                            Err(_) => (None, None),
                        };
                        self.log_step(&session_id, seq, &role, backend_id, outcome)?;
                        info!(step = seq, "session aborted, discarding in-flight result");
                        break (SessionStatus::Aborted, None);
                    }

                    let route = match result {
                        Ok(route) => route,
                        Err(RouterError::Denied(reason)) => {
                            self.log_step(&session_id, seq, &role, None, None)?;
                            break (
                                SessionStatus::Failed,
                                Some(FailureCause::Denied { role, reason }),
                            );
                        }
                        Err(RouterError::AllBackendsExhausted) => {
                            self.log_step(&session_id, seq, &role, None, None)?;
                            break (
                                SessionStatus::Failed,
                                Some(FailureCause::BackendsExhausted { role }),
                            );
                        }
                        Err(RouterError::Store(e)) => return Err(e.into()),
                    };

                    self.log_step(
                        &session_id,
                        seq,
                        &role,
                        Some(route.backend_id.clone()),
                        Some(CallOutcome::Success),
                    )?;
                    self.emit(SessionEvent::BackendSelected {
                        session_id: session_id.clone(),
                        role: role.clone(),
                        backend_id: route.backend_id.clone(),
                    });
                    self.emit(SessionEvent::CallRecorded {
                        session_id: session_id.clone(),
                        backend_id: route.backend_id.clone(),
                        outcome: CallOutcome::Success,
                        units: route.units,
                    });

                    let (merged_keys, next_role) =
                        merge_response(&mut context, agent, &route.reply.text);
                    debug!(role = %role, keys = ?merged_keys, "context merged");
                    self.emit(SessionEvent::ContextMerged {
                        session_id: session_id.clone(),
                        role: role.clone(),
                        keys: merged_keys,
                    });
                    published.extend(agent.publishes.iter().cloned());

                    match next_role {
                        // Validated when the next iteration resolves it.
                        Some(next) => Phase::Routing(next),
                        None => match self.next_in_pipeline(&role) {
                            Some(next) => Phase::Routing(next),
                            None => Phase::Finalizing,
                        },
                    }
                }

                Phase::Finalizing => {
                    match self.flush_knowledge(&session_id, &context, &published) {
                        Ok(()) => break (SessionStatus::Completed, None),
                        Err(FlushError::Exhausted(detail)) => {
                            warn!(%detail, "knowledge flush gave up");
                            break (
                                SessionStatus::Failed,
                                Some(FailureCause::KnowledgeFlush { detail }),
                            );
                        }
                        Err(FlushError::Store(e)) => return Err(e.into()),
                    }
                }
            };
        };

        self.sessions
            .finish(&session_id, status, &context, failure.as_ref())?;
        self.emit(SessionEvent::SessionFinished {
            session_id: session_id.clone(),
            status,
            failure: failure.as_ref().map(|f| f.to_string()),
        });
        info!(%status, steps = seq, "session finished");

        let steps = self.sessions.steps(&session_id)?;
        Ok(SessionReport {
            session_id,
            status,
            final_context: context,
            failure_cause: failure,
            steps,
        })
    }

    /// Next role after `current` in the configured pipeline, if any.
    fn next_in_pipeline(&self, current: &str) -> Option<String> {
        let idx = self.pipeline.iter().position(|role| role == current)?;
        self.pipeline.get(idx + 1).cloned()
    }

    /// Flush every published key present in the final context to a topic of
    /// the same name, read-merge-append with bounded conflict retries.
    fn flush_knowledge(
        &self,
        session_id: &SessionId,
        context: &SessionContext,
        published: &BTreeSet<String>,
    ) -> Result<(), FlushError> {
        for key in published {
            let Some(payload) = context.get(key) else {
                continue;
            };
            self.flush_topic(session_id, key, payload)?;
        }
        Ok(())
    }

    fn flush_topic(
        &self,
        session_id: &SessionId,
        topic: &str,
        payload: &Value,
    ) -> Result<(), FlushError> {
        for attempt in 0..=self.flush_retries {
            let current = self
                .knowledge
                .current_revision(topic)
                .map_err(FlushError::Store)?;

            let candidate = match current {
                Some(_) => {
                    let existing = self.knowledge.fetch(topic).map_err(FlushError::Store)?;
                    let merged = merge_payloads(&existing.payload, payload);
                    if merged == existing.payload {
                        // Replay: the stored revision already carries this
                        // payload, no new revision needed.
                        debug!(topic, "knowledge already current");
                        return Ok(());
                    }
                    merged
                }
                None => payload.clone(),
            };

            match self.knowledge.append(topic, current, &candidate, session_id) {
                Ok(revision) => {
                    self.emit(SessionEvent::KnowledgeFlushed {
                        session_id: session_id.clone(),
                        topic: topic.to_string(),
                        revision,
                    });
                    return Ok(());
                }
                Err(StoreError::RevisionConflict { current, .. }) => {
                    debug!(topic, current, attempt, "knowledge conflict, re-reading");
                }
                Err(e) => return Err(FlushError::Store(e)),
            }
        }
        Err(FlushError::Exhausted(format!(
            "topic '{topic}' still contended after {} retries",
            self.flush_retries
        )))
    }

    fn log_step(
        &self,
        session_id: &SessionId,
        seq: u32,
        role: &str,
        backend_id: Option<String>,
        outcome: Option<CallOutcome>,
    ) -> Result<(), EngineError> {
        self.sessions.append_step(
            session_id,
            &StepRecord {
                seq,
                role: role.to_string(),
                backend_id,
                outcome,
            },
        )?;
        Ok(())
    }

    fn emit(&self, event: SessionEvent) {
        // No listener is fine; sessions run the same with or without one.
        let _ = self.events.send(event);
    }
}

/// Role header plus each required key's current value, in declaration order.
fn build_prompt(agent: &AgentSpec, context: &SessionContext) -> String {
    let mut prompt = format!("[{}]", agent.role);
    for key in &agent.requires {
        if let Some(value) = context.get(key) {
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            prompt.push_str(&format!("\n{key}: {rendered}"));
        }
    }
    prompt
}

/// Merge a reply into the session context per the agent's declared keys.
///
/// A JSON object contributes its declared produced keys individually, with
/// later writes overwriting earlier same-named keys. Anything else lands
/// whole under the first produced key. A `next_role` string is consumed as
/// the dynamic dispatch signal and never merged.
fn merge_response(
    context: &mut SessionContext,
    agent: &AgentSpec,
    text: &str,
) -> (Vec<String>, Option<String>) {
    let mut merged = Vec::new();
    let mut next_role = None;

    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => {
            if let Some(Value::String(role)) = map.get("next_role") {
                next_role = Some(role.clone());
            }
            for key in &agent.produces {
                if key == "next_role" {
                    continue;
                }
                if let Some(value) = map.get(key) {
                    context.insert(key.clone(), value.clone());
                    merged.push(key.clone());
                }
            }
        }
        _ => {
            if let Some(first) = agent.produces.first() {
                context.insert(first.clone(), Value::String(text.to_string()));
                merged.push(first.clone());
            }
        }
    }

    (merged, next_role)
}

/// Object payloads merge key-wise with the incoming side winning; anything
/// else is replaced outright.
fn merge_payloads(existing: &Value, incoming: &Value) -> Value {
    match (existing, incoming) {
        (Value::Object(old), Value::Object(new)) => {
            let mut out = old.clone();
            for (key, value) in new {
                out.insert(key.clone(), value.clone());
            }
            Value::Object(out)
        }
        _ => incoming.clone(),
    }
}
