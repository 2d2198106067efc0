use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use relay_core::{FailureCause, SessionContext, SessionId, SessionStatus, StepRecord};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Persisted session lifecycle row.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub status: SessionStatus,
    pub first_role: String,
    pub final_context: Option<SessionContext>,
    pub failure: Option<FailureCause>,
    pub created_at: String,
    pub updated_at: String,
}

pub struct SessionRepo {
    db: Database,
}

impl SessionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a new running session.
    #[instrument(skip(self), fields(session_id = %id, first_role))]
    pub fn create(&self, id: &SessionId, first_role: &str) -> Result<SessionRecord, StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, status, first_role, created_at, updated_at)
                 VALUES (?1, 'running', ?2, ?3, ?4)",
                rusqlite::params![id.as_str(), first_role, now, now],
            )?;
            Ok(SessionRecord {
                id: id.clone(),
                status: SessionStatus::Running,
                first_role: first_role.to_string(),
                final_context: None,
                failure: None,
                created_at: now.clone(),
                updated_at: now,
            })
        })
    }

    /// Get a session by id.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn get(&self, id: &SessionId) -> Result<SessionRecord, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, status, first_role, final_context, failure, created_at, updated_at
                 FROM sessions WHERE id = ?1",
            )?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_session(row),
                None => Err(StoreError::NotFound(format!("session {id}"))),
            }
        })
    }

    /// List sessions, newest first, optionally filtered by status.
    pub fn list(
        &self,
        status: Option<&SessionStatus>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<SessionRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut results = Vec::new();
            match status {
                Some(s) => {
                    let mut stmt = conn.prepare(
                        "SELECT id, status, first_role, final_context, failure, created_at, updated_at
                         FROM sessions WHERE status = ?1
                         ORDER BY created_at DESC LIMIT ?2 OFFSET ?3",
                    )?;
                    let mut rows =
                        stmt.query(rusqlite::params![s.to_string(), limit, offset])?;
                    while let Some(row) = rows.next()? {
                        results.push(row_to_session(row)?);
                    }
                }
                None => {
                    let mut stmt = conn.prepare(
                        "SELECT id, status, first_role, final_context, failure, created_at, updated_at
                         FROM sessions ORDER BY created_at DESC LIMIT ?1 OFFSET ?2",
                    )?;
                    let mut rows = stmt.query(rusqlite::params![limit, offset])?;
                    while let Some(row) = rows.next()? {
                        results.push(row_to_session(row)?);
                    }
                }
            }
            Ok(results)
        })
    }

    /// Record the terminal state of a session, preserving whatever context
    /// had accumulated by then.
    #[instrument(skip(self, final_context, failure), fields(session_id = %id, status = %status))]
    pub fn finish(
        &self,
        id: &SessionId,
        status: SessionStatus,
        final_context: &SessionContext,
        failure: Option<&FailureCause>,
    ) -> Result<(), StoreError> {
        let context_json = serde_json::to_string(final_context)?;
        let failure_json = failure.map(serde_json::to_string).transpose()?;
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE sessions SET status = ?1, final_context = ?2, failure = ?3, updated_at = ?4
                 WHERE id = ?5",
                rusqlite::params![
                    status.to_string(),
                    context_json,
                    failure_json,
                    now,
                    id.as_str()
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("session {id}")));
            }
            Ok(())
        })
    }

    /// Append one handoff step to the session's step log.
    #[instrument(skip(self, step), fields(session_id = %id, seq = step.seq, role = %step.role))]
    pub fn append_step(&self, id: &SessionId, step: &StepRecord) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO session_steps (session_id, seq, role, backend_id, outcome)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    id.as_str(),
                    step.seq,
                    step.role,
                    step.backend_id,
                    step.outcome.map(|o| o.to_string()),
                ],
            )?;
            Ok(())
        })
    }

    /// The session's step log in execution order.
    pub fn steps(&self, id: &SessionId) -> Result<Vec<StepRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT seq, role, backend_id, outcome FROM session_steps
                 WHERE session_id = ?1 ORDER BY seq ASC",
            )?;
            let mut rows = stmt.query([id.as_str()])?;
            let mut steps = Vec::new();
            while let Some(row) = rows.next()? {
                let outcome_str: Option<String> =
                    row_helpers::get_opt(row, 3, "session_steps", "outcome")?;
                steps.push(StepRecord {
                    seq: row_helpers::get(row, 0, "session_steps", "seq")?,
                    role: row_helpers::get(row, 1, "session_steps", "role")?,
                    backend_id: row_helpers::get_opt(row, 2, "session_steps", "backend_id")?,
                    outcome: outcome_str
                        .map(|raw| row_helpers::parse_enum(&raw, "session_steps", "outcome"))
                        .transpose()?,
                });
            }
            Ok(steps)
        })
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<SessionRecord, StoreError> {
    let status_str: String = row_helpers::get(row, 1, "sessions", "status")?;
    let context_raw: Option<String> = row_helpers::get_opt(row, 3, "sessions", "final_context")?;
    let failure_raw: Option<String> = row_helpers::get_opt(row, 4, "sessions", "failure")?;

    Ok(SessionRecord {
        id: SessionId::from_raw(row_helpers::get::<String>(row, 0, "sessions", "id")?),
        status: row_helpers::parse_enum(&status_str, "sessions", "status")?,
        first_role: row_helpers::get(row, 2, "sessions", "first_role")?,
        final_context: context_raw
            .map(|raw| row_helpers::parse_json(&raw, "sessions", "final_context"))
            .transpose()?,
        failure: failure_raw
            .map(|raw| row_helpers::parse_json(&raw, "sessions", "failure"))
            .transpose()?,
        created_at: row_helpers::get(row, 5, "sessions", "created_at")?,
        updated_at: row_helpers::get(row, 6, "sessions", "updated_at")?,
    })
}
