use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use relay_core::SessionId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// One revision of a shared knowledge topic.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    pub topic: String,
    pub revision: i64,
    pub payload: serde_json::Value,
    pub session_id: SessionId,
    pub created_at: String,
}

/// Revision-checked append store for cross-session knowledge.
///
/// Topics are never updated in place. Each append names the revision the
/// writer last saw; a mismatch is reported as RevisionConflict with the
/// actual current revision so the caller can re-read and retry. Revisions
/// start at 1, and an expected revision of None asserts the topic is new.
pub struct KnowledgeRepo {
    db: Database,
}

impl KnowledgeRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append a new revision, enforcing the expected current revision.
    #[instrument(skip(self, payload), fields(topic, session_id = %session_id))]
    pub fn append(
        &self,
        topic: &str,
        expected: Option<i64>,
        payload: &serde_json::Value,
        session_id: &SessionId,
    ) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            let current: i64 = conn
                .query_row(
                    "SELECT COALESCE(MAX(revision), 0) FROM knowledge_entries WHERE topic = ?1",
                    [topic],
                    |row| row.get(0),
                )?;

            // expected None asserts the topic does not exist yet.
            let matches = match expected {
                None => current == 0,
                Some(revision) => revision == current,
            };
            if !matches {
                return Err(StoreError::RevisionConflict {
                    topic: topic.to_string(),
                    current,
                });
            }

            let next = current + 1;
            let now = Utc::now().to_rfc3339();
            let inserted = conn.execute(
                "INSERT INTO knowledge_entries (topic, revision, payload, session_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![topic, next, payload.to_string(), session_id.as_str(), now],
            );

            match inserted {
                Ok(_) => Ok(next),
                // Another connection won the revision between our read and
                // write. Surface the fresh revision as a conflict.
                Err(rusqlite::Error::SqliteFailure(f, _))
                    if f.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    let actual: i64 = conn.query_row(
                        "SELECT COALESCE(MAX(revision), 0) FROM knowledge_entries WHERE topic = ?1",
                        [topic],
                        |row| row.get(0),
                    )?;
                    Err(StoreError::RevisionConflict {
                        topic: topic.to_string(),
                        current: actual,
                    })
                }
                Err(e) => Err(e.into()),
            }
        })
    }

    /// Latest revision of a topic.
    #[instrument(skip(self), fields(topic))]
    pub fn fetch(&self, topic: &str) -> Result<KnowledgeEntry, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT topic, revision, payload, session_id, created_at
                 FROM knowledge_entries WHERE topic = ?1
                 ORDER BY revision DESC LIMIT 1",
            )?;
            let mut rows = stmt.query([topic])?;
            match rows.next()? {
                Some(row) => row_to_entry(row),
                None => Err(StoreError::NotFound(format!("topic {topic}"))),
            }
        })
    }

    /// Current revision of a topic, or None if it does not exist.
    pub fn current_revision(&self, topic: &str) -> Result<Option<i64>, StoreError> {
        self.db.with_conn(|conn| {
            let current: i64 = conn.query_row(
                "SELECT COALESCE(MAX(revision), 0) FROM knowledge_entries WHERE topic = ?1",
                [topic],
                |row| row.get(0),
            )?;
            Ok((current > 0).then_some(current))
        })
    }

    /// Full revision history of a topic, oldest first.
    pub fn history(&self, topic: &str) -> Result<Vec<KnowledgeEntry>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT topic, revision, payload, session_id, created_at
                 FROM knowledge_entries WHERE topic = ?1 ORDER BY revision ASC",
            )?;
            let mut rows = stmt.query([topic])?;
            let mut entries = Vec::new();
            while let Some(row) = rows.next()? {
                entries.push(row_to_entry(row)?);
            }
            Ok(entries)
        })
    }

    /// All known topics, sorted.
    pub fn topics(&self) -> Result<Vec<String>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT DISTINCT topic FROM knowledge_entries ORDER BY topic")?;
            let mut rows = stmt.query([])?;
            let mut topics = Vec::new();
            while let Some(row) = rows.next()? {
                topics.push(row_helpers::get(row, 0, "knowledge_entries", "topic")?);
            }
            Ok(topics)
        })
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> Result<KnowledgeEntry, StoreError> {
    let payload_raw: String = row_helpers::get(row, 2, "knowledge_entries", "payload")?;

    Ok(KnowledgeEntry {
        topic: row_helpers::get(row, 0, "knowledge_entries", "topic")?,
        revision: row_helpers::get(row, 1, "knowledge_entries", "revision")?,
        payload: row_helpers::parse_json(&payload_raw, "knowledge_entries", "payload")?,
        session_id: SessionId::from_raw(row_helpers::get::<String>(
            row,
            3,
            "knowledge_entries",
            "session_id",
        )?),
        created_at: row_helpers::get(row, 4, "knowledge_entries", "created_at")?,
    })
}
