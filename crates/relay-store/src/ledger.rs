use serde::{Deserialize, Serialize};
use tracing::instrument;

use relay_core::{BudgetScope, RecordId, SessionId, UsageRecord};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Aggregated ledger view for one backend, for operator inspection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackendUsageSummary {
    pub backend_id: String,
    pub calls: u64,
    pub failures: u64,
    pub units: u64,
}

/// Append-only log of backend call attempts.
///
/// Every attempt lands here exactly once, successes with their unit cost and
/// failures with zero units, so scope sums only ever grow. There is no update
/// or delete path on purpose.
pub struct UsageLedger {
    db: Database,
}

impl UsageLedger {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append one attempt record.
    #[instrument(skip(self, record), fields(session_id = %record.session_id, backend_id = %record.backend_id, outcome = %record.outcome))]
    pub fn record(&self, record: &UsageRecord) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO usage_records (id, session_id, backend_id, units, outcome, attempt, recorded_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    record.id.as_str(),
                    record.session_id.as_str(),
                    record.backend_id,
                    record.units as i64,
                    record.outcome.to_string(),
                    record.attempt,
                    record.recorded_at_ms,
                ],
            )?;
            Ok(())
        })
    }

    /// Units consumed within a scope since the given epoch-millisecond
    /// timestamp. Pass 0 for lifetime totals.
    pub fn consumed_since(&self, scope: &BudgetScope, since_ms: i64) -> Result<u64, StoreError> {
        self.db.with_conn(|conn| {
            let total: i64 = match scope {
                BudgetScope::Backend(backend_id) => conn.query_row(
                    "SELECT COALESCE(SUM(units), 0) FROM usage_records
                     WHERE backend_id = ?1 AND recorded_at_ms >= ?2",
                    rusqlite::params![backend_id, since_ms],
                    |row| row.get(0),
                )?,
                BudgetScope::Session(session_id) => conn.query_row(
                    "SELECT COALESCE(SUM(units), 0) FROM usage_records
                     WHERE session_id = ?1 AND recorded_at_ms >= ?2",
                    rusqlite::params![session_id.as_str(), since_ms],
                    |row| row.get(0),
                )?,
                BudgetScope::Global => conn.query_row(
                    "SELECT COALESCE(SUM(units), 0) FROM usage_records
                     WHERE recorded_at_ms >= ?1",
                    [since_ms],
                    |row| row.get(0),
                )?,
            };
            Ok(total as u64)
        })
    }

    /// All records for a session in append order.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn records_for_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<UsageRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, backend_id, units, outcome, attempt, recorded_at_ms
                 FROM usage_records WHERE session_id = ?1
                 ORDER BY recorded_at_ms, id",
            )?;
            let mut rows = stmt.query([session_id.as_str()])?;
            let mut records = Vec::new();
            while let Some(row) = rows.next()? {
                records.push(row_to_record(row)?);
            }
            Ok(records)
        })
    }

    /// Per-backend totals since the given timestamp, ordered by backend id.
    pub fn summaries(&self, since_ms: i64) -> Result<Vec<BackendUsageSummary>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT backend_id,
                        COUNT(*),
                        SUM(CASE WHEN outcome != 'success' THEN 1 ELSE 0 END),
                        COALESCE(SUM(units), 0)
                 FROM usage_records WHERE recorded_at_ms >= ?1
                 GROUP BY backend_id ORDER BY backend_id",
            )?;
            let mut rows = stmt.query([since_ms])?;
            let mut summaries = Vec::new();
            while let Some(row) = rows.next()? {
                summaries.push(BackendUsageSummary {
                    backend_id: row_helpers::get(row, 0, "usage_records", "backend_id")?,
                    calls: row_helpers::get::<i64>(row, 1, "usage_records", "calls")? as u64,
                    failures: row_helpers::get::<i64>(row, 2, "usage_records", "failures")? as u64,
                    units: row_helpers::get::<i64>(row, 3, "usage_records", "units")? as u64,
                });
            }
            Ok(summaries)
        })
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> Result<UsageRecord, StoreError> {
    let outcome_str: String = row_helpers::get(row, 4, "usage_records", "outcome")?;

    Ok(UsageRecord {
        id: RecordId::from_raw(row_helpers::get::<String>(row, 0, "usage_records", "id")?),
        session_id: SessionId::from_raw(row_helpers::get::<String>(
            row,
            1,
            "usage_records",
            "session_id",
        )?),
        backend_id: row_helpers::get(row, 2, "usage_records", "backend_id")?,
        units: row_helpers::get::<i64>(row, 3, "usage_records", "units")? as u64,
        outcome: row_helpers::parse_enum(&outcome_str, "usage_records", "outcome")?,
        attempt: row_helpers::get(row, 5, "usage_records", "attempt")?,
        recorded_at_ms: row_helpers::get(row, 6, "usage_records", "recorded_at_ms")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::CallOutcome;

    fn record_at(
        session_id: &SessionId,
        backend_id: &str,
        units: u64,
        outcome: CallOutcome,
        recorded_at_ms: i64,
    ) -> UsageRecord {
        let mut record = UsageRecord::new(session_id.clone(), backend_id, units, outcome, 1);
        record.recorded_at_ms = recorded_at_ms;
        record
    }

    #[test]
    fn record_and_fetch_roundtrip() {
        let db = Database::in_memory().unwrap();
        let ledger = UsageLedger::new(db);
        let session_id = SessionId::new();

        let record = UsageRecord::new(session_id.clone(), "a", 10, CallOutcome::Success, 1);
        ledger.record(&record).unwrap();

        let records = ledger.records_for_session(&session_id).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, record.id);
        assert_eq!(records[0].backend_id, "a");
        assert_eq!(records[0].units, 10);
        assert_eq!(records[0].outcome, CallOutcome::Success);
        assert_eq!(records[0].attempt, 1);
    }

    #[test]
    fn consumed_grows_monotonically() {
        let db = Database::in_memory().unwrap();
        let ledger = UsageLedger::new(db);
        let session_id = SessionId::new();
        let scope = BudgetScope::Session(session_id.clone());

        let mut previous = 0;
        for units in [10, 0, 25, 0, 5] {
            let outcome = if units == 0 {
                CallOutcome::Error
            } else {
                CallOutcome::Success
            };
            ledger
                .record(&UsageRecord::new(
                    session_id.clone(),
                    "a",
                    units,
                    outcome,
                    1,
                ))
                .unwrap();
            let consumed = ledger.consumed_since(&scope, 0).unwrap();
            assert!(consumed >= previous, "consumed must never decrease");
            previous = consumed;
        }
        assert_eq!(previous, 40);
    }

    #[test]
    fn scopes_sum_independently() {
        let db = Database::in_memory().unwrap();
        let ledger = UsageLedger::new(db);
        let s1 = SessionId::new();
        let s2 = SessionId::new();

        ledger
            .record(&UsageRecord::new(s1.clone(), "a", 10, CallOutcome::Success, 1))
            .unwrap();
        ledger
            .record(&UsageRecord::new(s1.clone(), "b", 20, CallOutcome::Success, 1))
            .unwrap();
        ledger
            .record(&UsageRecord::new(s2.clone(), "a", 40, CallOutcome::Success, 1))
            .unwrap();

        assert_eq!(
            ledger
                .consumed_since(&BudgetScope::Backend("a".into()), 0)
                .unwrap(),
            50
        );
        assert_eq!(
            ledger
                .consumed_since(&BudgetScope::Backend("b".into()), 0)
                .unwrap(),
            20
        );
        assert_eq!(
            ledger.consumed_since(&BudgetScope::Session(s1), 0).unwrap(),
            30
        );
        assert_eq!(
            ledger.consumed_since(&BudgetScope::Session(s2), 0).unwrap(),
            40
        );
        assert_eq!(ledger.consumed_since(&BudgetScope::Global, 0).unwrap(), 70);
    }

    #[test]
    fn window_excludes_older_records() {
        let db = Database::in_memory().unwrap();
        let ledger = UsageLedger::new(db);
        let session_id = SessionId::new();
        let scope = BudgetScope::Backend("a".into());

        ledger
            .record(&record_at(&session_id, "a", 100, CallOutcome::Success, 1_000))
            .unwrap();
        ledger
            .record(&record_at(&session_id, "a", 30, CallOutcome::Success, 5_000))
            .unwrap();
        ledger
            .record(&record_at(&session_id, "a", 7, CallOutcome::Success, 9_000))
            .unwrap();

        assert_eq!(ledger.consumed_since(&scope, 0).unwrap(), 137);
        assert_eq!(ledger.consumed_since(&scope, 2_000).unwrap(), 37);
        assert_eq!(ledger.consumed_since(&scope, 9_000).unwrap(), 7);
        assert_eq!(ledger.consumed_since(&scope, 10_000).unwrap(), 0);
    }

    #[test]
    fn failed_attempts_count_zero_units() {
        let db = Database::in_memory().unwrap();
        let ledger = UsageLedger::new(db);
        let session_id = SessionId::new();

        ledger
            .record(&UsageRecord::new(
                session_id.clone(),
                "a",
                0,
                CallOutcome::RateLimited,
                1,
            ))
            .unwrap();
        ledger
            .record(&UsageRecord::new(
                session_id.clone(),
                "a",
                0,
                CallOutcome::Timeout,
                2,
            ))
            .unwrap();
        ledger
            .record(&UsageRecord::new(
                session_id.clone(),
                "a",
                12,
                CallOutcome::Success,
                3,
            ))
            .unwrap();

        assert_eq!(
            ledger
                .consumed_since(&BudgetScope::Session(session_id.clone()), 0)
                .unwrap(),
            12
        );
        // The audit trail still shows all three attempts.
        assert_eq!(ledger.records_for_session(&session_id).unwrap().len(), 3);
    }

    #[test]
    fn summaries_group_by_backend() {
        let db = Database::in_memory().unwrap();
        let ledger = UsageLedger::new(db);
        let session_id = SessionId::new();

        ledger
            .record(&UsageRecord::new(session_id.clone(), "b", 10, CallOutcome::Success, 1))
            .unwrap();
        ledger
            .record(&UsageRecord::new(session_id.clone(), "a", 0, CallOutcome::Error, 1))
            .unwrap();
        ledger
            .record(&UsageRecord::new(session_id.clone(), "a", 20, CallOutcome::Success, 2))
            .unwrap();

        let summaries = ledger.summaries(0).unwrap();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].backend_id, "a");
        assert_eq!(summaries[0].calls, 2);
        assert_eq!(summaries[0].failures, 1);
        assert_eq!(summaries[0].units, 20);
        assert_eq!(summaries[1].backend_id, "b");
        assert_eq!(summaries[1].failures, 0);
    }

    #[test]
    fn concurrent_appends_all_land() {
        let db = Database::in_memory().unwrap();
        let session_id = SessionId::new();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let ledger = UsageLedger::new(db.clone());
            let session_id = session_id.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..25 {
                    ledger
                        .record(&UsageRecord::new(
                            session_id.clone(),
                            "a",
                            1,
                            CallOutcome::Success,
                            1,
                        ))
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let ledger = UsageLedger::new(db);
        assert_eq!(
            ledger
                .consumed_since(&BudgetScope::Session(session_id.clone()), 0)
                .unwrap(),
            100
        );
        assert_eq!(ledger.records_for_session(&session_id).unwrap().len(), 100);
    }
}
