use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::timeout;
use tracing::{debug, error, instrument, warn};

use relay_backend::{Backend, BackendDirectory, BackendReply, HealthMonitor};
use relay_core::{
    BackendError, BackendSpec, CallOutcome, RelayConfig, RetryConfig, SessionId, UsageRecord,
};
use relay_store::UsageLedger;

use crate::budget::{Authorization, BudgetPolicy, Candidate};
use crate::error::RouterError;

/// A completed routing round.
#[derive(Debug)]
pub struct RouteOutcome {
    /// Backend that produced the reply.
    pub backend_id: String,
    pub reply: BackendReply,
    /// Units billed to the ledger for the successful attempt.
    pub units: u64,
    /// Transport attempts made across all backends for this one call.
    pub attempts: u32,
}

/// Executes one logical call against the backend fleet.
///
/// Per round: ask the policy for a backend, try it with a bounded timeout,
/// and classify the result. Retryable errors back off and retry on the same
/// backend up to the configured attempt cap; a rate-limit verdict cools the
/// backend down and fails over immediately; fatal errors fail over without
/// backoff. Each backend is tried at most once per round, and every attempt
/// lands in the ledger: failures at zero units, successes at the reported
/// token count or the configured per-call estimate. A ledger write failure
/// fails the attempt rather than the session: the reply is discarded and
/// routing moves to the next backend.
pub struct BackendRouter {
    directory: Arc<BackendDirectory>,
    monitor: Arc<HealthMonitor>,
    ledger: UsageLedger,
    policy: BudgetPolicy,
    retry: RetryConfig,
    cooldown: Duration,
}

impl BackendRouter {
    pub fn new(
        directory: Arc<BackendDirectory>,
        monitor: Arc<HealthMonitor>,
        ledger: UsageLedger,
        policy: BudgetPolicy,
        config: &RelayConfig,
    ) -> Self {
        Self {
            directory,
            monitor,
            ledger,
            policy,
            retry: config.retry.clone(),
            cooldown: config.cooldown(),
        }
    }

    /// Route one prompt to the best backend the policy will pay for.
    ///
    /// A denial before any transport attempt surfaces as `Denied`; once at
    /// least one attempt has been made, running out of candidates surfaces
    /// as `AllBackendsExhausted`.
    #[instrument(skip(self, prompt), fields(session_id = %session_id, class = class.unwrap_or("any")))]
    pub async fn invoke(
        &self,
        session_id: &SessionId,
        prompt: &str,
        class: Option<&str>,
    ) -> Result<RouteOutcome, RouterError> {
        let mut tried: HashSet<String> = HashSet::new();
        let mut total_attempts: u32 = 0;

        loop {
            // Re-evaluated every round: health and budgets move under us.
            let candidates: Vec<Candidate<'_>> = self
                .directory
                .candidates_for(class)
                .into_iter()
                .enumerate()
                .filter(|(_, spec)| !tried.contains(spec.id.as_str()))
                .map(|(decl_index, spec)| Candidate {
                    spec,
                    snapshot: self.monitor.snapshot(&spec.id),
                    decl_index,
                })
                .collect();

            let spec = match self.policy.authorize(session_id, &candidates)? {
                Authorization::Granted(spec) => spec,
                Authorization::Denied(reason) => {
                    return Err(if total_attempts == 0 {
                        warn!(%reason, "call denied before any attempt");
                        RouterError::Denied(reason)
                    } else {
                        warn!(attempts = total_attempts, "no backend left to try");
                        RouterError::AllBackendsExhausted
                    });
                }
            };

            tried.insert(spec.id.clone());
            let Some(transport) = self.directory.transport(&spec.id) else {
                warn!(backend = %spec.id, "backend has no transport registered");
                continue;
            };

            match self
                .try_backend(session_id, spec, transport.as_ref(), prompt, &mut total_attempts)
                .await
            {
                Some(outcome) => return Ok(outcome),
                None => continue,
            }
        }
    }

    /// Drive one backend through its attempt budget. `None` means move on
    /// to the next candidate.
    async fn try_backend(
        &self,
        session_id: &SessionId,
        spec: &BackendSpec,
        transport: &dyn Backend,
        prompt: &str,
        total_attempts: &mut u32,
    ) -> Option<RouteOutcome> {
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            *total_attempts += 1;

            let started = Instant::now();
            let result = match timeout(spec.request_timeout(), transport.send(prompt)).await {
                Ok(inner) => inner,
                Err(_) => Err(BackendError::Timeout(spec.request_timeout())),
            };
            let elapsed = started.elapsed();

            match result {
                Ok(reply) => {
                    self.monitor.record_success(&spec.id, elapsed);
                    let units = if reply.tokens_used > 0 {
                        reply.tokens_used
                    } else {
                        spec.cost_per_call
                    };
                    // A reply we cannot bill is not delivered; the attempt
                    // counts as failed and routing moves on.
                    if let Err(store_err) = self.ledger.record(&UsageRecord::new(
                        session_id.clone(),
                        &spec.id,
                        units,
                        CallOutcome::Success,
                        attempt,
                    )) {
                        error!(
                            backend = %spec.id,
                            error = %store_err,
                            "usage record failed, discarding reply"
                        );
                        return None;
                    }
                    debug!(backend = %spec.id, units, attempt, "call succeeded");
                    return Some(RouteOutcome {
                        backend_id: spec.id.clone(),
                        reply,
                        units,
                        attempts: *total_attempts,
                    });
                }
                Err(err) => {
                    let rate_limited = matches!(&err, BackendError::RateLimited { .. });
                    if let BackendError::RateLimited { retry_after } = &err {
                        let wait = retry_after.unwrap_or(self.cooldown);
                        self.monitor
                            .record_rate_limited(&spec.id, Instant::now() + wait);
                        warn!(
                            backend = %spec.id,
                            cooldown_ms = wait.as_millis() as u64,
                            "rate limited, failing over"
                        );
                    } else {
                        self.monitor.record_failure(&spec.id, elapsed);
                    }

                    // Failed attempts are audited at zero units. No retry
                    // without an audit trail: a record failure ends this
                    // backend's round.
                    if let Err(store_err) = self.ledger.record(&UsageRecord::new(
                        session_id.clone(),
                        &spec.id,
                        0,
                        err.outcome(),
                        attempt,
                    )) {
                        error!(backend = %spec.id, error = %store_err, "usage record failed");
                        return None;
                    }

                    if rate_limited {
                        return None;
                    }
                    if err.is_fatal() {
                        warn!(backend = %spec.id, error = %err, "fatal error, failing over");
                        return None;
                    }
                    if attempt >= self.retry.max_attempts_per_backend {
                        warn!(
                            backend = %spec.id,
                            attempts = attempt,
                            "backend exhausted its attempt budget"
                        );
                        return None;
                    }

                    let delay = self.retry_delay(attempt - 1, err.suggested_delay());
                    warn!(
                        backend = %spec.id,
                        error = %err,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "retrying after error"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Exponential backoff with jitter, honoring a server-suggested delay.
    fn retry_delay(&self, attempt: u32, suggested: Option<Duration>) -> Duration {
        if let Some(delay) = suggested {
            return delay;
        }

        let exp = self.retry.base_delay().as_millis() as f64 * 2.0_f64.powi(attempt as i32);
        let capped = exp.min(self.retry.max_delay().as_millis() as f64);

        let jitter_range = capped * self.retry.jitter_factor;
        let jitter = (random_u64() % (jitter_range as u64 * 2 + 1)) as f64 - jitter_range;
        Duration::from_millis((capped + jitter).max(100.0) as u64)
    }
}

/// Simple non-cryptographic random u64 using thread-local state.
fn random_u64() -> u64 {
    use std::cell::Cell;
    use std::time::SystemTime;

    thread_local! {
        static STATE: Cell<u64> = Cell::new(
            SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos() as u64
        );
    }

    STATE.with(|s| {
        // xorshift64
        let mut x = s.get();
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        s.set(x);
        x
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_backend::{BackendHealth, HealthConfig, MockBackend, MockReply};
    use relay_core::BudgetScope;
    use relay_store::Database;

    fn spec(id: &str, limit: u64, priority: u32, cost: u64) -> BackendSpec {
        BackendSpec {
            id: id.to_string(),
            rate_limit_per_window: limit,
            window_seconds: 3600,
            priority,
            cost_per_call: cost,
            class: None,
            request_timeout_ms: 50,
        }
    }

    struct Fixture {
        router: BackendRouter,
        ledger: UsageLedger,
        monitor: Arc<HealthMonitor>,
        db: Database,
    }

    fn fixture(entries: Vec<(BackendSpec, Arc<MockBackend>)>, config: RelayConfig) -> Fixture {
        let db = Database::in_memory().unwrap();
        let ledger = UsageLedger::new(db.clone());
        let monitor = Arc::new(HealthMonitor::new(HealthConfig {
            failure_threshold: 3,
            probe_cooldown: Duration::from_millis(50),
            stats_window: 16,
        }));

        let mut directory = BackendDirectory::new();
        for (spec, backend) in entries {
            directory.register(spec, backend);
        }

        let policy = BudgetPolicy::new(UsageLedger::new(db.clone()), &config);
        let router = BackendRouter::new(
            Arc::new(directory),
            monitor.clone(),
            UsageLedger::new(db.clone()),
            policy,
            &config,
        );
        Fixture {
            router,
            ledger,
            monitor,
            db,
        }
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            base_delay_ms: 1,
            max_delay_ms: 10,
            max_attempts_per_backend: 3,
            jitter_factor: 0.0,
        }
    }

    fn config_with(retry: RetryConfig, session_budget: Option<u64>) -> RelayConfig {
        RelayConfig {
            retry,
            session_budget,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn success_records_reported_tokens() {
        let backend = Arc::new(MockBackend::new("a", vec![]));
        backend.push(MockReply::text_with_tokens("done", 42));
        let fx = fixture(
            vec![(spec("a", 1000, 1, 10), backend)],
            config_with(fast_retry(), None),
        );

        let session = SessionId::new();
        let outcome = fx.router.invoke(&session, "hello", None).await.unwrap();
        assert_eq!(outcome.backend_id, "a");
        assert_eq!(outcome.reply.text, "done");
        assert_eq!(outcome.units, 42);
        assert_eq!(outcome.attempts, 1);

        let records = fx.ledger.records_for_session(&session).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].units, 42);
        assert_eq!(records[0].outcome, CallOutcome::Success);
        assert_eq!(records[0].attempt, 1);
    }

    #[tokio::test]
    async fn unreported_usage_bills_the_estimate() {
        let backend = Arc::new(MockBackend::new("a", vec![]));
        backend.push(MockReply::text("done"));
        let fx = fixture(
            vec![(spec("a", 1000, 1, 25), backend)],
            config_with(fast_retry(), None),
        );

        let session = SessionId::new();
        fx.router.invoke(&session, "hello", None).await.unwrap();

        let records = fx.ledger.records_for_session(&session).unwrap();
        assert_eq!(records[0].units, 25);
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_error_retries_same_backend() {
        let backend = Arc::new(MockBackend::new("a", vec![]));
        backend.push(MockReply::Fail(BackendError::ServiceError("500".into())));
        backend.push(MockReply::text("recovered"));
        let fx = fixture(
            vec![(spec("a", 1000, 1, 10), backend.clone())],
            config_with(fast_retry(), None),
        );

        let session = SessionId::new();
        let outcome = fx.router.invoke(&session, "hello", None).await.unwrap();
        assert_eq!(outcome.backend_id, "a");
        assert_eq!(outcome.attempts, 2);
        assert_eq!(backend.call_count(), 2);

        let records = fx.ledger.records_for_session(&session).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].outcome, CallOutcome::Error);
        assert_eq!(records[0].units, 0);
        assert_eq!(records[0].attempt, 1);
        assert_eq!(records[1].outcome, CallOutcome::Success);
        assert_eq!(records[1].attempt, 2);
    }

    #[tokio::test]
    async fn rate_limit_cools_down_and_fails_over() {
        let a = Arc::new(MockBackend::new("a", vec![]));
        a.push(MockReply::Fail(BackendError::RateLimited {
            retry_after: Some(Duration::from_secs(60)),
        }));
        let b = Arc::new(MockBackend::new("b", vec![]));
        b.push(MockReply::text("fallback"));
        let fx = fixture(
            vec![(spec("a", 1000, 1, 10), a.clone()), (spec("b", 1000, 2, 10), b)],
            config_with(fast_retry(), None),
        );

        let session = SessionId::new();
        let outcome = fx.router.invoke(&session, "hello", None).await.unwrap();
        assert_eq!(outcome.backend_id, "b");
        // No second attempt on the rate-limited backend.
        assert_eq!(a.call_count(), 1);

        let records = fx.ledger.records_for_session(&session).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].outcome, CallOutcome::RateLimited);
        assert_eq!(records[0].units, 0);
        assert_eq!(records[1].outcome, CallOutcome::Success);

        assert!(matches!(
            fx.monitor.health("a"),
            BackendHealth::RateLimited { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_counts_as_an_attempt() {
        let backend = Arc::new(MockBackend::new("a", vec![]));
        backend.push(MockReply::delayed(
            Duration::from_millis(200),
            MockReply::text("too late"),
        ));
        backend.push(MockReply::text("quick"));
        let fx = fixture(
            vec![(spec("a", 1000, 1, 10), backend)],
            config_with(fast_retry(), None),
        );

        let session = SessionId::new();
        let outcome = fx.router.invoke(&session, "hello", None).await.unwrap();
        assert_eq!(outcome.reply.text, "quick");

        let records = fx.ledger.records_for_session(&session).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].outcome, CallOutcome::Timeout);
        assert_eq!(records[0].units, 0);
        assert_eq!(records[1].outcome, CallOutcome::Success);
    }

    #[tokio::test]
    async fn fatal_error_fails_over_without_retry() {
        let a = Arc::new(MockBackend::new("a", vec![]));
        a.push(MockReply::Fail(BackendError::AuthRejected("expired".into())));
        let b = Arc::new(MockBackend::new("b", vec![]));
        b.push(MockReply::text("fallback"));
        let fx = fixture(
            vec![(spec("a", 1000, 1, 10), a.clone()), (spec("b", 1000, 2, 10), b)],
            config_with(fast_retry(), None),
        );

        let session = SessionId::new();
        let outcome = fx.router.invoke(&session, "hello", None).await.unwrap();
        assert_eq!(outcome.backend_id, "b");
        assert_eq!(a.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausting_every_backend_is_an_error() {
        let backend = Arc::new(MockBackend::new("a", vec![]));
        for _ in 0..3 {
            backend.push(MockReply::Fail(BackendError::Unavailable("down".into())));
        }
        let fx = fixture(
            vec![(spec("a", 1000, 1, 10), backend.clone())],
            config_with(fast_retry(), None),
        );

        let session = SessionId::new();
        let err = fx.router.invoke(&session, "hello", None).await.unwrap_err();
        assert!(matches!(err, RouterError::AllBackendsExhausted));
        assert_eq!(backend.call_count(), 3);

        // All three attempts audited at zero units, numbered in order.
        let records = fx.ledger.records_for_session(&session).unwrap();
        assert_eq!(records.len(), 3);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.units, 0);
            assert_eq!(record.attempt, i as u32 + 1);
        }
        assert!(matches!(
            fx.monitor.health("a"),
            BackendHealth::Unreachable { .. }
        ));
    }

    #[tokio::test]
    async fn denial_before_any_attempt_is_denied() {
        let backend = Arc::new(MockBackend::new("a", vec![]));
        backend.push(MockReply::text("never sent"));
        let fx = fixture(
            vec![(spec("a", 30, 1, 10), backend.clone())],
            config_with(fast_retry(), None),
        );

        let session = SessionId::new();
        fx.ledger
            .record(&UsageRecord::new(
                session.clone(),
                "a",
                30,
                CallOutcome::Success,
                1,
            ))
            .unwrap();

        let err = fx.router.invoke(&session, "hello", None).await.unwrap_err();
        assert!(matches!(
            err,
            RouterError::Denied(relay_core::DenialReason::BudgetExceeded)
        ));
        assert_eq!(backend.call_count(), 0);
        // Nothing new in the ledger.
        assert_eq!(fx.ledger.records_for_session(&session).unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn denial_after_attempts_is_exhaustion() {
        let a = Arc::new(MockBackend::new("a", vec![]));
        for _ in 0..3 {
            a.push(MockReply::Fail(BackendError::ServiceError("500".into())));
        }
        let b = Arc::new(MockBackend::new("b", vec![]));
        b.push(MockReply::text("unaffordable"));
        let fx = fixture(
            vec![(spec("a", 1000, 1, 10), a), (spec("b", 5, 2, 10), b.clone())],
            config_with(fast_retry(), None),
        );

        // Backend b can never afford a call, but a was attempted first, so
        // the round ends in exhaustion rather than denial.
        let session = SessionId::new();
        let err = fx.router.invoke(&session, "hello", None).await.unwrap_err();
        assert!(matches!(err, RouterError::AllBackendsExhausted));
        assert_eq!(b.call_count(), 0);
    }

    #[tokio::test]
    async fn record_failure_discards_reply_and_fails_over() {
        let a = Arc::new(MockBackend::new("a", vec![]));
        a.push(MockReply::text("unbillable"));
        let b = Arc::new(MockBackend::new("b", vec![]));
        b.push(MockReply::text("also unbillable"));
        let fx = fixture(
            vec![
                (spec("a", 1000, 1, 10), a.clone()),
                (spec("b", 1000, 2, 10), b.clone()),
            ],
            config_with(fast_retry(), None),
        );

        // Reads keep working; inserts fail, as if the disk filled up.
        fx.db
            .with_conn(|conn| {
                conn.execute_batch(
                    "CREATE TRIGGER reject_usage BEFORE INSERT ON usage_records \
                     BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
                )
                .map_err(|e| relay_store::StoreError::Database(e.to_string()))
            })
            .unwrap();

        let session = SessionId::new();
        let err = fx.router.invoke(&session, "hello", None).await.unwrap_err();
        // Both backends answered, but neither reply could be audited.
        assert!(matches!(err, RouterError::AllBackendsExhausted));
        assert_eq!(a.call_count(), 1);
        assert_eq!(b.call_count(), 1);
        assert!(fx.ledger.records_for_session(&session).unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_directory_is_all_unavailable() {
        let fx = fixture(vec![], config_with(fast_retry(), None));
        let err = fx
            .router
            .invoke(&SessionId::new(), "hello", None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RouterError::Denied(relay_core::DenialReason::AllUnavailable)
        ));
    }

    #[tokio::test]
    async fn class_filter_limits_candidates() {
        let fast = Arc::new(MockBackend::new("fast-1", vec![]));
        fast.push(MockReply::text("smol"));
        let capable = Arc::new(MockBackend::new("capable-1", vec![]));
        capable.push(MockReply::text("big"));

        let mut fast_spec = spec("fast-1", 1000, 2, 1);
        fast_spec.class = Some("fast".to_string());
        let mut capable_spec = spec("capable-1", 1000, 1, 1);
        capable_spec.class = Some("capable".to_string());

        let fx = fixture(
            vec![(capable_spec, capable.clone()), (fast_spec, fast)],
            config_with(fast_retry(), None),
        );

        // Even though capable-1 has the better priority, the class filter
        // rules it out.
        let outcome = fx
            .router
            .invoke(&SessionId::new(), "hello", Some("fast"))
            .await
            .unwrap();
        assert_eq!(outcome.backend_id, "fast-1");
        assert_eq!(capable.call_count(), 0);
    }

    #[tokio::test]
    async fn session_budget_splits_load_then_denies() {
        let a = Arc::new(MockBackend::new("a", vec![]));
        let b = Arc::new(MockBackend::new("b", vec![]));
        for _ in 0..6 {
            a.push(MockReply::text("from a"));
        }
        for _ in 0..4 {
            b.push(MockReply::text("from b"));
        }
        let fx = fixture(
            vec![(spec("a", 60, 1, 10), a), (spec("b", 40, 2, 10), b)],
            config_with(fast_retry(), Some(100)),
        );

        let session = SessionId::new();
        let mut served = Vec::new();
        for _ in 0..10 {
            let outcome = fx.router.invoke(&session, "go", None).await.unwrap();
            served.push(outcome.backend_id);
        }

        // The preferred backend until its window is full, then the fallback.
        let expected: Vec<String> = std::iter::repeat("a".to_string())
            .take(6)
            .chain(std::iter::repeat("b".to_string()).take(4))
            .collect();
        assert_eq!(served, expected);

        // The session cap is now exactly consumed; the next call is refused
        // outright with nothing attempted and nothing recorded.
        let err = fx.router.invoke(&session, "go", None).await.unwrap_err();
        assert!(matches!(
            err,
            RouterError::Denied(relay_core::DenialReason::BudgetExceeded)
        ));

        let records = fx.ledger.records_for_session(&session).unwrap();
        assert_eq!(records.len(), 10);
        assert!(records.iter().all(|r| r.outcome == CallOutcome::Success));
        assert_eq!(
            fx.ledger
                .consumed_since(&BudgetScope::Session(session.clone()), 0)
                .unwrap(),
            100
        );
    }

    #[test]
    fn retry_delay_respects_suggested() {
        let fx = fixture(vec![], config_with(fast_retry(), None));
        let delay = fx.router.retry_delay(0, Some(Duration::from_secs(5)));
        assert_eq!(delay, Duration::from_secs(5));
    }

    #[test]
    fn retry_delay_doubles_and_caps() {
        let retry = RetryConfig {
            base_delay_ms: 500,
            max_delay_ms: 8000,
            max_attempts_per_backend: 3,
            jitter_factor: 0.0,
        };
        let fx = fixture(vec![], config_with(retry, None));

        assert_eq!(fx.router.retry_delay(0, None).as_millis(), 500);
        assert_eq!(fx.router.retry_delay(1, None).as_millis(), 1000);
        assert_eq!(fx.router.retry_delay(2, None).as_millis(), 2000);
        // 500 * 2^10 far exceeds the cap.
        assert_eq!(fx.router.retry_delay(10, None).as_millis(), 8000);
    }
}
