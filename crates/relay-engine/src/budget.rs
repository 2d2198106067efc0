use std::time::Duration;

use chrono::Utc;
use tracing::{debug, instrument};

use relay_backend::HealthSnapshot;
use relay_core::{BackendSpec, BudgetScope, DenialReason, RelayConfig, SessionId};
use relay_store::{StoreError, UsageLedger};

/// One backend under consideration for a routing round.
pub struct Candidate<'a> {
    pub spec: &'a BackendSpec,
    pub snapshot: HealthSnapshot,
    /// Position in the declared backend list; the final tie-breaker.
    pub decl_index: usize,
}

/// Outcome of a policy evaluation. Store failures are errors; refusing every
/// candidate is a domain result, not an error.
pub enum Authorization<'a> {
    Granted(&'a BackendSpec),
    Denied(DenialReason),
}

/// Decides, per call, which backend may spend budget.
///
/// Selection order is priority rank, then recent error rate, then recent
/// average latency, then declaration order, which makes the choice
/// deterministic for a fixed ledger and health state. A backend is
/// affordable when its estimated cost still fits every applicable scope:
/// consumed + estimate <= limit.
///
/// Nothing is cached between calls; every evaluation re-reads the ledger so
/// concurrent sessions cannot ride a stale sum past a limit.
pub struct BudgetPolicy {
    ledger: UsageLedger,
    session_budget: Option<u64>,
    global_budget: Option<u64>,
    global_window: Duration,
}

impl BudgetPolicy {
    pub fn new(ledger: UsageLedger, config: &RelayConfig) -> Self {
        Self {
            ledger,
            session_budget: config.session_budget,
            global_budget: config.global_budget,
            global_window: config.global_window(),
        }
    }

    /// Pick the best eligible, affordable candidate.
    #[instrument(skip(self, candidates), fields(session_id = %session_id))]
    pub fn authorize<'a>(
        &self,
        session_id: &SessionId,
        candidates: &[Candidate<'a>],
    ) -> Result<Authorization<'a>, StoreError> {
        let mut eligible: Vec<&Candidate<'a>> = candidates
            .iter()
            .filter(|c| c.snapshot.health.is_eligible())
            .collect();

        if eligible.is_empty() {
            return Ok(Authorization::Denied(DenialReason::AllUnavailable));
        }

        eligible.sort_by(|a, b| {
            a.spec
                .priority
                .cmp(&b.spec.priority)
                .then(a.snapshot.error_rate.total_cmp(&b.snapshot.error_rate))
                .then(a.snapshot.avg_latency_ms.total_cmp(&b.snapshot.avg_latency_ms))
                .then(a.decl_index.cmp(&b.decl_index))
        });

        let now_ms = Utc::now().timestamp_millis();

        // Session and global sums are shared by every candidate; read once.
        let session_consumed = match self.session_budget {
            Some(_) => self
                .ledger
                .consumed_since(&BudgetScope::Session(session_id.clone()), 0)?,
            None => 0,
        };
        let global_consumed = match self.global_budget {
            Some(_) => self.ledger.consumed_since(
                &BudgetScope::Global,
                now_ms - self.global_window.as_millis() as i64,
            )?,
            None => 0,
        };

        for candidate in eligible {
            let spec = candidate.spec;
            let estimate = spec.cost_per_call;

            let window_start = now_ms - spec.window().as_millis() as i64;
            let backend_consumed = self
                .ledger
                .consumed_since(&BudgetScope::Backend(spec.id.clone()), window_start)?;

            if backend_consumed + estimate > spec.rate_limit_per_window {
                debug!(
                    backend = %spec.id,
                    consumed = backend_consumed,
                    limit = spec.rate_limit_per_window,
                    "backend window budget would be exceeded"
                );
                continue;
            }

            if let Some(limit) = self.session_budget {
                if session_consumed + estimate > limit {
                    debug!(
                        backend = %spec.id,
                        consumed = session_consumed,
                        limit,
                        "session budget would be exceeded"
                    );
                    continue;
                }
            }

            if let Some(limit) = self.global_budget {
                if global_consumed + estimate > limit {
                    debug!(
                        backend = %spec.id,
                        consumed = global_consumed,
                        limit,
                        "global budget would be exceeded"
                    );
                    continue;
                }
            }

            debug!(backend = %spec.id, estimate, "backend authorized");
            return Ok(Authorization::Granted(spec));
        }

        // Healthy candidates existed but none could afford the call.
        Ok(Authorization::Denied(DenialReason::BudgetExceeded))
    }
}
