use std::collections::VecDeque;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{info, warn};

/// Observed health of a backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendHealth {
    Available,
    /// Recent failures below the unreachable threshold, or probing after a
    /// cooldown. Still eligible for selection.
    Degraded,
    /// Sitting out a rate-limit cooldown. Ineligible until the deadline.
    RateLimited { until: Instant },
    /// Consecutive failures crossed the threshold. Ineligible until the
    /// probe cooldown elapses.
    Unreachable { since: Instant },
}

impl BackendHealth {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Degraded => "degraded",
            Self::RateLimited { .. } => "rate_limited",
            Self::Unreachable { .. } => "unreachable",
        }
    }

    /// Whether the policy may hand this backend a call right now.
    pub fn is_eligible(&self) -> bool {
        matches!(self, Self::Available | Self::Degraded)
    }
}

/// Thresholds for the health state machine.
#[derive(Clone, Debug)]
pub struct HealthConfig {
    /// Consecutive failures before a backend is marked unreachable.
    pub failure_threshold: u32,
    /// How long an unreachable backend sits out before one probe call
    /// is allowed through.
    pub probe_cooldown: Duration,
    /// How many recent calls feed the error-rate and latency stats.
    pub stats_window: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            probe_cooldown: Duration::from_secs(30),
            stats_window: 32,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct CallSample {
    success: bool,
    latency_ms: f64,
}

#[derive(Debug, Default)]
struct BackendStats {
    consecutive_failures: u32,
    rate_limited_until: Option<Instant>,
    unreachable_since: Option<Instant>,
    recent: VecDeque<CallSample>,
}

/// Point-in-time view of one backend, fed to the selection policy.
#[derive(Clone, Copy, Debug)]
pub struct HealthSnapshot {
    pub health: BackendHealth,
    /// Fraction of recent calls that failed. 0.0 with no history.
    pub error_rate: f64,
    /// Mean latency of recent successful calls, in milliseconds.
    pub avg_latency_ms: f64,
}

/// Tracks per-backend availability and recent call quality.
///
/// State machine per backend:
/// - failures below the threshold leave it Degraded but eligible
/// - hitting the threshold marks it Unreachable for `probe_cooldown`,
///   after which it re-enters as Degraded until a success clears it
/// - a rate-limit verdict sidelines it until the given deadline, decayed
///   lazily on the next health query
pub struct HealthMonitor {
    config: HealthConfig,
    stats: DashMap<String, BackendStats>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            stats: DashMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(HealthConfig::default())
    }

    /// Record a successful call. Clears failure state entirely.
    pub fn record_success(&self, backend_id: &str, latency: Duration) {
        let mut entry = self.stats.entry(backend_id.to_string()).or_default();
        if entry.unreachable_since.is_some() {
            info!(backend = backend_id, "backend recovered");
        }
        entry.consecutive_failures = 0;
        entry.unreachable_since = None;
        entry.rate_limited_until = None;
        Self::push_sample(&mut entry.recent, self.config.stats_window, true, latency);
    }

    /// Record a failed call (timeout or error).
    pub fn record_failure(&self, backend_id: &str, latency: Duration) {
        let mut entry = self.stats.entry(backend_id.to_string()).or_default();
        entry.consecutive_failures += 1;
        Self::push_sample(&mut entry.recent, self.config.stats_window, false, latency);

        if entry.consecutive_failures >= self.config.failure_threshold
            && entry.unreachable_since.is_none()
        {
            warn!(
                backend = backend_id,
                failures = entry.consecutive_failures,
                cooldown_secs = self.config.probe_cooldown.as_secs(),
                "backend marked unreachable after {} consecutive failures",
                entry.consecutive_failures
            );
            entry.unreachable_since = Some(Instant::now());
        }
    }

    /// Record a rate-limit verdict. Counts toward the error rate but not
    /// toward the unreachable threshold.
    pub fn record_rate_limited(&self, backend_id: &str, until: Instant) {
        let mut entry = self.stats.entry(backend_id.to_string()).or_default();
        entry.rate_limited_until = Some(until);
        Self::push_sample(
            &mut entry.recent,
            self.config.stats_window,
            false,
            Duration::ZERO,
        );
        info!(backend = backend_id, "backend rate limited");
    }

    /// Current health, decaying expired cooldowns as a side effect.
    pub fn health(&self, backend_id: &str) -> BackendHealth {
        let Some(mut entry) = self.stats.get_mut(backend_id) else {
            return BackendHealth::Available;
        };
        Self::effective_health(&self.config, &mut entry)
    }

    /// Health plus recent-call stats in one locked pass.
    pub fn snapshot(&self, backend_id: &str) -> HealthSnapshot {
        let Some(mut entry) = self.stats.get_mut(backend_id) else {
            return HealthSnapshot {
                health: BackendHealth::Available,
                error_rate: 0.0,
                avg_latency_ms: 0.0,
            };
        };
        let health = Self::effective_health(&self.config, &mut entry);
        HealthSnapshot {
            health,
            error_rate: Self::compute_error_rate(&entry.recent),
            avg_latency_ms: Self::compute_avg_latency(&entry.recent),
        }
    }

    pub fn error_rate(&self, backend_id: &str) -> f64 {
        self.stats
            .get(backend_id)
            .map(|e| Self::compute_error_rate(&e.recent))
            .unwrap_or(0.0)
    }

    pub fn avg_latency_ms(&self, backend_id: &str) -> f64 {
        self.stats
            .get(backend_id)
            .map(|e| Self::compute_avg_latency(&e.recent))
            .unwrap_or(0.0)
    }

    fn effective_health(config: &HealthConfig, stats: &mut BackendStats) -> BackendHealth {
        if let Some(until) = stats.rate_limited_until {
            if Instant::now() < until {
                return BackendHealth::RateLimited { until };
            }
            stats.rate_limited_until = None;
        }

        if let Some(since) = stats.unreachable_since {
            if since.elapsed() < config.probe_cooldown {
                return BackendHealth::Unreachable { since };
            }
            // Cooldown over: let one probe through. The failure counter stays
            // high, so a failed probe re-marks it unreachable immediately.
            stats.unreachable_since = None;
        }

        if stats.consecutive_failures > 0 {
            BackendHealth::Degraded
        } else {
            BackendHealth::Available
        }
    }

    fn push_sample(recent: &mut VecDeque<CallSample>, window: usize, success: bool, latency: Duration) {
        if recent.len() >= window {
            recent.pop_front();
        }
        recent.push_back(CallSample {
            success,
            latency_ms: latency.as_secs_f64() * 1000.0,
        });
    }

    fn compute_error_rate(recent: &VecDeque<CallSample>) -> f64 {
        if recent.is_empty() {
            return 0.0;
        }
        let failed = recent.iter().filter(|s| !s.success).count();
        failed as f64 / recent.len() as f64
    }

    fn compute_avg_latency(recent: &VecDeque<CallSample>) -> f64 {
        let successes: Vec<f64> = recent
            .iter()
            .filter(|s| s.success)
            .map(|s| s.latency_ms)
            .collect();
        if successes.is_empty() {
            return 0.0;
        }
        successes.iter().sum::<f64>() / successes.len() as f64
    }
}
