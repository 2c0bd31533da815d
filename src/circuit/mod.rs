//! Per-provider circuit breaker.
//!
//! Three-state machine (closed / open / half-open) with a probe budget in
//! half-open. Only structural errors count toward the failure threshold; a
//! transient storm must not trip the breaker and mask recovery. State is
//! provider-local with no cross-provider coupling.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::metrics::{MetricKey, MetricsSink};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Allowing requests.
    Closed,
    /// Failing fast; requests are skipped until the deadline.
    Open,
    /// Allowing a bounded number of probe requests.
    HalfOpen,
}

impl CircuitState {
    /// Lowercase label used in API responses.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Administrative transition, threshold-free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminAction {
    /// Force the circuit open.
    ForceOpen,
    /// Force the circuit closed.
    ForceClose,
    /// Reset to closed with cleared counters.
    Reset,
}

/// Per-provider breaker tuning.
#[derive(Debug, Clone, Copy)]
pub struct CircuitConfig {
    /// Consecutive structural failures that trip the breaker.
    pub failure_threshold: u32,
    /// Probe successes needed to close from half-open.
    pub success_threshold: u32,
    /// Time the breaker stays open before probing.
    pub recovery_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

/// Observability snapshot, cheap to clone.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    /// Current state.
    pub state: CircuitState,
    /// Consecutive structural failures while closed.
    pub consecutive_failures: u32,
    /// Probe successes while half-open.
    pub consecutive_successes: u32,
    /// Remaining probe budget while half-open.
    pub probe_budget: u32,
    /// When an open circuit will allow a probe.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_until: Option<DateTime<Utc>>,
    /// Total closed-to-open transitions.
    pub trips: u64,
}

/// One provider's fail-fast state machine.
pub struct CircuitBreaker {
    name: String,
    config: CircuitConfig,
    state: RwLock<CircuitState>,
    failures: AtomicU32,
    successes: AtomicU32,
    probe_budget: AtomicU32,
    open_until_ms: AtomicU64,
    trips: AtomicU64,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(name: &str, config: CircuitConfig) -> Self {
        Self {
            name: name.to_owned(),
            config,
            state: RwLock::new(CircuitState::Closed),
            failures: AtomicU32::new(0),
            successes: AtomicU32::new(0),
            probe_budget: AtomicU32::new(0),
            open_until_ms: AtomicU64::new(0),
            trips: AtomicU64::new(0),
        }
    }

    /// Whether a call may proceed, consuming one probe unit in half-open.
    ///
    /// An open circuit whose deadline has elapsed transitions to half-open
    /// here and grants the first probe.
    pub fn try_acquire(&self) -> bool {
        match self.state() {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let deadline = self.open_until_ms.load(Ordering::Relaxed);
                if epoch_millis_now() >= deadline {
                    debug!(provider = %self.name, "recovery timeout elapsed, probing");
                    self.transition(CircuitState::HalfOpen);
                    self.consume_probe()
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => self.consume_probe(),
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        match self.state() {
            CircuitState::Closed => {
                self.failures.store(0, Ordering::Relaxed);
            }
            CircuitState::HalfOpen => {
                let successes = self
                    .successes
                    .fetch_add(1, Ordering::Relaxed)
                    .saturating_add(1);
                if successes >= self.config.success_threshold {
                    self.transition(CircuitState::Closed);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed call; only structural failures count toward the trip
    /// threshold. Returns `true` when this failure opened the circuit.
    pub fn record_failure(&self, structural: bool) -> bool {
        match self.state() {
            CircuitState::Closed => {
                if !structural {
                    return false;
                }
                let failures = self
                    .failures
                    .fetch_add(1, Ordering::Relaxed)
                    .saturating_add(1);
                if failures >= self.config.failure_threshold {
                    warn!(provider = %self.name, failures, "failure threshold reached");
                    self.transition(CircuitState::Open);
                    return true;
                }
                false
            }
            CircuitState::HalfOpen => {
                if structural {
                    warn!(provider = %self.name, "probe failed, reopening circuit");
                    self.transition(CircuitState::Open);
                    return true;
                }
                // A transient probe failure neither trips nor burns budget;
                // otherwise a rate-limit storm could pin the breaker half-open
                // with nothing left to probe with.
                self.refund_probe();
                false
            }
            CircuitState::Open => false,
        }
    }

    /// Apply an administrative transition. Returns the previous state.
    pub fn admin(&self, action: AdminAction) -> CircuitState {
        let previous = self.state();
        match action {
            AdminAction::ForceOpen => self.transition(CircuitState::Open),
            AdminAction::ForceClose | AdminAction::Reset => {
                self.transition(CircuitState::Closed);
            }
        }
        info!(provider = %self.name, ?action, from = previous.as_str(), "admin circuit transition");
        previous
    }

    /// Current state without side effects.
    pub fn state(&self) -> CircuitState {
        *self
            .state
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Observability snapshot.
    pub fn snapshot(&self) -> CircuitSnapshot {
        let state = self.state();
        let open_until = match state {
            CircuitState::Open => {
                let ms = self.open_until_ms.load(Ordering::Relaxed);
                let ms_signed = i64::try_from(ms).unwrap_or(i64::MAX);
                Utc.timestamp_millis_opt(ms_signed).single()
            }
            _ => None,
        };
        CircuitSnapshot {
            state,
            consecutive_failures: self.failures.load(Ordering::Relaxed),
            consecutive_successes: self.successes.load(Ordering::Relaxed),
            probe_budget: self.probe_budget.load(Ordering::Relaxed),
            open_until,
            trips: self.trips.load(Ordering::Relaxed),
        }
    }

    fn consume_probe(&self) -> bool {
        self.probe_budget
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |budget| {
                budget.checked_sub(1)
            })
            .is_ok()
    }

    fn refund_probe(&self) {
        let cap = self.config.success_threshold;
        let _ = self
            .probe_budget
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |budget| {
                if budget < cap {
                    budget.checked_add(1)
                } else {
                    None
                }
            });
    }

    fn transition(&self, new_state: CircuitState) {
        let mut state = self
            .state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if *state == new_state {
            return;
        }
        *state = new_state;

        match new_state {
            CircuitState::Closed => {
                self.failures.store(0, Ordering::Relaxed);
                self.successes.store(0, Ordering::Relaxed);
                self.probe_budget.store(0, Ordering::Relaxed);
                info!(provider = %self.name, "circuit closed");
            }
            CircuitState::Open => {
                #[allow(clippy::cast_possible_truncation)]
                let timeout_ms = self.config.recovery_timeout.as_millis() as u64;
                self.open_until_ms
                    .store(epoch_millis_now().saturating_add(timeout_ms), Ordering::Relaxed);
                self.trips.fetch_add(1, Ordering::Relaxed);
                warn!(provider = %self.name, "circuit opened");
            }
            CircuitState::HalfOpen => {
                self.successes.store(0, Ordering::Relaxed);
                self.probe_budget
                    .store(self.config.success_threshold, Ordering::Relaxed);
                debug!(provider = %self.name, "circuit half-open");
            }
        }
    }
}

/// Current time as milliseconds since UNIX epoch.
#[allow(clippy::cast_possible_truncation)]
fn epoch_millis_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ---------------------------------------------------------------------------
// Provider set
// ---------------------------------------------------------------------------

/// All provider breakers plus the metrics wiring for their transitions.
pub struct CircuitSet {
    breakers: HashMap<String, Arc<CircuitBreaker>>,
    metrics: Arc<MetricsSink>,
}

impl CircuitSet {
    /// Create breakers for the given providers.
    pub fn new(providers: Vec<(String, CircuitConfig)>, metrics: Arc<MetricsSink>) -> Self {
        let breakers = providers
            .into_iter()
            .map(|(name, config)| {
                let breaker = Arc::new(CircuitBreaker::new(&name, config));
                (name, breaker)
            })
            .collect();
        Self { breakers, metrics }
    }

    /// Whether a call to the provider may proceed.
    pub fn try_acquire(&self, provider: &str) -> bool {
        self.breakers
            .get(provider)
            .is_none_or(|breaker| breaker.try_acquire())
    }

    /// Record a success for the provider.
    pub fn record_success(&self, provider: &str) {
        if let Some(breaker) = self.breakers.get(provider) {
            breaker.record_success();
        }
    }

    /// Record a failure for the provider.
    pub fn record_failure(&self, provider: &str, structural: bool) {
        if let Some(breaker) = self.breakers.get(provider) {
            if breaker.record_failure(structural) {
                self.metrics
                    .incr(MetricKey::provider("circuit_opens_total", provider));
            }
        }
    }

    /// Apply an administrative transition.
    ///
    /// Returns the previous state, or `None` for an unknown provider.
    pub fn admin(&self, provider: &str, action: AdminAction) -> Option<CircuitState> {
        let breaker = self.breakers.get(provider)?;
        let previous = breaker.admin(action);
        self.metrics.incr(MetricKey::provider(
            "circuit_admin_transitions_total",
            provider,
        ));
        Some(previous)
    }

    /// Current state for one provider.
    pub fn state(&self, provider: &str) -> Option<CircuitState> {
        self.breakers.get(provider).map(|b| b.state())
    }

    /// Snapshot of every breaker, keyed by provider.
    pub fn snapshot(&self) -> BTreeMap<String, CircuitSnapshot> {
        self.breakers
            .iter()
            .map(|(name, breaker)| (name.clone(), breaker.snapshot()))
            .collect()
    }
}
