//! Health monitor: error classification accounting, structural-error
//! thresholding, and heal-trigger dispatch.
//!
//! The monitor keeps a sliding window of structural errors per provider.
//! Crossing the threshold while healing is enabled, the provider is not
//! paused for healing, and no cooldown is active dispatches exactly one
//! [`HealRequest`] and starts the cooldown. Observer callbacks are invoked
//! on every recorded event but can never influence dispatch.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::metrics::{MetricKey, MetricsSink};
use crate::providers::{AdapterError, ErrorKind};

/// Monitor tuning.
#[derive(Debug, Clone, Copy)]
pub struct HealthConfig {
    /// Sliding window for structural-error counting.
    pub window: Duration,
    /// Structural errors within the window that trigger a heal.
    pub error_threshold: u32,
    /// Cooldown after dispatching a heal request.
    pub cooldown: Duration,
    /// Raw error payloads retained per provider for diagnosis.
    pub max_recent_errors: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(300),
            error_threshold: 5,
            cooldown: Duration::from_secs(600),
            max_recent_errors: 3,
        }
    }
}

/// One classified error retained for diagnosis.
#[derive(Debug, Clone, Serialize)]
pub struct RecordedError {
    /// When the error was recorded.
    pub at: DateTime<Utc>,
    /// Classified kind.
    pub kind: ErrorKind,
    /// Redacted message.
    pub message: String,
    /// Redacted provider payload fragment, when captured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Dispatched to the heal worker when a provider crosses the threshold.
#[derive(Debug, Clone)]
pub struct HealRequest {
    /// Provider to heal.
    pub provider: String,
    /// Recent structural errors, most recent last.
    pub recent_errors: Vec<RecordedError>,
    /// Adapter version that produced the errors.
    pub adapter_version: u64,
}

/// Event handed to observer callbacks.
#[derive(Debug, Clone)]
pub enum HealthEvent {
    /// A call succeeded.
    Success {
        /// Provider name.
        provider: String,
    },
    /// A call failed.
    Failure {
        /// Provider name.
        provider: String,
        /// Classified kind.
        kind: ErrorKind,
    },
    /// A heal request was dispatched.
    HealDispatched {
        /// Provider name.
        provider: String,
    },
}

/// Observer callback; must not block.
pub type HealthObserver = Arc<dyn Fn(&HealthEvent) + Send + Sync>;

/// Per-provider health snapshot for the HTTP surface.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealthReport {
    /// Error counts within the window, keyed by kind label.
    pub error_counts: BTreeMap<String, u64>,
    /// Structural errors currently inside the window.
    pub structural_in_window: u64,
    /// Last successful call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success: Option<DateTime<Utc>>,
    /// Last failed call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<DateTime<Utc>>,
    /// Heal cooldown deadline, when active.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_until: Option<DateTime<Utc>>,
    /// Whether the provider is paused: skipped by the router and ineligible
    /// for heal dispatch.
    pub paused: bool,
}

#[derive(Default)]
struct ProviderWindow {
    structural: VecDeque<DateTime<Utc>>,
    counts: HashMap<ErrorKind, u64>,
    recent: VecDeque<RecordedError>,
    last_success: Option<DateTime<Utc>>,
    last_failure: Option<DateTime<Utc>>,
    cooldown_until: Option<DateTime<Utc>>,
    paused: bool,
    adapter_version: u64,
}

/// The monitor itself. One instance serves every provider.
pub struct HealthMonitor {
    config: HealthConfig,
    windows: Mutex<HashMap<String, ProviderWindow>>,
    heal_tx: RwLock<Option<mpsc::Sender<HealRequest>>>,
    observers: RwLock<Vec<HealthObserver>>,
    healing_enabled: AtomicBool,
    metrics: Arc<MetricsSink>,
}

impl HealthMonitor {
    /// Create a monitor; healing dispatch stays inert until
    /// [`HealthMonitor::set_heal_channel`] is called.
    pub fn new(config: HealthConfig, healing_enabled: bool, metrics: Arc<MetricsSink>) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
            heal_tx: RwLock::new(None),
            observers: RwLock::new(Vec::new()),
            healing_enabled: AtomicBool::new(healing_enabled),
            metrics,
        }
    }

    /// Wire the channel the heal worker consumes.
    pub fn set_heal_channel(&self, tx: mpsc::Sender<HealRequest>) {
        *self
            .heal_tx
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(tx);
    }

    /// Register an observer callback.
    pub fn add_observer(&self, observer: HealthObserver) {
        self.observers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(observer);
    }

    /// Record a successful call.
    pub fn record_success(&self, provider: &str) {
        {
            let mut windows = self.lock_windows();
            let window = windows.entry(provider.to_owned()).or_default();
            window.last_success = Some(Utc::now());
        }
        self.notify(&HealthEvent::Success {
            provider: provider.to_owned(),
        });
    }

    /// Record a failed call, dispatching a heal request when the structural
    /// window crosses the threshold.
    pub fn record_error(&self, provider: &str, error: &AdapterError) {
        self.record_classified(provider, error.kind, &error.message, error.details.clone());
    }

    /// Record a non-fatal drift note from an adapter.
    ///
    /// Drift is counted as a structural observation so persistent
    /// silent-degradation also reaches the heal threshold, without having
    /// failed any request.
    pub fn record_drift(&self, provider: &str, note: &str) {
        debug!(provider, note, "adapter drift noted");
        self.metrics
            .incr(MetricKey::provider("drift_notes_total", provider));
        self.record_classified(provider, ErrorKind::SchemaMismatch, note, None);
    }

    /// Track the adapter version now serving a provider, for heal requests.
    pub fn set_adapter_version(&self, provider: &str, version: u64) {
        let mut windows = self.lock_windows();
        windows.entry(provider.to_owned()).or_default().adapter_version = version;
    }

    /// Pause or resume a provider. A paused provider is skipped by the
    /// router and never dispatches a heal.
    pub fn set_paused(&self, provider: &str, paused: bool) {
        let mut windows = self.lock_windows();
        windows.entry(provider.to_owned()).or_default().paused = paused;
        info!(provider, paused, "provider pause state changed");
    }

    /// Whether the provider is paused.
    pub fn is_paused(&self, provider: &str) -> bool {
        let mut windows = self.lock_windows();
        windows.entry(provider.to_owned()).or_default().paused
    }

    /// Enable or disable healing globally.
    pub fn set_healing_enabled(&self, enabled: bool) {
        self.healing_enabled.store(enabled, Ordering::Relaxed);
    }

    /// Whether healing is globally enabled.
    pub fn healing_enabled(&self) -> bool {
        self.healing_enabled.load(Ordering::Relaxed)
    }

    /// Drop the structural window for a provider.
    ///
    /// Called when a heal diagnosis concludes the window was noise
    /// (`is_structural = false`): the accumulated errors are reclassified out
    /// of the structural count so the same window cannot re-trigger.
    pub fn decay_window(&self, provider: &str) {
        let mut windows = self.lock_windows();
        if let Some(window) = windows.get_mut(provider) {
            window.structural.clear();
            window.cooldown_until = None;
        }
    }

    /// Clear the cooldown for a provider (used after an explicit heal
    /// completes so a fresh storm can trigger again sooner).
    pub fn clear_cooldown(&self, provider: &str) {
        let mut windows = self.lock_windows();
        if let Some(window) = windows.get_mut(provider) {
            window.cooldown_until = None;
        }
    }

    /// Per-provider cooldown deadlines, for the healing-status endpoint.
    pub fn cooldowns(&self) -> BTreeMap<String, Option<DateTime<Utc>>> {
        let windows = self.lock_windows();
        windows
            .iter()
            .map(|(name, window)| (name.clone(), window.cooldown_until))
            .collect()
    }

    /// Snapshot of every provider's health.
    pub fn snapshot(&self) -> BTreeMap<String, ProviderHealthReport> {
        let now = Utc::now();
        let mut windows = self.lock_windows();
        windows
            .iter_mut()
            .map(|(name, window)| {
                prune(window, now, self.config.window);
                let error_counts = window
                    .counts
                    .iter()
                    .map(|(kind, count)| (kind.as_str().to_owned(), *count))
                    .collect();
                (
                    name.clone(),
                    ProviderHealthReport {
                        error_counts,
                        structural_in_window: window.structural.len() as u64,
                        last_success: window.last_success,
                        last_failure: window.last_failure,
                        cooldown_until: window.cooldown_until.filter(|t| *t > now),
                        paused: window.paused,
                    },
                )
            })
            .collect()
    }

    fn record_classified(
        &self,
        provider: &str,
        kind: ErrorKind,
        message: &str,
        details: Option<String>,
    ) {
        let now = Utc::now();
        self.metrics.incr(MetricKey::provider_kind(
            "errors_total",
            provider,
            kind.as_str(),
        ));

        let dispatch = {
            let mut windows = self.lock_windows();
            let window = windows.entry(provider.to_owned()).or_default();
            window.last_failure = Some(now);
            let counter = window.counts.entry(kind).or_insert(0);
            *counter = counter.saturating_add(1);

            if !kind.is_structural() {
                None
            } else {
                window.structural.push_back(now);
                window.recent.push_back(RecordedError {
                    at: now,
                    kind,
                    message: message.to_owned(),
                    details,
                });
                while window.recent.len() > self.config.max_recent_errors {
                    window.recent.pop_front();
                }
                prune(window, now, self.config.window);

                let over_threshold =
                    window.structural.len() as u64 >= u64::from(self.config.error_threshold);
                let in_cooldown = window.cooldown_until.is_some_and(|t| t > now);
                let eligible = over_threshold
                    && !in_cooldown
                    && self.healing_enabled()
                    && !window.paused;

                if eligible {
                    let cooldown = chrono::Duration::from_std(self.config.cooldown)
                        .unwrap_or_else(|_| chrono::Duration::seconds(600));
                    window.cooldown_until = now.checked_add_signed(cooldown);
                    Some(HealRequest {
                        provider: provider.to_owned(),
                        recent_errors: window.recent.iter().cloned().collect(),
                        adapter_version: window.adapter_version,
                    })
                } else {
                    None
                }
            }
        };

        self.notify(&HealthEvent::Failure {
            provider: provider.to_owned(),
            kind,
        });

        if let Some(request) = dispatch {
            self.dispatch(request);
        }
    }

    fn dispatch(&self, request: HealRequest) {
        let provider = request.provider.clone();
        let tx = self
            .heal_tx
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        match tx {
            Some(tx) => match tx.try_send(request) {
                Ok(()) => {
                    info!(provider = %provider, "heal request dispatched");
                    self.metrics
                        .incr(MetricKey::provider("heal_dispatched_total", &provider));
                    self.notify(&HealthEvent::HealDispatched { provider });
                }
                Err(e) => warn!(provider = %provider, error = %e, "heal channel refused request"),
            },
            None => debug!(provider = %provider, "no heal worker wired, dropping request"),
        }
    }

    fn notify(&self, event: &HealthEvent) {
        let observers = self
            .observers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for observer in observers.iter() {
            observer(event);
        }
    }

    fn lock_windows(&self) -> std::sync::MutexGuard<'_, HashMap<String, ProviderWindow>> {
        self.windows
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn prune(window: &mut ProviderWindow, now: DateTime<Utc>, span: Duration) {
    let span = chrono::Duration::from_std(span).unwrap_or_else(|_| chrono::Duration::seconds(300));
    let Some(cutoff) = now.checked_sub_signed(span) else {
        return;
    };
    while window
        .structural
        .front()
        .is_some_and(|at| *at < cutoff)
    {
        window.structural.pop_front();
    }
}
