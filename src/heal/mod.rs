//! Heal worker: the diagnose → research → fix pipeline.
//!
//! Runs independently of request-serving paths, consuming [`HealRequest`]s
//! dispatched by the health monitor. A given provider has at most one
//! in-flight cycle; concurrent triggers collapse. Heal errors never surface
//! to request callers — they are visible through the healing-status and
//! metrics endpoints and the append-only audit log.

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{info, warn};

use crate::context::GatewayContext;
use crate::health::HealRequest;
use crate::metrics::MetricKey;
use crate::reload::{ApplyOutcome, ProposedFix, ReloadManager};
use crate::router::Router;

pub mod diagnose;
pub mod fix;
pub mod research;

/// Heal pipeline errors. Never surfaced to request callers.
#[derive(Debug, thiserror::Error)]
pub enum HealError {
    /// Phase 1 failed.
    #[error("diagnosis failed: {0}")]
    DiagnosisFailed(String),
    /// Phase 2 failed.
    #[error("research failed: {0}")]
    ResearchFailed(String),
    /// Phase 3 failed.
    #[error("fix generation failed: {0}")]
    FixFailed(String),
    /// The applied fix failed post-swap verification.
    #[error("verification failed: {0}")]
    VerificationFailed(String),
}

/// Heal worker tuning, lifted from the healing config block.
#[derive(Debug, Clone)]
pub struct HealWorkerConfig {
    /// Logical model used for diagnosis and fix generation.
    pub heal_model: String,
    /// Provider preference order for research.
    pub research_preference: Vec<String>,
    /// Maximum search queries per cycle.
    pub max_research_queries: usize,
    /// Wall-clock budget for the research phase.
    pub research_timeout: Duration,
    /// Wall-clock budget for each model phase (diagnose, fix).
    pub phase_timeout: Duration,
}

impl Default for HealWorkerConfig {
    fn default() -> Self {
        Self {
            heal_model: "local".to_owned(),
            research_preference: vec![
                "xai".to_owned(),
                "openai".to_owned(),
                "google".to_owned(),
                "anthropic".to_owned(),
            ],
            max_research_queries: 3,
            research_timeout: Duration::from_secs(60),
            phase_timeout: Duration::from_secs(120),
        }
    }
}

// ---------------------------------------------------------------------------
// Audit log
// ---------------------------------------------------------------------------

/// One audit entry, a single JSON line.
#[derive(Debug, Serialize)]
struct AuditEntry<'a> {
    timestamp: String,
    provider: &'a str,
    phase: &'a str,
    detail: serde_json::Value,
}

/// Append-only JSONL log of heal-cycle phases.
pub struct HealAuditLog {
    writer: Mutex<Box<dyn Write + Send>>,
}

impl HealAuditLog {
    /// Open the audit log, appending to the given file.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;
        Ok(Self {
            writer: Mutex::new(Box::new(file)),
        })
    }

    /// Create an audit log over an arbitrary writer (for testing).
    pub fn from_writer(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Append one phase record.
    pub fn record(&self, provider: &str, phase: &str, detail: serde_json::Value) {
        let entry = AuditEntry {
            timestamp: chrono::Utc::now().to_rfc3339(),
            provider,
            phase,
            detail,
        };
        let Ok(mut line) = serde_json::to_vec(&entry) else {
            return;
        };
        line.push(b'\n');
        let mut writer = self
            .writer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Err(e) = writer.write_all(&line).and_then(|()| writer.flush()) {
            warn!(error = %e, "failed to append heal audit entry");
        }
    }
}

// ---------------------------------------------------------------------------
// PII scrubbing
// ---------------------------------------------------------------------------

/// Scrubs personal and credential material from raw error payloads before
/// they reach a model prompt.
pub struct Scrubber {
    patterns: Vec<Regex>,
}

impl Default for Scrubber {
    fn default() -> Self {
        let patterns = [
            r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}",
            r"\+?\d[\d \-()]{8,}\d",
            r"sk-ant-[A-Za-z0-9_\-]{10,}",
            r"sk-[A-Za-z0-9]{32,}",
            r"xai-[A-Za-z0-9]{20,}",
            r"AIza[A-Za-z0-9_\-]{30,}",
            r"Bearer [A-Za-z0-9._\-]{16,}",
        ];
        Self {
            patterns: patterns
                .iter()
                .filter_map(|p| Regex::new(p).ok())
                .collect(),
        }
    }
}

impl Scrubber {
    /// Replace every match with a redaction marker.
    pub fn scrub(&self, text: &str) -> String {
        let mut sanitized = text.to_owned();
        for pattern in &self.patterns {
            sanitized = pattern.replace_all(&sanitized, "[SCRUBBED]").into_owned();
        }
        sanitized
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// The heal worker task.
pub struct HealWorker {
    ctx: Arc<GatewayContext>,
    router: Router,
    reload: Arc<ReloadManager>,
    config: HealWorkerConfig,
    audit: Arc<HealAuditLog>,
    scrubber: Arc<Scrubber>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    cycles: Arc<Mutex<HashMap<String, AbortHandle>>>,
}

impl HealWorker {
    /// Create a worker.
    pub fn new(
        ctx: Arc<GatewayContext>,
        reload: Arc<ReloadManager>,
        config: HealWorkerConfig,
        audit: Arc<HealAuditLog>,
    ) -> Self {
        let router = Router::new(Arc::clone(&ctx));
        Self {
            ctx,
            router,
            reload,
            config,
            audit,
            scrubber: Arc::new(Scrubber::default()),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            cycles: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Cancel an in-flight cycle, leaving the provider in its pre-cycle
    /// adapter state.
    pub fn cancel(&self, provider: &str) {
        let handle = {
            let cycles = self
                .cycles
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            cycles.get(provider).cloned()
        };
        if let Some(handle) = handle {
            handle.abort();
            self.release(provider);
            info!(provider, "heal cycle cancelled");
        }
    }

    /// Consume heal requests until the channel closes.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<HealRequest>) {
        while let Some(request) = rx.recv().await {
            let provider = request.provider.clone();
            {
                let mut in_flight = self
                    .in_flight
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                if !in_flight.insert(provider.clone()) {
                    info!(provider = %provider, "heal cycle already in flight, collapsing trigger");
                    continue;
                }
            }

            let worker = Arc::clone(&self);
            let handle = tokio::spawn(async move {
                let provider = request.provider.clone();
                match worker.run_cycle(request).await {
                    Ok(outcome) => {
                        info!(provider = %provider, outcome = %outcome, "heal cycle finished");
                    }
                    Err(error) => {
                        warn!(provider = %provider, error = %error, "heal cycle failed");
                        worker
                            .audit
                            .record(&provider, "error", serde_json::json!({"error": error.to_string()}));
                    }
                }
                worker.release(&provider);
            });
            self.cycles
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .insert(provider, handle.abort_handle());
        }
    }

    /// Run one complete cycle for a single provider.
    ///
    /// # Errors
    ///
    /// Returns [`HealError`] when a phase fails; errors stay inside the heal
    /// subsystem.
    pub async fn run_cycle(&self, request: HealRequest) -> Result<&'static str, HealError> {
        let provider = request.provider.as_str();
        self.ctx
            .metrics
            .incr(MetricKey::provider("heal_cycles_total", provider));
        self.audit.record(
            provider,
            "triggered",
            serde_json::json!({
                "adapter_version": request.adapter_version,
                "recent_errors": request.recent_errors.len(),
            }),
        );

        let adapter_source = self
            .reload
            .current_source(provider)
            .map_err(|e| HealError::DiagnosisFailed(format!("no adapter source: {e}")))?;

        // Phase 1 — diagnose on the heal model.
        let diagnosis = tokio::time::timeout(
            self.config.phase_timeout,
            diagnose::diagnose(
                &self.router,
                &self.config.heal_model,
                provider,
                &request.recent_errors,
                &adapter_source,
                &self.scrubber,
            ),
        )
        .await
        .map_err(|_| HealError::DiagnosisFailed("phase timed out".to_owned()))??;

        self.audit.record(
            provider,
            "diagnosed",
            serde_json::json!({
                "summary": diagnosis.summary,
                "is_structural": diagnosis.is_structural,
            }),
        );

        if !diagnosis.is_structural {
            // The window was noise; reclassify it away so it cannot
            // re-trigger this cycle.
            self.ctx.health.decay_window(provider);
            self.audit
                .record(provider, "aborted", serde_json::json!({"reason": "not structural"}));
            return Ok("not-structural");
        }

        // Phase 2 — research through search-capable providers.
        let citations = match tokio::time::timeout(
            self.config.research_timeout,
            research::research(
                &self.ctx,
                &self.config.research_preference,
                &diagnosis.search_queries,
                self.config.max_research_queries,
            ),
        )
        .await
        {
            Ok(Ok(citations)) => citations,
            Ok(Err(error)) => {
                warn!(provider, error = %error, "research phase failed, proceeding uncited");
                Vec::new()
            }
            Err(_) => {
                warn!(provider, "research phase timed out, proceeding uncited");
                Vec::new()
            }
        };
        self.audit.record(
            provider,
            "researched",
            serde_json::json!({"citations": citations.len()}),
        );

        // Phase 3 — fix on the heal model.
        let proposal = tokio::time::timeout(
            self.config.phase_timeout,
            fix::propose_fix(
                &self.router,
                &self.config.heal_model,
                provider,
                &diagnosis,
                &citations,
                &adapter_source,
            ),
        )
        .await
        .map_err(|_| HealError::FixFailed("phase timed out".to_owned()))??;

        self.audit.record(
            provider,
            "fix_proposed",
            serde_json::json!({
                "confidence": proposal.confidence,
                "rationale": proposal.rationale,
            }),
        );

        let outcome = self
            .reload
            .submit_fix(
                provider,
                ProposedFix {
                    source: proposal.source,
                    confidence: proposal.confidence,
                    diagnosis: diagnosis.summary.clone(),
                    citations,
                },
            )
            .await
            .map_err(|e| HealError::FixFailed(e.to_string()))?;

        match outcome {
            ApplyOutcome::Committed { version } => {
                self.audit.record(
                    provider,
                    "committed",
                    serde_json::json!({"version": version.version}),
                );
                Ok("committed")
            }
            ApplyOutcome::Queued { .. } => {
                self.audit.record(provider, "queued", serde_json::json!({}));
                Ok("queued")
            }
            ApplyOutcome::RolledBack { attempted, reason } => {
                self.audit.record(
                    provider,
                    "rolled_back",
                    serde_json::json!({"attempted": attempted, "reason": reason}),
                );
                Err(HealError::VerificationFailed(reason))
            }
        }
    }

    fn release(&self, provider: &str) {
        self.in_flight
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(provider);
        self.cycles
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(provider);
    }
}
