//! Reload manager: the full lifecycle of adapter code versions.
//!
//! Apply path: record the new source into the bounded history, swap the live
//! adapter binding atomically, verify (health check plus a canary chat), then
//! commit — or swap back and mark the attempt `failed_verification`. All
//! lifecycle transitions are serialized per provider; in-flight requests keep
//! the binding `Arc` they dispatched with, so the swap is observable as a
//! single instantaneous transition.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::context::GatewayContext;
use crate::metrics::MetricKey;
use crate::providers::registry::{mapping_notes, AdapterBinding};
use crate::providers::{AdapterError, ErrorKind};
use crate::scri::{ChatRequest, FinishReason, Message, Role, ToolDefinition};

pub mod store;

use store::{
    AdapterVersion, Citation, PendingFix, PendingStatus, VersionOrigin, VersionStatus,
    VersionStore,
};

/// Reload lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum ReloadError {
    /// The provider is not registered.
    #[error("unknown provider '{provider}'")]
    UnknownProvider {
        /// Provider name.
        provider: String,
    },
    /// The requested version is not in history.
    #[error("version {version} not in history for '{provider}'")]
    UnknownVersion {
        /// Provider name.
        provider: String,
        /// Requested version.
        version: u64,
    },
    /// No pending fix exists for the provider.
    #[error("no pending fix for '{provider}'")]
    NoPendingFix {
        /// Provider name.
        provider: String,
    },
    /// The pending fix has already been resolved or has expired.
    #[error("pending fix for '{provider}' is {status:?}")]
    AlreadyResolved {
        /// Provider name.
        provider: String,
        /// Terminal status.
        status: PendingStatus,
    },
    /// Store or registry failure.
    #[error("reload storage failure: {0}")]
    Storage(#[from] anyhow::Error),
}

/// A patch proposed by the heal pipeline.
#[derive(Debug, Clone)]
pub struct ProposedFix {
    /// Full replacement adapter source.
    pub source: String,
    /// Heal-model confidence in [0, 1].
    pub confidence: f64,
    /// Diagnosis summary, persisted with the pending fix.
    pub diagnosis: String,
    /// Research citations backing the fix.
    pub citations: Vec<Citation>,
}

/// Outcome of an apply attempt.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ApplyOutcome {
    /// The new version is live.
    Committed {
        /// The committed version record.
        version: AdapterVersion,
    },
    /// Confidence was below the auto-apply gate; queued for approval.
    Queued {
        /// The queued pending fix.
        fix: PendingFix,
    },
    /// Verification failed; the previous version is live again.
    RolledBack {
        /// The version that failed verification.
        attempted: u64,
        /// Why verification failed.
        reason: String,
    },
}

/// Reload tuning, lifted from the healing config block.
#[derive(Debug, Clone, Copy)]
pub struct ReloadConfig {
    /// Whether fixes above the threshold apply without approval.
    pub auto_apply: bool,
    /// Minimum confidence for auto-apply.
    pub auto_apply_threshold: f64,
    /// Budget for post-swap verification.
    pub verification_timeout: Duration,
    /// Age at which an unresolved pending fix expires.
    pub pending_expiry: chrono::Duration,
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            auto_apply: false,
            auto_apply_threshold: 0.8,
            verification_timeout: Duration::from_secs(10),
            pending_expiry: chrono::Duration::days(7),
        }
    }
}

/// Owns version history, pending fixes, and the live-binding swap.
pub struct ReloadManager {
    ctx: Arc<GatewayContext>,
    store: VersionStore,
    config: ReloadConfig,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ReloadManager {
    /// Create a manager over the given store.
    pub fn new(ctx: Arc<GatewayContext>, store: VersionStore, config: ReloadConfig) -> Self {
        Self {
            ctx,
            store,
            config,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Record initial versions for every registered provider that has none,
    /// and sync adapter version ids into the health monitor.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    pub fn bootstrap(&self) -> Result<(), ReloadError> {
        for provider in self.ctx.registry.provider_names() {
            let initial = self
                .store
                .ensure_initial(&provider, &mapping_notes(&provider))?;
            self.ctx
                .health
                .set_adapter_version(&provider, initial.version);
        }
        Ok(())
    }

    /// Current source text for a provider's live version.
    ///
    /// # Errors
    ///
    /// Returns an error when the provider has no recorded versions.
    pub fn current_source(&self, provider: &str) -> Result<String, ReloadError> {
        let current = self
            .store
            .current(provider)?
            .ok_or_else(|| ReloadError::UnknownProvider {
                provider: provider.to_owned(),
            })?;
        Ok(self.store.read_blob(provider, current.version)?)
    }

    /// Version history for a provider, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    pub fn history(&self, provider: &str) -> Result<Vec<AdapterVersion>, ReloadError> {
        Ok(self.store.history(provider)?)
    }

    /// Pending fixes across providers, with expiry applied.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    pub fn pending_fixes(&self) -> Result<Vec<PendingFix>, ReloadError> {
        Ok(self.store.all_pending(self.config.pending_expiry)?)
    }

    /// Submit a heal-pipeline patch: auto-apply when gated in, queue
    /// otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error on store or registry failure.
    pub async fn submit_fix(
        &self,
        provider: &str,
        fix: ProposedFix,
    ) -> Result<ApplyOutcome, ReloadError> {
        let lock = self.provider_lock(provider).await;
        let _guard = lock.lock().await;

        if !(self.config.auto_apply && fix.confidence >= self.config.auto_apply_threshold) {
            let pending = PendingFix {
                provider: provider.to_owned(),
                source: fix.source,
                diagnosis: fix.diagnosis,
                citations: fix.citations,
                confidence: fix.confidence,
                created_at: chrono::Utc::now(),
                status: PendingStatus::Pending,
            };
            self.store.save_pending(&pending)?;
            info!(provider, confidence = fix.confidence, "fix queued for approval");
            self.ctx
                .metrics
                .incr(MetricKey::provider("heal_queued_total", provider));
            return Ok(ApplyOutcome::Queued { fix: pending });
        }

        self.apply_locked(
            provider,
            &fix.source,
            VersionOrigin::HealedAuto,
            Some(fix.confidence),
            None,
        )
        .await
    }

    /// Approve the provider's pending fix and run the apply path.
    ///
    /// # Errors
    ///
    /// Returns [`ReloadError::NoPendingFix`] when nothing is pending and
    /// [`ReloadError::AlreadyResolved`] when resolution was terminal.
    pub async fn approve(
        &self,
        provider: &str,
        approver: &str,
    ) -> Result<ApplyOutcome, ReloadError> {
        let lock = self.provider_lock(provider).await;
        let _guard = lock.lock().await;

        let mut pending = self
            .store
            .load_pending(provider, self.config.pending_expiry)?
            .ok_or_else(|| ReloadError::NoPendingFix {
                provider: provider.to_owned(),
            })?;
        if pending.status != PendingStatus::Pending {
            return Err(ReloadError::AlreadyResolved {
                provider: provider.to_owned(),
                status: pending.status,
            });
        }

        let outcome = self
            .apply_locked(
                provider,
                &pending.source.clone(),
                VersionOrigin::HealedApproved,
                Some(pending.confidence),
                Some(approver.to_owned()),
            )
            .await?;

        pending.status = PendingStatus::Approved;
        pending.source.clear();
        self.store.save_pending(&pending)?;
        Ok(outcome)
    }

    /// Reject the provider's pending fix and delete staging artifacts.
    ///
    /// # Errors
    ///
    /// Returns [`ReloadError::NoPendingFix`] when nothing is pending.
    pub async fn reject(&self, provider: &str) -> Result<(), ReloadError> {
        let lock = self.provider_lock(provider).await;
        let _guard = lock.lock().await;

        let mut pending = self
            .store
            .load_pending(provider, self.config.pending_expiry)?
            .ok_or_else(|| ReloadError::NoPendingFix {
                provider: provider.to_owned(),
            })?;
        if pending.status != PendingStatus::Pending {
            return Err(ReloadError::AlreadyResolved {
                provider: provider.to_owned(),
                status: pending.status,
            });
        }
        pending.status = PendingStatus::Rejected;
        pending.source.clear();
        self.store.save_pending(&pending)?;
        info!(provider, "pending fix rejected");
        Ok(())
    }

    /// Roll back to an arbitrary version still in history.
    ///
    /// Records a new version entry with origin `manual-rollback` carrying the
    /// target's content, then runs the same swap-and-verify discipline.
    ///
    /// # Errors
    ///
    /// Returns [`ReloadError::UnknownVersion`] when the version is absent.
    pub async fn rollback_to(
        &self,
        provider: &str,
        version: u64,
    ) -> Result<ApplyOutcome, ReloadError> {
        let lock = self.provider_lock(provider).await;
        let _guard = lock.lock().await;

        let in_history = self
            .store
            .history(provider)?
            .iter()
            .any(|v| v.version == version);
        if !in_history {
            return Err(ReloadError::UnknownVersion {
                provider: provider.to_owned(),
                version,
            });
        }
        let content = self.store.read_blob(provider, version)?;
        self.apply_locked(provider, &content, VersionOrigin::ManualRollback, None, None)
            .await
    }

    // -- Apply path --

    /// Steps 4–8 of the apply path; the caller holds the provider lock.
    async fn apply_locked(
        &self,
        provider: &str,
        source: &str,
        origin: VersionOrigin,
        confidence: Option<f64>,
        approved_by: Option<String>,
    ) -> Result<ApplyOutcome, ReloadError> {
        let record =
            self.store
                .record_version(provider, source, origin, confidence, approved_by)?;

        let staged = self
            .ctx
            .registry
            .rebuild(provider, record.version)
            .map_err(|_| ReloadError::UnknownProvider {
                provider: provider.to_owned(),
            })?;

        // Step 5: atomic swap. Readers that dispatched earlier keep their Arc.
        let previous = self
            .ctx
            .registry
            .swap(provider, Arc::clone(&staged))
            .map_err(|_| ReloadError::UnknownProvider {
                provider: provider.to_owned(),
            })?;

        // Step 6: verification under its own budget.
        match tokio::time::timeout(self.config.verification_timeout, verify(&staged)).await {
            Ok(Ok(())) => {
                self.store.set_current(provider, record.version)?;
                self.ctx.health.set_adapter_version(provider, record.version);
                self.ctx
                    .metrics
                    .incr(MetricKey::provider("heal_commit_total", provider));
                info!(provider, version = record.version, "adapter version committed");
                Ok(ApplyOutcome::Committed {
                    version: AdapterVersion {
                        status: VersionStatus::Live,
                        ..record
                    },
                })
            }
            verification => {
                let reason = match verification {
                    Ok(Err(e)) => e.to_string(),
                    _ => "verification timed out".to_owned(),
                };
                warn!(provider, version = record.version, reason = %reason, "verification failed, rolling back");

                self.ctx
                    .registry
                    .swap(provider, previous)
                    .map_err(|_| ReloadError::UnknownProvider {
                        provider: provider.to_owned(),
                    })?;
                self.store
                    .set_status(provider, record.version, VersionStatus::FailedVerification)?;
                self.ctx
                    .metrics
                    .incr(MetricKey::provider("heal_rollback_total", provider));
                self.ctx.health.record_error(
                    provider,
                    &AdapterError::new(
                        ErrorKind::Unknown,
                        format!("adapter version {} failed verification", record.version),
                    ),
                );
                Ok(ApplyOutcome::RolledBack {
                    attempted: record.version,
                    reason,
                })
            }
        }
    }

    async fn provider_lock(&self, provider: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(
            locks
                .entry(provider.to_owned())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }
}

/// The canary request used in verification: exercises text content, a tool
/// definition, and the usage mapping without depending on model quality.
fn canary_request() -> ChatRequest {
    ChatRequest {
        model: String::new(),
        messages: vec![Message::text(
            Role::User,
            "Reply with the single word: pong",
        )],
        temperature: Some(0.0),
        max_tokens: Some(32),
        top_p: None,
        tools: vec![ToolDefinition {
            name: "echo".to_owned(),
            description: "Echo a value back".to_owned(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {"value": {"type": "string"}},
                "required": ["value"],
            }),
        }],
        tool_choice: None,
        thinking: None,
        metadata: std::collections::BTreeMap::new(),
    }
}

/// Health check plus canary chat; both must pass.
async fn verify(binding: &AdapterBinding) -> Result<(), AdapterError> {
    binding.adapter.health_check().await?;

    let response = binding.adapter.chat(&canary_request()).await?;
    if response.finish_reason == FinishReason::Error {
        return Err(AdapterError::new(
            ErrorKind::Unknown,
            "canary chat finished with error",
        ));
    }
    if response.content.is_empty() {
        return Err(AdapterError::schema_mismatch("canary chat returned no content"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canary_exercises_schema_sensitive_paths() {
        let request = canary_request();
        assert!(!request.messages.is_empty());
        assert_eq!(request.tools.len(), 1);
        assert_eq!(request.tools[0].name, "echo");
        assert!(request.max_tokens.is_some());
    }
}
