//! Router and fallback engine.
//!
//! Resolves a logical model name to an ordered list of (provider, model)
//! candidates and walks it left to right, consulting the circuit breaker and
//! health monitor around every adapter call. Fallback is transparent: the
//! response shape is identical whichever candidate answered, only the lineage
//! record differs.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::context::GatewayContext;
use crate::metrics::MetricKey;
use crate::providers::registry::AdapterBinding;
use crate::providers::{sanitize_error_body, AdapterError, ErrorKind, STREAM_CHANNEL_CAPACITY};
use crate::scri::{
    ChatRequest, ChatResponse, ContentBlock, EmbeddingRequest, EmbeddingResponse, FinishReason,
    Lineage, MessageContent, StreamEvent,
};

/// Maximum characters of a provider message kept in an attempt record.
const ATTEMPT_MESSAGE_CHARS: usize = 120;

/// One failed or skipped candidate in a routing walk.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptFailure {
    /// Candidate provider.
    pub provider: String,
    /// Classified kind, or a skip label (`circuit_open`, `paused`).
    pub kind: String,
    /// Truncated message.
    pub message: String,
}

/// Routing errors surfaced to callers.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// The logical model resolved to nothing.
    #[error("no provider candidate for model '{model}'")]
    NoCandidate {
        /// The unresolvable logical model.
        model: String,
    },
    /// The resolved provider exists but is not enabled.
    #[error("provider '{provider}' is disabled")]
    Disabled {
        /// Disabled provider name.
        provider: String,
    },
    /// Every candidate failed or was skipped.
    #[error("all providers failed for model '{model}' ({} attempts)", attempts.len())]
    AllProvidersFailed {
        /// The logical model requested.
        model: String,
        /// Per-attempt failure records, in walk order.
        attempts: Vec<AttemptFailure>,
    },
    /// A provider error that must not be retried anywhere.
    #[error(transparent)]
    Provider(#[from] AdapterError),
}

/// A resolved (provider, concrete model) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// Provider name.
    pub provider: String,
    /// Concrete model to request.
    pub model: String,
}

/// The router. Cheap to clone; all state lives in the context.
#[derive(Clone)]
pub struct Router {
    ctx: Arc<GatewayContext>,
}

impl Router {
    /// Create a router over the given context.
    pub fn new(ctx: Arc<GatewayContext>) -> Self {
        Self { ctx }
    }

    /// Resolve a logical model name to its primary candidate.
    ///
    /// Resolution order, first match wins: alias table, explicit
    /// `provider:model`, name-prefix inference, configured default provider.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::NoCandidate`] when nothing matches and
    /// [`RouterError::Disabled`] when the match names an unregistered
    /// provider.
    pub fn resolve(&self, model: &str) -> Result<Candidate, RouterError> {
        if let Some(target) = self.ctx.aliases.get(model) {
            return self.parse_target(target);
        }

        if model.contains(':') {
            return self.parse_target(model);
        }

        if let Some(provider) = infer_provider(model) {
            return self.candidate_for(provider, Some(model));
        }

        let default = self.ctx.behaviour.default_provider.clone();
        if default.is_empty() {
            return Err(RouterError::NoCandidate {
                model: model.to_owned(),
            });
        }
        self.candidate_for(&default, None)
    }

    /// Build the ordered candidate list for a primary candidate.
    ///
    /// The primary comes first; when fallback is enabled the remaining
    /// providers follow, ranked by priority (locals rank highest when
    /// `prefer_local` is set), each serving its own default model.
    pub fn candidates(&self, primary: &Candidate) -> Vec<Candidate> {
        let mut list = vec![primary.clone()];
        if !self.ctx.behaviour.enable_fallback {
            return list;
        }

        let mut fallbacks: Vec<(u8, String)> = self
            .ctx
            .registry
            .provider_names()
            .into_iter()
            .filter(|name| *name != primary.provider)
            .map(|name| {
                let priority = if self.ctx.behaviour.prefer_local && self.ctx.registry.is_local(&name)
                {
                    0
                } else {
                    self.ctx.registry.priority(&name)
                };
                (priority, name)
            })
            .collect();
        fallbacks.sort();

        for (_, name) in fallbacks {
            let model = self
                .ctx
                .registry
                .binding(&name)
                .map(|binding| binding.adapter.model_id().to_owned())
                .unwrap_or_default();
            list.push(Candidate {
                provider: name,
                model,
            });
        }
        list
    }

    /// Execute a chat request with fallback.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError`] per the propagation policy: terminal provider
    /// errors surface directly, transient ones only after every candidate has
    /// been exhausted.
    pub async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, RouterError> {
        let started_at = Utc::now();
        validate_images(request)?;
        let primary = self.resolve(&request.model)?;
        let candidates = self.candidates(&primary);

        let mut attempts: Vec<AttemptFailure> = Vec::new();
        let mut invocations: u32 = 0;

        for (index, candidate) in candidates.iter().enumerate() {
            let Some(binding) = self.prepare(candidate, &mut attempts) else {
                continue;
            };

            invocations = invocations.saturating_add(1);
            let mut attempt_request = request.clone();
            attempt_request.model = candidate.model.clone();

            let deadline = Duration::from_secs(self.ctx.registry.timeout_seconds(&candidate.provider));
            let call_started = std::time::Instant::now();
            let outcome = tokio::time::timeout(deadline, binding.adapter.chat(&attempt_request)).await;

            match flatten_timeout(outcome) {
                Ok(mut response) => {
                    self.record_success(&candidate.provider, call_started, &mut response);
                    response.lineage = Some(Lineage {
                        provider: candidate.provider.clone(),
                        model: if response.model.is_empty() {
                            candidate.model.clone()
                        } else {
                            response.model.clone()
                        },
                        adapter_version: binding.version,
                        started_at,
                        finished_at: Utc::now(),
                        attempts: invocations,
                        fallback: index > 0,
                    });
                    if index > 0 {
                        self.ctx
                            .metrics
                            .incr(MetricKey::provider("fallbacks_total", &candidate.provider));
                        info!(
                            provider = %candidate.provider,
                            fallback_index = index,
                            "request answered by fallback candidate"
                        );
                    }
                    return Ok(response);
                }
                Err(error) => {
                    self.record_failure(&candidate.provider, &error);
                    attempts.push(attempt_failure(&candidate.provider, &error));
                    if error.kind.is_terminal_for_request() {
                        return Err(RouterError::Provider(error));
                    }
                    warn!(
                        provider = %candidate.provider,
                        kind = %error.kind,
                        "candidate failed, advancing"
                    );
                }
            }
        }

        Err(RouterError::AllProvidersFailed {
            model: request.model.clone(),
            attempts,
        })
    }

    /// Execute a streaming chat request with fallback on stream
    /// establishment.
    ///
    /// Once events are flowing the stream is never rerouted; a mid-stream
    /// failure surfaces as a terminal `finish` frame with `reason = error`.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError`] when no candidate yields a stream.
    pub async fn chat_stream(
        &self,
        request: &ChatRequest,
    ) -> Result<mpsc::Receiver<StreamEvent>, RouterError> {
        validate_images(request)?;
        let primary = self.resolve(&request.model)?;
        let candidates = self.candidates(&primary);

        let mut attempts: Vec<AttemptFailure> = Vec::new();

        for candidate in &candidates {
            let Some(binding) = self.prepare(candidate, &mut attempts) else {
                continue;
            };

            let mut attempt_request = request.clone();
            attempt_request.model = candidate.model.clone();

            let deadline = Duration::from_secs(self.ctx.registry.timeout_seconds(&candidate.provider));
            let outcome =
                tokio::time::timeout(deadline, binding.adapter.chat_stream(&attempt_request)).await;

            match flatten_timeout(outcome) {
                Ok(upstream) => {
                    return Ok(self.relay_stream(candidate.provider.clone(), upstream));
                }
                Err(error) => {
                    self.record_failure(&candidate.provider, &error);
                    attempts.push(attempt_failure(&candidate.provider, &error));
                    if error.kind.is_terminal_for_request() {
                        return Err(RouterError::Provider(error));
                    }
                }
            }
        }

        Err(RouterError::AllProvidersFailed {
            model: request.model.clone(),
            attempts,
        })
    }

    /// Execute an embedding request with fallback.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError`] per the same policy as [`Router::chat`].
    pub async fn embed(
        &self,
        request: &EmbeddingRequest,
    ) -> Result<EmbeddingResponse, RouterError> {
        let primary = self.resolve(&request.model)?;
        let candidates = self.candidates(&primary);

        let mut attempts: Vec<AttemptFailure> = Vec::new();

        for candidate in &candidates {
            let Some(binding) = self.prepare(candidate, &mut attempts) else {
                continue;
            };

            let mut attempt_request = request.clone();
            attempt_request.model = candidate.model.clone();

            let deadline = Duration::from_secs(self.ctx.registry.timeout_seconds(&candidate.provider));
            let call_started = std::time::Instant::now();
            let outcome =
                tokio::time::timeout(deadline, binding.adapter.embed(&attempt_request)).await;

            match flatten_timeout(outcome) {
                Ok(response) => {
                    self.ctx.circuits.record_success(&candidate.provider);
                    self.ctx.health.record_success(&candidate.provider);
                    self.observe_latency(&candidate.provider, call_started);
                    return Ok(response);
                }
                Err(error) => {
                    self.record_failure(&candidate.provider, &error);
                    attempts.push(attempt_failure(&candidate.provider, &error));
                    if error.kind.is_terminal_for_request() {
                        return Err(RouterError::Provider(error));
                    }
                }
            }
        }

        Err(RouterError::AllProvidersFailed {
            model: request.model.clone(),
            attempts,
        })
    }

    // -- Candidate bookkeeping --

    fn parse_target(&self, target: &str) -> Result<Candidate, RouterError> {
        let Some((provider, model)) = target.split_once(':') else {
            return Err(RouterError::NoCandidate {
                model: target.to_owned(),
            });
        };
        if provider.is_empty() || model.is_empty() {
            return Err(RouterError::NoCandidate {
                model: target.to_owned(),
            });
        }
        if !self.ctx.registry.contains(provider) {
            return Err(RouterError::Disabled {
                provider: provider.to_owned(),
            });
        }
        Ok(Candidate {
            provider: provider.to_owned(),
            model: model.to_owned(),
        })
    }

    fn candidate_for(
        &self,
        provider: &str,
        model: Option<&str>,
    ) -> Result<Candidate, RouterError> {
        if !self.ctx.registry.contains(provider) {
            return Err(RouterError::Disabled {
                provider: provider.to_owned(),
            });
        }
        let model = match model {
            Some(m) => m.to_owned(),
            None => self
                .ctx
                .registry
                .binding(provider)
                .map(|binding| binding.adapter.model_id().to_owned())
                .unwrap_or_default(),
        };
        Ok(Candidate {
            provider: provider.to_owned(),
            model,
        })
    }

    /// Gate one candidate through pause state and the circuit breaker.
    fn prepare(
        &self,
        candidate: &Candidate,
        attempts: &mut Vec<AttemptFailure>,
    ) -> Option<Arc<AdapterBinding>> {
        if self.ctx.health.is_paused(&candidate.provider) {
            debug!(provider = %candidate.provider, "skipping paused provider");
            attempts.push(AttemptFailure {
                provider: candidate.provider.clone(),
                kind: "paused".to_owned(),
                message: "provider is paused".to_owned(),
            });
            return None;
        }
        if !self.ctx.circuits.try_acquire(&candidate.provider) {
            debug!(provider = %candidate.provider, "skipping open circuit");
            attempts.push(AttemptFailure {
                provider: candidate.provider.clone(),
                kind: "circuit_open".to_owned(),
                message: "circuit is open".to_owned(),
            });
            return None;
        }
        let binding = self.ctx.registry.binding(&candidate.provider);
        if binding.is_none() {
            attempts.push(AttemptFailure {
                provider: candidate.provider.clone(),
                kind: "unregistered".to_owned(),
                message: "provider has no live adapter".to_owned(),
            });
        }
        binding
    }

    fn record_success(
        &self,
        provider: &str,
        call_started: std::time::Instant,
        response: &mut ChatResponse,
    ) {
        self.ctx.circuits.record_success(provider);
        self.ctx.health.record_success(provider);
        self.ctx
            .metrics
            .incr(MetricKey::provider("requests_total", provider));
        self.observe_latency(provider, call_started);
        for note in response.drift.drain(..) {
            self.ctx.health.record_drift(provider, &note);
        }
    }

    fn record_failure(&self, provider: &str, error: &AdapterError) {
        self.ctx.health.record_error(provider, error);
        self.ctx
            .circuits
            .record_failure(provider, error.kind.is_structural());
    }

    fn observe_latency(&self, provider: &str, started: std::time::Instant) {
        #[allow(clippy::cast_possible_truncation)]
        let millis = started.elapsed().as_millis() as u64;
        self.ctx
            .metrics
            .observe_ms(MetricKey::provider("chat_latency_ms", provider), millis);
    }

    /// Forward upstream events, folding terminal outcomes into circuit and
    /// health accounting. The gateway never reorders events.
    fn relay_stream(
        &self,
        provider: String,
        mut upstream: mpsc::Receiver<StreamEvent>,
    ) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let ctx = Arc::clone(&self.ctx);

        tokio::spawn(async move {
            let mut finished = false;
            while let Some(event) = upstream.recv().await {
                if let StreamEvent::Finish { reason, error } = &event {
                    finished = true;
                    match (reason, error) {
                        (FinishReason::Error, Some(failure)) => {
                            let kind = ErrorKind::from_label(&failure.kind)
                                .unwrap_or(ErrorKind::Unknown);
                            let adapter_error = AdapterError::new(kind, failure.message.clone());
                            ctx.health.record_error(&provider, &adapter_error);
                            ctx.circuits.record_failure(&provider, kind.is_structural());
                        }
                        _ => {
                            ctx.circuits.record_success(&provider);
                            ctx.health.record_success(&provider);
                            ctx.metrics
                                .incr(MetricKey::provider("requests_total", &provider));
                        }
                    }
                }
                if tx.send(event).await.is_err() {
                    return;
                }
            }

            if !finished {
                // The adapter contract requires a terminal frame; its absence
                // is itself stream-format drift.
                let error = AdapterError::new(
                    ErrorKind::StreamFormatDrift,
                    "adapter stream closed without finish frame",
                );
                ctx.health.record_error(&provider, &error);
                ctx.circuits.record_failure(&provider, true);
                let _ = tx
                    .send(StreamEvent::Finish {
                        reason: FinishReason::Error,
                        error: Some(crate::scri::StreamFailure {
                            kind: ErrorKind::StreamFormatDrift.as_str().to_owned(),
                            message: "stream closed without finish frame".to_owned(),
                        }),
                    })
                    .await;
            }
        });

        rx
    }
}

/// Reject undecodable inline image data before any provider is attempted.
///
/// The fault is the caller's, so this surfaces as a `validation` error and
/// never touches circuit or health accounting.
fn validate_images(request: &ChatRequest) -> Result<(), RouterError> {
    for message in &request.messages {
        let MessageContent::Blocks(blocks) = &message.content else {
            continue;
        };
        for block in blocks {
            if let ContentBlock::Image { source } = block {
                if source.decoded_bytes().is_err() {
                    return Err(RouterError::Provider(AdapterError::new(
                        ErrorKind::Validation,
                        "image block carries undecodable base64 data",
                    )));
                }
            }
        }
    }
    Ok(())
}

fn flatten_timeout<T>(
    outcome: Result<Result<T, AdapterError>, tokio::time::error::Elapsed>,
) -> Result<T, AdapterError> {
    match outcome {
        Ok(inner) => inner,
        Err(_) => Err(AdapterError::transient("per-call deadline exceeded")),
    }
}

fn attempt_failure(provider: &str, error: &AdapterError) -> AttemptFailure {
    let mut message = sanitize_error_body(&error.message);
    if message.chars().count() > ATTEMPT_MESSAGE_CHARS {
        message = message.chars().take(ATTEMPT_MESSAGE_CHARS).collect();
    }
    AttemptFailure {
        provider: provider.to_owned(),
        kind: error.kind.as_str().to_owned(),
        message,
    }
}

/// Infer a provider family from a bare model-name prefix.
fn infer_provider(model: &str) -> Option<&'static str> {
    const PREFIXES: [(&str, &str); 6] = [
        ("claude", "anthropic"),
        ("gpt", "openai"),
        ("chatgpt", "openai"),
        ("text-embedding", "openai"),
        ("gemini", "google"),
        ("grok", "xai"),
    ];
    PREFIXES
        .iter()
        .find(|(prefix, _)| model.starts_with(prefix))
        .map(|(_, provider)| *provider)
}
