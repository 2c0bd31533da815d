//! Handlers for the `/api/v1` routes.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use crate::circuit::AdminAction;
use crate::metrics::MetricsSnapshot;
use crate::providers::ErrorKind;
use crate::reload::ReloadError;
use crate::router::RouterError;
use crate::scri::{ChatRequest, ChatResponse, EmbeddingRequest, EmbeddingResponse, StreamEvent};

use super::AppState;

// ---------------------------------------------------------------------------
// Error envelope
// ---------------------------------------------------------------------------

/// JSON error body: `{kind, message, provider?, details?}`.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    kind: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

/// An error response with its HTTP status.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    fn new(status: StatusCode, kind: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                kind: kind.to_owned(),
                message: message.into(),
                provider: None,
                details: None,
            },
        }
    }

    fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.body.provider = Some(provider.into());
        self
    }

    fn with_details(mut self, details: serde_json::Value) -> Self {
        self.body.details = Some(details);
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<RouterError> for ApiError {
    fn from(error: RouterError) -> Self {
        match error {
            RouterError::NoCandidate { model } => Self::new(
                StatusCode::NOT_FOUND,
                "no_candidate",
                format!("no provider candidate for model '{model}'"),
            ),
            RouterError::Disabled { provider } => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "disabled",
                format!("provider '{provider}' is disabled"),
            )
            .with_provider(provider),
            RouterError::AllProvidersFailed { model, attempts } => {
                let details = serde_json::to_value(&attempts).unwrap_or_default();
                Self::new(
                    StatusCode::BAD_GATEWAY,
                    "all_providers_failed",
                    format!("all providers failed for model '{model}'"),
                )
                .with_details(details)
            }
            RouterError::Provider(adapter_error) => {
                let status = match adapter_error.kind {
                    ErrorKind::Validation | ErrorKind::ContentFilter => StatusCode::BAD_REQUEST,
                    _ => StatusCode::BAD_GATEWAY,
                };
                Self::new(
                    status,
                    adapter_error.kind.as_str(),
                    adapter_error.message.clone(),
                )
            }
        }
    }
}

impl From<ReloadError> for ApiError {
    fn from(error: ReloadError) -> Self {
        match &error {
            ReloadError::UnknownProvider { provider } => {
                Self::new(StatusCode::NOT_FOUND, "unknown_provider", error.to_string())
                    .with_provider(provider.clone())
            }
            ReloadError::UnknownVersion { provider, .. } => {
                Self::new(StatusCode::NOT_FOUND, "unknown_version", error.to_string())
                    .with_provider(provider.clone())
            }
            ReloadError::NoPendingFix { provider } => {
                Self::new(StatusCode::NOT_FOUND, "no_pending_fix", error.to_string())
                    .with_provider(provider.clone())
            }
            ReloadError::AlreadyResolved { provider, .. } => {
                Self::new(StatusCode::CONFLICT, "already_resolved", error.to_string())
                    .with_provider(provider.clone())
            }
            ReloadError::Storage(_) => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "storage", error.to_string())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Inference routes
// ---------------------------------------------------------------------------

/// `POST /api/v1/chat`
pub async fn chat(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    Ok(Json(state.router.chat(&request).await?))
}

/// `POST /api/v1/chat/stream`
pub async fn chat_stream(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>>, ApiError> {
    let receiver = state.router.chat_stream(&request).await?;
    let stream = ReceiverStream::new(receiver).map(|event: StreamEvent| {
        Ok(Event::default()
            .json_data(&event)
            .unwrap_or_else(|_| Event::default().data("{}")))
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// `POST /api/v1/embed`
pub async fn embed(
    State(state): State<AppState>,
    Json(request): Json<EmbeddingRequest>,
) -> Result<Json<EmbeddingResponse>, ApiError> {
    Ok(Json(state.router.embed(&request).await?))
}

/// `GET /api/v1/models`
pub async fn models(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "models": state.ctx.registry.capabilities(),
        "aliases": state.ctx.aliases,
    }))
}

// ---------------------------------------------------------------------------
// Observability routes
// ---------------------------------------------------------------------------

/// `GET /api/v1/health`
pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "providers": state.ctx.health.snapshot(),
        "circuits": state.ctx.circuits.snapshot(),
    }))
}

/// `GET /api/v1/healing/status`
pub async fn healing_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    let snapshot = state.ctx.health.snapshot();
    let paused: std::collections::BTreeMap<&String, bool> = snapshot
        .iter()
        .map(|(name, report)| (name, report.paused))
        .collect();
    Json(json!({
        "enabled": state.ctx.health.healing_enabled(),
        "cooldowns": state.ctx.health.cooldowns(),
        "paused": paused,
    }))
}

/// `POST /api/v1/healing/pause/{provider}`
///
/// Pausing removes the provider from routing and suppresses heal dispatch
/// until resumed.
pub async fn healing_pause(
    State(state): State<AppState>,
    Path(provider): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    ensure_provider(&state, &provider)?;
    state.ctx.health.set_paused(&provider, true);
    Ok(Json(json!({"provider": provider, "paused": true})))
}

/// `POST /api/v1/healing/resume/{provider}`
pub async fn healing_resume(
    State(state): State<AppState>,
    Path(provider): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    ensure_provider(&state, &provider)?;
    state.ctx.health.set_paused(&provider, false);
    Ok(Json(json!({"provider": provider, "paused": false})))
}

// ---------------------------------------------------------------------------
// Fix lifecycle routes
// ---------------------------------------------------------------------------

/// Optional approval body.
#[derive(Debug, Default, Deserialize)]
pub struct ApproveBody {
    /// Recorded as the approver on the committed version.
    #[serde(default)]
    approver: Option<String>,
}

/// `GET /api/v1/fixes/pending`
pub async fn fixes_pending(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let pending = state.reload.pending_fixes()?;
    Ok(Json(json!({"pending": pending})))
}

/// `POST /api/v1/fixes/{provider}/approve`
pub async fn fix_approve(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    body: Option<Json<ApproveBody>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let approver = body
        .and_then(|Json(b)| b.approver)
        .unwrap_or_else(|| "operator".to_owned());
    let outcome = state.reload.approve(&provider, &approver).await?;
    Ok(Json(serde_json::to_value(outcome).unwrap_or_default()))
}

/// `POST /api/v1/fixes/{provider}/reject`
pub async fn fix_reject(
    State(state): State<AppState>,
    Path(provider): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.reload.reject(&provider).await?;
    Ok(Json(json!({"provider": provider, "status": "rejected"})))
}

/// `GET /api/v1/fixes/{provider}/history`
pub async fn fix_history(
    State(state): State<AppState>,
    Path(provider): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    ensure_provider(&state, &provider)?;
    let history = state.reload.history(&provider)?;
    Ok(Json(json!({"provider": provider, "versions": history})))
}

/// `POST /api/v1/fixes/{provider}/rollback/{version}`
pub async fn fix_rollback(
    State(state): State<AppState>,
    Path((provider, version)): Path<(String, u64)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let outcome = state.reload.rollback_to(&provider, version).await?;
    Ok(Json(serde_json::to_value(outcome).unwrap_or_default()))
}

// ---------------------------------------------------------------------------
// Circuit and metrics routes
// ---------------------------------------------------------------------------

/// `POST /api/v1/circuit/{provider}/{action}` with action in
/// `open | close | reset`.
pub async fn circuit_admin(
    State(state): State<AppState>,
    Path((provider, action)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let admin_action = match action.as_str() {
        "open" => AdminAction::ForceOpen,
        "close" => AdminAction::ForceClose,
        "reset" => AdminAction::Reset,
        other => {
            return Err(ApiError::new(
                StatusCode::BAD_REQUEST,
                "invalid_action",
                format!("unknown circuit action '{other}'"),
            ))
        }
    };

    let previous = state
        .ctx
        .circuits
        .admin(&provider, admin_action)
        .ok_or_else(|| {
            ApiError::new(
                StatusCode::NOT_FOUND,
                "unknown_provider",
                format!("unknown provider '{provider}'"),
            )
            .with_provider(provider.clone())
        })?;

    let current = state
        .ctx
        .circuits
        .state(&provider)
        .map(|s| s.as_str())
        .unwrap_or("unknown");
    Ok(Json(json!({
        "provider": provider,
        "previous": previous.as_str(),
        "state": current,
    })))
}

/// `GET /api/v1/metrics`
pub async fn metrics(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.ctx.metrics.snapshot())
}

/// `GET /api/v1/dashboard`
pub async fn dashboard(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let pending = state.reload.pending_fixes()?;
    Ok(Json(json!({
        "providers": state.ctx.health.snapshot(),
        "circuits": state.ctx.circuits.snapshot(),
        "healing": {
            "enabled": state.ctx.health.healing_enabled(),
            "cooldowns": state.ctx.health.cooldowns(),
            "pending_fixes": pending,
        },
        "metrics": state.ctx.metrics.snapshot(),
    })))
}

fn ensure_provider(state: &AppState, provider: &str) -> Result<(), ApiError> {
    if state.ctx.registry.contains(provider) {
        Ok(())
    } else {
        Err(ApiError::new(
            StatusCode::NOT_FOUND,
            "unknown_provider",
            format!("unknown provider '{provider}'"),
        )
        .with_provider(provider.to_owned()))
    }
}
