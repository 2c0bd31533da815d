//! HTTP surface: the versioned `/api/v1` API over axum.
//!
//! Routes and JSON encoding are boundary concerns; every handler delegates
//! to the router, health monitor, circuit set, or reload manager.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use tokio::net::TcpListener;
use tracing::info;

use crate::context::GatewayContext;
use crate::reload::ReloadManager;
use crate::router::Router;

mod routes;

/// Server startup and runtime errors, kept distinct so the CLI can map bind
/// failures to their own exit code.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The listen address could not be parsed or bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// The configured address.
        addr: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The accept loop failed after startup.
    #[error("server I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    /// Gateway context (registry, circuits, health, metrics).
    pub ctx: Arc<GatewayContext>,
    /// Request router.
    pub router: Router,
    /// Reload manager for fixes, history, and rollback.
    pub reload: Arc<ReloadManager>,
}

impl AppState {
    /// Assemble handler state.
    pub fn new(ctx: Arc<GatewayContext>, reload: Arc<ReloadManager>) -> Self {
        let router = Router::new(Arc::clone(&ctx));
        Self { ctx, router, reload }
    }
}

/// Build the `/api/v1` route table.
pub fn build_router(state: AppState) -> axum::Router {
    axum::Router::new()
        .route("/api/v1/chat", post(routes::chat))
        .route("/api/v1/chat/stream", post(routes::chat_stream))
        .route("/api/v1/embed", post(routes::embed))
        .route("/api/v1/models", get(routes::models))
        .route("/api/v1/health", get(routes::health))
        .route("/api/v1/healing/status", get(routes::healing_status))
        .route(
            "/api/v1/healing/pause/{provider}",
            post(routes::healing_pause),
        )
        .route(
            "/api/v1/healing/resume/{provider}",
            post(routes::healing_resume),
        )
        .route("/api/v1/fixes/pending", get(routes::fixes_pending))
        .route("/api/v1/fixes/{provider}/approve", post(routes::fix_approve))
        .route("/api/v1/fixes/{provider}/reject", post(routes::fix_reject))
        .route("/api/v1/fixes/{provider}/history", get(routes::fix_history))
        .route(
            "/api/v1/fixes/{provider}/rollback/{version}",
            post(routes::fix_rollback),
        )
        .route(
            "/api/v1/circuit/{provider}/{action}",
            post(routes::circuit_admin),
        )
        .route("/api/v1/metrics", get(routes::metrics))
        .route("/api/v1/dashboard", get(routes::dashboard))
        .with_state(state)
}

/// Bind and serve until ctrl-c.
///
/// # Errors
///
/// Returns [`ServerError::Bind`] when the address cannot be bound and
/// [`ServerError::Io`] for accept-loop failures.
pub async fn run(host: &str, port: u16, state: AppState) -> Result<(), ServerError> {
    let addr = format!("{host}:{port}");
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: addr.clone(),
            source,
        })?;

    let local: SocketAddr = listener.local_addr()?;
    info!(addr = %local, "gateway listening");

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    Ok(())
}
