//! Straylight — a self-healing LLM gateway.
//!
//! Sits between an application and a heterogeneous set of LLM backends and
//! presents one normalized request/response vocabulary (SCRI). The router
//! resolves logical model names and walks a fallback list; per-provider
//! circuit breakers fail fast; the health monitor classifies errors and
//! escalates structural drift to the heal worker, which drafts an adapter
//! patch and drives the reload manager through apply, verify, and rollback.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Per-provider circuit breakers.
pub mod circuit;
/// Configuration loading and validation.
pub mod config;
/// Shared gateway context handle.
pub mod context;
/// Heal worker: diagnose, research, fix.
pub mod heal;
/// Health monitor and heal dispatch.
pub mod health;
/// Structured logging setup.
pub mod logging;
/// Metrics sink.
pub mod metrics;
/// Provider adapters and the registry.
pub mod providers;
/// Reload manager and version store.
pub mod reload;
/// Router and fallback engine.
pub mod router;
/// SCRI: the normalized vocabulary.
pub mod scri;
/// HTTP surface.
pub mod server;
