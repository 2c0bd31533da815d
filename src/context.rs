//! Shared gateway context handed to the router, heal worker, and HTTP layer.
//!
//! An explicit handle instead of globals: tests construct an isolated context
//! per case.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::circuit::{CircuitConfig, CircuitSet};
use crate::config::{BehaviourConfig, GatewayConfig};
use crate::health::{HealthConfig, HealthMonitor};
use crate::metrics::MetricsSink;
use crate::providers::registry::ProviderRegistry;

/// Everything the request path and control plane share.
pub struct GatewayContext {
    /// Provider registry with live adapter bindings.
    pub registry: Arc<ProviderRegistry>,
    /// Per-provider circuit breakers.
    pub circuits: Arc<CircuitSet>,
    /// Health monitor and heal dispatch.
    pub health: Arc<HealthMonitor>,
    /// Metrics sink.
    pub metrics: Arc<MetricsSink>,
    /// Logical-model alias table.
    pub aliases: BTreeMap<String, String>,
    /// Routing behaviour knobs.
    pub behaviour: BehaviourConfig,
}

impl GatewayContext {
    /// Assemble the context from configuration and an already-built registry.
    pub fn new(config: &GatewayConfig, registry: Arc<ProviderRegistry>) -> Self {
        let metrics = Arc::new(MetricsSink::new());

        let circuits = Arc::new(CircuitSet::new(
            registry
                .provider_names()
                .into_iter()
                .map(|name| {
                    let circuit = config.circuit_config_for(&name);
                    (name, circuit)
                })
                .collect(),
            Arc::clone(&metrics),
        ));

        let health = Arc::new(HealthMonitor::new(
            HealthConfig {
                window: std::time::Duration::from_secs(config.healing.window_seconds),
                error_threshold: config.healing.error_threshold,
                cooldown: std::time::Duration::from_secs(config.healing.cooldown_seconds),
                max_recent_errors: config.healing.max_error_payloads,
            },
            config.healing.enabled,
            Arc::clone(&metrics),
        ));

        Self {
            registry,
            circuits,
            health,
            metrics,
            aliases: config.aliases.clone(),
            behaviour: config.behaviour.clone(),
        }
    }

    /// Build a context around stub adapters with default tuning, for tests.
    #[doc(hidden)]
    pub fn for_testing(
        registry: ProviderRegistry,
        aliases: BTreeMap<String, String>,
        behaviour: BehaviourConfig,
        circuit: CircuitConfig,
        health: HealthConfig,
    ) -> Self {
        let metrics = Arc::new(MetricsSink::new());
        let registry = Arc::new(registry);
        let circuits = Arc::new(CircuitSet::new(
            registry
                .provider_names()
                .into_iter()
                .map(|name| (name, circuit))
                .collect(),
            Arc::clone(&metrics),
        ));
        let health = Arc::new(HealthMonitor::new(health, true, Arc::clone(&metrics)));
        Self {
            registry,
            circuits,
            health,
            metrics,
            aliases,
            behaviour,
        }
    }
}
