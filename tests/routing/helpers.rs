//! Shared context builders for the routing suite.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use straylight::circuit::CircuitConfig;
use straylight::config::BehaviourConfig;
use straylight::context::GatewayContext;
use straylight::health::HealthConfig;
use straylight::providers::registry::ProviderRegistry;
use straylight::providers::ProviderAdapter;

/// Context over stub adapters with routing-test tuning.
pub fn context_with(
    adapters: Vec<(String, Arc<dyn ProviderAdapter>, u8, bool)>,
    aliases: BTreeMap<String, String>,
    default_provider: &str,
    enable_fallback: bool,
    failure_threshold: u32,
) -> Arc<GatewayContext> {
    let registry = ProviderRegistry::for_testing(adapters);
    Arc::new(GatewayContext::for_testing(
        registry,
        aliases,
        BehaviourConfig {
            default_provider: default_provider.to_owned(),
            prefer_local: true,
            enable_fallback,
        },
        CircuitConfig {
            failure_threshold,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
        },
        HealthConfig {
            window: Duration::from_secs(300),
            error_threshold: 100,
            cooldown: Duration::from_secs(600),
            max_recent_errors: 3,
        },
    ))
}

/// Alias table literal.
pub fn aliases(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(alias, target)| ((*alias).to_owned(), (*target).to_owned()))
        .collect()
}
