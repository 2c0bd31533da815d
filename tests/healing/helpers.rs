//! Shared builders for the healing suite.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use straylight::circuit::CircuitConfig;
use straylight::config::BehaviourConfig;
use straylight::context::GatewayContext;
use straylight::health::HealthConfig;
use straylight::providers::registry::ProviderRegistry;
use straylight::providers::ProviderAdapter;
use straylight::reload::store::VersionStore;
use straylight::reload::{ReloadConfig, ReloadManager};

/// Context over stub adapters with healing-test tuning.
pub fn context_with(registry: ProviderRegistry) -> Arc<GatewayContext> {
    Arc::new(GatewayContext::for_testing(
        registry,
        BTreeMap::new(),
        BehaviourConfig {
            default_provider: "ollama".to_owned(),
            prefer_local: true,
            enable_fallback: true,
        },
        CircuitConfig::default(),
        HealthConfig {
            window: Duration::from_secs(300),
            error_threshold: 3,
            cooldown: Duration::from_secs(600),
            max_recent_errors: 3,
        },
    ))
}

/// A reload manager over a temp-dir store, bootstrapped.
pub fn reload_manager(
    ctx: &Arc<GatewayContext>,
    dir: &tempfile::TempDir,
    auto_apply: bool,
    auto_apply_threshold: f64,
    max_versions: usize,
) -> Arc<ReloadManager> {
    let store = VersionStore::open(dir.path(), max_versions).expect("open store");
    let manager = Arc::new(ReloadManager::new(
        Arc::clone(ctx),
        store,
        ReloadConfig {
            auto_apply,
            auto_apply_threshold,
            verification_timeout: Duration::from_secs(5),
            pending_expiry: chrono::Duration::days(7),
        },
    ));
    manager.bootstrap().expect("bootstrap versions");
    manager
}

/// Registry over one named stub adapter.
pub fn single_provider_registry(
    name: &str,
    adapter: Arc<dyn ProviderAdapter>,
) -> ProviderRegistry {
    ProviderRegistry::for_testing(vec![(name.to_owned(), adapter, 1, name == "ollama")])
}
