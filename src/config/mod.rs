//! Configuration loading and management.
//!
//! Loads gateway configuration from `./straylight.toml` (or
//! `$STRAYLIGHT_CONFIG_PATH`). Environment variables override file values;
//! file values override defaults.
//!
//! API-key material never lives in this structure: providers name the
//! environment variable holding their key, and the registry reads it at
//! initialization.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::circuit::CircuitConfig;

// ── Top-level config ────────────────────────────────────────────

/// Top-level gateway configuration loaded from TOML.
///
/// Precedence: env vars > config file > defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// HTTP server settings.
    pub server: ServerConfig,
    /// Per-provider settings keyed by provider name.
    pub providers: BTreeMap<String, ProviderSettings>,
    /// Logical-model alias table: alias -> `provider:model`.
    pub aliases: BTreeMap<String, String>,
    /// Routing behaviour knobs.
    pub behaviour: BehaviourConfig,
    /// Self-heal pipeline settings.
    pub healing: HealingConfig,
    /// Circuit breaker defaults; providers may override.
    pub circuit: CircuitSettings,
    /// Filesystem paths for persistent state.
    pub paths: PathsConfig,
}

impl GatewayConfig {
    /// Load configuration with precedence: env vars > TOML file > defaults.
    ///
    /// Config file path: `$STRAYLIGHT_CONFIG_PATH` or `./straylight.toml`.
    /// A missing file yields defaults.
    ///
    /// # Errors
    ///
    /// Returns an error when the file exists but cannot be parsed, or when
    /// validation fails.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load from an explicit path (CLI `--config`), falling back to the
    /// default resolution when `None`.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be read or parsed, or when
    /// validation fails.
    pub fn load_from(path: Option<PathBuf>) -> Result<Self> {
        let path = match path {
            Some(p) => p,
            None => Self::config_path_with(|key| std::env::var(key).ok()),
        };
        let mut config = match std::fs::read_to_string(&path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                toml::from_str(&contents).context("failed to parse config TOML")?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no config file found, using defaults");
                GatewayConfig::default()
            }
            Err(e) => return Err(anyhow::anyhow!("failed to read config file: {e}")),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML string into config (for testing).
    ///
    /// # Errors
    ///
    /// Returns an error when the TOML is invalid.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let mut config: GatewayConfig =
            toml::from_str(toml_str).context("failed to parse config TOML")?;
        config.normalize();
        Ok(config)
    }

    /// Resolve config path using a custom env resolver (for testing).
    fn config_path_with(env: impl Fn(&str) -> Option<String>) -> PathBuf {
        if let Some(p) = env("STRAYLIGHT_CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("straylight.toml")
    }

    /// Apply environment variable overrides (env > config > defaults).
    ///
    /// Takes a resolver function for testability.
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("STRAYLIGHT_HOST") {
            self.server.host = v;
        }
        if let Some(v) = env("STRAYLIGHT_PORT") {
            match v.parse() {
                Ok(n) => self.server.port = n,
                Err(_) => tracing::warn!(
                    var = "STRAYLIGHT_PORT",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
        if let Some(v) = env("STRAYLIGHT_STATE_DIR") {
            self.paths.state_dir = v;
        }
        if let Some(v) = env("STRAYLIGHT_LOGS_DIR") {
            self.paths.logs_dir = v;
        }
        if let Some(v) = env("STRAYLIGHT_DEFAULT_PROVIDER") {
            self.behaviour.default_provider = v;
        }
        if let Some(v) = env("STRAYLIGHT_HEALING_ENABLED") {
            match v.parse() {
                Ok(b) => self.healing.enabled = b,
                Err(_) => tracing::warn!(
                    var = "STRAYLIGHT_HEALING_ENABLED",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
        if let Some(v) = env("STRAYLIGHT_AUTO_APPLY") {
            match v.parse() {
                Ok(b) => self.healing.auto_apply = b,
                Err(_) => tracing::warn!(
                    var = "STRAYLIGHT_AUTO_APPLY",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
        if let Some(v) = env("STRAYLIGHT_OLLAMA_URL") {
            self.providers
                .entry("ollama".to_owned())
                .or_insert_with(ProviderSettings::local_default)
                .base_url = Some(v);
        }

        // The presence of a provider key enables that provider.
        for (provider, env_name) in [
            ("anthropic", "ANTHROPIC_API_KEY"),
            ("openai", "OPENAI_API_KEY"),
            ("google", "GEMINI_API_KEY"),
            ("xai", "XAI_API_KEY"),
        ] {
            if env(env_name).is_some() && !self.providers.contains_key(provider) {
                self.providers
                    .insert(provider.to_owned(), ProviderSettings::cloud_default(provider));
            }
        }
    }

    /// Fill defaults that depend on other fields.
    fn normalize(&mut self) {
        if !self.providers.contains_key("ollama") {
            self.providers
                .insert("ollama".to_owned(), ProviderSettings::local_default());
        }
        for (name, settings) in &mut self.providers {
            if settings.default_model.is_empty() {
                settings.default_model = ProviderSettings::default_model_for(name);
            }
        }
    }

    /// Validate cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns an error naming the offending field.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            !self.behaviour.default_provider.is_empty(),
            "behaviour.default_provider must be set"
        );
        anyhow::ensure!(
            self.providers
                .get(&self.behaviour.default_provider)
                .is_some_and(|p| p.enabled),
            "behaviour.default_provider '{}' is not an enabled provider",
            self.behaviour.default_provider
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.healing.auto_apply_threshold),
            "healing.auto_apply_threshold must be in [0, 1]"
        );
        for (alias, target) in &self.aliases {
            anyhow::ensure!(
                target.split_once(':').is_some_and(|(p, m)| !p.is_empty() && !m.is_empty()),
                "alias '{alias}' target '{target}' is not in provider:model form"
            );
        }
        for (name, settings) in &self.providers {
            if let Some(base_url) = &settings.base_url {
                url::Url::parse(base_url).map_err(|e| {
                    anyhow::anyhow!("providers.{name}.base_url '{base_url}' is invalid: {e}")
                })?;
            }
        }
        Ok(())
    }

    /// Enabled providers, in name order.
    pub fn enabled_providers(&self) -> impl Iterator<Item = (&str, &ProviderSettings)> {
        self.providers
            .iter()
            .filter(|(_, settings)| settings.enabled)
            .map(|(name, settings)| (name.as_str(), settings))
    }

    /// Effective circuit tuning for one provider.
    pub fn circuit_config_for(&self, provider: &str) -> CircuitConfig {
        let settings = self
            .providers
            .get(provider)
            .and_then(|p| p.circuit.as_ref())
            .unwrap_or(&self.circuit);
        CircuitConfig {
            failure_threshold: settings.failure_threshold,
            success_threshold: settings.success_threshold,
            recovery_timeout: Duration::from_secs(settings.recovery_timeout_seconds),
        }
    }
}

// ── Server config ───────────────────────────────────────────────

/// HTTP server settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind host.
    pub host: String,
    /// Bind port.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 8130,
        }
    }
}

// ── Provider settings ───────────────────────────────────────────

/// Settings for one provider.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    /// Whether the provider participates in routing.
    pub enabled: bool,
    /// Default concrete model for this provider.
    #[serde(alias = "model")]
    pub default_model: String,
    /// Environment variable holding the API key; keys never live in config.
    pub api_key_env: Option<String>,
    /// API base URL override.
    pub base_url: Option<String>,
    /// Fallback priority; lower ranks earlier, locals default to 0.
    pub priority: Option<u8>,
    /// Per-call deadline in seconds.
    pub timeout_seconds: u64,
    /// Circuit breaker override for this provider.
    pub circuit: Option<CircuitSettings>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            default_model: String::new(),
            api_key_env: None,
            base_url: None,
            priority: None,
            timeout_seconds: 60,
            circuit: None,
        }
    }
}

impl ProviderSettings {
    fn local_default() -> Self {
        Self {
            default_model: "qwen3:8b".to_owned(),
            ..Self::default()
        }
    }

    fn cloud_default(provider: &str) -> Self {
        Self {
            default_model: Self::default_model_for(provider),
            ..Self::default()
        }
    }

    fn default_model_for(provider: &str) -> String {
        match provider {
            "anthropic" => "claude-sonnet-4-5".to_owned(),
            "openai" => "gpt-4o".to_owned(),
            "google" => "gemini-2.5-flash".to_owned(),
            "xai" => "grok-4".to_owned(),
            "ollama" => "qwen3:8b".to_owned(),
            _ => String::new(),
        }
    }

    /// Whether this provider is a local backend.
    pub fn is_local(&self, name: &str) -> bool {
        name == "ollama"
    }

    /// Fallback priority: locals share 0, clouds default to 1.
    pub fn effective_priority(&self, name: &str) -> u8 {
        match self.priority {
            Some(p) => p,
            None if self.is_local(name) => 0,
            None => 1,
        }
    }

    /// Environment variable consulted for this provider's API key.
    pub fn credential_env(&self, name: &str) -> String {
        if let Some(env) = &self.api_key_env {
            return env.clone();
        }
        match name {
            "google" => "GEMINI_API_KEY".to_owned(),
            other => format!("{}_API_KEY", other.to_uppercase()),
        }
    }
}

// ── Behaviour config ────────────────────────────────────────────

/// Routing behaviour knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BehaviourConfig {
    /// Provider used when nothing else resolves a model name.
    pub default_provider: String,
    /// Rank local providers ahead of clouds in fallback order.
    pub prefer_local: bool,
    /// Whether the router may advance past a failed primary.
    pub enable_fallback: bool,
}

impl Default for BehaviourConfig {
    fn default() -> Self {
        Self {
            default_provider: "ollama".to_owned(),
            prefer_local: true,
            enable_fallback: true,
        }
    }
}

// ── Healing config ──────────────────────────────────────────────

/// Self-heal pipeline settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealingConfig {
    /// Whether healing is enabled at all.
    pub enabled: bool,
    /// Whether confident fixes apply without human approval.
    pub auto_apply: bool,
    /// Minimum confidence for auto-apply.
    pub auto_apply_threshold: f64,
    /// Logical model used for diagnosis and fix generation.
    pub heal_model: String,
    /// Structural errors within the window that trigger a heal.
    pub error_threshold: u32,
    /// Sliding window for structural-error counting, in seconds.
    pub window_seconds: u64,
    /// Cooldown after a heal dispatch, in seconds.
    pub cooldown_seconds: u64,
    /// Provider preference order for research.
    pub research_preference: Vec<String>,
    /// Maximum search queries per heal cycle.
    pub max_research_queries: usize,
    /// Wall-clock budget for the research phase, in seconds.
    pub research_timeout_seconds: u64,
    /// Age in days at which an unresolved pending fix expires.
    pub pending_expiry_days: u64,
    /// Budget for post-swap verification, in seconds.
    pub verification_timeout_seconds: u64,
    /// Raw error payloads retained per provider for diagnosis.
    pub max_error_payloads: usize,
    /// Retained adapter versions per provider.
    pub max_versions: usize,
}

impl Default for HealingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_apply: false,
            auto_apply_threshold: 0.8,
            heal_model: "local".to_owned(),
            error_threshold: 5,
            window_seconds: 300,
            cooldown_seconds: 600,
            research_preference: vec![
                "xai".to_owned(),
                "openai".to_owned(),
                "google".to_owned(),
                "anthropic".to_owned(),
            ],
            max_research_queries: 3,
            research_timeout_seconds: 60,
            pending_expiry_days: 7,
            verification_timeout_seconds: 10,
            max_error_payloads: 3,
            max_versions: 10,
        }
    }
}

// ── Circuit settings ────────────────────────────────────────────

/// Circuit breaker tuning as written in TOML.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CircuitSettings {
    /// Consecutive structural failures that trip the breaker.
    pub failure_threshold: u32,
    /// Probe successes needed to close from half-open.
    pub success_threshold: u32,
    /// Seconds the breaker stays open before probing.
    pub recovery_timeout_seconds: u64,
}

impl Default for CircuitSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout_seconds: 30,
        }
    }
}

// ── Paths config ────────────────────────────────────────────────

/// Filesystem paths for persistent state.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Adapter version store, pending fixes, and the heal audit log.
    pub state_dir: String,
    /// JSON log files.
    pub logs_dir: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_dir: "straylight-state".to_owned(),
            logs_dir: "logs".to_owned(),
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────
