//! Provider registry: one live adapter binding per provider, swappable
//! atomically by the reload manager.
//!
//! Readers clone the binding `Arc` at dispatch time, so an in-flight request
//! keeps its pre-swap adapter for the whole request. The factory captured at
//! registration rebuilds an adapter from the same settings whenever a new
//! version is bound.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::config::{GatewayConfig, ProviderSettings};
use crate::scri::ModelCapabilities;

use super::anthropic::AnthropicAdapter;
use super::google::GoogleAdapter;
use super::ollama::OllamaAdapter;
use super::openai::{OpenAiAdapter, XAI_API_BASE};
use super::ProviderAdapter;

/// Registry errors.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The named provider is not registered.
    #[error("unknown provider '{name}'")]
    UnknownProvider {
        /// Requested provider name.
        name: String,
    },
    /// No adapter family matches the provider name.
    #[error("unsupported provider '{name}'")]
    UnsupportedProvider {
        /// Unsupported provider name.
        name: String,
    },
    /// Required API credential is absent from the environment.
    #[error("missing credential for provider '{provider}': ${env}")]
    MissingCredential {
        /// Provider name.
        provider: String,
        /// Environment variable that was consulted.
        env: String,
    },
    /// The registry lock was poisoned by a panicking writer.
    #[error("registry lock poisoned for provider '{provider}'")]
    Poisoned {
        /// Provider name.
        provider: String,
    },
}

/// A versioned, immutable pairing of adapter instance and version id.
pub struct AdapterBinding {
    /// Version id recorded in response lineage.
    pub version: u64,
    /// The adapter serving this version.
    pub adapter: Arc<dyn ProviderAdapter>,
}

impl std::fmt::Debug for AdapterBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterBinding")
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

type AdapterFactory = Arc<dyn Fn() -> Arc<dyn ProviderAdapter> + Send + Sync>;

struct ProviderEntry {
    live: RwLock<Arc<AdapterBinding>>,
    factory: AdapterFactory,
    priority: u8,
    local: bool,
    timeout_seconds: u64,
}

/// Registry of provider entries keyed by provider name.
pub struct ProviderRegistry {
    entries: HashMap<String, ProviderEntry>,
}

impl ProviderRegistry {
    /// Build the registry from configuration, instantiating one adapter per
    /// enabled provider.
    ///
    /// # Errors
    ///
    /// Returns an error when a provider name matches no adapter family or a
    /// required credential is absent; the caller treats this as a provider
    /// initialization failure.
    pub fn from_config(config: &GatewayConfig) -> Result<Self, RegistryError> {
        let mut entries = HashMap::new();

        for (name, settings) in config.enabled_providers() {
            let factory = make_factory(name, settings)?;
            let binding = Arc::new(AdapterBinding {
                version: 1,
                adapter: factory(),
            });
            entries.insert(
                name.to_owned(),
                ProviderEntry {
                    live: RwLock::new(binding),
                    factory,
                    priority: settings.effective_priority(name),
                    local: settings.is_local(name),
                    timeout_seconds: settings.timeout_seconds,
                },
            );
            tracing::info!(provider = %name, model = %settings.default_model, "registered provider");
        }

        Ok(Self { entries })
    }

    /// Build a registry from explicit adapters, for tests.
    #[doc(hidden)]
    pub fn for_testing(adapters: Vec<(String, Arc<dyn ProviderAdapter>, u8, bool)>) -> Self {
        let mut entries = HashMap::new();
        for (name, adapter, priority, local) in adapters {
            let factory: AdapterFactory = {
                let adapter = Arc::clone(&adapter);
                Arc::new(move || Arc::clone(&adapter))
            };
            entries.insert(
                name,
                ProviderEntry {
                    live: RwLock::new(Arc::new(AdapterBinding {
                        version: 1,
                        adapter,
                    })),
                    factory,
                    priority,
                    local,
                    timeout_seconds: 60,
                },
            );
        }
        Self { entries }
    }

    /// Replace the factory used to rebuild a provider's adapter, for tests
    /// that need the rebuilt instance to behave differently.
    #[doc(hidden)]
    pub fn set_factory_for_testing(
        &mut self,
        provider: &str,
        factory: Arc<dyn Fn() -> Arc<dyn ProviderAdapter> + Send + Sync>,
    ) {
        if let Some(entry) = self.entries.get_mut(provider) {
            entry.factory = factory;
        }
    }

    /// Current live binding for a provider.
    pub fn binding(&self, provider: &str) -> Option<Arc<AdapterBinding>> {
        let entry = self.entries.get(provider)?;
        entry.live.read().ok().map(|guard| Arc::clone(&guard))
    }

    /// Build a fresh binding at the given version without publishing it.
    ///
    /// # Errors
    ///
    /// Returns an error when the provider is unknown.
    pub fn rebuild(
        &self,
        provider: &str,
        version: u64,
    ) -> Result<Arc<AdapterBinding>, RegistryError> {
        let entry = self
            .entries
            .get(provider)
            .ok_or_else(|| RegistryError::UnknownProvider {
                name: provider.to_owned(),
            })?;
        Ok(Arc::new(AdapterBinding {
            version,
            adapter: (entry.factory)(),
        }))
    }

    /// Atomically publish a new live binding, returning the previous one.
    ///
    /// # Errors
    ///
    /// Returns an error when the provider is unknown or the lock is poisoned.
    pub fn swap(
        &self,
        provider: &str,
        binding: Arc<AdapterBinding>,
    ) -> Result<Arc<AdapterBinding>, RegistryError> {
        let entry = self
            .entries
            .get(provider)
            .ok_or_else(|| RegistryError::UnknownProvider {
                name: provider.to_owned(),
            })?;
        let mut guard = entry.live.write().map_err(|_| RegistryError::Poisoned {
            provider: provider.to_owned(),
        })?;
        let previous = Arc::clone(&guard);
        *guard = binding;
        Ok(previous)
    }

    /// Whether the provider is registered.
    pub fn contains(&self, provider: &str) -> bool {
        self.entries.contains_key(provider)
    }

    /// Registered provider names, sorted.
    pub fn provider_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }

    /// Configured priority for a provider (lower is preferred; locals are 0).
    pub fn priority(&self, provider: &str) -> u8 {
        self.entries.get(provider).map_or(u8::MAX, |e| e.priority)
    }

    /// Whether the provider is a local backend.
    pub fn is_local(&self, provider: &str) -> bool {
        self.entries.get(provider).is_some_and(|e| e.local)
    }

    /// Per-call timeout for a provider, in seconds.
    pub fn timeout_seconds(&self, provider: &str) -> u64 {
        self.entries
            .get(provider)
            .map_or(60, |e| e.timeout_seconds)
    }

    /// Capabilities of every registered model.
    pub fn capabilities(&self) -> Vec<ModelCapabilities> {
        let mut all: Vec<ModelCapabilities> = self
            .entries
            .values()
            .filter_map(|entry| entry.live.read().ok())
            .flat_map(|binding| binding.adapter.list_models())
            .collect();
        all.sort_by(|a, b| (a.provider.clone(), a.model.clone()).cmp(&(b.provider.clone(), b.model.clone())));
        all
    }
}

/// Build the adapter factory for a provider family, resolving the credential
/// from the environment exactly once.
fn make_factory(
    name: &str,
    settings: &ProviderSettings,
) -> Result<AdapterFactory, RegistryError> {
    let model = settings.default_model.clone();
    let base_url = settings.base_url.clone();

    match name {
        "anthropic" => {
            let key = resolve_key(name, settings)?;
            Ok(Arc::new(move || {
                let adapter: Arc<dyn ProviderAdapter> = match &base_url {
                    Some(url) => Arc::new(AnthropicAdapter::with_base_url(
                        model.clone(),
                        key.clone(),
                        url.clone(),
                    )),
                    None => Arc::new(AnthropicAdapter::new(model.clone(), key.clone())),
                };
                adapter
            }))
        }
        "openai" => {
            let key = resolve_key(name, settings)?;
            Ok(Arc::new(move || {
                let adapter: Arc<dyn ProviderAdapter> = match &base_url {
                    Some(url) => Arc::new(OpenAiAdapter::for_provider(
                        "openai".to_owned(),
                        model.clone(),
                        key.clone(),
                        url.clone(),
                    )),
                    None => Arc::new(OpenAiAdapter::new(model.clone(), key.clone())),
                };
                adapter
            }))
        }
        "xai" => {
            let key = resolve_key(name, settings)?;
            Ok(Arc::new(move || {
                let url = base_url.clone().unwrap_or_else(|| XAI_API_BASE.to_owned());
                let adapter: Arc<dyn ProviderAdapter> = Arc::new(OpenAiAdapter::for_provider(
                    "xai".to_owned(),
                    model.clone(),
                    key.clone(),
                    url,
                ));
                adapter
            }))
        }
        "google" => {
            let key = resolve_key(name, settings)?;
            Ok(Arc::new(move || {
                let adapter: Arc<dyn ProviderAdapter> = match &base_url {
                    Some(url) => Arc::new(GoogleAdapter::with_base_url(
                        model.clone(),
                        key.clone(),
                        url.clone(),
                    )),
                    None => Arc::new(GoogleAdapter::new(model.clone(), key.clone())),
                };
                adapter
            }))
        }
        "ollama" => Ok(Arc::new(move || {
            let adapter: Arc<dyn ProviderAdapter> = match &base_url {
                Some(url) => Arc::new(OllamaAdapter::with_base_url(model.clone(), url.clone())),
                None => Arc::new(OllamaAdapter::new(model.clone())),
            };
            adapter
        })),
        other => Err(RegistryError::UnsupportedProvider {
            name: other.to_owned(),
        }),
    }
}

/// Read the provider credential from the environment.
///
/// Keys live only in the environment; they are never persisted or logged.
fn resolve_key(name: &str, settings: &ProviderSettings) -> Result<String, RegistryError> {
    let env_name = settings.credential_env(name);
    std::env::var(&env_name).map_err(|_| RegistryError::MissingCredential {
        provider: name.to_owned(),
        env: env_name,
    })
}

/// A terse description of a provider's current wire mapping, stored as the
/// initial version blob and fed to the heal model as diagnostic context.
pub fn mapping_notes(provider: &str) -> String {
    let body = match provider {
        "anthropic" => {
            "endpoint: POST /v1/messages\n\
             roles: system -> top-level system field; tool results -> user turns\n\
             blocks: text, image(base64|url), tool_use, tool_result, thinking\n\
             finish: end_turn/stop_sequence->stop, tool_use->tool_calls, max_tokens->length, refusal->content_filter\n\
             usage: usage.input_tokens / usage.output_tokens (+cache_read/cache_creation)\n\
             stream: SSE message_start/content_block_*/message_delta/message_stop"
        }
        "openai" | "xai" => {
            "endpoint: POST /v1/chat/completions\n\
             roles: system inline; assistant tool_calls array; tool role carries tool_call_id\n\
             tools: {type:function, function:{name,description,parameters}}; arguments are a JSON string\n\
             finish: stop, tool_calls, length, content_filter\n\
             usage: usage.prompt_tokens / usage.completion_tokens (+completion_tokens_details.reasoning_tokens)\n\
             stream: SSE chat.completion.chunk deltas terminated by [DONE]"
        }
        "google" => {
            "endpoint: POST /v1beta/models/{model}:generateContent\n\
             roles: user/model; system -> systemInstruction; tool results keyed by function name\n\
             parts: text, inlineData, fileData, functionCall, functionResponse, thought\n\
             finish: STOP, MAX_TOKENS, SAFETY/PROHIBITED_CONTENT -> content_filter\n\
             usage: usageMetadata.promptTokenCount / candidatesTokenCount\n\
             stream: SSE frames shaped like full responses; last frame carries finishReason"
        }
        "ollama" => {
            "endpoint: POST /api/chat\n\
             roles: system/user/assistant/tool verbatim; images ride message.images as base64\n\
             tools: OpenAI-style function wrappers; tool calls carry no ids (gateway assigns)\n\
             finish: done_reason stop/length; tool calls imply tool_calls\n\
             usage: prompt_eval_count / eval_count\n\
             stream: NDJSON lines, terminal line has done=true"
        }
        _ => "no mapping notes recorded",
    };
    format!("provider: {provider}\n{body}\n")
}
