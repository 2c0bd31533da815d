//! Provider adapter layer.
//!
//! Defines the [`ProviderAdapter`] contract every backend implements, the
//! closed [`ErrorKind`] taxonomy used by the health monitor and circuit
//! breakers, and shared HTTP helpers.
//!
//! Four adapter families are implemented:
//! - [`anthropic::AnthropicAdapter`] — Anthropic `/v1/messages`
//! - [`openai::OpenAiAdapter`] — OpenAI-compatible `/v1/chat/completions`
//!   (serves both the `openai` and `xai` providers)
//! - [`google::GoogleAdapter`] — Gemini `generateContent`
//! - [`ollama::OllamaAdapter`] — Ollama `/api/chat`

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::scri::{
    ChatRequest, ChatResponse, EmbeddingRequest, EmbeddingResponse, Message, ModelCapabilities,
    StreamEvent, ToolDefinition,
};

pub mod anthropic;
pub mod google;
pub mod ollama;
pub mod openai;
pub mod registry;

/// Buffer size for adapter stream channels; full channels apply backpressure
/// to the provider read loop.
pub const STREAM_CHANNEL_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

/// Closed classification of adapter errors.
///
/// Structural kinds indicate the adapter's view of the provider wire format
/// has drifted; only those count toward circuit thresholds and heal
/// triggering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Retriable upstream trouble: 429, 503, connection reset, timeout.
    Transient,
    /// Credential rejected: 401, 403, invalid key.
    Auth,
    /// Caller-fault request: 400 with a validation payload.
    Validation,
    /// Provider refused on policy grounds.
    ContentFilter,
    /// Required field absent or wrong JSON shape.
    SchemaMismatch,
    /// Unrecognized field at a load-bearing position.
    UnknownField,
    /// Documented-removed field still expected by the adapter.
    DeprecatedField,
    /// Provider tool format changed.
    ToolSchemaDrift,
    /// Stream event type or envelope changed.
    StreamFormatDrift,
    /// Unclassified; logged verbatim for later reclassification.
    Unknown,
}

impl ErrorKind {
    /// Whether this kind signals provider-schema drift.
    pub fn is_structural(self) -> bool {
        matches!(
            self,
            Self::SchemaMismatch
                | Self::UnknownField
                | Self::DeprecatedField
                | Self::ToolSchemaDrift
                | Self::StreamFormatDrift
        )
    }

    /// Whether the router must not retry this request anywhere.
    ///
    /// Auth is deliberately absent: a rejected key is specific to one
    /// provider, so the walk may advance to a differently-keyed candidate.
    pub fn is_terminal_for_request(self) -> bool {
        matches!(self, Self::Validation | Self::ContentFilter)
    }

    /// Reverse of [`ErrorKind::as_str`], for labels carried in stream frames.
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "transient" => Some(Self::Transient),
            "auth" => Some(Self::Auth),
            "validation" => Some(Self::Validation),
            "content_filter" => Some(Self::ContentFilter),
            "schema_mismatch" => Some(Self::SchemaMismatch),
            "unknown_field" => Some(Self::UnknownField),
            "deprecated_field" => Some(Self::DeprecatedField),
            "tool_schema_drift" => Some(Self::ToolSchemaDrift),
            "stream_format_drift" => Some(Self::StreamFormatDrift),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }

    /// Lowercase snake_case label used in API responses and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Auth => "auth",
            Self::Validation => "validation",
            Self::ContentFilter => "content_filter",
            Self::SchemaMismatch => "schema_mismatch",
            Self::UnknownField => "unknown_field",
            Self::DeprecatedField => "deprecated_field",
            Self::ToolSchemaDrift => "tool_schema_drift",
            Self::StreamFormatDrift => "stream_format_drift",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by provider adapters.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct AdapterError {
    /// Classified error kind.
    pub kind: ErrorKind,
    /// Human-readable message, secrets redacted.
    pub message: String,
    /// HTTP status when the error came from a provider response.
    pub status: Option<u16>,
    /// Raw provider payload fragment for heal diagnosis, secrets redacted.
    pub details: Option<String>,
}

impl AdapterError {
    /// Build an error of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            details: None,
        }
    }

    /// Attach a redacted provider payload fragment.
    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Shorthand for a transient error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    /// Shorthand for a schema-mismatch error.
    pub fn schema_mismatch(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::SchemaMismatch, message)
    }

    /// Classify a non-success HTTP response from a provider.
    pub fn from_status(status: u16, body: &str) -> Self {
        let kind = match status {
            401 | 403 => ErrorKind::Auth,
            400 => ErrorKind::Validation,
            429 | 500 | 502 | 503 | 504 => ErrorKind::Transient,
            _ => ErrorKind::Unknown,
        };
        let sanitized = sanitize_error_body(body);
        Self {
            kind,
            message: format!("provider returned status {status}"),
            status: Some(status),
            details: Some(sanitized),
        }
    }
}

impl From<reqwest::Error> for AdapterError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() || err.is_connect() {
            ErrorKind::Transient
        } else if err.is_decode() {
            ErrorKind::SchemaMismatch
        } else {
            ErrorKind::Transient
        };
        Self::new(kind, sanitize_error_body(&err.to_string()))
    }
}

// ---------------------------------------------------------------------------
// HTTP helpers (shared by all adapters)
// ---------------------------------------------------------------------------

/// Check HTTP response status and return body text or a classified error.
///
/// # Errors
///
/// Returns a transport-classified error on failure to read, or a
/// status-classified [`AdapterError`] on non-2xx.
pub async fn check_http_response(response: reqwest::Response) -> Result<String, AdapterError> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(AdapterError::from_status(status.as_u16(), &body));
    }
    Ok(body)
}

/// Collapse whitespace, redact known secret patterns, and truncate a provider
/// error body before it reaches logs or callers.
pub fn sanitize_error_body(raw: &str) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");

    let mut sanitized = collapsed;
    for pattern in [
        r"sk-ant-[A-Za-z0-9_\-]{10,}",
        r"sk-[A-Za-z0-9]{32,}",
        r"xai-[A-Za-z0-9]{20,}",
        r"AIza[A-Za-z0-9_\-]{30,}",
        r"Bearer [A-Za-z0-9._\-]{16,}",
    ] {
        if let Ok(regex) = Regex::new(pattern) {
            sanitized = regex.replace_all(&sanitized, "[REDACTED]").into_owned();
        }
    }

    const MAX_ERROR_BODY_CHARS: usize = 256;
    if sanitized.chars().count() > MAX_ERROR_BODY_CHARS {
        let shortened = sanitized
            .chars()
            .take(MAX_ERROR_BODY_CHARS)
            .collect::<String>();
        return format!("{shortened}...[truncated]");
    }

    sanitized
}

/// Accumulates raw bytes and yields complete SSE `data:` payloads.
///
/// Shared by every adapter that consumes a server-sent-event stream; each
/// adapter interprets the decoded payloads in its own envelope.
#[derive(Debug, Default)]
pub(crate) struct SseDecoder {
    buffer: String,
}

impl SseDecoder {
    /// Feed a chunk; returns the data payloads of any completed lines.
    pub(crate) fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        let mut payloads = Vec::new();
        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            let line = line.trim_end();
            if let Some(data) = line.strip_prefix("data:") {
                let data = data.trim();
                if !data.is_empty() {
                    payloads.push(data.to_owned());
                }
            }
        }
        payloads
    }
}

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

/// The uniform contract every provider backend implements.
///
/// Implementations must be `Send + Sync`; a single adapter instance serves
/// concurrent requests. The `convert_*` operations are pure and exist so the
/// translation tables can be tested without network access.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Execute a chat completion.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError`] classified per the taxonomy.
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, AdapterError>;

    /// Execute a streaming chat completion.
    ///
    /// The returned channel yields [`StreamEvent`] values in provider order
    /// and always ends with exactly one `Finish` event.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError`] when the stream cannot be established;
    /// failures after that point surface as a terminal `Finish` frame.
    async fn chat_stream(
        &self,
        request: &ChatRequest,
    ) -> Result<mpsc::Receiver<StreamEvent>, AdapterError>;

    /// Compute embeddings.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError`] on API, network, or parse failure.
    async fn embed(&self, request: &EmbeddingRequest)
        -> Result<EmbeddingResponse, AdapterError>;

    /// Models this adapter instance can serve, with capabilities.
    fn list_models(&self) -> Vec<ModelCapabilities>;

    /// Cheap reachability probe.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError`] when the provider is unreachable or rejects
    /// the probe.
    async fn health_check(&self) -> Result<(), AdapterError>;

    /// Translate SCRI messages into the provider-native payload. Pure.
    fn convert_messages(&self, messages: &[Message]) -> serde_json::Value;

    /// Translate SCRI tool definitions into the provider-native payload. Pure.
    fn convert_tools(&self, tools: &[ToolDefinition]) -> serde_json::Value;

    /// Provider name this adapter serves (e.g. `"anthropic"`).
    fn provider_name(&self) -> &str;

    /// Default concrete model for this adapter instance.
    fn model_id(&self) -> &str;
}
