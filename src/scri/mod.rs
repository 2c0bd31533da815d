//! SCRI — the normalized request/response vocabulary.
//!
//! Every provider adapter translates between these types and its native wire
//! format. SCRI is the stable contract of the gateway; provider formats are
//! explicitly unstable and absorbed by the adapter layer.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Conversation participant role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instruction.
    System,
    /// Human user message.
    User,
    /// Assistant (model) message.
    Assistant,
    /// Tool result message.
    Tool,
}

/// A message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// The role of the message author.
    pub role: Role,
    /// Message content — plain text or ordered structured blocks.
    pub content: MessageContent,
}

impl Message {
    /// Build a plain-text message.
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: MessageContent::Text(text.into()),
        }
    }
}

/// The content of a message.
///
/// Block order within a message is semantically significant and is preserved
/// through every translation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    /// Plain text content.
    Text(String),
    /// Ordered structured content blocks.
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    /// Extract plain text, joining all text blocks.
    pub fn text(&self) -> String {
        match self {
            Self::Text(t) => t.clone(),
            Self::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect(),
        }
    }

    /// Number of blocks (a plain-text content counts as one).
    pub fn block_count(&self) -> usize {
        match self {
            Self::Text(_) => 1,
            Self::Blocks(blocks) => blocks.len(),
        }
    }
}

/// Source of an image block: inline base64 bytes or a URI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImageSource {
    /// Inline base64-encoded image data.
    Base64 {
        /// Media type, e.g. `image/png`.
        media_type: String,
        /// Base64-encoded bytes.
        data: String,
    },
    /// Remote image reference.
    Uri {
        /// Image URI.
        uri: String,
    },
}

impl ImageSource {
    /// Encode raw image bytes as an inline source.
    pub fn from_bytes(media_type: impl Into<String>, bytes: &[u8]) -> Self {
        use base64::Engine;
        Self::Base64 {
            media_type: media_type.into(),
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
        }
    }

    /// Decode inline image data back to bytes; `Ok(None)` for URI sources.
    ///
    /// # Errors
    ///
    /// Returns an error when the inline data is not valid base64.
    pub fn decoded_bytes(&self) -> Result<Option<Vec<u8>>, base64::DecodeError> {
        use base64::Engine;
        match self {
            Self::Base64 { data, .. } => {
                base64::engine::general_purpose::STANDARD.decode(data).map(Some)
            }
            Self::Uri { .. } => Ok(None),
        }
    }
}

/// A single structured content block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain text.
    Text {
        /// The text content.
        text: String,
    },
    /// An image, inline or by reference.
    Image {
        /// Where the image bytes come from.
        source: ImageSource,
    },
    /// Tool invocation requested by the assistant.
    ToolUse {
        /// Unique call identifier.
        id: String,
        /// Tool name.
        name: String,
        /// Tool input as JSON.
        input: serde_json::Value,
    },
    /// Result of a tool call.
    ToolResult {
        /// Matching call identifier.
        tool_use_id: String,
        /// Result payload.
        content: String,
        /// Whether the tool reported an error.
        #[serde(default)]
        is_error: bool,
    },
    /// Opaque reasoning text.
    Thinking {
        /// The reasoning content.
        text: String,
        /// Provider signature over the reasoning, when given.
        #[serde(skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
}

// ---------------------------------------------------------------------------
// Tools
// ---------------------------------------------------------------------------

/// JSON Schema definition for a tool the model can call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name, unique within a request.
    pub name: String,
    /// Description shown to the model.
    pub description: String,
    /// JSON Schema object for the tool's parameters.
    pub parameters: serde_json::Value,
}

/// Policy for how the model may select tools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolChoice {
    /// Model decides whether to call a tool.
    Auto,
    /// Tool calls are disabled for this request.
    None,
    /// Model must call some tool.
    Any,
    /// Model must call the named tool.
    Tool {
        /// Required tool name.
        name: String,
    },
}

/// A tool call returned by the model, with decoded arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Call identifier, unique within the response.
    pub id: String,
    /// Tool name.
    pub name: String,
    /// Decoded arguments.
    pub arguments: serde_json::Value,
}

/// Generate a gateway-unique tool-call id for providers that omit one.
pub fn generate_call_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Extended-thinking request options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThinkingOptions {
    /// Whether thinking is requested.
    pub enabled: bool,
    /// Token budget for reasoning, when the provider supports one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget_tokens: Option<u32>,
}

/// A normalized chat request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Logical model identifier: an alias or `provider:model`.
    pub model: String,
    /// Ordered conversation history.
    pub messages: Vec<Message>,
    /// Sampling temperature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Maximum output tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Nucleus sampling parameter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    /// Tools available for this call.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
    /// Tool selection policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
    /// Extended-thinking options.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<ThinkingOptions>,
    /// Opaque per-call hints forwarded to provider-specific code.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl ChatRequest {
    /// Build a minimal single-user-message request.
    pub fn user(model: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            messages: vec![Message::text(Role::User, text)],
            temperature: None,
            max_tokens: None,
            top_p: None,
            tools: Vec::new(),
            tool_choice: None,
            thinking: None,
            metadata: BTreeMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

/// Why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Normal end of turn.
    Stop,
    /// The model requested tool calls.
    ToolCalls,
    /// The output token limit was reached.
    Length,
    /// The provider refused on policy grounds.
    ContentFilter,
    /// Generation failed.
    Error,
}

/// Token usage for a single call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Tokens in the prompt.
    pub input_tokens: u64,
    /// Tokens generated.
    pub output_tokens: u64,
    /// Input plus output.
    pub total_tokens: u64,
    /// Tokens read from a provider-side cache.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_read_tokens: Option<u64>,
    /// Tokens written to a provider-side cache.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_write_tokens: Option<u64>,
    /// Tokens spent on reasoning.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_tokens: Option<u64>,
}

impl Usage {
    /// Build a usage record from input/output counts.
    pub fn from_counts(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens.saturating_add(output_tokens),
            cache_read_tokens: None,
            cache_write_tokens: None,
            reasoning_tokens: None,
        }
    }
}

/// Per-response provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lineage {
    /// Provider that answered.
    pub provider: String,
    /// Concrete model that answered.
    pub model: String,
    /// Adapter version the request was served under.
    pub adapter_version: u64,
    /// When the routed call started.
    pub started_at: DateTime<Utc>,
    /// When the routed call finished.
    pub finished_at: DateTime<Utc>,
    /// Number of candidates attempted, including the answering one.
    pub attempts: u32,
    /// Whether a fallback candidate answered.
    pub fallback: bool,
}

/// A normalized chat response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    /// Response identifier.
    pub id: String,
    /// Concrete model that answered.
    pub model: String,
    /// Provider that answered.
    pub provider: String,
    /// Ordered response content blocks.
    pub content: Vec<ContentBlock>,
    /// Tool calls requested by the model.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Why generation stopped.
    pub finish_reason: FinishReason,
    /// Token usage.
    pub usage: Usage,
    /// Provenance, filled by the router.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lineage: Option<Lineage>,
    /// Non-fatal translation anomalies noted by the adapter, drained by the
    /// router into the health monitor. Never serialized.
    #[serde(skip)]
    pub drift: Vec<String>,
}

impl ChatResponse {
    /// Extract the concatenated text content.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

/// Error payload attached to a failed stream's terminal frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamFailure {
    /// Classified error kind label.
    pub kind: String,
    /// Human-readable message.
    pub message: String,
}

/// One event in a streaming chat response.
///
/// Adapters emit exactly one `Finish` event last; consumers treat a stream
/// that ends without one as an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Incremental text content.
    TextDelta {
        /// The text fragment.
        text: String,
    },
    /// Incremental reasoning content.
    ThinkingDelta {
        /// The reasoning fragment.
        text: String,
    },
    /// A tool call has started.
    ToolCallStart {
        /// Call identifier.
        id: String,
        /// Tool name.
        name: String,
    },
    /// Incremental tool-call argument JSON.
    ToolCallArgDelta {
        /// Call identifier.
        id: String,
        /// Argument JSON fragment.
        delta: String,
    },
    /// A tool call is complete.
    ToolCallEnd {
        /// Call identifier.
        id: String,
    },
    /// Updated usage totals.
    Usage {
        /// Usage so far.
        usage: Usage,
    },
    /// Terminal frame.
    Finish {
        /// Why the stream ended.
        reason: FinishReason,
        /// Failure detail when `reason` is `error`.
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<StreamFailure>,
    },
}

// ---------------------------------------------------------------------------
// Embeddings and capabilities
// ---------------------------------------------------------------------------

/// A normalized embedding request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRequest {
    /// Logical model identifier.
    pub model: String,
    /// Texts to embed, order preserved in the response.
    pub inputs: Vec<String>,
}

/// A normalized embedding response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingResponse {
    /// Concrete model that answered.
    pub model: String,
    /// Provider that answered.
    pub provider: String,
    /// One vector per input, in input order.
    pub embeddings: Vec<Vec<f32>>,
    /// Token usage.
    pub usage: Usage,
}

/// Capabilities of one concrete provider model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCapabilities {
    /// Provider name.
    pub provider: String,
    /// Model identifier.
    pub model: String,
    /// Whether native tool calling is supported.
    pub supports_tools: bool,
    /// Whether streaming is supported.
    pub supports_streaming: bool,
    /// Whether embeddings are supported.
    pub supports_embeddings: bool,
    /// Whether the model can perform web search.
    pub supports_search: bool,
    /// Context window in tokens, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_window: Option<u32>,
}
