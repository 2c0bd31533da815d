//! Anthropic adapter for the `/v1/messages` API, including SSE streaming.

use std::collections::HashMap;

use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::scri::{
    ChatRequest, ChatResponse, ContentBlock, EmbeddingRequest, EmbeddingResponse, FinishReason,
    ImageSource, Message, MessageContent, ModelCapabilities, Role, StreamEvent, StreamFailure,
    ToolCall, ToolChoice, ToolDefinition, Usage,
};

use super::{
    check_http_response, AdapterError, ErrorKind, ProviderAdapter, SseDecoder,
    STREAM_CHANNEL_CAPACITY,
};

const DEFAULT_API_BASE: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Anthropic messages API adapter.
#[derive(Debug, Clone)]
pub struct AnthropicAdapter {
    model_name: String,
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl AnthropicAdapter {
    /// Create an adapter for the given model and API key.
    pub fn new(model_name: String, api_key: String) -> Self {
        Self::with_base_url(model_name, api_key, DEFAULT_API_BASE.to_owned())
    }

    /// Create an adapter against a non-default API base (testing, proxies).
    pub fn with_base_url(model_name: String, api_key: String, base_url: String) -> Self {
        Self {
            model_name,
            api_key,
            base_url,
            client: reqwest::Client::new(),
        }
    }

    /// Concrete model for a call: the router writes the resolved model into
    /// the request; an empty model falls back to this instance's default.
    fn target_model<'a>(&'a self, request: &'a ChatRequest) -> &'a str {
        if request.model.is_empty() {
            &self.model_name
        } else {
            &request.model
        }
    }

    fn request_body(&self, request: &ChatRequest, stream: bool) -> Value {
        let mut body = json!({
            "model": self.target_model(request),
            "messages": convert_messages(&request.messages),
            "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "stream": stream,
        });

        if let Some(system) = extract_system(&request.messages) {
            body["system"] = json!(system);
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(top_p) = request.top_p {
            body["top_p"] = json!(top_p);
        }
        if !request.tools.is_empty() {
            body["tools"] = convert_tools(&request.tools);
        }
        if let Some(choice) = &request.tool_choice {
            body["tool_choice"] = match choice {
                ToolChoice::Auto => json!({"type": "auto"}),
                ToolChoice::None => json!({"type": "none"}),
                ToolChoice::Any => json!({"type": "any"}),
                ToolChoice::Tool { name } => json!({"type": "tool", "name": name}),
            };
        }
        if let Some(thinking) = &request.thinking {
            if thinking.enabled {
                body["thinking"] = json!({
                    "type": "enabled",
                    "budget_tokens": thinking.budget_tokens.unwrap_or(1024),
                });
            }
        }

        body
    }

    fn post(&self, path: &str, body: &Value) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}{path}", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(body)
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for AnthropicAdapter {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, AdapterError> {
        let body = self.request_body(request, false);
        let response = self.post("/v1/messages", &body).send().await?;
        let payload = check_http_response(response).await?;
        parse_response(&payload)
    }

    async fn chat_stream(
        &self,
        request: &ChatRequest,
    ) -> Result<mpsc::Receiver<StreamEvent>, AdapterError> {
        let body = self.request_body(request, true);
        let response = self.post("/v1/messages", &body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AdapterError::from_status(status.as_u16(), &text));
        }

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let mut byte_stream = response.bytes_stream();

        tokio::spawn(async move {
            let mut decoder = SseDecoder::default();
            let mut state = StreamState::default();

            while let Some(chunk) = byte_stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tx
                            .send(StreamEvent::Finish {
                                reason: FinishReason::Error,
                                error: Some(StreamFailure {
                                    kind: ErrorKind::Transient.as_str().to_owned(),
                                    message: super::sanitize_error_body(&e.to_string()),
                                }),
                            })
                            .await;
                        return;
                    }
                };

                for data in decoder.feed(&chunk) {
                    for event in state.ingest(&data) {
                        let terminal = matches!(event, StreamEvent::Finish { .. });
                        if tx.send(event).await.is_err() {
                            return;
                        }
                        if terminal {
                            return;
                        }
                    }
                }
            }

            // Stream ended without a message_stop frame.
            let _ = tx
                .send(StreamEvent::Finish {
                    reason: FinishReason::Error,
                    error: Some(StreamFailure {
                        kind: ErrorKind::StreamFormatDrift.as_str().to_owned(),
                        message: "stream ended without terminal frame".to_owned(),
                    }),
                })
                .await;
        });

        Ok(rx)
    }

    async fn embed(&self, _request: &EmbeddingRequest) -> Result<EmbeddingResponse, AdapterError> {
        Err(AdapterError::new(
            ErrorKind::Validation,
            "anthropic does not serve embeddings",
        ))
    }

    fn list_models(&self) -> Vec<ModelCapabilities> {
        vec![ModelCapabilities {
            provider: "anthropic".to_owned(),
            model: self.model_name.clone(),
            supports_tools: true,
            supports_streaming: true,
            supports_embeddings: false,
            supports_search: true,
            context_window: Some(200_000),
        }]
    }

    async fn health_check(&self) -> Result<(), AdapterError> {
        let response = self
            .client
            .get(format!("{}/v1/models?limit=1", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .send()
            .await?;
        check_http_response(response).await?;
        Ok(())
    }

    fn convert_messages(&self, messages: &[Message]) -> Value {
        convert_messages(messages)
    }

    fn convert_tools(&self, tools: &[ToolDefinition]) -> Value {
        convert_tools(tools)
    }

    fn provider_name(&self) -> &str {
        "anthropic"
    }

    fn model_id(&self) -> &str {
        &self.model_name
    }
}

// ---------------------------------------------------------------------------
// SCRI -> wire
// ---------------------------------------------------------------------------

/// Join the system-role messages into the top-level `system` field.
fn extract_system(messages: &[Message]) -> Option<String> {
    let parts: Vec<String> = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.text())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n"))
    }
}

/// Translate SCRI messages into the Anthropic `messages` array.
///
/// System messages are excluded (they ride the top-level `system` field);
/// tool-result messages become `user` turns per the Anthropic role model.
#[doc(hidden)]
pub fn convert_messages(messages: &[Message]) -> Value {
    let converted: Vec<Value> = messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|message| {
            json!({
                "role": wire_role(message.role),
                "content": convert_content(&message.content),
            })
        })
        .collect();
    Value::Array(converted)
}

fn wire_role(role: Role) -> &'static str {
    match role {
        Role::System | Role::User | Role::Tool => "user",
        Role::Assistant => "assistant",
    }
}

fn convert_content(content: &MessageContent) -> Value {
    match content {
        MessageContent::Text(text) => json!(text),
        MessageContent::Blocks(blocks) => {
            Value::Array(blocks.iter().map(convert_block).collect())
        }
    }
}

fn convert_block(block: &ContentBlock) -> Value {
    match block {
        ContentBlock::Text { text } => json!({"type": "text", "text": text}),
        ContentBlock::Image { source } => match source {
            ImageSource::Base64 { media_type, data } => json!({
                "type": "image",
                "source": {"type": "base64", "media_type": media_type, "data": data},
            }),
            ImageSource::Uri { uri } => json!({
                "type": "image",
                "source": {"type": "url", "url": uri},
            }),
        },
        ContentBlock::ToolUse { id, name, input } => {
            json!({"type": "tool_use", "id": id, "name": name, "input": input})
        }
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => json!({
            "type": "tool_result",
            "tool_use_id": tool_use_id,
            "content": content,
            "is_error": is_error,
        }),
        ContentBlock::Thinking { text, signature } => {
            let mut value = json!({"type": "thinking", "thinking": text});
            if let Some(sig) = signature {
                value["signature"] = json!(sig);
            }
            value
        }
    }
}

/// Translate SCRI tool definitions into the Anthropic `tools` array.
#[doc(hidden)]
pub fn convert_tools(tools: &[ToolDefinition]) -> Value {
    let converted: Vec<Value> = tools
        .iter()
        .map(|tool| {
            json!({
                "name": tool.name,
                "description": tool.description,
                "input_schema": tool.parameters,
            })
        })
        .collect();
    Value::Array(converted)
}

// ---------------------------------------------------------------------------
// Wire -> SCRI
// ---------------------------------------------------------------------------

/// Parse a non-streaming messages API response into SCRI.
///
/// # Errors
///
/// Returns `schema_mismatch` when load-bearing structure is absent; unknown
/// non-load-bearing fields are collected as drift notes instead.
#[doc(hidden)]
pub fn parse_response(body: &str) -> Result<ChatResponse, AdapterError> {
    let parsed: Value = serde_json::from_str(body)
        .map_err(|e| AdapterError::schema_mismatch(format!("response is not JSON: {e}")))?;

    let Some(content_items) = parsed.get("content").and_then(Value::as_array) else {
        return Err(AdapterError::schema_mismatch("missing content array")
            .with_details(super::sanitize_error_body(body)));
    };

    let mut drift = Vec::new();
    let mut content = Vec::new();
    let mut tool_calls = Vec::new();

    for item in content_items {
        let item_type = item.get("type").and_then(Value::as_str).unwrap_or_default();
        match item_type {
            "text" => {
                let text = item.get("text").and_then(Value::as_str).unwrap_or_default();
                content.push(ContentBlock::Text {
                    text: text.to_owned(),
                });
            }
            "tool_use" => {
                let name = item
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        AdapterError::new(ErrorKind::ToolSchemaDrift, "tool_use missing name")
                    })?
                    .to_owned();
                let id = item
                    .get("id")
                    .and_then(Value::as_str)
                    .map_or_else(crate::scri::generate_call_id, ToOwned::to_owned);
                let input = item.get("input").cloned().unwrap_or(Value::Null);
                content.push(ContentBlock::ToolUse {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                });
                tool_calls.push(ToolCall {
                    id,
                    name,
                    arguments: input,
                });
            }
            "thinking" => {
                let text = item
                    .get("thinking")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let signature = item
                    .get("signature")
                    .and_then(Value::as_str)
                    .map(ToOwned::to_owned);
                content.push(ContentBlock::Thinking {
                    text: text.to_owned(),
                    signature,
                });
            }
            other => {
                debug!(block_type = other, "unmapped anthropic content block");
                drift.push(format!("unmapped content block type '{other}'"));
            }
        }
    }

    if content.is_empty() {
        return Err(AdapterError::schema_mismatch("response has no mappable content")
            .with_details(super::sanitize_error_body(body)));
    }

    let (finish_reason, finish_drift) =
        map_stop_reason(parsed.get("stop_reason").and_then(Value::as_str));
    if let Some(note) = finish_drift {
        drift.push(note);
    }

    Ok(ChatResponse {
        id: parsed
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned(),
        model: parsed
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned(),
        provider: "anthropic".to_owned(),
        content,
        tool_calls,
        finish_reason,
        usage: parse_usage(&parsed),
        lineage: None,
        drift,
    })
}

fn map_stop_reason(raw: Option<&str>) -> (FinishReason, Option<String>) {
    match raw {
        Some("end_turn" | "stop_sequence") => (FinishReason::Stop, None),
        Some("tool_use") => (FinishReason::ToolCalls, None),
        Some("max_tokens") => (FinishReason::Length, None),
        Some("refusal") => (FinishReason::ContentFilter, None),
        Some(other) => (
            FinishReason::Stop,
            Some(format!("unmapped stop_reason '{other}'")),
        ),
        None => (FinishReason::Stop, None),
    }
}

fn parse_usage(value: &Value) -> Usage {
    let Some(usage) = value.get("usage") else {
        return Usage::default();
    };
    let field = |name: &str| usage.get(name).and_then(Value::as_u64);
    let input_tokens = field("input_tokens").unwrap_or(0);
    let output_tokens = field("output_tokens").unwrap_or(0);
    Usage {
        input_tokens,
        output_tokens,
        total_tokens: input_tokens.saturating_add(output_tokens),
        cache_read_tokens: field("cache_read_input_tokens"),
        cache_write_tokens: field("cache_creation_input_tokens"),
        reasoning_tokens: None,
    }
}

// ---------------------------------------------------------------------------
// SSE stream decoding
// ---------------------------------------------------------------------------

/// Tracks per-index block identity across the Anthropic event sequence.
#[derive(Default)]
struct StreamState {
    block_ids: HashMap<u64, String>,
    usage: Usage,
    stop_reason: Option<FinishReason>,
}

impl StreamState {
    /// Translate one Anthropic SSE data payload into SCRI stream events.
    fn ingest(&mut self, data: &str) -> Vec<StreamEvent> {
        let Ok(value) = serde_json::from_str::<Value>(data) else {
            warn!("undecodable anthropic stream frame");
            return vec![StreamEvent::Finish {
                reason: FinishReason::Error,
                error: Some(StreamFailure {
                    kind: ErrorKind::StreamFormatDrift.as_str().to_owned(),
                    message: "undecodable stream frame".to_owned(),
                }),
            }];
        };

        let event_type = value.get("type").and_then(Value::as_str).unwrap_or_default();
        match event_type {
            "message_start" => {
                if let Some(message) = value.get("message") {
                    self.usage = parse_usage(message);
                }
                Vec::new()
            }
            "content_block_start" => self.on_block_start(&value),
            "content_block_delta" => self.on_block_delta(&value),
            "content_block_stop" => {
                let index = value.get("index").and_then(Value::as_u64).unwrap_or(0);
                match self.block_ids.remove(&index) {
                    Some(id) => vec![StreamEvent::ToolCallEnd { id }],
                    None => Vec::new(),
                }
            }
            "message_delta" => {
                if let Some(stop) = value
                    .get("delta")
                    .and_then(|d| d.get("stop_reason"))
                    .and_then(Value::as_str)
                {
                    self.stop_reason = Some(map_stop_reason(Some(stop)).0);
                }
                if let Some(output) = value
                    .get("usage")
                    .and_then(|u| u.get("output_tokens"))
                    .and_then(Value::as_u64)
                {
                    self.usage.output_tokens = output;
                    self.usage.total_tokens = self.usage.input_tokens.saturating_add(output);
                }
                vec![StreamEvent::Usage { usage: self.usage }]
            }
            "message_stop" => vec![StreamEvent::Finish {
                reason: self.stop_reason.unwrap_or(FinishReason::Stop),
                error: None,
            }],
            "error" => {
                let message = value
                    .get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or("provider stream error");
                vec![StreamEvent::Finish {
                    reason: FinishReason::Error,
                    error: Some(StreamFailure {
                        kind: ErrorKind::Transient.as_str().to_owned(),
                        message: super::sanitize_error_body(message),
                    }),
                }]
            }
            "ping" => Vec::new(),
            other => {
                debug!(event_type = other, "unmapped anthropic stream event");
                Vec::new()
            }
        }
    }

    fn on_block_start(&mut self, value: &Value) -> Vec<StreamEvent> {
        let index = value.get("index").and_then(Value::as_u64).unwrap_or(0);
        let Some(block) = value.get("content_block") else {
            return Vec::new();
        };
        if block.get("type").and_then(Value::as_str) == Some("tool_use") {
            let id = block
                .get("id")
                .and_then(Value::as_str)
                .map_or_else(crate::scri::generate_call_id, ToOwned::to_owned);
            let name = block
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned();
            self.block_ids.insert(index, id.clone());
            return vec![StreamEvent::ToolCallStart { id, name }];
        }
        Vec::new()
    }

    fn on_block_delta(&mut self, value: &Value) -> Vec<StreamEvent> {
        let index = value.get("index").and_then(Value::as_u64).unwrap_or(0);
        let Some(delta) = value.get("delta") else {
            return Vec::new();
        };
        match delta.get("type").and_then(Value::as_str) {
            Some("text_delta") => {
                let text = delta.get("text").and_then(Value::as_str).unwrap_or_default();
                vec![StreamEvent::TextDelta {
                    text: text.to_owned(),
                }]
            }
            Some("thinking_delta") => {
                let text = delta
                    .get("thinking")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                vec![StreamEvent::ThinkingDelta {
                    text: text.to_owned(),
                }]
            }
            Some("input_json_delta") => {
                let fragment = delta
                    .get("partial_json")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                match self.block_ids.get(&index) {
                    Some(id) => vec![StreamEvent::ToolCallArgDelta {
                        id: id.clone(),
                        delta: fragment.to_owned(),
                    }],
                    None => Vec::new(),
                }
            }
            _ => Vec::new(),
        }
    }
}
