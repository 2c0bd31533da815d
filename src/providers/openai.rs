//! OpenAI-compatible adapter for the `/v1/chat/completions` API.
//!
//! Serves both the `openai` and `xai` providers; they share a wire format
//! and differ only in base URL, credential, and provider name.

use std::collections::HashMap;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::debug;

use crate::scri::{
    ChatRequest, ChatResponse, ContentBlock, EmbeddingRequest, EmbeddingResponse, FinishReason,
    ImageSource, Message, MessageContent, ModelCapabilities, Role, StreamEvent, StreamFailure,
    ToolCall, ToolChoice, ToolDefinition, Usage,
};

use super::{
    check_http_response, AdapterError, ErrorKind, ProviderAdapter, SseDecoder,
    STREAM_CHANNEL_CAPACITY,
};

/// Default base URL for the `openai` provider.
pub const OPENAI_API_BASE: &str = "https://api.openai.com";
/// Default base URL for the `xai` provider.
pub const XAI_API_BASE: &str = "https://api.x.ai";

// ---------------------------------------------------------------------------
// Wire types (pub for integration testing)
// ---------------------------------------------------------------------------

/// Chat completions request body.
#[doc(hidden)]
#[derive(Debug, Serialize)]
pub struct WireRequest {
    /// Model identifier.
    pub model: String,
    /// Conversation messages.
    pub messages: Vec<Value>,
    /// Tool definitions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Value>,
    /// Tool selection policy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    /// Maximum completion tokens.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Sampling temperature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Nucleus sampling parameter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    /// Whether to stream the response.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
}

/// Chat completions response body.
#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct WireResponse {
    /// Response identifier.
    #[serde(default)]
    pub id: String,
    /// Response choices.
    pub choices: Vec<WireChoice>,
    /// Model that served the response.
    #[serde(default)]
    pub model: String,
    /// Token usage.
    pub usage: Option<WireUsage>,
}

/// A response choice.
#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct WireChoice {
    /// Assistant message for this choice.
    pub message: WireResponseMessage,
    /// Why generation stopped.
    pub finish_reason: Option<String>,
}

/// Assistant message payload.
#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct WireResponseMessage {
    /// Optional text content.
    pub content: Option<String>,
    /// Optional tool calls.
    pub tool_calls: Option<Vec<WireToolCall>>,
}

/// A tool call in wire format.
#[doc(hidden)]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireToolCall {
    /// Unique call identifier.
    pub id: String,
    /// Function call payload.
    pub function: WireFunctionCall,
}

/// Function payload in wire tool calls.
#[doc(hidden)]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireFunctionCall {
    /// Function name.
    pub name: String,
    /// Function arguments encoded as a JSON string.
    pub arguments: String,
}

/// Usage statistics.
#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct WireUsage {
    /// Prompt token count.
    pub prompt_tokens: Option<u64>,
    /// Completion token count.
    pub completion_tokens: Option<u64>,
    /// Nested completion detail counters.
    pub completion_tokens_details: Option<WireUsageDetails>,
}

/// Nested usage detail counters.
#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct WireUsageDetails {
    /// Reasoning token count.
    pub reasoning_tokens: Option<u64>,
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// Chat-completions adapter shared by the OpenAI-compatible family.
#[derive(Debug, Clone)]
pub struct OpenAiAdapter {
    provider: String,
    model_name: String,
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAiAdapter {
    /// Create an adapter for the `openai` provider.
    pub fn new(model_name: String, api_key: String) -> Self {
        Self::for_provider(
            "openai".to_owned(),
            model_name,
            api_key,
            OPENAI_API_BASE.to_owned(),
        )
    }

    /// Create an adapter for any OpenAI-compatible provider.
    pub fn for_provider(
        provider: String,
        model_name: String,
        api_key: String,
        base_url: String,
    ) -> Self {
        Self {
            provider,
            model_name,
            api_key,
            base_url,
            client: reqwest::Client::new(),
        }
    }

    /// Concrete model for a call: the router writes the resolved model into
    /// the request; an empty model falls back to this instance's default.
    fn target_model<'a>(&'a self, model: &'a str) -> &'a str {
        if model.is_empty() {
            &self.model_name
        } else {
            model
        }
    }

    fn post_json(&self, path: &str, body: &impl Serialize) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}{path}", self.base_url))
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {}", self.api_key))
            .json(body)
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for OpenAiAdapter {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, AdapterError> {
        let body = build_request(self.target_model(&request.model), request, false);
        let response = self.post_json("/v1/chat/completions", &body).send().await?;
        let payload = check_http_response(response).await?;
        parse_response(&self.provider, &payload)
    }

    async fn chat_stream(
        &self,
        request: &ChatRequest,
    ) -> Result<mpsc::Receiver<StreamEvent>, AdapterError> {
        let body = build_request(self.target_model(&request.model), request, true);
        let response = self.post_json("/v1/chat/completions", &body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AdapterError::from_status(status.as_u16(), &text));
        }

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let mut byte_stream = response.bytes_stream();

        tokio::spawn(async move {
            let mut decoder = SseDecoder::default();
            let mut state = DeltaState::default();

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

    async fn embed(&self, request: &EmbeddingRequest) -> Result<EmbeddingResponse, AdapterError> {
        let body = json!({
            "model": self.target_model(&request.model),
            "input": request.inputs,
        });
        let response = self.post_json("/v1/embeddings", &body).send().await?;
        let payload = check_http_response(response).await?;
        parse_embeddings(&self.provider, &self.model_name, &payload)
    }

    fn list_models(&self) -> Vec<ModelCapabilities> {
        vec![ModelCapabilities {
            provider: self.provider.clone(),
            model: self.model_name.clone(),
            supports_tools: true,
            supports_streaming: true,
            supports_embeddings: self.provider == "openai",
            supports_search: true,
            context_window: Some(128_000),
        }]
    }

    async fn health_check(&self) -> Result<(), AdapterError> {
        let response = self
            .client
            .get(format!("{}/v1/models", self.base_url))
            .header("authorization", format!("Bearer {}", self.api_key))
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
        &self.provider
    }

    fn model_id(&self) -> &str {
        &self.model_name
    }
}

// ---------------------------------------------------------------------------
// SCRI -> wire
// ---------------------------------------------------------------------------

/// Build a chat completions request body.
#[doc(hidden)]
pub fn build_request(model: &str, request: &ChatRequest, stream: bool) -> WireRequest {
    let tools = if request.tools.is_empty() {
        None
    } else {
        Some(convert_tools(&request.tools))
    };

    let tool_choice = request.tool_choice.as_ref().map(|choice| match choice {
        ToolChoice::Auto => json!("auto"),
        ToolChoice::None => json!("none"),
        ToolChoice::Any => json!("required"),
        ToolChoice::Tool { name } => json!({"type": "function", "function": {"name": name}}),
    });

    WireRequest {
        model: model.to_owned(),
        messages: convert_messages(&request.messages)
            .as_array()
            .cloned()
            .unwrap_or_default(),
        tools,
        tool_choice,
        max_tokens: request.max_tokens,
        temperature: request.temperature,
        top_p: request.top_p,
        stream,
    }
}

/// Translate SCRI messages into the chat-completions `messages` array.
///
/// Assistant tool-use blocks become the `tool_calls` array; tool-result
/// blocks become separate `tool`-role messages; thinking blocks are dropped
/// (the format has no slot for them).
#[doc(hidden)]
pub fn convert_messages(messages: &[Message]) -> Value {
    let mut converted: Vec<Value> = Vec::new();

    for message in messages {
        match &message.content {
            MessageContent::Text(text) => {
                converted.push(json!({
                    "role": wire_role(message.role),
                    "content": text,
                }));
            }
            MessageContent::Blocks(blocks) => {
                let mut content_parts: Vec<Value> = Vec::new();
                let mut tool_calls: Vec<Value> = Vec::new();
                let mut tool_results: Vec<(String, String)> = Vec::new();

                for block in blocks {
                    match block {
                        ContentBlock::Text { text } => {
                            content_parts.push(json!({"type": "text", "text": text}));
                        }
                        ContentBlock::Image { source } => {
                            let url = match source {
                                ImageSource::Base64 { media_type, data } => {
                                    format!("data:{media_type};base64,{data}")
                                }
                                ImageSource::Uri { uri } => uri.clone(),
                            };
                            content_parts
                                .push(json!({"type": "image_url", "image_url": {"url": url}}));
                        }
                        ContentBlock::ToolUse { id, name, input } => {
                            let arguments =
                                serde_json::to_string(input).unwrap_or_else(|_| "{}".to_owned());
                            tool_calls.push(json!({
                                "id": id,
                                "type": "function",
                                "function": {"name": name, "arguments": arguments},
                            }));
                        }
                        ContentBlock::ToolResult {
                            tool_use_id,
                            content,
                            ..
                        } => {
                            tool_results.push((tool_use_id.clone(), content.clone()));
                        }
                        ContentBlock::Thinking { .. } => {}
                    }
                }

                if !content_parts.is_empty() || !tool_calls.is_empty() {
                    let mut entry = json!({"role": wire_role(message.role)});
                    entry["content"] = if content_parts.is_empty() {
                        Value::Null
                    } else {
                        Value::Array(content_parts)
                    };
                    if !tool_calls.is_empty() {
                        entry["tool_calls"] = Value::Array(tool_calls);
                    }
                    converted.push(entry);
                }

                for (tool_use_id, content) in tool_results {
                    converted.push(json!({
                        "role": "tool",
                        "content": content,
                        "tool_call_id": tool_use_id,
                    }));
                }
            }
        }
    }

    Value::Array(converted)
}

fn wire_role(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

/// Translate SCRI tool definitions into function wrappers.
#[doc(hidden)]
pub fn convert_tools(tools: &[ToolDefinition]) -> Value {
    let converted: Vec<Value> = tools
        .iter()
        .map(|tool| {
            json!({
                "type": "function",
                "function": {
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.parameters,
                }
            })
        })
        .collect();
    Value::Array(converted)
}

// ---------------------------------------------------------------------------
// Wire -> SCRI
// ---------------------------------------------------------------------------

/// Parse a non-streaming chat completions response into SCRI.
///
/// # Errors
///
/// Returns `schema_mismatch` when `choices[0]` is absent and
/// `tool_schema_drift` when tool-call arguments are not valid JSON.
#[doc(hidden)]
pub fn parse_response(provider: &str, body: &str) -> Result<ChatResponse, AdapterError> {
    let resp: WireResponse = serde_json::from_str(body).map_err(|e| {
        AdapterError::schema_mismatch(format!("undecodable response: {e}"))
            .with_details(super::sanitize_error_body(body))
    })?;

    let choice = resp
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| AdapterError::schema_mismatch("missing choices[0]"))?;

    let mut drift = Vec::new();
    let mut content: Vec<ContentBlock> = Vec::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();

    if let Some(text) = choice.message.content {
        if !text.is_empty() {
            content.push(ContentBlock::Text { text });
        }
    }

    if let Some(calls) = choice.message.tool_calls {
        for call in calls {
            let arguments =
                serde_json::from_str::<Value>(&call.function.arguments).map_err(|e| {
                    AdapterError::new(
                        ErrorKind::ToolSchemaDrift,
                        format!("tool call '{}' has undecodable arguments: {e}", call.function.name),
                    )
                })?;
            content.push(ContentBlock::ToolUse {
                id: call.id.clone(),
                name: call.function.name.clone(),
                input: arguments.clone(),
            });
            tool_calls.push(ToolCall {
                id: call.id,
                name: call.function.name,
                arguments,
            });
        }
    }

    if content.is_empty() {
        return Err(AdapterError::schema_mismatch("response has no content")
            .with_details(super::sanitize_error_body(body)));
    }

    let finish_reason = match choice.finish_reason.as_deref() {
        Some("stop") | None => FinishReason::Stop,
        Some("tool_calls") => FinishReason::ToolCalls,
        Some("length") => FinishReason::Length,
        Some("content_filter") => FinishReason::ContentFilter,
        Some(other) => {
            drift.push(format!("unmapped finish_reason '{other}'"));
            FinishReason::Stop
        }
    };

    let usage = map_usage(resp.usage.as_ref());

    Ok(ChatResponse {
        id: resp.id,
        model: resp.model,
        provider: provider.to_owned(),
        content,
        tool_calls,
        finish_reason,
        usage,
        lineage: None,
        drift,
    })
}

fn map_usage(wire: Option<&WireUsage>) -> Usage {
    let Some(wire) = wire else {
        return Usage::default();
    };
    let input = wire.prompt_tokens.unwrap_or(0);
    let output = wire.completion_tokens.unwrap_or(0);
    Usage {
        input_tokens: input,
        output_tokens: output,
        total_tokens: input.saturating_add(output),
        cache_read_tokens: None,
        cache_write_tokens: None,
        reasoning_tokens: wire
            .completion_tokens_details
            .as_ref()
            .and_then(|d| d.reasoning_tokens),
    }
}

fn parse_embeddings(
    provider: &str,
    model: &str,
    body: &str,
) -> Result<EmbeddingResponse, AdapterError> {
    let parsed: Value = serde_json::from_str(body)
        .map_err(|e| AdapterError::schema_mismatch(format!("undecodable embeddings: {e}")))?;

    let Some(data) = parsed.get("data").and_then(Value::as_array) else {
        return Err(AdapterError::schema_mismatch("missing embeddings data array"));
    };

    let mut embeddings = Vec::with_capacity(data.len());
    for item in data {
        let Some(vector) = item.get("embedding").and_then(Value::as_array) else {
            return Err(AdapterError::schema_mismatch("embedding entry missing vector"));
        };
        let floats: Vec<f32> = vector
            .iter()
            .filter_map(Value::as_f64)
            .map(|v| {
                #[allow(clippy::cast_possible_truncation)]
                let narrowed = v as f32;
                narrowed
            })
            .collect();
        embeddings.push(floats);
    }

    let input_tokens = parsed
        .get("usage")
        .and_then(|u| u.get("prompt_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(0);

    Ok(EmbeddingResponse {
        model: parsed
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or(model)
            .to_owned(),
        provider: provider.to_owned(),
        embeddings,
        usage: Usage::from_counts(input_tokens, 0),
    })
}

// ---------------------------------------------------------------------------
// Stream delta assembly
// ---------------------------------------------------------------------------

/// Tracks tool-call identity across chat-completions delta frames.
#[derive(Default)]
struct DeltaState {
    call_ids: HashMap<u64, String>,
    open_calls: Vec<String>,
    finish: Option<FinishReason>,
    usage: Option<Usage>,
}

impl DeltaState {
    /// Translate one SSE data payload into SCRI stream events.
    fn ingest(&mut self, data: &str) -> Vec<StreamEvent> {
        if data == "[DONE]" {
            let mut events: Vec<StreamEvent> = self
                .open_calls
                .drain(..)
                .map(|id| StreamEvent::ToolCallEnd { id })
                .collect();
            if let Some(usage) = self.usage.take() {
                events.push(StreamEvent::Usage { usage });
            }
            events.push(StreamEvent::Finish {
                reason: self.finish.unwrap_or(FinishReason::Stop),
                error: None,
            });
            return events;
        }

        let Ok(value) = serde_json::from_str::<Value>(data) else {
            return vec![StreamEvent::Finish {
                reason: FinishReason::Error,
                error: Some(StreamFailure {
                    kind: ErrorKind::StreamFormatDrift.as_str().to_owned(),
                    message: "undecodable stream frame".to_owned(),
                }),
            }];
        };

        let mut events = Vec::new();

        if let Some(usage) = value.get("usage").filter(|u| !u.is_null()) {
            let input = usage
                .get("prompt_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            let output = usage
                .get("completion_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            self.usage = Some(Usage::from_counts(input, output));
        }

        let Some(choice) = value
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|c| c.first())
        else {
            return events;
        };

        if let Some(delta) = choice.get("delta") {
            if let Some(text) = delta.get("content").and_then(Value::as_str) {
                if !text.is_empty() {
                    events.push(StreamEvent::TextDelta {
                        text: text.to_owned(),
                    });
                }
            }
            if let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) {
                for call in calls {
                    events.extend(self.on_tool_delta(call));
                }
            }
        }

        if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
            self.finish = Some(match reason {
                "stop" => FinishReason::Stop,
                "tool_calls" => FinishReason::ToolCalls,
                "length" => FinishReason::Length,
                "content_filter" => FinishReason::ContentFilter,
                other => {
                    debug!(finish_reason = other, "unmapped stream finish_reason");
                    FinishReason::Stop
                }
            });
        }

        events
    }

    fn on_tool_delta(&mut self, call: &Value) -> Vec<StreamEvent> {
        let index = call.get("index").and_then(Value::as_u64).unwrap_or(0);
        let mut events = Vec::new();

        if let Some(name) = call
            .get("function")
            .and_then(|f| f.get("name"))
            .and_then(Value::as_str)
        {
            let id = call
                .get("id")
                .and_then(Value::as_str)
                .map_or_else(crate::scri::generate_call_id, ToOwned::to_owned);
            self.call_ids.insert(index, id.clone());
            self.open_calls.push(id.clone());
            events.push(StreamEvent::ToolCallStart {
                id,
                name: name.to_owned(),
            });
        }

        if let Some(fragment) = call
            .get("function")
            .and_then(|f| f.get("arguments"))
            .and_then(Value::as_str)
        {
            if !fragment.is_empty() {
                if let Some(id) = self.call_ids.get(&index) {
                    events.push(StreamEvent::ToolCallArgDelta {
                        id: id.clone(),
                        delta: fragment.to_owned(),
                    });
                }
            }
        }

        events
    }
}
