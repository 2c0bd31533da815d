//! Ollama adapter for the local `/api/chat` API.
//!
//! The local provider carries no credential; the endpoint comes from config.

use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::scri::{
    generate_call_id, ChatRequest, ChatResponse, ContentBlock, EmbeddingRequest,
    EmbeddingResponse, FinishReason, ImageSource, Message, MessageContent, ModelCapabilities,
    Role, StreamEvent, StreamFailure, ToolCall, ToolDefinition, Usage,
};

use super::{
    check_http_response, AdapterError, ErrorKind, ProviderAdapter, STREAM_CHANNEL_CAPACITY,
};

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:11434";

/// Ollama chat API adapter.
#[derive(Debug, Clone)]
pub struct OllamaAdapter {
    model_name: String,
    base_url: String,
    client: reqwest::Client,
}

impl OllamaAdapter {
    /// Create an adapter for a model on the default local endpoint.
    pub fn new(model_name: String) -> Self {
        Self::with_base_url(model_name, DEFAULT_BASE_URL.to_owned())
    }

    /// Create an adapter against a specific Ollama endpoint.
    pub fn with_base_url(model_name: String, base_url: String) -> Self {
        Self {
            model_name,
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

    fn request_body(&self, request: &ChatRequest, stream: bool) -> Value {
        let mut options = json!({});
        if let Some(temperature) = request.temperature {
            options["temperature"] = json!(temperature);
        }
        if let Some(top_p) = request.top_p {
            options["top_p"] = json!(top_p);
        }
        if let Some(max_tokens) = request.max_tokens {
            options["num_predict"] = json!(max_tokens);
        }

        let mut body = json!({
            "model": self.target_model(&request.model),
            "messages": convert_messages(&request.messages),
            "stream": stream,
            "options": options,
        });
        if !request.tools.is_empty() {
            body["tools"] = convert_tools(&request.tools);
        }
        body
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for OllamaAdapter {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, AdapterError> {
        let body = self.request_body(request, false);
        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;
        let payload = check_http_response(response).await?;
        parse_response(&self.model_name, &payload)
    }

    async fn chat_stream(
        &self,
        request: &ChatRequest,
    ) -> Result<mpsc::Receiver<StreamEvent>, AdapterError> {
        let body = self.request_body(request, true);
        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AdapterError::from_status(status.as_u16(), &text));
        }

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let mut byte_stream = response.bytes_stream();

        tokio::spawn(async move {
            let mut buffer = String::new();
            let mut finished = false;

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

                buffer.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(newline) = buffer.find('\n') {
                    let line: String = buffer.drain(..=newline).collect();
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    for event in ingest_stream_line(line) {
                        let terminal = matches!(event, StreamEvent::Finish { .. });
                        if tx.send(event).await.is_err() {
                            return;
                        }
                        if terminal {
                            finished = true;
                        }
                    }
                    if finished {
                        return;
                    }
                }
            }

            if !finished {
                let _ = tx
                    .send(StreamEvent::Finish {
                        reason: FinishReason::Error,
                        error: Some(StreamFailure {
                            kind: ErrorKind::StreamFormatDrift.as_str().to_owned(),
                            message: "stream ended without done frame".to_owned(),
                        }),
                    })
                    .await;
            }
        });

        Ok(rx)
    }

    async fn embed(&self, request: &EmbeddingRequest) -> Result<EmbeddingResponse, AdapterError> {
        let body = json!({
            "model": self.target_model(&request.model),
            "input": request.inputs,
        });
        let response = self
            .client
            .post(format!("{}/api/embed", self.base_url))
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;
        let payload = check_http_response(response).await?;

        let parsed: Value = serde_json::from_str(&payload)
            .map_err(|e| AdapterError::schema_mismatch(format!("undecodable embeddings: {e}")))?;
        let Some(entries) = parsed.get("embeddings").and_then(Value::as_array) else {
            return Err(AdapterError::schema_mismatch("missing embeddings array"));
        };

        let mut embeddings = Vec::with_capacity(entries.len());
        for entry in entries {
            let Some(values) = entry.as_array() else {
                return Err(AdapterError::schema_mismatch("embedding entry is not an array"));
            };
            embeddings.push(
                values
                    .iter()
                    .filter_map(Value::as_f64)
                    .map(|v| {
                        #[allow(clippy::cast_possible_truncation)]
                        let narrowed = v as f32;
                        narrowed
                    })
                    .collect(),
            );
        }

        let input_tokens = parsed
            .get("prompt_eval_count")
            .and_then(Value::as_u64)
            .unwrap_or(0);

        Ok(EmbeddingResponse {
            model: self.model_name.clone(),
            provider: "ollama".to_owned(),
            embeddings,
            usage: Usage::from_counts(input_tokens, 0),
        })
    }

    fn list_models(&self) -> Vec<ModelCapabilities> {
        vec![ModelCapabilities {
            provider: "ollama".to_owned(),
            model: self.model_name.clone(),
            supports_tools: true,
            supports_streaming: true,
            supports_embeddings: true,
            supports_search: false,
            context_window: None,
        }]
    }

    async fn health_check(&self) -> Result<(), AdapterError> {
        let response = self
            .client
            .get(format!("{}/api/tags", self.base_url))
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
        "ollama"
    }

    fn model_id(&self) -> &str {
        &self.model_name
    }
}

// ---------------------------------------------------------------------------
// SCRI -> wire
// ---------------------------------------------------------------------------

/// Translate SCRI messages into the Ollama `messages` array.
///
/// Image blocks ride the per-message `images` list as raw base64; URI images
/// cannot be expressed and are dropped. Tool-use blocks become `tool_calls`;
/// tool results become `tool`-role messages.
#[doc(hidden)]
pub fn convert_messages(messages: &[Message]) -> Value {
    let mut converted: Vec<Value> = Vec::new();

    for message in messages {
        match &message.content {
            MessageContent::Text(text) => converted.push(json!({
                "role": wire_role(message.role),
                "content": text,
            })),
            MessageContent::Blocks(blocks) => {
                let mut text_parts: Vec<&str> = Vec::new();
                let mut images: Vec<&str> = Vec::new();
                let mut tool_calls: Vec<Value> = Vec::new();
                let mut tool_results: Vec<&str> = Vec::new();

                for block in blocks {
                    match block {
                        ContentBlock::Text { text } => text_parts.push(text),
                        ContentBlock::Image {
                            source: ImageSource::Base64 { data, .. },
                        } => images.push(data),
                        ContentBlock::Image {
                            source: ImageSource::Uri { .. },
                        } => {}
                        ContentBlock::ToolUse { name, input, .. } => {
                            tool_calls.push(json!({
                                "function": {"name": name, "arguments": input},
                            }));
                        }
                        ContentBlock::ToolResult { content, .. } => tool_results.push(content),
                        ContentBlock::Thinking { .. } => {}
                    }
                }

                if !text_parts.is_empty() || !images.is_empty() || !tool_calls.is_empty() {
                    let mut entry = json!({
                        "role": wire_role(message.role),
                        "content": text_parts.join(""),
                    });
                    if !images.is_empty() {
                        entry["images"] = json!(images);
                    }
                    if !tool_calls.is_empty() {
                        entry["tool_calls"] = Value::Array(tool_calls);
                    }
                    converted.push(entry);
                }

                for result in tool_results {
                    converted.push(json!({"role": "tool", "content": result}));
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

/// Translate SCRI tool definitions into Ollama function wrappers.
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

/// Parse a non-streaming chat response into SCRI.
///
/// # Errors
///
/// Returns `schema_mismatch` when the message envelope is absent.
#[doc(hidden)]
pub fn parse_response(model: &str, body: &str) -> Result<ChatResponse, AdapterError> {
    let parsed: Value = serde_json::from_str(body).map_err(|e| {
        AdapterError::schema_mismatch(format!("undecodable response: {e}"))
            .with_details(super::sanitize_error_body(body))
    })?;

    let Some(message) = parsed.get("message") else {
        return Err(AdapterError::schema_mismatch("missing message envelope")
            .with_details(super::sanitize_error_body(body)));
    };

    let mut content = Vec::new();
    let mut tool_calls = Vec::new();

    let text = message
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if !text.is_empty() {
        content.push(ContentBlock::Text {
            text: text.to_owned(),
        });
    }

    if let Some(thinking) = message.get("thinking").and_then(Value::as_str) {
        if !thinking.is_empty() {
            content.push(ContentBlock::Thinking {
                text: thinking.to_owned(),
                signature: None,
            });
        }
    }

    for call in message
        .get("tool_calls")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
    {
        let function = call.get("function").cloned().unwrap_or(Value::Null);
        let name = function
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                AdapterError::new(ErrorKind::ToolSchemaDrift, "tool call missing function.name")
            })?
            .to_owned();
        let arguments = function.get("arguments").cloned().unwrap_or(Value::Null);
        let id = generate_call_id();
        content.push(ContentBlock::ToolUse {
            id: id.clone(),
            name: name.clone(),
            input: arguments.clone(),
        });
        tool_calls.push(ToolCall {
            id,
            name,
            arguments,
        });
    }

    if content.is_empty() {
        return Err(AdapterError::schema_mismatch("response has no content")
            .with_details(super::sanitize_error_body(body)));
    }

    let finish_reason = match parsed.get("done_reason").and_then(Value::as_str) {
        Some("length") => FinishReason::Length,
        _ if !tool_calls.is_empty() => FinishReason::ToolCalls,
        _ => FinishReason::Stop,
    };

    Ok(ChatResponse {
        id: generate_call_id(),
        model: parsed
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or(model)
            .to_owned(),
        provider: "ollama".to_owned(),
        content,
        tool_calls,
        finish_reason,
        usage: parse_usage(&parsed),
        lineage: None,
        drift: Vec::new(),
    })
}

fn parse_usage(value: &Value) -> Usage {
    let input = value
        .get("prompt_eval_count")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let output = value.get("eval_count").and_then(Value::as_u64).unwrap_or(0);
    Usage::from_counts(input, output)
}

/// Translate one NDJSON stream line into SCRI events.
fn ingest_stream_line(line: &str) -> Vec<StreamEvent> {
    let Ok(value) = serde_json::from_str::<Value>(line) else {
        return vec![StreamEvent::Finish {
            reason: FinishReason::Error,
            error: Some(StreamFailure {
                kind: ErrorKind::StreamFormatDrift.as_str().to_owned(),
                message: "undecodable stream line".to_owned(),
            }),
        }];
    };

    let mut events = Vec::new();
    let mut saw_tool_call = false;

    if let Some(message) = value.get("message") {
        if let Some(text) = message.get("content").and_then(Value::as_str) {
            if !text.is_empty() {
                events.push(StreamEvent::TextDelta {
                    text: text.to_owned(),
                });
            }
        }
        if let Some(thinking) = message.get("thinking").and_then(Value::as_str) {
            if !thinking.is_empty() {
                events.push(StreamEvent::ThinkingDelta {
                    text: thinking.to_owned(),
                });
            }
        }
        if let Some(calls) = message.get("tool_calls").and_then(Value::as_array) {
            for call in calls {
                let function = call.get("function").cloned().unwrap_or(Value::Null);
                let name = function
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned();
                let arguments = function.get("arguments").cloned().unwrap_or(Value::Null);
                let id = generate_call_id();
                saw_tool_call = true;
                events.push(StreamEvent::ToolCallStart {
                    id: id.clone(),
                    name,
                });
                events.push(StreamEvent::ToolCallArgDelta {
                    id: id.clone(),
                    delta: arguments.to_string(),
                });
                events.push(StreamEvent::ToolCallEnd { id });
            }
        }
    }

    if value.get("done").and_then(Value::as_bool).unwrap_or(false) {
        let usage = parse_usage(&value);
        if usage != Usage::default() {
            events.push(StreamEvent::Usage { usage });
        }
        let reason = match value.get("done_reason").and_then(Value::as_str) {
            Some("length") => FinishReason::Length,
            _ if saw_tool_call => FinishReason::ToolCalls,
            _ => FinishReason::Stop,
        };
        events.push(StreamEvent::Finish {
            reason,
            error: None,
        });
    }

    events
}
