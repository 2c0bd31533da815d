//! Google adapter for the Gemini `generateContent` API.

use std::collections::HashMap;

use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::debug;

use crate::scri::{
    generate_call_id, ChatRequest, ChatResponse, ContentBlock, EmbeddingRequest,
    EmbeddingResponse, FinishReason, ImageSource, Message, MessageContent, ModelCapabilities,
    Role, StreamEvent, StreamFailure, ToolCall, ToolDefinition, Usage,
};

use super::{
    check_http_response, AdapterError, ErrorKind, ProviderAdapter, SseDecoder,
    STREAM_CHANNEL_CAPACITY,
};

const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com";

/// Gemini generateContent adapter.
#[derive(Debug, Clone)]
pub struct GoogleAdapter {
    model_name: String,
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl GoogleAdapter {
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
    fn target_model<'a>(&'a self, model: &'a str) -> &'a str {
        if model.is_empty() {
            &self.model_name
        } else {
            model
        }
    }

    fn request_body(&self, request: &ChatRequest) -> Value {
        let mut body = json!({
            "contents": convert_messages(&request.messages),
        });

        let system: Vec<String> = request
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.text())
            .collect();
        if !system.is_empty() {
            body["systemInstruction"] = json!({"parts": [{"text": system.join("\n")}]});
        }

        if !request.tools.is_empty() {
            body["tools"] = convert_tools(&request.tools);
        }

        let mut generation = json!({});
        if let Some(temperature) = request.temperature {
            generation["temperature"] = json!(temperature);
        }
        if let Some(top_p) = request.top_p {
            generation["topP"] = json!(top_p);
        }
        if let Some(max_tokens) = request.max_tokens {
            generation["maxOutputTokens"] = json!(max_tokens);
        }
        if generation.as_object().is_some_and(|o| !o.is_empty()) {
            body["generationConfig"] = generation;
        }

        body
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for GoogleAdapter {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, AdapterError> {
        let body = self.request_body(request);
        let url = format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.base_url,
            self.target_model(&request.model),
            self.api_key
        );
        let response = self
            .client
            .post(url)
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
        let body = self.request_body(request);
        let url = format!(
            "{}/v1beta/models/{}:streamGenerateContent?alt=sse&key={}",
            self.base_url,
            self.target_model(&request.model),
            self.api_key
        );
        let response = self
            .client
            .post(url)
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
            let mut decoder = SseDecoder::default();
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

                for data in decoder.feed(&chunk) {
                    for event in ingest_stream_frame(&data) {
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
                            message: "stream ended without finishReason".to_owned(),
                        }),
                    })
                    .await;
            }
        });

        Ok(rx)
    }

    async fn embed(&self, request: &EmbeddingRequest) -> Result<EmbeddingResponse, AdapterError> {
        let model = self.target_model(&request.model).to_owned();
        let model_path = format!("models/{model}");
        let requests: Vec<Value> = request
            .inputs
            .iter()
            .map(|input| {
                json!({
                    "model": model_path,
                    "content": {"parts": [{"text": input}]},
                })
            })
            .collect();

        let url = format!(
            "{}/v1beta/models/{model}:batchEmbedContents?key={}",
            self.base_url, self.api_key
        );
        let response = self
            .client
            .post(url)
            .header("content-type", "application/json")
            .json(&json!({"requests": requests}))
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
            let Some(values) = entry.get("values").and_then(Value::as_array) else {
                return Err(AdapterError::schema_mismatch("embedding entry missing values"));
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

        Ok(EmbeddingResponse {
            model,
            provider: "google".to_owned(),
            embeddings,
            usage: Usage::default(),
        })
    }

    fn list_models(&self) -> Vec<ModelCapabilities> {
        vec![ModelCapabilities {
            provider: "google".to_owned(),
            model: self.model_name.clone(),
            supports_tools: true,
            supports_streaming: true,
            supports_embeddings: true,
            supports_search: true,
            context_window: Some(1_000_000),
        }]
    }

    async fn health_check(&self) -> Result<(), AdapterError> {
        let url = format!(
            "{}/v1beta/models?pageSize=1&key={}",
            self.base_url, self.api_key
        );
        let response = self.client.get(url).send().await?;
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
        "google"
    }

    fn model_id(&self) -> &str {
        &self.model_name
    }
}

// ---------------------------------------------------------------------------
// SCRI -> wire
// ---------------------------------------------------------------------------

/// Translate SCRI messages into the Gemini `contents` array.
///
/// Gemini references tool results by function name rather than call id, so
/// tool-result blocks are resolved against tool-use ids seen earlier in the
/// same conversation.
#[doc(hidden)]
pub fn convert_messages(messages: &[Message]) -> Value {
    let mut call_names: HashMap<String, String> = HashMap::new();
    let mut contents: Vec<Value> = Vec::new();

    for message in messages {
        if message.role == Role::System {
            continue;
        }

        let parts: Vec<Value> = match &message.content {
            MessageContent::Text(text) => vec![json!({"text": text})],
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .map(|block| convert_block(block, &mut call_names))
                .collect(),
        };

        contents.push(json!({
            "role": wire_role(message.role),
            "parts": parts,
        }));
    }

    Value::Array(contents)
}

fn wire_role(role: Role) -> &'static str {
    match role {
        Role::Assistant => "model",
        Role::System | Role::User | Role::Tool => "user",
    }
}

fn convert_block(block: &ContentBlock, call_names: &mut HashMap<String, String>) -> Value {
    match block {
        ContentBlock::Text { text } => json!({"text": text}),
        ContentBlock::Image { source } => match source {
            ImageSource::Base64 { media_type, data } => json!({
                "inlineData": {"mimeType": media_type, "data": data},
            }),
            ImageSource::Uri { uri } => json!({"fileData": {"fileUri": uri}}),
        },
        ContentBlock::ToolUse { id, name, input } => {
            call_names.insert(id.clone(), name.clone());
            json!({"functionCall": {"name": name, "args": input}})
        }
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => {
            let name = call_names
                .get(tool_use_id)
                .cloned()
                .unwrap_or_else(|| tool_use_id.clone());
            json!({
                "functionResponse": {
                    "name": name,
                    "response": {"content": content, "isError": is_error},
                }
            })
        }
        ContentBlock::Thinking { text, .. } => json!({"text": text, "thought": true}),
    }
}

/// Translate SCRI tool definitions into Gemini function declarations.
#[doc(hidden)]
pub fn convert_tools(tools: &[ToolDefinition]) -> Value {
    let declarations: Vec<Value> = tools
        .iter()
        .map(|tool| {
            json!({
                "name": tool.name,
                "description": tool.description,
                "parameters": tool.parameters,
            })
        })
        .collect();
    json!([{"functionDeclarations": declarations}])
}

// ---------------------------------------------------------------------------
// Wire -> SCRI
// ---------------------------------------------------------------------------

/// Parse a generateContent response into SCRI.
///
/// # Errors
///
/// Returns `schema_mismatch` when no candidate content is present.
#[doc(hidden)]
pub fn parse_response(model: &str, body: &str) -> Result<ChatResponse, AdapterError> {
    let parsed: Value = serde_json::from_str(body).map_err(|e| {
        AdapterError::schema_mismatch(format!("undecodable response: {e}"))
            .with_details(super::sanitize_error_body(body))
    })?;

    let Some(candidate) = parsed
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
    else {
        return Err(AdapterError::schema_mismatch("missing candidates[0]")
            .with_details(super::sanitize_error_body(body)));
    };

    let mut drift = Vec::new();
    let mut content = Vec::new();
    let mut tool_calls = Vec::new();

    let parts = candidate
        .get("content")
        .and_then(|c| c.get("parts"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    for part in &parts {
        if let Some(text) = part.get("text").and_then(Value::as_str) {
            if part.get("thought").and_then(Value::as_bool).unwrap_or(false) {
                content.push(ContentBlock::Thinking {
                    text: text.to_owned(),
                    signature: None,
                });
            } else {
                content.push(ContentBlock::Text {
                    text: text.to_owned(),
                });
            }
        } else if let Some(call) = part.get("functionCall") {
            let name = call
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    AdapterError::new(ErrorKind::ToolSchemaDrift, "functionCall missing name")
                })?
                .to_owned();
            let args = call.get("args").cloned().unwrap_or(Value::Null);
            let id = generate_call_id();
            content.push(ContentBlock::ToolUse {
                id: id.clone(),
                name: name.clone(),
                input: args.clone(),
            });
            tool_calls.push(ToolCall {
                id,
                name,
                arguments: args,
            });
        } else {
            let keys: Vec<&str> = part
                .as_object()
                .map(|o| o.keys().map(String::as_str).collect())
                .unwrap_or_default();
            debug!(?keys, "unmapped gemini part");
            drift.push(format!("unmapped part with keys {keys:?}"));
        }
    }

    if content.is_empty() {
        return Err(AdapterError::schema_mismatch("candidate has no mappable parts")
            .with_details(super::sanitize_error_body(body)));
    }

    let raw_reason = candidate.get("finishReason").and_then(Value::as_str);
    let finish_reason = match raw_reason {
        Some("STOP") | None => {
            if tool_calls.is_empty() {
                FinishReason::Stop
            } else {
                FinishReason::ToolCalls
            }
        }
        Some("MAX_TOKENS") => FinishReason::Length,
        Some("SAFETY" | "PROHIBITED_CONTENT" | "BLOCKLIST") => FinishReason::ContentFilter,
        Some(other) => {
            drift.push(format!("unmapped finishReason '{other}'"));
            FinishReason::Stop
        }
    };

    Ok(ChatResponse {
        id: parsed
            .get("responseId")
            .and_then(Value::as_str)
            .map_or_else(generate_call_id, ToOwned::to_owned),
        model: parsed
            .get("modelVersion")
            .and_then(Value::as_str)
            .unwrap_or(model)
            .to_owned(),
        provider: "google".to_owned(),
        content,
        tool_calls,
        finish_reason,
        usage: parse_usage(&parsed),
        lineage: None,
        drift,
    })
}

fn parse_usage(value: &Value) -> Usage {
    let Some(meta) = value.get("usageMetadata") else {
        return Usage::default();
    };
    let field = |name: &str| meta.get(name).and_then(Value::as_u64);
    let input = field("promptTokenCount").unwrap_or(0);
    let output = field("candidatesTokenCount").unwrap_or(0);
    Usage {
        input_tokens: input,
        output_tokens: output,
        total_tokens: field("totalTokenCount").unwrap_or_else(|| input.saturating_add(output)),
        cache_read_tokens: field("cachedContentTokenCount"),
        cache_write_tokens: None,
        reasoning_tokens: field("thoughtsTokenCount"),
    }
}

/// Translate one streamed generateContent frame into SCRI events.
fn ingest_stream_frame(data: &str) -> Vec<StreamEvent> {
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
    let mut saw_tool_call = false;

    let Some(candidate) = value
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
    else {
        return events;
    };

    if let Some(parts) = candidate
        .get("content")
        .and_then(|c| c.get("parts"))
        .and_then(Value::as_array)
    {
        for part in parts {
            if let Some(text) = part.get("text").and_then(Value::as_str) {
                if part.get("thought").and_then(Value::as_bool).unwrap_or(false) {
                    events.push(StreamEvent::ThinkingDelta {
                        text: text.to_owned(),
                    });
                } else {
                    events.push(StreamEvent::TextDelta {
                        text: text.to_owned(),
                    });
                }
            } else if let Some(call) = part.get("functionCall") {
                // Gemini delivers function calls whole, not incrementally.
                let name = call
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned();
                let args = call.get("args").cloned().unwrap_or(Value::Null);
                let id = generate_call_id();
                saw_tool_call = true;
                events.push(StreamEvent::ToolCallStart {
                    id: id.clone(),
                    name,
                });
                events.push(StreamEvent::ToolCallArgDelta {
                    id: id.clone(),
                    delta: args.to_string(),
                });
                events.push(StreamEvent::ToolCallEnd { id });
            }
        }
    }

    if let Some(reason) = candidate.get("finishReason").and_then(Value::as_str) {
        let usage = parse_usage(&value);
        if usage != Usage::default() {
            events.push(StreamEvent::Usage { usage });
        }
        let mapped = match reason {
            "STOP" => {
                if saw_tool_call {
                    FinishReason::ToolCalls
                } else {
                    FinishReason::Stop
                }
            }
            "MAX_TOKENS" => FinishReason::Length,
            "SAFETY" | "PROHIBITED_CONTENT" | "BLOCKLIST" => FinishReason::ContentFilter,
            _ => FinishReason::Stop,
        };
        events.push(StreamEvent::Finish {
            reason: mapped,
            error: None,
        });
    }

    events
}
