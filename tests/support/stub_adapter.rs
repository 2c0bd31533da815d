//! Scriptable stub adapter shared by the routing and healing test suites.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use straylight::providers::{AdapterError, ProviderAdapter};
use straylight::scri::{
    ChatRequest, ChatResponse, ContentBlock, EmbeddingRequest, EmbeddingResponse, FinishReason,
    Message, ModelCapabilities, StreamEvent, ToolDefinition, Usage,
};

/// A successful canned response.
pub fn ok_response(provider: &str, model: &str, text: &str) -> ChatResponse {
    ChatResponse {
        id: format!("stub_{provider}"),
        model: model.to_owned(),
        provider: provider.to_owned(),
        content: vec![ContentBlock::Text {
            text: text.to_owned(),
        }],
        tool_calls: Vec::new(),
        finish_reason: FinishReason::Stop,
        usage: Usage::from_counts(3, 2),
        lineage: None,
        drift: Vec::new(),
    }
}

/// Scriptable adapter: pops scripted outcomes per chat call, then falls back
/// to a default echo. Counts invocations so fail-fast behavior is provable.
pub struct StubAdapter {
    provider: String,
    model: String,
    script: Mutex<VecDeque<Result<ChatResponse, AdapterError>>>,
    always_fail: Option<AdapterError>,
    default_text: String,
    chat_calls: Arc<AtomicUsize>,
    health_ok: bool,
    supports_search: bool,
}

impl StubAdapter {
    /// A stub that always answers with the given text.
    pub fn answering(provider: &str, model: &str, text: &str) -> Self {
        Self {
            provider: provider.to_owned(),
            model: model.to_owned(),
            script: Mutex::new(VecDeque::new()),
            always_fail: None,
            default_text: text.to_owned(),
            chat_calls: Arc::new(AtomicUsize::new(0)),
            health_ok: true,
            supports_search: false,
        }
    }

    /// A stub whose every chat call fails with clones of the given error,
    /// forever.
    pub fn always_failing(provider: &str, model: &str, error: AdapterError) -> Self {
        let mut stub = Self::answering(provider, model, "unreachable");
        stub.always_fail = Some(error);
        stub
    }

    /// Queue scripted outcomes consumed before the default answer.
    #[must_use]
    pub fn with_script(self, outcomes: Vec<Result<ChatResponse, AdapterError>>) -> Self {
        {
            let mut script = self.script.lock().expect("script lock");
            script.extend(outcomes);
        }
        self
    }

    /// A stub whose every chat call fails with clones of the given error.
    pub fn failing(provider: &str, model: &str, error: AdapterError, times: usize) -> Self {
        let outcomes = (0..times).map(|_| Err(error.clone())).collect();
        Self::answering(provider, model, "fallback answer").with_script(outcomes)
    }

    /// Mark the stub's health check as failing.
    #[must_use]
    pub fn with_broken_health(mut self) -> Self {
        self.health_ok = false;
        self
    }

    /// Mark the stub as search-capable.
    #[must_use]
    pub fn with_search(mut self) -> Self {
        self.supports_search = true;
        self
    }

    /// Handle to the invocation counter.
    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.chat_calls)
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for StubAdapter {
    async fn chat(&self, _request: &ChatRequest) -> Result<ChatResponse, AdapterError> {
        self.chat_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = &self.always_fail {
            return Err(error.clone());
        }
        let scripted = self.script.lock().expect("script lock").pop_front();
        match scripted {
            Some(outcome) => outcome,
            None => Ok(ok_response(&self.provider, &self.model, &self.default_text)),
        }
    }

    async fn chat_stream(
        &self,
        request: &ChatRequest,
    ) -> Result<mpsc::Receiver<StreamEvent>, AdapterError> {
        let response = self.chat(request).await?;
        let (tx, rx) = mpsc::channel(8);
        let text = response.text();
        tokio::spawn(async move {
            let _ = tx.send(StreamEvent::TextDelta { text }).await;
            let _ = tx
                .send(StreamEvent::Finish {
                    reason: FinishReason::Stop,
                    error: None,
                })
                .await;
        });
        Ok(rx)
    }

    async fn embed(&self, request: &EmbeddingRequest) -> Result<EmbeddingResponse, AdapterError> {
        Ok(EmbeddingResponse {
            model: self.model.clone(),
            provider: self.provider.clone(),
            embeddings: request.inputs.iter().map(|_| vec![0.0, 1.0]).collect(),
            usage: Usage::from_counts(1, 0),
        })
    }

    fn list_models(&self) -> Vec<ModelCapabilities> {
        vec![ModelCapabilities {
            provider: self.provider.clone(),
            model: self.model.clone(),
            supports_tools: true,
            supports_streaming: true,
            supports_embeddings: true,
            supports_search: self.supports_search,
            context_window: None,
        }]
    }

    async fn health_check(&self) -> Result<(), AdapterError> {
        if self.health_ok {
            Ok(())
        } else {
            Err(AdapterError::transient("stub health check failed"))
        }
    }

    fn convert_messages(&self, messages: &[Message]) -> serde_json::Value {
        serde_json::json!(messages.len())
    }

    fn convert_tools(&self, tools: &[ToolDefinition]) -> serde_json::Value {
        serde_json::json!(tools.len())
    }

    fn provider_name(&self) -> &str {
        &self.provider
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}
