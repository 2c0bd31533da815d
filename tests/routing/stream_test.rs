//! Streaming walk behavior: ordered events, terminal frames, accounting.

use std::sync::Arc;

use straylight::providers::AdapterError;
use straylight::router::Router;
use straylight::scri::{ChatRequest, FinishReason, StreamEvent};

use crate::helpers::{aliases, context_with};
use crate::stub_adapter::StubAdapter;

#[tokio::test]
async fn stream_delivers_events_in_order_and_ends_with_finish() {
    let ctx = context_with(
        vec![(
            "ollama".to_owned(),
            Arc::new(StubAdapter::answering("ollama", "qwen3:8b", "streamed")),
            0,
            true,
        )],
        aliases(&[]),
        "ollama",
        true,
        5,
    );
    let router = Router::new(ctx);

    let mut rx = router
        .chat_stream(&ChatRequest::user("local", "q"))
        .await
        .expect("stream established");

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }

    assert_eq!(events.len(), 2);
    assert!(matches!(&events[0], StreamEvent::TextDelta { text } if text == "streamed"));
    assert_eq!(
        events[1],
        StreamEvent::Finish {
            reason: FinishReason::Stop,
            error: None
        }
    );
}

#[tokio::test]
async fn stream_establishment_failure_falls_back() {
    let ctx = context_with(
        vec![
            (
                "anthropic".to_owned(),
                Arc::new(StubAdapter::failing(
                    "anthropic",
                    "claude-opus-4",
                    AdapterError::transient("503"),
                    1,
                )),
                1,
                false,
            ),
            (
                "openai".to_owned(),
                Arc::new(StubAdapter::answering("openai", "gpt-4o", "fallback stream")),
                1,
                false,
            ),
        ],
        aliases(&[]),
        "anthropic",
        true,
        5,
    );
    let router = Router::new(ctx);

    let mut rx = router
        .chat_stream(&ChatRequest::user("anthropic:claude-opus-4", "q"))
        .await
        .expect("fallback stream established");

    let first = rx.recv().await.expect("first event");
    assert!(matches!(first, StreamEvent::TextDelta { text } if text == "fallback stream"));
}

#[tokio::test]
async fn successful_stream_records_provider_success() {
    let ctx = context_with(
        vec![(
            "ollama".to_owned(),
            Arc::new(StubAdapter::answering("ollama", "qwen3:8b", "ok")),
            0,
            true,
        )],
        aliases(&[]),
        "ollama",
        true,
        5,
    );
    let router = Router::new(Arc::clone(&ctx));

    let mut rx = router
        .chat_stream(&ChatRequest::user("local", "q"))
        .await
        .expect("stream established");
    while rx.recv().await.is_some() {}

    let health = ctx.health.snapshot();
    assert!(health["ollama"].last_success.is_some());
}
