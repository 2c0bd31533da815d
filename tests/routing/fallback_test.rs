//! Fallback walk behavior: happy path, transient reroute, terminal errors,
//! and fallback transparency.

use std::sync::Arc;

use straylight::providers::{AdapterError, ErrorKind};
use straylight::router::{Router, RouterError};
use straylight::scri::ChatRequest;

use crate::helpers::{aliases, context_with};
use crate::stub_adapter::StubAdapter;

#[tokio::test]
async fn local_only_happy_path_reports_lineage() {
    let ctx = context_with(
        vec![(
            "ollama".to_owned(),
            Arc::new(StubAdapter::answering("ollama", "qwen3:8b", "ping-echo")),
            0,
            true,
        )],
        aliases(&[]),
        "ollama",
        true,
        5,
    );
    let router = Router::new(ctx);

    let response = router
        .chat(&ChatRequest::user("local", "ping"))
        .await
        .expect("should answer");

    assert_eq!(response.text(), "ping-echo");
    let lineage = response.lineage.expect("lineage filled");
    assert_eq!(lineage.provider, "ollama");
    assert_eq!(lineage.attempts, 1);
    assert!(!lineage.fallback);
    assert_eq!(lineage.adapter_version, 1);
}

#[tokio::test]
async fn transient_primary_falls_back_without_tripping_the_circuit() {
    let anthropic = StubAdapter::failing(
        "anthropic",
        "claude-opus-4",
        AdapterError::transient("503 overloaded"),
        3,
    );
    let ctx = context_with(
        vec![
            ("anthropic".to_owned(), Arc::new(anthropic), 1, false),
            (
                "openai".to_owned(),
                Arc::new(StubAdapter::answering("openai", "gpt-4o", "fallback answer")),
                1,
                false,
            ),
        ],
        aliases(&[("reason", "anthropic:claude-opus-4")]),
        "anthropic",
        true,
        5,
    );
    let router = Router::new(Arc::clone(&ctx));

    let response = router
        .chat(&ChatRequest::user("reason", "hello"))
        .await
        .expect("fallback should answer");

    let lineage = response.lineage.expect("lineage filled");
    assert_eq!(lineage.provider, "openai");
    assert_eq!(lineage.attempts, 2);
    assert!(lineage.fallback);

    // Transient failures never count toward the breaker.
    assert_eq!(
        ctx.circuits.state("anthropic").expect("breaker exists"),
        straylight::circuit::CircuitState::Closed
    );
}

#[tokio::test]
async fn validation_errors_are_terminal_and_never_reroute() {
    let openai_counter;
    let ctx = {
        let anthropic = StubAdapter::failing(
            "anthropic",
            "claude-opus-4",
            AdapterError::new(ErrorKind::Validation, "bad request shape"),
            1,
        );
        let openai = StubAdapter::answering("openai", "gpt-4o", "should not answer");
        openai_counter = openai.call_counter();
        context_with(
            vec![
                ("anthropic".to_owned(), Arc::new(anthropic), 1, false),
                ("openai".to_owned(), Arc::new(openai), 1, false),
            ],
            aliases(&[]),
            "anthropic",
            true,
            5,
        )
    };
    let router = Router::new(ctx);

    let err = router
        .chat(&ChatRequest::user("anthropic:claude-opus-4", "hello"))
        .await
        .expect_err("must fail");
    assert!(matches!(
        err,
        RouterError::Provider(e) if e.kind == ErrorKind::Validation
    ));
    assert_eq!(openai_counter.load(std::sync::atomic::Ordering::SeqCst), 0);
}

#[tokio::test]
async fn auth_errors_advance_to_a_differently_keyed_provider() {
    let ctx = context_with(
        vec![
            (
                "anthropic".to_owned(),
                Arc::new(StubAdapter::failing(
                    "anthropic",
                    "claude-opus-4",
                    AdapterError::new(ErrorKind::Auth, "invalid x-api-key"),
                    1,
                )),
                1,
                false,
            ),
            (
                "openai".to_owned(),
                Arc::new(StubAdapter::answering("openai", "gpt-4o", "fallback answer")),
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

    let response = router
        .chat(&ChatRequest::user("anthropic:claude-opus-4", "hello"))
        .await
        .expect("fallback should answer");
    assert_eq!(response.lineage.expect("lineage").provider, "openai");
}

#[tokio::test]
async fn disabled_fallback_surfaces_all_providers_failed() {
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
                Arc::new(StubAdapter::answering("openai", "gpt-4o", "unused")),
                1,
                false,
            ),
        ],
        aliases(&[]),
        "anthropic",
        false,
        5,
    );
    let router = Router::new(ctx);

    let err = router
        .chat(&ChatRequest::user("anthropic:claude-opus-4", "hello"))
        .await
        .expect_err("must fail");
    match err {
        RouterError::AllProvidersFailed { attempts, .. } => {
            assert_eq!(attempts.len(), 1);
            assert_eq!(attempts[0].provider, "anthropic");
            assert_eq!(attempts[0].kind, "transient");
        }
        other => panic!("expected AllProvidersFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn fallback_response_shape_matches_direct_response_shape() {
    // The same stub answer through the primary...
    let direct_ctx = context_with(
        vec![(
            "openai".to_owned(),
            Arc::new(StubAdapter::answering("openai", "gpt-4o", "identical answer")),
            1,
            false,
        )],
        aliases(&[]),
        "openai",
        true,
        5,
    );
    let direct = Router::new(direct_ctx)
        .chat(&ChatRequest::user("openai:gpt-4o", "q"))
        .await
        .expect("direct answer");

    // ...and via fallback after a failed primary.
    let fallback_ctx = context_with(
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
                Arc::new(StubAdapter::answering("openai", "gpt-4o", "identical answer")),
                1,
                false,
            ),
        ],
        aliases(&[]),
        "anthropic",
        true,
        5,
    );
    let routed = Router::new(fallback_ctx)
        .chat(&ChatRequest::user("anthropic:claude-opus-4", "q"))
        .await
        .expect("fallback answer");

    // Identical SCRI shape; only lineage differs.
    let mut direct_json = serde_json::to_value(&direct).expect("serialize");
    let mut routed_json = serde_json::to_value(&routed).expect("serialize");
    direct_json.as_object_mut().expect("object").remove("lineage");
    routed_json.as_object_mut().expect("object").remove("lineage");
    assert_eq!(direct_json, routed_json);

    assert!(routed.lineage.expect("lineage").fallback);
    assert!(!direct.lineage.expect("lineage").fallback);
}

#[tokio::test]
async fn undecodable_image_data_never_reaches_a_provider() {
    let ollama = StubAdapter::answering("ollama", "qwen3:8b", "unused");
    let calls = ollama.call_counter();
    let ctx = context_with(
        vec![("ollama".to_owned(), Arc::new(ollama), 0, true)],
        aliases(&[]),
        "ollama",
        true,
        5,
    );
    let router = Router::new(ctx);

    let mut request = ChatRequest::user("local", "what is this");
    request.messages.push(straylight::scri::Message {
        role: straylight::scri::Role::User,
        content: straylight::scri::MessageContent::Blocks(vec![
            straylight::scri::ContentBlock::Image {
                source: straylight::scri::ImageSource::Base64 {
                    media_type: "image/png".to_owned(),
                    data: "not base64!!".to_owned(),
                },
            },
        ]),
    });

    let err = router.chat(&request).await.expect_err("must fail");
    assert!(matches!(
        err,
        RouterError::Provider(e) if e.kind == ErrorKind::Validation
    ));
    assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);
}

#[tokio::test]
async fn paused_providers_are_skipped() {
    let ctx = context_with(
        vec![
            (
                "anthropic".to_owned(),
                Arc::new(StubAdapter::answering("anthropic", "claude-opus-4", "primary")),
                1,
                false,
            ),
            (
                "openai".to_owned(),
                Arc::new(StubAdapter::answering("openai", "gpt-4o", "secondary")),
                1,
                false,
            ),
        ],
        aliases(&[]),
        "anthropic",
        true,
        5,
    );
    ctx.health.set_paused("anthropic", true);
    let router = Router::new(Arc::clone(&ctx));

    let response = router
        .chat(&ChatRequest::user("anthropic:claude-opus-4", "q"))
        .await
        .expect("fallback should answer");
    assert_eq!(response.lineage.expect("lineage").provider, "openai");
}
