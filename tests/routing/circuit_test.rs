//! Circuit integration with the routing walk: structural storms open the
//! breaker and subsequent calls fail fast without invoking the adapter.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use straylight::circuit::CircuitState;
use straylight::providers::{AdapterError, ErrorKind};
use straylight::router::{Router, RouterError};
use straylight::scri::ChatRequest;

use crate::helpers::{aliases, context_with};
use crate::stub_adapter::StubAdapter;

#[tokio::test]
async fn structural_storm_opens_the_circuit_and_fails_fast() {
    let anthropic = StubAdapter::failing(
        "anthropic",
        "claude-opus-4",
        AdapterError::new(ErrorKind::SchemaMismatch, "missing content array"),
        10,
    );
    let calls = anthropic.call_counter();

    let ctx = context_with(
        vec![("anthropic".to_owned(), Arc::new(anthropic), 1, false)],
        aliases(&[]),
        "anthropic",
        false,
        5,
    );
    let router = Router::new(Arc::clone(&ctx));
    let request = ChatRequest::user("anthropic:claude-opus-4", "q");

    // Five structural failures trip the breaker.
    for _ in 0..5 {
        let err = router.chat(&request).await.expect_err("must fail");
        assert!(matches!(err, RouterError::AllProvidersFailed { .. }));
    }
    assert_eq!(
        ctx.circuits.state("anthropic").expect("breaker"),
        CircuitState::Open
    );
    let snapshot = ctx.circuits.snapshot();
    assert!(snapshot["anthropic"].open_until.expect("deadline") > chrono::Utc::now());

    // The sixth call is skipped without touching the adapter.
    let err = router.chat(&request).await.expect_err("must fail fast");
    match err {
        RouterError::AllProvidersFailed { attempts, .. } => {
            assert_eq!(attempts[0].kind, "circuit_open");
        }
        other => panic!("expected AllProvidersFailed, got {other:?}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn open_circuit_advances_to_fallback_when_available() {
    let anthropic = StubAdapter::failing(
        "anthropic",
        "claude-opus-4",
        AdapterError::new(ErrorKind::SchemaMismatch, "missing content array"),
        10,
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
        aliases(&[]),
        "anthropic",
        true,
        2,
    );
    let router = Router::new(Arc::clone(&ctx));
    let request = ChatRequest::user("anthropic:claude-opus-4", "q");

    // Two structural failures open the breaker; both requests still succeed
    // through the fallback.
    for _ in 0..2 {
        let response = router.chat(&request).await.expect("fallback answers");
        assert_eq!(response.lineage.expect("lineage").provider, "openai");
    }
    assert_eq!(
        ctx.circuits.state("anthropic").expect("breaker"),
        CircuitState::Open
    );

    // With the breaker open the walk starts at the fallback directly.
    let response = router.chat(&request).await.expect("fallback answers");
    let lineage = response.lineage.expect("lineage");
    assert_eq!(lineage.provider, "openai");
    assert_eq!(lineage.attempts, 1);
}

#[tokio::test]
async fn structural_errors_reach_the_health_window() {
    let ctx = context_with(
        vec![(
            "anthropic".to_owned(),
            Arc::new(StubAdapter::failing(
                "anthropic",
                "claude-opus-4",
                AdapterError::new(ErrorKind::ToolSchemaDrift, "tool format changed"),
                3,
            )),
            1,
            false,
        )],
        aliases(&[]),
        "anthropic",
        false,
        10,
    );
    let router = Router::new(Arc::clone(&ctx));
    let request = ChatRequest::user("anthropic:claude-opus-4", "q");

    for _ in 0..3 {
        let _ = router.chat(&request).await;
    }

    let health = ctx.health.snapshot();
    assert_eq!(health["anthropic"].structural_in_window, 3);
    assert_eq!(health["anthropic"].error_counts["tool_schema_drift"], 3);
}
