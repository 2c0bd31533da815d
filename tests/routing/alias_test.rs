//! Alias resolution precedence: alias table, explicit form, prefix
//! inference, configured default.

use std::sync::Arc;

use straylight::router::{Router, RouterError};

use crate::helpers::{aliases, context_with};
use crate::stub_adapter::StubAdapter;

fn two_provider_router() -> Router {
    let ctx = context_with(
        vec![
            (
                "ollama".to_owned(),
                Arc::new(StubAdapter::answering("ollama", "qwen3:8b", "pong")),
                0,
                true,
            ),
            (
                "anthropic".to_owned(),
                Arc::new(StubAdapter::answering("anthropic", "claude-sonnet-4-5", "pong")),
                1,
                false,
            ),
        ],
        aliases(&[("reason", "anthropic:claude-opus-4")]),
        "ollama",
        true,
        5,
    );
    Router::new(ctx)
}

#[test]
fn alias_table_wins_first() {
    let router = two_provider_router();
    let candidate = router.resolve("reason").expect("resolves");
    assert_eq!(candidate.provider, "anthropic");
    assert_eq!(candidate.model, "claude-opus-4");
}

#[test]
fn explicit_provider_model_form_resolves() {
    let router = two_provider_router();
    let candidate = router.resolve("anthropic:claude-haiku-4-5").expect("resolves");
    assert_eq!(candidate.provider, "anthropic");
    assert_eq!(candidate.model, "claude-haiku-4-5");
}

#[test]
fn prefix_inference_routes_family_names() {
    let router = two_provider_router();
    let candidate = router.resolve("claude-sonnet-4-5").expect("resolves");
    assert_eq!(candidate.provider, "anthropic");
    assert_eq!(candidate.model, "claude-sonnet-4-5");
}

#[test]
fn unmatched_names_fall_through_to_the_default_provider() {
    let router = two_provider_router();
    let candidate = router.resolve("local").expect("resolves");
    assert_eq!(candidate.provider, "ollama");
    assert_eq!(candidate.model, "qwen3:8b");
}

#[test]
fn explicit_form_with_unknown_provider_is_disabled() {
    let router = two_provider_router();
    let err = router.resolve("mistral:large").expect_err("must fail");
    assert!(matches!(err, RouterError::Disabled { provider } if provider == "mistral"));
}

#[test]
fn prefix_match_to_unregistered_provider_is_disabled() {
    let router = two_provider_router();
    let err = router.resolve("gemini-2.5-pro").expect_err("must fail");
    assert!(matches!(err, RouterError::Disabled { provider } if provider == "google"));
}

#[test]
fn fallback_candidates_rank_locals_first() {
    let router = two_provider_router();
    let primary = router.resolve("reason").expect("resolves");
    let candidates = router.candidates(&primary);
    assert_eq!(candidates.len(), 2);
    assert_eq!(candidates[0].provider, "anthropic");
    assert_eq!(candidates[1].provider, "ollama");
}
