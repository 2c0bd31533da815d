//! Heal worker cycles against scripted heal-model replies.

use std::sync::Arc;

use straylight::heal::{HealAuditLog, HealError, HealWorker, HealWorkerConfig};
use straylight::health::{HealRequest, RecordedError};
use straylight::providers::registry::ProviderRegistry;
use straylight::providers::{AdapterError, ErrorKind, ProviderAdapter};
use straylight::reload::store::{PendingStatus, VersionOrigin};

use crate::helpers::{context_with, reload_manager};
use crate::stub_adapter::{ok_response, StubAdapter};

const DIAGNOSIS_STRUCTURAL: &str = r#"{"summary": "response field renamed", "likely_cause": "provider API update", "is_structural": true, "search_queries": ["provider api changelog"]}"#;
const DIAGNOSIS_NOISE: &str = r#"{"summary": "sporadic 5xx", "likely_cause": "provider incident", "is_structural": false, "search_queries": []}"#;
const FIX_REPLY: &str = r#"{"source": "patched mapping", "confidence": 0.55, "rationale": "changelog documents the rename"}"#;

fn heal_request(provider: &str) -> HealRequest {
    HealRequest {
        provider: provider.to_owned(),
        recent_errors: vec![RecordedError {
            at: chrono::Utc::now(),
            kind: ErrorKind::UnknownField,
            message: "unexpected field 'outputs'".to_owned(),
            details: Some(r#"{"outputs": []}"#.to_owned()),
        }],
        adapter_version: 1,
    }
}

fn worker_config() -> HealWorkerConfig {
    HealWorkerConfig {
        heal_model: "ollama:qwen3:8b".to_owned(),
        research_preference: Vec::new(),
        max_research_queries: 3,
        research_timeout: std::time::Duration::from_secs(5),
        phase_timeout: std::time::Duration::from_secs(5),
    }
}

/// Registry with the broken target provider plus a scripted local heal model.
fn registry_with_heal_model(replies: Vec<&str>) -> ProviderRegistry {
    let heal_model = StubAdapter::answering("ollama", "qwen3:8b", "pong").with_script(
        replies
            .into_iter()
            .map(|text| Ok(ok_response("ollama", "qwen3:8b", text)))
            .collect(),
    );
    let google: Arc<dyn ProviderAdapter> =
        Arc::new(StubAdapter::answering("google", "gemini-2.5-flash", "pong"));
    ProviderRegistry::for_testing(vec![
        ("google".to_owned(), google, 1, false),
        ("ollama".to_owned(), Arc::new(heal_model), 0, true),
    ])
}

#[tokio::test]
async fn structural_diagnosis_produces_a_pending_fix() {
    let registry = registry_with_heal_model(vec![DIAGNOSIS_STRUCTURAL, FIX_REPLY]);
    let ctx = context_with(registry);
    let dir = tempfile::tempdir().expect("tempdir");
    let reload = reload_manager(&ctx, &dir, false, 0.8, 10);

    let audit = Arc::new(HealAuditLog::from_writer(Box::new(std::io::sink())));
    let worker = HealWorker::new(Arc::clone(&ctx), Arc::clone(&reload), worker_config(), audit);

    let outcome = worker
        .run_cycle(heal_request("google"))
        .await
        .expect("cycle completes");
    assert_eq!(outcome, "queued");

    let pending = reload.pending_fixes().expect("pending list");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].provider, "google");
    assert!((pending[0].confidence - 0.55).abs() < f64::EPSILON);
    assert_eq!(pending[0].status, PendingStatus::Pending);
    assert_eq!(pending[0].diagnosis, "response field renamed");
}

#[tokio::test]
async fn approved_pending_fix_becomes_a_healed_version() {
    let registry = registry_with_heal_model(vec![DIAGNOSIS_STRUCTURAL, FIX_REPLY]);
    let ctx = context_with(registry);
    let dir = tempfile::tempdir().expect("tempdir");
    let reload = reload_manager(&ctx, &dir, false, 0.8, 10);

    let audit = Arc::new(HealAuditLog::from_writer(Box::new(std::io::sink())));
    let worker = HealWorker::new(Arc::clone(&ctx), Arc::clone(&reload), worker_config(), audit);
    worker
        .run_cycle(heal_request("google"))
        .await
        .expect("cycle completes");

    reload.approve("google", "operator").await.expect("approve");

    let history = reload.history("google").expect("history");
    let healed = history.last().expect("entry");
    assert_eq!(healed.origin, VersionOrigin::HealedApproved);
    assert_eq!(reload.current_source("google").expect("source"), "patched mapping");
}

#[tokio::test]
async fn non_structural_diagnosis_aborts_and_decays_the_window() {
    let registry = registry_with_heal_model(vec![DIAGNOSIS_NOISE]);
    let ctx = context_with(registry);
    let dir = tempfile::tempdir().expect("tempdir");
    let reload = reload_manager(&ctx, &dir, false, 0.8, 10);

    // Seed the window so the decay is observable.
    ctx.health
        .record_error("google", &AdapterError::schema_mismatch("seed"));
    ctx.health
        .record_error("google", &AdapterError::schema_mismatch("seed"));

    let audit = Arc::new(HealAuditLog::from_writer(Box::new(std::io::sink())));
    let worker = HealWorker::new(Arc::clone(&ctx), Arc::clone(&reload), worker_config(), audit);

    let outcome = worker
        .run_cycle(heal_request("google"))
        .await
        .expect("cycle completes");
    assert_eq!(outcome, "not-structural");

    assert_eq!(ctx.health.snapshot()["google"].structural_in_window, 0);
    assert!(reload.pending_fixes().expect("pending").is_empty());
}

#[tokio::test]
async fn undecodable_diagnosis_fails_the_cycle_internally() {
    let registry = registry_with_heal_model(vec!["the model rambles with no JSON"]);
    let ctx = context_with(registry);
    let dir = tempfile::tempdir().expect("tempdir");
    let reload = reload_manager(&ctx, &dir, false, 0.8, 10);

    let audit = Arc::new(HealAuditLog::from_writer(Box::new(std::io::sink())));
    let worker = HealWorker::new(Arc::clone(&ctx), Arc::clone(&reload), worker_config(), audit);

    let err = worker
        .run_cycle(heal_request("google"))
        .await
        .expect_err("must fail");
    assert!(matches!(err, HealError::DiagnosisFailed(_)));
    assert!(reload.pending_fixes().expect("pending").is_empty());
}

#[tokio::test]
async fn auto_apply_commits_a_confident_fix_end_to_end() {
    let confident_fix = r#"{"source": "patched mapping", "confidence": 0.92, "rationale": "well documented"}"#;
    let registry = registry_with_heal_model(vec![DIAGNOSIS_STRUCTURAL, confident_fix]);
    let ctx = context_with(registry);
    let dir = tempfile::tempdir().expect("tempdir");
    let reload = reload_manager(&ctx, &dir, true, 0.8, 10);

    let audit = Arc::new(HealAuditLog::from_writer(Box::new(std::io::sink())));
    let worker = HealWorker::new(Arc::clone(&ctx), Arc::clone(&reload), worker_config(), audit);

    let outcome = worker
        .run_cycle(heal_request("google"))
        .await
        .expect("cycle completes");
    assert_eq!(outcome, "committed");

    let history = reload.history("google").expect("history");
    assert_eq!(history.last().expect("entry").origin, VersionOrigin::HealedAuto);
    assert_eq!(ctx.registry.binding("google").expect("binding").version, 2);
}
