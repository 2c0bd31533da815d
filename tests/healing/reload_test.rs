//! Reload manager lifecycle: atomic swap, verification, rollback, bounded
//! history, pending-fix resolution, operator rollback.

use std::sync::Arc;

use straylight::metrics::MetricKey;
use straylight::providers::{AdapterError, ErrorKind, ProviderAdapter};
use straylight::reload::store::{PendingStatus, VersionOrigin, VersionStatus};
use straylight::reload::{ApplyOutcome, ProposedFix, ReloadError};

use crate::helpers::{context_with, reload_manager, single_provider_registry};
use crate::stub_adapter::StubAdapter;

fn fix(source: &str, confidence: f64) -> ProposedFix {
    ProposedFix {
        source: source.to_owned(),
        confidence,
        diagnosis: "field renamed upstream".to_owned(),
        citations: Vec::new(),
    }
}

#[tokio::test]
async fn confident_fix_auto_applies_and_commits() {
    let registry = single_provider_registry(
        "google",
        Arc::new(StubAdapter::answering("google", "gemini-2.5-flash", "pong")),
    );
    let ctx = context_with(registry);
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = reload_manager(&ctx, &dir, true, 0.8, 10);

    let outcome = manager
        .submit_fix("google", fix("patched mapping", 0.95))
        .await
        .expect("apply");

    match outcome {
        ApplyOutcome::Committed { version } => {
            assert_eq!(version.version, 2);
            assert_eq!(version.origin, VersionOrigin::HealedAuto);
        }
        other => panic!("expected commit, got {other:?}"),
    }

    assert_eq!(ctx.registry.binding("google").expect("binding").version, 2);
    assert_eq!(manager.current_source("google").expect("source"), "patched mapping");
    assert_eq!(
        ctx.metrics
            .counter_value(&MetricKey::provider("heal_commit_total", "google")),
        1
    );
}

#[tokio::test]
async fn low_confidence_fix_queues_for_approval() {
    let registry = single_provider_registry(
        "google",
        Arc::new(StubAdapter::answering("google", "gemini-2.5-flash", "pong")),
    );
    let ctx = context_with(registry);
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = reload_manager(&ctx, &dir, true, 0.8, 10);

    let outcome = manager
        .submit_fix("google", fix("uncertain mapping", 0.55))
        .await
        .expect("queue");
    assert!(matches!(outcome, ApplyOutcome::Queued { .. }));

    // The live binding is untouched.
    assert_eq!(ctx.registry.binding("google").expect("binding").version, 1);

    let pending = manager.pending_fixes().expect("pending list");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].provider, "google");
    assert_eq!(pending[0].status, PendingStatus::Pending);
}

#[tokio::test]
async fn approval_applies_and_records_the_approver() {
    let registry = single_provider_registry(
        "google",
        Arc::new(StubAdapter::answering("google", "gemini-2.5-flash", "pong")),
    );
    let ctx = context_with(registry);
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = reload_manager(&ctx, &dir, false, 0.8, 10);

    manager
        .submit_fix("google", fix("approved mapping", 0.55))
        .await
        .expect("queue");
    let outcome = manager.approve("google", "igor").await.expect("approve");
    assert!(matches!(outcome, ApplyOutcome::Committed { .. }));

    let history = manager.history("google").expect("history");
    let committed = history.last().expect("entry");
    assert_eq!(committed.origin, VersionOrigin::HealedApproved);
    assert_eq!(committed.approved_by.as_deref(), Some("igor"));
    assert_eq!(committed.status, VersionStatus::Live);

    // Resolution is terminal.
    let err = manager.approve("google", "igor").await.expect_err("resolved");
    assert!(matches!(err, ReloadError::AlreadyResolved { .. }));
}

#[tokio::test]
async fn rejection_is_terminal_and_clears_staging() {
    let registry = single_provider_registry(
        "google",
        Arc::new(StubAdapter::answering("google", "gemini-2.5-flash", "pong")),
    );
    let ctx = context_with(registry);
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = reload_manager(&ctx, &dir, false, 0.8, 10);

    manager
        .submit_fix("google", fix("rejected mapping", 0.55))
        .await
        .expect("queue");
    manager.reject("google").await.expect("reject");

    let pending = manager.pending_fixes().expect("pending list");
    assert_eq!(pending[0].status, PendingStatus::Rejected);
    assert!(pending[0].source.is_empty());

    let err = manager.reject("google").await.expect_err("resolved");
    assert!(matches!(err, ReloadError::AlreadyResolved { .. }));
}

#[tokio::test]
async fn failed_verification_rolls_back_to_the_previous_version() {
    let mut registry = single_provider_registry(
        "google",
        Arc::new(StubAdapter::answering("google", "gemini-2.5-flash", "pong")),
    );
    // Rebuilt adapters fail their canary chat with a structural error.
    registry.set_factory_for_testing(
        "google",
        Arc::new(|| {
            let broken: Arc<dyn ProviderAdapter> = Arc::new(StubAdapter::always_failing(
                "google",
                "gemini-2.5-flash",
                AdapterError::new(ErrorKind::SchemaMismatch, "canary mismatch"),
            ));
            broken
        }),
    );
    let ctx = context_with(registry);
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = reload_manager(&ctx, &dir, true, 0.5, 10);

    let outcome = manager
        .submit_fix("google", fix("bad mapping", 0.9))
        .await
        .expect("apply attempt");

    match outcome {
        ApplyOutcome::RolledBack { attempted, .. } => assert_eq!(attempted, 2),
        other => panic!("expected rollback, got {other:?}"),
    }

    // The pre-fix version is live again.
    assert_eq!(ctx.registry.binding("google").expect("binding").version, 1);
    let history = manager.history("google").expect("history");
    assert_eq!(history[1].status, VersionStatus::FailedVerification);
    assert_eq!(
        ctx.metrics
            .counter_value(&MetricKey::provider("heal_rollback_total", "google")),
        1
    );
}

#[tokio::test]
async fn requests_in_flight_keep_their_pre_swap_binding() {
    let registry = single_provider_registry(
        "google",
        Arc::new(StubAdapter::answering("google", "gemini-2.5-flash", "pong")),
    );
    let ctx = context_with(registry);
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = reload_manager(&ctx, &dir, true, 0.5, 10);

    // A request dispatches and holds its binding across the swap.
    let held = ctx.registry.binding("google").expect("binding");
    assert_eq!(held.version, 1);

    manager
        .submit_fix("google", fix("patched mapping", 0.9))
        .await
        .expect("apply");

    assert_eq!(held.version, 1, "in-flight binding changed under the request");
    assert_eq!(ctx.registry.binding("google").expect("binding").version, 2);
}

#[tokio::test]
async fn history_stays_bounded_across_many_heals() {
    let registry = single_provider_registry(
        "google",
        Arc::new(StubAdapter::answering("google", "gemini-2.5-flash", "pong")),
    );
    let ctx = context_with(registry);
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = reload_manager(&ctx, &dir, true, 0.5, 4);

    for n in 0..8 {
        manager
            .submit_fix("google", fix(&format!("mapping {n}"), 0.9))
            .await
            .expect("apply");
    }

    let history = manager.history("google").expect("history");
    assert!(history.len() <= 4, "bound exceeded: {}", history.len());
    assert!(history.iter().any(|v| v.status == VersionStatus::Live));
}

#[tokio::test]
async fn operator_rollback_revives_an_old_version_as_a_new_entry() {
    let registry = single_provider_registry(
        "google",
        Arc::new(StubAdapter::answering("google", "gemini-2.5-flash", "pong")),
    );
    let ctx = context_with(registry);
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = reload_manager(&ctx, &dir, true, 0.5, 10);

    manager
        .submit_fix("google", fix("mapping v2", 0.9))
        .await
        .expect("apply v2");
    manager
        .submit_fix("google", fix("mapping v3", 0.9))
        .await
        .expect("apply v3");

    let outcome = manager.rollback_to("google", 2).await.expect("rollback");
    let version = match outcome {
        ApplyOutcome::Committed { version } => version,
        other => panic!("expected commit, got {other:?}"),
    };
    assert_eq!(version.origin, VersionOrigin::ManualRollback);
    assert_eq!(version.version, 4);

    // The revived entry carries v2's content and is now live.
    assert_eq!(manager.current_source("google").expect("source"), "mapping v2");
    assert_eq!(ctx.registry.binding("google").expect("binding").version, 4);
}

#[tokio::test]
async fn rollback_to_unknown_version_is_an_error() {
    let registry = single_provider_registry(
        "google",
        Arc::new(StubAdapter::answering("google", "gemini-2.5-flash", "pong")),
    );
    let ctx = context_with(registry);
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = reload_manager(&ctx, &dir, true, 0.5, 10);

    let err = manager.rollback_to("google", 42).await.expect_err("unknown");
    assert!(matches!(err, ReloadError::UnknownVersion { version: 42, .. }));
}
