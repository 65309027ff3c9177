// tests/equivalence.rs

//! Submission-time deduplication and the restart policy.

use std::error::Error;
use std::sync::Arc;

use overseer::config::Profile;
use overseer::engine::Engine;
use overseer::store::TargetStore;
use overseer::target::{Equivalence, State};
use overseer_test_utils::builders::{ProfileBuilder, TargetBuilder};
use overseer_test_utils::fake_executor::FakeHostExecutor;
use overseer_test_utils::init_tracing;

type TestResult = Result<(), Box<dyn Error>>;

async fn engine(profile: &Profile) -> Arc<Engine> {
    let store = TargetStore::connect("sqlite::memory:")
        .await
        .expect("in-memory store connects");
    Arc::new(Engine::new(store, Arc::new(FakeHostExecutor::new()), profile))
}

#[tokio::test]
async fn equivalent_submissions_collapse_to_one_canonical_target() -> TestResult {
    init_tracing();
    let engine = engine(&ProfileBuilder::new().build()).await;

    let file_target = |id: &str| {
        TargetBuilder::new(id)
            .shell("make /data/out.bin")
            .file_exists("/data/out.bin")
            .equivalence(Equivalence::SameMakeAndCondition)
            .active()
            .build()
    };

    let first = engine.submit_targets(vec![file_target("one")]).await?;
    let second = engine.submit_targets(vec![file_target("two")]).await?;

    assert_eq!(first, vec![("one".to_string(), "one".to_string())]);
    assert_eq!(second, vec![("two".to_string(), "one".to_string())]);

    // Exactly one target stored.
    assert_eq!(engine.store().iter_all().await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn dependency_references_are_rewritten_within_a_batch() -> TestResult {
    init_tracing();
    let engine = engine(&ProfileBuilder::new().build()).await;

    engine
        .submit_targets(vec![TargetBuilder::new("canonical")
            .shell("make shared")
            .equivalence(Equivalence::SameMakeAndCondition)
            .active()
            .build()])
        .await?;

    // A batch that resubmits the same shape under a new id and depends on
    // that new id downstream: the edge must point at the canonical target.
    engine
        .submit_targets(vec![
            TargetBuilder::new("duplicate")
                .shell("make shared")
                .equivalence(Equivalence::SameMakeAndCondition)
                .active()
                .build(),
            TargetBuilder::new("consumer")
                .shell("true")
                .depends_on("duplicate")
                .if_fails_activate("duplicate")
                .build(),
        ])
        .await?;

    let consumer = engine.store().get("consumer").await?;
    assert_eq!(consumer.dependencies, vec!["canonical".to_string()]);
    assert_eq!(consumer.if_fails_activate, vec!["canonical".to_string()]);
    assert!(engine.store().get("duplicate").await.is_err());
    Ok(())
}

#[tokio::test]
async fn opted_out_targets_never_collapse() -> TestResult {
    init_tracing();
    let engine = engine(&ProfileBuilder::new().build()).await;

    let plain = |id: &str| TargetBuilder::new(id).shell("make same").build();
    engine.submit_targets(vec![plain("one")]).await?;
    engine.submit_targets(vec![plain("two")]).await?;

    assert_eq!(engine.store().iter_all().await?.len(), 2);
    Ok(())
}

#[tokio::test]
async fn cyclic_submissions_are_rejected_before_storing() -> TestResult {
    init_tracing();
    let engine = engine(&ProfileBuilder::new().build()).await;

    let result = engine
        .submit_targets(vec![
            TargetBuilder::new("a").shell("true").depends_on("b").build(),
            TargetBuilder::new("b").shell("true").depends_on("a").build(),
        ])
        .await;

    assert!(result.is_err());
    assert!(engine.store().iter_all().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn restart_creates_a_fresh_activated_instance() -> TestResult {
    init_tracing();
    let engine = engine(&ProfileBuilder::new().build()).await;

    // A terminal target to restart.
    let mut old = TargetBuilder::new("old")
        .shell("make thing")
        .tag("keep-me")
        .build();
    old.push(State::Killed, overseer::target::Cause::User);
    old.push(
        State::Dead("killed".into()),
        overseer::target::Cause::engine("killed"),
    );
    engine.store().put(&old).await?;

    let mapping = engine.restart_targets(&["old".to_string()]).await?;
    assert_eq!(mapping.len(), 1);
    let (from, to) = &mapping[0];
    assert_eq!(from, "old");
    assert_ne!(to, "old");

    // The original is untouched; the copy is fresh, user-activated, and
    // opted out of equivalence.
    let old_after = engine.store().get("old").await?;
    assert!(old_after.is_terminal());

    let fresh = engine.store().get(to).await?;
    assert!(matches!(fresh.state(), State::Activable));
    assert!(fresh.activated_by_user());
    assert_eq!(fresh.equivalence, Equivalence::None);
    assert_eq!(fresh.name, old.name);
    assert_eq!(fresh.tags, old.tags);
    assert_eq!(fresh.build_process, old.build_process);
    assert_eq!(fresh.history.len(), 2);
    Ok(())
}
