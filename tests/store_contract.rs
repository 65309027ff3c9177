// tests/store_contract.rs

//! Contract tests for the SQLite target store.

use overseer::errors::OverseerError;
use overseer::store::TargetStore;
use overseer::target::{Cause, Equivalence, State};
use overseer_test_utils::builders::TargetBuilder;
use overseer_test_utils::init_tracing;

async fn memory_store() -> TargetStore {
    TargetStore::connect("sqlite::memory:")
        .await
        .expect("in-memory store connects")
}

#[tokio::test]
async fn put_then_get_roundtrips() {
    init_tracing();
    let store = memory_store().await;

    let target = TargetBuilder::new("a")
        .shell("echo hello")
        .tag("demo")
        .active()
        .build();
    store.put(&target).await.unwrap();

    let loaded = store.get("a").await.unwrap();
    assert_eq!(loaded, target);
}

#[tokio::test]
async fn get_of_unknown_id_is_not_found() {
    init_tracing();
    let store = memory_store().await;
    let err = store.get("missing").await.unwrap_err();
    assert!(matches!(err, OverseerError::NotFound(_)));
}

#[tokio::test]
async fn put_is_an_idempotent_upsert() {
    init_tracing();
    let store = memory_store().await;

    let target = TargetBuilder::new("a").shell("true").build();
    store.put(&target).await.unwrap();
    store.put(&target).await.unwrap();

    assert_eq!(store.iter_all().await.unwrap().len(), 1);
}

#[tokio::test]
async fn update_appends_history_and_maintains_indexes() {
    init_tracing();
    let store = memory_store().await;

    let target = TargetBuilder::new("a").shell("true").build();
    store.put(&target).await.unwrap();

    // Passive: alive but not active.
    assert_eq!(store.iter_alive().await.unwrap().len(), 1);
    assert_eq!(store.iter_active().await.unwrap().len(), 0);

    let updated = store
        .update("a", |t| t.activate(Cause::User))
        .await
        .unwrap();
    assert!(matches!(updated.state(), State::Activable));
    assert_eq!(store.iter_active().await.unwrap().len(), 1);

    // Drive it terminal: drops out of both listings.
    store
        .update("a", |t| {
            t.push(State::Killed, Cause::User);
            t.push(State::Dead("killed".into()), Cause::engine("killed"));
        })
        .await
        .unwrap();
    assert_eq!(store.iter_alive().await.unwrap().len(), 0);
    assert_eq!(store.iter_active().await.unwrap().len(), 0);

    let loaded = store.get("a").await.unwrap();
    assert!(loaded.is_terminal());
    assert_eq!(loaded.history.len(), 4);
}

#[tokio::test]
async fn update_of_unknown_id_is_not_found() {
    init_tracing();
    let store = memory_store().await;
    let err = store.update("missing", |_| {}).await.unwrap_err();
    assert!(matches!(err, OverseerError::NotFound(_)));
}

#[tokio::test]
async fn find_equivalent_matches_only_alive_same_shape_targets() {
    init_tracing();
    let store = memory_store().await;

    let canonical = TargetBuilder::new("one")
        .shell("make genome")
        .equivalence(Equivalence::SameMakeAndCondition)
        .active()
        .build();
    store.put(&canonical).await.unwrap();

    let same_shape = TargetBuilder::new("two")
        .shell("make genome")
        .equivalence(Equivalence::SameMakeAndCondition)
        .build();
    assert_eq!(
        store.find_equivalent(&same_shape).await.unwrap(),
        Some("one".to_string())
    );

    let different_program = TargetBuilder::new("three")
        .shell("make other")
        .equivalence(Equivalence::SameMakeAndCondition)
        .build();
    assert_eq!(store.find_equivalent(&different_program).await.unwrap(), None);

    let opted_out = TargetBuilder::new("four").shell("make genome").build();
    assert_eq!(store.find_equivalent(&opted_out).await.unwrap(), None);

    // Dead canonical targets stop being equivalence anchors.
    store
        .update("one", |t| {
            t.push(State::Killed, Cause::User);
            t.push(State::Dead("killed".into()), Cause::engine("killed"));
        })
        .await
        .unwrap();
    assert_eq!(store.find_equivalent(&same_shape).await.unwrap(), None);
}

#[tokio::test]
async fn count_alive_tracks_both_gauges() {
    init_tracing();
    let store = memory_store().await;

    store
        .put(&TargetBuilder::new("p").shell("true").build())
        .await
        .unwrap();
    store
        .put(&TargetBuilder::new("a").shell("true").active().build())
        .await
        .unwrap();

    let (alive, active) = store.count_alive().await.unwrap();
    assert_eq!((alive, active), (2, 1));
}
