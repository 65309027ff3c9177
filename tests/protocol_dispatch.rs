// tests/protocol_dispatch.rs

//! Protocol dispatcher behaviour: request/response mapping, read-only mode,
//! deferred id lists, and blocking queries.

use std::error::Error;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use overseer::config::Profile;
use overseer::engine::{Driver, DriverOptions, Engine};
use overseer::protocol::{DownMessage, QueryOption, TimeSpec, UpMessage};
use overseer::server::{dispatch, AppState};
use overseer::store::TargetStore;
use overseer::target::query::{Filter, StatusFilter, TargetQuery};
use overseer::target::SimpleStatus;
use overseer_test_utils::builders::{ProfileBuilder, TargetBuilder};
use overseer_test_utils::fake_executor::FakeHostExecutor;
use overseer_test_utils::init_tracing;

type TestResult = Result<(), Box<dyn Error>>;

async fn state_with(profile: Profile) -> AppState {
    let store = TargetStore::connect("sqlite::memory:")
        .await
        .expect("in-memory store connects");
    let engine = Arc::new(Engine::new(
        store,
        Arc::new(FakeHostExecutor::new()),
        &profile,
    ));
    let (cmd_tx, _cmd_rx) = mpsc::channel(16);
    AppState::new(engine, cmd_tx, &profile)
}

#[tokio::test]
async fn submit_then_get_returns_the_target_verbatim() -> TestResult {
    init_tracing();
    let state = state_with(ProfileBuilder::new().build()).await;

    let target = TargetBuilder::new("t1")
        .shell("echo hi")
        .tag("demo")
        .active()
        .build();

    let reply = dispatch(&state, UpMessage::SubmitTargets(vec![target.clone()])).await?;
    assert_eq!(reply, DownMessage::Ok);

    let reply = dispatch(&state, UpMessage::GetTargets(vec!["t1".to_string()])).await?;
    match reply {
        DownMessage::ListOfTargets(targets) => assert_eq!(targets, vec![target]),
        other => panic!("unexpected reply: {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn empty_id_list_means_all_targets() -> TestResult {
    init_tracing();
    let state = state_with(ProfileBuilder::new().build()).await;

    for id in ["a", "b", "c"] {
        dispatch(
            &state,
            UpMessage::SubmitTargets(vec![TargetBuilder::new(id).shell("true").build()]),
        )
        .await?;
    }

    match dispatch(&state, UpMessage::GetTargets(vec![])).await? {
        DownMessage::ListOfTargets(targets) => assert_eq!(targets.len(), 3),
        other => panic!("unexpected reply: {other:?}"),
    }

    match dispatch(&state, UpMessage::GetTargetSummaries(vec![])).await? {
        DownMessage::ListOfTargetSummaries(summaries) => {
            assert_eq!(summaries.len(), 3);
            assert!(summaries
                .iter()
                .all(|s| s.status == SimpleStatus::Activable && s.state == "Passive"));
        }
        other => panic!("unexpected reply: {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn flat_states_since_filters_old_entries() -> TestResult {
    init_tracing();
    let state = state_with(ProfileBuilder::new().build()).await;

    dispatch(
        &state,
        UpMessage::SubmitTargets(vec![TargetBuilder::new("t").shell("true").active().build()]),
    )
    .await?;

    match dispatch(
        &state,
        UpMessage::GetTargetFlatStates {
            time: TimeSpec::All,
            ids: vec![],
            options: vec![],
        },
    )
    .await?
    {
        DownMessage::ListOfTargetFlatStates(states) => {
            assert_eq!(states.len(), 1);
            // Passive + Activable.
            assert_eq!(states[0].entries.len(), 2);
        }
        other => panic!("unexpected reply: {other:?}"),
    }

    let far_future = (chrono::Utc::now() + chrono::Duration::hours(1)).timestamp() as f64;
    match dispatch(
        &state,
        UpMessage::GetTargetFlatStates {
            time: TimeSpec::Since(far_future),
            ids: vec![],
            options: vec![],
        },
    )
    .await?
    {
        DownMessage::ListOfTargetFlatStates(states) => {
            assert!(states[0].entries.is_empty());
        }
        other => panic!("unexpected reply: {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn large_id_lists_are_deferred_and_paginated() -> TestResult {
    init_tracing();
    let state = state_with(ProfileBuilder::new().deferred_threshold(5).build()).await;

    let batch: Vec<_> = (0..12)
        .map(|i| TargetBuilder::new(&format!("t{i:02}")).shell("true").build())
        .collect();
    dispatch(&state, UpMessage::SubmitTargets(batch)).await?;

    let query = UpMessage::GetTargetIds {
        query: TargetQuery::default(),
        options: vec![],
    };
    let (token, total) = match dispatch(&state, query).await? {
        DownMessage::DeferredListOfTargetIds { id, total } => (id, total),
        other => panic!("expected a deferred list, got {other:?}"),
    };
    assert_eq!(total, 12);

    let mut collected = Vec::new();
    let mut index = 0;
    loop {
        match dispatch(
            &state,
            UpMessage::GetDeferred {
                id: token.clone(),
                index,
                length: 5,
            },
        )
        .await?
        {
            DownMessage::ListOfTargetIds(ids) => {
                if ids.is_empty() {
                    break;
                }
                index += ids.len();
                collected.extend(ids);
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }
    assert_eq!(collected.len(), 12);
    assert_eq!(collected[0], "t00");
    assert_eq!(collected[11], "t11");

    // Unknown tokens (e.g. after an engine restart) are reported as missing.
    match dispatch(
        &state,
        UpMessage::GetDeferred {
            id: "expired-token".into(),
            index: 0,
            length: 5,
        },
    )
    .await?
    {
        DownMessage::MissingDeferred => {}
        other => panic!("unexpected reply: {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn read_only_mode_rejects_mutations_but_answers_queries() -> TestResult {
    init_tracing();
    let state = state_with(ProfileBuilder::new().read_only(true).build()).await;

    // Seed a target below the protocol layer; the read-only gate applies to
    // client messages, not to the engine itself.
    state
        .engine
        .submit_targets(vec![TargetBuilder::new("seeded")
            .shell("true")
            .active()
            .build()])
        .await?;

    // Dispatch-level checks go through the same is_mutation gate the HTTP
    // handler uses.
    let submit = UpMessage::SubmitTargets(vec![TargetBuilder::new("x").shell("true").build()]);
    assert!(submit.is_mutation());
    assert!(UpMessage::KillTargets(vec!["x".into()]).is_mutation());
    assert!(UpMessage::RestartTargets(vec!["x".into()]).is_mutation());
    assert!(!UpMessage::GetServerStatus.is_mutation());

    match dispatch(&state, UpMessage::GetServerStatus).await? {
        DownMessage::ServerStatus(status) => {
            assert!(status.read_only);
            assert_eq!(status.alive_targets, 1);
        }
        other => panic!("unexpected reply: {other:?}"),
    }

    // The status-log query is a pure read and stays available in read-only
    // mode.
    let call = UpMessage::CallQuery {
        id: "seeded".into(),
        query: "status-log".into(),
    };
    assert!(!call.is_mutation());
    match dispatch(&state, call).await? {
        DownMessage::QueryResult(log) => assert!(log.contains("Activable")),
        other => panic!("unexpected reply: {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn kill_of_unknown_target_is_an_error() {
    init_tracing();
    let state = state_with(ProfileBuilder::new().build()).await;
    let result = dispatch(&state, UpMessage::KillTargets(vec!["ghost".into()])).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn available_queries_include_the_status_log() -> TestResult {
    init_tracing();
    let state = state_with(ProfileBuilder::new().build()).await;
    dispatch(
        &state,
        UpMessage::SubmitTargets(vec![TargetBuilder::new("q").shell("true").active().build()]),
    )
    .await?;

    match dispatch(&state, UpMessage::GetAvailableQueries("q".into())).await? {
        DownMessage::ListOfQueryDescriptions(queries) => {
            assert!(queries.iter().any(|q| q.name == "status-log"));
        }
        other => panic!("unexpected reply: {other:?}"),
    }

    match dispatch(
        &state,
        UpMessage::CallQuery {
            id: "q".into(),
            query: "status-log".into(),
        },
    )
    .await?
    {
        DownMessage::QueryResult(log) => {
            assert!(log.contains("Passive"));
            assert!(log.contains("Activable"));
        }
        other => panic!("unexpected reply: {other:?}"),
    }

    match dispatch(
        &state,
        UpMessage::CallQuery {
            id: "q".into(),
            query: "no-such-query".into(),
        },
    )
    .await?
    {
        DownMessage::QueryError(_) => {}
        other => panic!("unexpected reply: {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn process_subprotocol_reaches_the_executor_hook() -> TestResult {
    init_tracing();
    let state = state_with(ProfileBuilder::new().build()).await;
    let payload = serde_json::json!({"list": "connections"});
    match dispatch(&state, UpMessage::Process(payload.clone())).await? {
        DownMessage::Process(answer) => {
            assert_eq!(answer, serde_json::json!({"echo": payload}));
        }
        other => panic!("unexpected reply: {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn blocking_query_with_no_match_returns_empty_at_the_timeout() -> TestResult {
    init_tracing();
    let state = state_with(ProfileBuilder::new().build()).await;

    let started = Instant::now();
    let reply = dispatch(
        &state,
        UpMessage::GetTargetIds {
            query: TargetQuery {
                filter: Filter::False,
                ..Default::default()
            },
            options: vec![QueryOption::BlockIfEmptyAtMost(0.5)],
        },
    )
    .await?;
    let elapsed = started.elapsed();

    assert_eq!(reply, DownMessage::ListOfTargetIds(vec![]));
    assert!(elapsed >= Duration::from_millis(400), "returned too early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "returned too late: {elapsed:?}");
    Ok(())
}

#[tokio::test]
async fn blocking_query_returns_as_soon_as_a_match_commits() -> TestResult {
    init_tracing();
    let profile = ProfileBuilder::new().build();
    let store = TargetStore::connect("sqlite::memory:").await?;
    let engine = Arc::new(Engine::new(
        store,
        Arc::new(FakeHostExecutor::new()),
        &profile,
    ));
    let (cmd_tx, cmd_rx) = mpsc::channel(16);
    let state = AppState::new(engine.clone(), cmd_tx, &profile);

    // Run the driver so the submission actually executes and commits.
    let driver = tokio::spawn(
        Driver::new(engine.clone(), cmd_rx, DriverOptions::default()).run(),
    );

    let submitter = {
        let engine = engine.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            engine
                .submit_targets(vec![TargetBuilder::new("late")
                    .shell("true")
                    .active()
                    .build()])
                .await
                .expect("submission succeeds");
        })
    };

    let started = Instant::now();
    let reply = dispatch(
        &state,
        UpMessage::GetTargetIds {
            query: TargetQuery {
                filter: Filter::Status(StatusFilter::Simple(SimpleStatus::Successful)),
                ..Default::default()
            },
            options: vec![QueryOption::BlockIfEmptyAtMost(5.0)],
        },
    )
    .await?;
    let elapsed = started.elapsed();

    assert_eq!(reply, DownMessage::ListOfTargetIds(vec!["late".to_string()]));
    assert!(elapsed < Duration::from_secs(5), "blocked all the way: {elapsed:?}");

    submitter.await?;
    driver.abort();
    Ok(())
}
