//! Replaying a recorded session reproduces every tick, and a tampered log is
//! caught at the tick it was tampered with.

use std::sync::Arc;
use std::time::Duration;
use tickweave_core::replay::RecordKind;
use tickweave_core::testing::{assert_replays, FlakyProvider, ScriptedProvider, TestHarness};
use tickweave_core::world::DefaultRules;
use tickweave_core::{replay, EngineConfig, NarrativePayload, ReplayError, ReplayLog};

async fn recorded(ticks: u64) -> TestHarness {
    let provider = Arc::new(ScriptedProvider::new());
    let mut harness = TestHarness::with_provider(EngineConfig::new(99), provider).unwrap();
    for tick in 1..=ticks {
        let line = match tick {
            10 => Some("cheer 3 0.8 -- Brisa laughs"),
            60 => Some("trigger storm"),
            61 => Some("cheer 999 0.1"),
            250 => Some("spawn Tamsin 1"),
            _ => None,
        };
        if let Some(line) = line {
            harness.input(line).unwrap();
        }
        harness.tick().unwrap();
        if tick % 10 == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
    harness
}

fn replay_to(harness: &TestHarness, log: &ReplayLog, target: u64) -> Result<(), ReplayError> {
    let session = &harness.session;
    let rules = DefaultRules::default();
    replay(session.base_world(), log, target, &rules, session.config()).map(|_| ())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_five_hundred_ticks_replay_cleanly() {
    let harness = recorded(500).await;
    let session = &harness.session;
    let snapshot = session.verify(None).unwrap();
    assert_eq!(snapshot, session.world().snapshot());
    assert_eq!(snapshot.content_hash(), session.snapshot_hash(500).unwrap());

    // Replay to an intermediate tick lands on that tick's recorded hash.
    let mid = session.verify(Some(321)).unwrap();
    assert_eq!(mid.tick, 321);
    assert_eq!(mid.content_hash(), session.snapshot_hash(321).unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_replay_rebuilds_flavor() {
    let harness = recorded(120).await;
    let session = &harness.session;
    let rebuilt = tickweave_core::replay::replay_world(
        session.base_world(),
        session.log(),
        session.tick(),
        session.scheduler().rules(),
        session.config(),
    )
    .unwrap();
    assert_eq!(rebuilt.chronicle, session.world().chronicle);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_corrupted_marker_halts_at_that_tick() {
    let harness = recorded(300).await;
    let session = &harness.session;
    let original = session.snapshot_hash(200).unwrap().to_string();

    let mut log = session.log().clone();
    let index = log
        .iter()
        .position(|r| r.tick == 200 && r.kind == RecordKind::TickMarker)
        .unwrap();
    let bogus = "0".repeat(64);
    log.get_mut(index).unwrap().output = bogus.clone();

    let rules = DefaultRules::default();
    let result = replay(session.base_world(), &log, 300, &rules, session.config());
    match result {
        Err(ReplayError::Divergence {
            tick,
            expected,
            actual,
        }) => {
            assert_eq!(tick, 200);
            assert_eq!(expected, bogus);
            assert_eq!(actual, original);
        }
        other => panic!("expected divergence at tick 200, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_missing_marker_is_reported() {
    let harness = recorded(20).await;
    let result = replay_to(&harness, harness.session.log(), 25);
    assert!(matches!(result, Err(ReplayError::MissingMarker(21))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_retries_and_fallbacks_replay() {
    let mut config = EngineConfig::new(5);
    config.queue.max_retries = 1;
    config.queue.backoff_base_ms = 20;
    let mut harness = TestHarness::with_provider(config, Arc::new(FlakyProvider::new(6))).unwrap();
    harness.input("trigger festival").unwrap();
    harness.input("cheer 3 0.9").unwrap();
    harness.run(1).unwrap();
    harness.settle(200).await.unwrap();
    assert!(harness.session.queue_stats().failed + harness.session.queue_stats().succeeded >= 1);
    assert_replays(&harness);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tampered_request_is_caught() {
    let harness = recorded(100).await;
    let mut log = harness.session.log().clone();
    let index = log
        .iter()
        .position(|r| r.kind == RecordKind::RequestEnqueued)
        .unwrap();
    let tick = log.iter().nth(index).unwrap().tick;
    let record = log.get_mut(index).unwrap();
    record.input_digest = "deadbeefdeadbeef".into();
    record.output = "low".into();

    match replay_to(&harness, &log, 100) {
        Err(ReplayError::RequestDivergence {
            tick: at,
            expected,
            actual,
        }) => {
            assert_eq!(at, tick);
            assert!(expected.contains(&"low:deadbeefdeadbeef".to_string()));
            assert_eq!(expected.len(), actual.len());
            assert!(!actual.iter().any(|r| r.contains("deadbeef")));
        }
        other => panic!("expected request divergence at tick {tick}, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_player_request_priority_is_checked() {
    let harness = recorded(20).await;
    let mut log = harness.session.log().clone();
    let index = log
        .iter()
        .position(|r| r.tick == 10 && r.kind == RecordKind::RequestEnqueued && r.output == "high")
        .unwrap();
    log.get_mut(index).unwrap().output = "medium".into();

    let result = replay_to(&harness, &log, 20);
    assert!(matches!(result, Err(ReplayError::RequestDivergence { tick: 10, .. })));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_interactive_requests_do_not_affect_replay() {
    let mut harness = recorded(30).await;
    let payload = NarrativePayload::new("question").with_fact("asked", "who rules the village");
    assert!(harness.session.enqueue_interactive("ask", payload).is_accepted());
    harness.run(10).unwrap();
    assert_replays(&harness);
}
