//! Request queue behaviour observed through a running session.

use std::sync::Arc;
use std::time::Duration;
use tickweave_core::narrative::Origin;
use tickweave_core::testing::{GatedProvider, TestHarness};
use tickweave_core::world::{DefaultRules, FlavorSource, WorldState};
use tickweave_core::{EnqueueOutcome, EngineConfig, NarrativePayload, Priority};

fn gated(seed: u64, provider: Arc<GatedProvider>) -> TestHarness {
    gated_with(EngineConfig::new(seed), provider)
}

fn gated_with(config: EngineConfig, provider: Arc<GatedProvider>) -> TestHarness {
    TestHarness::with_world(
        config,
        WorldState::village(),
        DefaultRules::quiet(),
        provider,
    )
    .unwrap()
}

fn line(n: usize) -> NarrativePayload {
    NarrativePayload::new("dialogue").with_subject(format!("line {n}"))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ticks_never_wait_on_provider() {
    let provider = Arc::new(GatedProvider::new());
    let mut harness = gated(1, provider.clone());
    harness.input("trigger festival").unwrap();
    harness.run(300).unwrap();
    assert_eq!(harness.world().tick, 300);
    assert!(harness.session.scheduler().queue().in_flight() > 0);
    assert_eq!(harness.flavor_count(FlavorSource::Provider), 0);

    provider.release(16);
    harness.settle(100).await.unwrap();
    assert!(harness.flavor_count(FlavorSource::Provider) > 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_interactive_overflow_beyond_high_cap() {
    let provider = Arc::new(GatedProvider::new());
    let mut harness = gated(2, provider.clone());
    let cap = harness.session.config().queue.high_cap;

    let outcomes: Vec<EnqueueOutcome> = (0..cap + 2)
        .map(|n| harness.session.enqueue_interactive(format!("npc-{n}"), line(n)))
        .collect();
    assert!(outcomes[..cap].iter().all(|o| o.is_accepted()));
    assert!(outcomes[cap..]
        .iter()
        .all(|o| matches!(o, EnqueueOutcome::Overflow { .. })));
    assert_eq!(harness.session.queue_stats().overflowed, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_duplicate_requests_share_one_call() {
    let provider = Arc::new(GatedProvider::new());
    let mut harness = gated(3, provider.clone());
    let first = harness.session.enqueue_interactive("a", line(1));
    let second = harness.session.enqueue_interactive("b", line(1));
    assert!(matches!(first, EnqueueOutcome::Queued { .. }));
    assert!(matches!(second, EnqueueOutcome::Deduplicated { leader, .. } if leader == first.id()));

    harness.tick().unwrap();
    provider.release(1);
    harness.settle(100).await.unwrap();

    let labels: Vec<&Origin> = harness.world().chronicle.iter().map(|e| &e.origin).collect();
    assert_eq!(labels.len(), 2);
    assert_eq!(provider.calls(), 1);
    assert_eq!(harness.world().chronicle[0].text, harness.world().chronicle[1].text);

    // The same payload again is served from the cache.
    let third = harness.session.enqueue_interactive("c", line(1));
    assert!(matches!(third, EnqueueOutcome::CacheHit { .. }));
    harness.tick().unwrap();
    assert_eq!(harness.flavor_count(FlavorSource::Cache), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_high_priority_dispatches_first() {
    let provider = Arc::new(GatedProvider::new());
    let mut config = EngineConfig::new(4);
    config.queue.max_concurrent = 1;
    let mut harness = gated_with(config, provider.clone());

    // Fill the single slot so later requests must wait in their lanes.
    harness.session.enqueue_interactive("busy", line(0));
    harness.tick().unwrap();
    harness.session.enqueue_interactive("later", line(2));
    harness.input("trigger storm").unwrap();
    harness.tick().unwrap();
    let queue = harness.session.scheduler().queue();
    assert_eq!(queue.in_flight(), 1);
    assert_eq!(queue.lane_depth(Priority::High), 2);
    let medium_before = queue.lane_depth(Priority::Medium);
    assert!(medium_before >= 1);

    provider.release(1);
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(2)).await;
        harness.tick().unwrap();
        if provider.calls() >= 2 {
            break;
        }
    }
    // The freed slot went to the waiting High request, not to narration.
    let queue = harness.session.scheduler().queue();
    assert_eq!(queue.lane_depth(Priority::High), 1);
    assert!(queue.lane_depth(Priority::Medium) >= medium_before);
    harness.session.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_cancels_outstanding() {
    let provider = Arc::new(GatedProvider::new());
    let mut harness = gated(5, provider);
    for n in 0..4 {
        harness.session.enqueue_interactive(format!("n{n}"), line(n));
    }
    harness.tick().unwrap();
    let cancelled = harness.session.shutdown();
    assert_eq!(cancelled, 4);
}
