//! Save, load and resume.

use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tickweave_core::error::PersistError;
use tickweave_core::persist::{export_replay_log, import_replay_log};
use tickweave_core::testing::{ScriptedProvider, TestHarness};
use tickweave_core::{EngineConfig, EngineError, ReplayError, SavedSession, Session};

async fn played(seed: u64, ticks: u64) -> TestHarness {
    let provider = Arc::new(ScriptedProvider::new());
    let mut harness = TestHarness::with_provider(EngineConfig::new(seed), provider).unwrap();
    harness.input("cheer 5 0.7 -- Dalia sings").unwrap();
    harness.input("trigger festival").unwrap();
    for _ in 0..ticks {
        harness.tick().unwrap();
        tokio::time::sleep(Duration::from_micros(200)).await;
    }
    harness
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_save_load_resume_matches_uninterrupted_run() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("village.json");

    let mut harness = played(77, 100).await;
    harness.session.save(&path).await.unwrap();

    let mut resumed = Session::load(&path, Arc::new(ScriptedProvider::new())).await.unwrap();
    assert_eq!(resumed.tick(), 100);
    assert_eq!(resumed.world().snapshot(), harness.world().snapshot());
    assert_eq!(resumed.world().chronicle, harness.world().chronicle);

    resumed.queue_command("grant 13 30").unwrap();
    harness.input("grant 13 30").unwrap();
    let a = resumed.run_ticks(50).unwrap();
    harness.run(50).unwrap();
    assert_eq!(a.last().unwrap().snapshot_hash, harness.reports().last().unwrap().snapshot_hash);
    resumed.verify(None).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_load_rejects_tampered_world() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("tampered.json");

    let harness = played(78, 40).await;
    let mut saved = harness.session.to_saved();
    if let Some(resource) = saved.world.resources.values_mut().next() {
        resource.quantity += 1000.0;
    }
    saved.save_json(&path).await.unwrap();

    let result = Session::load(&path, Arc::new(ScriptedProvider::new())).await;
    assert!(matches!(
        result,
        Err(EngineError::Replay(ReplayError::Divergence { tick: 40, .. }))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_load_rejects_future_version() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("future.json");

    let harness = played(79, 5).await;
    let mut saved = harness.session.to_saved();
    saved.version += 1;
    saved.save_json(&path).await.unwrap();

    assert!(matches!(
        SavedSession::load_json(&path).await,
        Err(PersistError::VersionMismatch { .. })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_exported_log_replays() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("log.json");

    let harness = played(80, 60).await;
    export_replay_log(harness.session.log(), &path).await.unwrap();
    let log = import_replay_log(&path).await.unwrap();

    let snapshot = tickweave_core::replay(
        harness.session.base_world(),
        &log,
        60,
        harness.session.scheduler().rules(),
        harness.session.config(),
    )
    .unwrap();
    assert_eq!(snapshot, harness.world().snapshot());
}
