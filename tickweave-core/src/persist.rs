//! Session persistence for save/load functionality.
//!
//! A save holds the world the session started from, the world it reached
//! and the replay log between them. Loading replays the log from the base
//! world, so a save whose log disagrees with its state is caught before the
//! session resumes.

use crate::config::EngineConfig;
use crate::error::PersistError;
use crate::replay::ReplayLog;
use crate::world::WorldState;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;

/// Current save file version.
pub const SAVE_VERSION: u32 = 1;

/// Everything needed to resume or audit a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedSession {
    /// Save format version for compatibility checking.
    pub version: u32,

    /// Session seed (also inside `config`, duplicated for quick inspection).
    pub seed: u64,

    pub config: EngineConfig,

    /// World at the start of the recorded log.
    pub base_world: WorldState,

    /// World at the time of saving.
    pub world: WorldState,

    pub replay_log: ReplayLog,
}

impl SavedSession {
    pub fn new(
        config: EngineConfig,
        base_world: WorldState,
        world: WorldState,
        replay_log: ReplayLog,
    ) -> Self {
        Self {
            version: SAVE_VERSION,
            seed: config.seed,
            config,
            base_world,
            world,
            replay_log,
        }
    }

    /// Save to a JSON file.
    pub async fn save_json(&self, path: impl AsRef<Path>) -> Result<(), PersistError> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).await?;
        Ok(())
    }

    /// Load from a JSON file.
    pub async fn load_json(path: impl AsRef<Path>) -> Result<Self, PersistError> {
        let content = fs::read_to_string(path).await?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, PersistError> {
        // Check the version before decoding the rest, so an old save reports
        // a mismatch rather than a confusing field error.
        #[derive(Deserialize)]
        struct Header {
            version: u32,
        }

        let header: Header = serde_json::from_str(content)?;
        if header.version != SAVE_VERSION {
            return Err(PersistError::VersionMismatch {
                expected: SAVE_VERSION,
                found: header.version,
            });
        }
        Ok(serde_json::from_str(content)?)
    }
}

/// Write a replay log on its own, for sharing a run.
pub async fn export_replay_log(
    log: &ReplayLog,
    path: impl AsRef<Path>,
) -> Result<(), PersistError> {
    fs::write(path, log.to_json()?).await?;
    Ok(())
}

/// Read a replay log written by [`export_replay_log`].
pub async fn import_replay_log(path: impl AsRef<Path>) -> Result<ReplayLog, PersistError> {
    let content = fs::read_to_string(path).await?;
    Ok(ReplayLog::from_json(&content)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replay::RecordKind;
    use tempfile::tempdir;

    fn sample() -> SavedSession {
        let base = WorldState::village();
        let mut world = base.clone();
        world.tick = 1;
        let mut log = ReplayLog::new();
        log.record(1, RecordKind::TickMarker, "", world.snapshot().content_hash(), Some(3));
        SavedSession::new(EngineConfig::new(42), base, world, log)
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session.json");
        let saved = sample();
        saved.save_json(&path).await.unwrap();
        let loaded = SavedSession::load_json(&path).await.unwrap();
        assert_eq!(loaded, saved);
        assert_eq!(loaded.seed, 42);
    }

    #[test]
    fn test_version_mismatch() {
        let mut saved = sample();
        saved.version = 99;
        let json = serde_json::to_string(&saved).unwrap();
        assert!(matches!(
            SavedSession::from_json(&json),
            Err(PersistError::VersionMismatch {
                expected: 1,
                found: 99
            })
        ));
    }

    #[tokio::test]
    async fn test_export_import_log() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.json");
        let saved = sample();
        export_replay_log(&saved.replay_log, &path).await.unwrap();
        let log = import_replay_log(&path).await.unwrap();
        assert_eq!(log, saved.replay_log);
        assert_eq!(log.snapshot_hash(1), saved.replay_log.snapshot_hash(1));
    }

    #[tokio::test]
    async fn test_missing_file() {
        let dir = tempdir().unwrap();
        let result = SavedSession::load_json(dir.path().join("nope.json")).await;
        assert!(matches!(result, Err(PersistError::Io(_))));
    }
}
