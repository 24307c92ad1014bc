//! Append-only replay log and the replay driver.
//!
//! Everything that happens on a tick is recorded: the player input, each
//! detected change, each enqueued request, each narrative result and a final
//! tick marker holding the snapshot hash, the tick seed and the number of
//! seeded draws. Replaying re-runs the deterministic steps from a saved
//! world, takes narrative text from the log instead of calling out, and
//! stops at the first tick whose recomputed state disagrees with the record.

use crate::config::EngineConfig;
use crate::detector::ChangeDetector;
use crate::error::{ReplayError, ReplayResult};
use crate::narrative::Origin;
use crate::queue::{Priority, RetryDraw};
use crate::rng::TickRng;
use crate::scheduler::{apply_input, start_tick};
use crate::world::{
    run_updates, validate_and_repair, FlavorEntry, FlavorSource, PlayerInput, WorldRules,
    WorldSnapshot, WorldState,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// What a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// A player input that was applied. `output` holds the input as JSON.
    PlayerInput,
    /// A player input that failed validation. `output` holds the input as JSON.
    InputRejected,
    /// A change event. `input_digest` is its payload digest, `output` its kind.
    ChangeDetected,
    /// A narrative request handed to the queue.
    RequestEnqueued,
    /// Text returned by the provider or the cache.
    ExternalResponse,
    /// Deterministic text used in place of a failed call.
    Fallback,
    /// End of tick. `output` is the snapshot hash.
    TickMarker,
}

/// Timing of an external call, for diagnosis only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallTiming {
    pub dispatched_tick: Option<u64>,
    pub completed_tick: u64,
    pub attempts: u32,
    /// Wall-clock latency of the last call.
    pub latency_ms: Option<u64>,
    /// Backoff draws made before each retry.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retries: Vec<RetryDraw>,
}

/// One log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayRecord {
    pub tick: u64,
    pub kind: RecordKind,
    pub input_digest: String,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    /// Seeded draws made during the tick (tick markers only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub draws: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<Origin>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timing: Option<CallTiming>,
    /// Free-form detail: rejection reason, failure reason, enqueue outcome.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl ReplayRecord {
    pub fn with_draws(&mut self, draws: u64) -> &mut Self {
        self.draws = Some(draws);
        self
    }

    pub fn with_origin(&mut self, origin: Origin) -> &mut Self {
        self.origin = Some(origin);
        self
    }

    pub fn with_timing(&mut self, timing: CallTiming) -> &mut Self {
        self.timing = Some(timing);
        self
    }

    pub fn with_note(&mut self, note: impl Into<String>) -> &mut Self {
        self.note = Some(note.into());
        self
    }

    /// Flavor text this record contributes, if any.
    fn flavor(&self) -> Option<FlavorEntry> {
        let source = match self.kind {
            RecordKind::ExternalResponse => match &self.timing {
                Some(timing) if timing.attempts == 0 => FlavorSource::Cache,
                _ => FlavorSource::Provider,
            },
            RecordKind::Fallback => FlavorSource::Fallback,
            _ => return None,
        };
        Some(FlavorEntry {
            tick: self.tick,
            origin: self.origin.clone()?,
            text: self.output.clone(),
            source,
        })
    }
}

/// Append-only log, ordered by tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplayLog {
    records: Vec<ReplayRecord>,
}

impl ReplayLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record and return it for optional enrichment.
    ///
    /// Ticks must be non-decreasing; the scheduler guarantees this.
    pub fn record(
        &mut self,
        tick: u64,
        kind: RecordKind,
        input_digest: impl Into<String>,
        output: impl Into<String>,
        seed: Option<u64>,
    ) -> &mut ReplayRecord {
        debug_assert!(self.last_tick().map_or(true, |last| last <= tick));
        self.records.push(ReplayRecord {
            tick,
            kind,
            input_digest: input_digest.into(),
            output: output.into(),
            seed,
            draws: None,
            origin: None,
            timing: None,
            note: None,
        });
        let last = self.records.len() - 1;
        &mut self.records[last]
    }

    /// All records for `tick`, in the order they were written.
    pub fn records_for(&self, tick: u64) -> &[ReplayRecord] {
        let start = self.records.partition_point(|r| r.tick < tick);
        let end = self.records.partition_point(|r| r.tick <= tick);
        &self.records[start..end]
    }

    /// The tick marker for `tick`.
    pub fn marker(&self, tick: u64) -> Option<&ReplayRecord> {
        self.records_for(tick)
            .iter()
            .find(|r| r.kind == RecordKind::TickMarker)
    }

    /// Snapshot hash recorded at the end of `tick`.
    pub fn snapshot_hash(&self, tick: u64) -> Option<&str> {
        self.marker(tick).map(|r| r.output.as_str())
    }

    pub fn last_tick(&self) -> Option<u64> {
        self.records.last().map(|r| r.tick)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReplayRecord> {
        self.records.iter()
    }

    /// Mutable access to one record, for tests that tamper with a log.
    pub fn get_mut(&mut self, index: usize) -> Option<&mut ReplayRecord> {
        self.records.get_mut(index)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Export as pretty JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Import from JSON, checking that ticks never go backwards.
    pub fn from_json(json: &str) -> ReplayResult<Self> {
        let log: Self = serde_json::from_str(json).map_err(|e| ReplayError::CorruptRecord {
            tick: 0,
            reason: e.to_string(),
        })?;
        log.check_order()?;
        Ok(log)
    }

    fn check_order(&self) -> ReplayResult<()> {
        for pair in self.records.windows(2) {
            if pair[1].tick < pair[0].tick {
                return Err(ReplayError::CorruptRecord {
                    tick: pair[1].tick,
                    reason: format!(
                        "record for tick {} follows tick {}",
                        pair[1].tick, pair[0].tick
                    ),
                });
            }
        }
        Ok(())
    }
}

/// Re-execute from `saved` up to `target_tick`, checking every tick.
pub fn replay(
    saved: &WorldState,
    log: &ReplayLog,
    target_tick: u64,
    rules: &dyn WorldRules,
    config: &EngineConfig,
) -> ReplayResult<WorldSnapshot> {
    replay_world(saved, log, target_tick, rules, config).map(|world| world.snapshot())
}

/// Like [`replay`], but returns the full world including rebuilt flavor text.
pub fn replay_world(
    saved: &WorldState,
    log: &ReplayLog,
    target_tick: u64,
    rules: &dyn WorldRules,
    config: &EngineConfig,
) -> ReplayResult<WorldState> {
    if target_tick < saved.tick {
        return Err(ReplayError::TargetBeforeBase {
            target: target_tick,
            base: saved.tick,
        });
    }

    let detector = ChangeDetector::new(config.detector.clone());
    let mut world = saved.clone();
    info!(from = saved.tick, to = target_tick, "replaying");

    while world.tick < target_tick {
        let prev = start_tick(&mut world);
        let tick = world.tick;
        let records = log.records_for(tick);
        let marker = records
            .iter()
            .find(|r| r.kind == RecordKind::TickMarker)
            .ok_or(ReplayError::MissingMarker(tick))?;

        let mut rng = TickRng::for_tick(config.seed, tick);
        let max_flavor = config.scheduler.max_flavor_entries;

        let mut applied = None;
        if let Some(record) = records
            .iter()
            .find(|r| matches!(r.kind, RecordKind::PlayerInput | RecordKind::InputRejected))
        {
            let input: PlayerInput =
                serde_json::from_str(&record.output).map_err(|e| ReplayError::CorruptRecord {
                    tick,
                    reason: format!("player input: {e}"),
                })?;
            // A rejected input leaves the world untouched, live and here.
            match apply_input(&mut world, &input, max_flavor) {
                Ok(()) => applied = Some(input),
                Err(error) => debug!(tick, %error, "replayed input rejected"),
            }
        }

        run_updates(&mut world, rules, &mut rng);

        let events = detector.detect(&prev, &world.snapshot());
        let actual_events: Vec<String> = events
            .iter()
            .map(|e| format!("{}:{}", e.kind(), e.payload().digest()))
            .collect();
        let expected_events: Vec<String> = records
            .iter()
            .filter(|r| r.kind == RecordKind::ChangeDetected)
            .map(|r| format!("{}:{}", r.output, r.input_digest))
            .collect();

        // Requests the tick itself raised: one per event, then the input's.
        let mut actual_requests: Vec<String> = events
            .iter()
            .map(|e| format!("{}:{}", Priority::Medium, e.payload().digest()))
            .collect();
        if let Some(input) = &applied {
            let digest = input.payload(&world).digest();
            actual_requests.push(format!("{}:{digest}", Priority::High));
        }
        let expected_requests: Vec<String> = records
            .iter()
            .filter(|r| r.kind == RecordKind::RequestEnqueued)
            .filter(|r| !matches!(r.origin, Some(Origin::Interactive { .. })))
            .map(|r| format!("{}:{}", r.output, r.input_digest))
            .collect();

        for entry in records.iter().filter_map(ReplayRecord::flavor) {
            world.add_flavor(entry, max_flavor);
        }

        validate_and_repair(&mut world);

        let actual = world.snapshot().content_hash();
        if actual != marker.output {
            warn!(tick, expected = %marker.output, %actual, "replay diverged");
            return Err(ReplayError::Divergence {
                tick,
                expected: marker.output.clone(),
                actual,
            });
        }
        if actual_events != expected_events {
            return Err(ReplayError::EventDivergence {
                tick,
                expected: expected_events,
                actual: actual_events,
            });
        }
        if actual_requests != expected_requests {
            return Err(ReplayError::RequestDivergence {
                tick,
                expected: expected_requests,
                actual: actual_requests,
            });
        }
        let expected_seed = marker.seed.unwrap_or_default();
        let expected_draws = marker.draws.unwrap_or_default();
        if expected_seed != rng.seed() || expected_draws != rng.draws() {
            return Err(ReplayError::RngDivergence {
                tick,
                expected_seed,
                actual_seed: rng.seed(),
                expected_draws,
                actual_draws: rng.draws(),
            });
        }
    }

    Ok(world)
}
