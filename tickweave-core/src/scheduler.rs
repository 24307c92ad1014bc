//! The tick scheduler.
//!
//! One call to [`TickScheduler::run_tick`] runs one fixed step:
//!
//! 1. advance the tick counter
//! 2. apply at most one queued player input
//! 3. run world updates in id order
//! 4. detect changes and enqueue narrative requests
//! 5. collect finished requests and attach their text as flavor
//! 6. check and repair invariants
//! 7. write the tick marker and timing metrics
//!
//! Nothing in a tick waits on a narrative call. Flavor text never feeds back
//! into the authoritative state, so the snapshot hash depends only on the
//! seed, the starting world and the player inputs.

use crate::config::EngineConfig;
use crate::detector::{ChangeDetector, ChangeEvent};
use crate::error::{EngineError, InputError, Result};
use crate::hashing::short_digest;
use crate::metrics::{StepTimings, TickMetrics};
use crate::narrative::{NarrativePayload, Origin};
use crate::queue::{Completed, EnqueueOutcome, Outcome, Priority, RequestQueue};
use crate::replay::{CallTiming, RecordKind, ReplayLog};
use crate::rng::TickRng;
use crate::world::{
    run_updates, validate_and_repair, FlavorEntry, FlavorSource, InvariantViolation, PlayerInput,
    WorldRules, WorldSnapshot, WorldState,
};
use std::collections::VecDeque;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Advance the tick counter and take the tick-start snapshot.
pub(crate) fn start_tick(world: &mut WorldState) -> WorldSnapshot {
    world.tick += 1;
    world.fired_events.clear();
    world.snapshot()
}

/// Apply a player input, keeping any typed flavor text.
pub(crate) fn apply_input(
    world: &mut WorldState,
    input: &PlayerInput,
    max_flavor: usize,
) -> std::result::Result<(), InputError> {
    input.apply(world)?;
    if let Some(text) = &input.flavor {
        let entry = FlavorEntry {
            tick: world.tick,
            origin: Origin::Input { tick: world.tick },
            text: text.clone(),
            source: FlavorSource::Player,
        };
        world.add_flavor(entry, max_flavor);
    }
    Ok(())
}

/// What happened to the player input handled on a tick.
#[derive(Debug, Clone, PartialEq)]
pub enum InputResult {
    Applied(PlayerInput),
    Rejected { input: PlayerInput, error: InputError },
}

/// Summary of one tick.
#[derive(Debug, Clone)]
pub struct TickReport {
    pub tick: u64,
    pub input: Option<InputResult>,
    pub events: Vec<ChangeEvent>,
    pub enqueued: Vec<EnqueueOutcome>,
    pub applied: Vec<Completed>,
    pub violations: Vec<InvariantViolation>,
    pub snapshot_hash: String,
    pub timings: StepTimings,
    pub slow: bool,
}

/// Drives the simulation one tick at a time.
pub struct TickScheduler {
    world: WorldState,
    config: EngineConfig,
    rules: Box<dyn WorldRules>,
    detector: ChangeDetector,
    queue: RequestQueue,
    log: ReplayLog,
    inputs: VecDeque<PlayerInput>,
    metrics: TickMetrics,
}

impl TickScheduler {
    pub fn new(
        world: WorldState,
        config: EngineConfig,
        rules: Box<dyn WorldRules>,
        queue: RequestQueue,
    ) -> Self {
        Self {
            detector: ChangeDetector::new(config.detector.clone()),
            world,
            config,
            rules,
            queue,
            log: ReplayLog::new(),
            inputs: VecDeque::new(),
            metrics: TickMetrics::new(),
        }
    }

    /// Continue an existing log (after a load).
    pub fn with_log(mut self, log: ReplayLog) -> Self {
        self.log = log;
        self
    }

    /// Queue a player input; one is applied per tick, oldest first.
    pub fn queue_input(&mut self, input: PlayerInput) {
        self.inputs.push_back(input);
    }

    /// Issue a player-facing (High priority) request outside the tick flow.
    pub fn enqueue_interactive(
        &mut self,
        label: impl Into<String>,
        payload: NarrativePayload,
    ) -> EnqueueOutcome {
        let tick = self.world.tick;
        let origin = Origin::Interactive {
            label: label.into(),
        };
        self.submit(Priority::High, payload, origin, tick)
    }

    fn submit(
        &mut self,
        priority: Priority,
        payload: NarrativePayload,
        origin: Origin,
        tick: u64,
    ) -> EnqueueOutcome {
        let digest = payload.digest();
        let outcome = self.queue.submit(priority, payload, origin.clone(), tick);
        let note = serde_json::to_string(&outcome).unwrap_or_default();
        self.log
            .record(tick, RecordKind::RequestEnqueued, digest, priority.to_string(), None)
            .with_origin(origin)
            .with_note(note);
        self.metrics.requests += 1;
        outcome
    }

    /// Run one tick. See the module docs for the step order.
    ///
    /// The tick always completes. An unrecoverable invariant violation is
    /// returned as an error after the tick has been recorded.
    pub fn run_tick(&mut self) -> Result<TickReport> {
        let started = Instant::now();
        let mut timings = StepTimings::default();
        let max_flavor = self.config.scheduler.max_flavor_entries;

        // 1. Advance.
        let prev = start_tick(&mut self.world);
        let tick = self.world.tick;
        let mut rng = TickRng::for_tick(self.config.seed, tick);

        // 2. Player input.
        let step = Instant::now();
        let input = self.inputs.pop_front().map(|input| self.handle_input(input, max_flavor));
        timings.input = step.elapsed();

        // 3. World updates.
        let step = Instant::now();
        run_updates(&mut self.world, self.rules.as_ref(), &mut rng);
        timings.update = step.elapsed();

        // 4. Change detection.
        let step = Instant::now();
        let events = self.detector.detect(&prev, &self.world.snapshot());
        let mut enqueued = Vec::with_capacity(events.len());
        for event in &events {
            let payload = event.payload();
            self.log
                .record(tick, RecordKind::ChangeDetected, payload.digest(), event.kind(), None);
            let outcome = self.submit(Priority::Medium, payload, event.origin(tick), tick);
            if !outcome.is_accepted() {
                debug!(tick, kind = event.kind(), "queue saturated, skipping narration");
            }
            enqueued.push(outcome);
        }
        if let Some(InputResult::Applied(applied)) = &input {
            let payload = applied.payload(&self.world);
            enqueued.push(self.submit(Priority::High, payload, Origin::Input { tick }, tick));
        }
        timings.detect = step.elapsed();

        // 5. Narrative results.
        let step = Instant::now();
        let applied = self.queue.poll_completed(tick);
        for completed in &applied {
            self.record_completion(tick, completed);
            self.world.add_flavor(
                FlavorEntry {
                    tick,
                    origin: completed.origin.clone(),
                    text: completed.outcome.text().to_string(),
                    source: completed.outcome.source(),
                },
                max_flavor,
            );
        }
        timings.results = step.elapsed();

        // 6. Invariants.
        let step = Instant::now();
        let violations = validate_and_repair(&mut self.world);
        for violation in &violations {
            if violation.is_fatal() {
                error!(tick, %violation, "unrecoverable invariant violation");
            } else {
                warn!(tick, %violation, "invariant violation repaired");
            }
        }
        timings.validate = step.elapsed();

        // 7. Tick marker and metrics.
        let step = Instant::now();
        let snapshot_hash = self.world.snapshot().content_hash();
        self.log
            .record(
                tick,
                RecordKind::TickMarker,
                prev.content_hash(),
                snapshot_hash.clone(),
                Some(rng.seed()),
            )
            .with_draws(rng.draws());
        timings.record = step.elapsed();
        timings.total = started.elapsed();

        let slow = timings.budgeted() > self.config.scheduler.budget();
        if slow {
            warn!(
                tick,
                elapsed_ms = timings.budgeted().as_secs_f64() * 1000.0,
                budget_ms = self.config.scheduler.budget_ms,
                "slow tick"
            );
        }
        self.metrics.record_tick(timings, slow);
        self.metrics.events += events.len() as u64;
        self.metrics.applied += applied.len() as u64;
        self.metrics.violations += violations.len() as u64;

        if let Some(fatal) = violations.iter().find(|v| v.is_fatal()) {
            return Err(EngineError::Invariant {
                tick,
                violation: fatal.clone(),
            });
        }

        Ok(TickReport {
            tick,
            input,
            events,
            enqueued,
            applied,
            violations,
            snapshot_hash,
            timings,
            slow,
        })
    }

    /// Run `count` ticks, stopping at the first error.
    pub fn run_ticks(&mut self, count: u64) -> Result<Vec<TickReport>> {
        (0..count).map(|_| self.run_tick()).collect()
    }

    fn handle_input(&mut self, input: PlayerInput, max_flavor: usize) -> InputResult {
        let tick = self.world.tick;
        let digest = short_digest(&input);
        let json = serde_json::to_string(&input).unwrap_or_default();
        match apply_input(&mut self.world, &input, max_flavor) {
            Ok(()) => {
                debug!(tick, command = input.verb(), "player input applied");
                self.log.record(tick, RecordKind::PlayerInput, digest, json, None);
                self.metrics.inputs_applied += 1;
                InputResult::Applied(input)
            }
            Err(error) => {
                info!(tick, command = input.verb(), %error, "player input rejected");
                self.log
                    .record(tick, RecordKind::InputRejected, digest, json, None)
                    .with_note(error.to_string());
                self.metrics.inputs_rejected += 1;
                InputResult::Rejected { input, error }
            }
        }
    }

    fn record_completion(&mut self, tick: u64, completed: &Completed) {
        let timing = CallTiming {
            dispatched_tick: completed.dispatched_tick,
            completed_tick: completed.completed_tick,
            attempts: completed.attempts,
            latency_ms: completed.latency.map(|d| d.as_millis() as u64),
            retries: completed.retries.clone(),
        };
        let digest = completed.payload.digest();
        let record = match &completed.outcome {
            Outcome::Success { text, .. } => {
                self.log
                    .record(tick, RecordKind::ExternalResponse, digest, text.clone(), None)
            }
            Outcome::Failed { reason, fallback } => self
                .log
                .record(tick, RecordKind::Fallback, digest, fallback.clone(), None)
                .with_note(reason.to_string()),
        };
        record
            .with_origin(completed.origin.clone())
            .with_timing(timing);
    }

    pub fn world(&self) -> &WorldState {
        &self.world
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn rules(&self) -> &dyn WorldRules {
        self.rules.as_ref()
    }

    pub fn log(&self) -> &ReplayLog {
        &self.log
    }

    pub fn queue(&self) -> &RequestQueue {
        &self.queue
    }

    pub fn queue_mut(&mut self) -> &mut RequestQueue {
        &mut self.queue
    }

    pub fn metrics(&self) -> &TickMetrics {
        &self.metrics
    }

    /// Player inputs not yet applied.
    pub fn pending_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn tick(&self) -> u64 {
        self.world.tick
    }
}
