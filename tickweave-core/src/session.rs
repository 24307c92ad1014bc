//! Session - the primary public API.
//!
//! Wraps the tick scheduler, its request queue and worker pool, and the
//! base world the replay log starts from. Handles save/load (with replay
//! verification) and teardown.

use crate::config::EngineConfig;
use crate::error::{ReplayError, ReplayResult, Result};
use crate::metrics::TickMetrics;
use crate::narrative::{FallbackGenerator, NarrativePayload, NarrativeProvider, TemplateFallback};
use crate::persist::SavedSession;
use crate::queue::{EnqueueOutcome, QueueStats, RequestQueue, WorkerPool};
use crate::replay::{replay, replay_world, ReplayLog};
use crate::scheduler::{TickReport, TickScheduler};
use crate::world::{DefaultRules, PlayerInput, WorldRules, WorldSnapshot, WorldState};
use std::path::Path;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::info;

/// Builder for [`Session`].
pub struct SessionBuilder {
    config: EngineConfig,
    world: Option<WorldState>,
    base_world: Option<WorldState>,
    log: ReplayLog,
    rules: Option<Box<dyn WorldRules>>,
    fallback: Option<Arc<dyn FallbackGenerator>>,
    handle: Option<Handle>,
}

impl SessionBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            world: None,
            base_world: None,
            log: ReplayLog::new(),
            rules: None,
            fallback: None,
            handle: None,
        }
    }

    /// Resume from a save. The log is replayed and checked on build.
    pub fn from_saved(saved: SavedSession) -> Self {
        Self {
            config: saved.config,
            world: Some(saved.world),
            base_world: Some(saved.base_world),
            log: saved.replay_log,
            rules: None,
            fallback: None,
            handle: None,
        }
    }

    /// Set the starting world (defaults to [`WorldState::village`]).
    pub fn with_world(mut self, world: WorldState) -> Self {
        self.world = Some(world);
        self
    }

    /// Set the world-update rules (defaults to [`DefaultRules`]).
    pub fn with_rules(mut self, rules: impl WorldRules + 'static) -> Self {
        self.rules = Some(Box::new(rules));
        self
    }

    /// Set the fallback generator (defaults to [`TemplateFallback`]).
    pub fn with_fallback(mut self, fallback: impl FallbackGenerator + 'static) -> Self {
        self.fallback = Some(Arc::new(fallback));
        self
    }

    /// Run workers on this runtime instead of the current one.
    pub fn with_handle(mut self, handle: Handle) -> Self {
        self.handle = Some(handle);
        self
    }

    /// Create the session.
    ///
    /// Must be called inside a tokio runtime unless a handle was given.
    pub fn build(self, provider: Arc<dyn NarrativeProvider>) -> Result<Session> {
        self.config.validate()?;
        let handle = match self.handle {
            Some(handle) => handle,
            None => Handle::try_current()?,
        };
        let rules = self.rules.unwrap_or_else(|| Box::new(DefaultRules::default()));
        let fallback = self.fallback.unwrap_or_else(|| Arc::new(TemplateFallback));
        let world = self.world.unwrap_or_else(WorldState::village);
        let base_world = self.base_world.unwrap_or_else(|| world.clone());

        // A resumed session must reproduce its own history first.
        let world = if self.log.is_empty() {
            world
        } else {
            let target = world.tick;
            let replayed =
                replay_world(&base_world, &self.log, target, rules.as_ref(), &self.config)?;
            let expected = world.snapshot().content_hash();
            let actual = replayed.snapshot().content_hash();
            if expected != actual {
                return Err(ReplayError::Divergence {
                    tick: world.tick,
                    expected,
                    actual,
                }
                .into());
            }
            info!(tick = replayed.tick, records = self.log.len(), "replay log verified");
            replayed
        };

        let workers = WorkerPool::new(handle, provider, self.config.queue.call_timeout());
        let queue = RequestQueue::new(&self.config, workers, fallback);
        info!(
            seed = self.config.seed,
            tick = world.tick,
            provider = queue.provider_name(),
            "session started"
        );
        let scheduler = TickScheduler::new(world, self.config, rules, queue).with_log(self.log);

        Ok(Session {
            scheduler,
            base_world,
        })
    }
}

/// A running simulation.
pub struct Session {
    scheduler: TickScheduler,
    base_world: WorldState,
}

impl Session {
    /// Start a builder.
    pub fn builder(config: EngineConfig) -> SessionBuilder {
        SessionBuilder::new(config)
    }

    /// New session on the sample village with default rules.
    pub fn new(config: EngineConfig, provider: Arc<dyn NarrativeProvider>) -> Result<Self> {
        SessionBuilder::new(config).build(provider)
    }

    /// Load a saved session, replaying and verifying its log.
    pub async fn load(
        path: impl AsRef<Path>,
        provider: Arc<dyn NarrativeProvider>,
    ) -> Result<Self> {
        let saved = SavedSession::load_json(path).await?;
        SessionBuilder::from_saved(saved).build(provider)
    }

    /// Save the session to a file.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        self.to_saved().save_json(path).await?;
        Ok(())
    }

    pub fn to_saved(&self) -> SavedSession {
        SavedSession::new(
            self.scheduler.config().clone(),
            self.base_world.clone(),
            self.scheduler.world().clone(),
            self.scheduler.log().clone(),
        )
    }

    pub fn run_tick(&mut self) -> Result<TickReport> {
        self.scheduler.run_tick()
    }

    pub fn run_ticks(&mut self, count: u64) -> Result<Vec<TickReport>> {
        self.scheduler.run_ticks(count)
    }

    /// Keep ticking until every outstanding request has resolved, up to
    /// `max_ticks`. Returns the reports of the ticks run.
    pub fn settle(&mut self, max_ticks: u64) -> Result<Vec<TickReport>> {
        let mut reports = Vec::new();
        while !self.scheduler.queue().is_idle() && (reports.len() as u64) < max_ticks {
            reports.push(self.scheduler.run_tick()?);
        }
        Ok(reports)
    }

    pub fn queue_input(&mut self, input: PlayerInput) {
        self.scheduler.queue_input(input);
    }

    /// Parse and queue one command line.
    pub fn queue_command(&mut self, line: &str) -> Result<()> {
        let input: PlayerInput = line.parse()?;
        self.scheduler.queue_input(input);
        Ok(())
    }

    pub fn enqueue_interactive(
        &mut self,
        label: impl Into<String>,
        payload: NarrativePayload,
    ) -> EnqueueOutcome {
        self.scheduler.enqueue_interactive(label, payload)
    }

    /// Replay this session's own log up to `target_tick` (default: now).
    pub fn verify(&self, target_tick: Option<u64>) -> ReplayResult<WorldSnapshot> {
        let target = target_tick.unwrap_or_else(|| self.scheduler.tick());
        replay(
            &self.base_world,
            self.scheduler.log(),
            target,
            self.scheduler.rules(),
            self.scheduler.config(),
        )
    }

    /// Recorded snapshot hash at the end of `tick`.
    pub fn snapshot_hash(&self, tick: u64) -> Option<&str> {
        self.scheduler.log().snapshot_hash(tick)
    }

    /// Cancel every outstanding request and stop the workers.
    pub fn shutdown(&mut self) -> usize {
        let queue = self.scheduler.queue_mut();
        let cancelled = queue.cancel_all();
        queue.abort_workers();
        info!(tick = self.scheduler.tick(), cancelled, "session shut down");
        cancelled
    }

    pub fn world(&self) -> &WorldState {
        self.scheduler.world()
    }

    pub fn base_world(&self) -> &WorldState {
        &self.base_world
    }

    pub fn tick(&self) -> u64 {
        self.scheduler.tick()
    }

    pub fn log(&self) -> &ReplayLog {
        self.scheduler.log()
    }

    pub fn metrics(&self) -> &TickMetrics {
        self.scheduler.metrics()
    }

    pub fn queue_stats(&self) -> &QueueStats {
        self.scheduler.queue().stats()
    }

    pub fn config(&self) -> &EngineConfig {
        self.scheduler.config()
    }

    pub fn scheduler(&self) -> &TickScheduler {
        &self.scheduler
    }
}
