//! Testing utilities for the engine.
//!
//! This module provides tools for integration testing:
//! - Mock providers for deterministic runs without a real backend
//! - `TestHarness` for scripted simulation scenarios
//! - Assertion helpers for verifying session state

use crate::config::EngineConfig;
use crate::error::{NarrativeError, Result};
use crate::narrative::NarrativeProvider;
use crate::scheduler::TickReport;
use crate::session::{Session, SessionBuilder};
use crate::world::{FlavorSource, WorldRules, WorldState};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};

fn echo(name: &str, prompt: &str) -> String {
    format!("[{name}] {}", prompt.lines().last().unwrap_or_default())
}

/// A provider that returns scripted responses in order, then echoes.
#[derive(Default)]
pub struct ScriptedProvider {
    script: Mutex<VecDeque<std::result::Result<String, NarrativeError>>>,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful response.
    pub fn respond(self, text: impl Into<String>) -> Self {
        self.push(Ok(text.into()))
    }

    /// Queue a failed call.
    pub fn fail(self, error: NarrativeError) -> Self {
        self.push(Err(error))
    }

    fn push(mut self, response: std::result::Result<String, NarrativeError>) -> Self {
        self.script.get_mut().push_back(response);
        self
    }

    /// Number of calls made so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NarrativeProvider for ScriptedProvider {
    async fn call(&self, prompt: &str) -> std::result::Result<String, NarrativeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.script.lock().await.pop_front() {
            Some(response) => response,
            None => Ok(echo(self.name(), prompt)),
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// A provider whose calls block until permits are released.
///
/// Lets a test hold requests in flight across as many ticks as it needs.
pub struct GatedProvider {
    gate: Semaphore,
    calls: AtomicUsize,
}

impl GatedProvider {
    pub fn new() -> Self {
        Self {
            gate: Semaphore::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    /// Let `count` blocked (or future) calls complete.
    pub fn release(&self, count: usize) {
        self.gate.add_permits(count);
    }

    /// Calls started so far, finished or not.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for GatedProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NarrativeProvider for GatedProvider {
    async fn call(&self, prompt: &str) -> std::result::Result<String, NarrativeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| NarrativeError::Unavailable("gate closed".into()))?;
        permit.forget();
        Ok(echo(self.name(), prompt))
    }

    fn name(&self) -> &str {
        "gated"
    }
}

/// A provider that fails with a transient error for its first `failures` calls.
pub struct FlakyProvider {
    failures: u32,
    error: NarrativeError,
    calls: AtomicU32,
}

impl FlakyProvider {
    pub fn new(failures: u32) -> Self {
        Self {
            failures,
            error: NarrativeError::Network("connection reset".into()),
            calls: AtomicU32::new(0),
        }
    }

    /// Fail with this error instead of a network error.
    pub fn with_error(mut self, error: NarrativeError) -> Self {
        self.error = error;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NarrativeProvider for FlakyProvider {
    async fn call(&self, prompt: &str) -> std::result::Result<String, NarrativeError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(self.error.clone());
        }
        Ok(echo(self.name(), prompt))
    }

    fn name(&self) -> &str {
        "flaky"
    }
}

/// A provider whose text and latency change on every call.
///
/// Two sessions with the same seed must still reach identical snapshots when
/// backed by this provider.
pub struct NoiseProvider {
    max_delay: Duration,
    calls: AtomicU64,
}

impl NoiseProvider {
    pub fn new(max_delay: Duration) -> Self {
        Self {
            max_delay,
            calls: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl NarrativeProvider for NoiseProvider {
    async fn call(&self, prompt: &str) -> std::result::Result<String, NarrativeError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.subsec_nanos() as u64)
            .unwrap_or(call);
        let max = self.max_delay.as_micros() as u64;
        if max > 0 {
            tokio::time::sleep(Duration::from_micros(nanos % max)).await;
        }
        Ok(format!("noise #{call} ({nanos}): {}", echo(self.name(), prompt)))
    }

    fn name(&self) -> &str {
        "noise"
    }
}

/// Test harness for running scripted simulation scenarios.
///
/// Must be created inside a tokio runtime.
pub struct TestHarness {
    pub session: Session,
    reports: Vec<TickReport>,
}

impl TestHarness {
    /// Harness on the sample village with an echoing provider.
    pub fn new(seed: u64) -> Result<Self> {
        Self::with_provider(EngineConfig::new(seed), Arc::new(ScriptedProvider::new()))
    }

    pub fn with_provider(
        config: EngineConfig,
        provider: Arc<dyn NarrativeProvider>,
    ) -> Result<Self> {
        Self::from_builder(Session::builder(config), provider)
    }

    /// Harness on a custom world and rule set.
    pub fn with_world(
        config: EngineConfig,
        world: WorldState,
        rules: impl WorldRules + 'static,
        provider: Arc<dyn NarrativeProvider>,
    ) -> Result<Self> {
        let builder = Session::builder(config).with_world(world).with_rules(rules);
        Self::from_builder(builder, provider)
    }

    fn from_builder(
        builder: SessionBuilder,
        provider: Arc<dyn NarrativeProvider>,
    ) -> Result<Self> {
        Ok(Self {
            session: builder.build(provider)?,
            reports: Vec::new(),
        })
    }

    /// Queue a player command line.
    pub fn input(&mut self, line: &str) -> Result<&mut Self> {
        self.session.queue_command(line)?;
        Ok(self)
    }

    /// Run one tick and keep its report.
    pub fn tick(&mut self) -> Result<&TickReport> {
        let report = self.session.run_tick()?;
        self.reports.push(report);
        Ok(&self.reports[self.reports.len() - 1])
    }

    pub fn run(&mut self, ticks: u64) -> Result<()> {
        let reports = self.session.run_ticks(ticks)?;
        self.reports.extend(reports);
        Ok(())
    }

    /// Tick until the queue is idle, yielding to the workers between ticks.
    ///
    /// The scheduler itself never waits, so tests that need results to land
    /// give the worker tasks a moment of wall-clock time per tick.
    pub async fn settle(&mut self, max_ticks: u64) -> Result<()> {
        for _ in 0..max_ticks {
            if self.session.scheduler().queue().is_idle() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
            self.tick()?;
        }
        Ok(())
    }

    pub fn reports(&self) -> &[TickReport] {
        &self.reports
    }

    pub fn world(&self) -> &WorldState {
        self.session.world()
    }

    /// Chronicle texts in the order they were attached.
    pub fn flavor_texts(&self) -> Vec<&str> {
        self.world().chronicle.iter().map(|e| e.text.as_str()).collect()
    }

    pub fn flavor_count(&self, source: FlavorSource) -> usize {
        self.world().chronicle.iter().filter(|e| e.source == source).count()
    }

    pub fn event_count(&self) -> usize {
        self.reports.iter().map(|r| r.events.len()).sum()
    }
}

/// Assert that the session's log replays cleanly to its current tick.
pub fn assert_replays(harness: &TestHarness) {
    if let Err(error) = harness.session.verify(None) {
        panic!("replay failed at tick {}: {error}", harness.session.tick());
    }
}

/// Assert that some chronicle entry contains `text`.
pub fn assert_flavor_contains(harness: &TestHarness, text: &str) {
    assert!(
        harness.flavor_texts().iter().any(|t| t.contains(text)),
        "no flavor text containing '{text}' in {:?}",
        harness.flavor_texts()
    );
}
