//! Per-tick timing and running totals.

use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Wall-clock time spent in each step of one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct StepTimings {
    pub input: Duration,
    pub update: Duration,
    pub detect: Duration,
    pub results: Duration,
    pub validate: Duration,
    pub record: Duration,
    pub total: Duration,
}

impl StepTimings {
    /// Time the budget applies to: updates through validation.
    pub fn budgeted(&self) -> Duration {
        self.update + self.detect + self.results + self.validate
    }
}

/// Aggregates over a session.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickMetrics {
    pub ticks: u64,
    pub slow_ticks: u64,
    pub total: Duration,
    pub max: Duration,
    pub last: StepTimings,
    pub events: u64,
    pub requests: u64,
    pub applied: u64,
    pub violations: u64,
    pub inputs_applied: u64,
    pub inputs_rejected: u64,
}

impl TickMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_tick(&mut self, timings: StepTimings, slow: bool) {
        self.ticks += 1;
        if slow {
            self.slow_ticks += 1;
        }
        self.total += timings.total;
        self.max = self.max.max(timings.total);
        self.last = timings;
    }

    pub fn mean(&self) -> Duration {
        if self.ticks == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos((self.total.as_nanos() / self.ticks as u128) as u64)
        }
    }
}

impl fmt::Display for TickMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "ticks: {} ({} slow), mean {:.3} ms, max {:.3} ms",
            self.ticks,
            self.slow_ticks,
            self.mean().as_secs_f64() * 1000.0,
            self.max.as_secs_f64() * 1000.0
        )?;
        writeln!(
            f,
            "inputs: {} applied, {} rejected",
            self.inputs_applied, self.inputs_rejected
        )?;
        write!(
            f,
            "changes: {}, requests: {}, results applied: {}, invariant repairs: {}",
            self.events, self.requests, self.applied, self.violations
        )
    }
}
