//! Engine configuration.
//!
//! All durations are stored as milliseconds so config files stay readable.
//! Every field has a default; a config file only needs the fields it changes.

use crate::error::ConfigError;
use crate::queue::Priority;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration for a simulation session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Session seed; every seeded draw derives from it.
    pub seed: u64,
    pub scheduler: SchedulerConfig,
    pub queue: QueueConfig,
    pub cache: CacheConfig,
    pub detector: DetectorConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            seed: 0x5eed,
            scheduler: SchedulerConfig::default(),
            queue: QueueConfig::default(),
            cache: CacheConfig::default(),
            detector: DetectorConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Create a config with the given seed and defaults elsewhere.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            ..Default::default()
        }
    }

    /// Set the session seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Set the tick rate.
    pub fn with_tick_rate(mut self, hz: u32) -> Self {
        self.scheduler.tick_rate_hz = hz;
        self
    }

    /// Set the per-tick budget in milliseconds.
    pub fn with_budget_ms(mut self, budget_ms: f64) -> Self {
        self.scheduler.budget_ms = budget_ms;
        self
    }

    /// Replace the queue configuration.
    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    /// Replace the cache configuration.
    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Replace the detector configuration.
    pub fn with_detector(mut self, detector: DetectorConfig) -> Self {
        self.detector = detector;
        self
    }

    /// Load from a JSON file. Missing fields take their defaults.
    pub async fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.tick_rate_hz == 0 {
            return Err(ConfigError::Invalid {
                field: "scheduler.tick_rate_hz",
                reason: "must be at least 1".to_string(),
            });
        }
        if !(self.scheduler.budget_ms > 0.0) {
            return Err(ConfigError::Invalid {
                field: "scheduler.budget_ms",
                reason: "must be positive".to_string(),
            });
        }
        if self.queue.max_concurrent == 0 {
            return Err(ConfigError::Invalid {
                field: "queue.max_concurrent",
                reason: "must be at least 1".to_string(),
            });
        }
        let (base, max) = (self.queue.backoff_base_ms, self.queue.backoff_max_ms);
        if base == 0 || max < base {
            return Err(ConfigError::Invalid {
                field: "queue.backoff_max_ms",
                reason: "must be at least backoff_base_ms, which must be non-zero".to_string(),
            });
        }
        if self.cache.capacity == 0 || self.cache.ttl_ms == 0 || self.cache.hit_cap == 0 {
            return Err(ConfigError::Invalid {
                field: "cache",
                reason: "capacity, ttl_ms and hit_cap must be non-zero".to_string(),
            });
        }
        if self.detector.min_mood_entities == 0 {
            return Err(ConfigError::Invalid {
                field: "detector.min_mood_entities",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Tick timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Simulation steps per simulated second.
    pub tick_rate_hz: u32,
    /// Wall-clock budget for the deterministic part of a tick.
    pub budget_ms: f64,
    /// How many flavor entries the world keeps.
    pub max_flavor_entries: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_rate_hz: 60,
            budget_ms: 16.67,
            max_flavor_entries: 500,
        }
    }
}

impl SchedulerConfig {
    /// Simulated duration of one tick.
    pub fn tick_duration(&self) -> Duration {
        Duration::from_secs(1) / self.tick_rate_hz.max(1)
    }

    /// Budget as a `Duration`.
    pub fn budget(&self) -> Duration {
        Duration::from_secs_f64(self.budget_ms.max(0.0) / 1000.0)
    }

    /// Simulated time at the start of `tick`.
    pub fn sim_time(&self, tick: u64) -> Duration {
        let hz = self.tick_rate_hz.max(1) as u128;
        Duration::from_nanos((tick as u128 * 1_000_000_000 / hz) as u64)
    }

    /// Number of whole ticks covering `duration` (rounded up).
    pub fn ticks_for(&self, duration: Duration) -> u64 {
        let hz = self.tick_rate_hz.max(1) as u128;
        (duration.as_nanos() * hz).div_ceil(1_000_000_000) as u64
    }
}

/// Request queue limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// In-flight limit shared by High and Medium.
    pub max_concurrent: usize,
    /// In-flight limit for Low.
    pub max_concurrent_low: usize,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub high_timeout_ms: u64,
    pub medium_timeout_ms: u64,
    pub low_timeout_ms: u64,
    pub high_cap: usize,
    pub medium_cap: usize,
    pub low_cap: usize,
    pub total_cap: usize,
    /// Wall-clock limit on a single provider call.
    pub call_timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            max_concurrent_low: 3,
            max_retries: 3,
            backoff_base_ms: 1_000,
            backoff_max_ms: 30_000,
            high_timeout_ms: 3_000,
            medium_timeout_ms: 10_000,
            low_timeout_ms: 5_000,
            high_cap: 5,
            medium_cap: 3,
            low_cap: 10,
            total_cap: 15,
            call_timeout_ms: 20_000,
        }
    }
}

impl QueueConfig {
    /// How long a request may wait in its lane.
    pub fn lane_timeout(&self, priority: Priority) -> Duration {
        let ms = match priority {
            Priority::High => self.high_timeout_ms,
            Priority::Medium => self.medium_timeout_ms,
            Priority::Low => self.low_timeout_ms,
        };
        Duration::from_millis(ms)
    }

    /// Maximum depth of a lane.
    pub fn lane_cap(&self, priority: Priority) -> usize {
        match priority {
            Priority::High => self.high_cap,
            Priority::Medium => self.medium_cap,
            Priority::Low => self.low_cap,
        }
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

/// Response cache limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub capacity: usize,
    pub ttl_ms: u64,
    /// Hit count at which the frequency term saturates.
    pub hit_cap: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            ttl_ms: 300_000,
            hit_cap: 10,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

/// Change detector thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Mood delta an entity must exceed to count as changed.
    pub mood_delta: f32,
    /// Changed entities needed for a mood-shift event.
    pub min_mood_entities: usize,
    /// Faction loyalty delta that triggers a faction event.
    pub loyalty_delta: f32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            mood_delta: 0.25,
            min_mood_entities: 3,
            loyalty_delta: 0.1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.queue.max_concurrent, 2);
        assert_eq!(config.queue.max_concurrent_low, 3);
        assert_eq!(config.queue.lane_cap(Priority::High), 5);
        assert_eq!(config.queue.lane_timeout(Priority::Medium), Duration::from_secs(10));
        assert_eq!(config.cache.ttl(), Duration::from_secs(300));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"seed": 9, "queue": {"max_retries": 1}}"#).unwrap();
        assert_eq!(config.seed, 9);
        assert_eq!(config.queue.max_retries, 1);
        assert_eq!(config.queue.high_cap, 5);
        assert_eq!(config.scheduler.tick_rate_hz, 60);
    }

    #[test]
    fn test_tick_conversions() {
        let sched = SchedulerConfig::default();
        assert_eq!(sched.ticks_for(Duration::from_secs(3)), 180);
        assert_eq!(sched.ticks_for(Duration::from_secs(1)), 60);
        assert_eq!(sched.ticks_for(Duration::ZERO), 0);
        assert_eq!(sched.sim_time(60), Duration::from_secs(1));
        assert_eq!(sched.sim_time(90), Duration::from_millis(1500));
    }

    #[test]
    fn test_validate_rejects_empty_cache_and_detector() {
        let config = EngineConfig::new(1).with_cache(CacheConfig {
            capacity: 0,
            ..CacheConfig::default()
        });
        assert!(config.validate().is_err());

        let config = EngineConfig::new(1).with_detector(DetectorConfig {
            min_mood_entities: 0,
            ..DetectorConfig::default()
        });
        assert!(config.validate().is_err());

        let config = EngineConfig::new(1)
            .with_cache(CacheConfig {
                capacity: 8,
                ..CacheConfig::default()
            })
            .with_detector(DetectorConfig {
                mood_delta: 0.5,
                ..DetectorConfig::default()
            });
        assert!(config.validate().is_ok());
        assert_eq!(config.cache.capacity, 8);
        assert_eq!(config.detector.mood_delta, 0.5);
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let mut config = EngineConfig::default();
        config.queue.max_concurrent = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_builder() {
        let config = EngineConfig::new(1).with_tick_rate(30).with_budget_ms(33.3);
        assert_eq!(config.seed, 1);
        assert_eq!(config.scheduler.tick_rate_hz, 30);
        assert_eq!(config.scheduler.budget_ms, 33.3);
    }
}
