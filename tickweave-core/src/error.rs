//! Error types for the tick engine.
//!
//! Uses thiserror for ergonomic error definition. Only divergence and
//! unrecoverable invariant violations ever surface from a running session;
//! narrative failures are absorbed into deterministic fallbacks.

use crate::world::InvariantViolation;
use std::time::Duration;

/// Main error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Replay produced a different world than the one recorded.
    #[error("Replay error: {0}")]
    Replay(#[from] ReplayError),

    /// A world invariant could not be repaired by clamping.
    #[error("Unrecoverable invariant violation at tick {tick}: {violation}")]
    Invariant {
        tick: u64,
        violation: InvariantViolation,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Save/load error
    #[error("Persistence error: {0}")]
    Persist(#[from] PersistError),

    /// Player input could not be parsed or applied
    #[error("Input error: {0}")]
    Input(#[from] InputError),

    /// No tokio runtime to run narrative workers on
    #[error("Runtime error: {0}")]
    Runtime(#[from] tokio::runtime::TryCurrentError),
}

/// Failures reported by a narrative provider.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NarrativeError {
    /// The call did not finish in time
    #[error("Narrative call timed out after {duration:?}")]
    Timeout { duration: Duration },

    /// Network/connection error
    #[error("Network error: {0}")]
    Network(String),

    /// Provider asked us to slow down
    #[error("Rate limited")]
    RateLimited,

    /// Provider is temporarily unavailable
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// Output could not be used as flavor text
    #[error("Malformed output: {0}")]
    Malformed(String),

    /// Provider refused the request outright
    #[error("Request rejected: {0}")]
    Rejected(String),
}

impl NarrativeError {
    /// Whether retrying the same call could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            NarrativeError::Timeout { .. }
                | NarrativeError::Network(_)
                | NarrativeError::RateLimited
                | NarrativeError::Unavailable(_)
        )
    }
}

/// Why a request resolved without usable provider output.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FailureReason {
    /// Retries exhausted on transient errors
    #[error("transient failure after {attempts} attempts: {last}")]
    TransientExhausted { attempts: u32, last: NarrativeError },

    /// Non-retryable provider error
    #[error("permanent failure: {0}")]
    Permanent(NarrativeError),

    /// Sat in its lane longer than the lane timeout
    #[error("queue timeout")]
    QueueTimeout,

    /// Worker dropped the call without reporting
    #[error("worker lost")]
    WorkerLost,
}

/// Player input errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InputError {
    #[error("Empty command")]
    Empty,

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Wrong arguments for '{command}': {reason}")]
    BadArguments { command: String, reason: String },

    #[error("Unknown entity: {0}")]
    UnknownEntity(u64),

    #[error("Unknown faction: {0}")]
    UnknownFaction(u64),

    #[error("Unknown resource: {0}")]
    UnknownResource(u64),

    #[error("Position ({x}, {y}) outside world bounds")]
    OutOfBounds { x: i32, y: i32 },
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Replay errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReplayError {
    /// Snapshot hash after a tick differs from the recorded one.
    #[error("Divergence at tick {tick}: recorded {expected}, replayed {actual}")]
    Divergence {
        tick: u64,
        expected: String,
        actual: String,
    },

    /// The change events recomputed for a tick differ from the recorded ones.
    #[error("Change events diverged at tick {tick}: recorded {expected:?}, replayed {actual:?}")]
    EventDivergence {
        tick: u64,
        expected: Vec<String>,
        actual: Vec<String>,
    },

    /// The narrative requests raised by a tick differ from the recorded ones.
    #[error("Requests diverged at tick {tick}: recorded {expected:?}, replayed {actual:?}")]
    RequestDivergence {
        tick: u64,
        expected: Vec<String>,
        actual: Vec<String>,
    },

    /// Seed or draw count for a tick differs from the recorded one.
    #[error(
        "RNG diverged at tick {tick}: recorded seed {expected_seed} with {expected_draws} draws, \
         replayed seed {actual_seed} with {actual_draws} draws"
    )]
    RngDivergence {
        tick: u64,
        expected_seed: u64,
        actual_seed: u64,
        expected_draws: u64,
        actual_draws: u64,
    },

    /// No tick marker was recorded for a tick we need to check.
    #[error("No tick marker recorded for tick {0}")]
    MissingMarker(u64),

    /// A recorded entry could not be decoded.
    #[error("Corrupt record at tick {tick}: {reason}")]
    CorruptRecord { tick: u64, reason: String },

    /// Target lies before the saved state.
    #[error("Target tick {target} precedes saved state at tick {base}")]
    TargetBeforeBase { target: u64, base: u64 },
}

impl ReplayError {
    /// The tick at which replay stopped, if it is tick-specific.
    pub fn tick(&self) -> Option<u64> {
        match self {
            ReplayError::Divergence { tick, .. }
            | ReplayError::EventDivergence { tick, .. }
            | ReplayError::RequestDivergence { tick, .. }
            | ReplayError::RngDivergence { tick, .. }
            | ReplayError::CorruptRecord { tick, .. } => Some(*tick),
            ReplayError::MissingMarker(tick) => Some(*tick),
            ReplayError::TargetBeforeBase { .. } => None,
        }
    }
}

/// Errors from persistence operations.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("Replay log error: {0}")]
    Replay(#[from] ReplayError),
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, EngineError>;

/// Result type for replay operations
pub type ReplayResult<T> = std::result::Result<T, ReplayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EngineError::Config(ConfigError::Invalid {
            field: "max_concurrent",
            reason: "must be at least 1".to_string(),
        });
        assert_eq!(
            err.to_string(),
            "Configuration error: Invalid value for max_concurrent: must be at least 1"
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(NarrativeError::RateLimited.is_transient());
        assert!(NarrativeError::Network("reset".into()).is_transient());
        assert!(!NarrativeError::Malformed("{".into()).is_transient());
        assert!(!NarrativeError::Rejected("auth".into()).is_transient());
    }

    #[test]
    fn test_replay_error_tick() {
        let err = ReplayError::Divergence {
            tick: 42,
            expected: "aa".into(),
            actual: "bb".into(),
        };
        assert_eq!(err.tick(), Some(42));
        assert!(err.to_string().contains("tick 42"));
    }
}
