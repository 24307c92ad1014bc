//! Deterministic tick-driven simulation with asynchronous narrative.
//!
//! This crate provides:
//! - A fixed-step tick scheduler over an authoritative world state
//! - Change detection that turns state deltas into narrative requests
//! - A prioritized, deduplicating request queue with retries and a cache
//! - A replay log that reproduces any session bit for bit
//! - Session persistence with replay verification on load
//!
//! Narrative text is produced off the tick thread by a [`NarrativeProvider`]
//! and attached to the world as flavor once it arrives. It never feeds back
//! into simulation state, so the snapshot hash of every tick depends only on
//! the seed, the starting world and the player inputs.
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use tickweave_core::{EngineConfig, Session};
//! use tickweave_core::testing::ScriptedProvider;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EngineConfig::new(42);
//!     let mut session = Session::new(config, Arc::new(ScriptedProvider::new()))?;
//!
//!     session.queue_command("cheer 4 0.5 -- Corin hears good news")?;
//!     session.run_ticks(600)?;
//!
//!     session.verify(None)?;
//!     session.save("village.json").await?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod detector;
pub mod error;
pub mod hashing;
pub mod ids;
pub mod metrics;
pub mod narrative;
pub mod persist;
pub mod queue;
pub mod replay;
pub mod rng;
pub mod scheduler;
pub mod session;
pub mod testing;
pub mod world;

// Primary public API
pub use config::{CacheConfig, DetectorConfig, EngineConfig, QueueConfig, SchedulerConfig};
pub use detector::{ChangeDetector, ChangeEvent};
pub use error::{EngineError, FailureReason, NarrativeError, ReplayError, Result};
pub use ids::{EntityId, FactionId, RequestId, ResourceId};
pub use narrative::{
    FallbackGenerator, NarrativePayload, NarrativeProvider, Origin, TemplateFallback,
};
pub use persist::SavedSession;
pub use queue::{EnqueueOutcome, Outcome, Priority, RequestQueue};
pub use replay::{replay, ReplayLog, ReplayRecord};
pub use scheduler::{TickReport, TickScheduler};
pub use session::{Session, SessionBuilder};
pub use world::{PlayerInput, WorldRules, WorldSnapshot, WorldState};
