//! A local stand-in for a remote text generator.
//!
//! Latency and failures are drawn from a seeded stream per call, so a run is
//! reproducible in what it asks for even though call timing is not.

use async_trait::async_trait;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tickweave_core::hashing::fnv64;
use tickweave_core::rng::stream_seed;
use tickweave_core::{NarrativeError, NarrativeProvider};

const OPENERS: &[&str] = &[
    "By the well, people murmur that",
    "The evening air carries word that",
    "Old Garrow swears",
    "Children chase each other, shouting that",
    "Over supper it is agreed that",
];

/// Simulated provider with seeded latency and a configurable failure rate.
pub struct SimulatedProvider {
    seed: u64,
    failure_rate: f64,
    min_latency: Duration,
    max_latency: Duration,
    calls: AtomicU64,
}

impl SimulatedProvider {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            failure_rate: 0.0,
            min_latency: Duration::from_millis(50),
            max_latency: Duration::from_millis(800),
            calls: AtomicU64::new(0),
        }
    }

    /// Probability that a call fails (clamped to `0.0..=1.0`).
    pub fn with_failure_rate(mut self, rate: f64) -> Self {
        self.failure_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn with_latency(mut self, min: Duration, max: Duration) -> Self {
        self.min_latency = min;
        self.max_latency = max.max(min);
        self
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    fn failure(rng: &mut ChaCha8Rng) -> NarrativeError {
        match rng.gen_range(0..10) {
            0..=4 => NarrativeError::Network("connection reset by peer".to_string()),
            5..=7 => NarrativeError::RateLimited,
            8 => NarrativeError::Unavailable("upstream overloaded".to_string()),
            _ => NarrativeError::Rejected("content filtered".to_string()),
        }
    }

    fn compose(rng: &mut ChaCha8Rng, prompt: &str) -> String {
        let opener = OPENERS[rng.gen_range(0..OPENERS.len())];
        let involved = prompt
            .lines()
            .find_map(|line| line.strip_prefix("Involved: "))
            .map(|s| s.trim_end_matches('.'))
            .unwrap_or("the village");
        let kind = prompt
            .split('\'')
            .nth(1)
            .unwrap_or("quiet")
            .replace('_', " ");
        format!("{opener} {involved} had a {kind} moment today.")
    }
}

#[async_trait]
impl NarrativeProvider for SimulatedProvider {
    async fn call(&self, prompt: &str) -> Result<String, NarrativeError> {
        let call = self.calls.fetch_add(1, Ordering::Relaxed);
        let stream = fnv64(prompt.as_bytes());
        let mut rng = ChaCha8Rng::seed_from_u64(stream_seed(self.seed, stream, call));

        let latency = rng.gen_range(self.min_latency..=self.max_latency);
        tokio::time::sleep(latency).await;

        if rng.gen_bool(self.failure_rate) {
            return Err(Self::failure(&mut rng));
        }
        Ok(Self::compose(&mut rng, prompt))
    }

    fn name(&self) -> &str {
        "simulated"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tickweave_core::NarrativePayload;

    fn fast(seed: u64) -> SimulatedProvider {
        SimulatedProvider::new(seed).with_latency(Duration::ZERO, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_mentions_subjects() {
        let prompt = NarrativePayload::new("mood_shift")
            .with_subject("Ansel")
            .with_subject("Brisa")
            .prompt();
        let text = fast(1).call(&prompt).await.unwrap();
        assert!(text.contains("Ansel, Brisa"));
        assert!(text.contains("mood shift"));
    }

    #[tokio::test]
    async fn test_always_fails_at_full_rate() {
        let provider = fast(2).with_failure_rate(1.0);
        for _ in 0..5 {
            assert!(provider.call("anything").await.is_err());
        }
        assert_eq!(provider.calls(), 5);
    }

    #[tokio::test]
    async fn test_same_seed_same_text() {
        let a = fast(3).call("'event'\nInvolved: festival.").await.unwrap();
        let b = fast(3).call("'event'\nInvolved: festival.").await.unwrap();
        assert_eq!(a, b);
    }
}
