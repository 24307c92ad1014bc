//! Retry delay computation.

use rand::Rng;
use std::time::Duration;

/// Delay before retry number `attempt` (zero-based).
///
/// `min(base * 2^attempt + jitter, max)` with `jitter` drawn uniformly from
/// `[0, base * attempt]`. The caller seeds `rng` so the same request retries
/// on the same schedule every run.
pub fn backoff_delay<R: Rng + ?Sized>(
    attempt: u32,
    base: Duration,
    max: Duration,
    rng: &mut R,
) -> Duration {
    let base_ms = base.as_millis().min(u64::MAX as u128) as u64;
    let max_ms = max.as_millis().min(u64::MAX as u128) as u64;

    let exponential = base_ms.saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
    let jitter_cap = base_ms.saturating_mul(attempt as u64);
    let jitter = if jitter_cap == 0 {
        0
    } else {
        rng.gen_range(0..=jitter_cap)
    };

    Duration::from_millis(exponential.saturating_add(jitter).min(max_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::TickRng;

    #[test]
    fn test_delay_bounds() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(30);
        for seed in 0..50 {
            let mut rng = TickRng::from_seed_u64(seed);
            for attempt in 0..=3u32 {
                let delay = backoff_delay(attempt, base, max, &mut rng);
                let low = base * 2u32.pow(attempt);
                let high = low + base * attempt;
                assert!(delay >= low, "attempt {attempt}: {delay:?} < {low:?}");
                assert!(delay <= high, "attempt {attempt}: {delay:?} > {high:?}");
                assert!(delay <= max);
            }
        }
    }

    #[test]
    fn test_first_retry_has_no_jitter() {
        let mut rng = TickRng::from_seed_u64(7);
        let delay = backoff_delay(0, Duration::from_secs(1), Duration::from_secs(30), &mut rng);
        assert_eq!(delay, Duration::from_secs(1));
        assert_eq!(rng.draws(), 0);
    }

    #[test]
    fn test_capped_at_max() {
        let (base, max) = (Duration::from_secs(1), Duration::from_secs(30));
        let mut rng = TickRng::from_seed_u64(1);
        for attempt in [5, 10, 63, 64, 200] {
            let delay = backoff_delay(attempt, base, max, &mut rng);
            assert_eq!(delay, Duration::from_secs(30));
        }
    }

    #[test]
    fn test_same_seed_same_delay() {
        let (base, max) = (Duration::from_secs(1), Duration::from_secs(30));
        let a = backoff_delay(2, base, max, &mut TickRng::from_seed_u64(9));
        let b = backoff_delay(2, base, max, &mut TickRng::from_seed_u64(9));
        assert_eq!(a, b);
    }
}
