//! Retry scheduling.

use std::time::Duration;

use rand::Rng;

/// Exponent cap: delays stop doubling after 64 minutes.
const MAX_SHIFT: u32 = 6;

/// Backoff before the next delivery attempt: `1min * 2^min(attempts-1, 6)`
/// plus a uniform jitter in `[0, base/4)` to desynchronise retries.
/// `attempts` is clamped to at least 1.
pub fn backoff(attempts: u32) -> Duration {
    let attempts = attempts.max(1);
    let base = Duration::from_secs(60) * (1u32 << (attempts - 1).min(MAX_SHIFT));
    let jitter_nanos = rand::rng().random_range(0..base.as_nanos() as u64 / 4);
    base + Duration::from_nanos(jitter_nanos)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_caps() {
        let minutes = [1u64, 2, 4, 8, 16, 32, 64, 64, 64];
        for (attempts, &expected) in (1u32..).zip(minutes.iter()) {
            let base = Duration::from_secs(60 * expected);
            for _ in 0..50 {
                let delay = backoff(attempts);
                assert!(
                    delay >= base && delay < base + base / 4,
                    "attempt {attempts}: {delay:?} outside [{base:?}, {:?})",
                    base + base / 4,
                );
            }
        }
    }

    #[test]
    fn zero_attempts_is_clamped_to_one() {
        let delay = backoff(0);
        let base = Duration::from_secs(60);
        assert!(delay >= base && delay < base + base / 4);
    }

    #[test]
    fn jitter_varies() {
        let samples: std::collections::HashSet<Duration> =
            (0..32).map(|_| backoff(3)).collect();
        assert!(samples.len() > 1, "expected jittered delays to differ");
    }
}
