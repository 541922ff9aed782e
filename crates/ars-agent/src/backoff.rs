//! Reconnect delay schedule.
//!
//! `delay(attempt) = base * 2^min(attempt - 1, 5) + uniform(0, 100ms)`

use std::time::Duration;

use ars_protocol::{MAX_BACKOFF_EXPONENT, RECONNECT_JITTER_MS};
use rand::Rng;

/// Exponential backoff with a clamped exponent and additive jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    jitter: Duration,
}

impl Backoff {
    pub fn new(base: Duration) -> Self {
        Self {
            base,
            jitter: Duration::from_millis(RECONNECT_JITTER_MS),
        }
    }

    /// Deterministic part of the delay for a 1-based attempt number.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
        self.base.saturating_mul(1u32 << exponent)
    }

    /// Full delay including jitter drawn from `rng`.
    pub fn delay_with<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_micros(rng.gen_range(0..jitter_ms * 1_000))
        };
        self.base_delay(attempt) + jitter
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::thread_rng())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_backoff_sequence_doubles_then_clamps() {
        let backoff = Backoff::new(Duration::from_secs(5));
        let secs: Vec<u64> = (1..=8).map(|a| backoff.base_delay(a).as_secs()).collect();
        assert_eq!(secs, vec![5, 10, 20, 40, 80, 160, 160, 160]);
    }

    #[test]
    fn test_attempt_zero_behaves_like_first() {
        let backoff = Backoff::new(Duration::from_secs(5));
        assert_eq!(backoff.base_delay(0), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_below_100ms() {
        let backoff = Backoff::new(Duration::from_secs(5));
        let mut rng = StdRng::seed_from_u64(7);
        for attempt in 1..=10 {
            let delay = backoff.delay_with(attempt, &mut rng);
            let base = backoff.base_delay(attempt);
            assert!(delay >= base);
            assert!(delay - base < Duration::from_millis(100));
        }
    }
}
