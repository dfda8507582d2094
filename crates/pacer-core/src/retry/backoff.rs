//! Backoff policy: decides delays between retry attempts.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// How the wait between attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// `base_wait` every time.
    Fixed,
    /// `base_wait * attempt`.
    Linear,
    /// `base_wait * 2^(attempt - 1)`.
    #[default]
    Exponential,
}

impl Backoff {
    /// Delay to wait after the given failed attempt (1-indexed).
    ///
    /// Example with base=100ms:
    /// - exponential: 100ms, 200ms, 400ms, 800ms
    /// - linear: 100ms, 200ms, 300ms, 400ms
    /// - fixed: 100ms, 100ms, 100ms, 100ms
    pub fn delay(self, base: Duration, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match self {
            Backoff::Fixed => base,
            Backoff::Linear => base.saturating_mul(attempt),
            Backoff::Exponential => {
                let factor = 2u32.checked_pow(attempt - 1).unwrap_or(u32::MAX);
                base.saturating_mul(factor)
            }
        }
    }
}

/// Perturb `delay` by a uniform offset in `[-jitter * delay, +jitter * delay]`.
///
/// `jitter` is clamped to `[0, 1]`; the result never goes below zero.
pub fn apply_jitter<R: Rng + ?Sized>(delay: Duration, jitter: f64, rng: &mut R) -> Duration {
    if jitter.is_nan() || jitter <= 0.0 || delay.is_zero() {
        return delay;
    }
    let base = delay.as_secs_f64();
    let spread = base * jitter.min(1.0);
    let offset = rng.gen_range(-spread..=spread);
    Duration::from_secs_f64((base + offset).max(0.0))
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rstest::rstest;

    use super::*;

    const BASE: Duration = Duration::from_millis(100);

    #[rstest]
    #[case(Backoff::Fixed, [100, 100, 100])]
    #[case(Backoff::Linear, [100, 200, 300])]
    #[case(Backoff::Exponential, [100, 200, 400])]
    fn delays_follow_strategy(#[case] backoff: Backoff, #[case] expected: [u64; 3]) {
        for (i, ms) in expected.iter().enumerate() {
            assert_eq!(backoff.delay(BASE, i as u32 + 1), Duration::from_millis(*ms));
        }
    }

    #[test]
    fn attempt_zero_uses_base_delay() {
        assert_eq!(Backoff::Exponential.delay(BASE, 0), BASE);
    }

    #[test]
    fn huge_attempts_saturate() {
        let d = Backoff::Exponential.delay(BASE, 200);
        assert!(d >= Duration::from_secs(1_000_000));
    }

    #[test]
    fn zero_jitter_is_identity() {
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(apply_jitter(BASE, 0.0, &mut rng), BASE);
    }

    #[test]
    fn jitter_stays_within_symmetric_bounds() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..200 {
            let d = apply_jitter(BASE, 0.25, &mut rng);
            assert!(d >= Duration::from_millis(74) && d <= Duration::from_millis(126));
        }
    }
}
