// Exponential backoff with jitter for reconnection

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

use crate::config::ReconnectPolicy;

/// Geometric retry delays capped at `max`, each randomized within
/// `current ± randomization * current`.
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    randomization: f64,
    current: Duration,
    rng: SmallRng,
}

impl ExponentialBackoff {
    pub fn new(policy: &ReconnectPolicy) -> Self {
        Self::with_rng(policy, SmallRng::from_entropy())
    }

    pub fn with_rng(policy: &ReconnectPolicy, rng: SmallRng) -> Self {
        let initial = policy.initial_backoff();
        Self {
            initial,
            max: policy.max_backoff().max(initial),
            multiplier: policy.multiplier.max(1.0),
            randomization: policy.randomization.clamp(0.0, 1.0),
            current: initial,
            rng,
        }
    }

    /// Un-randomized delay the next call to `next_delay` is centred on.
    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn next_delay(&mut self) -> Duration {
        let (low, high) = jitter_bounds(self.current, self.randomization);
        let delay = if high > low {
            Duration::from_secs_f64(self.rng.gen_range(low.as_secs_f64()..=high.as_secs_f64()))
        } else {
            low
        };
        self.advance();
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }

    fn advance(&mut self) {
        let next = self.current.as_secs_f64() * self.multiplier;
        self.current = if next >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(next)
        };
    }
}

/// Inclusive range a delay centred on `current` may fall in.
pub fn jitter_bounds(current: Duration, randomization: f64) -> (Duration, Duration) {
    let delta = current.as_secs_f64() * randomization;
    let low = (current.as_secs_f64() - delta).max(0.0);
    let high = current.as_secs_f64() + delta;
    (Duration::from_secs_f64(low), Duration::from_secs_f64(high))
}
