//! Jitter strategies to spread retry delays and avoid thundering herds.

use rand::Rng;
use std::time::Duration;

/// Randomization applied to a computed backoff delay.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// Use the exact delay. Deterministic tests want this.
    None,
    /// Symmetric jitter: uniform in `[delay * (1 - fraction), delay * (1 + fraction)]`.
    Symmetric {
        /// Spread on each side of the delay, e.g. 0.25 for ±25%.
        fraction: f64,
    },
}

impl Jitter {
    /// The default ±25% symmetric spread.
    pub fn symmetric() -> Self {
        Jitter::Symmetric { fraction: 0.25 }
    }

    /// Apply jitter to a delay.
    pub fn apply(&self, delay: Duration) -> Duration {
        self.apply_with_rng(delay, &mut rand::rng())
    }

    /// Apply jitter with a caller-supplied RNG, for deterministic tests.
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        match self {
            Jitter::None => delay,
            Jitter::Symmetric { fraction } => {
                let millis = delay.as_millis() as u64;
                if millis == 0 {
                    return Duration::ZERO;
                }
                let fraction = fraction.clamp(0.0, 1.0);
                let spread = (millis as f64 * fraction) as u64;
                let low = millis.saturating_sub(spread);
                let high = millis.saturating_add(spread);
                Duration::from_millis(rng.random_range(low..=high))
            }
        }
    }
}
