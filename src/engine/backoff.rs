//! Idle backoff between empty polls.

use std::time::Duration;

/// Geometric backoff: `base`, `base * m`, `base * m^2`, … capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    multiplier: f64,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, multiplier: f64, max: Duration) -> Self {
        let base = base.min(max);
        Self {
            base,
            multiplier: if multiplier.is_finite() { multiplier.max(1.0) } else { 1.0 },
            max,
            current: base,
        }
    }

    /// Delay to sleep now. Advances the next delay.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let grown = self.current.as_secs_f64() * self.multiplier;
        self.current = if grown >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(grown)
        };
        delay
    }

    /// Back to `base` after a successful claim.
    pub fn reset(&mut self) {
        self.current = self.base;
    }

    /// Delay the next call to `next_delay` will return.
    pub fn peek(&self) -> Duration {
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_geometrically_until_capped() {
        let mut backoff = Backoff::new(Duration::from_secs(5), 1.5, Duration::from_secs(60));
        let delays: Vec<f64> = (0..9).map(|_| backoff.next_delay().as_secs_f64()).collect();

        assert_eq!(&delays[..4], &[5.0, 7.5, 11.25, 16.875]);
        for pair in delays.windows(2) {
            assert!(pair[1] >= pair[0]);
        }
        assert_eq!(delays[8], 60.0);
    }

    #[test]
    fn reset_returns_to_base() {
        let mut backoff = Backoff::new(Duration::from_secs(1), 2.0, Duration::from_secs(10));
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.peek(), Duration::from_secs(4));

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn shrinking_multiplier_is_clamped() {
        let mut backoff = Backoff::new(Duration::from_secs(2), 0.5, Duration::from_secs(10));
        backoff.next_delay();
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
    }
}
