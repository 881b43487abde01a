//! Exponential backoff with jitter, used to pace reconnection attempts.

use std::time::Duration;

use rand::Rng;

/// Each call to [`Backoff::next`] returns the current delay plus up to 25%
/// jitter, then advances the delay by the multiplier up to the cap. Every
/// reconnection task owns its own instance.
#[derive(Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial,
            max,
            multiplier,
            current: initial,
        }
    }

    /// Return the next delay and advance the sequence.
    pub fn next(&mut self) -> Duration {
        let jitter = self.current.mul_f64(0.25 * rand::thread_rng().gen::<f64>());
        let delay = self.current + jitter;

        self.current = self.current.mul_f64(self.multiplier);
        if self.current > self.max {
            self.current = self.max;
        }

        delay
    }

    /// Restart the sequence from the initial delay.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }

    /// The delay the next call to [`Backoff::next`] will be based on.
    pub fn current(&self) -> Duration {
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floor_is_nondecreasing_up_to_max() {
        let mut backoff = Backoff::new(
            Duration::from_millis(100),
            Duration::from_secs(10),
            2.0,
        );

        let mut previous = Duration::ZERO;
        for _ in 0..12 {
            let floor = backoff.current();
            assert!(floor >= previous);
            assert!(floor <= Duration::from_secs(10));
            previous = floor;
            backoff.next();
        }
        assert_eq!(backoff.current(), Duration::from_secs(10));
    }

    #[test]
    fn next_includes_bounded_jitter() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30), 2.0);
        for _ in 0..50 {
            let floor = backoff.current();
            let delay = backoff.next();
            assert!(delay >= floor);
            assert!(delay <= floor.mul_f64(1.25));
        }
    }

    #[test]
    fn reset_restores_initial() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30), 2.0);
        backoff.next();
        backoff.next();
        assert!(backoff.current() > Duration::from_secs(1));
        backoff.reset();
        assert_eq!(backoff.current(), Duration::from_secs(1));
    }

    #[test]
    fn caps_at_max() {
        let mut backoff = Backoff::new(Duration::from_secs(4), Duration::from_secs(5), 3.0);
        backoff.next();
        assert_eq!(backoff.current(), Duration::from_secs(5));
        backoff.next();
        assert_eq!(backoff.current(), Duration::from_secs(5));
    }
}
