use std::time::Duration;

/// Fires once every `interval` of accumulated elapsed time.
///
/// Driven by frame deltas rather than wall clock, so it pauses with the loop
/// and is deterministic under test.
#[derive(Debug, Clone)]
pub struct Cadence {
    interval: Duration,
    elapsed: Duration,
}

impl Cadence {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            elapsed: Duration::ZERO,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Adds `dt` and reports whether the interval was reached.
    ///
    /// At most one firing per call; the remainder carries over.
    pub fn tick(&mut self, dt: Duration) -> bool {
        self.elapsed = self.elapsed.saturating_add(dt);
        if self.elapsed < self.interval {
            return false;
        }
        self.elapsed -= self.interval;
        // A long stall must not queue up a burst of firings.
        if self.elapsed >= self.interval {
            self.elapsed = Duration::ZERO;
        }
        true
    }

    pub fn reset(&mut self) {
        self.elapsed = Duration::ZERO;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_when_interval_accumulates() {
        let mut c = Cadence::new(Duration::from_secs(5));
        for _ in 0..4 {
            assert!(!c.tick(Duration::from_secs(1)));
        }
        assert!(c.tick(Duration::from_secs(1)));
        assert!(!c.tick(Duration::from_secs(1)));
    }

    #[test]
    fn remainder_carries_over() {
        let mut c = Cadence::new(Duration::from_millis(100));
        assert!(c.tick(Duration::from_millis(150)));
        assert!(c.tick(Duration::from_millis(50)));
    }

    #[test]
    fn stall_fires_once() {
        let mut c = Cadence::new(Duration::from_secs(1));
        assert!(c.tick(Duration::from_secs(10)));
        assert!(!c.tick(Duration::from_millis(10)));
    }

    #[test]
    fn zero_interval_fires_every_tick() {
        let mut c = Cadence::new(Duration::ZERO);
        assert!(c.tick(Duration::ZERO));
        assert!(c.tick(Duration::ZERO));
    }
}
