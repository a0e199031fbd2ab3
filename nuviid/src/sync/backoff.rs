use std::time::Duration;

use rand::Rng;

/// Exponential retry delays with an upper cap and optional jitter.
#[derive(Debug, Clone, Copy)]
pub struct RetryDelays {
    base: Duration,
    cap: Duration,
    jitter: bool,
}

impl RetryDelays {
    pub fn new(base: Duration, cap: Duration, jitter: bool) -> Self {
        Self { base, cap, jitter }
    }

    /// Delay before retry number `attempt` (zero-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with_rng(attempt, &mut rand::thread_rng())
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base_ms = self.base.as_millis().min(u128::from(u64::MAX)) as u64;
        let cap_ms = self.cap.as_millis().min(u128::from(u64::MAX)) as u64;
        let doubled = base_ms
            .saturating_mul(1u64 << attempt.min(20))
            .min(cap_ms);
        let delay_ms = if self.jitter {
            rng.gen_range(doubled / 2..=doubled.max(1))
        } else {
            doubled
        };
        Duration::from_millis(delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn doubles_until_the_cap() {
        let delays = RetryDelays::new(Duration::from_secs(1), Duration::from_secs(8), false);
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(delays.delay_with_rng(0, &mut rng), Duration::from_secs(1));
        assert_eq!(delays.delay_with_rng(1, &mut rng), Duration::from_secs(2));
        assert_eq!(delays.delay_with_rng(2, &mut rng), Duration::from_secs(4));
        assert_eq!(delays.delay_with_rng(3, &mut rng), Duration::from_secs(8));
        assert_eq!(delays.delay_with_rng(9, &mut rng), Duration::from_secs(8));
    }

    #[test]
    fn jitter_stays_within_half_to_full_window() {
        let delays = RetryDelays::new(Duration::from_millis(400), Duration::from_secs(8), true);
        let mut rng = StdRng::seed_from_u64(42);
        for attempt in 0..5 {
            let d = delays.delay_with_rng(attempt, &mut rng);
            let full = Duration::from_millis(400u64.saturating_mul(1 << attempt).min(8000));
            assert!(d <= full);
            assert!(d >= full / 2);
        }
    }
}
