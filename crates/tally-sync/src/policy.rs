use std::time::Duration;

use rand::Rng;

/// Tuning knobs for reconciliation, delivery and polling.
#[derive(Debug, Clone)]
pub struct SyncPolicy {
    /// Max distance between an echo and its server copy (exclusive).
    pub match_window: Duration,
    pub amount_tolerance: f64,
    pub text_send_timeout: Duration,
    pub split_send_timeout: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// Failed deliveries before an echo is marked failed and left alone.
    pub max_attempts: u32,
    /// Carry paid flags over when a provisional split id is replaced.
    pub migrate_settlements: bool,
    pub watch_interval: Duration,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            match_window: Duration::from_millis(120_000),
            amount_tolerance: 0.01,
            text_send_timeout: Duration::from_secs(8),
            split_send_timeout: Duration::from_secs(10),
            backoff_initial: Duration::from_secs(2),
            backoff_max: Duration::from_secs(300),
            max_attempts: 8,
            migrate_settlements: true,
            watch_interval: Duration::from_secs(20),
        }
    }
}

impl SyncPolicy {
    /// Delay before the next delivery attempt after `attempts` failures:
    /// exponential from `backoff_initial`, capped at `backoff_max`, plus up
    /// to half of that again as jitter.
    pub fn backoff_for(&self, attempts: u32) -> Duration {
        let factor = 1u32 << attempts.saturating_sub(1).min(16);
        let capped = self.backoff_initial.saturating_mul(factor).min(self.backoff_max);
        let capped_ms = capped.as_millis() as u64;
        let jitter = rand::rng().random_range(0..=capped_ms / 2);
        capped + Duration::from_millis(jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let policy = SyncPolicy {
            backoff_initial: Duration::from_millis(100),
            backoff_max: Duration::from_millis(1_000),
            ..SyncPolicy::default()
        };

        let first = policy.backoff_for(1);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(150));

        let third = policy.backoff_for(3);
        assert!(third >= Duration::from_millis(400) && third <= Duration::from_millis(600));

        for attempts in [5, 20, u32::MAX] {
            let d = policy.backoff_for(attempts);
            assert!(d >= Duration::from_millis(1_000) && d <= Duration::from_millis(1_500));
        }
    }

    #[test]
    fn zero_backoff_stays_zero() {
        let policy = SyncPolicy {
            backoff_initial: Duration::ZERO,
            ..SyncPolicy::default()
        };
        assert_eq!(policy.backoff_for(4), Duration::ZERO);
    }
}
