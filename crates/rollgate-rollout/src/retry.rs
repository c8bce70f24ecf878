//! Bounded retries for traffic weight writes.

use std::time::Duration;

use tracing::warn;

use rollgate_core::config::ControllerConfig;
use rollgate_traffic::{TrafficError, TrafficSplitter};

/// Exponential backoff: `base`, doubling per attempt, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub attempts: u32,
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn from_config(config: &ControllerConfig) -> Self {
        Self {
            attempts: config.traffic_write_attempts.max(1),
            base: config.traffic_backoff_base,
            max: config.traffic_backoff_max,
        }
    }

    /// Delay after the `attempt`-th failure (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base.saturating_mul(factor).min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            attempts: 5,
            base: Duration::from_millis(200),
            max: Duration::from_secs(5),
        }
    }
}

/// Apply a weight, retrying transient failures.
///
/// Returns the last error once the attempts are exhausted. An invalid
/// weight is returned immediately.
pub async fn set_weight_with_retry(
    splitter: &dyn TrafficSplitter,
    weight: u8,
    backoff: &Backoff,
) -> Result<(), TrafficError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match splitter.set_weight(weight).await {
            Ok(()) => return Ok(()),
            Err(e @ TrafficError::InvalidWeight(_)) => return Err(e),
            Err(e) if attempt >= backoff.attempts => return Err(e),
            Err(e) => {
                let delay = backoff.delay(attempt);
                warn!(
                    weight,
                    attempt,
                    max_attempts = backoff.attempts,
                    error = %e,
                    retry_in = ?delay,
                    "traffic write failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};

    use async_trait::async_trait;
    use tokio::time::Instant;

    use super::*;

    /// Fails the first `failures` writes.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
        weight: AtomicU8,
    }

    #[async_trait]
    impl TrafficSplitter for Flaky {
        async fn set_weight(&self, canary_percent: u8) -> Result<(), TrafficError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.failures {
                return Err(TrafficError::Backend("mesh unavailable".to_string()));
            }
            self.weight.store(canary_percent, Ordering::SeqCst);
            Ok(())
        }

        fn current_weight(&self) -> u8 {
            self.weight.load(Ordering::SeqCst)
        }
    }

    fn flaky(failures: u32) -> Flaky {
        Flaky {
            failures,
            calls: AtomicU32::new(0),
            weight: AtomicU8::new(0),
        }
    }

    #[test]
    fn delays_double_and_cap() {
        let b = Backoff::default();
        assert_eq!(b.delay(1), Duration::from_millis(200));
        assert_eq!(b.delay(2), Duration::from_millis(400));
        assert_eq!(b.delay(4), Duration::from_millis(1600));
        assert_eq!(b.delay(6), Duration::from_secs(5));
        assert_eq!(b.delay(40), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_within_budget() {
        let splitter = flaky(2);
        let started = Instant::now();
        set_weight_with_retry(&splitter, 25, &Backoff::default()).await.unwrap();

        assert_eq!(splitter.current_weight(), 25);
        assert_eq!(splitter.calls.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_millis(600));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_attempts() {
        let splitter = flaky(u32::MAX);
        let err = set_weight_with_retry(&splitter, 25, &Backoff::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TrafficError::Backend(_)));
        assert_eq!(splitter.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_weight_is_not_retried() {
        struct Rejecting;

        #[async_trait]
        impl TrafficSplitter for Rejecting {
            async fn set_weight(&self, w: u8) -> Result<(), TrafficError> {
                Err(TrafficError::InvalidWeight(w))
            }
            fn current_weight(&self) -> u8 {
                0
            }
        }

        let started = Instant::now();
        let err = set_weight_with_retry(&Rejecting, 150, &Backoff::default())
            .await
            .unwrap_err();
        assert_eq!(err, TrafficError::InvalidWeight(150));
        assert_eq!(started.elapsed(), Duration::ZERO);
    }
}
