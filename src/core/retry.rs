use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Bounded exponential backoff for a single fallible RPC operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            max_jitter: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, max_delay: Duration) -> Self {
        Self {
            attempts,
            max_delay,
            ..Default::default()
        }
    }

    /// Sleep before attempt `attempt + 1` (zero-based `attempt`).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self
            .initial_delay
            .saturating_mul(2u32.saturating_pow(attempt.min(31)));
        let jitter_ms = self.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
        };
        base.saturating_add(jitter).min(self.max_delay)
    }

    pub async fn retry<T, E, F, Fut>(&self, op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.retry_notify(op, |_, _| {}).await
    }

    /// Runs `op` until it succeeds or attempts run out, handing every failed
    /// attempt (1-based) to `notify`. Returns the last error on exhaustion.
    pub async fn retry_notify<T, E, F, Fut, N>(&self, mut op: F, mut notify: N) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        N: FnMut(u32, &E),
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    attempt += 1;
                    notify(attempt, &e);
                    if attempt >= attempts {
                        return Err(e);
                    }
                    tokio::time::sleep(self.delay_for(attempt - 1)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy::default();
        for attempt in 0..40 {
            assert!(policy.delay_for(attempt) <= Duration::from_secs(5));
        }
        assert_eq!(policy.delay_for(30), Duration::from_secs(5));
    }

    #[test]
    fn test_delay_grows_exponentially() {
        let policy = RetryPolicy {
            max_jitter: Duration::ZERO,
            ..Default::default()
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(6), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_last_attempt() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let result: Result<u32, &str> = RetryPolicy::default()
            .retry(|| async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 10 {
                    Err("boom")
                } else {
                    Ok(n)
                }
            })
            .await;
        assert_eq!(result, Ok(10));
        assert_eq!(calls.load(Ordering::SeqCst), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_last_error_without_trailing_sleep() {
        let policy = RetryPolicy {
            attempts: 3,
            max_jitter: Duration::ZERO,
            ..Default::default()
        };
        let mut notified = Vec::new();
        let started = Instant::now();
        let result: Result<(), String> = policy
            .retry_notify(
                || async { Err("down".to_string()) },
                |attempt, _| notified.push(attempt),
            )
            .await;

        assert_eq!(result, Err("down".to_string()));
        assert_eq!(notified, vec![1, 2, 3]);
        // 100ms + 200ms between the three attempts, nothing after the last.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_millis(400));
    }
}
