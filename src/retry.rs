//! Bounded retry combinator for network-facing operations.
//!
//! Health polls and embed-batch calls both need "try N times with a
//! delay" semantics; this module centralizes that loop so call sites
//! declare a policy instead of hand-rolling timers and counters.

use anyhow::Result;
use std::future::Future;
use std::time::Duration;

/// How long to wait between attempts.
#[derive(Debug, Clone, Copy)]
pub enum Backoff {
    /// Same delay before every retry (health polling).
    Fixed(Duration),
    /// Doubling delay starting from the base, capped at `base << 5`
    /// (embed calls, matching the 1s, 2s, 4s, ... ladder).
    Exponential(Duration),
}

/// A bounded retry policy: total attempt count plus backoff shape.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn fixed(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts,
            backoff: Backoff::Fixed(delay),
        }
    }

    pub fn exponential(attempts: u32, base: Duration) -> Self {
        Self {
            attempts,
            backoff: Backoff::Exponential(base),
        }
    }

    fn delay_before(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed(d) => d,
            Backoff::Exponential(base) => base * (1u32 << (attempt - 1).min(5)),
        }
    }

    /// Run `op` until it succeeds or the attempt budget is exhausted.
    ///
    /// The closure receives the 0-based attempt number. The final error
    /// is returned verbatim once attempts run out.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut last_err = None;

        for attempt in 0..self.attempts {
            if attempt > 0 {
                tokio::time::sleep(self.delay_before(attempt)).await;
            }

            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => last_err = Some(e),
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("retry budget was zero attempts")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_succeeds_first_try() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::fixed(3, Duration::from_millis(1));
        let result: Result<u32> = policy
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(7) }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::fixed(5, Duration::from_millis(1));
        let result: Result<&str> = policy
            .run(|attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        anyhow::bail!("not yet")
                    }
                    Ok("done")
                }
            })
            .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausts_attempts() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::fixed(3, Duration::from_millis(1));
        let result: Result<()> = policy
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { anyhow::bail!("still broken") }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(result.unwrap_err().to_string().contains("still broken"));
    }

    #[test]
    fn test_exponential_delay_caps() {
        let policy = RetryPolicy::exponential(10, Duration::from_secs(1));
        assert_eq!(policy.delay_before(1), Duration::from_secs(1));
        assert_eq!(policy.delay_before(2), Duration::from_secs(2));
        assert_eq!(policy.delay_before(4), Duration::from_secs(8));
        // Capped at base << 5.
        assert_eq!(policy.delay_before(9), Duration::from_secs(32));
    }
}
