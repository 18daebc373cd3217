//! Exponential backoff with full jitter for the one flaky call we retry.
use std::future::Future;
use std::time::Duration;

use log::warn;
use rand::Rng;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total tries, the first one included.
    pub max_attempts: usize,
    /// Growth factor between tries.
    pub base: u32,
    /// Delay unit; the wait before retry `n` is at most `unit * base^(n-1)`.
    pub unit: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base: 4,
            unit: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, base: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base: base.max(1),
            ..Self::default()
        }
    }

    /// Upper bound of the wait before retry `retry` (1-based).
    pub fn ceiling(&self, retry: usize) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let exp = u32::try_from(retry - 1).unwrap_or(u32::MAX);
        let factor = self.base.saturating_pow(exp);
        self.unit.saturating_mul(factor).min(self.max_delay)
    }

    /// Full jitter: uniform in `0..=ceiling`.
    pub fn delay(&self, retry: usize) -> Duration {
        let ceiling = self.ceiling(retry).as_millis() as u64;
        if ceiling == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling))
    }
}

/// Run `op` until it succeeds or the policy runs out of attempts.
pub async fn retry_with_backoff<T, F, Fut>(policy: RetryPolicy, what: &str, mut op: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < policy.max_attempts => {
                let wait = policy.delay(attempt);
                warn!(
                    "{} failed (attempt {}/{}): {:#}. Retrying in {:?}",
                    what, attempt, policy.max_attempts, e, wait
                );
                tokio::time::sleep(wait).await;
            }
            Err(e) => return Err(e.context(format!("{what} failed after {attempt} attempt(s)"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn instant(max_attempts: usize) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base: 4,
            unit: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    #[test]
    fn test_ceiling_grows_exponentially() {
        let policy = RetryPolicy::new(5, 4);
        assert_eq!(policy.ceiling(0), Duration::ZERO);
        assert_eq!(policy.ceiling(1), Duration::from_secs(1));
        assert_eq!(policy.ceiling(2), Duration::from_secs(4));
        assert_eq!(policy.ceiling(3), Duration::from_secs(16));
        assert_eq!(policy.ceiling(10), Duration::from_secs(60));
    }

    #[test]
    fn test_delay_within_ceiling() {
        let policy = RetryPolicy::new(5, 2);
        for retry in 1..6 {
            assert!(policy.delay(retry) <= policy.ceiling(retry));
        }
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let calls = Cell::new(0);
        let result = retry_with_backoff(instant(3), "op", || {
            calls.set(calls.get() + 1);
            let n = calls.get();
            async move {
                if n < 3 {
                    anyhow::bail!("flaky")
                }
                Ok(n)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = Cell::new(0);
        let result: anyhow::Result<()> = retry_with_backoff(instant(2), "op", || {
            calls.set(calls.get() + 1);
            async { anyhow::bail!("down") }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.get(), 2);
        assert!(format!("{:#}", result.unwrap_err()).contains("after 2 attempt(s)"));
    }
}
